use futures_util::{Sink, SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use drover_core::{Event, EventBus};

use crate::protocol::TunnelMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnect backoff: doubles from 500ms, capped at `max`.
pub fn backoff_delay(attempt: u32, max: Duration) -> Duration {
    let base = Duration::from_millis(500);
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    exp.min(max)
}

/// Bounded outbound queue with oldest-drop overflow.
pub struct OutboundBuffer {
    queue: VecDeque<TunnelMessage>,
    cap: usize,
    dropped: u64,
}

impl OutboundBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(cap),
            cap,
            dropped: 0,
        }
    }

    /// Enqueue, evicting the oldest message when full.
    pub fn push(&mut self, msg: TunnelMessage) {
        if self.queue.len() >= self.cap {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_back(msg);
    }

    pub fn pop(&mut self) -> Option<TunnelMessage> {
        self.queue.pop_front()
    }

    /// Put a message back at the front after a failed send, so the
    /// drain order survives a mid-flush disconnect.
    pub fn requeue(&mut self, msg: TunnelMessage) {
        if self.queue.len() >= self.cap {
            self.queue.pop_back();
            self.dropped += 1;
        }
        self.queue.push_front(msg);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Tunnel configuration, lifted from the node config.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub url: String,
    pub reconnect_max_delay: Duration,
    pub outbound_buffer: usize,
}

/// Handle for pushing messages up the tunnel from anywhere in the node.
#[derive(Clone)]
pub struct TunnelHandle {
    tx: mpsc::Sender<TunnelMessage>,
}

impl TunnelHandle {
    /// Queue a message for the central authority. Never errors: while
    /// disconnected the tunnel buffers (bounded, oldest-drop), and a
    /// full channel just drops the oldest-style overflow on the floor.
    pub async fn send(&self, msg: TunnelMessage) {
        if self.tx.send(msg).await.is_err() {
            warn!("tunnel task is gone, message dropped");
        }
    }
}

/// The long-lived tunnel client.
pub struct Tunnel {
    settings: TunnelSettings,
    node_id: String,
    events: EventBus,
}

impl Tunnel {
    pub fn new(settings: TunnelSettings, node_id: String, events: EventBus) -> Self {
        Self {
            settings,
            node_id,
            events,
        }
    }

    /// Spawn the connect/reconnect loop. Returns a handle for outbound
    /// messages and a receiver for inbound dispatches.
    pub fn start(self) -> (TunnelHandle, mpsc::Receiver<TunnelMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);

        tokio::spawn(self.run(outbound_rx, inbound_tx));

        (TunnelHandle { tx: outbound_tx }, inbound_rx)
    }

    async fn run(
        self,
        mut outbound_rx: mpsc::Receiver<TunnelMessage>,
        inbound_tx: mpsc::Sender<TunnelMessage>,
    ) {
        let mut buffer = OutboundBuffer::new(self.settings.outbound_buffer);
        let mut attempt: u32 = 0;

        info!(url = %self.settings.url, "tunnel starting");

        loop {
            match connect_async(self.settings.url.as_str()).await {
                Ok((ws, _)) => {
                    info!(url = %self.settings.url, "tunnel connected");
                    attempt = 0;
                    self.events.publish(Event::TunnelConnected);

                    let reason = self
                        .drive(ws, &mut outbound_rx, &mut buffer, &inbound_tx)
                        .await;

                    warn!(reason = %reason, "tunnel disconnected");
                    self.events
                        .publish(Event::TunnelDisconnected { reason });
                }
                Err(e) => {
                    warn!(error = %e, attempt, "tunnel connect failed");
                }
            }

            if inbound_tx.is_closed() {
                info!("tunnel consumer gone, stopping");
                return;
            }

            let delay = backoff_delay(attempt, self.settings.reconnect_max_delay);
            attempt = attempt.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, "tunnel reconnecting");

            // Keep absorbing outbound traffic into the bounded buffer
            // while we wait — heartbeats don't stop during an outage.
            let deadline = tokio::time::sleep(delay);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    msg = outbound_rx.recv() => match msg {
                        Some(msg) => buffer.push(msg),
                        None => {
                            info!("tunnel handle dropped, stopping");
                            return;
                        }
                    },
                }
            }
        }
    }

    /// Pump one live connection until it fails. Returns the close reason.
    async fn drive(
        &self,
        ws: WsStream,
        outbound_rx: &mut mpsc::Receiver<TunnelMessage>,
        buffer: &mut OutboundBuffer,
        inbound_tx: &mpsc::Sender<TunnelMessage>,
    ) -> String {
        let (mut sink, mut stream) = ws.split();

        let identify = TunnelMessage::Identify {
            node_id: self.node_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        if let Err(e) = send_message(&mut sink, &identify).await {
            return format!("identify failed: {e}");
        }

        // Flush what queued up while we were away.
        let backlog = buffer.len();
        while let Some(msg) = buffer.pop() {
            if let Err(e) = send_message(&mut sink, &msg).await {
                buffer.requeue(msg);
                return format!("backlog flush failed: {e}");
            }
        }
        if backlog > 0 {
            info!(backlog, dropped = buffer.dropped(), "flushed buffered tunnel traffic");
        }

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<TunnelMessage>(text.as_str()) {
                            Ok(msg) => {
                                if let Some(reason) =
                                    self.handle_inbound(msg, &mut sink, inbound_tx).await
                                {
                                    return reason;
                                }
                            }
                            Err(e) => warn!(error = %e, "unparseable tunnel message"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return "pong failed".into();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return format!("closed by server: {frame:?}");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return format!("stream error: {e}"),
                    None => return "stream ended".into(),
                },
                outgoing = outbound_rx.recv() => match outgoing {
                    Some(msg) => {
                        if let Err(e) = send_message(&mut sink, &msg).await {
                            buffer.requeue(msg);
                            return format!("send failed: {e}");
                        }
                    }
                    None => return "handle dropped".into(),
                },
            }
        }
    }

    /// React to one server message. Returns a close reason to end this
    /// connection, or None to keep pumping.
    async fn handle_inbound(
        &self,
        msg: TunnelMessage,
        sink: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
        inbound_tx: &mpsc::Sender<TunnelMessage>,
    ) -> Option<String> {
        let now = chrono::Utc::now().timestamp_millis();
        match msg {
            TunnelMessage::IdentifyAck { server, .. } => {
                info!(server = %server, "tunnel identified");
                None
            }
            TunnelMessage::Heartbeat { .. } => {
                let ack = TunnelMessage::HeartbeatAck { timestamp: now };
                if send_message(sink, &ack).await.is_err() {
                    return Some("heartbeat ack failed".into());
                }
                None
            }
            dispatch @ TunnelMessage::Dispatch { .. } => {
                let forwarded = inbound_tx.send(dispatch).await.is_ok();
                let ack = TunnelMessage::DispatchAck {
                    success: forwarded,
                    error: (!forwarded).then(|| "node dispatch queue closed".to_string()),
                    timestamp: now,
                };
                let _ = send_message(sink, &ack).await;
                None
            }
            TunnelMessage::ServerShutdown => Some("server shutdown".into()),
            other => {
                debug!(message = ?other, "ignoring tunnel message");
                None
            }
        }
    }
}

async fn send_message(
    sink: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    msg: &TunnelMessage,
) -> drover_core::Result<()> {
    let payload = serde_json::to_string(msg)?;
    sink.send(Message::text(payload))
        .await
        .map_err(|e| drover_core::DroverError::Tunnel(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let max = Duration::from_secs(5);
        assert_eq!(backoff_delay(0, max), Duration::from_millis(500));
        assert_eq!(backoff_delay(1, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(4, max), Duration::from_secs(5));
        assert_eq!(backoff_delay(30, max), Duration::from_secs(5));
    }

    #[test]
    fn buffer_drops_oldest_on_overflow() {
        let mut buffer = OutboundBuffer::new(2);
        buffer.push(TunnelMessage::Heartbeat { timestamp: 1 });
        buffer.push(TunnelMessage::Heartbeat { timestamp: 2 });
        buffer.push(TunnelMessage::Heartbeat { timestamp: 3 });

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped(), 1);
        match buffer.pop().unwrap() {
            TunnelMessage::Heartbeat { timestamp } => assert_eq!(timestamp, 2),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn requeue_restores_drain_order() {
        let mut buffer = OutboundBuffer::new(8);
        buffer.push(TunnelMessage::Heartbeat { timestamp: 1 });
        buffer.push(TunnelMessage::Heartbeat { timestamp: 2 });

        let popped = buffer.pop().unwrap();
        buffer.requeue(popped);

        match buffer.pop().unwrap() {
            TunnelMessage::Heartbeat { timestamp } => assert_eq!(timestamp, 1),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn buffer_drains_in_order() {
        let mut buffer = OutboundBuffer::new(8);
        for i in 0..3 {
            buffer.push(TunnelMessage::Heartbeat { timestamp: i });
        }
        let mut seen = Vec::new();
        while let Some(TunnelMessage::Heartbeat { timestamp }) = buffer.pop() {
            seen.push(timestamp);
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(buffer.is_empty());
    }
}
