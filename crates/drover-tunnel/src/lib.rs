//! # drover-tunnel
//!
//! The persistent bidirectional connection between this node and the
//! central authority. Heartbeat/status traffic goes out, dispatch
//! commands come in. On unexpected close the tunnel reconnects with
//! exponential backoff (capped), and outbound traffic is queued in a
//! small oldest-drop buffer while disconnected — an extended outage
//! degrades the fleet to stale state instead of crashing it or growing
//! memory without bound.

mod protocol;
mod transport;

pub use protocol::TunnelMessage;
pub use transport::{OutboundBuffer, Tunnel, TunnelHandle, TunnelSettings, backoff_delay};
