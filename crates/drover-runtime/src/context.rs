use std::sync::Arc;
use std::time::Duration;

use drover_config::DroverConfig;
use drover_core::EventBus;
use drover_device::DeviceControl;
use drover_fault::CircuitBreaker;
use drover_guard::DeviceGuards;
use drover_queue::TaskQueue;
use drover_sched::ActivityScheduler;
use drover_state::DeviceStore;

/// Circuit-breaker dependency name for the device-control daemon.
pub const DEP_DAEMON: &str = "device-daemon";
/// Circuit-breaker dependency name for the central task queue.
pub const DEP_QUEUE: &str = "task-queue";

/// The composition root: every shared component of the node, explicitly
/// constructed and passed by reference. No hidden globals — multiple
/// independent fleets (or tests) can run in one process.
pub struct FleetContext {
    pub config: DroverConfig,
    pub store: Arc<DeviceStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub guards: Arc<DeviceGuards>,
    pub schedule: Arc<ActivityScheduler>,
    pub daemon: Arc<dyn DeviceControl>,
    pub queue: Arc<dyn TaskQueue>,
    pub events: EventBus,
}

impl FleetContext {
    pub fn new(
        config: DroverConfig,
        daemon: Arc<dyn DeviceControl>,
        queue: Arc<dyn TaskQueue>,
    ) -> Arc<Self> {
        let breaker = CircuitBreaker::new(
            config.breaker.failure_threshold,
            config.breaker.open_duration(),
        );
        let schedule = ActivityScheduler::new(
            config.schedule.peak_hours.clone(),
            config.schedule.quiet_start_hour,
            config.schedule.quiet_end_hour,
            Duration::from_millis(config.schedule.normal_sleep_min_ms),
            Duration::from_millis(config.schedule.normal_sleep_max_ms),
        );

        Arc::new(Self {
            config,
            store: Arc::new(DeviceStore::new()),
            breaker: Arc::new(breaker),
            guards: Arc::new(DeviceGuards::new()),
            schedule: Arc::new(schedule),
            daemon,
            queue,
            events: EventBus::default(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }
}
