use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug)]
pub struct ProcessorStats {
    pub routed_telemetry: AtomicU64,
    pub routed_errors: AtomicU64,
    pub dropped: AtomicU64,
    pub emergency_stops: AtomicU64,
    pub rate_decreases: AtomicU64,
    pub active_devices: AtomicU64,
    pub mqtt_connected: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub routed_telemetry: u64,
    pub routed_errors: u64,
    pub dropped: u64,
    pub emergency_stops: u64,
    pub rate_decreases: u64,
    pub active_devices: u64,
    pub mqtt_connected: bool,
}

impl ProcessorStats {
    pub fn new() -> Self {
        Self {
            routed_telemetry: AtomicU64::new(0),
            routed_errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            emergency_stops: AtomicU64::new(0),
            rate_decreases: AtomicU64::new(0),
            active_devices: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_routed_telemetry(&self) {
        self.routed_telemetry.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routed_error(&self) {
        self.routed_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emergency_stop(&self) {
        self.emergency_stops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_decrease(&self) {
        self.rate_decreases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_devices(&self, active: usize) {
        self.active_devices.store(active as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            routed_telemetry: self.routed_telemetry.load(Ordering::Relaxed),
            routed_errors: self.routed_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            emergency_stops: self.emergency_stops.load(Ordering::Relaxed),
            rate_decreases: self.rate_decreases.load(Ordering::Relaxed),
            active_devices: self.active_devices.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
        }
    }
}

impl Default for ProcessorStats {
    fn default() -> Self {
        Self::new()
    }
}
