use crate::sync_loop::LoopState;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

/// Counters shared between the sync loop, the MQTT session and the status endpoint.
#[derive(Debug)]
pub struct AgentStats {
    pub loop_state: AtomicU8,
    pub cycles: AtomicU64,
    pub telemetry_published: AtomicU64,
    pub shadow_patches: AtomicU64,
    pub failed_cycles: AtomicU64,
    pub last_cycle_unix_ms: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentStatus {
    pub device_id: u32,
    pub loop_state: LoopState,
    pub cycles: u64,
    pub telemetry_published: u64,
    pub shadow_patches: u64,
    pub failed_cycles: u64,
    pub last_cycle_unix_ms: Option<u64>,
    pub mqtt_connected: bool,
    pub last_error: Option<String>,
}

impl AgentStats {
    pub fn new() -> Self {
        Self {
            loop_state: AtomicU8::new(LoopState::Idle as u8),
            cycles: AtomicU64::new(0),
            telemetry_published: AtomicU64::new(0),
            shadow_patches: AtomicU64::new(0),
            failed_cycles: AtomicU64::new(0),
            last_cycle_unix_ms: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_loop_state(&self, state: LoopState) {
        self.loop_state.store(state as u8, Ordering::Relaxed);
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        self.last_cycle_unix_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn record_telemetry(&self) {
        self.telemetry_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shadow_patch(&self) {
        self.shadow_patches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, err: impl Into<String>) {
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self, device_id: u32) -> AgentStatus {
        let last_cycle = self.last_cycle_unix_ms.load(Ordering::Relaxed);
        AgentStatus {
            device_id,
            loop_state: LoopState::from_u8(self.loop_state.load(Ordering::Relaxed)),
            cycles: self.cycles.load(Ordering::Relaxed),
            telemetry_published: self.telemetry_published.load(Ordering::Relaxed),
            shadow_patches: self.shadow_patches.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            last_cycle_unix_ms: (last_cycle > 0).then_some(last_cycle),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

impl Default for AgentStats {
    fn default() -> Self {
        Self::new()
    }
}
