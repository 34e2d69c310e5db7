use crate::commands::{CommandError, CommandPath};
use crate::model::{DeviceErrorEvent, DeviceErrors};
use crate::stats::ProcessorStats;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Errors older than this are forgotten by [`ErrorWindowStore::sweep`].
pub const ERROR_WINDOW_SECS: i64 = 60;
/// An emergency stop is requested once a device has more than this many errors in the window.
pub const ERROR_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerPolicy {
    /// Every error while the window count is above the threshold requests a stop.
    #[default]
    EveryErrorAboveThreshold,
    /// Only the error that crosses the threshold requests a stop; re-armed once a sweep brings
    /// the count back down.
    OncePerCrossing,
}

impl FromStr for TriggerPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "repeat" | "every" => Ok(TriggerPolicy::EveryErrorAboveThreshold),
            "once" => Ok(TriggerPolicy::OncePerCrossing),
            other => Err(format!("unknown trigger policy {other:?} (expected repeat|once)")),
        }
    }
}

#[derive(Debug, Default)]
struct ErrorWindow {
    timestamps: VecDeque<DateTime<Utc>>,
    tripped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    pub count: usize,
    pub trip: bool,
}

/// Per-device error timestamps. Lock order is map, then device window; neither lock is held
/// across an await.
#[derive(Debug, Clone, Default)]
pub struct ErrorWindowStore {
    devices: Arc<Mutex<HashMap<u32, Arc<Mutex<ErrorWindow>>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ErrorWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, device_id: u32, at: DateTime<Utc>, policy: TriggerPolicy) -> Recorded {
        let mut devices = lock(&self.devices);
        let window = devices.entry(device_id).or_default();
        let mut window = lock(window);

        window.timestamps.push_back(at);
        let count = window.timestamps.len();
        let above = count > ERROR_THRESHOLD;
        let trip = match policy {
            TriggerPolicy::EveryErrorAboveThreshold => above,
            TriggerPolicy::OncePerCrossing => above && !window.tripped,
        };
        if above {
            window.tripped = true;
        }
        Recorded { count, trip }
    }

    /// Drops timestamps older than the window and forgets devices left with none. Returns the
    /// number of devices still tracked.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::seconds(ERROR_WINDOW_SECS);
        let mut devices = lock(&self.devices);
        devices.retain(|_, window| {
            let mut window = lock(window);
            while window.timestamps.front().is_some_and(|ts| *ts < cutoff) {
                window.timestamps.pop_front();
            }
            if window.timestamps.len() <= ERROR_THRESHOLD {
                window.tripped = false;
            }
            !window.timestamps.is_empty()
        });
        devices.len()
    }

    #[cfg(test)]
    pub fn count(&self, device_id: u32) -> usize {
        let devices = lock(&self.devices);
        devices
            .get(&device_id)
            .map(|window| lock(window).timestamps.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn active_devices(&self) -> usize {
        lock(&self.devices).len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorOutcome {
    pub count: usize,
    pub emergency_stop: bool,
}

/// Error-flood policy: counts errors per device and stops a device that keeps failing.
pub struct AnomalyDetector {
    store: ErrorWindowStore,
    commands: CommandPath,
    policy: TriggerPolicy,
    stats: Arc<ProcessorStats>,
}

impl AnomalyDetector {
    pub fn new(
        store: ErrorWindowStore,
        commands: CommandPath,
        policy: TriggerPolicy,
        stats: Arc<ProcessorStats>,
    ) -> Self {
        Self {
            store,
            commands,
            policy,
            stats,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &ErrorWindowStore {
        &self.store
    }

    /// Records one error report. Empty flag sets are ignored. The error event is pushed to the
    /// device for every report; a stop is requested per the trigger policy. When both calls fail
    /// the stop failure is returned.
    pub async fn on_error(
        &self,
        device_id: u32,
        flags: DeviceErrors,
        now: DateTime<Utc>,
    ) -> Result<Option<ErrorOutcome>, CommandError> {
        if flags.is_empty() {
            return Ok(None);
        }

        let recorded = self.store.record(device_id, now, self.policy);
        tracing::info!(
            device_id,
            count = recorded.count,
            flags = %flags,
            "device error count in last minute"
        );

        let stop_result = if recorded.trip {
            tracing::error!(device_id, count = recorded.count, "error flood; requesting emergency stop");
            self.stats.record_emergency_stop();
            self.commands.trigger_emergency_stop(device_id).await
        } else {
            Ok(())
        };

        let event = DeviceErrorEvent::new(device_id, flags, now);
        let publish_result = self.commands.publish_error_event(&event).await;

        stop_result?;
        publish_result?;
        Ok(Some(ErrorOutcome {
            count: recorded.count,
            emergency_stop: recorded.trip,
        }))
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let active = self.store.sweep(now);
        self.stats.set_active_devices(active);
        tracing::info!(active_devices = active, "error window cleanup done");
        active
    }
}
