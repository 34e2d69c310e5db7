use crate::bridge::CloudBridge;
use crate::cloud::CloudError;
use crate::device::Reading;
use crate::stats::AgentStats;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Polling = 1,
    Publishing = 2,
    Sleeping = 3,
    Backoff = 4,
    Stopped = 5,
}

impl LoopState {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Polling,
            2 => Self::Publishing,
            3 => Self::Sleeping,
            4 => Self::Backoff,
            5 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Drives the poll -> publish -> shadow sync -> sleep cycle for one device.
pub struct SyncLoop {
    bridge: Arc<CloudBridge>,
    interval: Duration,
    stats: Arc<AgentStats>,
}

impl SyncLoop {
    pub fn new(bridge: Arc<CloudBridge>, interval: Duration, stats: Arc<AgentStats>) -> Self {
        Self {
            bridge,
            interval,
            stats,
        }
    }

    /// Runs until `cancel` fires and returns the terminal state.
    pub async fn run(&self, cancel: CancellationToken) -> LoopState {
        let mut state = LoopState::Idle;
        tracing::info!(
            device_id = self.bridge.device_id(),
            interval_ms = self.interval.as_millis() as u64,
            "sync loop started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.transition(&mut state, LoopState::Polling);

            let pause = match self.cycle(&mut state).await {
                Ok(()) => {
                    self.stats.clear_error();
                    self.transition(&mut state, LoopState::Sleeping);
                    self.interval
                }
                Err(err) => {
                    tracing::warn!(
                        device_id = self.bridge.device_id(),
                        error = %err,
                        backoff_secs = BACKOFF.as_secs(),
                        "sync cycle failed; backing off"
                    );
                    self.stats.record_failure(err.to_string());
                    self.transition(&mut state, LoopState::Backoff);
                    BACKOFF
                }
            };
            self.stats.record_cycle();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.transition(&mut state, LoopState::Stopped);
        tracing::info!(device_id = self.bridge.device_id(), "sync loop stopped");
        state
    }

    async fn cycle(&self, state: &mut LoopState) -> Result<(), CloudError> {
        let device_id = self.bridge.device_id();
        let telemetry = self.bridge.reader().read_telemetry(device_id).await;
        let device_state = self.bridge.reader().read_state(device_id).await;

        self.transition(state, LoopState::Publishing);
        if let Reading::Available(sample) = telemetry {
            self.bridge.publish_telemetry(&sample).await?;
            self.stats.record_telemetry();
        }
        if let Reading::Available(device_state) = device_state {
            if self.bridge.sync_shadow(&device_state).await? {
                self.stats.record_shadow_patch();
            }
        }
        Ok(())
    }

    fn transition(&self, current: &mut LoopState, next: LoopState) {
        tracing::debug!(from = ?*current, to = ?next, "sync loop transition");
        *current = next;
        self.stats.set_loop_state(next);
    }
}
