use crate::cloud::{CloudError, CloudTransport, MethodResponse};
use crate::device::{
    DeviceClient, DeviceCommandExecutor, DeviceError, DeviceStateReader, Reading,
};
use crate::model::{DeviceState, TelemetrySample};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const METHOD_EMERGENCY_STOP: &str = "EmergencyStop";
pub const METHOD_RESET_ERROR_STATUS: &str = "ResetErrorStatus";
pub const DESIRED_PRODUCTION_RATE: &str = "productionRate";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredOutcome {
    Applied(i64),
    Ignored,
    Rejected,
}

/// Mirrors one device to the cloud and applies cloud-originated commands to it.
pub struct CloudBridge {
    device_id: u32,
    cloud: Arc<dyn CloudTransport>,
    reader: DeviceStateReader,
    commands: DeviceCommandExecutor,
    // Held across diff + patch + replace so loop-driven and handler-driven syncs serialize.
    last_sent: Mutex<Option<DeviceState>>,
}

impl CloudBridge {
    pub fn new(device_id: u32, cloud: Arc<dyn CloudTransport>, device: Arc<dyn DeviceClient>) -> Self {
        Self {
            device_id,
            cloud,
            reader: DeviceStateReader::new(device.clone()),
            commands: DeviceCommandExecutor::new(device),
            last_sent: Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn reader(&self) -> &DeviceStateReader {
        &self.reader
    }

    pub async fn publish_telemetry(&self, sample: &TelemetrySample) -> Result<(), CloudError> {
        let payload = serde_json::to_vec(sample)?;
        self.cloud
            .send_event(payload, &[("messageType", "telemetry")])
            .await?;
        tracing::debug!(device_id = sample.device_id, "telemetry published");
        Ok(())
    }

    /// Patches the reported shadow when the rate or error flags moved since the last successful
    /// patch. Returns whether a patch was sent.
    pub async fn sync_shadow(&self, state: &DeviceState) -> Result<bool, CloudError> {
        let mut last_sent = self.last_sent.lock().await;
        let changed = last_sent
            .as_ref()
            .map(|previous| state.differs_from(previous))
            .unwrap_or(true);
        if !changed {
            return Ok(false);
        }

        let patch = serde_json::to_value(state.shadow_patch())?;
        self.cloud.update_reported(patch).await?;
        *last_sent = Some(state.clone());

        tracing::info!(
            device_id = state.device_id,
            rate = state.production_rate,
            errors = %state.error_flags,
            "shadow updated"
        );
        Ok(true)
    }

    pub async fn handle_method(&self, name: &str) -> MethodResponse {
        match name {
            METHOD_EMERGENCY_STOP => self.on_emergency_stop().await,
            METHOD_RESET_ERROR_STATUS => self.on_reset_errors().await,
            other => {
                tracing::warn!(method = other, "unsupported direct method");
                MethodResponse::not_found()
            }
        }
    }

    pub async fn on_emergency_stop(&self) -> MethodResponse {
        tracing::info!(device_id = self.device_id, "direct method: EmergencyStop");
        acknowledge(
            METHOD_EMERGENCY_STOP,
            self.commands.emergency_stop(self.device_id).await,
        )
    }

    pub async fn on_reset_errors(&self) -> MethodResponse {
        tracing::info!(device_id = self.device_id, "direct method: ResetErrorStatus");
        acknowledge(
            METHOD_RESET_ERROR_STATUS,
            self.commands.reset_errors(self.device_id).await,
        )
    }

    /// Applies every recognised key of a desired-properties patch.
    pub async fn on_desired_properties(&self, desired: &JsonValue) {
        let Some(entries) = desired.as_object() else {
            tracing::warn!("desired properties patch is not an object");
            return;
        };
        for (name, value) in entries {
            if let Err(err) = self.on_desired_property(name, value).await {
                tracing::error!(property = %name, error = %err, "failed to apply desired property");
            }
        }
    }

    pub async fn on_desired_property(
        &self,
        name: &str,
        value: &JsonValue,
    ) -> Result<DesiredOutcome, DeviceError> {
        if name != DESIRED_PRODUCTION_RATE {
            tracing::debug!(property = name, "ignoring desired property");
            return Ok(DesiredOutcome::Ignored);
        }
        let Some(rate) = parse_rate(value) else {
            tracing::warn!(value = %value, "desired productionRate is not an integer");
            return Ok(DesiredOutcome::Rejected);
        };

        self.commands.set_production_rate(self.device_id, rate).await?;
        tracing::info!(device_id = self.device_id, rate, "desired productionRate applied");
        self.refresh_shadow().await;
        Ok(DesiredOutcome::Applied(rate))
    }

    /// Cloud-to-device data-plane messages carry no business logic; they are logged and acked.
    pub fn on_device_message(&self, properties: &str, payload: &[u8]) {
        tracing::info!(
            device_id = self.device_id,
            properties,
            body = %String::from_utf8_lossy(payload),
            "cloud-to-device message received"
        );
    }

    async fn refresh_shadow(&self) {
        if let Reading::Available(state) = self.reader.read_state(self.device_id).await {
            if let Err(err) = self.sync_shadow(&state).await {
                tracing::warn!(error = %err, "shadow refresh after rate change failed");
            }
        }
    }
}

fn acknowledge(method: &str, result: Result<(), DeviceError>) -> MethodResponse {
    match result {
        Ok(()) => MethodResponse::ok(),
        Err(err) => {
            tracing::error!(method, error = %err, "direct method failed");
            MethodResponse::failed()
        }
    }
}

fn parse_rate(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|v| v.fract() == 0.0 && v.abs() <= i64::MAX as f64)
                .map(|v| v as i64)
        }),
        JsonValue::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    }
}
