use crate::model::DeviceErrorEvent;
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

pub const METHOD_EMERGENCY_STOP: &str = "EmergencyStop";
pub const DESIRED_PRODUCTION_RATE: &str = "productionRate";
/// Assumed rate when the shadow has never reported one.
pub const DEFAULT_PRODUCTION_RATE: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{method} on {device} timed out after {timeout:?}")]
    Timeout {
        device: String,
        method: String,
        timeout: Duration,
    },
    #[error("mqtt client rejected the request: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("device service unavailable: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodResult {
    pub status: u16,
    pub payload: JsonValue,
}

/// Cloud-to-device primitives of the hub service SDK.
#[async_trait]
pub trait DeviceService: Send + Sync {
    async fn invoke_method(
        &self,
        device: &str,
        method: &str,
        payload: JsonValue,
        timeout: Duration,
    ) -> Result<MethodResult, CommandError>;

    async fn send_to_device(
        &self,
        device: &str,
        payload: Vec<u8>,
        properties: &[(&str, &str)],
    ) -> Result<(), CommandError>;

    /// Last reported value of one shadow property, if the device ever reported it.
    async fn reported_property(&self, device: &str, name: &str) -> Result<Option<JsonValue>, CommandError>;

    async fn update_desired(&self, device: &str, patch: JsonValue) -> Result<(), CommandError>;
}

/// Device-addressed commands issued by the cloud-side policies.
#[derive(Clone)]
pub struct CommandPath {
    service: Arc<dyn DeviceService>,
    template: String,
    method_timeout: Duration,
}

impl CommandPath {
    pub fn new(service: Arc<dyn DeviceService>, template: impl Into<String>, method_timeout: Duration) -> Self {
        Self {
            service,
            template: template.into(),
            method_timeout,
        }
    }

    pub fn device_name(&self, device_id: u32) -> String {
        format_device_name(&self.template, device_id)
    }

    /// A non-200 reply is logged and swallowed; transport failures propagate.
    pub async fn trigger_emergency_stop(&self, device_id: u32) -> Result<(), CommandError> {
        let device = self.device_name(device_id);
        tracing::info!(device = %device, "invoking EmergencyStop");

        let result = self
            .service
            .invoke_method(
                &device,
                METHOD_EMERGENCY_STOP,
                json!({ "deviceId": device_id }),
                self.method_timeout,
            )
            .await
            .inspect_err(|err| {
                tracing::error!(device = %device, error = %err, "EmergencyStop invocation failed");
            })?;

        if result.status == 200 {
            tracing::info!(device = %device, "EmergencyStop executed");
        } else {
            tracing::error!(
                device = %device,
                status = result.status,
                response = %result.payload,
                "EmergencyStop rejected by device"
            );
        }
        Ok(())
    }

    pub async fn publish_error_event(&self, event: &DeviceErrorEvent) -> Result<(), CommandError> {
        let device = self.device_name(event.device_id);
        let device_id = event.device_id.to_string();
        let payload = serde_json::to_vec(event)?;
        self.service
            .send_to_device(
                &device,
                payload,
                &[("messageType", "errorEvent"), ("deviceId", device_id.as_str())],
            )
            .await
            .inspect_err(|err| {
                tracing::error!(device = %device, error = %err, "failed to publish error event");
            })?;
        tracing::info!(device_id = event.device_id, device = %device, "published error event");
        Ok(())
    }

    /// Current rate as last reported by the device; falls back to
    /// [`DEFAULT_PRODUCTION_RATE`] when missing, unreadable or outside `0..=100`.
    pub async fn reported_production_rate(&self, device_id: u32) -> i64 {
        let device = self.device_name(device_id);
        match self.service.reported_property(&device, DESIRED_PRODUCTION_RATE).await {
            Ok(Some(value)) => match parse_rate(&value).filter(|rate| (0..=100).contains(rate)) {
                Some(rate) => rate,
                None => {
                    tracing::warn!(device = %device, value = %value, "unreadable reported productionRate; using default");
                    DEFAULT_PRODUCTION_RATE
                }
            },
            Ok(None) => DEFAULT_PRODUCTION_RATE,
            Err(err) => {
                tracing::warn!(device = %device, error = %err, "failed to read reported productionRate; using default");
                DEFAULT_PRODUCTION_RATE
            }
        }
    }

    pub async fn set_desired_production_rate(&self, device_id: u32, rate: i64) -> Result<(), CommandError> {
        let device = self.device_name(device_id);
        self.service
            .update_desired(&device, json!({ DESIRED_PRODUCTION_RATE: rate }))
            .await
            .inspect_err(|err| {
                tracing::error!(device = %device, error = %err, "failed to update desired productionRate");
            })
    }
}

/// Maps a numeric device id onto its hub identity, e.g. `device{id}` -> `device3`.
pub fn format_device_name(template: &str, device_id: u32) -> String {
    template.replace("{id}", &device_id.to_string())
}

fn parse_rate(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|v| v.fract() == 0.0).map(|v| v as i64)),
        JsonValue::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}
