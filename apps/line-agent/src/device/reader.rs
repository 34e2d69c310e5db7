use super::{DeviceClient, DeviceError, NodeId, NodeValue, Reading};
use crate::model::{DeviceErrors, DeviceState, ProductionStatus, TelemetrySample};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Reads telemetry and status attributes of a device. Every failure is soft: it is logged and
/// reported as [`Reading::Unavailable`].
#[derive(Clone)]
pub struct DeviceStateReader {
    client: Arc<dyn DeviceClient>,
}

impl DeviceStateReader {
    pub fn new(client: Arc<dyn DeviceClient>) -> Self {
        Self { client }
    }

    pub async fn read_telemetry(&self, device_id: u32) -> Reading<TelemetrySample> {
        match self.try_read_telemetry(device_id).await {
            Ok(sample) => Reading::Available(sample),
            Err(err) => {
                tracing::warn!(device_id, error = %err, "telemetry read failed");
                Reading::Unavailable
            }
        }
    }

    pub async fn read_state(&self, device_id: u32) -> Reading<DeviceState> {
        match self.try_read_state(device_id).await {
            Ok(state) => Reading::Available(state),
            Err(err) => {
                tracing::warn!(device_id, error = %err, "state read failed");
                Reading::Unavailable
            }
        }
    }

    async fn try_read_telemetry(&self, device_id: u32) -> Result<TelemetrySample, DeviceError> {
        let status_node = NodeId::attribute(device_id, "ProductionStatus");
        let raw_status = self.read_int(&status_node).await?;
        let production_status = ProductionStatus::from_raw(raw_status).ok_or_else(|| {
            bad_value(&status_node, format!("unknown production status {raw_status}"))
        })?;

        let workorder_node = NodeId::attribute(device_id, "WorkorderId");
        let workorder_id = parse_workorder(&workorder_node, &self.read_text(&workorder_node).await?)?;

        let good_count = self.read_counter(device_id, "GoodCount").await?;
        let bad_count = self.read_counter(device_id, "BadCount").await?;

        let temperature_node = NodeId::attribute(device_id, "Temperature");
        let temperature = self.read_float(&temperature_node).await?;

        Ok(TelemetrySample {
            device_id,
            production_status,
            workorder_id,
            good_count,
            bad_count,
            temperature,
            timestamp: Utc::now(),
        })
    }

    async fn try_read_state(&self, device_id: u32) -> Result<DeviceState, DeviceError> {
        let rate_node = NodeId::attribute(device_id, "ProductionRate");
        let raw_rate = self.read_int(&rate_node).await?;
        let production_rate = raw_rate.clamp(0, 100) as u8;
        if i64::from(production_rate) != raw_rate {
            tracing::warn!(device_id, raw_rate, "device reported production rate outside 0..=100; clamped");
        }

        let error_node = NodeId::attribute(device_id, "DeviceError");
        let raw_errors = self.read_int(&error_node).await?;
        let raw_errors = u16::try_from(raw_errors)
            .map_err(|_| bad_value(&error_node, format!("invalid error bitset {raw_errors}")))?;

        Ok(DeviceState {
            device_id,
            production_rate,
            error_flags: DeviceErrors::from_device_bits(raw_errors),
            last_updated: Utc::now(),
        })
    }

    async fn read_counter(&self, device_id: u32, name: &str) -> Result<u64, DeviceError> {
        let node = NodeId::attribute(device_id, name);
        let raw = self.read_int(&node).await?;
        u64::try_from(raw).map_err(|_| bad_value(&node, format!("negative counter {raw}")))
    }

    async fn read_int(&self, node: &NodeId) -> Result<i64, DeviceError> {
        let value = self.client.read_node(node).await?;
        value
            .as_i64()
            .ok_or_else(|| bad_value(node, format!("expected integer, got {value:?}")))
    }

    async fn read_float(&self, node: &NodeId) -> Result<f64, DeviceError> {
        let value = self.client.read_node(node).await?;
        value
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| bad_value(node, format!("expected finite number, got {value:?}")))
    }

    async fn read_text(&self, node: &NodeId) -> Result<String, DeviceError> {
        match self.client.read_node(node).await? {
            NodeValue::Text(text) => Ok(text),
            other => Err(bad_value(node, format!("expected text, got {other:?}"))),
        }
    }
}

fn parse_workorder(node: &NodeId, raw: &str) -> Result<Option<Uuid>, DeviceError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = Uuid::parse_str(trimmed)
        .map_err(|err| bad_value(node, format!("invalid workorder id: {err}")))?;
    Ok(Some(parsed).filter(|id| !id.is_nil()))
}

fn bad_value(node: &NodeId, detail: String) -> DeviceError {
    DeviceError::BadValue {
        node: node.clone(),
        detail,
    }
}
