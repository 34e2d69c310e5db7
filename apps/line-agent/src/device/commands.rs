use super::{DeviceClient, DeviceError, NodeId, NodeValue};
use std::sync::Arc;

/// Issues control primitives against the device. Failures propagate: callers must know when a
/// stop or reset did not land.
#[derive(Clone)]
pub struct DeviceCommandExecutor {
    client: Arc<dyn DeviceClient>,
}

impl DeviceCommandExecutor {
    pub fn new(client: Arc<dyn DeviceClient>) -> Self {
        Self { client }
    }

    pub async fn emergency_stop(&self, device_id: u32) -> Result<(), DeviceError> {
        self.invoke(device_id, "EmergencyStop").await?;
        tracing::info!(device_id, "emergency stop issued");
        Ok(())
    }

    pub async fn reset_errors(&self, device_id: u32) -> Result<(), DeviceError> {
        self.invoke(device_id, "ResetErrorStatus").await?;
        tracing::info!(device_id, "error status reset");
        Ok(())
    }

    pub async fn set_production_rate(&self, device_id: u32, rate: i64) -> Result<(), DeviceError> {
        if !(0..=100).contains(&rate) {
            return Err(DeviceError::RateOutOfRange(rate));
        }
        self.client
            .write_node(
                &NodeId::attribute(device_id, "ProductionRate"),
                NodeValue::Int(rate),
            )
            .await?;
        tracing::info!(device_id, rate, "production rate written");
        Ok(())
    }

    async fn invoke(&self, device_id: u32, method: &str) -> Result<(), DeviceError> {
        self.client
            .call_method(
                &NodeId::device(device_id),
                &NodeId::attribute(device_id, method),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeDevice;

    #[tokio::test]
    async fn commands_hit_device_nodes() {
        let device = Arc::new(FakeDevice::healthy(3));
        let commands = DeviceCommandExecutor::new(device.clone());

        commands.emergency_stop(3).await.unwrap();
        commands.reset_errors(3).await.unwrap();
        commands.set_production_rate(3, 55).await.unwrap();

        assert_eq!(
            device.calls(),
            vec![
                "ns=2;s=Device 3/EmergencyStop".to_string(),
                "ns=2;s=Device 3/ResetErrorStatus".to_string(),
            ]
        );
        assert_eq!(
            device.writes(),
            vec![("ns=2;s=Device 3/ProductionRate".to_string(), NodeValue::Int(55))]
        );
    }

    #[tokio::test]
    async fn rate_outside_range_is_rejected_before_write() {
        let device = Arc::new(FakeDevice::healthy(3));
        let commands = DeviceCommandExecutor::new(device.clone());

        let err = commands.set_production_rate(3, 101).await.unwrap_err();
        assert!(matches!(err, DeviceError::RateOutOfRange(101)));
        let err = commands.set_production_rate(3, -1).await.unwrap_err();
        assert!(matches!(err, DeviceError::RateOutOfRange(-1)));
        assert!(device.writes().is_empty());
    }

    #[tokio::test]
    async fn disconnected_device_fails_fast() {
        let device = Arc::new(FakeDevice::healthy(3));
        device.disconnect();
        let commands = DeviceCommandExecutor::new(device.clone());

        let err = commands.emergency_stop(3).await.unwrap_err();
        assert!(matches!(err, DeviceError::NotConnected));
        assert!(device.calls().is_empty());
    }

    #[tokio::test]
    async fn method_failures_propagate() {
        let device = Arc::new(FakeDevice::healthy(3));
        device.fail(3, "ResetErrorStatus");
        let commands = DeviceCommandExecutor::new(device.clone());

        assert!(matches!(
            commands.reset_errors(3).await,
            Err(DeviceError::Io(_))
        ));
    }
}
