use crate::cloud::{CloudError, CloudTransport};
use crate::config::Config;
use crate::device::{DeviceClient, DeviceError, NodeId, NodeValue};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory device exposing the attributes the reader and executor touch.
#[derive(Default)]
pub struct FakeDevice {
    values: Mutex<HashMap<String, NodeValue>>,
    failing: Mutex<HashSet<String>>,
    disconnected: AtomicBool,
    writes: Mutex<Vec<(String, NodeValue)>>,
    calls: Mutex<Vec<String>>,
}

impl FakeDevice {
    pub fn healthy(device_id: u32) -> Self {
        let device = Self::default();
        device.set(device_id, "ProductionStatus", NodeValue::Int(1));
        device.set(device_id, "WorkorderId", NodeValue::Text(String::new()));
        device.set(device_id, "GoodCount", NodeValue::Int(150));
        device.set(device_id, "BadCount", NodeValue::Int(5));
        device.set(device_id, "Temperature", NodeValue::Float(68.25));
        device.set(device_id, "ProductionRate", NodeValue::Int(80));
        device.set(device_id, "DeviceError", NodeValue::Int(0));
        device
    }

    pub fn set(&self, device_id: u32, name: &str, value: NodeValue) {
        self.values
            .lock()
            .unwrap()
            .insert(NodeId::attribute(device_id, name).to_string(), value);
    }

    pub fn fail(&self, device_id: u32, name: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(NodeId::attribute(device_id, name).to_string());
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(String, NodeValue)> {
        self.writes.lock().unwrap().clone()
    }

    fn check(&self, node: &NodeId) -> Result<String, DeviceError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(DeviceError::NotConnected);
        }
        let key = node.to_string();
        if self.failing.lock().unwrap().contains(&key) {
            return Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected failure",
            )));
        }
        Ok(key)
    }
}

#[async_trait]
impl DeviceClient for FakeDevice {
    async fn read_node(&self, node: &NodeId) -> Result<NodeValue, DeviceError> {
        let key = self.check(node)?;
        self.values
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownNode(node.clone()))
    }

    async fn write_node(&self, node: &NodeId, value: NodeValue) -> Result<(), DeviceError> {
        let key = self.check(node)?;
        self.writes.lock().unwrap().push((key.clone(), value.clone()));
        self.values.lock().unwrap().insert(key, value);
        Ok(())
    }

    async fn call_method(&self, _object: &NodeId, method: &NodeId) -> Result<(), DeviceError> {
        let key = self.check(method)?;
        self.calls.lock().unwrap().push(key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentEvent {
    pub properties: Vec<(String, String)>,
    pub body: JsonValue,
}

/// Records everything the bridge sends upstream.
#[derive(Default)]
pub struct FakeCloud {
    events: Mutex<Vec<SentEvent>>,
    patches: Mutex<Vec<JsonValue>>,
    fail_events: AtomicBool,
    fail_patches: AtomicBool,
}

impl FakeCloud {
    pub fn events(&self) -> Vec<SentEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn patches(&self) -> Vec<JsonValue> {
        self.patches.lock().unwrap().clone()
    }

    pub fn fail_events(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    pub fn fail_patches(&self, fail: bool) {
        self.fail_patches.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CloudTransport for FakeCloud {
    async fn send_event(&self, payload: Vec<u8>, properties: &[(&str, &str)]) -> Result<(), CloudError> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(CloudError::Unavailable("injected event failure".into()));
        }
        let body = serde_json::from_slice(&payload)?;
        self.events.lock().unwrap().push(SentEvent {
            properties: properties
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            body,
        });
        Ok(())
    }

    async fn update_reported(&self, patch: JsonValue) -> Result<(), CloudError> {
        if self.fail_patches.load(Ordering::SeqCst) {
            return Err(CloudError::Unavailable("injected patch failure".into()));
        }
        self.patches.lock().unwrap().push(patch);
        Ok(())
    }
}

/// Agent config pointing at a broker nobody serves; the client is never polled in tests.
pub fn test_config() -> Config {
    Config {
        device_id: 1,
        device_name: "device1".to_string(),
        telemetry_interval: Duration::from_secs(1),
        device_endpoint: "127.0.0.1:1502".parse().unwrap(),
        modbus_unit_id: None,
        register_block_size: 64,
        device_io_timeout: Duration::from_secs(5),
        mqtt_host: "127.0.0.1".to_string(),
        mqtt_port: 1883,
        mqtt_username: None,
        mqtt_password: None,
        mqtt_topic_prefix: "factory".to_string(),
        mqtt_client_id: "line-agent-test".to_string(),
        http_bind: "127.0.0.1:0".to_string(),
    }
}
