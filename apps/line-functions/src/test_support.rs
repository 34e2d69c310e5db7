use crate::commands::{CommandError, DeviceService, MethodResult};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub device: String,
    pub method: String,
    pub payload: JsonValue,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub device: String,
    pub properties: Vec<(String, String)>,
    pub body: JsonValue,
}

/// Records every cloud-to-device call; replies 200 unless told otherwise.
pub struct FakeDeviceService {
    invocations: Mutex<Vec<Invocation>>,
    sent: Mutex<Vec<SentMessage>>,
    desired: Mutex<Vec<(String, JsonValue)>>,
    reported: Mutex<HashMap<(String, String), JsonValue>>,
    status: AtomicU16,
    fail_invocations: AtomicBool,
    fail_desired: AtomicBool,
}

impl Default for FakeDeviceService {
    fn default() -> Self {
        Self {
            invocations: Mutex::default(),
            sent: Mutex::default(),
            desired: Mutex::default(),
            reported: Mutex::default(),
            status: AtomicU16::new(200),
            fail_invocations: AtomicBool::new(false),
            fail_desired: AtomicBool::new(false),
        }
    }
}

impl FakeDeviceService {
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn desired(&self) -> Vec<(String, JsonValue)> {
        self.desired.lock().unwrap().clone()
    }

    pub fn set_reported(&self, device: &str, name: &str, value: JsonValue) {
        self.reported
            .lock()
            .unwrap()
            .insert((device.to_string(), name.to_string()), value);
    }

    pub fn respond_with(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn fail_invocations(&self, fail: bool) {
        self.fail_invocations.store(fail, Ordering::SeqCst);
    }

    pub fn fail_desired(&self, fail: bool) {
        self.fail_desired.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceService for FakeDeviceService {
    async fn invoke_method(
        &self,
        device: &str,
        method: &str,
        payload: JsonValue,
        timeout: Duration,
    ) -> Result<MethodResult, CommandError> {
        self.invocations.lock().unwrap().push(Invocation {
            device: device.to_string(),
            method: method.to_string(),
            payload,
            timeout,
        });
        if self.fail_invocations.load(Ordering::SeqCst) {
            return Err(CommandError::Transport("injected invocation failure".into()));
        }
        let status = self.status.load(Ordering::SeqCst);
        Ok(MethodResult {
            status,
            payload: json!({ "success": status == 200 }),
        })
    }

    async fn send_to_device(
        &self,
        device: &str,
        payload: Vec<u8>,
        properties: &[(&str, &str)],
    ) -> Result<(), CommandError> {
        let body = serde_json::from_slice(&payload)?;
        self.sent.lock().unwrap().push(SentMessage {
            device: device.to_string(),
            properties: properties
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            body,
        });
        Ok(())
    }

    async fn reported_property(&self, device: &str, name: &str) -> Result<Option<JsonValue>, CommandError> {
        Ok(self
            .reported
            .lock()
            .unwrap()
            .get(&(device.to_string(), name.to_string()))
            .cloned())
    }

    async fn update_desired(&self, device: &str, patch: JsonValue) -> Result<(), CommandError> {
        if self.fail_desired.load(Ordering::SeqCst) {
            return Err(CommandError::Transport("injected desired failure".into()));
        }
        self.desired.lock().unwrap().push((device.to_string(), patch));
        Ok(())
    }
}
