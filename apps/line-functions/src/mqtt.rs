use crate::commands::{CommandError, DeviceService, MethodResult};
use crate::config::Config;
use crate::kpi::KpiEvaluator;
use crate::router::EventRouter;
use crate::stats::ProcessorStats;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const RECONNECT_PAUSE: Duration = Duration::from_secs(2);
pub const REQUEST_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceTopic {
    Event { device: String },
    MethodResponse { device: String, status: u16, rid: String },
    Reported { device: String },
    Kpi,
}

/// Hub-side view of the topic tree: wildcard filters over every device plus per-device
/// command topics.
#[derive(Debug, Clone)]
pub struct ServiceTopics {
    prefix: String,
}

impl ServiceTopics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn filters(&self) -> [String; 4] {
        [
            format!("{}/+/messages/events/#", self.prefix),
            format!("{}/+/methods/res/#", self.prefix),
            format!("{}/+/twin/reported", self.prefix),
            self.kpi(),
        ]
    }

    pub fn kpi(&self) -> String {
        format!("{}/kpi", self.prefix)
    }

    pub fn method_request(&self, device: &str, method: &str, rid: &str) -> String {
        format!("{}/{}/methods/POST/{}/?$rid={}", self.prefix, device, method, rid)
    }

    pub fn device_bound(&self, device: &str, properties: &[(&str, &str)]) -> String {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(properties)
            .finish();
        format!("{}/{}/messages/devicebound/{}", self.prefix, device, encoded)
    }

    pub fn desired(&self, device: &str) -> String {
        format!("{}/{}/twin/desired", self.prefix, device)
    }

    pub fn classify(&self, topic: &str) -> Option<ServiceTopic> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        if rest == "kpi" {
            return Some(ServiceTopic::Kpi);
        }
        let (device, tail) = rest.split_once('/')?;
        if device.is_empty() {
            return None;
        }
        let device = device.to_string();
        if tail == "twin/reported" {
            return Some(ServiceTopic::Reported { device });
        }
        if tail == "messages/events" || tail.starts_with("messages/events/") {
            return Some(ServiceTopic::Event { device });
        }
        let (status, rid) = tail.strip_prefix("methods/res/")?.split_once("/?$rid=")?;
        let status = status.parse().ok()?;
        if rid.is_empty() {
            return None;
        }
        Some(ServiceTopic::MethodResponse {
            device,
            status,
            rid: rid.to_string(),
        })
    }
}

/// Requests never wait for queue space; a full queue means the broker is not draining it.
fn queue_error(err: ClientError) -> CommandError {
    match err {
        ClientError::TryRequest(_) => {
            CommandError::Transport("mqtt request queue is full; broker unreachable".to_string())
        }
        other => CommandError::Client(other),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`DeviceService`] over the MQTT broker. Method calls are correlated by request id; the
/// reported shadow is mirrored from retained `twin/reported` patches.
pub struct MqttDeviceService {
    client: AsyncClient,
    topics: ServiceTopics,
    pending: Mutex<HashMap<String, oneshot::Sender<MethodResult>>>,
    reported: Mutex<HashMap<String, Map<String, JsonValue>>>,
}

impl MqttDeviceService {
    pub fn connect(config: &Config) -> (Arc<Self>, EventLoop) {
        let mut options = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            options.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }
        let (client, eventloop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);
        let service = Self {
            client,
            topics: ServiceTopics::new(&config.mqtt_topic_prefix),
            pending: Mutex::default(),
            reported: Mutex::default(),
        };
        (Arc::new(service), eventloop)
    }

    pub fn disconnect(&self) {
        if let Err(err) = self.client.try_disconnect() {
            tracing::debug!(error = %err, "mqtt disconnect failed");
        }
    }

    fn subscribe_all(&self) -> Result<(), CommandError> {
        for filter in self.topics.filters() {
            self.client
                .try_subscribe(filter, QoS::AtLeastOnce)
                .map_err(queue_error)?;
        }
        Ok(())
    }

    /// Hands a device's method response to the waiting caller, if it is still waiting.
    pub fn complete(&self, rid: &str, status: u16, payload: &[u8]) {
        let Some(waiter) = lock(&self.pending).remove(rid) else {
            tracing::debug!(rid, status, "late or unknown method response");
            return;
        };
        let payload = serde_json::from_slice(payload).unwrap_or(JsonValue::Null);
        if waiter.send(MethodResult { status, payload }).is_err() {
            tracing::debug!(rid, "method caller went away before the response arrived");
        }
    }

    pub fn merge_reported(&self, device: &str, payload: &[u8]) {
        let patch = match serde_json::from_slice::<JsonValue>(payload) {
            Ok(JsonValue::Object(patch)) => patch,
            Ok(_) => {
                tracing::warn!(device, "reported patch is not an object");
                return;
            }
            Err(err) => {
                tracing::warn!(device, error = %err, "malformed reported patch");
                return;
            }
        };
        let mut reported = lock(&self.reported);
        let shadow = reported.entry(device.to_string()).or_default();
        for (key, value) in patch {
            shadow.insert(key, value);
        }
    }
}

#[async_trait]
impl DeviceService for MqttDeviceService {
    async fn invoke_method(
        &self,
        device: &str,
        method: &str,
        payload: JsonValue,
        timeout: Duration,
    ) -> Result<MethodResult, CommandError> {
        let body = serde_json::to_vec(&payload)?;
        let rid = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(rid.clone(), tx);

        if let Err(err) = self.client.try_publish(
            self.topics.method_request(device, method, &rid),
            QoS::AtLeastOnce,
            false,
            body,
        ) {
            lock(&self.pending).remove(&rid);
            return Err(queue_error(err));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CommandError::Transport(format!(
                "response channel for {method} on {device} closed"
            ))),
            Err(_) => {
                lock(&self.pending).remove(&rid);
                Err(CommandError::Timeout {
                    device: device.to_string(),
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn send_to_device(
        &self,
        device: &str,
        payload: Vec<u8>,
        properties: &[(&str, &str)],
    ) -> Result<(), CommandError> {
        self.client
            .try_publish(
                self.topics.device_bound(device, properties),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .map_err(queue_error)
    }

    async fn reported_property(&self, device: &str, name: &str) -> Result<Option<JsonValue>, CommandError> {
        Ok(lock(&self.reported)
            .get(device)
            .and_then(|shadow| shadow.get(name))
            .cloned())
    }

    async fn update_desired(&self, device: &str, patch: JsonValue) -> Result<(), CommandError> {
        let payload = serde_json::to_vec(&patch)?;
        self.client
            .try_publish(self.topics.desired(device), QoS::AtLeastOnce, true, payload)
            .map_err(queue_error)
    }
}

/// Polls the broker connection and fans inbound traffic out to the router, the KPI evaluator
/// and pending method calls. Event and KPI handling run in their own tasks since they issue
/// commands whose responses arrive through this same loop.
pub async fn run_listener(
    mut eventloop: EventLoop,
    service: Arc<MqttDeviceService>,
    router: Arc<EventRouter>,
    kpi: Arc<KpiEvaluator>,
    stats: Arc<ProcessorStats>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => match service.subscribe_all() {
                Ok(()) => {
                    stats.set_mqtt_connected(true);
                    tracing::info!(topic = %service.topics.kpi(), "subscribed to device feeds");
                }
                Err(err) => tracing::warn!(error = %err, "failed to subscribe to device feeds"),
            },
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let Some(topic) = service.topics.classify(&publish.topic) else {
                    tracing::debug!(topic = %publish.topic, "ignoring unrelated publish");
                    continue;
                };
                match topic {
                    ServiceTopic::Event { device } => {
                        let router = router.clone();
                        let mut payload = publish.payload.to_vec();
                        tokio::spawn(async move {
                            router.route(&device, &mut payload).await;
                        });
                    }
                    ServiceTopic::MethodResponse { device, status, rid } => {
                        tracing::debug!(device = %device, status, rid = %rid, "method response");
                        service.complete(&rid, status, &publish.payload);
                    }
                    ServiceTopic::Reported { device } => {
                        service.merge_reported(&device, &publish.payload);
                    }
                    ServiceTopic::Kpi => {
                        let kpi = kpi.clone();
                        let batch = publish.payload.to_vec();
                        tokio::spawn(async move {
                            kpi.process_batch(&batch).await;
                        });
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                stats.set_mqtt_connected(false);
                tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                }
            }
        }
    }
    stats.set_mqtt_connected(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::TriggerPolicy;
    use serde_json::json;

    fn test_config() -> Config {
        Config {
            mqtt_host: "127.0.0.1".into(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic_prefix: "factory".into(),
            mqtt_keepalive_secs: 30,
            mqtt_client_id: "line-functions-test".into(),
            device_id_template: "device{id}".into(),
            trigger_policy: TriggerPolicy::default(),
            method_timeout_secs: 30,
            sweep_interval_secs: 60,
        }
    }

    async fn pending_rid(service: &MqttDeviceService) -> String {
        loop {
            if let Some(rid) = lock(&service.pending).keys().next().cloned() {
                return rid;
            }
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn builds_command_topics() {
        let topics = ServiceTopics::new("factory/");
        assert_eq!(
            topics.method_request("device2", "EmergencyStop", "ab12"),
            "factory/device2/methods/POST/EmergencyStop/?$rid=ab12"
        );
        assert_eq!(
            topics.device_bound("device2", &[("messageType", "errorEvent"), ("deviceId", "2")]),
            "factory/device2/messages/devicebound/messageType=errorEvent&deviceId=2"
        );
        assert_eq!(topics.desired("device2"), "factory/device2/twin/desired");
        assert_eq!(topics.filters()[0], "factory/+/messages/events/#");
        assert_eq!(topics.kpi(), "factory/kpi");
    }

    #[test]
    fn classifies_device_traffic() {
        let topics = ServiceTopics::new("factory");
        assert_eq!(
            topics.classify("factory/device1/messages/events/messageType=telemetry"),
            Some(ServiceTopic::Event {
                device: "device1".into()
            })
        );
        assert_eq!(
            topics.classify("factory/device1/methods/res/200/?$rid=ab12"),
            Some(ServiceTopic::MethodResponse {
                device: "device1".into(),
                status: 200,
                rid: "ab12".into(),
            })
        );
        assert_eq!(
            topics.classify("factory/device1/twin/reported"),
            Some(ServiceTopic::Reported {
                device: "device1".into()
            })
        );
        assert_eq!(topics.classify("factory/kpi"), Some(ServiceTopic::Kpi));
    }

    #[test]
    fn ignores_foreign_topics() {
        let topics = ServiceTopics::new("factory");
        assert_eq!(topics.classify("plant/device1/twin/reported"), None);
        assert_eq!(topics.classify("factory/device1/twin/desired"), None);
        assert_eq!(topics.classify("factory/device1/methods/res/ok/?$rid=1"), None);
        assert_eq!(topics.classify("factory/device1/methods/res/200/?$rid="), None);
        assert_eq!(topics.classify("factory//twin/reported"), None);
    }

    #[tokio::test]
    async fn method_response_completes_the_call() {
        let (service, _eventloop) = MqttDeviceService::connect(&test_config());
        let caller = service.clone();
        let call = tokio::spawn(async move {
            caller
                .invoke_method("device1", "EmergencyStop", json!({ "deviceId": 1 }), Duration::from_secs(30))
                .await
        });

        let rid = pending_rid(&service).await;
        service.complete(&rid, 200, br#"{"success":true}"#);

        let result = call.await.unwrap().unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.payload, json!({ "success": true }));
        assert!(lock(&service.pending).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out() {
        let (service, _eventloop) = MqttDeviceService::connect(&test_config());
        let err = service
            .invoke_method("device1", "EmergencyStop", json!({ "deviceId": 1 }), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Timeout { .. }));
        assert!(lock(&service.pending).is_empty());

        // a response after the deadline is dropped quietly
        service.complete("unknown", 200, b"{}");
    }

    #[tokio::test]
    async fn full_request_queue_fails_instead_of_blocking() {
        let (service, _eventloop) = MqttDeviceService::connect(&test_config());

        let mut accepted = 0;
        let err = loop {
            match service
                .send_to_device("device1", b"{}".to_vec(), &[("messageType", "errorEvent")])
                .await
            {
                Ok(()) => accepted += 1,
                Err(err) => break err,
            }
            assert!(accepted <= REQUEST_QUEUE_CAPACITY, "queue never filled up");
        };
        assert!(matches!(err, CommandError::Transport(_)));

        let err = service
            .invoke_method("device1", "EmergencyStop", json!({ "deviceId": 1 }), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Transport(_)));
        assert!(lock(&service.pending).is_empty());
        assert!(service
            .update_desired("device1", json!({ "productionRate": 90 }))
            .await
            .is_err());

        // returns at once even though nothing drains the queue
        service.disconnect();
    }

    #[tokio::test]
    async fn reported_patches_are_merged() {
        let (service, _eventloop) = MqttDeviceService::connect(&test_config());
        service.merge_reported("device1", br#"{"productionRate":80,"deviceErrors":0}"#);
        service.merge_reported("device1", br#"{"deviceErrors":4}"#);
        service.merge_reported("device1", b"not json");

        assert_eq!(
            service.reported_property("device1", "productionRate").await.unwrap(),
            Some(json!(80))
        );
        assert_eq!(
            service.reported_property("device1", "deviceErrors").await.unwrap(),
            Some(json!(4))
        );
        assert_eq!(service.reported_property("device2", "productionRate").await.unwrap(), None);
    }
}
