use crate::bridge::CloudBridge;
use crate::cloud::{CloudError, CloudTransport, MethodResponse};
use crate::config::Config;
use crate::stats::AgentStats;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RECONNECT_PAUSE: Duration = Duration::from_secs(2);
pub const REQUEST_QUEUE_CAPACITY: usize = 64;

/// Topic layout for one device under the configured prefix.
#[derive(Debug, Clone)]
pub struct DeviceTopics {
    root: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    Method { name: String, rid: String },
    Desired,
    DeviceMessage { properties: String },
}

impl DeviceTopics {
    pub fn new(prefix: &str, device_name: &str) -> Self {
        Self {
            root: format!("{}/{}", prefix.trim_end_matches('/'), device_name),
        }
    }

    pub fn events(&self, properties: &[(&str, &str)]) -> String {
        format!("{}/messages/events/{}", self.root, encode_properties(properties))
    }

    pub fn reported(&self) -> String {
        format!("{}/twin/reported", self.root)
    }

    pub fn desired(&self) -> String {
        format!("{}/twin/desired", self.root)
    }

    pub fn device_bound_filter(&self) -> String {
        format!("{}/messages/devicebound/#", self.root)
    }

    pub fn method_filter(&self) -> String {
        format!("{}/methods/POST/#", self.root)
    }

    pub fn method_response(&self, status: u16, rid: &str) -> String {
        format!("{}/methods/res/{}/?$rid={}", self.root, status, rid)
    }

    pub fn classify(&self, topic: &str) -> Option<InboundTopic> {
        let rest = topic.strip_prefix(&self.root)?.strip_prefix('/')?;
        if rest == "twin/desired" {
            return Some(InboundTopic::Desired);
        }
        if let Some(properties) = rest.strip_prefix("messages/devicebound/") {
            return Some(InboundTopic::DeviceMessage {
                properties: properties.to_string(),
            });
        }
        if rest == "messages/devicebound" {
            return Some(InboundTopic::DeviceMessage {
                properties: String::new(),
            });
        }
        let call = rest.strip_prefix("methods/POST/")?;
        let (name, rid) = call.split_once("/?$rid=")?;
        if name.is_empty() || name.contains('/') || rid.is_empty() {
            return None;
        }
        Some(InboundTopic::Method {
            name: name.to_string(),
            rid: rid.to_string(),
        })
    }
}

/// Requests are queued without waiting: while the broker is unreachable the queue is not drained,
/// so a full queue surfaces as [`CloudError::Unavailable`] instead of parking the caller.
fn queue_error(err: ClientError) -> CloudError {
    match err {
        ClientError::TryRequest(_) => {
            CloudError::Unavailable("mqtt request queue is full; broker unreachable".to_string())
        }
        other => CloudError::Client(other),
    }
}

fn encode_properties(properties: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(properties)
        .finish()
}

/// [`CloudTransport`] over an MQTT broker.
#[derive(Clone)]
pub struct MqttCloudClient {
    client: AsyncClient,
    topics: DeviceTopics,
}

impl MqttCloudClient {
    pub fn connect(config: &Config) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(15));
        if let Some(username) = &config.mqtt_username {
            options.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }
        let (client, eventloop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);
        let topics = DeviceTopics::new(&config.mqtt_topic_prefix, &config.device_name);
        (Self { client, topics }, eventloop)
    }

    pub fn disconnect(&self) {
        if let Err(err) = self.client.try_disconnect() {
            tracing::debug!(error = %err, "mqtt disconnect failed");
        }
    }

    fn subscribe_inbound(&self) -> Result<(), CloudError> {
        for filter in [
            self.topics.method_filter(),
            self.topics.desired(),
            self.topics.device_bound_filter(),
        ] {
            self.client
                .try_subscribe(filter, QoS::AtLeastOnce)
                .map_err(queue_error)?;
        }
        Ok(())
    }

    fn respond(&self, rid: &str, response: MethodResponse) -> Result<(), CloudError> {
        let payload = serde_json::to_vec(&response.payload)?;
        self.client
            .try_publish(
                self.topics.method_response(response.status, rid),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .map_err(queue_error)
    }
}

#[async_trait]
impl CloudTransport for MqttCloudClient {
    async fn send_event(&self, payload: Vec<u8>, properties: &[(&str, &str)]) -> Result<(), CloudError> {
        self.client
            .try_publish(self.topics.events(properties), QoS::AtLeastOnce, false, payload)
            .map_err(queue_error)
    }

    async fn update_reported(&self, patch: JsonValue) -> Result<(), CloudError> {
        let payload = serde_json::to_vec(&patch)?;
        self.client
            .try_publish(self.topics.reported(), QoS::AtLeastOnce, true, payload)
            .map_err(queue_error)
    }
}

/// Polls the MQTT event loop and hands inbound commands to the bridge. Each request runs in
/// its own task so a slow device call never stalls the connection.
pub async fn run_inbound(
    mut eventloop: EventLoop,
    cloud: MqttCloudClient,
    bridge: Arc<CloudBridge>,
    stats: Arc<AgentStats>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => match cloud.subscribe_inbound() {
                Ok(()) => {
                    stats.set_mqtt_connected(true);
                    tracing::info!(topic = %cloud.topics.method_filter(), "subscribed to device command topics");
                }
                Err(err) => tracing::warn!(error = %err, "failed to subscribe to command topics"),
            },
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let Some(inbound) = cloud.topics.classify(&publish.topic) else {
                    tracing::debug!(topic = %publish.topic, "ignoring unrelated publish");
                    continue;
                };
                dispatch(inbound, publish.payload.to_vec(), &cloud, &bridge);
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

fn dispatch(inbound: InboundTopic, payload: Vec<u8>, cloud: &MqttCloudClient, bridge: &Arc<CloudBridge>) {
    match inbound {
        InboundTopic::Method { name, rid } => {
            let cloud = cloud.clone();
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let response = bridge.handle_method(&name).await;
                if let Err(err) = cloud.respond(&rid, response) {
                    tracing::warn!(method = %name, rid = %rid, error = %err, "failed to publish method response");
                }
            });
        }
        InboundTopic::Desired => {
            let desired: JsonValue = match serde_json::from_slice(&payload) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(error = %err, "malformed desired properties patch");
                    return;
                }
            };
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge.on_desired_properties(&desired).await;
            });
        }
        InboundTopic::DeviceMessage { properties } => {
            bridge.on_device_message(&properties, &payload);
        }
    }
}
