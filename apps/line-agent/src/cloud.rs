use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("mqtt client rejected the request: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("cloud transport unavailable: {0}")]
    Unavailable(String),
}

/// Device-to-cloud primitives of the shadow SDK.
#[async_trait]
pub trait CloudTransport: Send + Sync {
    /// Sends one event; `properties` are application properties attached to the message.
    async fn send_event(&self, payload: Vec<u8>, properties: &[(&str, &str)]) -> Result<(), CloudError>;

    /// Merges `patch` into the reported section of the device shadow.
    async fn update_reported(&self, patch: JsonValue) -> Result<(), CloudError>;
}

/// Reply to a direct method call.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    pub status: u16,
    pub payload: JsonValue,
}

impl MethodResponse {
    pub fn ok() -> Self {
        Self::ack(200, true)
    }

    pub fn failed() -> Self {
        Self::ack(500, false)
    }

    pub fn not_found() -> Self {
        Self::ack(404, false)
    }

    fn ack(status: u16, success: bool) -> Self {
        Self {
            status,
            payload: json!({ "success": success }),
        }
    }
}
