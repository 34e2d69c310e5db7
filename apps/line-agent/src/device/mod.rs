mod commands;
mod modbus;
mod reader;

pub use commands::DeviceCommandExecutor;
pub use modbus::{ModbusDeviceClient, RegisterLayout};
pub use reader::DeviceStateReader;

use async_trait::async_trait;
use std::fmt;

/// Namespace index under which device objects are exposed.
pub const DEVICE_NAMESPACE: u16 = 2;

/// Process-control node address in `ns=<index>;s=<identifier>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    namespace: u16,
    identifier: String,
}

impl NodeId {
    pub fn new(namespace: u16, identifier: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: identifier.into(),
        }
    }

    /// The device object itself, e.g. `ns=2;s=Device 1`.
    pub fn device(device_id: u32) -> Self {
        Self::new(DEVICE_NAMESPACE, format!("Device {device_id}"))
    }

    /// A device attribute or method, e.g. `ns=2;s=Device 1/ProductionRate`.
    pub fn attribute(device_id: u32, name: &str) -> Self {
        Self::new(DEVICE_NAMESPACE, format!("Device {device_id}/{name}"))
    }

    /// Splits `Device <id>/<name>` back into its parts.
    pub fn device_attribute(&self) -> Option<(u32, &str)> {
        if self.namespace != DEVICE_NAMESPACE {
            return None;
        }
        let rest = self.identifier.strip_prefix("Device ")?;
        let (id, name) = rest.split_once('/')?;
        let id = id.trim().parse::<u32>().ok()?;
        if name.is_empty() {
            return None;
        }
        Some((id, name))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns={};s={}", self.namespace, self.identifier)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl NodeValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            NodeValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NodeValue::Float(value) => Some(*value),
            NodeValue::Int(value) => Some(*value as f64),
            NodeValue::Text(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device connection is not established")]
    NotConnected,
    #[error("node {0} is not exposed by the device")]
    UnknownNode(NodeId),
    #[error("node {node} returned an unusable value: {detail}")]
    BadValue { node: NodeId, detail: String },
    #[error("production rate {0} is outside 0..=100")]
    RateOutOfRange(i64),
    #[error("device call timed out")]
    Timeout,
    #[error("device i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-control client primitives used by the reader and the command executor.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn read_node(&self, node: &NodeId) -> Result<NodeValue, DeviceError>;

    async fn write_node(&self, node: &NodeId, value: NodeValue) -> Result<(), DeviceError>;

    async fn call_method(&self, object: &NodeId, method: &NodeId) -> Result<(), DeviceError>;
}

/// Outcome of a soft device read.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading<T> {
    Available(T),
    Unavailable,
}

impl<T> Reading<T> {
    #[cfg(test)]
    pub fn into_option(self) -> Option<T> {
        match self {
            Reading::Available(value) => Some(value),
            Reading::Unavailable => None,
        }
    }

    #[cfg(test)]
    pub fn is_available(&self) -> bool {
        matches!(self, Reading::Available(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_render_and_parse() {
        let node = NodeId::attribute(7, "ProductionRate");
        assert_eq!(node.to_string(), "ns=2;s=Device 7/ProductionRate");
        assert_eq!(node.device_attribute(), Some((7, "ProductionRate")));

        assert_eq!(NodeId::device(7).to_string(), "ns=2;s=Device 7");
        assert_eq!(NodeId::device(7).device_attribute(), None);
        assert_eq!(NodeId::new(3, "Device 7/ProductionRate").device_attribute(), None);
        assert_eq!(NodeId::new(2, "Device x/ProductionRate").device_attribute(), None);
    }

    #[test]
    fn node_values_convert_loosely_to_float() {
        assert_eq!(NodeValue::Int(4).as_f64(), Some(4.0));
        assert_eq!(NodeValue::Float(1.5).as_i64(), None);
        assert_eq!(NodeValue::Text("4".into()).as_f64(), None);
    }
}
