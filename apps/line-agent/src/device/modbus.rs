use super::{DeviceClient, DeviceError, NodeId, NodeValue};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{error::Elapsed, timeout};
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Reader, Writer};
use uuid::Uuid;

/// Holding-register layout of one device block, relative to `(device_id - 1) * block_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Register {
    U16(u16),
    U64(u16),
    F64(u16),
    Uuid(u16),
}

impl Register {
    fn for_attribute(name: &str) -> Option<Self> {
        match name {
            "ProductionStatus" => Some(Register::U16(0)),
            "WorkorderId" => Some(Register::Uuid(1)),
            "GoodCount" => Some(Register::U64(9)),
            "BadCount" => Some(Register::U64(13)),
            "Temperature" => Some(Register::F64(17)),
            "ProductionRate" => Some(Register::U16(21)),
            "DeviceError" => Some(Register::U16(22)),
            _ => None,
        }
    }

    fn offset(self) -> u16 {
        match self {
            Register::U16(offset)
            | Register::U64(offset)
            | Register::F64(offset)
            | Register::Uuid(offset) => offset,
        }
    }

    fn width(self) -> u16 {
        match self {
            Register::U16(_) => 1,
            Register::U64(_) | Register::F64(_) => 4,
            Register::Uuid(_) => 8,
        }
    }
}

/// Method coils per device, relative to `(device_id - 1) * 2`.
fn coil_for_method(name: &str) -> Option<u16> {
    match name {
        "EmergencyStop" => Some(0),
        "ResetErrorStatus" => Some(1),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegisterLayout {
    pub block_size: u16,
}

impl RegisterLayout {
    fn register_address(&self, device_id: u32, register: Register) -> Option<u16> {
        let base = u64::from(device_id.checked_sub(1)?) * u64::from(self.block_size);
        let last = base + u64::from(register.offset()) + u64::from(register.width()) - 1;
        u16::try_from(last).ok()?;
        u16::try_from(base + u64::from(register.offset())).ok()
    }

    fn coil_address(&self, device_id: u32, coil: u16) -> Option<u16> {
        let base = u64::from(device_id.checked_sub(1)?) * 2;
        u16::try_from(base + u64::from(coil)).ok()
    }
}

enum Link {
    Disconnected,
    Connected(Context),
    Broken,
}

/// [`DeviceClient`] over Modbus/TCP. Node ids of the form `Device <id>/<Attribute>` are mapped
/// onto holding registers and method coils.
pub struct ModbusDeviceClient {
    addr: SocketAddr,
    unit_id: Option<u8>,
    layout: RegisterLayout,
    io_timeout: Duration,
    link: Mutex<Link>,
}

impl ModbusDeviceClient {
    pub fn new(
        addr: SocketAddr,
        unit_id: Option<u8>,
        layout: RegisterLayout,
        io_timeout: Duration,
    ) -> Self {
        Self {
            addr,
            unit_id,
            layout,
            io_timeout,
            link: Mutex::new(Link::Disconnected),
        }
    }

    pub async fn connect(&self) -> Result<(), DeviceError> {
        let ctx = self.open().await?;
        *self.link.lock().await = Link::Connected(ctx);
        tracing::info!(addr = %self.addr, "connected to device endpoint");
        Ok(())
    }

    pub async fn disconnect(&self) {
        *self.link.lock().await = Link::Disconnected;
        tracing::info!(addr = %self.addr, "disconnected from device endpoint");
    }

    async fn open(&self) -> Result<Context, DeviceError> {
        let connect = async {
            match self.unit_id {
                Some(unit) => {
                    tokio_modbus::client::tcp::connect_slave(
                        self.addr,
                        tokio_modbus::slave::Slave(unit),
                    )
                    .await
                }
                None => tokio_modbus::client::tcp::connect(self.addr).await,
            }
        };
        Ok(timeout(self.io_timeout, connect)
            .await
            .map_err(|_| DeviceError::Timeout)??)
    }

    /// A link dropped by an I/O failure is re-opened on next use; a link that was never opened
    /// (or was closed on purpose) fails fast.
    async fn ensure_connected<'a>(&self, link: &'a mut Link) -> Result<&'a mut Context, DeviceError> {
        if matches!(link, Link::Broken) {
            tracing::info!(addr = %self.addr, "reconnecting to device endpoint");
            *link = Link::Connected(self.open().await?);
        }
        match link {
            Link::Connected(ctx) => Ok(ctx),
            _ => Err(DeviceError::NotConnected),
        }
    }

    fn settle<T>(
        link: &mut Link,
        result: Result<io::Result<T>, Elapsed>,
    ) -> Result<T, DeviceError> {
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                *link = Link::Broken;
                Err(DeviceError::Io(err))
            }
            Err(_) => {
                *link = Link::Broken;
                Err(DeviceError::Timeout)
            }
        }
    }

    async fn read_registers(&self, addr: u16, count: u16) -> Result<Vec<u16>, DeviceError> {
        let mut link = self.link.lock().await;
        let ctx = self.ensure_connected(&mut link).await?;
        let result = timeout(self.io_timeout, ctx.read_holding_registers(addr, count)).await;
        Self::settle(&mut link, result)
    }

    async fn write_register(&self, addr: u16, word: u16) -> Result<(), DeviceError> {
        let mut link = self.link.lock().await;
        let ctx = self.ensure_connected(&mut link).await?;
        let result = timeout(self.io_timeout, ctx.write_single_register(addr, word)).await;
        Self::settle(&mut link, result)
    }

    async fn pulse_coil(&self, addr: u16) -> Result<(), DeviceError> {
        let mut link = self.link.lock().await;
        let ctx = self.ensure_connected(&mut link).await?;
        let result = timeout(self.io_timeout, ctx.write_single_coil(addr, true)).await;
        Self::settle(&mut link, result)
    }

    fn resolve(&self, node: &NodeId) -> Result<(Register, u16), DeviceError> {
        let (device_id, name) = node
            .device_attribute()
            .ok_or_else(|| DeviceError::UnknownNode(node.clone()))?;
        let register =
            Register::for_attribute(name).ok_or_else(|| DeviceError::UnknownNode(node.clone()))?;
        let addr = self
            .layout
            .register_address(device_id, register)
            .ok_or_else(|| DeviceError::UnknownNode(node.clone()))?;
        Ok((register, addr))
    }
}

#[async_trait]
impl DeviceClient for ModbusDeviceClient {
    async fn read_node(&self, node: &NodeId) -> Result<NodeValue, DeviceError> {
        let (register, addr) = self.resolve(node)?;
        let words = self.read_registers(addr, register.width()).await?;
        decode_register(register, &words).ok_or_else(|| DeviceError::BadValue {
            node: node.clone(),
            detail: format!("expected {} registers, got {}", register.width(), words.len()),
        })
    }

    async fn write_node(&self, node: &NodeId, value: NodeValue) -> Result<(), DeviceError> {
        let (register, addr) = self.resolve(node)?;
        let word = match (register, &value) {
            (Register::U16(_), NodeValue::Int(raw)) => u16::try_from(*raw).ok(),
            _ => None,
        }
        .ok_or_else(|| DeviceError::BadValue {
            node: node.clone(),
            detail: format!("{value:?} cannot be written to this node"),
        })?;
        self.write_register(addr, word).await
    }

    async fn call_method(&self, object: &NodeId, method: &NodeId) -> Result<(), DeviceError> {
        let (device_id, name) = method
            .device_attribute()
            .ok_or_else(|| DeviceError::UnknownNode(method.clone()))?;
        if NodeId::device(device_id) != *object {
            return Err(DeviceError::UnknownNode(method.clone()));
        }
        let addr = coil_for_method(name)
            .and_then(|coil| self.layout.coil_address(device_id, coil))
            .ok_or_else(|| DeviceError::UnknownNode(method.clone()))?;
        self.pulse_coil(addr).await
    }
}

fn decode_register(register: Register, words: &[u16]) -> Option<NodeValue> {
    if words.len() != usize::from(register.width()) {
        return None;
    }
    Some(match register {
        Register::U16(_) => NodeValue::Int(i64::from(words[0])),
        // Counters are u64 on the wire; values past i64::MAX surface as negative and are
        // rejected by the reader.
        Register::U64(_) => NodeValue::Int(words_to_u64(words) as i64),
        Register::F64(_) => NodeValue::Float(f64::from_bits(words_to_u64(words))),
        Register::Uuid(_) => NodeValue::Text(words_to_workorder(words)),
    })
}

fn words_to_u64(words: &[u16]) -> u64 {
    words
        .iter()
        .fold(0u64, |acc, word| (acc << 16) | u64::from(*word))
}

fn words_to_workorder(words: &[u16]) -> String {
    if words.iter().all(|word| *word == 0) {
        return String::new();
    }
    let mut bytes = [0u8; 16];
    for (chunk, word) in bytes.chunks_exact_mut(2).zip(words) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    Uuid::from_bytes(bytes).to_string()
}
