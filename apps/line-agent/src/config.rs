use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

const DEFAULT_TELEMETRY_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    pub device_id: u32,
    pub device_name: String,
    pub telemetry_interval: Duration,

    pub device_endpoint: SocketAddr,
    pub modbus_unit_id: Option<u8>,
    pub register_block_size: u16,
    pub device_io_timeout: Duration,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_client_id: String,

    pub http_bind: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let device_id = env_u64("LINE_AGENT_DEVICE_ID", None)?;
        if device_id == 0 || device_id > u32::MAX as u64 {
            bail!("LINE_AGENT_DEVICE_ID must be a positive 32-bit integer");
        }
        let device_id = device_id as u32;

        let template = env_string("LINE_DEVICE_ID_TEMPLATE", Some("device{id}".to_string()))?;
        let device_name = format_device_name(&template, device_id);

        let interval_ms = env_u64(
            "LINE_AGENT_TELEMETRY_INTERVAL_MS",
            Some(DEFAULT_TELEMETRY_INTERVAL_MS),
        )?;
        let telemetry_interval = Duration::from_millis(if interval_ms == 0 {
            DEFAULT_TELEMETRY_INTERVAL_MS
        } else {
            interval_ms
        });

        let device_endpoint = env_string("LINE_AGENT_DEVICE_ENDPOINT", None)?
            .parse::<SocketAddr>()
            .context("invalid LINE_AGENT_DEVICE_ENDPOINT (expected host:port)")?;
        let modbus_unit_id = match env_optional("LINE_AGENT_MODBUS_UNIT_ID") {
            Some(raw) => Some(
                raw.parse::<u8>()
                    .context("invalid LINE_AGENT_MODBUS_UNIT_ID")?,
            ),
            None => None,
        };
        let register_block_size = env_u64("LINE_AGENT_REGISTER_BLOCK_SIZE", Some(64))?;
        let register_block_size = u16::try_from(register_block_size)
            .ok()
            .filter(|size| *size >= 23)
            .ok_or_else(|| anyhow!("LINE_AGENT_REGISTER_BLOCK_SIZE must be within 23..=65535"))?;
        let device_io_timeout =
            Duration::from_millis(env_u64("LINE_AGENT_DEVICE_TIMEOUT_MS", Some(5000))?);

        let mqtt_url = env_string("LINE_MQTT_URL", Some("mqtt://127.0.0.1:1883".to_string()))?;
        let url = Url::parse(&mqtt_url).context("invalid LINE_MQTT_URL")?;
        let mqtt_host = url
            .host_str()
            .ok_or_else(|| anyhow!("LINE_MQTT_URL missing host"))?
            .to_string();
        let mqtt_port = url.port().unwrap_or(1883);
        let mqtt_username = env_optional("LINE_MQTT_USERNAME");
        let mqtt_password = env_optional("LINE_MQTT_PASSWORD");
        let mqtt_topic_prefix = env_string("LINE_MQTT_TOPIC_PREFIX", Some("factory".to_string()))?;
        let mqtt_client_id = env_string(
            "LINE_AGENT_MQTT_CLIENT_ID",
            Some(format!("line-agent-{}", device_name)),
        )?;

        let http_bind = env_string("LINE_AGENT_HTTP_BIND", Some("127.0.0.1:9102".to_string()))?;

        Ok(Self {
            device_id,
            device_name,
            telemetry_interval,
            device_endpoint,
            modbus_unit_id,
            register_block_size,
            device_io_timeout,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_client_id,
            http_bind,
        })
    }
}

/// Maps a numeric device id onto its cloud identity, e.g. `device{id}` -> `device3`.
pub fn format_device_name(template: &str, device_id: u32) -> String {
    template.replace("{id}", &device_id.to_string())
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
