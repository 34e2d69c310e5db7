use crate::anomaly::TriggerPolicy;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

fn setup_config_path() -> Option<PathBuf> {
    env::var("LINE_FUNCTIONS_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

/// Site-wide settings file written by the line installer. Environment variables take precedence.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    device_id_template: Option<String>,
    #[serde(default)]
    estop_trigger_policy: Option<String>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "line-functions failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "line-functions failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn env_is_set(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_some()
}

fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_is_set: impl Fn(&str) -> bool,
) -> Result<()> {
    if !env_is_set("LINE_MQTT_URL") {
        if let Some(host) = non_empty(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if !env_is_set("LINE_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_empty(Some(username));
        }
    }
    if !env_is_set("LINE_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_empty(Some(password));
        }
    }
    if !env_is_set("LINE_MQTT_TOPIC_PREFIX") {
        if let Some(prefix) = non_empty(overrides.mqtt_topic_prefix.as_deref()) {
            config.mqtt_topic_prefix = prefix;
        }
    }
    if !env_is_set("LINE_DEVICE_ID_TEMPLATE") {
        if let Some(template) = non_empty(overrides.device_id_template.as_deref()) {
            config.device_id_template = template;
        }
    }
    if !env_is_set("LINE_ESTOP_TRIGGER_POLICY") {
        if let Some(policy) = non_empty(overrides.estop_trigger_policy.as_deref()) {
            config.trigger_policy = policy
                .parse()
                .map_err(|err: String| anyhow!("setup config estop_trigger_policy: {err}"))?;
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub device_id_template: String,
    pub trigger_policy: TriggerPolicy,
    pub method_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let mqtt_url =
            env::var("LINE_MQTT_URL").unwrap_or_else(|_| "mqtt://127.0.0.1:1883".to_string());
        let url = Url::parse(mqtt_url.trim()).context("invalid LINE_MQTT_URL")?;
        let mqtt_host = url
            .host_str()
            .ok_or_else(|| anyhow!("LINE_MQTT_URL missing host"))?
            .to_string();
        let mqtt_port = url.port().unwrap_or(1883);
        let mqtt_username = non_empty(env::var("LINE_MQTT_USERNAME").ok().as_deref());
        let mqtt_password = non_empty(env::var("LINE_MQTT_PASSWORD").ok().as_deref());
        let mqtt_topic_prefix =
            env::var("LINE_MQTT_TOPIC_PREFIX").unwrap_or_else(|_| "factory".to_string());
        let mqtt_keepalive_secs = env::var("LINE_MQTT_KEEPALIVE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(30);
        let mqtt_client_id = env::var("LINE_FUNCTIONS_MQTT_CLIENT_ID")
            .unwrap_or_else(|_| format!("line-functions-{}", std::process::id()));

        let device_id_template =
            env::var("LINE_DEVICE_ID_TEMPLATE").unwrap_or_else(|_| "device{id}".to_string());
        let trigger_policy = match env::var("LINE_ESTOP_TRIGGER_POLICY") {
            Ok(raw) => raw
                .parse::<TriggerPolicy>()
                .map_err(|err| anyhow!("LINE_ESTOP_TRIGGER_POLICY: {err}"))?,
            Err(_) => TriggerPolicy::default(),
        };
        let method_timeout_secs = env::var("LINE_METHOD_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(30);
        let sweep_interval_secs = env::var("LINE_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(60);

        let mut config = Self {
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            device_id_template,
            trigger_policy,
            method_timeout_secs,
            sweep_interval_secs,
        };

        if let Some(overrides) = load_setup_config_overrides() {
            apply_setup_overrides(&mut config, &overrides, env_is_set)?;
        }

        Ok(config)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn method_timeout(&self) -> Duration {
        Duration::from_secs(self.method_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
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

    fn overrides(raw: &str) -> SetupConfigOverrides {
        let mut bytes = raw.as_bytes().to_vec();
        simd_json::serde::from_slice(&mut bytes).unwrap()
    }

    #[test]
    fn setup_file_fills_unset_values() {
        let mut config = base();
        let file = overrides(
            r#"{"mqtt_host":"broker.plant","mqtt_port":8883,"mqtt_username":" ops ",
                "device_id_template":"press-{id}","estop_trigger_policy":"once"}"#,
        );
        apply_setup_overrides(&mut config, &file, |_| false).unwrap();

        assert_eq!(config.mqtt_host, "broker.plant");
        assert_eq!(config.mqtt_port, 8883);
        assert_eq!(config.mqtt_username.as_deref(), Some("ops"));
        assert_eq!(config.device_id_template, "press-{id}");
        assert_eq!(config.trigger_policy, TriggerPolicy::OncePerCrossing);
    }

    #[test]
    fn environment_wins_over_setup_file() {
        let mut config = base();
        let file = overrides(r#"{"mqtt_host":"broker.plant","mqtt_topic_prefix":"plant"}"#);
        apply_setup_overrides(&mut config, &file, |key| key == "LINE_MQTT_URL").unwrap();

        assert_eq!(config.mqtt_host, "127.0.0.1");
        assert_eq!(config.mqtt_topic_prefix, "plant");
    }

    #[test]
    fn invalid_policy_in_setup_file_is_rejected() {
        let mut config = base();
        let file = overrides(r#"{"estop_trigger_policy":"sometimes"}"#);
        assert!(apply_setup_overrides(&mut config, &file, |_| false).is_err());
    }
}
