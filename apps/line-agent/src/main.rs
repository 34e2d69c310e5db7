mod bridge;
mod cloud;
mod config;
mod device;
mod http;
mod model;
mod mqtt;
mod stats;
mod sync_loop;

#[cfg(test)]
mod test_support;

use crate::bridge::CloudBridge;
use crate::config::Config;
use crate::device::{ModbusDeviceClient, RegisterLayout};
use crate::mqtt::MqttCloudClient;
use crate::stats::AgentStats;
use crate::sync_loop::SyncLoop;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,line_agent=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let device = Arc::new(ModbusDeviceClient::new(
        config.device_endpoint,
        config.modbus_unit_id,
        RegisterLayout {
            block_size: config.register_block_size,
        },
        config.device_io_timeout,
    ));
    device
        .connect()
        .await
        .with_context(|| format!("connect to device endpoint {}", config.device_endpoint))?;

    let stats = Arc::new(AgentStats::new());
    let cancel = CancellationToken::new();

    let (cloud, eventloop) = MqttCloudClient::connect(&config);
    let bridge = Arc::new(CloudBridge::new(
        config.device_id,
        Arc::new(cloud.clone()),
        device.clone(),
    ));

    let mqtt_handle = tokio::spawn(mqtt::run_inbound(
        eventloop,
        cloud.clone(),
        bridge.clone(),
        stats.clone(),
        cancel.clone(),
    ));

    let sync = SyncLoop::new(bridge, config.telemetry_interval, stats.clone());
    let sync_cancel = cancel.clone();
    let mut sync_handle = tokio::spawn(async move { sync.run(sync_cancel).await });

    let app = http::router(http::HttpState {
        device_id: config.device_id,
        stats,
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(
        bind = %config.http_bind,
        device = %config.device_name,
        "line-agent HTTP listening"
    );
    let http_cancel = cancel.clone();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
            .ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        res = &mut sync_handle => {
            tracing::warn!(result = ?res, "sync loop exited");
        }
    }

    cancel.cancel();
    cloud.disconnect();
    if !sync_handle.is_finished() {
        if let Ok(state) = sync_handle.await {
            tracing::debug!(state = ?state, "sync loop joined");
        }
    }
    mqtt_handle.await.ok();
    http_handle.await.ok();
    device.disconnect().await;
    tracing::info!("line-agent stopped");

    Ok(())
}
