mod anomaly;
mod commands;
mod config;
mod kpi;
mod model;
mod mqtt;
mod router;
mod stats;

#[cfg(test)]
mod test_support;

use crate::anomaly::{AnomalyDetector, ErrorWindowStore};
use crate::commands::CommandPath;
use crate::config::Config;
use crate::kpi::KpiEvaluator;
use crate::mqtt::MqttDeviceService;
use crate::router::EventRouter;
use crate::stats::ProcessorStats;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,line_functions=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let stats = Arc::new(ProcessorStats::new());
    let cancel = CancellationToken::new();

    let (service, eventloop) = MqttDeviceService::connect(&config);
    let commands = CommandPath::new(
        service.clone(),
        config.device_id_template.clone(),
        config.method_timeout(),
    );
    let detector = Arc::new(AnomalyDetector::new(
        ErrorWindowStore::new(),
        commands.clone(),
        config.trigger_policy,
        stats.clone(),
    ));
    let router = Arc::new(EventRouter::new(detector.clone(), stats.clone()));
    let kpi = Arc::new(KpiEvaluator::new(commands, stats.clone()));

    tracing::info!(
        host = %config.mqtt_host,
        port = config.mqtt_port,
        prefix = %config.mqtt_topic_prefix,
        policy = ?config.trigger_policy,
        "line-functions starting"
    );

    let mut listener_handle = tokio::spawn(mqtt::run_listener(
        eventloop,
        service.clone(),
        router,
        kpi,
        stats.clone(),
        cancel.clone(),
    ));

    let sweep_cancel = cancel.clone();
    let sweep_interval = config.sweep_interval();
    let sweep_stats = stats.clone();
    let sweep_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = sweep_cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            detector.sweep(Utc::now());
            let snapshot = sweep_stats.snapshot();
            tracing::info!(
                routed_telemetry = snapshot.routed_telemetry,
                routed_errors = snapshot.routed_errors,
                dropped = snapshot.dropped,
                emergency_stops = snapshot.emergency_stops,
                rate_decreases = snapshot.rate_decreases,
                active_devices = snapshot.active_devices,
                mqtt_connected = snapshot.mqtt_connected,
                "processor stats"
            );
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        res = &mut listener_handle => {
            tracing::warn!(result = ?res, "MQTT listener exited");
        }
    }

    cancel.cancel();
    service.disconnect();
    if !listener_handle.is_finished() {
        listener_handle.await.ok();
    }
    sweep_handle.await.ok();
    tracing::info!("line-functions stopped");

    Ok(())
}
