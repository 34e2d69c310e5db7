use crate::anomaly::AnomalyDetector;
use crate::model::{DeviceErrorMessage, DeviceErrors, ProductionStatus, TelemetryMessage};
use crate::stats::ProcessorStats;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("malformed payload: {0}")]
    Malformed(#[from] simd_json::Error),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("invalid {field}: {detail}")]
    InvalidField { field: &'static str, detail: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Error(DeviceErrorMessage),
    Telemetry(TelemetryMessage),
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    ErrorEvent,
    Telemetry,
    Unknown,
    Dropped,
}

/// Union of every field either message kind may carry. `null` decodes as absent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default, alias = "DeviceId")]
    device_id: Option<u32>,
    #[serde(default, alias = "ErrorFlags")]
    error_flags: Option<DeviceErrors>,
    #[serde(default, alias = "ProductionStatus")]
    production_status: Option<ProductionStatus>,
    #[serde(default, alias = "WorkorderId")]
    workorder_id: Option<String>,
    #[serde(default, alias = "GoodCount")]
    good_count: Option<u64>,
    #[serde(default, alias = "BadCount")]
    bad_count: Option<u64>,
    #[serde(default, alias = "Temperature")]
    temperature: Option<f64>,
    #[serde(default, alias = "Timestamp")]
    timestamp: Option<WireTimestamp>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Str(String),
    Int(i64),
    Float(f64),
}

impl WireTimestamp {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            WireTimestamp::Str(raw) => DateTime::parse_from_rfc3339(raw.trim())
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            WireTimestamp::Int(ms) => Utc.timestamp_millis_opt(*ms).single(),
            WireTimestamp::Float(secs) => Utc.timestamp_millis_opt((*secs * 1000.0) as i64).single(),
        }
    }
}

/// Decides the message kind by which discriminator is present: `errorFlags` wins over
/// `productionStatus`. The buffer is parsed in place and is garbage afterwards.
pub fn classify(payload: &mut [u8]) -> Result<InboundEvent, RouteError> {
    let first = payload.iter().copied().find(|byte| !byte.is_ascii_whitespace());
    if first != Some(b'{') {
        return Err(RouteError::NotAnObject);
    }
    let envelope: Envelope = simd_json::serde::from_slice(payload)?;
    let timestamp = envelope.timestamp.as_ref().and_then(WireTimestamp::to_datetime);

    if let Some(error_flags) = envelope.error_flags {
        let device_id = envelope.device_id.ok_or(RouteError::MissingField("deviceId"))?;
        return Ok(InboundEvent::Error(DeviceErrorMessage {
            device_id,
            error_flags,
            timestamp,
        }));
    }

    if let Some(production_status) = envelope.production_status {
        let device_id = envelope.device_id.ok_or(RouteError::MissingField("deviceId"))?;
        let workorder_id = match envelope.workorder_id.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(Uuid::parse_str(raw).map_err(|err| RouteError::InvalidField {
                field: "workorderId",
                detail: err.to_string(),
            })?),
        };
        return Ok(InboundEvent::Telemetry(TelemetryMessage {
            device_id,
            production_status,
            workorder_id: workorder_id.filter(|id| !id.is_nil()),
            good_count: envelope.good_count.unwrap_or_default(),
            bad_count: envelope.bad_count.unwrap_or_default(),
            temperature: envelope.temperature.unwrap_or_default(),
            timestamp,
        }));
    }

    Ok(InboundEvent::Unknown)
}

/// Entry point for device-to-cloud events.
pub struct EventRouter {
    detector: Arc<AnomalyDetector>,
    stats: Arc<ProcessorStats>,
}

impl EventRouter {
    pub fn new(detector: Arc<AnomalyDetector>, stats: Arc<ProcessorStats>) -> Self {
        Self { detector, stats }
    }

    pub async fn route(&self, source: &str, payload: &mut [u8]) -> Routed {
        let bytes = payload.len();
        match classify(payload) {
            Ok(InboundEvent::Error(message)) => {
                self.stats.record_routed_error();
                tracing::debug!(
                    device_id = message.device_id,
                    flags = %message.error_flags,
                    reported_at = ?message.timestamp,
                    "error event received"
                );
                if let Err(err) = self
                    .detector
                    .on_error(message.device_id, message.error_flags, Utc::now())
                    .await
                {
                    tracing::error!(
                        device_id = message.device_id,
                        error = %err,
                        "error event handling failed"
                    );
                }
                Routed::ErrorEvent
            }
            Ok(InboundEvent::Telemetry(telemetry)) => {
                self.stats.record_routed_telemetry();
                tracing::info!(
                    device_id = telemetry.device_id,
                    status = %telemetry.production_status,
                    temperature = telemetry.temperature,
                    good = telemetry.good_count,
                    bad = telemetry.bad_count,
                    workorder = ?telemetry.workorder_id,
                    timestamp = ?telemetry.timestamp,
                    "telemetry received"
                );
                Routed::Telemetry
            }
            Ok(InboundEvent::Unknown) => {
                self.stats.record_dropped();
                tracing::warn!(source, bytes, "unknown message type; dropped");
                Routed::Unknown
            }
            Err(err) => {
                self.stats.record_dropped();
                tracing::warn!(source, bytes, error = %err, "invalid inbound message; dropped");
                Routed::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{ErrorWindowStore, TriggerPolicy};
    use crate::commands::CommandPath;
    use crate::test_support::FakeDeviceService;
    use std::time::Duration;

    fn classify_str(raw: &str) -> Result<InboundEvent, RouteError> {
        let mut bytes = raw.as_bytes().to_vec();
        classify(&mut bytes)
    }

    #[test]
    fn error_flags_field_wins() {
        let event = classify_str(r#"{"deviceId":3,"errorFlags":2,"productionStatus":1}"#).unwrap();
        match event {
            InboundEvent::Error(message) => {
                assert_eq!(message.device_id, 3);
                assert_eq!(message.error_flags, DeviceErrors::POWER_FAILURE);
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn pascal_case_and_string_flags_are_accepted() {
        let event =
            classify_str(r#"{"DeviceId":5,"ErrorFlags":"EmergencyStop, Unknown","Timestamp":"2024-05-01T12:00:00Z"}"#)
                .unwrap();
        let InboundEvent::Error(message) = event else {
            panic!("expected error event");
        };
        assert_eq!(message.error_flags, DeviceErrors::EMERGENCY_STOP | DeviceErrors::UNKNOWN);
        assert!(message.timestamp.is_some());
    }

    #[test]
    fn null_discriminator_counts_as_absent() {
        let event = classify_str(
            r#"{"deviceId":1,"errorFlags":null,"productionStatus":1,"workorderId":null,
                "goodCount":10,"badCount":1,"temperature":70.5,"timestamp":1714564800000}"#,
        )
        .unwrap();
        let InboundEvent::Telemetry(telemetry) = event else {
            panic!("expected telemetry");
        };
        assert_eq!(telemetry.production_status, ProductionStatus::Running);
        assert_eq!(telemetry.workorder_id, None);
        assert_eq!(telemetry.good_count, 10);
        assert_eq!(
            telemetry.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn payload_without_discriminator_is_unknown() {
        assert_eq!(classify_str(r#"{"deviceId":1,"temperature":3.0}"#).unwrap(), InboundEvent::Unknown);
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(classify_str("not json"), Err(RouteError::NotAnObject)));
        assert!(matches!(classify_str("[1,2]"), Err(RouteError::NotAnObject)));
        assert!(matches!(classify_str("{\"deviceId\":"), Err(RouteError::Malformed(_))));
        assert!(matches!(
            classify_str(r#"{"deviceId":1,"errorFlags":"Overheat"}"#),
            Err(RouteError::Malformed(_))
        ));
        assert!(matches!(
            classify_str(r#"{"errorFlags":1}"#),
            Err(RouteError::MissingField("deviceId"))
        ));
        assert!(matches!(
            classify_str(r#"{"deviceId":1,"productionStatus":0,"workorderId":"nope"}"#),
            Err(RouteError::InvalidField { field: "workorderId", .. })
        ));
    }

    fn router_with(service: &Arc<FakeDeviceService>) -> (EventRouter, Arc<ProcessorStats>) {
        let stats = Arc::new(ProcessorStats::new());
        let commands = CommandPath::new(service.clone(), "device{id}", Duration::from_secs(30));
        let detector = Arc::new(AnomalyDetector::new(
            ErrorWindowStore::new(),
            commands,
            TriggerPolicy::EveryErrorAboveThreshold,
            stats.clone(),
        ));
        (EventRouter::new(detector, stats.clone()), stats)
    }

    #[tokio::test]
    async fn error_payload_reaches_detector() {
        let service = Arc::new(FakeDeviceService::default());
        let (router, stats) = router_with(&service);

        let mut payload = br#"{"deviceId":7,"errorFlags":4}"#.to_vec();
        assert_eq!(router.route("device7", &mut payload).await, Routed::ErrorEvent);

        let sent = service.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].device, "device7");
        assert_eq!(sent[0].body["errorType"], serde_json::json!("SensorFailure"));
        assert_eq!(stats.snapshot().routed_errors, 1);
    }

    #[tokio::test]
    async fn unknown_and_malformed_are_dropped() {
        let service = Arc::new(FakeDeviceService::default());
        let (router, stats) = router_with(&service);

        let mut unknown = br#"{"hello":"world"}"#.to_vec();
        assert_eq!(router.route("device1", &mut unknown).await, Routed::Unknown);
        let mut broken = b"{oops".to_vec();
        assert_eq!(router.route("device1", &mut broken).await, Routed::Dropped);
        let mut telemetry = br#"{"deviceId":1,"productionStatus":0}"#.to_vec();
        assert_eq!(router.route("device1", &mut telemetry).await, Routed::Telemetry);

        assert!(service.sent().is_empty());
        assert!(service.invocations().is_empty());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.dropped, 2);
        assert_eq!(snapshot.routed_telemetry, 1);
    }
}
