use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use uuid::Uuid;

/// Device error bitset as carried on the wire (bits 1, 2, 4, 8).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "u8")]
pub struct DeviceErrors(u8);

impl DeviceErrors {
    pub const NONE: Self = Self(0);
    pub const EMERGENCY_STOP: Self = Self(1);
    pub const POWER_FAILURE: Self = Self(2);
    pub const SENSOR_FAILURE: Self = Self(4);
    pub const UNKNOWN: Self = Self(8);

    const NAMED: [(Self, &'static str); 4] = [
        (Self::EMERGENCY_STOP, "EmergencyStop"),
        (Self::POWER_FAILURE, "PowerFailure"),
        (Self::SENSOR_FAILURE, "SensorFailure"),
        (Self::UNKNOWN, "Unknown"),
    ];
    const ALL_BITS: u8 = 0x0f;

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Option<Self> {
        u8::try_from(bits)
            .ok()
            .filter(|bits| bits & !Self::ALL_BITS == 0)
            .map(Self)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DeviceErrors {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DeviceErrors {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<DeviceErrors> for u8 {
    fn from(errors: DeviceErrors) -> Self {
        errors.0
    }
}

impl fmt::Display for DeviceErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFlagsError(String);

impl fmt::Display for ParseFlagsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognised error flag {:?}", self.0)
    }
}

impl std::error::Error for ParseFlagsError {}

impl FromStr for DeviceErrors {
    type Err = ParseFlagsError;

    /// Accepts the rendered form (`"PowerFailure, SensorFailure"`, `"None"`) or a decimal bitset.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if let Ok(bits) = trimmed.parse::<u64>() {
            return Self::from_bits(bits).ok_or_else(|| ParseFlagsError(raw.to_string()));
        }
        let mut flags = Self::NONE;
        for part in trimmed.split(',').map(str::trim) {
            if part.eq_ignore_ascii_case("None") {
                continue;
            }
            let (flag, _) = Self::NAMED
                .iter()
                .find(|(_, name)| name.eq_ignore_ascii_case(part))
                .ok_or_else(|| ParseFlagsError(part.to_string()))?;
            flags |= *flag;
        }
        Ok(flags)
    }
}

impl<'de> Deserialize<'de> for DeviceErrors {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Bits(u64),
            Text(String),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Bits(bits) => Self::from_bits(bits)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid error bitset {bits}"))),
            Wire::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u8")]
pub enum ProductionStatus {
    Stopped = 0,
    Running = 1,
}

impl From<ProductionStatus> for u8 {
    fn from(status: ProductionStatus) -> Self {
        status as u8
    }
}

impl fmt::Display for ProductionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductionStatus::Stopped => f.write_str("Stopped"),
            ProductionStatus::Running => f.write_str("Running"),
        }
    }
}

impl<'de> Deserialize<'de> for ProductionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Code(u64),
            Name(String),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Code(0) => Ok(ProductionStatus::Stopped),
            Wire::Code(1) => Ok(ProductionStatus::Running),
            Wire::Name(name) if name.eq_ignore_ascii_case("Stopped") => Ok(ProductionStatus::Stopped),
            Wire::Name(name) if name.eq_ignore_ascii_case("Running") => Ok(ProductionStatus::Running),
            _ => Err(serde::de::Error::custom("unknown production status")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub device_id: u32,
    pub production_status: ProductionStatus,
    pub workorder_id: Option<Uuid>,
    pub good_count: u64,
    pub bad_count: u64,
    pub temperature: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceErrorMessage {
    pub device_id: u32,
    pub error_flags: DeviceErrors,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Error notification pushed back to the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceErrorEvent {
    pub device_id: u32,
    pub error_type: String,
    pub error_flags: DeviceErrors,
    pub error_code: u8,
    pub timestamp: DateTime<Utc>,
}

impl DeviceErrorEvent {
    pub fn new(device_id: u32, error_flags: DeviceErrors, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id,
            error_type: error_flags.to_string(),
            error_flags,
            error_code: error_flags.bits(),
            timestamp,
        }
    }
}

/// One efficiency summary over a production window.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiSample {
    #[serde(alias = "DeviceId")]
    pub device_id: u32,
    #[serde(alias = "GoodProductionPercentage")]
    pub good_production_percentage: f64,
    #[serde(default, alias = "TotalGoodCount")]
    pub total_good_count: u64,
    #[serde(default, alias = "TotalBadCount")]
    pub total_bad_count: u64,
    #[serde(alias = "WindowStart")]
    pub window_start: DateTime<Utc>,
    #[serde(alias = "WindowEnd")]
    pub window_end: DateTime<Utc>,
}
