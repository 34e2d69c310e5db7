use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::ops::BitOr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u8")]
pub enum ProductionStatus {
    Stopped = 0,
    Running = 1,
}

impl ProductionStatus {
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Self::Stopped),
            1 => Some(Self::Running),
            _ => None,
        }
    }
}

impl From<ProductionStatus> for u8 {
    fn from(status: ProductionStatus) -> Self {
        status as u8
    }
}

/// Device error bitset. Bit values are part of the wire format and must not change.
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

    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL_BITS)
    }

    /// Interprets a raw device register. Bits outside the known set are folded into `UNKNOWN`.
    pub fn from_device_bits(raw: u16) -> Self {
        let known = Self::from_bits_truncate((raw & Self::ALL_BITS as u16) as u8);
        if raw & !(Self::ALL_BITS as u16) != 0 {
            known | Self::UNKNOWN
        } else {
            known
        }
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
        let mut first = true;
        for (flag, name) in Self::NAMED {
            if self.contains(flag) {
                if !first {
                    f.write_str(", ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub device_id: u32,
    pub production_status: ProductionStatus,
    pub workorder_id: Option<Uuid>,
    pub good_count: u64,
    pub bad_count: u64,
    pub temperature: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub device_id: u32,
    pub production_rate: u8,
    pub error_flags: DeviceErrors,
    pub last_updated: DateTime<Utc>,
}

impl DeviceState {
    /// Whether this state differs from `previous` in a field mirrored to the shadow.
    /// `last_updated` is not compared.
    pub fn differs_from(&self, previous: &DeviceState) -> bool {
        self.production_rate != previous.production_rate
            || self.error_flags != previous.error_flags
    }

    pub fn shadow_patch(&self) -> ShadowPatch {
        ShadowPatch {
            production_rate: self.production_rate,
            device_errors: self.error_flags.to_string(),
            last_updated: self.last_updated,
        }
    }
}

/// Reported-properties patch. Exactly these three fields are sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowPatch {
    pub production_rate: u8,
    pub device_errors: String,
    pub last_updated: DateTime<Utc>,
}
