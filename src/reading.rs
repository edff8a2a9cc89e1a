//! Reading model shared by the parser, the local log and the uplink.
//!
//! A [`Reading`] is created once per well-formed serial line and never
//! modified afterwards. The log wraps it in a [`LoggedReading`] carrying the
//! assigned sequence id and the current [`DeliveryState`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Lower bound of the valid pH domain.
pub const PH_MIN: f64 = 0.0;

/// Upper bound of the valid pH domain.
pub const PH_MAX: f64 = 14.0;

/// One pH measurement as received from the sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Arrival time at the ingesting process
    pub timestamp: DateTime<Utc>,

    /// Device uptime counter at measurement time
    pub device_millis: u64,

    /// Measured pH value
    pub ph_value: f64,
}

impl Reading {
    /// Create a new reading.
    pub fn new(timestamp: DateTime<Utc>, device_millis: u64, ph_value: f64) -> Self {
        Self {
            timestamp,
            device_millis,
            ph_value,
        }
    }

    /// Whether the value lies inside the physical pH range.
    ///
    /// Out-of-range values are kept; sensor drift produces transient noise
    /// that is flagged rather than rejected.
    pub fn is_in_range(&self) -> bool {
        (PH_MIN..=PH_MAX).contains(&self.ph_value)
    }

    /// ISO-8601 UTC timestamp as sent to the collector.
    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// Remote forwarding status of a logged reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    FailedPermanent,
}

impl DeliveryState {
    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryState::Pending)
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryState::Pending => write!(f, "pending"),
            DeliveryState::Delivered => write!(f, "delivered"),
            DeliveryState::FailedPermanent => write!(f, "failed-permanent"),
        }
    }
}

/// A reading together with its log identity and delivery state.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedReading {
    pub sequence_id: u64,
    pub reading: Reading,
    pub state: DeliveryState,
}
