//! Line parser for the sensor's serial protocol.
//!
//! The device emits reading lines of the form `pH,<millis>,<value>` and
//! free-text diagnostic lines (boot banners, calibration notices). Parsing
//! is pure: the arrival time is supplied by the caller.

use chrono::{DateTime, Utc};

use crate::reading::Reading;

/// Protocol tag of a reading line.
pub const READING_TAG: &str = "pH";

/// Number of comma-separated fields in a reading line.
const READING_FIELDS: usize = 3;

/// Classification of a successfully parsed line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// A well-formed reading
    Reading(Reading),

    /// Non-reading device output, kept for observability only
    Diagnostic(String),

    /// Blank line, nothing to do
    Empty,
}

/// Why a record-shaped line was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MalformedFields,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MalformedFields => "malformed-fields",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A line that looked like a record but could not become a reading.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub reason: RejectReason,
    pub line: String,
    pub detail: String,
}

impl ParseError {
    fn malformed(line: &str, detail: impl Into<String>) -> Self {
        Self {
            reason: RejectReason::MalformedFields,
            line: line.to_string(),
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (line: {:?})", self.reason, self.detail, self.line)
    }
}

impl std::error::Error for ParseError {}

/// Parse one serial line received at `received_at`.
///
/// Lines without a comma are diagnostics. Lines with a comma are treated as
/// protocol records and must be exactly `pH,<u64>,<finite f64>`.
pub fn parse_line(line: &str, received_at: DateTime<Utc>) -> Result<ParsedLine, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ParsedLine::Empty);
    }

    if !line.contains(',') {
        return Ok(ParsedLine::Diagnostic(line.to_string()));
    }

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();

    if fields[0] != READING_TAG {
        return Err(ParseError::malformed(
            line,
            format!("unknown record tag '{}'", fields[0]),
        ));
    }

    if fields.len() != READING_FIELDS {
        return Err(ParseError::malformed(
            line,
            format!("expected {} fields, got {}", READING_FIELDS, fields.len()),
        ));
    }

    let device_millis: u64 = fields[1]
        .parse()
        .map_err(|_| {
            ParseError::malformed(line, format!("'{}' is not a valid millis counter", fields[1]))
        })?;

    let ph_value: f64 = fields[2]
        .parse()
        .map_err(|_| {
            ParseError::malformed(line, format!("'{}' is not a valid pH value", fields[2]))
        })?;

    if !ph_value.is_finite() {
        return Err(ParseError::malformed(
            line,
            format!("pH value '{}' is not finite", fields[2]),
        ));
    }

    Ok(ParsedLine::Reading(Reading::new(
        received_at,
        device_millis,
        ph_value,
    )))
}
