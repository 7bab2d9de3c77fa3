use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::XApiParseError;

/// An opaque object reference handed out by the hypervisor. Compared by
/// value only; the literal `OpaqueRef:NULL` means "no object".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpaqueRef(String);

pub const NULL_REF: &str = "OpaqueRef:NULL";

impl OpaqueRef {
    pub fn new(value: impl Into<String>) -> OpaqueRef {
        OpaqueRef(value.into())
    }

    pub fn null() -> OpaqueRef {
        OpaqueRef(NULL_REF.to_string())
    }

    pub fn is_null(&self) -> bool {
        self.0 == NULL_REF
    }

    /// The option view of the null sentinel.
    pub fn as_option(&self) -> Option<&OpaqueRef> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpaqueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OpaqueRef {
    fn from(value: &str) -> OpaqueRef {
        OpaqueRef(value.to_string())
    }
}

impl From<String> for OpaqueRef {
    fn from(value: String) -> OpaqueRef {
        OpaqueRef(value)
    }
}

/// A hypervisor record: an open bag of fields. Unknown fields are kept
/// verbatim so a restore can hand the record back unchanged.
pub type Record = serde_json::Map<String, serde_json::Value>;

pub trait RecordExt {
    fn str_field(&self, key: &str) -> Option<&str>;
    /// Reference-typed field with the null sentinel mapped to `None`.
    fn ref_field(&self, key: &str) -> Option<OpaqueRef>;
    fn bool_field(&self, key: &str) -> Option<bool>;
    fn set_str(&mut self, key: &str, value: impl Into<String>);
}

impl RecordExt for Record {
    fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    fn ref_field(&self, key: &str) -> Option<OpaqueRef> {
        let raw = self.str_field(key)?;
        let reference = OpaqueRef::from(raw);
        reference.as_option().cloned()
    }

    fn bool_field(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    fn set_str(&mut self, key: &str, value: impl Into<String>) {
        self.insert(key.to_string(), serde_json::Value::String(value.into()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Halted,
    Paused,
    Suspended,
}

impl FromStr for PowerState {
    type Err = XApiParseError;

    fn from_str(s: &str) -> Result<PowerState, XApiParseError> {
        match s {
            "Running" => Ok(PowerState::Running),
            "Halted" => Ok(PowerState::Halted),
            "Paused" => Ok(PowerState::Paused),
            "Suspended" => Ok(PowerState::Suspended),
            other => Err(XApiParseError::PowerStateParseError(other.to_string())),
        }
    }
}

impl ToString for PowerState {
    fn to_string(&self) -> String {
        match self {
            PowerState::Running => "Running".to_string(),
            PowerState::Halted => "Halted".to_string(),
            PowerState::Paused => "Paused".to_string(),
            PowerState::Suspended => "Suspended".to_string(),
        }
    }
}

/// Parse a hypervisor timestamp (`20240318T09:30:00Z`).
pub fn parse_timestamp(
    timestamp: &str,
) -> Result<chrono::DateTime<chrono::Utc>, XApiParseError> {
    let naive = chrono::NaiveDateTime::parse_from_str(timestamp, "%Y%m%dT%H:%M:%SZ")?;
    Ok(chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(
        naive, Utc,
    ))
}

/// ISO-basic rendering (`%Y%m%dT%H%M%S`) used for file basenames;
/// lexicographic order equals chronological order.
pub fn basic_timestamp(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y%m%dT%H%M%S").to_string()
}

/// Re-render a hypervisor timestamp in ISO-basic form.
pub fn wire_to_basic(timestamp: &str) -> Result<String, XApiParseError> {
    parse_timestamp(timestamp).map(|dt| basic_timestamp(&dt))
}

/// Human rendering used when a snapshot is renamed for export.
pub fn wire_to_human(timestamp: &str) -> Result<String, XApiParseError> {
    parse_timestamp(timestamp).map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn null_ref_is_absent() {
        let null = OpaqueRef::from(NULL_REF);
        assert!(null.is_null());
        assert_eq!(null.as_option(), None);

        let real = OpaqueRef::from("OpaqueRef:3f2e");
        assert!(!real.is_null());
        assert_eq!(real.as_option(), Some(&real));
    }

    #[test]
    fn record_ref_field_maps_null_to_none() {
        let mut record = Record::new();
        record.set_str("VDI", NULL_REF);
        record.set_str("VM", "OpaqueRef:7");

        assert_eq!(record.ref_field("VDI"), None);
        assert_eq!(record.ref_field("VM"), Some(OpaqueRef::from("OpaqueRef:7")));
        assert_eq!(record.ref_field("missing"), None);
    }

    #[test]
    fn parses_wire_timestamps() {
        let dt = parse_timestamp("20240318T09:30:05Z").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 3, 18, 9, 30, 5).unwrap());
        assert_eq!(basic_timestamp(&dt), "20240318T093005");
        assert_eq!(wire_to_basic("20240318T09:30:05Z").unwrap(), "20240318T093005");
        assert_eq!(
            wire_to_human("20240318T09:30:05Z").unwrap(),
            "2024-03-18 09:30:05"
        );
    }

    #[test]
    fn rejects_malformed_timestamps() {
        assert!(parse_timestamp("2024-03-18 09:30:05").is_err());
    }

    #[test]
    fn basic_timestamps_sort_chronologically() {
        let samples = [
            Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap(),
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 18, 9, 30, 5).unwrap(),
            Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap(),
        ];
        let rendered: Vec<String> = samples.iter().map(basic_timestamp).collect();
        let mut sorted = rendered.clone();
        sorted.sort();
        assert_eq!(rendered, sorted);
    }

    #[test]
    fn power_state_round_trip() {
        for state in ["Running", "Halted", "Paused", "Suspended"] {
            assert_eq!(PowerState::from_str(state).unwrap().to_string(), state);
        }
        assert!(PowerState::from_str("Rebooting").is_err());
    }
}
