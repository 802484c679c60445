//! Core domain types for stations, cycle records, and scan resolution

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Station connection state as surfaced by the status API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Read-only status snapshot for one station
///
/// Published by the station's polling task; the task is the only writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationStatus {
    pub station_id: u32,
    pub station_code: String,
    pub connection_state: ConnectionState,
    pub monitoring_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Total poll iterations since monitoring started
    pub polls: u64,
    /// Cycle records created since monitoring started
    pub cycles_created: u64,
}

impl StationStatus {
    pub fn offline(station_id: u32, station_code: impl Into<String>) -> Self {
        Self {
            station_id,
            station_code: station_code.into(),
            connection_state: ConnectionState::Disconnected,
            monitoring_enabled: false,
            last_seen: None,
            polls: 0,
            cycles_created: 0,
        }
    }
}

/// A decoded register field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Pass/fail verdict of a production cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleResult {
    Ok,
    Nok,
    Pending,
}

/// Label print status of a cycle record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintState {
    Unprinted,
    Printed,
    PrintFailed,
}

/// Scan verification status of a cycle record
///
/// Transitions only forward out of `Unscanned`; the two scanned states are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Unscanned,
    Scanned,
    ScannedMismatch,
}

/// The measurement payload extracted from one register-block read
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Extraction {
    /// Decoded fields by schema name, in schema order
    pub fields: BTreeMap<String, FieldValue>,
}

impl Extraction {
    /// Pass/fail verdict from the conventional `result` field (1 = OK),
    /// `Pending` when the schema carries no such field.
    pub fn result(&self) -> CycleResult {
        match self.fields.get("result") {
            Some(FieldValue::Int(v)) => {
                if *v == 1 {
                    CycleResult::Ok
                } else {
                    CycleResult::Nok
                }
            },
            Some(FieldValue::Bool(b)) => {
                if *b {
                    CycleResult::Ok
                } else {
                    CycleResult::Nok
                }
            },
            _ => CycleResult::Pending,
        }
    }

    /// Decoded barcode text from the conventional `barcode` field
    pub fn barcode(&self) -> Option<&str> {
        self.fields.get("barcode").and_then(FieldValue::as_text)
    }
}

/// One durable production cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: i64,
    pub station_id: u32,
    pub station_code: String,
    /// Monotonic per-station sequence allocated by the store
    pub sequence: u32,
    /// Display number, `{station_code}-{sequence:06}`
    pub cycle_number: String,
    pub created_at: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
    pub result: CycleResult,
    /// Decoded barcode text; equals `code` when the schema has no barcode field
    pub barcode: String,
    /// Unique 32-character label code
    pub code: String,
    pub print_state: PrintState,
    pub scan_state: ScanState,
}

/// Fields of a cycle record before the store assigns its id
#[derive(Debug, Clone)]
pub struct NewCycle {
    pub station_id: u32,
    pub station_code: String,
    pub sequence: u32,
    pub cycle_number: String,
    pub created_at: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
    pub result: CycleResult,
    pub barcode: String,
    pub code: String,
}

/// Resolution of one scan submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    Matched,
    NotFound,
    Mismatch,
}

/// Result returned to the scan submitter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResolution {
    pub outcome: ScanOutcome,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// One scan submission as persisted in the scan log
#[derive(Debug, Clone)]
pub struct NewScanEvent {
    pub payload: String,
    pub code: Option<String>,
    pub outcome: ScanOutcome,
    pub cycle_id: Option<i64>,
    pub scanner_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_from_fields() {
        let mut e = Extraction::default();
        assert_eq!(e.result(), CycleResult::Pending);

        e.fields.insert("result".into(), FieldValue::Int(1));
        assert_eq!(e.result(), CycleResult::Ok);

        e.fields.insert("result".into(), FieldValue::Int(0));
        assert_eq!(e.result(), CycleResult::Nok);
    }

    #[test]
    fn test_field_value_conversions() {
        assert_eq!(FieldValue::Int(7).as_f64(), Some(7.0));
        assert_eq!(FieldValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(FieldValue::Text("AB".into()).as_f64(), None);
        assert_eq!(FieldValue::Text("AB".into()).as_text(), Some("AB"));
    }

    #[test]
    fn test_scan_state_serde_names() {
        let s = serde_json::to_string(&ScanState::ScannedMismatch).unwrap();
        assert_eq!(s, "\"scanned_mismatch\"");
    }
}
