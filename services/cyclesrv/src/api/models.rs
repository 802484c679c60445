//! API request and response models

use serde::{Deserialize, Serialize};

use crate::core::types::{PrintState, ScanResolution, StationStatus};

/// Scan submission body
#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    pub payload: String,
    #[serde(default)]
    pub scanner_id: Option<String>,
}

/// Scan submission response
pub type ScanResponse = ScanResolution;

/// Station status response
pub type StationStatusResponse = StationStatus;

/// Monitoring start/stop acknowledgment
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringAck {
    pub station_id: u32,
    pub monitoring_enabled: bool,
}

/// Manual reprint response
#[derive(Debug, Clone, Serialize)]
pub struct ReprintResponse {
    pub cycle_number: String,
    pub code: String,
    pub print_state: PrintState,
}

/// Health response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub stations: usize,
}
