//! Scan resolution
//!
//! Decodes a submitted label payload, resolves it to a cycle record, and
//! records the outcome. Structurally invalid payloads report `not_found`
//! rather than an error; a record's terminal scan status is never rewritten.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::core::ledger::CODE_LEN;
use crate::core::types::{NewScanEvent, ScanOutcome, ScanResolution, ScanState};
use crate::error::{CycleSrvError, Result};
use crate::store::CycleStore;

/// Decoded form of a scanned payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPayload {
    pub code: String,
    /// Barcode carried alongside the code by richer label encodings
    pub barcode: Option<String>,
}

/// JSON envelope produced by structured label encodings
#[derive(Debug, Deserialize)]
struct ScanEnvelope {
    code: String,
    #[serde(default)]
    barcode: Option<String>,
}

impl ScanPayload {
    /// Decode a raw payload: a JSON envelope with a `code` field, or the
    /// bare 32-character code itself.
    pub fn decode(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CycleSrvError::decode("Empty scan payload"));
        }

        if trimmed.starts_with('{') {
            let envelope: ScanEnvelope = serde_json::from_str(trimmed)
                .map_err(|e| CycleSrvError::decode(format!("Malformed scan envelope: {e}")))?;
            if envelope.code.len() != CODE_LEN {
                return Err(CycleSrvError::decode(format!(
                    "Code must be {CODE_LEN} characters, got {}",
                    envelope.code.len()
                )));
            }
            return Ok(Self {
                code: envelope.code,
                barcode: envelope.barcode,
            });
        }

        if trimmed.len() != CODE_LEN || !trimmed.chars().all(|c| c.is_ascii_graphic()) {
            return Err(CycleSrvError::decode(format!(
                "Payload is not a {CODE_LEN}-character code"
            )));
        }
        Ok(Self {
            code: trimmed.to_string(),
            barcode: None,
        })
    }
}

/// Resolves scans against the record store
pub struct ScanMatcher {
    store: Arc<dyn CycleStore>,
}

impl ScanMatcher {
    pub fn new(store: Arc<dyn CycleStore>) -> Self {
        Self { store }
    }

    /// Resolve one scan submission.
    ///
    /// Every submission is appended to the scan log with its outcome. Store
    /// failures are the only errors surfaced; a payload that cannot be
    /// decoded or matched resolves to `not_found`.
    pub async fn resolve_scan(
        &self,
        raw: &str,
        scanner_id: Option<String>,
    ) -> Result<ScanResolution> {
        let payload = match ScanPayload::decode(raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Scan payload rejected: {e}");
                self.log_event(raw, None, ScanOutcome::NotFound, None, scanner_id)
                    .await?;
                return Ok(ScanResolution {
                    outcome: ScanOutcome::NotFound,
                    message: format!("Unrecognized scan payload: {e}"),
                    cycle_number: None,
                    code: None,
                });
            },
        };

        let Some(record) = self.store.find_cycle_by_code(&payload.code).await? else {
            info!("Scan did not match any cycle (code {})", payload.code);
            self.log_event(
                raw,
                Some(payload.code.clone()),
                ScanOutcome::NotFound,
                None,
                scanner_id,
            )
            .await?;
            return Ok(ScanResolution {
                outcome: ScanOutcome::NotFound,
                message: "No cycle record matches the scanned code".to_string(),
                cycle_number: None,
                code: Some(payload.code),
            });
        };

        // Fields that should be invariant must agree; a payload without a
        // barcode matches on the code alone.
        let mismatch = payload
            .barcode
            .as_deref()
            .is_some_and(|scanned| scanned != record.barcode);

        let (outcome, state, message) = if mismatch {
            (
                ScanOutcome::Mismatch,
                ScanState::ScannedMismatch,
                format!(
                    "Scanned barcode does not match cycle {}: expected {}, got {}",
                    record.cycle_number,
                    record.barcode,
                    payload.barcode.as_deref().unwrap_or_default()
                ),
            )
        } else {
            (
                ScanOutcome::Matched,
                ScanState::Scanned,
                format!("Matched cycle {}", record.cycle_number),
            )
        };

        // Guarded transition: repeat scans of a resolved record report their
        // outcome but leave the stored terminal status untouched.
        let applied = self.store.try_mark_scanned(record.id, state).await?;
        if !applied {
            info!(
                "Cycle {} already resolved, scan status unchanged",
                record.cycle_number
            );
        }

        self.log_event(
            raw,
            Some(payload.code),
            outcome,
            Some(record.id),
            scanner_id,
        )
        .await?;

        Ok(ScanResolution {
            outcome,
            message,
            cycle_number: Some(record.cycle_number),
            code: Some(record.code),
        })
    }

    async fn log_event(
        &self,
        payload: &str,
        code: Option<String>,
        outcome: ScanOutcome,
        cycle_id: Option<i64>,
        scanner_id: Option<String>,
    ) -> Result<()> {
        self.store
            .record_scan_event(NewScanEvent {
                payload: payload.to_string(),
                code,
                outcome,
                cycle_id,
                scanner_id,
                created_at: Utc::now(),
            })
            .await
    }
}
