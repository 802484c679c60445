//! Cycle ledger
//!
//! Turns a successful extraction into exactly one durable cycle record. The
//! poll scheduler invokes this at most once per detected rising edge; the
//! ledger's own duty is the defensive side: never overwrite an existing code,
//! regenerate and retry on a collision.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{LabelIdentity, StationConfig};
use crate::core::types::{CycleRecord, Extraction, NewCycle};
use crate::error::{CycleSrvError, Result};
use crate::store::CycleStore;

/// Length of every generated label code
pub const CODE_LEN: usize = 32;

/// Serial segment width inside the code
const SERIAL_LEN: usize = 6;

/// Attempts before a persistent collision is reported upstream
const MAX_CREATE_ATTEMPTS: u32 = 3;

/// Cycle record factory bound to a store
pub struct CycleLedger {
    store: Arc<dyn CycleStore>,
}

impl CycleLedger {
    pub fn new(store: Arc<dyn CycleStore>) -> Self {
        Self { store }
    }

    /// Mint the 32-character label code:
    /// `part_no + revision + vendor_code + MMYY + serial(6)`, truncating the
    /// part number first when over-long and zero-padding at the end when
    /// short.
    pub fn mint_code(identity: &LabelIdentity, minted_at: DateTime<Utc>, serial: u32) -> String {
        let mfg_date = minted_at.format("%m%y").to_string();
        let serial = format!("{:06}", serial % 1_000_000);

        let mut part_no = identity.part_no.clone();
        let fixed_len =
            identity.revision.chars().count() + identity.vendor_code.chars().count() + 4 + SERIAL_LEN;

        let mut code = format!(
            "{part_no}{}{}{mfg_date}{serial}",
            identity.revision, identity.vendor_code
        );
        if code.chars().count() > CODE_LEN {
            let available_for_part = CODE_LEN.saturating_sub(fixed_len);
            part_no = part_no.chars().take(available_for_part).collect();
            code = format!(
                "{part_no}{}{}{mfg_date}{serial}",
                identity.revision, identity.vendor_code
            );
            if code.chars().count() > CODE_LEN {
                code = code.chars().take(CODE_LEN).collect();
            }
        }
        while code.chars().count() < CODE_LEN {
            code.push('0');
        }
        code
    }

    /// Create the cycle record for one detected edge.
    ///
    /// Allocates the next station sequence, mints the code, and persists the
    /// record. A uniqueness collision allocates a fresh sequence and retries;
    /// nothing is ever overwritten.
    pub async fn create_from_extraction(
        &self,
        station: &StationConfig,
        extraction: &Extraction,
        identity: &LabelIdentity,
    ) -> Result<CycleRecord> {
        let mut attempts = 0;
        loop {
            let sequence = self.store.next_sequence(station.id).await?;
            let created_at = Utc::now();
            let code = Self::mint_code(identity, created_at, sequence);

            // The decoded barcode is the label identity of record; stations
            // whose schema carries none use the code itself.
            let barcode = match extraction.barcode() {
                Some(text) if !text.is_empty() => text.to_string(),
                _ => code.clone(),
            };

            let new_cycle = NewCycle {
                station_id: station.id,
                station_code: station.code.clone(),
                sequence,
                cycle_number: format!("{}-{:06}", station.code, sequence),
                created_at,
                fields: extraction.fields.clone(),
                result: extraction.result(),
                barcode,
                code,
            };

            match self.store.create_cycle(new_cycle).await {
                Ok(record) => {
                    info!(
                        "Station {}: cycle {} created (code {})",
                        station.code, record.cycle_number, record.code
                    );
                    return Ok(record);
                },
                Err(CycleSrvError::UniquenessViolation(msg)) => {
                    attempts += 1;
                    if attempts >= MAX_CREATE_ATTEMPTS {
                        return Err(CycleSrvError::UniquenessViolation(format!(
                            "Station {}: code collision persisted after {} attempts: {}",
                            station.code, attempts, msg
                        )));
                    }
                    warn!(
                        "Station {}: code collision ({}), regenerating",
                        station.code, msg
                    );
                },
                Err(e) => return Err(e),
            }
        }
    }
}
