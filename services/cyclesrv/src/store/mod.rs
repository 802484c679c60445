//! Durable record store
//!
//! The polling path and scan resolution share no mutable state except through
//! this interface. The store owns the unique-code namespace and the station
//! sequence counters, so concurrent stations cannot collide outside its
//! isolation guarantees.

use async_trait::async_trait;

use crate::core::types::{CycleRecord, NewCycle, NewScanEvent, PrintState, ScanState};
use crate::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Store interface consumed by the cycle ledger and scan matcher
#[async_trait]
pub trait CycleStore: Send + Sync {
    /// Allocate the next monotonic sequence number for a station
    async fn next_sequence(&self, station_id: u32) -> Result<u32>;

    /// Persist a new cycle record.
    ///
    /// Fails with `UniquenessViolation` when the generated code already
    /// exists; the record is never overwritten.
    async fn create_cycle(&self, cycle: NewCycle) -> Result<CycleRecord>;

    /// Look up a cycle record by its generated code
    async fn find_cycle_by_code(&self, code: &str) -> Result<Option<CycleRecord>>;

    /// Update the label print status of a record
    async fn update_print_state(&self, id: i64, state: PrintState) -> Result<()>;

    /// Transition a record's scan status out of `unscanned`.
    ///
    /// Returns `true` when the transition was applied; `false` when the
    /// record already carries a terminal scan status, which is never
    /// rewritten.
    async fn try_mark_scanned(&self, id: i64, state: ScanState) -> Result<bool>;

    /// Append one scan submission to the scan log
    async fn record_scan_event(&self, event: NewScanEvent) -> Result<()>;

    /// Number of cycle records held (diagnostics and tests)
    async fn cycle_count(&self) -> Result<u64>;
}
