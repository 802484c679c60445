//! In-memory record store
//!
//! Same guarantees as the durable store (unique codes, atomic sequence
//! allocation, guarded scan transitions) without persistence. Used by tests
//! and ephemeral deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::types::{CycleRecord, NewCycle, NewScanEvent, PrintState, ScanState};
use crate::error::{CycleSrvError, Result};

use super::CycleStore;

#[derive(Default)]
struct Inner {
    next_id: i64,
    cycles: Vec<CycleRecord>,
    code_index: HashMap<String, usize>,
    sequences: HashMap<u32, u32>,
    scan_events: Vec<NewScanEvent>,
}

/// Mutex-guarded in-memory store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisted scan events, for assertions in tests
    pub fn scan_events(&self) -> Vec<NewScanEvent> {
        self.inner.lock().scan_events.clone()
    }

    /// All cycle records, for assertions in tests
    pub fn cycles(&self) -> Vec<CycleRecord> {
        self.inner.lock().cycles.clone()
    }
}

#[async_trait]
impl CycleStore for MemoryStore {
    async fn next_sequence(&self, station_id: u32) -> Result<u32> {
        let mut inner = self.inner.lock();
        let next = inner.sequences.entry(station_id).or_insert(0);
        *next += 1;
        Ok(*next)
    }

    async fn create_cycle(&self, cycle: NewCycle) -> Result<CycleRecord> {
        let mut inner = self.inner.lock();
        if inner.code_index.contains_key(&cycle.code) {
            return Err(CycleSrvError::UniquenessViolation(format!(
                "Code already exists: {}",
                cycle.code
            )));
        }

        inner.next_id += 1;
        let record = CycleRecord {
            id: inner.next_id,
            station_id: cycle.station_id,
            station_code: cycle.station_code,
            sequence: cycle.sequence,
            cycle_number: cycle.cycle_number,
            created_at: cycle.created_at,
            fields: cycle.fields,
            result: cycle.result,
            barcode: cycle.barcode,
            code: cycle.code,
            print_state: PrintState::Unprinted,
            scan_state: ScanState::Unscanned,
        };
        let index = inner.cycles.len();
        inner.code_index.insert(record.code.clone(), index);
        inner.cycles.push(record.clone());
        Ok(record)
    }

    async fn find_cycle_by_code(&self, code: &str) -> Result<Option<CycleRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .code_index
            .get(code)
            .map(|&index| inner.cycles[index].clone()))
    }

    async fn update_print_state(&self, id: i64, state: PrintState) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .cycles
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| CycleSrvError::cycle_not_found(id))?;
        record.print_state = state;
        Ok(())
    }

    async fn try_mark_scanned(&self, id: i64, state: ScanState) -> Result<bool> {
        if state == ScanState::Unscanned {
            return Err(CycleSrvError::validation(
                "Scan status cannot transition back to unscanned",
            ));
        }
        let mut inner = self.inner.lock();
        let record = inner
            .cycles
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| CycleSrvError::cycle_not_found(id))?;
        if record.scan_state != ScanState::Unscanned {
            return Ok(false);
        }
        record.scan_state = state;
        Ok(true)
    }

    async fn record_scan_event(&self, event: NewScanEvent) -> Result<()> {
        self.inner.lock().scan_events.push(event);
        Ok(())
    }

    async fn cycle_count(&self) -> Result<u64> {
        Ok(self.inner.lock().cycles.len() as u64)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn new_cycle(code: &str, sequence: u32) -> NewCycle {
        NewCycle {
            station_id: 1,
            station_code: "BRK-01".into(),
            sequence,
            cycle_number: format!("BRK-01-{sequence:06}"),
            created_at: Utc::now(),
            fields: BTreeMap::new(),
            result: crate::core::types::CycleResult::Ok,
            barcode: code.to_string(),
            code: code.to_string(),
        }
    }

    #[tokio::test]
    async fn test_sequences_are_monotonic_per_station() {
        let store = MemoryStore::new();
        assert_eq!(store.next_sequence(1).await.unwrap(), 1);
        assert_eq!(store.next_sequence(1).await.unwrap(), 2);
        assert_eq!(store.next_sequence(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_code_rejected() {
        let store = MemoryStore::new();
        store.create_cycle(new_cycle("C0DE", 1)).await.unwrap();
        let err = store.create_cycle(new_cycle("C0DE", 2)).await.unwrap_err();
        assert!(matches!(err, CycleSrvError::UniquenessViolation(_)));
        assert_eq!(store.cycle_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_by_code_round_trip() {
        let store = MemoryStore::new();
        let created = store.create_cycle(new_cycle("AAAA", 1)).await.unwrap();
        let found = store.find_cycle_by_code("AAAA").await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.cycle_number, created.cycle_number);
        assert!(store.find_cycle_by_code("BBBB").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_transition_is_guarded() {
        let store = MemoryStore::new();
        let record = store.create_cycle(new_cycle("AAAA", 1)).await.unwrap();

        assert!(store
            .try_mark_scanned(record.id, ScanState::Scanned)
            .await
            .unwrap());
        // Terminal status never changes
        assert!(!store
            .try_mark_scanned(record.id, ScanState::ScannedMismatch)
            .await
            .unwrap());

        let found = store.find_cycle_by_code("AAAA").await.unwrap().unwrap();
        assert_eq!(found.scan_state, ScanState::Scanned);
    }

    #[tokio::test]
    async fn test_backward_transition_rejected() {
        let store = MemoryStore::new();
        let record = store.create_cycle(new_cycle("AAAA", 1)).await.unwrap();
        assert!(store
            .try_mark_scanned(record.id, ScanState::Unscanned)
            .await
            .is_err());
    }
}
