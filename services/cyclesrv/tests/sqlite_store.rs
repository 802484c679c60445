//! Durable store behavior against a real SQLite database.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use cyclesrv::core::scan::ScanMatcher;
use cyclesrv::core::types::{
    CycleResult, FieldValue, NewCycle, PrintState, ScanOutcome, ScanState,
};
use cyclesrv::error::CycleSrvError;
use cyclesrv::store::{CycleStore, SqliteStore};

async fn open_store(dir: &TempDir) -> SqliteStore {
    SqliteStore::open(dir.path().join("cycles.db"))
        .await
        .expect("open store")
}

fn new_cycle(code: &str, sequence: u32) -> NewCycle {
    let mut fields = BTreeMap::new();
    fields.insert("torque_nm".to_string(), FieldValue::Float(12.5));
    fields.insert("barcode".to_string(), FieldValue::Text(code.to_string()));
    NewCycle {
        station_id: 1,
        station_code: "BRK-01".into(),
        sequence,
        cycle_number: format!("BRK-01-{sequence:06}"),
        created_at: Utc::now(),
        fields,
        result: CycleResult::Ok,
        barcode: code.to_string(),
        code: code.to_string(),
    }
}

#[tokio::test]
async fn round_trips_a_record_through_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let seq = store.next_sequence(1).await.unwrap();
    assert_eq!(seq, 1);

    let code = "BRK88812AV0420826000001000000000";
    let created = store.create_cycle(new_cycle(code, seq)).await.unwrap();
    assert_eq!(created.print_state, PrintState::Unprinted);
    assert_eq!(created.scan_state, ScanState::Unscanned);

    let found = store.find_cycle_by_code(code).await.unwrap().unwrap();
    assert_eq!(found.id, created.id);
    assert_eq!(found.cycle_number, "BRK-01-000001");
    assert_eq!(found.result, CycleResult::Ok);
    assert_eq!(
        found.fields.get("torque_nm"),
        Some(&FieldValue::Float(12.5))
    );

    assert!(store.find_cycle_by_code("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn sequences_survive_per_station() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    assert_eq!(store.next_sequence(1).await.unwrap(), 1);
    assert_eq!(store.next_sequence(1).await.unwrap(), 2);
    assert_eq!(store.next_sequence(2).await.unwrap(), 1);
    assert_eq!(store.next_sequence(1).await.unwrap(), 3);
}

#[tokio::test]
async fn duplicate_code_is_a_uniqueness_violation() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let code = "BRK88812AV0420826000002000000000";
    store.create_cycle(new_cycle(code, 1)).await.unwrap();
    let err = store.create_cycle(new_cycle(code, 2)).await.unwrap_err();
    assert!(matches!(err, CycleSrvError::UniquenessViolation(_)));
    assert_eq!(store.cycle_count().await.unwrap(), 1);
}

#[tokio::test]
async fn print_state_updates() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let code = "BRK88812AV0420826000003000000000";
    let record = store.create_cycle(new_cycle(code, 1)).await.unwrap();

    store
        .update_print_state(record.id, PrintState::Printed)
        .await
        .unwrap();
    let found = store.find_cycle_by_code(code).await.unwrap().unwrap();
    assert_eq!(found.print_state, PrintState::Printed);

    assert!(store
        .update_print_state(9999, PrintState::Printed)
        .await
        .is_err());
}

#[tokio::test]
async fn scan_transition_is_compare_and_set() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let code = "BRK88812AV0420826000004000000000";
    let record = store.create_cycle(new_cycle(code, 1)).await.unwrap();

    assert!(store
        .try_mark_scanned(record.id, ScanState::Scanned)
        .await
        .unwrap());
    assert!(!store
        .try_mark_scanned(record.id, ScanState::ScannedMismatch)
        .await
        .unwrap());

    let found = store.find_cycle_by_code(code).await.unwrap().unwrap();
    assert_eq!(found.scan_state, ScanState::Scanned);

    assert!(store
        .try_mark_scanned(record.id, ScanState::Unscanned)
        .await
        .is_err());
    assert!(store
        .try_mark_scanned(9999, ScanState::Scanned)
        .await
        .is_err());
}

#[tokio::test]
async fn scan_flow_against_durable_store() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir).await);

    let code = "BRK88812AV0420826000005000000000";
    store.create_cycle(new_cycle(code, 1)).await.unwrap();

    let matcher = ScanMatcher::new(store.clone());

    let matched = matcher.resolve_scan(code, None).await.unwrap();
    assert_eq!(matched.outcome, ScanOutcome::Matched);

    // Repeat scan stays matched and does not mutate stored status
    let again = matcher.resolve_scan(code, None).await.unwrap();
    assert_eq!(again.outcome, ScanOutcome::Matched);
    let record = store.find_cycle_by_code(code).await.unwrap().unwrap();
    assert_eq!(record.scan_state, ScanState::Scanned);

    let missing = matcher
        .resolve_scan("BRK88812AV0420826999999000000000", None)
        .await
        .unwrap();
    assert_eq!(missing.outcome, ScanOutcome::NotFound);
}
