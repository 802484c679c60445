//! SQLite-backed record store
//!
//! Durable implementation of [`CycleStore`]. Code uniqueness is enforced by a
//! `UNIQUE` constraint and sequence allocation by an atomic upsert, so the
//! guarantees hold across concurrently polling stations and service restarts.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::core::types::{
    CycleRecord, CycleResult, FieldValue, NewCycle, NewScanEvent, PrintState, ScanOutcome,
    ScanState,
};
use crate::error::{CycleSrvError, Result};

use super::CycleStore;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cycles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        station_id INTEGER NOT NULL,
        station_code TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        cycle_number TEXT NOT NULL,
        created_at TEXT NOT NULL,
        fields TEXT NOT NULL,
        result TEXT NOT NULL,
        barcode TEXT NOT NULL,
        code TEXT NOT NULL UNIQUE,
        print_state TEXT NOT NULL,
        scan_state TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS station_sequences (
        station_id INTEGER PRIMARY KEY,
        next_sequence INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS scan_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        payload TEXT NOT NULL,
        code TEXT,
        outcome TEXT NOT NULL,
        cycle_id INTEGER,
        scanner_id TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_cycles_station ON cycles (station_id, sequence)",
];

/// SQLite store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and create if missing) the database at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<CycleRecord> {
        let fields_json: String = row.try_get("fields")?;
        let fields: BTreeMap<String, FieldValue> = serde_json::from_str(&fields_json)?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let result: String = row.try_get("result")?;
        let print_state: String = row.try_get("print_state")?;
        let scan_state: String = row.try_get("scan_state")?;

        Ok(CycleRecord {
            id: row.try_get("id")?,
            station_id: row.try_get::<i64, _>("station_id")? as u32,
            station_code: row.try_get("station_code")?,
            sequence: row.try_get::<i64, _>("sequence")? as u32,
            cycle_number: row.try_get("cycle_number")?,
            created_at,
            fields,
            result: parse_result(&result)?,
            barcode: row.try_get("barcode")?,
            code: row.try_get("code")?,
            print_state: parse_print_state(&print_state)?,
            scan_state: parse_scan_state(&scan_state)?,
        })
    }
}

#[async_trait]
impl CycleStore for SqliteStore {
    async fn next_sequence(&self, station_id: u32) -> Result<u32> {
        let next: i64 = sqlx::query_scalar(
            "INSERT INTO station_sequences (station_id, next_sequence) VALUES (?, 1)
             ON CONFLICT(station_id) DO UPDATE SET next_sequence = next_sequence + 1
             RETURNING next_sequence",
        )
        .bind(i64::from(station_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(next as u32)
    }

    async fn create_cycle(&self, cycle: NewCycle) -> Result<CycleRecord> {
        let fields_json = serde_json::to_string(&cycle.fields)?;
        let row = sqlx::query(
            "INSERT INTO cycles (
                station_id, station_code, sequence, cycle_number, created_at,
                fields, result, barcode, code, print_state, scan_state
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(i64::from(cycle.station_id))
        .bind(&cycle.station_code)
        .bind(i64::from(cycle.sequence))
        .bind(&cycle.cycle_number)
        .bind(cycle.created_at)
        .bind(&fields_json)
        .bind(result_str(cycle.result))
        .bind(&cycle.barcode)
        .bind(&cycle.code)
        .bind(print_state_str(PrintState::Unprinted))
        .bind(scan_state_str(ScanState::Unscanned))
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_record(&row)
    }

    async fn find_cycle_by_code(&self, code: &str) -> Result<Option<CycleRecord>> {
        let row = sqlx::query("SELECT * FROM cycles WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn update_print_state(&self, id: i64, state: PrintState) -> Result<()> {
        let result = sqlx::query("UPDATE cycles SET print_state = ? WHERE id = ?")
            .bind(print_state_str(state))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CycleSrvError::cycle_not_found(id));
        }
        Ok(())
    }

    async fn try_mark_scanned(&self, id: i64, state: ScanState) -> Result<bool> {
        if state == ScanState::Unscanned {
            return Err(CycleSrvError::validation(
                "Scan status cannot transition back to unscanned",
            ));
        }
        // Compare-and-set: a terminal status is never rewritten
        let result = sqlx::query(
            "UPDATE cycles SET scan_state = ? WHERE id = ? AND scan_state = ?",
        )
        .bind(scan_state_str(state))
        .bind(id)
        .bind(scan_state_str(ScanState::Unscanned))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM cycles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(CycleSrvError::cycle_not_found(id));
        }
        Ok(false)
    }

    async fn record_scan_event(&self, event: NewScanEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO scan_events (payload, code, outcome, cycle_id, scanner_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.payload)
        .bind(&event.code)
        .bind(outcome_str(event.outcome))
        .bind(event.cycle_id)
        .bind(&event.scanner_id)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cycle_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cycles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

fn result_str(result: CycleResult) -> &'static str {
    match result {
        CycleResult::Ok => "ok",
        CycleResult::Nok => "nok",
        CycleResult::Pending => "pending",
    }
}

fn parse_result(s: &str) -> Result<CycleResult> {
    match s {
        "ok" => Ok(CycleResult::Ok),
        "nok" => Ok(CycleResult::Nok),
        "pending" => Ok(CycleResult::Pending),
        other => Err(CycleSrvError::storage(format!(
            "Unknown result value: {other}"
        ))),
    }
}

fn print_state_str(state: PrintState) -> &'static str {
    match state {
        PrintState::Unprinted => "unprinted",
        PrintState::Printed => "printed",
        PrintState::PrintFailed => "print_failed",
    }
}

fn parse_print_state(s: &str) -> Result<PrintState> {
    match s {
        "unprinted" => Ok(PrintState::Unprinted),
        "printed" => Ok(PrintState::Printed),
        "print_failed" => Ok(PrintState::PrintFailed),
        other => Err(CycleSrvError::storage(format!(
            "Unknown print state: {other}"
        ))),
    }
}

fn scan_state_str(state: ScanState) -> &'static str {
    match state {
        ScanState::Unscanned => "unscanned",
        ScanState::Scanned => "scanned",
        ScanState::ScannedMismatch => "scanned_mismatch",
    }
}

fn parse_scan_state(s: &str) -> Result<ScanState> {
    match s {
        "unscanned" => Ok(ScanState::Unscanned),
        "scanned" => Ok(ScanState::Scanned),
        "scanned_mismatch" => Ok(ScanState::ScannedMismatch),
        other => Err(CycleSrvError::storage(format!(
            "Unknown scan state: {other}"
        ))),
    }
}

fn outcome_str(outcome: ScanOutcome) -> &'static str {
    match outcome {
        ScanOutcome::Matched => "matched",
        ScanOutcome::NotFound => "not_found",
        ScanOutcome::Mismatch => "mismatch",
    }
}
