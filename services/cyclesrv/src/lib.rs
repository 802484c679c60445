//! Cycle-Capture Service (`cyclesrv`)
//!
//! An async-first service that integrates factory-floor PLCs with a
//! back-office record store. It polls each configured station's controller
//! over Modbus TCP, detects the completion of a production cycle through
//! rising-edge detection on a configured relay bit, extracts the cycle's
//! measurement registers, creates a durable cycle record with a unique
//! scannable code, drives a network label printer, and verifies physical
//! labels by resolving scanned codes back to stored records.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │  ServiceConfig  │───►│ MonitorRegistry  │───►│ Station tasks   │
//! │  (YAML + env)   │    │  (start/stop)    │    │ (1 per station) │
//! └─────────────────┘    └──────────────────┘    └────────┬────────┘
//!          │                      │                       │ rising edge
//!          ▼                      ▼                       ▼
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │   REST API      │    │   CycleStore     │◄───│ Extractor +     │
//! │ (scan, control) │───►│ (SQLite/memory)  │    │ Ledger + Labels │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! Station tasks share no mutable state with each other; records, sequence
//! counters, and the unique-code namespace live behind the store interface,
//! and station status is published through read-only snapshots.

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod protocols;
pub mod store;

pub use crate::config::ServiceConfig;
pub use crate::core::monitor::MonitorRegistry;
pub use crate::error::{CycleSrvError, Result};
