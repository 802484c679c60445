//! Core monitoring and cycle-capture logic

pub mod edge;
pub mod extractor;
pub mod ledger;
pub mod monitor;
pub mod printer;
pub mod scan;
pub mod types;
