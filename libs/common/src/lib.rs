//! Shared service infrastructure for the cyclesrv workspace
//!
//! Provides logging bootstrap and graceful-shutdown helpers used by service
//! binaries.

pub mod logging;
pub mod shutdown;
