//! Field-bus protocol implementations

pub mod mock;
pub mod modbus;
