//! Modbus TCP protocol support

pub mod client;
pub mod codec;
pub mod pdu;
pub mod simulator;

pub use client::{BusEndpoint, ModbusTcpClient, RegisterBus};
pub use codec::ModbusCodec;
pub use pdu::ModbusPdu;
