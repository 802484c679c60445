//! Modbus TCP client
//!
//! One session per station. Every request honours the configured timeout, and
//! any I/O failure poisons the session: subsequent calls fail fast until
//! `connect()` succeeds again. No silent retry happens inside a single call.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{BitReadMethod, StationConfig};
use crate::error::{CycleSrvError, Result};

use super::codec::{function_codes, ModbusCodec, MBAP_HEADER_LEN};
use super::pdu::ModbusPdu;

/// Abstraction over a station's register bus
///
/// The poll scheduler runs against this trait so tests can substitute a
/// scripted bus for a live Modbus session.
#[async_trait]
pub trait RegisterBus: Send {
    /// Establish a session; fails on socket or timeout errors
    async fn connect(&mut self) -> Result<()>;

    /// Read a single discrete bit at a Modbus address
    async fn read_bit(&mut self, address: u16) -> Result<bool>;

    /// Read `count` holding registers starting at `start`
    async fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>>;

    /// Release the session; idempotent
    async fn close(&mut self) -> Result<()>;

    /// Whether a session is currently established
    fn is_connected(&self) -> bool;
}

/// Endpoint parameters for one Modbus TCP session
#[derive(Debug, Clone)]
pub struct BusEndpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout: Duration,
    pub bit_read_method: BitReadMethod,
}

impl From<&StationConfig> for BusEndpoint {
    fn from(station: &StationConfig) -> Self {
        Self {
            host: station.host.clone(),
            port: station.port,
            unit_id: station.unit_id,
            timeout: station.timeout(),
            bit_read_method: station.bit_read_method,
        }
    }
}

impl BusEndpoint {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Modbus TCP client implementation of [`RegisterBus`]
#[derive(Debug)]
pub struct ModbusTcpClient {
    endpoint: BusEndpoint,
    stream: Option<TcpStream>,
    transaction_id: u16,
}

impl ModbusTcpClient {
    pub fn new(endpoint: BusEndpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            transaction_id: 0,
        }
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    /// Send one request PDU and return the response PDU.
    ///
    /// The session is taken out for the exchange and only put back after a
    /// fully successful round trip, so any transport or framing failure
    /// leaves the session dead.
    async fn transact(&mut self, request: &ModbusPdu) -> Result<ModbusPdu> {
        let tid = self.next_transaction_id();
        let unit_id = self.endpoint.unit_id;
        let io_timeout = self.endpoint.timeout;
        let addr = self.endpoint.addr();

        let mut stream = self
            .stream
            .take()
            .ok_or_else(CycleSrvError::not_connected)?;

        let frame = ModbusCodec::build_mbap_frame(tid, unit_id, request);

        match timeout(io_timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                return Err(CycleSrvError::connection(format!(
                    "Send to {addr} failed: {e}"
                )))
            },
            Err(_) => {
                return Err(CycleSrvError::timeout(format!(
                    "Send to {addr} timed out after {io_timeout:?}"
                )))
            },
        }

        let mut header = [0u8; MBAP_HEADER_LEN];
        match timeout(io_timeout, stream.read_exact(&mut header)).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => {
                return Err(CycleSrvError::connection(format!(
                    "Receive from {addr} failed: {e}"
                )))
            },
            Err(_) => {
                return Err(CycleSrvError::timeout(format!(
                    "Receive from {addr} timed out after {io_timeout:?}"
                )))
            },
        }

        let (rx_tid, rx_unit, pdu_len) = ModbusCodec::parse_mbap_header(&header)?;

        let mut pdu_bytes = vec![0u8; pdu_len];
        match timeout(io_timeout, stream.read_exact(&mut pdu_bytes)).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => {
                return Err(CycleSrvError::connection(format!(
                    "Receive from {addr} failed: {e}"
                )))
            },
            Err(_) => {
                return Err(CycleSrvError::timeout(format!(
                    "Receive from {addr} timed out after {io_timeout:?}"
                )))
            },
        }

        if rx_tid != tid {
            // A stale response means the request/response pairing is broken
            return Err(CycleSrvError::protocol(format!(
                "Transaction id mismatch: expected {tid}, got {rx_tid}"
            )));
        }
        if rx_unit != unit_id {
            return Err(CycleSrvError::protocol(format!(
                "Unit id mismatch: expected {unit_id}, got {rx_unit}"
            )));
        }

        self.stream = Some(stream);
        ModbusPdu::from_slice(&pdu_bytes)
    }

    async fn read_bit_with(&mut self, fc: u8, address: u16) -> Result<bool> {
        let request = match fc {
            function_codes::READ_COILS => ModbusCodec::build_read_fc01_coils_pdu(address, 1)?,
            function_codes::READ_DISCRETE_INPUTS => {
                ModbusCodec::build_read_fc02_discrete_inputs_pdu(address, 1)?
            },
            other => {
                return Err(CycleSrvError::protocol(format!(
                    "Unsupported bit function code: {other:02X}"
                )))
            },
        };
        let response = self.transact(&request).await?;
        let bits = ModbusCodec::parse_read_bits_response(&response, fc, 1)?;
        bits.first().copied().ok_or_else(|| {
            CycleSrvError::read(format!("No bits returned for address {address}"))
        })
    }
}

#[async_trait]
impl RegisterBus for ModbusTcpClient {
    async fn connect(&mut self) -> Result<()> {
        let addr = self.endpoint.addr();
        debug!("Connecting to station bus {addr}");

        match timeout(self.endpoint.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY on {addr}: {e}");
                }
                self.stream = Some(stream);
                debug!("Connected to station bus {addr}");
                Ok(())
            },
            Ok(Err(e)) => Err(CycleSrvError::connection(format!(
                "Failed to connect to {addr}: {e}"
            ))),
            Err(_) => Err(CycleSrvError::timeout(format!(
                "Connection to {addr} timed out"
            ))),
        }
    }

    async fn read_bit(&mut self, address: u16) -> Result<bool> {
        match self.endpoint.bit_read_method {
            BitReadMethod::Coils => self.read_bit_with(function_codes::READ_COILS, address).await,
            BitReadMethod::DiscreteInputs => {
                self.read_bit_with(function_codes::READ_DISCRETE_INPUTS, address)
                    .await
            },
            BitReadMethod::Auto => {
                match self.read_bit_with(function_codes::READ_COILS, address).await {
                    Ok(bit) => Ok(bit),
                    // Protocol-level rejection (e.g. illegal data address) may
                    // mean the relay is mapped to discrete inputs instead; a
                    // dead session is not retried here.
                    Err(e) if self.is_connected() => {
                        debug!("Coil read at {address} rejected ({e}), trying discrete inputs");
                        self.read_bit_with(function_codes::READ_DISCRETE_INPUTS, address)
                            .await
                    },
                    Err(e) => Err(e),
                }
            },
        }
    }

    async fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        let request = ModbusCodec::build_read_fc03_holding_registers_pdu(start, count)?;
        let response = self.transact(&request).await?;
        ModbusCodec::parse_read_registers_response(&response, count)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error during bus shutdown: {e}");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
