//! In-process Modbus TCP simulator
//!
//! A minimal server used by tests: serves coil, discrete-input, and
//! holding-register banks from in-memory maps, and can be told to reject
//! coil reads with an illegal-data-address exception to exercise fallback
//! paths.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{CycleSrvError, Result};

use super::codec::{function_codes, ModbusCodec, MBAP_HEADER_LEN};

#[derive(Default)]
struct SimState {
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
    registers: HashMap<u16, u16>,
    reject_coils: bool,
}

/// Simulated Modbus TCP device bound to an ephemeral localhost port
pub struct BusSimulator {
    port: u16,
    state: Arc<Mutex<SimState>>,
    accept_task: Option<JoinHandle<()>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BusSimulator {
    /// Bind to an ephemeral port and start serving
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| CycleSrvError::connection(format!("Simulator bind failed: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| CycleSrvError::internal(format!("Simulator local_addr: {e}")))?
            .port();

        let state = Arc::new(Mutex::new(SimState::default()));
        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_state = Arc::clone(&state);
        let accept_connections = Arc::clone(&connections);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!("Simulator accepted connection from {peer}");
                        let conn_state = Arc::clone(&accept_state);
                        let handle = tokio::spawn(async move {
                            let _ = Self::serve_connection(socket, conn_state).await;
                        });
                        accept_connections.lock().push(handle);
                    },
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            port,
            state,
            accept_task: Some(accept_task),
            connections,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.state.lock().coils.insert(address, value);
    }

    pub fn set_discrete_input(&self, address: u16, value: bool) {
        self.state.lock().discrete_inputs.insert(address, value);
    }

    /// Load consecutive holding registers starting at `start`
    pub fn set_registers(&self, start: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (i, value) in values.iter().enumerate() {
            state.registers.insert(start + i as u16, *value);
        }
    }

    /// Respond to FC01 with an illegal-data-address exception
    pub fn reject_coils(&self, reject: bool) {
        self.state.lock().reject_coils = reject;
    }

    /// Stop accepting and drop every open connection
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for handle in self.connections.lock().drain(..) {
            handle.abort();
        }
        // Give aborted tasks a tick to release their sockets
        tokio::task::yield_now().await;
    }

    async fn serve_connection(mut socket: TcpStream, state: Arc<Mutex<SimState>>) -> Result<()> {
        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            if socket.read_exact(&mut header).await.is_err() {
                return Ok(()); // peer closed
            }
            let (tid, unit_id, pdu_len) = ModbusCodec::parse_mbap_header(&header)?;

            let mut pdu = vec![0u8; pdu_len];
            if socket.read_exact(&mut pdu).await.is_err() {
                return Ok(());
            }

            let response_pdu = Self::handle_request(&pdu, &state);
            let mut response = Vec::with_capacity(MBAP_HEADER_LEN + response_pdu.len());
            response.extend_from_slice(&tid.to_be_bytes());
            response.extend_from_slice(&0u16.to_be_bytes());
            response.extend_from_slice(&((response_pdu.len() as u16 + 1).to_be_bytes()));
            response.push(unit_id);
            response.extend_from_slice(&response_pdu);

            if socket.write_all(&response).await.is_err() {
                return Ok(());
            }
        }
    }

    fn handle_request(pdu: &[u8], state: &Arc<Mutex<SimState>>) -> Vec<u8> {
        if pdu.len() < 5 {
            return vec![0x80, 0x03]; // illegal data value
        }
        let fc = pdu[0];
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
        let state = state.lock();

        match fc {
            function_codes::READ_COILS => {
                if state.reject_coils {
                    return vec![fc | 0x80, 0x02]; // illegal data address
                }
                Self::bit_response(fc, address, quantity, &state.coils)
            },
            function_codes::READ_DISCRETE_INPUTS => {
                Self::bit_response(fc, address, quantity, &state.discrete_inputs)
            },
            function_codes::READ_HOLDING_REGISTERS => {
                let mut response = vec![fc, (quantity * 2) as u8];
                for i in 0..quantity {
                    let value = state
                        .registers
                        .get(&(address + i))
                        .copied()
                        .unwrap_or(0);
                    response.extend_from_slice(&value.to_be_bytes());
                }
                response
            },
            _ => vec![fc | 0x80, 0x01], // illegal function
        }
    }

    fn bit_response(fc: u8, address: u16, quantity: u16, bank: &HashMap<u16, bool>) -> Vec<u8> {
        let byte_count = usize::from(quantity).div_ceil(8);
        let mut response = vec![fc, byte_count as u8];
        response.resize(2 + byte_count, 0);
        for i in 0..quantity {
            if bank.get(&(address + i)).copied().unwrap_or(false) {
                response[2 + usize::from(i) / 8] |= 1 << (i % 8);
            }
        }
        response
    }
}

impl Drop for BusSimulator {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for handle in self.connections.lock().drain(..) {
            handle.abort();
        }
    }
}
