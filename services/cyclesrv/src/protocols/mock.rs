//! Mock register bus
//!
//! Scripted [`RegisterBus`] implementation used by extractor and scheduler
//! tests: per-address bit sequences with hold-last semantics, a register
//! bank, and injectable connect/read failures.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;

use crate::error::{CycleSrvError, Result};
use crate::protocols::modbus::RegisterBus;

#[derive(Default)]
struct BitScript {
    sequence: VecDeque<bool>,
    last: bool,
}

impl BitScript {
    fn next(&mut self) -> bool {
        if let Some(value) = self.sequence.pop_front() {
            self.last = value;
        }
        self.last
    }
}

/// Scripted in-memory bus
#[derive(Default)]
pub struct MockBus {
    connected: bool,
    bits: HashMap<u16, BitScript>,
    registers: HashMap<u16, u16>,
    fail_connects: usize,
    fail_bit_reads: usize,
    fail_register_reads: usize,
    pub bit_reads: u64,
    pub register_reads: u64,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }

    /// Fixed bit value at an address
    pub fn set_bit(&mut self, address: u16, value: bool) {
        self.bits.entry(address).or_default().last = value;
    }

    /// Scripted bit sequence at an address; the final value holds afterwards
    pub fn set_bit_sequence(&mut self, address: u16, values: impl IntoIterator<Item = bool>) {
        let script = self.bits.entry(address).or_default();
        script.sequence.extend(values);
    }

    pub fn set_register(&mut self, address: u16, value: u16) {
        self.registers.insert(address, value);
    }

    pub fn set_registers(&mut self, start: u16, values: &[u16]) {
        for (i, value) in values.iter().enumerate() {
            self.registers.insert(start + i as u16, *value);
        }
    }

    /// Fail the next `n` connect attempts
    pub fn fail_next_connects(&mut self, n: usize) {
        self.connected = false;
        self.fail_connects = n;
    }

    /// Fail the next `n` bit reads and drop the session on each
    pub fn fail_next_bit_reads(&mut self, n: usize) {
        self.fail_bit_reads = n;
    }

    /// Fail the next `n` register reads and drop the session on each
    pub fn fail_next_register_reads(&mut self, n: usize) {
        self.fail_register_reads = n;
    }
}

#[async_trait]
impl RegisterBus for MockBus {
    async fn connect(&mut self) -> Result<()> {
        if self.fail_connects > 0 {
            self.fail_connects -= 1;
            return Err(CycleSrvError::connection("Mock connect failure"));
        }
        self.connected = true;
        Ok(())
    }

    async fn read_bit(&mut self, address: u16) -> Result<bool> {
        if !self.connected {
            return Err(CycleSrvError::not_connected());
        }
        self.bit_reads += 1;
        if self.fail_bit_reads > 0 {
            self.fail_bit_reads -= 1;
            self.connected = false;
            return Err(CycleSrvError::read("Mock bit read failure"));
        }
        Ok(self.bits.entry(address).or_default().next())
    }

    async fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        if !self.connected {
            return Err(CycleSrvError::not_connected());
        }
        self.register_reads += 1;
        if self.fail_register_reads > 0 {
            self.fail_register_reads -= 1;
            self.connected = false;
            return Err(CycleSrvError::read("Mock register read failure"));
        }
        Ok((0..count)
            .map(|i| self.registers.get(&(start + i)).copied().unwrap_or(0))
            .collect())
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bit_sequence_holds_last() {
        let mut bus = MockBus::new();
        bus.set_bit_sequence(100, [false, true]);
        assert!(!bus.read_bit(100).await.unwrap());
        assert!(bus.read_bit(100).await.unwrap());
        assert!(bus.read_bit(100).await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_injection_drops_session() {
        let mut bus = MockBus::new();
        bus.fail_next_bit_reads(1);
        assert!(bus.read_bit(0).await.is_err());
        assert!(!bus.is_connected());
        assert!(bus.read_bit(0).await.is_err());

        bus.connect().await.unwrap();
        assert!(!bus.read_bit(0).await.unwrap());
    }
}
