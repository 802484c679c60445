//! Modbus codec
//!
//! Read-request PDU construction, MBAP (Modbus TCP) frame build/parse, and
//! decoding of register data into typed field values.

use crate::config::FieldKind;
use crate::core::types::FieldValue;
use crate::error::{CycleSrvError, Result};

use super::pdu::{ModbusPdu, PduBuilder};

/// MBAP header length (transaction id, protocol id, length, unit id)
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum bit quantity in one FC01/FC02 request
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum register quantity in one FC03 request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Function codes used by this service
pub mod function_codes {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
}

/// Modbus codec for request building and response decoding
pub struct ModbusCodec;

impl ModbusCodec {
    /// Build read PDU for FC01 (Read Coils)
    pub fn build_read_fc01_coils_pdu(address: u16, quantity: u16) -> Result<ModbusPdu> {
        Self::build_read_bits_pdu(function_codes::READ_COILS, address, quantity)
    }

    /// Build read PDU for FC02 (Read Discrete Inputs)
    pub fn build_read_fc02_discrete_inputs_pdu(address: u16, quantity: u16) -> Result<ModbusPdu> {
        Self::build_read_bits_pdu(function_codes::READ_DISCRETE_INPUTS, address, quantity)
    }

    fn build_read_bits_pdu(fc: u8, address: u16, quantity: u16) -> Result<ModbusPdu> {
        if quantity == 0 || quantity > MAX_READ_BITS {
            return Err(CycleSrvError::protocol(format!(
                "Invalid bit quantity {quantity} for FC{fc:02X}"
            )));
        }
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(address)?
            .quantity(quantity)?
            .build())
    }

    /// Build read PDU for FC03 (Read Holding Registers)
    pub fn build_read_fc03_holding_registers_pdu(
        address: u16,
        quantity: u16,
    ) -> Result<ModbusPdu> {
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(CycleSrvError::protocol(format!(
                "Invalid register quantity {quantity} for FC03"
            )));
        }
        Ok(PduBuilder::new()
            .function_code(function_codes::READ_HOLDING_REGISTERS)?
            .address(address)?
            .quantity(quantity)?
            .build())
    }

    /// Parse an FC01/FC02 response into bit values
    pub fn parse_read_bits_response(
        pdu: &ModbusPdu,
        expected_fc: u8,
        quantity: u16,
    ) -> Result<Vec<bool>> {
        let data = Self::response_payload(pdu, expected_fc)?;
        let expected_bytes = usize::from(quantity).div_ceil(8);
        if data.len() < expected_bytes {
            return Err(CycleSrvError::protocol(format!(
                "Short bit response: {} bytes, expected {}",
                data.len(),
                expected_bytes
            )));
        }

        let mut bits = Vec::with_capacity(usize::from(quantity));
        for i in 0..usize::from(quantity) {
            let byte = data[i / 8];
            bits.push(byte & (1 << (i % 8)) != 0);
        }
        Ok(bits)
    }

    /// Parse an FC03 response into register values
    pub fn parse_read_registers_response(pdu: &ModbusPdu, quantity: u16) -> Result<Vec<u16>> {
        let data = Self::response_payload(pdu, function_codes::READ_HOLDING_REGISTERS)?;
        let expected_bytes = usize::from(quantity) * 2;
        if data.len() < expected_bytes {
            return Err(CycleSrvError::protocol(format!(
                "Short register response: {} bytes, expected {}",
                data.len(),
                expected_bytes
            )));
        }

        let mut registers = Vec::with_capacity(usize::from(quantity));
        for chunk in data[..expected_bytes].chunks_exact(2) {
            registers.push(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        Ok(registers)
    }

    /// Validate a read response and return its byte-count-prefixed payload
    fn response_payload<'a>(pdu: &'a ModbusPdu, expected_fc: u8) -> Result<&'a [u8]> {
        let data = pdu.as_slice();
        if data.is_empty() {
            return Err(CycleSrvError::protocol("Empty response PDU"));
        }
        if pdu.is_exception() {
            return Err(CycleSrvError::read(format!(
                "Modbus exception response: function {:02X}, code {:02X}",
                data[0] & 0x7F,
                pdu.exception_code().unwrap_or(0)
            )));
        }
        if data[0] != expected_fc {
            return Err(CycleSrvError::protocol(format!(
                "Function code mismatch: expected {:02X}, got {:02X}",
                expected_fc, data[0]
            )));
        }
        if data.len() < 2 {
            return Err(CycleSrvError::protocol("Response missing byte count"));
        }
        let byte_count = usize::from(data[1]);
        let payload = &data[2..];
        if payload.len() < byte_count {
            return Err(CycleSrvError::protocol(format!(
                "Truncated response: {} payload bytes, byte count {}",
                payload.len(),
                byte_count
            )));
        }
        Ok(&payload[..byte_count])
    }

    // ========================================================================
    // MBAP framing (Modbus TCP)
    // ========================================================================

    /// Build a complete MBAP frame around a PDU
    pub fn build_mbap_frame(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes()); // protocol id
        frame.extend_from_slice(&((pdu.len() as u16 + 1).to_be_bytes())); // unit id + PDU
        frame.push(unit_id);
        frame.extend_from_slice(pdu.as_slice());
        frame
    }

    /// Parse an MBAP header, returning `(transaction_id, unit_id, pdu_len)`
    pub fn parse_mbap_header(header: &[u8]) -> Result<(u16, u8, usize)> {
        if header.len() < MBAP_HEADER_LEN {
            return Err(CycleSrvError::protocol(format!(
                "Short MBAP header: {} bytes",
                header.len()
            )));
        }
        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        if protocol_id != 0 {
            return Err(CycleSrvError::protocol(format!(
                "Unexpected MBAP protocol id: {protocol_id}"
            )));
        }
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        if length == 0 || length > super::pdu::MAX_PDU_SIZE + 1 {
            return Err(CycleSrvError::protocol(format!(
                "Invalid MBAP length field: {length}"
            )));
        }
        let unit_id = header[6];
        Ok((transaction_id, unit_id, length - 1))
    }

    // ========================================================================
    // Register value decoding
    // ========================================================================

    /// Decode one schema field from its register slice.
    ///
    /// Multi-register values use big-endian word order (high word first), the
    /// convention of the Mitsubishi-style controllers this service targets.
    pub fn decode_field(
        registers: &[u16],
        kind: FieldKind,
        scale: Option<f64>,
        length: Option<u16>,
    ) -> Result<FieldValue> {
        let span = usize::from(kind.register_span(length));
        if registers.len() < span {
            return Err(CycleSrvError::protocol(format!(
                "Field span {} exceeds available registers ({})",
                span,
                registers.len()
            )));
        }

        let value = match kind {
            FieldKind::U16 => Self::apply_scale(i64::from(registers[0]), scale),
            FieldKind::I16 => Self::apply_scale(i64::from(registers[0] as i16), scale),
            FieldKind::U32 => {
                let raw = (u32::from(registers[0]) << 16) | u32::from(registers[1]);
                Self::apply_scale(i64::from(raw), scale)
            },
            FieldKind::F32 => {
                let bits = (u32::from(registers[0]) << 16) | u32::from(registers[1]);
                let raw = f64::from(f32::from_bits(bits));
                FieldValue::Float(raw * scale.unwrap_or(1.0))
            },
            FieldKind::Ascii => {
                let chars = usize::from(length.unwrap_or(0));
                let mut text = String::with_capacity(chars);
                for reg in &registers[..span] {
                    // High byte first, then low byte
                    text.push(char::from((reg >> 8) as u8));
                    text.push(char::from((reg & 0xFF) as u8));
                }
                text.truncate(chars);
                let trimmed = text.trim_end_matches(['\0', ' ']).to_string();
                FieldValue::Text(trimmed)
            },
        };
        Ok(value)
    }

    fn apply_scale(raw: i64, scale: Option<f64>) -> FieldValue {
        match scale {
            Some(s) => FieldValue::Float(raw as f64 * s),
            None => FieldValue::Int(raw),
        }
    }
}
