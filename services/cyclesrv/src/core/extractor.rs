//! Cycle measurement extraction
//!
//! On a detected completion edge, the extractor reads the register block
//! covering every schema field in one logical pass and decodes each named
//! field by its declared kind. A failed read yields an extraction error and
//! nothing else: no partial result can ever reach the ledger.

use tracing::{debug, warn};

use crate::config::{FieldSpec, StationConfig};
use crate::core::types::Extraction;
use crate::error::{CycleSrvError, Result};
use crate::protocols::modbus::codec::{ModbusCodec, MAX_READ_REGISTERS};
use crate::protocols::modbus::RegisterBus;

/// Generic schema-driven extractor
pub struct CycleExtractor;

impl CycleExtractor {
    /// Register span `(start, count)` covering every field of the schema
    pub fn block_span(fields: &[FieldSpec]) -> Result<(u16, u16)> {
        let mut start = u16::MAX;
        let mut end: u32 = 0;
        for field in fields {
            let span = field.kind.register_span(field.length);
            start = start.min(field.address);
            end = end.max(u32::from(field.address) + u32::from(span));
        }
        if end == 0 || start == u16::MAX {
            return Err(CycleSrvError::extraction("Register schema is empty"));
        }
        Ok((start, (end - u32::from(start)) as u16))
    }

    /// Read the variant sensor bit, when the station declares one.
    ///
    /// A failed variant read is not fatal to the extraction; the label falls
    /// back to the station default identity.
    pub async fn read_variant(
        bus: &mut dyn RegisterBus,
        station: &StationConfig,
    ) -> Option<bool> {
        let address = station.variant_address()?;
        match bus.read_bit(address).await {
            Ok(bit) => Some(bit),
            Err(e) => {
                warn!(
                    "Station {}: variant bit read at {} failed ({}), using default label",
                    station.code, address, e
                );
                None
            },
        }
    }

    /// Read and decode the full register block for one detected edge
    pub async fn extract(
        bus: &mut dyn RegisterBus,
        station: &StationConfig,
    ) -> Result<Extraction> {
        let (start, count) = Self::block_span(&station.fields)?;
        debug!(
            "Station {}: extracting {} registers from {}",
            station.code, count, start
        );

        // One logical pass; large blocks are chunked at the protocol limit
        let mut registers = Vec::with_capacity(usize::from(count));
        let mut offset: u16 = 0;
        while offset < count {
            let batch = (count - offset).min(MAX_READ_REGISTERS);
            let chunk = bus
                .read_registers(start + offset, batch)
                .await
                .map_err(|e| {
                    CycleSrvError::extraction(format!(
                        "Station {}: block read at {} failed: {}",
                        station.code,
                        start + offset,
                        e
                    ))
                })?;
            if chunk.len() != usize::from(batch) {
                return Err(CycleSrvError::extraction(format!(
                    "Station {}: short block read: {} registers, expected {}",
                    station.code,
                    chunk.len(),
                    batch
                )));
            }
            registers.extend_from_slice(&chunk);
            offset += batch;
        }

        let mut extraction = Extraction::default();
        for field in &station.fields {
            let index = usize::from(field.address - start);
            let value =
                ModbusCodec::decode_field(&registers[index..], field.kind, field.scale, field.length)
                    .map_err(|e| {
                        CycleSrvError::extraction(format!(
                            "Station {}: field '{}': {}",
                            station.code, field.name, e
                        ))
                    })?;
            extraction.fields.insert(field.name.clone(), value);
        }
        Ok(extraction)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::FieldKind;
    use crate::core::types::{CycleResult, FieldValue};
    use crate::protocols::mock::MockBus;

    fn test_station() -> StationConfig {
        let yaml = r#"
id: 1
code: CLU-01
host: 127.0.0.1
cycle_complete_bit: 221
variant_bit: 20
fields:
  - { name: torque_nm, address: 2700, kind: u16, scale: 0.01 }
  - { name: s1_for, address: 2704, kind: i16, scale: 0.001 }
  - { name: result, address: 2706, kind: u16 }
  - { name: barcode, address: 2710, kind: ascii, length: 8 }
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_block_span_covers_all_fields() {
        let station = test_station();
        let (start, count) = CycleExtractor::block_span(&station.fields).unwrap();
        assert_eq!(start, 2700);
        // barcode occupies 2710..2714
        assert_eq!(count, 14);
    }

    #[tokio::test]
    async fn test_extract_decodes_fields() {
        let station = test_station();
        let mut bus = MockBus::new();
        bus.set_register(2700, 1250); // 12.50 Nm
        bus.set_register(2704, (-32i16) as u16);
        bus.set_register(2706, 1);
        bus.set_register(2710, u16::from_be_bytes([b'C', b'L']));
        bus.set_register(2711, u16::from_be_bytes([b'U', b'1']));

        let extraction = CycleExtractor::extract(&mut bus, &station).await.unwrap();
        assert_eq!(
            extraction.fields.get("torque_nm"),
            Some(&FieldValue::Float(12.5))
        );
        assert_eq!(
            extraction.fields.get("s1_for"),
            Some(&FieldValue::Float(-0.032))
        );
        assert_eq!(extraction.result(), CycleResult::Ok);
        assert_eq!(extraction.barcode(), Some("CLU1"));
    }

    #[tokio::test]
    async fn test_extract_fails_on_read_error() {
        let station = test_station();
        let mut bus = MockBus::new();
        bus.fail_next_register_reads(1);

        let err = CycleExtractor::extract(&mut bus, &station).await.unwrap_err();
        assert!(matches!(err, CycleSrvError::ExtractionError(_)));
    }

    #[tokio::test]
    async fn test_variant_read_failure_is_non_fatal() {
        let station = test_station();
        let mut bus = MockBus::new();
        bus.fail_next_bit_reads(1);
        assert_eq!(CycleExtractor::read_variant(&mut bus, &station).await, None);
    }

    #[tokio::test]
    async fn test_variant_read() {
        let station = test_station();
        let mut bus = MockBus::new();
        bus.set_bit(station.variant_address().unwrap(), true);
        assert_eq!(
            CycleExtractor::read_variant(&mut bus, &station).await,
            Some(true)
        );
    }

    #[test]
    fn test_span_for_wide_schema_chunks() {
        // A block wider than one protocol read still has a single span
        let fields = vec![
            FieldSpec {
                name: "first".into(),
                address: 0,
                kind: FieldKind::U16,
                scale: None,
                length: None,
            },
            FieldSpec {
                name: "last".into(),
                address: 200,
                kind: FieldKind::U16,
                scale: None,
                length: None,
            },
        ];
        let (start, count) = CycleExtractor::block_span(&fields).unwrap();
        assert_eq!((start, count), (0, 201));
    }
}
