//! Service configuration
//!
//! Loaded from a YAML file with `CYCLESRV_`-prefixed environment overrides.
//! Register addresses are configuration, not code: each station declares its
//! completion bit and a declarative field schema interpreted by the generic
//! extractor.

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{CycleSrvError, Result};

/// Default API port
pub const DEFAULT_PORT: u16 = 8530;

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service identity
    #[serde(default)]
    pub service: ServiceSection,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Record store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Station configurations
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable API
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API host
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path; `:memory:` selects the in-memory store
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Method used for reading completion/variant bits
///
/// Some Mitsubishi-style PLCs map internal relays to discrete inputs rather
/// than coils; `Auto` tries coils first and falls back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitReadMethod {
    Coils,
    DiscreteInputs,
    Auto,
}

impl Default for BitReadMethod {
    fn default() -> Self {
        Self::Coils
    }
}

/// Declared type of one register field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    U16,
    I16,
    U32,
    F32,
    Ascii,
}

impl FieldKind {
    /// Number of 16-bit registers the field occupies
    pub fn register_span(&self, length: Option<u16>) -> u16 {
        match self {
            FieldKind::U16 | FieldKind::I16 => 1,
            FieldKind::U32 | FieldKind::F32 => 2,
            // Two ASCII characters per register
            FieldKind::Ascii => length.unwrap_or(0).div_ceil(2),
        }
    }
}

/// One named field in a station's register schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Data-register address of the field's first register
    pub address: u16,
    pub kind: FieldKind,
    /// Multiplier applied to numeric kinds after decoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    /// Character count for `ascii` fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u16>,
}

/// Identity fields embedded in the label code
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelIdentity {
    #[serde(default)]
    pub part_name: String,
    #[serde(default)]
    pub part_no: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub vendor_code: String,
}

/// Network label printer endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterConfig {
    pub host: String,
    #[serde(default = "default_printer_port")]
    pub port: u16,
    #[serde(default = "default_printer_timeout_ms")]
    pub timeout_ms: u64,
    /// Optional footer line printed under the part description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
}

impl PrinterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration for one monitored station
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    pub id: u32,
    /// Unique short code, embedded in cycle numbers
    pub code: String,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_plc_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Offset added to internal-relay bit numbers to get Modbus addresses
    /// (Mitsubishi FX5U maps M0 to 8192)
    #[serde(default = "default_bit_offset")]
    pub bit_offset: u16,
    #[serde(default)]
    pub bit_read_method: BitReadMethod,
    /// Relay bit number whose rising edge marks cycle completion
    pub cycle_complete_bit: u16,
    /// Relay bit number selecting the AT label variant when ON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_bit: Option<u16>,
    /// Register schema decoded on each completion edge
    pub fields: Vec<FieldSpec>,
    /// Default label identity
    #[serde(default)]
    pub label: LabelIdentity,
    /// Variant label identity used when `variant_bit` reads ON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_at: Option<LabelIdentity>,
    /// Variant label identity used when `variant_bit` reads OFF
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_mt: Option<LabelIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printer: Option<PrinterConfig>,
    /// Start monitoring this station at service startup
    #[serde(default)]
    pub monitoring: bool,
}

impl StationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Modbus address of the completion bit
    pub fn completion_address(&self) -> u16 {
        self.cycle_complete_bit.wrapping_add(self.bit_offset)
    }

    /// Modbus address of the variant sensor bit
    pub fn variant_address(&self) -> Option<u16> {
        self.variant_bit.map(|b| b.wrapping_add(self.bit_offset))
    }

    /// Label identity for the given variant reading, falling back to the
    /// station default for any empty component.
    pub fn label_for_variant(&self, at_bit_on: Option<bool>) -> LabelIdentity {
        let variant = match at_bit_on {
            Some(true) => self.label_at.as_ref(),
            Some(false) => self.label_mt.as_ref(),
            None => None,
        };
        match variant {
            Some(v) => LabelIdentity {
                part_name: pick(&v.part_name, &self.label.part_name),
                part_no: pick(&v.part_no, &self.label.part_no),
                revision: pick(&v.revision, &self.label.revision),
                vendor_code: pick(&v.vendor_code, &self.label.vendor_code),
            },
            None => self.label.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(CycleSrvError::config(format!(
                "Station {}: code must not be empty",
                self.id
            )));
        }
        if self.host.trim().is_empty() {
            return Err(CycleSrvError::config(format!(
                "Station {}: host must not be empty",
                self.code
            )));
        }
        if self.timeout_ms == 0 {
            return Err(CycleSrvError::config(format!(
                "Station {}: timeout_ms must be greater than zero",
                self.code
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(CycleSrvError::config(format!(
                "Station {}: poll_interval_ms must be greater than zero",
                self.code
            )));
        }
        if self.fields.is_empty() {
            return Err(CycleSrvError::config(format!(
                "Station {}: register schema must declare at least one field",
                self.code
            )));
        }
        let mut names = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(CycleSrvError::config(format!(
                    "Station {}: duplicate field name '{}'",
                    self.code, field.name
                )));
            }
            match field.kind {
                FieldKind::Ascii => {
                    if field.length.unwrap_or(0) == 0 {
                        return Err(CycleSrvError::config(format!(
                            "Station {}: ascii field '{}' requires a length",
                            self.code, field.name
                        )));
                    }
                    if field.scale.is_some() {
                        return Err(CycleSrvError::config(format!(
                            "Station {}: ascii field '{}' cannot carry a scale",
                            self.code, field.name
                        )));
                    }
                },
                _ => {
                    if field.length.is_some() {
                        return Err(CycleSrvError::config(format!(
                            "Station {}: field '{}': only ascii fields take a length",
                            self.code, field.name
                        )));
                    }
                },
            }
            let span = field.kind.register_span(field.length);
            if u32::from(field.address) + u32::from(span) > u32::from(u16::MAX) {
                return Err(CycleSrvError::config(format!(
                    "Station {}: field '{}' exceeds the register address space",
                    self.code, field.name
                )));
            }
        }
        Ok(())
    }
}

impl ServiceConfig {
    /// Load configuration from a YAML file merged with environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: ServiceConfig = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("CYCLESRV_").split("__"))
            .extract()
            .map_err(|e| CycleSrvError::config(format!("Failed to load configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-station invariants and each station's schema
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut codes = HashSet::new();
        for station in &self.stations {
            if !ids.insert(station.id) {
                return Err(CycleSrvError::config(format!(
                    "Duplicate station id: {}",
                    station.id
                )));
            }
            if !codes.insert(station.code.as_str()) {
                return Err(CycleSrvError::config(format!(
                    "Duplicate station code: {}",
                    station.code
                )));
            }
            station.validate()?;
        }
        Ok(())
    }

    pub fn station(&self, id: u32) -> Option<&StationConfig> {
        self.stations.iter().find(|s| s.id == id)
    }
}

fn pick(preferred: &str, fallback: &str) -> String {
    if preferred.is_empty() {
        fallback.to_string()
    } else {
        preferred.to_string()
    }
}

fn default_service_name() -> String {
    "cyclesrv".to_string()
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    DEFAULT_PORT
}

fn default_store_path() -> String {
    "cyclesrv.db".to_string()
}

fn default_plc_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_bit_offset() -> u16 {
    8192
}

fn default_printer_port() -> u16 {
    9100
}

fn default_printer_timeout_ms() -> u64 {
    5000
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn station_yaml() -> &'static str {
        r#"
stations:
  - id: 1
    code: BRK-01
    name: Brake line 1
    host: 192.168.1.50
    cycle_complete_bit: 2000
    fields:
      - { name: torque_nm, address: 2700, kind: u16, scale: 0.01 }
      - { name: initial_position, address: 2701, kind: i16, scale: 0.001 }
      - { name: cycle_time, address: 2720, kind: f32 }
      - { name: result, address: 2730, kind: u16 }
      - { name: barcode, address: 2740, kind: ascii, length: 32 }
    label:
      part_name: BRAKE ASSEMBLY
      part_no: BRK88812
      revision: A
      vendor_code: V042
"#
    }

    fn parse(yaml: &str) -> ServiceConfig {
        let config: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        config
    }

    #[test]
    fn test_station_defaults() {
        let config = parse(station_yaml());
        config.validate().unwrap();
        let s = &config.stations[0];
        assert_eq!(s.port, 502);
        assert_eq!(s.unit_id, 1);
        assert_eq!(s.timeout_ms, 5000);
        assert_eq!(s.poll_interval_ms, 1000);
        assert_eq!(s.bit_offset, 8192);
        assert_eq!(s.bit_read_method, BitReadMethod::Coils);
        assert_eq!(s.completion_address(), 8192 + 2000);
        assert!(!s.monitoring);
    }

    #[test]
    fn test_field_span() {
        assert_eq!(FieldKind::U16.register_span(None), 1);
        assert_eq!(FieldKind::F32.register_span(None), 2);
        assert_eq!(FieldKind::Ascii.register_span(Some(32)), 16);
        assert_eq!(FieldKind::Ascii.register_span(Some(31)), 16);
    }

    #[test]
    fn test_duplicate_station_code_rejected() {
        let mut config = parse(station_yaml());
        let mut dup = config.stations[0].clone();
        dup.id = 2;
        config.stations.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ascii_without_length_rejected() {
        let mut config = parse(station_yaml());
        config.stations[0].fields.push(FieldSpec {
            name: "lot".into(),
            address: 2800,
            kind: FieldKind::Ascii,
            scale: None,
            length: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_schema_rejected() {
        let mut config = parse(station_yaml());
        config.stations[0].fields.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_variant_label_fallback() {
        let mut config = parse(station_yaml());
        config.stations[0].variant_bit = Some(20);
        config.stations[0].label_at = Some(LabelIdentity {
            part_name: "BRAKE-AT".into(),
            part_no: "BRK88812AT".into(),
            revision: String::new(),
            vendor_code: String::new(),
        });
        let s = &config.stations[0];

        let at = s.label_for_variant(Some(true));
        assert_eq!(at.part_no, "BRK88812AT");
        // Empty variant components fall back to the station default
        assert_eq!(at.revision, "A");

        let mt = s.label_for_variant(Some(false));
        assert_eq!(mt.part_no, "BRK88812");
    }
}
