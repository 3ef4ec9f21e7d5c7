use gateway_proto::ByteOrder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    String,
}

impl DataType {
    /// Register count a Modbus-addressed tag of this type occupies.
    /// `bool` on a coil/discrete address is one bit, not a register, and is
    /// handled separately by the caller.
    pub fn register_count(self) -> u16 {
        match self {
            DataType::Bool | DataType::Int16 | DataType::Uint16 => 1,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 2,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 4,
            DataType::String => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
    Discrete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusAddress {
    pub register_type: RegisterType,
    /// 0-based register address.
    pub address: u16,
    pub length: u16,
    pub unit_id: Option<u8>,
    pub byte_order: Option<ByteOrder>,
}

impl ModbusAddress {
    /// Parse classic Modicon/IEC reference forms: 5- and 6-digit numeric
    /// offsets (40001-49999 holding, 30001-39999 input, 00001-09999 coil,
    /// 10001-19999 discrete) and the `HR###`/`IR###`/`C###`/`DI###` IEC
    /// form. Plain bare numbers are rejected — the caller must say which
    /// register type they mean.
    pub fn parse_modicon(reference: &str) -> Result<(RegisterType, u16), ConfigError> {
        let r = reference.trim();
        if let Some(rest) = r.strip_prefix("HR").or_else(|| r.strip_prefix("hr")) {
            return parse_offset(rest).map(|n| (RegisterType::Holding, n));
        }
        if let Some(rest) = r.strip_prefix("IR").or_else(|| r.strip_prefix("ir")) {
            return parse_offset(rest).map(|n| (RegisterType::Input, n));
        }
        if let Some(rest) = r.strip_prefix("DI").or_else(|| r.strip_prefix("di")) {
            return parse_offset(rest).map(|n| (RegisterType::Discrete, n));
        }
        if let Some(rest) = r.strip_prefix('C').or_else(|| r.strip_prefix('c')) {
            return parse_offset(rest).map(|n| (RegisterType::Coil, n));
        }
        if r.chars().all(|c| c.is_ascii_digit()) && (r.len() == 5 || r.len() == 6) {
            let n: u32 = r.parse().map_err(|_| ConfigError::Address(reference.to_string()))?;
            return match n {
                40001..=49999 => Ok((RegisterType::Holding, (n - 40001) as u16)),
                400001..=465536 => Ok((RegisterType::Holding, (n - 400001) as u16)),
                30001..=39999 => Ok((RegisterType::Input, (n - 30001) as u16)),
                300001..=365536 => Ok((RegisterType::Input, (n - 300001) as u16)),
                1..=9999 => Ok((RegisterType::Coil, (n - 1) as u16)),
                10001..=19999 => Ok((RegisterType::Discrete, (n - 10001) as u16)),
                _ => Err(ConfigError::Address(reference.to_string())),
            };
        }
        Err(ConfigError::Address(reference.to_string()))
    }
}

fn parse_offset(rest: &str) -> Result<u16, ConfigError> {
    rest.parse().map_err(|_| ConfigError::Address(rest.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttAddress {
    /// May contain `+` (single level) and `#` (multi level, trailing only)
    /// wildcards per the MQTT topic grammar.
    pub topic: String,
    pub json_path: Option<String>,
}

fn default_attribute_id() -> u32 {
    13 // Value
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcUaAddress {
    pub node_id: String,
    #[serde(default = "default_attribute_id")]
    pub attribute_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TagAddress {
    Modbus(ModbusAddress),
    Mqtt(MqttAddress),
    OpcUa(OpcUaAddress),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub name: String,
    pub address: TagAddress,
    pub data_type: DataType,
    pub enabled: bool,
}

impl Tag {
    /// Register-count invariant: a Modbus tag's address.length must
    /// agree with what its data_type needs, except bools on bit-addressable
    /// register types which occupy one bit rather than one register.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let TagAddress::Modbus(addr) = &self.address {
            let is_bit_type = matches!(addr.register_type, RegisterType::Coil | RegisterType::Discrete);
            if self.data_type == DataType::Bool && is_bit_type {
                return Ok(());
            }
            let expected = self.data_type.register_count();
            if addr.length != expected {
                return Err(ConfigError::Invalid {
                    field: "address.length",
                    reason: format!(
                        "{:?} requires {} register(s), tag declares {}",
                        self.data_type, expected, addr.length
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_classic_holding_reference() {
        let (rt, addr) = ModbusAddress::parse_modicon("40003").unwrap();
        assert_eq!(rt, RegisterType::Holding);
        assert_eq!(addr, 2);
    }

    #[test]
    fn parses_iec_form() {
        let (rt, addr) = ModbusAddress::parse_modicon("IR12").unwrap();
        assert_eq!(rt, RegisterType::Input);
        assert_eq!(addr, 12);
    }

    #[test]
    fn rejects_bare_number() {
        assert!(ModbusAddress::parse_modicon("123").is_err());
    }

    #[test]
    fn validates_register_count_for_32_bit_types() {
        let tag = Tag {
            id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            name: "t".into(),
            address: TagAddress::Modbus(ModbusAddress {
                register_type: RegisterType::Holding,
                address: 0,
                length: 1,
                unit_id: None,
                byte_order: None,
            }),
            data_type: DataType::Float32,
            enabled: true,
        };
        assert!(tag.validate().is_err());
    }
}
