use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::motor::MotionProfile;
use crate::packet::MAX_ID;
use crate::registers::ByteOrder;

/// Limits written by calibration. Voltages in 0.1 V, temperature in °C.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub min_voltage: u8,
    pub max_voltage: u8,
    pub max_temperature: u8,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_voltage: 40,
            max_voltage: 140,
            max_temperature: 70,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorEntry {
    pub name: String,
    pub id: u8,
}

/// One bus and the servos on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Fixed response timeout; derived from the baud rate when absent.
    pub timeout_ms: Option<u64>,
    pub byte_order: ByteOrder,
    pub motion: MotionProfile,
    pub limits: Limits,
    pub motors: Vec<MotorEntry>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: serial_transport::DEFAULT_BAUD_RATE,
            timeout_ms: None,
            byte_order: ByteOrder::default(),
            motion: MotionProfile::default(),
            limits: Limits::default(),
            motors: Vec::new(),
        }
    }
}

impl BusConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn motor_ids(&self) -> Vec<u8> {
        self.motors.iter().map(|m| m.id).collect()
    }

    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.motors.iter().find(|m| m.name == name).map(|m| m.id)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.baud_rate == 0 {
            bail!("baud_rate must be nonzero");
        }
        let mut seen = HashSet::new();
        for motor in &self.motors {
            if motor.id > MAX_ID {
                bail!("motor {} has id {} above {}", motor.name, motor.id, MAX_ID);
            }
            if !seen.insert(motor.id) {
                bail!("motor id {} is used twice", motor.id);
            }
        }
        if self.limits.min_voltage > self.limits.max_voltage {
            bail!(
                "min_voltage {} exceeds max_voltage {}",
                self.limits.min_voltage,
                self.limits.max_voltage
            );
        }
        Ok(())
    }
}

pub fn parse_config(raw: &str) -> anyhow::Result<BusConfig> {
    let val: Value = serde_yaml::from_str(raw).context("parsing yaml")?;
    if val.is_null() {
        return Ok(BusConfig::default());
    }
    let config: BusConfig = serde_yaml::from_value(val).context("decoding bus config")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<BusConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading bus config: {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("loading bus config: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = parse_config("").unwrap();
        assert_eq!(config, BusConfig::default());
        assert_eq!(config.baud_rate, 1_000_000);
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let raw = r#"
port: /dev/ttyUSB0
byte_order: big
motion:
  speed: 1200
motors:
  - { name: shoulder, id: 41 }
  - { name: elbow, id: 42 }
"#;
        let config = parse_config(raw).unwrap();
        assert_eq!(config.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.byte_order, ByteOrder::Big);
        assert_eq!(config.motion.speed, 1200);
        assert_eq!(config.motion.acceleration, 25);
        assert_eq!(config.limits, Limits::default());
        assert_eq!(config.motor_ids(), vec![41, 42]);
        assert_eq!(config.id_of("elbow"), Some(42));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let raw = "motors:\n  - { name: a, id: 3 }\n  - { name: b, id: 3 }\n";
        assert!(parse_config(raw).is_err());
    }

    #[test]
    fn broadcast_id_is_rejected() {
        let raw = "motors:\n  - { name: all, id: 254 }\n";
        assert!(parse_config(raw).is_err());
    }

    #[test]
    fn missing_file_names_path() {
        let err = load_config_file("/nonexistent/bus.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/bus.yaml"));
    }
}
