//! Simulator configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) gives the stock
//! bench setup: Modbus unit 2 on `/tmp/vcom2` and the ASCII harness on
//! `/tmp/vcom4`, each behind its own null-modem pair.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::{
    core::null_modem::NullModemConfig,
    device::{Channel, AMPLITUDE_MAX, AMPLITUDE_MIN, CHANNEL_COUNT},
    error::SimError,
    protocol::modbus::{RegisterLayout, RegisterMap, DEFAULT_BAUD_RATE, DEFAULT_UNIT_ID},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Bound on joining both serving workers at shutdown.
    pub shutdown_timeout_ms: u64,
    pub modbus: ModbusConfig,
    pub ascii: AsciiConfig,
    pub device: DeviceConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 2000,
            modbus: ModbusConfig::default(),
            ascii: AsciiConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub enabled: bool,
    /// Start a null-modem pair for this endpoint.
    pub provision: bool,
    /// Port to serve on; defaults to the null-modem's server side.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub unit_id: u8,
    /// Serial read timeout; also the inter-frame silence.
    pub read_timeout_ms: u64,
    pub null_modem: NullModemConfig,
    pub layout: RegisterLayout,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provision: true,
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            unit_id: DEFAULT_UNIT_ID,
            read_timeout_ms: 20,
            null_modem: NullModemConfig::modbus(),
            layout: RegisterLayout::default(),
        }
    }
}

impl ModbusConfig {
    pub fn server_port(&self) -> String {
        self.port
            .clone()
            .unwrap_or_else(|| self.null_modem.server_path.display().to_string())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsciiConfig {
    pub enabled: bool,
    pub provision: bool,
    pub port: Option<String>,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    /// Name reported by `INFO`.
    pub identity: String,
    pub null_modem: NullModemConfig,
}

impl Default for AsciiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provision: true,
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 50,
            identity: env!("CARGO_PKG_NAME").to_string(),
            null_modem: NullModemConfig::ascii(),
        }
    }
}

impl AsciiConfig {
    pub fn server_port(&self) -> String {
        self.port
            .clone()
            .unwrap_or_else(|| self.null_modem.server_path.display().to_string())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

/// Power-on state applied to every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub frequency_hz: u16,
    pub power_w: f32,
    pub amplitude_setpoint: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let channel = Channel::default();
        Self {
            frequency_hz: channel.frequency_hz,
            power_w: channel.power_w,
            amplitude_setpoint: channel.amplitude_setpoint,
        }
    }
}

impl DeviceConfig {
    pub fn channels(&self) -> [Channel; CHANNEL_COUNT] {
        [Channel {
            frequency_hz: self.frequency_hz,
            power_w: self.power_w,
            amplitude_setpoint: self.amplitude_setpoint,
            ..Channel::default()
        }; CHANNEL_COUNT]
    }
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {path:?}"))?;
        let config = Self::from_toml_str(&text)
            .with_context(|| format!("Failed to load config from {path:?}"))?;
        log::debug!("Loaded config from {path:?}");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse TOML config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Reject settings the simulator cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.modbus.unit_id == 0 || self.modbus.unit_id > 247 {
            return Err(SimError::Config(format!(
                "modbus.unit_id {} is not a valid slave address (1..=247)",
                self.modbus.unit_id
            )));
        }
        RegisterMap::new(self.modbus.layout.clone())?;

        let amplitude = self.device.amplitude_setpoint;
        if !(AMPLITUDE_MIN..=AMPLITUDE_MAX).contains(&amplitude) {
            return Err(SimError::ValueOutOfRange {
                field: "device.amplitude_setpoint",
                value: amplitude as i64,
                min: AMPLITUDE_MIN as i64,
                max: AMPLITUDE_MAX as i64,
            });
        }
        if !self.device.power_w.is_finite() || self.device.power_w < 0.0 {
            return Err(SimError::Config(format!(
                "device.power_w must be a non-negative number, got {}",
                self.device.power_w
            )));
        }

        for (name, enabled, modem) in [
            ("modbus", self.modbus.enabled && self.modbus.provision, &self.modbus.null_modem),
            ("ascii", self.ascii.enabled && self.ascii.provision, &self.ascii.null_modem),
        ] {
            if enabled && modem.client_path == modem.server_path {
                return Err(SimError::Config(format!(
                    "{name}.null_modem uses the same path for both ends"
                )));
            }
        }
        if self.modbus.enabled
            && self.ascii.enabled
            && self.modbus.server_port() == self.ascii.server_port()
        {
            return Err(SimError::Config(format!(
                "modbus and ascii both serve on {}",
                self.modbus.server_port()
            )));
        }
        Ok(())
    }
}
