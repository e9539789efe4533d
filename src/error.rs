//! Error types shared by every simulator front end.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Unit {unit} out of range (expected 1..={max})")]
    UnitOutOfRange { unit: u8, max: u8 },

    #[error("Value {value} out of range for {field} (expected {min}..={max})")]
    ValueOutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// The peer answered with an `ERR <reason>` line.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// Register access outside the configured window.
    #[error("Illegal data address: {address} (count {count})")]
    Address { address: u16, count: u16 },

    #[error("Modbus exception 0x{code:02X} for function 0x{function:02X}")]
    ModbusException { function: u8, code: u8 },

    #[error("Modbus protocol error: {0}")]
    Modbus(rmodbus::ErrorKind),

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Transport provisioning failed: {message}\n{diagnostics}")]
    Provisioning {
        message: String,
        diagnostics: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rmodbus::ErrorKind> for SimError {
    fn from(err: rmodbus::ErrorKind) -> Self {
        SimError::Modbus(err)
    }
}

impl SimError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        SimError::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Errors a caller may reasonably retry, as opposed to hard protocol failures.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SimError::Timeout { .. })
    }
}
