//! Byte transports the protocol front ends run on.
//!
//! A transport is anything readable and writable whose reads time out instead
//! of blocking forever: a real serial port, one side of a null-modem pair, or
//! an in-process [`MemoryPort`].

mod memory;

pub use memory::{memory_pair, MemoryPort};

use std::{
    io::{self, Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, SerialPort};

use crate::error::{Result, SimError};

pub trait Transport: Read + Write + Send {
    /// Drop everything buffered in both directions.
    fn discard_buffers(&mut self) -> io::Result<()>;
}

impl Transport for dyn SerialPort {
    fn discard_buffers(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}

#[cfg(unix)]
impl Transport for serialport::TTYPort {
    fn discard_buffers(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn discard_buffers(&mut self) -> io::Result<()> {
        (**self).discard_buffers()
    }
}

/// Open a serial port with the requested timeout (8N1).
///
/// On Unix the port is opened with exclusive access: one client per transport.
pub fn open_serial_port(
    port: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>> {
    let builder = serialport::new(port, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(timeout);

    #[cfg(unix)]
    {
        let mut handle = builder.open_native().map_err(|err| {
            SimError::Serial(serialport::Error::new(
                err.kind,
                format!("Failed to open port {port}: {}", err.description),
            ))
        })?;
        handle.set_exclusive(true).map_err(|err| {
            SimError::Serial(serialport::Error::new(
                err.kind,
                format!("Failed to acquire exclusive access to {port}: {}", err.description),
            ))
        })?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder.open().map_err(|err| {
            SimError::Serial(serialport::Error::new(
                err.kind,
                format!("Failed to open port {port}: {}", err.description),
            ))
        })
    }
}

/// True for read errors that only mean "nothing arrived within the timeout".
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
