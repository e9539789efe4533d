use serialport::SerialPort;
use std::{
    io::{self, Read, Write},
    str::FromStr,
    time::{Duration, Instant},
};

use super::command::{format_line, sanitize};
use crate::{
    error::{Result, SimError},
    protocol::transport::{is_timeout, open_serial_port, Transport},
};

/// Multiple of the per-line timeout spent waiting for a matching response.
pub const RESPONSE_WINDOW_FACTOR: u32 = 5;

/// Line-oriented client for the ASCII harness protocol.
///
/// Unsolicited lines (`READY`, banners, stale replies) are skipped while
/// waiting for the expected prefix.
pub struct AsciiClient<T: Transport> {
    transport: Option<T>,
    line_timeout: Duration,
    pending: Vec<u8>,
}

impl AsciiClient<Box<dyn SerialPort>> {
    pub fn open_port(path: &str, baud_rate: u32, line_timeout: Duration) -> Result<Self> {
        let handle = open_serial_port(path, baud_rate, line_timeout)?;
        Self::open(handle, line_timeout)
    }
}

impl<T: Transport> AsciiClient<T> {
    /// Take over `transport`, dropping anything already buffered on it.
    pub fn open(mut transport: T, line_timeout: Duration) -> Result<Self> {
        transport.discard_buffers()?;
        Ok(Self {
            transport: Some(transport),
            line_timeout,
            pending: Vec::new(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn response_window(&self) -> Duration {
        self.line_timeout * RESPONSE_WINDOW_FACTOR
    }

    /// Close the transport. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            log::debug!("ASCII client closed");
        }
        self.pending.clear();
    }

    /// Send one command and wait for a line starting with `expect`.
    ///
    /// Returns `Ok(None)` when nothing matched within the response window.
    /// An `ERR` line fails with [`SimError::Protocol`]. Input left over from
    /// earlier commands, such as a reply that missed its window, is dropped
    /// before sending.
    pub fn command<S: AsRef<str>>(
        &mut self,
        parts: &[S],
        expect: &str,
    ) -> Result<Option<String>> {
        let line = format_line(parts);
        let window = self.response_window();
        let transport = self.transport.as_mut().ok_or_else(closed)?;

        if !self.pending.is_empty() {
            log::debug!("Dropping {} stale bytes", self.pending.len());
            self.pending.clear();
        }
        transport.discard_buffers()?;
        log::debug!("ASCII send: {}", line.trim_end());
        transport.write_all(line.as_bytes())?;
        transport.flush()?;

        let deadline = Instant::now() + window;
        while let Some(reply) = self.read_line(deadline)? {
            if let Some(reason) = error_reason(&reply) {
                return Err(SimError::Protocol(reason.to_string()));
            }
            if reply.starts_with(expect) {
                return Ok(Some(reply));
            }
            log::debug!("Skipping unsolicited line: {reply}");
        }
        log::debug!("No {expect:?} within {window:?}");
        Ok(None)
    }

    fn read_line(&mut self, deadline: Instant) -> Result<Option<String>> {
        let mut chunk = [0u8; 64];
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                let line = sanitize(&raw);
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let transport = self.transport.as_mut().ok_or_else(closed)?;
            match transport.read(&mut chunk) {
                Ok(0) => std::thread::sleep(Duration::from_millis(5)),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(err) if is_timeout(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Like [`AsciiClient::command`], but a soft timeout becomes an error.
    fn expect_reply<S: AsRef<str>>(&mut self, parts: &[S], expect: &str) -> Result<String> {
        let window = self.response_window();
        self.command(parts, expect)?.ok_or_else(|| {
            let sent = parts.iter().map(|p| p.as_ref()).collect::<Vec<_>>().join(" ");
            SimError::timeout(format!("{expect:?} in reply to {sent:?}"), window)
        })
    }

    fn set(&mut self, field: &str, unit: u8, value: String) -> Result<()> {
        let unit = unit.to_string();
        self.expect_reply(&["SET", field, unit.as_str(), value.as_str()], "OK")?;
        Ok(())
    }

    fn read<V: FromStr>(&mut self, field: &str, unit: u8) -> Result<V> {
        let unit = unit.to_string();
        let prefix = format!("RESP {field} {unit} ");
        let reply = self.expect_reply(&["READ", field, unit.as_str()], &prefix)?;
        parse_tail(&reply)
    }

    pub fn ping(&mut self) -> Result<()> {
        self.expect_reply(&["PING"], "OK")?;
        Ok(())
    }

    /// Identification tail of the `INFO` reply, e.g. `sonicsim 0.1.0 CHANNELS=4`.
    pub fn info(&mut self) -> Result<String> {
        let reply = self.expect_reply(&["INFO"], "RESP INFO")?;
        Ok(reply["RESP INFO".len()..].trim().to_string())
    }

    pub fn set_overload(&mut self, unit: u8, active: bool) -> Result<()> {
        self.set("OVERLOAD", unit, u8::from(active).to_string())
    }

    pub fn set_freq_lock(&mut self, unit: u8, locked: bool) -> Result<()> {
        self.set("FREQ_LOCK", unit, u8::from(locked).to_string())
    }

    pub fn set_frequency(&mut self, unit: u8, hz: u16) -> Result<()> {
        self.set("FREQUENCY", unit, hz.to_string())
    }

    pub fn set_power(&mut self, unit: u8, watts: f32) -> Result<()> {
        self.set("POWER", unit, watts.to_string())
    }

    /// State of the channel's START output.
    pub fn read_start(&mut self, unit: u8) -> Result<bool> {
        Ok(self.read::<u8>("START", unit)? != 0)
    }

    /// Whether a reset pulse was seen since the last read.
    pub fn read_reset_pulse(&mut self, unit: u8) -> Result<bool> {
        Ok(self.read::<u8>("RESET", unit)? != 0)
    }

    pub fn read_amplitude_adc(&mut self, unit: u8) -> Result<u16> {
        self.read("AMPLITUDE", unit)
    }
}

impl<T: Transport> Drop for AsciiClient<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed() -> SimError {
    SimError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "ASCII client is closed",
    ))
}

/// Reason carried by an `ERR` line. Lines that merely start with the letters,
/// like `ERRATA ...`, are not errors.
fn error_reason(reply: &str) -> Option<&str> {
    if reply == "ERR" {
        return Some("");
    }
    reply.strip_prefix("ERR ").map(str::trim)
}

/// Parse the last whitespace-separated token of a reply.
fn parse_tail<V: FromStr>(reply: &str) -> Result<V> {
    reply
        .split_whitespace()
        .last()
        .and_then(|tail| tail.parse().ok())
        .ok_or_else(|| SimError::Frame(format!("unexpected reply {reply:?}")))
}
