//! Simulated test-harness microcontroller answering the ASCII protocol.

use std::{
    io::{Read, Write},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use super::command::{parse_flag, parse_request, sanitize, ErrorReason, Request};
use crate::{
    core::task::BackgroundTask,
    device::{unit_index, ChannelField, DeviceModel, CHANNEL_COUNT},
    error::{Result, SimError},
    protocol::transport::{is_timeout, Transport},
};

/// Banner sent once when the responder starts serving.
pub const READY_LINE: &str = "READY";

/// Longest request line kept; longer input is answered with `ERR USAGE`.
const MAX_LINE_LEN: usize = 256;

const IDLE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct AsciiResponder {
    model: DeviceModel,
    identity: String,
}

impl AsciiResponder {
    pub fn new(model: DeviceModel) -> Self {
        Self {
            model,
            identity: env!("CARGO_PKG_NAME").to_string(),
        }
    }

    /// Name reported by `INFO`.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = sanitize(identity.into().replace(' ', "_").as_bytes());
        self
    }

    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    /// Answer one request line. Blank lines get no answer.
    pub fn handle_line(&self, line: &str) -> Option<String> {
        let line = sanitize(line.as_bytes());
        if line.is_empty() {
            return None;
        }
        let response = match parse_request(&line).and_then(|request| self.execute(request)) {
            Ok(response) => response,
            Err(reason) => {
                log::debug!("Rejecting {line:?}: {reason}");
                format!("ERR {reason}")
            }
        };
        Some(response)
    }

    fn execute(&self, request: Request) -> std::result::Result<String, ErrorReason> {
        match request {
            Request::Ping => Ok("OK".to_string()),
            Request::Info => Ok(format!(
                "RESP INFO {} {} CHANNELS={CHANNEL_COUNT}",
                self.identity,
                env!("CARGO_PKG_VERSION")
            )),
            Request::Set { field, unit, value } => {
                unit_index(unit).map_err(|_| ErrorReason::BadUnit)?;
                let applied = match field {
                    ChannelField::Overload => self.model.set_overload(unit, parse_flag(&value)?),
                    ChannelField::FreqLock => self.model.set_freq_lock(unit, parse_flag(&value)?),
                    ChannelField::Frequency => {
                        let hz = value.parse::<u16>().map_err(|_| ErrorReason::BadValue)?;
                        self.model.set_frequency(unit, hz)
                    }
                    ChannelField::Power => {
                        let watts = value.parse::<f32>().map_err(|_| ErrorReason::BadValue)?;
                        self.model.set_power(unit, watts)
                    }
                    // Outputs of the device under test; the harness only reads them.
                    ChannelField::Running | ChannelField::Amplitude | ChannelField::ResetPulse => {
                        return Err(ErrorReason::UnknownField)
                    }
                };
                applied.map_err(to_reason)?;
                Ok("OK".to_string())
            }
            Request::Read { field, unit } => {
                let value = match field {
                    ChannelField::ResetPulse => {
                        let pulsed = self.model.take_reset_pulse(unit).map_err(to_reason)?;
                        u8::from(pulsed).to_string()
                    }
                    ChannelField::Amplitude => self
                        .model
                        .channel(unit)
                        .map_err(to_reason)?
                        .amplitude_adc()
                        .to_string(),
                    _ => self.model.get(unit, field).map_err(to_reason)?.to_wire(),
                };
                Ok(format!("RESP {field} {unit} {value}"))
            }
        }
    }

    /// Serve request lines from `transport` until `token` is cancelled.
    pub fn serve<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        token: &CancellationToken,
    ) -> Result<()> {
        log::info!("ASCII harness responder started");
        send_line(transport, READY_LINE);

        let mut line = Vec::with_capacity(MAX_LINE_LEN);
        let mut overflowed = false;
        let mut chunk = [0u8; 64];

        while !token.is_cancelled() {
            let n = match transport.read(&mut chunk) {
                Ok(0) => {
                    std::thread::sleep(IDLE_BACKOFF);
                    continue;
                }
                Ok(n) => n,
                Err(err) if is_timeout(&err) => continue,
                Err(err) => {
                    log::warn!("ASCII transport read failed: {err}");
                    std::thread::sleep(IDLE_BACKOFF);
                    continue;
                }
            };

            for &byte in &chunk[..n] {
                if byte != b'\n' {
                    if line.len() < MAX_LINE_LEN {
                        line.push(byte);
                    } else {
                        overflowed = true;
                    }
                    continue;
                }

                let request = String::from_utf8_lossy(&line).into_owned();
                line.clear();
                if std::mem::take(&mut overflowed) {
                    log::warn!("Request line longer than {MAX_LINE_LEN} bytes");
                    send_line(transport, &format!("ERR {}", ErrorReason::Usage));
                    continue;
                }
                log::debug!("ASCII request: {}", request.trim_end());
                if let Some(response) = self.handle_line(&request) {
                    log::debug!("ASCII response: {response}");
                    send_line(transport, &response);
                }
            }
        }

        log::info!("ASCII harness responder stopped");
        Ok(())
    }

    /// Run [`AsciiResponder::serve`] on a dedicated worker thread.
    pub fn spawn<T: Transport + 'static>(
        self,
        mut transport: T,
        token: CancellationToken,
    ) -> Result<BackgroundTask> {
        if let Err(err) = transport.discard_buffers() {
            log::warn!("Failed to discard stale input: {err}");
        }
        BackgroundTask::spawn("ascii-responder", move || {
            self.serve(&mut transport, &token)
        })
    }
}

fn send_line<T: Transport + ?Sized>(transport: &mut T, line: &str) {
    let result = transport
        .write_all(line.as_bytes())
        .and_then(|_| transport.write_all(b"\n"))
        .and_then(|_| transport.flush());
    if let Err(err) = result {
        log::warn!("Failed to send {line:?}: {err}");
    }
}

fn to_reason(err: SimError) -> ErrorReason {
    match err {
        SimError::UnitOutOfRange { .. } => ErrorReason::BadUnit,
        _ => ErrorReason::BadValue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder() -> AsciiResponder {
        AsciiResponder::new(DeviceModel::new())
    }

    #[test]
    fn ping_and_info() {
        let responder = responder().with_identity("bench sim");
        assert_eq!(responder.handle_line("PING").unwrap(), "OK");
        let info = responder.handle_line("INFO\r\n").unwrap();
        assert!(info.starts_with("RESP INFO bench_sim "));
        assert!(info.ends_with("CHANNELS=4"));
    }

    #[test]
    fn set_commands_drive_the_model() {
        let responder = responder();
        assert_eq!(responder.handle_line("SET OVERLOAD 1 1").unwrap(), "OK");
        assert_eq!(responder.handle_line("SET FREQ_LOCK 2 1").unwrap(), "OK");
        assert_eq!(responder.handle_line("SET FREQUENCY 3 20150").unwrap(), "OK");
        assert_eq!(responder.handle_line("SET POWER 4 125.5").unwrap(), "OK");

        let state = responder.model().snapshot();
        assert!(state.channels[0].overload);
        assert!(state.channels[1].freq_lock);
        assert_eq!(state.channels[2].frequency_hz, 20150);
        assert_eq!(state.channels[3].power_w, 125.5);

        assert_eq!(
            responder.handle_line("READ OVERLOAD 1").unwrap(),
            "RESP OVERLOAD 1 1"
        );
        assert_eq!(
            responder.handle_line("READ POWER 4").unwrap(),
            "RESP POWER 4 125.5"
        );
    }

    #[test]
    fn read_start_follows_running_flag() {
        let responder = responder();
        assert_eq!(responder.handle_line("READ START 1").unwrap(), "RESP START 1 0");
        responder.model().set_running(1, true).unwrap();
        assert_eq!(responder.handle_line("READ START 1").unwrap(), "RESP START 1 1");
    }

    #[test]
    fn read_reset_consumes_pulse() {
        let responder = responder();
        responder.model().pulse_reset(2).unwrap();
        assert_eq!(responder.handle_line("READ RESET 2").unwrap(), "RESP RESET 2 1");
        assert_eq!(responder.handle_line("READ RESET 2").unwrap(), "RESP RESET 2 0");
    }

    #[test]
    fn read_amplitude_reports_adc_counts() {
        let responder = responder();
        assert_eq!(
            responder.handle_line("READ AMPLITUDE 1").unwrap(),
            "RESP AMPLITUDE 1 512"
        );
        responder.model().set_amplitude(1, 100).unwrap();
        assert_eq!(
            responder.handle_line("READ AMPLITUDE 1").unwrap(),
            "RESP AMPLITUDE 1 1023"
        );
    }

    #[test]
    fn errors_carry_reasons() {
        let responder = responder();
        assert_eq!(responder.handle_line("FOO").unwrap(), "ERR UNKNOWN_VERB");
        assert_eq!(responder.handle_line("READ VOLTAGE 1").unwrap(), "ERR UNKNOWN_FIELD");
        assert_eq!(responder.handle_line("READ START 5").unwrap(), "ERR BAD_UNIT");
        assert_eq!(responder.handle_line("SET OVERLOAD 0 1").unwrap(), "ERR BAD_UNIT");
        assert_eq!(responder.handle_line("SET OVERLOAD 1 2").unwrap(), "ERR BAD_VALUE");
        assert_eq!(responder.handle_line("SET POWER 1 -3").unwrap(), "ERR BAD_VALUE");
        assert_eq!(responder.handle_line("SET POWER 1 NaN").unwrap(), "ERR BAD_VALUE");
        assert_eq!(responder.handle_line("SET START 1 1").unwrap(), "ERR UNKNOWN_FIELD");
        assert_eq!(responder.handle_line("SET").unwrap(), "ERR USAGE");
        assert!(responder.handle_line("   ").is_none());
    }
}
