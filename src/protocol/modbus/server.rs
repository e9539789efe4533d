//! Modbus RTU slave exposing the device model as holding registers.

use rmodbus::{
    consts::{ModbusErrorCode, ModbusFunction},
    server::{context::ModbusContext, ModbusFrame, Read as FrameRead, Write as FrameWrite},
    ErrorKind, ModbusProto,
};
use std::{
    io::{Read, Write},
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use super::{
    frame::{crc_matches, hex, FrameAssembler, MAX_FRAME_LEN},
    register_map::{RegisterBehavior, RegisterLayout, RegisterMap},
};
use crate::{
    core::task::BackgroundTask,
    device::{DeviceModel, DeviceState, Registers},
    error::{Result, SimError},
    protocol::transport::{is_timeout, Transport},
};

const IDLE_BACKOFF: Duration = Duration::from_millis(10);

type FrameResult = std::result::Result<(), ErrorKind>;

#[derive(Clone)]
pub struct FrameServer {
    model: DeviceModel,
    map: Arc<RegisterMap>,
    unit_id: u8,
}

impl FrameServer {
    pub fn new(model: DeviceModel, layout: RegisterLayout, unit_id: u8) -> Result<Self> {
        if unit_id == 0 || unit_id > 247 {
            return Err(SimError::Config(format!(
                "unit id {unit_id} is not a valid slave address (1..=247)"
            )));
        }
        Ok(Self {
            model,
            map: Arc::new(RegisterMap::new(layout)?),
            unit_id,
        })
    }

    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    /// Read `count` holding registers starting at `address`.
    ///
    /// Derived registers are computed from channel state under the same read
    /// lock, so the result is never older than the last completed write.
    pub fn read_holdings(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        let span = self.map.span(address, count)?;
        self.model.read(|state, registers| {
            span.iter()
                .zip(address..=u16::MAX)
                .map(|(behavior, addr)| register_value(*behavior, addr, state, registers))
                .collect()
        })
    }

    pub fn write_holding(&self, address: u16, value: u16) -> Result<()> {
        self.write_holdings(address, &[value])
    }

    /// Write consecutive holding registers.
    ///
    /// Control registers update the channel's `running` flag; derived fields
    /// are recomputed before this call returns.
    pub fn write_holdings(&self, address: u16, values: &[u16]) -> Result<()> {
        let count = u16::try_from(values.len()).map_err(|_| SimError::Address {
            address,
            count: u16::MAX,
        })?;
        let span = self.map.span(address, count)?;
        self.model.write(|state, registers| {
            let addresses = address..=u16::MAX;
            for ((behavior, addr), value) in span.iter().zip(addresses).zip(values) {
                registers
                    .set_holding(addr, *value)
                    .map_err(|_| SimError::Address { address: addr, count: 1 })?;
                match behavior {
                    RegisterBehavior::Control { unit } => {
                        let running = *value != 0;
                        state.channel_mut(*unit)?.running = running;
                        log::debug!("Control write: unit {unit} running={running}");
                    }
                    derived if derived.is_derived() => {
                        log::debug!("Write to derived register {addr} stored but shadowed");
                    }
                    _ => {}
                }
            }
            Ok(())
        })
    }

    /// Answer one raw RTU request.
    ///
    /// Returns `None` for frames that must not be answered: other unit ids,
    /// broadcast, bad CRC or truncated frames.
    pub fn handle_frame(&self, request: &[u8]) -> Option<Vec<u8>> {
        if !crc_matches(request) {
            if request.len() < 4 {
                log::debug!("Ignoring {}-byte fragment", request.len());
            } else {
                log::warn!("CRC mismatch, dropping frame: {}", hex(request));
            }
            return None;
        }

        let mut response = Vec::new();
        let mut frame = ModbusFrame::new(self.unit_id, request, ModbusProto::Rtu, &mut response);
        if let Err(err) = frame.parse() {
            log::warn!("Dropping unparseable frame ({err}): {}", hex(request));
            return None;
        }
        if !frame.response_required {
            log::debug!(
                "Ignoring frame for unit {} (serving {})",
                request[0],
                self.unit_id
            );
            return None;
        }

        let rejection = self.reject(&frame, request);
        frame.error = rejection;
        if frame.error.is_none() {
            let outcome = if frame.readonly {
                self.serve_read(&mut frame)
            } else {
                self.serve_write(&mut frame)
            };
            if let Err(err) = outcome {
                log::error!("Failed to process frame ({err}): {}", hex(request));
                return None;
            }
        }
        if let Some(code) = frame.error {
            log::info!(
                "Exception 0x{:02X} for function 0x{:02X}: {}",
                code.byte(),
                frame.responding_to_fn,
                hex(request)
            );
        }
        if let Err(err) = frame.finalize_response() {
            log::error!("Failed to finalize response ({err}): {}", hex(request));
            return None;
        }
        Some(response)
    }

    /// Exception owed by a parsed request before it touches the model.
    ///
    /// Unsupported functions come first, then the register window, then
    /// malformed quantities.
    fn reject(
        &self,
        frame: &ModbusFrame<'_, Vec<u8>>,
        request: &[u8],
    ) -> Option<ModbusErrorCode> {
        let supported = matches!(
            frame.func,
            ModbusFunction::GetHoldings
                | ModbusFunction::SetHolding
                | ModbusFunction::SetHoldingsBulk
        );
        if !supported || frame.error == Some(ModbusErrorCode::IllegalFunction) {
            return Some(ModbusErrorCode::IllegalFunction);
        }

        // Oversized quantities fail parsing before the start address is kept.
        let (address, count) = match (frame.error, request.get(2..6)) {
            (Some(_), Some(&[a_hi, a_lo, c_hi, c_lo])) => (
                u16::from_be_bytes([a_hi, a_lo]),
                u16::from_be_bytes([c_hi, c_lo]),
            ),
            _ => (frame.reg, frame.count),
        };
        if self.map.check_range(address, count).is_err() {
            return Some(ModbusErrorCode::IllegalDataAddress);
        }
        if count == 0 {
            return Some(ModbusErrorCode::IllegalDataValue);
        }
        frame.error
    }

    fn serve_read(&self, frame: &mut ModbusFrame<'_, Vec<u8>>) -> FrameResult {
        let result = match frame.get_external_read()? {
            FrameRead::Words(read) => self.read_into(read.address, read.count, read.buf),
            FrameRead::Bits(_) => Err(ErrorKind::IllegalFunction),
        };
        frame.process_external_read(result)
    }

    fn serve_write(&self, frame: &mut ModbusFrame<'_, Vec<u8>>) -> FrameResult {
        let result = match frame.get_external_write()? {
            FrameWrite::Words(write) => self.write_from(write.address, write.count, write.data),
            FrameWrite::Bits(_) => Err(ErrorKind::IllegalFunction),
        };
        frame.process_external_write(result)
    }

    fn read_into(&self, address: u16, count: u16, buf: &mut [u8]) -> FrameResult {
        let values = self.read_holdings(address, count).map_err(error_kind)?;
        for (slot, value) in buf.chunks_exact_mut(2).zip(values) {
            slot.copy_from_slice(&value.to_be_bytes());
        }
        Ok(())
    }

    fn write_from(&self, address: u16, count: u16, data: &[u8]) -> FrameResult {
        if data.len() != usize::from(count) * 2 {
            return Err(ErrorKind::IllegalDataValue);
        }
        let values: Vec<u16> = data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        self.write_holdings(address, &values).map_err(error_kind)
    }

    /// Serve requests from `transport` until `token` is cancelled.
    ///
    /// Per-request failures are logged and answered (or dropped); they never
    /// end the loop.
    pub fn serve<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        token: &CancellationToken,
    ) -> Result<()> {
        log::info!("Modbus RTU slave serving unit {}", self.unit_id);

        let mut assembler = FrameAssembler::new();
        let mut chunk = [0u8; MAX_FRAME_LEN];

        while !token.is_cancelled() {
            match transport.read(&mut chunk) {
                Ok(0) => std::thread::sleep(IDLE_BACKOFF),
                Ok(n) => {
                    assembler.push(&chunk[..n]);
                    while let Some(frame) = assembler.next_frame() {
                        self.respond(transport, &frame);
                    }
                }
                Err(err) if is_timeout(&err) => {
                    if let Some(frame) = assembler.flush() {
                        self.respond(transport, &frame);
                    }
                }
                Err(err) => {
                    log::warn!("Modbus transport read failed: {err}");
                    std::thread::sleep(IDLE_BACKOFF);
                }
            }
        }

        log::info!("Modbus RTU slave for unit {} stopped", self.unit_id);
        Ok(())
    }

    fn respond<T: Transport + ?Sized>(&self, transport: &mut T, request: &[u8]) {
        log::debug!("Received Modbus request: {}", hex(request));
        let Some(response) = self.handle_frame(request) else {
            return;
        };
        log::debug!("Send Modbus response: {}", hex(&response));
        if let Err(err) = transport
            .write_all(&response)
            .and_then(|_| transport.flush())
        {
            log::warn!("Failed to send Modbus response: {err}");
        }
    }

    /// Run [`FrameServer::serve`] on a dedicated worker thread.
    ///
    /// Stale input is discarded before the worker starts.
    pub fn spawn<T: Transport + 'static>(
        self,
        mut transport: T,
        token: CancellationToken,
    ) -> Result<BackgroundTask> {
        if let Err(err) = transport.discard_buffers() {
            log::warn!("Failed to discard stale input: {err}");
        }
        BackgroundTask::spawn("modbus-rtu-slave", move || {
            self.serve(&mut transport, &token)
        })
    }
}

fn register_value(
    behavior: RegisterBehavior,
    address: u16,
    state: &DeviceState,
    registers: &Registers,
) -> Result<u16> {
    match behavior {
        RegisterBehavior::Control { .. } | RegisterBehavior::Storage => registers
            .get_holding(address)
            .map_err(|_| SimError::Address { address, count: 1 }),
        RegisterBehavior::ChannelStatus { unit } => Ok(state.channel(unit)?.status_bits()),
        RegisterBehavior::ActiveCount => Ok(state.active_count as u16),
        RegisterBehavior::ActiveMask => Ok(state.active_mask as u16),
    }
}

fn error_kind(err: SimError) -> ErrorKind {
    match err {
        SimError::Address { .. } => ErrorKind::IllegalDataAddress,
        SimError::ValueOutOfRange { .. } | SimError::UnitOutOfRange { .. } => {
            ErrorKind::IllegalDataValue
        }
        other => {
            log::error!("Request failed: {other}");
            ErrorKind::SlaveDeviceFailure
        }
    }
}
