//! RTU framing helpers: CRC and request boundary detection on a byte stream.

use rmodbus::{guess_request_frame_len, ModbusProto};

/// Largest RTU frame on the wire.
pub const MAX_FRAME_LEN: usize = 256;

/// CRC16 checksum for Modbus
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        crc ^= b as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

pub fn crc_matches(frame: &[u8]) -> bool {
    if frame.len() < 4 {
        return false;
    }
    let (body, crc) = frame.split_at(frame.len() - 2);
    crc16_modbus(body) == u16::from_le_bytes([crc[0], crc[1]])
}

/// Append the CRC (low byte first) to a frame that already carries the unit id.
#[cfg(test)]
pub(crate) fn seal(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Expected length of a request frame given its first bytes, once enough
/// header bytes are buffered to tell.
fn guessed_request_len(buf: &[u8]) -> Option<usize> {
    let function = *buf.get(1)?;
    // FC0F/FC10 carry their byte count at offset 6.
    if matches!(function, 0x0F | 0x10) && buf.len() < 7 {
        return None;
    }
    guess_request_frame_len(buf, ModbusProto::Rtu)
        .ok()
        .map(usize::from)
}

/// Split a byte stream into request frames.
///
/// Frames of known length are cut as soon as enough bytes arrived. Anything
/// else is released at inter-frame silence via [`FrameAssembler::flush`].
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_FRAME_LEN * 4 {
            log::warn!(
                "Dropping {} unframed bytes (no frame boundary found)",
                self.buf.len()
            );
            self.buf.clear();
        }
    }

    /// Take the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let len = guessed_request_len(&self.buf)?;
        if self.buf.len() < len {
            return None;
        }
        Some(self.buf.drain(..len).collect())
    }

    /// Release whatever is buffered after the line went quiet.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            return None;
        }
        let frame = std::mem::take(&mut self.buf);
        if frame.len() < 4 {
            log::debug!("Discarding {}-byte fragment at silence", frame.len());
            return None;
        }
        Some(frame)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
