use rmodbus::{
    client::ModbusRequest, consts::ModbusErrorCode, guess_response_frame_len, ModbusProto,
};
use serialport::SerialPort;
use std::{
    io::{Read, Write},
    time::{Duration, Instant},
};

use super::frame::{crc_matches, hex, MAX_FRAME_LEN};
use crate::{
    error::{Result, SimError},
    protocol::transport::{is_timeout, open_serial_port, Transport},
};

/// Modbus RTU master used to drive the simulator (or real hardware) in tests.
pub struct ModbusClient<T: Transport> {
    transport: T,
    unit_id: u8,
    response_timeout: Duration,
}

impl ModbusClient<Box<dyn SerialPort>> {
    /// Open a serial port and talk to `unit_id` through it.
    pub fn open(
        port: &str,
        baud_rate: u32,
        unit_id: u8,
        response_timeout: Duration,
    ) -> Result<Self> {
        // Short per-read timeout; the response deadline is enforced separately.
        let handle = open_serial_port(port, baud_rate, Duration::from_millis(20))?;
        Ok(Self::new(handle, unit_id, response_timeout))
    }
}

impl<T: Transport> ModbusClient<T> {
    pub fn new(transport: T, unit_id: u8, response_timeout: Duration) -> Self {
        Self {
            transport,
            unit_id,
            response_timeout,
        }
    }

    pub fn read_holdings(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let mut request = ModbusRequest::new(self.unit_id, ModbusProto::Rtu);
        let mut raw = Vec::new();
        request.generate_get_holdings(address, count, &mut raw)?;

        let response = self.transact(&mut request, &raw)?;
        let values = response[3..response.len() - 2]
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect::<Vec<_>>();
        if values.len() != count as usize {
            return Err(SimError::Frame(format!(
                "expected {count} registers, got {}",
                values.len()
            )));
        }
        Ok(values)
    }

    pub fn write_holding(&mut self, address: u16, value: u16) -> Result<()> {
        let mut request = ModbusRequest::new(self.unit_id, ModbusProto::Rtu);
        let mut raw = Vec::new();
        request.generate_set_holding(address, value, &mut raw)?;
        self.transact(&mut request, &raw)?;
        Ok(())
    }

    pub fn write_holdings(&mut self, address: u16, values: &[u16]) -> Result<()> {
        let mut request = ModbusRequest::new(self.unit_id, ModbusProto::Rtu);
        let mut raw = Vec::new();
        request.generate_set_holdings_bulk(address, values, &mut raw)?;
        self.transact(&mut request, &raw)?;
        Ok(())
    }

    fn transact(&mut self, request: &mut ModbusRequest, raw: &[u8]) -> Result<Vec<u8>> {
        if let Err(err) = self.transport.discard_buffers() {
            log::debug!("Failed to discard stale input: {err}");
        }
        log::debug!("Send Modbus request: {}", hex(raw));
        self.transport.write_all(raw)?;
        self.transport.flush()?;

        let response = self.read_response(request.func.byte())?;
        log::debug!("Received Modbus response: {}", hex(&response));

        if response[1] & 0x80 != 0 {
            if !crc_matches(&response) {
                return Err(SimError::Frame(format!(
                    "exception frame with bad CRC: {}",
                    hex(&response)
                )));
            }
            let code = response[2];
            return Err(if code == ModbusErrorCode::IllegalDataAddress.byte() {
                SimError::Address {
                    address: request.reg,
                    count: request.count,
                }
            } else {
                SimError::ModbusException {
                    function: response[1] & 0x7F,
                    code,
                }
            });
        }

        request.parse_ok(&response)?;
        Ok(response)
    }

    fn read_response(&mut self, function: u8) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.response_timeout;
        let mut response = Vec::with_capacity(MAX_FRAME_LEN);
        let mut chunk = [0u8; MAX_FRAME_LEN];

        loop {
            if let Some(len) = complete_len(&response) {
                response.truncate(len);
                return Ok(response);
            }
            if Instant::now() >= deadline {
                return Err(SimError::timeout(
                    format!(
                        "Modbus response to function 0x{function:02X} from unit {}",
                        self.unit_id
                    ),
                    self.response_timeout,
                ));
            }
            match self.transport.read(&mut chunk) {
                Ok(0) => std::thread::sleep(Duration::from_millis(5)),
                Ok(n) => response.extend_from_slice(&chunk[..n]),
                Err(err) if is_timeout(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Length of the response once enough bytes are buffered.
fn complete_len(buf: &[u8]) -> Option<usize> {
    // Unit, function and byte count (or exception code) come first.
    if buf.len() < 3 {
        return None;
    }
    let len = usize::from(guess_response_frame_len(buf, ModbusProto::Rtu).ok()?);
    (buf.len() >= len).then_some(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::DeviceModel,
        protocol::{
            modbus::{register_map::RegisterLayout, server::FrameServer},
            transport::memory_pair,
        },
    };
    use tokio_util::sync::CancellationToken;

    fn start() -> (
        ModbusClient<crate::protocol::transport::MemoryPort>,
        DeviceModel,
        CancellationToken,
        crate::core::task::BackgroundTask,
    ) {
        let (client_end, server_end) = memory_pair(Duration::from_millis(20));
        let model = DeviceModel::new();
        let server = FrameServer::new(model.clone(), RegisterLayout::default(), 2).unwrap();
        let token = CancellationToken::new();
        let task = server.spawn(server_end, token.clone()).unwrap();
        let client = ModbusClient::new(client_end, 2, Duration::from_millis(500));
        (client, model, token, task)
    }

    #[test]
    fn write_then_read_over_link() {
        let (mut client, model, token, task) = start();

        client.write_holdings(5, &[1, 1, 0, 1]).unwrap();
        assert_eq!(client.read_holdings(35, 2).unwrap(), vec![3, 0b1011]);
        client.write_holding(5, 0).unwrap();
        assert_eq!(model.active_mask(), 0b1010);

        token.cancel();
        task.join_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn exceptions_map_to_errors() {
        let (mut client, _model, token, task) = start();

        assert!(matches!(
            client.read_holdings(81, 1),
            Err(SimError::Address { address: 81, count: 1 })
        ));
        assert!(matches!(
            client.write_holding(100, 1),
            Err(SimError::Address { address: 100, .. })
        ));
        // The link stays usable after an exception.
        assert_eq!(client.read_holdings(80, 1).unwrap(), vec![0]);

        token.cancel();
        task.join_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn wrong_unit_times_out() {
        let (client_end, server_end) = memory_pair(Duration::from_millis(20));
        let server = FrameServer::new(DeviceModel::new(), RegisterLayout::default(), 2).unwrap();
        let token = CancellationToken::new();
        let task = server.spawn(server_end, token.clone()).unwrap();

        let mut client = ModbusClient::new(client_end, 9, Duration::from_millis(150));
        let err = client.read_holdings(0, 1).unwrap_err();
        assert!(err.is_timeout());

        token.cancel();
        task.join_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn response_length_detection() {
        assert_eq!(complete_len(&[2]), None);
        assert_eq!(complete_len(&[2, 0x83]), None);
        assert_eq!(complete_len(&[2, 0x83, 2, 0, 0]), Some(5));
        assert_eq!(complete_len(&[2, 0x03, 4, 0, 0, 0, 0]), None);
        assert_eq!(
            complete_len(&[2, 0x03, 4, 0, 0, 0, 0, 0xAA, 0xBB, 0x02]),
            Some(9)
        );
        assert_eq!(complete_len(&[2, 0x06, 0, 5, 0, 1, 0, 0]), Some(8));
        assert_eq!(complete_len(&[2, 0x10, 0, 5, 0, 4, 0]), None);
        // Unknown function codes never complete on their own.
        assert_eq!(complete_len(&[2, 0x2B, 0x0E, 0x01, 0, 0]), None);
    }
}
