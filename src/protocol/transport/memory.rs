use std::{
    io::{self, Read, Write},
    time::Duration,
};

use flume::{Receiver, RecvTimeoutError, Sender};

use super::Transport;

/// One end of an in-process null-modem link.
///
/// Bytes written on one end are read on the other. Reads block up to the
/// configured timeout and then fail with [`io::ErrorKind::TimedOut`], like a
/// serial port with a read timeout. Once the peer is dropped, reads return
/// `Ok(0)` and writes fail with [`io::ErrorKind::BrokenPipe`].
pub struct MemoryPort {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    timeout: Duration,
}

/// Create a linked pair of memory ports sharing the same read timeout.
pub fn memory_pair(timeout: Duration) -> (MemoryPort, MemoryPort) {
    let (a_tx, b_rx) = flume::unbounded();
    let (b_tx, a_rx) = flume::unbounded();
    (
        MemoryPort {
            tx: a_tx,
            rx: a_rx,
            pending: Vec::new(),
            timeout,
        },
        MemoryPort {
            tx: b_tx,
            rx: b_rx,
            pending: Vec::new(),
            timeout,
        },
    )
}

impl MemoryPort {
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl Read for MemoryPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Write for MemoryPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MemoryPort {
    fn discard_buffers(&mut self) -> io::Result<()> {
        self.pending.clear();
        let dropped: usize = self.rx.drain().map(|chunk| chunk.len()).sum();
        if dropped > 0 {
            log::debug!("Discarded {dropped} buffered bytes");
        }
        Ok(())
    }
}
