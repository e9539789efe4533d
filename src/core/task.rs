use std::{
    io,
    thread::{self, JoinHandle},
    time::Duration,
};

use flume::{Receiver, RecvTimeoutError};

use crate::error::{Result, SimError};

/// A serving loop running on its own named thread.
///
/// Completion is reported over a channel so the owner can wait for it with a
/// bound instead of blocking on `join` forever.
pub struct BackgroundTask {
    name: String,
    handle: Option<JoinHandle<()>>,
    done_rx: Receiver<Result<()>>,
}

impl BackgroundTask {
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let (done_tx, done_rx) = flume::bounded(1);
        let thread_name = name.to_string();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let result = body();
            if let Err(err) = &result {
                log::error!("Worker {thread_name} exited with error: {err}");
            }
            let _ = done_tx.send(result);
        })?;
        log::debug!("Spawned worker {name}");

        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
            done_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the worker to finish and return its result.
    ///
    /// On timeout the thread is left detached.
    pub fn join_timeout(mut self, timeout: Duration) -> Result<()> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(result) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                log::debug!("Worker {} joined", self.name);
                result
            }
            Err(RecvTimeoutError::Timeout) => Err(SimError::timeout(
                format!("worker {} to stop", self.name),
                timeout,
            )),
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                Err(SimError::Io(io::Error::other(format!(
                    "worker {} panicked",
                    self.name
                ))))
            }
        }
    }
}
