//! Virtual null-modem cable built from a `socat` pty pair.

use flume::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use crate::{
    error::{Result, SimError},
    utils::wait::wait_until,
};

pub const DEFAULT_MODBUS_CLIENT_PATH: &str = "/tmp/vcom1";
pub const DEFAULT_MODBUS_SERVER_PATH: &str = "/tmp/vcom2";
pub const DEFAULT_ASCII_CLIENT_PATH: &str = "/tmp/vcom3";
pub const DEFAULT_ASCII_SERVER_PATH: &str = "/tmp/vcom4";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NullModemConfig {
    /// Bridging program; must accept socat's address syntax.
    pub program: String,
    /// Path published for the test-side client.
    pub client_path: PathBuf,
    /// Path the simulator opens.
    pub server_path: PathBuf,
    pub ready_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for NullModemConfig {
    fn default() -> Self {
        Self {
            program: "socat".to_string(),
            client_path: PathBuf::from(DEFAULT_MODBUS_CLIENT_PATH),
            server_path: PathBuf::from(DEFAULT_MODBUS_SERVER_PATH),
            ready_timeout_ms: 5000,
            poll_interval_ms: 50,
        }
    }
}

impl NullModemConfig {
    pub fn new(client_path: impl Into<PathBuf>, server_path: impl Into<PathBuf>) -> Self {
        Self {
            client_path: client_path.into(),
            server_path: server_path.into(),
            ..Self::default()
        }
    }

    pub fn modbus() -> Self {
        Self::new(DEFAULT_MODBUS_CLIENT_PATH, DEFAULT_MODBUS_SERVER_PATH)
    }

    pub fn ascii() -> Self {
        Self::new(DEFAULT_ASCII_CLIENT_PATH, DEFAULT_ASCII_SERVER_PATH)
    }

    /// Collision-free paths under `/tmp`, for tests running in parallel.
    pub fn unique() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self::new(
            format!("/tmp/vcom_{uuid}_client"),
            format!("/tmp/vcom_{uuid}_server"),
        )
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn link_address(path: &Path) -> String {
        format!("pty,raw,echo=0,link={}", path.display())
    }
}

/// A running null-modem pair. Dropping it tears the pair down.
pub struct NullModem {
    config: NullModemConfig,
    child: Option<Child>,
    stderr_rx: Receiver<String>,
    diagnostics: Vec<String>,
}

impl NullModem {
    /// Link `client_path` and `server_path` with default settings.
    pub fn start(
        client_path: impl Into<PathBuf>,
        server_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        Self::start_with(NullModemConfig::new(client_path, server_path))
    }

    /// Spawn the bridge and wait until both paths exist.
    pub fn start_with(config: NullModemConfig) -> Result<Self> {
        remove_stale(&config.client_path)?;
        remove_stale(&config.server_path)?;

        log::info!(
            "Starting null-modem {} <-> {}",
            config.client_path.display(),
            config.server_path.display()
        );

        let mut child = Command::new(&config.program)
            .arg("-d")
            .arg("-d")
            .arg(NullModemConfig::link_address(&config.client_path))
            .arg(NullModemConfig::link_address(&config.server_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| SimError::Provisioning {
                message: format!("failed to spawn {}", config.program),
                diagnostics: err.to_string(),
            })?;

        let (stderr_tx, stderr_rx) = flume::unbounded();
        if let Some(stderr) = child.stderr.take() {
            let label = config.program.clone();
            std::thread::Builder::new()
                .name("null-modem-stderr".to_string())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        match line {
                            Ok(line) => {
                                let trimmed = line.trim_end();
                                if trimmed.is_empty() {
                                    continue;
                                }
                                log::debug!("{label} stderr: {trimmed}");
                                if stderr_tx.send(trimmed.to_string()).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                log::warn!("{label} stderr reader error: {err}");
                                break;
                            }
                        }
                    }
                })?;
        }

        let mut modem = Self {
            config,
            child: Some(child),
            stderr_rx,
            diagnostics: Vec::new(),
        };
        modem.await_ready()?;
        Ok(modem)
    }

    fn await_ready(&mut self) -> Result<()> {
        let client = self.config.client_path.clone();
        let server = self.config.server_path.clone();
        let mut exit_status = None;

        let ready = {
            let mut child = self.child.as_mut();
            wait_until(
                || -> Result<bool> {
                    if let Some(child) = child.as_mut() {
                        if let Some(status) = child.try_wait()? {
                            exit_status = Some(status);
                            // Stop polling; the bridge is gone.
                            return Ok(true);
                        }
                    }
                    Ok(client.exists() && server.exists())
                },
                self.config.ready_timeout(),
                self.config.poll_interval(),
            )
        };

        if ready && exit_status.is_none() {
            log::info!("Null-modem ready (pid {:?})", self.pid());
            return Ok(());
        }

        let message = match exit_status {
            Some(status) => format!("{} exited early with {status}", self.config.program),
            None => format!(
                "{} and {} did not appear within {:?}",
                client.display(),
                server.display(),
                self.config.ready_timeout()
            ),
        };
        self.teardown();
        self.collect_diagnostics(Duration::from_millis(500));
        Err(SimError::Provisioning {
            message,
            diagnostics: self.diagnostics(),
        })
    }

    pub fn client_path(&self) -> &Path {
        &self.config.client_path
    }

    pub fn server_path(&self) -> &Path {
        &self.config.server_path
    }

    pub fn config(&self) -> &NullModemConfig {
        &self.config
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stderr output captured from the bridge so far.
    pub fn diagnostics(&mut self) -> String {
        self.diagnostics.extend(self.stderr_rx.try_iter());
        self.diagnostics.join("\n")
    }

    fn collect_diagnostics(&mut self, within: Duration) {
        let deadline = Instant::now() + within;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.stderr_rx.recv_timeout(remaining) {
                Ok(line) => self.diagnostics.push(line),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Stop the bridge and unlink both paths. Later calls do nothing.
    pub fn teardown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(err) = child.kill() {
            log::debug!("Null-modem kill: {err}");
        }
        if let Err(err) = child.wait() {
            log::warn!("Failed to reap null-modem process: {err}");
        }
        for path in [&self.config.client_path, &self.config.server_path] {
            if let Err(err) = remove_stale(path) {
                log::warn!("Failed to remove {}: {err}", path.display());
            }
        }
        log::info!(
            "Null-modem {} <-> {} torn down",
            self.config.client_path.display(),
            self.config.server_path.display()
        );
    }
}

impl Drop for NullModem {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Remove a leftover link from an earlier run. Missing paths are fine.
fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            log::debug!("Removed stale {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SimError::Provisioning {
            message: format!("cannot remove stale {}", path.display()),
            diagnostics: err.to_string(),
        }),
    }
}

/// Whether `socat` can be spawned on this machine.
pub fn socat_available() -> bool {
    if cfg!(not(unix)) {
        return false;
    }
    Command::new("socat")
        .arg("-V")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Decide whether tests that need real null-modem pairs should run here.
///
/// `SONICSIM_SKIP_VCOM=1` turns them off even when `socat` is installed.
pub fn should_run_vcom_tests() -> bool {
    if std::env::var("SONICSIM_SKIP_VCOM").is_ok_and(|v| v == "1") {
        log::info!("SONICSIM_SKIP_VCOM=1, skipping null-modem tests");
        return false;
    }
    if !socat_available() {
        log::info!("socat not found, skipping null-modem tests");
        return false;
    }
    true
}
