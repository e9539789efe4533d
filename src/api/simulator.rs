//! Session bootstrap: one device model, two protocol workers.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SimConfig,
    core::{null_modem::NullModem, task::BackgroundTask},
    device::DeviceModel,
    error::{Result, SimError},
    protocol::{
        ascii::AsciiResponder,
        modbus::FrameServer,
        transport::{open_serial_port, Transport},
    },
};

/// Configures and starts a [`Simulator`].
///
/// Transports may be injected (e.g. in-memory links in tests); otherwise the
/// configured serial ports are opened, after provisioning null-modem pairs
/// when asked to.
pub struct SimulatorBuilder {
    config: SimConfig,
    model: Option<DeviceModel>,
    modbus_transport: Option<Box<dyn Transport>>,
    ascii_transport: Option<Box<dyn Transport>>,
}

impl SimulatorBuilder {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            model: None,
            modbus_transport: None,
            ascii_transport: None,
        }
    }

    /// Share an existing model instead of building one from the config.
    pub fn model(mut self, model: DeviceModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn modbus_transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.modbus_transport = Some(Box::new(transport));
        self
    }

    pub fn ascii_transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.ascii_transport = Some(Box::new(transport));
        self
    }

    pub fn start(self) -> Result<Simulator> {
        let SimulatorBuilder {
            config,
            model,
            modbus_transport,
            ascii_transport,
        } = self;
        config.validate()?;

        let model =
            model.unwrap_or_else(|| DeviceModel::with_channels(config.device.channels()));
        let mut sim = Simulator {
            model: model.clone(),
            token: CancellationToken::new(),
            tasks: Vec::new(),
            modems: Vec::new(),
            modbus_client_path: None,
            ascii_client_path: None,
            shutdown_timeout: config.shutdown_timeout(),
        };

        // Any early return drops `sim`, which cancels the workers started so
        // far and tears down their null-modems.
        if config.modbus.enabled {
            let modbus = &config.modbus;
            let transport = match modbus_transport {
                Some(transport) => transport,
                None => {
                    if modbus.provision {
                        let modem = NullModem::start_with(modbus.null_modem.clone())?;
                        sim.modbus_client_path = Some(modem.client_path().to_path_buf());
                        sim.modems.push(modem);
                    }
                    let port = modbus.server_port();
                    log::info!("Opening Modbus port {port} at {} baud", modbus.baud_rate);
                    let handle = open_serial_port(&port, modbus.baud_rate, modbus.read_timeout())?;
                    Box::new(handle) as Box<dyn Transport>
                }
            };
            let server = FrameServer::new(model.clone(), modbus.layout.clone(), modbus.unit_id)?;
            sim.tasks.push(server.spawn(transport, sim.token.clone())?);
        }

        if config.ascii.enabled {
            let ascii = &config.ascii;
            let transport = match ascii_transport {
                Some(transport) => transport,
                None => {
                    if ascii.provision {
                        let modem = NullModem::start_with(ascii.null_modem.clone())?;
                        sim.ascii_client_path = Some(modem.client_path().to_path_buf());
                        sim.modems.push(modem);
                    }
                    let port = ascii.server_port();
                    log::info!("Opening ASCII port {port} at {} baud", ascii.baud_rate);
                    let handle = open_serial_port(&port, ascii.baud_rate, ascii.read_timeout())?;
                    Box::new(handle) as Box<dyn Transport>
                }
            };
            let responder =
                AsciiResponder::new(model.clone()).with_identity(ascii.identity.clone());
            sim.tasks.push(responder.spawn(transport, sim.token.clone())?);
        }

        log::info!("Simulator started with {} worker(s)", sim.tasks.len());
        Ok(sim)
    }
}

/// A running simulator. Dropping it stops the workers without waiting.
pub struct Simulator {
    model: DeviceModel,
    token: CancellationToken,
    tasks: Vec<BackgroundTask>,
    modems: Vec<NullModem>,
    modbus_client_path: Option<PathBuf>,
    ascii_client_path: Option<PathBuf>,
    shutdown_timeout: Duration,
}

impl Simulator {
    pub fn builder(config: SimConfig) -> SimulatorBuilder {
        SimulatorBuilder::new(config)
    }

    pub fn start(config: SimConfig) -> Result<Self> {
        SimulatorBuilder::new(config).start()
    }

    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    /// Token observed by both workers; cancelling it stops them.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Client side of the provisioned Modbus null-modem, if any.
    pub fn modbus_client_path(&self) -> Option<&Path> {
        self.modbus_client_path.as_deref()
    }

    pub fn ascii_client_path(&self) -> Option<&Path> {
        self.ascii_client_path.as_deref()
    }

    pub fn worker_names(&self) -> Vec<&str> {
        self.tasks.iter().map(BackgroundTask::name).collect()
    }

    /// True while no worker has exited.
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && self.tasks.iter().all(|task| !task.is_finished())
    }

    /// Stop both workers and release every transport within the configured bound.
    pub fn stop(self) -> Result<()> {
        let timeout = self.shutdown_timeout;
        self.shutdown(timeout)
    }

    /// Stop both workers, waiting at most `timeout` in total, then tear down
    /// the null-modems. The first worker error (or timeout) is returned.
    pub fn shutdown(mut self, timeout: Duration) -> Result<()> {
        log::info!("Simulator shutting down");
        self.token.cancel();

        let deadline = Instant::now() + timeout;
        let mut first_error: Option<SimError> = None;
        for task in std::mem::take(&mut self.tasks) {
            let name = task.name().to_string();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(err) = task.join_timeout(remaining) {
                log::warn!("Worker {name} did not stop cleanly: {err}");
                first_error.get_or_insert(err);
            }
        }

        for modem in &mut self.modems {
            modem.teardown();
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                log::info!("Simulator stopped");
                Ok(())
            }
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
