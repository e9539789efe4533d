use anyhow::{Context, Result};
use chrono::Local;
use clap::ArgMatches;
use env_logger::{Builder, Env, Target};
use log::LevelFilter;
use std::{
    io::{self, Write},
    path::Path,
    time::Duration,
};

use crate::{api::Simulator, cli, config::SimConfig};

/// Writes every log line to the log file and to stderr.
struct DualWriter {
    file: std::fs::File,
    stderr: io::Stderr,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.stderr.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.stderr.flush()?;
        Ok(())
    }
}

/// Initialize logging: `--log-file`, then `SONICSIM_LOG_FILE`, else stderr only.
pub fn init_logger(log_file: Option<&str>) {
    let log_file = log_file
        .map(str::to_string)
        .or_else(|| std::env::var("SONICSIM_LOG_FILE").ok());

    if let Some(path) = log_file {
        if let Err(err) = init_file_logger(&path) {
            eprintln!("Failed to initialize file logger at '{path}': {err}");
            Builder::from_env(Env::default().default_filter_or("info")).init();
        }
    } else {
        Builder::from_env(Env::default().default_filter_or("info")).init();
    }
}

fn init_file_logger(path: &str) -> io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let dual_writer = DualWriter {
        file,
        stderr: io::stderr(),
    };

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} {} [{}] - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(dual_writer)))
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .init();

    log::info!("File logger initialized at {path}");

    Ok(())
}

/// Load the effective configuration from the file (if any) plus CLI overrides.
pub fn load_config(matches: &ArgMatches) -> Result<SimConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => SimConfig::load(Path::new(path))?,
        None => SimConfig::default(),
    };
    cli::apply_overrides(&mut config, matches)?;
    Ok(config)
}

/// Run the simulator until Ctrl-C (or `--duration`), then shut it down.
pub fn run(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches).context("Simulator failed to start")?;

    if matches.get_flag("print-config") {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let sim = Simulator::start(config).context("Simulator failed to start")?;
    if let Some(path) = sim.modbus_client_path() {
        log::info!("Modbus clients connect to {}", path.display());
    }
    if let Some(path) = sim.ascii_client_path() {
        log::info!("ASCII clients connect to {}", path.display());
    }

    let (stop_tx, stop_rx) = flume::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let run_for = matches.get_one::<u64>("duration").map(|secs| Duration::from_secs(*secs));
    wait_for_stop(&sim, &stop_rx, run_for);

    let snapshot = sim.model().snapshot();
    sim.stop().context("Simulator did not shut down cleanly")?;

    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}

fn wait_for_stop(sim: &Simulator, stop_rx: &flume::Receiver<()>, run_for: Option<Duration>) {
    let started = std::time::Instant::now();
    loop {
        match stop_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) => {
                log::info!("Stop requested");
                return;
            }
            Err(flume::RecvTimeoutError::Disconnected) => return,
            Err(flume::RecvTimeoutError::Timeout) => {}
        }
        if run_for.is_some_and(|limit| started.elapsed() >= limit) {
            log::info!("Run duration elapsed");
            return;
        }
        if !sim.is_running() {
            log::warn!("A simulator worker exited unexpectedly");
            return;
        }
    }
}
