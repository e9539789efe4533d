use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::config::SimConfig;

pub fn build_command() -> Command {
    Command::new("sonicsim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Simulated 4-channel sonicator controller (Modbus RTU + ASCII harness)")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Load settings from a TOML file")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("print-config")
                .long("print-config")
                .help("Print the effective configuration as TOML and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .short('j')
                .help("Print the final device state as JSON on exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .help("Write logs to this file (also SONICSIM_LOG_FILE)")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("modbus-port")
                .long("modbus-port")
                .help("Serve Modbus on this serial port instead of a provisioned null-modem")
                .value_name("PORT"),
        )
        .arg(
            Arg::new("ascii-port")
                .long("ascii-port")
                .help("Serve the ASCII harness on this serial port instead of a provisioned null-modem")
                .value_name("PORT"),
        )
        .arg(
            Arg::new("unit-id")
                .long("unit-id")
                .help("Modbus unit id to answer to")
                .value_name("ID")
                .value_parser(clap::value_parser!(u8).range(1..=247)),
        )
        .arg(
            Arg::new("baud-rate")
                .long("baud-rate")
                .help("Line speed for both endpoints")
                .value_name("BAUD")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("no-modbus")
                .long("no-modbus")
                .help("Do not start the Modbus endpoint")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-ascii")
                .long("no-ascii")
                .help("Do not start the ASCII endpoint")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .help("Stop after this many seconds instead of waiting for Ctrl-C")
                .value_name("SECS")
                .value_parser(clap::value_parser!(u64)),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}

/// Apply command line overrides on top of the file configuration.
pub fn apply_overrides(config: &mut SimConfig, matches: &ArgMatches) -> Result<()> {
    if let Some(port) = matches.get_one::<String>("modbus-port") {
        config.modbus.port = Some(port.clone());
        config.modbus.provision = false;
    }
    if let Some(port) = matches.get_one::<String>("ascii-port") {
        config.ascii.port = Some(port.clone());
        config.ascii.provision = false;
    }
    if let Some(unit_id) = matches.get_one::<u8>("unit-id") {
        config.modbus.unit_id = *unit_id;
    }
    if let Some(baud_rate) = matches.get_one::<u32>("baud-rate") {
        config.modbus.baud_rate = *baud_rate;
        config.ascii.baud_rate = *baud_rate;
    }
    if matches.get_flag("no-modbus") {
        config.modbus.enabled = false;
    }
    if matches.get_flag("no-ascii") {
        config.ascii.enabled = false;
    }
    config.validate()?;
    Ok(())
}
