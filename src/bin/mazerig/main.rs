//! The experiment host. Viewers connect over TCP, register a session and
//! receive its state.

use clap::Parser;
use log::{error, info};
use mazerig::{
    args::{RigArgs, RigCommand, ServeCommand},
    config::{ServerConfig, SIMULATED_PORT},
    hardware::RigFactory,
    host::Host,
    serial_reader::available_ports,
    transport,
};
use std::{error::Error, process::ExitCode};

// Example:
// cargo run --bin mazerig -- serve --config rig.ron --bind 0.0.0.0:8765
// cargo run --bin mazerig -- serve --simulate

fn main() -> ExitCode {
    env_logger::init();
    let args = RigArgs::parse();

    let result = match args.command {
        RigCommand::Serve(cmd) => serve(cmd),
        RigCommand::ListPorts => list_ports(),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn serve(cmd: ServeCommand) -> Result<(), Box<dyn Error>> {
    let mut config = match &cmd.config {
        Some(path) => ServerConfig::from_path(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cmd.bind {
        config.bind = bind;
    }
    if let Some(tick_hz) = cmd.tick_hz {
        config.tick_hz = tick_hz;
    }
    if cmd.simulate {
        config.serial.port = SIMULATED_PORT.to_owned();
        config.defaults.serial.port = SIMULATED_PORT.to_owned();
    }
    config.validate()?;

    let listener = transport::bind(config.bind.as_str())?;
    info!(
        "shared trackball: {}, polling at {} Hz",
        config.serial.port, config.tick_hz
    );
    let host = Host::start(config, Box::new(RigFactory))?;
    transport::serve(host, listener)?;
    Ok(())
}

fn list_ports() -> Result<(), Box<dyn Error>> {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("No serial devices found.");
    }
    for port in ports {
        println!("{}", port.to_string_lossy());
    }
    Ok(())
}
