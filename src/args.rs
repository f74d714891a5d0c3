// Commandline argument parsers using clap for the rig binaries

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
#[allow(missing_docs)]
pub struct RigArgs {
    #[command(subcommand)]
    /// Which task to perform, serving viewers or listing serial devices
    pub command: RigCommand,
}

#[derive(Debug, Subcommand, Clone)]
#[allow(missing_docs)]
pub enum RigCommand {
    /// Run the experiment host that viewers connect to
    #[command(about)]
    Serve(ServeCommand),

    /// Print the serial devices that look like a trackball
    #[command(about)]
    ListPorts,
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct ServeCommand {
    /// RON file with the host configuration; defaults are used without one
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(short = 'b', long = "bind")]
    pub bind: Option<String>,

    /// Polling rate for autonomous sessions, in ticks per second
    #[arg(short = 't', long = "tick-hz")]
    pub tick_hz: Option<f64>,

    /// Ignore the configured serial port and use the simulated trackball
    #[arg(long)]
    pub simulate: bool,
}

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct MonitorArgs {
    /// Serial device to read; a selector is shown when neither this nor
    /// --simulate is given
    #[arg(short = 'p', long = "port")]
    pub port: Option<String>,

    /// Baud rate of the serial device
    #[arg(short = 'b', long = "baud", default_value_t = 115200)]
    pub baud_rate: u32,

    /// Use the simulated trackball
    #[arg(long, conflicts_with = "port")]
    pub simulate: bool,

    /// Forward distance that ends a trial
    #[arg(short = 'd', long = "distance", default_value_t = 70.0)]
    pub trial_end_distance: f64,
}
