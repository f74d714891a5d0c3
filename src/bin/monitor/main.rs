mod gui;

use clap::Parser;
use mazerig::{
    args::MonitorArgs,
    config::{ExperimentConfig, HardwareMode, PositionAuthority, SerialConfig, SIMULATED_PORT},
    experiment::Experiment,
    gui::device_selector,
    hardware::RigFactory,
    serial_reader::SerialSettings,
};
use std::{error::Error, time::Instant};

use gui::engage_gui;

/// Frames buffered between the reader and the chart.
const FEED_CAPACITY: usize = 256;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = MonitorArgs::parse();

    let port = if args.simulate {
        SIMULATED_PORT.to_owned()
    } else if let Some(port) = args.port {
        port
    } else {
        match device_selector(&SerialSettings::default().port)? {
            Some(port) => port,
            None => {
                println!("No trackball selected.");
                return Ok(());
            }
        }
    };

    let config = ExperimentConfig {
        trial_end_distance: args.trial_end_distance,
        serial: SerialConfig {
            port,
            baud_rate: args.baud_rate,
            ..SerialConfig::default()
        },
        log_dir: None,
        ..ExperimentConfig::default()
    };
    config.validate()?;

    let mut experiment = Experiment::new(
        "monitor",
        HardwareMode::Standalone,
        PositionAuthority::Backend,
        config,
    );
    experiment.initialize(&RigFactory, None, FEED_CAPACITY, Instant::now())?;
    let feed = experiment
        .take_feed()
        .ok_or("the trackball reader has no feed")?;

    let summary = engage_gui(experiment, feed)?;
    println!(
        "{} trials, {} rewards, {} falls in {:.1}s ({:.3} rewards/s)",
        summary.trial_number,
        summary.num_rewards,
        summary.fall_count,
        summary.elapsed_time,
        summary.reward_rate
    );
    Ok(())
}
