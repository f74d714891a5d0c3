//! Opening rig hardware for sessions and for the host.
//!
//! [HardwareFactory] is the seam between sessions and devices: sessions that
//! own their hardware ask the factory for a frame source and a valve, and
//! the host uses the same factory to build the [SharedHardware] it lends to
//! managed sessions.

use crate::config::{RewardConfig, SerialConfig};
use crate::error::HardwareError;
use crate::frame_source::{FrameBuffer, FrameSource};
use crate::reward::{SimulatedValve, Valve, WaterDelivery};
use crate::serial_reader::SerialReader;
use crate::simulated::SimulatedTrackball;

use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Opens frame sources and valves.
pub trait HardwareFactory: Send + Sync {
    /// Start a frame source writing into `buffer`.
    fn open_source(
        &self,
        serial: &SerialConfig,
        buffer: FrameBuffer,
    ) -> Result<Box<dyn FrameSource>, HardwareError>;

    /// Open the reward valve.
    fn open_valve(&self, reward: &RewardConfig) -> Result<Box<dyn Valve>, HardwareError>;
}

/// The factory used outside of tests: a serial device or the simulator,
/// and a simulated valve since no analog output driver is linked in.
#[derive(Debug, Default, Clone, Copy)]
pub struct RigFactory;

impl HardwareFactory for RigFactory {
    fn open_source(
        &self,
        serial: &SerialConfig,
        buffer: FrameBuffer,
    ) -> Result<Box<dyn FrameSource>, HardwareError> {
        match serial.settings() {
            Some(settings) => Ok(Box::new(SerialReader::open(settings, buffer)?)),
            None => {
                info!("no serial port configured, starting simulated trackball");
                Ok(Box::new(SimulatedTrackball::start(buffer)?))
            }
        }
    }

    fn open_valve(&self, reward: &RewardConfig) -> Result<Box<dyn Valve>, HardwareError> {
        info!(
            "reward valve: simulated, {:.1} V for {} ms",
            reward.amplitude, reward.duration_ms
        );
        Ok(Box::new(SimulatedValve::new()))
    }
}

/// Open the valve described by `reward`, or `None` when rewards are disabled.
pub fn open_delivery(
    factory: &dyn HardwareFactory,
    reward: &RewardConfig,
) -> Result<Option<WaterDelivery>, HardwareError> {
    if !reward.enabled {
        warn!("reward hardware disabled, rewards will fail");
        return Ok(None);
    }
    let valve = factory.open_valve(reward)?;
    Ok(Some(WaterDelivery::new(
        valve,
        Duration::from_millis(reward.cooldown_ms),
    )))
}

/// Hardware the host owns for its whole lifetime and lends to managed
/// sessions.
pub struct SharedHardware {
    /// The host's trackball
    pub source: Mutex<Option<Box<dyn FrameSource>>>,
    /// Frames from `source`
    pub buffer: FrameBuffer,
    /// The host's valve, if any
    pub reward: Option<Arc<Mutex<WaterDelivery>>>,
}

impl SharedHardware {
    /// Bring up the host's hardware. Failing to open the trackball or valve
    /// is not fatal: the host runs without it and says so.
    pub fn open(factory: &dyn HardwareFactory, serial: &SerialConfig, reward: &RewardConfig) -> Self {
        let buffer = FrameBuffer::new();
        let source = match factory.open_source(serial, buffer.clone()) {
            Ok(source) => {
                info!("shared frame source: {}", source.describe());
                Some(source)
            }
            Err(e) => {
                warn!("shared frame source unavailable: {}", e);
                None
            }
        };
        let reward = match open_delivery(factory, reward) {
            Ok(delivery) => delivery.map(|d| Arc::new(Mutex::new(d))),
            Err(e) => {
                warn!("shared reward valve unavailable: {}", e);
                None
            }
        };
        SharedHardware {
            source: Mutex::new(source),
            buffer,
            reward,
        }
    }

    /// No hardware at all. Managed sessions still run but see no frames.
    pub fn detached() -> Self {
        SharedHardware {
            source: Mutex::new(None),
            buffer: FrameBuffer::new(),
            reward: None,
        }
    }

    /// Whether a trackball is attached and its reader is alive.
    pub fn source_connected(&self) -> bool {
        self.source
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|s| s.is_running())
    }

    /// Stop the reader and release everything.
    pub fn shutdown(&self) {
        let source = self.source.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut source) = source {
            if let Err(e) = source.stop() {
                warn!("error stopping shared frame source: {}", e);
            }
        }
        if let Some(reward) = &self.reward {
            if let Err(e) = reward.lock().unwrap_or_else(|e| e.into_inner()).close() {
                warn!("error closing shared valve: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_hardware_comes_up_simulated() {
        let serial = SerialConfig::default();
        let reward = RewardConfig::default();
        let shared = SharedHardware::open(&RigFactory, &serial, &reward);
        assert!(shared.source_connected());
        assert!(shared.reward.is_some());

        shared.shutdown();
        assert!(!shared.source_connected());
    }

    #[test]
    fn missing_port_and_disabled_reward_are_tolerated() {
        let serial = SerialConfig {
            port: "/dev/does-not-exist-mazerig".to_owned(),
            ..SerialConfig::default()
        };
        let reward = RewardConfig {
            enabled: false,
            ..RewardConfig::default()
        };
        let shared = SharedHardware::open(&RigFactory, &serial, &reward);
        assert!(!shared.source_connected());
        assert!(shared.reward.is_none());
        assert!(open_delivery(&RigFactory, &reward).unwrap().is_none());
    }
}
