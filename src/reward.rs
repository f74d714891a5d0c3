//! Water reward delivery.
//!
//! A [Valve] is the thin hardware seam: it can raise the solenoid drive to a
//! voltage and drop it back to zero. [WaterDelivery] turns that into a timed
//! pulse and enforces a minimum gap between pulses. A request that lands
//! inside the cooldown fails immediately; it is never queued.

use crate::error::HardwareError;
use log::{debug, info, warn};
use std::{
    fmt,
    sync::{Arc, Mutex, TryLockError},
    time::{Duration, Instant},
};

/// Something that can open and close the water solenoid.
pub trait Valve: Send {
    /// Drive the solenoid at `volts`.
    fn set_level(&mut self, volts: f64) -> Result<(), HardwareError>;
    /// Drop the drive to zero.
    fn close(&mut self) -> Result<(), HardwareError>;
}

/// A valve with no hardware behind it. Every level it is asked for is kept so
/// it can be inspected later.
#[derive(Debug, Clone, Default)]
pub struct SimulatedValve {
    levels: Arc<Mutex<Vec<f64>>>,
}

impl SimulatedValve {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every level written so far, closes included as `0.0`.
    pub fn history(&self) -> Vec<f64> {
        self.levels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn push(&self, volts: f64) {
        self.levels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(volts);
    }
}

impl Valve for SimulatedValve {
    fn set_level(&mut self, volts: f64) -> Result<(), HardwareError> {
        debug!("simulated valve set to {:.2} V", volts);
        self.push(volts);
        Ok(())
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        self.push(0.0);
        Ok(())
    }
}

/// Pulse shape and spacing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseSettings {
    /// Drive voltage while open
    pub amplitude: f64,
    /// How long the valve stays open
    pub duration: Duration,
    /// Minimum time between the starts of two pulses
    pub cooldown: Duration,
}

impl Default for PulseSettings {
    fn default() -> Self {
        PulseSettings {
            amplitude: 5.0,
            duration: Duration::from_millis(25),
            cooldown: Duration::from_millis(1000),
        }
    }
}

/// A completed pulse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delivery {
    #[allow(missing_docs)]
    pub amplitude: f64,
    #[allow(missing_docs)]
    pub duration: Duration,
    /// Pulses delivered by this actuator so far, this one included
    pub count: u32,
}

/// Why a pulse was not delivered.
#[derive(Debug)]
pub enum RewardError {
    /// The previous pulse was too recent.
    Cooldown {
        #[allow(missing_docs)]
        remaining: Duration,
    },
    /// Another caller is using the shared valve right now.
    Busy,
    /// No reward hardware is attached to this session.
    Inactive,
    /// The valve itself failed.
    Hardware(HardwareError),
}

impl fmt::Display for RewardError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RewardError::Cooldown { remaining } => write!(
                f,
                "cooldown active, wait {:.3}s",
                remaining.as_secs_f64()
            ),
            RewardError::Busy => write!(f, "reward valve busy"),
            RewardError::Inactive => write!(f, "no reward hardware attached"),
            RewardError::Hardware(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RewardError {}

impl From<HardwareError> for RewardError {
    fn from(value: HardwareError) -> Self {
        Self::Hardware(value)
    }
}

/// Anything a trial can ask for a reward.
pub trait Dispenser {
    /// Deliver one pulse, or say why not.
    fn pulse(
        &mut self,
        amplitude: f64,
        duration: Duration,
        now: Instant,
    ) -> Result<Delivery, RewardError>;
}

/// A valve plus the cooldown bookkeeping around it.
pub struct WaterDelivery {
    valve: Box<dyn Valve>,
    cooldown: Duration,
    last_pulse: Option<Instant>,
    deliveries: u32,
}

impl WaterDelivery {
    #[allow(missing_docs)]
    pub fn new(valve: Box<dyn Valve>, cooldown: Duration) -> Self {
        WaterDelivery {
            valve,
            cooldown,
            last_pulse: None,
            deliveries: 0,
        }
    }

    /// A delivery backed by a [SimulatedValve].
    pub fn simulated(cooldown: Duration) -> Self {
        Self::new(Box::new(SimulatedValve::new()), cooldown)
    }

    /// Pulses delivered so far.
    pub fn deliveries(&self) -> u32 {
        self.deliveries
    }

    /// Time left before another pulse is allowed.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_pulse?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < self.cooldown).then(|| self.cooldown - elapsed)
    }

    /// Drop the drive to zero for good.
    pub fn close(&mut self) -> Result<(), HardwareError> {
        self.valve.close()
    }
}

impl Dispenser for WaterDelivery {
    fn pulse(
        &mut self,
        amplitude: f64,
        duration: Duration,
        now: Instant,
    ) -> Result<Delivery, RewardError> {
        if let Some(remaining) = self.cooldown_remaining(now) {
            return Err(RewardError::Cooldown { remaining });
        }

        let opened = self.valve.set_level(amplitude);
        if opened.is_ok() {
            spin_sleep::sleep(duration);
        }
        // the valve must never be left open, even if raising it failed
        let closed = self.valve.close();
        opened?;
        closed?;

        self.last_pulse = Some(now);
        self.deliveries += 1;
        info!(
            "water delivered: {:.1} V for {} ms (#{})",
            amplitude,
            duration.as_millis(),
            self.deliveries
        );
        Ok(Delivery {
            amplitude,
            duration,
            count: self.deliveries,
        })
    }
}

/// How a session reaches its reward hardware.
pub enum RewardHandle {
    /// The session opened the valve and must close it.
    Owned(WaterDelivery),
    /// The host owns the valve and lends it out.
    Shared(Arc<Mutex<WaterDelivery>>),
    /// No valve; every reward fails.
    Absent,
}

impl RewardHandle {
    /// Give back the hardware. Only owned valves are closed here; a shared
    /// valve outlives the session.
    pub fn release(&mut self) -> Result<(), HardwareError> {
        match std::mem::replace(self, RewardHandle::Absent) {
            RewardHandle::Owned(mut delivery) => delivery.close(),
            RewardHandle::Shared(_) | RewardHandle::Absent => Ok(()),
        }
    }

    /// Whether any valve is attached.
    pub fn is_attached(&self) -> bool {
        !matches!(self, RewardHandle::Absent)
    }
}

impl Dispenser for RewardHandle {
    fn pulse(
        &mut self,
        amplitude: f64,
        duration: Duration,
        now: Instant,
    ) -> Result<Delivery, RewardError> {
        match self {
            RewardHandle::Owned(delivery) => delivery.pulse(amplitude, duration, now),
            RewardHandle::Shared(shared) => match shared.try_lock() {
                Ok(mut delivery) => delivery.pulse(amplitude, duration, now),
                Err(TryLockError::Poisoned(e)) => {
                    warn!("reward lock poisoned, continuing");
                    e.into_inner().pulse(amplitude, duration, now)
                }
                Err(TryLockError::WouldBlock) => Err(RewardError::Busy),
            },
            RewardHandle::Absent => Err(RewardError::Inactive),
        }
    }
}
