//! Experiment and server configuration.
//!
//! The server reads a [ServerConfig] from a RON file at startup. Experiment
//! parameters arrive as the JSON `config` object of a registration message
//! and are layered over the server's defaults, so a client only has to send
//! the keys it wants to change:
//!
//! ```text
//! (
//!     bind: "127.0.0.1:8765",
//!     tick_hz: 50.0,
//!     serial: (port: "simulated"),
//!     defaults: (trialEndDistance: 70.0, logDir: Some("data")),
//! )
//! ```

use crate::events::EventConfig;
use crate::motion::MotionConfig;
use crate::pose::Pose;
use crate::reward::PulseSettings;
use crate::serial_reader::SerialSettings;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    borrow::Cow, fmt, fs, ops::RangeInclusive, path::Path, path::PathBuf, time::Duration,
};

/// The port name that selects the built-in trackball simulator.
pub const SIMULATED_PORT: &str = "simulated";

/// Who opens and closes the rig hardware for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// The host owns the hardware and lends it to the session.
    Managed,
    /// The session owns its hardware; the host polls it on a fixed period.
    Autonomous,
    /// The session owns its hardware and is woken by each new frame.
    Standalone,
}

impl fmt::Display for HardwareMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            HardwareMode::Managed => "managed",
            HardwareMode::Autonomous => "autonomous",
            HardwareMode::Standalone => "standalone",
        };
        write!(f, "{}", name)
    }
}

/// Which side integrates position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionAuthority {
    /// This process integrates trackball motion into a pose.
    #[default]
    Backend,
    /// The frontend's physics engine owns the pose and reports it back.
    Frontend,
}

/// Serial device settings as they appear in config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SerialConfig {
    /// Device path, or `"simulated"`
    pub port: String,
    #[allow(missing_docs)]
    pub baud_rate: u32,
    #[allow(missing_docs)]
    pub init_string: Option<String>,
    #[allow(missing_docs)]
    pub start_command: Option<String>,
    #[allow(missing_docs)]
    pub stop_command: Option<String>,
    /// Pause after each command, in milliseconds
    pub settle_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        let settings = SerialSettings::default();
        SerialConfig {
            port: SIMULATED_PORT.to_owned(),
            baud_rate: settings.baud_rate,
            init_string: None,
            start_command: settings.start_command,
            stop_command: settings.stop_command,
            settle_ms: settings.settle.as_millis() as u64,
        }
    }
}

impl SerialConfig {
    /// Whether this config asks for the simulator instead of a device.
    pub fn is_simulated(&self) -> bool {
        self.port.eq_ignore_ascii_case(SIMULATED_PORT)
    }

    /// Settings for a real device, or `None` for the simulator.
    pub fn settings(&self) -> Option<SerialSettings> {
        (!self.is_simulated()).then(|| SerialSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            init_string: self.init_string.clone(),
            start_command: self.start_command.clone(),
            stop_command: self.stop_command.clone(),
            settle: Duration::from_millis(self.settle_ms),
        })
    }
}

/// Reward pulse settings as they appear in config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RewardConfig {
    /// Valve drive voltage
    pub amplitude: f64,
    #[serde(alias = "waterDurationMs")]
    #[allow(missing_docs)]
    pub duration_ms: u64,
    #[allow(missing_docs)]
    pub cooldown_ms: u64,
    /// Attach a valve at all
    pub enabled: bool,
}

impl Default for RewardConfig {
    fn default() -> Self {
        let pulse = PulseSettings::default();
        RewardConfig {
            amplitude: pulse.amplitude,
            duration_ms: pulse.duration.as_millis() as u64,
            cooldown_ms: pulse.cooldown.as_millis() as u64,
            enabled: true,
        }
    }
}

impl RewardConfig {
    #[allow(missing_docs)]
    pub fn pulse(&self) -> PulseSettings {
        PulseSettings {
            amplitude: self.amplitude,
            duration: Duration::from_millis(self.duration_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

/// Where the subject starts and is reset to.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Origin {
    #[allow(missing_docs)]
    pub x: f64,
    #[allow(missing_docs)]
    pub y: f64,
    /// Defaults to the player radius when absent
    pub height: Option<f64>,
    #[allow(missing_docs)]
    pub heading: f64,
}

/// Tunables for one experiment session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExperimentConfig {
    /// Forward distance that ends a trial
    #[serde(alias = "trialEndY")]
    pub trial_end_distance: f64,
    /// Radius of the player body, sets the resting height
    pub player_radius: f64,
    /// Defaults to 0.4 × player radius
    pub fall_threshold: Option<f64>,
    /// Defaults to 0.5 × player radius
    pub recovery_threshold: Option<f64>,
    #[allow(missing_docs)]
    pub fall_reset_timeout_ms: u64,
    /// Per-axis speed limit
    pub max_velocity: f64,
    /// Tick period in seconds
    pub dt: f64,
    /// Length per encoder count
    #[serde(alias = "encoderToCm")]
    pub counts_to_length: f64,
    /// Radians per rotation count
    pub rotation_sensitivity: f64,
    /// Also stop turning while falling
    pub freeze_rotation_while_falling: bool,
    #[allow(missing_docs)]
    pub origin: Origin,
    #[allow(missing_docs)]
    pub reward: RewardConfig,
    /// Used by sessions that own their hardware
    pub serial: SerialConfig,
    #[allow(missing_docs)]
    pub position_authority: Option<PositionAuthority>,
    /// Overrides the registry's choice
    pub hardware_mode: Option<HardwareMode>,
    /// Where session logs go; `None` disables logging
    pub log_dir: Option<PathBuf>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let motion = MotionConfig::default();
        let events = EventConfig::default();
        ExperimentConfig {
            trial_end_distance: events.trial_end_distance,
            player_radius: 0.5,
            fall_threshold: None,
            recovery_threshold: None,
            fall_reset_timeout_ms: events.fall_reset_timeout.as_millis() as u64,
            max_velocity: motion.max_velocity,
            dt: motion.dt,
            counts_to_length: motion.counts_to_length,
            rotation_sensitivity: motion.rotation_sensitivity,
            freeze_rotation_while_falling: true,
            origin: Origin::default(),
            reward: RewardConfig::default(),
            serial: SerialConfig::default(),
            position_authority: None,
            hardware_mode: None,
            log_dir: Some(PathBuf::from("data")),
        }
    }
}

impl ExperimentConfig {
    /// Layer the keys present in `overrides` over `self`.
    ///
    /// Nested objects are merged key by key, anything else replaces.
    pub fn overlay(&self, overrides: &Value) -> Result<Self, ConfigError> {
        let mut base = serde_json::to_value(self).map_err(ConfigError::Json)?;
        let mut overrides = overrides.clone();
        canonicalize(&mut overrides);
        merge(&mut base, &overrides);
        let merged: ExperimentConfig = serde_json::from_value(base).map_err(ConfigError::Json)?;
        merged.validate()?;
        Ok(merged)
    }

    #[allow(missing_docs)]
    pub fn fall_threshold(&self) -> f64 {
        self.fall_threshold.unwrap_or(0.4 * self.player_radius)
    }

    #[allow(missing_docs)]
    pub fn recovery_threshold(&self) -> f64 {
        self.recovery_threshold.unwrap_or(0.5 * self.player_radius)
    }

    /// Reject settings that would make the session misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.fall_threshold() >= self.recovery_threshold() {
            return invalid(format!(
                "fall threshold {} must be below recovery threshold {}",
                self.fall_threshold(),
                self.recovery_threshold()
            ));
        }
        if !(self.dt > 0.0) {
            return invalid(format!("dt must be positive, got {}", self.dt));
        }
        if !(self.max_velocity > 0.0) {
            return invalid(format!(
                "maxVelocity must be positive, got {}",
                self.max_velocity
            ));
        }
        if !(self.trial_end_distance > 0.0) {
            return invalid(format!(
                "trialEndDistance must be positive, got {}",
                self.trial_end_distance
            ));
        }
        Ok(())
    }

    /// Integrator settings.
    pub fn motion(&self) -> MotionConfig {
        MotionConfig {
            dt: self.dt,
            counts_to_length: self.counts_to_length,
            max_velocity: self.max_velocity,
            rotation_sensitivity: self.rotation_sensitivity,
        }
    }

    /// Detector settings.
    pub fn events(&self) -> EventConfig {
        EventConfig {
            fall_threshold: self.fall_threshold(),
            recovery_threshold: self.recovery_threshold(),
            fall_reset_timeout: Duration::from_millis(self.fall_reset_timeout_ms),
            trial_end_distance: self.trial_end_distance,
        }
    }

    /// The pose the subject starts at and returns to.
    pub fn origin_pose(&self) -> Pose {
        Pose {
            x: self.origin.x,
            y: self.origin.y,
            height: self.origin.height.unwrap_or(self.player_radius),
            heading: self.origin.heading,
        }
        .normalized()
    }
}

/// Older clients use these names; both spellings in one object would be a
/// duplicate field once merged.
const ALIASES: [(&str, &str); 3] = [
    ("trialEndY", "trialEndDistance"),
    ("encoderToCm", "countsToLength"),
    ("waterDurationMs", "durationMs"),
];

fn canonicalize(value: &mut Value) {
    if let Value::Object(map) = value {
        for (old, new) in ALIASES {
            if let Some(v) = map.remove(old) {
                map.insert(new.to_owned(), v);
            }
        }
        map.values_mut().for_each(canonicalize);
    }
}

fn merge(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(key) {
                    Some(slot) if slot.is_object() && value.is_object() => merge(slot, value),
                    _ => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overrides) => *base = overrides.clone(),
    }
}

/// Process-wide settings for the session host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address viewers connect to
    pub bind: String,
    /// Rate of the polling loop for autonomous sessions
    pub tick_hz: f64,
    /// Messages a slow viewer may fall behind by before new ones are dropped
    pub viewer_queue_capacity: usize,
    /// Frames buffered between the serial reader and a session
    pub frame_feed_capacity: usize,
    /// Shared trackball for managed sessions
    pub serial: SerialConfig,
    /// Shared valve for managed sessions and manual rewards
    pub reward: RewardConfig,
    /// Base config every registration is layered over
    pub defaults: ExperimentConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1:8765".to_owned(),
            tick_hz: 50.0,
            viewer_queue_capacity: 1000,
            frame_feed_capacity: 256,
            serial: SerialConfig::default(),
            reward: RewardConfig::default(),
            defaults: ExperimentConfig::default(),
        }
    }
}

/// Polling rates the host accepts, in Hz.
pub const TICK_HZ_RANGE: RangeInclusive<f64> = 0.1..=1000.0;

impl ServerConfig {
    /// Read a RON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_ron(&text)
    }

    /// Parse RON text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = ron::from_str(text).map_err(ConfigError::Ron)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the host cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !TICK_HZ_RANGE.contains(&self.tick_hz) {
            return Err(ConfigError::Invalid(format!(
                "tick_hz must be within {:?}, got {}",
                TICK_HZ_RANGE, self.tick_hz
            )));
        }
        if self.viewer_queue_capacity == 0 || self.frame_feed_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue capacities must be at least 1".to_owned(),
            ));
        }
        self.defaults.validate()
    }

    /// Period of the polling loop.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz)
    }
}

/// A configuration could not be read or made no sense.
#[derive(Debug)]
pub enum ConfigError {
    /// Reading the file failed.
    Io(std::io::Error),

    /// The RON was malformed.
    Ron(ron::de::SpannedError),

    /// The JSON was malformed or had the wrong shape.
    Json(serde_json::Error),

    /// Values parsed but are inconsistent.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ConfigError as CE;
        let msg = match self {
            CE::Io(error) => Cow::from(format!("io error: {}", error)),
            CE::Ron(error) => Cow::from(format!("ron error: {}", error)),
            CE::Json(error) => Cow::from(format!("json error: {}", error)),
            CE::Invalid(reason) => Cow::from(reason.as_str()),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn thresholds_follow_radius() {
        let config = ExperimentConfig::default();
        assert!((config.fall_threshold() - 0.2).abs() < 1e-12);
        assert!((config.recovery_threshold() - 0.25).abs() < 1e-12);
        assert_eq!(config.origin_pose().height, 0.5);
    }

    #[test]
    fn overlay_accepts_frontend_keys() {
        let config = ExperimentConfig::default()
            .overlay(&json!({
                "trialEndY": 2.0,
                "maxVelocity": 50.0,
                "reward": { "waterDurationMs": 17 },
                "hardwareMode": "standalone",
            }))
            .unwrap();
        assert_eq!(config.trial_end_distance, 2.0);
        assert_eq!(config.max_velocity, 50.0);
        assert_eq!(config.reward.duration_ms, 17);
        // untouched nested keys keep their defaults
        assert_eq!(config.reward.cooldown_ms, 1000);
        assert_eq!(config.hardware_mode, Some(HardwareMode::Standalone));
    }

    #[test]
    fn inverted_hysteresis_is_rejected() {
        let res = ExperimentConfig::default().overlay(&json!({
            "fallThreshold": 0.3,
            "recoveryThreshold": 0.3,
        }));
        assert!(matches!(res, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn wrong_types_are_rejected() {
        let res = ExperimentConfig::default().overlay(&json!({ "dt": "fast" }));
        assert!(matches!(res, Err(ConfigError::Json(_))));
    }

    #[test]
    fn server_config_from_ron_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"(
                bind: "0.0.0.0:9000",
                tick_hz: 20.0,
                serial: (port: "/dev/ttyACM1", baudRate: 9600),
                defaults: (trialEndDistance: 35.0, logDir: None),
            )"#
        )
        .unwrap();

        let config = ServerConfig::from_path(file.path()).unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.tick_period(), Duration::from_millis(50));
        assert_eq!(config.viewer_queue_capacity, 1000);
        let serial = config.serial.settings().unwrap();
        assert_eq!(serial.port, "/dev/ttyACM1");
        assert_eq!(serial.baud_rate, 9600);
        assert_eq!(config.defaults.trial_end_distance, 35.0);
        assert_eq!(config.defaults.log_dir, None);
    }

    #[test]
    fn simulated_port_has_no_device_settings() {
        assert!(SerialConfig::default().settings().is_none());
    }

    #[test]
    fn tick_rate_must_be_finite_and_sane() {
        for tick_hz in [0.0, -5.0, 1e-300, 1e9, f64::NAN, f64::INFINITY] {
            let config = ServerConfig {
                tick_hz,
                ..ServerConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "tick_hz {} was accepted",
                tick_hz
            );
        }
        let slow = ServerConfig {
            tick_hz: 0.1,
            ..ServerConfig::default()
        };
        assert!(slow.validate().is_ok());
        assert_eq!(slow.tick_period(), Duration::from_secs(10));
    }

    #[test]
    fn bad_ron_is_reported() {
        assert!(matches!(
            ServerConfig::from_ron("(bind: 42"),
            Err(ConfigError::Ron(_))
        ));
    }
}
