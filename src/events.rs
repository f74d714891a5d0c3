//! Fall and trial-end detection.
//!
//! [evaluate] is pure: it reads a [Pose] and a [TrialState] and reports what
//! happened, it never changes either of them. Applying the result is the
//! coordinator's job, see [crate::trial].

use crate::pose::Pose;
use crate::trial::TrialState;
use std::time::{Duration, Instant};

/// Thresholds the detector compares against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventConfig {
    /// Height below which the subject starts falling
    pub fall_threshold: f64,
    /// Height at or above which a fall is over. Must exceed `fall_threshold`
    pub recovery_threshold: f64,
    /// How long a fall may last before it forces a reset
    pub fall_reset_timeout: Duration,
    /// Forward distance from the origin that ends a trial
    pub trial_end_distance: f64,
}

impl Default for EventConfig {
    fn default() -> Self {
        EventConfig {
            fall_threshold: 0.2,
            recovery_threshold: 0.25,
            fall_reset_timeout: Duration::from_millis(5000),
            trial_end_distance: 70.0,
        }
    }
}

/// Transitions of the falling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallEvent {
    /// Height just dropped below the fall threshold
    Started,
    /// Height climbed back to the recovery threshold
    Recovered,
    /// The fall outlasted the reset timeout
    TimedOut,
}

/// What one evaluation found. Both fields may be set at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Detection {
    #[allow(missing_docs)]
    pub fall: Option<FallEvent>,
    #[allow(missing_docs)]
    pub trial_end: bool,
}

impl Detection {
    /// Nothing to do this tick.
    pub fn is_quiet(&self) -> bool {
        self.fall.is_none() && !self.trial_end
    }
}

/// Look for fall and trial-end conditions at time `now`.
pub fn evaluate(pose: &Pose, trial: &TrialState, config: &EventConfig, now: Instant) -> Detection {
    let fall = match trial.fall_started_at {
        None if pose.height < config.fall_threshold => Some(FallEvent::Started),
        None => None,
        Some(_) if pose.height >= config.recovery_threshold => Some(FallEvent::Recovered),
        Some(started) if now.saturating_duration_since(started) > config.fall_reset_timeout => {
            Some(FallEvent::TimedOut)
        }
        // inside the hysteresis band, still falling
        Some(_) => None,
    };

    let trial_end = !trial.is_trial_end && pose.y.abs() >= config.trial_end_distance;

    Detection { fall, trial_end }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn falling_since(t: Instant) -> TrialState {
        TrialState {
            is_falling: true,
            fall_started_at: Some(t),
            ..TrialState::new(t)
        }
    }

    #[test]
    fn quiet_on_solid_ground() {
        let now = Instant::now();
        let det = evaluate(
            &Pose::at(0.0, 10.0, 0.5),
            &TrialState::new(now),
            &EventConfig::default(),
            now,
        );
        assert!(det.is_quiet());
    }

    #[test]
    fn fall_starts_below_threshold() {
        let now = Instant::now();
        let det = evaluate(
            &Pose::at(0.0, 0.0, 0.19),
            &TrialState::new(now),
            &EventConfig::default(),
            now,
        );
        assert_eq!(det.fall, Some(FallEvent::Started));
    }

    #[test]
    fn hysteresis_band_does_not_flap() {
        let config = EventConfig::default();
        let t0 = Instant::now();
        let trial = falling_since(t0);
        for (i, height) in [0.19, 0.21, 0.24, 0.2, 0.249].into_iter().enumerate() {
            let now = t0 + Duration::from_millis(100 * i as u64);
            let det = evaluate(&Pose::at(0.0, 0.0, height), &trial, &config, now);
            assert_eq!(det.fall, None, "height {height} should stay falling");
        }
        let det = evaluate(&Pose::at(0.0, 0.0, 0.25), &trial, &config, t0);
        assert_eq!(det.fall, Some(FallEvent::Recovered));
    }

    #[test]
    fn long_fall_times_out() {
        let config = EventConfig::default();
        let t0 = Instant::now();
        let trial = falling_since(t0);
        let low = Pose::at(0.0, 0.0, -3.0);

        let at_limit = evaluate(&low, &trial, &config, t0 + config.fall_reset_timeout);
        assert_eq!(at_limit.fall, None);

        let past = t0 + config.fall_reset_timeout + Duration::from_millis(1);
        assert_eq!(
            evaluate(&low, &trial, &config, past).fall,
            Some(FallEvent::TimedOut)
        );
    }

    #[test]
    fn trial_end_in_either_direction() {
        let config = EventConfig {
            trial_end_distance: 2.0,
            ..EventConfig::default()
        };
        let now = Instant::now();
        let trial = TrialState::new(now);
        assert!(evaluate(&Pose::at(0.0, 2.0, 1.0), &trial, &config, now).trial_end);
        assert!(evaluate(&Pose::at(0.0, -2.5, 1.0), &trial, &config, now).trial_end);
        assert!(!evaluate(&Pose::at(5.0, 1.9, 1.0), &trial, &config, now).trial_end);
    }

    #[test]
    fn trial_end_respects_guard() {
        let config = EventConfig {
            trial_end_distance: 2.0,
            ..EventConfig::default()
        };
        let now = Instant::now();
        let trial = TrialState {
            is_trial_end: true,
            ..TrialState::new(now)
        };
        assert!(!evaluate(&Pose::at(0.0, 3.0, 1.0), &trial, &config, now).trial_end);
    }

    #[test]
    fn both_events_in_one_tick() {
        let config = EventConfig {
            trial_end_distance: 2.0,
            ..EventConfig::default()
        };
        let t0 = Instant::now();
        let det = evaluate(
            &Pose::at(0.0, 3.0, 0.0),
            &falling_since(t0),
            &config,
            t0 + Duration::from_secs(6),
        );
        assert_eq!(det.fall, Some(FallEvent::TimedOut));
        assert!(det.trial_end);
    }
}
