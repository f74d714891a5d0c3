//! Trial bookkeeping and the reward/reset coordinator.
//!
//! The coordinator applies a [Detection] to the session state. Trial end is
//! handled before a fall timeout because it carries the reward, and both
//! reset the subject to the origin.

use crate::events::{Detection, FallEvent};
use crate::pose::{Pose, Velocity};
use crate::reward::{Delivery, Dispenser, PulseSettings, RewardError};
use log::{debug, info, warn};
use serde::Serialize;
use std::time::Instant;

/// Per-session trial counters and flags.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialState {
    /// Trials completed so far
    pub trial_number: u32,
    /// Rewards actually delivered
    pub num_rewards: u32,
    /// Falls started so far
    pub fall_count: u32,
    #[allow(missing_docs)]
    pub is_falling: bool,
    /// Set right after a reset, cleared once the subject moves on
    pub is_trial_start: bool,
    /// Reentrancy guard for trial-end handling
    pub is_trial_end: bool,
    /// When the current fall began; `None` while grounded
    pub fall_started_at: Option<Instant>,
    /// When the current trial began
    pub trial_started_at: Instant,
}

impl TrialState {
    /// A fresh state with the first trial starting at `now`.
    pub fn new(now: Instant) -> Self {
        TrialState {
            trial_number: 0,
            num_rewards: 0,
            fall_count: 0,
            is_falling: false,
            is_trial_start: true,
            is_trial_end: false,
            fall_started_at: None,
            trial_started_at: now,
        }
    }
}

/// Everything the coordinator is allowed to touch.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    #[allow(missing_docs)]
    pub pose: Pose,
    #[allow(missing_docs)]
    pub velocity: Velocity,
    #[allow(missing_docs)]
    pub trial: TrialState,
}

impl Subject {
    /// A subject standing at `origin` at time `now`.
    pub fn new(origin: Pose, now: Instant) -> Self {
        Subject {
            pose: origin,
            velocity: Velocity::at_rest(),
            trial: TrialState::new(now),
        }
    }
}

/// The result of one trial-end attempt.
#[derive(Debug)]
pub enum RewardOutcome {
    /// Water was delivered.
    Delivered(Delivery),
    /// The trial counted but the pulse failed; it is not retried.
    Failed(RewardError),
    /// A trial end was already being handled.
    Skipped,
}

impl RewardOutcome {
    #[allow(missing_docs)]
    pub fn delivered(&self) -> bool {
        matches!(self, RewardOutcome::Delivered(_))
    }
}

/// What [apply] did to the subject.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Set when a trial ended this tick
    pub reward: Option<RewardOutcome>,
    /// Fall transition that was applied, if any
    pub fall: Option<FallEvent>,
    /// Whether the subject was sent back to the origin
    pub reset: bool,
}

/// Move the subject back to `origin` with zero velocity.
///
/// Vertical motion goes back to the physics engine and any fall in progress
/// is forgotten.
pub fn reset_subject(subject: &mut Subject, origin: Pose, now: Instant) {
    subject.pose = origin;
    subject.velocity = Velocity::at_rest();
    subject.trial.is_falling = false;
    subject.trial.fall_started_at = None;
    subject.trial.is_trial_start = true;
    subject.trial.trial_started_at = now;
}

/// Close the current trial: count it, pulse once, reset.
///
/// The pulse is attempted exactly once. A failure is logged and the trial is
/// still counted and reset.
pub fn on_trial_end(
    subject: &mut Subject,
    dispenser: &mut dyn Dispenser,
    pulse: &PulseSettings,
    origin: Pose,
    now: Instant,
) -> RewardOutcome {
    if subject.trial.is_trial_end {
        debug!("trial end already in progress, skipping");
        return RewardOutcome::Skipped;
    }
    subject.trial.is_trial_end = true;
    subject.trial.trial_number += 1;

    let elapsed = now.saturating_duration_since(subject.trial.trial_started_at);
    info!(
        "trial {} complete at y = {:.2} after {:.1}s",
        subject.trial.trial_number,
        subject.pose.y,
        elapsed.as_secs_f64()
    );

    let outcome = match dispenser.pulse(pulse.amplitude, pulse.duration, now) {
        Ok(delivery) => {
            subject.trial.num_rewards += 1;
            RewardOutcome::Delivered(delivery)
        }
        Err(e) => {
            warn!(
                "reward for trial {} not delivered: {}",
                subject.trial.trial_number, e
            );
            RewardOutcome::Failed(e)
        }
    };

    reset_subject(subject, origin, now);
    subject.trial.is_trial_end = false;
    outcome
}

/// Give up on a fall: reset without counting a trial or a reward.
pub fn on_fall_timeout(subject: &mut Subject, origin: Pose, now: Instant) {
    info!(
        "fall timed out after {:.1}s, resetting to origin",
        subject
            .trial
            .fall_started_at
            .map(|t| now.saturating_duration_since(t).as_secs_f64())
            .unwrap_or_default()
    );
    reset_subject(subject, origin, now);
}

/// Apply a [Detection] to `subject`.
pub fn apply(
    subject: &mut Subject,
    detection: Detection,
    dispenser: &mut dyn Dispenser,
    pulse: &PulseSettings,
    origin: Pose,
    now: Instant,
) -> Resolution {
    let mut resolution = Resolution::default();

    if detection.trial_end {
        resolution.reward = Some(on_trial_end(subject, dispenser, pulse, origin, now));
        resolution.reset = true;
    }

    match detection.fall {
        // the trial-end reset already cleared the fall
        _ if resolution.reset => {}
        Some(FallEvent::Started) => {
            subject.trial.is_falling = true;
            subject.trial.fall_started_at = Some(now);
            subject.trial.fall_count += 1;
            info!(
                "fall started at height {:.3} (fall #{})",
                subject.pose.height, subject.trial.fall_count
            );
            resolution.fall = detection.fall;
        }
        Some(FallEvent::Recovered) => {
            subject.trial.is_falling = false;
            subject.trial.fall_started_at = None;
            info!("recovered from fall at height {:.3}", subject.pose.height);
            resolution.fall = detection.fall;
        }
        Some(FallEvent::TimedOut) => {
            on_fall_timeout(subject, origin, now);
            resolution.fall = detection.fall;
            resolution.reset = true;
        }
        None => {}
    }

    resolution
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    #[allow(missing_docs)]
    pub trial_number: u32,
    #[allow(missing_docs)]
    pub num_rewards: u32,
    #[allow(missing_docs)]
    pub fall_count: u32,
    /// Seconds since the session started
    pub elapsed_time: f64,
    /// Rewards per second
    pub reward_rate: f64,
}

impl Summary {
    #[allow(missing_docs)]
    pub fn from_trial(trial: &TrialState, elapsed_secs: f64) -> Self {
        let reward_rate = if elapsed_secs > 0.0 {
            trial.num_rewards as f64 / elapsed_secs
        } else {
            0.0
        };
        Summary {
            trial_number: trial.trial_number,
            num_rewards: trial.num_rewards,
            fall_count: trial.fall_count,
            elapsed_time: elapsed_secs,
            reward_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingDispenser {
        calls: u32,
        fail: bool,
    }

    impl Dispenser for CountingDispenser {
        fn pulse(
            &mut self,
            amplitude: f64,
            duration: Duration,
            _now: Instant,
        ) -> Result<Delivery, RewardError> {
            self.calls += 1;
            if self.fail {
                return Err(RewardError::Busy);
            }
            Ok(Delivery {
                amplitude,
                duration,
                count: self.calls,
            })
        }
    }

    fn pulse() -> PulseSettings {
        PulseSettings {
            duration: Duration::ZERO,
            ..PulseSettings::default()
        }
    }

    #[test]
    fn trial_end_rewards_once_and_resets() {
        let now = Instant::now();
        let origin = Pose::at(0.0, 0.0, 1.0);
        let mut subject = Subject::new(origin, now);
        subject.pose.y = 71.0;
        subject.trial.is_trial_start = false;
        let mut water = CountingDispenser::default();

        let outcome = on_trial_end(&mut subject, &mut water, &pulse(), origin, now);

        assert!(outcome.delivered());
        assert_eq!(water.calls, 1);
        assert_eq!(subject.trial.trial_number, 1);
        assert_eq!(subject.trial.num_rewards, 1);
        assert_eq!(subject.pose, origin);
        assert!(subject.trial.is_trial_start);
        assert!(!subject.trial.is_trial_end);
    }

    #[test]
    fn guard_skips_reentrant_trial_end() {
        let now = Instant::now();
        let mut subject = Subject::new(Pose::default(), now);
        subject.trial.is_trial_end = true;
        let mut water = CountingDispenser::default();

        let outcome = on_trial_end(&mut subject, &mut water, &pulse(), Pose::default(), now);
        assert!(matches!(outcome, RewardOutcome::Skipped));
        assert_eq!(water.calls, 0);
        assert_eq!(subject.trial.trial_number, 0);
    }

    #[test]
    fn failed_reward_still_closes_the_trial() {
        let now = Instant::now();
        let mut subject = Subject::new(Pose::default(), now);
        subject.pose.y = 80.0;
        let mut water = CountingDispenser {
            fail: true,
            ..Default::default()
        };

        let outcome = on_trial_end(&mut subject, &mut water, &pulse(), Pose::default(), now);
        assert!(matches!(outcome, RewardOutcome::Failed(RewardError::Busy)));
        assert_eq!(water.calls, 1);
        assert_eq!(subject.trial.trial_number, 1);
        assert_eq!(subject.trial.num_rewards, 0);
        assert_eq!(subject.pose.y, 0.0);
    }

    #[test]
    fn fall_timeout_resets_without_reward() {
        let t0 = Instant::now();
        let origin = Pose::at(0.0, 0.0, 1.0);
        let mut subject = Subject::new(origin, t0);
        subject.pose = Pose::at(3.0, 4.0, -2.0);
        let mut water = CountingDispenser::default();

        let started = Detection {
            fall: Some(FallEvent::Started),
            trial_end: false,
        };
        apply(&mut subject, started, &mut water, &pulse(), origin, t0);
        assert!(subject.trial.is_falling);
        assert_eq!(subject.trial.fall_count, 1);

        let timeout = Detection {
            fall: Some(FallEvent::TimedOut),
            trial_end: false,
        };
        let later = t0 + Duration::from_secs(6);
        let res = apply(&mut subject, timeout, &mut water, &pulse(), origin, later);
        assert!(res.reset);
        assert!(res.reward.is_none());
        assert_eq!(subject.pose, origin);
        assert!(!subject.trial.is_falling);
        assert_eq!(subject.trial.trial_number, 0);
        assert_eq!(water.calls, 0);
    }

    #[test]
    fn trial_end_wins_over_fall_timeout() {
        let t0 = Instant::now();
        let mut subject = Subject::new(Pose::default(), t0);
        subject.trial.is_falling = true;
        subject.trial.fall_started_at = Some(t0);
        let mut water = CountingDispenser::default();

        let both = Detection {
            fall: Some(FallEvent::TimedOut),
            trial_end: true,
        };
        let res = apply(&mut subject, both, &mut water, &pulse(), Pose::default(), t0);
        assert!(res.reward.as_ref().is_some_and(RewardOutcome::delivered));
        assert_eq!(res.fall, None);
        assert_eq!(subject.trial.num_rewards, 1);
        assert!(!subject.trial.is_falling);
    }

    #[test]
    fn summary_rate_is_per_second() {
        let mut trial = TrialState::new(Instant::now());
        trial.num_rewards = 3;
        let summary = Summary::from_trial(&trial, 1.5);
        assert_eq!(summary.reward_rate, 2.0);
        assert_eq!(Summary::from_trial(&trial, 0.0).reward_rate, 0.0);
    }
}
