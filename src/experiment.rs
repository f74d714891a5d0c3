//! One experiment session and the registry that builds them.
//!
//! An [Experiment] owns the subject's pose, velocity and trial state for the
//! lifetime of a session. Every session runs the same pipeline; what varies
//! is who owns the hardware ([HardwareMode]) and who owns the pose
//! ([PositionAuthority]):
//!
//! - backend authority: frames are integrated into a pose here, events are
//!   detected on that pose, and a [Snapshot] goes out to viewers.
//! - frontend authority: frames only advance the heading and are forwarded
//!   as [MotionMessage]s; the viewer's physics engine reports positions back
//!   and events are detected on those.

use crate::config::{ExperimentConfig, HardwareMode, PositionAuthority};
use crate::data_log::{DataLog, LogRow};
use crate::error::{HardwareError, SessionError};
use crate::events::{evaluate, EventConfig, FallEvent};
use crate::frame_source::{FrameBuffer, FrameSource, Received};
use crate::hardware::{open_delivery, HardwareFactory, SharedHardware};
use crate::motion::{integrate, realtime_motion, FallMotion, MotionConfig};
use crate::pose::{Pose, Velocity};
use crate::protocol::{
    ExperimentInfo, ExperimentStatus, MotionMessage, PlayerState, PositionConfirm,
    PositionReply, PositionUpdate, ResetDirective, Snapshot,
};
use crate::reward::{PulseSettings, RewardHandle};
use crate::trial::{apply, Resolution, Subject, Summary};

use log::{debug, info, warn};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{mpsc::Receiver, Arc},
    time::Instant,
};

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Built but not started
    Uninitialized,
    /// Running
    Active,
    /// Finished; terminal
    Terminated,
}

/// What processing one frame produced for viewers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionOutput {
    /// New state, for backend-authoritative sessions
    pub snapshot: Option<Snapshot>,
    /// Motion, for frontend-authoritative sessions
    pub motion: Option<MotionMessage>,
}

/// A single experiment session.
pub struct Experiment {
    id: String,
    mode: HardwareMode,
    authority: PositionAuthority,
    config: ExperimentConfig,
    motion: MotionConfig,
    events: EventConfig,
    pulse: PulseSettings,
    origin: Pose,

    lifecycle: Lifecycle,
    subject: Subject,
    started_at: Instant,
    summary: Option<Summary>,

    source: Option<Box<dyn FrameSource>>,
    buffer: Option<FrameBuffer>,
    feed: Option<Receiver<Received>>,
    reward: RewardHandle,
    log: Option<DataLog>,

    last_seq: u64,
    motion_seq: u64,
    water_pending: bool,
    reset_pending: Option<Instant>,
}

impl Experiment {
    /// Build an uninitialized session.
    pub fn new(
        id: impl Into<String>,
        mode: HardwareMode,
        authority: PositionAuthority,
        config: ExperimentConfig,
    ) -> Self {
        let now = Instant::now();
        let origin = config.origin_pose();
        Experiment {
            id: id.into(),
            mode,
            authority,
            motion: config.motion(),
            events: config.events(),
            pulse: config.reward.pulse(),
            origin,
            config,
            lifecycle: Lifecycle::Uninitialized,
            subject: Subject::new(origin, now),
            started_at: now,
            summary: None,
            source: None,
            buffer: None,
            feed: None,
            reward: RewardHandle::Absent,
            log: None,
            last_seq: 0,
            motion_seq: 0,
            water_pending: false,
            reset_pending: None,
        }
    }

    #[allow(missing_docs)]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[allow(missing_docs)]
    pub fn mode(&self) -> HardwareMode {
        self.mode
    }

    #[allow(missing_docs)]
    pub fn authority(&self) -> PositionAuthority {
        self.authority
    }

    #[allow(missing_docs)]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Read-only view of the pose, velocity and trial state.
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Acquire hardware, open the log and go active.
    ///
    /// Managed sessions borrow from `shared`; the others open their own
    /// hardware through `factory`. If any step fails, everything acquired so
    /// far is released before the error is returned.
    pub fn initialize(
        &mut self,
        factory: &dyn HardwareFactory,
        shared: Option<&SharedHardware>,
        feed_capacity: usize,
        now: Instant,
    ) -> Result<Snapshot, SessionError> {
        if self.lifecycle != Lifecycle::Uninitialized {
            return Err(SessionError::Protocol(format!(
                "experiment {} cannot be initialized twice",
                self.id
            )));
        }
        info!(
            "[{}] initializing ({} hardware, {:?} position authority)",
            self.id, self.mode, self.authority
        );

        if let Err(e) = self.acquire(factory, shared, feed_capacity) {
            warn!("[{}] initialization failed: {}", self.id, e);
            self.release();
            self.lifecycle = Lifecycle::Terminated;
            return Err(e);
        }

        self.subject = Subject::new(self.origin, now);
        self.started_at = now;
        self.lifecycle = Lifecycle::Active;
        info!(
            "[{}] active: trial end at |y| >= {}",
            self.id, self.events.trial_end_distance
        );
        Ok(self.snapshot(now))
    }

    fn acquire(
        &mut self,
        factory: &dyn HardwareFactory,
        shared: Option<&SharedHardware>,
        feed_capacity: usize,
    ) -> Result<(), SessionError> {
        match self.mode {
            HardwareMode::Managed => {
                if let Some(shared) = shared {
                    self.buffer = Some(shared.buffer.clone());
                    self.reward = match &shared.reward {
                        Some(reward) => RewardHandle::Shared(Arc::clone(reward)),
                        None => RewardHandle::Absent,
                    };
                } else {
                    warn!("[{}] managed session without shared hardware", self.id);
                }
            }
            HardwareMode::Autonomous | HardwareMode::Standalone => {
                let buffer = FrameBuffer::new();
                if self.mode == HardwareMode::Standalone {
                    self.feed = Some(buffer.attach_feed(feed_capacity));
                }
                let source = factory.open_source(&self.config.serial, buffer.clone())?;
                info!("[{}] opened {}", self.id, source.describe());
                self.source = Some(source);
                self.buffer = Some(buffer);
                self.reward = match open_delivery(factory, &self.config.reward)? {
                    Some(delivery) => RewardHandle::Owned(delivery),
                    None => RewardHandle::Absent,
                };
            }
        }
        if !self.reward.is_attached() {
            warn!("[{}] no reward valve, trials will not be rewarded", self.id);
        }

        if let Some(dir) = &self.config.log_dir {
            let log = DataLog::create(dir, &self.id).map_err(HardwareError::Io)?;
            self.log = Some(log);
        }
        Ok(())
    }

    /// The event feed of a standalone session's own reader, handed to the
    /// host's event pump. Only available once.
    pub fn take_feed(&mut self) -> Option<Receiver<Received>> {
        self.feed.take()
    }

    fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    /// Polling entry point: pick up the newest frame if there is one.
    ///
    /// Returns `None` when the session is not active or nothing new arrived
    /// since the last call.
    pub fn tick(&mut self, now: Instant) -> Option<SessionOutput> {
        if !self.is_active() {
            return None;
        }
        let latest = self.buffer.as_ref()?.latest()?;
        if latest.seq == self.last_seq {
            return None;
        }
        Some(self.process_frame(latest, now))
    }

    /// Run one frame through the pipeline.
    pub fn process_frame(&mut self, received: Received, now: Instant) -> SessionOutput {
        if !self.is_active() {
            return SessionOutput::default();
        }
        if received.seq <= self.last_seq {
            debug!("[{}] frame {} already processed", self.id, received.seq);
            return SessionOutput::default();
        }
        self.last_seq = received.seq;
        let frame = received.frame;

        match self.authority {
            PositionAuthority::Backend => {
                let policy = self.fall_motion(self.subject.trial.is_falling);
                let (pose, velocity) = integrate(&self.subject.pose, &frame, &self.motion, policy);
                self.subject.pose = pose;
                self.subject.velocity = velocity;
                if velocity.speed() > 0.0 {
                    self.subject.trial.is_trial_start = false;
                }

                let resolution = self.detect_and_apply(now);
                self.note_resolution(&resolution);
                self.log_sample(frame.timestamp);
                SessionOutput {
                    snapshot: Some(self.snapshot(now)),
                    motion: None,
                }
            }
            PositionAuthority::Frontend => {
                let policy =
                    self.fall_motion(self.subject.trial.is_falling || self.reset_pending.is_some());
                let step = realtime_motion(self.subject.pose.heading, &frame, &self.motion, policy);
                self.subject.pose.heading = step.heading;
                self.subject.velocity = step.velocity;
                self.motion_seq += 1;
                self.log_sample(frame.timestamp);
                SessionOutput {
                    snapshot: None,
                    motion: Some(MotionMessage {
                        seq: self.motion_seq,
                        velocity: step.velocity.into(),
                        delta_theta: step.delta_heading,
                        theta: step.heading,
                        timestamp: frame.timestamp,
                    }),
                }
            }
        }
    }

    fn fall_motion(&self, falling: bool) -> FallMotion {
        if falling {
            FallMotion::Falling {
                freeze_rotation: self.config.freeze_rotation_while_falling,
            }
        } else {
            FallMotion::Grounded
        }
    }

    /// Take a pose reported by the viewer's physics engine.
    ///
    /// After a reset has been sent, updates that still show the old position
    /// are ignored until one arrives back inside the trial area, so a reply
    /// that crossed the reset on the wire cannot end the trial again.
    pub fn process_position_update(&mut self, update: PositionUpdate, now: Instant) -> PositionReply {
        if !self.is_active() || self.authority == PositionAuthority::Backend {
            return PositionReply::Confirm(PositionConfirm::new(update, false));
        }

        let reported = Pose::from(update.position);
        if let Some(sent_at) = self.reset_pending {
            let settled = reported.y.abs() < self.events.trial_end_distance
                && reported.height >= self.events.recovery_threshold;
            let expired = now.saturating_duration_since(sent_at) > self.events.fall_reset_timeout;
            if !settled && !expired {
                debug!("[{}] ignoring stale position {:?}", self.id, update.position);
                return PositionReply::Reset(self.reset_directive());
            }
            self.reset_pending = None;
        }

        // heading stays ours; the viewer only follows it
        self.subject.pose = Pose {
            heading: self.subject.pose.heading,
            ..reported
        };
        if update.position.z.abs() > 0.0 || update.position.x.abs() > 0.0 {
            self.subject.trial.is_trial_start = false;
        }

        let resolution = self.detect_and_apply(now);
        self.note_resolution(&resolution);
        if resolution.reset {
            self.reset_pending = Some(now);
            PositionReply::Reset(self.reset_directive())
        } else {
            // a falling player must not drift on the viewer side
            let locked = self.subject.trial.is_falling;
            PositionReply::Confirm(PositionConfirm::new(update, locked))
        }
    }

    fn detect_and_apply(&mut self, now: Instant) -> Resolution {
        let detection = evaluate(&self.subject.pose, &self.subject.trial, &self.events, now);
        if detection.is_quiet() {
            return Resolution::default();
        }
        apply(
            &mut self.subject,
            detection,
            &mut self.reward,
            &self.pulse,
            self.origin,
            now,
        )
    }

    fn note_resolution(&mut self, resolution: &Resolution) {
        if resolution.reward.as_ref().is_some_and(|r| r.delivered()) {
            self.water_pending = true;
        }
        if resolution.fall == Some(FallEvent::TimedOut) {
            info!("[{}] reset after fall timeout", self.id);
        }
    }

    fn reset_directive(&self) -> ResetDirective {
        ResetDirective {
            action: "set",
            lock_movement: false,
            position: self.origin.into(),
            velocity: Velocity::at_rest().into(),
        }
    }

    fn log_sample(&mut self, timestamp: u64) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        let row = LogRow {
            timestamp,
            pose: self.subject.pose,
            velocity: self.subject.velocity,
            trial_number: self.subject.trial.trial_number,
            num_rewards: self.subject.trial.num_rewards,
            water: self.water_pending,
        };
        match log.record(&row) {
            // a duplicate keeps the water flag for the next real row
            Ok(written) => {
                if written {
                    self.water_pending = false;
                }
            }
            Err(e) => warn!("[{}] failed to write log row: {}", self.id, e),
        }
    }

    /// Render-ready state at `now`.
    pub fn snapshot(&self, now: Instant) -> Snapshot {
        let trial = &self.subject.trial;
        Snapshot {
            experiment_id: self.id.clone(),
            player: PlayerState {
                position: self.subject.pose.into(),
                velocity: self.subject.velocity.into(),
            },
            experiment: ExperimentStatus {
                trial_number: trial.trial_number,
                num_rewards: trial.num_rewards,
                fall_count: trial.fall_count,
                is_active: self.is_active(),
                is_falling: trial.is_falling,
                is_trial_start: trial.is_trial_start,
                is_trial_end: trial.is_trial_end,
                elapsed_time: self.elapsed_secs(now),
            },
            serial_connected: self.serial_connected(),
            state: if self.is_active() { "running" } else { "stopped" },
        }
    }

    fn elapsed_secs(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.started_at).as_secs_f64()
    }

    fn serial_connected(&self) -> bool {
        match &self.source {
            Some(source) => source.is_running(),
            None => self.buffer.is_some(),
        }
    }

    /// End the session and release what it owns.
    ///
    /// Safe to call any number of times; later calls return the first
    /// summary. Each teardown step runs even if an earlier one failed.
    pub fn terminate(&mut self, now: Instant) -> Summary {
        if let Some(summary) = self.summary {
            return summary;
        }
        let summary = Summary::from_trial(&self.subject.trial, self.elapsed_secs(now));
        self.lifecycle = Lifecycle::Terminated;
        self.release();
        info!(
            "[{}] terminated: {} trials, {} rewards, {} falls in {:.1}s",
            self.id,
            summary.trial_number,
            summary.num_rewards,
            summary.fall_count,
            summary.elapsed_time
        );
        self.summary = Some(summary);
        summary
    }

    fn release(&mut self) {
        let mut errors = Vec::new();

        self.feed = None;
        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.stop() {
                errors.push(e);
            }
        }
        self.buffer = None;
        if let Err(e) = self.reward.release() {
            errors.push(e);
        }
        if let Some(log) = self.log.take() {
            if let Err(e) = log.close() {
                errors.push(HardwareError::Io(e));
            }
        }

        for e in errors {
            warn!("[{}] teardown error: {}", self.id, e);
        }
    }
}

impl Drop for Experiment {
    fn drop(&mut self) {
        if self.lifecycle == Lifecycle::Active {
            self.terminate(Instant::now());
        }
    }
}

struct Entry {
    mode: HardwareMode,
    authority: PositionAuthority,
    description: String,
}

/// Maps experiment ids to the kind of session they start.
#[derive(Default)]
pub struct ExperimentRegistry {
    entries: BTreeMap<String, Entry>,
    aliases: HashMap<String, String>,
}

impl ExperimentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The experiments this rig ships with.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(
                "hallway",
                HardwareMode::Managed,
                PositionAuthority::Backend,
                "Straight hallway, host-managed hardware",
            )
            .register(
                "autonomous_hallway",
                HardwareMode::Autonomous,
                PositionAuthority::Backend,
                "Straight hallway, polled, session-owned hardware",
            )
            .register(
                "standalone_hallway",
                HardwareMode::Standalone,
                PositionAuthority::Backend,
                "Straight hallway, event driven, session-owned hardware",
            )
            .register(
                "vue_style_hallway",
                HardwareMode::Standalone,
                PositionAuthority::Frontend,
                "Straight hallway, viewer physics owns position",
            )
            .alias("hallway02", "hallway")
            .alias("hallway_python", "hallway");
        registry
    }

    /// Add an experiment.
    pub fn register(
        &mut self,
        id: &str,
        mode: HardwareMode,
        authority: PositionAuthority,
        description: &str,
    ) -> &mut Self {
        self.entries.insert(
            id.to_owned(),
            Entry {
                mode,
                authority,
                description: description.to_owned(),
            },
        );
        self
    }

    /// Let `alias` stand for `id`.
    pub fn alias(&mut self, alias: &str, id: &str) -> &mut Self {
        self.aliases.insert(alias.to_owned(), id.to_owned());
        self
    }

    /// Turn an id or a script file name into a registered id.
    ///
    /// `experiments/autonomous_hallway_experiment.py` resolves to
    /// `autonomous_hallway`.
    pub fn resolve(&self, name: &str) -> Option<String> {
        let stem = Path::new(name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_owned());
        let stem = stem.strip_suffix("_experiment").unwrap_or(&stem);
        let id = self.aliases.get(stem).map(String::as_str).unwrap_or(stem);
        self.entries.contains_key(id).then(|| id.to_owned())
    }

    /// Build a session for `name` with `config`.
    pub fn create(&self, name: &str, config: ExperimentConfig) -> Result<Experiment, SessionError> {
        let id = self
            .resolve(name)
            .ok_or_else(|| SessionError::UnknownExperiment(name.to_owned()))?;
        let entry = &self.entries[&id];
        let mode = config.hardware_mode.unwrap_or(entry.mode);
        let authority = config.position_authority.unwrap_or(entry.authority);
        Ok(Experiment::new(id, mode, authority, config))
    }

    /// Everything that can be registered.
    pub fn list(&self) -> Vec<ExperimentInfo> {
        self.entries
            .iter()
            .map(|(id, entry)| ExperimentInfo {
                experiment_id: id.clone(),
                hardware_mode: entry.mode,
                description: entry.description.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RewardConfig, SerialConfig};
    use crate::protocol::ViewerPosition;
    use crate::reward::{SimulatedValve, Valve};
    use crate::sensor_frame::SensorFrame;
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };
    use std::time::Duration;

    /// A source that never produces anything and remembers being stopped.
    struct IdleSource {
        buffer: FrameBuffer,
        stopped: Arc<AtomicBool>,
    }

    impl FrameSource for IdleSource {
        fn buffer(&self) -> &FrameBuffer {
            &self.buffer
        }
        fn send_command(&mut self, _command: &str) -> Result<(), HardwareError> {
            Ok(())
        }
        fn stop(&mut self) -> Result<(), HardwareError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn is_running(&self) -> bool {
            !self.stopped.load(Ordering::SeqCst)
        }
        fn describe(&self) -> String {
            "idle".to_owned()
        }
    }

    #[derive(Default)]
    struct TestFactory {
        stopped: Arc<AtomicBool>,
        valve: SimulatedValve,
        broken_valve: bool,
        buffers: Mutex<Vec<FrameBuffer>>,
    }

    impl HardwareFactory for TestFactory {
        fn open_source(
            &self,
            _serial: &SerialConfig,
            buffer: FrameBuffer,
        ) -> Result<Box<dyn FrameSource>, HardwareError> {
            self.buffers.lock().unwrap().push(buffer.clone());
            Ok(Box::new(IdleSource {
                buffer,
                stopped: self.stopped.clone(),
            }))
        }

        fn open_valve(&self, _reward: &RewardConfig) -> Result<Box<dyn Valve>, HardwareError> {
            if self.broken_valve {
                return Err(HardwareError::Valve("device busy".to_owned()));
            }
            Ok(Box::new(self.valve.clone()))
        }
    }

    fn config(overrides: serde_json::Value) -> ExperimentConfig {
        let mut base = ExperimentConfig::default();
        base.log_dir = None;
        base.reward.duration_ms = 0;
        base.overlay(&overrides).unwrap()
    }

    fn frame(seq: u64, timestamp: u64, dy: f64) -> Received {
        Received {
            seq,
            frame: SensorFrame::uniform(timestamp, 0.0, dy),
            at: Instant::now(),
        }
    }

    #[test]
    fn failed_startup_releases_hardware() {
        let factory = TestFactory {
            broken_valve: true,
            ..Default::default()
        };
        let mut exp = Experiment::new(
            "standalone_hallway",
            HardwareMode::Standalone,
            PositionAuthority::Backend,
            config(json!({})),
        );
        let res = exp.initialize(&factory, None, 8, Instant::now());
        assert!(matches!(res, Err(SessionError::Init(HardwareError::Valve(_)))));
        assert!(factory.stopped.load(Ordering::SeqCst));
        assert_eq!(exp.lifecycle(), Lifecycle::Terminated);
    }

    #[test]
    fn unwritable_log_dir_releases_hardware() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let factory = TestFactory::default();
        let mut exp = Experiment::new(
            "autonomous_hallway",
            HardwareMode::Autonomous,
            PositionAuthority::Backend,
            config(json!({ "logDir": blocker.join("logs") })),
        );
        assert!(exp.initialize(&factory, None, 8, Instant::now()).is_err());
        assert!(factory.stopped.load(Ordering::SeqCst));
        // the owned valve was closed
        assert_eq!(factory.valve.history(), vec![0.0]);
    }

    #[test]
    fn polling_only_integrates_new_frames() {
        let factory = TestFactory::default();
        let mut exp = Experiment::new(
            "autonomous_hallway",
            HardwareMode::Autonomous,
            PositionAuthority::Backend,
            config(json!({})),
        );
        let now = Instant::now();
        exp.initialize(&factory, None, 8, now).unwrap();
        assert!(exp.tick(now).is_none());

        let buffer = factory.buffers.lock().unwrap()[0].clone();
        buffer.push(SensorFrame::uniform(50, 0.0, 3.6));
        let first = exp.tick(now).unwrap().snapshot.unwrap();
        assert!((first.player.position.z - 0.13104).abs() < 1e-9);
        // nothing new: no second integration
        assert!(exp.tick(now).is_none());
        assert!((exp.subject().pose.y - 0.13104).abs() < 1e-9);
    }

    #[test]
    fn terminate_is_idempotent() {
        let factory = TestFactory::default();
        let mut exp = Experiment::new(
            "autonomous_hallway",
            HardwareMode::Autonomous,
            PositionAuthority::Backend,
            config(json!({})),
        );
        let t0 = Instant::now();
        exp.initialize(&factory, None, 8, t0).unwrap();
        let first = exp.terminate(t0 + Duration::from_secs(2));
        let second = exp.terminate(t0 + Duration::from_secs(9));
        assert_eq!(first, second);
        assert_eq!(first.elapsed_time, 2.0);
        assert!(factory.stopped.load(Ordering::SeqCst));
        assert!(exp.tick(t0).is_none());
        assert_eq!(exp.snapshot(t0).state, "stopped");
    }

    #[test]
    fn frontend_frames_become_motion() {
        let factory = TestFactory::default();
        let mut exp = Experiment::new(
            "vue_style_hallway",
            HardwareMode::Standalone,
            PositionAuthority::Frontend,
            config(json!({})),
        );
        let now = Instant::now();
        exp.initialize(&factory, None, 8, now).unwrap();

        let out = exp.process_frame(frame(1, 100, 3.6), now);
        assert!(out.snapshot.is_none());
        let motion = out.motion.unwrap();
        assert_eq!(motion.seq, 1);
        assert!((motion.velocity.z - 2.6208).abs() < 1e-9);
        let json = serde_json::to_value(motion).unwrap();
        assert!(json["velocity"]["y"].is_null());

        // a repeated receipt is ignored
        assert_eq!(exp.process_frame(frame(1, 100, 3.6), now), SessionOutput::default());
    }

    #[test]
    fn frontend_fall_rotation_follows_config() {
        let turn_while_falling = |freeze: bool| {
            let factory = TestFactory::default();
            let mut exp = Experiment::new(
                "vue_style_hallway",
                HardwareMode::Standalone,
                PositionAuthority::Frontend,
                config(json!({ "freezeRotationWhileFalling": freeze })),
            );
            let now = Instant::now();
            exp.initialize(&factory, None, 8, now).unwrap();

            let low = PositionUpdate {
                position: ViewerPosition {
                    x: 0.0,
                    y: 0.1,
                    z: 0.0,
                    theta: 0.0,
                },
                seq: None,
            };
            exp.process_position_update(low, now);
            assert!(exp.subject().trial.is_falling);

            let mut yaw = frame(1, 100, 0.0);
            yaw.frame.left.dx = 10.0;
            yaw.frame.right.dx = -10.0;
            let motion = exp.process_frame(yaw, now).motion.unwrap();
            assert_eq!(motion.velocity.x, 0.0);
            assert_eq!(motion.velocity.z, 0.0);
            motion.delta_theta
        };

        assert_eq!(turn_while_falling(true), 0.0);
        assert!(turn_while_falling(false).abs() > 0.0);
    }

    #[test]
    fn stale_updates_after_reset_do_not_double_reward() {
        let factory = TestFactory::default();
        let mut exp = Experiment::new(
            "vue_style_hallway",
            HardwareMode::Standalone,
            PositionAuthority::Frontend,
            config(json!({ "trialEndDistance": 10.0 })),
        );
        let now = Instant::now();
        exp.initialize(&factory, None, 8, now).unwrap();

        let at = |z: f64| PositionUpdate {
            position: ViewerPosition {
                x: 0.0,
                y: 0.5,
                z,
                theta: 0.0,
            },
            seq: None,
        };

        assert!(matches!(
            exp.process_position_update(at(5.0), now),
            PositionReply::Confirm(_)
        ));
        assert!(matches!(
            exp.process_position_update(at(10.5), now),
            PositionReply::Reset(_)
        ));
        // the viewer had not applied the reset yet
        assert!(matches!(
            exp.process_position_update(at(10.6), now),
            PositionReply::Reset(_)
        ));
        assert!(matches!(
            exp.process_position_update(at(0.0), now),
            PositionReply::Confirm(_)
        ));
        assert_eq!(exp.subject().trial.num_rewards, 1);
        assert_eq!(exp.subject().trial.trial_number, 1);
        assert_eq!(factory.valve.history(), vec![5.0, 0.0]);
    }

    #[test]
    fn registry_resolves_names() {
        let registry = ExperimentRegistry::with_builtin();
        assert_eq!(
            registry.resolve("experiments/autonomous_hallway_experiment.py"),
            Some("autonomous_hallway".to_owned())
        );
        assert_eq!(registry.resolve("hallway02"), Some("hallway".to_owned()));
        assert_eq!(registry.resolve("maze_of_doom"), None);

        let exp = registry
            .create("vue_style_hallway", ExperimentConfig::default())
            .unwrap();
        assert_eq!(exp.mode(), HardwareMode::Standalone);
        assert_eq!(exp.authority(), PositionAuthority::Frontend);

        let overridden = registry
            .create(
                "hallway",
                ExperimentConfig {
                    hardware_mode: Some(HardwareMode::Autonomous),
                    ..ExperimentConfig::default()
                },
            )
            .unwrap();
        assert_eq!(overridden.mode(), HardwareMode::Autonomous);
        assert!(matches!(
            registry.create("nope", ExperimentConfig::default()),
            Err(SessionError::UnknownExperiment(_))
        ));
    }
}
