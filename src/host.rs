//! The session host: owns at most one running experiment, answers viewer
//! requests and fans session output out to every viewer.
//!
//! Which thread drives the session depends on its [HardwareMode]:
//!
//! - managed sessions are fed by the host's permanent pump on the shared
//!   trackball. While no managed session runs, that pump forwards frames raw.
//! - autonomous sessions are polled at `tick_hz`.
//! - standalone sessions get a pump on the feed of their own reader.
//!
//! Every session carries a generation number and its driver checks it before
//! each step, so a driver that outlives its session never touches the next.
//!
//! Viewers can also reopen or close the shared trackball and record its raw
//! frames to a [FrameLog] while the host runs.

use crate::broadcast::{Publisher, ViewerId};
use crate::config::{HardwareMode, ServerConfig};
use crate::data_log::FrameLog;
use crate::error::{HardwareError, SessionError};
use crate::experiment::{Experiment, ExperimentRegistry, SessionOutput};
use crate::frame_source::Received;
use crate::hardware::{HardwareFactory, SharedHardware};
use crate::protocol::{
    Envelope, ErrorReport, ExperimentList, HostStatus, LoggingReport, LoggingRequest, Outbound,
    PositionConfirm, PositionReply, PositionUpdate, RegisterRequest, Registered, SerialData,
    SerialRequest, SerialStatus, Unregistered, WaterReport, WaterRequest,
};
use crate::reward::{Dispenser, RewardError};

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{Receiver, RecvTimeoutError},
        Arc, Mutex, MutexGuard, Weak,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// How long event pumps wait for a frame before checking for shutdown.
const PUMP_POLL: Duration = Duration::from_millis(100);

/// A thread driving a session or the shared trackball.
struct Driver {
    name: &'static str,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Driver {
    fn spawn<F>(name: &'static str, body: F) -> io::Result<Self>
    where
        F: FnOnce(&AtomicBool) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(&flag))?;
        Ok(Driver {
            name,
            stop,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) -> Result<(), HardwareError> {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| HardwareError::ThreadPanicked(self.name)),
            None => Ok(()),
        }
    }
}

/// Run `step` for every frame on `feed` until stopped, the feed closes or
/// `step` asks to quit.
fn pump(feed: Receiver<Received>, stop: &AtomicBool, mut step: impl FnMut(Received) -> bool) {
    while !stop.load(Ordering::SeqCst) {
        match feed.recv_timeout(PUMP_POLL) {
            Ok(received) => {
                if !step(received) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

struct ActiveSession {
    experiment: Experiment,
    driver: Option<Driver>,
    generation: u64,
}

/// Owns the running session and everything viewers talk to.
pub struct Host {
    config: ServerConfig,
    registry: ExperimentRegistry,
    factory: Box<dyn HardwareFactory>,
    shared: SharedHardware,
    publisher: Publisher,
    session: Mutex<Option<ActiveSession>>,
    generation: AtomicU64,
    shared_pump: Mutex<Option<Driver>>,
    frame_log: Mutex<Option<FrameLog>>,
}

impl Host {
    /// Open the shared hardware through `factory` and start the host.
    pub fn start(
        config: ServerConfig,
        factory: Box<dyn HardwareFactory>,
    ) -> Result<Arc<Self>, HardwareError> {
        let shared = SharedHardware::open(factory.as_ref(), &config.serial, &config.reward);
        Self::new(config, ExperimentRegistry::with_builtin(), factory, shared)
    }

    /// Start a host around already opened shared hardware.
    pub fn new(
        config: ServerConfig,
        registry: ExperimentRegistry,
        factory: Box<dyn HardwareFactory>,
        shared: SharedHardware,
    ) -> Result<Arc<Self>, HardwareError> {
        let host = Arc::new(Host {
            publisher: Publisher::new(config.viewer_queue_capacity),
            config,
            registry,
            factory,
            shared,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            shared_pump: Mutex::new(None),
            frame_log: Mutex::new(None),
        });

        let feed = host.shared.buffer.attach_feed(host.config.frame_feed_capacity);
        let weak = Arc::downgrade(&host);
        let driver = Driver::spawn("shared-pump", move |stop| {
            pump(feed, stop, |received| match weak.upgrade() {
                Some(host) => {
                    host.on_shared_frame(received);
                    true
                }
                None => false,
            })
        })?;
        *host
            .shared_pump
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(driver);
        Ok(host)
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Add a viewer; its outbound messages arrive on the receiver.
    pub fn connect(&self) -> (ViewerId, Receiver<Arc<str>>) {
        let (id, rx) = self.publisher.subscribe();
        info!(
            "viewer {} connected ({} total)",
            id,
            self.publisher.viewer_count()
        );
        (id, rx)
    }

    /// Forget a viewer. When the last one leaves, the session ends.
    pub fn disconnect(&self, viewer: ViewerId) {
        self.publisher.unsubscribe(viewer);
        let remaining = self.publisher.viewer_count();
        info!("viewer {} disconnected ({} left)", viewer, remaining);
        if remaining > 0 {
            return;
        }
        let active = self.lock_session().take();
        if let Some(active) = active {
            info!("no viewers left, stopping {}", active.experiment.id());
            self.finish(active);
        }
    }

    /// Queue a reply for one viewer.
    pub fn reply(&self, viewer: ViewerId, text: String) -> bool {
        self.publisher.send_to(viewer, text)
    }

    #[allow(missing_docs)]
    pub fn viewer_count(&self) -> usize {
        self.publisher.viewer_count()
    }

    /// Id of the running session, if any.
    pub fn active_experiment(&self) -> Option<String> {
        self.lock_session()
            .as_ref()
            .map(|active| active.experiment.id().to_owned())
    }

    /// Answer one inbound JSON message. Never fails; problems become error
    /// replies.
    pub fn handle_message(self: &Arc<Self>, text: &str) -> String {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("rejecting malformed message: {}", e);
                return Outbound::error("INVALID_JSON", format!("invalid JSON: {}", e))
                    .to_json(None);
            }
        };
        self.dispatch(&envelope)
            .to_json(envelope.request_id.as_deref())
    }

    fn dispatch(self: &Arc<Self>, envelope: &Envelope) -> Outbound {
        match envelope.kind.as_str() {
            "ping" => Outbound::Pong(envelope.data.clone()),
            "experiment_register" => {
                match payload::<RegisterRequest>(&envelope.data).and_then(|r| self.register(r)) {
                    Ok(registered) => Outbound::ExperimentRegistered(registered),
                    Err(e) => experiment_error(e),
                }
            }
            "experiment_unregister" => match self.unregister() {
                Ok(unregistered) => Outbound::ExperimentUnregistered(unregistered),
                Err(e) => experiment_error(e),
            },
            "experiment_list" => Outbound::ExperimentList(ExperimentList {
                experiments: self.registry.list(),
                active_experiment: self.active_experiment(),
            }),
            "position_update" => match payload::<PositionUpdate>(&envelope.data) {
                Ok(update) => Outbound::PositionConfirm(self.position_update(update)),
                Err(e) => Outbound::error(e.code(), e.to_string()),
            },
            "status_request" => Outbound::StatusResponse(self.status()),
            "water_deliver" => match payload::<WaterRequest>(&envelope.data) {
                Ok(request) => Outbound::WaterDelivered(self.deliver_water(request)),
                Err(e) => Outbound::error(e.code(), e.to_string()),
            },
            "serial_init" => match payload::<SerialRequest>(&envelope.data) {
                Ok(request) => match self.open_serial(request) {
                    Ok(status) => Outbound::SerialInitialized(status),
                    Err(e) => Outbound::error("SERIAL_INIT_FAILED", e.to_string()),
                },
                Err(e) => Outbound::error(e.code(), e.to_string()),
            },
            "serial_close" => match self.close_serial() {
                Ok(status) => Outbound::SerialClosed(status),
                Err(e) => Outbound::error("SERIAL_CLOSE_FAILED", e.to_string()),
            },
            "logging_start" => match payload::<LoggingRequest>(&envelope.data) {
                Ok(request) => match self.start_logging(request) {
                    Ok(report) => Outbound::LoggingStarted(report),
                    Err(e) => Outbound::error("LOGGING_FAILED", e.to_string()),
                },
                Err(e) => Outbound::error(e.code(), e.to_string()),
            },
            "logging_stop" => match self.stop_logging() {
                Some(Ok(report)) => Outbound::LoggingStopped(report),
                Some(Err(e)) => Outbound::error("LOGGING_FAILED", e.to_string()),
                None => Outbound::error("LOGGER_INACTIVE", "no frame log is open"),
            },
            other => {
                warn!("unknown message type {:?}", other);
                Outbound::error(
                    "UNKNOWN_MESSAGE_TYPE",
                    format!("unknown message type {}", other),
                )
            }
        }
    }

    /// Start a session. Fails if one is already running; the running one is
    /// left untouched.
    pub fn register(self: &Arc<Self>, request: RegisterRequest) -> Result<Registered, SessionError> {
        let name = request
            .experiment_id
            .or(request.filename)
            .ok_or(SessionError::MissingExperimentId)?;

        let mut session = self.lock_session();
        if let Some(active) = session.as_ref() {
            warn!(
                "refusing to register {}: {} is still active",
                name,
                active.experiment.id()
            );
            return Err(SessionError::AlreadyActive {
                active: active.experiment.id().to_owned(),
            });
        }

        let config = if request.config.is_null() {
            self.config.defaults.clone()
        } else {
            self.config.defaults.overlay(&request.config)?
        };
        let mut experiment = self.registry.create(&name, config)?;
        let now = Instant::now();
        let snapshot = experiment.initialize(
            self.factory.as_ref(),
            Some(&self.shared),
            self.config.frame_feed_capacity,
            now,
        )?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let driver = match self.spawn_driver(&mut experiment, generation) {
            Ok(driver) => driver,
            Err(e) => {
                experiment.terminate(now);
                return Err(SessionError::Init(HardwareError::Io(e)));
            }
        };

        let registered = Registered {
            experiment_id: experiment.id().to_owned(),
            hardware_mode: experiment.mode(),
            state: snapshot.clone(),
        };
        info!(
            "registered {} (generation {})",
            registered.experiment_id, generation
        );
        *session = Some(ActiveSession {
            experiment,
            driver,
            generation,
        });
        drop(session);

        self.publisher.publish(&Outbound::ExperimentState(snapshot));
        Ok(registered)
    }

    fn spawn_driver(
        self: &Arc<Self>,
        experiment: &mut Experiment,
        generation: u64,
    ) -> io::Result<Option<Driver>> {
        let weak = Arc::downgrade(self);
        match experiment.mode() {
            HardwareMode::Managed => Ok(None),
            HardwareMode::Autonomous => {
                let period = self.config.tick_period();
                Driver::spawn("session-poll", move |stop| poll(weak, generation, period, stop))
                    .map(Some)
            }
            HardwareMode::Standalone => {
                let Some(feed) = experiment.take_feed() else {
                    warn!("[{}] standalone session has no feed", experiment.id());
                    return Ok(None);
                };
                Driver::spawn("session-pump", move |stop| {
                    pump(feed, stop, |received| match weak.upgrade() {
                        Some(host) => host.step_session(generation, |exp, now| {
                            Some(exp.process_frame(received, now))
                        }),
                        None => false,
                    })
                })
                .map(Some)
            }
        }
    }

    /// Run `step` on the session if it is still generation `generation`.
    /// Returns false once that session is gone.
    fn step_session(
        &self,
        generation: u64,
        step: impl FnOnce(&mut Experiment, Instant) -> Option<SessionOutput>,
    ) -> bool {
        let mut session = self.lock_session();
        let Some(active) = session.as_mut().filter(|a| a.generation == generation) else {
            return false;
        };
        let output = step(&mut active.experiment, Instant::now());
        drop(session);
        if let Some(output) = output {
            self.publish_output(output);
        }
        true
    }

    fn on_shared_frame(&self, received: Received) {
        self.log_frame(&received);
        let mut session = self.lock_session();
        match session.as_mut() {
            Some(active) if active.experiment.mode() == HardwareMode::Managed => {
                let output = active.experiment.process_frame(received, Instant::now());
                drop(session);
                self.publish_output(output);
            }
            // the running session reads its own hardware
            Some(_) => {}
            None => {
                drop(session);
                self.publisher
                    .publish(&Outbound::SerialData(SerialData::Raw(received.frame)));
            }
        }
    }

    fn lock_frame_log(&self) -> MutexGuard<'_, Option<FrameLog>> {
        self.frame_log.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log_frame(&self, received: &Received) {
        let mut log = self.lock_frame_log();
        let Some(open) = log.as_mut() else {
            return;
        };
        if let Err(e) = open.record(&received.frame) {
            warn!("frame log {} failed, closing it: {}", open.path().display(), e);
            *log = None;
        }
    }

    /// Replace the shared trackball with the one `request` describes.
    ///
    /// The old reader is stopped first so the same device can be reopened.
    /// Frames keep flowing into the same buffer, so a managed session
    /// continues on the new reader.
    pub fn open_serial(&self, request: SerialRequest) -> Result<SerialStatus, HardwareError> {
        let mut serial = self.config.serial.clone();
        if let Some(port) = request.port {
            serial.port = port;
        }
        if let Some(baud_rate) = request.baud_rate {
            serial.baud_rate = baud_rate;
        }

        let mut slot = self.shared.source.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut old) = slot.take() {
            info!("closing shared frame source {}", old.describe());
            if let Err(e) = old.stop() {
                warn!("error stopping shared frame source: {}", e);
            }
        }
        let source = self
            .factory
            .open_source(&serial, self.shared.buffer.clone())?;
        let port = source.describe();
        info!("shared frame source: {}", port);
        *slot = Some(source);
        Ok(SerialStatus {
            port,
            status: "open",
        })
    }

    /// Stop the shared trackball. Closing with nothing open is not an error.
    pub fn close_serial(&self) -> Result<SerialStatus, HardwareError> {
        let source = self
            .shared
            .source
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let port = match source {
            Some(mut source) => {
                let port = source.describe();
                source.stop()?;
                info!("closed shared frame source {}", port);
                port
            }
            None => String::new(),
        };
        Ok(SerialStatus {
            port,
            status: "closed",
        })
    }

    /// Start writing shared trackball frames to a new file in the log
    /// directory. A log that is already open is closed first.
    pub fn start_logging(&self, request: LoggingRequest) -> io::Result<LoggingReport> {
        let dir = self
            .config
            .defaults
            .log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("data"));
        let log = match request.filename {
            Some(name) => {
                // only a name, never a path out of the log directory
                let name = Path::new(&name).file_name().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{:?} is not a file name", name),
                    )
                })?;
                fs::create_dir_all(&dir)?;
                FrameLog::create_at(dir.join(name))?
            }
            None => FrameLog::create(&dir)?,
        };
        let report = LoggingReport {
            path: log.path().display().to_string(),
            rows: 0,
        };

        let previous = self.lock_frame_log().replace(log);
        if let Some(previous) = previous {
            previous.close()?;
        }
        Ok(report)
    }

    /// Close the frame log, or `None` when none is open.
    pub fn stop_logging(&self) -> Option<io::Result<LoggingReport>> {
        let log = self.lock_frame_log().take()?;
        let rows = log.rows();
        Some(log.close().map(|path| LoggingReport {
            path: path.display().to_string(),
            rows,
        }))
    }

    fn publish_output(&self, output: SessionOutput) {
        if let Some(snapshot) = output.snapshot {
            self.publisher.publish(&Outbound::ExperimentState(snapshot));
        }
        if let Some(motion) = output.motion {
            self.publisher
                .publish(&Outbound::SerialData(SerialData::Motion(motion)));
        }
    }

    /// Stop the running session and report how it went.
    pub fn unregister(&self) -> Result<Unregistered, SessionError> {
        let active = self
            .lock_session()
            .take()
            .ok_or(SessionError::NoActiveSession)?;
        Ok(self.finish(active))
    }

    /// The session is already out of the slot, so drivers that are waiting
    /// on the lock find nothing and exit.
    fn finish(&self, mut active: ActiveSession) -> Unregistered {
        if let Some(mut driver) = active.driver.take() {
            if let Err(e) = driver.stop() {
                warn!("[{}] driver: {}", active.experiment.id(), e);
            }
        }
        let summary = active.experiment.terminate(Instant::now());
        let unregistered = Unregistered {
            experiment_id: active.experiment.id().to_owned(),
            summary,
        };
        self.publisher
            .publish(&Outbound::ExperimentUnregistered(unregistered.clone()));
        unregistered
    }

    fn position_update(&self, update: PositionUpdate) -> PositionReply {
        let now = Instant::now();
        let mut session = self.lock_session();
        let Some(active) = session.as_mut() else {
            return PositionReply::Confirm(PositionConfirm::new(update, false));
        };
        let reply = active.experiment.process_position_update(update, now);
        if matches!(reply, PositionReply::Reset(_)) {
            let snapshot = active.experiment.snapshot(now);
            drop(session);
            self.publisher.publish(&Outbound::ExperimentState(snapshot));
        }
        reply
    }

    /// Counters for `status_request`.
    pub fn status(&self) -> HostStatus {
        let now = Instant::now();
        let stats = self.shared.buffer.stats();
        let session = self.lock_session();
        let state = session.as_ref().map(|a| a.experiment.snapshot(now));
        HostStatus {
            active_experiment: session.as_ref().map(|a| a.experiment.id().to_owned()),
            serial_connected: state
                .as_ref()
                .map(|s| s.serial_connected)
                .unwrap_or_else(|| self.shared.source_connected()),
            viewers: self.publisher.viewer_count(),
            data_rate: stats.data_rate,
            frames_dropped: stats.dropped,
            state,
        }
    }

    /// Manual reward through the shared valve.
    pub fn deliver_water(&self, request: WaterRequest) -> WaterReport {
        let Some(reward) = &self.shared.reward else {
            return WaterReport {
                success: false,
                message: RewardError::Inactive.to_string(),
                count: 0,
                remaining_ms: None,
            };
        };
        let defaults = self.config.reward.pulse();
        let amplitude = request.amplitude.unwrap_or(defaults.amplitude);
        let duration = request
            .duration_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.duration);

        let mut delivery = reward.lock().unwrap_or_else(|e| e.into_inner());
        match delivery.pulse(amplitude, duration, Instant::now()) {
            Ok(done) => WaterReport {
                success: true,
                message: format!(
                    "delivered {:.1} V for {} ms",
                    done.amplitude,
                    done.duration.as_millis()
                ),
                count: done.count,
                remaining_ms: None,
            },
            Err(e) => {
                warn!("manual reward failed: {}", e);
                let remaining_ms = match &e {
                    RewardError::Cooldown { remaining } => Some(remaining.as_millis() as u64),
                    _ => None,
                };
                WaterReport {
                    success: false,
                    message: e.to_string(),
                    count: delivery.deliveries(),
                    remaining_ms,
                }
            }
        }
    }

    /// End the session, stop the shared pump and release shared hardware.
    pub fn shutdown(&self) {
        if let Ok(unregistered) = self.unregister() {
            info!("stopped {} on shutdown", unregistered.experiment_id);
        }
        let pump = self
            .shared_pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut pump) = pump {
            if let Err(e) = pump.stop() {
                warn!("shared pump: {}", e);
            }
        }
        if let Some(Err(e)) = self.stop_logging() {
            warn!("frame log: {}", e);
        }
        self.shared.shutdown();
    }
}

fn poll(host: Weak<Host>, generation: u64, period: Duration, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        let started = Instant::now();
        let Some(strong) = host.upgrade() else {
            break;
        };
        if !strong.step_session(generation, |exp, now| exp.tick(now)) {
            break;
        }
        drop(strong);
        if let Some(rest) = period.checked_sub(started.elapsed()) {
            spin_sleep::sleep(rest);
        }
    }
}

fn payload<T: DeserializeOwned + Default>(data: &Value) -> Result<T, SessionError> {
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data.clone()).map_err(|e| SessionError::Protocol(e.to_string()))
}

fn experiment_error(error: SessionError) -> Outbound {
    let active_experiment = match &error {
        SessionError::AlreadyActive { active } => Some(active.clone()),
        _ => None,
    };
    Outbound::ExperimentError(ErrorReport {
        error: error.to_string(),
        code: error.code(),
        active_experiment,
    })
}
