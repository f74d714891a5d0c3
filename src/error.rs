//! Errors shared between the hardware layer and the session host.

use crate::config::ConfigError;
use std::{borrow::Cow, fmt, io};

/// Something went wrong talking to the rig.
#[derive(Debug)]
pub enum HardwareError {
    /// The serial device could not be opened or configured.
    PortUnavailable {
        #[allow(missing_docs)]
        port: String,
        #[allow(missing_docs)]
        source: io::Error,
    },

    /// A read or write on an open device failed.
    Io(io::Error),

    /// The reward valve refused a command.
    Valve(String),

    /// A background reader thread panicked before it could be joined.
    ThreadPanicked(&'static str),
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use HardwareError as HE;
        let msg = match self {
            HE::PortUnavailable { port, source } => {
                Cow::from(format!("could not open serial port {}: {}", port, source))
            }
            HE::Io(error) => Cow::from(format!("io error: {}", error)),
            HE::Valve(reason) => Cow::from(format!("valve error: {}", reason)),
            HE::ThreadPanicked(name) => Cow::from(format!("{} thread panicked", name)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for HardwareError {}

impl From<io::Error> for HardwareError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Why the host refused or failed a request.
#[derive(Debug)]
pub enum SessionError {
    /// A session is already running; carries its id.
    AlreadyActive {
        #[allow(missing_docs)]
        active: String,
    },

    /// Nothing in the registry answers to this id.
    UnknownExperiment(String),

    /// Registration named neither an experiment id nor a file.
    MissingExperimentId,

    /// The request needs a running session and there is none.
    NoActiveSession,

    /// Startup failed; hardware has already been released.
    Init(HardwareError),

    /// The supplied configuration was rejected.
    Config(ConfigError),

    /// The message could not be understood.
    Protocol(String),
}

impl SessionError {
    /// Stable machine readable code sent to viewers.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::AlreadyActive { .. } => "EXPERIMENT_ALREADY_ACTIVE",
            SessionError::UnknownExperiment(_) => "UNKNOWN_EXPERIMENT",
            SessionError::MissingExperimentId => "MISSING_EXPERIMENT_ID",
            SessionError::NoActiveSession => "NO_ACTIVE_EXPERIMENT",
            SessionError::Init(_) => "INITIALIZATION_FAILED",
            SessionError::Config(_) => "INVALID_CONFIG",
            SessionError::Protocol(_) => "INVALID_MESSAGE",
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use SessionError as SE;
        let msg = match self {
            SE::AlreadyActive { active } => Cow::from(format!(
                "experiment {} is already active, unregister it first",
                active
            )),
            SE::UnknownExperiment(id) => Cow::from(format!("unknown experiment {}", id)),
            SE::MissingExperimentId => Cow::from("no experimentId or filename given"),
            SE::NoActiveSession => Cow::from("no active experiment"),
            SE::Init(error) => Cow::from(format!("failed to initialize experiment: {}", error)),
            SE::Config(error) => Cow::from(format!("invalid config: {}", error)),
            SE::Protocol(reason) => Cow::from(format!("bad message: {}", reason)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for SessionError {}

impl From<HardwareError> for SessionError {
    fn from(value: HardwareError) -> Self {
        Self::Init(value)
    }
}

impl From<ConfigError> for SessionError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}
