//! rtusrv error types

use thiserror::Error;
use voltage_rtu::RtuError;

pub type Result<T> = std::result::Result<T, RtuSrvError>;

#[derive(Debug, Error)]
pub enum RtuSrvError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed service call (bad JSON, unknown service, out-of-range field)
    #[error("Invalid call: {0}")]
    InvalidCall(String),

    #[error("Service not running")]
    NotRunning,

    #[error("Service already stopped")]
    Stopped,

    #[error(transparent)]
    Rtu(#[from] RtuError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RtuSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        RtuSrvError::Config(msg.into())
    }

    pub fn invalid_call(msg: impl Into<String>) -> Self {
        RtuSrvError::InvalidCall(msg.into())
    }

    /// Stable machine-readable category, used in call replies
    pub fn kind(&self) -> &'static str {
        match self {
            RtuSrvError::Config(_) => "config",
            RtuSrvError::InvalidCall(_) => "invalid_argument",
            RtuSrvError::NotRunning | RtuSrvError::Stopped => "not_running",
            RtuSrvError::Io(_) => "io",
            RtuSrvError::Rtu(e) => match e {
                RtuError::Config(_) => "config",
                RtuError::InvalidArgument(_) => "invalid_argument",
                RtuError::Transport(_) => "transport",
                RtuError::Framing(_) => "framing",
                RtuError::Checksum { .. } => "checksum",
                RtuError::Exception { .. } => "exception",
                RtuError::NotConnected(_) => "not_connected",
                RtuError::Closed(_) => "closed",
                RtuError::UnknownHub(_) => "unknown_hub",
                RtuError::Internal(_) => "internal",
            },
        }
    }
}

impl From<figment::Error> for RtuSrvError {
    fn from(err: figment::Error) -> Self {
        RtuSrvError::Config(err.to_string())
    }
}
