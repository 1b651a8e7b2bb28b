//! rtusrv - Modbus RTU service
//!
//! Owns the RS-485 hubs declared in its configuration and exposes them as
//! `write_register`, `write_coil` and read service calls.

pub mod calls;
pub mod config;
pub mod error;
pub mod logging;
pub mod service;
pub mod shutdown;

pub use calls::{CallReply, RegisterValue, ServiceCall};
pub use config::{LogSettings, ServiceConfig};
pub use error::{Result, RtuSrvError};
pub use service::{Lifecycle, Service};
