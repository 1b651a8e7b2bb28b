//! Modbus RTU master for half-duplex RS-485 buses
//!
//! Each serial port is a [`Hub`]. A hub owns one [`RtuMaster`] and lets any
//! number of tasks call it concurrently while only one request/response
//! exchange is ever on the wire. Hubs on different ports run in parallel.
//!
//! # Layers
//!
//! - [`codec`] - RTU framing and CRC-16/MODBUS
//! - [`transport`] - serial link, RS-485 direction control, read timeouts
//! - [`master`] - the six supported function codes
//! - [`hub`] / [`registry`] - per-bus serialization and name lookup
//!
//! # Example
//!
//! ```no_run
//! use voltage_rtu::{HubRegistry, RtuConfig};
//!
//! # async fn run(config: RtuConfig) -> voltage_rtu::Result<()> {
//! let registry = HubRegistry::from_config(&config)?;
//! let report = registry.connect_all().await;
//! for (name, err) in report.failures() {
//!     eprintln!("{name}: {err}");
//! }
//!
//! let hub = registry.lookup("default")?;
//! hub.write_register(1, 10, 42).await?;
//! let values = hub.read_holding_registers(1, 0, 4).await?;
//! # let _ = values;
//! registry.close_all().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod hub;
pub mod master;
pub mod registry;
pub mod request;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use codec::FunctionCode;
pub use config::{HubConfig, Parity, RtsConfig, RtsMode, RtuConfig, SerialConfig, DEFAULT_HUB};
pub use error::{exception_description, DecodeError, Result, RtuError, TransportError};
pub use hub::Hub;
pub use master::RtuMaster;
pub use registry::{HubRegistry, StartupReport};
pub use request::{RegisterWrite, Request, Response, BROADCAST, MAX_SLAVE};
pub use transport::{Connection, DirectionPin, PortOpener, SerialLink, SysfsGpioPin, TokioSerialOpener};
