//! Hub definitions and serial line parameters
//!
//! [`HubConfig`] mirrors the host configuration file (one entry per RS-485
//! port); [`SerialConfig`] is the validated, immutable form a hub is built
//! from.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::error::{Result, RtuError};

/// Hub name used when a definition or a call omits one
pub const DEFAULT_HUB: &str = "default";

/// Response timeout when the definition omits one (seconds)
pub const DEFAULT_TIMEOUT_SECS: f64 = 3.0;

/// Longest accepted response timeout
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Above this baud rate the inter-frame gap is fixed instead of 3.5 characters
const FIXED_GAP_BAUD: u32 = 19_200;
const FIXED_INTER_FRAME_GAP: Duration = Duration::from_micros(1_750);

// ============================================================================
// Serde defaults
// ============================================================================

fn default_hub_name() -> String {
    DEFAULT_HUB.to_string()
}

fn default_timeout_secs() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

// ============================================================================
// Line parameters
// ============================================================================

/// Serial parity
///
/// Accepts the single-letter form (`E`, `O`, `N`) as well as the words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl Parity {
    /// Number of parity bits on the wire
    pub fn bits(self) -> u32 {
        match self {
            Parity::None => 0,
            Parity::Even | Parity::Odd => 1,
        }
    }
}

impl TryFrom<String> for Parity {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "n" | "none" => Ok(Parity::None),
            "e" | "even" => Ok(Parity::Even),
            "o" | "odd" => Ok(Parity::Odd),
            other => Err(format!("invalid parity '{other}', expected E, O or N")),
        }
    }
}

impl From<Parity> for String {
    fn from(parity: Parity) -> Self {
        parity.to_string()
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Parity::None => "N",
            Parity::Even => "E",
            Parity::Odd => "O",
        };
        f.write_str(code)
    }
}

/// RS-485 direction control mode
///
/// The letter convention is owned by [`RtsMode::from_code`]; every other part
/// of the crate only sees the polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RtsMode {
    /// Direction line is never touched
    #[default]
    Disabled,
    /// Line is driven high while transmitting
    ActiveHigh,
    /// Line is driven low while transmitting
    ActiveLow,
}

impl RtsMode {
    /// Map a configuration code to a mode
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "n" | "none" | "disabled" => Some(RtsMode::Disabled),
            "u" | "up" | "active_high" => Some(RtsMode::ActiveHigh),
            "d" | "down" | "active_low" => Some(RtsMode::ActiveLow),
            _ => None,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != RtsMode::Disabled
    }

    /// Electrical level of the line for the transmit (`true`) or receive state
    pub fn level(self, transmitting: bool) -> bool {
        match self {
            RtsMode::ActiveLow => !transmitting,
            RtsMode::ActiveHigh | RtsMode::Disabled => transmitting,
        }
    }
}

impl TryFrom<String> for RtsMode {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        RtsMode::from_code(&value)
            .ok_or_else(|| format!("invalid rtsmode '{value}', expected N, U or D"))
    }
}

impl From<RtsMode> for String {
    fn from(mode: RtsMode) -> Self {
        let code = match mode {
            RtsMode::Disabled => "N",
            RtsMode::ActiveHigh => "U",
            RtsMode::ActiveLow => "D",
        };
        code.to_string()
    }
}

/// Direction-control settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtsConfig {
    pub mode: RtsMode,
    /// 0 drives the UART's own RTS signal, any other value a sysfs GPIO
    pub pin: u32,
    /// Hold time before the first and after the last transmitted byte
    pub delay: Duration,
}

/// Validated serial line parameters for one hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    /// Deadline for a complete response
    pub timeout: Duration,
    pub rts: RtsConfig,
}

impl SerialConfig {
    /// 9600 baud, 8N1, no direction control
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
            rts: RtsConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(RtuError::config("Device path cannot be empty"));
        }
        if self.baud_rate == 0 {
            return Err(RtuError::config("Baud rate must be greater than zero"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(RtuError::config(format!(
                "Data bits must be 5, 6, 7 or 8, got {}",
                self.data_bits
            )));
        }
        if ![1, 2].contains(&self.stop_bits) {
            return Err(RtuError::config(format!(
                "Stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if self.timeout.is_zero() {
            return Err(RtuError::config("Timeout must be greater than zero"));
        }
        if self.timeout > MAX_TIMEOUT {
            return Err(RtuError::config(format!(
                "Timeout must not exceed {} seconds",
                MAX_TIMEOUT.as_secs()
            )));
        }
        Ok(())
    }

    /// Start bit + data bits + parity + stop bits
    pub fn bits_per_char(&self) -> u32 {
        1 + u32::from(self.data_bits) + self.parity.bits() + u32::from(self.stop_bits)
    }

    /// Time to shift `bytes` characters onto the wire
    pub fn transmit_time(&self, bytes: usize) -> Duration {
        let bits = bytes as u64 * u64::from(self.bits_per_char());
        Duration::from_micros(bits * 1_000_000 / u64::from(self.baud_rate.max(1)))
    }

    /// Minimum silence between two frames (t3.5)
    pub fn inter_frame_delay(&self) -> Duration {
        if self.baud_rate > FIXED_GAP_BAUD {
            return FIXED_INTER_FRAME_GAP;
        }
        let bits = 35 * u64::from(self.bits_per_char());
        Duration::from_micros(bits * 1_000_000 / (10 * u64::from(self.baud_rate.max(1))))
    }
}

// ============================================================================
// Host configuration
// ============================================================================

/// One hub definition as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_hub_name")]
    pub name: String,
    /// Serial device path, e.g. `/dev/ttyAMA1`
    pub port: String,
    pub baudrate: u32,
    pub bytesize: u8,
    pub parity: Parity,
    pub stopbits: u8,
    /// Response timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout: f64,
    #[serde(default)]
    pub rtsmode: RtsMode,
    #[serde(default)]
    pub rtspin: u32,
    /// Direction-control hold time in microseconds
    #[serde(default)]
    pub rtsdelay: u64,
}

impl HubConfig {
    /// Validate and convert into line parameters
    pub fn serial_config(&self) -> Result<SerialConfig> {
        let timeout = Duration::try_from_secs_f64(self.timeout)
            .ok()
            .filter(|timeout| !timeout.is_zero() && *timeout <= MAX_TIMEOUT)
            .ok_or_else(|| {
                RtuError::config(format!(
                    "Hub '{}': timeout must be between 0 and {} seconds, got {}",
                    self.name,
                    MAX_TIMEOUT.as_secs(),
                    self.timeout
                ))
            })?;

        let config = SerialConfig {
            device: self.port.clone(),
            baud_rate: self.baudrate,
            data_bits: self.bytesize,
            parity: self.parity,
            stop_bits: self.stopbits,
            timeout,
            rts: RtsConfig {
                mode: self.rtsmode,
                pin: self.rtspin,
                delay: Duration::from_micros(self.rtsdelay),
            },
        };
        config
            .validate()
            .map_err(|e| RtuError::config(format!("Hub '{}': {}", self.name, e)))?;
        Ok(config)
    }
}

/// All hub definitions, in configuration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtuConfig {
    #[serde(default)]
    pub hubs: Vec<HubConfig>,
}

impl RtuConfig {
    /// Check every definition; the first problem found is the error
    pub fn validate(&self) -> Result<()> {
        match self.rejected().into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }

    /// Positions of the definitions that cannot become a hub, with the reason
    ///
    /// A name belongs to its first definition, so every later definition
    /// using it is a duplicate even when the first one is itself rejected.
    pub fn rejected(&self) -> Vec<(usize, RtuError)> {
        let mut seen = HashSet::new();
        let mut rejected = Vec::new();
        for (position, hub) in self.hubs.iter().enumerate() {
            if hub.name.trim().is_empty() {
                rejected.push((position, RtuError::config("Hub name cannot be empty")));
                continue;
            }
            if !seen.insert(hub.name.as_str()) {
                rejected.push((
                    position,
                    RtuError::config(format!("Duplicate hub name '{}'", hub.name)),
                ));
                continue;
            }
            if let Err(err) = hub.serial_config() {
                rejected.push((position, err));
            }
        }
        rejected
    }

    /// True when at least one definition can become a hub
    pub fn has_usable_hub(&self) -> bool {
        self.rejected().len() < self.hubs.len()
    }
}
