//! Serial transport with RS-485 direction control
//!
//! A [`Connection`] owns one open serial link and performs the
//! write-then-read cycle of a single Modbus exchange. It does no locking of
//! its own; the hub above it guarantees exclusive use.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

use crate::codec::{self, EXCEPTION_FRAME_LEN};
use crate::config::{Parity, SerialConfig, MAX_TIMEOUT};
use crate::error::TransportError;

const GPIO_BASE_PATH: &str = "/sys/class/gpio";

// ============================================================================
// Link and direction-pin abstractions
// ============================================================================

/// Byte stream to the bus plus the modem-control operations the master needs
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {
    /// Set the UART's RTS output (`true` = asserted)
    fn set_rts(&mut self, level: bool) -> Result<(), TransportError>;

    /// Discard anything sitting in the receive buffer
    fn clear_input(&mut self) -> Result<(), TransportError>;
}

impl SerialLink for SerialStream {
    fn set_rts(&mut self, level: bool) -> Result<(), TransportError> {
        self.write_request_to_send(level)
            .map_err(|e| TransportError::Io(format!("Failed to set RTS: {e}")))
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.clear(ClearBuffer::Input)
            .map_err(|e| TransportError::Io(format!("Failed to clear input: {e}")))
    }
}

/// External output that switches the transceiver between transmit and receive
pub trait DirectionPin: Send {
    fn set_level(&mut self, high: bool) -> Result<(), TransportError>;
}

/// Linux sysfs GPIO used as the DE/RE line
pub struct SysfsGpioPin {
    number: u32,
    value_path: String,
}

impl SysfsGpioPin {
    /// Export `number` under `base_path` and configure it as an output
    pub fn open(base_path: &str, number: u32) -> Result<Self, TransportError> {
        let gpio_path = format!("{base_path}/gpio{number}");

        if !Path::new(&gpio_path).exists() {
            let export_path = format!("{base_path}/export");
            if let Err(e) = std::fs::write(&export_path, number.to_string()) {
                if !already_exported(&e) {
                    return Err(TransportError::Open {
                        device: gpio_path,
                        reason: format!("export failed: {e}"),
                    });
                }
            }
        }

        let direction_path = format!("{gpio_path}/direction");
        std::fs::write(&direction_path, "out").map_err(|e| TransportError::Open {
            device: gpio_path.clone(),
            reason: format!("cannot set direction: {e}"),
        })?;

        debug!("GPIO {} ready as direction pin", number);
        Ok(Self {
            number,
            value_path: format!("{gpio_path}/value"),
        })
    }
}

/// The kernel answers EBUSY when the pin is already exported
fn already_exported(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::ResourceBusy
}

impl DirectionPin for SysfsGpioPin {
    fn set_level(&mut self, high: bool) -> Result<(), TransportError> {
        let content = if high { "1" } else { "0" };
        std::fs::write(&self.value_path, content).map_err(|e| {
            warn!("Failed to write GPIO {}: {}", self.number, e);
            TransportError::Io(format!("GPIO {} write failed: {e}", self.number))
        })
    }
}

/// Opens links and direction pins for a hub
///
/// The default pin implementation is the sysfs GPIO driver.
pub trait PortOpener: Send + Sync {
    fn open_link(&self, config: &SerialConfig) -> Result<Box<dyn SerialLink>, TransportError>;

    fn open_direction_pin(&self, pin: u32) -> Result<Box<dyn DirectionPin>, TransportError> {
        let pin = SysfsGpioPin::open(GPIO_BASE_PATH, pin)?;
        Ok(Box::new(pin))
    }
}

/// Opens real serial ports through tokio-serial
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSerialOpener;

impl PortOpener for TokioSerialOpener {
    fn open_link(&self, config: &SerialConfig) -> Result<Box<dyn SerialLink>, TransportError> {
        let parity = match config.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        };

        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let stop_bits = match config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        match tokio_serial::new(&config.device, config.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(config.timeout)
            .open_native_async()
        {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) => Err(TransportError::Open {
                device: config.device.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One open serial connection
pub struct Connection {
    link: Box<dyn SerialLink>,
    pin: Option<Box<dyn DirectionPin>>,
    config: SerialConfig,
    /// End of the last frame seen on the bus, for inter-frame silence
    last_activity: Option<Instant>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device", &self.config.device)
            .field("baud_rate", &self.config.baud_rate)
            .field("rts", &self.config.rts)
            .finish()
    }
}

impl Connection {
    /// Open the link and put the transceiver in receive mode
    pub fn open(config: &SerialConfig, opener: &dyn PortOpener) -> Result<Self, TransportError> {
        debug!("RTU: {} @{}baud", config.device, config.baud_rate);

        let link = opener.open_link(config).map_err(|e| {
            error!("RTU err: {} - {}", config.device, e);
            e
        })?;

        let pin = if config.rts.mode.is_enabled() && config.rts.pin > 0 {
            Some(opener.open_direction_pin(config.rts.pin).map_err(|e| {
                error!("RTU direction pin {} err: {}", config.rts.pin, e);
                e
            })?)
        } else {
            None
        };

        let mut connection = Self {
            link,
            pin,
            config: config.clone(),
            last_activity: None,
        };
        connection.set_transmit(false)?;

        info!(
            "RTU opened: {} ({}{}{}, rts={:?})",
            config.device, config.data_bits, config.parity, config.stop_bits, config.rts.mode
        );
        Ok(connection)
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Transmit `frame` and collect a response of `expected_len` bytes
    pub async fn exchange(
        &mut self,
        frame: &[u8],
        expected_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        self.send(frame).await?;
        self.receive(expected_len, self.config.timeout).await
    }

    /// Transmit one frame inside the direction-control window
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if let Some(last) = self.last_activity {
            sleep_until(last + self.config.inter_frame_delay()).await;
        }

        if let Err(e) = self.link.clear_input() {
            warn!("RTU clear input: {}", e);
        }

        let rts = self.config.rts;
        self.set_transmit(true)?;
        if rts.mode.is_enabled() {
            sleep_nonzero(rts.delay).await;
        }

        let written = self.write_frame(frame).await;

        // write_all returns once the driver has the bytes, not when they left the UART
        if written.is_ok() && rts.mode.is_enabled() {
            sleep_nonzero(self.config.transmit_time(frame.len()) + rts.delay).await;
        }

        let released = self.set_transmit(false);
        self.last_activity = Some(Instant::now());

        written?;
        released?;
        debug!("RTU TX: {}", hex::encode(frame));
        Ok(())
    }

    /// Read until `expected_len` bytes (or a complete exception frame) arrive
    ///
    /// `timeout` is capped at [`MAX_TIMEOUT`].
    pub async fn receive(
        &mut self,
        expected_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout.min(MAX_TIMEOUT);
        let mut buffer = vec![0u8; expected_len.max(EXCEPTION_FRAME_LEN)];
        let mut received = 0;

        loop {
            let target = codec::target_len(&buffer[..received], expected_len);
            if received >= target {
                break;
            }

            match timeout_at(deadline, self.link.read(&mut buffer[received..target])).await {
                Ok(Ok(0)) => {
                    error!("RTU closed");
                    return Err(TransportError::Io("Serial connection closed".to_string()));
                },
                Ok(Ok(bytes)) => received += bytes,
                Ok(Err(e)) => {
                    error!("RTU RX: {}", e);
                    return Err(e.into());
                },
                Err(_) => {
                    self.last_activity = Some(Instant::now());
                    if received == 0 {
                        debug!("RTU no response from {}", self.config.device);
                        return Err(TransportError::NoResponse);
                    }
                    debug!("RTU partial: {}B: {}", received, hex::encode(&buffer[..received]));
                    return Err(TransportError::Timeout {
                        received,
                        expected: target,
                    });
                },
            }
        }

        buffer.truncate(received);
        self.last_activity = Some(Instant::now());
        debug!("RTU RX: {}", hex::encode(&buffer));
        Ok(buffer)
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.link.write_all(frame).await.map_err(|e| {
            error!("RTU TX: {}", e);
            TransportError::Io(format!("Serial send error: {e}"))
        })?;
        self.link.flush().await.map_err(|e| {
            error!("RTU flush: {}", e);
            TransportError::Io(format!("Serial flush error: {e}"))
        })
    }

    fn set_transmit(&mut self, transmitting: bool) -> Result<(), TransportError> {
        let mode = self.config.rts.mode;
        if !mode.is_enabled() {
            return Ok(());
        }
        let level = mode.level(transmitting);
        match self.pin.as_mut() {
            Some(pin) => pin.set_level(level),
            None => self.link.set_rts(level),
        }
    }
}

async fn sleep_nonzero(duration: Duration) {
    if !duration.is_zero() {
        sleep(duration).await;
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::{RtsConfig, RtsMode};
    use crate::testing::{LinkEvent, MockBus, Reply};

    fn config(rts: RtsConfig) -> SerialConfig {
        SerialConfig {
            timeout: Duration::from_millis(200),
            rts,
            ..SerialConfig::new("/dev/ttyMOCK0")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_full_response() {
        let bus = MockBus::new();
        bus.push_reply(Reply::Frame(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        let mut conn = Connection::open(&config(RtsConfig::default()), &bus.opener()).unwrap();

        let response = conn.exchange(&[0x01, 0x03, 0, 0, 0, 1, 0x84, 0x0A], 8).await.unwrap();
        assert_eq!(response, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bus.writes(), vec![vec![0x01, 0x03, 0, 0, 0, 1, 0x84, 0x0A]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_no_response() {
        let bus = MockBus::new();
        bus.push_reply(Reply::Silence);
        let mut conn = Connection::open(&config(RtsConfig::default()), &bus.opener()).unwrap();

        let start = Instant::now();
        let err = conn.exchange(&[0x01, 0x03], 7).await.unwrap_err();
        assert_eq!(err, TransportError::NoResponse);
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_timeout_is_capped() {
        let bus = MockBus::new();
        bus.push_reply(Reply::Silence);
        let mut conn = Connection::open(&config(RtsConfig::default()), &bus.opener()).unwrap();
        conn.send(&[0x01, 0x03]).await.unwrap();

        let start = Instant::now();
        let err = conn.receive(7, Duration::MAX).await.unwrap_err();
        assert_eq!(err, TransportError::NoResponse);
        assert!(start.elapsed() >= MAX_TIMEOUT);
        assert!(start.elapsed() < MAX_TIMEOUT + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_response_is_timeout() {
        let bus = MockBus::new();
        bus.push_reply(Reply::Frame(vec![0x01, 0x03, 0x02]));
        let mut conn = Connection::open(&config(RtsConfig::default()), &bus.opener()).unwrap();

        let err = conn.exchange(&[0x01, 0x03], 7).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Timeout {
                received: 3,
                expected: 7
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_frame_completes_early() {
        let bus = MockBus::new();
        bus.push_reply(Reply::Frame(vec![0x01, 0x83, 0x02, 0xC0, 0xF1]));
        let mut conn = Connection::open(&config(RtsConfig::default()), &bus.opener()).unwrap();

        let start = Instant::now();
        let response = conn.exchange(&[0x01, 0x03], 255).await.unwrap();
        assert_eq!(response.len(), EXCEPTION_FRAME_LEN);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_link_is_io_error() {
        let bus = MockBus::new();
        bus.push_reply(Reply::Closed);
        let mut conn = Connection::open(&config(RtsConfig::default()), &bus.opener()).unwrap();

        let err = conn.exchange(&[0x01, 0x03], 7).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_rts_never_touched() {
        let bus = MockBus::new();
        bus.push_reply(Reply::Frame(vec![0; 8]));
        let mut conn = Connection::open(&config(RtsConfig::default()), &bus.opener()).unwrap();
        conn.exchange(&[0; 8], 8).await.unwrap();

        assert!(bus
            .events()
            .iter()
            .all(|e| !matches!(e, LinkEvent::Rts(_) | LinkEvent::Pin(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_low_uses_inverted_rts() {
        let bus = MockBus::new();
        bus.push_reply(Reply::Frame(vec![0; 8]));
        let rts = RtsConfig {
            mode: RtsMode::ActiveLow,
            pin: 0,
            delay: Duration::ZERO,
        };
        let mut conn = Connection::open(&config(rts), &bus.opener()).unwrap();
        conn.exchange(&[0; 8], 8).await.unwrap();

        let levels: Vec<bool> = bus
            .events()
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Rts(level) => Some(*level),
                _ => None,
            })
            .collect();
        // receive on open, transmit, receive
        assert_eq!(levels, vec![true, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gpio_pin_replaces_uart_rts() {
        let bus = MockBus::new();
        bus.push_reply(Reply::Frame(vec![0; 8]));
        let rts = RtsConfig {
            mode: RtsMode::ActiveHigh,
            pin: 17,
            delay: Duration::from_micros(500),
        };
        let mut conn = Connection::open(&config(rts), &bus.opener()).unwrap();
        conn.exchange(&[0; 8], 8).await.unwrap();

        let events = bus.events();
        assert!(events.iter().all(|e| !matches!(e, LinkEvent::Rts(_))));
        assert_eq!(bus.opened_pins(), vec![17]);
        let pins: Vec<&LinkEvent> = events
            .iter()
            .filter(|e| matches!(e, LinkEvent::Pin(_)))
            .collect();
        assert_eq!(
            pins,
            vec![
                &LinkEvent::Pin(false),
                &LinkEvent::Pin(true),
                &LinkEvent::Pin(false)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_inter_frame_silence() {
        let bus = MockBus::new();
        bus.push_reply(Reply::Frame(vec![0; 8]));
        bus.push_reply(Reply::Frame(vec![0; 8]));
        let mut conn = Connection::open(&config(RtsConfig::default()), &bus.opener()).unwrap();

        conn.exchange(&[0; 8], 8).await.unwrap();
        conn.exchange(&[0; 8], 8).await.unwrap();

        let writes: Vec<Instant> = bus
            .timed_events()
            .into_iter()
            .filter(|(_, e)| matches!(e, LinkEvent::Write(_)))
            .map(|(at, _)| at)
            .collect();
        assert_eq!(writes.len(), 2);
        assert!(writes[1] - writes[0] >= conn.config().inter_frame_delay());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_surfaces() {
        let bus = MockBus::new();
        bus.fail_open("permission denied");
        let err = Connection::open(&config(RtsConfig::default()), &bus.opener()).unwrap_err();
        assert!(matches!(err, TransportError::Open { .. }));
    }

    #[test]
    fn test_busy_export_means_already_exported() {
        // EBUSY
        assert!(already_exported(&std::io::Error::from_raw_os_error(16)));
        assert!(already_exported(&std::io::Error::from(
            std::io::ErrorKind::ResourceBusy
        )));
        assert!(!already_exported(&std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        )));
        assert!(!already_exported(&std::io::Error::other("Device or resource busy")));
    }

    #[test]
    fn test_sysfs_gpio_pin() {
        let dir = tempfile::tempdir().unwrap();
        let gpio = dir.path().join("gpio5");
        std::fs::create_dir_all(&gpio).unwrap();

        let base = dir.path().to_string_lossy().to_string();
        let mut pin = SysfsGpioPin::open(&base, 5).unwrap();
        assert_eq!(std::fs::read_to_string(gpio.join("direction")).unwrap(), "out");

        pin.set_level(true).unwrap();
        assert_eq!(std::fs::read_to_string(gpio.join("value")).unwrap(), "1");
        pin.set_level(false).unwrap();
        assert_eq!(std::fs::read_to_string(gpio.join("value")).unwrap(), "0");
    }
}
