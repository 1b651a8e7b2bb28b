//! Hub: one RS-485 bus shared by any number of callers
//!
//! Every operation takes the hub's lock for the whole write-then-read
//! exchange. The exchange itself runs in a spawned task that owns the lock
//! guard, so dropping the caller's future cannot interrupt it halfway and
//! leave the transceiver in transmit mode.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::SerialConfig;
use crate::error::{Result, RtuError};
use crate::master::RtuMaster;
use crate::request::{RegisterWrite, Request, Response};
use crate::transport::{Connection, PortOpener, TokioSerialOpener};

#[derive(Debug)]
enum HubState {
    /// Created, `connect()` not yet called or failed
    Idle,
    Connected(RtuMaster),
    Closed,
}

/// Thread-safe facade around one RTU master
pub struct Hub {
    name: String,
    config: SerialConfig,
    opener: Arc<dyn PortOpener>,
    state: Arc<Mutex<HubState>>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("name", &self.name)
            .field("device", &self.config.device)
            .finish()
    }
}

impl Hub {
    /// Hub on a real serial port
    pub fn new(name: impl Into<String>, config: SerialConfig) -> Result<Self> {
        Self::with_opener(name, config, Arc::new(TokioSerialOpener))
    }

    /// Hub whose link and direction pin come from `opener`
    pub fn with_opener(
        name: impl Into<String>,
        config: SerialConfig,
        opener: Arc<dyn PortOpener>,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RtuError::config("Hub name cannot be empty"));
        }
        config
            .validate()
            .map_err(|e| RtuError::config(format!("Hub '{name}': {e}")))?;

        Ok(Self {
            name,
            config,
            opener,
            state: Arc::new(Mutex::new(HubState::Idle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Open the serial port; a second call on a connected hub is a no-op
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            HubState::Connected(_) => return Ok(()),
            HubState::Closed => return Err(RtuError::Closed(self.name.clone())),
            HubState::Idle => {},
        }

        let connection = Connection::open(&self.config, self.opener.as_ref()).map_err(|e| {
            error!("Hub {} connect failed: {}", self.name, e);
            RtuError::from(e)
        })?;
        *state = HubState::Connected(RtuMaster::new(connection));
        info!("Hub {} connected on {}", self.name, self.config.device);
        Ok(())
    }

    /// Release the port; later operations fail with `Closed`
    ///
    /// Waits for an in-flight exchange to finish. Calling it again is harmless.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if matches!(*state, HubState::Closed) {
            return;
        }
        let previous = std::mem::replace(&mut *state, HubState::Closed);
        drop(previous);
        info!("Hub {} closed", self.name);
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.lock().await, HubState::Connected(_))
    }

    /// Run `request` as one atomic exchange on this hub's bus
    pub async fn execute(&self, request: Request) -> Result<Response> {
        // Malformed requests never wait for the bus
        request.validate()?;

        let guard = Arc::clone(&self.state).lock_owned().await;
        let name = self.name.clone();
        debug!("Hub {} {} slave {}", name, request.function().name(), request.slave());

        let task = tokio::spawn(async move {
            let mut guard = guard;
            match &mut *guard {
                HubState::Connected(master) => master.execute(&request).await,
                HubState::Idle => Err(RtuError::NotConnected(name)),
                HubState::Closed => Err(RtuError::Closed(name)),
            }
        });

        task.await
            .map_err(|e| RtuError::Internal(format!("Exchange task failed: {e}")))?
    }

    pub async fn read_coils(&self, slave: u8, address: u16, count: u16) -> Result<Vec<bool>> {
        let request = Request::read_coils(slave, address, count)?;
        self.execute(request).await?.into_coils()
    }

    pub async fn read_input_registers(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let request = Request::read_input_registers(slave, address, count)?;
        self.execute(request).await?.into_registers()
    }

    pub async fn read_holding_registers(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let request = Request::read_holding_registers(slave, address, count)?;
        self.execute(request).await?.into_registers()
    }

    pub async fn write_coil(&self, slave: u8, address: u16, value: bool) -> Result<()> {
        let request = Request::write_coil(slave, address, value)?;
        self.execute(request).await?.into_written()
    }

    pub async fn write_register(&self, slave: u8, address: u16, value: u16) -> Result<()> {
        let request = Request::write_register(slave, address, value)?;
        self.execute(request).await?.into_written()
    }

    pub async fn write_registers(&self, slave: u8, address: u16, values: &[u16]) -> Result<()> {
        let request = Request::write_registers(slave, address, values.to_vec())?;
        self.execute(request).await?.into_written()
    }

    /// Single or multiple register write, as decided by the caller
    pub async fn write_register_value(
        &self,
        slave: u8,
        address: u16,
        value: RegisterWrite,
    ) -> Result<()> {
        let request = Request::register_write(slave, address, value)?;
        self.execute(request).await?.into_written()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::codec::FunctionCode;
    use crate::testing::{response, simulated_register, LinkEvent, MockBus, Reply};
    use std::time::Duration;

    fn hub(bus: &MockBus) -> Hub {
        let config = SerialConfig {
            timeout: Duration::from_millis(100),
            ..SerialConfig::new("/dev/ttyMOCK0")
        };
        Hub::with_opener("default", config, Arc::new(bus.opener())).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected_before_connect() {
        let bus = MockBus::new();
        let hub = hub(&bus);

        let err = hub.write_register(1, 0, 1).await.unwrap_err();
        assert_eq!(err, RtuError::NotConnected("default".to_string()));
        assert!(bus.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let bus = MockBus::new();
        let hub = hub(&bus);

        hub.connect().await.unwrap();
        hub.connect().await.unwrap();
        assert!(hub.is_connected().await);
        assert_eq!(bus.opened_links(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_after_close() {
        let bus = MockBus::new();
        bus.simulate_slave();
        let hub = hub(&bus);

        hub.connect().await.unwrap();
        assert_eq!(
            hub.read_holding_registers(1, 4, 1).await.unwrap(),
            vec![simulated_register(4)]
        );

        hub.close().await;
        hub.close().await;
        assert!(!hub.is_connected().await);
        assert_eq!(
            hub.read_coils(1, 0, 1).await.unwrap_err(),
            RtuError::Closed("default".to_string())
        );
        assert!(matches!(hub.connect().await, Err(RtuError::Closed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_leaves_hub_idle() {
        let bus = MockBus::new();
        bus.fail_open("No such file or directory");
        let hub = hub(&bus);

        assert!(matches!(hub.connect().await, Err(RtuError::Transport(_))));
        assert!(!hub.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_skips_lock() {
        let bus = MockBus::new();
        let hub = hub(&bus);
        hub.connect().await.unwrap();

        assert!(matches!(
            hub.read_coils(1, 0, 2001).await,
            Err(RtuError::InvalidArgument(_))
        ));
        assert!(bus.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_caller_does_not_abort_exchange() {
        let bus = MockBus::new();
        let echo = response(1, FunctionCode::WriteSingleRegister, &[0, 1, 0, 2]);
        bus.push_reply(Reply::Delayed(Duration::from_millis(50), echo));
        let hub = hub(&bus);
        hub.connect().await.unwrap();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), hub.write_register(1, 1, 2)).await;
        assert!(cancelled.is_err());

        // The spawned exchange still owns the bus until its reply arrives
        bus.simulate_slave();
        hub.write_register(1, 3, 4).await.unwrap();

        let reads: Vec<_> = bus
            .events()
            .into_iter()
            .filter(|e| matches!(e, LinkEvent::Read(_)))
            .collect();
        assert_eq!(reads.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_write_variants() {
        let bus = MockBus::new();
        bus.simulate_slave();
        let hub = hub(&bus);
        hub.connect().await.unwrap();

        hub.write_register_value(1, 0, RegisterWrite::Single(5))
            .await
            .unwrap();
        hub.write_register_value(1, 0, RegisterWrite::Multiple(vec![5, 6]))
            .await
            .unwrap();

        let writes = bus.writes();
        assert_eq!(writes[0][1], 0x06);
        assert_eq!(writes[1][1], 0x10);
    }
}
