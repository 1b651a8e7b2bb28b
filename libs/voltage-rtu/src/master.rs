//! Modbus RTU master
//!
//! Combines the frame codec and one [`Connection`] into the six supported
//! function codes. Not thread-safe by itself; [`crate::Hub`] serializes
//! access.

use tracing::{debug, warn};

use crate::codec;
use crate::error::{Result, RtuError};
use crate::request::{Request, Response, BROADCAST, MAX_SLAVE};
use crate::transport::Connection;

#[derive(Debug)]
pub struct RtuMaster {
    connection: Connection,
    slave: u8,
}

impl RtuMaster {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            slave: 1,
        }
    }

    /// Slave address used for the next frame
    pub fn slave(&self) -> u8 {
        self.slave
    }

    /// Select the target unit; no I/O
    pub fn select_slave(&mut self, slave: u8) -> Result<()> {
        if slave > MAX_SLAVE {
            return Err(RtuError::invalid_argument(format!(
                "Slave address {slave} out of range 0-{MAX_SLAVE}"
            )));
        }
        self.slave = slave;
        Ok(())
    }

    /// Run one request/response exchange
    pub async fn execute(&mut self, request: &Request) -> Result<Response> {
        request.validate()?;
        self.select_slave(request.slave())?;

        let function = request.function();
        let frame = codec::encode(self.slave, function, &request.payload());

        if self.slave == BROADCAST {
            self.connection.send(&frame).await?;
            debug!("RTU broadcast {} sent", function.name());
            return Ok(Response::Written);
        }

        let payload_len = request.response_payload_len();
        let raw = self
            .connection
            .exchange(&frame, codec::frame_len(payload_len))
            .await
            .map_err(|e| {
                debug!(
                    "RTU slave {} {} failed: {}",
                    self.slave,
                    function.name(),
                    e
                );
                RtuError::from(e)
            })?;

        let result = codec::decode(&raw, self.slave, function, payload_len)
            .map_err(RtuError::from)
            .and_then(|payload| request.parse_response(payload));

        if let Err(e) = &result {
            match e {
                RtuError::Exception { code, .. } => debug!(
                    "RTU slave {} {} exception 0x{:02X}",
                    self.slave,
                    function.name(),
                    code
                ),
                RtuError::Checksum { .. } => warn!(
                    "RTU checksum error from slave {}: {}",
                    self.slave,
                    hex::encode(&raw)
                ),
                _ => warn!(
                    "RTU framing error from slave {}: {} ({})",
                    self.slave,
                    e,
                    hex::encode(&raw)
                ),
            }
        }
        result
    }

    pub async fn read_coils(&mut self, slave: u8, address: u16, count: u16) -> Result<Vec<bool>> {
        let request = Request::read_coils(slave, address, count)?;
        self.execute(&request).await?.into_coils()
    }

    pub async fn read_input_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let request = Request::read_input_registers(slave, address, count)?;
        self.execute(&request).await?.into_registers()
    }

    pub async fn read_holding_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let request = Request::read_holding_registers(slave, address, count)?;
        self.execute(&request).await?.into_registers()
    }

    pub async fn write_coil(&mut self, slave: u8, address: u16, value: bool) -> Result<()> {
        let request = Request::write_coil(slave, address, value)?;
        self.execute(&request).await?.into_written()
    }

    pub async fn write_register(&mut self, slave: u8, address: u16, value: u16) -> Result<()> {
        let request = Request::write_register(slave, address, value)?;
        self.execute(&request).await?.into_written()
    }

    pub async fn write_registers(&mut self, slave: u8, address: u16, values: &[u16]) -> Result<()> {
        let request = Request::write_registers(slave, address, values.to_vec())?;
        self.execute(&request).await?.into_written()
    }
}
