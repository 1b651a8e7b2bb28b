//! Validated Modbus requests and their decoded responses

use crate::codec::FunctionCode;
use crate::error::{Result, RtuError};

/// Highest unicast slave address
pub const MAX_SLAVE: u8 = 247;

/// Writes to this address reach every slave and get no reply
pub const BROADCAST: u8 = 0;

pub const MAX_READ_COILS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Size of the Modbus address space; `address + count` may not exceed it
const ADDRESS_SPACE: u32 = 0x1_0000;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// Value of a register write, decided by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterWrite {
    Single(u16),
    Multiple(Vec<u16>),
}

/// One Modbus operation against one slave
///
/// Use the constructors; they reject anything that must not reach the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { slave: u8, address: u16, count: u16 },
    ReadInputRegisters { slave: u8, address: u16, count: u16 },
    ReadHoldingRegisters { slave: u8, address: u16, count: u16 },
    WriteCoil { slave: u8, address: u16, value: bool },
    WriteRegister { slave: u8, address: u16, value: u16 },
    WriteRegisters { slave: u8, address: u16, values: Vec<u16> },
}

/// Decoded result of a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Coils(Vec<bool>),
    Registers(Vec<u16>),
    /// Write acknowledged (or broadcast sent)
    Written,
}

impl Request {
    pub fn read_coils(slave: u8, address: u16, count: u16) -> Result<Self> {
        Self::validated(Request::ReadCoils {
            slave,
            address,
            count,
        })
    }

    pub fn read_input_registers(slave: u8, address: u16, count: u16) -> Result<Self> {
        Self::validated(Request::ReadInputRegisters {
            slave,
            address,
            count,
        })
    }

    pub fn read_holding_registers(slave: u8, address: u16, count: u16) -> Result<Self> {
        Self::validated(Request::ReadHoldingRegisters {
            slave,
            address,
            count,
        })
    }

    pub fn write_coil(slave: u8, address: u16, value: bool) -> Result<Self> {
        Self::validated(Request::WriteCoil {
            slave,
            address,
            value,
        })
    }

    pub fn write_register(slave: u8, address: u16, value: u16) -> Result<Self> {
        Self::validated(Request::WriteRegister {
            slave,
            address,
            value,
        })
    }

    pub fn write_registers(slave: u8, address: u16, values: Vec<u16>) -> Result<Self> {
        Self::validated(Request::WriteRegisters {
            slave,
            address,
            values,
        })
    }

    /// Single or multiple register write depending on `value`
    pub fn register_write(slave: u8, address: u16, value: RegisterWrite) -> Result<Self> {
        match value {
            RegisterWrite::Single(value) => Self::write_register(slave, address, value),
            RegisterWrite::Multiple(values) => Self::write_registers(slave, address, values),
        }
    }

    fn validated(request: Self) -> Result<Self> {
        request.validate()?;
        Ok(request)
    }

    /// Check slave, count and address range
    pub fn validate(&self) -> Result<()> {
        let slave = self.slave();
        if slave > MAX_SLAVE {
            return Err(RtuError::invalid_argument(format!(
                "Slave address {slave} out of range 0-{MAX_SLAVE}"
            )));
        }

        let (count, limit) = match self {
            Request::ReadCoils { count, .. } => (*count, MAX_READ_COILS),
            Request::ReadInputRegisters { count, .. }
            | Request::ReadHoldingRegisters { count, .. } => (*count, MAX_READ_REGISTERS),
            Request::WriteRegisters { values, .. } => {
                let len = u16::try_from(values.len()).unwrap_or(u16::MAX);
                (len, MAX_WRITE_REGISTERS)
            },
            Request::WriteCoil { .. } | Request::WriteRegister { .. } => (1, 1),
        };

        if count == 0 || count > limit {
            return Err(RtuError::invalid_argument(format!(
                "{}: quantity {} out of range 1-{}",
                self.function().name(),
                count,
                limit
            )));
        }

        if u32::from(self.address()) + u32::from(count) > ADDRESS_SPACE {
            return Err(RtuError::invalid_argument(format!(
                "{}: address {} + quantity {} exceeds 65536",
                self.function().name(),
                self.address(),
                count
            )));
        }

        if slave == BROADCAST && self.is_read() {
            return Err(RtuError::invalid_argument(format!(
                "{}: broadcast address 0 cannot be read",
                self.function().name()
            )));
        }

        Ok(())
    }

    pub fn slave(&self) -> u8 {
        match self {
            Request::ReadCoils { slave, .. }
            | Request::ReadInputRegisters { slave, .. }
            | Request::ReadHoldingRegisters { slave, .. }
            | Request::WriteCoil { slave, .. }
            | Request::WriteRegister { slave, .. }
            | Request::WriteRegisters { slave, .. } => *slave,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            Request::ReadCoils { address, .. }
            | Request::ReadInputRegisters { address, .. }
            | Request::ReadHoldingRegisters { address, .. }
            | Request::WriteCoil { address, .. }
            | Request::WriteRegister { address, .. }
            | Request::WriteRegisters { address, .. } => *address,
        }
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::WriteCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Request::ReadCoils { .. }
                | Request::ReadInputRegisters { .. }
                | Request::ReadHoldingRegisters { .. }
        )
    }

    /// Request data following the function code
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(5 + 2 * usize::from(MAX_WRITE_REGISTERS));
        payload.extend_from_slice(&self.address().to_be_bytes());

        match self {
            Request::ReadCoils { count, .. }
            | Request::ReadInputRegisters { count, .. }
            | Request::ReadHoldingRegisters { count, .. } => {
                payload.extend_from_slice(&count.to_be_bytes());
            },
            Request::WriteCoil { value, .. } => {
                let raw = if *value { COIL_ON } else { COIL_OFF };
                payload.extend_from_slice(&raw.to_be_bytes());
            },
            Request::WriteRegister { value, .. } => {
                payload.extend_from_slice(&value.to_be_bytes());
            },
            Request::WriteRegisters { values, .. } => {
                payload.extend_from_slice(&(values.len() as u16).to_be_bytes());
                payload.push((values.len() * 2) as u8);
                for value in values {
                    payload.extend_from_slice(&value.to_be_bytes());
                }
            },
        }
        payload
    }

    /// Payload length of a normal (non-exception) response
    pub fn response_payload_len(&self) -> usize {
        match self {
            Request::ReadCoils { count, .. } => 1 + usize::from(*count).div_ceil(8),
            Request::ReadInputRegisters { count, .. }
            | Request::ReadHoldingRegisters { count, .. } => 1 + 2 * usize::from(*count),
            // Writes echo address plus value or quantity
            Request::WriteCoil { .. }
            | Request::WriteRegister { .. }
            | Request::WriteRegisters { .. } => 4,
        }
    }

    /// Interpret a response payload already checked by the codec
    pub fn parse_response(&self, payload: &[u8]) -> Result<Response> {
        match self {
            Request::ReadCoils { count, .. } => {
                let data = read_data(payload, usize::from(*count).div_ceil(8))?;
                let bits = (0..usize::from(*count))
                    .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
                    .collect();
                Ok(Response::Coils(bits))
            },
            Request::ReadInputRegisters { count, .. }
            | Request::ReadHoldingRegisters { count, .. } => {
                let data = read_data(payload, 2 * usize::from(*count))?;
                let registers = data
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(Response::Registers(registers))
            },
            Request::WriteCoil { .. } | Request::WriteRegister { .. } => {
                // Single writes echo the request verbatim
                let request = self.payload();
                if payload != request.as_slice() {
                    return Err(RtuError::framing(format!(
                        "{}: echo {} does not match request {}",
                        self.function().name(),
                        hex::encode(payload),
                        hex::encode(&request)
                    )));
                }
                Ok(Response::Written)
            },
            Request::WriteRegisters { .. } => {
                let request = self.payload();
                if payload.get(..4) != request.get(..4) {
                    return Err(RtuError::framing(format!(
                        "write_registers: echo {} does not match address/quantity {}",
                        hex::encode(payload),
                        hex::encode(&request[..4])
                    )));
                }
                Ok(Response::Written)
            },
        }
    }
}

/// Strip and check the byte-count prefix of a read response
fn read_data(payload: &[u8], expected: usize) -> Result<&[u8]> {
    match payload.split_first() {
        Some((&byte_count, data)) if usize::from(byte_count) == expected && data.len() == expected => {
            Ok(data)
        },
        Some((&byte_count, _)) => Err(RtuError::framing(format!(
            "Byte count {byte_count}, expected {expected}"
        ))),
        None => Err(RtuError::framing("Empty read response")),
    }
}

impl Response {
    pub fn into_coils(self) -> Result<Vec<bool>> {
        match self {
            Response::Coils(bits) => Ok(bits),
            other => Err(RtuError::Internal(format!("Expected coils, got {other:?}"))),
        }
    }

    pub fn into_registers(self) -> Result<Vec<u16>> {
        match self {
            Response::Registers(values) => Ok(values),
            other => Err(RtuError::Internal(format!(
                "Expected registers, got {other:?}"
            ))),
        }
    }

    pub fn into_written(self) -> Result<()> {
        match self {
            Response::Written => Ok(()),
            other => Err(RtuError::Internal(format!(
                "Expected write acknowledgement, got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_count_bounds() {
        assert!(Request::read_coils(1, 0, 2000).is_ok());
        assert!(matches!(
            Request::read_coils(1, 0, 2001),
            Err(RtuError::InvalidArgument(_))
        ));
        assert!(Request::read_coils(1, 0, 0).is_err());
        assert!(Request::read_holding_registers(1, 0, 125).is_ok());
        assert!(Request::read_input_registers(1, 0, 126).is_err());
        assert!(Request::write_registers(1, 0, vec![0; 123]).is_ok());
        assert!(Request::write_registers(1, 0, vec![0; 124]).is_err());
        assert!(Request::write_registers(1, 0, vec![]).is_err());
    }

    #[test]
    fn test_address_range() {
        assert!(Request::read_holding_registers(1, 65535, 1).is_ok());
        assert!(Request::read_holding_registers(1, 65535, 2).is_err());
        assert!(Request::read_coils(1, 64000, 1536).is_ok());
        assert!(Request::read_coils(1, 64000, 1537).is_err());
        assert!(Request::write_registers(1, 65534, vec![1, 2, 3]).is_err());
    }

    #[test]
    fn test_slave_range_and_broadcast() {
        assert!(Request::write_register(247, 0, 1).is_ok());
        assert!(Request::write_register(248, 0, 1).is_err());
        assert!(Request::write_coil(BROADCAST, 0, true).is_ok());
        assert!(Request::read_coils(BROADCAST, 0, 1).is_err());
        assert!(Request::read_input_registers(BROADCAST, 0, 1).is_err());
    }

    #[test]
    fn test_payloads() {
        let request = Request::write_register(1, 10, 42).unwrap();
        assert_eq!(request.payload(), vec![0x00, 0x0A, 0x00, 0x2A]);

        let request = Request::write_coil(1, 0x00AC, true).unwrap();
        assert_eq!(request.payload(), vec![0x00, 0xAC, 0xFF, 0x00]);

        let request = Request::write_registers(1, 1, vec![0x000A, 0x0102]).unwrap();
        assert_eq!(
            request.payload(),
            vec![0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );

        let request = Request::read_coils(1, 0x13, 37).unwrap();
        assert_eq!(request.payload(), vec![0x00, 0x13, 0x00, 0x25]);
        assert_eq!(request.response_payload_len(), 6);
    }

    #[test]
    fn test_parse_coils() {
        let request = Request::read_coils(1, 0x13, 10).unwrap();
        let response = request.parse_response(&[0x02, 0xCD, 0x01]).unwrap();
        assert_eq!(
            response,
            Response::Coils(vec![
                true, false, true, true, false, false, true, true, true, false
            ])
        );
    }

    #[test]
    fn test_parse_registers() {
        let request = Request::read_holding_registers(1, 0x6B, 3).unwrap();
        let response = request
            .parse_response(&[0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64])
            .unwrap();
        assert_eq!(response, Response::Registers(vec![0x022B, 0x0000, 0x0064]));

        assert!(matches!(
            request.parse_response(&[0x04, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64]),
            Err(RtuError::Framing(_))
        ));
    }

    #[test]
    fn test_write_echo_verification() {
        let request = Request::write_register(1, 10, 42).unwrap();
        assert_eq!(
            request.parse_response(&[0x00, 0x0A, 0x00, 0x2A]).unwrap(),
            Response::Written
        );
        assert!(matches!(
            request.parse_response(&[0x00, 0x0A, 0x00, 0x2B]),
            Err(RtuError::Framing(_))
        ));

        let request = Request::write_registers(1, 1, vec![7, 8]).unwrap();
        assert!(request.parse_response(&[0x00, 0x01, 0x00, 0x02]).is_ok());
        assert!(request.parse_response(&[0x00, 0x01, 0x00, 0x03]).is_err());
    }

    #[test]
    fn test_register_write_dispatch() {
        let single = Request::register_write(1, 5, RegisterWrite::Single(9)).unwrap();
        assert_eq!(single.function(), FunctionCode::WriteSingleRegister);

        let multiple = Request::register_write(1, 5, RegisterWrite::Multiple(vec![9])).unwrap();
        assert_eq!(multiple.function(), FunctionCode::WriteMultipleRegisters);
    }
}
