//! Modbus RTU frame codec
//!
//! An RTU frame is `[slave][function][payload...][crc_lo][crc_hi]`. The CRC is
//! CRC-16/MODBUS (reflected polynomial 0xA001, initial value 0xFFFF) and is
//! transmitted low byte first.

use crc::{Crc, CRC_16_MODBUS};
use tracing::debug;

use crate::error::DecodeError;

/// Smallest frame that can carry a CRC: slave + function + 2 CRC bytes
pub const MIN_FRAME_LEN: usize = 4;

/// Exception responses are always slave + function|0x80 + code + CRC
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// Largest RTU ADU allowed on a serial line
pub const MAX_FRAME_LEN: usize = 256;

/// Bit set in the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Function codes used by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(FunctionCode::ReadCoils),
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x05 => Some(FunctionCode::WriteSingleCoil),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "read_coils",
            FunctionCode::ReadHoldingRegisters => "read_holding_registers",
            FunctionCode::ReadInputRegisters => "read_input_registers",
            FunctionCode::WriteSingleCoil => "write_coil",
            FunctionCode::WriteSingleRegister => "write_register",
            FunctionCode::WriteMultipleRegisters => "write_registers",
        }
    }
}

/// CRC-16/MODBUS over `data`
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Total frame length for a payload of `payload_len` bytes
pub fn frame_len(payload_len: usize) -> usize {
    payload_len + MIN_FRAME_LEN
}

/// Build a request frame with the CRC appended
pub fn encode(slave: u8, function: FunctionCode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(frame_len(payload.len()));
    frame.push(slave);
    frame.push(function.code());
    frame.extend_from_slice(payload);

    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());

    debug!(
        "Encode: slave={}, FC={:02X}, payload_len={}, CRC={:04X}",
        slave,
        function.code(),
        payload.len(),
        crc
    );
    frame
}

/// Validate a response frame and return its payload
///
/// `payload_len` is the payload size the request implies (for example
/// `1 + ceil(count / 8)` for read coils). The CRC is checked before anything
/// else, so any corruption surfaces as [`DecodeError::Checksum`].
pub fn decode(
    frame: &[u8],
    slave: u8,
    function: FunctionCode,
    payload_len: usize,
) -> Result<&[u8], DecodeError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(DecodeError::Framing(format!(
            "Frame too short: {} bytes",
            frame.len()
        )));
    }

    let crc_pos = frame.len() - 2;
    let actual = u16::from_le_bytes([frame[crc_pos], frame[crc_pos + 1]]);
    let expected = crc16(&frame[..crc_pos]);
    if actual != expected {
        return Err(DecodeError::Checksum { expected, actual });
    }

    if frame[0] != slave {
        return Err(DecodeError::Framing(format!(
            "Response from slave {}, expected {}",
            frame[0], slave
        )));
    }

    let response_fc = frame[1];
    if response_fc == function.code() | EXCEPTION_FLAG {
        if frame.len() != EXCEPTION_FRAME_LEN {
            return Err(DecodeError::Framing(format!(
                "Exception frame of {} bytes",
                frame.len()
            )));
        }
        return Err(DecodeError::Exception {
            function: function.code(),
            code: frame[2],
        });
    }

    if response_fc != function.code() {
        return Err(DecodeError::Framing(format!(
            "Function code mismatch: expected {:02X}, got {:02X}",
            function.code(),
            response_fc
        )));
    }

    if frame.len() != frame_len(payload_len) {
        return Err(DecodeError::Framing(format!(
            "Invalid frame length: expected {}, got {}",
            frame_len(payload_len),
            frame.len()
        )));
    }

    Ok(&frame[2..crc_pos])
}

/// Number of bytes that completes the frame received so far
///
/// Normally `expected`; once the function byte shows the exception flag the
/// frame ends after [`EXCEPTION_FRAME_LEN`] bytes.
pub fn target_len(received: &[u8], expected: usize) -> usize {
    match received.get(1) {
        Some(fc) if fc & EXCEPTION_FLAG != 0 => EXCEPTION_FRAME_LEN,
        _ => expected,
    }
}
