//! Service calls accepted by rtusrv
//!
//! Calls arrive as JSON objects tagged by `service`:
//!
//! ```json
//! {"service": "write_register", "hub": "default", "unit": 1, "address": 10, "value": 42}
//! {"service": "write_register", "unit": 1, "address": 10, "value": [1, 2, 3]}
//! {"service": "write_coil", "unit": 1, "address": 0, "state": true}
//! {"service": "read_holding_registers", "unit": 1, "address": 0, "count": 4}
//! ```
//!
//! Numbers are accepted as signed integers and range-checked here, before a
//! request ever reaches a hub.

use serde::{Deserialize, Serialize};
use voltage_rtu::{RegisterWrite, Request, Response, DEFAULT_HUB, MAX_SLAVE};

use crate::error::{Result, RtuSrvError};

fn default_hub() -> String {
    DEFAULT_HUB.to_string()
}

/// Register value: one integer or a list of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Single(i64),
    Multiple(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "snake_case")]
pub enum ServiceCall {
    WriteRegister {
        #[serde(default = "default_hub")]
        hub: String,
        unit: i64,
        address: i64,
        value: RegisterValue,
    },
    WriteCoil {
        #[serde(default = "default_hub")]
        hub: String,
        unit: i64,
        address: i64,
        state: bool,
    },
    ReadCoils {
        #[serde(default = "default_hub")]
        hub: String,
        unit: i64,
        address: i64,
        count: i64,
    },
    ReadInputRegisters {
        #[serde(default = "default_hub")]
        hub: String,
        unit: i64,
        address: i64,
        count: i64,
    },
    ReadHoldingRegisters {
        #[serde(default = "default_hub")]
        hub: String,
        unit: i64,
        address: i64,
        count: i64,
    },
}

impl ServiceCall {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RtuSrvError::invalid_call(e.to_string()))
    }

    pub fn hub(&self) -> &str {
        match self {
            ServiceCall::WriteRegister { hub, .. }
            | ServiceCall::WriteCoil { hub, .. }
            | ServiceCall::ReadCoils { hub, .. }
            | ServiceCall::ReadInputRegisters { hub, .. }
            | ServiceCall::ReadHoldingRegisters { hub, .. } => hub,
        }
    }

    /// Range-check every field and build the typed request
    pub fn to_request(&self) -> Result<Request> {
        let request = match self {
            ServiceCall::WriteRegister {
                unit,
                address,
                value,
                ..
            } => {
                let value = match value {
                    RegisterValue::Single(v) => RegisterWrite::Single(to_u16("value", *v)?),
                    RegisterValue::Multiple(values) => RegisterWrite::Multiple(
                        values
                            .iter()
                            .map(|v| to_u16("value", *v))
                            .collect::<Result<Vec<_>>>()?,
                    ),
                };
                Request::register_write(to_unit(*unit)?, to_u16("address", *address)?, value)
            },
            ServiceCall::WriteCoil {
                unit,
                address,
                state,
                ..
            } => Request::write_coil(to_unit(*unit)?, to_u16("address", *address)?, *state),
            ServiceCall::ReadCoils {
                unit,
                address,
                count,
                ..
            } => Request::read_coils(
                to_unit(*unit)?,
                to_u16("address", *address)?,
                to_u16("count", *count)?,
            ),
            ServiceCall::ReadInputRegisters {
                unit,
                address,
                count,
                ..
            } => Request::read_input_registers(
                to_unit(*unit)?,
                to_u16("address", *address)?,
                to_u16("count", *count)?,
            ),
            ServiceCall::ReadHoldingRegisters {
                unit,
                address,
                count,
                ..
            } => Request::read_holding_registers(
                to_unit(*unit)?,
                to_u16("address", *address)?,
                to_u16("count", *count)?,
            ),
        };
        Ok(request?)
    }
}

fn to_u16(field: &str, value: i64) -> Result<u16> {
    u16::try_from(value).map_err(|_| {
        RtuSrvError::invalid_call(format!("{field} {value} out of range 0-65535"))
    })
}

fn to_unit(value: i64) -> Result<u8> {
    u8::try_from(value)
        .ok()
        .filter(|unit| *unit <= MAX_SLAVE)
        .ok_or_else(|| {
            RtuSrvError::invalid_call(format!("unit {value} out of range 0-{MAX_SLAVE}"))
        })
}

/// One JSON reply line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallReply {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coils: Option<Vec<bool>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        registers: Option<Vec<u16>>,
    },
    Error {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exception: Option<u8>,
    },
}

impl CallReply {
    pub fn from_result(result: &Result<Response>) -> Self {
        match result {
            Ok(Response::Coils(bits)) => CallReply::Ok {
                coils: Some(bits.clone()),
                registers: None,
            },
            Ok(Response::Registers(values)) => CallReply::Ok {
                coils: None,
                registers: Some(values.clone()),
            },
            Ok(Response::Written) => CallReply::Ok {
                coils: None,
                registers: None,
            },
            Err(e) => CallReply::Error {
                kind: e.kind().to_string(),
                message: e.to_string(),
                exception: match e {
                    RtuSrvError::Rtu(rtu) => rtu.exception_code(),
                    _ => None,
                },
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, CallReply::Ok { .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","kind":"internal","message":"{e}"}}"#)
        })
    }
}
