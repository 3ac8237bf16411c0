use thiserror::Error;

/// MBAP header length: transaction id, protocol id, length and unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest Modbus/TCP ADU (7-byte header + 253-byte PDU).
pub const MAX_ADU_LEN: usize = 260;

/// Number of addressable entries in every bank.
pub const BANK_SIZE: usize = 65536;

pub const READ_BITS_MAX: u16 = 2000;
pub const READ_REGISTERS_MAX: u16 = 125;
pub const WRITE_COILS_MAX: u16 = 1968;
pub const WRITE_REGISTERS_MAX: u16 = 123;

pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

/// Function codes served by the default dispatch table.
pub mod function_code {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

    /// High bit set on a response function code marks an exception.
    pub const EXCEPTION_FLAG: u8 = 0x80;
}

/// Modbus exception codes carried in the single byte of an exception PDU.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    #[error("illegal function")]
    IllegalFunction = 0x01,

    #[error("illegal data address")]
    IllegalDataAddress = 0x02,

    #[error("illegal data value")]
    IllegalDataValue = 0x03,

    #[error("server device failure")]
    ServerDeviceFailure = 0x04,

    #[error("acknowledge")]
    Acknowledge = 0x05,

    #[error("server device busy")]
    ServerDeviceBusy = 0x06,

    #[error("memory parity error")]
    MemoryParityError = 0x08,

    #[error("gateway path unavailable")]
    GatewayPathUnavailable = 0x0A,

    #[error("gateway target device failed to respond")]
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ExceptionCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for ExceptionCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ExceptionCode::IllegalFunction),
            0x02 => Ok(ExceptionCode::IllegalDataAddress),
            0x03 => Ok(ExceptionCode::IllegalDataValue),
            0x04 => Ok(ExceptionCode::ServerDeviceFailure),
            0x05 => Ok(ExceptionCode::Acknowledge),
            0x06 => Ok(ExceptionCode::ServerDeviceBusy),
            0x08 => Ok(ExceptionCode::MemoryParityError),
            0x0A => Ok(ExceptionCode::GatewayPathUnavailable),
            0x0B => Ok(ExceptionCode::GatewayTargetDeviceFailedToRespond),
            other => Err(other),
        }
    }
}

/// Register type of a bank, used by presets and log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Coil,
    Discrete,
    Holding,
    Input,
}

impl std::fmt::Display for RegisterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegisterType::Coil => "coils",
            RegisterType::Discrete => "discrete inputs",
            RegisterType::Holding => "holding registers",
            RegisterType::Input => "input registers",
        };
        f.write_str(name)
    }
}
