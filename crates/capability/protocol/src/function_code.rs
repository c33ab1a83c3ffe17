//! Modbus 功能码

use crate::error::ProtocolError;
use std::fmt;

/// 异常响应标志位：异常功能码 = 功能码 | 0x80
pub const EXCEPTION_FLAG: u8 = 0x80;

/// 单次读寄存器上限
pub const MAX_READ_REGISTERS: u16 = 125;
/// 单次读线圈/离散输入上限
pub const MAX_READ_BITS: u16 = 2000;
/// 单次写多个寄存器上限
pub const MAX_WRITE_REGISTERS: u16 = 123;
/// 单次写多个线圈上限
pub const MAX_WRITE_COILS: u16 = 1968;

/// 支持的功能码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl FunctionCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// 线路上的功能码
    pub fn code(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
        }
    }

    /// 设备拒绝请求时返回的异常功能码
    pub fn exception_code(self) -> u8 {
        self.code() | EXCEPTION_FLAG
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    pub fn is_write(self) -> bool {
        !self.is_read()
    }

    /// 按位访问（线圈、离散输入）
    pub fn is_bit_access(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::WriteSingleCoil
                | Self::WriteMultipleCoils
        )
    }

    /// 读功能码的单次数量上限；写功能码返回 None。
    pub fn max_read_quantity(self) -> Option<u16> {
        match self {
            Self::ReadCoils | Self::ReadDiscreteInputs => Some(MAX_READ_BITS),
            Self::ReadHoldingRegisters | Self::ReadInputRegisters => Some(MAX_READ_REGISTERS),
            _ => None,
        }
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        FunctionCode::from_u8(code)
            .ok_or_else(|| ProtocolError::Decode(format!("unknown function code 0x{code:02X}")))
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.code())
    }
}
