//! 与传输无关的 PDU：功能码 + 数据

use crate::codec::{pack_bits, unpack_bits, RegisterValue};
use crate::error::ProtocolError;
use crate::function_code::{FunctionCode, EXCEPTION_FLAG, MAX_WRITE_COILS, MAX_WRITE_REGISTERS};
use bytes::{BufMut, Bytes, BytesMut};

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// PDU 编解码
pub trait Pdu: Sized {
    fn encode(&self, buf: &mut BytesMut);
    fn decode(pdu: &[u8]) -> Result<Self, ProtocolError>;

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// 响应/确认若为异常响应，转换为 `ProtocolError::Exception`。
pub fn check_exception(pdu: &[u8]) -> Result<(), ProtocolError> {
    match pdu {
        [] => Err(ProtocolError::Decode("empty pdu".into())),
        [function, code] if function & EXCEPTION_FLAG != 0 => Err(ProtocolError::Exception {
            function: function & !EXCEPTION_FLAG,
            code: *code,
        }),
        [function, ..] if function & EXCEPTION_FLAG != 0 => Err(ProtocolError::Decode(format!(
            "exception response must be 2 bytes, got {}",
            pdu.len()
        ))),
        _ => Ok(()),
    }
}

fn read_u16(pdu: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([pdu[at], pdu[at + 1]])
}

fn expect_len(pdu: &[u8], len: usize, what: &str) -> Result<(), ProtocolError> {
    if pdu.len() != len {
        return Err(ProtocolError::Decode(format!(
            "{what} pdu must be {len} bytes, got {}",
            pdu.len()
        )));
    }
    Ok(())
}

fn check_span(address: u16, quantity: u16) -> Result<(), ProtocolError> {
    if u32::from(address) + u32::from(quantity) > 0x1_0000 {
        return Err(ProtocolError::InvalidRequest(format!(
            "address {address} + quantity {quantity} exceeds 65535"
        )));
    }
    Ok(())
}

/// 读请求 `[fc][start][quantity]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    function: FunctionCode,
    start: u16,
    quantity: u16,
}

impl ReadRequest {
    pub fn new(function: FunctionCode, start: u16, quantity: u16) -> Result<Self, ProtocolError> {
        let max = function.max_read_quantity().ok_or_else(|| {
            ProtocolError::InvalidRequest(format!("{function} is not a read function"))
        })?;
        if quantity == 0 || quantity > max {
            return Err(ProtocolError::InvalidRequest(format!(
                "quantity {quantity} outside 1..={max} for {function}"
            )));
        }
        check_span(start, quantity)?;
        Ok(Self {
            function,
            start,
            quantity,
        })
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn quantity(&self) -> u16 {
        self.quantity
    }

    /// 响应中应有的数据字节数
    pub fn expected_byte_count(&self) -> usize {
        if self.function.is_bit_access() {
            usize::from(self.quantity).div_ceil(8)
        } else {
            usize::from(self.quantity) * 2
        }
    }
}

impl Pdu for ReadRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function.code());
        buf.put_u16(self.start);
        buf.put_u16(self.quantity);
    }

    fn decode(pdu: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(pdu, 5, "read request")?;
        let function = FunctionCode::try_from(pdu[0])?;
        ReadRequest::new(function, read_u16(pdu, 1), read_u16(pdu, 3))
    }
}

/// 读响应 `[fc][byteCount][data]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    function: FunctionCode,
    data: Bytes,
}

impl ReadResponse {
    pub fn new(function: FunctionCode, data: Bytes) -> Self {
        Self { function, data }
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 校验响应与请求匹配：功能码一致、字节数等于请求数量对应的字节数。
    pub fn matches(&self, request: &ReadRequest) -> Result<(), ProtocolError> {
        if self.function != request.function() {
            return Err(ProtocolError::Decode(format!(
                "response function {} does not answer {}",
                self.function,
                request.function()
            )));
        }
        if self.data.len() != request.expected_byte_count() {
            return Err(ProtocolError::Decode(format!(
                "byte count {} does not match quantity {}",
                self.data.len(),
                request.quantity()
            )));
        }
        Ok(())
    }

    /// 第 `index` 个线圈/离散输入
    pub fn bit(&self, index: usize) -> Option<bool> {
        self.data
            .get(index / 8)
            .map(|byte| (byte >> (index % 8)) & 1 == 1)
    }
}

impl Pdu for ReadResponse {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function.code());
        buf.put_u8(self.data.len() as u8);
        buf.put_slice(&self.data);
    }

    fn decode(pdu: &[u8]) -> Result<Self, ProtocolError> {
        check_exception(pdu)?;
        let function = FunctionCode::try_from(pdu[0])?;
        if !function.is_read() {
            return Err(ProtocolError::Decode(format!(
                "{function} is not a read response"
            )));
        }
        if pdu.len() < 2 {
            return Err(ProtocolError::Decode("read response without byte count".into()));
        }
        let byte_count = usize::from(pdu[1]);
        if pdu.len() - 2 != byte_count {
            return Err(ProtocolError::Decode(format!(
                "byte count {byte_count} but {} data bytes",
                pdu.len() - 2
            )));
        }
        Ok(Self {
            function,
            data: Bytes::copy_from_slice(&pdu[2..]),
        })
    }
}

/// 写命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCommand {
    SingleCoil { address: u16, value: bool },
    SingleRegister { address: u16, value: RegisterValue },
    MultipleCoils { address: u16, values: Vec<bool> },
    MultipleRegisters { address: u16, values: Vec<RegisterValue> },
}

impl WriteCommand {
    pub fn function(&self) -> FunctionCode {
        match self {
            WriteCommand::SingleCoil { .. } => FunctionCode::WriteSingleCoil,
            WriteCommand::SingleRegister { .. } => FunctionCode::WriteSingleRegister,
            WriteCommand::MultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            WriteCommand::MultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            WriteCommand::SingleCoil { address, .. }
            | WriteCommand::SingleRegister { address, .. }
            | WriteCommand::MultipleCoils { address, .. }
            | WriteCommand::MultipleRegisters { address, .. } => *address,
        }
    }

    /// 写入数量（单个写为 1）
    pub fn quantity(&self) -> usize {
        match self {
            WriteCommand::SingleCoil { .. } | WriteCommand::SingleRegister { .. } => 1,
            WriteCommand::MultipleCoils { values, .. } => values.len(),
            WriteCommand::MultipleRegisters { values, .. } => values.len(),
        }
    }

    /// 校验数量上限与地址范围。
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let max = match self {
            WriteCommand::SingleCoil { .. } | WriteCommand::SingleRegister { .. } => return Ok(()),
            WriteCommand::MultipleCoils { .. } => MAX_WRITE_COILS,
            WriteCommand::MultipleRegisters { .. } => MAX_WRITE_REGISTERS,
        };
        let quantity = self.quantity();
        if quantity == 0 || quantity > usize::from(max) {
            return Err(ProtocolError::InvalidRequest(format!(
                "write quantity {quantity} outside 1..={max}"
            )));
        }
        check_span(self.address(), quantity as u16)
    }

    /// 设备正确执行后应回送的确认。
    pub fn expected_confirm(&self) -> WriteConfirm {
        let value = match self {
            WriteCommand::SingleCoil { value, .. } => {
                if *value {
                    COIL_ON
                } else {
                    COIL_OFF
                }
            }
            WriteCommand::SingleRegister { value, .. } => value.word(),
            WriteCommand::MultipleCoils { values, .. } => values.len() as u16,
            WriteCommand::MultipleRegisters { values, .. } => values.len() as u16,
        };
        WriteConfirm {
            function: self.function(),
            address: self.address(),
            value,
        }
    }
}

impl Pdu for WriteCommand {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function().code());
        buf.put_u16(self.address());
        match self {
            WriteCommand::SingleCoil { value, .. } => {
                buf.put_u16(if *value { COIL_ON } else { COIL_OFF });
            }
            WriteCommand::SingleRegister { value, .. } => value.encode(buf),
            WriteCommand::MultipleCoils { values, .. } => {
                let packed = pack_bits(values);
                buf.put_u16(values.len() as u16);
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            }
            WriteCommand::MultipleRegisters { values, .. } => {
                buf.put_u16(values.len() as u16);
                buf.put_u8((values.len() * 2) as u8);
                for value in values {
                    value.encode(buf);
                }
            }
        }
    }

    fn decode(pdu: &[u8]) -> Result<Self, ProtocolError> {
        if pdu.is_empty() {
            return Err(ProtocolError::Decode("empty pdu".into()));
        }
        let function = FunctionCode::try_from(pdu[0])?;
        let command = match function {
            FunctionCode::WriteSingleCoil => {
                expect_len(pdu, 5, "write single coil")?;
                let value = match read_u16(pdu, 3) {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => {
                        return Err(ProtocolError::Decode(format!(
                            "coil value 0x{other:04X} is neither FF00 nor 0000"
                        )))
                    }
                };
                WriteCommand::SingleCoil {
                    address: read_u16(pdu, 1),
                    value,
                }
            }
            FunctionCode::WriteSingleRegister => {
                expect_len(pdu, 5, "write single register")?;
                WriteCommand::SingleRegister {
                    address: read_u16(pdu, 1),
                    value: RegisterValue::Unsigned(read_u16(pdu, 3)),
                }
            }
            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
                if pdu.len() < 6 {
                    return Err(ProtocolError::Decode(format!(
                        "{function} pdu too short: {} bytes",
                        pdu.len()
                    )));
                }
                let address = read_u16(pdu, 1);
                let quantity = usize::from(read_u16(pdu, 3));
                let byte_count = usize::from(pdu[5]);
                expect_len(pdu, 6 + byte_count, "write multiple")?;
                let data = &pdu[6..];
                if function == FunctionCode::WriteMultipleCoils {
                    if byte_count != quantity.div_ceil(8) {
                        return Err(ProtocolError::Decode(format!(
                            "byte count {byte_count} does not match {quantity} coils"
                        )));
                    }
                    let values = unpack_bits(data, quantity).ok_or_else(|| {
                        ProtocolError::Decode("coil data shorter than quantity".into())
                    })?;
                    WriteCommand::MultipleCoils { address, values }
                } else {
                    if byte_count != quantity * 2 {
                        return Err(ProtocolError::Decode(format!(
                            "byte count {byte_count} does not match {quantity} registers"
                        )));
                    }
                    let values = data
                        .chunks_exact(2)
                        .map(|word| RegisterValue::Unsigned(u16::from_be_bytes([word[0], word[1]])))
                        .collect();
                    WriteCommand::MultipleRegisters { address, values }
                }
            }
            other => {
                return Err(ProtocolError::Decode(format!(
                    "{other} is not a write command"
                )))
            }
        };
        command.validate().map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(command)
    }
}

/// 写确认 `[fc][address][value-or-quantity]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteConfirm {
    pub function: FunctionCode,
    pub address: u16,
    /// 单个写为回显的值，多个写为数量
    pub value: u16,
}

impl Pdu for WriteConfirm {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function.code());
        buf.put_u16(self.address);
        buf.put_u16(self.value);
    }

    fn decode(pdu: &[u8]) -> Result<Self, ProtocolError> {
        check_exception(pdu)?;
        let function = FunctionCode::try_from(pdu[0])?;
        if !function.is_write() {
            return Err(ProtocolError::Decode(format!(
                "{function} is not a write confirm"
            )));
        }
        expect_len(pdu, 5, "write confirm")?;
        Ok(Self {
            function,
            address: read_u16(pdu, 1),
            value: read_u16(pdu, 3),
        })
    }
}

/// 异常响应 `[fc | 0x80][code]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionResponse {
    /// 原始功能码（不含 0x80 标志）
    pub function: u8,
    pub code: u8,
}

impl Pdu for ExceptionResponse {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function | EXCEPTION_FLAG);
        buf.put_u8(self.code);
    }

    fn decode(pdu: &[u8]) -> Result<Self, ProtocolError> {
        match check_exception(pdu) {
            Err(ProtocolError::Exception { function, code }) => Ok(Self { function, code }),
            Err(e) => Err(e),
            Ok(()) => Err(ProtocolError::Decode("not an exception response".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_wire_format() {
        let request = ReadRequest::new(FunctionCode::ReadInputRegisters, 100, 3).unwrap();
        assert_eq!(&request.to_bytes()[..], &[0x04, 0x00, 0x64, 0x00, 0x03]);
        assert_eq!(ReadRequest::decode(&[0x04, 0x00, 0x64, 0x00, 0x03]).unwrap(), request);
        assert_eq!(request.expected_byte_count(), 6);
    }

    #[test]
    fn read_request_limits() {
        assert!(ReadRequest::new(FunctionCode::ReadHoldingRegisters, 0, 126).is_err());
        assert!(ReadRequest::new(FunctionCode::ReadHoldingRegisters, 0, 0).is_err());
        assert!(ReadRequest::new(FunctionCode::ReadCoils, 0, 2000).is_ok());
        assert!(ReadRequest::new(FunctionCode::WriteSingleRegister, 0, 1).is_err());
        assert!(ReadRequest::new(FunctionCode::ReadHoldingRegisters, 65535, 2).is_err());
    }

    #[test]
    fn read_response_byte_count_checked() {
        let response = ReadResponse::decode(&[0x03, 0x04, 0x00, 0x01, 0xFF, 0xFF]).unwrap();
        assert_eq!(response.data(), &[0x00, 0x01, 0xFF, 0xFF]);
        let request = ReadRequest::new(FunctionCode::ReadHoldingRegisters, 0, 2).unwrap();
        response.matches(&request).unwrap();

        let longer = ReadRequest::new(FunctionCode::ReadHoldingRegisters, 0, 3).unwrap();
        assert!(response.matches(&longer).is_err());

        assert!(matches!(
            ReadResponse::decode(&[0x03, 0x04, 0x00, 0x01]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn exception_surfaces_as_error() {
        let err = ReadResponse::decode(&[0x84, 0x02]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Exception {
                function: 0x04,
                code: 0x02
            }
        ));
        let exception = ExceptionResponse::decode(&[0x86, 0x03]).unwrap();
        assert_eq!(exception, ExceptionResponse { function: 0x06, code: 0x03 });
        assert_eq!(&exception.to_bytes()[..], &[0x86, 0x03]);
    }

    #[test]
    fn single_register_command_and_confirm() {
        let command = WriteCommand::SingleRegister {
            address: 102,
            value: RegisterValue::Unsigned(1),
        };
        let bytes = command.to_bytes();
        assert_eq!(&bytes[..], &[0x06, 0x00, 0x66, 0x00, 0x01]);
        assert_eq!(WriteCommand::decode(&bytes).unwrap(), command);

        let confirm = WriteConfirm::decode(&bytes).unwrap();
        assert_eq!(confirm, command.expected_confirm());
    }

    #[test]
    fn multiple_registers_command() {
        let command = WriteCommand::MultipleRegisters {
            address: 200,
            values: vec![RegisterValue::Unsigned(10), RegisterValue::Signed(-1)],
        };
        let bytes = command.to_bytes();
        assert_eq!(
            &bytes[..],
            &[0x10, 0x00, 0xC8, 0x00, 0x02, 0x04, 0x00, 0x0A, 0xFF, 0xFF]
        );
        let decoded = WriteCommand::decode(&bytes).unwrap();
        assert_eq!(decoded.quantity(), 2);
        assert_eq!(command.expected_confirm().value, 2);
    }

    #[test]
    fn coil_commands() {
        let single = WriteCommand::SingleCoil {
            address: 7,
            value: true,
        };
        assert_eq!(&single.to_bytes()[..], &[0x05, 0x00, 0x07, 0xFF, 0x00]);
        assert!(WriteCommand::decode(&[0x05, 0x00, 0x07, 0x12, 0x34]).is_err());

        let multiple = WriteCommand::MultipleCoils {
            address: 0,
            values: vec![true, false, true],
        };
        let bytes = multiple.to_bytes();
        assert_eq!(&bytes[..], &[0x0F, 0x00, 0x00, 0x00, 0x03, 0x01, 0x05]);
        assert_eq!(WriteCommand::decode(&bytes).unwrap(), multiple);
    }

    #[test]
    fn write_quantity_limits() {
        let empty = WriteCommand::MultipleRegisters {
            address: 0,
            values: Vec::new(),
        };
        assert!(empty.validate().is_err());
        let too_many = WriteCommand::MultipleRegisters {
            address: 0,
            values: vec![RegisterValue::Unsigned(0); 124],
        };
        assert!(too_many.validate().is_err());
    }
}
