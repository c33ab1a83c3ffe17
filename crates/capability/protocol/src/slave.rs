//! 从站应答
//!
//! 解码主站发来的请求/命令，对本地数据容器读写后构造响应/确认；
//! 数据容器报告的领域错误码经异常码表映射为 Modbus 异常响应。

use crate::adu_codec::{AduCodec, Role};
use crate::codec::pack_bits;
use crate::error::ProtocolError;
use crate::frame::{encode_adu, split_adu, FrameHeader};
use crate::function_code::FunctionCode;
use crate::pdu::{ExceptionResponse, Pdu, ReadRequest, ReadResponse, WriteCommand};
use bytes::Bytes;
use domain::TransportKind;
use futures::{SinkExt, StreamExt};
use hmi_telemetry::hex;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// 领域错误码：非法数据地址
pub const ILLEGAL_DATA_ADDRESS: u32 = 3004;

/// Modbus 异常码
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// 数据容器报告的领域错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("slave data error {code}: {message}")]
pub struct SlaveDataError {
    pub code: u32,
    pub message: String,
}

impl SlaveDataError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn illegal_address(address: u16) -> Self {
        Self::new(ILLEGAL_DATA_ADDRESS, format!("address {address} not mapped"))
    }
}

/// 从站本地数据
pub trait SlaveDataContainer: Send + Sync {
    /// 读取 `[start, start + quantity)`，返回响应数据字节（寄存器大端、线圈按位打包）
    fn read(&self, function: FunctionCode, start: u16, quantity: u16)
        -> Result<Bytes, SlaveDataError>;

    fn write(&self, command: &WriteCommand) -> Result<(), SlaveDataError>;
}

/// 内存数据容器：保持寄存器、输入寄存器、线圈、离散输入。读取未设置的地址报 3004。
#[derive(Debug, Default)]
pub struct InMemoryDataContainer {
    holding: RwLock<HashMap<u16, u16>>,
    input: RwLock<HashMap<u16, u16>>,
    coils: RwLock<HashMap<u16, bool>>,
    discrete: RwLock<HashMap<u16, bool>>,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryDataContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_holding(&self, address: u16, value: u16) {
        write_lock(&self.holding).insert(address, value);
    }

    pub fn set_input(&self, address: u16, value: u16) {
        write_lock(&self.input).insert(address, value);
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        write_lock(&self.coils).insert(address, value);
    }

    pub fn set_discrete(&self, address: u16, value: bool) {
        write_lock(&self.discrete).insert(address, value);
    }

    pub fn holding(&self, address: u16) -> Option<u16> {
        read_lock(&self.holding).get(&address).copied()
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        read_lock(&self.coils).get(&address).copied()
    }

    fn words(
        map: &RwLock<HashMap<u16, u16>>,
        start: u16,
        quantity: u16,
    ) -> Result<Bytes, SlaveDataError> {
        let map = read_lock(map);
        let mut data = Vec::with_capacity(usize::from(quantity) * 2);
        for address in (0..quantity).map(|i| start.wrapping_add(i)) {
            let word = map
                .get(&address)
                .ok_or_else(|| SlaveDataError::illegal_address(address))?;
            data.extend_from_slice(&word.to_be_bytes());
        }
        Ok(Bytes::from(data))
    }

    fn bits(
        map: &RwLock<HashMap<u16, bool>>,
        start: u16,
        quantity: u16,
    ) -> Result<Bytes, SlaveDataError> {
        let map = read_lock(map);
        let values = (0..quantity)
            .map(|i| start.wrapping_add(i))
            .map(|address| {
                map.get(&address)
                    .copied()
                    .ok_or_else(|| SlaveDataError::illegal_address(address))
            })
            .collect::<Result<Vec<bool>, _>>()?;
        Ok(Bytes::from(pack_bits(&values)))
    }
}

impl SlaveDataContainer for InMemoryDataContainer {
    fn read(
        &self,
        function: FunctionCode,
        start: u16,
        quantity: u16,
    ) -> Result<Bytes, SlaveDataError> {
        match function {
            FunctionCode::ReadHoldingRegisters => Self::words(&self.holding, start, quantity),
            FunctionCode::ReadInputRegisters => Self::words(&self.input, start, quantity),
            FunctionCode::ReadCoils => Self::bits(&self.coils, start, quantity),
            FunctionCode::ReadDiscreteInputs => Self::bits(&self.discrete, start, quantity),
            other => Err(SlaveDataError::new(
                ILLEGAL_DATA_ADDRESS,
                format!("{other} is not readable"),
            )),
        }
    }

    fn write(&self, command: &WriteCommand) -> Result<(), SlaveDataError> {
        match command {
            WriteCommand::SingleCoil { address, value } => {
                write_lock(&self.coils).insert(*address, *value);
            }
            WriteCommand::SingleRegister { address, value } => {
                write_lock(&self.holding).insert(*address, value.word());
            }
            WriteCommand::MultipleCoils { address, values } => {
                let mut coils = write_lock(&self.coils);
                for (i, value) in values.iter().enumerate() {
                    coils.insert(address.wrapping_add(i as u16), *value);
                }
            }
            WriteCommand::MultipleRegisters { address, values } => {
                let mut holding = write_lock(&self.holding);
                for (i, value) in values.iter().enumerate() {
                    holding.insert(address.wrapping_add(i as u16), value.word());
                }
            }
        }
        Ok(())
    }
}

/// 领域错误码 -> Modbus 异常码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionTable {
    codes: HashMap<u32, u8>,
}

impl Default for ExceptionTable {
    fn default() -> Self {
        Self::empty().with(ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_ADDRESS)
    }
}

impl ExceptionTable {
    pub fn empty() -> Self {
        Self {
            codes: HashMap::new(),
        }
    }

    pub fn with(mut self, domain_code: u32, exception: u8) -> Self {
        self.codes.insert(domain_code, exception);
        self
    }

    pub fn lookup(&self, domain_code: u32) -> Option<u8> {
        self.codes.get(&domain_code).copied()
    }
}

/// 从站应答器
pub struct SlaveResponder {
    kind: TransportKind,
    slave_id: u8,
    container: Arc<dyn SlaveDataContainer>,
    exceptions: ExceptionTable,
}

impl SlaveResponder {
    pub fn new(kind: TransportKind, slave_id: u8, container: Arc<dyn SlaveDataContainer>) -> Self {
        Self {
            kind,
            slave_id,
            container,
            exceptions: ExceptionTable::default(),
        }
    }

    pub fn with_exceptions(mut self, exceptions: ExceptionTable) -> Self {
        self.exceptions = exceptions;
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// 处理一帧请求，返回要回写的帧；`None` 表示不应答。
    pub fn respond(&self, raw: &[u8]) -> Option<Bytes> {
        let (header, pdu) = match split_adu(self.kind, raw) {
            Ok(parts) => parts,
            Err(e) => {
                hmi_telemetry::record_decode_error();
                warn!(target: "hmi.slave", frame = %hex(raw), error = %e, "request_decode_failed");
                return None;
            }
        };
        if let FrameHeader::Rtu { slave_id } = header {
            if slave_id != self.slave_id {
                debug!(target: "hmi.slave", slave_id, "request_for_other_slave_ignored");
                return None;
            }
        }

        let reply = self.handle_pdu(pdu)?;
        hmi_telemetry::record_slave_request_served();
        Some(encode_adu(header, &reply))
    }

    fn handle_pdu(&self, pdu: &[u8]) -> Option<Bytes> {
        let raw_function = *pdu.first()?;
        let Some(function) = FunctionCode::from_u8(raw_function) else {
            debug!(target: "hmi.slave", function = raw_function, "illegal_function");
            return Some(exception(raw_function, EXCEPTION_ILLEGAL_FUNCTION));
        };

        let outcome = if function.is_read() {
            match ReadRequest::decode(pdu) {
                Ok(request) => self
                    .container
                    .read(function, request.start(), request.quantity())
                    .map(|data| ReadResponse::new(function, data).to_bytes()),
                Err(e) => return Some(self.malformed(raw_function, e)),
            }
        } else {
            match WriteCommand::decode(pdu) {
                Ok(command) => self
                    .container
                    .write(&command)
                    .map(|()| command.expected_confirm().to_bytes()),
                Err(e) => return Some(self.malformed(raw_function, e)),
            }
        };

        match outcome {
            Ok(reply) => Some(reply),
            Err(e) => match self.exceptions.lookup(e.code) {
                Some(code) => {
                    debug!(
                        target: "hmi.slave",
                        function = raw_function,
                        domain_code = e.code,
                        code,
                        "exception_reply"
                    );
                    Some(exception(raw_function, code))
                }
                None => {
                    warn!(
                        target: "hmi.slave",
                        function = raw_function,
                        error = %e,
                        "unmapped_slave_error_no_reply"
                    );
                    None
                }
            },
        }
    }

    fn malformed(&self, function: u8, error: ProtocolError) -> Bytes {
        warn!(target: "hmi.slave", function, error = %error, "malformed_request");
        exception(function, EXCEPTION_ILLEGAL_DATA_VALUE)
    }
}

fn exception(function: u8, code: u8) -> Bytes {
    ExceptionResponse { function, code }.to_bytes()
}

/// 在任意双向字节流上运行从站应答，直到对端关闭。
pub async fn serve_stream<S>(stream: S, responder: Arc<SlaveResponder>) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, AduCodec::new(responder.kind(), Role::Slave));
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        debug!(target: "hmi.slave", key = %frame.key, frame = %hex(&frame.bytes), "request_received");
        if let Some(reply) = responder.respond(&frame.bytes) {
            framed.send(reply).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RegisterValue;
    use crate::frame::MBAP_HEADER_LEN;

    fn responder(kind: TransportKind) -> (Arc<InMemoryDataContainer>, SlaveResponder) {
        let container = Arc::new(InMemoryDataContainer::new());
        container.set_input(100, 7);
        container.set_input(101, 0xFFFF);
        let responder = SlaveResponder::new(kind, 1, container.clone());
        (container, responder)
    }

    fn tcp_request(pdu: &[u8]) -> Bytes {
        encode_adu(
            FrameHeader::Tcp {
                transaction_id: 42,
                unit_id: 1,
            },
            pdu,
        )
    }

    #[test]
    fn answers_read_request() {
        let (_, responder) = responder(TransportKind::Tcp);
        let reply = responder
            .respond(&tcp_request(&[0x04, 0x00, 0x64, 0x00, 0x02]))
            .unwrap();
        assert_eq!(&reply[..2], &[0x00, 42]);
        assert_eq!(
            &reply[MBAP_HEADER_LEN..],
            &[0x04, 0x04, 0x00, 0x07, 0xFF, 0xFF]
        );
    }

    #[test]
    fn unset_address_yields_illegal_data_address() {
        let (_, responder) = responder(TransportKind::Tcp);
        let reply = responder
            .respond(&tcp_request(&[0x04, 0x00, 0x64, 0x00, 0x03]))
            .unwrap();
        assert_eq!(&reply[MBAP_HEADER_LEN..], &[0x84, 0x02]);
    }

    #[test]
    fn unknown_function_yields_illegal_function() {
        let (_, responder) = responder(TransportKind::Tcp);
        let reply = responder.respond(&tcp_request(&[0x2B, 0x0E, 0x01])).unwrap();
        assert_eq!(&reply[MBAP_HEADER_LEN..], &[0xAB, 0x01]);
    }

    #[test]
    fn unmapped_domain_code_gets_no_reply() {
        let container = Arc::new(InMemoryDataContainer::new());
        let responder = SlaveResponder::new(TransportKind::Tcp, 1, container)
            .with_exceptions(ExceptionTable::empty());
        assert!(responder
            .respond(&tcp_request(&[0x03, 0x00, 0x00, 0x00, 0x01]))
            .is_none());
    }

    #[test]
    fn write_command_is_applied_and_confirmed() {
        let (container, responder) = responder(TransportKind::Rtu);
        let request = encode_adu(
            FrameHeader::Rtu { slave_id: 1 },
            &WriteCommand::SingleRegister {
                address: 102,
                value: RegisterValue::Unsigned(1),
            }
            .to_bytes(),
        );
        let reply = responder.respond(&request).unwrap();
        assert_eq!(reply, request);
        assert_eq!(container.holding(102), Some(1));
    }

    #[test]
    fn rtu_request_for_other_slave_is_ignored() {
        let (_, responder) = responder(TransportKind::Rtu);
        let request = encode_adu(
            FrameHeader::Rtu { slave_id: 9 },
            &[0x04, 0x00, 0x64, 0x00, 0x01],
        );
        assert!(responder.respond(&request).is_none());
    }

    #[test]
    fn corrupted_rtu_request_is_dropped() {
        let (_, responder) = responder(TransportKind::Rtu);
        let mut request =
            encode_adu(FrameHeader::Rtu { slave_id: 1 }, &[0x04, 0x00, 0x64, 0x00, 0x01]).to_vec();
        request[2] ^= 0xFF;
        assert!(responder.respond(&request).is_none());
    }

    #[test]
    fn coils_are_packed() {
        let container = InMemoryDataContainer::new();
        container.set_coil(0, true);
        container.set_coil(1, false);
        container.set_coil(2, true);
        let data = container.read(FunctionCode::ReadCoils, 0, 3).unwrap();
        assert_eq!(&data[..], &[0b101]);
    }
}
