//! 传输帧：TCP（MBAP 头）与 RTU（从站号 + CRC16 帧尾）
//!
//! ```text
//! TCP: [transactionId:u16][protocolId:u16=0][length:u16][unitId:u8][fc][payload]
//! RTU: [slaveId:u8][fc][payload][crc16:u16 低字节在前]
//! ```

use crate::crc::{append_crc, verify_crc};
use crate::error::ProtocolError;
use crate::pdu::{Pdu, ReadRequest, ReadResponse, WriteCommand, WriteConfirm};
use bytes::{BufMut, Bytes, BytesMut};
use domain::TransportKind;

/// MBAP 头长度（含 unit id）
pub const MBAP_HEADER_LEN: usize = 7;
/// Modbus 协议标识
pub const MODBUS_PROTOCOL_ID: u16 = 0;
/// RTU 帧的最小长度：从站号 + 功能码 + CRC
pub const RTU_MIN_LEN: usize = 4;

/// MBAP 头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// unit id + PDU 的字节数
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < MBAP_HEADER_LEN {
            return Err(ProtocolError::Decode(format!(
                "tcp frame shorter than mbap header: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }
}

/// 帧头：TCP 携带事务号，RTU 携带从站号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    Tcp { transaction_id: u16, unit_id: u8 },
    Rtu { slave_id: u8 },
}

impl FrameHeader {
    pub fn kind(&self) -> TransportKind {
        match self {
            FrameHeader::Tcp { .. } => TransportKind::Tcp,
            FrameHeader::Rtu { .. } => TransportKind::Rtu,
        }
    }

    /// 从站号（TCP 为 unit id）
    pub fn slave_id(&self) -> u8 {
        match *self {
            FrameHeader::Tcp { unit_id, .. } => unit_id,
            FrameHeader::Rtu { slave_id } => slave_id,
        }
    }
}

/// 用帧头包装已编码的 PDU。
pub fn encode_adu(header: FrameHeader, pdu: &[u8]) -> Bytes {
    match header {
        FrameHeader::Tcp {
            transaction_id,
            unit_id,
        } => {
            let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
            buf.put_u16(transaction_id);
            buf.put_u16(MODBUS_PROTOCOL_ID);
            buf.put_u16((pdu.len() + 1) as u16);
            buf.put_u8(unit_id);
            buf.put_slice(pdu);
            buf.freeze()
        }
        FrameHeader::Rtu { slave_id } => {
            let mut buf = BytesMut::with_capacity(pdu.len() + 3);
            buf.put_u8(slave_id);
            buf.put_slice(pdu);
            append_crc(&mut buf);
            buf.freeze()
        }
    }
}

/// 校验帧头（MBAP 长度与协议号，或 RTU CRC），返回帧头与 PDU 切片。
pub fn split_adu(kind: TransportKind, bytes: &[u8]) -> Result<(FrameHeader, &[u8]), ProtocolError> {
    match kind {
        TransportKind::Tcp => {
            let mbap = MbapHeader::parse(bytes)?;
            if mbap.protocol_id != MODBUS_PROTOCOL_ID {
                return Err(ProtocolError::Decode(format!(
                    "unexpected protocol id {}",
                    mbap.protocol_id
                )));
            }
            if usize::from(mbap.length) != bytes.len() - 6 {
                return Err(ProtocolError::Decode(format!(
                    "mbap length {} but {} bytes follow",
                    mbap.length,
                    bytes.len() - 6
                )));
            }
            if bytes.len() == MBAP_HEADER_LEN {
                return Err(ProtocolError::Decode("tcp frame without pdu".into()));
            }
            Ok((
                FrameHeader::Tcp {
                    transaction_id: mbap.transaction_id,
                    unit_id: mbap.unit_id,
                },
                &bytes[MBAP_HEADER_LEN..],
            ))
        }
        TransportKind::Rtu => {
            if bytes.len() < RTU_MIN_LEN {
                return Err(ProtocolError::Decode(format!(
                    "rtu frame too short: {} bytes",
                    bytes.len()
                )));
            }
            if !verify_crc(bytes) {
                return Err(ProtocolError::Decode("rtu crc mismatch".into()));
            }
            Ok((
                FrameHeader::Rtu { slave_id: bytes[0] },
                &bytes[1..bytes.len() - 2],
            ))
        }
    }
}

/// 帧 = 帧头 + PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<P> {
    pub header: FrameHeader,
    pub pdu: P,
}

impl<P: Pdu> Frame<P> {
    pub fn new(header: FrameHeader, pdu: P) -> Self {
        Self { header, pdu }
    }

    pub fn encode(&self) -> Bytes {
        let mut pdu = BytesMut::with_capacity(16);
        self.pdu.encode(&mut pdu);
        encode_adu(self.header, &pdu)
    }

    /// 解码整帧；任何校验失败都不会留下部分结果。
    pub fn decode(kind: TransportKind, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (header, pdu) = split_adu(kind, bytes)?;
        Ok(Self {
            header,
            pdu: P::decode(pdu)?,
        })
    }
}

/// 读请求帧（TcpRequest / RtuRequest）
pub type RequestFrame = Frame<ReadRequest>;
/// 读响应帧（TcpResponse / RtuResponse）
pub type ResponseFrame = Frame<ReadResponse>;
/// 写命令帧（TcpCommand / RtuCommand）
pub type CommandFrame = Frame<WriteCommand>;
/// 写确认帧（TcpConfirm / RtuConfirm）
pub type ConfirmFrame = Frame<WriteConfirm>;
