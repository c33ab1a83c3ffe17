//! 字节流切帧（tokio-util codec）
//!
//! 只负责切出完整的一帧并给出关联键；CRC、协议号、长度与功能码的一致性
//! 由拿到该帧的调用方解码时校验，坏帧只让它应答的那次调用失败。

use crate::correlator::CorrelationKey;
use crate::error::ProtocolError;
use crate::function_code::EXCEPTION_FLAG;
use bytes::{Buf, Bytes, BytesMut};
use domain::TransportKind;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// MBAP length 字段的合法范围（unit id + 至少功能码；最大 ADU 260 字节）
const TCP_LENGTH_RANGE: std::ops::RangeInclusive<usize> = 2..=254;

/// 解码方向：主站解析响应，从站解析请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// 切出的完整帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub key: CorrelationKey,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy)]
pub struct AduCodec {
    kind: TransportKind,
    role: Role,
}

impl AduCodec {
    pub fn new(kind: TransportKind, role: Role) -> Self {
        Self { kind, role }
    }

    fn decode_tcp(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, ProtocolError> {
        if src.len() < 6 {
            return Ok(None);
        }
        let length = usize::from(u16::from_be_bytes([src[4], src[5]]));
        if !TCP_LENGTH_RANGE.contains(&length) {
            return Err(ProtocolError::Decode(format!(
                "mbap length {length} out of range, stream out of sync"
            )));
        }
        let total = 6 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let transaction_id = u16::from_be_bytes([src[0], src[1]]);
        Ok(Some(RawFrame {
            key: CorrelationKey::Transaction(transaction_id),
            bytes: src.split_to(total).freeze(),
        }))
    }

    /// RTU 帧长度由功能码推导；`None` 表示还需要更多字节。
    fn rtu_frame_len(&self, src: &BytesMut) -> Option<Result<usize, u8>> {
        let function = src[1];
        let len = match self.role {
            Role::Master => match function {
                f if f & EXCEPTION_FLAG != 0 => 5,
                0x01..=0x04 => 5 + usize::from(*src.get(2)?),
                0x05 | 0x06 | 0x0F | 0x10 => 8,
                other => return Some(Err(other)),
            },
            Role::Slave => match function {
                0x01..=0x06 => 8,
                0x0F | 0x10 => 9 + usize::from(*src.get(6)?),
                other => return Some(Err(other)),
            },
        };
        Some(Ok(len))
    }

    fn decode_rtu(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, ProtocolError> {
        loop {
            if src.len() < 2 {
                return Ok(None);
            }
            let total = match self.rtu_frame_len(src) {
                None => return Ok(None),
                Some(Ok(total)) => total,
                Some(Err(function)) => {
                    warn!(target: "hmi.protocol", function, "rtu_resync_unknown_function");
                    hmi_telemetry::record_decode_error();
                    src.advance(1);
                    continue;
                }
            };
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            let function = src[1] & !EXCEPTION_FLAG;
            return Ok(Some(RawFrame {
                key: CorrelationKey::Function(function),
                bytes: src.split_to(total).freeze(),
            }));
        }
    }
}

impl Decoder for AduCodec {
    type Item = RawFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, ProtocolError> {
        match self.kind {
            TransportKind::Tcp => self.decode_tcp(src),
            TransportKind::Rtu => self.decode_rtu(src),
        }
    }
}

/// 出站帧已由帧模型编码完毕，这里原样写出。
impl Encoder<Bytes> for AduCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
