//! 读请求描述：一段连续地址区间 + 区间内实际配置的点位
//!
//! 构建后不可变。PDU 与完整 RTU 帧在首次使用时生成并缓存；TCP 帧每次发送都需要
//! 新的事务号，只缓存 PDU，发送时再加 MBAP 头。

use crate::codec::{DataType, RegisterValue};
use crate::error::ProtocolError;
use crate::frame::{encode_adu, FrameHeader};
use crate::function_code::FunctionCode;
use crate::pdu::{Pdu, ReadRequest, ReadResponse};
use bytes::Bytes;
use std::sync::OnceLock;

/// 解码后的点位值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointValue {
    Register(RegisterValue),
    Coil(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Points {
    Registers(Vec<(u16, DataType)>),
    Coils(Vec<u16>),
}

#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    slave_id: u8,
    request: ReadRequest,
    points: Points,
    pdu: OnceLock<Bytes>,
    rtu_frame: OnceLock<Bytes>,
}

fn sorted_unique<T: Copy>(mut items: Vec<(u16, T)>) -> Vec<(u16, T)> {
    items.sort_by_key(|(address, _)| *address);
    items.dedup_by_key(|(address, _)| *address);
    items
}

impl RequestDescriptor {
    /// 寄存器读（功能码 3/4）。区间从最小地址到最大地址。
    pub fn registers(
        slave_id: u8,
        function: FunctionCode,
        points: Vec<(u16, DataType)>,
    ) -> Result<Self, ProtocolError> {
        if !matches!(
            function,
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters
        ) {
            return Err(ProtocolError::InvalidRequest(format!(
                "{function} cannot read registers"
            )));
        }
        let points = sorted_unique(points);
        let request = span_request(function, points.iter().map(|(address, _)| *address))?;
        Ok(Self::build(slave_id, request, Points::Registers(points)))
    }

    /// 线圈/离散输入读（功能码 1/2）。
    pub fn coils(
        slave_id: u8,
        function: FunctionCode,
        addresses: Vec<u16>,
    ) -> Result<Self, ProtocolError> {
        if !matches!(
            function,
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs
        ) {
            return Err(ProtocolError::InvalidRequest(format!(
                "{function} cannot read coils"
            )));
        }
        let addresses: Vec<u16> = sorted_unique(addresses.into_iter().map(|a| (a, ())).collect())
            .into_iter()
            .map(|(address, _)| address)
            .collect();
        let request = span_request(function, addresses.iter().copied())?;
        Ok(Self::build(slave_id, request, Points::Coils(addresses)))
    }

    fn build(slave_id: u8, request: ReadRequest, points: Points) -> Self {
        Self {
            slave_id,
            request,
            points,
            pdu: OnceLock::new(),
            rtu_frame: OnceLock::new(),
        }
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn function(&self) -> FunctionCode {
        self.request.function()
    }

    pub fn start(&self) -> u16 {
        self.request.start()
    }

    pub fn quantity(&self) -> u16 {
        self.request.quantity()
    }

    pub fn read_request(&self) -> &ReadRequest {
        &self.request
    }

    /// 实际配置的地址（升序）
    pub fn addresses(&self) -> Vec<u16> {
        match &self.points {
            Points::Registers(points) => points.iter().map(|(address, _)| *address).collect(),
            Points::Coils(addresses) => addresses.clone(),
        }
    }

    pub fn pdu(&self) -> &Bytes {
        self.pdu.get_or_init(|| self.request.to_bytes())
    }

    pub fn rtu_frame(&self) -> &Bytes {
        self.rtu_frame.get_or_init(|| {
            encode_adu(
                FrameHeader::Rtu {
                    slave_id: self.slave_id,
                },
                self.pdu(),
            )
        })
    }

    pub fn tcp_frame(&self, transaction_id: u16) -> Bytes {
        encode_adu(
            FrameHeader::Tcp {
                transaction_id,
                unit_id: self.slave_id,
            },
            self.pdu(),
        )
    }

    /// 按配置的地址解码响应；区间内未配置的寄存器被读取但丢弃。
    pub fn decode_values(
        &self,
        response: &ReadResponse,
    ) -> Result<Vec<(u16, PointValue)>, ProtocolError> {
        response.matches(&self.request)?;
        let start = self.request.start();
        match &self.points {
            Points::Registers(points) => points
                .iter()
                .map(|(address, data_type)| {
                    let offset = usize::from(address - start);
                    RegisterValue::decode(*data_type, response.data(), offset)
                        .map(|value| (*address, PointValue::Register(value)))
                })
                .collect(),
            Points::Coils(addresses) => addresses
                .iter()
                .map(|address| {
                    response
                        .bit(usize::from(address - start))
                        .map(|bit| (*address, PointValue::Coil(bit)))
                        .ok_or_else(|| {
                            ProtocolError::Decode(format!("coil {address} missing in response"))
                        })
                })
                .collect(),
        }
    }
}

fn span_request(
    function: FunctionCode,
    mut addresses: impl Iterator<Item = u16>,
) -> Result<ReadRequest, ProtocolError> {
    let first = addresses
        .next()
        .ok_or_else(|| ProtocolError::InvalidRequest("request without addresses".into()))?;
    let last = addresses.last().unwrap_or(first);
    let span = u32::from(last - first) + 1;
    let quantity = u16::try_from(span)
        .map_err(|_| ProtocolError::InvalidRequest(format!("span {span} too large")))?;
    ReadRequest::new(function, first, quantity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_span_covers_first_to_last() {
        let descriptor = RequestDescriptor::registers(
            1,
            FunctionCode::ReadInputRegisters,
            vec![(102, DataType::Unsigned), (100, DataType::Signed)],
        )
        .unwrap();
        assert_eq!(descriptor.start(), 100);
        assert_eq!(descriptor.quantity(), 3);
        assert_eq!(descriptor.addresses(), vec![100, 102]);
        assert_eq!(&descriptor.pdu()[..], &[0x04, 0x00, 0x64, 0x00, 0x03]);
    }

    #[test]
    fn rejects_wrong_function_codes() {
        assert!(RequestDescriptor::registers(
            1,
            FunctionCode::ReadCoils,
            vec![(1, DataType::Unsigned)]
        )
        .is_err());
        assert!(RequestDescriptor::coils(1, FunctionCode::ReadHoldingRegisters, vec![1]).is_err());
        assert!(RequestDescriptor::coils(1, FunctionCode::WriteSingleCoil, vec![1]).is_err());
        assert!(RequestDescriptor::registers(1, FunctionCode::ReadHoldingRegisters, vec![]).is_err());
    }

    #[test]
    fn rtu_frame_is_cached() {
        let descriptor = RequestDescriptor::registers(
            1,
            FunctionCode::ReadHoldingRegisters,
            vec![(0, DataType::Unsigned), (9, DataType::Unsigned)],
        )
        .unwrap();
        let first = descriptor.rtu_frame().clone();
        assert_eq!(&first[..], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
        assert_eq!(descriptor.rtu_frame().as_ptr(), first.as_ptr());

        let tcp = descriptor.tcp_frame(7);
        assert_eq!(&tcp[..2], &[0x00, 0x07]);
        assert_eq!(&tcp[7..], &descriptor.pdu()[..]);
    }

    #[test]
    fn decode_values_drops_gap_registers() {
        let descriptor = RequestDescriptor::registers(
            1,
            FunctionCode::ReadInputRegisters,
            vec![(100, DataType::Signed), (102, DataType::Bitfield)],
        )
        .unwrap();
        let response = ReadResponse::new(
            FunctionCode::ReadInputRegisters,
            Bytes::from_static(&[0xFF, 0xFF, 0x00, 0x05, 0x00, 0x03]),
        );
        let values = descriptor.decode_values(&response).unwrap();
        assert_eq!(
            values,
            vec![
                (100, PointValue::Register(RegisterValue::Signed(-1))),
                (102, PointValue::Register(RegisterValue::Bitfield(3))),
            ]
        );
    }

    #[test]
    fn decode_coils() {
        let descriptor =
            RequestDescriptor::coils(1, FunctionCode::ReadCoils, vec![10, 12]).unwrap();
        let response =
            ReadResponse::new(FunctionCode::ReadCoils, Bytes::from_static(&[0b0000_0100]));
        let values = descriptor.decode_values(&response).unwrap();
        assert_eq!(
            values,
            vec![(10, PointValue::Coil(false)), (12, PointValue::Coil(true))]
        );
    }

    #[test]
    fn short_response_is_rejected() {
        let descriptor = RequestDescriptor::registers(
            1,
            FunctionCode::ReadInputRegisters,
            vec![(100, DataType::Unsigned), (101, DataType::Unsigned)],
        )
        .unwrap();
        let response =
            ReadResponse::new(FunctionCode::ReadInputRegisters, Bytes::from_static(&[0, 1]));
        assert!(descriptor.decode_values(&response).is_err());
    }
}
