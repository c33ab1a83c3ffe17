//! 寄存器数据类型编解码
//!
//! 每个寄存器固定 2 字节、大端序。三种解释方式：
//! - 无符号字：0..=65535
//! - 有符号字：-32768..=32767（同样的字节按补码解释）
//! - 位状态字：第 i 位 = `(word >> i) & 1`，用于状态字点位
//!
//! 工程量缩放（multiple 除数、小数显示）属于显示层，不在这里处理。

use crate::error::ProtocolError;
use bytes::{Buf, BufMut};

/// 寄存器的解释方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    #[default]
    Unsigned,
    Signed,
    Bitfield,
}

/// 解码后的单个寄存器值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    Unsigned(u16),
    Signed(i16),
    Bitfield(u16),
}

impl RegisterValue {
    /// 按原始字解释为指定类型。
    pub fn from_word(data_type: DataType, word: u16) -> Self {
        match data_type {
            DataType::Unsigned => RegisterValue::Unsigned(word),
            DataType::Signed => RegisterValue::Signed(word as i16),
            DataType::Bitfield => RegisterValue::Bitfield(word),
        }
    }

    /// 从字节序列中第 `word_offset` 个寄存器解码。
    pub fn decode(
        data_type: DataType,
        bytes: &[u8],
        word_offset: usize,
    ) -> Result<Self, ProtocolError> {
        let start = word_offset * 2;
        match bytes.get(start..start + 2) {
            Some(raw) => Ok(Self::from_word(
                data_type,
                u16::from_be_bytes([raw[0], raw[1]]),
            )),
            None => Err(ProtocolError::Decode(format!(
                "register offset {word_offset} beyond {} data bytes",
                bytes.len()
            ))),
        }
    }

    /// 从字节流读取下一个寄存器。
    pub fn decode_from<B: Buf>(data_type: DataType, buf: &mut B) -> Result<Self, ProtocolError> {
        if buf.remaining() < 2 {
            return Err(ProtocolError::Decode(format!(
                "need 2 bytes for a register, {} left",
                buf.remaining()
            )));
        }
        Ok(Self::from_word(data_type, buf.get_u16()))
    }

    /// 写入 2 字节大端表示。
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.word());
    }

    pub fn to_be_bytes(&self) -> [u8; 2] {
        self.word().to_be_bytes()
    }

    /// 线路上的原始字
    pub fn word(&self) -> u16 {
        match *self {
            RegisterValue::Unsigned(value) => value,
            RegisterValue::Signed(value) => value as u16,
            RegisterValue::Bitfield(value) => value,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            RegisterValue::Unsigned(_) => DataType::Unsigned,
            RegisterValue::Signed(_) => DataType::Signed,
            RegisterValue::Bitfield(_) => DataType::Bitfield,
        }
    }

    /// 数值表示（位状态字取原始字）。
    pub fn as_i64(&self) -> i64 {
        match *self {
            RegisterValue::Unsigned(value) => i64::from(value),
            RegisterValue::Signed(value) => i64::from(value),
            RegisterValue::Bitfield(value) => i64::from(value),
        }
    }

    /// 16 个位标志，下标 i 对应第 i 位。
    pub fn bits(&self) -> [bool; 16] {
        let word = self.word();
        let mut flags = [false; 16];
        for (i, flag) in flags.iter_mut().enumerate() {
            *flag = (word >> i) & 1 == 1;
        }
        flags
    }

    /// 由位标志组装位状态字，超过 16 个的部分忽略。
    pub fn from_bits(flags: &[bool]) -> Self {
        let word = flags
            .iter()
            .take(16)
            .enumerate()
            .filter(|(_, flag)| **flag)
            .fold(0u16, |word, (i, _)| word | (1 << i));
        RegisterValue::Bitfield(word)
    }

    /// 负数按有符号字、其余按无符号字；超出 -32768..=65535 返回 None。
    pub fn from_i32(value: i32) -> Option<Self> {
        if (i32::from(i16::MIN)..0).contains(&value) {
            Some(RegisterValue::Signed(value as i16))
        } else if (0..=i32::from(u16::MAX)).contains(&value) {
            Some(RegisterValue::Unsigned(value as u16))
        } else {
            None
        }
    }
}

/// 将布尔量按 Modbus 规则打包（首个线圈位于首字节最低位）。
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; values.len().div_ceil(8)];
    for (i, value) in values.iter().enumerate() {
        if *value {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

/// 解包前 `count` 个布尔量；字节不足时返回 None。
pub fn unpack_bits(bytes: &[u8], count: usize) -> Option<Vec<bool>> {
    if bytes.len() < count.div_ceil(8) {
        return None;
    }
    Some(
        (0..count)
            .map(|i| (bytes[i / 8] >> (i % 8)) & 1 == 1)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn unsigned_round_trip_full_range() {
        for raw in 0..=u16::MAX {
            let value = RegisterValue::Unsigned(raw);
            let bytes = value.to_be_bytes();
            assert_eq!(
                RegisterValue::decode(DataType::Unsigned, &bytes, 0).unwrap(),
                value
            );
        }
    }

    #[test]
    fn signed_round_trip_full_range() {
        for raw in i16::MIN..=i16::MAX {
            let value = RegisterValue::Signed(raw);
            let mut buf = BytesMut::new();
            value.encode(&mut buf);
            let mut frozen = buf.freeze();
            assert_eq!(
                RegisterValue::decode_from(DataType::Signed, &mut frozen).unwrap(),
                value
            );
        }
    }

    #[test]
    fn same_bytes_two_interpretations() {
        let bytes = [0xFF, 0xFE];
        assert_eq!(
            RegisterValue::decode(DataType::Unsigned, &bytes, 0).unwrap(),
            RegisterValue::Unsigned(65534)
        );
        assert_eq!(
            RegisterValue::decode(DataType::Signed, &bytes, 0).unwrap(),
            RegisterValue::Signed(-2)
        );
    }

    #[test]
    fn decode_at_word_offset() {
        let bytes = [0x00, 0x01, 0x12, 0x34];
        assert_eq!(
            RegisterValue::decode(DataType::Unsigned, &bytes, 1).unwrap(),
            RegisterValue::Unsigned(0x1234)
        );
        assert!(RegisterValue::decode(DataType::Unsigned, &bytes, 2).is_err());
    }

    #[test]
    fn bitfield_flags() {
        let value = RegisterValue::decode(DataType::Bitfield, &[0x80, 0x05], 0).unwrap();
        let bits = value.bits();
        assert!(bits[0]);
        assert!(!bits[1]);
        assert!(bits[2]);
        assert!(bits[15]);
        assert_eq!(RegisterValue::from_bits(&bits), value);
    }

    #[test]
    fn from_i32_ranges() {
        assert_eq!(RegisterValue::from_i32(-1), Some(RegisterValue::Signed(-1)));
        assert_eq!(
            RegisterValue::from_i32(-32768),
            Some(RegisterValue::Signed(i16::MIN))
        );
        assert_eq!(
            RegisterValue::from_i32(65535),
            Some(RegisterValue::Unsigned(65535))
        );
        assert_eq!(RegisterValue::from_i32(65536), None);
        assert_eq!(RegisterValue::from_i32(-32769), None);
    }

    #[test]
    fn bit_packing() {
        let values = [true, false, true, true, false, false, false, false, true];
        let packed = pack_bits(&values);
        assert_eq!(packed, vec![0b0000_1101, 0b0000_0001]);
        assert_eq!(unpack_bits(&packed, values.len()).unwrap(), values.to_vec());
        assert!(unpack_bits(&packed[..1], 9).is_none());
    }
}
