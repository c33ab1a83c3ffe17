//! CRC16/MODBUS（多项式 0xA001 反射形式，初值 0xFFFF）

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// 计算 CRC16。
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// 追加 CRC（低字节在前）。
pub fn append_crc(frame: &mut BytesMut) {
    let crc = crc16(frame);
    frame.put_u16_le(crc);
}

/// 校验帧尾 CRC 是否与前面所有字节的计算值一致。
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    u16::from_le_bytes([trailer[0], trailer[1]]) == crc16(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // 01 03 00 00 00 0A -> C5 CD
        let crc = crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(crc, 0xCDC5);

        let mut frame = BytesMut::from(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A][..]);
        append_crc(&mut frame);
        assert_eq!(&frame[6..], &[0xC5, 0xCD]);
        assert!(verify_crc(&frame));
    }

    #[test]
    fn matches_shift_algorithm() {
        fn shift(data: &[u8]) -> u16 {
            let mut crc: u16 = 0xFFFF;
            for &byte in data {
                crc ^= u16::from(byte);
                for _ in 0..8 {
                    if crc & 1 != 0 {
                        crc = (crc >> 1) ^ 0xA001;
                    } else {
                        crc >>= 1;
                    }
                }
            }
            crc
        }

        let sample = [0x11, 0x06, 0x00, 0x66, 0x00, 0x01];
        assert_eq!(crc16(&sample), shift(&sample));
    }

    #[test]
    fn rejects_corrupted_trailer() {
        let mut frame = BytesMut::from(&[0x01, 0x06, 0x00, 0x66, 0x00, 0x01][..]);
        append_crc(&mut frame);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(!verify_crc(&frame));
        assert!(!verify_crc(&[0x01, 0x02]));
    }
}
