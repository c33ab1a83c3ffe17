use serde::Serialize;
use std::collections::HashMap;

/// 一次采集得到的点位值。
///
/// 数值型寄存器统一为整数；状态字按位展开为 16 个布尔量（第 i 位位于下标 i）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PolledValue {
    Number(i64),
    Bits(Vec<bool>),
}

impl PolledValue {
    /// 数值（位状态返回 None）。
    pub fn as_number(&self) -> Option<i64> {
        match self {
            PolledValue::Number(value) => Some(*value),
            PolledValue::Bits(_) => None,
        }
    }

    /// 位状态（数值返回 None）。
    pub fn as_bits(&self) -> Option<&[bool]> {
        match self {
            PolledValue::Number(_) => None,
            PolledValue::Bits(bits) => Some(bits),
        }
    }

    /// 供显示层缓存使用的 JSON 表示：数值为数字，位状态为布尔数组。
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PolledValue::Number(value) => serde_json::Value::from(*value),
            PolledValue::Bits(bits) => serde_json::Value::from(bits.clone()),
        }
    }
}

/// 地址 -> 采集值。
///
/// 每个成功的采集周期整体替换；发布后为只读快照。
pub type PolledValueMap = HashMap<u16, PolledValue>;
