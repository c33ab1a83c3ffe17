//! 点表与服务器描述（启动时加载一次，之后只读）。

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 与控制器的链路类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Tcp,
    Rtu,
}

impl TransportKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "rtu" | "serial" => Some(Self::Rtu),
            _ => None,
        }
    }
}

/// 串口校验位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl Parity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "n" => Some(Self::None),
            "even" | "e" => Some(Self::Even),
            "odd" | "o" => Some(Self::Odd),
            _ => None,
        }
    }
}

/// 串口参数（RTU）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDescriptor {
    /// 串口标识，如 `/dev/ttyS0`、`COM3`
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

/// 服务器描述：连接目标、从站号与采集周期。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub serial: Option<SerialDescriptor>,
    /// 从站 ID (1-247)
    pub slave_id: u8,
    /// 采集周期（秒）
    pub cycle_seconds: u64,
}

impl ServerDescriptor {
    pub fn cycle(&self) -> Duration {
        Duration::from_secs(self.cycle_seconds.max(1))
    }
}

/// 枚举型点位的状态描述。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumState {
    pub state: String,
    pub iec: String,
}

/// 分组内的单个采集地址。
///
/// `convert`：1 = 0~65535 无符号，2 = -32768~32767 有符号。
/// `point_type`：1 整数，2 小数，3 布尔，4 枚举，5 位状态。
/// `fnc_lab`：1 只读，2 脉冲按钮，3 保持按钮，4 数据下发，5 按位显示。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointLocation {
    pub address: u16,
    #[serde(default)]
    pub iec: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_convert")]
    pub convert: u8,
    #[serde(default, rename = "type")]
    pub point_type: Option<u8>,
    #[serde(default)]
    pub multiple: Option<u32>,
    #[serde(default)]
    pub show: Option<u32>,
    #[serde(default)]
    pub fnc_lab: Option<u8>,
    #[serde(default)]
    pub enums: Vec<EnumState>,
}

fn default_convert() -> u8 {
    1
}

impl PointLocation {
    pub fn is_signed(&self) -> bool {
        self.convert == 2
    }

    pub fn is_bitfield(&self) -> bool {
        self.point_type == Some(5) || self.fnc_lab == Some(5)
    }

    /// 功能标签大于 1 的点位可下发。
    pub fn is_writable(&self) -> bool {
        self.fnc_lab.is_some_and(|label| label > 1)
    }
}

/// 采集分组：[start, end] 区间内配置的地址。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub index: u32,
    pub start: u16,
    pub end: u16,
    /// 覆盖服务器默认的读功能码
    #[serde(default)]
    pub function_code: Option<u8>,
    #[serde(default)]
    pub locations: Vec<PointLocation>,
}

impl GroupDescriptor {
    pub fn contains(&self, address: u16) -> bool {
        (self.start..=self.end).contains(&address)
    }

    /// 区间内需要采集的地址。
    pub fn monitored(&self) -> impl Iterator<Item = &PointLocation> + '_ {
        self.locations
            .iter()
            .filter(|location| self.contains(location.address))
    }

    /// 配置在区间外、不会被采集的地址。
    pub fn out_of_range(&self) -> impl Iterator<Item = &PointLocation> + '_ {
        self.locations
            .iter()
            .filter(|location| !self.contains(location.address))
    }
}
