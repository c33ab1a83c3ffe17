//! 引擎运行配置加载。
//!
//! - 连接、采集与从站参数来自 `HMI_*` 环境变量（二进制启动时先加载 `.env`）。
//! - 点表（采集分组列表）是一份 JSON 文档，启动时加载一次。

use domain::{GroupDescriptor, Parity, SerialDescriptor, ServerDescriptor, TransportKind};
use serde::Deserialize;
use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse point table {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// 从站服务器监听参数（仅在配置了监听地址时启用）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveListenConfig {
    pub listen_addr: String,
    pub allow: Vec<IpAddr>,
    pub max_connections: usize,
}

/// 引擎运行配置。
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub server: ServerDescriptor,
    /// 首次采集前的延迟
    pub poll_delay: Duration,
    pub response_timeout: Duration,
    pub connect_timeout: Duration,
    /// 采集失败后是否继续调度
    pub restart_on_failure: bool,
    pub point_table: PathBuf,
    pub slave: Option<SlaveListenConfig>,
}

impl EngineConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let transport = match read_optional("HMI_TRANSPORT") {
            Some(value) => TransportKind::parse(&value)
                .ok_or_else(|| ConfigError::Invalid("HMI_TRANSPORT".to_string(), value))?,
            None => TransportKind::Tcp,
        };
        let host = env::var("HMI_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = read_with_default("HMI_PORT", 502u16)?;
        let serial = match transport {
            TransportKind::Rtu => Some(read_serial()?),
            TransportKind::Tcp => None,
        };
        let slave_id = read_with_default("HMI_SLAVE_ID", 1u8)?;
        let cycle_seconds = read_with_default("HMI_POLL_CYCLE_SECONDS", 1u64)?;
        let poll_delay = Duration::from_millis(read_with_default("HMI_POLL_DELAY_MS", 500u64)?);
        let response_timeout =
            Duration::from_millis(read_with_default("HMI_RESPONSE_TIMEOUT_MS", 5000u64)?);
        let connect_timeout =
            Duration::from_millis(read_with_default("HMI_CONNECT_TIMEOUT_MS", 5000u64)?);
        let restart_on_failure = read_bool_with_default("HMI_RESTART_ON_FAILURE", false);
        let point_table = read_optional("HMI_POINT_TABLE")
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::Missing("HMI_POINT_TABLE".to_string()))?;
        let slave = match read_optional("HMI_SLAVE_LISTEN_ADDR") {
            Some(listen_addr) => Some(SlaveListenConfig {
                listen_addr,
                allow: read_ip_list("HMI_SLAVE_ALLOW")?,
                max_connections: read_with_default("HMI_SLAVE_MAX_CONNECTIONS", 8usize)?,
            }),
            None => None,
        };

        Ok(Self {
            server: ServerDescriptor {
                transport,
                host,
                port,
                serial,
                slave_id,
                cycle_seconds,
            },
            poll_delay,
            response_timeout,
            connect_timeout,
            restart_on_failure,
            point_table,
            slave,
        })
    }
}

fn read_serial() -> Result<SerialDescriptor, ConfigError> {
    let port = read_optional("HMI_SERIAL_PORT")
        .ok_or_else(|| ConfigError::Missing("HMI_SERIAL_PORT".to_string()))?;
    let parity = match read_optional("HMI_PARITY") {
        Some(value) => Parity::parse(&value)
            .ok_or_else(|| ConfigError::Invalid("HMI_PARITY".to_string(), value))?,
        None => Parity::None,
    };
    Ok(SerialDescriptor {
        port,
        baud_rate: read_with_default("HMI_BAUD_RATE", 9600u32)?,
        data_bits: read_with_default("HMI_DATA_BITS", 8u8)?,
        stop_bits: read_with_default("HMI_STOP_BITS", 1u8)?,
        parity,
    })
}

fn read_with_default<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    let value = match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => return Ok(default),
    };
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}

/// 逗号分隔的 IP 列表。
fn read_ip_list(key: &str) -> Result<Vec<IpAddr>, ConfigError> {
    let Some(value) = read_optional(key) else {
        return Ok(Vec::new());
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<IpAddr>()
                .map_err(|_| ConfigError::Invalid(key.to_string(), item.to_string()))
        })
        .collect()
}

/// 点表文档：分组数组，或 `{"groups": [...]}`。
#[derive(Deserialize)]
#[serde(untagged)]
enum PointTableDocument {
    Groups(Vec<GroupDescriptor>),
    Wrapped { groups: Vec<GroupDescriptor> },
}

/// 解析点表 JSON，分组按 index 排序。
pub fn parse_point_table(json: &str) -> Result<Vec<GroupDescriptor>, serde_json::Error> {
    let document: PointTableDocument = serde_json::from_str(json)?;
    let mut groups = match document {
        PointTableDocument::Groups(groups) => groups,
        PointTableDocument::Wrapped { groups } => groups,
    };
    groups.sort_by_key(|group| group.index);
    Ok(groups)
}

/// 从文件加载点表。
pub fn load_point_table(path: impl AsRef<Path>) -> Result<Vec<GroupDescriptor>, ConfigError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_point_table(&json).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
