//! 连接器与共享的主站句柄
//!
//! 每个引擎实例只有一个活动连接。采集调度器通过 `ensure_connected` 懒建立连接，
//! 命令通道只读取当前连接，从不主动连接。

use crate::correlator::DEFAULT_RESPONSE_TIMEOUT;
use crate::error::ProtocolError;
use crate::master::MasterConnection;
use async_trait::async_trait;
use domain::{SerialDescriptor, ServerDescriptor, TransportKind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// 默认连接超时
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// 建立主站连接
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<MasterConnection, ProtocolError>;

    /// 连接目标描述（日志用）
    fn target(&self) -> String;
}

/// Modbus TCP 连接器
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub host: String,
    pub port: u16,
    pub slave_id: u8,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, slave_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            slave_id,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, response_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.response_timeout = response_timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<MasterConnection, ProtocolError> {
        MasterConnection::connect_tcp(
            &self.host,
            self.port,
            self.slave_id,
            self.connect_timeout,
            self.response_timeout,
        )
        .await
    }

    fn target(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// Modbus RTU 连接器
#[derive(Debug, Clone)]
pub struct RtuConnector {
    pub serial: SerialDescriptor,
    pub slave_id: u8,
    pub response_timeout: Duration,
}

impl RtuConnector {
    pub fn new(serial: SerialDescriptor, slave_id: u8) -> Self {
        Self {
            serial,
            slave_id,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }
}

#[async_trait]
impl Connector for RtuConnector {
    async fn connect(&self) -> Result<MasterConnection, ProtocolError> {
        MasterConnection::connect_rtu(&self.serial, self.slave_id, self.response_timeout)
    }

    fn target(&self) -> String {
        format!("rtu://{}@{}", self.serial.port, self.serial.baud_rate)
    }
}

/// 按服务器描述选择连接器。
pub fn connector_for(
    server: &ServerDescriptor,
    connect_timeout: Duration,
    response_timeout: Duration,
) -> Result<Arc<dyn Connector>, ProtocolError> {
    match server.transport {
        TransportKind::Tcp => Ok(Arc::new(
            TcpConnector::new(server.host.clone(), server.port, server.slave_id)
                .with_timeouts(connect_timeout, response_timeout),
        )),
        TransportKind::Rtu => {
            let serial = server.serial.clone().ok_or_else(|| {
                ProtocolError::ConfigParse("rtu transport without serial settings".into())
            })?;
            Ok(Arc::new(
                RtuConnector::new(serial, server.slave_id).with_response_timeout(response_timeout),
            ))
        }
    }
}

/// 唯一活动连接的持有者
pub struct MasterHandle {
    connector: Arc<dyn Connector>,
    current: Mutex<Option<MasterConnection>>,
    connecting: tokio::sync::Mutex<()>,
}

impl MasterHandle {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            current: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<MasterConnection>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 返回可用连接；不存在或已断开时重新建立。
    pub async fn ensure_connected(&self) -> Result<MasterConnection, ProtocolError> {
        if let Some(connection) = self.current() {
            return Ok(connection);
        }
        let _connecting = self.connecting.lock().await;
        if let Some(connection) = self.current() {
            return Ok(connection);
        }
        let stale = self.slot().take();
        if let Some(stale) = stale {
            stale.close();
        }
        let connection = match self.connector.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(
                    target: "hmi.protocol",
                    target_addr = %self.connector.target(),
                    error = %e,
                    "connect_failed"
                );
                return Err(e);
            }
        };
        info!(target: "hmi.protocol", target_addr = %self.connector.target(), "master_connected");
        *self.slot() = Some(connection.clone());
        Ok(connection)
    }

    /// 当前已连接的连接（不会发起连接）
    pub fn current(&self) -> Option<MasterConnection> {
        self.slot()
            .as_ref()
            .filter(|connection| connection.is_connected())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    /// 丢弃当前连接，下次 `ensure_connected` 时重建。
    pub fn invalidate(&self) {
        if let Some(connection) = self.slot().take() {
            warn!(target: "hmi.protocol", peer = %connection.peer(), "connection_invalidated");
            connection.close();
        }
    }

    /// 主动断开。
    pub async fn disconnect(&self) {
        let connection = self.slot().take();
        if let Some(connection) = connection {
            connection.shutdown().await;
            info!(target: "hmi.protocol", peer = %connection.peer(), "master_disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 每次连接都返回一条新的内存管道
    #[derive(Default)]
    struct DuplexConnector {
        attempts: AtomicUsize,
        fail: bool,
        devices: std::sync::Mutex<Vec<tokio::io::DuplexStream>>,
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self) -> Result<MasterConnection, ProtocolError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProtocolError::Connection("refused".into()));
            }
            let (client, device) = tokio::io::duplex(64);
            self.devices.lock().unwrap().push(device);
            Ok(MasterConnection::from_stream(
                client,
                TransportKind::Tcp,
                1,
                Duration::from_millis(100),
                "duplex",
            ))
        }

        fn target(&self) -> String {
            "duplex".into()
        }
    }

    #[tokio::test]
    async fn connects_lazily_and_reuses() {
        let connector = Arc::new(DuplexConnector::default());
        let handle = MasterHandle::new(connector.clone());
        assert!(handle.current().is_none());
        handle.ensure_connected().await.unwrap();
        handle.ensure_connected().await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(handle.is_connected());

        handle.invalidate();
        assert!(!handle.is_connected());
        handle.ensure_connected().await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

        handle.disconnect().await;
        assert!(handle.current().is_none());
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let handle = MasterHandle::new(Arc::new(DuplexConnector {
            fail: true,
            ..Default::default()
        }));
        assert!(matches!(
            handle.ensure_connected().await,
            Err(ProtocolError::Connection(_))
        ));
        assert!(!handle.is_connected());
    }

    #[test]
    fn rtu_descriptor_requires_serial_settings() {
        let server = ServerDescriptor {
            transport: TransportKind::Rtu,
            host: String::new(),
            port: 0,
            serial: None,
            slave_id: 1,
            cycle_seconds: 1,
        };
        assert!(connector_for(&server, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT).is_err());
    }
}
