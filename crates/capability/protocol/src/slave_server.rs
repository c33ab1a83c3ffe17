//! 从站 TCP 服务器
//!
//! 监听 TCP 端口，每个新连接先经过过滤链判定，放行后按 Modbus TCP 应答。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let config = SlaveServerConfig::from_json(r#"{"listen_addr": "0.0.0.0:1502"}"#)?;
//! let server = SlaveServer::new(config, responder);
//! server.run(shutdown).await?;
//! ```

use crate::error::ProtocolError;
use crate::slave::{serve_stream, SlaveResponder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 从站服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveServerConfig {
    /// 监听地址，如 `0.0.0.0:502`
    pub listen_addr: String,
    /// 允许连接的对端 IP（为空表示不限制）
    #[serde(default)]
    pub allow: Vec<IpAddr>,
    /// 最大并发连接数
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    8
}

impl SlaveServerConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            allow: Vec::new(),
            max_connections: default_max_connections(),
        }
    }

    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::ConfigParse(e.to_string()))
    }
}

/// 连接过滤器：在读取任何帧之前决定是否接受连接
pub trait ConnectionFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// `active` 为当前已接受的连接数（不含本连接）
    fn accept(&self, peer: SocketAddr, active: usize) -> bool;
}

/// 按对端 IP 放行
#[derive(Debug, Clone)]
pub struct AllowListFilter {
    allowed: HashSet<IpAddr>,
}

impl AllowListFilter {
    pub fn new(allowed: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl ConnectionFilter for AllowListFilter {
    fn name(&self) -> &'static str {
        "allow_list"
    }

    fn accept(&self, peer: SocketAddr, _active: usize) -> bool {
        self.allowed.contains(&peer.ip())
    }
}

/// 并发连接数上限
#[derive(Debug, Clone, Copy)]
pub struct MaxConnectionsFilter {
    max: usize,
}

impl MaxConnectionsFilter {
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl ConnectionFilter for MaxConnectionsFilter {
    fn name(&self) -> &'static str {
        "max_connections"
    }

    fn accept(&self, _peer: SocketAddr, active: usize) -> bool {
        active < self.max
    }
}

/// 过滤链：任一过滤器拒绝即关闭连接
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn ConnectionFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: Arc<dyn ConnectionFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// 放行返回 Ok，拒绝时返回拒绝者名称。
    pub fn judge(&self, peer: SocketAddr, active: usize) -> Result<(), &'static str> {
        match self
            .filters
            .iter()
            .find(|filter| !filter.accept(peer, active))
        {
            Some(filter) => Err(filter.name()),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// 连接结束时归还计数
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 从站 TCP 服务器
pub struct SlaveServer {
    config: SlaveServerConfig,
    responder: Arc<SlaveResponder>,
    filters: FilterChain,
    active: Arc<AtomicUsize>,
}

impl SlaveServer {
    /// 按配置构建过滤链：允许列表（非空时）+ 最大连接数。
    pub fn new(config: SlaveServerConfig, responder: Arc<SlaveResponder>) -> Self {
        let mut filters = FilterChain::new();
        if !config.allow.is_empty() {
            filters = filters.with(Arc::new(AllowListFilter::new(config.allow.clone())));
        }
        filters = filters.with(Arc::new(MaxConnectionsFilter::new(config.max_connections)));
        Self {
            config,
            responder,
            filters,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 追加自定义过滤器
    pub fn with_filter(mut self, filter: Arc<dyn ConnectionFilter>) -> Self {
        self.filters = self.filters.with(filter);
        self
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// 绑定配置的地址并运行，直到 `shutdown` 被取消。
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ProtocolError> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// 在已绑定的监听器上运行。
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ProtocolError> {
        let local = listener.local_addr()?;
        info!(target: "hmi.slave", addr = %local, filters = self.filters.len(), "slave_server_listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(target: "hmi.slave", error = %e, "accept_failed");
                    continue;
                }
            };

            let active = self.active.load(Ordering::Acquire);
            if let Err(filter) = self.filters.judge(peer, active) {
                hmi_telemetry::record_slave_connection_rejected();
                info!(target: "hmi.slave", peer = %peer, filter, "slave_connection_rejected");
                drop(stream);
                continue;
            }

            self.active.fetch_add(1, Ordering::AcqRel);
            let guard = ActiveGuard(Arc::clone(&self.active));
            let responder = Arc::clone(&self.responder);
            let shutdown = shutdown.clone();
            info!(target: "hmi.slave", peer = %peer, "slave_connection_accepted");

            tokio::spawn(async move {
                let _guard = guard;
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(target: "hmi.slave", peer = %peer, "slave_connection_shutdown");
                    }
                    result = serve_stream(stream, responder) => match result {
                        Ok(()) => info!(target: "hmi.slave", peer = %peer, "slave_connection_closed"),
                        Err(e) => warn!(target: "hmi.slave", peer = %peer, error = %e, "slave_connection_failed"),
                    },
                }
            });
        }

        info!(target: "hmi.slave", addr = %local, "slave_server_stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 40000)
    }

    #[test]
    fn test_parse_config() {
        let json = r#"{"listen_addr": "0.0.0.0:1502", "allow": ["10.0.0.5"]}"#;
        let config = SlaveServerConfig::from_json(json).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:1502");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.allow, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
        assert!(SlaveServerConfig::from_json("{}").is_err());
    }

    #[test]
    fn chain_rejects_disallowed_peer() {
        let chain = FilterChain::new()
            .with(Arc::new(AllowListFilter::new(["10.0.0.5".parse().unwrap()])))
            .with(Arc::new(MaxConnectionsFilter::new(1)));
        assert_eq!(chain.judge(peer("10.0.0.5"), 0), Ok(()));
        assert_eq!(chain.judge(peer("10.0.0.6"), 0), Err("allow_list"));
        assert_eq!(chain.judge(peer("10.0.0.5"), 1), Err("max_connections"));
    }

    #[test]
    fn empty_chain_accepts() {
        assert!(FilterChain::new().judge(peer("127.0.0.1"), 100).is_ok());
    }
}
