//! # HMI 引擎门面
//!
//! 显示层只通过这里与协议引擎交互：
//! - `connect()` / `disconnect()` / `is_connected()`
//! - `latest_values()`：最近一次发布的采集值
//! - `send_command(address, value)`：写单个寄存器并校验确认
//! - `on_values_updated(callback)`：采集值更新订阅
//!
//! 主站连接、采集调度与命令通道由引擎显式创建和持有，没有全局单例。

use async_trait::async_trait;
use domain::{GroupDescriptor, PolledValue, PolledValueMap, ServerDescriptor, TransportKind};
use hmi_config::{EngineConfig, SlaveListenConfig};
use hmi_control::{CommandSender, ControlAddresses, SystemCommand};
use hmi_polling::{
    CallbackListener, PollTarget, PollingScheduler, SchedulerConfig, SchedulerState, ValueCache,
    ValuesListener,
};
use hmi_protocol::{
    Connector, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT, InMemoryDataContainer,
    MasterHandle, ProtocolError, RegisterValue, SlaveResponder, SlaveServer, SlaveServerConfig,
    connector_for,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// 引擎构建错误。
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// 引擎运行参数
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub initial_delay: Duration,
    pub restart_on_failure: bool,
    pub control_addresses: ControlAddresses,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            initial_delay: hmi_polling::DEFAULT_INITIAL_DELAY,
            restart_on_failure: false,
            control_addresses: ControlAddresses::default(),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            response_timeout: config.response_timeout,
            initial_delay: config.poll_delay,
            restart_on_failure: config.restart_on_failure,
            ..Self::default()
        }
    }
}

/// HMI 协议引擎
pub struct HmiEngine {
    handle: Arc<MasterHandle>,
    scheduler: PollingScheduler,
    cache: Arc<ValueCache>,
    commands: CommandSender,
}

impl HmiEngine {
    /// 按服务器描述与点表构建引擎（不建立连接）。
    pub fn new(
        server: &ServerDescriptor,
        groups: Vec<GroupDescriptor>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let connector = connector_for(server, options.connect_timeout, options.response_timeout)?;
        Ok(Self::with_connector(
            connector,
            PollTarget::new(server.slave_id, groups),
            server.cycle(),
            options,
        ))
    }

    pub fn from_config(
        config: &EngineConfig,
        groups: Vec<GroupDescriptor>,
    ) -> Result<Self, EngineError> {
        Self::new(&config.server, groups, EngineOptions::from_config(config))
    }

    /// 使用自定义连接器构建（测试设备、其他链路）。
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        target: PollTarget,
        period: Duration,
        options: EngineOptions,
    ) -> Self {
        let handle = Arc::new(MasterHandle::new(connector));
        let scheduler = PollingScheduler::new(
            SchedulerConfig::new("hmi-poll", period)
                .with_initial_delay(options.initial_delay)
                .with_restart_on_failure(options.restart_on_failure),
            Arc::clone(&handle),
            target,
        );
        let cache = Arc::new(ValueCache::new());
        scheduler.add_listener(cache.clone());
        let commands =
            CommandSender::new(Arc::clone(&handle)).with_addresses(options.control_addresses);
        Self {
            handle,
            scheduler,
            cache,
            commands,
        }
    }

    /// 开始采集；连接在首个周期内建立。已在采集时重新调度。
    pub async fn connect(&self) {
        info!(target: "hmi.engine", "engine_connect");
        self.scheduler.restart().await;
    }

    /// 停止采集（等待进行中的周期收尾）并断开连接。
    pub async fn disconnect(&self) {
        self.scheduler.stop().await;
        self.handle.disconnect().await;
        info!(target: "hmi.engine", "engine_disconnected");
    }

    /// 采集调度在运行且主站连接可用
    pub fn is_connected(&self) -> bool {
        self.scheduler.is_active() && self.handle.is_connected()
    }

    pub fn latest_values(&self) -> Arc<PolledValueMap> {
        self.cache.latest()
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.scheduler.subscribe()
    }

    pub fn on_values_updated<F>(&self, callback: F)
    where
        F: Fn(Arc<PolledValueMap>) + Send + Sync + 'static,
    {
        self.scheduler
            .add_listener(Arc::new(CallbackListener::new(callback)));
    }

    pub fn add_listener(&self, listener: Arc<dyn ValuesListener>) {
        self.scheduler.add_listener(listener);
    }

    pub fn commands(&self) -> &CommandSender {
        &self.commands
    }

    /// 写单个寄存器：地址须在 0..=65535，值须在 -32768..=65535。
    pub async fn send_command(&self, address: i32, value: i32) -> bool {
        let Ok(address) = u16::try_from(address) else {
            warn!(target: "hmi.engine", address, value, "command_address_out_of_range");
            return false;
        };
        self.commands.send_value(address, value).await
    }

    pub async fn send_system_command(&self, command: SystemCommand) -> bool {
        self.commands.send_system(command).await
    }
}

/// 把发布的采集值镜像到从站数据容器（输入寄存器），供上位机读取。
pub struct MirrorListener {
    container: Arc<InMemoryDataContainer>,
}

impl MirrorListener {
    pub fn new(container: Arc<InMemoryDataContainer>) -> Self {
        Self { container }
    }
}

/// 采集值 -> 寄存器字
pub fn mirror_word(value: &PolledValue) -> Option<u16> {
    match value {
        PolledValue::Number(number) => i32::try_from(*number)
            .ok()
            .and_then(RegisterValue::from_i32)
            .map(|value| value.word()),
        PolledValue::Bits(bits) => Some(RegisterValue::from_bits(bits).word()),
    }
}

#[async_trait]
impl ValuesListener for MirrorListener {
    async fn on_values(&self, values: Arc<PolledValueMap>) {
        for (address, value) in values.iter() {
            match mirror_word(value) {
                Some(word) => self.container.set_input(*address, word),
                None => warn!(target: "hmi.engine", address, value = ?value, "mirror_value_out_of_range"),
            }
        }
    }
}

/// 按监听配置构建从站 TCP 服务器。
pub fn slave_server(
    config: &SlaveListenConfig,
    slave_id: u8,
    container: Arc<InMemoryDataContainer>,
) -> SlaveServer {
    let responder = Arc::new(SlaveResponder::new(TransportKind::Tcp, slave_id, container));
    let mut server_config = SlaveServerConfig::new(config.listen_addr.clone());
    server_config.allow = config.allow.clone();
    server_config.max_connections = config.max_connections;
    SlaveServer::new(server_config, responder)
}
