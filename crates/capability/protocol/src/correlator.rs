//! 同步等候室：把异步到达的响应帧交给正在等待它的调用方
//!
//! 调用方先 `register` 得到 [`PendingResponse`]，再发送请求，最后 `wait`。
//! 接收端在发送之前就已存在，因此响应即使先于 `wait` 到达也不会丢失。
//! 读取任务通过 `deposit` 投递，从不阻塞。

use crate::error::ProtocolError;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// 默认应答超时
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(5000);

/// 关联键：TCP 用事务号，RTU 用功能码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Transaction(u16),
    Function(u8),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Transaction(id) => write!(f, "tid:{id}"),
            CorrelationKey::Function(code) => write!(f, "fc:0x{code:02X}"),
        }
    }
}

struct Slot {
    generation: u64,
    sender: oneshot::Sender<Bytes>,
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<CorrelationKey, Slot>>,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<CorrelationKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 每个连接一个等候室。
#[derive(Clone, Default)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为 `key` 开一个等待槽。同一键已有未完成的等待者时返回 `KeyInUse`。
    pub fn register(&self, key: CorrelationKey) -> Result<PendingResponse, ProtocolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::ChannelClosed);
        }
        let mut slots = self.inner.slots();
        if let Some(existing) = slots.get(&key) {
            if !existing.sender.is_closed() {
                return Err(ProtocolError::KeyInUse(key.to_string()));
            }
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        slots.insert(key, Slot { generation, sender });
        Ok(PendingResponse {
            key,
            generation,
            receiver,
            inner: Arc::clone(&self.inner),
        })
    }

    /// 登记后立即等待（调用方在别处发送请求时使用）。
    pub async fn register_and_await(
        &self,
        key: CorrelationKey,
        timeout: Duration,
    ) -> Result<Bytes, ProtocolError> {
        self.register(key)?.wait(timeout).await
    }

    /// 投递响应。没有等待者（迟到或主动上送）时丢弃并返回 false。
    pub fn deposit(&self, key: CorrelationKey, bytes: Bytes) -> bool {
        let slot = self.inner.slots().remove(&key);
        match slot {
            Some(slot) => {
                if slot.sender.send(bytes).is_ok() {
                    true
                } else {
                    debug!(target: "hmi.protocol", key = %key, "waiter_gone_before_deposit");
                    hmi_telemetry::record_unsolicited_frame();
                    false
                }
            }
            None => {
                warn!(target: "hmi.protocol", key = %key, len = bytes.len(), "unsolicited_frame_discarded");
                hmi_telemetry::record_unsolicited_frame();
                false
            }
        }
    }

    /// 关闭等候室：所有等待者立即以 `ChannelClosed` 失败，之后不再接受登记。
    pub fn close_all(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.inner.slots().drain().collect();
        if !drained.is_empty() {
            debug!(target: "hmi.protocol", pending = drained.len(), "pending_waiters_closed");
        }
    }

    /// 未完成的等待槽数量
    pub fn pending(&self) -> usize {
        self.inner.slots().len()
    }
}

/// 已登记的等待票据；丢弃时移除自己的槽。
pub struct PendingResponse {
    key: CorrelationKey,
    generation: u64,
    receiver: oneshot::Receiver<Bytes>,
    inner: Arc<Inner>,
}

impl PendingResponse {
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    /// 等待投递或超时，结果只返回一次。
    pub async fn wait(mut self, timeout: Duration) -> Result<Bytes, ProtocolError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(ProtocolError::ChannelClosed),
            Err(_) => {
                hmi_telemetry::record_correlation_timeout();
                Err(ProtocolError::Timeout(format!(
                    "no response for {} within {} ms",
                    self.key,
                    timeout.as_millis()
                )))
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        let mut slots = self.inner.slots();
        let ours = slots
            .get(&self.key)
            .is_some_and(|slot| slot.generation == self.generation);
        if ours {
            slots.remove(&self.key);
        }
    }
}
