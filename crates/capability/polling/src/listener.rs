//! 采集值发布：监听器与最新值缓存。

use async_trait::async_trait;
use domain::PolledValueMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// 采集值监听器。每个成功且非空的周期收到一份只读快照。
#[async_trait]
pub trait ValuesListener: Send + Sync {
    async fn on_values(&self, values: Arc<PolledValueMap>);
}

/// 最新采集值缓存（显示层的 `latestValues` 读取来源）。
#[derive(Debug, Default)]
pub struct ValueCache {
    latest: RwLock<Arc<PolledValueMap>>,
    updates: AtomicU64,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Arc<PolledValueMap> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 已接收的发布次数
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }

    fn replace(&self, values: Arc<PolledValueMap>) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = values;
        self.updates.fetch_add(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl ValuesListener for ValueCache {
    async fn on_values(&self, values: Arc<PolledValueMap>) {
        self.replace(values);
    }
}

/// 回调形式的监听器
pub struct CallbackListener<F> {
    callback: F,
}

impl<F> CallbackListener<F>
where
    F: Fn(Arc<PolledValueMap>) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> ValuesListener for CallbackListener<F>
where
    F: Fn(Arc<PolledValueMap>) + Send + Sync,
{
    async fn on_values(&self, values: Arc<PolledValueMap>) {
        (self.callback)(values);
    }
}
