//! # 周期采集能力模块
//!
//! - [`PollPlan`]：点表分组 -> 按组排列的读请求（首次周期时构建，之后复用）
//! - [`PollingScheduler`]：固定周期、不重叠的采集循环，状态可经 `watch` 观察
//! - [`ValuesListener`] / [`ValueCache`]：每个成功周期的只读快照发布
//!
//! 分组是原子的：组内任一请求失败则丢弃该组本周期的数据，其余组照常发布。
//! 连接类错误使整个周期失败，并使主站连接失效，下个周期重建。

mod error;
mod listener;
mod plan;
mod scheduler;

pub use error::PollError;
pub use listener::{CallbackListener, ValueCache, ValuesListener};
pub use plan::{PollGroup, PollPlan, PollTarget, data_type_of, polled_value};
pub use scheduler::{DEFAULT_INITIAL_DELAY, PollingScheduler, SchedulerConfig, SchedulerState};
