//! 周期采集调度器
//!
//! 状态机：`Ready -> Scheduled -> Running -> Succeeded | Failed`，任意状态可被取消。
//! 周期之间不重叠：循环内串行执行，手动触发的周期与循环共用同一把周期锁。
//! 取消不会中断进行中的等待：当前请求照常结束（数据或超时），但结果不再发布。
//! 连接断开、应答超时等可重试失败只记为 `Failed`，下一拍回到 `Scheduled` 继续采集；
//! 点表错误等不可重试失败停止循环（除非配置了 `restart_on_failure`）。

use crate::error::PollError;
use crate::listener::ValuesListener;
use crate::plan::{PollPlan, PollTarget};
use domain::PolledValueMap;
use hmi_protocol::MasterHandle;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

/// 默认首次采集延迟
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// 调度器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Ready,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// 调度参数
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub name: String,
    pub period: Duration,
    pub initial_delay: Duration,
    /// 不可重试的失败后是否继续调度（默认否）
    pub restart_on_failure: bool,
}

impl SchedulerConfig {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
            initial_delay: DEFAULT_INITIAL_DELAY,
            restart_on_failure: false,
        }
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_restart_on_failure(mut self, restart_on_failure: bool) -> Self {
        self.restart_on_failure = restart_on_failure;
        self
    }
}

struct Inner {
    config: SchedulerConfig,
    handle: Arc<MasterHandle>,
    target: PollTarget,
    plan: OnceCell<PollPlan>,
    listeners: RwLock<Vec<Arc<dyn ValuesListener>>>,
    state: watch::Sender<SchedulerState>,
    cycle_lock: tokio::sync::Mutex<()>,
}

struct LoopTask {
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// 周期采集调度器
pub struct PollingScheduler {
    inner: Arc<Inner>,
    task: Mutex<Option<LoopTask>>,
}

impl PollingScheduler {
    pub fn new(config: SchedulerConfig, handle: Arc<MasterHandle>, target: PollTarget) -> Self {
        let (state, _) = watch::channel(SchedulerState::Ready);
        Self {
            inner: Arc::new(Inner {
                config,
                handle,
                target,
                plan: OnceCell::new(),
                listeners: RwLock::new(Vec::new()),
                state,
                cycle_lock: tokio::sync::Mutex::new(()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn add_listener(&self, listener: Arc<dyn ValuesListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.inner.state.subscribe()
    }

    /// 调度循环是否仍在运行（未取消、未因失败停止）。
    pub fn is_active(&self) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|task| !task.token.is_cancelled() && !task.join.is_finished())
    }

    /// 启动调度循环；已在运行时返回 false。
    pub fn start(&self) -> bool {
        let mut slot = self.slot();
        if slot
            .as_ref()
            .is_some_and(|task| !task.token.is_cancelled() && !task.join.is_finished())
        {
            return false;
        }
        *slot = Some(self.spawn_loop());
        true
    }

    /// 取消当前循环并等待其结束（进行中的周期先收尾），再启动新循环。
    pub async fn restart(&self) {
        self.stop().await;
        let task = self.spawn_loop();
        *self.slot() = Some(task);
    }

    /// 取消调度：不再开始新周期，进行中的周期结果不发布。
    pub fn cancel(&self) {
        let token = self.slot().as_ref().map(|task| task.token.clone());
        if let Some(token) = token {
            token.cancel();
        }
        self.inner.set_state(SchedulerState::Cancelled, None);
    }

    /// 取消并等待循环退出。
    pub async fn stop(&self) {
        let task = self.slot().take();
        if let Some(task) = task {
            task.token.cancel();
            self.inner.set_state(SchedulerState::Cancelled, None);
            if let Err(e) = task.join.await {
                warn!(target: "hmi.polling", scheduler = %self.name(), error = %e, "poll_loop_join_failed");
            }
        }
    }

    /// 立即执行一个周期（与调度循环互斥）。
    pub async fn run_cycle(&self) -> Result<Arc<PolledValueMap>, PollError> {
        self.inner.cycle(None).await
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<LoopTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_loop(&self) -> LoopTask {
        let token = CancellationToken::new();
        self.inner.set_state(SchedulerState::Scheduled, None);
        let join = tokio::spawn(run_loop(Arc::clone(&self.inner), token.clone()));
        LoopTask { token, join }
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.slot().take() {
            task.token.cancel();
        }
    }
}

async fn run_loop(inner: Arc<Inner>, token: CancellationToken) {
    let period = inner.config.period.max(Duration::from_millis(1));
    let mut ticks = time::interval_at(Instant::now() + inner.config.initial_delay, period);
    // 周期超过间隔时顺延下一次，而不是补发
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        target: "hmi.polling",
        scheduler = %inner.config.name,
        period_ms = period.as_millis() as u64,
        initial_delay_ms = inner.config.initial_delay.as_millis() as u64,
        "poll_loop_started"
    );

    let mut failed = false;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticks.tick() => {}
        }
        if failed {
            inner.set_state(SchedulerState::Scheduled, Some(&token));
        }
        let outcome = inner.cycle(Some(&token)).await;
        if token.is_cancelled() {
            break;
        }
        failed = outcome.is_err();
        if let Err(e) = outcome
            && !e.is_retriable()
            && !inner.config.restart_on_failure
        {
            warn!(
                target: "hmi.polling",
                scheduler = %inner.config.name,
                error = %e,
                "poll_loop_stopped_after_failure"
            );
            break;
        }
    }
    info!(target: "hmi.polling", scheduler = %inner.config.name, "poll_loop_finished");
}

impl Inner {
    /// 取消后的周期不再改动状态
    fn set_state(&self, next: SchedulerState, token: Option<&CancellationToken>) {
        self.state.send_if_modified(|state| {
            if token.is_some_and(CancellationToken::is_cancelled) || *state == next {
                return false;
            }
            info!(
                target: "hmi.polling",
                scheduler = %self.config.name,
                from = ?*state,
                to = ?next,
                "scheduler_state_changed"
            );
            *state = next;
            true
        });
    }

    async fn plan(&self) -> Result<&PollPlan, PollError> {
        self.plan
            .get_or_try_init(|| async {
                let plan = PollPlan::build(&self.target)?;
                info!(
                    target: "hmi.polling",
                    scheduler = %self.config.name,
                    groups = plan.groups().len(),
                    requests = plan.request_count(),
                    "poll_plan_built"
                );
                Ok(plan)
            })
            .await
    }

    async fn cycle(
        &self,
        token: Option<&CancellationToken>,
    ) -> Result<Arc<PolledValueMap>, PollError> {
        let _cycle = self.cycle_lock.lock().await;
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(PollError::Cancelled);
        }
        let cycle_id = hmi_telemetry::new_cycle_id();
        let span = info_span!(
            target: "hmi.polling",
            "poll_cycle",
            scheduler = %self.config.name,
            cycle_id = %cycle_id
        );

        async move {
            self.set_state(SchedulerState::Running, token);
            let started = Instant::now();
            let collected = self.collect().await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let values = match collected {
                Ok(values) => Arc::new(values),
                Err(e) => {
                    hmi_telemetry::record_poll_cycle_failed();
                    warn!(target: "hmi.polling", error = %e, elapsed_ms, "poll_cycle_failed");
                    self.set_state(SchedulerState::Failed, token);
                    return Err(e);
                }
            };
            if token.is_some_and(CancellationToken::is_cancelled) {
                info!(target: "hmi.polling", points = values.len(), "poll_cycle_discarded_after_cancel");
                return Err(PollError::Cancelled);
            }

            hmi_telemetry::record_poll_cycle_succeeded();
            if !values.is_empty() {
                self.publish(&values).await;
            }
            self.set_state(SchedulerState::Succeeded, token);
            info!(target: "hmi.polling", points = values.len(), elapsed_ms, "poll_cycle_succeeded");
            Ok(values)
        }
        .instrument(span)
        .await
    }

    async fn collect(&self) -> Result<PolledValueMap, PollError> {
        let plan = self.plan().await?;
        let connection = self
            .handle
            .ensure_connected()
            .await
            .map_err(PollError::Connection)?;

        let mut values = PolledValueMap::new();
        let mut failed = 0;
        let mut retriable = true;
        for group in plan.groups() {
            match group.poll(&connection).await {
                Ok(group_values) => values.extend(group_values),
                Err(e) if e.is_connection_loss() => {
                    self.handle.invalidate();
                    return Err(PollError::Connection(e));
                }
                Err(e) => {
                    hmi_telemetry::record_poll_group_failed();
                    warn!(target: "hmi.polling", group = group.index(), error = %e, "poll_group_failed");
                    failed += 1;
                    retriable &= e.is_retriable();
                }
            }
        }
        if failed > 0 && failed == plan.groups().len() {
            return Err(PollError::AllGroupsFailed {
                groups: failed,
                retriable,
            });
        }
        Ok(values)
    }

    async fn publish(&self, values: &Arc<PolledValueMap>) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_values(Arc::clone(values)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use domain::{GroupDescriptor, PointLocation};
    use hmi_protocol::{Connector, MasterConnection, ProtocolError};

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self) -> Result<MasterConnection, ProtocolError> {
            Err(ProtocolError::Connection("refused".into()))
        }

        fn target(&self) -> String {
            "refused".into()
        }
    }

    fn scheduler(groups: Vec<GroupDescriptor>) -> PollingScheduler {
        PollingScheduler::new(
            SchedulerConfig::new("test", Duration::from_millis(20))
                .with_initial_delay(Duration::ZERO),
            Arc::new(MasterHandle::new(Arc::new(RefusingConnector))),
            PollTarget::new(1, groups),
        )
    }

    /// 功能码覆盖非法，点表无法生成请求
    fn invalid_groups() -> Vec<GroupDescriptor> {
        vec![GroupDescriptor {
            index: 1,
            start: 0,
            end: 10,
            function_code: Some(0x06),
            locations: vec![PointLocation {
                address: 1,
                iec: String::new(),
                unit: String::new(),
                convert: 1,
                point_type: None,
                multiple: None,
                show: None,
                fnc_lab: None,
                enums: Vec::new(),
            }],
        }]
    }

    #[test]
    fn config_defaults() {
        let config = SchedulerConfig::new("poll", Duration::from_secs(1));
        assert_eq!(config.initial_delay, DEFAULT_INITIAL_DELAY);
        assert!(!config.restart_on_failure);
    }

    #[tokio::test]
    async fn starts_ready_and_schedules() {
        let scheduler = scheduler(Vec::new());
        assert_eq!(scheduler.state(), SchedulerState::Ready);
        assert!(scheduler.start());
        assert!(!scheduler.start());
        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Cancelled);
        assert!(!scheduler.is_active());
    }

    #[tokio::test]
    async fn refused_connect_keeps_loop_running() {
        let scheduler = scheduler(Vec::new());
        let mut state = scheduler.subscribe();
        scheduler.start();
        time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == SchedulerState::Failed),
        )
        .await
        .unwrap()
        .unwrap();
        time::sleep(Duration::from_millis(60)).await;
        assert!(scheduler.is_active());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn plan_failure_stops_loop_without_restart_policy() {
        let scheduler = scheduler(invalid_groups());
        let mut state = scheduler.subscribe();
        scheduler.start();
        time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == SchedulerState::Failed),
        )
        .await
        .unwrap()
        .unwrap();
        time::sleep(Duration::from_millis(60)).await;
        assert!(!scheduler.is_active());
        assert_eq!(scheduler.state(), SchedulerState::Failed);
    }

    #[tokio::test]
    async fn restart_policy_keeps_loop_after_plan_failure() {
        let scheduler = PollingScheduler::new(
            SchedulerConfig::new("test", Duration::from_millis(20))
                .with_initial_delay(Duration::ZERO)
                .with_restart_on_failure(true),
            Arc::new(MasterHandle::new(Arc::new(RefusingConnector))),
            PollTarget::new(1, invalid_groups()),
        );
        let mut state = scheduler.subscribe();
        scheduler.start();
        time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == SchedulerState::Failed),
        )
        .await
        .unwrap()
        .unwrap();
        time::sleep(Duration::from_millis(60)).await;
        assert!(scheduler.is_active());
        scheduler.stop().await;
    }
}
