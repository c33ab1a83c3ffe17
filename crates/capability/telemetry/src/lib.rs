//! 日志初始化与引擎计数器。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 计数器快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub unsolicited_frames: u64,
    pub correlation_timeouts: u64,
    pub decode_errors: u64,
    pub exception_responses: u64,
    pub poll_cycles_succeeded: u64,
    pub poll_cycles_failed: u64,
    pub poll_groups_failed: u64,
    pub commands_confirmed: u64,
    pub commands_rejected: u64,
    pub slave_requests_served: u64,
    pub slave_connections_rejected: u64,
}

/// 引擎计数器。
pub struct TelemetryMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    unsolicited_frames: AtomicU64,
    correlation_timeouts: AtomicU64,
    decode_errors: AtomicU64,
    exception_responses: AtomicU64,
    poll_cycles_succeeded: AtomicU64,
    poll_cycles_failed: AtomicU64,
    poll_groups_failed: AtomicU64,
    commands_confirmed: AtomicU64,
    commands_rejected: AtomicU64,
    slave_requests_served: AtomicU64,
    slave_connections_rejected: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            unsolicited_frames: AtomicU64::new(0),
            correlation_timeouts: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            exception_responses: AtomicU64::new(0),
            poll_cycles_succeeded: AtomicU64::new(0),
            poll_cycles_failed: AtomicU64::new(0),
            poll_groups_failed: AtomicU64::new(0),
            commands_confirmed: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            slave_requests_served: AtomicU64::new(0),
            slave_connections_rejected: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            unsolicited_frames: self.unsolicited_frames.load(Ordering::Relaxed),
            correlation_timeouts: self.correlation_timeouts.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            exception_responses: self.exception_responses.load(Ordering::Relaxed),
            poll_cycles_succeeded: self.poll_cycles_succeeded.load(Ordering::Relaxed),
            poll_cycles_failed: self.poll_cycles_failed.load(Ordering::Relaxed),
            poll_groups_failed: self.poll_groups_failed.load(Ordering::Relaxed),
            commands_confirmed: self.commands_confirmed.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            slave_requests_served: self.slave_requests_served.load(Ordering::Relaxed),
            slave_connections_rejected: self
                .slave_connections_rejected
                .load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局计数器实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成采集周期标识，挂在周期 span 上便于串联日志。
pub fn new_cycle_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 帧以十六进制输出（debug 日志用）。
pub fn hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

pub fn record_frame_sent() {
    metrics().frames_sent.fetch_add(1, Ordering::Relaxed);
}

pub fn record_frame_received() {
    metrics().frames_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录无人等待（迟到或主动上送）的帧。
pub fn record_unsolicited_frame() {
    metrics().unsolicited_frames.fetch_add(1, Ordering::Relaxed);
}

pub fn record_correlation_timeout() {
    metrics().correlation_timeouts.fetch_add(1, Ordering::Relaxed);
}

pub fn record_decode_error() {
    metrics().decode_errors.fetch_add(1, Ordering::Relaxed);
}

pub fn record_exception_response() {
    metrics().exception_responses.fetch_add(1, Ordering::Relaxed);
}

pub fn record_poll_cycle_succeeded() {
    metrics().poll_cycles_succeeded.fetch_add(1, Ordering::Relaxed);
}

pub fn record_poll_cycle_failed() {
    metrics().poll_cycles_failed.fetch_add(1, Ordering::Relaxed);
}

pub fn record_poll_group_failed() {
    metrics().poll_groups_failed.fetch_add(1, Ordering::Relaxed);
}

/// 记录确认校验通过的写命令。
pub fn record_command_confirmed() {
    metrics().commands_confirmed.fetch_add(1, Ordering::Relaxed);
}

/// 记录失败的写命令（未连接、超时、确认不一致等）。
pub fn record_command_rejected() {
    metrics().commands_rejected.fetch_add(1, Ordering::Relaxed);
}

pub fn record_slave_request_served() {
    metrics().slave_requests_served.fetch_add(1, Ordering::Relaxed);
}

pub fn record_slave_connection_rejected() {
    metrics()
        .slave_connections_rejected
        .fetch_add(1, Ordering::Relaxed);
}
