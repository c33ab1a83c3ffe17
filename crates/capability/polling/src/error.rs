use hmi_protocol::ProtocolError;

/// 采集周期错误。
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// 连接无法建立或在周期内断开（整个周期失败，连接下次重建）
    #[error("connection unavailable: {0}")]
    Connection(#[source] ProtocolError),
    /// 点表无法转换为请求
    #[error("invalid poll plan: {0}")]
    Plan(#[source] ProtocolError),
    /// `retriable`：各组均因超时等可重试错误失败
    #[error("all {groups} poll groups failed")]
    AllGroupsFailed { groups: usize, retriable: bool },
    /// 周期在取消后结束，结果被丢弃
    #[error("poll cycle cancelled")]
    Cancelled,
}

impl PollError {
    /// 下个周期可能恢复的失败，调度循环不因此停止。
    pub fn is_retriable(&self) -> bool {
        match self {
            PollError::Connection(_) => true,
            PollError::AllGroupsFailed { retriable, .. } => *retriable,
            PollError::Plan(_) | PollError::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(PollError::Connection(ProtocolError::Connection("refused".into())).is_retriable());
        assert!(PollError::AllGroupsFailed {
            groups: 2,
            retriable: true
        }
        .is_retriable());
        assert!(!PollError::AllGroupsFailed {
            groups: 2,
            retriable: false
        }
        .is_retriable());
        assert!(!PollError::Plan(ProtocolError::InvalidRequest("function 0x06".into())).is_retriable());
        assert!(!PollError::Cancelled.is_retriable());
    }
}
