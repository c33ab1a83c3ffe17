//! 协议错误类型定义

/// 协议通信错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// 连接错误（建立连接失败、连接已断开）
    #[error("connection error: {0}")]
    Connection(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 帧解码错误：长度、CRC、功能码不合法（不可重试）
    #[error("decode error: {0}")]
    Decode(String),

    /// 等候室超时（下一周期/下一次命令可重试）
    #[error("timeout: {0}")]
    Timeout(String),

    /// 设备返回异常响应
    #[error("modbus exception: function 0x{function:02X}, code 0x{code:02X}")]
    Exception { function: u8, code: u8 },

    /// 请求参数不合法（功能码、数量越界）
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// 同一键已有未完成的等待者
    #[error("correlation key in use: {0}")]
    KeyInUse(String),

    /// 通道关闭
    #[error("channel closed")]
    ChannelClosed,

    /// 未连接
    #[error("not connected")]
    NotConnected,

    /// 配置解析错误
    #[error("config parse error: {0}")]
    ConfigParse(String),
}

impl ProtocolError {
    /// 超时与连接类错误可在下一周期重试；解码错误与异常响应不可重试。
    pub fn is_retriable(&self) -> bool {
        matches!(self, ProtocolError::Timeout(_)) || self.is_connection_loss()
    }

    /// 需要丢弃当前连接、下个周期重建的错误。
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ProtocolError::Connection(_)
                | ProtocolError::Io(_)
                | ProtocolError::ChannelClosed
                | ProtocolError::NotConnected
        )
    }
}

/// Modbus 标准异常码说明。
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "slave device failure",
        0x05 => "acknowledge",
        0x06 => "slave device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert!(ProtocolError::Timeout("t".into()).is_retriable());
        assert!(!ProtocolError::Timeout("t".into()).is_connection_loss());
        assert!(ProtocolError::ChannelClosed.is_connection_loss());
        assert!(!ProtocolError::Decode("crc".into()).is_retriable());
        assert!(!ProtocolError::Exception { function: 3, code: 2 }.is_retriable());
    }

    #[test]
    fn exception_message_names_code() {
        let err = ProtocolError::Exception { function: 0x03, code: 0x02 };
        assert_eq!(
            err.to_string(),
            "modbus exception: function 0x03, code 0x02"
        );
        assert_eq!(exception_description(0x02), "illegal data address");
    }
}
