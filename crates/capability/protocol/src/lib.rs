//! # 协议通信能力模块
//!
//! 风机控制器的 Modbus 主/从站协议引擎：
//! - **数据类型编解码**：无符号字、有符号字、位状态字
//! - **帧模型**：TCP（MBAP 头，事务号）与 RTU（从站号，CRC16 帧尾）
//! - **请求拆分**：稀疏地址 -> 满足单次数量上限的连续区间请求
//! - **同步等候室**：按事务号（TCP）或功能码（RTU）把响应交给等待者
//! - **主站连接**：独占传输通道，读取任务切帧后投递到等候室
//! - **从站应答**：本地数据容器 + 异常码映射 + 连接过滤链
//!
//! ## 数据流
//!
//! ```text
//! GroupDescriptor (点表)
//!       │
//!       ▼
//! RequestSplitter ──► RequestDescriptor
//!       │
//!       ▼
//! MasterConnection ── 写半部 ──► 设备
//!       ▲
//!       │ 读取任务（AduCodec 切帧）
//!       ▼
//! Correlator ──► 等待中的调用方（采集调度 / 命令下发）
//! ```

mod adu_codec;
mod codec;
mod correlator;
mod crc;
mod error;
mod frame;
mod function_code;
mod handle;
mod master;
mod pdu;
mod request;
mod slave;
mod slave_server;
mod splitter;

pub use adu_codec::{AduCodec, RawFrame, Role};
pub use codec::{pack_bits, unpack_bits, DataType, RegisterValue};
pub use correlator::{CorrelationKey, Correlator, PendingResponse, DEFAULT_RESPONSE_TIMEOUT};
pub use crc::{append_crc, crc16, verify_crc};
pub use error::{exception_description, ProtocolError};
pub use frame::{
    encode_adu, split_adu, CommandFrame, ConfirmFrame, Frame, FrameHeader, MbapHeader,
    RequestFrame, ResponseFrame, MBAP_HEADER_LEN, MODBUS_PROTOCOL_ID,
};
pub use function_code::{
    FunctionCode, EXCEPTION_FLAG, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};
pub use handle::{
    connector_for, Connector, MasterHandle, RtuConnector, TcpConnector, DEFAULT_CONNECT_TIMEOUT,
};
pub use master::MasterConnection;
pub use pdu::{
    check_exception, ExceptionResponse, Pdu, ReadRequest, ReadResponse, WriteCommand,
    WriteConfirm,
};
pub use request::{PointValue, RequestDescriptor};
pub use slave::{
    serve_stream, ExceptionTable, InMemoryDataContainer, SlaveDataContainer, SlaveDataError,
    SlaveResponder, EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_VALUE,
    EXCEPTION_ILLEGAL_FUNCTION, ILLEGAL_DATA_ADDRESS,
};
pub use slave_server::{
    AllowListFilter, ConnectionFilter, FilterChain, MaxConnectionsFilter, SlaveServer,
    SlaveServerConfig,
};
pub use splitter::{RequestSplitter, SplitPolicy};
