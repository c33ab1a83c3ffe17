//! 主站连接
//!
//! 独占一个传输通道（TCP 或串口）。写半部由互斥锁串行化，读半部由后台任务
//! 按 [`AduCodec`] 切帧后投递到 [`Correlator`]。调用方在等候室里等待各自的响应。

use crate::adu_codec::{AduCodec, Role};
use crate::correlator::{CorrelationKey, Correlator};
use crate::error::ProtocolError;
use crate::frame::{encode_adu, Frame, FrameHeader};
use crate::pdu::{Pdu, ReadResponse, WriteCommand, WriteConfirm};
use crate::request::RequestDescriptor;
use bytes::Bytes;
use domain::{Parity, SerialDescriptor, TransportKind};
use futures::{SinkExt, StreamExt};
use hmi_telemetry::hex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Shared {
    kind: TransportKind,
    slave_id: u8,
    peer: String,
    response_timeout: Duration,
    writer: Mutex<FramedWrite<BoxedWriter, AduCodec>>,
    /// RTU 总线半双工：一次只允许一个请求在途
    bus: Mutex<()>,
    correlator: Correlator,
    transaction_id: AtomicU16,
    connected: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let reader = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

/// 主站连接句柄（可克隆，共享同一通道）
#[derive(Clone)]
pub struct MasterConnection {
    shared: Arc<Shared>,
}

impl MasterConnection {
    /// 建立 Modbus TCP 连接
    pub async fn connect_tcp(
        host: &str,
        port: u16,
        slave_id: u8,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let addr = format!("{host}:{port}");
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ProtocolError::Connection(format!("connect {addr}: {e}")));
            }
            Err(_) => {
                return Err(ProtocolError::Connection(format!(
                    "connect {addr} timed out after {} ms",
                    connect_timeout.as_millis()
                )));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target: "hmi.protocol", peer = %addr, error = %e, "set_nodelay_failed");
        }
        info!(target: "hmi.protocol", peer = %addr, slave_id, "tcp_connected");
        Ok(Self::from_stream(
            stream,
            TransportKind::Tcp,
            slave_id,
            response_timeout,
            addr,
        ))
    }

    /// 打开 Modbus RTU 串口
    pub fn connect_rtu(
        serial: &SerialDescriptor,
        slave_id: u8,
        response_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let stream = tokio_serial::new(serial.port.as_str(), serial.baud_rate)
            .data_bits(data_bits(serial.data_bits))
            .stop_bits(stop_bits(serial.stop_bits))
            .parity(parity(serial.parity))
            .timeout(response_timeout)
            .open_native_async()
            .map_err(|e| {
                ProtocolError::Connection(format!("open serial port {}: {e}", serial.port))
            })?;
        info!(
            target: "hmi.protocol",
            port = %serial.port,
            baud_rate = serial.baud_rate,
            slave_id,
            "rtu_opened"
        );
        Ok(Self::from_stream(
            stream,
            TransportKind::Rtu,
            slave_id,
            response_timeout,
            serial.port.clone(),
        ))
    }

    /// 在任意双向字节流上建立连接，并启动读取任务。
    pub fn from_stream<S>(
        stream: S,
        kind: TransportKind,
        slave_id: u8,
        response_timeout: Duration,
        peer: impl Into<String>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let correlator = Correlator::new();
        let connected = Arc::new(AtomicBool::new(true));
        let writer: BoxedWriter = Box::new(write_half);

        let reader = tokio::spawn(pump_inbound(
            read_half,
            kind,
            correlator.clone(),
            Arc::clone(&connected),
            peer.clone(),
        ));

        Self {
            shared: Arc::new(Shared {
                kind,
                slave_id,
                peer,
                response_timeout,
                writer: Mutex::new(FramedWrite::new(writer, AduCodec::new(kind, Role::Master))),
                bus: Mutex::new(()),
                correlator,
                transaction_id: AtomicU16::new(1),
                connected,
                reader: std::sync::Mutex::new(Some(reader)),
            }),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.shared.kind
    }

    pub fn slave_id(&self) -> u8 {
        self.shared.slave_id
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn response_timeout(&self) -> Duration {
        self.shared.response_timeout
    }

    /// 下一个事务号（按连接递增，65535 后回绕）
    pub fn next_transaction_id(&self) -> u16 {
        self.shared.transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 发送读请求并等待响应。
    pub async fn read(&self, request: &RequestDescriptor) -> Result<ReadResponse, ProtocolError> {
        let (key, frame) = match self.shared.kind {
            TransportKind::Tcp => {
                let transaction_id = self.next_transaction_id();
                (
                    CorrelationKey::Transaction(transaction_id),
                    request.tcp_frame(transaction_id),
                )
            }
            TransportKind::Rtu => (
                CorrelationKey::Function(request.function().code()),
                request.rtu_frame().clone(),
            ),
        };
        let raw = self.exchange(key, frame).await?;
        let response: ReadResponse = self.decode_reply(&raw)?;
        if let Err(e) = response.matches(request.read_request()) {
            hmi_telemetry::record_decode_error();
            return Err(e);
        }
        Ok(response)
    }

    /// 发送写命令并等待确认（确认内容的比对由调用方完成）。
    pub async fn write(&self, command: &WriteCommand) -> Result<WriteConfirm, ProtocolError> {
        command.validate()?;
        let pdu = command.to_bytes();
        let (key, header) = match self.shared.kind {
            TransportKind::Tcp => {
                let transaction_id = self.next_transaction_id();
                (
                    CorrelationKey::Transaction(transaction_id),
                    FrameHeader::Tcp {
                        transaction_id,
                        unit_id: self.shared.slave_id,
                    },
                )
            }
            TransportKind::Rtu => (
                CorrelationKey::Function(command.function().code()),
                FrameHeader::Rtu {
                    slave_id: self.shared.slave_id,
                },
            ),
        };
        let raw = self.exchange(key, encode_adu(header, &pdu)).await?;
        self.decode_reply(&raw)
    }

    async fn exchange(&self, key: CorrelationKey, frame: Bytes) -> Result<Bytes, ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        let _bus = match self.shared.kind {
            TransportKind::Rtu => Some(self.shared.bus.lock().await),
            TransportKind::Tcp => None,
        };
        let ticket = self.shared.correlator.register(key)?;

        debug!(target: "hmi.protocol", key = %key, frame = %hex(&frame), "frame_sent");
        let sent = self.shared.writer.lock().await.send(frame).await;
        if let Err(e) = sent {
            warn!(target: "hmi.protocol", peer = %self.shared.peer, error = %e, "send_failed");
            self.close();
            return Err(e);
        }
        hmi_telemetry::record_frame_sent();

        ticket.wait(self.shared.response_timeout).await
    }

    fn decode_reply<P: Pdu>(&self, raw: &[u8]) -> Result<P, ProtocolError> {
        match Frame::<P>::decode(self.shared.kind, raw) {
            Ok(frame) => {
                if let FrameHeader::Rtu { slave_id } = frame.header {
                    if slave_id != self.shared.slave_id {
                        hmi_telemetry::record_decode_error();
                        return Err(ProtocolError::Decode(format!(
                            "reply from slave {slave_id}, expected {}",
                            self.shared.slave_id
                        )));
                    }
                }
                Ok(frame.pdu)
            }
            Err(ProtocolError::Exception { function, code }) => {
                hmi_telemetry::record_exception_response();
                warn!(target: "hmi.protocol", function, code, "exception_response");
                Err(ProtocolError::Exception { function, code })
            }
            Err(e) => {
                hmi_telemetry::record_decode_error();
                warn!(target: "hmi.protocol", frame = %hex(raw), error = %e, "reply_decode_failed");
                Err(e)
            }
        }
    }

    /// 立即断开：停止读取任务，所有等待者以 `ChannelClosed` 失败。
    pub fn close(&self) {
        self.shared.connected.store(false, Ordering::Release);
        let reader = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.shared.correlator.close_all();
    }

    /// 断开并关闭写半部。
    pub async fn shutdown(&self) {
        self.close();
        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!(target: "hmi.protocol", peer = %self.shared.peer, error = %e, "writer_shutdown_failed");
        }
    }
}

async fn pump_inbound<R>(
    reader: R,
    kind: TransportKind,
    correlator: Correlator,
    connected: Arc<AtomicBool>,
    peer: String,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, AduCodec::new(kind, Role::Master));
    loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                hmi_telemetry::record_frame_received();
                debug!(
                    target: "hmi.protocol",
                    key = %frame.key,
                    frame = %hex(&frame.bytes),
                    "frame_received"
                );
                correlator.deposit(frame.key, frame.bytes);
            }
            Some(Err(e)) => {
                if matches!(e, ProtocolError::Decode(_)) {
                    hmi_telemetry::record_decode_error();
                }
                warn!(target: "hmi.protocol", peer = %peer, error = %e, "inbound_stream_failed");
                break;
            }
            None => {
                info!(target: "hmi.protocol", peer = %peer, "peer_closed_connection");
                break;
            }
        }
    }
    connected.store(false, Ordering::Release);
    correlator.close_all();
}

fn data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DataType, RegisterValue};
    use crate::function_code::FunctionCode;
    use tokio::io::AsyncReadExt;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn transaction_ids_wrap() {
        let (client, _device) = tokio::io::duplex(64);
        let connection =
            MasterConnection::from_stream(client, TransportKind::Tcp, 1, TIMEOUT, "duplex");
        connection
            .shared
            .transaction_id
            .store(u16::MAX, Ordering::Relaxed);
        assert_eq!(connection.next_transaction_id(), u16::MAX);
        assert_eq!(connection.next_transaction_id(), 0);
    }

    #[tokio::test]
    async fn tcp_read_correlates_by_transaction_id() {
        let (client, mut device) = tokio::io::duplex(256);
        let connection =
            MasterConnection::from_stream(client, TransportKind::Tcp, 1, TIMEOUT, "duplex");
        let request = RequestDescriptor::registers(
            1,
            FunctionCode::ReadInputRegisters,
            vec![(100, DataType::Unsigned)],
        )
        .unwrap();

        let device_task = tokio::spawn(async move {
            let mut buf = [0u8; 12];
            device.read_exact(&mut buf).await.unwrap();
            let reply = [buf[0], buf[1], 0, 0, 0, 5, 1, 0x04, 0x02, 0x01, 0x2C];
            device.write_all(&reply).await.unwrap();
            device
        });

        let response = connection.read(&request).await.unwrap();
        let values = request.decode_values(&response).unwrap();
        assert_eq!(
            values[0].1,
            crate::request::PointValue::Register(RegisterValue::Unsigned(300))
        );
        let _device = device_task.await.unwrap();
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (client, _device) = tokio::io::duplex(256);
        let connection =
            MasterConnection::from_stream(client, TransportKind::Rtu, 1, TIMEOUT, "duplex");
        let command = WriteCommand::SingleRegister {
            address: 102,
            value: RegisterValue::Unsigned(1),
        };
        assert!(matches!(
            connection.write(&command).await,
            Err(ProtocolError::Timeout(_))
        ));
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn peer_close_fails_waiters_and_disconnects() {
        let (client, device) = tokio::io::duplex(256);
        let connection = MasterConnection::from_stream(
            client,
            TransportKind::Tcp,
            1,
            Duration::from_secs(5),
            "duplex",
        );
        let command = WriteCommand::SingleRegister {
            address: 102,
            value: RegisterValue::Unsigned(1),
        };
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(device);
        });
        let result = connection.write(&command).await;
        assert!(result.unwrap_err().is_connection_loss());
        closer.await.unwrap();
        assert!(!connection.is_connected());
        assert!(matches!(
            connection.write(&command).await,
            Err(ProtocolError::NotConnected)
        ));
    }
}
