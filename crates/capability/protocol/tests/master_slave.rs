use domain::TransportKind;
use hmi_protocol::{
    serve_stream, Connector, DataType, FunctionCode, InMemoryDataContainer, MasterConnection,
    PointValue, ProtocolError, RegisterValue, RequestSplitter, SlaveResponder, WriteCommand,
};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(500);

/// 内存管道两端：主站连接 + 由引擎自身从站应答器驱动的设备
fn connected_pair(kind: TransportKind) -> (MasterConnection, Arc<InMemoryDataContainer>) {
    let container = Arc::new(InMemoryDataContainer::new());
    let responder = Arc::new(SlaveResponder::new(kind, 1, container.clone()));
    let (client, device) = tokio::io::duplex(1024);
    tokio::spawn(serve_stream(device, responder));
    let connection = MasterConnection::from_stream(client, kind, 1, TIMEOUT, "duplex");
    (connection, container)
}

async fn read_all(
    connection: &MasterConnection,
    points: &[(u16, DataType)],
) -> Result<Vec<(u16, PointValue)>, ProtocolError> {
    let descriptors =
        RequestSplitter::new(1).split_registers(FunctionCode::ReadInputRegisters, points)?;
    let mut values = Vec::new();
    for descriptor in &descriptors {
        let response = connection.read(descriptor).await?;
        values.extend(descriptor.decode_values(&response)?);
    }
    Ok(values)
}

#[tokio::test]
async fn tcp_master_reads_from_slave() {
    let (connection, container) = connected_pair(TransportKind::Tcp);
    container.set_input(100, 1500);
    container.set_input(101, 0xFFF6);
    container.set_input(102, 0b101);

    let values = read_all(
        &connection,
        &[
            (100, DataType::Unsigned),
            (101, DataType::Signed),
            (102, DataType::Bitfield),
        ],
    )
    .await
    .unwrap();

    assert_eq!(
        values,
        vec![
            (100, PointValue::Register(RegisterValue::Unsigned(1500))),
            (101, PointValue::Register(RegisterValue::Signed(-10))),
            (102, PointValue::Register(RegisterValue::Bitfield(5))),
        ]
    );
}

#[tokio::test]
async fn rtu_master_reads_and_writes() {
    let (connection, container) = connected_pair(TransportKind::Rtu);
    container.set_input(10, 42);

    let values = read_all(&connection, &[(10, DataType::Unsigned)]).await.unwrap();
    assert_eq!(
        values,
        vec![(10, PointValue::Register(RegisterValue::Unsigned(42)))]
    );

    let command = WriteCommand::MultipleRegisters {
        address: 200,
        values: vec![RegisterValue::Unsigned(1), RegisterValue::Signed(-2)],
    };
    let confirm = connection.write(&command).await.unwrap();
    assert_eq!(confirm, command.expected_confirm());
    assert_eq!(container.holding(200), Some(1));
    assert_eq!(container.holding(201), Some(0xFFFE));
}

#[tokio::test]
async fn unset_register_surfaces_exception() {
    let (connection, _container) = connected_pair(TransportKind::Tcp);
    let result = read_all(&connection, &[(500, DataType::Unsigned)]).await;
    assert!(matches!(
        result,
        Err(ProtocolError::Exception {
            function: 0x04,
            code: 0x02
        })
    ));
    // 异常响应不影响连接
    assert!(connection.is_connected());
}

#[tokio::test]
async fn coil_write_and_read_back() {
    let (connection, container) = connected_pair(TransportKind::Tcp);
    let command = WriteCommand::SingleCoil {
        address: 3,
        value: true,
    };
    connection.write(&command).await.unwrap();
    assert_eq!(container.coil(3), Some(true));

    let descriptors = RequestSplitter::new(1)
        .split_coils(FunctionCode::ReadCoils, &[3])
        .unwrap();
    let response = connection.read(&descriptors[0]).await.unwrap();
    assert_eq!(
        descriptors[0].decode_values(&response).unwrap(),
        vec![(3, PointValue::Coil(true))]
    );
}

#[tokio::test]
async fn concurrent_tcp_callers_share_one_connection() {
    let (connection, container) = connected_pair(TransportKind::Tcp);
    for address in 0..4 {
        container.set_input(address, address * 10);
    }
    let mut tasks = Vec::new();
    for address in 0..4u16 {
        let connection = connection.clone();
        tasks.push(tokio::spawn(async move {
            read_all(&connection, &[(address, DataType::Unsigned)]).await
        }));
    }
    for (address, task) in tasks.into_iter().enumerate() {
        let values = task.await.unwrap().unwrap();
        assert_eq!(
            values[0].1,
            PointValue::Register(RegisterValue::Unsigned(address as u16 * 10))
        );
    }
}

#[tokio::test]
async fn tcp_connector_refused_is_connection_error() {
    // 绑定后立即释放，端口上没有监听者
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let connector = hmi_protocol::TcpConnector::new("127.0.0.1", port, 1)
        .with_timeouts(Duration::from_millis(500), TIMEOUT);
    let err = connector.connect().await.err().unwrap();
    assert!(err.is_connection_loss());
}
