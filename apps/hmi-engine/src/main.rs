//! 风机 HMI 协议引擎运行时：按环境变量连接控制器、周期采集，可选作为从站应答。

use hmi_config::{EngineConfig, load_point_table};
use hmi_engine::{HmiEngine, MirrorListener, slave_server};
use hmi_protocol::InMemoryDataContainer;
use hmi_telemetry::init_tracing;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = EngineConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();

    let groups = load_point_table(&config.point_table)?;
    info!(
        target: "hmi.engine",
        point_table = %config.point_table.display(),
        groups = groups.len(),
        transport = ?config.server.transport,
        slave_id = config.server.slave_id,
        cycle_seconds = config.server.cycle_seconds,
        "point_table_loaded"
    );

    let engine = HmiEngine::from_config(&config, groups)?;
    engine.on_values_updated(|values| {
        info!(target: "hmi.engine", points = values.len(), "values_updated");
    });

    // 可选：从站服务器，镜像采集值供上位机读取
    let shutdown = CancellationToken::new();
    let slave_task = match &config.slave {
        Some(slave) => {
            let container = Arc::new(InMemoryDataContainer::new());
            engine.add_listener(Arc::new(MirrorListener::new(container.clone())));
            let server = slave_server(slave, config.server.slave_id, container);
            let token = shutdown.clone();
            Some(tokio::spawn(async move { server.run(token).await }))
        }
        None => None,
    };

    engine.connect().await;
    tokio::signal::ctrl_c().await?;
    info!(target: "hmi.engine", "shutdown_requested");

    shutdown.cancel();
    engine.disconnect().await;
    if let Some(task) = slave_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "hmi.engine", error = %e, "slave_server_failed"),
            Err(e) => warn!(target: "hmi.engine", error = %e, "slave_server_join_failed"),
        }
    }

    let metrics = hmi_telemetry::metrics().snapshot();
    info!(target: "hmi.engine", metrics = ?metrics, "engine_stopped");
    Ok(())
}
