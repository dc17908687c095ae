use crate::{
    config::AppConfig,
    event_bus,
    service_manager::ServiceManager,
    signal_handler::{SignalEvent, SignalHandler},
    tracer::LifecycleTracer,
};
use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{info, warn};

/// 运行直到收到 SIGINT/SIGTERM；启动失败（包括探针无法挂载）返回给调用方
pub fn async_runtime(app_config: AppConfig) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .thread_name("proctrace")
        .build()
        .context("Async runtime: failed to build tokio runtime")?;

    rt.block_on(tracer_core_logic(app_config))
}

async fn tracer_core_logic(config: AppConfig) -> Result<()> {
    info!("Application Core Logic: Starting up and initializing components...");

    // 1. 事件总线
    let event_sender = event_bus::create_event_sender(config.transport.bus_capacity);
    info!(
        "Application Core Logic: Event bus created (capacity {}).",
        config.transport.bus_capacity
    );

    // 2. 先挂订阅者，再开始发布
    let subscriber_handles = ServiceManager::spawn_subscribers(&event_sender, &config);
    info!(
        "Application Core Logic: {} subscriber services started.",
        subscriber_handles.len()
    );

    // 3. 信号处理要在加载探针前注册，避免加载期间的 Ctrl+C 直接杀死进程
    let mut signals = SignalHandler::new()?;

    // 4. 加载探针并启动监听任务
    let mut tracer = LifecycleTracer::start(&config, event_sender.clone())?;
    info!("Application Core Logic: Tracing process events... Ctrl+C to quit.");

    // 5. 主事件循环
    loop {
        match signals.wait_for_signal().await {
            SignalEvent::ReportStats => tracer.request_stats_report(),
            SignalEvent::Shutdown => {
                info!("Core Logic: Initiating graceful shutdown...");
                break;
            }
        }
    }

    // 6. 关闭：监听任务退出后总线的所有发送端被释放，订阅者随之结束
    tracer.shutdown().await;
    drop(tracer);
    drop(event_sender);
    for handle in subscriber_handles {
        if tokio::time::timeout(Duration::from_secs(3), handle).await.is_err() {
            warn!("Core Logic: Subscriber did not finish within timeout.");
        }
    }

    info!("Application Core Logic: Shutdown completed.");
    Ok(())
}
