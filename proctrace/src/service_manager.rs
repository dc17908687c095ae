use crate::{
    config::{AppConfig, OutputMode},
    event_bus::ProcessEvent,
    subscriber::{
        event_printer::{EventPrinter, PrintFormat},
        forwarder::TreeForwarder,
        run_subscriber,
        tree_view::TreeView,
        Subscriber,
    },
};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

/// 服务管理器，按配置启动事件总线上的订阅者
pub struct ServiceManager;

impl ServiceManager {
    /// 为每个配置的消费者订阅事件总线，必须在跟踪器开始发布之前调用
    pub fn spawn_subscribers(
        event_sender: &broadcast::Sender<ProcessEvent>,
        config: &AppConfig,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        match config.output {
            OutputMode::Lines => {
                handles.push(Self::spawn(event_sender, EventPrinter::stdout(PrintFormat::Lines)))
            }
            OutputMode::Json => {
                handles.push(Self::spawn(event_sender, EventPrinter::stdout(PrintFormat::Json)))
            }
            OutputMode::Tree => handles.push(Self::spawn(
                event_sender,
                TreeView::new(
                    config.tree.history_len,
                    Duration::from_millis(config.tree.render_interval_ms),
                    Box::new(std::io::stdout()),
                ),
            )),
            OutputMode::Quiet => info!("ServiceManager: event output disabled."),
        }

        if let Some(address) = &config.forward.address {
            info!("ServiceManager: forwarding finished process trees to {}", address);
            handles.push(Self::spawn(
                event_sender,
                TreeForwarder::new(address.clone(), config.tree.history_len),
            ));
        }

        handles
    }

    fn spawn<S: Subscriber + 'static>(
        event_sender: &broadcast::Sender<ProcessEvent>,
        subscriber: S,
    ) -> JoinHandle<()> {
        let receiver = event_sender.subscribe();
        tokio::spawn(run_subscriber(subscriber, receiver))
    }
}
