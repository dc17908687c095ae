use crate::event_bus::ProcessEvent;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub mod event_printer;
pub mod forwarder;
pub mod tree_view;

#[async_trait]
pub trait Subscriber: Send {
    fn name(&self) -> &'static str;

    async fn handle_event(&mut self, event: ProcessEvent);

    /// [`Subscriber::on_tick`] 的周期，`None` 表示不定时触发
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    async fn on_tick(&mut self) {}

    /// 总线覆盖了 `missed` 个尚未读取的事件
    async fn on_lagged(&mut self, _missed: u64) {}

    /// 总线关闭后调用一次
    async fn finish(&mut self) {}
}

/// 从总线向订阅者投递事件，直到所有发送端关闭
pub async fn run_subscriber<S: Subscriber>(
    mut subscriber: S,
    mut event_rx: broadcast::Receiver<ProcessEvent>,
) {
    let name = subscriber.name();
    let mut ticker = subscriber.tick_interval().map(tokio::time::interval);
    info!("ServiceManager: {} service started.", name);

    loop {
        tokio::select! {
            received = event_rx.recv() => match received {
                Ok(event) => subscriber.handle_event(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("ServiceManager: {} lagged, missed {} messages", name, n);
                    subscriber.on_lagged(n).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("ServiceManager: {} event channel closed, exiting.", name);
                    break;
                }
            },
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => subscriber.on_tick().await,
        }
    }

    subscriber.finish().await;
}
