use anyhow::Result;
use tokio::signal::unix::{self, Signal, SignalKind};
use tracing::info;

/// 信号处理器，负责处理系统信号
pub struct SignalHandler {
    usr1_signal: Signal,
    term_signal: Signal,
    int_signal: Signal,
}

#[derive(Debug)]
pub enum SignalEvent {
    /// 输出一次统计快照 (SIGUSR1)
    ReportStats,
    /// 关闭信号 (SIGTERM, SIGINT)
    Shutdown,
}

impl SignalHandler {
    /// 一次性注册信号，两次等待之间不会丢失信号
    pub fn new() -> Result<Self> {
        Ok(Self {
            usr1_signal: unix::signal(SignalKind::user_defined1())?,
            term_signal: unix::signal(SignalKind::terminate())?,
            int_signal: unix::signal(SignalKind::interrupt())?,
        })
    }

    /// 等待下一个信号事件
    pub async fn wait_for_signal(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.usr1_signal.recv() => {
                info!("SignalHandler: Received SIGUSR1, reporting channel statistics.");
                SignalEvent::ReportStats
            }
            _ = self.term_signal.recv() => {
                info!("SignalHandler: Received SIGTERM, initiating graceful shutdown.");
                SignalEvent::Shutdown
            }
            _ = self.int_signal.recv() => {
                info!("SignalHandler: Received SIGINT (Ctrl+C), initiating graceful shutdown.");
                SignalEvent::Shutdown
            }
        }
    }
}
