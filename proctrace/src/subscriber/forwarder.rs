use super::Subscriber;
use crate::event_bus::ProcessEvent;
use crate::process_tree::ProcessTreeTracker;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// 每行一个 JSON 文档的 TCP 客户端。首次发送时才连接；写入时连接断开会重连一次并重发
pub struct JsonLineClient {
    address: String,
    stream: Option<TcpStream>,
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

impl JsonLineClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        match TcpStream::connect(&self.address).await {
            Ok(stream) => {
                info!("Forwarder: connected to {}", self.address);
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                self.stream = None;
                Err(anyhow!("cannot connect to {}: {}", self.address, e))
            }
        }
    }

    async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        stream.write_all(line).await?;
        stream.flush().await
    }

    pub async fn send<T: Serialize + ?Sized>(&mut self, document: &T) -> Result<()> {
        let mut line = serde_json::to_vec(document)?;
        line.push(b'\n');

        if self.stream.is_none() {
            self.connect().await?;
        }
        match self.write_line(&line).await {
            Ok(()) => Ok(()),
            Err(e) if is_disconnect(&e) => {
                warn!("Forwarder: connection lost ({}), reconnecting...", e);
                self.stream = None;
                self.connect().await?;
                self.write_line(&line).await.map_err(|e| {
                    self.stream = None;
                    anyhow!("resend to {} failed: {}", self.address, e)
                })
            }
            Err(e) => Err(anyhow!("send to {} failed: {}", self.address, e)),
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Forwarder: error while closing connection: {}", e);
            }
            info!("Forwarder: connection to {} closed.", self.address);
        }
    }
}

/// 把每棵完成的进程树发送给收集端
pub struct TreeForwarder {
    tracker: ProcessTreeTracker,
    client: JsonLineClient,
    sent: u64,
    failed: u64,
}

impl TreeForwarder {
    pub fn new(address: impl Into<String>, history_len: usize) -> Self {
        Self {
            tracker: ProcessTreeTracker::new(history_len),
            client: JsonLineClient::new(address),
            sent: 0,
            failed: 0,
        }
    }
}

#[async_trait]
impl Subscriber for TreeForwarder {
    fn name(&self) -> &'static str {
        "TreeForwarder"
    }

    async fn handle_event(&mut self, event: ProcessEvent) {
        for tree in self.tracker.handle_event(&event) {
            match self.client.send(&tree).await {
                Ok(()) => {
                    self.sent += 1;
                    debug!(pid = tree.pid, "Forwarder: process tree sent");
                }
                Err(e) => {
                    self.failed += 1;
                    warn!(pid = tree.pid, "Forwarder: tree dropped: {}", e);
                }
            }
        }
    }

    async fn finish(&mut self) {
        self.client.close().await;
        info!(
            "Forwarder: {} trees sent, {} dropped.",
            self.sent, self.failed
        );
    }
}
