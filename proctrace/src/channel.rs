use crate::loader::AttachError;
use aya::maps::{MapData, RingBuf};
use aya::Ebpf;
use proctrace_common::Record;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tracing::warn;

/// 单个内核 ring buffer 的消费端，产出同一种解码后的记录
pub struct EventChannel<R> {
    ring: AsyncFd<RingBuf<MapData>>,
    delivered: Arc<AtomicU64>,
    malformed: u64,
    _record: PhantomData<R>,
}

impl<R: Record> EventChannel<R> {
    pub fn from_ebpf(ebpf: &mut Ebpf) -> Result<Self, AttachError> {
        let name = R::KIND.map_name();
        let map = ebpf.take_map(name).ok_or(AttachError::MapMissing(name))?;
        let ring = RingBuf::try_from(map).map_err(|source| AttachError::Map { name, source })?;
        let ring = AsyncFd::new(ring).map_err(|source| AttachError::Poll { name, source })?;
        Ok(Self {
            ring,
            delivered: Arc::new(AtomicU64::new(0)),
            malformed: 0,
            _record: PhantomData,
        })
    }

    /// [`EventChannel::drain`] 已交出的记录数，可共享
    pub fn delivered_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.delivered)
    }

    /// 等待内核通知有新数据。返回前已清除就绪状态，调用方随后必须读空
    pub async fn readable(&mut self) -> io::Result<()> {
        let mut guard = self.ring.readable_mut().await?;
        guard.clear_ready();
        Ok(())
    }

    /// 按到达顺序取出缓冲区内的全部记录，不阻塞
    pub fn drain(&mut self) -> Vec<R> {
        let mut records = Vec::new();
        let ring = self.ring.get_mut();
        while let Some(item) = ring.next() {
            match R::decode(&item) {
                Some(rec) => records.push(rec),
                None => {
                    self.malformed += 1;
                    warn!(
                        "[Channel] {} record too short ({} bytes), skipped",
                        R::KIND.as_str(),
                        item.len()
                    );
                }
            }
        }
        self.delivered
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        records
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}
