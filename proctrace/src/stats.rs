use crate::loader::AttachError;
use aya::maps::{MapData, MapError, PerCpuArray};
use aya::Ebpf;
use proctrace_common::{ChannelKind, ChannelStats, CHANNEL_STATS_MAP};
use std::fmt;

/// 用户态读取 per-CPU 的 `CHANNEL_STATS` 计数
pub struct ChannelCounters {
    map: PerCpuArray<MapData, ChannelStats>,
}

impl ChannelCounters {
    pub fn from_ebpf(ebpf: &mut Ebpf) -> Result<Self, AttachError> {
        let map = ebpf
            .take_map(CHANNEL_STATS_MAP)
            .ok_or(AttachError::MapMissing(CHANNEL_STATS_MAP))?;
        let map = PerCpuArray::try_from(map).map_err(|source| AttachError::Map {
            name: CHANNEL_STATS_MAP,
            source,
        })?;
        Ok(Self { map })
    }

    pub fn read(&self, kind: ChannelKind) -> Result<ChannelStats, MapError> {
        let values = self.map.get(&kind.index(), 0)?;
        Ok(sum_per_cpu(values.iter()))
    }
}

pub fn sum_per_cpu<'a>(values: impl IntoIterator<Item = &'a ChannelStats>) -> ChannelStats {
    values
        .into_iter()
        .fold(ChannelStats::default(), |acc, v| ChannelStats {
            submitted: acc.submitted.wrapping_add(v.submitted),
            dropped: acc.dropped.wrapping_add(v.dropped),
        })
}

/// 单个通道的内核计数与用户态已读取数量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub kind: ChannelKind,
    pub submitted: u64,
    pub dropped: u64,
    pub delivered: u64,
}

impl ChannelSnapshot {
    pub fn new(kind: ChannelKind, counters: ChannelStats, delivered: u64) -> Self {
        Self {
            kind,
            submitted: counters.submitted,
            dropped: counters.dropped,
            delivered,
        }
    }

    /// 已写入 ring buffer 但尚未读取的记录数
    pub fn pending(&self) -> u64 {
        self.submitted
            .saturating_sub(self.dropped)
            .saturating_sub(self.delivered)
    }
}

impl fmt::Display for ChannelSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: submitted={} dropped={} delivered={} pending={}",
            self.kind.as_str(),
            self.submitted,
            self.dropped,
            self.delivered,
            self.pending()
        )
    }
}

/// 把单调增长的丢弃计数换算成每个周期的增量
#[derive(Debug, Default)]
pub struct GapTracker {
    last_dropped: [u64; 3],
}

impl GapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回自上次观察以来该通道丢失的记录数
    pub fn observe(&mut self, snapshot: &ChannelSnapshot) -> u64 {
        let slot = &mut self.last_dropped[snapshot.kind.index() as usize];
        let gap = snapshot.dropped.saturating_sub(*slot);
        *slot = snapshot.dropped;
        gap
    }

    pub fn total_dropped(&self) -> u64 {
        self.last_dropped.iter().sum()
    }
}
