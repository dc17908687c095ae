use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nix::time::{clock_gettime, ClockId};

/// 当前 CLOCK_MONOTONIC 纳秒数，与 `bpf_ktime_get_ns` 同源
pub fn monotonic_now_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        // CLOCK_MONOTONIC 在 Linux 上总是可用
        Err(_) => 0,
    }
}

/// 用构造时取得的一对锚点把内核单调时间换算为墙上时间，不计休眠时长
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor_mono_ns: u64,
    anchor_wall: DateTime<Utc>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::with_anchor(monotonic_now_ns(), Utc::now())
    }

    pub fn with_anchor(anchor_mono_ns: u64, anchor_wall: DateTime<Utc>) -> Self {
        Self {
            anchor_mono_ns,
            anchor_wall,
        }
    }

    pub fn to_wall(&self, mono_ns: u64) -> DateTime<Utc> {
        let delta = mono_ns as i128 - self.anchor_mono_ns as i128;
        let delta = delta.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        self.anchor_wall + ChronoDuration::nanoseconds(delta)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
