use proctrace_common::{c_str_bytes, ChannelKind, ExecRecord, ExitRecord, ForkRecord};
use serde::Serialize;
use tokio::sync::broadcast;

/// 订阅者看到的生命周期事件。id 为内核 task id，可能被复用；
/// fork 和 exit 按 `timestamp_ns`（单调时钟）排序
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProcessEvent {
    Exec(ExecEvent),
    Fork(ForkEvent),
    Exit(ExitEvent),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecEvent {
    pub pid: u32,
    pub comm: String,
    pub filename: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ForkEvent {
    pub timestamp_ns: u64,
    pub parent_pid: u32,
    pub child_pid: u32,
    pub parent_comm: String,
    pub child_comm: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExitEvent {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub comm: String,
}

impl ProcessEvent {
    pub fn pid(&self) -> u32 {
        match self {
            ProcessEvent::Exec(e) => e.pid,
            ProcessEvent::Fork(e) => e.child_pid,
            ProcessEvent::Exit(e) => e.pid,
        }
    }

    /// 事件来自哪个通道
    pub fn kind(&self) -> ChannelKind {
        match self {
            ProcessEvent::Exec(_) => ChannelKind::Exec,
            ProcessEvent::Fork(_) => ChannelKind::Fork,
            ProcessEvent::Exit(_) => ChannelKind::Exit,
        }
    }

    /// exec 记录不带时间戳
    pub fn timestamp_ns(&self) -> Option<u64> {
        match self {
            ProcessEvent::Exec(_) => None,
            ProcessEvent::Fork(e) => Some(e.timestamp_ns),
            ProcessEvent::Exit(e) => Some(e.timestamp_ns),
        }
    }
}

/// 按第一个 null 截断，非法 UTF-8 用替换字符
pub fn lossy_c_str(buf: &[u8]) -> String {
    String::from_utf8_lossy(c_str_bytes(buf)).into_owned()
}

impl From<ExecRecord> for ProcessEvent {
    fn from(rec: ExecRecord) -> Self {
        ProcessEvent::Exec(ExecEvent {
            pid: rec.pid,
            comm: lossy_c_str(&rec.comm),
            filename: lossy_c_str(&rec.fname),
        })
    }
}

impl From<ForkRecord> for ProcessEvent {
    fn from(rec: ForkRecord) -> Self {
        ProcessEvent::Fork(ForkEvent {
            timestamp_ns: rec.ts,
            parent_pid: rec.ppid,
            child_pid: rec.pid,
            parent_comm: lossy_c_str(&rec.pcomm),
            child_comm: lossy_c_str(&rec.comm),
        })
    }
}

impl From<ExitRecord> for ProcessEvent {
    fn from(rec: ExitRecord) -> Self {
        ProcessEvent::Exit(ExitEvent {
            timestamp_ns: rec.ts,
            pid: rec.pid,
            comm: lossy_c_str(&rec.comm),
        })
    }
}

pub fn create_event_sender(capacity: usize) -> broadcast::Sender<ProcessEvent> {
    let (tx, _rx_initial) = broadcast::channel(capacity);
    tx
}
