#![no_std]

pub mod layout;
pub mod probe;

/// 内核进程名长度（包括 null 终止符）
pub const TASK_COMM_LEN: usize = 16;
/// execve 路径缓冲区长度，超长路径被截断为 255 字节 + null
pub const FILENAME_LEN: usize = 256;

pub const CHANNEL_STATS_MAP: &str = "CHANNEL_STATS";

/// 每种事件一条独立的 ring buffer，记录内部不带类型字段
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Exec = 0,
    Fork = 1,
    Exit = 2,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Exec, ChannelKind::Fork, ChannelKind::Exit];

    pub const fn map_name(self) -> &'static str {
        match self {
            ChannelKind::Exec => "EXEC_EVENTS",
            ChannelKind::Fork => "FORK_EVENTS",
            ChannelKind::Exit => "EXIT_EVENTS",
        }
    }

    pub const fn index(self) -> u32 {
        self as u32
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Exec => "exec",
            ChannelKind::Fork => "fork",
            ChannelKind::Exit => "exit",
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecRecord {
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub fname: [u8; FILENAME_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForkRecord {
    /// bpf_ktime_get_ns，单调时钟
    pub ts: u64,
    pub ppid: u32,
    pub pid: u32,
    pub pcomm: [u8; TASK_COMM_LEN],
    pub comm: [u8; TASK_COMM_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitRecord {
    pub ts: u64,
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

const _: () = assert!(core::mem::size_of::<ExecRecord>() == 276);
const _: () = assert!(core::mem::size_of::<ForkRecord>() == 48);
const _: () = assert!(core::mem::size_of::<ExitRecord>() == 32);

/// 固定布局的记录，每种只走一个通道
pub trait Record: Copy + 'static {
    const KIND: ChannelKind;
    /// 全零值，名称和路径均为空串
    const EMPTY: Self;

    /// 从 ring buffer 原始数据读出记录。长度不足时返回 `None`，多余的对齐字节忽略
    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < core::mem::size_of::<Self>() {
            return None;
        }
        // SAFETY: 长度已检查；记录都是 repr(C) 的纯数据，任意位模式均合法
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }
}

impl Record for ExecRecord {
    const KIND: ChannelKind = ChannelKind::Exec;
    const EMPTY: Self = Self {
        pid: 0,
        comm: [0; TASK_COMM_LEN],
        fname: [0; FILENAME_LEN],
    };
}

impl Record for ForkRecord {
    const KIND: ChannelKind = ChannelKind::Fork;
    const EMPTY: Self = Self {
        ts: 0,
        ppid: 0,
        pid: 0,
        pcomm: [0; TASK_COMM_LEN],
        comm: [0; TASK_COMM_LEN],
    };
}

impl Record for ExitRecord {
    const KIND: ChannelKind = ChannelKind::Exit;
    const EMPTY: Self = Self {
        ts: 0,
        pid: 0,
        comm: [0; TASK_COMM_LEN],
    };
}

/// 取第一个 null 之前的字节；没有 null 时取整个缓冲区
pub fn c_str_bytes(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}

/// 每通道、每 CPU 的计数。`submitted` 统计每次捕获尝试，兼作通道序号；
/// `dropped` 统计因 ring buffer 满而丢弃的记录
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub submitted: u64,
    pub dropped: u64,
}

#[cfg(feature = "user")]
mod pod {
    use super::*;
    use crate::layout::{ExecLayout, ExitLayout, ForkLayout, StrField};

    unsafe impl aya::Pod for ExecRecord {}
    unsafe impl aya::Pod for ForkRecord {}
    unsafe impl aya::Pod for ExitRecord {}
    unsafe impl aya::Pod for ChannelStats {}
    unsafe impl aya::Pod for StrField {}
    unsafe impl aya::Pod for ExecLayout {}
    unsafe impl aya::Pod for ForkLayout {}
    unsafe impl aya::Pod for ExitLayout {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_offsets_match_c_layout() {
        assert_eq!(core::mem::offset_of!(ExecRecord, comm), 4);
        assert_eq!(core::mem::offset_of!(ExecRecord, fname), 20);
        assert_eq!(core::mem::offset_of!(ForkRecord, ppid), 8);
        assert_eq!(core::mem::offset_of!(ForkRecord, pid), 12);
        assert_eq!(core::mem::offset_of!(ForkRecord, pcomm), 16);
        assert_eq!(core::mem::offset_of!(ForkRecord, comm), 32);
        assert_eq!(core::mem::offset_of!(ExitRecord, pid), 8);
        assert_eq!(core::mem::offset_of!(ExitRecord, comm), 12);
    }

    #[test]
    fn decode_reads_little_endian_fields_and_rejects_short_buffers() {
        let mut raw = [0u8; 32];
        raw[..8].copy_from_slice(&42u64.to_le_bytes());
        raw[8..12].copy_from_slice(&7u32.to_le_bytes());
        raw[12..16].copy_from_slice(b"bash");

        let exit = ExitRecord::decode(&raw).unwrap();
        assert_eq!(exit.ts, 42);
        assert_eq!(exit.pid, 7);
        assert_eq!(c_str_bytes(&exit.comm), b"bash");

        assert!(ExitRecord::decode(&raw[..31]).is_none());
        assert!(ExecRecord::decode(&raw).is_none());
    }

    #[test]
    fn c_str_stops_at_first_nul_or_buffer_end() {
        assert_eq!(c_str_bytes(b"ls\0garbage"), b"ls");
        assert_eq!(c_str_bytes(b"0123456789abcdef"), b"0123456789abcdef");
        assert_eq!(c_str_bytes(&[0u8; 4]), b"");
    }

    #[test]
    fn channel_names_are_distinct() {
        assert_eq!(ChannelKind::Exec.map_name(), "EXEC_EVENTS");
        assert_eq!(ChannelKind::Fork.map_name(), "FORK_EVENTS");
        assert_eq!(ChannelKind::Exit.map_name(), "EXIT_EVENTS");
        assert_eq!(ChannelKind::Exit.index(), 2);
    }
}
