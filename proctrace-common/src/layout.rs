//! 以加载期全局变量传给 eBPF 程序的 tracepoint 字段偏移。
//!
//! 用户态从 tracefs 的 `format` 文件解析得到；找不到 tracefs 时使用 `CLASSIC`
//! 中的传统布局。

pub const EXECVE_LAYOUT_GLOBAL: &str = "EXECVE_LAYOUT";
pub const EXECVEAT_LAYOUT_GLOBAL: &str = "EXECVEAT_LAYOUT";
pub const FORK_LAYOUT_GLOBAL: &str = "FORK_LAYOUT";
pub const EXIT_LAYOUT_GLOBAL: &str = "EXIT_LAYOUT";

/// tracepoint 记录中的字符串字段：位于 `offset` 的内联 `char[N]`，
/// 或者 `offset` 处是 u32 描述符的 `__data_loc char[]`
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StrField {
    pub offset: u32,
    pub dynamic: u32,
}

impl StrField {
    pub const fn inline(offset: u32) -> Self {
        Self { offset, dynamic: 0 }
    }

    pub const fn data_loc(offset: u32) -> Self {
        Self { offset, dynamic: 1 }
    }

    pub const fn is_dynamic(&self) -> bool {
        self.dynamic != 0
    }
}

/// `__data_loc` 描述符：低 16 位是相对记录起始的偏移，高 16 位是长度
pub const fn data_loc_offset(descriptor: u32) -> u32 {
    descriptor & 0xffff
}

pub const fn data_loc_len(descriptor: u32) -> u32 {
    descriptor >> 16
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecLayout {
    /// 系统调用参数 `const char *filename` 的偏移
    pub filename: u32,
}

impl ExecLayout {
    // common 字段 8 字节 + __syscall_nr(4) + 填充(4)
    pub const EXECVE: Self = Self { filename: 16 };
    // execveat 在 filename 前还有 int fd（按 long 存放）
    pub const EXECVEAT: Self = Self { filename: 24 };
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForkLayout {
    pub parent_comm: StrField,
    pub child_comm: StrField,
    pub parent_pid: u32,
    pub child_pid: u32,
}

impl ForkLayout {
    pub const CLASSIC: Self = Self {
        parent_comm: StrField::inline(8),
        child_comm: StrField::inline(28),
        parent_pid: 24,
        child_pid: 44,
    };
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitLayout {
    pub comm: StrField,
    pub pid: u32,
}

impl ExitLayout {
    pub const CLASSIC: Self = Self {
        comm: StrField::inline(8),
        pid: 24,
    };
}
