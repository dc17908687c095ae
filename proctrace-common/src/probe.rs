//! tracepoint 程序共用的捕获逻辑。
//!
//! 所有外部读取经过 [`ProbeEnv`]，所有记录经 [`RecordSink`] 提交。内核中由 BPF
//! helper 和 ring buffer 实现，主机测试中用普通内存代替。fill 函数原地写记录的
//! 每个字段，不分配也不重试，读取失败的字段保持为零。

use crate::layout::{ExecLayout, ExitLayout, ForkLayout, StrField};
use crate::{ChannelStats, ExecRecord, ExitRecord, ForkRecord, Record, TASK_COMM_LEN};

/// BPF helper 返回的负 errno
pub type ProbeResult<T> = Result<T, i64>;

pub trait ProbeEnv {
    fn current_tgid(&self) -> u32;
    fn current_comm(&self) -> ProbeResult<[u8; TASK_COMM_LEN]>;
    fn ktime_ns(&self) -> u64;
    fn arg_u32(&self, offset: u32) -> ProbeResult<u32>;
    fn arg_u64(&self, offset: u32) -> ProbeResult<u64>;
    /// 把 tracepoint 记录中的内核字符串复制到 `dst`，以 NUL 结尾，最多 `dst.len() - 1` 字节
    fn arg_str(&self, field: StrField, dst: &mut [u8]) -> ProbeResult<usize>;
    /// 同 [`ProbeEnv::arg_str`]，读取调用进程地址空间中的字符串
    fn user_str(&self, addr: u64, dst: &mut [u8]) -> ProbeResult<usize>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// 缓冲区已满，新记录被丢弃
    Full,
}

pub trait RecordSink<T: Record> {
    /// 预留槽位，由 `fill` 原地填写后提交。不阻塞：通道已满时直接返回
    /// [`SubmitError::Full`]，不调用 `fill`
    fn submit_with<F: FnOnce(&mut T)>(&self, fill: F) -> Result<(), SubmitError>;
}

impl ChannelStats {
    pub fn account(&mut self, outcome: Result<(), SubmitError>) {
        self.submitted = self.submitted.wrapping_add(1);
        if outcome.is_err() {
            self.dropped = self.dropped.wrapping_add(1);
        }
    }
}

/// 清零未初始化的槽位（包括填充字节），再作为记录交给调用方填写
///
/// # Safety
///
/// `slot` 必须非空、按 `T` 对齐，并指向至少 `size_of::<T>()` 字节的可写内存。
/// 全零对每种记录都是合法值。
#[inline(always)]
pub unsafe fn zeroed_slot<'a, T: Record>(slot: *mut T) -> &'a mut T {
    core::ptr::write_bytes(slot as *mut u8, 0, core::mem::size_of::<T>());
    &mut *slot
}

/// 提交一条记录，并把结果计入通道计数
pub fn capture<T, S, F>(sink: &S, stats: Option<&mut ChannelStats>, fill: F) -> Result<(), SubmitError>
where
    T: Record,
    S: RecordSink<T>,
    F: FnOnce(&mut T),
{
    let outcome = sink.submit_with(fill);
    if let Some(stats) = stats {
        stats.account(outcome);
    }
    outcome
}

/// 在系统调用入口填写 exec 记录。文件名读取失败时返回 `false`，
/// 记录仍然完整，路径为空或不完整
pub fn fill_exec<E: ProbeEnv>(env: &E, layout: ExecLayout, rec: &mut ExecRecord) -> bool {
    rec.pid = env.current_tgid();
    rec.comm = env.current_comm().unwrap_or([0; TASK_COMM_LEN]);
    rec.fname = [0; crate::FILENAME_LEN];
    match env.arg_u64(layout.filename) {
        Ok(addr) if addr != 0 => env.user_str(addr, &mut rec.fname).is_ok(),
        _ => false,
    }
}

pub fn fill_fork<E: ProbeEnv>(env: &E, layout: ForkLayout, rec: &mut ForkRecord) {
    rec.ts = env.ktime_ns();
    rec.ppid = env.arg_u32(layout.parent_pid).unwrap_or(0);
    rec.pid = env.arg_u32(layout.child_pid).unwrap_or(0);
    rec.pcomm = [0; TASK_COMM_LEN];
    let _ = env.arg_str(layout.parent_comm, &mut rec.pcomm);
    rec.comm = [0; TASK_COMM_LEN];
    let _ = env.arg_str(layout.child_comm, &mut rec.comm);
}

pub fn fill_exit<E: ProbeEnv>(env: &E, layout: ExitLayout, rec: &mut ExitRecord) {
    rec.ts = env.ktime_ns();
    rec.pid = env.arg_u32(layout.pid).unwrap_or(0);
    rec.comm = [0; TASK_COMM_LEN];
    let _ = env.arg_str(layout.comm, &mut rec.comm);
}

/// 主机端的 `bpf_probe_read_*_str`：复制 `src` 第一个 NUL 之前的内容，
/// 截断到 `dst.len() - 1` 字节并写入结尾 NUL。返回写入字节数（含 NUL）
pub fn copy_c_str(src: &[u8], dst: &mut [u8]) -> usize {
    if dst.is_empty() {
        return 0;
    }
    let src = crate::c_str_bytes(src);
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src[..n]);
    dst[n] = 0;
    n + 1
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::layout::{data_loc_len, data_loc_offset};
    use crate::{c_str_bytes, FILENAME_LEN};
    use core::cell::RefCell;
    use std::vec;
    use std::vec::Vec;

    const EFAULT: i64 = -14;
    const USER_ADDR: u64 = 0x7fff_0000_1000;

    struct FakeEnv {
        tgid: u32,
        comm: [u8; TASK_COMM_LEN],
        now: u64,
        // 模拟 tracepoint 原始记录
        record: Vec<u8>,
        user_mem: Option<Vec<u8>>,
    }

    impl FakeEnv {
        fn new(record_len: usize) -> Self {
            Self {
                tgid: 4242,
                comm: *b"bash\0\0\0\0\0\0\0\0\0\0\0\0",
                now: 1_000,
                record: vec![0; record_len],
                user_mem: None,
            }
        }

        fn put_u32(&mut self, offset: u32, value: u32) {
            let o = offset as usize;
            self.record[o..o + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn put_u64(&mut self, offset: u32, value: u64) {
            let o = offset as usize;
            self.record[o..o + 8].copy_from_slice(&value.to_le_bytes());
        }

        fn put_bytes(&mut self, offset: u32, bytes: &[u8]) {
            let o = offset as usize;
            self.record[o..o + bytes.len()].copy_from_slice(bytes);
        }
    }

    impl ProbeEnv for FakeEnv {
        fn current_tgid(&self) -> u32 {
            self.tgid
        }

        fn current_comm(&self) -> ProbeResult<[u8; TASK_COMM_LEN]> {
            Ok(self.comm)
        }

        fn ktime_ns(&self) -> u64 {
            self.now
        }

        fn arg_u32(&self, offset: u32) -> ProbeResult<u32> {
            let o = offset as usize;
            let bytes = self.record.get(o..o + 4).ok_or(EFAULT)?;
            Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
        }

        fn arg_u64(&self, offset: u32) -> ProbeResult<u64> {
            let o = offset as usize;
            let bytes = self.record.get(o..o + 8).ok_or(EFAULT)?;
            Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
        }

        fn arg_str(&self, field: StrField, dst: &mut [u8]) -> ProbeResult<usize> {
            let src = if field.is_dynamic() {
                let desc = self.arg_u32(field.offset)?;
                let start = data_loc_offset(desc) as usize;
                let end = start + data_loc_len(desc) as usize;
                self.record.get(start..end).ok_or(EFAULT)?
            } else {
                self.record.get(field.offset as usize..).ok_or(EFAULT)?
            };
            Ok(copy_c_str(src, dst))
        }

        fn user_str(&self, addr: u64, dst: &mut [u8]) -> ProbeResult<usize> {
            match &self.user_mem {
                Some(mem) if addr == USER_ADDR => Ok(copy_c_str(mem, dst)),
                _ => {
                    dst.fill(0);
                    Err(EFAULT)
                }
            }
        }
    }

    #[test]
    fn zeroed_slot_clears_exit_padding() {
        let layout = ExitLayout::CLASSIC;
        let mut env = FakeEnv::new(32);
        env.put_bytes(layout.comm.offset, b"ls\0");
        env.put_u32(layout.pid, 300);

        // 模拟 ring buffer 中残留的旧数据
        let mut slot = core::mem::MaybeUninit::<ExitRecord>::uninit();
        unsafe {
            core::ptr::write_bytes(
                slot.as_mut_ptr() as *mut u8,
                0xAA,
                core::mem::size_of::<ExitRecord>(),
            );
        }
        let rec = unsafe { zeroed_slot(slot.as_mut_ptr()) };
        fill_exit(&env, layout, rec);

        let raw = unsafe {
            core::slice::from_raw_parts(
                slot.as_ptr() as *const u8,
                core::mem::size_of::<ExitRecord>(),
            )
        };
        // ts(8) + pid(4) + comm(16) 之后是 4 字节填充
        assert_eq!(&raw[28..32], &[0, 0, 0, 0]);
        assert!(raw.iter().all(|&b| b != 0xAA));
        assert_eq!(ExitRecord::decode(raw).unwrap().pid, 300);
    }

    struct VecSink<T> {
        capacity: usize,
        records: RefCell<Vec<T>>,
    }

    impl<T> VecSink<T> {
        fn with_capacity(capacity: usize) -> Self {
            Self {
                capacity,
                records: RefCell::new(Vec::new()),
            }
        }
    }

    impl<T: Record> RecordSink<T> for VecSink<T> {
        fn submit_with<F: FnOnce(&mut T)>(&self, fill: F) -> Result<(), SubmitError> {
            let mut records = self.records.borrow_mut();
            if records.len() >= self.capacity {
                return Err(SubmitError::Full);
            }
            let mut slot = T::EMPTY;
            fill(&mut slot);
            records.push(slot);
            Ok(())
        }
    }

    fn exec_env(path: &[u8]) -> FakeEnv {
        let mut env = FakeEnv::new(32);
        env.put_u64(ExecLayout::EXECVE.filename, USER_ADDR);
        let mut mem = path.to_vec();
        mem.push(0);
        env.user_mem = Some(mem);
        env
    }

    #[test]
    fn exec_captures_caller_and_path() {
        let env = exec_env(b"/bin/ls");
        let sink = VecSink::with_capacity(8);
        let mut path_ok = false;

        capture(&sink, None, |rec: &mut ExecRecord| {
            path_ok = fill_exec(&env, ExecLayout::EXECVE, rec)
        })
        .unwrap();

        assert!(path_ok);
        let records = sink.records.borrow();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, 4242);
        assert_eq!(c_str_bytes(&records[0].comm), b"bash");
        assert_eq!(c_str_bytes(&records[0].fname), b"/bin/ls");
    }

    #[test]
    fn exec_path_longer_than_buffer_is_truncated_with_terminator() {
        let long_path: Vec<u8> = core::iter::repeat(b'a').take(300).collect();
        let env = exec_env(&long_path);
        let mut rec = ExecRecord::EMPTY;

        assert!(fill_exec(&env, ExecLayout::EXECVE, &mut rec));

        assert_eq!(c_str_bytes(&rec.fname).len(), FILENAME_LEN - 1);
        assert_eq!(rec.fname[FILENAME_LEN - 1], 0);
        assert!(rec.fname[..FILENAME_LEN - 1].iter().all(|&b| b == b'a'));
    }

    #[test]
    fn exec_unreadable_path_still_produces_record() {
        let mut env = exec_env(b"/bin/true");
        env.user_mem = None;
        let sink = VecSink::with_capacity(8);
        let mut stats = ChannelStats::default();
        let mut path_ok = true;

        let outcome = capture(&sink, Some(&mut stats), |rec: &mut ExecRecord| {
            path_ok = fill_exec(&env, ExecLayout::EXECVE, rec)
        });

        assert_eq!(outcome, Ok(()));
        assert!(!path_ok);
        assert_eq!(stats, ChannelStats { submitted: 1, dropped: 0 });
        let records = sink.records.borrow();
        assert_eq!(records[0].pid, 4242);
        assert_eq!(c_str_bytes(&records[0].fname), b"");
    }

    #[test]
    fn execveat_reads_filename_after_fd() {
        let mut env = exec_env(b"/usr/bin/env");
        env.put_u64(ExecLayout::EXECVE.filename, 3);
        env.put_u64(ExecLayout::EXECVEAT.filename, USER_ADDR);
        let mut rec = ExecRecord::EMPTY;

        assert!(fill_exec(&env, ExecLayout::EXECVEAT, &mut rec));
        assert_eq!(c_str_bytes(&rec.fname), b"/usr/bin/env");
    }

    #[test]
    fn fork_reads_ids_and_names_from_classic_layout() {
        let layout = ForkLayout::CLASSIC;
        let mut env = FakeEnv::new(48);
        env.now = 77_000;
        env.put_bytes(layout.parent_comm.offset, b"bash\0");
        env.put_u32(layout.parent_pid, 100);
        env.put_bytes(layout.child_comm.offset, b"bash\0");
        env.put_u32(layout.child_pid, 101);
        let mut rec = ForkRecord::EMPTY;

        fill_fork(&env, layout, &mut rec);

        assert_eq!(rec.ts, 77_000);
        assert_eq!(rec.ppid, 100);
        assert_eq!(rec.pid, 101);
        assert_eq!(c_str_bytes(&rec.pcomm), b"bash");
        assert_eq!(c_str_bytes(&rec.comm), b"bash");
    }

    #[test]
    fn fork_follows_data_loc_descriptors_and_truncates_names() {
        let layout = ForkLayout {
            parent_comm: StrField::data_loc(8),
            child_comm: StrField::data_loc(16),
            parent_pid: 12,
            child_pid: 20,
        };
        let mut env = FakeEnv::new(96);
        env.put_u32(8, (6 << 16) | 24);
        env.put_bytes(24, b"init\0");
        env.put_u32(12, 1);
        env.put_u32(16, (24 << 16) | 40);
        env.put_bytes(40, b"a-very-long-worker-name\0");
        env.put_u32(20, 9000);
        let mut rec = ForkRecord::EMPTY;

        fill_fork(&env, layout, &mut rec);

        assert_eq!(rec.ppid, 1);
        assert_eq!(rec.pid, 9000);
        assert_eq!(c_str_bytes(&rec.pcomm), b"init");
        assert_eq!(c_str_bytes(&rec.comm), b"a-very-long-wor");
        assert_eq!(rec.comm[TASK_COMM_LEN - 1], 0);
    }

    #[test]
    fn exit_reads_pid_and_name() {
        let layout = ExitLayout::CLASSIC;
        let mut env = FakeEnv::new(32);
        env.now = 5;
        env.put_bytes(layout.comm.offset, b"sleep\0");
        env.put_u32(layout.pid, 333);
        let mut rec = ExitRecord::EMPTY;

        fill_exit(&env, layout, &mut rec);

        assert_eq!(rec.ts, 5);
        assert_eq!(rec.pid, 333);
        assert_eq!(c_str_bytes(&rec.comm), b"sleep");
    }

    #[test]
    fn unreadable_fields_are_zeroed_not_fatal() {
        // 记录比布局短：pid 读取失败
        let env = FakeEnv::new(10);
        let mut rec = ExitRecord::EMPTY;
        rec.pid = 99;

        fill_exit(&env, ExitLayout::CLASSIC, &mut rec);

        assert_eq!(rec.pid, 0);
    }

    #[test]
    fn full_channel_drops_newest_and_counts_it() {
        let layout = ExitLayout::CLASSIC;
        let mut env = FakeEnv::new(32);
        env.put_u32(layout.pid, 1);
        let sink = VecSink::with_capacity(2);
        let mut stats = ChannelStats::default();

        for _ in 0..5 {
            let _ = capture(&sink, Some(&mut stats), |rec: &mut ExitRecord| {
                fill_exit(&env, layout, rec)
            });
        }

        assert_eq!(sink.records.borrow().len(), 2);
        assert_eq!(stats, ChannelStats { submitted: 5, dropped: 3 });
    }

    #[test]
    fn copy_c_str_matches_helper_semantics() {
        let mut dst = [0xffu8; 4];
        assert_eq!(copy_c_str(b"abcdef", &mut dst), 4);
        assert_eq!(&dst, b"abc\0");

        let mut dst = [0xffu8; 8];
        assert_eq!(copy_c_str(b"ab\0cd", &mut dst), 3);
        assert_eq!(&dst[..3], b"ab\0");
    }
}
