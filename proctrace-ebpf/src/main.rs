#![cfg_attr(feature = "build-ebpf", no_std)]
#![cfg_attr(feature = "build-ebpf", no_main)]

// 将 eBPF 相关代码放到一个 cfg 模块里，避免到处写 #[cfg(...)]
#[cfg(feature = "build-ebpf")]
mod ebpf {
    use aya_ebpf::{
        helpers::{
            bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns,
            bpf_probe_read_kernel_str_bytes, bpf_probe_read_user_str_bytes,
        },
        macros::{map, tracepoint},
        maps::{PerCpuArray, RingBuf},
        programs::TracePointContext,
        EbpfContext,
    };
    use aya_log_ebpf::debug;
    use proctrace_common::{
        layout::{data_loc_offset, ExecLayout, ExitLayout, ForkLayout, StrField},
        probe::{
            capture, fill_exec, fill_exit, fill_fork, zeroed_slot, ProbeEnv, ProbeResult, RecordSink,
            SubmitError,
        },
        ChannelKind, ChannelStats, ExecRecord, ExitRecord, ForkRecord, Record, TASK_COMM_LEN,
    };

    // 三种事件各用一条 ring buffer；大小可由用户态在加载时覆盖
    #[map]
    static EXEC_EVENTS: RingBuf = RingBuf::with_byte_size(256 * 1024, 0);

    #[map]
    static FORK_EVENTS: RingBuf = RingBuf::with_byte_size(128 * 1024, 0);

    #[map]
    static EXIT_EVENTS: RingBuf = RingBuf::with_byte_size(128 * 1024, 0);

    // 下标为 ChannelKind，每 CPU 一份计数，无需原子操作
    #[map]
    static CHANNEL_STATS: PerCpuArray<ChannelStats> = PerCpuArray::with_max_entries(3, 0);

    // 由用户态根据 tracefs format 改写
    #[no_mangle]
    static EXECVE_LAYOUT: ExecLayout = ExecLayout::EXECVE;
    #[no_mangle]
    static EXECVEAT_LAYOUT: ExecLayout = ExecLayout::EXECVEAT;
    #[no_mangle]
    static FORK_LAYOUT: ForkLayout = ForkLayout::CLASSIC;
    #[no_mangle]
    static EXIT_LAYOUT: ExitLayout = ExitLayout::CLASSIC;

    struct TracepointEnv<'a> {
        ctx: &'a TracePointContext,
    }

    impl ProbeEnv for TracepointEnv<'_> {
        fn current_tgid(&self) -> u32 {
            (bpf_get_current_pid_tgid() >> 32) as u32
        }

        fn current_comm(&self) -> ProbeResult<[u8; TASK_COMM_LEN]> {
            bpf_get_current_comm().map_err(|e| e as i64)
        }

        fn ktime_ns(&self) -> u64 {
            unsafe { bpf_ktime_get_ns() }
        }

        fn arg_u32(&self, offset: u32) -> ProbeResult<u32> {
            unsafe { self.ctx.read_at::<u32>(offset as usize) }.map_err(|e| e as i64)
        }

        fn arg_u64(&self, offset: u32) -> ProbeResult<u64> {
            unsafe { self.ctx.read_at::<u64>(offset as usize) }.map_err(|e| e as i64)
        }

        fn arg_str(&self, field: StrField, dst: &mut [u8]) -> ProbeResult<usize> {
            let offset = if field.is_dynamic() {
                data_loc_offset(self.arg_u32(field.offset)?)
            } else {
                field.offset
            };
            let src = unsafe { (self.ctx.as_ptr() as *const u8).add(offset as usize) };
            unsafe { bpf_probe_read_kernel_str_bytes(src, dst) }
                .map(|s| s.len() + 1)
                .map_err(|e| e as i64)
        }

        fn user_str(&self, addr: u64, dst: &mut [u8]) -> ProbeResult<usize> {
            unsafe { bpf_probe_read_user_str_bytes(addr as *const u8, dst) }
                .map(|s| s.len() + 1)
                .map_err(|e| e as i64)
        }
    }

    struct Channel(&'static RingBuf);

    impl<T: Record> RecordSink<T> for Channel {
        fn submit_with<F: FnOnce(&mut T)>(&self, fill: F) -> Result<(), SubmitError> {
            let Some(mut entry) = self.0.reserve::<T>(0) else {
                return Err(SubmitError::Full);
            };
            // 槽位里可能是旧数据，先整体清零再填写
            let rec = unsafe { zeroed_slot(entry.as_mut_ptr()) };
            fill(rec);
            entry.submit(0);
            Ok(())
        }
    }

    #[inline(always)]
    fn channel_stats(kind: ChannelKind) -> Option<&'static mut ChannelStats> {
        CHANNEL_STATS
            .get_ptr_mut(kind.index())
            .map(|ptr| unsafe { &mut *ptr })
    }

    #[tracepoint]
    pub fn proctrace_execve(ctx: TracePointContext) -> u32 {
        let layout = unsafe { core::ptr::read_volatile(&EXECVE_LAYOUT) };
        match try_proctrace_exec(&ctx, layout) {
            Ok(ret) => ret,
            Err(ret) => ret,
        }
    }

    #[tracepoint]
    pub fn proctrace_execveat(ctx: TracePointContext) -> u32 {
        let layout = unsafe { core::ptr::read_volatile(&EXECVEAT_LAYOUT) };
        match try_proctrace_exec(&ctx, layout) {
            Ok(ret) => ret,
            Err(ret) => ret,
        }
    }

    #[inline(always)]
    fn try_proctrace_exec(ctx: &TracePointContext, layout: ExecLayout) -> Result<u32, u32> {
        let env = TracepointEnv { ctx };
        let mut path_ok = true;
        let submitted = capture(
            &Channel(&EXEC_EVENTS),
            channel_stats(ChannelKind::Exec),
            |rec: &mut ExecRecord| path_ok = fill_exec(&env, layout, rec),
        );
        if submitted.is_ok() && !path_ok {
            debug!(ctx, "exec filename unreadable, tgid {}", env.current_tgid());
        }
        // 满了就丢，不影响 execve 本身
        Ok(0)
    }

    #[tracepoint]
    pub fn proctrace_fork(ctx: TracePointContext) -> u32 {
        match try_proctrace_fork(&ctx) {
            Ok(ret) => ret,
            Err(ret) => ret,
        }
    }

    fn try_proctrace_fork(ctx: &TracePointContext) -> Result<u32, u32> {
        let layout = unsafe { core::ptr::read_volatile(&FORK_LAYOUT) };
        let env = TracepointEnv { ctx };
        let _ = capture(
            &Channel(&FORK_EVENTS),
            channel_stats(ChannelKind::Fork),
            |rec: &mut ForkRecord| fill_fork(&env, layout, rec),
        );
        Ok(0)
    }

    #[tracepoint]
    pub fn proctrace_exit(ctx: TracePointContext) -> u32 {
        match try_proctrace_exit(&ctx) {
            Ok(ret) => ret,
            Err(ret) => ret,
        }
    }

    fn try_proctrace_exit(ctx: &TracePointContext) -> Result<u32, u32> {
        let layout = unsafe { core::ptr::read_volatile(&EXIT_LAYOUT) };
        let env = TracepointEnv { ctx };
        let _ = capture(
            &Channel(&EXIT_EVENTS),
            channel_stats(ChannelKind::Exit),
            |rec: &mut ExitRecord| fill_exit(&env, layout, rec),
        );
        Ok(0)
    }

    // 提供 panic 处理，仅在 eBPF 特性开启时使用（no_std 环境）
    #[cfg(not(test))]
    #[panic_handler]
    fn panic(_info: &core::panic::PanicInfo) -> ! {
        loop {}
    }

    // bpf_probe_read_*_str 是 GPL-only helper
    #[link_section = "license"]
    #[no_mangle]
    static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
}

// 未启用 eBPF 时，提供一个空的 std main，避免宿主构建报错。
#[cfg(not(feature = "build-ebpf"))]
fn main() {
    eprintln!("proctrace-ebpf built without 'build-ebpf' feature; skipping eBPF program");
}
