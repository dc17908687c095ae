use crate::config::AppConfig;
use crate::tracefs::{self, FormatError, LayoutError, Tracefs};
use aya::{programs::TracePoint, Ebpf, EbpfLoader};
use proctrace_common::{
    layout::{
        ExecLayout, ExitLayout, ForkLayout, EXECVEAT_LAYOUT_GLOBAL, EXECVE_LAYOUT_GLOBAL,
        EXIT_LAYOUT_GLOBAL, FORK_LAYOUT_GLOBAL,
    },
    ChannelKind,
};
use std::fmt;
use tracing::{debug, info, warn};

/// (程序名, tracepoint 分类, tracepoint 名称)
pub const PROBES: [(&str, &str, &str); 4] = [
    ("proctrace_execve", "syscalls", "sys_enter_execve"),
    ("proctrace_execveat", "syscalls", "sys_enter_execveat"),
    ("proctrace_fork", "sched", "sched_process_fork"),
    ("proctrace_exit", "sched", "sched_process_exit"),
];

#[derive(Debug)]
pub enum AttachError {
    TracepointMissing {
        category: &'static str,
        name: &'static str,
    },
    Format {
        tracepoint: &'static str,
        source: FormatError,
    },
    Layout {
        tracepoint: &'static str,
        source: LayoutError,
    },
    Load(aya::EbpfError),
    Program {
        program: &'static str,
        source: aya::programs::ProgramError,
    },
    ProgramMissing(&'static str),
    MapMissing(&'static str),
    Map {
        name: &'static str,
        source: aya::maps::MapError,
    },
    Poll {
        name: &'static str,
        source: std::io::Error,
    },
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachError::TracepointMissing { category, name } => {
                write!(f, "tracepoint {}:{} is not available on this kernel", category, name)
            }
            AttachError::Format { tracepoint, source } => {
                write!(f, "cannot read format of {}: {}", tracepoint, source)
            }
            AttachError::Layout { tracepoint, source } => {
                write!(f, "unsupported record layout for {}: {}", tracepoint, source)
            }
            AttachError::Load(e) => write!(f, "failed to load eBPF object: {}", e),
            AttachError::Program { program, source } => {
                write!(f, "failed to load or attach program '{}': {}", program, source)
            }
            AttachError::ProgramMissing(name) => {
                write!(f, "program '{}' not found in eBPF object", name)
            }
            AttachError::MapMissing(name) => write!(f, "map '{}' not found in eBPF object", name),
            AttachError::Map { name, source } => write!(f, "cannot open map '{}': {}", name, source),
            AttachError::Poll { name, source } => {
                write!(f, "cannot register map '{}' with the reactor: {}", name, source)
            }
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AttachError::Format { source, .. } => Some(source),
            AttachError::Layout { source, .. } => Some(source),
            AttachError::Load(e) => Some(e),
            AttachError::Program { source, .. } => Some(source),
            AttachError::Map { source, .. } => Some(source),
            AttachError::Poll { source, .. } => Some(source),
            AttachError::TracepointMissing { .. }
            | AttachError::ProgramMissing(_)
            | AttachError::MapMissing(_) => None,
        }
    }
}

impl From<aya::EbpfError> for AttachError {
    fn from(err: aya::EbpfError) -> AttachError {
        AttachError::Load(err)
    }
}

/// 加载前写入对象只读全局变量的字段布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLayouts {
    pub execve: ExecLayout,
    pub execveat: ExecLayout,
    pub fork: ForkLayout,
    pub exit: ExitLayout,
}

impl Default for ResolvedLayouts {
    fn default() -> Self {
        Self {
            execve: ExecLayout::EXECVE,
            execveat: ExecLayout::EXECVEAT,
            fork: ForkLayout::CLASSIC,
            exit: ExitLayout::CLASSIC,
        }
    }
}

fn read_format(
    tracefs: &Tracefs,
    category: &'static str,
    name: &'static str,
) -> Result<tracefs::TracepointFormat, AttachError> {
    if !tracefs.has_event(category, name) {
        return Err(AttachError::TracepointMissing { category, name });
    }
    tracefs
        .read_format(category, name)
        .map_err(|source| AttachError::Format {
            tracepoint: name,
            source,
        })
}

/// 读取四个 tracepoint 的 format 文件并解析出字段偏移
pub fn resolve_layouts(tracefs: &Tracefs) -> Result<ResolvedLayouts, AttachError> {
    let layout_err = |tracepoint: &'static str| {
        move |source: LayoutError| AttachError::Layout { tracepoint, source }
    };

    let execve = tracefs::exec_layout(&read_format(tracefs, "syscalls", "sys_enter_execve")?)
        .map_err(layout_err("sys_enter_execve"))?;
    let execveat = tracefs::exec_layout(&read_format(tracefs, "syscalls", "sys_enter_execveat")?)
        .map_err(layout_err("sys_enter_execveat"))?;
    let fork = tracefs::fork_layout(&read_format(tracefs, "sched", "sched_process_fork")?)
        .map_err(layout_err("sched_process_fork"))?;
    let exit = tracefs::exit_layout(&read_format(tracefs, "sched", "sched_process_exit")?)
        .map_err(layout_err("sched_process_exit"))?;

    Ok(ResolvedLayouts {
        execve,
        execveat,
        fork,
        exit,
    })
}

fn bump_memlock_rlimit() {
    use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};
    // 5.11 之前的内核按 memlock 计费 BPF map
    if let Err(e) = setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY) {
        debug!("Loader: remove limit on locked memory failed: {}", e);
    }
}

pub struct ProbeLoader;

impl ProbeLoader {
    /// 加载探针对象并挂载 [`PROBES`] 中的每个程序。
    ///
    /// 任何失败都是致命的，缺少任一通道都无法继续。
    pub fn load_and_attach(config: &AppConfig) -> Result<Ebpf, AttachError> {
        bump_memlock_rlimit();

        let layouts = match Tracefs::locate(config.tracefs_root.as_deref()) {
            Some(tracefs) => {
                info!("Loader: using tracefs at {}", tracefs.root().display());
                resolve_layouts(&tracefs)?
            }
            None => {
                warn!("Loader: tracefs not found, assuming classic tracepoint layouts");
                ResolvedLayouts::default()
            }
        };
        debug!("Loader: resolved layouts {:?}", layouts);

        let mut loader = EbpfLoader::new();
        loader
            .set_global(EXECVE_LAYOUT_GLOBAL, &layouts.execve, true)
            .set_global(EXECVEAT_LAYOUT_GLOBAL, &layouts.execveat, true)
            .set_global(FORK_LAYOUT_GLOBAL, &layouts.fork, true)
            .set_global(EXIT_LAYOUT_GLOBAL, &layouts.exit, true);
        for kind in ChannelKind::ALL {
            loader.set_max_entries(kind.map_name(), config.transport.buffer_bytes(kind));
        }
        let mut ebpf = loader.load(aya::include_bytes_aligned!(concat!(
            env!("OUT_DIR"),
            "/proctrace"
        )))?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            // 对象里没有日志语句时会走到这里
            warn!("Loader: failed to initialize eBPF logger: {}", e);
        }

        for (program, category, name) in PROBES {
            let tracepoint: &mut TracePoint = ebpf
                .program_mut(program)
                .ok_or(AttachError::ProgramMissing(program))?
                .try_into()
                .map_err(|source| AttachError::Program { program, source })?;
            tracepoint
                .load()
                .map_err(|source| AttachError::Program { program, source })?;
            tracepoint
                .attach(category, name)
                .map_err(|source| AttachError::Program { program, source })?;
            info!("Loader: attached {} to {}:{}", program, category, name);
        }

        Ok(ebpf)
    }
}
