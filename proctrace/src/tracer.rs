use crate::{
    channel::EventChannel,
    config::AppConfig,
    event_bus::ProcessEvent,
    loader::ProbeLoader,
    publisher::{Publisher, TxPublisher},
    stats::{ChannelCounters, ChannelSnapshot, GapTracker},
};
use anyhow::Result;
use aya::Ebpf;
use proctrace_common::{ChannelKind, ExecRecord, ExitRecord, ForkRecord};
use std::io;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::{sync::broadcast, sync::Notify, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

/// 持有已加载的探针，以及把三个 ring buffer 中的记录转发到事件总线的任务
pub struct LifecycleTracer {
    // 程序和 ring buffer 的生命周期跟随 Ebpf 对象
    _ebpf: Ebpf,
    task_handles: Vec<JoinHandle<()>>,
    shutdown_flag: Arc<AtomicBool>,
    stats_request: Arc<Notify>,
}

impl LifecycleTracer {
    pub fn start(config: &AppConfig, event_tx: broadcast::Sender<ProcessEvent>) -> Result<Self> {
        info!("[Tracer] Loading probes and attaching tracepoints...");
        let mut ebpf = ProbeLoader::load_and_attach(config)?;

        let exec_channel = EventChannel::<ExecRecord>::from_ebpf(&mut ebpf)?;
        let fork_channel = EventChannel::<ForkRecord>::from_ebpf(&mut ebpf)?;
        let exit_channel = EventChannel::<ExitRecord>::from_ebpf(&mut ebpf)?;
        let counters = ChannelCounters::from_ebpf(&mut ebpf)?;

        let delivered = [
            exec_channel.delivered_counter(),
            fork_channel.delivered_counter(),
            exit_channel.delivered_counter(),
        ];

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let stats_request = Arc::new(Notify::new());
        let publisher = TxPublisher::new(event_tx);

        let channels = LifecycleChannels {
            fork: fork_channel,
            exec: exec_channel,
            exit: exit_channel,
        };

        let task_handles = vec![
            spawn_listener(channels, publisher, shutdown_flag.clone()),
            spawn_stats_reporter(
                counters,
                delivered,
                Duration::from_secs(config.transport.stats_interval_secs),
                shutdown_flag.clone(),
                stats_request.clone(),
            ),
        ];

        info!(
            "[Tracer] All {} worker tasks have been dispatched.",
            task_handles.len()
        );

        Ok(Self {
            _ebpf: ebpf,
            task_handles,
            shutdown_flag,
            stats_request,
        })
    }

    /// 请求统计任务立即输出一次快照
    pub fn request_stats_report(&self) {
        self.stats_request.notify_one();
    }

    pub async fn shutdown(&mut self) {
        info!("[Tracer] Initiating shutdown...");

        // 各任务最多 1 秒内看到关闭标志
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.stats_request.notify_one();

        let mut completed_tasks = 0;
        for handle in self.task_handles.drain(..) {
            match timeout(Duration::from_secs(3), handle).await {
                Ok(_) => completed_tasks += 1,
                Err(_) => warn!("[Tracer] Task did not complete within timeout, force stopping."),
            }
        }

        info!(
            "[Tracer] Shutdown completed. {} tasks stopped gracefully.",
            completed_tasks
        );
    }
}

impl Drop for LifecycleTracer {
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        debug!("[Tracer] Tracer dropped, shutdown flag set.");
    }
}

/// 三个通道由同一个任务读取，保证每次唤醒内的事件顺序
struct LifecycleChannels {
    fork: EventChannel<ForkRecord>,
    exec: EventChannel<ExecRecord>,
    exit: EventChannel<ExitRecord>,
}

impl LifecycleChannels {
    /// 任一通道可读即返回
    async fn readable(&mut self) -> Result<(), (ChannelKind, io::Error)> {
        tokio::select! {
            r = self.fork.readable() => r.map_err(|e| (ChannelKind::Fork, e)),
            r = self.exec.readable() => r.map_err(|e| (ChannelKind::Exec, e)),
            r = self.exit.readable() => r.map_err(|e| (ChannelKind::Exit, e)),
        }
    }

    fn drain(&mut self) -> Vec<ProcessEvent> {
        let forks = self.fork.drain();
        let execs = self.exec.drain();
        let exits = self.exit.drain();
        order_batch(forks, execs, exits)
    }

    fn report_malformed(&self) {
        let counts = [
            (ChannelKind::Fork, self.fork.malformed()),
            (ChannelKind::Exec, self.exec.malformed()),
            (ChannelKind::Exit, self.exit.malformed()),
        ];
        for (kind, malformed) in counts {
            if malformed > 0 {
                warn!(
                    "[Worker] {} channel skipped {} malformed records",
                    kind.as_str(),
                    malformed
                );
            }
        }
    }
}

/// 把一次唤醒读到的三类记录排成一个事件序列。
///
/// fork 和 exit 按内核时间戳排序，时间戳相同时 fork 在前。exec 记录没有
/// 时间戳：放在同一 pid 最后一次 fork 之后的第一个 exit 之前，没有这样的
/// exit 时放在末尾。
pub fn order_batch(
    forks: Vec<ForkRecord>,
    execs: Vec<ExecRecord>,
    exits: Vec<ExitRecord>,
) -> Vec<ProcessEvent> {
    let mut timed: Vec<ProcessEvent> = Vec::with_capacity(forks.len() + exits.len());
    timed.extend(forks.into_iter().map(ProcessEvent::from));
    timed.extend(exits.into_iter().map(ProcessEvent::from));
    // 稳定排序
    timed.sort_by_key(|event| event.timestamp_ns().unwrap_or(0));

    let mut slots: Vec<Vec<ProcessEvent>> = vec![Vec::new(); timed.len() + 1];
    for exec in execs {
        let pid = exec.pid;
        let after_fork = timed
            .iter()
            .rposition(|e| matches!(e, ProcessEvent::Fork(f) if f.child_pid == pid))
            .map_or(0, |i| i + 1);
        let slot = timed[after_fork..]
            .iter()
            .position(|e| matches!(e, ProcessEvent::Exit(x) if x.pid == pid))
            .map_or(timed.len(), |i| after_fork + i);
        slots[slot].push(exec.into());
    }

    let mut ordered = Vec::with_capacity(timed.len() + slots.iter().map(Vec::len).sum::<usize>());
    let mut slots = slots.into_iter();
    for event in timed {
        ordered.extend(slots.next().unwrap_or_default());
        ordered.push(event);
    }
    for rest in slots {
        ordered.extend(rest);
    }
    ordered
}

fn spawn_listener(
    mut channels: LifecycleChannels,
    publisher: TxPublisher,
    shutdown_flag: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("[Worker] Listener task for fork, exec and exit channels started.");

        while !shutdown_flag.load(Ordering::SeqCst) {
            match timeout(Duration::from_secs(1), channels.readable()).await {
                Ok(Ok(())) => {}
                Ok(Err((kind, e))) => {
                    warn!(
                        "[Worker] Poll error on {} channel: {}, continuing",
                        kind.as_str(),
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                // 超时也读一次，兜底可能错过的唤醒
                Err(_) => {}
            }

            // 其余通道的就绪状态留到下一轮清除，这里一并读空
            for event in channels.drain() {
                debug!(pid = event.pid(), "[Worker] {} event received", event.kind().as_str());
                if publisher.publish(event).is_err() {
                    debug!("[Worker] No active subscribers, event discarded");
                }
            }
        }

        channels.report_malformed();
        info!("[Worker] Listener task shutting down.");
    })
}

fn take_snapshots(counters: &ChannelCounters, delivered: &[Arc<AtomicU64>; 3]) -> Vec<ChannelSnapshot> {
    ChannelKind::ALL
        .iter()
        .filter_map(|&kind| match counters.read(kind) {
            Ok(stats) => Some(ChannelSnapshot::new(
                kind,
                stats,
                delivered[kind.index() as usize].load(Ordering::Relaxed),
            )),
            Err(e) => {
                warn!("[Stats] Failed to read counters for {} channel: {}", kind.as_str(), e);
                None
            }
        })
        .collect()
}

fn spawn_stats_reporter(
    counters: ChannelCounters,
    delivered: [Arc<AtomicU64>; 3],
    interval: Duration,
    shutdown_flag: Arc<AtomicBool>,
    stats_request: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut gaps = GapTracker::new();
        let mut ticker = tokio::time::interval(interval);
        // 第一次 tick 立即返回
        ticker.tick().await;

        loop {
            let requested = tokio::select! {
                _ = ticker.tick() => false,
                _ = stats_request.notified() => true,
            };
            let shutting_down = shutdown_flag.load(Ordering::SeqCst);

            for snapshot in take_snapshots(&counters, &delivered) {
                let lost = gaps.observe(&snapshot);
                if lost > 0 {
                    warn!(
                        channel = snapshot.kind.as_str(),
                        lost, "[Stats] Ring buffer full, {} records dropped since last check", lost
                    );
                }
                if requested || shutting_down {
                    info!("[Stats] {}", snapshot);
                } else {
                    debug!("[Stats] {}", snapshot);
                }
            }

            if shutting_down {
                info!("[Stats] Total records dropped: {}", gaps.total_dropped());
                break;
            }
        }
    })
}
