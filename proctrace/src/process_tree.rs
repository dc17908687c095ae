//! 根据生命周期事件流重建进程树。
//!
//! 节点按 pid 平铺存放，父子关系显式记录。一个单元是进程最上层非初始祖先
//! 之下的子树；单元内所有进程退出后，单元移出活动集合，放入有界历史并作为
//! 已完成的树返回。
//!
//! 三个通道之间可能乱序：先到的 exec 留下占位节点，由随后的 fork 接管；
//! 先到的 exit 暂存，等 fork 到达后再应用。

use crate::event_bus::{ExecEvent, ExitEvent, ForkEvent, ProcessEvent};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

/// 未知 pid 的 exit 最多保留的条数
pub const PENDING_EXIT_LIMIT: usize = 1024;
/// 超出该时间窗口仍未等到 fork 的 exit 被丢弃
pub const PENDING_EXIT_WINDOW_NS: u64 = 5_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNode {
    pub pid: u32,
    pub ppid: u32,
    pub comm: String,
    pub filename: Option<String>,
    /// 单调时钟纳秒，跟踪开始前就存在的进程为 0
    pub creation_time: u64,
    pub exit_time: u64,
    pub is_active: bool,
    /// 只作为 fork 父进程或 exec 调用者出现过，未见其 fork
    pub is_initial: bool,
    parent: Option<u32>,
    children: BTreeSet<u32>,
}

impl ProcessNode {
    fn new(pid: u32, ppid: u32, comm: String, creation_time: u64, parent: Option<u32>) -> Self {
        Self {
            pid,
            ppid,
            comm,
            filename: None,
            creation_time,
            exit_time: 0,
            is_active: true,
            is_initial: false,
            parent,
            children: BTreeSet::new(),
        }
    }

    fn initial(pid: u32, comm: String) -> Self {
        Self {
            is_initial: true,
            ..Self::new(pid, 0, comm, 0, None)
        }
    }

    /// 只由 exec 创建、还没等到 fork 的占位节点
    fn is_exec_placeholder(&self) -> bool {
        self.is_initial
            && self.parent.is_none()
            && self.creation_time == 0
            && self.children.is_empty()
    }

    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = u32> + '_ {
        self.children.iter().copied()
    }
}

/// 子树快照，子节点按 pid 排序
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessTree {
    pub pid: u32,
    pub ppid: u32,
    pub comm: String,
    pub filename: Option<String>,
    pub creation_time: u64,
    pub exit_time: u64,
    pub is_active: bool,
    pub is_initial: bool,
    pub children: Vec<ProcessTree>,
}

impl ProcessTree {
    /// 存活秒数：到退出为止，仍在运行则到 `now_ns`。起始时间未知时为 `None`
    pub fn execution_time_s(&self, now_ns: u64) -> Option<f64> {
        if self.creation_time == 0 {
            return None;
        }
        let end = if self.exit_time != 0 {
            self.exit_time
        } else {
            now_ns
        };
        if end < self.creation_time {
            return Some(0.0);
        }
        Some((end - self.creation_time) as f64 / 1_000_000_000.0)
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(ProcessTree::node_count).sum::<usize>()
    }
}

/// 早于对应 fork 到达的 exit
#[derive(Debug, Clone)]
struct PendingExit {
    exit_time: u64,
    comm: String,
    filename: Option<String>,
}

pub struct ProcessTreeTracker {
    nodes: HashMap<u32, ProcessNode>,
    history: VecDeque<ProcessTree>,
    history_len: usize,
    pending_exits: HashMap<u32, PendingExit>,
    latest_ts: u64,
}

impl ProcessTreeTracker {
    pub fn new(history_len: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            history: VecDeque::with_capacity(history_len),
            history_len,
            pending_exits: HashMap::new(),
            latest_ts: 0,
        }
    }

    /// 正在等待 fork 的 exit 数量
    pub fn pending_exit_count(&self) -> usize {
        self.pending_exits.len()
    }

    pub fn node(&self, pid: u32) -> Option<&ProcessNode> {
        self.nodes.get(&pid)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// 最近完成的树，最新的在前
    pub fn history(&self) -> impl Iterator<Item = &ProcessTree> {
        self.history.iter()
    }

    /// 处理一个事件，返回因此完成的树
    pub fn handle_event(&mut self, event: &ProcessEvent) -> Vec<ProcessTree> {
        match event {
            ProcessEvent::Fork(fork) => self.handle_fork(fork),
            ProcessEvent::Exec(exec) => {
                self.handle_exec(exec);
                Vec::new()
            }
            ProcessEvent::Exit(exit) => self.handle_exit(exit),
        }
    }

    pub fn handle_fork(&mut self, event: &ForkEvent) -> Vec<ProcessTree> {
        let mut finished = Vec::new();
        self.latest_ts = self.latest_ts.max(event.timestamp_ns);

        // exec 先于 fork 到达时留下的占位节点由 fork 接管
        let mut filename = None;
        match self.nodes.get(&event.child_pid) {
            Some(node) if node.is_exec_placeholder() => {
                filename = self.nodes.remove(&event.child_pid).and_then(|n| n.filename);
            }
            // pid 被复用：旧节点先移出
            Some(_) => finished.extend(self.evict(event.child_pid)),
            None => {}
        }

        let parent = self
            .nodes
            .entry(event.parent_pid)
            .or_insert_with(|| ProcessNode::initial(event.parent_pid, event.parent_comm.clone()));
        parent.children.insert(event.child_pid);

        let mut child = ProcessNode::new(
            event.child_pid,
            event.parent_pid,
            event.child_comm.clone(),
            event.timestamp_ns,
            Some(event.parent_pid),
        );
        child.filename = filename;

        let pending = self.pending_exits.remove(&event.child_pid);
        match pending {
            Some(exit) if exit.exit_time >= event.timestamp_ns => {
                debug!(pid = event.child_pid, "applying exit received before fork");
                child.is_active = false;
                child.exit_time = exit.exit_time;
                if !exit.comm.is_empty() {
                    child.comm = exit.comm;
                }
                if exit.filename.is_some() {
                    child.filename = exit.filename;
                }
                self.nodes.insert(event.child_pid, child);
                finished.extend(self.complete_from(event.child_pid));
            }
            // 更早的 exit 属于该 pid 的上一个进程
            _ => {
                self.nodes.insert(event.child_pid, child);
            }
        }
        finished
    }

    pub fn handle_exec(&mut self, event: &ExecEvent) {
        if !self.nodes.contains_key(&event.pid) {
            if let Some(pending) = self.pending_exits.get_mut(&event.pid) {
                pending.filename = Some(event.filename.clone());
                return;
            }
        }
        let node = self
            .nodes
            .entry(event.pid)
            .or_insert_with(|| ProcessNode::initial(event.pid, event.comm.clone()));
        node.filename = Some(event.filename.clone());
    }

    pub fn handle_exit(&mut self, event: &ExitEvent) -> Vec<ProcessTree> {
        self.latest_ts = self.latest_ts.max(event.timestamp_ns);
        let comm = if event.comm.is_empty() {
            None
        } else {
            Some(event.comm.clone())
        };

        match self.nodes.get(&event.pid) {
            None => {
                debug!(pid = event.pid, "exit of untracked process held back");
                self.remember_exit(event.pid, event.timestamp_ns, comm, None);
                return Vec::new();
            }
            Some(node) if node.is_exec_placeholder() => {
                // 占位节点不进入历史；fork 可能随后才到
                let filename = self.nodes.remove(&event.pid).and_then(|n| n.filename);
                self.remember_exit(event.pid, event.timestamp_ns, comm, filename);
                return Vec::new();
            }
            Some(_) => {}
        }

        if let Some(node) = self.nodes.get_mut(&event.pid) {
            node.is_active = false;
            node.exit_time = event.timestamp_ns;
            // exit 时的 comm 反映 exec 之后的名字
            if let Some(comm) = comm {
                node.comm = comm;
            }
        }
        self.complete_from(event.pid).into_iter().collect()
    }

    fn remember_exit(
        &mut self,
        pid: u32,
        exit_time: u64,
        comm: Option<String>,
        filename: Option<String>,
    ) {
        let horizon = self.latest_ts.saturating_sub(PENDING_EXIT_WINDOW_NS);
        self.pending_exits.retain(|_, p| p.exit_time >= horizon);
        if self.pending_exits.len() >= PENDING_EXIT_LIMIT
            && !self.pending_exits.contains_key(&pid)
        {
            let oldest = self
                .pending_exits
                .iter()
                .min_by_key(|(_, p)| p.exit_time)
                .map(|(&pid, _)| pid);
            if let Some(oldest) = oldest {
                self.pending_exits.remove(&oldest);
            }
        }
        self.pending_exits.insert(
            pid,
            PendingExit {
                exit_time,
                comm: comm.unwrap_or_default(),
                filename,
            },
        );
    }

    /// 活动的树，根按 pid 排序
    pub fn live_trees(&self) -> Vec<ProcessTree> {
        let mut roots: Vec<u32> = self
            .nodes
            .values()
            .filter(|n| n.parent.is_none())
            .map(|n| n.pid)
            .collect();
        roots.sort_unstable();
        roots.into_iter().filter_map(|pid| self.snapshot(pid)).collect()
    }

    pub fn snapshot(&self, pid: u32) -> Option<ProcessTree> {
        let node = self.nodes.get(&pid)?;
        Some(ProcessTree {
            pid: node.pid,
            ppid: node.ppid,
            comm: node.comm.clone(),
            filename: node.filename.clone(),
            creation_time: node.creation_time,
            exit_time: node.exit_time,
            is_active: node.is_active,
            is_initial: node.is_initial,
            children: node
                .children
                .iter()
                .filter_map(|&child| self.snapshot(child))
                .collect(),
        })
    }

    fn unit_root(&self, pid: u32) -> u32 {
        let mut current = pid;
        while let Some(parent) = self.nodes.get(&current).and_then(|n| n.parent) {
            match self.nodes.get(&parent) {
                Some(p) if !p.is_initial => current = parent,
                _ => break,
            }
        }
        current
    }

    fn subtree_inactive(&self, pid: u32) -> bool {
        match self.nodes.get(&pid) {
            Some(node) => {
                !node.is_active && node.children.iter().all(|&c| self.subtree_inactive(c))
            }
            None => true,
        }
    }

    fn complete_from(&mut self, pid: u32) -> Option<ProcessTree> {
        let root = self.unit_root(pid);
        let root_node = self.nodes.get(&root)?;

        if root_node.is_initial {
            // 初始节点本身不构成单元，退出且无子节点时直接丢弃
            if !root_node.is_active && root_node.children.is_empty() {
                self.nodes.remove(&root);
            }
            return None;
        }
        if !self.subtree_inactive(root) {
            return None;
        }

        let tree = self.snapshot(root)?;
        let parent = self.nodes.get(&root).and_then(|n| n.parent);
        self.remove_subtree(root);
        if let Some(parent) = parent {
            self.detach_child(parent, root);
        }

        self.history.push_front(tree.clone());
        self.history.truncate(self.history_len);
        debug!(pid = tree.pid, nodes = tree.node_count(), "process tree finished");
        Some(tree)
    }

    fn remove_subtree(&mut self, pid: u32) {
        if let Some(node) = self.nodes.remove(&pid) {
            for child in node.children {
                self.remove_subtree(child);
            }
        }
    }

    fn detach_child(&mut self, parent: u32, child: u32) {
        let Some(node) = self.nodes.get_mut(&parent) else {
            return;
        };
        node.children.remove(&child);
        if node.is_initial && node.children.is_empty() {
            self.nodes.remove(&parent);
        }
    }

    fn evict(&mut self, pid: u32) -> Vec<ProcessTree> {
        let Some(stale) = self.nodes.remove(&pid) else {
            return Vec::new();
        };
        if stale.is_active && !stale.is_initial {
            warn!(pid, comm = %stale.comm, "pid reused before its exit was seen");
        }

        let mut finished = Vec::new();
        if let Some(parent) = stale.parent {
            self.detach_child(parent, pid);
            if self.nodes.contains_key(&parent) {
                finished.extend(self.complete_from(parent));
            }
        }
        // 孤儿子树各自成为根
        for child in stale.children {
            if let Some(node) = self.nodes.get_mut(&child) {
                node.parent = None;
            }
            finished.extend(self.complete_from(child));
        }
        finished
    }
}
