use super::Subscriber;
use crate::clock::monotonic_now_ns;
use crate::event_bus::ProcessEvent;
use crate::process_tree::{ProcessTree, ProcessTreeTracker};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::io::Write;
use std::time::Duration;
use tracing::warn;

/// 光标归位并清屏
pub const CLEAR_SCREEN: &str = "\x1b[H\x1b[J";

fn write_subtree(out: &mut String, node: &ProcessTree, depth: usize, now_ns: u64) {
    let indent = "  ".repeat(depth);
    let prefix = if depth > 0 { "|- " } else { "" };
    let lifetime = match node.execution_time_s(now_ns) {
        Some(secs) => format!("{:.3}", secs),
        None => "N/A".to_string(),
    };
    let status = if node.is_active {
        format!("Running for {}s", lifetime)
    } else {
        format!("[EXITED after {}s]", lifetime)
    };
    let marker = if node.is_initial { "*" } else { "" };
    let line = format!(
        "{}{}{:<6} {:<20} {:<28} {}",
        indent, prefix, node.pid, node.comm, status, marker
    );
    let _ = writeln!(out, "{}", line.trim_end());

    // children 已按 pid 排序
    for child in &node.children {
        write_subtree(out, child, depth + 1, now_ns);
    }
}

/// 活动进程树及最近历史的整屏文本
pub fn render(tracker: &ProcessTreeTracker, now_ns: u64) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<6} {:<20} {:<25} {}",
        "PID", "COMMAND", "LIFETIME (s)", "NOTES"
    );
    let _ = writeln!(out, "{}", "-".repeat(70));
    for tree in tracker.live_trees() {
        write_subtree(&mut out, &tree, 0, now_ns);
    }

    let _ = writeln!(out, "\n--- Recently Terminated Process Trees ---");
    let mut history = tracker.history().peekable();
    if history.peek().is_none() {
        let _ = writeln!(out, "(None)");
    }
    for (i, tree) in history.enumerate() {
        if i > 0 {
            let _ = writeln!(out, "{}", "-".repeat(25));
        }
        write_subtree(&mut out, tree, 0, now_ns);
    }

    let _ = writeln!(out, "\n{}", "=".repeat(80));
    let _ = writeln!(
        out,
        "Tracking {} total nodes in live trees.",
        tracker.node_count()
    );
    out
}

pub struct TreeView {
    tracker: ProcessTreeTracker,
    interval: Duration,
    dirty: bool,
    out: Box<dyn Write + Send>,
}

impl TreeView {
    pub fn new(history_len: usize, interval: Duration, out: Box<dyn Write + Send>) -> Self {
        Self {
            tracker: ProcessTreeTracker::new(history_len),
            interval,
            dirty: true,
            out,
        }
    }

    fn redraw(&mut self) {
        let screen = render(&self.tracker, monotonic_now_ns());
        let written = write!(self.out, "{}{}", CLEAR_SCREEN, screen).and_then(|_| self.out.flush());
        if let Err(e) = written {
            warn!("TreeView: write failed: {}", e);
        }
        self.dirty = false;
    }
}

#[async_trait]
impl Subscriber for TreeView {
    fn name(&self) -> &'static str {
        "TreeView"
    }

    async fn handle_event(&mut self, event: ProcessEvent) {
        self.tracker.handle_event(&event);
        self.dirty = true;
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    async fn on_tick(&mut self) {
        // 有运行中的进程时寿命在变，也需要重绘
        if self.dirty || self.tracker.node_count() > 0 {
            self.redraw();
        }
    }

    async fn finish(&mut self) {
        self.redraw();
    }
}
