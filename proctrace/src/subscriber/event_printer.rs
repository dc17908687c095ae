use super::Subscriber;
use crate::clock::MonotonicClock;
use crate::event_bus::ProcessEvent;
use async_trait::async_trait;
use serde_json::Value;
use std::io::Write;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintFormat {
    Lines,
    Json,
}

pub fn format_line(event: &ProcessEvent) -> String {
    match event {
        ProcessEvent::Exec(e) => format!(
            "EXEC  PID={:<6} COMM={:<16} FILE={}",
            e.pid, e.comm, e.filename
        ),
        ProcessEvent::Fork(e) => format!(
            "FORK  PPID={:<6} P_COMM={:<16} -> PID={:<6} COMM={}",
            e.parent_pid, e.parent_comm, e.child_pid, e.child_comm
        ),
        ProcessEvent::Exit(e) => format!("EXIT  PID={:<6} COMM={:<16}", e.pid, e.comm),
    }
}

/// 事件的 JSON 对象；fork 和 exit 额外带有由单调时间戳换算的 `time`
pub fn format_json(event: &ProcessEvent, clock: &MonotonicClock) -> serde_json::Result<Value> {
    let mut value = serde_json::to_value(event)?;
    if let (Some(ts), Value::Object(map)) = (event.timestamp_ns(), &mut value) {
        map.insert(
            "time".to_string(),
            Value::String(clock.to_wall(ts).to_rfc3339()),
        );
    }
    Ok(value)
}

pub struct EventPrinter {
    format: PrintFormat,
    clock: MonotonicClock,
    out: Box<dyn Write + Send>,
}

impl EventPrinter {
    pub fn new(format: PrintFormat, out: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            clock: MonotonicClock::new(),
            out,
        }
    }

    pub fn stdout(format: PrintFormat) -> Self {
        Self::new(format, Box::new(std::io::stdout()))
    }

    fn render(&self, event: &ProcessEvent) -> Option<String> {
        match self.format {
            PrintFormat::Lines => Some(format_line(event)),
            PrintFormat::Json => match format_json(event, &self.clock) {
                Ok(value) => Some(value.to_string()),
                Err(e) => {
                    warn!("EventPrinter: failed to serialize event: {}", e);
                    None
                }
            },
        }
    }
}

#[async_trait]
impl Subscriber for EventPrinter {
    fn name(&self) -> &'static str {
        "EventPrinter"
    }

    async fn handle_event(&mut self, event: ProcessEvent) {
        let Some(line) = self.render(&event) else {
            return;
        };
        // 逐行刷新，便于管道下游实时读取
        if let Err(e) = writeln!(self.out, "{}", line).and_then(|_| self.out.flush()) {
            warn!("EventPrinter: write failed: {}", e);
        }
    }

    async fn finish(&mut self) {
        let _ = self.out.flush();
    }
}
