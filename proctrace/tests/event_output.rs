use chrono::{TimeZone, Utc};
use proctrace::clock::MonotonicClock;
use proctrace::event_bus::{lossy_c_str, ExecEvent, ExitEvent, ForkEvent, ProcessEvent};
use proctrace::process_tree::ProcessTreeTracker;
use proctrace::subscriber::event_printer::{format_json, format_line, EventPrinter, PrintFormat};
use proctrace::subscriber::tree_view::render;
use proctrace::subscriber::Subscriber;
use proctrace_common::{ExecRecord, ExitRecord, ForkRecord, Record};
use std::io::Write;
use std::sync::{Arc, Mutex};

fn name<const N: usize>(s: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    buf[..s.len()].copy_from_slice(s.as_bytes());
    buf
}

fn exec_event() -> ProcessEvent {
    ProcessEvent::Exec(ExecEvent {
        pid: 42,
        comm: "bash".to_string(),
        filename: "/bin/ls".to_string(),
    })
}

fn fork_event() -> ProcessEvent {
    ProcessEvent::Fork(ForkEvent {
        timestamp_ns: 5_000_000_000,
        parent_pid: 1,
        child_pid: 4321,
        parent_comm: "systemd".to_string(),
        child_comm: "systemd".to_string(),
    })
}

fn exit_event() -> ProcessEvent {
    ProcessEvent::Exit(ExitEvent {
        timestamp_ns: 6_000_000_000,
        pid: 4321,
        comm: "ls".to_string(),
    })
}

#[test]
fn records_convert_to_events() {
    let mut rec = ExecRecord::EMPTY;
    rec.pid = 42;
    rec.comm = name("bash");
    rec.fname = name("/bin/ls");
    assert_eq!(ProcessEvent::from(rec), exec_event());

    let fork = ForkRecord {
        ts: 5_000_000_000,
        ppid: 1,
        pid: 4321,
        pcomm: name("systemd"),
        comm: name("systemd"),
    };
    assert_eq!(ProcessEvent::from(fork), fork_event());

    let exit = ExitRecord {
        ts: 6_000_000_000,
        pid: 4321,
        comm: name("ls"),
    };
    let event = ProcessEvent::from(exit);
    assert_eq!(event, exit_event());
    assert_eq!(event.pid(), 4321);
    assert_eq!(event.timestamp_ns(), Some(6_000_000_000));
    assert_eq!(exec_event().timestamp_ns(), None);
}

#[test]
fn names_are_cut_at_nul_and_decoded_lossily() {
    assert_eq!(lossy_c_str(b"ls\0garbage"), "ls");
    assert_eq!(lossy_c_str(b"full-sixteen-chr"), "full-sixteen-chr");
    assert_eq!(lossy_c_str(&[0xff, b'a', 0]), "\u{fffd}a");
    assert_eq!(lossy_c_str(&[0u8; 16]), "");
}

#[test]
fn line_format_matches_column_layout() {
    assert_eq!(
        format_line(&exec_event()),
        "EXEC  PID=42     COMM=bash             FILE=/bin/ls"
    );
    assert_eq!(
        format_line(&fork_event()),
        "FORK  PPID=1      P_COMM=systemd          -> PID=4321   COMM=systemd"
    );
    assert_eq!(
        format_line(&exit_event()),
        "EXIT  PID=4321   COMM=ls              "
    );
}

#[test]
fn json_format_is_tagged_and_timestamped() {
    let wall = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let clock = MonotonicClock::with_anchor(5_000_000_000, wall);

    let fork = format_json(&fork_event(), &clock).unwrap();
    assert_eq!(fork["kind"], "fork");
    assert_eq!(fork["parent_pid"], 1);
    assert_eq!(fork["child_pid"], 4321);
    assert_eq!(fork["timestamp_ns"], 5_000_000_000u64);
    assert_eq!(fork["time"], "2024-03-01T12:00:00+00:00");

    let exit = format_json(&exit_event(), &clock).unwrap();
    assert_eq!(exit["kind"], "exit");
    assert_eq!(exit["time"], "2024-03-01T12:00:01+00:00");

    let exec = format_json(&exec_event(), &clock).unwrap();
    assert_eq!(exec["kind"], "exec");
    assert_eq!(exec["filename"], "/bin/ls");
    assert!(exec.get("time").is_none());
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn printer_writes_one_line_per_event() {
    let buf = SharedBuf::default();
    let mut printer = EventPrinter::new(PrintFormat::Lines, Box::new(buf.clone()));
    printer.handle_event(fork_event()).await;
    printer.handle_event(exec_event()).await;
    printer.handle_event(exit_event()).await;

    let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("FORK  PPID=1"));
    assert!(lines[1].starts_with("EXEC  PID=42"));
    assert!(lines[2].starts_with("EXIT  PID=4321"));
}

#[tokio::test]
async fn json_printer_emits_parseable_lines() {
    let buf = SharedBuf::default();
    let mut printer = EventPrinter::new(PrintFormat::Json, Box::new(buf.clone()));
    printer.handle_event(exec_event()).await;
    printer.handle_event(exit_event()).await;

    let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    let kinds: Vec<String> = output
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["kind"].to_string())
        .collect();
    assert_eq!(kinds, vec!["\"exec\"", "\"exit\""]);
}

#[test]
fn tree_view_renders_live_and_finished_trees() {
    let sec = 1_000_000_000u64;
    let mut tracker = ProcessTreeTracker::new(5);

    let empty = render(&tracker, sec);
    assert!(empty.starts_with("PID    COMMAND              LIFETIME (s)              NOTES\n"));
    assert!(empty.contains("--- Recently Terminated Process Trees ---\n(None)"));
    assert!(empty.contains("Tracking 0 total nodes in live trees."));

    let events = [
        ProcessEvent::Fork(ForkEvent {
            timestamp_ns: sec,
            parent_pid: 100,
            child_pid: 200,
            parent_comm: "bash".to_string(),
            child_comm: "bash".to_string(),
        }),
        ProcessEvent::Fork(ForkEvent {
            timestamp_ns: 2 * sec,
            parent_pid: 100,
            child_pid: 300,
            parent_comm: "bash".to_string(),
            child_comm: "sleep".to_string(),
        }),
        ProcessEvent::Exit(ExitEvent {
            timestamp_ns: 3 * sec + sec / 2,
            pid: 200,
            comm: "ls".to_string(),
        }),
    ];
    for event in &events {
        tracker.handle_event(event);
    }

    let screen = render(&tracker, 4 * sec);
    let lines: Vec<&str> = screen.lines().collect();
    assert_eq!(lines[2], "100    bash                 Running for N/As             *");
    assert_eq!(lines[3], "  |- 300    sleep                Running for 2.000s");
    assert!(screen.contains("--- Recently Terminated Process Trees ---\n200    ls                   [EXITED after 2.500s]"));
    assert!(screen.contains("Tracking 2 total nodes in live trees."));
}
