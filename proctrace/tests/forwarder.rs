use proctrace::event_bus::{ExitEvent, ForkEvent, ProcessEvent};
use proctrace::subscriber::forwarder::{JsonLineClient, TreeForwarder};
use proctrace::subscriber::Subscriber;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

async fn read_lines(listener: TcpListener, count: usize) -> Vec<Value> {
    let (socket, _) = listener.accept().await.expect("accept");
    let mut lines = BufReader::new(socket).lines();
    let mut docs = Vec::new();
    while docs.len() < count {
        match lines.next_line().await.expect("read line") {
            Some(line) => docs.push(serde_json::from_str(&line).expect("valid json")),
            None => break,
        }
    }
    docs
}

#[tokio::test]
async fn client_writes_one_document_per_line() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(read_lines(listener, 2));

    let mut client = JsonLineClient::new(address);
    assert!(!client.is_connected());
    client.send(&json!({"pid": 1, "comm": "init"})).await.unwrap();
    assert!(client.is_connected());
    client.send(&json!({"pid": 2, "comm": "kthreadd"})).await.unwrap();
    client.close().await;

    let docs = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["comm"], "init");
    assert_eq!(docs[1]["pid"], 2);
}

#[tokio::test]
async fn send_without_collector_reports_error() {
    // 先绑定再释放，拿到一个没有监听者的端口
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let mut client = JsonLineClient::new(address.clone());
    let err = client.send(&json!({"pid": 1})).await.unwrap_err();
    assert!(err.to_string().contains(&address));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn forwarder_sends_finished_trees() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(read_lines(listener, 1));

    let mut forwarder = TreeForwarder::new(address, 5);
    forwarder
        .handle_event(ProcessEvent::Fork(ForkEvent {
            timestamp_ns: 1_000,
            parent_pid: 10,
            child_pid: 20,
            parent_comm: "bash".to_string(),
            child_comm: "bash".to_string(),
        }))
        .await;
    forwarder
        .handle_event(ProcessEvent::Exit(ExitEvent {
            timestamp_ns: 2_000,
            pid: 20,
            comm: "ls".to_string(),
        }))
        .await;
    forwarder.finish().await;

    let docs = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(docs.len(), 1);
    let tree = &docs[0];
    assert_eq!(tree["pid"], 20);
    assert_eq!(tree["ppid"], 10);
    assert_eq!(tree["comm"], "ls");
    assert_eq!(tree["creation_time"], 1_000);
    assert_eq!(tree["exit_time"], 2_000);
    assert_eq!(tree["is_active"], false);
    assert_eq!(tree["children"], json!([]));
}
