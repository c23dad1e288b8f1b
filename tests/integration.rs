//! End-to-end tests for the step server
//!
//! Each test binds a real server on an ephemeral port and drives it through
//! the wire client, the way a cucumber runner would. Event-broker peers are
//! plain local TCP listeners speaking the text event codec.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use cukemerlin::broker::TextEventCodec;
use cukemerlin::common::config::Config;
use cukemerlin::common::error::{EXCEPTION_EXECUTION, EXCEPTION_INTERNAL};
use cukemerlin::server::{Server, ServerContext};
use cukemerlin::wire::WireClient;
use cukemerlin::{steps, Reply, StepId};

const CONFIG: &str = r#"
[server]
bind_address = "127.0.0.1"
bind_port = 0
max_frame_bytes = 4096

[timeouts]
connect_ms = 300
event_ms = 2000
absence_ms = 200
"#;

/// A running server plus the handle to stop it
struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<cukemerlin::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let config = Config::parse(CONFIG).expect("test config");
        let context = ServerContext::new(
            steps::builtin().expect("builtin steps"),
            Arc::new(TextEventCodec),
            config.timeouts.clone(),
        );
        let server = Server::bind(&config, context).await.expect("bind server");
        let addr = server.local_addr().unwrap();

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(server.serve(async {
            let _ = rx.await;
        }));

        Self {
            addr,
            shutdown: Some(tx),
            task,
        }
    }

    async fn client(&self) -> WireClient {
        WireClient::connect(self.addr).await.expect("connect client")
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), &mut self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Fake event broker accepting one link
struct FakeBroker {
    listener: TcpListener,
}

impl FakeBroker {
    async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn port(&self) -> String {
        self.listener.local_addr().unwrap().port().to_string()
    }

    async fn accept(&self) -> TcpStream {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), self.listener.accept())
            .await
            .expect("link never connected")
            .unwrap();
        stream
    }
}

async fn step_id(client: &mut WireClient, text: &str) -> StepId {
    client
        .step_matches(text)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("no step matches '{}'", text))
        .id
}

fn assert_fail(reply: &Reply, message: &str, exception: &str) {
    match reply {
        Reply::Fail(Some(err)) => {
            assert_eq!(err.message, message);
            assert_eq!(err.exception, exception);
        }
        other => panic!("expected failure '{}', got {:?}", message, other),
    }
}

fn unused_port() -> u16 {
    let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    spare.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_step_matches() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let text = "a connect to merlin at port 1234";
    let reply = client
        .send_value(&json!(["step_matches", { "name_to_match": text }]))
        .await
        .unwrap();
    assert_eq!(
        reply.to_value(),
        json!(["success", [{
            "id": ["merlin", 0],
            "args": [{"val": "a", "pos": 0}, {"val": "1234", "pos": 28}],
            "source": "merlin"
        }]])
    );

    let reply = client
        .send_value(&json!(["step_matches", {"name_to_match": "unmatched text"}]))
        .await
        .unwrap();
    assert_eq!(reply.to_value(), json!(["success", []]));

    server.stop().await;
}

#[tokio::test]
async fn test_routing_errors() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let succeed = step_id(&mut client, "I succeed").await;

    let reply = client.invoke(&succeed, json!([])).await.unwrap();
    assert!(reply.message().is_some());

    client.begin_scenario(&["merlin"]).await.unwrap();
    let reply = client.invoke(&succeed, json!([])).await.unwrap();
    assert_fail(&reply, "Unknown step definition id", EXCEPTION_INTERNAL);

    let reply = client
        .send_value(&json!(["invoke", {"id": ["merlin", "abc"], "args": []}]))
        .await
        .unwrap();
    assert_fail(&reply, "Malformed id tag", EXCEPTION_INTERNAL);

    let reply = client
        .invoke(&StepId::new("merlin", 999), json!([]))
        .await
        .unwrap();
    assert!(!reply.is_success());

    server.stop().await;
}

#[tokio::test]
async fn test_scenario_lifecycle() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    assert!(client.end_scenario().await.unwrap().message().is_some());
    assert!(client
        .begin_scenario(&["test", "unknown"])
        .await
        .unwrap()
        .is_success());

    assert!(client
        .run_step("I succeed", json!([]))
        .await
        .unwrap()
        .is_success());
    assert!(client
        .run_step("I do great stuff", json!(["great"]))
        .await
        .unwrap()
        .is_success());
    let reply = client.run_step("I fail", json!([])).await.unwrap();
    assert_fail(&reply, "Step error", EXCEPTION_EXECUTION);

    assert!(client.end_scenario().await.unwrap().is_success());
    let reply = client.run_step("I succeed", json!([])).await.unwrap();
    assert!(!reply.is_success());

    // Verbs without a handler are acknowledged
    let reply = client
        .send_value(&json!(["snippet_text", {"step_keyword": "Given"}]))
        .await
        .unwrap();
    assert_eq!(reply, Reply::ok());

    server.stop().await;
}

#[tokio::test]
async fn test_deferred_steps_keep_reply_order() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    client.begin_scenario(&["test"]).await.unwrap();
    let wait = step_id(&mut client, "I wait 150 ms").await;
    let time_out = step_id(&mut client, "I time out after 100 ms").await;

    let started = Instant::now();
    assert!(client
        .invoke(&wait, json!(["150"]))
        .await
        .unwrap()
        .is_success());
    assert!(started.elapsed() >= Duration::from_millis(140));

    let reply = client.invoke(&time_out, json!(["100"])).await.unwrap();
    assert_fail(&reply, "Timed out", EXCEPTION_EXECUTION);

    // A second command sent while the first is deferred waits its turn
    let mut raw = TcpStream::connect(server.addr).await.unwrap();
    raw.write_all(
        concat!(
            r#"["begin_scenario",{"tags":["test"]}]"#,
            "\n",
            r#"["invoke",{"id":["test",4],"args":["100"]}]"#,
            "\n",
            r#"["step_matches",{"name_to_match":"I succeed"}]"#,
            "\n",
        )
        .as_bytes(),
    )
    .await
    .unwrap();

    let mut lines = BufReader::new(raw).lines();
    let mut replies = Vec::new();
    for _ in 0..3 {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        replies.push(serde_json::from_str::<Value>(&line).unwrap());
    }
    assert_eq!(replies[0], json!(["success"]));
    assert_eq!(replies[1], json!(["success"]));
    assert_eq!(replies[2][1][0]["id"], json!(["test", 1]));

    server.stop().await;
}

#[tokio::test]
async fn test_merlin_connect_and_events() {
    let server = TestServer::start().await;
    let broker = FakeBroker::bind().await;
    let mut client = server.client().await;
    let port = broker.port();

    client.begin_scenario(&["merlin"]).await.unwrap();
    let reply = client
        .run_step(&format!("a connect to merlin at port {}", port), json!(["a", &port]))
        .await
        .unwrap();
    assert!(reply.is_success());

    let peer = broker.accept().await;
    let reply = client
        .run_step("a is connected to merlin", json!(["a"]))
        .await
        .unwrap();
    assert!(reply.is_success());

    let (peer_read, mut peer_write) = peer.into_split();
    let mut peer_lines = BufReader::new(peer_read).lines();

    let reply = client
        .run_step(
            "a sends raw event HOST_CHECK",
            json!(["a", "HOST_CHECK", [["name", "web01"], ["state", "0"]]]),
        )
        .await
        .unwrap();
    assert!(reply.is_success());
    let line = tokio::time::timeout(Duration::from_secs(5), peer_lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(line, "EVT HOST_CHECK name=web01;state=0");

    // The event arrives while the step is already waiting
    let received = step_id(&mut client, "a received event SERVICE_CHECK").await;
    let sender = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        peer_write
            .write_all(b"EVT SERVICE_CHECK host_name=web01;description=PING;state=0\n")
            .await
            .unwrap();
        peer_write
    });
    let reply = client
        .invoke(
            &received,
            json!(["a", "SERVICE_CHECK", [["host_name", "web01"], ["state", "0"]]]),
        )
        .await
        .unwrap();
    assert!(reply.is_success());
    let _peer_write = sender.await.unwrap();

    // Already buffered: answered without waiting
    let reply = client
        .invoke(&received, json!(["a", "SERVICE_CHECK", [["description", "PING"]]]))
        .await
        .unwrap();
    assert!(reply.is_success());

    let reply = client
        .run_step(
            "a should not receive event SERVICE_CHECK",
            json!(["a", "SERVICE_CHECK", [["state", "2"]]]),
        )
        .await
        .unwrap();
    assert!(reply.is_success());

    let reply = client
        .run_step("a should not receive event SERVICE_CHECK", json!(["a", "SERVICE_CHECK"]))
        .await
        .unwrap();
    assert_fail(
        &reply,
        "Unexpected SERVICE_CHECK event received",
        EXCEPTION_EXECUTION,
    );

    assert!(client
        .run_step("a clears buffer", json!(["a"]))
        .await
        .unwrap()
        .is_success());
    let reply = client
        .run_step("a should not receive event SERVICE_CHECK", json!(["a", "SERVICE_CHECK"]))
        .await
        .unwrap();
    assert!(reply.is_success());

    server.stop().await;
}

#[tokio::test]
async fn test_merlin_not_connected_times_out() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let port = unused_port().to_string();

    client.begin_scenario(&["merlin"]).await.unwrap();
    client
        .run_step(&format!("b listens for merlin at port {}", port), json!(["b", &port]))
        .await
        .unwrap();

    let started = Instant::now();
    let reply = client
        .run_step("b is connected to merlin", json!(["b"]))
        .await
        .unwrap();
    assert_fail(&reply, "Not connected", EXCEPTION_EXECUTION);
    assert!(started.elapsed() >= Duration::from_millis(250));

    let reply = client
        .run_step("b sends raw event CTRL_ACTIVE", json!(["b", "CTRL_ACTIVE", []]))
        .await
        .unwrap();
    assert_fail(&reply, "Not connected", EXCEPTION_EXECUTION);

    let reply = client
        .run_step("zz is connected to merlin", json!(["zz"]))
        .await
        .unwrap();
    assert_fail(&reply, "Unknown connection 'zz'", EXCEPTION_EXECUTION);

    server.stop().await;
}

#[tokio::test]
async fn test_merlin_disconnect() {
    let server = TestServer::start().await;
    let broker = FakeBroker::bind().await;
    let mut client = server.client().await;
    let port = broker.port();

    client.begin_scenario(&["merlin"]).await.unwrap();
    client
        .run_step(&format!("a connect to merlin at port {}", port), json!(["a", &port]))
        .await
        .unwrap();
    let peer = broker.accept().await;
    assert!(client
        .run_step("a is connected to merlin", json!(["a"]))
        .await
        .unwrap()
        .is_success());

    // Broker hangs up while the step waits for it
    let closer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(peer);
    });
    assert!(client
        .run_step("a is disconnected from merlin", json!(["a"]))
        .await
        .unwrap()
        .is_success());
    closer.await.unwrap();

    let reply = client
        .run_step("x disconnects from merlin", json!(["x"]))
        .await
        .unwrap();
    assert_fail(&reply, "Unknown connection 'x'", EXCEPTION_EXECUTION);

    assert!(client
        .run_step("a disconnects from merlin", json!(["a"]))
        .await
        .unwrap()
        .is_success());

    // A closed link can never deliver the event, so there is nothing to wait for
    let started = Instant::now();
    let reply = client
        .run_step("a received event HOST_CHECK", json!(["a", "HOST_CHECK"]))
        .await
        .unwrap();
    assert_fail(&reply, "Not connected", EXCEPTION_EXECUTION);
    let reply = client
        .run_step(
            "a should not receive event HOST_CHECK",
            json!(["a", "HOST_CHECK"]),
        )
        .await
        .unwrap();
    assert_fail(&reply, "Not connected", EXCEPTION_EXECUTION);
    assert!(started.elapsed() < Duration::from_millis(1000));

    let reply = client
        .run_step("a disconnects from merlin", json!(["a"]))
        .await
        .unwrap();
    assert_fail(&reply, "Unknown connection 'a'", EXCEPTION_EXECUTION);

    server.stop().await;
}

#[tokio::test]
async fn test_scenario_end_closes_links() {
    let server = TestServer::start().await;
    let broker = FakeBroker::bind().await;
    let port = broker.port();

    // Explicit end_scenario
    let mut client = server.client().await;
    client.begin_scenario(&["merlin"]).await.unwrap();
    client
        .run_step(&format!("a connect to merlin at port {}", port), json!(["a", &port]))
        .await
        .unwrap();
    let mut peer = broker.accept().await;
    client.end_scenario().await.unwrap();
    assert_eq!(read_to_eof(&mut peer).await, 0);

    // Runner vanishes mid-scenario
    client.begin_scenario(&["merlin"]).await.unwrap();
    client
        .run_step(&format!("a connect to merlin at port {}", port), json!(["a", &port]))
        .await
        .unwrap();
    let mut peer = broker.accept().await;
    drop(client);
    assert_eq!(read_to_eof(&mut peer).await, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_and_oversized_frames() {
    let server = TestServer::start().await;
    let mut raw = TcpStream::connect(server.addr).await.unwrap();

    raw.write_all(b"this is not json\n[\"end_scenario\"]\n")
        .await
        .unwrap();
    let (read, mut write) = raw.into_split();
    let mut lines = BufReader::new(read).lines();
    assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"["fail"]"#);
    let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(second[0], "fail");
    assert_eq!(second[1]["exception"], EXCEPTION_INTERNAL);

    // Blank lines are frames too and get their own reply, in order
    write
        .write_all(b"\n[\"step_matches\",{\"name_to_match\":\"I succeed\"}]\n")
        .await
        .unwrap();
    assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"["fail"]"#);
    let matched: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(matched[0], "success");
    assert_eq!(matched[1][0]["id"], json!(["test", 1]));

    // An unterminated frame beyond the limit drops the connection
    let _ = write.write_all(&vec![b'x'; 8192]).await;
    let eof = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .unwrap();
    assert!(matches!(eof, Ok(None) | Err(_)));

    // The server itself keeps serving
    let mut client = server.client().await;
    assert!(client.step_matches("I succeed").await.unwrap().is_some());

    server.stop().await;
}

async fn read_to_eof(peer: &mut TcpStream) -> usize {
    let mut buf = [0u8; 64];
    tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf))
        .await
        .expect("link was not closed")
        .unwrap_or(0)
}
