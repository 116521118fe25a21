use std::net::SocketAddr;

use agent_gateway_core::Gateway;
use agent_gateway_core::GatewayConfig;
use agent_gateway_core::UserId;
use agent_gateway_server::serve;
use futures::SinkExt;
use futures::StreamExt;
use gateway_test_support::RECV_TIMEOUT;
use gateway_test_support::sh_agent;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    gateway: Gateway,
    stop: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(GatewayConfig::default()).await
    }

    async fn start_with(config: GatewayConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let gateway = Gateway::new(config);
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, gateway.clone(), async move {
            let _ = stopped.await;
        }));
        Self {
            addr,
            gateway,
            stop,
            task,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn issue_token(&self, user: &str) -> String {
        let body: Value = reqwest::Client::new()
            .post(self.url("/ws-token"))
            .header("x-user-id", user)
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json body");
        body["token"].as_str().expect("token string").to_string()
    }

    async fn connect_ws(&self) -> ClientSocket {
        let (socket, _response) =
            tokio_tungstenite::connect_async(format!("ws://{}/ws", self.addr))
                .await
                .expect("websocket handshake");
        socket
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        self.task
            .await
            .expect("server task")
            .expect("server exits cleanly");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthz_reports_ok() {
    let server = TestServer::start().await;
    let body: Value = reqwest::get(server.url("/healthz"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");
    assert_eq!(body, json!({"status": "ok"}));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_requires_user_identity() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let missing = client
        .post(server.url("/ws-token"))
        .send()
        .await
        .expect("request");
    assert_eq!(missing.status(), reqwest::StatusCode::UNAUTHORIZED);

    let blank = client
        .post(server.url("/ws-token"))
        .header("x-user-id", "   ")
        .send()
        .await
        .expect("request");
    assert_eq!(blank.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert!(server.gateway.tokens().is_empty());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn issued_token_is_bound_to_the_header_user() {
    let server = TestServer::start().await;
    let response = reqwest::Client::new()
        .post(server.url("/ws-token"))
        .header("x-user-id", "alice")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let body: Value = response.json().await.expect("json body");
    assert_eq!(body["expiresIn"], 60);
    let token = body["token"].as_str().expect("token string");
    assert_eq!(token.len(), 43);
    assert_eq!(
        server.gateway.tokens().validate(token),
        Ok(UserId::new("alice"))
    );

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_get_on_ws_is_not_upgraded() {
    let server = TestServer::start().await;
    let response = reqwest::get(server.url("/ws")).await.expect("request");
    assert!(response.status().is_client_error());
    server.shutdown().await;
}

async fn next_message(socket: &mut ClientSocket) -> Message {
    loop {
        let message = timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a websocket message")
            .expect("websocket stream ended")
            .expect("websocket read");
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return message;
        }
    }
}

async fn next_ws_json(socket: &mut ClientSocket) -> Value {
    match next_message(socket).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).expect("json frame"),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

async fn send_ws_json(socket: &mut ClientSocket, frame: Value) {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .expect("websocket send");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_runs_the_agent_and_forwards_its_events() {
    let server = TestServer::start_with(GatewayConfig {
        agent: sh_agent(
            r#"echo 'WEBSOCKET_EVENT:{"type":"process_start","payload":{"task":"demo"}}'; echo plain"#,
        ),
        ..GatewayConfig::default()
    })
    .await;
    let token = server.issue_token("alice").await;
    let mut socket = server.connect_ws().await;

    // Binary frames carrying UTF-8 are read as text.
    let auth = json!({"type": "auth", "token": token}).to_string();
    socket
        .send(Message::Binary(auth.into_bytes().into()))
        .await
        .expect("websocket send");
    assert_eq!(next_ws_json(&mut socket).await["type"], "auth_success");

    send_ws_json(&mut socket, json!({"type": "run"})).await;
    assert_eq!(next_ws_json(&mut socket).await["type"], "status");
    let event = next_ws_json(&mut socket).await;
    assert_eq!(event["type"], "process_start");
    assert_eq!(event["payload"], json!({"task": "demo"}));
    let stdout = next_ws_json(&mut socket).await;
    assert_eq!(stdout["type"], "stdout");
    assert_eq!(stdout["payload"]["data"], "plain");
    let end = next_ws_json(&mut socket).await;
    assert_eq!(end["type"], "end");
    assert_eq!(end["payload"]["status"], "completed");

    socket.close(None).await.expect("close");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_with_a_bad_token_is_closed_with_policy_violation() {
    let server = TestServer::start().await;
    let mut socket = server.connect_ws().await;

    send_ws_json(&mut socket, json!({"type": "auth", "token": "not-a-token"})).await;
    let error = next_ws_json(&mut socket).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["code"], "token_not_found");

    match next_message(&mut socket).await {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1008);
            assert_eq!(frame.reason.as_str(), "token not found");
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_is_closed_normally_on_shutdown() {
    let server = TestServer::start().await;
    let token = server.issue_token("alice").await;
    let mut socket = server.connect_ws().await;
    send_ws_json(&mut socket, json!({"type": "auth", "token": token})).await;
    assert_eq!(next_ws_json(&mut socket).await["type"], "auth_success");

    let TestServer { stop, task, .. } = server;
    let _ = stop.send(());
    match next_message(&mut socket).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1000),
        other => panic!("expected a close frame, got {other:?}"),
    }
    task.await
        .expect("server task")
        .expect("server exits cleanly");
}
