use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use talkmore_api::{AuthMode, LogoutPolicy};
use talkmore_db::Database;
use talkmore_gateway::Gateway;
use talkmore_server::config::Config;
use talkmore_server::{build_router, build_state};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    http: reqwest::Client,
    gateway: Gateway,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with_heartbeat(Duration::from_secs(30)).await
    }

    async fn start_with_heartbeat(heartbeat_interval: Duration) -> Self {
        let config = Config {
            jwt_secret: "realtime-test-secret-long-enough".into(),
            db_path: ":memory:".into(),
            host: "127.0.0.1".into(),
            port: 0,
            auth_mode: AuthMode::Checked,
            stateless_logout: LogoutPolicy::Reject,
            heartbeat_interval,
            store_timeout: Duration::from_secs(5),
        };
        let db = Arc::new(Database::open_in_memory().unwrap());
        let shutdown = CancellationToken::new();
        let state = build_state(db, &config, shutdown.clone());
        let gateway = state.gateway.clone();
        let app = build_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            addr,
            shutdown,
            http: reqwest::Client::new(),
            gateway,
        }
    }

    /// Returns (user_id, access_token).
    async fn signup(&self, email: &str, first_name: &str) -> (String, String) {
        let body: Value = self
            .http
            .post(format!("http://{}/signup", self.addr))
            .json(&json!({
                "email": email,
                "first_name": first_name,
                "last_name": "",
                "password": "correct horse battery",
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        (
            body["data"]["user_id"].as_str().unwrap().to_string(),
            body["data"]["access_token"].as_str().unwrap().to_string(),
        )
    }

    async fn send_rest(&self, token: &str, destination: &str, message: &str) {
        let resp = self
            .http
            .post(format!("http://{}/api/message", self.addr))
            .bearer_auth(token)
            .json(&json!({ "destination": destination, "message": message }))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
    }

    async fn connect(&self, token: &str) -> Socket {
        self.connect_at("/ws/messages", token).await
    }

    async fn connect_at(&self, path: &str, token: &str) -> Socket {
        let mut request = format!("ws://{}{}", self.addr, path)
            .into_client_request()
            .unwrap();
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        let (mut socket, _) = connect_async(request).await.unwrap();
        let ready = next_event(&mut socket).await;
        assert_eq!(ready["type"], "Ready");
        socket
    }
}

async fn next_event(socket: &mut Socket) -> Value {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended while waiting for an event: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

async fn assert_quiet(socket: &mut Socket) {
    let extra = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
                Some(Ok(_)) => continue,
                _ => return String::new(),
            }
        }
    })
    .await;
    assert!(extra.is_err(), "unexpected event: {:?}", extra);
}

#[tokio::test]
async fn rest_message_is_pushed_to_receiver() {
    let server = TestServer::start().await;
    let (alice_id, alice_token) = server.signup("alice@example.com", "Alice").await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "Bob").await;

    let mut bob = server.connect(&bob_token).await;
    server.send_rest(&alice_token, &bob_id, "hi").await;

    let event = next_event(&mut bob).await;
    assert_eq!(event["type"], "ConversationUpdated");
    assert_eq!(event["data"]["chat"]["sub_id"], alice_id.as_str());
    assert_eq!(event["data"]["chat"]["name"], "Alice");
    assert_eq!(event["data"]["chat"]["is_unread"], true);
    assert_eq!(event["data"]["chat"]["last_message"], "hi");
    assert_eq!(event["data"]["message"]["sender_id"], alice_id.as_str());

    server.shutdown.cancel();
}

#[tokio::test]
async fn socket_message_reaches_both_parties() {
    let server = TestServer::start().await;
    let (alice_id, alice_token) = server.signup("alice@example.com", "Alice").await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "Bob").await;

    let mut alice = server.connect(&alice_token).await;
    let mut bob = server.connect(&bob_token).await;

    alice
        .send(Message::Text(
            json!({ "destination": bob_id, "message": "yo", "name": "Bob" })
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    let theirs = next_event(&mut bob).await;
    assert_eq!(theirs["data"]["chat"]["sub_id"], alice_id.as_str());
    assert_eq!(theirs["data"]["message"]["message"], "yo");

    let mine = next_event(&mut alice).await;
    assert_eq!(mine["data"]["chat"]["sub_id"], bob_id.as_str());
    assert_eq!(mine["data"]["chat"]["is_unread"], false);

    server.shutdown.cancel();
}

#[tokio::test]
async fn each_connection_gets_every_update_once_in_order() {
    let server = TestServer::start().await;
    let (_, alice_token) = server.signup("alice@example.com", "Alice").await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "Bob").await;

    let mut phone = server.connect(&bob_token).await;
    let mut laptop = server.connect(&bob_token).await;

    server.send_rest(&alice_token, &bob_id, "one").await;
    server.send_rest(&alice_token, &bob_id, "two").await;

    for socket in [&mut phone, &mut laptop] {
        let first = next_event(socket).await;
        let second = next_event(socket).await;
        assert_eq!(first["data"]["message"]["message"], "one");
        assert_eq!(second["data"]["message"]["message"], "two");
        assert!(second["data"]["revision"].as_u64() > first["data"]["revision"].as_u64());
        assert_quiet(socket).await;
    }

    server.shutdown.cancel();
}

#[tokio::test]
async fn bad_frames_are_skipped_and_failures_reported() {
    let server = TestServer::start().await;
    let (_, alice_token) = server.signup("alice@example.com", "Alice").await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "Bob").await;

    let mut alice = server.connect(&alice_token).await;
    let mut bob = server.connect(&bob_token).await;

    alice.send(Message::Text("not json".into())).await.unwrap();
    alice
        .send(Message::Text(
            json!({ "destination": "  ", "message": "lost" }).to_string().into(),
        ))
        .await
        .unwrap();

    let failed = next_event(&mut alice).await;
    assert_eq!(failed["type"], "DeliveryFailed");

    // The connection is still usable.
    alice
        .send(Message::Text(
            json!({ "destination": bob_id, "message": "still here" }).to_string().into(),
        ))
        .await
        .unwrap();
    let event = next_event(&mut bob).await;
    assert_eq!(event["data"]["message"]["message"], "still here");

    server.shutdown.cancel();
}

#[tokio::test]
async fn token_in_query_string_is_accepted() {
    let server = TestServer::start().await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "Bob").await;

    let url = format!("ws://{}/ws/messages?token={}", server.addr, bob_token);
    let (mut socket, _) = connect_async(url).await.unwrap();
    let ready = next_event(&mut socket).await;
    assert_eq!(ready["data"]["user_id"], bob_id.as_str());

    server.shutdown.cancel();
}

#[tokio::test]
async fn upgrade_without_valid_token_is_refused() {
    let server = TestServer::start().await;

    let url = format!("ws://{}/ws/messages", server.addr);
    match connect_async(url).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status().as_u16(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }

    let url = format!("ws://{}/ws/messages?token=forged", server.addr);
    match connect_async(url).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status().as_u16(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }

    server.shutdown.cancel();
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let server = TestServer::start().await;
    let (_, bob_token) = server.signup("bob@example.com", "Bob").await;
    let mut bob = server.connect(&bob_token).await;

    server.shutdown.cancel();

    let ended = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match bob.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "socket stayed open after shutdown");
}

#[tokio::test]
async fn silent_client_is_dropped_after_missed_pongs() {
    let server = TestServer::start_with_heartbeat(Duration::from_millis(300)).await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "Bob").await;

    // Not reading means the client never answers pings.
    let mut bob = server.connect(&bob_token).await;
    assert_eq!(server.gateway.registry().connection_count(&bob_id).await, 1);

    let dropped = tokio::time::timeout(EVENT_TIMEOUT, async {
        while server.gateway.registry().connection_count(&bob_id).await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(dropped.is_ok(), "connection still registered after heartbeat timeout");

    let ended = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match bob.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "socket stayed open after heartbeat timeout");

    server.shutdown.cancel();
}

#[tokio::test]
async fn chats_path_serves_the_same_socket() {
    let server = TestServer::start().await;
    let (alice_id, alice_token) = server.signup("alice@example.com", "Alice").await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "Bob").await;

    let mut bob = server.connect_at("/ws/chats", &bob_token).await;
    server.send_rest(&alice_token, &bob_id, "over chats").await;

    let event = next_event(&mut bob).await;
    assert_eq!(event["data"]["chat"]["sub_id"], alice_id.as_str());
    assert_eq!(event["data"]["message"]["message"], "over chats");

    server.shutdown.cancel();
}
