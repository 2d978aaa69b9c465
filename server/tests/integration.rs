//! End-to-end tests for the Meridian server.
//!
//! Each test spins up the REAL axum server and tracker ingest listener on
//! random ports with an in-memory SQLite database, then plays the tracker
//! role over plain TCP and the user role over HTTP/WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use meridian_server::{api, config, db, ingest};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

struct TestServer {
    base_url: String,
    ingest_port: u16,
    pool: sqlx::SqlitePool,
}

/// Spawn the real server (HTTP + ingest) on random ports with an in-memory
/// SQLite database.
async fn spawn_test_server() -> TestServer {
    spawn_test_server_with(config::AppConfig::default()).await
}

async fn spawn_test_server_with(app_config: config::AppConfig) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind random port");
    let addr = listener.local_addr().expect("failed to get local address");
    let base_url = format!("http://{addr}");

    let pool = db::init(":memory:")
        .await
        .expect("in-memory DB init failed");

    let database = Arc::new(db::Database::new(pool.clone()));
    let state = api::AppState::new(database, app_config);

    let deps = ingest::IngestDeps {
        manager: state.manager.clone(),
        hub: state.hub.clone(),
        devices: state.devices.clone(),
        positions: state.positions.clone(),
        evaluators: state.evaluators.clone(),
    };
    let ingest_addr = ingest::start_ingest_task(0, deps)
        .await
        .expect("ingest bind failed");

    let app = api::router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("server error");
    });

    TestServer {
        base_url,
        ingest_port: ingest_addr.port(),
        pool,
    }
}

/// A scripted tracker device speaking the line protocol.
struct Tracker {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Tracker {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("tracker connect failed");
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    /// Send one line and return the server's ack ("ok" / "rej").
    async fn send(&mut self, line: &str) -> String {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("tracker write failed");
        let mut ack = String::new();
        self.reader
            .read_line(&mut ack)
            .await
            .expect("tracker read failed");
        ack.trim().to_string()
    }
}

/// Poll `probe` every 50 ms until it yields a value or ~5 s elapse.
async fn wait_for<T, F, Fut>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..100 {
        if let Some(value) = probe().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within timeout");
}

async fn fetch_devices(client: &reqwest::Client, base_url: &str) -> Vec<Value> {
    client
        .get(format!("{base_url}/api/devices"))
        .send()
        .await
        .expect("devices request failed")
        .json::<Vec<Value>>()
        .await
        .expect("devices response not JSON")
}

async fn device_by_unique_id(
    client: &reqwest::Client,
    base_url: &str,
    unique_id: &str,
) -> Option<Value> {
    fetch_devices(client, base_url)
        .await
        .into_iter()
        .find(|d| d["unique_id"] == unique_id)
}

// ── Tracker lifecycle over the wire ─────────────────────────────────

#[tokio::test]
async fn test_device_identifies_reports_and_disconnects() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    let mut tracker = Tracker::connect(server.ingest_port).await;
    assert_eq!(tracker.send("id,imei-100").await, "ok");
    assert_eq!(tracker.send("pos,59.33,18.06,5.5,90").await, "ok");

    // The unknown device was auto-registered and is now online.
    let device = wait_for(|| async {
        device_by_unique_id(&client, &server.base_url, "imei-100")
            .await
            .filter(|d| d["status"] == "online")
    })
    .await;
    let device_id = device["id"].as_i64().unwrap();

    // Its live session is visible.
    let resp = client
        .get(format!("{}/api/devices/{device_id}/session", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let session: Value = resp.json().await.unwrap();
    assert_eq!(session["protocol"], "text");
    assert_eq!(session["unique_id"], "imei-100");

    // The position was stored.
    let position: Value = client
        .get(format!("{}/api/devices/{device_id}/position", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(position["latitude"], 59.33);

    let stats: Value = client
        .get(format!("{}/api/server/stats", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["active_sessions"], 1);
    assert_eq!(stats["hot_devices"], 1);

    // Closing the socket tears the session down and flips the device offline.
    drop(tracker);
    wait_for(|| async {
        device_by_unique_id(&client, &server.base_url, "imei-100")
            .await
            .filter(|d| d["status"] == "offline")
    })
    .await;

    let resp = client
        .get(format!("{}/api/devices/{device_id}/session", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let stats: Value = client
        .get(format!("{}/api/server/stats", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["active_sessions"], 0);
    assert_eq!(stats["hot_devices"], 0);
}

#[tokio::test]
async fn test_position_before_identification_is_rejected() {
    let server = spawn_test_server().await;

    let mut tracker = Tracker::connect(server.ingest_port).await;
    assert_eq!(tracker.send("pos,59.33,18.06").await, "rej");
    assert_eq!(tracker.send("garbage,1,2").await, "rej");

    // Identification still works afterwards on the same connection.
    assert_eq!(tracker.send("id,imei-101").await, "ok");
    assert_eq!(tracker.send("pos,59.33,18.06").await, "ok");
}

#[tokio::test]
async fn test_unknown_device_rejected_when_registration_disabled() {
    let mut app_config = config::AppConfig::default();
    app_config.database.register_unknown = false;
    let server = spawn_test_server_with(app_config).await;
    let client = reqwest::Client::new();

    let mut tracker = Tracker::connect(server.ingest_port).await;
    assert_eq!(tracker.send("id,imei-102").await, "rej");

    assert!(device_by_unique_id(&client, &server.base_url, "imei-102")
        .await
        .is_none());
}

#[tokio::test]
async fn test_disabled_device_cannot_bind() {
    let server = spawn_test_server().await;

    sqlx::query("INSERT INTO devices (name, unique_id, status, disabled) VALUES ('d', 'imei-103', 'unknown', 1)")
        .execute(&server.pool)
        .await
        .expect("seed disabled device");

    let mut tracker = Tracker::connect(server.ingest_port).await;
    assert_eq!(tracker.send("id,imei-103").await, "rej");
}

// ── Group hierarchy over HTTP ───────────────────────────────────────

#[tokio::test]
async fn test_group_cycle_is_rejected() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    let create = |name: &str, parent: Option<i64>| {
        let client = client.clone();
        let url = format!("{}/api/groups", server.base_url);
        let body = json!({"name": name, "group_id": parent});
        async move {
            let resp = client.post(url).json(&body).send().await.unwrap();
            assert_eq!(resp.status(), StatusCode::CREATED);
            resp.json::<Value>().await.unwrap()["id"].as_i64().unwrap()
        }
    };

    let a = create("a", None).await;
    let b = create("b", Some(a)).await;
    let c = create("c", Some(b)).await;

    // Re-rooting a under c must fail and leave the hierarchy unchanged.
    let resp = client
        .patch(format!("{}/api/groups/{a}", server.base_url))
        .json(&json!({"name": "a", "group_id": c}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "cycle in group hierarchy");

    let groups: Vec<Value> = client
        .get(format!("{}/api/groups", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let group_a = groups.iter().find(|g| g["id"] == a).unwrap();
    assert_eq!(group_a["group_id"], Value::Null);
    assert_eq!(groups.len(), 3);
}

// ── Fan-out to WebSocket subscribers ────────────────────────────────

#[tokio::test]
async fn test_ws_subscriber_receives_permitted_updates() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    // Register the device by identifying once.
    let mut tracker = Tracker::connect(server.ingest_port).await;
    assert_eq!(tracker.send("id,imei-200").await, "ok");
    let device = wait_for(|| async {
        device_by_unique_id(&client, &server.base_url, "imei-200").await
    })
    .await;
    let device_id = device["id"].as_i64().unwrap();

    // Grant user 1 visibility of the device.
    sqlx::query("INSERT INTO users (id, name) VALUES (1, 'u1')")
        .execute(&server.pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO user_devices (user_id, device_id) VALUES (1, ?)")
        .bind(device_id)
        .execute(&server.pool)
        .await
        .unwrap();

    let ws_url = format!(
        "ws://{}/api/ws?user_id=1",
        server.base_url.trim_start_matches("http://")
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("ws connect failed");

    assert_eq!(tracker.send("pos,59.33,18.06,3.0,45").await, "ok");

    // The subscriber sees the position (possibly after device frames).
    let position = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = socket.next().await.expect("ws closed").expect("ws error");
            if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame["event"] == "position" {
                    break frame["data"].clone();
                }
            }
        }
    })
    .await
    .expect("no position frame within timeout");

    assert_eq!(position["device_id"], device_id);
    assert_eq!(position["longitude"], 18.06);
}
