use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

use vigil::api::{ApiConfig, ApiServer, DEFAULT_LIMIT};
use vigil::storage::{EventStore, NewEvent, SqliteEventStore};

struct Reply {
    status: u16,
    headers: String,
    body: Vec<u8>,
}

impl Reply {
    fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

fn send(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> Reply {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\n");
    if let Some(body) = body {
        request.push_str("Content-Type: application/json\r\n");
        request.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    } else {
        request.push_str("\r\n");
    }
    stream.write_all(request.as_bytes()).expect("write request");
    read_response(&mut stream)
}

fn read_response(stream: &mut TcpStream) -> Reply {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let headers = String::from_utf8_lossy(&raw[..split]).to_string();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    Reply {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    }
}

fn new_event(n: usize, source_id: &str) -> NewEvent {
    NewEvent {
        timestamp: format!("2025-07-01T11:{:02}:{:02}.000Z", n / 60, n % 60),
        source_id: source_id.to_string(),
        event_type: "object_detected".to_string(),
        object_details: Some(format!(
            r#"[{{"track_id":{n},"class_id":0,"class_name":"person","confidence":0.9,"bbox":[1,2,3,4]}}]"#
        )),
        confidence: Some(0.9),
        zone: None,
        snapshot_path: None,
    }
}

fn seed(db_path: &Path, count: usize) {
    let mut store = SqliteEventStore::open(&db_path.to_string_lossy()).expect("open store");
    for n in 0..count {
        store.insert(&new_event(n, "video_video2")).expect("insert");
    }
}

fn start(dir: &Path) -> vigil::ApiHandle {
    ApiServer::new(ApiConfig {
        addr: "127.0.0.1:0".to_string(),
        db_path: dir.join("surveillance.db"),
        snapshot_dir: dir.join("snapshots"),
    })
    .spawn()
    .expect("spawn api")
}

fn event_count(db_path: &Path) -> usize {
    let mut store = SqliteEventStore::open(&db_path.to_string_lossy()).expect("open store");
    store.list_recent(1000).expect("list").len()
}

#[test]
fn status_reports_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api = start(dir.path());

    let reply = send(api.addr, "GET", "/api/status", None);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json()["status"], "API Running");
    assert!(reply.headers.contains("Content-Type: application/json"));

    let reply = send(api.addr, "GET", "/api/unknown", None);
    assert_eq!(reply.status, 404);
    assert_eq!(reply.json()["detail"], "Not Found");

    api.stop().expect("stop");
}

#[test]
fn oversized_limit_falls_back_to_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed(&dir.path().join("surveillance.db"), 60);
    let api = start(dir.path());

    let reply = send(api.addr, "GET", "/api/events?limit=500", None);
    assert_eq!(reply.status, 200);
    let body = reply.json();
    assert_eq!(body["count"], DEFAULT_LIMIT);
    let events = body["events"].as_array().expect("events array");
    assert_eq!(events.len(), DEFAULT_LIMIT);
    // Newest first, with details returned as structured JSON.
    assert_eq!(events[0]["timestamp"], "2025-07-01T11:00:59.000Z");
    assert_eq!(events[0]["object_details"][0]["track_id"], 59);

    let reply = send(api.addr, "GET", "/api/events?limit=5", None);
    assert_eq!(reply.json()["count"], 5);

    let reply = send(api.addr, "GET", "/api/events?limit=abc", None);
    assert_eq!(reply.status, 400);

    api.stop().expect("stop");
}

#[test]
fn deleting_missing_event_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("surveillance.db");
    seed(&db_path, 3);
    let api = start(dir.path());

    let reply = send(api.addr, "DELETE", "/api/events/999", None);
    assert_eq!(reply.status, 404);
    assert_eq!(reply.json()["detail"], "Event not found");
    assert_eq!(event_count(&db_path), 3);

    let reply = send(api.addr, "DELETE", "/api/events/2", None);
    assert_eq!(reply.status, 204);
    assert!(reply.body.is_empty());
    assert_eq!(event_count(&db_path), 2);

    let reply = send(api.addr, "GET", "/api/events/2", None);
    assert_eq!(reply.status, 405);

    api.stop().expect("stop");
}

#[test]
fn bulk_delete_reports_rows_removed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("surveillance.db");
    seed(&db_path, 2);
    let api = start(dir.path());

    let reply = send(
        api.addr,
        "POST",
        "/api/events/delete-bulk",
        Some(r#"{"event_ids": [1, 2, 3]}"#),
    );
    assert_eq!(reply.status, 200);
    let body = reply.json();
    assert_eq!(body["deleted"], 2);
    assert_eq!(body["message"], "Deleted 2 events");
    assert_eq!(event_count(&db_path), 0);

    let reply = send(
        api.addr,
        "POST",
        "/api/events/delete-bulk",
        Some(r#"{"event_ids": [1]}"#),
    );
    assert_eq!(reply.status, 404);

    let reply = send(api.addr, "POST", "/api/events/delete-bulk", Some("[1,2]"));
    assert_eq!(reply.status, 400);

    api.stop().expect("stop");
}

#[test]
fn snapshots_are_served_only_from_the_snapshot_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api = start(dir.path());
    let snapshots = dir.path().join("snapshots");
    std::fs::write(snapshots.join("snapshot_video_video2_20250701_114432_129.jpg"), b"\xff\xd8jpeg")
        .expect("write snapshot");
    std::fs::write(dir.path().join("secret.txt"), b"secret").expect("write secret");

    let reply = send(
        api.addr,
        "GET",
        "/api/snapshots/snapshot_video_video2_20250701_114432_129.jpg",
        None,
    );
    assert_eq!(reply.status, 200);
    assert!(reply.headers.contains("Content-Type: image/jpeg"));
    assert_eq!(reply.body, b"\xff\xd8jpeg");

    for path in [
        "/api/snapshots/..%2Fsecret.txt",
        "/api/snapshots/%2E%2E",
        "/api/snapshots/..",
    ] {
        let reply = send(api.addr, "GET", path, None);
        assert_eq!(reply.status, 403, "{}", path);
        assert_eq!(reply.json()["detail"], "Access denied");
    }

    let reply = send(api.addr, "GET", "/api/snapshots/missing.jpg", None);
    assert_eq!(reply.status, 404);

    api.stop().expect("stop");
}
