use crate::storage::{EventStore, SqliteEventStore};
use anyhow::{anyhow, Context, Result};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 200;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub db_path: PathBuf,
    pub snapshot_dir: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8008".to_string(),
            db_path: PathBuf::from("data/surveillance.db"),
            snapshot_dir: PathBuf::from("data/snapshots"),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig) -> Self {
        Self { cfg }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        std::fs::create_dir_all(&self.cfg.snapshot_dir).with_context(|| {
            format!(
                "failed to create snapshot dir {}",
                self.cfg.snapshot_dir.display()
            )
        })?;
        if let Some(parent) = self.cfg.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database dir {}", parent.display()))?;
        }
        let db_path = self
            .cfg
            .db_path
            .to_str()
            .ok_or_else(|| anyhow!("database path is not valid UTF-8"))?;
        let store = SqliteEventStore::open(db_path)?;

        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("failed to bind api on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let snapshot_root = self.cfg.snapshot_dir.clone();
        let join = std::thread::spawn(move || {
            let mut store = store;
            serve_connections(
                || listener.accept(),
                &mut store,
                &snapshot_root,
                &shutdown_thread,
            );
            log::info!("event api stopped");
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

/// Accepts until shutdown. Failed accepts (aborted handshakes, descriptor
/// exhaustion) are logged and retried after a pause.
fn serve_connections<A>(
    mut accept: A,
    store: &mut dyn EventStore,
    snapshot_root: &Path,
    shutdown: &AtomicBool,
) where
    A: FnMut() -> std::io::Result<(TcpStream, SocketAddr)>,
{
    while !shutdown.load(Ordering::SeqCst) {
        match accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, store, snapshot_root) {
                    log::warn!("event api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                log::warn!("event api accept failed: {}", err);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }

    fn detail(status: u16, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "detail": message }))
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: Vec::new(),
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    store: &mut dyn EventStore,
    snapshot_root: &Path,
) -> Result<()> {
    // The listener is non-blocking; accepted sockets must not be.
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_response(&mut stream, &Response::detail(400, "malformed request"))?;
            return Err(err);
        }
    };
    let response = route(&request, store, snapshot_root);
    log::info!("{} {} -> {}", request.method, request.raw_path, response.status);
    write_response(&mut stream, &response)
}

fn route(request: &HttpRequest, store: &mut dyn EventStore, snapshot_root: &Path) -> Response {
    let path = request.path.as_str();
    let method = request.method.as_str();

    if path == "/api/status" {
        return match method {
            "GET" => Response::json(200, &serde_json::json!({ "status": "API Running" })),
            _ => method_not_allowed(),
        };
    }
    if path == "/api/events" {
        return match method {
            "GET" => list_events(request, store),
            _ => method_not_allowed(),
        };
    }
    if path == "/api/events/delete-bulk" {
        return match method {
            "POST" => bulk_delete(request, store),
            _ => method_not_allowed(),
        };
    }
    if let Some(id) = path.strip_prefix("/api/events/") {
        return match method {
            "DELETE" => delete_event(id, store),
            _ => method_not_allowed(),
        };
    }
    if let Some(name) = path.strip_prefix("/api/snapshots/") {
        return match method {
            "GET" => serve_snapshot(name, snapshot_root),
            _ => method_not_allowed(),
        };
    }
    Response::detail(404, "Not Found")
}

fn method_not_allowed() -> Response {
    Response::detail(405, "Method Not Allowed")
}

/// Out-of-range page sizes fall back to the default.
pub fn clamp_limit(requested: i64) -> usize {
    if requested <= 0 || requested > MAX_LIMIT as i64 {
        DEFAULT_LIMIT
    } else {
        requested as usize
    }
}

fn list_events(request: &HttpRequest, store: &mut dyn EventStore) -> Response {
    let limit = match request.query_param("limit") {
        None => DEFAULT_LIMIT,
        Some(raw) => match raw.trim().parse::<i64>() {
            Ok(n) => clamp_limit(n),
            Err(_) => return Response::detail(400, "limit must be an integer"),
        },
    };
    match store.list_recent(limit) {
        Ok(events) => Response::json(
            200,
            &serde_json::json!({ "count": events.len(), "events": events }),
        ),
        Err(err) => {
            log::error!("failed to list events: {:#}", err);
            Response::detail(500, "failed to read events")
        }
    }
}

fn delete_event(raw_id: &str, store: &mut dyn EventStore) -> Response {
    let Ok(id) = raw_id.parse::<i64>() else {
        return Response::detail(400, "event id must be an integer");
    };
    match store.delete(id) {
        Ok(true) => {
            log::info!("deleted event {}", id);
            Response::empty(204)
        }
        Ok(false) => Response::detail(404, "Event not found"),
        Err(err) => {
            log::error!("failed to delete event {}: {:#}", id, err);
            Response::detail(500, "failed to delete event")
        }
    }
}

#[derive(Deserialize)]
struct BulkDeleteRequest {
    event_ids: Vec<i64>,
}

fn bulk_delete(request: &HttpRequest, store: &mut dyn EventStore) -> Response {
    let parsed: BulkDeleteRequest = match serde_json::from_slice(&request.body) {
        Ok(parsed) => parsed,
        Err(_) => return Response::detail(400, "body must be {\"event_ids\": [int, ...]}"),
    };
    if parsed.event_ids.is_empty() {
        return Response::detail(400, "event_ids must not be empty");
    }
    match store.delete_many(&parsed.event_ids) {
        Ok(0) => Response::detail(404, "No matching events found"),
        Ok(n) => {
            log::info!("bulk deleted {} of {} events", n, parsed.event_ids.len());
            Response::json(
                200,
                &serde_json::json!({
                    "deleted": n,
                    "message": format!("Deleted {} events", n),
                }),
            )
        }
        Err(err) => {
            log::error!("bulk delete failed: {:#}", err);
            Response::detail(500, "failed to delete events")
        }
    }
}

/// Result of mapping a requested snapshot name onto the snapshot root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotLookup {
    Found(PathBuf),
    Forbidden,
    NotFound,
}

/// Accepts only a single plain file name that stays inside `root` once
/// symlinks are resolved.
pub fn resolve_snapshot(root: &Path, raw_name: &str) -> SnapshotLookup {
    let Ok(name) = percent_decode_str(raw_name).decode_utf8() else {
        return SnapshotLookup::Forbidden;
    };
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return SnapshotLookup::Forbidden;
    }
    let mut components = Path::new(&*name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return SnapshotLookup::Forbidden,
    }

    let candidate = root.join(&*name);
    if !candidate.is_file() {
        return SnapshotLookup::NotFound;
    }
    let (Ok(root), Ok(resolved)) = (root.canonicalize(), candidate.canonicalize()) else {
        return SnapshotLookup::NotFound;
    };
    if !resolved.starts_with(&root) {
        return SnapshotLookup::Forbidden;
    }
    SnapshotLookup::Found(resolved)
}

fn serve_snapshot(name: &str, snapshot_root: &Path) -> Response {
    match resolve_snapshot(snapshot_root, name) {
        SnapshotLookup::Found(path) => match std::fs::read(&path) {
            Ok(body) => Response {
                status: 200,
                content_type: crate::snapshot::content_type_for(name),
                body,
            },
            Err(err) => {
                log::error!("failed to read snapshot {}: {}", path.display(), err);
                Response::detail(500, "failed to read snapshot")
            }
        },
        SnapshotLookup::Forbidden => {
            log::warn!("rejected snapshot request for '{}'", name);
            Response::detail(403, "Access denied")
        }
        SnapshotLookup::NotFound => Response::detail(404, "Snapshot not found"),
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
    };
    if header_end > MAX_HEADER_BYTES {
        return Err(anyhow!("request headers too large"));
    }

    let text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let status_line = match response.status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = response.content_type,
        len = response.body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query_param(&self, key: &str) -> Option<String> {
        let query = self.raw_path.split_once('?')?.1;
        query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (k == key).then(|| percent_decode_str(v).decode_utf8_lossy().to_string())
        })
    }
}
