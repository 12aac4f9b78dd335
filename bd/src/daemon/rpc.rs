//! Length-framed request/response protocol carried over the daemon's Unix
//! socket: a 4-byte big-endian length prefix followed by a JSON payload.

use crate::error::{BeadsError, Result};
use crate::storage::Storage;
use crate::sync::FlushManager;
use crate::types::{IssueFilter, WorkFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;

const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;
const MAX_CONNECTIONS: usize = 64;

/// Command tags this build understands. A request whose `command` field
/// isn't in this set gets `Status::Unsupported` instead of a deserialization
/// error, so an older daemon can talk to a newer client (and vice versa)
/// without the connection erroring out.
const KNOWN_COMMANDS: &[&str] = &[
    "list",
    "get",
    "create",
    "update",
    "delete",
    "add-dep",
    "remove-dep",
    "add-label",
    "remove-label",
    "get-labels",
    "ready-work",
    "stats",
    "health",
    "status",
    "metrics",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "kebab-case")]
pub enum Command {
    List { query: String, filter: IssueFilter },
    Get { id: String },
    Create { issue: Box<crate::types::Issue>, actor: String },
    Update { id: String, updates: HashMap<String, String>, actor: String },
    Delete { id: String },
    AddDep { issue_id: String, depends_on_id: String, dep_type: String, actor: String },
    RemoveDep { issue_id: String, depends_on_id: String, actor: String },
    AddLabel { issue_id: String, label: String, actor: String },
    RemoveLabel { issue_id: String, label: String, actor: String },
    GetLabels { issue_id: String },
    ReadyWork { filter: WorkFilter },
    Stats,
    Health,
    Status,
    Metrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub status: Status,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Envelope {
    fn ok(data: serde_json::Value) -> Self {
        Envelope { status: Status::Ok, data: Some(data), error: None }
    }

    fn err(message: impl Into<String>) -> Self {
        Envelope { status: Status::Error, data: None, error: Some(message.into()) }
    }

    fn unsupported() -> Self {
        Envelope { status: Status::Unsupported, data: None, error: Some("daemon_unsupported".into()) }
    }
}

pub async fn read_frame(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| BeadsError::transient(format!("rpc read error: {e}")))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(BeadsError::user(format!("rpc frame too large: {len} bytes")));
    }
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| BeadsError::transient(format!("rpc read error: {e}")))?;
    Ok(buf)
}

pub async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> Result<()> {
    let len = (payload.len() as u32).to_be_bytes();
    stream
        .write_all(&len)
        .await
        .map_err(|e| BeadsError::transient(format!("rpc write error: {e}")))?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| BeadsError::transient(format!("rpc write error: {e}")))?;
    Ok(())
}

/// Per-command latency and rejection counters, exposed via the `Metrics`
/// command.
#[derive(Default)]
pub struct RpcMetrics {
    pub calls: std::sync::Mutex<HashMap<String, (u64, u64)>>,
    pub rejected_connections: AtomicU64,
}

impl RpcMetrics {
    fn record(&self, command: &str, latency_micros: u64) {
        let mut calls = self.calls.lock().unwrap();
        let entry = calls.entry(command.to_string()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += latency_micros;
    }

    /// A JSON snapshot of per-command call counts/latency and rejected
    /// connections, surfaced by the `Metrics` command.
    pub fn snapshot(&self) -> serde_json::Value {
        let calls = self.calls.lock().unwrap();
        let per_command: HashMap<&str, serde_json::Value> = calls
            .iter()
            .map(|(name, (count, total_micros))| {
                let avg = if *count > 0 { total_micros / count } else { 0 };
                (
                    name.as_str(),
                    serde_json::json!({ "count": count, "total_micros": total_micros, "avg_micros": avg }),
                )
            })
            .collect();
        serde_json::json!({
            "calls": per_command,
            "rejected_connections": self.rejected_connections.load(Ordering::Relaxed),
        })
    }
}

pub struct RpcServer {
    listener: UnixListener,
    storage: Arc<dyn Storage>,
    flush: Arc<FlushManager>,
    metrics: Arc<RpcMetrics>,
    concurrency: Arc<Semaphore>,
    version: &'static str,
    started_at: std::time::Instant,
}

impl RpcServer {
    pub fn bind(socket_path: &std::path::Path, storage: Arc<dyn Storage>, flush: Arc<FlushManager>) -> Result<Self> {
        if socket_path.exists() {
            let _ = std::fs::remove_file(socket_path);
        }
        let listener = UnixListener::bind(socket_path)
            .map_err(|e| BeadsError::environment(format!("failed to bind {}: {e}", socket_path.display())))?;
        Ok(RpcServer {
            listener,
            storage,
            flush,
            metrics: Arc::new(RpcMetrics::default()),
            concurrency: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            version: env!("CARGO_PKG_VERSION"),
            started_at: std::time::Instant::now(),
        })
    }

    pub fn metrics(&self) -> Arc<RpcMetrics> {
        self.metrics.clone()
    }

    /// Accepts connections forever, spawning one task per connection. Runs
    /// until its enclosing task is aborted by the daemon's shutdown path.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let permit = match self.concurrency.clone().try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            self.metrics.rejected_connections.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };
                    let storage = self.storage.clone();
                    let flush = self.flush.clone();
                    let metrics = self.metrics.clone();
                    let version = self.version;
                    let started_at = self.started_at;
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_connection(stream, &storage, &flush, &metrics, version, started_at).await {
                            log::debug!("rpc connection closed: {e}");
                        }
                    });
                }
                Err(e) => log::error!("rpc accept error: {e}"),
            }
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    storage: &Arc<dyn Storage>,
    flush: &Arc<FlushManager>,
    metrics: &RpcMetrics,
    version: &str,
    started_at: std::time::Instant,
) -> Result<()> {
    let frame = read_frame(&mut stream).await?;
    let raw: serde_json::Value = serde_json::from_slice(&frame)
        .map_err(|e| BeadsError::user(format!("malformed rpc request: {e}")))?;

    let tag = raw.get("command").and_then(serde_json::Value::as_str).map(str::to_string);

    let envelope = match tag.as_deref() {
        Some(t) if KNOWN_COMMANDS.contains(&t) => match serde_json::from_value::<Command>(raw) {
            Ok(command) => {
                let command_name = command_name(&command);
                let start = std::time::Instant::now();
                let envelope = dispatch(&command, storage, flush, metrics, version, started_at).await;
                metrics.record(command_name, start.elapsed().as_micros() as u64);
                envelope
            }
            Err(e) => Envelope::err(format!("malformed rpc request: {e}")),
        },
        _ => unsupported_envelope(),
    };

    let payload = serde_json::to_vec(&envelope).map_err(BeadsError::from)?;
    write_frame(&mut stream, &payload).await
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::List { .. } => "list",
        Command::Get { .. } => "get",
        Command::Create { .. } => "create",
        Command::Update { .. } => "update",
        Command::Delete { .. } => "delete",
        Command::AddDep { .. } => "add-dep",
        Command::RemoveDep { .. } => "remove-dep",
        Command::AddLabel { .. } => "add-label",
        Command::RemoveLabel { .. } => "remove-label",
        Command::GetLabels { .. } => "get-labels",
        Command::ReadyWork { .. } => "ready-work",
        Command::Stats => "stats",
        Command::Health => "health",
        Command::Status => "status",
        Command::Metrics => "metrics",
    }
}

async fn dispatch(
    command: &Command,
    storage: &Arc<dyn Storage>,
    flush: &Arc<FlushManager>,
    metrics: &RpcMetrics,
    version: &str,
    started_at: std::time::Instant,
) -> Envelope {
    match execute(command, storage, flush, metrics, version, started_at).await {
        Ok(data) => Envelope::ok(data),
        Err(message) => Envelope::err(message),
    }
}

/// Mutating handlers call this after a successful write so the flush
/// consumer wakes up and exports the change instead of parking forever.
async fn signal_dirty(flush: &Arc<FlushManager>) {
    flush.mark_dirty(false).await;
}

async fn execute(
    command: &Command,
    storage: &Arc<dyn Storage>,
    flush: &Arc<FlushManager>,
    metrics: &RpcMetrics,
    version: &str,
    started_at: std::time::Instant,
) -> std::result::Result<serde_json::Value, String> {
    match command {
        Command::List { query, filter } => {
            let issues = storage.search_issues(query, filter).map_err(|e| e.to_string())?;
            Ok(serde_json::to_value(issues).map_err(|e| e.to_string())?)
        }
        Command::Get { id } => {
            let issue = storage.get_issue(id).map_err(|e| e.to_string())?;
            Ok(serde_json::to_value(issue).map_err(|e| e.to_string())?)
        }
        Command::Create { issue, actor } => {
            storage.create_issue(issue, actor).map_err(|e| e.to_string())?;
            signal_dirty(flush).await;
            Ok(serde_json::json!({ "id": issue.id }))
        }
        Command::Update { id, updates, actor } => {
            storage.update_issue(id, updates.clone(), actor).map_err(|e| e.to_string())?;
            signal_dirty(flush).await;
            Ok(serde_json::json!({}))
        }
        Command::Delete { id } => {
            storage.delete_issue(id).map_err(|e| e.to_string())?;
            signal_dirty(flush).await;
            Ok(serde_json::json!({}))
        }
        Command::AddDep { issue_id, depends_on_id, dep_type, actor } => {
            let dep_type =
                serde_json::from_value(serde_json::Value::String(dep_type.clone())).map_err(|e| e.to_string())?;
            let dep = crate::types::Dependency {
                issue_id: issue_id.clone(),
                depends_on_id: depends_on_id.clone(),
                dep_type,
                thread_id: None,
                metadata: None,
                created_at: chrono::Utc::now(),
                created_by: actor.clone(),
            };
            storage.add_dependency(&dep, actor).map_err(|e| e.to_string())?;
            signal_dirty(flush).await;
            Ok(serde_json::json!({}))
        }
        Command::RemoveDep { issue_id, depends_on_id, actor } => {
            storage
                .remove_dependency(issue_id, depends_on_id, actor)
                .map_err(|e| e.to_string())?;
            signal_dirty(flush).await;
            Ok(serde_json::json!({}))
        }
        Command::AddLabel { issue_id, label, actor } => {
            storage.add_label(issue_id, label, actor).map_err(|e| e.to_string())?;
            signal_dirty(flush).await;
            Ok(serde_json::json!({}))
        }
        Command::RemoveLabel { issue_id, label, actor } => {
            storage.remove_label(issue_id, label, actor).map_err(|e| e.to_string())?;
            signal_dirty(flush).await;
            Ok(serde_json::json!({}))
        }
        Command::GetLabels { issue_id } => {
            let labels = storage.get_labels(issue_id).map_err(|e| e.to_string())?;
            Ok(serde_json::to_value(labels).map_err(|e| e.to_string())?)
        }
        Command::ReadyWork { filter } => {
            let issues = storage.get_ready_work(filter).map_err(|e| e.to_string())?;
            Ok(serde_json::to_value(issues).map_err(|e| e.to_string())?)
        }
        Command::Stats => {
            let stats = storage.get_statistics().map_err(|e| e.to_string())?;
            Ok(serde_json::to_value(stats).map_err(|e| e.to_string())?)
        }
        Command::Health => Ok(serde_json::json!({ "healthy": true, "version": version })),
        Command::Status => Ok(serde_json::json!({
            "version": version,
            "uptime_secs": started_at.elapsed().as_secs(),
        })),
        Command::Metrics => Ok(serde_json::json!({ "version": version, "metrics": metrics.snapshot() })),
    }
}

fn unsupported_envelope() -> Envelope {
    Envelope::unsupported()
}
