//! Thin client over the daemon's length-framed Unix-socket protocol.

use crate::daemon::rpc::{Command, Envelope, Status};
use crate::error::{BeadsError, Result};
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;

pub async fn health_ping(socket_path: &Path, timeout: Duration) -> Result<()> {
    let envelope = call(socket_path, Command::Health, timeout).await?;
    match envelope.status {
        Status::Ok => Ok(()),
        _ => Err(BeadsError::transient("daemon unhealthy")),
    }
}

pub async fn call(socket_path: &Path, command: Command, timeout: Duration) -> Result<Envelope> {
    tokio::time::timeout(timeout, call_inner(socket_path, command))
        .await
        .map_err(|_| BeadsError::transient("rpc call timed out"))?
}

async fn call_inner(socket_path: &Path, command: Command) -> Result<Envelope> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| BeadsError::transient(format!("failed to connect to daemon socket: {e}")))?;

    let payload = serde_json::to_vec(&command).map_err(BeadsError::from)?;
    crate::daemon::rpc::write_frame(&mut stream, &payload).await?;

    let response = crate::daemon::rpc::read_frame(&mut stream).await?;
    let envelope: Envelope = serde_json::from_slice(&response).map_err(BeadsError::from)?;

    if matches!(envelope.status, Status::Unsupported) {
        return Err(BeadsError::transient("daemon_unsupported"));
    }

    Ok(envelope)
}
