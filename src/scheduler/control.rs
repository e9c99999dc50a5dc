// ABOUTME: Control endpoint of the elected scheduler on a loopback TCP port
// ABOUTME: One JSON request line in, one JSON response line out (status or trigger-sync)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use super::{SchedulerHandle, SchedulerStatus, TriggerOutcome};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest request line accepted; anything beyond is cut off and rejected.
const MAX_REQUEST_BYTES: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlRequest {
    Status,
    TriggerSync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlResponse {
    Status(SchedulerStatus),
    Trigger { outcome: TriggerOutcome },
    Error { message: String },
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind scheduler control endpoint on {}", addr))
}

/// Answer control requests until `shutdown` fires.
pub async fn serve_control(
    listener: TcpListener,
    handle: SchedulerHandle,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Scheduler control endpoint listening on {}", addr);
    }

    loop {
        let (stream, peer) = tokio::select! {
            biased;

            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::warn!("Control endpoint accept failed: {}", e);
                    continue;
                }
            },
        };

        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = answer(stream, &handle).await {
                tracing::debug!("Control connection from {} failed: {:?}", peer, e);
            }
        });
    }
    tracing::info!("Scheduler control endpoint stopped");
}

async fn answer(stream: TcpStream, handle: &SchedulerHandle) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read.take(MAX_REQUEST_BYTES))
        .read_line(&mut line)
        .await
        .context("Failed to read control request")?;

    let response = match serde_json::from_str::<ControlRequest>(line.trim()) {
        Ok(request) => dispatch(handle, request),
        Err(e) => ControlResponse::Error {
            message: format!("invalid request: {}", e),
        },
    };

    let mut body = serde_json::to_vec(&response)?;
    body.push(b'\n');
    write.write_all(&body).await?;
    write.shutdown().await?;
    Ok(())
}

fn dispatch(handle: &SchedulerHandle, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Status => ControlResponse::Status(handle.status()),
        ControlRequest::TriggerSync => {
            tracing::info!("Sync requested through the control endpoint");
            ControlResponse::Trigger {
                outcome: handle.trigger_sync_now(),
            }
        }
    }
}

/// Send one request to the scheduler listening on `addr`.
pub async fn send(addr: &str, request: ControlRequest) -> Result<ControlResponse> {
    tokio::time::timeout(CLIENT_TIMEOUT, exchange(addr, request))
        .await
        .with_context(|| format!("Timed out waiting for the scheduler at {}", addr))?
}

async fn exchange(addr: &str, request: ControlRequest) -> Result<ControlResponse> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("No scheduler is listening on {}", addr))?;

    let mut body = serde_json::to_vec(&request)?;
    body.push(b'\n');
    stream.write_all(&body).await?;

    let mut line = String::new();
    BufReader::new(stream)
        .read_line(&mut line)
        .await
        .context("Failed to read control response")?;
    serde_json::from_str(line.trim()).context("Malformed control response")
}
