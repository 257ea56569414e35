//! Unix socket client for communicating with the daemon.

use crate::protocol::{ControlCommand, Envelope};
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest silence tolerated between two response chunks. Covers the
/// prompt evaluation and any request queued ahead of ours.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Check if the daemon is reachable. Never has a side effect.
pub async fn is_running(socket_path: &Path) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(socket_path)).await,
        Ok(Ok(_))
    )
}

async fn connect(socket_path: &Path) -> Result<UnixStream> {
    tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(socket_path))
        .await
        .map_err(|_| anyhow::anyhow!("Connection timeout - is the daemon running?"))?
        .with_context(|| format!("Failed to connect to daemon at {}", socket_path.display()))
}

/// Send a prompt and hand every received chunk to `on_chunk` until the
/// daemon closes the connection. Returns the number of bytes received.
pub async fn send_prompt<F>(socket_path: &Path, prompt: &str, mut on_chunk: F) -> Result<usize>
where
    F: FnMut(&[u8]) -> std::io::Result<()>,
{
    let mut stream = connect(socket_path).await?;
    stream
        .write_all(&Envelope::prompt(prompt).encode())
        .await
        .context("Failed to send prompt")?;

    let mut received = 0;
    let mut buf = [0u8; 4096];
    loop {
        let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| anyhow::anyhow!("Request timeout - the model took too long"))?
            .context("Failed to read response")?;
        if n == 0 {
            break;
        }
        received += n;
        on_chunk(&buf[..n]).context("Failed to write response")?;
    }

    Ok(received)
}

/// Ask the daemon to shut down and return its confirmation text.
pub async fn send_shutdown(socket_path: &Path) -> Result<String> {
    let mut stream = connect(socket_path).await?;
    stream
        .write_all(&Envelope::control(ControlCommand::Shutdown).encode())
        .await
        .context("Failed to send shutdown request")?;

    let mut reply = Vec::new();
    tokio::time::timeout(READ_TIMEOUT, stream.read_to_end(&mut reply))
        .await
        .map_err(|_| anyhow::anyhow!("Shutdown confirmation timed out"))?
        .context("Failed to read shutdown confirmation")?;

    if reply.is_empty() {
        return Err(anyhow::anyhow!("Daemon closed the connection without confirming"));
    }
    Ok(String::from_utf8_lossy(&reply).into_owned())
}
