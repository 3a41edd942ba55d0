//! stdio transport for the control surface
//!
//! Commands arrive as one JSON object per line on stdin, events leave the same way on stdout.

use crate::control::{ControlCommand, EventReceiver};
use crate::supervisor::Supervisor;
use fxdk_core::{FxdkError, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Serve the control surface on stdin/stdout until stdin closes
pub async fn run(supervisor: Arc<Supervisor>) -> Result<()> {
    serve(supervisor, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve the control surface over any line-oriented stream pair
pub async fn serve<R, W>(supervisor: Arc<Supervisor>, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let output = Arc::new(Mutex::new(output));
    let mut reader = BufReader::new(input);
    let mut line = String::new();

    info!("Control surface listening on stdio");

    let event_task = tokio::spawn(forward_events(supervisor.bus().subscribe(), output.clone()));

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| FxdkError::IpcError(format!("Failed to read control input: {}", e)))?;

        if bytes_read == 0 {
            info!("Control input closed (EOF)");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        debug!("Received: {}", trimmed);

        let command: ControlCommand = match serde_json::from_str(trimmed) {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to parse control command: {}", e);
                continue;
            }
        };

        if let Err(e) = supervisor.handle(command).await {
            error!("Control command failed: {}", e);
        }
    }

    event_task.abort();
    Ok(())
}

async fn forward_events<W>(mut events: EventReceiver, output: Arc<Mutex<W>>)
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let event = events.recv().await;
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize event: {}", e);
                continue;
            }
        };
        let mut out = output.lock().await;
        if let Err(e) = write_line(&mut *out, &json).await {
            error!("Failed to write event: {}", e);
            break;
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, json: &str) -> std::io::Result<()> {
    out.write_all(json.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
