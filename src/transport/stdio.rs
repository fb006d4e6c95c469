use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::info;

use crate::engine::Engine;
use crate::error::{IoError, PrismResult};
use crate::transport::codec::{self, Response};
use crate::transport::dispatcher::Dispatcher;

/// Drives the line-delimited JSON command loop over any byte stream pair.
///
/// Stdout carries nothing but framed responses; logs go to stderr. Closing
/// the input stream is the shutdown signal: in-flight commands drain, the
/// running pipeline is cancelled, and the loop returns.
pub async fn run_stdio<R, W>(engine: Arc<Engine>, reader: R, writer: W) -> PrismResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let dispatcher = Dispatcher::new(engine.clone());
    let mut lines = BufReader::new(reader).lines();

    // Single writer task; responses from concurrent commands interleave as
    // whole frames, never as partial lines.
    let (response_tx, mut response_rx) = mpsc::channel::<Response>(64);
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(response) = response_rx.recv().await {
            let frame = codec::encode(&response);
            if writer.write_all(frame.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut inflight = JoinSet::new();
    loop {
        let line = lines.next_line().await.map_err(IoError::Io)?;
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let dispatcher = dispatcher.clone();
        let tx = response_tx.clone();
        inflight.spawn(async move {
            let response = match codec::decode_line(&line) {
                Ok(request) => dispatcher.dispatch(request).await,
                Err(e) => Response::failure(Value::Null, "BAD_FRAME", e.to_string()),
            };
            let _ = tx.send(response).await;
        });
    }

    info!("command stream closed; shutting down");
    engine.shutdown();
    while inflight.join_next().await.is_some() {}
    drop(response_tx);
    let _ = writer_task.await;
    Ok(())
}
