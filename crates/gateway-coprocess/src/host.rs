//! Framed host transport
//!
//! Reads request frames from the gateway, runs them against the
//! [`Dispatcher`] and writes one answer per request with the same id.
//! Bundles arrive either as a path to an extracted directory or as a zip
//! archive that is installed under the configured bundle path first.
//! Hook and event dispatch happen on the blocking pool, so answers may go
//! out in a different order than the requests came in.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use gateway_coprocess_sdk::ipc::{tokio_io, Frame, FrameKind};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::dispatcher::Dispatcher;

/// Answers queued for the writer task
const OUTBOUND_BUFFER: usize = 64;

/// Serve requests until the gateway sends a shutdown frame or closes the
/// stream, then tear the dispatcher down.
pub async fn serve<R, W>(dispatcher: Arc<Dispatcher>, mut reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);
    let writer_task = tokio::spawn(write_loop(writer, rx));
    let mut in_flight = JoinSet::new();

    let read_result = loop {
        let frame = match tokio_io::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!("Gateway closed the stream");
                break Ok(());
            }
            Err(e) => break Err(anyhow::Error::new(e).context("Failed to read request frame")),
        };

        match frame.kind {
            FrameKind::Shutdown => {
                tracing::info!(id = frame.id, "Shutdown requested");
                break Ok(());
            }
            FrameKind::Failure => {
                tracing::warn!(id = frame.id, "Ignoring failure frame sent by the gateway");
            }
            _ => {
                let dispatcher = Arc::clone(&dispatcher);
                let tx = tx.clone();
                in_flight.spawn(async move {
                    let answer = answer(dispatcher, frame).await;
                    if tx.send(answer).await.is_err() {
                        tracing::warn!("Writer stopped before an answer could be sent");
                    }
                });
            }
        }
    };

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Request task failed: {}", e);
        }
    }
    drop(tx);

    let write_result = writer_task.await.context("Writer task failed")?;
    dispatcher.shutdown();

    read_result?;
    write_result
}

/// Produce the answer frame for one request
async fn answer(dispatcher: Arc<Dispatcher>, frame: Frame) -> Frame {
    let Frame { kind, id, payload } = frame;
    tracing::trace!(id, kind = ?kind, len = payload.len(), "Request received");

    match kind {
        FrameKind::DispatchHook => {
            let input = payload.clone();
            let result = tokio::task::spawn_blocking(move || dispatcher.dispatch_hook(&input)).await;
            match result {
                Ok(output) => Frame::new(FrameKind::DispatchHook, id, output),
                Err(e) => {
                    tracing::error!(id, "Hook task failed: {}", e);
                    Frame::new(FrameKind::DispatchHook, id, payload)
                }
            }
        }
        FrameKind::DispatchEvent => {
            let result = tokio::task::spawn_blocking(move || dispatcher.dispatch_event(&payload)).await;
            if let Err(e) = result {
                tracing::error!(id, "Event task failed: {}", e);
            }
            Frame::empty(FrameKind::DispatchEvent, id)
        }
        FrameKind::LoadBundle => {
            let result = tokio::task::spawn_blocking(move || load_bundle(&dispatcher, &payload)).await;
            match result {
                Ok(Ok(())) => Frame::empty(FrameKind::LoadBundle, id),
                Ok(Err(message)) => Frame::new(FrameKind::Failure, id, message),
                Err(e) => Frame::new(FrameKind::Failure, id, format!("Load task failed: {}", e)),
            }
        }
        FrameKind::InstallBundle => {
            let result = tokio::task::spawn_blocking(move || install_bundle(&dispatcher, &payload)).await;
            match result {
                Ok(Ok(path)) => Frame::new(FrameKind::InstallBundle, id, path),
                Ok(Err(message)) => Frame::new(FrameKind::Failure, id, message),
                Err(e) => Frame::new(FrameKind::Failure, id, format!("Install task failed: {}", e)),
            }
        }
        FrameKind::Reload => {
            dispatcher.reload();
            Frame::empty(FrameKind::Reload, id)
        }
        FrameKind::Shutdown | FrameKind::Failure => Frame::empty(kind, id),
    }
}

fn load_bundle(dispatcher: &Dispatcher, payload: &Bytes) -> Result<(), String> {
    let path = std::str::from_utf8(payload).map_err(|e| format!("Bundle path is not UTF-8: {}", e))?;
    dispatcher
        .load_bundle(path)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Payload is `<api_id>\0<zip bytes>`; answers with the installed path
fn install_bundle(dispatcher: &Dispatcher, payload: &Bytes) -> Result<String, String> {
    let split = payload
        .iter()
        .position(|b| *b == 0)
        .ok_or("Install payload has no API id separator")?;
    let api_id = std::str::from_utf8(&payload[..split]).map_err(|e| format!("API id is not UTF-8: {}", e))?;
    dispatcher
        .install_archive(api_id, &payload[split + 1..])
        .map(|bundle| bundle.path().display().to_string())
        .map_err(|e| e.to_string())
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Frame>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        tokio_io::write_frame(&mut writer, &frame)
            .await
            .with_context(|| format!("Failed to write answer {}", frame.id))?;
    }
    Ok(())
}
