//! Outbound Serializer.
//!
//! One connection, one writer task. Producers hand frames to a bounded queue
//! and wait for the writer to report the outcome of their write, so frames
//! from concurrent producers are never interleaved on the wire.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

pub const QUEUE_CAPACITY: usize = 256;

/// How long `enqueue` waits for room in a full queue.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid payload: {0}")]
    Payload(String),
}

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("outbound writer is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Ping,
    Close,
}

/// The write half of a connection. Only ever driven by one task.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn write_frame(&mut self, kind: FrameKind, payload: Vec<u8>) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

struct OutboundRequest {
    kind: FrameKind,
    payload: Vec<u8>,
    result: oneshot::Sender<Result<(), OutboundError>>,
}

/// A write admitted to the queue, not yet performed.
pub struct PendingWrite {
    result: oneshot::Receiver<Result<(), OutboundError>>,
}

impl PendingWrite {
    /// Outcome of the write, or `Closed` if shutdown got there first.
    pub async fn wait(self) -> Result<(), OutboundError> {
        self.result.await.unwrap_or(Err(OutboundError::Closed))
    }
}

enum Lifecycle<S> {
    /// No frame sent yet; the writer has not been spawned.
    Idle(mpsc::Receiver<OutboundRequest>, S),
    Running(JoinHandle<S>),
    /// Writer gone; the sink is kept so `close` can shut it.
    Stopped(Option<S>),
}

pub struct OutboundWriter<S: FrameSink> {
    tx: mpsc::Sender<OutboundRequest>,
    stop_tx: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle<S>>,
}

impl<S: FrameSink> OutboundWriter<S> {
    pub fn new(sink: S) -> Self {
        Self::with_capacity(sink, QUEUE_CAPACITY)
    }

    pub fn with_capacity(sink: S, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, _) = watch::channel(false);
        Self {
            tx,
            stop_tx,
            lifecycle: Mutex::new(Lifecycle::Idle(rx, sink)),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    async fn ensure_writer(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Idle(..)) {
            return;
        }
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped(None));
        if let Lifecycle::Idle(rx, sink) = previous {
            let stop_rx = self.stop_tx.subscribe();
            *lifecycle = Lifecycle::Running(tokio::spawn(run_writer(sink, rx, stop_rx)));
            tracing::debug!("Outbound writer started");
        }
    }

    /// Admit a frame to the queue. The payload is owned by the queue from
    /// here on.
    pub async fn submit(&self, kind: FrameKind, payload: &[u8]) -> Result<PendingWrite, OutboundError> {
        if self.is_stopped() {
            return Err(OutboundError::Closed);
        }
        self.ensure_writer().await;

        let (result, rx) = oneshot::channel();
        let request = OutboundRequest {
            kind,
            payload: payload.to_vec(),
            result,
        };

        let mut stop_rx = self.stop_tx.subscribe();
        tokio::select! {
            sent = self.tx.send_timeout(request, ENQUEUE_TIMEOUT) => match sent {
                Ok(()) => Ok(PendingWrite { result: rx }),
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(OutboundError::QueueFull),
                Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(OutboundError::Closed),
            },
            _ = stop_rx.wait_for(|stopped| *stopped) => Err(OutboundError::Closed),
        }
    }

    /// Queue a frame and wait for it to be written.
    pub async fn enqueue(&self, kind: FrameKind, payload: &[u8]) -> Result<(), OutboundError> {
        self.submit(kind, payload).await?.wait().await
    }

    /// Shut the writer down. Queued frames are failed with `Closed`, a frame
    /// already being written is allowed to finish. Returns once the writer
    /// task has exited. Safe to call more than once, from any task.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);

        let mut lifecycle = self.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped(None));
        *lifecycle = match previous {
            Lifecycle::Idle(mut rx, sink) => {
                rx.close();
                drain(&mut rx);
                Lifecycle::Stopped(Some(sink))
            }
            Lifecycle::Running(handle) => match handle.await {
                Ok(sink) => Lifecycle::Stopped(Some(sink)),
                Err(e) => {
                    tracing::error!("Outbound writer task failed: {}", e);
                    Lifecycle::Stopped(None)
                }
            },
            stopped @ Lifecycle::Stopped(_) => stopped,
        };
    }

    /// Stop the writer, then close the underlying sink.
    pub async fn close(&self) -> Result<(), OutboundError> {
        self.stop().await;
        let mut lifecycle = self.lifecycle.lock().await;
        if let Lifecycle::Stopped(slot) = &mut *lifecycle {
            if let Some(mut sink) = slot.take() {
                sink.close().await?;
            }
        }
        Ok(())
    }
}

fn drain(rx: &mut mpsc::Receiver<OutboundRequest>) -> usize {
    let mut drained = 0;
    while let Ok(request) = rx.try_recv() {
        let _ = request.result.send(Err(OutboundError::Closed));
        drained += 1;
    }
    drained
}

async fn run_writer<S: FrameSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<OutboundRequest>,
    mut stop_rx: watch::Receiver<bool>,
) -> S {
    loop {
        if *stop_rx.borrow_and_update() {
            break;
        }
        tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            request = rx.recv() => match request {
                Some(request) => {
                    let outcome = sink
                        .write_frame(request.kind, request.payload)
                        .await
                        .map_err(OutboundError::from);
                    if let Err(e) = &outcome {
                        tracing::warn!("Outbound write failed: {}", e);
                    }
                    let _ = request.result.send(outcome);
                }
                None => break,
            },
        }
    }

    rx.close();
    let drained = drain(&mut rx);
    if drained > 0 {
        tracing::info!("Outbound writer stopped, {} queued frame(s) rejected", drained);
    } else {
        tracing::debug!("Outbound writer stopped");
    }
    sink
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Clone, Default)]
    struct Recorder {
        frames: Arc<StdMutex<Vec<(FrameKind, Vec<u8>)>>>,
        closed: Arc<StdMutex<bool>>,
    }

    #[async_trait]
    impl FrameSink for Recorder {
        async fn write_frame(&mut self, kind: FrameKind, payload: Vec<u8>) -> Result<(), TransportError> {
            self.frames.lock().unwrap().push((kind, payload));
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_enqueue_writes_frame() {
        let sink = Recorder::default();
        let writer = OutboundWriter::new(sink.clone());
        writer.enqueue(FrameKind::Text, b"hello").await.unwrap();
        assert_eq!(
            sink.frames.lock().unwrap().clone(),
            vec![(FrameKind::Text, b"hello".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_close_stops_then_closes_sink() {
        let sink = Recorder::default();
        let writer = OutboundWriter::new(sink.clone());
        writer.enqueue(FrameKind::Ping, b"").await.unwrap();
        writer.close().await.unwrap();
        assert!(*sink.closed.lock().unwrap());
        assert!(matches!(
            writer.enqueue(FrameKind::Text, b"late").await,
            Err(OutboundError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_without_any_write() {
        let sink = Recorder::default();
        let writer = OutboundWriter::new(sink.clone());
        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(*sink.closed.lock().unwrap());
        assert!(sink.frames.lock().unwrap().is_empty());
    }
}
