//! The per-request producer task and its cancellation-aware send loop.
//!
//! Each `send_message` spawns exactly one task that owns the backend
//! response. Every channel send and every backend read races the caller's
//! [`CancellationToken`]; when the token fires (or the receiver is dropped)
//! the task returns, which drops the response (releasing the connection) and
//! the sender (closing the channel).

use super::error::ProviderError;
use crate::types::StreamChunk;
use bytes::BytesMut;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Bounded so a slow reader applies backpressure to the backend read loop.
pub const CHUNK_CHANNEL_CAPACITY: usize = 100;

/// Receiving half of a chat stream. `None` from `recv` means the stream is
/// finished.
pub type ChunkReceiver = mpsc::Receiver<StreamChunk>;

/// Adapt a [`ChunkReceiver`] into a `futures::Stream`.
pub fn into_stream(rx: ChunkReceiver) -> ReceiverStream<StreamChunk> {
    ReceiverStream::new(rx)
}

/// The caller canceled or stopped listening; the producer must unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stopped;

/// Per-backend error classification, consulted by the shared pumps.
pub(crate) trait Classify: Send + Sync + 'static {
    /// Failure with no usable HTTP response (connect, timeout, body read).
    fn transport(&self, err: &reqwest::Error) -> ProviderError;
    /// Non-success HTTP response.
    fn status(&self, status: u16, headers: &HeaderMap, body: &str) -> ProviderError;
}

/// Backend-specific frame decoder obeying the shared chunk ordering.
pub(crate) trait Decoder: Send + 'static {
    /// Handle one frame. `event` is the SSE event name (empty for NDJSON).
    fn decode(&mut self, event: &str, data: &str) -> Vec<StreamChunk>;
    /// The backend closed the body cleanly.
    fn finish(&mut self) -> Vec<StreamChunk>;
    /// Terminal error chunk for a failure observed mid-stream.
    fn fail(&mut self, err: &ProviderError) -> StreamChunk;
    /// A terminal chunk has been produced; stop reading.
    fn is_done(&self) -> bool;
}

/// Sending half owned by the producer task.
pub(crate) struct ChunkSink {
    provider: &'static str,
    tx: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
    terminated: bool,
}

impl ChunkSink {
    /// Deliver one chunk, blocking while the channel is full, unless the
    /// caller goes away first. Nothing is delivered after a terminal chunk.
    pub async fn send(&mut self, chunk: StreamChunk) -> Result<(), Stopped> {
        if self.terminated {
            tracing::debug!(provider = self.provider, kind = ?chunk.kind, "dropping chunk after terminal event");
            return Ok(());
        }
        if chunk.is_terminal() {
            self.terminated = true;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Stopped),
            sent = self.tx.send(chunk) => sent.map_err(|_| Stopped),
        }
    }

    pub async fn send_all(&mut self, chunks: Vec<StreamChunk>) -> Result<(), Stopped> {
        for chunk in chunks {
            self.send(chunk).await?;
        }
        Ok(())
    }

    /// Await a backend future unless the caller cancels or drops the
    /// receiver first.
    pub async fn wait<F: Future>(&self, fut: F) -> Result<F::Output, Stopped> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Stopped),
            _ = self.tx.closed() => Err(Stopped),
            out = fut => Ok(out),
        }
    }

    /// Next item of a backend stream unless the caller cancels first.
    pub async fn next<S: Stream + Unpin>(&self, stream: &mut S) -> Result<Option<S::Item>, Stopped> {
        self.wait(stream.next()).await
    }

    /// Log a classified failure and emit it as the terminal chunk.
    pub async fn fail(&mut self, chunk: StreamChunk, err: &ProviderError) -> Result<(), Stopped> {
        tracing::warn!(provider = self.provider, code = %err.code, "{}", err.message);
        self.send(chunk).await
    }
}

/// Spawn the producer task for one request and hand back the receiver.
pub(crate) fn spawn_producer<F, Fut>(
    provider: &'static str,
    cancel: CancellationToken,
    produce: F,
) -> ChunkReceiver
where
    F: FnOnce(ChunkSink) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    let sink = ChunkSink {
        provider,
        tx,
        cancel,
        terminated: false,
    };
    tokio::spawn(produce(sink));
    rx
}

/// Issue the request and return the successful response. Any failure is
/// classified and emitted as the stream's only chunk.
pub(crate) async fn open<C: Classify>(
    sink: &mut ChunkSink,
    request: reqwest::RequestBuilder,
    classify: &C,
) -> Option<reqwest::Response> {
    let response = match sink.wait(request.send()).await {
        Err(Stopped) => return None,
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            let err = classify.transport(&e);
            let _ = sink.fail(StreamChunk::error("", err.code, &err.user_message), &err).await;
            return None;
        }
    };

    let status = response.status();
    if status.is_success() {
        return Some(response);
    }

    let headers = response.headers().clone();
    let body = match sink.wait(response.text()).await {
        Err(Stopped) => return None,
        Ok(body) => body.unwrap_or_default(),
    };
    let err = classify.status(status.as_u16(), &headers, &body);
    let _ = sink.fail(StreamChunk::error("", err.code, &err.user_message), &err).await;
    None
}

/// Feed an SSE body through `decoder` until a terminal chunk, EOF, transport
/// failure or cancellation.
pub(crate) async fn pump_sse<D: Decoder, C: Classify>(
    sink: &mut ChunkSink,
    response: reqwest::Response,
    mut decoder: D,
    classify: &C,
) {
    let mut events = Box::pin(response.bytes_stream().eventsource());
    loop {
        let item = match sink.next(&mut events).await {
            Err(Stopped) => return,
            Ok(item) => item,
        };
        let chunks = match item {
            None => decoder.finish(),
            Some(Ok(event)) => decoder.decode(&event.event, &event.data),
            Some(Err(EventStreamError::Transport(e))) => {
                let err = classify.transport(&e);
                let chunk = decoder.fail(&err);
                let _ = sink.fail(chunk, &err).await;
                return;
            }
            Some(Err(e)) => {
                tracing::debug!(provider = sink.provider, error = %e, "skipping undecodable SSE frame");
                continue;
            }
        };
        if sink.send_all(chunks).await.is_err() || decoder.is_done() {
            return;
        }
    }
}

/// Feed a newline-delimited JSON body through `decoder`, one line per frame.
/// Stops at the first terminal chunk even if more lines are buffered.
pub(crate) async fn pump_ndjson<D: Decoder, C: Classify>(
    sink: &mut ChunkSink,
    response: reqwest::Response,
    mut decoder: D,
    classify: &C,
) {
    let mut body = Box::pin(response.bytes_stream());
    let mut buf = BytesMut::new();
    loop {
        let item = match sink.next(&mut body).await {
            Err(Stopped) => return,
            Ok(item) => item,
        };
        match item {
            Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
            Some(Err(e)) => {
                let err = classify.transport(&e);
                let chunk = decoder.fail(&err);
                let _ = sink.fail(chunk, &err).await;
                return;
            }
            None => {
                // A trailing line without a newline still counts.
                if !buf.is_empty() {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    buf.clear();
                    if sink.send_all(decoder.decode("", line.trim())).await.is_err()
                        || decoder.is_done()
                    {
                        return;
                    }
                }
                let _ = sink.send_all(decoder.finish()).await;
                return;
            }
        }

        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line = buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if sink.send_all(decoder.decode("", line)).await.is_err() || decoder.is_done() {
                return;
            }
        }
    }
}
