#![allow(dead_code)]

use modelwire::{ChunkReceiver, ChunkType, StreamChunk};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A credential shape no pattern scrubber knows about, so only exact-match
/// redaction can remove it.
pub const SYNTHETIC_KEY: &str = "zz-synthetic-credential-7f3a9c";

/// Drain a stream, failing the test if it does not close in time.
pub async fn collect(mut rx: ChunkReceiver) -> Vec<StreamChunk> {
    tokio::time::timeout(Duration::from_secs(10), async move {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    })
    .await
    .expect("stream did not close")
}

pub fn kinds(chunks: &[StreamChunk]) -> Vec<ChunkType> {
    chunks.iter().map(|c| c.kind).collect()
}

pub fn text_of(chunks: &[StreamChunk]) -> String {
    chunks
        .iter()
        .filter(|c| c.kind == ChunkType::Chunk)
        .map(|c| c.content.as_str())
        .collect()
}

/// Check the ordering rules every stream must obey.
pub fn assert_well_formed(chunks: &[StreamChunk]) {
    assert!(!chunks.is_empty(), "empty stream");

    let last = chunks.last().unwrap();
    assert!(last.is_terminal(), "stream must end with end or error: {:?}", kinds(chunks));
    assert_eq!(
        chunks.iter().filter(|c| c.is_terminal()).count(),
        1,
        "exactly one terminal event: {:?}",
        kinds(chunks)
    );

    if chunks.len() == 1 {
        assert_eq!(last.kind, ChunkType::Error, "a lone chunk must be an error");
        return;
    }

    assert_eq!(chunks[0].kind, ChunkType::Start);
    assert!(!chunks[0].message_id.is_empty());
    assert_eq!(chunks.iter().filter(|c| c.kind == ChunkType::Start).count(), 1);

    let mut expected_index = 0;
    // tool_id -> saw a delta yet; triples may interleave.
    let mut open: HashMap<String, bool> = HashMap::new();
    let mut closed: Vec<String> = Vec::new();
    for chunk in &chunks[1..] {
        match chunk.kind {
            ChunkType::Chunk => {
                assert_eq!(chunk.index, expected_index);
                expected_index += 1;
            }
            ChunkType::ToolCallStart => {
                assert!(!chunk.tool_id.is_empty());
                assert!(!chunk.tool_name.is_empty());
                assert!(!closed.contains(&chunk.tool_id), "tool id reused");
                assert!(open.insert(chunk.tool_id.clone(), false).is_none(), "tool call started twice");
            }
            ChunkType::ToolCallDelta => {
                let saw = open.get_mut(&chunk.tool_id).expect("delta outside a tool call");
                *saw = true;
            }
            ChunkType::ToolCallEnd => {
                let saw = open.remove(&chunk.tool_id).expect("end outside a tool call");
                assert!(saw, "tool call without a delta");
                closed.push(chunk.tool_id.clone());
            }
            ChunkType::End => {
                assert!(open.is_empty(), "end with an unterminated tool call");
            }
            // An error may cut a triple short; callers discard open calls.
            ChunkType::Error => {}
            ChunkType::Start => unreachable!(),
        }
    }
}

/// Named SSE events, `event:` line included.
pub fn sse_events(events: &[Value]) -> String {
    events
        .iter()
        .map(|e| {
            let name = e["type"].as_str().unwrap_or("message");
            format!("event: {}\ndata: {}\n\n", name, e)
        })
        .collect()
}

/// Bare `data:` frames.
pub fn sse_data(frames: &[&str]) -> String {
    frames.iter().map(|f| format!("data: {}\n\n", f)).collect()
}

pub fn ndjson(lines: &[Value]) -> String {
    lines.iter().map(|l| format!("{}\n", l)).collect()
}

/// Serve one streaming response that sends `first` and then never finishes.
/// The returned receiver fires once the client drops the connection.
pub async fn hanging_server(content_type: &'static str, first: String) -> (String, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // Read the request head and body; one read is enough for these small
        // requests once the header terminator has arrived.
        let mut buf = vec![0u8; 64 * 1024];
        let mut seen = Vec::new();
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            seen.extend_from_slice(&buf[..n]);
            if n == 0 || seen.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: {}\r\ntransfer-encoding: chunked\r\n\r\n",
            content_type
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        let frame = format!("{:x}\r\n{}\r\n", first.len(), first);
        socket.write_all(frame.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();

        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(());
    });

    (format!("http://{}", addr), closed_rx)
}

/// An address nothing listens on.
pub async fn refused_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}
