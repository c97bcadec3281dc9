mod common;

use common::*;
use modelwire::{
    CancellationToken, ChatRequest, ChunkType, ErrorCode, Message, OllamaProvider, Provider,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ndjson_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson")
}

#[tokio::test]
async fn streams_hello_world() {
    let server = MockServer::start().await;
    let body = ndjson(&[
        json!({"model": "llama3.2", "message": {"role": "assistant", "content": "Hello"}, "done": false}),
        json!({"model": "llama3.2", "message": {"role": "assistant", "content": " world"}, "done": false}),
        json!({"model": "llama3.2", "message": {"role": "assistant", "content": ""}, "done": true, "done_reason": "stop", "prompt_eval_count": 11, "eval_count": 2}),
    ]);
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({
            "stream": true,
            "messages": [{"role": "system", "content": "sys"}, {"role": "user", "content": "Hello"}],
            "options": {"num_predict": 64}
        })))
        .respond_with(ndjson_response(body))
        .expect(1)
        .mount(&server)
        .await;

    let request =
        ChatRequest::new("llama3.2", 64, vec![Message::user("Hello")]).with_system_prompt("sys");
    let chunks = collect(
        OllamaProvider::new(Some(server.uri()))
            .send_message(CancellationToken::new(), request)
            .unwrap(),
    )
    .await;

    assert_well_formed(&chunks);
    assert_eq!(
        kinds(&chunks),
        vec![ChunkType::Start, ChunkType::Chunk, ChunkType::Chunk, ChunkType::End]
    );
    assert_eq!(text_of(&chunks), "Hello world");
    let usage = chunks[3].usage.unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (11, 2));
}

#[tokio::test]
async fn done_line_stops_scanning() {
    let server = MockServer::start().await;
    let body = ndjson(&[
        json!({"message": {"content": "one"}, "done": false}),
        json!({"message": {"content": ""}, "done": true}),
        json!({"message": {"content": "trailing"}, "done": false}),
    ]);
    Mock::given(method("POST"))
        .respond_with(ndjson_response(body))
        .mount(&server)
        .await;

    let chunks = collect(
        OllamaProvider::new(Some(server.uri()))
            .send_message(
                CancellationToken::new(),
                ChatRequest::new("llama3.2", 64, vec![Message::user("hi")]),
            )
            .unwrap(),
    )
    .await;
    assert_well_formed(&chunks);
    assert_eq!(text_of(&chunks), "one");
}

#[tokio::test]
async fn streams_file_read_tool_call() {
    let server = MockServer::start().await;
    let body = ndjson(&[
        json!({"message": {"role": "assistant", "content": "", "tool_calls": [{"function": {"name": "file_read", "arguments": {"path": "test.txt"}}}]}, "done": false}),
        json!({"message": {"role": "assistant", "content": ""}, "done": true}),
    ]);
    Mock::given(method("POST"))
        .respond_with(ndjson_response(body))
        .mount(&server)
        .await;

    let chunks = collect(
        OllamaProvider::new(Some(server.uri()))
            .send_message(
                CancellationToken::new(),
                ChatRequest::new("llama3.2", 64, vec![Message::user("read")]),
            )
            .unwrap(),
    )
    .await;
    assert_well_formed(&chunks);
    assert_eq!(
        kinds(&chunks),
        vec![
            ChunkType::Start,
            ChunkType::ToolCallStart,
            ChunkType::ToolCallDelta,
            ChunkType::ToolCallEnd,
            ChunkType::End
        ]
    );
    assert_eq!(chunks[1].tool_name, "file_read");
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&chunks[2].content).unwrap(),
        json!({"path": "test.txt"})
    );
}

#[tokio::test]
async fn missing_model_is_model_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"error": "model \"nope\" not found, try pulling it first"})),
        )
        .mount(&server)
        .await;

    let chunks = collect(
        OllamaProvider::new(Some(server.uri()))
            .send_message(
                CancellationToken::new(),
                ChatRequest::new("nope", 64, vec![Message::user("hi")]),
            )
            .unwrap(),
    )
    .await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].error_code, Some(ErrorCode::ModelNotFound));
}

#[tokio::test]
async fn list_models_reads_tags() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                {"name": "llama3.2:latest", "model": "llama3.2:latest", "size": 1},
                {"name": "qwen2.5:7b", "model": "qwen2.5:7b", "size": 2}
            ]
        })))
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(Some(server.uri()));
    let models = provider.list_models().await.unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].id, "llama3.2:latest");
    assert!(models.iter().all(|m| m.provider == "ollama"));
}

#[tokio::test]
async fn unreachable_daemon_is_connection_error_without_host() {
    let endpoint = refused_endpoint().await;
    let provider = OllamaProvider::new(Some(endpoint.clone()));

    let err = provider
        .validate_credentials(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ConnectionError);
    assert!(!err.user_message.contains("127.0.0.1"));
    assert!(!err.user_message.contains(&endpoint));

    let chunks = collect(
        provider
            .send_message(
                CancellationToken::new(),
                ChatRequest::new("llama3.2", 64, vec![Message::user("hi")]),
            )
            .unwrap(),
    )
    .await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].error_code, Some(ErrorCode::ConnectionError));
    assert!(!chunks[0].content.contains("127.0.0.1"));
}
