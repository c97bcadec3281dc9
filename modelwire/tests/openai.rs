mod common;

use common::*;
use modelwire::{
    CancellationToken, ChatRequest, ChunkType, ErrorCode, Message, OpenAiProvider, Provider,
    ToolCall,
};
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(base_url: String) -> OpenAiProvider {
    OpenAiProvider::new(SecretString::from(SYNTHETIC_KEY.to_string()), Some(base_url))
}

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

#[tokio::test]
async fn streams_hello_world_with_usage() {
    let server = MockServer::start().await;
    let body = sse_data(&[
        r#"{"id":"chatcmpl-9","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#,
        r#"{"id":"chatcmpl-9","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hello"}}]}"#,
        r#"{"id":"chatcmpl-9","model":"gpt-4o","choices":[{"index":0,"delta":{"content":" world"}}]}"#,
        r#"{"id":"chatcmpl-9","model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        r#"{"id":"chatcmpl-9","model":"gpt-4o","choices":[],"usage":{"prompt_tokens":8,"completion_tokens":2,"total_tokens":10}}"#,
        "[DONE]",
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", format!("Bearer {}", SYNTHETIC_KEY).as_str()))
        .and(body_partial_json(json!({
            "stream": true,
            "stream_options": {"include_usage": true},
            "messages": [{"role": "system", "content": "sys"}, {"role": "user", "content": "Hello"}]
        })))
        .respond_with(sse_response(body))
        .expect(1)
        .mount(&server)
        .await;

    let request =
        ChatRequest::new("gpt-4o", 64, vec![Message::user("Hello")]).with_system_prompt("sys");
    let chunks = collect(
        provider(server.uri())
            .send_message(CancellationToken::new(), request)
            .unwrap(),
    )
    .await;

    assert_well_formed(&chunks);
    assert_eq!(
        kinds(&chunks),
        vec![ChunkType::Start, ChunkType::Chunk, ChunkType::Chunk, ChunkType::End]
    );
    assert_eq!(chunks[0].message_id, "chatcmpl-9");
    assert_eq!(text_of(&chunks), "Hello world");
    let usage = chunks[3].usage.unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (8, 2));
}

#[tokio::test]
async fn streams_file_read_tool_call() {
    let server = MockServer::start().await;
    let body = sse_data(&[
        r#"{"id":"c1","choices":[{"index":0,"delta":{"role":"assistant","tool_calls":[{"index":0,"id":"call_abc","type":"function","function":{"name":"file_read","arguments":""}}]}}]}"#,
        r#"{"id":"c1","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":"}}]}}]}"#,
        r#"{"id":"c1","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"test.txt\"}"}}]}}]}"#,
        r#"{"id":"c1","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
        "[DONE]",
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(body))
        .mount(&server)
        .await;

    let chunks = collect(
        provider(server.uri())
            .send_message(
                CancellationToken::new(),
                ChatRequest::new("gpt-4o", 64, vec![Message::user("read test.txt")]),
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
            ChunkType::ToolCallDelta,
            ChunkType::ToolCallEnd,
            ChunkType::End
        ]
    );
    assert_eq!(chunks[1].tool_name, "file_read");
    assert_eq!(chunks[1].tool_id, "call_abc");
    let args = format!("{}{}", chunks[2].content, chunks[3].content);
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&args).unwrap(),
        json!({"path": "test.txt"})
    );
}

#[tokio::test]
async fn tool_results_are_bound_to_the_originating_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "messages": [
                {"role": "user"},
                {"role": "assistant", "tool_calls": [{"id": "call_77", "type": "function"}]},
                {"role": "tool", "tool_call_id": "call_77", "content": "file body"}
            ]
        })))
        .respond_with(sse_response(sse_data(&[
            r#"{"id":"c2","choices":[{"delta":{"content":"done"},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let messages = vec![
        Message::user("read it"),
        Message::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "call_77".into(),
                name: "file_read".into(),
                input: json!({"path": "test.txt"}),
            }],
        ),
        Message::tool_result("file_read", "file body"),
    ];
    let chunks = collect(
        provider(server.uri())
            .send_message(CancellationToken::new(), ChatRequest::new("gpt-4o", 64, messages))
            .unwrap(),
    )
    .await;
    assert_eq!(chunks.last().unwrap().kind, ChunkType::End);
}

#[tokio::test]
async fn rate_limit_status_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "1.5")
                .set_body_json(json!({"error": {"message": "Rate limit reached", "type": "requests"}})),
        )
        .mount(&server)
        .await;

    let chunks = collect(
        provider(server.uri())
            .send_message(
                CancellationToken::new(),
                ChatRequest::new("gpt-4o", 64, vec![Message::user("hi")]),
            )
            .unwrap(),
    )
    .await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].error_code, Some(ErrorCode::RateLimit));
}

#[tokio::test]
async fn validate_credentials_lists_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .and(header("authorization", format!("Bearer {}", SYNTHETIC_KEY).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"object": "list", "data": []})))
        .expect(1)
        .mount(&server)
        .await;

    provider(server.uri())
        .validate_credentials(&CancellationToken::new())
        .await
        .unwrap();
}
