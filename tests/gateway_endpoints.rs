mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use serde_json::json;
use tianji::utils::test_support::should_skip_httpmock;

use support::*;

fn config(base: &str) -> String {
    format!(
        r#"
model_list:
  - model_name: gpt-4o
    litellm_params: {{model: openai/gpt-4o, api_base: "{base}/gpt", api_key: sk-gpt}}
  - model_name: claude
    litellm_params: {{model: openai/claude-proxy, api_base: "{base}/claude", api_key: sk-claude}}
  - model_name: text-embedding-3-small
    litellm_params: {{model: openai/text-embedding-3-small, api_base: "{base}/emb", api_key: sk-emb}}
  - model_name: dall-e-3
    litellm_params: {{model: openai/dall-e-3, api_base: "{base}/media", api_key: sk-media}}
  - model_name: tts-1
    litellm_params: {{model: openai/tts-1, api_base: "{base}/media", api_key: sk-media}}
  - model_name: whisper
    litellm_params: {{model: openai/whisper-1, api_base: "{base}/media", api_key: sk-media}}
tianji_settings:
  cache: true
  cache_params: {{type: local, ttl: 60}}
  auto_router:
    - name: x
      default_model: gpt-4o
      embedding_model: text-embedding-3-small
      routes:
        - {{name: math, model: gpt-4o, examples: ["solve equation"]}}
        - {{name: code, model: claude, examples: ["write python"]}}
"#
    )
}

fn embeddings(vectors: &[[f32; 2]]) -> serde_json::Value {
    json!({
        "object": "list",
        "model": "text-embedding-3-small",
        "data": vectors
            .iter()
            .enumerate()
            .map(|(index, vector)| json!({"object": "embedding", "index": index, "embedding": vector}))
            .collect::<Vec<_>>(),
        "usage": {"prompt_tokens": 4, "total_tokens": 4}
    })
}

#[tokio::test]
async fn auto_router_picks_the_closest_route() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let examples = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/emb/embeddings")
                .body_includes("solve equation");
            then.status(200).json_body(embeddings(&[[1.0, 0.0], [0.0, 1.0]]));
        })
        .await;
    let query = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/emb/embeddings")
                .body_includes("write a python function");
            then.status(200).json_body(embeddings(&[[0.1, 0.9]]));
        })
        .await;
    let claude = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/claude/chat/completions")
                .json_body_includes(r#"{"model":"claude-proxy"}"#);
            then.status(200).json_body(completion("claude-proxy", "def f(): pass", 9));
        })
        .await;
    let gpt = server
        .mock_async(|when, then| {
            when.method(POST).path("/gpt/chat/completions");
            then.status(200).json_body(completion("gpt-4o", "default", 9));
        })
        .await;
    let gateway = gateway(&config(&server.base_url())).await;

    let response = send(
        &gateway,
        post_json("/v1/chat/completions", None, &chat_body("auto_router/x", "write a python function")),
    )
    .await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(header(&response, "x-tianji-deployment"), Some("claude/d1"));
    claude.assert_calls(1);
    examples.assert_calls(1);
    query.assert_calls(1);

    let response = send(
        &gateway,
        post_json("/v1/chat/completions", None, &chat_body("auto_router/x", "")),
    )
    .await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(header(&response, "x-tianji-deployment"), Some("gpt-4o/d1"));
    gpt.assert_calls(1);
    // Centroids are built once; empty input never embeds.
    examples.assert_calls(1);
    query.assert_calls(1);
}

#[tokio::test]
async fn embeddings_are_routed_and_cached() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/emb/embeddings")
                .header("authorization", "Bearer sk-emb");
            then.status(200).json_body(embeddings(&[[0.5, 0.5]]));
        })
        .await;
    let gateway = gateway(&config(&server.base_url())).await;
    let request = json!({"model": "text-embedding-3-small", "input": "hello"});

    let first = send(&gateway, post_json("/v1/embeddings", None, &request)).await;
    assert_status(&first, StatusCode::OK);
    assert_eq!(
        header(&first, "x-tianji-deployment"),
        Some("text-embedding-3-small/d1")
    );
    let body = body_json(first).await;
    assert_eq!(body["data"][0]["embedding"], json!([0.5, 0.5]));

    let second = send(&gateway, post_json("/v1/embeddings", None, &request)).await;
    assert_status(&second, StatusCode::OK);
    mock.assert_calls(1);
}

#[tokio::test]
async fn media_endpoints_forward_bytes() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let images = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/media/images/generations")
                .json_body_includes(r#"{"model":"dall-e-3"}"#);
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"created": 1, "data": [{"url": "https://img.example/1.png"}]}));
        })
        .await;
    let speech = server
        .mock_async(|when, then| {
            when.method(POST).path("/media/audio/speech");
            then.status(200)
                .header("content-type", "audio/mpeg")
                .body([0u8, 1, 2, 3]);
        })
        .await;
    let transcription = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/media/audio/transcriptions")
                .body_includes("whisper-1");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"text": "hello"}));
        })
        .await;
    let gateway = gateway(&config(&server.base_url())).await;

    let response = send(
        &gateway,
        post_json("/v1/images/generations", None, &json!({"model": "dall-e-3", "prompt": "a cat"})),
    )
    .await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(body_json(response).await["data"][0]["url"], "https://img.example/1.png");
    images.assert_calls(1);

    let response = send(
        &gateway,
        post_json("/v1/audio/speech", None, &json!({"model": "tts-1", "input": "hi", "voice": "alloy"})),
    )
    .await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(header(&response, "content-type"), Some("audio/mpeg"));
    assert_eq!(body_text(response).await.as_bytes(), &[0, 1, 2, 3]);
    speech.assert_calls(1);

    let boundary = "tianji-boundary";
    let multipart = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper\r\n\
         --{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.wav\"\r\nContent-Type: audio/wav\r\n\r\nRIFF\r\n\
         --{boundary}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/v1/audio/transcriptions")
        .header("content-type", format!("multipart/form-data; boundary={boundary}"))
        .body(Body::from(multipart))
        .unwrap();
    let response = send(&gateway, request).await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(body_json(response).await["text"], "hello");
    transcription.assert_calls(1);

    let missing_model = send(&gateway, post_json("/v1/images/generations", None, &json!({"prompt": "x"}))).await;
    assert_status(&missing_model, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pass_through_returns_upstream_bytes_unchanged() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let upstream = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/gpt/files")
                .query_param("purpose", "batch")
                .header("authorization", "Bearer sk-gpt")
                .body("raw-bytes");
            then.status(201)
                .header("content-type", "text/plain")
                .body("created as-is");
        })
        .await;
    let gateway = gateway(&config(&server.base_url())).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/openai/files?purpose=batch")
        .body(Body::from("raw-bytes"))
        .unwrap();
    let response = send(&gateway, request).await;
    assert_status(&response, StatusCode::CREATED);
    assert_eq!(header(&response, "content-type"), Some("text/plain"));
    assert_eq!(body_text(response).await, "created as-is");
    upstream.assert_calls(1);

    let unknown = Request::builder()
        .method("POST")
        .uri("/v1/bedrock/model/invoke")
        .body(Body::empty())
        .unwrap();
    let response = send(&gateway, unknown).await;
    assert_status(&response, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_and_readiness() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let gateway = gateway(&config(&server.base_url())).await;

    let response = send(&gateway, get("/health", None)).await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");

    let response = send(&gateway, get("/health/readiness", None)).await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["db"], "not_configured");
    assert_eq!(body["counters"]["requests"], 0);
}
