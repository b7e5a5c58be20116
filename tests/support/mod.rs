#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, Response, StatusCode};
use serde_json::Value;
use tower::util::ServiceExt;

use tianji::gateway::Gateway;
use tianji::{GatewayOptions, ProxyConfig};

pub const MASTER_KEY: &str = "sk-master";

pub async fn gateway(yaml: &str) -> Arc<Gateway> {
    let config = ProxyConfig::from_yaml(yaml).unwrap();
    Arc::new(
        Gateway::from_config(config, GatewayOptions::default())
            .await
            .unwrap(),
    )
}

pub fn post_json(uri: &str, key: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get(uri: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder.body(Body::empty()).unwrap()
}

pub async fn send(gateway: &Arc<Gateway>, request: Request<Body>) -> Response<Body> {
    tianji::gateway::router(Arc::clone(gateway))
        .oneshot(request)
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

pub fn header<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

pub fn assert_status(response: &Response<Body>, status: StatusCode) {
    assert_eq!(response.status(), status, "unexpected status");
}

/// Callbacks run on spawned tasks; wait until `ready` holds or give up after 2 s.
pub async fn eventually(mut ready: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if ready() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    ready()
}

pub fn completion(model: &str, content: &str, total_tokens: u64) -> Value {
    serde_json::json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion",
        "created": 1700000000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": total_tokens - 2, "completion_tokens": 2, "total_tokens": total_tokens}
    })
}

pub fn chat_body(model: &str, content: &str) -> Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": content}]
    })
}
