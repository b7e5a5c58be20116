mod support;

use axum::http::StatusCode;
use httpmock::prelude::*;
use serde_json::json;
use tianji::utils::test_support::should_skip_httpmock;

use support::*;

fn config(base: &str) -> String {
    format!(
        r#"
model_list:
  - model_name: gpt-4o
    litellm_params:
      model: openai/gpt-4o
      api_base: {base}/v1
      api_key: sk-upstream
guardrails:
  - guardrail_name: pii
    guardrail: pii
  - guardrail_name: toxic
    guardrail: banned_phrases
    phrases: [idiot]
  - guardrail_name: no-secrets-out
    guardrail: banned_regexes
    patterns: ["sk-[a-z0-9]{{8,}}"]
    mode: post_call
policies:
  prod:
    pipeline:
      mode: pre_call
      steps:
        - {{guardrail: pii, on_pass: next, on_fail: block}}
        - {{guardrail: toxic, on_pass: allow, on_fail: modify_response, modify_response_message: filtered}}
  outbound:
    guardrails: {{add: [no-secrets-out]}}
policy_attachments:
  - {{policy: prod, tags: [production]}}
  - {{policy: outbound, scope: "*"}}
"#
    )
}

fn tagged(content: &str) -> serde_json::Value {
    let mut body = chat_body("gpt-4o", content);
    body["metadata"] = json!({"tags": ["production"]});
    body
}

#[tokio::test]
async fn pipeline_blocks_and_modifies_tagged_requests() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(completion("gpt-4o", "Hi!", 7));
        })
        .await;
    let gateway = gateway(&config(&server.base_url())).await;

    let blocked = send(
        &gateway,
        post_json("/v1/chat/completions", None, &tagged("mail me at jane@example.com")),
    )
    .await;
    assert_status(&blocked, StatusCode::BAD_REQUEST);
    let body = body_json(blocked).await;
    assert_eq!(body["error"]["type"], "policy_violation");

    let modified = send(
        &gateway,
        post_json("/v1/chat/completions", None, &tagged("you idiot")),
    )
    .await;
    assert_status(&modified, StatusCode::OK);
    let body = body_json(modified).await;
    assert_eq!(body["choices"][0]["message"]["content"], "filtered");

    let allowed = send(&gateway, post_json("/v1/chat/completions", None, &tagged("hello"))).await;
    assert_status(&allowed, StatusCode::OK);

    // Untagged requests never see the production pipeline.
    let untagged = send(
        &gateway,
        post_json("/v1/chat/completions", None, &chat_body("gpt-4o", "jane@example.com")),
    )
    .await;
    assert_status(&untagged, StatusCode::OK);
    mock.assert_calls(2);

    let counters = gateway.counters().clone();
    assert!(eventually(|| counters.snapshot().requests == 4).await);
    assert_eq!(counters.snapshot().policy_blocked, 1);
}

#[tokio::test]
async fn post_call_guardrails_inspect_responses() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .json_body(completion("gpt-4o", "the key is sk-abcdef123456", 7));
        })
        .await;
    let gateway = gateway(&config(&server.base_url())).await;

    let response = send(
        &gateway,
        post_json("/v1/chat/completions", None, &chat_body("gpt-4o", "what is the key?")),
    )
    .await;
    assert_status(&response, StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "policy_violation");
    mock.assert_calls(1);
}

#[tokio::test]
async fn post_call_guardrails_inspect_tool_call_arguments() {
    if should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": null, "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "send_key", "arguments": "{\"key\":\"sk-abcdef123456\"}"}
                    }]},
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
            }));
        })
        .await;
    let gateway = gateway(&config(&server.base_url())).await;

    let response = send(
        &gateway,
        post_json("/v1/chat/completions", None, &chat_body("gpt-4o", "share the key")),
    )
    .await;
    assert_status(&response, StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "policy_violation");
    mock.assert_calls(1);
}
