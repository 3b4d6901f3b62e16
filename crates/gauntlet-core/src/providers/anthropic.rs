//! Anthropic messages protocol.

use super::{base_url, ensure_success, sse, ChatMessage};
use crate::cancel::CancelToken;
use crate::model::{Model, ModelParams, Provider};
use anyhow::Context;
use serde_json::{json, Value};

const KIND: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub(crate) async fn complete(
    http: &reqwest::Client,
    provider: &Provider,
    model: &Model,
    messages: &[ChatMessage],
) -> anyhow::Result<String> {
    let resp = send(http, provider, &request_body(model, messages, false)).await?;
    let body: Value = resp.json().await.context("parse messages response")?;
    body.pointer("/content/0/text")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("{} response missing content[0].text", KIND))
}

pub(crate) async fn stream(
    http: &reqwest::Client,
    provider: &Provider,
    model: &Model,
    messages: &[ChatMessage],
    cancel: &CancelToken,
    on_token: &(dyn for<'a> Fn(&'a str) + Send + Sync),
) -> anyhow::Result<String> {
    let resp = send(http, provider, &request_body(model, messages, true)).await?;
    sse::read_stream(resp, cancel, on_token, |value| {
        if value.get("type").and_then(|t| t.as_str()) != Some("content_block_delta") {
            return None;
        }
        value
            .pointer("/delta/text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    })
    .await
}

async fn send(
    http: &reqwest::Client,
    provider: &Provider,
    body: &Value,
) -> anyhow::Result<reqwest::Response> {
    let url = format!("{}/v1/messages", base_url(provider));
    let mut req = http.post(&url).header("anthropic-version", API_VERSION).json(body);
    if let Some(key) = &provider.api_key {
        req = req.header("x-api-key", key);
    }
    let resp = req.send().await.with_context(|| format!("POST {}", url))?;
    ensure_success(resp, KIND).await
}

fn request_body(model: &Model, messages: &[ChatMessage], stream: bool) -> Value {
    // The messages API takes the system prompt out of band.
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect();
    let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != "system").collect();

    let mut body = serde_json::Map::new();
    body.insert("model".into(), json!(model.model_id));
    if !system.is_empty() {
        body.insert("system".into(), json!(system.join("\n\n")));
    }
    body.insert("messages".into(), json!(turns));
    if stream {
        body.insert("stream".into(), json!(true));
    }

    let p = &model.params;
    let max_tokens = ModelParams::enabled(&p.max_tokens)
        .copied()
        .unwrap_or(DEFAULT_MAX_TOKENS);
    body.insert("max_tokens".into(), json!(max_tokens));
    if let Some(v) = ModelParams::enabled(&p.temperature) {
        body.insert("temperature".into(), json!(v));
    }
    if let Some(v) = ModelParams::enabled(&p.top_p) {
        body.insert("top_p".into(), json!(v));
    }
    if let Some(v) = ModelParams::enabled(&p.top_k) {
        body.insert("top_k".into(), json!(v));
    }
    if let Some(stops) = p.stops() {
        body.insert("stop_sequences".into(), json!(stops));
    }
    Value::Object(body)
}
