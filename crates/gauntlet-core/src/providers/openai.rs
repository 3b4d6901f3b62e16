//! OpenAI-compatible chat completions protocol.

use super::{base_url, ensure_success, sse, ChatMessage};
use crate::cancel::CancelToken;
use crate::model::{Model, ModelParams, Provider};
use anyhow::Context;
use serde_json::{json, Value};

const KIND: &str = "openai-compat";

pub(crate) async fn complete(
    http: &reqwest::Client,
    provider: &Provider,
    model: &Model,
    messages: &[ChatMessage],
) -> anyhow::Result<String> {
    let resp = send(http, provider, &request_body(model, messages, false)).await?;
    let body: Value = resp.json().await.context("parse chat completion response")?;
    body.pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("{} response missing choices[0].message.content", KIND))
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
        value
            .pointer("/choices/0/delta/content")
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
    let url = format!("{}/chat/completions", base_url(provider));
    let mut req = http.post(&url).json(body);
    if let Some(key) = &provider.api_key {
        req = req.header("Authorization", format!("Bearer {}", key));
    }
    let resp = req.send().await.with_context(|| format!("POST {}", url))?;
    ensure_success(resp, KIND).await
}

fn request_body(model: &Model, messages: &[ChatMessage], stream: bool) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("model".into(), json!(model.model_id));
    body.insert("messages".into(), json!(messages));
    if stream {
        body.insert("stream".into(), json!(true));
    }
    let p = &model.params;
    if let Some(v) = ModelParams::enabled(&p.temperature) {
        body.insert("temperature".into(), json!(v));
    }
    if let Some(v) = ModelParams::enabled(&p.max_tokens) {
        body.insert("max_tokens".into(), json!(v));
    }
    if let Some(v) = ModelParams::enabled(&p.top_p) {
        body.insert("top_p".into(), json!(v));
    }
    if let Some(v) = ModelParams::enabled(&p.frequency_penalty) {
        body.insert("frequency_penalty".into(), json!(v));
    }
    if let Some(v) = ModelParams::enabled(&p.presence_penalty) {
        body.insert("presence_penalty".into(), json!(v));
    }
    if let Some(stops) = p.stops() {
        body.insert("stop".into(), json!(stops));
    }
    Value::Object(body)
}
