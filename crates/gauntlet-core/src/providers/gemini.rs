//! Google generative language REST protocol. Streaming is not supported
//! here; callers fall back to `complete`.

use super::{base_url, ensure_success, ChatMessage};
use crate::model::{Model, ModelParams, Provider};
use anyhow::Context;
use serde_json::{json, Value};

const KIND: &str = "gemini";

pub(crate) async fn complete(
    http: &reqwest::Client,
    provider: &Provider,
    model: &Model,
    messages: &[ChatMessage],
) -> anyhow::Result<String> {
    let mut url = format!(
        "{}/v1beta/models/{}:generateContent",
        base_url(provider),
        model.model_id
    );
    if let Some(key) = &provider.api_key {
        url.push_str("?key=");
        url.push_str(key);
    }

    let resp = http
        .post(&url)
        .json(&request_body(model, messages))
        .send()
        .await
        .context("POST generateContent")?;
    let resp = ensure_success(resp, KIND).await?;
    let body: Value = resp.json().await.context("parse generateContent response")?;
    body.pointer("/candidates/0/content/parts/0/text")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("{} response missing candidates[0].content.parts[0].text", KIND))
}

fn request_body(model: &Model, messages: &[ChatMessage]) -> Value {
    // Single user turn: system then user content joined with blank lines.
    let prompt = messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut config = serde_json::Map::new();
    let p = &model.params;
    if let Some(v) = ModelParams::enabled(&p.temperature) {
        config.insert("temperature".into(), json!(v));
    }
    if let Some(v) = ModelParams::enabled(&p.max_tokens) {
        config.insert("max_output_tokens".into(), json!(v));
    }
    if let Some(v) = ModelParams::enabled(&p.top_p) {
        config.insert("top_p".into(), json!(v));
    }
    if let Some(v) = ModelParams::enabled(&p.top_k) {
        config.insert("top_k".into(), json!(v));
    }
    if let Some(v) = ModelParams::enabled(&p.frequency_penalty) {
        config.insert("frequency_penalty".into(), json!(v));
    }
    if let Some(v) = ModelParams::enabled(&p.presence_penalty) {
        config.insert("presence_penalty".into(), json!(v));
    }
    if let Some(stops) = p.stops() {
        config.insert("stop".into(), json!(stops));
    }

    json!({
        "contents": [{"role": "user", "parts": [{"text": prompt}]}],
        "generationConfig": config,
    })
}
