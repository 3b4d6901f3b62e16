//! Provider adapters: one uniform request/stream surface over three wire
//! protocols (openai-compatible, anthropic, gemini).

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod probe;
pub(crate) mod sse;

use crate::cancel::CancelToken;
use crate::model::{AdapterKind, Model, Provider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Uniform completion surface the engine and judge talk to.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// One-shot completion; returns the full response text.
    async fn complete(
        &self,
        provider: &Provider,
        model: &Model,
        messages: &[ChatMessage],
    ) -> anyhow::Result<String>;

    /// Streaming completion; `on_token` receives each incremental delta and
    /// the accumulated text is returned. Aborts promptly when `cancel`
    /// triggers, including mid-read on the HTTP stream.
    async fn stream(
        &self,
        provider: &Provider,
        model: &Model,
        messages: &[ChatMessage],
        cancel: &CancelToken,
        on_token: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> anyhow::Result<String>;
}

/// Real HTTP-backed client. No default timeout: callers bound long calls
/// themselves, and cancellation aborts in-flight reads.
pub struct ProviderClient {
    http: reqwest::Client,
}

impl ProviderClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

#[async_trait]
impl ChatClient for ProviderClient {
    async fn complete(
        &self,
        provider: &Provider,
        model: &Model,
        messages: &[ChatMessage],
    ) -> anyhow::Result<String> {
        match provider.kind {
            AdapterKind::OpenAiCompat | AdapterKind::Custom => {
                openai::complete(&self.http, provider, model, messages).await
            }
            AdapterKind::Anthropic => anthropic::complete(&self.http, provider, model, messages).await,
            AdapterKind::Gemini => gemini::complete(&self.http, provider, model, messages).await,
        }
    }

    async fn stream(
        &self,
        provider: &Provider,
        model: &Model,
        messages: &[ChatMessage],
        cancel: &CancelToken,
        on_token: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> anyhow::Result<String> {
        match provider.kind {
            AdapterKind::OpenAiCompat | AdapterKind::Custom => {
                openai::stream(&self.http, provider, model, messages, cancel, on_token).await
            }
            AdapterKind::Anthropic => {
                anthropic::stream(&self.http, provider, model, messages, cancel, on_token).await
            }
            AdapterKind::Gemini => {
                // No streaming path for gemini; one-shot and a single token.
                let text = gemini::complete(&self.http, provider, model, messages).await?;
                on_token(&text);
                Ok(text)
            }
        }
    }
}

pub(crate) fn base_url(provider: &Provider) -> &str {
    provider.base_url.trim_end_matches('/')
}

/// Passes 2xx responses through; otherwise surfaces the status code and a
/// body snippet in the error text (retry classification keys off the code).
pub(crate) async fn ensure_success(
    resp: reqwest::Response,
    kind: &str,
) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!(
        "{} API error (status {}): {}",
        kind,
        status.as_u16(),
        snippet(&body, 300)
    )
}

pub(crate) fn snippet(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{new_id, now_rfc3339, ModelParams};

    pub(crate) fn test_provider(kind: AdapterKind, base_url: &str, key: Option<&str>) -> Provider {
        Provider {
            id: new_id(),
            name: "test".into(),
            kind,
            base_url: base_url.into(),
            api_key: key.map(String::from),
            default_model: None,
            created_at: now_rfc3339(),
            last_checked: None,
        }
    }

    pub(crate) fn test_model(params: ModelParams) -> Model {
        Model {
            id: new_id(),
            provider_id: "p".into(),
            label: "test-model".into(),
            model_id: "vendor/test".into(),
            params,
        }
    }

    #[test]
    fn base_url_trims_trailing_slashes() {
        let p = test_provider(AdapterKind::OpenAiCompat, "http://host/v1///", None);
        assert_eq!(base_url(&p), "http://host/v1");
    }

    #[test]
    fn chat_message_roles() {
        assert_eq!(ChatMessage::system("a").role, "system");
        assert_eq!(ChatMessage::user("b").role, "user");
        let json = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hi"}));
    }
}
