//! Provider connectivity probe: a short sequence of GETs against likely
//! listing endpoints, stopping at the first success.

use super::snippet;
use crate::model::{AdapterKind, Provider};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const REPORTED_HEADERS: [&str; 3] = ["content-type", "server", "x-request-id"];

#[derive(Debug, Clone, Serialize)]
pub struct ProbeAttempt {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub ok: bool,
    pub attempts: Vec<ProbeAttempt>,
}

pub async fn probe_provider(http: &reqwest::Client, provider: &Provider) -> ProbeReport {
    let base = provider.base_url.trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    let candidates = [
        format!("{base}/v1/models"),
        format!("{base}/models"),
        base.to_string(),
    ];

    let mut attempts = Vec::new();
    for url in candidates {
        debug!(url = %url, kind = provider.kind.as_str(), "probing provider endpoint");
        let mut req = http.get(&url).timeout(ATTEMPT_TIMEOUT);
        if let Some(key) = &provider.api_key {
            req = match provider.kind {
                AdapterKind::Anthropic => req.header("x-api-key", key),
                AdapterKind::Gemini => req.query(&[("key", key)]),
                _ => req.header("Authorization", format!("Bearer {}", key)),
            };
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                let headers = selected_headers(resp.headers());
                if status.is_success() {
                    attempts.push(ProbeAttempt {
                        url,
                        status: Some(status.as_u16()),
                        error: None,
                        headers,
                    });
                    return ProbeReport {
                        ok: true,
                        attempts,
                    };
                }
                let body = resp.text().await.unwrap_or_default();
                attempts.push(ProbeAttempt {
                    url,
                    status: Some(status.as_u16()),
                    error: Some(snippet(&body, 200)),
                    headers,
                });
            }
            Err(err) => attempts.push(ProbeAttempt {
                url,
                status: None,
                error: Some(err.to_string()),
                headers: BTreeMap::new(),
            }),
        }
    }
    ProbeReport {
        ok: false,
        attempts,
    }
}

fn selected_headers(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    REPORTED_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}
