//! Line-oriented server-sent event parsing shared by the streaming adapters.

use crate::cancel::{CancelToken, Cancelled};
use anyhow::Context;
use futures::StreamExt;

pub(crate) enum SseLine {
    Data(serde_json::Value),
    Done,
    Ignore,
}

/// Classifies one SSE line. Empty lines, comments and malformed payloads
/// are ignored so adapter quirks cannot kill a stream.
pub(crate) fn parse_line(line: &str) -> SseLine {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Ignore;
    }
    let Some(payload) = line.strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let payload = payload.trim_start();
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str(payload) {
        Ok(value) => SseLine::Data(value),
        Err(_) => SseLine::Ignore,
    }
}

/// Reads an SSE response body to completion, feeding extracted deltas to
/// `on_token`. The read races the cancel token so a triggered token aborts
/// the socket instead of waiting for the next chunk.
pub(crate) async fn read_stream(
    resp: reqwest::Response,
    cancel: &CancelToken,
    on_token: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    extract: impl Fn(&serde_json::Value) -> Option<String>,
) -> anyhow::Result<String> {
    let mut body = resp.bytes_stream();
    let mut buf = String::new();
    let mut acc = String::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let bytes = chunk.context("read event stream chunk")?;
        buf.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = buf.find('\n') {
            let line: String = buf.drain(..=pos).collect();
            match parse_line(line.trim_end_matches(['\n', '\r'])) {
                SseLine::Done => return Ok(acc),
                SseLine::Data(value) => {
                    if let Some(delta) = extract(&value) {
                        if !delta.is_empty() {
                            acc.push_str(&delta);
                            on_token(&delta);
                        }
                    }
                }
                SseLine::Ignore => {}
            }
        }
    }
    Ok(acc)
}
