//! LLM-as-judge: prompt construction and verdict parsing.

use crate::cancel::CancelToken;
use crate::model::{Model, Problem, Provider};
use crate::providers::{ChatClient, ChatMessage};
use crate::retry::RetryPolicy;
use std::sync::Arc;

pub const SYSTEM_PROMPT: &str = "You are a strict evaluation judge. Respond with ONLY a JSON \
object with fields \"verdict\" (\"PASS\" or \"FAIL\"), \"reasoning\" (string), and \"score\" \
(integer 0-100). No prose outside the JSON.";

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub pass: bool,
    pub score: i64,
    pub reasoning: String,
}

impl JudgeVerdict {
    pub fn verdict_str(&self) -> &'static str {
        if self.pass {
            "PASS"
        } else {
            "FAIL"
        }
    }
}

pub fn build_messages(problem: &Problem, candidate_output: &str) -> Vec<ChatMessage> {
    let expected = problem
        .expected_answer
        .as_deref()
        .unwrap_or("(no expected answer was provided)");
    let user = format!(
        "Problem:\n{}\n\nExpected answer:\n{}\n\nCandidate answer:\n{}\n\nProvide your verdict now.",
        problem.prompt, expected, candidate_output
    );
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// Pure function of the judge response text. JSON first; a response that
/// yields no usable verdict object falls back to a textual rule.
pub fn parse_verdict(response: &str) -> JudgeVerdict {
    if let Some(verdict) = parse_json_verdict(response) {
        return verdict;
    }

    let upper = response.to_uppercase();
    let mut pass = contains_word(&upper, "PASS") || upper.trim_start().starts_with("YES");
    if contains_word(&upper, "FAIL") {
        pass = false;
    }
    let label = if pass { "PASS" } else { "FAIL" };
    let snippet: String = response.chars().take(200).collect();
    JudgeVerdict {
        pass,
        score: if pass { 100 } else { 0 },
        reasoning: format!("Simple verdict: {}. Full response: {}", label, snippet),
    }
}

fn parse_json_verdict(response: &str) -> Option<JudgeVerdict> {
    // Tolerate preamble before and garbage after the object.
    let start = response.find('{')?;
    let value: serde_json::Value = serde_json::Deserializer::from_str(&response[start..])
        .into_iter::<serde_json::Value>()
        .next()?
        .ok()?;

    let verdict = value.get("verdict")?.as_str()?;
    let pass = verdict.eq_ignore_ascii_case("PASS");
    let score = value
        .get("score")
        .and_then(|s| s.as_i64())
        .unwrap_or(if pass { 100 } else { 0 })
        .clamp(0, 100);
    let reasoning = value
        .get("reasoning")
        .and_then(|r| r.as_str())
        .unwrap_or("")
        .to_string();
    Some(JudgeVerdict {
        pass,
        score,
        reasoning,
    })
}

fn contains_word(haystack: &str, word: &str) -> bool {
    let bytes = haystack.as_bytes();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let at = start + pos;
        let end = at + word.len();
        let before_ok = at == 0 || !bytes[at - 1].is_ascii_alphanumeric();
        let after_ok = end >= bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return true;
        }
        start = at + 1;
    }
    false
}

/// Calls the designated judge model and parses its verdict.
#[derive(Clone)]
pub struct JudgeService {
    client: Arc<dyn ChatClient>,
    retry: RetryPolicy,
}

impl JudgeService {
    pub fn new(client: Arc<dyn ChatClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub async fn evaluate(
        &self,
        provider: &Provider,
        judge_model: &Model,
        problem: &Problem,
        candidate_output: &str,
        cancel: &CancelToken,
    ) -> anyhow::Result<JudgeVerdict> {
        let messages = build_messages(problem, candidate_output);
        let response = self
            .retry
            .run(cancel, || {
                self.client.complete(provider, judge_model, &messages)
            })
            .await?;
        Ok(parse_verdict(&response))
    }
}
