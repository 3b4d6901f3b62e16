use serde::{Deserialize, Serialize};

/// Score at or above which a result counts as a pass (0-100 scale).
pub const PASS_THRESHOLD: i64 = 50;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    #[serde(rename = "openai-compat")]
    OpenAiCompat,
    Anthropic,
    Gemini,
    Custom,
}

impl AdapterKind {
    /// Normalizes a kind string: lowercase, non-alphanumerics stripped,
    /// vendor aliases collapsed. Unrecognized kinds map to `Custom`.
    pub fn parse(raw: &str) -> Self {
        let norm: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "openaicompat" | "openai" | "openaicompatible" | "oai" | "compatible" => {
                AdapterKind::OpenAiCompat
            }
            "anthropic" | "claude" => AdapterKind::Anthropic,
            "gemini" | "google" | "googleai" | "googlegenai" => AdapterKind::Gemini,
            _ => AdapterKind::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::OpenAiCompat => "openai-compat",
            AdapterKind::Anthropic => "anthropic",
            AdapterKind::Gemini => "gemini",
            AdapterKind::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub kind: AdapterKind,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<String>,
}

/// One generation parameter: sent to the provider only when `enabled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param<T> {
    pub enabled: bool,
    pub value: T,
}

impl<T> Param<T> {
    pub fn on(value: T) -> Self {
        Self {
            enabled: true,
            value,
        }
    }
}

/// Typed parameter bag for a model. Unknown keys in stored JSON are dropped
/// on deserialization; disabled entries are omitted from provider requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Param<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<Param<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<Param<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<Param<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<Param<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<Param<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Param<Vec<String>>>,
}

impl ModelParams {
    pub fn enabled<'a, T>(slot: &'a Option<Param<T>>) -> Option<&'a T> {
        match slot {
            Some(p) if p.enabled => Some(&p.value),
            _ => None,
        }
    }

    /// Enabled, non-empty stop sequences.
    pub fn stops(&self) -> Option<&Vec<String>> {
        Self::enabled(&self.stop_sequences).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub provider_id: String,
    /// Display label shown in events and listings.
    pub label: String,
    /// Vendor model id string sent on the wire.
    pub model_id: String,
    #[serde(default)]
    pub params: ModelParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemSet {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    Text,
    Html,
}

impl ProblemKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "html" => ProblemKind::Html,
            _ => ProblemKind::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemKind::Text => "text",
            ProblemKind::Html => "html",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    pub problem_set_id: String,
    pub kind: ProblemKind,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_assets: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scoring_hints: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Error,
}

impl RunStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => RunStatus::Queued,
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub problem_set_id: String,
    /// Ordered candidate model ids.
    pub model_ids: Vec<String>,
    pub judge_model_id: String,
    pub status: RunStatus,
    pub stream: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Manual,
    Completed,
    Cancelled,
    Error,
}

impl ResultStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => ResultStatus::Pending,
            "manual" => ResultStatus::Manual,
            "completed" => ResultStatus::Completed,
            "cancelled" => ResultStatus::Cancelled,
            _ => ResultStatus::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pending => "pending",
            ResultStatus::Manual => "manual",
            ResultStatus::Completed => "completed",
            ResultStatus::Cancelled => "cancelled",
            ResultStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub id: String,
    pub run_id: String,
    pub problem_id: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge_reasoning: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<String>,
}

impl RunResult {
    /// Downstream pass/fail reads the score only; a stored verdict that
    /// disagrees with the score is left as-is.
    pub fn passed(&self) -> bool {
        self.score.map(|s| s >= PASS_THRESHOLD).unwrap_or(false)
    }
}
