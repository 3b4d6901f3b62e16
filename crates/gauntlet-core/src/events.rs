//! Typed progress events published per run.

use crate::model::{ProblemKind, RunStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStatus {
        run_id: String,
        status: RunStatus,
    },
    ModelStarted {
        run_id: String,
        problem_id: String,
        model_id: String,
        model_name: String,
        attempt: u32,
        streaming: bool,
    },
    ModelStreamingStarted {
        run_id: String,
        problem_id: String,
        model_id: String,
        model_name: String,
    },
    CandidateToken {
        run_id: String,
        problem_id: String,
        model_id: String,
        model_name: String,
        delta: String,
        kind: ProblemKind,
    },
    CandidateDone {
        run_id: String,
        problem_id: String,
        model_id: String,
        model_name: String,
        text: String,
    },
    HtmlCandidateDone {
        run_id: String,
        problem_id: String,
        model_id: String,
        model_name: String,
        html: String,
    },
    JudgeDone {
        run_id: String,
        problem_id: String,
        model_id: String,
        verdict: String,
        reasoning: String,
        score: i64,
    },
    ModelError {
        run_id: String,
        problem_id: String,
        model_id: String,
        model_name: String,
        error: String,
        streaming: bool,
    },
    ModelCancelled {
        run_id: String,
        problem_id: String,
        model_id: String,
        model_name: String,
    },
    RunCancelled {
        run_id: String,
        cancelled_by: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::RunStatus { run_id, .. }
            | RunEvent::ModelStarted { run_id, .. }
            | RunEvent::ModelStreamingStarted { run_id, .. }
            | RunEvent::CandidateToken { run_id, .. }
            | RunEvent::CandidateDone { run_id, .. }
            | RunEvent::HtmlCandidateDone { run_id, .. }
            | RunEvent::JudgeDone { run_id, .. }
            | RunEvent::ModelError { run_id, .. }
            | RunEvent::ModelCancelled { run_id, .. }
            | RunEvent::RunCancelled { run_id, .. } => run_id,
        }
    }
}
