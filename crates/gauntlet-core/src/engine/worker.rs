//! One worker per candidate model: iterates the run's problems in order.

use super::Engine;
use crate::cancel::{is_cancellation, CancelToken};
use crate::events::RunEvent;
use crate::model::{new_id, now_rfc3339, Model, Problem, ProblemKind, Provider, ResultStatus, Run, RunResult};
use crate::storage::ResultPatch;
use std::sync::Arc;
use tracing::debug;

const TEXT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const HTML_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that returns HTML/CSS/JS when asked. Keep responses concise.";

enum Flow {
    Continue,
    Stop,
}

pub(super) struct ModelWorker {
    pub engine: Engine,
    pub run: Run,
    pub model: Model,
    pub provider: Provider,
    pub judge: Arc<(Model, Provider)>,
    pub problems: Arc<Vec<Problem>>,
}

impl ModelWorker {
    pub async fn run(self) -> anyhow::Result<()> {
        let run_token = self
            .engine
            .registry
            .run_token(&self.run.id)
            .unwrap_or_default();
        let token = self
            .engine
            .registry
            .register_model(&self.run.id, &self.model.id);

        for problem in self.problems.iter() {
            if run_token.is_cancelled() || token.is_cancelled() {
                break;
            }
            match self.run_problem(problem, &token).await? {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }
        debug!(run_id = %self.run.id, model_id = %self.model.id, "worker done");
        Ok(())
    }

    async fn run_problem(&self, problem: &Problem, token: &CancelToken) -> anyhow::Result<Flow> {
        let initial_status = match problem.kind {
            ProblemKind::Html => ResultStatus::Manual,
            ProblemKind::Text => ResultStatus::Pending,
        };
        let result = RunResult {
            id: new_id(),
            run_id: self.run.id.clone(),
            problem_id: problem.id.clone(),
            model_id: self.model.id.clone(),
            output: None,
            score: None,
            status: initial_status,
            judged_by: None,
            judge_reasoning: None,
            created_at: now_rfc3339(),
            cancelled_at: None,
        };
        self.engine.store.insert_result(&result)?;

        self.publish(RunEvent::ModelStarted {
            run_id: self.run.id.clone(),
            problem_id: problem.id.clone(),
            model_id: self.model.id.clone(),
            model_name: self.model.label.clone(),
            attempt: 1,
            streaming: self.run.stream,
        });
        if self.run.stream {
            self.publish(RunEvent::ModelStreamingStarted {
                run_id: self.run.id.clone(),
                problem_id: problem.id.clone(),
                model_id: self.model.id.clone(),
                model_name: self.model.label.clone(),
            });
        }

        let system = match problem.kind {
            ProblemKind::Text => TEXT_SYSTEM_PROMPT,
            ProblemKind::Html => HTML_SYSTEM_PROMPT,
        };
        let messages = vec![
            crate::providers::ChatMessage::system(system),
            crate::providers::ChatMessage::user(problem.prompt.clone()),
        ];

        // The whole call races the worker's token so a cancel drops the
        // in-flight request instead of letting it run to completion.
        let call = async {
            if self.run.stream {
                let bus = self.engine.bus.clone();
                let (run_id, problem_id) = (self.run.id.clone(), problem.id.clone());
                let (model_id, model_name) = (self.model.id.clone(), self.model.label.clone());
                let kind = problem.kind;
                let on_token = move |delta: &str| {
                    bus.publish(RunEvent::CandidateToken {
                        run_id: run_id.clone(),
                        problem_id: problem_id.clone(),
                        model_id: model_id.clone(),
                        model_name: model_name.clone(),
                        delta: delta.to_string(),
                        kind,
                    });
                };
                self.engine
                    .retry
                    .run(token, || {
                        self.engine
                            .client
                            .stream(&self.provider, &self.model, &messages, token, &on_token)
                    })
                    .await
            } else {
                self.engine
                    .retry
                    .run(token, || {
                        self.engine.client.complete(&self.provider, &self.model, &messages)
                    })
                    .await
            }
        };
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(anyhow::Error::from(crate::cancel::Cancelled)),
            outcome = call => outcome,
        };

        let text = match outcome {
            Ok(text) => text,
            Err(err) if is_cancellation(&err) || token.is_cancelled() => {
                self.mark_cancelled(&result.id)?;
                self.publish_cancelled(problem);
                return Ok(Flow::Stop);
            }
            Err(err) => {
                self.engine.store.mark_result(
                    &result.id,
                    &ResultPatch {
                        status: Some(ResultStatus::Error),
                        ..Default::default()
                    },
                )?;
                self.publish(RunEvent::ModelError {
                    run_id: self.run.id.clone(),
                    problem_id: problem.id.clone(),
                    model_id: self.model.id.clone(),
                    model_name: self.model.label.clone(),
                    error: format!("{err:#}"),
                    streaming: self.run.stream,
                });
                return Ok(Flow::Continue);
            }
        };

        if !self.run.stream {
            // Non-streaming calls still surface the answer as one token.
            self.publish(RunEvent::CandidateToken {
                run_id: self.run.id.clone(),
                problem_id: problem.id.clone(),
                model_id: self.model.id.clone(),
                model_name: self.model.label.clone(),
                delta: text.clone(),
                kind: problem.kind,
            });
        }
        self.engine.store.mark_result(
            &result.id,
            &ResultPatch {
                output: Some(text.clone()),
                ..Default::default()
            },
        )?;

        match problem.kind {
            ProblemKind::Html => {
                // Html answers wait for human review; the row stays manual.
                self.publish(RunEvent::HtmlCandidateDone {
                    run_id: self.run.id.clone(),
                    problem_id: problem.id.clone(),
                    model_id: self.model.id.clone(),
                    model_name: self.model.label.clone(),
                    html: text,
                });
                Ok(Flow::Continue)
            }
            ProblemKind::Text => {
                self.publish(RunEvent::CandidateDone {
                    run_id: self.run.id.clone(),
                    problem_id: problem.id.clone(),
                    model_id: self.model.id.clone(),
                    model_name: self.model.label.clone(),
                    text: text.clone(),
                });
                self.judge_result(problem, &result.id, &text, token).await
            }
        }
    }

    async fn judge_result(
        &self,
        problem: &Problem,
        result_id: &str,
        candidate_output: &str,
        token: &CancelToken,
    ) -> anyhow::Result<Flow> {
        let (judge_model, judge_provider) = self.judge.as_ref();
        let call = self
            .engine
            .judge
            .evaluate(judge_provider, judge_model, problem, candidate_output, token);
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(anyhow::Error::from(crate::cancel::Cancelled)),
            outcome = call => outcome,
        };
        let verdict = match outcome {
            Ok(verdict) => verdict,
            Err(err) if is_cancellation(&err) || token.is_cancelled() => {
                self.mark_cancelled(result_id)?;
                self.publish_cancelled(problem);
                return Ok(Flow::Stop);
            }
            Err(err) => {
                self.engine.store.mark_result(
                    result_id,
                    &ResultPatch {
                        status: Some(ResultStatus::Error),
                        ..Default::default()
                    },
                )?;
                self.publish(RunEvent::ModelError {
                    run_id: self.run.id.clone(),
                    problem_id: problem.id.clone(),
                    model_id: self.model.id.clone(),
                    model_name: self.model.label.clone(),
                    error: format!("judge call failed: {err:#}"),
                    streaming: false,
                });
                return Ok(Flow::Continue);
            }
        };

        self.engine.store.mark_result(
            result_id,
            &ResultPatch {
                score: Some(verdict.score),
                status: Some(ResultStatus::Completed),
                judged_by: Some(judge_model.id.clone()),
                judge_reasoning: Some(verdict.reasoning.clone()),
                ..Default::default()
            },
        )?;
        self.publish(RunEvent::JudgeDone {
            run_id: self.run.id.clone(),
            problem_id: problem.id.clone(),
            model_id: self.model.id.clone(),
            verdict: verdict.verdict_str().to_string(),
            reasoning: verdict.reasoning,
            score: verdict.score,
        });
        Ok(Flow::Continue)
    }

    fn mark_cancelled(&self, result_id: &str) -> anyhow::Result<()> {
        self.engine.store.mark_result(
            result_id,
            &ResultPatch {
                status: Some(ResultStatus::Cancelled),
                cancelled_at: Some(now_rfc3339()),
                ..Default::default()
            },
        )
    }

    fn publish_cancelled(&self, problem: &Problem) {
        self.publish(RunEvent::ModelCancelled {
            run_id: self.run.id.clone(),
            problem_id: problem.id.clone(),
            model_id: self.model.id.clone(),
            model_name: self.model.label.clone(),
        });
    }

    fn publish(&self, event: RunEvent) {
        self.engine.bus.publish(event);
    }
}
