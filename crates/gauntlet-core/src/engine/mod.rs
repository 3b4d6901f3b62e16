//! Run execution engine: orchestrates problems x candidate models with
//! per-model FIFO ordering, cross-model parallelism, and two-level
//! cancellation.

mod worker;

use crate::bus::EventBus;
use crate::cancel::{CancelRegistry, CancelToken};
use crate::events::RunEvent;
use crate::judge::JudgeService;
use crate::model::{new_id, now_rfc3339, Model, Problem, Provider, Run, RunStatus};
use crate::providers::ChatClient;
use crate::retry::RetryPolicy;
use crate::storage::Store;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use worker::ModelWorker;

/// Errors the HTTP layer can map to status codes without string matching.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRun {
    pub name: Option<String>,
    pub problem_set_id: String,
    pub model_ids: Vec<String>,
    pub judge_model_id: String,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    Pass,
    Fail,
}

#[derive(Clone)]
pub struct Engine {
    store: Store,
    bus: Arc<EventBus>,
    registry: Arc<CancelRegistry>,
    client: Arc<dyn ChatClient>,
    judge: JudgeService,
    retry: RetryPolicy,
}

impl Engine {
    pub fn new(store: Store, client: Arc<dyn ChatClient>) -> Self {
        let retry = RetryPolicy::default();
        Self {
            store,
            bus: Arc::new(EventBus::new()),
            registry: Arc::new(CancelRegistry::new()),
            judge: JudgeService::new(client.clone(), retry.clone()),
            client,
            retry,
        }
    }

    /// Overrides the backoff policy, mainly to keep tests fast.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.judge = JudgeService::new(self.client.clone(), retry.clone());
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<CancelRegistry> {
        &self.registry
    }

    /// Validates and persists a new run in `queued` status.
    pub fn create_run(&self, req: CreateRun) -> Result<Run, EngineError> {
        if self.store.get_problem_set(&req.problem_set_id)?.is_none() {
            return Err(EngineError::Invalid(format!(
                "problem set {} not found",
                req.problem_set_id
            )));
        }
        if req.model_ids.is_empty() {
            return Err(EngineError::Invalid("model_ids must not be empty".into()));
        }
        if self.store.get_model(&req.judge_model_id)?.is_none() {
            return Err(EngineError::Invalid(format!(
                "judge model {} not found",
                req.judge_model_id
            )));
        }
        let run = Run {
            id: new_id(),
            name: req.name,
            problem_set_id: req.problem_set_id,
            model_ids: req.model_ids,
            judge_model_id: req.judge_model_id,
            status: RunStatus::Queued,
            stream: req.stream,
            created_at: now_rfc3339(),
            cancelled_at: None,
            cancelled_by: None,
        };
        self.store.insert_run(&run)?;
        Ok(run)
    }

    /// Starts executing a run. Transitions it to `running`, spawns the
    /// model workers, and returns immediately; completion is published on
    /// the event bus and persisted asynchronously.
    pub fn execute(&self, run_id: &str) -> Result<Run, EngineError> {
        let mut run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::NotFound(format!("run {} not found", run_id)))?;

        match run.status {
            RunStatus::Running => {
                return Err(EngineError::Conflict(format!(
                    "run {} is already running",
                    run_id
                )))
            }
            RunStatus::Queued | RunStatus::Error => {}
            other => {
                return Err(EngineError::Invalid(format!(
                    "run {} cannot be executed from status {}",
                    run_id,
                    other.as_str()
                )))
            }
        }

        let judge = self
            .store
            .model_with_provider(&run.judge_model_id)?
            .ok_or_else(|| {
                EngineError::Invalid(format!(
                    "judge model {} does not resolve to a model",
                    run.judge_model_id
                ))
            })?;

        // Candidate models may have been deleted since the run was created;
        // skip them rather than failing the whole run.
        let mut candidates: Vec<(Model, Provider)> = Vec::new();
        for model_id in &run.model_ids {
            match self.store.model_with_provider(model_id)? {
                Some(pair) => candidates.push(pair),
                None => warn!(run_id = %run.id, model_id = %model_id, "skipping unresolved candidate model"),
            }
        }
        let problems = self.store.list_problems(&run.problem_set_id)?;

        self.store
            .transition_run_status(&run.id, &[RunStatus::Queued, RunStatus::Error], RunStatus::Running)
            .map_err(|e| EngineError::Conflict(e.to_string()))?;
        run.status = RunStatus::Running;
        self.bus.publish(RunEvent::RunStatus {
            run_id: run.id.clone(),
            status: RunStatus::Running,
        });
        info!(
            run_id = %run.id,
            models = candidates.len(),
            problems = problems.len(),
            stream = run.stream,
            "run started"
        );

        let token = self.registry.register_run(&run.id);
        let engine = self.clone();
        let spawned_run = run.clone();
        tokio::spawn(async move {
            engine
                .run_loop(spawned_run, candidates, judge, problems, token)
                .await;
        });
        Ok(run)
    }

    async fn run_loop(
        self,
        run: Run,
        candidates: Vec<(Model, Provider)>,
        judge: (Model, Provider),
        problems: Vec<Problem>,
        token: CancelToken,
    ) {
        let outcome = self.drive_workers(&run, candidates, judge, problems).await;

        let final_status = if token.is_cancelled() {
            RunStatus::Cancelled
        } else {
            match &outcome {
                Ok(()) => RunStatus::Completed,
                Err(err) => {
                    error!(run_id = %run.id, error = %err, "run failed");
                    RunStatus::Error
                }
            }
        };
        if let Err(err) =
            self.store
                .transition_run_status(&run.id, &[RunStatus::Running], final_status)
        {
            error!(run_id = %run.id, error = %err, "failed to persist terminal run status");
        }
        self.bus.publish(RunEvent::RunStatus {
            run_id: run.id.clone(),
            status: final_status,
        });
        self.registry.remove_run(&run.id);
        info!(run_id = %run.id, status = final_status.as_str(), "run finished");
    }

    async fn drive_workers(
        &self,
        run: &Run,
        candidates: Vec<(Model, Provider)>,
        judge: (Model, Provider),
        problems: Vec<Problem>,
    ) -> anyhow::Result<()> {
        let judge = Arc::new(judge);
        let problems = Arc::new(problems);
        let mut handles = Vec::new();
        for (model, provider) in candidates {
            let worker = ModelWorker {
                engine: self.clone(),
                run: run.clone(),
                model,
                provider,
                judge: judge.clone(),
                problems: problems.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        // One worker failing (or panicking) never takes the run down.
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(run_id = %run.id, error = %err, "model worker aborted"),
                Err(err) => warn!(run_id = %run.id, error = %err, "model worker panicked"),
            }
        }
        Ok(())
    }

    /// Cancels a whole run: stamps the row, triggers every token under the
    /// run, and publishes `run_cancelled`. The scheduler publishes the
    /// terminal `run_status` once its workers have unwound.
    pub fn cancel_run(&self, run_id: &str, cancelled_by: &str) -> Result<bool, EngineError> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::NotFound(format!("run {} not found", run_id)))?;
        if !matches!(run.status, RunStatus::Running | RunStatus::Queued) {
            return Err(EngineError::Invalid(format!(
                "run {} is {}, only running or queued runs can be cancelled",
                run_id,
                run.status.as_str()
            )));
        }

        self.store
            .mark_run_cancelled(run_id, &now_rfc3339(), cancelled_by)?;
        let cancelled = self.registry.cancel_run(run_id);
        self.bus.publish(RunEvent::RunCancelled {
            run_id: run_id.to_string(),
            cancelled_by: cancelled_by.to_string(),
        });

        // A queued run has no scheduler loop to finalize it.
        if run.status == RunStatus::Queued {
            self.store
                .transition_run_status(run_id, &[RunStatus::Queued], RunStatus::Cancelled)?;
            self.bus.publish(RunEvent::RunStatus {
                run_id: run_id.to_string(),
                status: RunStatus::Cancelled,
            });
        }
        info!(run_id = %run_id, cancelled_by = %cancelled_by, "run cancelled");
        Ok(cancelled)
    }

    /// Cancels a single model worker within a running run.
    pub fn cancel_model(&self, run_id: &str, model_id: &str) -> Result<bool, EngineError> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::NotFound(format!("run {} not found", run_id)))?;
        if run.status != RunStatus::Running {
            return Err(EngineError::Invalid(format!(
                "run {} is not running",
                run_id
            )));
        }
        if !run.model_ids.iter().any(|m| m == model_id) {
            return Err(EngineError::Invalid(format!(
                "model {} is not part of run {}",
                model_id, run_id
            )));
        }
        Ok(self.registry.cancel_model(run_id, model_id))
    }

    /// Manual review of an html result awaiting a human decision.
    pub fn review_result(
        &self,
        result_id: &str,
        decision: ReviewDecision,
        notes: Option<String>,
    ) -> Result<crate::model::RunResult, EngineError> {
        let result = self
            .store
            .get_result(result_id)?
            .ok_or_else(|| EngineError::NotFound(format!("result {} not found", result_id)))?;
        if result.status != crate::model::ResultStatus::Manual {
            return Err(EngineError::Invalid(format!(
                "result {} is {}, only manual results can be reviewed",
                result_id,
                result.status.as_str()
            )));
        }
        let problem = self
            .store
            .get_problem(&result.problem_id)?
            .ok_or_else(|| EngineError::NotFound(format!("problem {} not found", result.problem_id)))?;
        if problem.kind != crate::model::ProblemKind::Html {
            return Err(EngineError::Invalid(
                "manual review applies to html problems only".into(),
            ));
        }

        let score = match decision {
            ReviewDecision::Pass => 100,
            ReviewDecision::Fail => 0,
        };
        self.store.mark_result(
            result_id,
            &crate::storage::ResultPatch {
                score: Some(score),
                status: Some(crate::model::ResultStatus::Completed),
                judged_by: Some("human".into()),
                judge_reasoning: notes,
                ..Default::default()
            },
        )?;
        let updated = self
            .store
            .get_result(result_id)?
            .ok_or_else(|| EngineError::NotFound(format!("result {} not found", result_id)))?;
        Ok(updated)
    }
}
