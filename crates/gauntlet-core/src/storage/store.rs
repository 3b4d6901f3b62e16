use crate::model::{
    AdapterKind, Model, ModelParams, Problem, ProblemKind, ProblemSet, Provider, ResultStatus,
    Run, RunResult, RunStatus,
};
use anyhow::Context;
use rusqlite::types::Value;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Embedded relational store. A single connection serializes writes; WAL
/// journaling keeps readers off the writer's lock.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// Partial update for a run result row. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ResultPatch {
    pub output: Option<String>,
    pub score: Option<i64>,
    pub status: Option<ResultStatus>,
    pub judged_by: Option<String>,
    pub judge_reasoning: Option<String>,
    pub cancelled_at: Option<String>,
}

/// Run result joined with the problem it answered.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunResultDetail {
    #[serde(flatten)]
    pub result: RunResult,
    pub problem_kind: ProblemKind,
    pub problem_prompt: String,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("failed to open sqlite db")?;
        Self::configure(conn)
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> anyhow::Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates missing tables and applies additive column migrations.
    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(super::schema::DDL)?;
        super::schema::migrate(&conn)?;
        Ok(())
    }

    // --- providers ---

    pub fn insert_provider(&self, p: &Provider) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO providers(id, name, kind, base_url, api_key, default_model, created_at, last_checked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                p.id,
                p.name,
                p.kind.as_str(),
                p.base_url,
                p.api_key,
                p.default_model,
                p.created_at,
                p.last_checked
            ],
        )
        .context("insert provider")?;
        Ok(())
    }

    pub fn get_provider(&self, id: &str) -> anyhow::Result<Option<Provider>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, base_url, api_key, default_model, created_at, last_checked
             FROM providers WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(provider_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_providers(&self) -> anyhow::Result<Vec<Provider>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, base_url, api_key, default_model, created_at, last_checked
             FROM providers ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], provider_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn set_provider_checked(&self, id: &str, checked_at: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE providers SET last_checked = ?1 WHERE id = ?2",
            params![checked_at, id],
        )?;
        Ok(())
    }

    pub fn cascade_delete_provider(&self, id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        with_foreign_keys_off(&mut conn, |tx| {
            let model_ids: Vec<String> = {
                let mut stmt = tx.prepare("SELECT id FROM models WHERE provider_id = ?1")?;
                let rows = stmt.query_map(params![id], |r| r.get(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            for model_id in &model_ids {
                delete_runs_referencing_model(tx, model_id)?;
            }
            tx.execute("DELETE FROM models WHERE provider_id = ?1", params![id])?;
            tx.execute("DELETE FROM providers WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    // --- models ---

    pub fn insert_model(&self, m: &Model) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO models(id, provider_id, label, model_id, params_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                m.id,
                m.provider_id,
                m.label,
                m.model_id,
                serde_json::to_string(&m.params)?
            ],
        )
        .context("insert model")?;
        Ok(())
    }

    pub fn get_model(&self, id: &str) -> anyhow::Result<Option<Model>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, provider_id, label, model_id, params_json FROM models WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(model_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_models(&self) -> anyhow::Result<Vec<Model>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, provider_id, label, model_id, params_json FROM models ORDER BY label ASC",
        )?;
        let rows = stmt.query_map([], model_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Resolves a model together with its provider row.
    pub fn model_with_provider(&self, model_id: &str) -> anyhow::Result<Option<(Model, Provider)>> {
        let model = match self.get_model(model_id)? {
            Some(m) => m,
            None => return Ok(None),
        };
        match self.get_provider(&model.provider_id)? {
            Some(p) => Ok(Some((model, p))),
            None => Ok(None),
        }
    }

    /// Deleting a referenced model is refused unless `cascade`, in which
    /// case referencing runs and their results go first.
    pub fn cascade_delete_model(&self, id: &str, cascade: bool) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        if !cascade {
            let referencing: i64 = conn.query_row(
                "SELECT COUNT(*) FROM runs
                 WHERE judge_model_id = ?1 OR model_ids LIKE '%\"' || ?1 || '\"%'",
                params![id],
                |r| r.get(0),
            )?;
            if referencing > 0 {
                anyhow::bail!(
                    "model {} is referenced by {} run(s); delete with cascade to remove them",
                    id,
                    referencing
                );
            }
        }
        with_foreign_keys_off(&mut conn, |tx| {
            delete_runs_referencing_model(tx, id)?;
            tx.execute("DELETE FROM models WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    // --- problem sets & problems ---

    pub fn insert_problem_set(&self, ps: &ProblemSet) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO problem_sets(id, name, description, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![ps.id, ps.name, ps.description, ps.created_at],
        )
        .context("insert problem set")?;
        Ok(())
    }

    pub fn get_problem_set(&self, id: &str) -> anyhow::Result<Option<ProblemSet>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, name, description, created_at FROM problem_sets WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(ProblemSet {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                created_at: row.get(3)?,
            })),
            None => Ok(None),
        }
    }

    pub fn list_problem_sets(&self) -> anyhow::Result<Vec<ProblemSet>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, created_at FROM problem_sets ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ProblemSet {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Deletes the set, its problems, any runs that reference it, and all
    /// results of those runs in one transaction.
    pub fn cascade_delete_problem_set(&self, id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        with_foreign_keys_off(&mut conn, |tx| {
            tx.execute(
                "DELETE FROM run_results WHERE run_id IN
                 (SELECT id FROM runs WHERE problem_set_id = ?1)",
                params![id],
            )?;
            tx.execute("DELETE FROM runs WHERE problem_set_id = ?1", params![id])?;
            tx.execute("DELETE FROM problems WHERE problem_set_id = ?1", params![id])?;
            tx.execute("DELETE FROM problem_sets WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    pub fn insert_problem(&self, p: &Problem) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO problems(id, problem_set_id, kind, prompt, expected_answer, html_assets, scoring_hints, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                p.id,
                p.problem_set_id,
                p.kind.as_str(),
                p.prompt,
                p.expected_answer,
                p.html_assets.as_ref().map(|v| v.to_string()),
                p.scoring_hints,
                p.created_at
            ],
        )
        .context("insert problem")?;
        Ok(())
    }

    pub fn get_problem(&self, id: &str) -> anyhow::Result<Option<Problem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, problem_set_id, kind, prompt, expected_answer, html_assets, scoring_hints, created_at
             FROM problems WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(problem_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Problems of a set in their observable chronological order.
    pub fn list_problems(&self, problem_set_id: &str) -> anyhow::Result<Vec<Problem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, problem_set_id, kind, prompt, expected_answer, html_assets, scoring_hints, created_at
             FROM problems WHERE problem_set_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![problem_set_id], problem_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // --- runs ---

    pub fn insert_run(&self, run: &Run) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs(id, name, problem_set_id, model_ids, judge_model_id, status, stream, created_at, cancelled_at, cancelled_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.id,
                run.name,
                run.problem_set_id,
                serde_json::to_string(&run.model_ids)?,
                run.judge_model_id,
                run.status.as_str(),
                run.stream as i64,
                run.created_at,
                run.cancelled_at,
                run.cancelled_by
            ],
        )
        .context("insert run")?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> anyhow::Result<Option<Run>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, problem_set_id, model_ids, judge_model_id, status, stream, created_at, cancelled_at, cancelled_by
             FROM runs WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(run_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_runs(
        &self,
        status: Option<RunStatus>,
        problem_set_id: Option<&str>,
        limit: u32,
    ) -> anyhow::Result<Vec<Run>> {
        let limit = limit.clamp(1, 200);
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT id, name, problem_set_id, model_ids, judge_model_id, status, stream, created_at, cancelled_at, cancelled_by
             FROM runs WHERE 1=1",
        );
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(set_id) = problem_set_id {
            sql.push_str(" AND problem_set_id = ?");
            values.push(Value::Text(set_id.to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");
        values.push(Value::Integer(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), run_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Guarded status transition: fails unless the current status is in
    /// `from`, so racing callers cannot revert a terminal state.
    pub fn transition_run_status(
        &self,
        run_id: &str,
        from: &[RunStatus],
        to: RunStatus,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let from_list = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let changed = conn.execute(
            &format!(
                "UPDATE runs SET status = ?1 WHERE id = ?2 AND status IN ({})",
                from_list
            ),
            params![to.as_str(), run_id],
        )?;
        if changed == 1 {
            return Ok(());
        }
        let current: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE id = ?1", params![run_id], |r| {
                r.get(0)
            })
            .ok();
        match current {
            Some(status) => anyhow::bail!(
                "run {} is {}, expected one of [{}]",
                run_id,
                status,
                from_list
            ),
            None => anyhow::bail!("run {} not found", run_id),
        }
    }

    pub fn mark_run_cancelled(
        &self,
        run_id: &str,
        cancelled_at: &str,
        cancelled_by: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE runs SET cancelled_at = ?1, cancelled_by = ?2 WHERE id = ?3",
            params![cancelled_at, cancelled_by, run_id],
        )?;
        Ok(())
    }

    // --- run results ---

    pub fn insert_result(&self, r: &RunResult) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO run_results(id, run_id, problem_id, model_id, output, score, status, judged_by, judge_reasoning, created_at, cancelled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                r.id,
                r.run_id,
                r.problem_id,
                r.model_id,
                r.output,
                r.score,
                r.status.as_str(),
                r.judged_by,
                r.judge_reasoning,
                r.created_at,
                r.cancelled_at
            ],
        )
        .context("insert run result")?;
        Ok(())
    }

    pub fn get_result(&self, id: &str) -> anyhow::Result<Option<RunResult>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, problem_id, model_id, output, score, status, judged_by, judge_reasoning, created_at, cancelled_at
             FROM run_results WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(result_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn mark_result(&self, result_id: &str, patch: &ResultPatch) -> anyhow::Result<()> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(output) = &patch.output {
            sets.push("output = ?");
            values.push(Value::Text(output.clone()));
        }
        if let Some(score) = patch.score {
            sets.push("score = ?");
            values.push(Value::Integer(score));
        }
        if let Some(status) = patch.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(judged_by) = &patch.judged_by {
            sets.push("judged_by = ?");
            values.push(Value::Text(judged_by.clone()));
        }
        if let Some(reasoning) = &patch.judge_reasoning {
            sets.push("judge_reasoning = ?");
            values.push(Value::Text(reasoning.clone()));
        }
        if let Some(cancelled_at) = &patch.cancelled_at {
            sets.push("cancelled_at = ?");
            values.push(Value::Text(cancelled_at.clone()));
        }
        if sets.is_empty() {
            return Ok(());
        }
        values.push(Value::Text(result_id.to_string()));

        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            &format!("UPDATE run_results SET {} WHERE id = ?", sets.join(", ")),
            rusqlite::params_from_iter(values),
        )?;
        if changed == 0 {
            anyhow::bail!("run result {} not found", result_id);
        }
        Ok(())
    }

    pub fn list_results(&self, run_id: &str) -> anyhow::Result<Vec<RunResult>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, problem_id, model_id, output, score, status, judged_by, judge_reasoning, created_at, cancelled_at
             FROM run_results WHERE run_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], result_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Results joined with problem kind and prompt, for result listings.
    pub fn results_with_problems(&self, run_id: &str) -> anyhow::Result<Vec<RunResultDetail>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.run_id, r.problem_id, r.model_id, r.output, r.score, r.status,
                    r.judged_by, r.judge_reasoning, r.created_at, r.cancelled_at,
                    p.kind, p.prompt
             FROM run_results r
             JOIN problems p ON r.problem_id = p.id
             WHERE r.run_id = ?1
             ORDER BY p.created_at ASC, p.id ASC, r.model_id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(RunResultDetail {
                result: result_from_row(row)?,
                problem_kind: ProblemKind::parse(&row.get::<_, String>(11)?),
                problem_prompt: row.get(12)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn count_results(&self, run_id: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM run_results WHERE run_id = ?1",
            params![run_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

/// Runs a cascade body inside one transaction with foreign-key checks off.
/// The pragma is restored on every exit path, including errors.
fn with_foreign_keys_off<F>(conn: &mut Connection, body: F) -> anyhow::Result<()>
where
    F: FnOnce(&rusqlite::Transaction) -> anyhow::Result<()>,
{
    conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
    let outcome: anyhow::Result<()> = (|| {
        let tx = conn.transaction()?;
        body(&tx)?;
        tx.commit()?;
        Ok(())
    })();
    let restore = conn.execute_batch("PRAGMA foreign_keys = ON;");
    outcome?;
    restore?;
    Ok(())
}

fn delete_runs_referencing_model(tx: &rusqlite::Transaction, model_id: &str) -> anyhow::Result<()> {
    let run_ids: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM runs
             WHERE judge_model_id = ?1 OR model_ids LIKE '%\"' || ?1 || '\"%'",
        )?;
        let rows = stmt.query_map(params![model_id], |r| r.get(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    for run_id in &run_ids {
        tx.execute("DELETE FROM run_results WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM runs WHERE id = ?1", params![run_id])?;
    }
    Ok(())
}

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<Provider> {
    Ok(Provider {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: AdapterKind::parse(&row.get::<_, String>(2)?),
        base_url: row.get(3)?,
        api_key: row.get(4)?,
        default_model: row.get(5)?,
        created_at: row.get(6)?,
        last_checked: row.get(7)?,
    })
}

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<Model> {
    let params_json: Option<String> = row.get(4)?;
    let params: ModelParams = params_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    Ok(Model {
        id: row.get(0)?,
        provider_id: row.get(1)?,
        label: row.get(2)?,
        model_id: row.get(3)?,
        params,
    })
}

fn problem_from_row(row: &Row<'_>) -> rusqlite::Result<Problem> {
    let html_assets: Option<String> = row.get(5)?;
    Ok(Problem {
        id: row.get(0)?,
        problem_set_id: row.get(1)?,
        kind: ProblemKind::parse(&row.get::<_, String>(2)?),
        prompt: row.get(3)?,
        expected_answer: row.get(4)?,
        html_assets: html_assets.and_then(|s| serde_json::from_str(&s).ok()),
        scoring_hints: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let model_ids: String = row.get(3)?;
    Ok(Run {
        id: row.get(0)?,
        name: row.get(1)?,
        problem_set_id: row.get(2)?,
        model_ids: serde_json::from_str(&model_ids).unwrap_or_default(),
        judge_model_id: row.get(4)?,
        status: RunStatus::parse(&row.get::<_, String>(5)?),
        stream: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        cancelled_at: row.get(8)?,
        cancelled_by: row.get(9)?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<RunResult> {
    Ok(RunResult {
        id: row.get(0)?,
        run_id: row.get(1)?,
        problem_id: row.get(2)?,
        model_id: row.get(3)?,
        output: row.get(4)?,
        score: row.get(5)?,
        status: ResultStatus::parse(&row.get::<_, String>(6)?),
        judged_by: row.get(7)?,
        judge_reasoning: row.get(8)?,
        created_at: row.get(9)?,
        cancelled_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{new_id, now_rfc3339};
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, Store) {
        let tmp = tempdir().unwrap();
        let store = Store::open(&tmp.path().join("test.db")).unwrap();
        store.init_schema().unwrap();
        (tmp, store)
    }

    fn seed_provider(store: &Store) -> Provider {
        let p = Provider {
            id: new_id(),
            name: "local".into(),
            kind: AdapterKind::OpenAiCompat,
            base_url: "http://localhost:1234/v1".into(),
            api_key: None,
            default_model: None,
            created_at: now_rfc3339(),
            last_checked: None,
        };
        store.insert_provider(&p).unwrap();
        p
    }

    fn seed_model(store: &Store, provider_id: &str, label: &str) -> Model {
        let m = Model {
            id: new_id(),
            provider_id: provider_id.into(),
            label: label.into(),
            model_id: format!("vendor/{label}"),
            params: ModelParams::default(),
        };
        store.insert_model(&m).unwrap();
        m
    }

    fn seed_set_with_problems(store: &Store, n: usize) -> (ProblemSet, Vec<Problem>) {
        let ps = ProblemSet {
            id: new_id(),
            name: "arith".into(),
            description: None,
            created_at: now_rfc3339(),
        };
        store.insert_problem_set(&ps).unwrap();
        let mut problems = Vec::new();
        for i in 0..n {
            let p = Problem {
                id: new_id(),
                problem_set_id: ps.id.clone(),
                kind: ProblemKind::Text,
                prompt: format!("problem {i}"),
                expected_answer: Some(format!("answer {i}")),
                html_assets: None,
                scoring_hints: None,
                created_at: format!("2026-01-01T00:00:{:02}.000Z", i),
            };
            store.insert_problem(&p).unwrap();
            problems.push(p);
        }
        (ps, problems)
    }

    fn seed_run(store: &Store, set_id: &str, model_ids: Vec<String>, judge: &str) -> Run {
        let run = Run {
            id: new_id(),
            name: None,
            problem_set_id: set_id.into(),
            model_ids,
            judge_model_id: judge.into(),
            status: RunStatus::Queued,
            stream: true,
            created_at: now_rfc3339(),
            cancelled_at: None,
            cancelled_by: None,
        };
        store.insert_run(&run).unwrap();
        run
    }

    #[test]
    fn init_schema_is_idempotent() {
        let (_tmp, store) = open_store();
        store.init_schema().unwrap();
        store.init_schema().unwrap();
    }

    #[test]
    fn problems_listed_in_created_at_order() {
        let (_tmp, store) = open_store();
        let (ps, problems) = seed_set_with_problems(&store, 5);
        let listed = store.list_problems(&ps.id).unwrap();
        let ids: Vec<_> = listed.iter().map(|p| p.id.as_str()).collect();
        let expected: Vec<_> = problems.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn transition_enforces_from_set() {
        let (_tmp, store) = open_store();
        let provider = seed_provider(&store);
        let judge = seed_model(&store, &provider.id, "judge");
        let (ps, _) = seed_set_with_problems(&store, 1);
        let run = seed_run(&store, &ps.id, vec![judge.id.clone()], &judge.id);

        store
            .transition_run_status(&run.id, &[RunStatus::Queued, RunStatus::Error], RunStatus::Running)
            .unwrap();
        // A second caller racing the same transition must fail.
        let err = store
            .transition_run_status(&run.id, &[RunStatus::Queued], RunStatus::Running)
            .unwrap_err();
        assert!(err.to_string().contains("running"));

        store
            .transition_run_status(&run.id, &[RunStatus::Running], RunStatus::Completed)
            .unwrap();
        assert_eq!(
            store.get_run(&run.id).unwrap().unwrap().status,
            RunStatus::Completed
        );
    }

    #[test]
    fn transition_unknown_run_reports_not_found() {
        let (_tmp, store) = open_store();
        let err = store
            .transition_run_status("missing", &[RunStatus::Queued], RunStatus::Running)
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn mark_result_patches_only_given_fields() {
        let (_tmp, store) = open_store();
        let provider = seed_provider(&store);
        let judge = seed_model(&store, &provider.id, "judge");
        let (ps, problems) = seed_set_with_problems(&store, 1);
        let run = seed_run(&store, &ps.id, vec![judge.id.clone()], &judge.id);

        let result = RunResult {
            id: new_id(),
            run_id: run.id.clone(),
            problem_id: problems[0].id.clone(),
            model_id: judge.id.clone(),
            output: None,
            score: None,
            status: ResultStatus::Pending,
            judged_by: None,
            judge_reasoning: None,
            created_at: now_rfc3339(),
            cancelled_at: None,
        };
        store.insert_result(&result).unwrap();

        store
            .mark_result(
                &result.id,
                &ResultPatch {
                    output: Some("4".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let row = store.get_result(&result.id).unwrap().unwrap();
        assert_eq!(row.output.as_deref(), Some("4"));
        assert_eq!(row.status, ResultStatus::Pending);

        store
            .mark_result(
                &result.id,
                &ResultPatch {
                    score: Some(100),
                    status: Some(ResultStatus::Completed),
                    judged_by: Some(judge.id.clone()),
                    judge_reasoning: Some("correct".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let row = store.get_result(&result.id).unwrap().unwrap();
        assert_eq!(row.score, Some(100));
        assert_eq!(row.status, ResultStatus::Completed);
        assert_eq!(row.output.as_deref(), Some("4"));
        assert_eq!(row.judged_by.as_deref(), Some(judge.id.as_str()));
    }

    #[test]
    fn cascade_delete_problem_set_leaves_no_orphans() {
        let (_tmp, store) = open_store();
        let provider = seed_provider(&store);
        let judge = seed_model(&store, &provider.id, "judge");
        let candidate = seed_model(&store, &provider.id, "candidate");
        let (ps, problems) = seed_set_with_problems(&store, 3);

        let run_a = seed_run(&store, &ps.id, vec![candidate.id.clone()], &judge.id);
        let run_b = seed_run(&store, &ps.id, vec![candidate.id.clone()], &judge.id);
        store
            .transition_run_status(&run_b.id, &[RunStatus::Queued], RunStatus::Running)
            .unwrap();
        store
            .transition_run_status(&run_b.id, &[RunStatus::Running], RunStatus::Completed)
            .unwrap();
        for problem in &problems {
            store
                .insert_result(&RunResult {
                    id: new_id(),
                    run_id: run_a.id.clone(),
                    problem_id: problem.id.clone(),
                    model_id: candidate.id.clone(),
                    output: None,
                    score: None,
                    status: ResultStatus::Pending,
                    judged_by: None,
                    judge_reasoning: None,
                    created_at: now_rfc3339(),
                    cancelled_at: None,
                })
                .unwrap();
        }

        store.cascade_delete_problem_set(&ps.id).unwrap();

        assert!(store.get_problem_set(&ps.id).unwrap().is_none());
        assert!(store.list_problems(&ps.id).unwrap().is_empty());
        assert!(store.get_run(&run_a.id).unwrap().is_none());
        assert!(store.get_run(&run_b.id).unwrap().is_none());
        assert_eq!(store.count_results(&run_a.id).unwrap(), 0);
        // Unrelated rows survive the cascade.
        assert!(store.get_model(&candidate.id).unwrap().is_some());
        assert!(store.get_provider(&provider.id).unwrap().is_some());
    }

    #[test]
    fn delete_model_refused_while_referenced() {
        let (_tmp, store) = open_store();
        let provider = seed_provider(&store);
        let judge = seed_model(&store, &provider.id, "judge");
        let candidate = seed_model(&store, &provider.id, "candidate");
        let (ps, _) = seed_set_with_problems(&store, 1);
        let run = seed_run(&store, &ps.id, vec![candidate.id.clone()], &judge.id);

        let err = store.cascade_delete_model(&candidate.id, false).unwrap_err();
        assert!(err.to_string().contains("referenced"));
        assert!(store.get_model(&candidate.id).unwrap().is_some());

        store.cascade_delete_model(&candidate.id, true).unwrap();
        assert!(store.get_model(&candidate.id).unwrap().is_none());
        assert!(store.get_run(&run.id).unwrap().is_none());
    }

    #[test]
    fn delete_judge_model_cascades_through_runs() {
        let (_tmp, store) = open_store();
        let provider = seed_provider(&store);
        let judge = seed_model(&store, &provider.id, "judge");
        let candidate = seed_model(&store, &provider.id, "candidate");
        let (ps, _) = seed_set_with_problems(&store, 1);
        let run = seed_run(&store, &ps.id, vec![candidate.id.clone()], &judge.id);

        store.cascade_delete_model(&judge.id, true).unwrap();
        assert!(store.get_run(&run.id).unwrap().is_none());
        assert!(store.get_model(&candidate.id).unwrap().is_some());
    }

    #[test]
    fn foreign_keys_restored_after_failed_cascade() {
        let (_tmp, store) = open_store();
        // Cascading a nonexistent set succeeds trivially; afterwards FK
        // enforcement must still reject dangling inserts.
        store.cascade_delete_problem_set("missing").unwrap();
        let orphan = Problem {
            id: new_id(),
            problem_set_id: "no-such-set".into(),
            kind: ProblemKind::Text,
            prompt: "p".into(),
            expected_answer: None,
            html_assets: None,
            scoring_hints: None,
            created_at: now_rfc3339(),
        };
        assert!(store.insert_problem(&orphan).is_err());
    }

    #[test]
    fn list_runs_filters_and_limits() {
        let (_tmp, store) = open_store();
        let provider = seed_provider(&store);
        let judge = seed_model(&store, &provider.id, "judge");
        let (ps_a, _) = seed_set_with_problems(&store, 1);
        let (ps_b, _) = seed_set_with_problems(&store, 1);
        for _ in 0..3 {
            seed_run(&store, &ps_a.id, vec![judge.id.clone()], &judge.id);
        }
        let run_b = seed_run(&store, &ps_b.id, vec![judge.id.clone()], &judge.id);
        store
            .transition_run_status(&run_b.id, &[RunStatus::Queued], RunStatus::Running)
            .unwrap();

        assert_eq!(store.list_runs(None, None, 50).unwrap().len(), 4);
        assert_eq!(store.list_runs(None, None, 2).unwrap().len(), 2);
        assert_eq!(
            store
                .list_runs(Some(RunStatus::Running), None, 50)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store.list_runs(None, Some(&ps_a.id), 50).unwrap().len(),
            3
        );
    }

    #[test]
    fn results_join_problem_kind_and_prompt() {
        let (_tmp, store) = open_store();
        let provider = seed_provider(&store);
        let judge = seed_model(&store, &provider.id, "judge");
        let (ps, problems) = seed_set_with_problems(&store, 1);
        let run = seed_run(&store, &ps.id, vec![judge.id.clone()], &judge.id);
        store
            .insert_result(&RunResult {
                id: new_id(),
                run_id: run.id.clone(),
                problem_id: problems[0].id.clone(),
                model_id: judge.id.clone(),
                output: Some("out".into()),
                score: None,
                status: ResultStatus::Pending,
                judged_by: None,
                judge_reasoning: None,
                created_at: now_rfc3339(),
                cancelled_at: None,
            })
            .unwrap();

        let details = store.results_with_problems(&run.id).unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].problem_kind, ProblemKind::Text);
        assert_eq!(details[0].problem_prompt, "problem 0");
    }

    #[test]
    fn migration_adds_columns_to_old_schema() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE providers (id TEXT PRIMARY KEY, name TEXT NOT NULL, kind TEXT NOT NULL,
                    base_url TEXT NOT NULL, api_key TEXT, default_model TEXT, created_at TEXT NOT NULL);
                 CREATE TABLE problems (id TEXT PRIMARY KEY, problem_set_id TEXT NOT NULL,
                    kind TEXT NOT NULL, prompt TEXT NOT NULL, expected_answer TEXT,
                    html_assets TEXT, scoring_hints TEXT);
                 INSERT INTO problems(id, problem_set_id, kind, prompt) VALUES ('p1', 's1', 'text', 'old');",
            )
            .unwrap();
        }
        let store = Store::open(&path).unwrap();
        store.init_schema().unwrap();

        // The pre-existing problem row gets a created_at stamp.
        let conn = store.conn.lock().unwrap();
        let created: String = conn
            .query_row("SELECT created_at FROM problems WHERE id = 'p1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert!(!created.is_empty());
        let cols = super::super::schema::get_columns(&conn, "runs").unwrap();
        for col in ["stream", "cancelled_at", "cancelled_by"] {
            assert!(cols.contains(col), "runs.{col} missing");
        }
    }
}
