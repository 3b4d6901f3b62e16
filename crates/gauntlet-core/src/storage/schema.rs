//! Schema and additive migrations.

use anyhow::Context;
use rusqlite::Connection;
use std::collections::HashSet;

pub(crate) const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS providers (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    kind         TEXT NOT NULL,
    base_url     TEXT NOT NULL,
    api_key      TEXT,
    default_model TEXT,
    created_at   TEXT NOT NULL,
    last_checked TEXT
);

CREATE TABLE IF NOT EXISTS models (
    id          TEXT PRIMARY KEY,
    provider_id TEXT NOT NULL REFERENCES providers(id),
    label       TEXT NOT NULL,
    model_id    TEXT NOT NULL,
    params_json TEXT
);

CREATE TABLE IF NOT EXISTS problem_sets (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    description TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS problems (
    id             TEXT PRIMARY KEY,
    problem_set_id TEXT NOT NULL REFERENCES problem_sets(id),
    kind           TEXT NOT NULL,
    prompt         TEXT NOT NULL,
    expected_answer TEXT,
    html_assets    TEXT,
    scoring_hints  TEXT,
    created_at     TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS runs (
    id             TEXT PRIMARY KEY,
    name           TEXT,
    problem_set_id TEXT NOT NULL REFERENCES problem_sets(id),
    model_ids      TEXT NOT NULL,
    judge_model_id TEXT NOT NULL REFERENCES models(id),
    status         TEXT NOT NULL,
    stream         INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL,
    cancelled_at   TEXT,
    cancelled_by   TEXT
);

CREATE TABLE IF NOT EXISTS run_results (
    id              TEXT PRIMARY KEY,
    run_id          TEXT NOT NULL REFERENCES runs(id),
    problem_id      TEXT NOT NULL REFERENCES problems(id),
    model_id        TEXT NOT NULL,
    output          TEXT,
    score           INTEGER,
    status          TEXT NOT NULL,
    judged_by       TEXT,
    judge_reasoning TEXT,
    created_at      TEXT NOT NULL,
    cancelled_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_problems_set ON problems(problem_set_id, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_set ON runs(problem_set_id);
CREATE INDEX IF NOT EXISTS idx_results_run ON run_results(run_id);
"#;

/// Older databases predate several optional columns; add them with safe
/// defaults so startup never requires a manual migration step.
pub(crate) fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let runs = get_columns(conn, "runs")?;
    add_column_if_missing(conn, &runs, "runs", "stream", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(conn, &runs, "runs", "cancelled_at", "TEXT")?;
    add_column_if_missing(conn, &runs, "runs", "cancelled_by", "TEXT")?;

    let providers = get_columns(conn, "providers")?;
    add_column_if_missing(conn, &providers, "providers", "last_checked", "TEXT")?;

    let problems = get_columns(conn, "problems")?;
    add_column_if_missing(conn, &problems, "problems", "created_at", "TEXT NOT NULL DEFAULT ''")?;

    let results = get_columns(conn, "run_results")?;
    add_column_if_missing(conn, &results, "run_results", "judge_reasoning", "TEXT")?;
    add_column_if_missing(conn, &results, "run_results", "cancelled_at", "TEXT")?;

    // Problems inserted before the column existed sort first in a stable way
    // once stamped; problem order within a set is observable to clients.
    conn.execute(
        "UPDATE problems SET created_at = ?1
         WHERE created_at IS NULL OR created_at = '' OR created_at = '0'",
        [crate::model::now_rfc3339()],
    )
    .context("backfill problems.created_at")?;

    Ok(())
}

pub(crate) fn get_columns(conn: &Connection, table: &str) -> anyhow::Result<HashSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .context("prepare pragma table_info")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut out = HashSet::new();
    for r in rows {
        out.insert(r?);
    }
    Ok(out)
}

pub(crate) fn add_column_if_missing(
    conn: &Connection,
    cols: &HashSet<String>,
    table: &str,
    col: &str,
    ty: &str,
) -> anyhow::Result<()> {
    if !cols.contains(col) {
        let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, col, ty);
        conn.execute(&sql, []).context("alter table add column")?;
    }
    Ok(())
}
