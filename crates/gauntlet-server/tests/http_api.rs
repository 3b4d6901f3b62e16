//! HTTP surface tests driven through the router.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use gauntlet_core::cancel::CancelToken;
use gauntlet_core::judge::SYSTEM_PROMPT;
use gauntlet_core::model::{
    new_id, now_rfc3339, AdapterKind, Model, ModelParams, Problem, ProblemKind, ProblemSet,
    Provider, RunStatus,
};
use gauntlet_core::providers::{ChatClient, ChatMessage};
use gauntlet_core::retry::RetryPolicy;
use gauntlet_core::{Engine, Store};
use gauntlet_server::{api, state::AppState};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Candidate calls echo a fixed answer; judge calls (recognized by their
/// system prompt) return a passing verdict.
struct EchoClient;

#[async_trait]
impl ChatClient for EchoClient {
    async fn complete(
        &self,
        _provider: &Provider,
        _model: &Model,
        messages: &[ChatMessage],
    ) -> anyhow::Result<String> {
        if messages.first().map(|m| m.content.as_str()) == Some(SYSTEM_PROMPT) {
            Ok(r#"{"verdict":"PASS","reasoning":"ok","score":100}"#.into())
        } else {
            Ok("<button>Hi</button>".into())
        }
    }

    async fn stream(
        &self,
        provider: &Provider,
        model: &Model,
        messages: &[ChatMessage],
        _cancel: &CancelToken,
        on_token: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> anyhow::Result<String> {
        let text = self.complete(provider, model, messages).await?;
        on_token(&text);
        Ok(text)
    }
}

struct TestApp {
    _tmp: tempfile::TempDir,
    store: Store,
    router: Router,
}

fn test_app() -> TestApp {
    let tmp = tempfile::tempdir().unwrap();
    let store = Store::open(&tmp.path().join("api.db")).unwrap();
    store.init_schema().unwrap();
    let engine = Engine::new(store.clone(), Arc::new(EchoClient)).with_retry(RetryPolicy {
        max_attempts: 4,
        base_delay: Duration::from_millis(5),
    });
    let state = Arc::new(AppState::new(store.clone(), engine));
    TestApp {
        _tmp: tmp,
        store,
        router: api::router(state),
    }
}

struct Seed {
    judge: Model,
    candidate: Model,
    set: ProblemSet,
    problem: Problem,
    provider: Provider,
}

fn seed(store: &Store, kind: ProblemKind) -> Seed {
    let provider = Provider {
        id: new_id(),
        name: "local".into(),
        kind: AdapterKind::OpenAiCompat,
        base_url: "http://unused".into(),
        api_key: None,
        default_model: None,
        created_at: now_rfc3339(),
        last_checked: None,
    };
    store.insert_provider(&provider).unwrap();
    let judge = model(store, &provider.id, "judge");
    let candidate = model(store, &provider.id, "candidate");
    let set = ProblemSet {
        id: new_id(),
        name: "set".into(),
        description: None,
        created_at: now_rfc3339(),
    };
    store.insert_problem_set(&set).unwrap();
    let problem = Problem {
        id: new_id(),
        problem_set_id: set.id.clone(),
        kind,
        prompt: "make a button".into(),
        expected_answer: (kind == ProblemKind::Text).then(|| "a button".into()),
        html_assets: None,
        scoring_hints: None,
        created_at: now_rfc3339(),
    };
    store.insert_problem(&problem).unwrap();
    Seed {
        judge,
        candidate,
        set,
        problem,
        provider,
    }
}

fn model(store: &Store, provider_id: &str, label: &str) -> Model {
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

async fn request(router: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn wait_for_status(store: &Store, run_id: &str, status: RunStatus) {
    for _ in 0..200 {
        if store.get_run(run_id).unwrap().unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached {status:?}");
}

#[tokio::test]
async fn run_lifecycle_over_http() {
    let app = test_app();
    let s = seed(&app.store, ProblemKind::Text);

    let (status, body) = request(
        &app.router,
        post_json(
            "/api/runs",
            serde_json::json!({
                "problem_set_id": s.set.id,
                "model_ids": [s.candidate.id],
                "judge_model_id": s.judge.id,
                "stream": false,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let run_id = body["id"].as_str().unwrap().to_string();

    let (status, body) = request(
        &app.router,
        post_json(&format!("/api/runs/{run_id}/execute"), serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "running");

    wait_for_status(&app.store, &run_id, RunStatus::Completed).await;

    let (status, body) = request(&app.router, get(&format!("/api/runs/{run_id}/results"))).await;
    assert_eq!(status, StatusCode::OK);
    let results = body.as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["problem_prompt"], "make a button");
    assert_eq!(results[0]["problem_kind"], "text");
    assert_eq!(results[0]["status"], "completed");
    assert_eq!(results[0]["score"], 100);

    let (status, body) = request(&app.router, get("/api/runs?status=completed")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = request(&app.router, get("/api/runs?status=bogus")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn execute_missing_and_conflicting_runs() {
    let app = test_app();
    let s = seed(&app.store, ProblemKind::Text);

    let (status, _) = request(
        &app.router,
        post_json("/api/runs/missing/execute", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Reject creation referencing unknown pieces.
    let (status, _) = request(
        &app.router,
        post_json(
            "/api/runs",
            serde_json::json!({
                "problem_set_id": "missing",
                "model_ids": [s.candidate.id],
                "judge_model_id": s.judge.id,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(
        &app.router,
        post_json(
            "/api/runs",
            serde_json::json!({
                "problem_set_id": s.set.id,
                "model_ids": [],
                "judge_model_id": s.judge.id,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn manual_review_flow_over_http() {
    let app = test_app();
    let s = seed(&app.store, ProblemKind::Html);

    let (_, body) = request(
        &app.router,
        post_json(
            "/api/runs",
            serde_json::json!({
                "problem_set_id": s.set.id,
                "model_ids": [s.candidate.id],
                "judge_model_id": s.judge.id,
            }),
        ),
    )
    .await;
    let run_id = body["id"].as_str().unwrap().to_string();
    request(
        &app.router,
        post_json(&format!("/api/runs/{run_id}/execute"), serde_json::json!({})),
    )
    .await;
    wait_for_status(&app.store, &run_id, RunStatus::Completed).await;

    let results = app.store.list_results(&run_id).unwrap();
    assert_eq!(results[0].status.as_str(), "manual");
    let result_id = results[0].id.clone();

    let (status, body) = request(
        &app.router,
        post_json(
            &format!("/api/results/{result_id}/review"),
            serde_json::json!({"decision": "pass", "notes": "looks right"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["score"], 100);
    assert_eq!(body["judged_by"], "human");

    // A second review of the same result is rejected.
    let (status, _) = request(
        &app.router,
        post_json(
            &format!("/api/results/{result_id}/review"),
            serde_json::json!({"decision": "fail"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The reviewed problem was judged by a human, not the judge model.
    assert_eq!(s.problem.kind, ProblemKind::Html);
}

#[tokio::test]
async fn cancel_endpoints_validate_state() {
    let app = test_app();
    let s = seed(&app.store, ProblemKind::Text);

    let (_, body) = request(
        &app.router,
        post_json(
            "/api/runs",
            serde_json::json!({
                "problem_set_id": s.set.id,
                "model_ids": [s.candidate.id],
                "judge_model_id": s.judge.id,
            }),
        ),
    )
    .await;
    let run_id = body["id"].as_str().unwrap().to_string();

    // Cancelling a queued run works and finalizes it.
    let (status, body) = request(
        &app.router,
        post_json(&format!("/api/runs/{run_id}/cancel"), serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(
        app.store.get_run(&run_id).unwrap().unwrap().status,
        RunStatus::Cancelled
    );
    assert_eq!(
        app.store
            .get_run(&run_id)
            .unwrap()
            .unwrap()
            .cancelled_by
            .as_deref(),
        Some("user")
    );

    // A second cancel is a caller error.
    let (status, _) = request(
        &app.router,
        post_json(&format!("/api/runs/{run_id}/cancel"), serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Model cancel on a non-running run is a caller error too.
    let (status, _) = request(
        &app.router,
        post_json(
            &format!("/api/runs/{run_id}/models/{}/cancel", s.candidate.id),
            serde_json::json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sse_subscription_requires_streaming_run() {
    let app = test_app();
    let s = seed(&app.store, ProblemKind::Text);

    let (_, body) = request(
        &app.router,
        post_json(
            "/api/runs",
            serde_json::json!({
                "problem_set_id": s.set.id,
                "model_ids": [s.candidate.id],
                "judge_model_id": s.judge.id,
                "stream": false,
            }),
        ),
    )
    .await;
    let no_stream_run = body["id"].as_str().unwrap().to_string();
    let (status, _) = request(&app.router, get(&format!("/api/runs/{no_stream_run}/events"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(&app.router, get("/api/runs/missing/events")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = request(
        &app.router,
        post_json(
            "/api/runs",
            serde_json::json!({
                "problem_set_id": s.set.id,
                "model_ids": [s.candidate.id],
                "judge_model_id": s.judge.id,
                "stream": true,
            }),
        ),
    )
    .await;
    let run_id = body["id"].as_str().unwrap().to_string();
    let response = app
        .router
        .clone()
        .oneshot(get(&format!("/api/runs/{run_id}/events")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers.get("content-type").unwrap().to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(
        headers.get("cache-control").unwrap().to_str().unwrap(),
        "no-cache, no-transform"
    );
    assert_eq!(
        headers.get("x-accel-buffering").unwrap().to_str().unwrap(),
        "no"
    );
}

#[tokio::test]
async fn provider_probe_persists_last_checked() {
    let app = test_app();
    let s = seed(&app.store, ProblemKind::Text);

    // Point a fresh provider at a mock upstream.
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .mount(&upstream)
        .await;
    let probed = Provider {
        id: new_id(),
        name: "probed".into(),
        kind: AdapterKind::OpenAiCompat,
        base_url: upstream.uri(),
        api_key: None,
        default_model: None,
        created_at: now_rfc3339(),
        last_checked: None,
    };
    app.store.insert_provider(&probed).unwrap();

    let (status, body) = request(
        &app.router,
        post_json(&format!("/api/providers/{}/test", probed.id), serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert!(app
        .store
        .get_provider(&probed.id)
        .unwrap()
        .unwrap()
        .last_checked
        .is_some());

    // The seeded provider points nowhere; its probe fails with attempts.
    let (status, body) = request(
        &app.router,
        post_json(
            &format!("/api/providers/{}/test", s.provider.id),
            serde_json::json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], false);
    assert_eq!(body["attempts"].as_array().unwrap().len(), 3);

    let (status, _) = request(
        &app.router,
        post_json("/api/providers/missing/test", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn healthz_responds() {
    let app = test_app();
    let response = app.router.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
