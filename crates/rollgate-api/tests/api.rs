//! REST API regression tests.
//!
//! Drives the router with `oneshot` requests against an orchestrator
//! wired to an always-healthy in-process target.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use rollgate_api::build_router;
use rollgate_core::{Action, PreflightCheck};
use rollgate_health::{DataPoint, QueryWindow, SignalSource, SourceFuture};
use rollgate_rollout::executor::ExecFuture;
use rollgate_rollout::preflight::ProbeFuture;
use rollgate_rollout::{CommandExecutor, Orchestrator, PreflightProbe};
use rollgate_state::StateStore;

struct Healthy;

impl CommandExecutor for Healthy {
    fn execute<'a>(&'a self, _target: &'a str, action: &'a Action) -> ExecFuture<'a> {
        Box::pin(async move { Ok(format!("{} applied", action.name)) })
    }
}

impl SignalSource for Healthy {
    fn query<'a>(
        &'a self,
        _target: &'a str,
        _signal: &'a str,
        window: QueryWindow,
    ) -> SourceFuture<'a> {
        Box::pin(async move {
            Ok(vec![DataPoint {
                timestamp: window.end,
                value: 0.01,
            }])
        })
    }
}

struct Unreachable;

impl PreflightProbe for Unreachable {
    fn check<'a>(&'a self, _target: &'a str, _check: &'a PreflightCheck) -> ProbeFuture<'a> {
        Box::pin(async { Ok(false) })
    }
}

fn test_orchestrator() -> Orchestrator {
    let target = Arc::new(Healthy);
    Orchestrator::new(
        StateStore::open_in_memory().unwrap(),
        target.clone(),
        target,
    )
}

fn test_plan(target: &str) -> Value {
    json!({
        "target": target,
        "phases": [{
            "name": "canary",
            "action": { "name": "deploy-canary" },
            "windows": [{
                "name": "immediate",
                "duration": "1m",
                "interval": "30s",
                "rules": [{ "signal": "error_rate", "op": ">", "threshold": 0.05 }]
            }]
        }],
        "rollback": { "action": { "name": "revert" } }
    })
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn healthz_ok() {
    let router = build_router(test_orchestrator());
    let (status, body) = send(&router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn list_rollouts_empty() {
    let router = build_router(test_orchestrator());
    let (status, body) = send(&router, "GET", "/api/v1/rollouts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test(start_paused = true)]
async fn start_then_get_and_list() {
    let orchestrator = test_orchestrator();
    let router = build_router(orchestrator.clone());

    let (status, body) = send(&router, "POST", "/api/v1/rollouts", Some(test_plan("prod/api"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["status"], "running");

    let (status, body) = send(&router, "GET", &format!("/api/v1/rollouts/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["target"], "prod/api");

    let (status, body) = send(&router, "GET", "/api/v1/rollouts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["id"], id.as_str());

    let done = orchestrator.wait(&id).await.unwrap();
    let (_, body) = send(&router, "GET", &format!("/api/v1/rollouts/{id}"), None).await;
    assert_eq!(body["data"]["status"], "succeeded");
    assert_eq!(body["data"]["decisions"].as_array().unwrap().len(), done.decisions().len());
}

#[tokio::test(start_paused = true)]
async fn second_start_on_locked_target_conflicts() {
    let router = build_router(test_orchestrator());

    let (status, _) = send(&router, "POST", "/api/v1/rollouts", Some(test_plan("prod/api"))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&router, "POST", "/api/v1/rollouts", Some(test_plan("prod/api"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("prod/api"));
}

#[tokio::test]
async fn invalid_plan_is_unprocessable() {
    let router = build_router(test_orchestrator());
    let mut plan = test_plan("prod/api");
    plan["phases"] = json!([]);

    let (status, body) = send(&router, "POST", "/api/v1/rollouts", Some(plan)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("phase"));
}

#[tokio::test]
async fn preflight_nogo_reports_failed_checks() {
    let router = build_router(test_orchestrator().with_probe(Arc::new(Unreachable)));
    let mut plan = test_plan("prod/api");
    plan["preflight"] = json!([{ "name": "cluster-reachable", "deadline": "5s" }]);

    let (status, body) = send(&router, "POST", "/api/v1/rollouts", Some(plan)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["data"]["failed_checks"], json!(["cluster-reachable"]));
}

#[tokio::test]
async fn unknown_rollout_not_found() {
    let router = build_router(test_orchestrator());
    let (status, _) = send(&router, "GET", "/api/v1/rollouts/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, "POST", "/api/v1/rollouts/nope/abort", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn abort_accepted_then_conflicts_once_terminal() {
    let orchestrator = test_orchestrator();
    let router = build_router(orchestrator.clone());

    let (_, body) = send(&router, "POST", "/api/v1/rollouts", Some(test_plan("prod/api"))).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(&router, "POST", &format!("/api/v1/rollouts/{id}/abort"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let done = orchestrator.wait(&id).await.unwrap();
    assert_eq!(done.status().to_string(), "rolled_back");

    let (status, body) = send(&router, "POST", &format!("/api/v1/rollouts/{id}/abort"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["data"]["status"], "rolled_back");
}

#[tokio::test(start_paused = true)]
async fn replay_reproduces_recorded_decisions() {
    let orchestrator = test_orchestrator();
    let router = build_router(orchestrator.clone());

    let (_, body) = send(&router, "POST", "/api/v1/rollouts", Some(test_plan("prod/api"))).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    orchestrator.wait(&id).await.unwrap();

    let (status, body) = send(&router, "GET", &format!("/api/v1/rollouts/{id}/replay"), None).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["data"]["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["matches"], true);
}
