//! # Integration Tests for vigil-api
//!
//! Drives the full router in memory: policy administration, event
//! evaluation and scheduling, resolution, execution retry, the audit
//! ledger, authentication roles, health probes and metrics.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use vigil_api::state::{AppConfig, AppState};
use vigil_core::SubjectId;
use vigil_policy::{StaticDirectory, SubjectAttributes};

/// Helper: directory knowing one engineer.
fn directory() -> Arc<StaticDirectory> {
    Arc::new(StaticDirectory::with_entries([(
        SubjectId::new("emp-1").unwrap(),
        SubjectAttributes::new("emp-1")
            .with_department("engineering")
            .with_role("developer"),
    )]))
}

/// Helper: build the test app with auth disabled.
fn test_app() -> axum::Router {
    let state = AppState::try_with_config(AppConfig::default(), directory(), None).unwrap();
    vigil_api::app(state)
}

/// Helper: build the test app with auth enabled.
fn test_app_with_auth(token: &str) -> axum::Router {
    let config = AppConfig {
        auth_token: Some(token.to_string()),
        ..AppConfig::default()
    };
    let state = AppState::try_with_config(config, directory(), None).unwrap();
    vigil_api::app(state)
}

/// Helper: read response body as string.
async fn body_string(response: axum::http::Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::http::Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn send_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    send_json("POST", uri, body)
}

/// Helper: create a policy and return its JSON.
async fn create_policy(app: &axum::Router, body: Value) -> Value {
    let response = app.clone().oneshot(post("/v1/policies", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

fn high_risk_policy() -> Value {
    json!({
        "name": "High risk engineer",
        "scope": {"type": "user", "target": "emp-1"},
        "priority": 10,
        "conditions": [
            {"type": "risk_score", "operator": "greater_than", "value": 85}
        ],
        "actions": [
            {"action": {"type": "alert", "config": {"recipients": ["soc@example.com"]}}},
            {"action": {"type": "escalate", "config": {"to": "insider-risk"}}, "delay_secs": 600}
        ]
    })
}

// -- Health Probes ------------------------------------------------------------

#[tokio::test]
async fn test_liveness_probe() {
    let response = test_app().oneshot(get("/health/liveness")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "ok");
}

#[tokio::test]
async fn test_readiness_probe() {
    let response = test_app().oneshot(get("/health/readiness")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "ready");
}

#[tokio::test]
async fn test_metrics_reports_engine_gauges() {
    let app = test_app();
    create_policy(&app, high_risk_policy()).await;
    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("vigil_policies_total 1"));
    assert!(body.contains("vigil_ledger_chain_valid 1"));
}

#[tokio::test]
async fn test_openapi_spec_served() {
    let response = test_app().oneshot(get("/openapi.json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let spec = body_json(response).await;
    assert!(spec["paths"]["/v1/events"].is_object());
    assert!(spec["paths"]["/v1/policies/{id}"].is_object());
}

// -- Policy Administration ----------------------------------------------------

#[tokio::test]
async fn test_policy_crud() {
    let app = test_app();
    let created = create_policy(&app, high_risk_policy()).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["conditions"].as_array().unwrap().len(), 1);
    assert_eq!(created["actions"].as_array().unwrap().len(), 2);
    assert_eq!(created["active"], true);

    let response = app.clone().oneshot(get("/v1/policies")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(send_json(
            "PATCH",
            &format!("/v1/policies/{id}"),
            json!({"priority": 42, "active": false}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated = body_json(response).await;
    assert_eq!(updated["priority"], 42);
    assert_eq!(updated["active"], false);

    let response = app
        .clone()
        .oneshot(delete(&format!("/v1/policies/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get(&format!("/v1/policies/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_scope_type_is_validation_error() {
    let response = test_app()
        .oneshot(post(
            "/v1/policies",
            json!({"name": "bad", "scope": {"type": "planet", "target": "mars"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/policies")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = test_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_conditions_and_actions_managed_individually() {
    let app = test_app();
    let created = create_policy(
        &app,
        json!({"name": "Exfil watch", "scope": {"type": "global"}}),
    )
    .await;
    let id = created["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post(
            &format!("/v1/policies/{id}/conditions"),
            json!({"type": "category", "operator": "in", "value": ["exfiltration", "usb"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let condition_id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post(
            &format!("/v1/policies/{id}/actions"),
            json!({"action": {"type": "increase-monitoring", "config": {"level": "high"}}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let action_id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(send_json(
            "PATCH",
            &format!("/v1/policies/{id}/actions/{action_id}"),
            json!({"enabled": false}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["enabled"], false);

    let response = app
        .clone()
        .oneshot(delete(&format!("/v1/policies/{id}/conditions/{condition_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(delete(&format!("/v1/policies/{id}/conditions/{condition_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(get(&format!("/v1/policies/{id}")))
        .await
        .unwrap();
    let policy = body_json(response).await;
    assert!(policy["conditions"].as_array().unwrap().is_empty());
    assert_eq!(policy["actions"].as_array().unwrap().len(), 1);
}

// -- Resolution ---------------------------------------------------------------

#[tokio::test]
async fn test_resolution_orders_by_specificity() {
    let app = test_app();
    create_policy(
        &app,
        json!({"name": "Global", "scope": {"type": "global"}, "priority": 50}),
    )
    .await;
    create_policy(
        &app,
        json!({"name": "User", "scope": {"type": "user", "target": "emp-1"}, "priority": 95}),
    )
    .await;
    create_policy(
        &app,
        json!({
            "name": "Group",
            "scope": {"type": "group", "kind": "department", "target": "engineering"},
            "priority": 80
        }),
    )
    .await;
    create_policy(
        &app,
        json!({
            "name": "Other group",
            "scope": {"type": "group", "kind": "department", "target": "finance"},
            "priority": 99
        }),
    )
    .await;

    let response = app
        .clone()
        .oneshot(get("/v1/subjects/emp-1/policies"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let resolution = body_json(response).await;
    assert_eq!(resolution["source"], "computed");
    let names: Vec<&str> = resolution["policies"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["User", "Group", "Global"]);

    let response = app
        .clone()
        .oneshot(get("/v1/subjects/emp-1/policies"))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["source"], "cache");

    let response = app
        .clone()
        .oneshot(delete("/v1/subjects/emp-1/cache"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["invalidated"], true);

    let response = app.oneshot(get("/v1/cache/stats")).await.unwrap();
    let stats = body_json(response).await;
    assert_eq!(stats["hits"], 1);
    assert_eq!(stats["entries"], 0);
}

#[tokio::test]
async fn test_unknown_subject_fails_closed_to_global() {
    let app = test_app();
    create_policy(&app, json!({"name": "Global", "scope": {"type": "global"}})).await;
    create_policy(&app, high_risk_policy()).await;

    let response = app
        .oneshot(get("/v1/subjects/ghost/policies"))
        .await
        .unwrap();
    let resolution = body_json(response).await;
    assert_eq!(resolution["source"], "fail_closed");
    assert_eq!(resolution["policies"].as_array().unwrap().len(), 1);
    assert_eq!(resolution["policies"][0]["name"], "Global");
}

// -- Event Evaluation & Executions --------------------------------------------

#[tokio::test]
async fn test_event_schedules_executions_in_action_order() {
    let app = test_app();
    let policy = create_policy(&app, high_risk_policy()).await;

    let response = app
        .clone()
        .oneshot(post(
            "/v1/events",
            json!({"subject_id": "emp-1", "risk_score": 90, "category": "exfiltration"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let outcome = body_json(response).await;
    assert_eq!(outcome["matched_policy_ids"][0], policy["id"]);
    assert_eq!(outcome["created_execution_record_ids"].as_array().unwrap().len(), 2);

    let response = app
        .clone()
        .oneshot(get("/v1/executions?subject_id=emp-1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let records = body_json(response).await;
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r["status"] == "pending"));

    let response = app.oneshot(get("/v1/stats/executions")).await.unwrap();
    let summary = body_json(response).await;
    assert_eq!(summary["total"], 2);
    assert_eq!(summary["counts"]["pending"], 2);
}

#[tokio::test]
async fn test_event_below_threshold_schedules_nothing() {
    let app = test_app();
    create_policy(&app, high_risk_policy()).await;

    let response = app
        .clone()
        .oneshot(post("/v1/events", json!({"subject_id": "emp-1", "risk_score": 80})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let outcome = body_json(response).await;
    assert!(outcome["matched_policy_ids"].as_array().unwrap().is_empty());
    assert!(outcome["created_execution_record_ids"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_preview_does_not_persist() {
    let app = test_app();
    create_policy(&app, high_risk_policy()).await;

    let response = app
        .clone()
        .oneshot(post(
            "/v1/events/preview",
            json!({"subject_id": "emp-1", "risk_score": 99}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let preview = body_json(response).await;
    assert_eq!(preview["planned"].as_array().unwrap().len(), 2);
    assert_eq!(preview["resolved"].as_array().unwrap().len(), 1);

    let response = app.oneshot(get("/v1/executions")).await.unwrap();
    assert!(body_json(response).await.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_of_pending_record_conflicts() {
    let app = test_app();
    create_policy(&app, high_risk_policy()).await;
    let response = app
        .clone()
        .oneshot(post("/v1/events", json!({"subject_id": "emp-1", "risk_score": 90})))
        .await
        .unwrap();
    let outcome = body_json(response).await;
    let record_id = outcome["created_execution_record_ids"][0].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(get(&format!("/v1/executions/{record_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(post(
            &format!("/v1/executions/{record_id}/retry"),
            json!({"reason": "manual"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_execution_not_found() {
    let id = uuid::Uuid::new_v4();
    let response = test_app()
        .oneshot(get(&format!("/v1/executions/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_scope_locked_once_referenced() {
    let app = test_app();
    let policy = create_policy(&app, high_risk_policy()).await;
    let id = policy["id"].as_str().unwrap().to_string();
    app.clone()
        .oneshot(post("/v1/events", json!({"subject_id": "emp-1", "risk_score": 90})))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(send_json(
            "PATCH",
            &format!("/v1/policies/{id}"),
            json!({"scope": {"type": "global"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .oneshot(send_json(
            "PATCH",
            &format!("/v1/policies/{id}"),
            json!({"name": "Renamed"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// -- Audit Ledger -------------------------------------------------------------

#[tokio::test]
async fn test_audit_ledger_records_mutations() {
    let app = test_app();
    let policy = create_policy(&app, high_risk_policy()).await;
    let id = policy["id"].as_str().unwrap().to_string();
    app.clone()
        .oneshot(post("/v1/events", json!({"subject_id": "emp-1", "risk_score": 90})))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(get(&format!("/v1/audit?entity_id={id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let entries = body_json(response).await;
    let entries = entries.as_array().unwrap();
    assert!(!entries.is_empty());
    assert!(entries.iter().all(|e| e["entity_id"] == id.as_str()));

    let response = app.clone().oneshot(get("/v1/audit")).await.unwrap();
    let all = body_json(response).await;
    let sequences: Vec<u64> = all
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["sequence"].as_u64().unwrap())
        .collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    let response = app.oneshot(get("/v1/audit/verify")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let verification = body_json(response).await;
    assert_eq!(verification["in_memory"]["chain_valid"], true);
    assert!(verification["persisted"].is_null());
}

#[tokio::test]
async fn test_audit_rejects_zero_limit() {
    let response = test_app().oneshot(get("/v1/audit?limit=0")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

// -- Authentication -----------------------------------------------------------

#[tokio::test]
async fn test_missing_token_rejected() {
    let response = test_app_with_auth("s3cret")
        .oneshot(get("/v1/policies"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_health_bypasses_auth() {
    let response = test_app_with_auth("s3cret")
        .oneshot(get("/health/liveness"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_analyst_cannot_create_policy() {
    let app = test_app_with_auth("s3cret");
    let mut request = post("/v1/policies", high_risk_policy());
    request.headers_mut().insert(
        "authorization",
        "Bearer analyst:alice:s3cret".parse().unwrap(),
    );
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let mut request = get("/v1/policies");
    request.headers_mut().insert(
        "authorization",
        "Bearer analyst:alice:s3cret".parse().unwrap(),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_principal_recorded_as_ledger_actor() {
    let app = test_app_with_auth("s3cret");
    let mut request = post("/v1/policies", high_risk_policy());
    request.headers_mut().insert(
        "authorization",
        "Bearer admin:jdoe:s3cret".parse().unwrap(),
    );
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let mut request = get("/v1/audit");
    request.headers_mut().insert(
        "authorization",
        "Bearer analyst::s3cret".parse().unwrap(),
    );
    let response = app.oneshot(request).await.unwrap();
    let entries = body_json(response).await;
    assert!(entries
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["actor"] == "jdoe"));
}
