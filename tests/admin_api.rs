//! Admin HTTP API surface, exercised directly through the router without a
//! bound socket (spec §6).

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use nofx_controller::api::{build_router, ApiState};
use nofx_controller::manager::TraderManager;

fn empty_state() -> ApiState {
    ApiState {
        manager: Arc::new(TraderManager::new()),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok_with_no_traders_registered() {
    let app = build_router(empty_state());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn status_without_traders_returns_not_found() {
    let app = build_router(empty_state());
    let response = app
        .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("no traders registered"));
}

#[tokio::test]
async fn okx_fills_degrades_to_an_empty_array_instead_of_an_error() {
    let app = build_router(empty_state());
    let response = app
        .oneshot(Request::builder().uri("/api/okx/fills").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn traders_list_is_empty_for_a_fresh_registry() {
    let app = build_router(empty_state());
    let response = app
        .oneshot(Request::builder().uri("/api/traders").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn initial_balance_rejects_non_positive_values() {
    let app = build_router(empty_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/initial-balance")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::json!({ "value": 0.0 }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
