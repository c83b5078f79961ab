mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use banner_analyzer::{router, AppState};
use common::*;
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> axum::Router {
    let pipeline = Arc::new(pipeline_with(&["SALE 50%", "공사 중 주의"]));
    let metrics = pipeline.metrics().clone();
    router(AppState {
        config: Arc::new(test_config()),
        pipeline,
        metrics,
    })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn analyze_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/analyze")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn analyze_returns_flat_banner_list() {
    let base = spawn_image_server().await;

    let response = app()
        .oneshot(analyze_request(serde_json::json!({
            "report_id": 42,
            "image_urls": [unreachable_url(), format!("{}/two.png", base)],
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["report_id"], 42);

    let banners = json["banner_list"].as_array().unwrap();
    assert_eq!(banners.len(), 2);
    assert_eq!(banners[0]["text"], "SALE 50%");
    assert_eq!(banners[0]["label"], "ad");
    assert_eq!(banners[1]["label"], "warning");
    assert_eq!(banners[0]["region"]["bounding_box"]["x"], 0);
    assert_eq!(banners[1]["region"]["bounding_box"]["x"], 10);
}

#[tokio::test]
async fn analyze_with_no_banners_returns_null() {
    let response = app()
        .oneshot(analyze_request(serde_json::json!({
            "report_id": 3,
            "image_urls": [],
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json, serde_json::json!({"report_id": 3, "banner_list": null}));
}

#[tokio::test]
async fn analyze_rejects_malformed_body() {
    let response = app()
        .oneshot(analyze_request(serde_json::json!({"report_id": 3})))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn health_and_stats_endpoints() {
    let app = app();

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["classifier"], "keyword");

    let response = app
        .clone()
        .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["requests_total"], 0);
    assert!(json["classifier_circuit"].is_null());

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("analyze_requests_total 0"));
}
