//! API handler behavior via in-process requests.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use tower::ServiceExt;

use cyclesrv::api::{create_api_routes, AppState};
use cyclesrv::config::{ServiceConfig, StationConfig};
use cyclesrv::core::monitor::MonitorRegistry;
use cyclesrv::core::scan::ScanMatcher;
use cyclesrv::core::types::{CycleResult, NewCycle};
use cyclesrv::protocols::mock::MockBus;
use cyclesrv::protocols::modbus::RegisterBus;
use cyclesrv::store::{CycleStore, MemoryStore};

const CODE: &str = "BRK88812AV0420826000001000000000";

fn service_config() -> ServiceConfig {
    serde_yaml::from_str(
        r#"
stations:
  - id: 1
    code: BRK-01
    host: 127.0.0.1
    cycle_complete_bit: 221
    fields:
      - { name: torque_nm, address: 2700, kind: u16, scale: 0.01 }
    label:
      part_name: BRAKE ASSEMBLY
      part_no: BRK88812
      revision: A
      vendor_code: V042
"#,
    )
    .expect("config yaml")
}

async fn app_with_store() -> (axum::Router, Arc<MemoryStore>) {
    let config = Arc::new(service_config());
    let store = Arc::new(MemoryStore::new());
    let factory = Arc::new(|_: &StationConfig| Box::new(MockBus::new()) as Box<dyn RegisterBus>);
    let registry = Arc::new(MonitorRegistry::with_bus_factory(
        config.stations.clone(),
        Arc::clone(&store) as Arc<dyn CycleStore>,
        factory,
    ));
    let matcher = Arc::new(ScanMatcher::new(Arc::clone(&store) as Arc<dyn CycleStore>));
    let app = create_api_routes(AppState {
        config,
        registry,
        matcher,
    });
    (app, store)
}

async fn seed_record(store: &MemoryStore) {
    store
        .create_cycle(NewCycle {
            station_id: 1,
            station_code: "BRK-01".into(),
            sequence: 1,
            cycle_number: "BRK-01-000001".into(),
            created_at: Utc::now(),
            fields: BTreeMap::new(),
            result: CycleResult::Ok,
            barcode: CODE.to_string(),
            code: CODE.to_string(),
        })
        .await
        .expect("seed record");
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_reports_station_count() {
    let (app, _store) = app_with_store().await;
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["stations"], 1);
}

#[tokio::test]
async fn station_status_endpoints() {
    let (app, _store) = app_with_store().await;

    let response = app
        .clone()
        .oneshot(get("/api/stations"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["station_code"], "BRK-01");
    assert_eq!(json[0]["connection_state"], "disconnected");

    let response = app
        .clone()
        .oneshot(get("/api/stations/1/status"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/api/stations/99/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn monitoring_start_and_stop() {
    let (app, _store) = app_with_store().await;

    let response = app
        .clone()
        .oneshot(post_empty("/api/stations/1/monitoring/start"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["monitoring_enabled"], true);

    let response = app
        .clone()
        .oneshot(get("/api/stations/1/status"))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["monitoring_enabled"], true);

    let response = app
        .clone()
        .oneshot(post_empty("/api/stations/1/monitoring/stop"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get("/api/stations/1/status"))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["monitoring_enabled"], false);
}

#[tokio::test]
async fn scan_submission_matched() {
    let (app, store) = app_with_store().await;
    seed_record(&store).await;

    let response = app
        .oneshot(post_json("/api/scan", serde_json::json!({ "payload": CODE })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["outcome"], "matched");
    assert_eq!(json["cycle_number"], "BRK-01-000001");
}

#[tokio::test]
async fn scan_submission_not_found_and_malformed() {
    let (app, _store) = app_with_store().await;

    let response = app
        .clone()
        .oneshot(post_json("/api/scan", serde_json::json!({ "payload": CODE })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["outcome"], "not_found");

    // Malformed payloads are a structured outcome, not an error status
    let response = app
        .oneshot(post_json(
            "/api/scan",
            serde_json::json!({ "payload": "%%%", "scanner_id": "dock-3" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["outcome"], "not_found");
}

#[tokio::test]
async fn scan_submission_mismatch() {
    let (app, store) = app_with_store().await;
    seed_record(&store).await;

    // Envelope whose barcode disagrees with the stored record
    let envelope = format!(r#"{{"code": "{CODE}", "barcode": "WRONG"}}"#);
    let response = app
        .oneshot(post_json("/api/scan", serde_json::json!({ "payload": envelope })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["outcome"], "mismatch");
}

#[tokio::test]
async fn reprint_unknown_cycle_is_not_found() {
    let (app, _store) = app_with_store().await;
    let response = app
        .oneshot(post_empty(&format!("/api/cycles/{CODE}/print")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reprint_without_printer_is_rejected() {
    let (app, store) = app_with_store().await;
    seed_record(&store).await;
    let response = app
        .oneshot(post_empty(&format!("/api/cycles/{CODE}/print")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
