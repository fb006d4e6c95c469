mod common;

use common::*;

use prism_engine::adapter::ScriptedHoldingsAdapter;
use prism_engine::hive::InMemoryHive;
use prism_engine::transport::codec::{self, ResponseStatus};
use prism_engine::transport::{Dispatcher, Request};
use serde_json::{Value, json};

fn request(id: i64, command: &str, payload: Value) -> Request {
    Request {
        id: json!(id),
        command: command.to_string(),
        payload,
    }
}

fn plain_rig() -> TestRig {
    rig(
        vec![],
        ScriptedHoldingsAdapter::new("ishares"),
        InMemoryHive::new(),
        vec![],
    )
}

#[tokio::test]
async fn ping_answers_ok() {
    let rig = plain_rig();
    let dispatcher = Dispatcher::new(rig.engine.clone());

    let response = dispatcher.dispatch(request(1, "ping", json!({}))).await;
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.id, json!(1));
    assert_eq!(response.data.unwrap()["status"], "ok");
}

#[tokio::test]
async fn unknown_commands_are_refused_with_code() {
    let rig = plain_rig();
    let dispatcher = Dispatcher::new(rig.engine.clone());

    let response = dispatcher
        .dispatch(request(2, "execute_trade", json!({})))
        .await;
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error.unwrap().code, "UNKNOWN_COMMAND");
}

#[tokio::test]
async fn telemetry_commands_are_out_of_scope() {
    let rig = plain_rig();
    let dispatcher = Dispatcher::new(rig.engine.clone());

    for command in ["log_event", "get_recent_reports", "get_pending_reviews"] {
        let response = dispatcher.dispatch(request(3, command, json!({}))).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.error.unwrap().code, "UNKNOWN_COMMAND");
    }
}

#[tokio::test]
async fn bad_payload_is_refused_not_crashed() {
    let rig = plain_rig();
    let dispatcher = Dispatcher::new(rig.engine.clone());

    let response = dispatcher
        .dispatch(request(4, "sync_positions", json!({ "dry_run": "yes please" })))
        .await;
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error.unwrap().code, "BAD_PAYLOAD");
}

#[tokio::test]
async fn run_pipeline_round_trips_through_the_dispatcher() {
    let adapter = ScriptedHoldingsAdapter::new("ishares").serve(
        WORLD_ETF.parse().unwrap(),
        vec![
            holding(WORLD_ETF, Some(APPLE), "Apple Inc", "0.60"),
            holding(WORLD_ETF, Some(MSFT), "Microsoft Corp", "0.40"),
        ],
    );
    let rig = rig(
        vec![etf(WORLD_ETF, "1", "100.00")],
        adapter,
        InMemoryHive::new(),
        vec![],
    );
    let dispatcher = Dispatcher::new(rig.engine.clone());

    let response = dispatcher
        .dispatch(request(5, "run_pipeline", json!({ "portfolio_id": "default" })))
        .await;
    assert_eq!(response.status, ResponseStatus::Success);
    let data = response.data.unwrap();
    assert_eq!(data["success"], true);
    assert_eq!(data["errors"], json!([]));

    let holdings = dispatcher
        .dispatch(request(6, "get_true_holdings", Value::Null))
        .await;
    let data = holdings.data.unwrap();
    assert_eq!(data["holdings"].as_array().unwrap().len(), 2);
    assert_eq!(data["summary"]["resolvedCount"], 2);

    let report = dispatcher
        .dispatch(request(7, "get_pipeline_report", Value::Null))
        .await;
    let data = report.data.unwrap();
    assert!(data.get("data_quality").is_some());
    assert_eq!(data["metrics"]["etfs_processed"], 1);
}

#[tokio::test]
async fn hive_contribution_flag_round_trips_and_persists() {
    let rig = plain_rig();
    let dispatcher = Dispatcher::new(rig.engine.clone());

    let current = dispatcher
        .dispatch(request(8, "get_hive_contribution", Value::Null))
        .await;
    assert_eq!(current.data.unwrap()["enabled"], true);

    let updated = dispatcher
        .dispatch(request(9, "set_hive_contribution", json!({ "enabled": false })))
        .await;
    assert_eq!(updated.data.unwrap()["enabled"], false);

    let flag = std::fs::read_to_string(rig.dir.path().join("hive_contribution.flag")).unwrap();
    assert_eq!(flag.trim(), "false");
}

#[test]
fn frames_survive_payloads_with_newlines() {
    let response = codec::Response::success(
        json!("x"),
        json!({ "fix_hint": "step one\nstep two" }),
    );
    let encoded = codec::encode(&response);
    assert_eq!(encoded.lines().count(), 1);
}
