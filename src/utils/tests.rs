use super::error::{ActivityError, BrokerError, EngineError};
use super::logging;
use crate::broker::message::Content;
use serde_json::json;

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn activity_error_from_string_payload() {
    let origin = Content {
        id: Some("task".into()),
        execution_id: Some("task_1".into()),
        ..Content::default()
    };

    let error = ActivityError::from_payload(&origin, Some(json!("out of stock")));

    assert_eq!(error.name, "ActivityError");
    assert_eq!(error.message, "out of stock");
    let source = error.origin.expect("source");
    assert_eq!(source.id.as_deref(), Some("task"));
    assert_eq!(source.execution_id.as_deref(), Some("task_1"));
}

#[test]
fn activity_error_picks_code_and_message_from_object_payload() {
    let error = ActivityError::from_payload(
        &Content::default(),
        Some(json!({"message": "declined", "code": "E_CARD"})),
    );

    assert_eq!(error.message, "declined");
    assert_eq!(error.code.as_deref(), Some("E_CARD"));

    let value = error.to_value();
    assert_eq!(value["name"], "ActivityError");
    assert_eq!(value["inner"]["code"], "E_CARD");
}

#[test]
fn broker_error_converts_into_engine_error() {
    let error: EngineError = BrokerError::UnknownExchange("nope".into()).into();
    assert_eq!(error.to_string(), "exchange 'nope' does not exist");
}
