use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{Map, Value, json};

use super::*;
use crate::behaviours::{EventBehaviour, SignalTaskBehaviour};
use crate::broker::{Content, Fields, Message, Properties, SubscribeOptions};
use crate::utils::EngineError;

type Events = Rc<RefCell<Vec<(String, Content)>>>;

fn record_events(activity: &Activity) -> Events {
    let events: Events = Rc::default();
    let log = events.clone();
    activity
        .broker()
        .subscribe_tmp(
            "event",
            "activity.#",
            move |routing_key, message, _| {
                log.borrow_mut()
                    .push((routing_key.to_string(), message.content.clone()));
                Ok(())
            },
            SubscribeOptions::new()
                .consumer_tag("_test-events")
                .no_ack()
                .priority(1000),
        )
        .unwrap();
    events
}

fn phases(events: &Events) -> Vec<String> {
    events
        .borrow()
        .iter()
        .map(|(routing_key, _)| routing_key.trim_start_matches("activity.").to_string())
        .collect()
}

fn last_event(events: &Events, phase: &str) -> Content {
    let routing_key = format!("activity.{phase}");
    events
        .borrow()
        .iter()
        .rev()
        .find(|(key, _)| *key == routing_key)
        .map(|(_, content)| content.clone())
        .unwrap_or_else(|| panic!("no {routing_key} event"))
}

fn task(id: &str) -> Activity {
    Activity::new(
        ActivityDefinition::new(id, "bpmn:Task"),
        &Context::default(),
        SignalTaskBehaviour::new(None),
    )
    .unwrap()
}

fn command(routing_key: &str, kind: Option<&str>, payload: Option<Value>) -> Message {
    Message {
        fields: Fields {
            routing_key: routing_key.to_string(),
            exchange: "api".to_string(),
            ..Fields::default()
        },
        content: Content {
            message: payload,
            ..Content::default()
        },
        properties: Properties {
            kind: kind.map(str::to_string),
            ..Properties::default()
        },
    }
}

#[test]
fn test_event_without_definitions_runs_all_phases() {
    let definition = ActivityDefinition::new("start", "bpmn:StartEvent");
    let activity = Activity::new(definition.clone(), &Context::default(), EventBehaviour::new(&definition)).unwrap();
    let events = record_events(&activity);

    activity.run(None).unwrap();

    assert_eq!(phases(&events), vec!["enter", "start", "end", "leave"]);
    assert_eq!(activity.status(), ActivityStatus::Idle);
    assert_eq!(activity.counters(), Counters { taken: 1, discarded: 0 });
    assert_eq!(activity.broker().queue_message_count("run-q"), Some(0));
    assert_eq!(activity.broker().queue_message_count("execution-q"), Some(0));
}

#[test]
fn test_signal_completes_waiting_task() {
    let activity = task("task");
    let events = record_events(&activity);

    activity.run(None).unwrap();
    assert_eq!(phases(&events), vec!["enter", "start", "wait"]);
    assert_eq!(activity.status(), ActivityStatus::Executing);
    assert!(activity.is_running());

    let wait = last_event(&events, "wait");
    assert_eq!(wait.state.as_deref(), Some("wait"));
    assert_eq!(wait.execution_id, activity.execution_id());
    assert!(!wait.is_recovered);

    activity.get_api(None).signal(json!({ "answer": 42 })).unwrap();

    assert_eq!(phases(&events), vec!["enter", "start", "wait", "end", "leave"]);
    let end = last_event(&events, "end");
    assert_eq!(end.output, Some(json!({ "answer": 42 })));
    assert_eq!(end.execution_id, activity.execution_id());
    assert!(!end.is_root_scope);
    assert!(!activity.is_running());
    assert_eq!(activity.counters().taken, 1);
}

#[test]
fn test_run_twice_is_rejected() {
    let activity = task("task");
    activity.run(None).unwrap();

    let err = activity.run(None).unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRunning(id) if id == "task"));
}

#[test]
fn test_discard_leaves_through_discard_phase() {
    let activity = task("task");
    let events = record_events(&activity);

    activity.run(None).unwrap();
    activity.get_api(None).discard(None).unwrap();

    assert_eq!(phases(&events), vec!["enter", "start", "wait", "discard", "leave"]);
    assert_eq!(activity.counters(), Counters { taken: 0, discarded: 1 });
}

#[test]
fn test_error_command_fails_the_run() {
    let activity = task("task");
    let events = record_events(&activity);

    activity.run(None).unwrap();
    activity
        .get_api(None)
        .error(json!({ "message": "boom", "code": "E42" }))
        .unwrap();

    assert_eq!(phases(&events), vec!["enter", "start", "wait", "error", "leave"]);
    let error = last_event(&events, "error").error.unwrap();
    assert_eq!(error["message"], "boom");
    assert_eq!(error["code"], "E42");
    assert_eq!(error["source"]["id"], "task");
    assert_eq!(activity.status(), ActivityStatus::Idle);
}

#[test]
fn test_cancel_command_publishes_cancel_and_ends() {
    let activity = task("task");
    let events = record_events(&activity);

    activity.run(None).unwrap();
    activity.get_api(None).cancel(Some(json!("no more"))).unwrap();

    assert_eq!(phases(&events), vec!["enter", "start", "wait", "cancel", "end", "leave"]);
    assert_eq!(last_event(&events, "cancel").output, Some(json!("no more")));
    assert_eq!(activity.counters().taken, 1);
}

#[test]
fn test_stop_and_resume_redelivers_execution() {
    let activity = task("task");
    let events = record_events(&activity);

    activity.run(None).unwrap();
    let execution_id = activity.execution_id();
    activity.stop().unwrap();

    assert!(activity.is_stopped());
    assert!(activity.is_running());
    assert_eq!(phases(&events), vec!["enter", "start", "wait", "stop"]);

    // stopped activities ignore commands
    activity.get_api(None).signal(json!("early")).unwrap();
    assert_eq!(activity.status(), ActivityStatus::Executing);

    activity.resume().unwrap();
    assert!(!activity.is_stopped());
    assert_eq!(phases(&events), vec!["enter", "start", "wait", "stop", "wait"]);
    assert!(last_event(&events, "wait").is_recovered);

    activity.get_api(None).signal(json!("late")).unwrap();
    let end = last_event(&events, "end");
    assert_eq!(end.output, Some(json!("late")));
    assert_eq!(end.execution_id, execution_id);
    assert_eq!(activity.counters().taken, 1);
}

#[test]
fn test_stop_is_idempotent() {
    let activity = task("task");
    let events = record_events(&activity);

    activity.run(None).unwrap();
    activity.stop().unwrap();
    activity.stop().unwrap();

    let stops = phases(&events).iter().filter(|phase| *phase == "stop").count();
    assert_eq!(stops, 1);
}

#[test]
fn test_recover_state_into_new_activity() {
    let activity = task("task");
    activity.run(Some(Content {
        message: Some(json!("input")),
        ..Content::default()
    }))
    .unwrap();
    activity.stop().unwrap();

    let state = activity.get_state();
    assert_eq!(state.status, ActivityStatus::Executing);
    assert!(state.stopped);
    let serialized = serde_json::to_string(&state).unwrap();
    let state: ActivityState = serde_json::from_str(&serialized).unwrap();

    let recovered = task("task");
    let events = record_events(&recovered);
    recovered.recover(&state).unwrap();
    assert!(recovered.is_stopped());
    assert_eq!(recovered.status(), ActivityStatus::Executing);
    assert_eq!(recovered.execution_id(), activity.execution_id());

    recovered.resume().unwrap();
    assert!(last_event(&events, "wait").is_recovered);

    recovered.get_api(None).signal(json!("done")).unwrap();
    assert_eq!(phases(&events), vec!["wait", "end", "leave"]);
    assert_eq!(last_event(&events, "end").output, Some(json!("done")));
    assert_eq!(recovered.counters().taken, 1);
}

#[test]
fn test_recover_rejects_other_activity_state() {
    let activity = task("task");
    activity.run(None).unwrap();
    activity.stop().unwrap();

    let err = task("other").recover(&activity.get_state()).unwrap_err();
    assert!(matches!(
        err,
        EngineError::StateMismatch { ref expected, ref found } if expected == "other" && found == "task"
    ));
}

#[test]
fn test_recover_rejects_running_activity() {
    let activity = task("task");
    activity.run(None).unwrap();
    activity.stop().unwrap();
    let state = activity.get_state();

    let busy = task("task");
    busy.run(None).unwrap();
    assert!(matches!(busy.recover(&state), Err(EngineError::AlreadyRunning(_))));
}

#[test]
fn test_attached_run_carries_cancel_activity() {
    let host = task("host");
    let definition = ActivityDefinition::new("bound", "bpmn:BoundaryEvent").cancel_activity(false);
    let bound = Activity::new_attached(definition, &Context::default(), &host, SignalTaskBehaviour::new(None)).unwrap();

    assert_eq!(bound.definition().attached_to.as_deref(), Some("host"));
    assert!(bound.attached_to().is_some_and(|attached| attached.ptr_eq(&host)));

    bound.run(None).unwrap();
    let content = bound.content();
    assert_eq!(content.attached_to.as_deref(), Some("host"));
    assert_eq!(content.cancel_activity, Some(false));
}

#[test]
fn test_command_from_message() {
    let message = command("activity.signal.task_1", Some("signal"), Some(json!(1)));
    assert_eq!(Command::from_message(&message), Some(Command::Signal(Some(json!(1)))));

    let message = command("activity.discard.task_1", None, None);
    assert_eq!(Command::from_message(&message), Some(Command::Discard(None)));

    let message = command("activity.stop.task_1", Some("stop"), None);
    assert_eq!(Command::from_message(&message).map(|c| c.name()), Some("stop"));

    let message = command("activity.wiggle.task_1", None, None);
    assert_eq!(Command::from_message(&message), None);
}

#[test]
fn test_environment_resolves_variables() {
    let mut variables = Map::new();
    variables.insert("code".into(), json!("E_42"));
    variables.insert("nested".into(), json!({ "level": 3 }));
    let environment = Environment::new(variables);

    assert_eq!(
        environment.resolve_expression("code ${environment.variables.code}!"),
        "code E_42!"
    );
    assert_eq!(
        environment.resolve_expression("${environment.variables.nested.level}"),
        "3"
    );
    assert_eq!(environment.resolve_expression("${environment.variables.missing}x"), "x");
    assert_eq!(environment.resolve_expression("plain"), "plain");
    assert_eq!(environment.resolve_expression("${unclosed"), "${unclosed");
}

#[test]
fn test_context_looks_up_elements() {
    let context = Context::default().with_element(ElementRef::error("Error_1", "Boom", Some("E1")));

    let element = context.get_activity_by_id("Error_1").unwrap();
    assert_eq!(element.kind, "bpmn:Error");
    assert_eq!(element.code.as_deref(), Some("E1"));
    assert!(context.get_activity_by_id("Error_2").is_none());
}
