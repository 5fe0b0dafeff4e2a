use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde_json::{Map, Value, json};

use super::*;
use crate::activity::{Activity, ActivityDefinition, ActivityStatus, Context, ElementRef, Environment};
use crate::behaviours::EventBehaviour;
use crate::broker::{Content, Message, Properties, SubscribeOptions};
use crate::config::EngineSettings;

type Events = Rc<RefCell<Vec<Message>>>;

fn context() -> Context {
    let mut variables = Map::new();
    variables.insert("code".into(), json!("E42"));
    Context::new(Environment::new(variables), EngineSettings::default())
        .with_element(ElementRef::error("Error_1", "Boom", Some("${environment.variables.code}")))
        .with_element(ElementRef::signal("Signal_1", "Go"))
}

fn event(definition: ActivityDefinition) -> Activity {
    let behaviour = EventBehaviour::new(&definition);
    Activity::new(definition, &context(), behaviour).unwrap()
}

fn catching(id: &str, definitions: Vec<EventDefinition>) -> Activity {
    let mut definition = ActivityDefinition::new(id, "bpmn:IntermediateCatchEvent");
    for event_definition in definitions {
        definition = definition.with_event_definition(event_definition);
    }
    event(definition)
}

fn throwing(id: &str, definition: EventDefinition) -> Activity {
    event(
        ActivityDefinition::new(id, "bpmn:EndEvent")
            .throwing()
            .with_event_definition(definition),
    )
}

fn record_events(activity: &Activity) -> Events {
    let events: Events = Rc::default();
    let log = events.clone();
    activity
        .broker()
        .subscribe_tmp(
            "event",
            "activity.#",
            move |_, message, _| {
                log.borrow_mut().push(message.clone());
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
        .map(|message| message.routing_key().trim_start_matches("activity.").to_string())
        .collect()
}

fn find(events: &Events, phase: &str) -> Vec<Message> {
    let routing_key = format!("activity.{phase}");
    events
        .borrow()
        .iter()
        .filter(|message| message.routing_key() == routing_key)
        .cloned()
        .collect()
}

fn throw_to(activity: &Activity, thrown: Value) {
    let content = Content {
        id: Some("thrower".to_string()),
        execution_id: Some("thrower_1".to_string()),
        message: Some(thrown),
        ..Content::default()
    };
    activity
        .broker()
        .publish("api", "activity.throw.thrower_1", content, Properties::delegated("throw"))
        .unwrap();
}

fn sub_execution(activity: &Activity, index: usize) -> String {
    format!("{}_{index}", activity.execution_id().unwrap())
}

#[test]
fn test_parse_duration() {
    assert_eq!(parse_duration("PT30S"), Some(Duration::from_secs(30)));
    assert_eq!(parse_duration("PT1M30S"), Some(Duration::from_secs(90)));
    assert_eq!(parse_duration("P1DT2H"), Some(Duration::from_secs(93_600)));
    assert_eq!(parse_duration("P1W"), Some(Duration::from_secs(604_800)));
    assert_eq!(parse_duration("PT0.5S"), Some(Duration::from_millis(500)));
    assert_eq!(parse_duration(" PT1H "), Some(Duration::from_secs(3_600)));
    assert_eq!(parse_duration("30S"), None);
    assert_eq!(parse_duration("PT"), None);
    assert_eq!(parse_duration("PT5"), None);
    assert_eq!(parse_duration("PT5X"), None);
    assert_eq!(parse_duration("P1H"), None);
}

#[test]
fn test_definition_kinds() {
    assert_eq!(EventDefinition::error(None).kind(), "bpmn:ErrorEventDefinition");
    assert_eq!(EventDefinition::signal(Some("Signal_1")).kind(), "bpmn:SignalEventDefinition");
    assert_eq!(EventDefinition::timer("PT1S").kind(), "bpmn:TimerEventDefinition");
    assert_eq!(EventDefinition::Cancel.kind(), "bpmn:CancelEventDefinition");
    assert_eq!(EventDefinition::Compensate.kind(), "bpmn:CompensateEventDefinition");
}

#[test]
fn test_targets_execution() {
    let content = Content {
        execution_id: Some("event_1_0".to_string()),
        parent: Some(crate::broker::Parent {
            id: "event".to_string(),
            execution_id: Some("event_1".to_string()),
            path: Vec::new(),
        }),
        ..Content::default()
    };
    assert!(targets_execution("activity.signal.event_1_0", &content));
    assert!(targets_execution("activity.signal.event_1", &content));
    assert!(!targets_execution("activity.signal.event_2", &content));
}

#[test]
fn test_error_without_reference_catches_any_throw() {
    let activity = catching("catch", vec![EventDefinition::error(None)]);
    let events = record_events(&activity);

    activity.run(None).unwrap();
    assert_eq!(phases(&events), vec!["enter", "start", "wait"]);
    let wait = &find(&events, "wait")[0];
    assert_eq!(wait.content.execution_id, activity.execution_id());

    let sub = sub_execution(&activity, 0);
    assert!(activity.broker().get_consumer(&format!("_onthrow-{sub}")).is_some());

    throw_to(&activity, json!({ "id": "Error_2", "code": "E7" }));

    let caught = find(&events, "catch");
    assert_eq!(caught.len(), 1);
    assert_eq!(caught[0].content.error, Some(json!({ "id": "Error_2", "code": "E7" })));
    let source = caught[0].content.source.clone().unwrap();
    assert_eq!(source.id.as_deref(), Some("thrower"));
    assert_eq!(source.execution_id.as_deref(), Some("thrower_1"));

    let end = &find(&events, "end")[0];
    assert_eq!(end.content.output, Some(json!({ "id": "Error_2", "code": "E7" })));
    assert_eq!(end.content.state.as_deref(), Some("catch"));
    assert_eq!(phases(&events), vec!["enter", "start", "wait", "catch", "end", "leave"]);

    for prefix in ["_onthrow-", "_api-"] {
        assert!(activity.broker().get_consumer(&format!("{prefix}{sub}")).is_none());
    }

    throw_to(&activity, json!({ "id": "Error_3" }));
    assert_eq!(find(&events, "catch").len(), 1);
    assert_eq!(activity.broker().queue_message_count("throw-0-q"), Some(1));
}

#[test]
fn test_error_thrown_before_run_is_caught_on_execute() {
    let activity = catching("catch", vec![EventDefinition::error(None)]);
    let events = record_events(&activity);

    throw_to(&activity, json!({ "name": "Early" }));
    assert_eq!(activity.broker().queue_message_count("throw-0-q"), Some(1));

    activity.run(None).unwrap();

    let caught = find(&events, "catch");
    assert_eq!(caught.len(), 1);
    assert_eq!(caught[0].content.error, Some(json!({ "name": "Early" })));
    assert_eq!(phases(&events), vec!["enter", "start", "wait", "catch", "end", "leave"]);
    assert!(!activity.is_running());
    assert_eq!(activity.broker().queue_message_count("throw-0-q"), Some(0));

    let sub = sub_execution(&activity, 0);
    for prefix in ["_onthrow-", "_api-"] {
        assert!(activity.broker().get_consumer(&format!("{prefix}{sub}")).is_none());
    }
}

#[test]
fn test_error_thrown_while_stopped_is_caught_on_resume() {
    let activity = catching("catch", vec![EventDefinition::error(None)]);
    let events = record_events(&activity);
    activity.run(None).unwrap();
    activity.stop().unwrap();

    throw_to(&activity, json!({ "name": "Late" }));
    assert!(find(&events, "catch").is_empty());

    activity.resume().unwrap();

    assert_eq!(find(&events, "catch").len(), 1);
    assert_eq!(find(&events, "end").len(), 1);
    assert!(!activity.is_running());
}

#[test]
fn test_error_reference_filters_thrown_errors() {
    let activity = catching("catch", vec![EventDefinition::error(Some("Error_1"))]);
    let events = record_events(&activity);
    activity.run(None).unwrap();

    throw_to(&activity, json!({ "name": "anonymous" }));
    throw_to(&activity, json!({ "id": "Error_2", "code": "E7" }));
    assert!(find(&events, "catch").is_empty());
    assert!(activity.is_running());

    throw_to(&activity, json!({ "code": "E42" }));
    assert_eq!(find(&events, "catch").len(), 1);
    assert!(!activity.is_running());
}

#[test]
fn test_error_reference_matches_on_id() {
    let activity = catching("catch", vec![EventDefinition::error(Some("Error_1"))]);
    let events = record_events(&activity);
    activity.run(None).unwrap();

    throw_to(&activity, json!({ "id": "Error_1" }));
    assert_eq!(find(&events, "catch").len(), 1);
}

#[test]
fn test_throw_describes_referenced_error() {
    let activity = throwing("end", EventDefinition::error(Some("Error_1")));
    let events = record_events(&activity);
    activity.run(None).unwrap();

    let thrown = find(&events, "throw");
    assert_eq!(thrown.len(), 1);
    assert_eq!(
        thrown[0].content.message,
        Some(json!({ "id": "Error_1", "name": "Boom", "code": "E42" }))
    );
    assert!(thrown[0].properties.delegate);
    assert_eq!(thrown[0].properties.kind.as_deref(), Some("throw"));
    assert_eq!(thrown[0].content.execution_id, activity.execution_id());
    assert_eq!(phases(&events), vec!["enter", "start", "throw", "end", "leave"]);
}

#[test]
fn test_throw_without_reference_is_anonymous() {
    let activity = throwing("end", EventDefinition::error(None));
    let events = record_events(&activity);
    activity.run(None).unwrap();

    assert_eq!(find(&events, "throw")[0].content.message, Some(json!({ "name": "anonymous" })));
}

#[test]
fn test_throw_with_unknown_reference_keeps_id() {
    let activity = throwing("end", EventDefinition::error(Some("non-existing")));
    let events = record_events(&activity);
    activity.run(None).unwrap();

    assert_eq!(find(&events, "throw")[0].content.message, Some(json!({ "id": "non-existing" })));
}

#[test]
fn test_signal_throw_is_delegated() {
    let activity = throwing("end", EventDefinition::signal(Some("Signal_1")));
    let events = record_events(&activity);
    activity.run(None).unwrap();

    let signalled = find(&events, "signal");
    assert_eq!(signalled.len(), 1);
    assert_eq!(signalled[0].content.message, Some(json!({ "id": "Signal_1", "name": "Go" })));
    assert!(signalled[0].properties.delegate);
    assert_eq!(signalled[0].properties.kind.as_deref(), Some("signal"));
}

#[test]
fn test_signal_addressed_to_event_completes_it() {
    let activity = catching("catch", vec![EventDefinition::signal(None)]);
    let events = record_events(&activity);
    activity.run(None).unwrap();

    let wait = &find(&events, "wait")[0];
    assert_eq!(wait.content.expect.as_deref(), Some("signal"));

    activity.get_api(None).signal(json!({ "go": true })).unwrap();

    let caught = find(&events, "catch");
    assert_eq!(caught.len(), 1);
    assert_eq!(caught[0].content.message, Some(json!({ "go": true })));
    let end = &find(&events, "end")[0];
    assert_eq!(end.content.output, Some(json!({ "go": true })));
    assert_eq!(end.content.state.as_deref(), Some("signal"));
}

#[test]
fn test_delegated_signal_matches_reference() {
    let activity = catching("catch", vec![EventDefinition::signal(Some("Signal_1"))]);
    let events = record_events(&activity);
    activity.run(None).unwrap();

    let wait = &find(&events, "wait")[0];
    assert_eq!(wait.content.message, Some(json!({ "id": "Signal_1", "name": "Go" })));

    let delegated = |payload: Value| {
        let content = Content {
            message: Some(payload),
            ..Content::default()
        };
        activity
            .broker()
            .publish("api", "activity.signal.other_1", content, Properties::delegated("signal"))
            .unwrap();
    };

    delegated(json!({ "id": "Signal_2" }));
    assert!(find(&events, "catch").is_empty());

    delegated(json!({ "id": "Signal_1" }));
    assert_eq!(find(&events, "catch").len(), 1);
    assert!(!activity.is_running());
}

#[test]
fn test_timer_announces_itself_and_times_out_on_signal() {
    let activity = catching("timer", vec![EventDefinition::timer("PT2S")]);
    let events = record_events(&activity);
    activity.run(None).unwrap();

    let timer = find(&events, "timer");
    assert_eq!(timer.len(), 1);
    let content = timer[0].content.clone();
    assert_eq!(content.execution_id, Some(sub_execution(&activity, 0)));
    assert_eq!(content.state.as_deref(), Some("timer"));
    assert_eq!(content.extra.get("timeDuration"), Some(&json!("PT2S")));
    assert_eq!(content.extra.get("timeout"), Some(&json!(2000)));
    assert!(content.extra.contains_key("expireAt"));

    activity.get_api(Some(content)).signal(json!("fired")).unwrap();

    let end = &find(&events, "end")[0];
    assert_eq!(end.content.state.as_deref(), Some("timeout"));
    assert_eq!(end.content.output, Some(json!("fired")));
    assert!(!activity.is_running());
}

#[test]
fn test_first_completed_definition_wins() {
    let activity = catching("catch", vec![EventDefinition::signal(None), EventDefinition::timer("PT1M")]);
    let events = record_events(&activity);
    activity.run(None).unwrap();
    assert_eq!(phases(&events), vec!["enter", "start", "wait", "timer"]);

    let timer_execution = sub_execution(&activity, 1);
    activity.get_api(None).signal(json!("first")).unwrap();

    assert_eq!(find(&events, "end").len(), 1);
    assert_eq!(find(&events, "end")[0].content.state.as_deref(), Some("signal"));
    assert!(activity
        .broker()
        .get_consumer(&format!("_api-{timer_execution}"))
        .is_none());
    assert_eq!(activity.counters().taken, 1);
}

#[test]
fn test_root_discarded_once_every_definition_is_discarded() {
    let activity = catching("catch", vec![EventDefinition::signal(None), EventDefinition::timer("PT1M")]);
    let events = record_events(&activity);
    activity.run(None).unwrap();

    activity.get_api(None).discard(None).unwrap();

    assert_eq!(
        phases(&events),
        vec!["enter", "start", "wait", "timer", "discard", "leave"]
    );
    assert_eq!(activity.counters().discarded, 1);
    for index in 0..2 {
        let sub = sub_execution(&activity, index);
        assert!(activity.broker().get_consumer(&format!("_api-{sub}")).is_none());
        assert!(activity.broker().get_consumer(&format!("_onsignal-{sub}")).is_none());
    }
}

#[test]
fn test_execution_state_round_trip() {
    let activity = catching("catch", vec![EventDefinition::signal(None)]);
    let execution = EventDefinitionExecution::new(vec![EventDefinition::signal(None)], "execute.completed");
    assert_eq!(execution.definitions().len(), 1);
    assert_eq!(execution.completed_routing_key(), "execute.completed");
    assert!(execution.get_state().is_none());

    let state = json!({ "catch_1": { "root": { "executionId": "catch_1", "isRootScope": true } } });
    execution.recover(&state).unwrap();
    assert!(execution.is_pending("catch_1"));

    let copy = EventDefinitionExecution::new(vec![EventDefinition::signal(None)], "execute.completed");
    copy.recover(&execution.get_state().unwrap()).unwrap();
    assert!(copy.is_pending("catch_1"));

    execution.discard_definitions(&activity, "catch_1").unwrap();
    assert!(!execution.is_pending("catch_1"));
    assert!(execution.get_state().is_none());
}

#[test]
fn test_stopped_catch_recovers_and_completes() {
    let activity = catching("catch", vec![EventDefinition::error(None), EventDefinition::signal(None)]);
    activity.run(None).unwrap();
    activity.stop().unwrap();

    let state = activity.get_state();
    assert!(state.behaviour.is_some());

    let recovered = catching("catch", vec![EventDefinition::error(None), EventDefinition::signal(None)]);
    let events = record_events(&recovered);
    recovered.recover(&state).unwrap();
    recovered.resume().unwrap();

    assert_eq!(phases(&events), vec!["wait", "wait"]);
    recovered.get_api(None).signal(json!("resumed")).unwrap();

    assert_eq!(phases(&events), vec!["wait", "wait", "catch", "end", "leave"]);
    let end = &find(&events, "end")[0];
    assert_eq!(end.content.output, Some(json!("resumed")));
    assert_eq!(recovered.status(), ActivityStatus::Idle);
}
