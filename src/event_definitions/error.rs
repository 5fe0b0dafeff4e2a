//! Error event definition
//!
//! Catching: accepts a delegated throw on `activity.throw.#` and, when the
//! event is attached to a host, the host's own error forwarded through the
//! `execute.expect` protocol. Throws are retained in a durable queue declared
//! with the event, so one published before the definition runs is caught as
//! soon as it does. A configured reference only accepts errors with
//! the same id, or the same code when the reference declares one.
//!
//! Throwing: publishes a delegated `activity.throw` describing the referenced
//! error and completes.

use serde_json::Value;

use crate::activity::Activity;
use crate::broker::{Broker, Content, Message, Properties, QueueOptions, Source, SubscribeOptions};
use crate::event_definitions::{describe_reference, event_content, listen_for_commands, stop_listeners, throw};
use crate::utils::Result;

#[derive(Debug, Clone, PartialEq)]
struct ExpectedError {
    id: String,
    code: Option<String>,
}

impl ExpectedError {
    fn resolve(activity: &Activity, id: &str) -> Self {
        let code = activity
            .context()
            .get_activity_by_id(id)
            .and_then(|element| element.code.as_deref())
            .map(|code| activity.context().environment.resolve_expression(code));
        Self {
            id: id.to_string(),
            code,
        }
    }

    fn accepts(expected: Option<&Self>, error: &Value) -> bool {
        let Some(expected) = expected else {
            return true;
        };
        if error.get("id").and_then(Value::as_str) == Some(expected.id.as_str()) {
            return true;
        }
        match (&expected.code, error.get("code").and_then(Value::as_str)) {
            (Some(code), Some(thrown)) => code == thrown,
            _ => false,
        }
    }
}

/// Queue retaining delegated throws for the catching definition at `index`.
pub(crate) fn throw_queue(index: usize) -> String {
    format!("throw-{index}-q")
}

pub(crate) fn setup_catch(broker: &Broker, index: usize) -> Result<()> {
    let queue = throw_queue(index);
    broker.assert_queue(&queue, QueueOptions::default());
    broker.bind_queue(&queue, "api", "activity.throw.#", 300)
}

pub(crate) fn execute_catch(activity: &Activity, error_ref: Option<&str>, message: &Message) -> Result<()> {
    let content = message.content.clone();
    let execution_id = content.execution_id().to_string();
    let broker = activity.broker();
    let expected = error_ref.map(|id| ExpectedError::resolve(activity, id));

    if activity.attached_to().is_some() {
        let expect_routing_key = format!("execute.throw.{execution_id}");
        let weak = activity.downgrade();
        let (catching, expecting) = (content.clone(), expected.clone());
        broker.subscribe_once(
            "execution",
            &expect_routing_key,
            move |_, thrown, _| {
                let Some(activity) = weak.upgrade() else {
                    return Ok(());
                };
                let error = thrown
                    .content
                    .error
                    .clone()
                    .or_else(|| thrown.content.message.clone())
                    .unwrap_or(Value::Null);
                if !ExpectedError::accepts(expecting.as_ref(), &error) {
                    return Ok(());
                }
                catch(&activity, &catching, error, Source::from_content(&thrown.content))
            },
            SubscribeOptions::new().consumer_tag(format!("_onerror-{execution_id}")),
        )?;

        let mut expect = content.clone();
        expect.expect_routing_key = Some(expect_routing_key);
        expect.expect = Some("error".to_string());
        activity.publish_execution("execute.expect", expect, Properties::default())?;
    }

    listen_for_commands(activity, &content)?;
    activity.publish_event("wait", event_content(&content, "wait"), Properties::default())?;

    // drains throws published before the definition ran
    let weak = activity.downgrade();
    let (catching, expecting) = (content.clone(), expected);
    let queue = throw_queue(message.content.index.unwrap_or_default());
    broker.consume(
        &queue,
        move |_, thrown, _| {
            let Some(activity) = weak.upgrade() else {
                return Ok(());
            };
            let error = thrown
                .content
                .message
                .clone()
                .or_else(|| thrown.content.error.clone())
                .unwrap_or(Value::Null);
            if !ExpectedError::accepts(expecting.as_ref(), &error) {
                return Ok(());
            }
            let source = thrown
                .content
                .source
                .clone()
                .unwrap_or_else(|| Source::from_content(&thrown.content));
            catch(&activity, &catching, error, source)
        },
        SubscribeOptions::new()
            .consumer_tag(format!("_onthrow-{execution_id}"))
            .no_ack(),
    )?;
    Ok(())
}

fn catch(activity: &Activity, content: &Content, error: Value, source: Source) -> Result<()> {
    stop_listeners(activity.broker(), content.execution_id());

    let mut caught = event_content(content, "catch");
    caught.source = Some(source.clone());
    caught.error = Some(error.clone());
    activity.publish_event("catch", caught, Properties::default())?;

    let mut completed = content.clone();
    completed.output = Some(error.clone());
    completed.error = Some(error);
    completed.source = Some(source);
    completed.state = Some("catch".to_string());
    completed.cancel_activity = Some(true);
    activity.publish_execution("execute.completed", completed, Properties::default())?;
    Ok(())
}

pub(crate) fn execute_throw(activity: &Activity, error_ref: Option<&str>, message: &Message) -> Result<()> {
    let thrown = describe_reference(activity, error_ref);
    throw(activity, &message.content, "throw", "throw", thrown)
}
