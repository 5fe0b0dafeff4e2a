//! Signal event definition

use serde_json::Value;

use crate::activity::Activity;
use crate::broker::{Content, Message, Properties};
use crate::event_definitions::{
    complete, describe_reference, event_content, listen_for_commands, listen_for_signal, targets_execution, throw,
};
use crate::utils::Result;

/// Wait for a signal. Accepted are signals addressed to this execution or its
/// event, and delegated signals: any when no reference is configured, else
/// only those carrying the referenced signal id.
pub(crate) fn execute_catch(activity: &Activity, signal_ref: Option<&str>, message: &Message) -> Result<()> {
    let content = message.content.clone();
    let reference = signal_ref.map(str::to_string);

    listen_for_signal(
        activity,
        &content,
        move |signal, own| {
            if targets_execution(signal.routing_key(), own) {
                return true;
            }
            let id = signal
                .content
                .message
                .as_ref()
                .and_then(|payload| payload.get("id"))
                .and_then(Value::as_str);
            match &reference {
                Some(reference) => id == Some(reference.as_str()),
                None => signal.properties.delegate,
            }
        },
        catch,
    )?;
    listen_for_commands(activity, &content)?;

    let mut wait = event_content(&content, "wait");
    wait.expect = Some("signal".to_string());
    if let Some(signal_ref) = signal_ref {
        wait.message = Some(describe_reference(activity, Some(signal_ref)));
    }
    activity.publish_event("wait", wait, Properties::default())?;
    Ok(())
}

fn catch(activity: &Activity, content: &Content, payload: Option<Value>) -> Result<()> {
    let mut caught = event_content(content, "catch");
    caught.message = payload.clone();
    activity.publish_event("catch", caught, Properties::default())?;

    let mut completed = content.clone();
    completed.output = payload.clone();
    completed.message = payload;
    complete(activity, completed, "signal")
}

pub(crate) fn execute_throw(activity: &Activity, signal_ref: Option<&str>, message: &Message) -> Result<()> {
    let thrown = describe_reference(activity, signal_ref);
    throw(activity, &message.content, "signal", "signal", thrown)
}
