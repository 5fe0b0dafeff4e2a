//! Compensate event definition
//!
//! The catching definition sits on a compensate boundary. It stays armed
//! after the host completes and finishes when the transaction signals it,
//! once the associated compensation activity is done.

use serde_json::{Value, json};

use crate::activity::Activity;
use crate::broker::{Content, Message, Properties};
use crate::event_definitions::{
    complete, event_content, listen_for_commands, listen_for_signal, targets_execution, throw,
};
use crate::utils::Result;

pub(crate) fn execute_catch(activity: &Activity, message: &Message) -> Result<()> {
    let content = message.content.clone();

    listen_for_signal(
        activity,
        &content,
        |signal, own| targets_execution(signal.routing_key(), own),
        compensated,
    )?;
    listen_for_commands(activity, &content)?;

    let mut wait = event_content(&content, "wait");
    wait.expect = Some("compensate".to_string());
    activity.publish_event("wait", wait, Properties::default())?;
    Ok(())
}

fn compensated(activity: &Activity, content: &Content, payload: Option<Value>) -> Result<()> {
    let mut completed = content.clone();
    completed.output = payload;
    complete(activity, completed, "compensate")
}

pub(crate) fn execute_throw(activity: &Activity, message: &Message) -> Result<()> {
    throw(activity, &message.content, "throw", "compensate", json!({ "id": activity.id() }))
}
