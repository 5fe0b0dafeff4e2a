//! Cancel event definition
//!
//! A catching cancel event is attached to a transaction and completes when
//! the transaction announces `activity.cancel`. The announcement reaches the
//! boundary through its `attached-event` exchange.

use serde_json::json;

use crate::activity::Activity;
use crate::broker::{Message, Properties, SubscribeOptions};
use crate::event_definitions::{complete, event_content, listen_for_commands, throw};
use crate::utils::Result;

pub(crate) fn execute_catch(activity: &Activity, message: &Message) -> Result<()> {
    let content = message.content.clone();
    let execution_id = content.execution_id().to_string();
    let broker = activity.broker();

    let host = activity
        .attached_to()
        .filter(|_| broker.has_exchange("attached-event"));
    if let Some(host) = host {
        let host_id = host.id().to_string();
        let weak = activity.downgrade();
        let own = content.clone();
        broker.subscribe_tmp(
            "attached-event",
            "activity.cancel",
            move |_, cancelled, _| {
                let Some(activity) = weak.upgrade() else {
                    return Ok(());
                };
                if cancelled.content.id.as_deref() != Some(host_id.as_str()) {
                    return Ok(());
                }

                let mut caught = event_content(&own, "catch");
                caught.is_transaction = cancelled.content.is_transaction;
                activity.publish_event("catch", caught, Properties::default())?;

                let mut completed = own.clone();
                completed.cancel_activity = Some(true);
                completed.is_transaction = cancelled.content.is_transaction;
                completed.output = cancelled.content.message.clone();
                complete(&activity, completed, "cancel")
            },
            SubscribeOptions::new()
                .consumer_tag(format!("_oncancel-{execution_id}"))
                .no_ack()
                .priority(300),
        )?;
    }
    listen_for_commands(activity, &content)?;

    let mut wait = event_content(&content, "wait");
    wait.expect = Some("cancel".to_string());
    activity.publish_event("wait", wait, Properties::default())?;
    Ok(())
}

pub(crate) fn execute_throw(activity: &Activity, message: &Message) -> Result<()> {
    throw(activity, &message.content, "throw", "cancel", json!({ "id": activity.id() }))
}
