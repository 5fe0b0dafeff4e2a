//! Boundary event behaviour
//!
//! A boundary event is attached to a host activity without owning it. At
//! root execution it:
//!
//! 1. listens for the host's `activity.leave` at priority 300 on the host broker
//! 2. shovels the host's `event` exchange into its own `attached-event`
//!    exchange with `mandatory` stripped
//! 3. listens on its own broker for the aggregated definition completion
//!    (`execute.bound.completed`), `execute.detach`, `execute.expect` and
//!    commands addressed to its execution
//!
//! and then runs its event definitions.
//!
//! Completion with `cancelActivity` discards the host and waits for it to
//! leave before completing. Without, the completion passes straight through.
//! If the host leaves first, the boundary discards itself. Compensate
//! boundaries stay armed after their host completed.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::activity::{Activity, ActivityDefinition, Behaviour, Command};
use crate::broker::{Broker, Content, ExchangeType, Message, Properties, ShovelSource, SubscribeOptions, Transform};
use crate::event_definitions::{EventDefinition, EventDefinitionExecution};
use crate::utils::Result;

const COMPLETED_ROUTING_KEY: &str = "execute.bound.completed";
const ATTACHED_EXCHANGE: &str = "attached-event";

/// Host-relocation settings received with `execute.detach`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Detachment {
    bind_exchange: String,
    source_exchange: String,
    source_pattern: String,
}

/// Per-execution state of an attached boundary event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Attachment {
    execution_id: String,
    /// Host `taken` counter when attached, to tell a completed host from a
    /// discarded one when it leaves.
    host_taken: u32,
    #[serde(default)]
    host_left: bool,
    /// Completion waiting for the cancelled host to leave.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    complete_content: Option<Content>,
    /// Consumers registered on the host broker.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attach_consumer_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detached: Option<Detachment>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BoundaryState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    definitions: Option<Value>,
}

fn leave_tag(execution_id: &str) -> String {
    format!("_bound-listener-{execution_id}")
}

fn completed_tag(execution_id: &str) -> String {
    format!("_bound-completed-{execution_id}")
}

fn detach_tag(execution_id: &str) -> String {
    format!("_bound-detach-{execution_id}")
}

fn detached_completed_tag(execution_id: &str) -> String {
    format!("_bound-detached-completed-{execution_id}")
}

fn expect_tag(execution_id: &str) -> String {
    format!("_bound-expect-{execution_id}")
}

fn api_tag(execution_id: &str) -> String {
    format!("_bound-api-{execution_id}")
}

fn attached_shovel(execution_id: &str) -> String {
    format!("_bound-attached-{execution_id}")
}

fn detached_shovel(execution_id: &str) -> String {
    format!("_bound-detached-{execution_id}")
}

/// Forwarded host events must never fail delivery on the boundary.
fn strip_mandatory() -> Transform {
    Rc::new(|message: &Message| {
        let mut forwarded = message.clone();
        forwarded.properties.mandatory = false;
        forwarded
    })
}

type OnMessage = fn(&Rc<BoundaryEventBehaviour>, &Activity, &Message) -> Result<()>;

struct Listener<'a> {
    broker: &'a Broker,
    exchange: &'a str,
    pattern: String,
    tag: String,
    priority: i32,
    once: bool,
}

impl<'a> Listener<'a> {
    fn new(broker: &'a Broker, exchange: &'a str, pattern: &str, tag: String) -> Self {
        Self {
            broker,
            exchange,
            pattern: pattern.to_string(),
            tag,
            priority: 0,
            once: false,
        }
    }

    fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

pub struct BoundaryEventBehaviour {
    execution: Rc<EventDefinitionExecution>,
    compensates: bool,
    attachment: RefCell<Option<Attachment>>,
}

impl BoundaryEventBehaviour {
    pub fn new(definition: &ActivityDefinition) -> Rc<Self> {
        Rc::new(Self {
            execution: EventDefinitionExecution::new(definition.event_definitions.clone(), COMPLETED_ROUTING_KEY),
            compensates: definition
                .event_definitions
                .iter()
                .any(|definition| matches!(definition, EventDefinition::Compensate)),
            attachment: RefCell::new(None),
        })
    }

    fn current_execution_id(&self) -> Option<String> {
        self.attachment
            .borrow()
            .as_ref()
            .map(|attachment| attachment.execution_id.clone())
    }

    fn update(&self, change: impl FnOnce(&mut Attachment)) {
        if let Some(attachment) = self.attachment.borrow_mut().as_mut() {
            change(attachment);
        }
    }

    /// Subscribe unless a consumer with the listener's tag already listens.
    fn listen(self: &Rc<Self>, activity: &Activity, listener: Listener<'_>, on_message: OnMessage) -> Result<()> {
        let broker = listener.broker;
        if broker.get_consumer(&listener.tag).is_some() {
            return Ok(());
        }
        let (behaviour, weak) = (Rc::clone(self), activity.downgrade());
        let handler = move |_: &str, message: &Message, _: &Broker| match weak.upgrade() {
            Some(activity) => on_message(&behaviour, &activity, message),
            None => Ok(()),
        };
        let options = SubscribeOptions::new()
            .consumer_tag(listener.tag)
            .priority(listener.priority)
            .no_ack();
        if listener.once {
            broker.subscribe_once(listener.exchange, &listener.pattern, handler, options)?;
        } else {
            broker.subscribe_tmp(listener.exchange, &listener.pattern, handler, options)?;
        }
        Ok(())
    }

    fn attach(self: &Rc<Self>, activity: &Activity, host: &Activity, execution_id: &str) -> Result<()> {
        let host_broker = host.broker();
        self.listen(
            activity,
            Listener::new(host_broker, "event", "activity.leave", leave_tag(execution_id)).priority(300),
            Self::on_attached_leave,
        )?;

        let shovel = attached_shovel(execution_id);
        if !host_broker.has_shovel(&shovel) {
            host_broker.create_shovel(
                &shovel,
                ShovelSource::new("event", "activity.#"),
                activity.broker(),
                ATTACHED_EXCHANGE,
                Some(strip_mandatory()),
            )?;
        }
        Ok(())
    }

    fn listen_own(self: &Rc<Self>, activity: &Activity, execution_id: &str) -> Result<()> {
        let broker = activity.broker();
        self.listen(
            activity,
            Listener::new(broker, "execution", COMPLETED_ROUTING_KEY, completed_tag(execution_id)).once(),
            Self::on_completed,
        )?;
        self.listen(
            activity,
            Listener::new(broker, "execution", "execute.detach", detach_tag(execution_id)).once(),
            Self::on_detach,
        )?;
        self.listen(
            activity,
            Listener::new(broker, "execution", "execute.expect", expect_tag(execution_id)),
            Self::on_expect,
        )
    }

    fn listen_api(self: &Rc<Self>, activity: &Activity, execution_id: &str) -> Result<()> {
        let pattern = format!("activity.*.{execution_id}");
        self.listen(
            activity,
            Listener::new(activity.broker(), "api", &pattern, api_tag(execution_id)),
            Self::on_api_message,
        )
    }

    fn listen_detached(
        self: &Rc<Self>,
        activity: &Activity,
        host: &Activity,
        execution_id: &str,
        detachment: &Detachment,
    ) -> Result<()> {
        let host_broker = host.broker();
        let shovel = detached_shovel(execution_id);
        if !host_broker.has_shovel(&shovel) && host_broker.has_exchange(&detachment.source_exchange) {
            host_broker.create_shovel(
                &shovel,
                ShovelSource::new(&detachment.source_exchange, &detachment.source_pattern),
                activity.broker(),
                &detachment.bind_exchange,
                Some(strip_mandatory()),
            )?;
        }
        self.listen(
            activity,
            Listener::new(activity.broker(), "execution", COMPLETED_ROUTING_KEY, detached_completed_tag(execution_id))
                .once(),
            Self::on_detached_completed,
        )
    }

    fn cancels_host(&self, activity: &Activity, content: &Content) -> bool {
        activity.definition().cancel_activity || content.cancel_activity == Some(true)
    }

    /// Aggregated definition completion while attached.
    fn on_completed(self: &Rc<Self>, activity: &Activity, message: &Message) -> Result<()> {
        let Some(host) = activity.attached_to() else {
            return Ok(());
        };
        let content = message.content.clone();
        let execution_id = content.execution_id().to_string();

        if !self.cancels_host(activity, &content) || !host.is_running() {
            return self.finish(activity, host, &execution_id, "execute.completed", content);
        }

        let broker = activity.broker();
        broker.cancel(&detach_tag(&execution_id));
        broker.cancel(&expect_tag(&execution_id));
        self.update(|attachment| attachment.complete_content = Some(content.clone()));

        let payload = serde_json::to_value(&content)?;
        if host.is_stopped() {
            // the host runs no listeners while stopped; discard once it resumes
            let tag = format!("_on-attached-execute-{execution_id}");
            let resumed = host.clone();
            host.broker().subscribe_once(
                "event",
                "activity.#",
                move |_, _, _| {
                    resumed.get_api(None).discard(Some(payload.clone()))?;
                    Ok(())
                },
                SubscribeOptions::new().consumer_tag(tag.clone()).no_ack(),
            )?;
            self.update(|attachment| attachment.attach_consumer_tags.push(tag));
            return Ok(());
        }

        debug!(
            activity = activity.id(),
            execution_id,
            host = host.id(),
            host_execution_id = ?host.execution_id(),
            "cancel host"
        );
        host.get_api(None).discard(Some(payload))?;
        Ok(())
    }

    fn on_attached_leave(self: &Rc<Self>, activity: &Activity, _message: &Message) -> Result<()> {
        let Some(host) = activity.attached_to() else {
            return Ok(());
        };
        let Some(attachment) = self.attachment.borrow().clone() else {
            return Ok(());
        };
        let execution_id = attachment.execution_id.clone();

        if let Some(content) = attachment.complete_content {
            return self.finish(activity, host, &execution_id, "execute.completed", content);
        }

        if self.compensates && host.counters().taken > attachment.host_taken {
            debug!(activity = activity.id(), execution_id, "host completed, compensation armed");
            self.release_host(activity, host, &execution_id);
            activity.broker().cancel(&detach_tag(&execution_id));
            activity.broker().cancel(&expect_tag(&execution_id));
            self.update(|attachment| attachment.host_left = true);
            return Ok(());
        }

        self.execution.discard_definitions(activity, &execution_id)?;
        let mut content = activity.content();
        content.is_root_scope = true;
        self.finish(activity, host, &execution_id, "execute.discard", content)
    }

    fn on_expect(self: &Rc<Self>, activity: &Activity, message: &Message) -> Result<()> {
        let Some(host) = activity.attached_to() else {
            return Ok(());
        };
        let content = &message.content;
        let (Some("error"), Some(expect_routing_key)) = (content.expect.as_deref(), content.expect_routing_key.clone())
        else {
            return Ok(());
        };

        let tag = format!("_bound-error-listener-{}", content.execution_id());
        if host.broker().get_consumer(&tag).is_some() {
            return Ok(());
        }
        let weak = activity.downgrade();
        host.broker().subscribe_once(
            "event",
            "activity.error",
            move |_, error, _| {
                let Some(activity) = weak.upgrade() else {
                    return Ok(());
                };
                activity.publish_execution(&expect_routing_key, error.content.clone(), Properties::default())?;
                Ok(())
            },
            SubscribeOptions::new()
                .consumer_tag(tag.clone())
                .priority(300)
                .no_ack(),
        )?;
        self.update(|attachment| attachment.attach_consumer_tags.push(tag));
        Ok(())
    }

    fn on_detach(self: &Rc<Self>, activity: &Activity, message: &Message) -> Result<()> {
        let Some(host) = activity.attached_to() else {
            return Ok(());
        };
        let Some(execution_id) = self.current_execution_id() else {
            return Ok(());
        };
        let content = &message.content;
        let setting = |name: &str, default: &str| {
            content
                .extra
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        let detachment = Detachment {
            bind_exchange: content.bind_exchange.clone().unwrap_or_else(|| "detached".to_string()),
            source_exchange: setting("sourceExchange", "execution"),
            source_pattern: setting("sourcePattern", "#"),
        };

        debug!(
            activity = activity.id(),
            execution_id,
            bind_exchange = %detachment.bind_exchange,
            "detach from host"
        );
        self.stop(activity, host, &execution_id, true);
        activity
            .broker()
            .assert_exchange(&detachment.bind_exchange, ExchangeType::Topic)?;
        self.update(|attachment| attachment.detached = Some(detachment.clone()));

        self.listen_detached(activity, host, &execution_id, &detachment)
    }

    fn on_detached_completed(self: &Rc<Self>, activity: &Activity, message: &Message) -> Result<()> {
        let Some(host) = activity.attached_to() else {
            return Ok(());
        };
        let content = message.content.clone();
        let execution_id = content.execution_id().to_string();
        if self.cancels_host(activity, &content) && host.is_running() && !host.is_stopped() {
            host.get_api(None).discard(Some(serde_json::to_value(&content)?))?;
        }
        self.finish(activity, host, &execution_id, "execute.completed", content)
    }

    fn on_api_message(self: &Rc<Self>, activity: &Activity, message: &Message) -> Result<()> {
        let Some(host) = activity.attached_to() else {
            return Ok(());
        };
        let Some(execution_id) = self.current_execution_id() else {
            return Ok(());
        };
        match Command::from_message(message) {
            Some(Command::Stop) => self.stop(activity, host, &execution_id, false),
            Some(Command::Discard(_)) => {
                self.stop(activity, host, &execution_id, false);
                self.attachment.borrow_mut().take();
            }
            _ => {}
        }
        Ok(())
    }

    fn release_host(&self, activity: &Activity, host: &Activity, execution_id: &str) {
        let host_broker = host.broker();
        host_broker.cancel(&leave_tag(execution_id));
        activity.broker().cancel(&leave_tag(execution_id));
        let tags = self
            .attachment
            .borrow_mut()
            .as_mut()
            .map(|attachment| std::mem::take(&mut attachment.attach_consumer_tags))
            .unwrap_or_default();
        for tag in tags {
            host_broker.cancel(&tag);
        }
        host_broker.close_shovel(&attached_shovel(execution_id));
    }

    /// Tear down every listener of the execution. Safe to repeat. While
    /// detaching, the attached-event shovel and the command listener stay.
    fn stop(&self, activity: &Activity, host: &Activity, execution_id: &str, detaching: bool) {
        let broker = activity.broker();
        let host_broker = host.broker();
        host_broker.cancel(&leave_tag(execution_id));
        broker.cancel(&leave_tag(execution_id));
        let tags = self
            .attachment
            .borrow_mut()
            .as_mut()
            .map(|attachment| std::mem::take(&mut attachment.attach_consumer_tags))
            .unwrap_or_default();
        for tag in tags {
            host_broker.cancel(&tag);
        }
        broker.cancel(&detach_tag(execution_id));
        broker.cancel(&completed_tag(execution_id));
        broker.cancel(&expect_tag(execution_id));

        if detaching {
            return;
        }
        host_broker.close_shovel(&attached_shovel(execution_id));
        host_broker.close_shovel(&detached_shovel(execution_id));
        broker.cancel(&detached_completed_tag(execution_id));
        broker.cancel(&api_tag(execution_id));
    }

    fn finish(&self, activity: &Activity, host: &Activity, execution_id: &str, routing_key: &str, content: Content) -> Result<()> {
        self.stop(activity, host, execution_id, false);
        self.attachment.borrow_mut().take();
        activity.publish_execution(routing_key, content, Properties::default())?;
        Ok(())
    }
}

impl Behaviour for BoundaryEventBehaviour {
    fn execute(self: Rc<Self>, activity: &Activity, message: &Message) -> Result<()> {
        let content = &message.content;
        if !content.is_root_scope {
            return self.execution.execute(activity, message);
        }
        let Some(host) = activity.attached_to() else {
            warn!(activity = activity.id(), "boundary event is not attached");
            activity.publish_execution("execute.discard", content.clone(), Properties::default())?;
            return Ok(());
        };

        let execution_id = content.execution_id().to_string();
        let attachment = {
            let mut current = self.attachment.borrow_mut();
            match current.as_ref() {
                Some(attachment) if attachment.execution_id == execution_id => attachment.clone(),
                _ => {
                    let fresh = Attachment {
                        execution_id: execution_id.clone(),
                        host_taken: host.counters().taken,
                        ..Attachment::default()
                    };
                    *current = Some(fresh.clone());
                    fresh
                }
            }
        };
        activity
            .broker()
            .assert_exchange(ATTACHED_EXCHANGE, ExchangeType::Topic)?;

        match &attachment.detached {
            Some(detachment) => self.listen_detached(activity, host, &execution_id, detachment)?,
            None => {
                if !attachment.host_left {
                    self.attach(activity, host, &execution_id)?;
                }
                if attachment.complete_content.is_none() {
                    self.listen_own(activity, &execution_id)?;
                }
            }
        }
        self.listen_api(activity, &execution_id)?;

        if let Some(content) = attachment.complete_content {
            if !host.is_running() {
                return self.finish(activity, host, &execution_id, "execute.completed", content);
            }
            return Ok(());
        }
        self.execution.execute(activity, message)
    }

    fn get_state(&self, _activity: &Activity) -> Option<Value> {
        let state = BoundaryState {
            attachment: self.attachment.borrow().clone(),
            definitions: self.execution.get_state(),
        };
        serde_json::to_value(state).ok()
    }

    fn recover(&self, _activity: &Activity, state: &Value) -> Result<()> {
        let state: BoundaryState = serde_json::from_value(state.clone())?;
        if let Some(definitions) = &state.definitions {
            self.execution.recover(definitions)?;
        }
        *self.attachment.borrow_mut() = state.attachment;
        Ok(())
    }
}
