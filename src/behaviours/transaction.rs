//! Transaction sub-process
//!
//! Runs its children inside one scope and watches their `event` exchanges:
//!
//! - children without inbound flow start with the transaction
//! - a child's `activity.end` starts the targets of its outbound flows
//! - boundary events start when their host enters
//! - the transaction completes once nothing but armed compensate boundaries
//!   is running; those are then discarded
//!
//! A delegated `cancel` or error throw, or a child error no error boundary
//! covers, aborts the transaction: running children are discarded and the
//! compensation activities of completed hosts run one at a time, latest
//! completion first. Only after the last one finished does the transaction
//! publish `execute.cancel` or `execute.error`.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::activity::{Activity, ActivityState, Behaviour, Command};
use crate::broker::{Content, Message, Properties, SubscribeOptions};
use crate::event_definitions::EventDefinition;
use crate::utils::Result;

/// Children and wiring of a transaction.
#[derive(Debug, Default)]
pub struct Transaction {
    children: Vec<Activity>,
    flows: Vec<(String, String)>,
    associations: Vec<(String, String)>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_child(mut self, child: &Activity) -> Self {
        self.children.push(child.clone());
        self
    }

    /// Unconditional sequence flow.
    pub fn with_flow(mut self, source: &str, target: &str) -> Self {
        self.flows.push((source.to_string(), target.to_string()));
        self
    }

    /// Associate a compensate boundary with its compensation activity.
    pub fn with_association(mut self, boundary: &str, compensation: &str) -> Self {
        self.associations
            .push((boundary.to_string(), compensation.to_string()));
        self
    }

    pub fn child(&self, id: &str) -> Option<&Activity> {
        self.children.iter().find(|child| child.id() == id)
    }

    pub fn children(&self) -> &[Activity] {
        &self.children
    }

    fn has_inbound(&self, id: &str) -> bool {
        self.flows.iter().any(|(_, target)| target == id)
    }

    fn outbound(&self, id: &str) -> Vec<String> {
        self.flows
            .iter()
            .filter(|(source, _)| source == id)
            .map(|(_, target)| target.clone())
            .collect()
    }

    fn boundaries_of(&self, host: &str) -> impl Iterator<Item = &Activity> {
        self.children
            .iter()
            .filter(move |child| child.definition().attached_to.as_deref() == Some(host))
    }

    fn is_compensate_boundary(&self, id: &str) -> bool {
        self.child(id).is_some_and(|child| {
            child.definition().attached_to.is_some()
                && child
                    .definition()
                    .event_definitions
                    .contains(&EventDefinition::Compensate)
        })
    }

    /// Whether a running error boundary catches errors of `host`.
    fn covers_error(&self, host: &str) -> bool {
        self.boundaries_of(host).any(|boundary| {
            boundary.is_running()
                && boundary
                    .definition()
                    .event_definitions
                    .iter()
                    .any(|definition| matches!(definition, EventDefinition::Error { .. }))
        })
    }

    /// Pending compensations for the completed hosts, latest completion first.
    fn compensations_for(&self, completed: &[String]) -> Vec<Compensation> {
        let mut compensations = Vec::new();
        for host in completed.iter().rev() {
            for boundary in self.boundaries_of(host) {
                if !boundary.is_running() || !self.is_compensate_boundary(boundary.id()) {
                    continue;
                }
                compensations.extend(
                    self.associations
                        .iter()
                        .filter(|(source, _)| source == boundary.id())
                        .map(|(boundary, activity)| Compensation {
                            boundary: boundary.clone(),
                            activity: activity.clone(),
                        }),
                );
            }
        }
        compensations
    }

    fn starters(&self) -> Vec<String> {
        self.children
            .iter()
            .filter(|child| {
                let definition = child.definition();
                definition.attached_to.is_none() && !definition.is_for_compensation && !self.has_inbound(child.id())
            })
            .map(|child| child.id().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Compensation {
    boundary: String,
    activity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Abort {
    Cancel,
    Error { error: Value },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionRun {
    execution_id: String,
    root: Content,
    running: BTreeSet<String>,
    /// Completed children in completion order.
    completed: Vec<String>,
    compensations: VecDeque<Compensation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current: Option<Compensation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    abort: Option<Abort>,
    finished: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TransactionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run: Option<TransactionRun>,
    #[serde(default)]
    children: BTreeMap<String, ActivityState>,
}

pub struct TransactionBehaviour {
    scope: Transaction,
    run: RefCell<Option<TransactionRun>>,
}

impl TransactionBehaviour {
    pub fn new(scope: Transaction) -> Rc<Self> {
        Rc::new(Self {
            scope,
            run: RefCell::new(None),
        })
    }

    pub fn scope(&self) -> &Transaction {
        &self.scope
    }

    fn child_tag(execution_id: &str) -> String {
        format!("_transaction-{execution_id}")
    }

    fn api_tag(execution_id: &str) -> String {
        format!("_transaction-api-{execution_id}")
    }

    fn execution_id(&self) -> Option<String> {
        self.run.borrow().as_ref().map(|run| run.execution_id.clone())
    }

    fn listen(self: &Rc<Self>, activity: &Activity, execution_id: &str) -> Result<()> {
        let tag = Self::child_tag(execution_id);
        for child in &self.scope.children {
            if child.broker().get_consumer(&tag).is_some() {
                continue;
            }
            let (behaviour, weak, child_id) = (Rc::downgrade(self), activity.downgrade(), child.id().to_string());
            child.broker().subscribe_tmp(
                "event",
                "activity.#",
                move |routing_key, message, _| match (behaviour.upgrade(), weak.upgrade()) {
                    (Some(behaviour), Some(activity)) => behaviour.on_child_event(&activity, &child_id, routing_key, message),
                    _ => Ok(()),
                },
                SubscribeOptions::new()
                    .consumer_tag(tag.clone())
                    .priority(100)
                    .no_ack(),
            )?;
        }

        let api_tag = Self::api_tag(execution_id);
        if activity.broker().get_consumer(&api_tag).is_none() {
            let (behaviour, weak) = (Rc::downgrade(self), activity.downgrade());
            activity.broker().subscribe_tmp(
                "api",
                &format!("activity.*.{execution_id}"),
                move |_, message, _| match (behaviour.upgrade(), weak.upgrade()) {
                    (Some(behaviour), Some(activity)) => behaviour.on_api_message(&activity, message),
                    _ => Ok(()),
                },
                SubscribeOptions::new().consumer_tag(api_tag).no_ack(),
            )?;
        }
        Ok(())
    }

    fn stop_listening(&self, activity: &Activity, execution_id: &str) {
        let tag = Self::child_tag(execution_id);
        for child in &self.scope.children {
            child.broker().cancel(&tag);
        }
        activity.broker().cancel(&Self::api_tag(execution_id));
    }

    fn start_child(&self, id: &str) -> Result<()> {
        let Some(child) = self.scope.child(id) else {
            return Ok(());
        };
        if child.is_running() {
            return Ok(());
        }
        let parent = {
            let mut run = self.run.borrow_mut();
            let Some(run) = run.as_mut() else {
                return Ok(());
            };
            run.running.insert(id.to_string());
            run.root.unshift_parent()
        };
        debug!(child = id, "start child");
        child.run(Some(Content {
            parent: Some(parent),
            ..Content::default()
        }))
    }

    fn discard_child(&self, id: &str) -> Result<()> {
        if let Some(child) = self.scope.child(id).filter(|child| child.is_running()) {
            child.get_api(None).discard(None)?;
        }
        Ok(())
    }

    fn on_child_event(&self, activity: &Activity, child_id: &str, routing_key: &str, message: &Message) -> Result<()> {
        if self.run.borrow().as_ref().is_none_or(|run| run.finished) {
            return Ok(());
        }
        match routing_key {
            "activity.enter" => {
                if self.is_aborting() {
                    return Ok(());
                }
                let boundaries: Vec<String> = self
                    .scope
                    .boundaries_of(child_id)
                    .map(|boundary| boundary.id().to_string())
                    .collect();
                for boundary in boundaries {
                    self.start_child(&boundary)?;
                }
                Ok(())
            }
            "activity.end" => self.on_child_end(child_id),
            "activity.leave" => self.on_child_leave(activity, child_id),
            "activity.throw" if message.properties.delegate => match message.properties.kind.as_deref() {
                Some("cancel") => self.abort(activity, Abort::Cancel, child_id),
                Some("throw") => {
                    let error = message.content.message.clone().unwrap_or(Value::Null);
                    self.abort(activity, Abort::Error { error }, child_id)
                }
                Some("compensate") => self.compensate(activity),
                _ => Ok(()),
            },
            "activity.error" if !self.scope.covers_error(child_id) => {
                let error = message.content.error.clone().unwrap_or(Value::Null);
                self.abort(activity, Abort::Error { error }, child_id)
            }
            _ => Ok(()),
        }
    }

    fn is_aborting(&self) -> bool {
        self.run.borrow().as_ref().is_some_and(|run| run.abort.is_some())
    }

    fn on_child_end(&self, child_id: &str) -> Result<()> {
        let Some(child) = self.scope.child(child_id) else {
            return Ok(());
        };
        let definition = child.definition();
        if definition.attached_to.is_none() && !definition.is_for_compensation {
            if let Some(run) = self.run.borrow_mut().as_mut() {
                run.completed.push(child_id.to_string());
            }
        }
        if self.is_aborting() {
            return Ok(());
        }
        for target in self.scope.outbound(child_id) {
            self.start_child(&target)?;
        }
        Ok(())
    }

    fn on_child_leave(&self, activity: &Activity, child_id: &str) -> Result<()> {
        let finished_compensation = {
            let mut run = self.run.borrow_mut();
            let Some(run) = run.as_mut() else {
                return Ok(());
            };
            run.running.remove(child_id);
            let is_current = run
                .current
                .as_ref()
                .is_some_and(|current| current.activity == child_id);
            if is_current { run.current.take() } else { None }
        };

        let Some(compensation) = finished_compensation else {
            return self.check_completed(activity);
        };
        debug!(
            activity = activity.id(),
            compensation = %compensation.activity,
            boundary = %compensation.boundary,
            "compensation finished"
        );
        if let Some(boundary) = self
            .scope
            .child(&compensation.boundary)
            .filter(|boundary| boundary.is_running())
        {
            boundary
                .get_api(None)
                .signal(json!({ "compensatedBy": compensation.activity }))?;
        }
        self.next_compensation(activity)
    }

    fn check_completed(&self, activity: &Activity) -> Result<()> {
        let (execution_id, armed, root) = {
            let mut run = self.run.borrow_mut();
            let Some(run) = run.as_mut() else {
                return Ok(());
            };
            if run.finished || run.abort.is_some() || run.current.is_some() || !run.compensations.is_empty() {
                return Ok(());
            }
            if run
                .running
                .iter()
                .any(|id| !self.scope.is_compensate_boundary(id))
            {
                return Ok(());
            }
            run.finished = true;
            let armed: Vec<String> = run.running.iter().cloned().collect();
            (run.execution_id.clone(), armed, run.root.clone())
        };

        debug!(activity = activity.id(), execution_id, "transaction completed");
        self.stop_listening(activity, &execution_id);
        for id in armed {
            self.discard_child(&id)?;
        }
        activity.publish_execution("execute.completed", root, Properties::default())?;
        Ok(())
    }

    fn abort(&self, activity: &Activity, abort: Abort, thrower: &str) -> Result<()> {
        let discard = {
            let mut run = self.run.borrow_mut();
            let Some(run) = run.as_mut() else {
                return Ok(());
            };
            if run.finished || run.abort.is_some() {
                return Ok(());
            }
            debug!(activity = activity.id(), thrower, abort = ?abort, "transaction aborted");
            run.abort = Some(abort);
            let compensations = self.scope.compensations_for(&run.completed);
            run.compensations.extend(compensations);
            run.running
                .iter()
                .filter(|id| id.as_str() != thrower && !self.scope.is_compensate_boundary(id))
                .cloned()
                .collect::<Vec<_>>()
        };

        for id in discard {
            self.discard_child(&id)?;
        }
        self.next_compensation(activity)
    }

    /// Compensate completed hosts without aborting.
    fn compensate(&self, activity: &Activity) -> Result<()> {
        let idle = {
            let mut run = self.run.borrow_mut();
            let Some(run) = run.as_mut() else {
                return Ok(());
            };
            let queued: Vec<Compensation> = self
                .scope
                .compensations_for(&run.completed)
                .into_iter()
                .filter(|compensation| {
                    !run.compensations.contains(compensation) && run.current.as_ref() != Some(compensation)
                })
                .collect();
            run.compensations.extend(queued);
            run.current.is_none()
        };
        if idle {
            return self.next_compensation(activity);
        }
        Ok(())
    }

    fn next_compensation(&self, activity: &Activity) -> Result<()> {
        let next = {
            let mut run = self.run.borrow_mut();
            let Some(run) = run.as_mut() else {
                return Ok(());
            };
            if run.current.is_some() {
                return Ok(());
            }
            let next = run.compensations.pop_front();
            run.current = next.clone();
            next
        };

        match next {
            Some(compensation) => {
                debug!(
                    activity = activity.id(),
                    compensation = %compensation.activity,
                    "run compensation"
                );
                self.start_child(&compensation.activity)
            }
            None if self.is_aborting() => self.finish_abort(activity),
            None => self.check_completed(activity),
        }
    }

    fn finish_abort(&self, activity: &Activity) -> Result<()> {
        let (execution_id, abort, armed, root) = {
            let mut run = self.run.borrow_mut();
            let Some(run) = run.as_mut() else {
                return Ok(());
            };
            let Some(abort) = run.abort.clone() else {
                return Ok(());
            };
            if run.finished {
                return Ok(());
            }
            run.finished = true;
            let armed: Vec<String> = run
                .running
                .iter()
                .filter(|id| self.scope.is_compensate_boundary(id))
                .cloned()
                .collect();
            (run.execution_id.clone(), abort, armed, run.root.clone())
        };

        self.stop_listening(activity, &execution_id);
        for id in armed {
            self.discard_child(&id)?;
        }

        let mut content = root;
        content.is_transaction = true;
        match abort {
            Abort::Cancel => {
                activity.publish_execution("execute.cancel", content, Properties::default())?;
            }
            Abort::Error { error } => {
                content.error = Some(error);
                activity.publish_execution("execute.error", content, Properties::default())?;
            }
        }
        Ok(())
    }

    fn on_api_message(&self, activity: &Activity, message: &Message) -> Result<()> {
        let Some(execution_id) = self.execution_id() else {
            return Ok(());
        };
        let running: Vec<String> = match self.run.borrow().as_ref() {
            Some(run) => run.running.iter().cloned().collect(),
            None => return Ok(()),
        };

        match Command::from_message(message) {
            Some(Command::Stop) => {
                self.stop_listening(activity, &execution_id);
                for child in self.running_children(&running) {
                    child.stop()?;
                }
            }
            Some(Command::Discard(_)) => {
                if let Some(run) = self.run.borrow_mut().as_mut() {
                    run.finished = true;
                }
                self.stop_listening(activity, &execution_id);
                for id in &running {
                    self.discard_child(id)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Running children in declaration order, hosts before their boundaries.
    fn running_children(&self, running: &[String]) -> Vec<Activity> {
        self.scope
            .children
            .iter()
            .filter(|child| running.iter().any(|id| id == child.id()))
            .cloned()
            .collect()
    }
}

impl Behaviour for TransactionBehaviour {
    fn execute(self: Rc<Self>, activity: &Activity, message: &Message) -> Result<()> {
        let content = &message.content;
        if !content.is_root_scope {
            return Ok(());
        }
        let execution_id = content.execution_id().to_string();
        let redelivered = message.fields.redelivered;

        let resumed = {
            let mut run = self.run.borrow_mut();
            let resumed = redelivered
                && run
                    .as_ref()
                    .is_some_and(|run| run.execution_id == execution_id && !run.finished);
            if !resumed {
                *run = Some(TransactionRun {
                    execution_id: execution_id.clone(),
                    root: content.clone(),
                    ..TransactionRun::default()
                });
            }
            resumed
        };
        self.listen(activity, &execution_id)?;

        if resumed {
            let running: Vec<String> = self
                .run
                .borrow()
                .as_ref()
                .map(|run| run.running.iter().cloned().collect())
                .unwrap_or_default();
            debug!(activity = activity.id(), execution_id, running = running.len(), "resume transaction");
            for child in self.running_children(&running) {
                child.resume()?;
            }
            return Ok(());
        }

        for id in self.scope.starters() {
            self.start_child(&id)?;
        }
        self.check_completed(activity)
    }

    fn get_state(&self, _activity: &Activity) -> Option<Value> {
        let state = TransactionState {
            run: self.run.borrow().clone(),
            children: self
                .scope
                .children
                .iter()
                .filter(|child| child.execution_id().is_some())
                .map(|child| (child.id().to_string(), child.get_state()))
                .collect(),
        };
        serde_json::to_value(state).ok()
    }

    fn recover(&self, _activity: &Activity, state: &Value) -> Result<()> {
        let state: TransactionState = serde_json::from_value(state.clone())?;
        for (id, child_state) in &state.children {
            if let Some(child) = self.scope.child(id) {
                child.recover(child_state)?;
            }
        }
        *self.run.borrow_mut() = state.run;
        Ok(())
    }
}
