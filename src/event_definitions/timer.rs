//! Timer event definition
//!
//! There is no clock in the engine. The definition announces itself with an
//! `activity.timer` event carrying its own execution id, and an external
//! scheduler sends `signal` to that execution once the time is up.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::Value;

use crate::activity::{Activity, Command};
use crate::broker::{Message, Properties, SubscribeOptions};
use crate::event_definitions::{complete, on_lifecycle_command};
use crate::utils::Result;

/// Parse an ISO 8601 time duration such as `PT30S`, `PT1M30S` or `P1DT2H`.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let rest = text.trim().strip_prefix('P')?;
    let (date, time) = match rest.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };

    const DATE_UNITS: &[(char, f64)] = &[('W', 604_800.0), ('D', 86_400.0)];
    const TIME_UNITS: &[(char, f64)] = &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)];

    let mut seconds = 0.0_f64;
    let mut matched = false;
    for (part, units) in [(date, DATE_UNITS), (time.unwrap_or_default(), TIME_UNITS)] {
        let mut number = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
                continue;
            }
            let (_, factor) = units.iter().find(|(unit, _)| *unit == c)?;
            let value: f64 = number.parse().ok()?;
            seconds += value * factor;
            number.clear();
            matched = true;
        }
        if !number.is_empty() {
            return None;
        }
    }

    matched.then(|| Duration::from_secs_f64(seconds))
}

pub(crate) fn execute(activity: &Activity, time_duration: Option<&str>, message: &Message) -> Result<()> {
    let content = message.content.clone();
    let execution_id = content.execution_id().to_string();

    let weak = activity.downgrade();
    let own = content.clone();
    activity.broker().subscribe_tmp(
        "api",
        &format!("activity.*.{execution_id}"),
        move |_, command, _| {
            let Some(activity) = weak.upgrade() else {
                return Ok(());
            };
            if let Some(Command::Signal(payload)) = Command::from_message(command) {
                let mut completed = own.clone();
                completed.output = payload;
                return complete(&activity, completed, "timeout");
            }
            on_lifecycle_command(&activity, &own, command).map(|_| ())
        },
        SubscribeOptions::new()
            .consumer_tag(format!("_api-{execution_id}"))
            .no_ack(),
    )?;

    let mut timer = content.with_state("timer");
    if let Some(time_duration) = time_duration {
        let resolved = activity.context().environment.resolve_expression(time_duration);
        if let Some(timeout) = parse_duration(&resolved) {
            if let Some(expire_at) = TimeDelta::from_std(timeout)
                .ok()
                .and_then(|delta| Utc::now().checked_add_signed(delta))
            {
                timer
                    .extra
                    .insert("expireAt".into(), Value::String(expire_at.to_rfc3339()));
            }
            timer
                .extra
                .insert("timeout".into(), Value::from(timeout.as_millis() as u64));
        }
        timer
            .extra
            .insert("timeDuration".into(), Value::String(resolved));
    }
    activity.publish_event("timer", timer, Properties::default())?;
    Ok(())
}
