use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use tracing::{info, warn};

use popflow::activity::{Activity, ActivityDefinition, Context, Environment};
use popflow::behaviours::{BoundaryEventBehaviour, EventBehaviour, SignalTaskBehaviour, Transaction, TransactionBehaviour};
use popflow::broker::{Content, SubscribeOptions};
use popflow::config::{Settings, load_config};
use popflow::event_definitions::EventDefinition;
use popflow::persistence::SnapshotStore;
use popflow::utils::{Result, logging};

#[derive(Parser)]
#[command(name = "popflow", about = "Broker driven process activities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a booking transaction that is cancelled and compensated.
    Demo,
    /// Run the booking transaction to its confirmation step and store it.
    Snapshot {
        #[arg(long)]
        key: String,
    },
    /// Recover a stored booking and finish it.
    Resume {
        #[arg(long)]
        key: String,
        #[arg(long, value_enum)]
        answer: Answer,
    },
    /// Let a timer boundary interrupt a waiting task.
    Timer {
        #[arg(long, default_value_t = 1)]
        seconds: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Answer {
    Continue,
    Cancel,
    Fail,
}

/// Booking transaction: `book` then `confirm`. Confirmation can be
/// cancelled through the `cancel-requested` signal boundary, which leads to
/// a cancel end event. A completed booking is compensated by `undo-book`.
struct Booking {
    transaction: Activity,
    book: Activity,
    confirm: Activity,
    cancel_requested: Activity,
    undo_book: Activity,
    children: Vec<Activity>,
}

impl Booking {
    fn new(context: &Context) -> Result<Self> {
        let book = task(context, ActivityDefinition::new("book", "bpmn:Task"))?;
        let undo_bound = boundary(context, "undo-book-bound", &book, EventDefinition::Compensate)?;
        let undo_book = task(context, ActivityDefinition::new("undo-book", "bpmn:Task").for_compensation())?;
        let confirm = task(context, ActivityDefinition::new("confirm", "bpmn:Task"))?;
        let cancel_requested = boundary(context, "cancel-requested", &confirm, EventDefinition::signal(None))?;

        let cancelled = ActivityDefinition::new("cancelled", "bpmn:EndEvent")
            .throwing()
            .with_event_definition(EventDefinition::Cancel);
        let cancelled_behaviour = EventBehaviour::new(&cancelled);
        let cancelled = Activity::new(cancelled, context, cancelled_behaviour)?;

        let children = vec![
            book.clone(),
            undo_bound,
            undo_book.clone(),
            confirm.clone(),
            cancel_requested.clone(),
            cancelled,
        ];
        let scope = children
            .iter()
            .fold(Transaction::new(), |scope, child| scope.with_child(child))
            .with_flow("book", "confirm")
            .with_flow("cancel-requested", "cancelled")
            .with_association("undo-book-bound", "undo-book");
        let transaction = Activity::new(
            ActivityDefinition::new("booking", "bpmn:Transaction"),
            context,
            TransactionBehaviour::new(scope),
        )?;

        Ok(Self {
            transaction,
            book,
            confirm,
            cancel_requested,
            undo_book,
            children,
        })
    }

    fn trace(&self) -> Result<()> {
        trace(&self.transaction)?;
        for child in &self.children {
            trace(child)?;
        }
        Ok(())
    }

    fn answer(&self, answer: Answer) -> Result<()> {
        match answer {
            Answer::Continue => {
                self.confirm.get_api(None).signal(json!({ "confirmed": true }))?;
            }
            Answer::Cancel => {
                self.cancel_requested.get_api(None).signal(json!("customer cancelled"))?;
                self.undo_book.get_api(None).signal(json!("refunded"))?;
            }
            Answer::Fail => {
                self.confirm
                    .get_api(None)
                    .error(json!({ "message": "confirmation failed", "code": "E_CONFIRM" }))?;
                self.undo_book.get_api(None).signal(json!("refunded"))?;
            }
        }
        Ok(())
    }
}

fn task(context: &Context, definition: ActivityDefinition) -> Result<Activity> {
    Activity::new(definition, context, SignalTaskBehaviour::new(None))
}

fn boundary(context: &Context, id: &str, host: &Activity, definition: EventDefinition) -> Result<Activity> {
    let definition = ActivityDefinition::new(id, "bpmn:BoundaryEvent")
        .cancel_activity(true)
        .with_event_definition(definition);
    let behaviour = BoundaryEventBehaviour::new(&definition);
    Activity::new_attached(definition, context, host, behaviour)
}

/// Print every lifecycle event of `activity`.
fn trace(activity: &Activity) -> Result<()> {
    let id = activity.id().to_string();
    activity.broker().subscribe_tmp(
        "event",
        "activity.#",
        move |routing_key, message, _| {
            let phase = routing_key.trim_start_matches("activity.");
            match message.content.output.as_ref() {
                Some(output) => println!("{id:>18}  {phase:<8} {output}"),
                None => println!("{id:>18}  {phase}"),
            }
            Ok(())
        },
        SubscribeOptions::new()
            .consumer_tag(format!("_cli-trace-{}", activity.id()))
            .no_ack()
            .priority(1000),
    )?;
    Ok(())
}

fn context(settings: &Settings) -> Context {
    Context::new(Environment::default(), settings.engine.clone())
}

fn demo(settings: &Settings) -> Result<()> {
    let booking = Booking::new(&context(settings))?;
    booking.trace()?;

    booking.transaction.run(None)?;
    booking.book.get_api(None).signal(json!({ "room": 101 }))?;
    booking.answer(Answer::Cancel)?;

    info!(counters = ?booking.transaction.counters(), "demo finished");
    Ok(())
}

fn snapshot(settings: &Settings, key: &str) -> Result<()> {
    let booking = Booking::new(&context(settings))?;
    booking.trace()?;

    booking.transaction.run(None)?;
    booking.book.get_api(None).signal(json!({ "room": 101 }))?;
    booking.transaction.stop()?;

    let store = SnapshotStore::from_settings(&settings.persistence)?;
    let stored = store.save(key, &booking.transaction.get_state())?;
    info!(key, saved_at = stored.saved_at, "booking stored");
    Ok(())
}

fn resume(settings: &Settings, key: &str, answer: Answer) -> Result<()> {
    let store = SnapshotStore::from_settings(&settings.persistence)?;
    let Some(stored) = store.load_latest(key)? else {
        warn!(key, "no snapshot stored");
        return Ok(());
    };

    let booking = Booking::new(&context(settings))?;
    booking.trace()?;
    booking.transaction.recover(&stored.state)?;
    booking.transaction.resume()?;
    booking.answer(answer)?;

    if !booking.transaction.is_running() {
        store.remove(key)?;
    }
    info!(key, counters = ?booking.transaction.counters(), "booking resumed");
    Ok(())
}

/// Acts as the external scheduler: the timer boundary announces its
/// timeout and is signalled once it has elapsed.
async fn timer(settings: &Settings, seconds: u64) -> Result<()> {
    let context = context(settings);
    let payment = task(&context, ActivityDefinition::new("await-payment", "bpmn:Task"))?;
    let timeout = boundary(
        &context,
        "payment-timeout",
        &payment,
        EventDefinition::timer(&format!("PT{seconds}S")),
    )?;
    trace(&payment)?;
    trace(&timeout)?;

    let scheduled: Rc<RefCell<Option<Content>>> = Rc::default();
    let slot = scheduled.clone();
    timeout.broker().subscribe_tmp(
        "event",
        "activity.timer",
        move |_, message, _| {
            slot.borrow_mut().replace(message.content.clone());
            Ok(())
        },
        SubscribeOptions::new().consumer_tag("_cli-scheduler").no_ack(),
    )?;

    payment.run(None)?;
    timeout.run(None)?;

    let Some(content) = scheduled.borrow_mut().take() else {
        warn!("timer was never scheduled");
        return Ok(());
    };
    let millis = content.extra.get("timeout").and_then(Value::as_u64).unwrap_or_default();
    tokio::time::sleep(Duration::from_millis(millis)).await;

    timeout.get_api(Some(content)).signal(json!({ "elapsedMs": millis }))?;
    info!(payment = ?payment.counters(), "timer finished");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let settings = load_config()?;
    logging::init(&settings.logging.level);

    match Cli::parse().command {
        Commands::Demo => demo(&settings),
        Commands::Snapshot { key } => snapshot(&settings, &key),
        Commands::Resume { key, answer } => resume(&settings, &key, answer),
        Commands::Timer { seconds } => timer(&settings, seconds).await,
    }
}
