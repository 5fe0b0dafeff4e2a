use crate::behaviours::LoopCharacteristics;
use crate::event_definitions::EventDefinition;

/// Static description of a process element, as produced by a definition
/// parser.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityDefinition {
    pub id: String,
    /// Element type, e.g. `bpmn:BoundaryEvent`.
    pub kind: String,
    pub name: Option<String>,
    /// Host activity id of a boundary event.
    pub attached_to: Option<String>,
    pub cancel_activity: bool,
    pub is_for_compensation: bool,
    pub is_throwing: bool,
    pub event_definitions: Vec<EventDefinition>,
    pub loop_characteristics: Option<LoopCharacteristics>,
}

impl ActivityDefinition {
    pub fn new(id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            name: None,
            attached_to: None,
            cancel_activity: true,
            is_for_compensation: false,
            is_throwing: false,
            event_definitions: Vec::new(),
            loop_characteristics: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn attached_to(mut self, host: &str) -> Self {
        self.attached_to = Some(host.to_string());
        self
    }

    pub fn cancel_activity(mut self, cancel_activity: bool) -> Self {
        self.cancel_activity = cancel_activity;
        self
    }

    pub fn for_compensation(mut self) -> Self {
        self.is_for_compensation = true;
        self
    }

    pub fn throwing(mut self) -> Self {
        self.is_throwing = true;
        self
    }

    pub fn with_event_definition(mut self, definition: EventDefinition) -> Self {
        self.event_definitions.push(definition);
        self
    }

    pub fn with_loop(mut self, characteristics: LoopCharacteristics) -> Self {
        self.loop_characteristics = Some(characteristics);
        self
    }
}
