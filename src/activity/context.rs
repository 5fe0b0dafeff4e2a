//! Collaborators an activity consumes from its surroundings: an environment
//! with variables, a lookup of referenced elements and the engine settings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::EngineSettings;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub variables: Map<String, Value>,
}

impl Environment {
    pub fn new(variables: Map<String, Value>) -> Self {
        Self { variables }
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    /// Expand `${environment.variables.<name>}` placeholders. Unknown
    /// variables expand to nothing.
    pub fn resolve_expression(&self, template: &str) -> String {
        let mut resolved = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            let Some(length) = rest[start..].find('}') else {
                break;
            };
            resolved.push_str(&rest[..start]);
            let path = rest[start + 2..start + length].trim();
            if let Some(value) = self.lookup(path) {
                match value {
                    Value::String(text) => resolved.push_str(text),
                    Value::Null => {}
                    other => resolved.push_str(&other.to_string()),
                }
            }
            rest = &rest[start + length + 1..];
        }
        resolved.push_str(rest);
        resolved
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let name = path.strip_prefix("environment.variables.")?;
        let mut segments = name.split('.');
        let mut value = self.variables.get(segments.next()?)?;
        for segment in segments {
            value = value.get(segment)?;
        }
        Some(value)
    }
}

/// Referenced element such as a `bpmn:Error` or `bpmn:Signal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementRef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Error code, possibly an environment expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ElementRef {
    pub fn error(id: &str, name: &str, code: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            kind: "bpmn:Error".to_string(),
            name: Some(name.to_string()),
            code: code.map(str::to_string),
        }
    }

    pub fn signal(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: "bpmn:Signal".to_string(),
            name: Some(name.to_string()),
            code: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    pub environment: Environment,
    pub settings: EngineSettings,
    elements: HashMap<String, ElementRef>,
}

impl Context {
    pub fn new(environment: Environment, settings: EngineSettings) -> Self {
        Self {
            environment,
            settings,
            elements: HashMap::new(),
        }
    }

    pub fn with_element(mut self, element: ElementRef) -> Self {
        self.elements.insert(element.id.clone(), element);
        self
    }

    pub fn get_activity_by_id(&self, id: &str) -> Option<&ElementRef> {
        self.elements.get(id)
    }
}
