//! UI elements attached to the viewer and the callbacks their events drive.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::envelope::UiEvent;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "element", rename_all = "snake_case")]
pub enum ElementKind {
    Slider {
        min: f64,
        max: f64,
        step: f64,
        value: f64,
        desc: String,
        unit: String,
    },
    Label {
        desc: String,
    },
    Button {
        desc: String,
    },
    Select {
        desc: String,
        options: Vec<String>,
        value: usize,
    },
    Checkbox {
        desc: String,
        options: Vec<String>,
        checked: Vec<bool>,
    },
    /// `checked` holds one flag per option, at most one of them set.
    Radio {
        desc: String,
        options: Vec<String>,
        checked: Vec<bool>,
    },
}

impl ElementKind {
    pub fn slider(desc: impl Into<String>, min: f64, max: f64, step: f64, value: f64) -> Self {
        Self::Slider {
            min,
            max,
            step,
            value,
            desc: desc.into(),
            unit: String::new(),
        }
    }

    pub fn label(desc: impl Into<String>) -> Self {
        Self::Label { desc: desc.into() }
    }

    pub fn button(desc: impl Into<String>) -> Self {
        Self::Button { desc: desc.into() }
    }

    pub fn radio(desc: impl Into<String>, options: Vec<String>, checked: usize) -> Self {
        Self::Radio {
            desc: desc.into(),
            checked: one_hot(options.len(), checked),
            options,
        }
    }

    /// Folds a value reported by the viewer into the element's state.
    /// Returns false if the value has the wrong shape for this kind.
    pub fn apply(&mut self, value: &Value) -> bool {
        match self {
            Self::Slider {
                value: current,
                min,
                max,
                ..
            } => match value.as_f64() {
                Some(raw) => {
                    *current = raw.max(*min).min(*max);
                    true
                }
                None => false,
            },
            Self::Label { .. } | Self::Button { .. } => true,
            Self::Select {
                value: current,
                options,
                ..
            } => match value.as_u64().map(|index| index as usize) {
                Some(index) if index < options.len() => {
                    *current = index;
                    true
                }
                _ => false,
            },
            Self::Checkbox { checked, .. } => {
                let Some(flags) = value.as_array() else {
                    return false;
                };
                let parsed: Option<Vec<bool>> = flags.iter().map(Value::as_bool).collect();
                match parsed {
                    Some(parsed) if parsed.len() == checked.len() => {
                        *checked = parsed;
                        true
                    }
                    _ => false,
                }
            }
            Self::Radio {
                checked, options, ..
            } => match value.as_u64().map(|index| index as usize) {
                Some(index) if index < options.len() => {
                    *checked = one_hot(options.len(), index);
                    true
                }
                _ => false,
            },
        }
    }
}

fn one_hot(len: usize, index: usize) -> Vec<bool> {
    (0..len).map(|position| position == index).collect()
}

/// Wire form of an element: `{"element": kind, "id": id, ...fields}`.
#[derive(Serialize)]
struct Descriptor<'a> {
    id: &'a str,
    #[serde(flatten)]
    kind: &'a ElementKind,
}

pub type ElementCallback = Box<dyn FnMut(&ElementKind, &Value) + Send>;

pub struct Element {
    pub id: String,
    pub kind: ElementKind,
    callback: Option<ElementCallback>,
    changed: bool,
}

impl Element {
    pub fn descriptor(&self) -> Value {
        serde_json::to_value(Descriptor {
            id: &self.id,
            kind: &self.kind,
        })
        .unwrap_or(Value::Null)
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("has_callback", &self.callback.is_some())
            .field("changed", &self.changed)
            .finish()
    }
}

/// Elements keyed by the id the viewer reports back in event frames.
#[derive(Default)]
pub struct ElementRegistry {
    elements: Vec<Element>,
    index: HashMap<String, usize>,
    next_id: u64,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an element and returns its id.
    pub fn add(&mut self, kind: ElementKind, callback: Option<ElementCallback>) -> String {
        let id = self.next_id.to_string();
        self.next_id += 1;
        self.index.insert(id.clone(), self.elements.len());
        self.elements.push(Element {
            id: id.clone(),
            kind,
            callback,
            changed: false,
        });
        id
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.index.get(id).map(|&slot| &self.elements[slot])
    }

    /// Routes one viewer event to its element. Unknown ids are logged and
    /// ignored.
    pub fn dispatch(&mut self, event: &UiEvent) -> bool {
        let Some(&slot) = self.index.get(&event.element_id) else {
            debug!("event for unknown element '{}' ignored", event.element_id);
            return false;
        };
        let element = &mut self.elements[slot];
        if !element.kind.apply(&event.value) {
            warn!(
                "element '{}' rejected value {}",
                element.id, event.value
            );
            return false;
        }
        if let Some(callback) = element.callback.as_mut() {
            callback(&element.kind, &event.value);
        }
        true
    }

    /// Edits an element from the control side; the change is sent to the
    /// viewer on the next network phase.
    pub fn update(&mut self, id: &str, edit: impl FnOnce(&mut ElementKind)) -> bool {
        let Some(&slot) = self.index.get(id) else {
            return false;
        };
        let element = &mut self.elements[slot];
        edit(&mut element.kind);
        element.changed = true;
        true
    }

    /// Descriptors of every element edited since the last call.
    pub fn take_changed(&mut self) -> Vec<Value> {
        self.elements
            .iter_mut()
            .filter(|element| element.changed)
            .map(|element| {
                element.changed = false;
                element.descriptor()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn clear(&mut self) {
        self.elements.clear();
        self.index.clear();
        self.next_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn event(id: &str, value: Value) -> UiEvent {
        UiEvent {
            element_id: id.into(),
            value,
        }
    }

    #[test]
    fn descriptor_carries_kind_and_id() {
        let mut registry = ElementRegistry::new();
        let id = registry.add(ElementKind::slider("gain", 0.0, 2.0, 0.1, 1.0), None);
        assert_eq!(id, "0");
        assert_eq!(
            registry.get(&id).unwrap().descriptor(),
            json!({
                "element": "slider",
                "id": "0",
                "min": 0.0,
                "max": 2.0,
                "step": 0.1,
                "value": 1.0,
                "desc": "gain",
                "unit": ""
            })
        );
    }

    #[test]
    fn dispatch_updates_state_then_runs_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut registry = ElementRegistry::new();
        let id = registry.add(
            ElementKind::slider("speed", 0.0, 1.0, 0.01, 0.0),
            Some(Box::new(move |kind: &ElementKind, _: &Value| {
                if let ElementKind::Slider { value, .. } = kind {
                    sink.lock().unwrap().push(*value);
                }
            })),
        );
        assert!(registry.dispatch(&event(&id, json!(0.25))));
        assert!(registry.dispatch(&event(&id, json!(7.0))));
        assert_eq!(*seen.lock().unwrap(), vec![0.25, 1.0]);
    }

    #[test]
    fn unknown_or_malformed_events_are_not_fatal() {
        let mut registry = ElementRegistry::new();
        let id = registry.add(
            ElementKind::Checkbox {
                desc: "flags".into(),
                options: vec!["a".into(), "b".into()],
                checked: vec![false, false],
            },
            None,
        );
        assert!(!registry.dispatch(&event("42", json!(true))));
        assert!(!registry.dispatch(&event(&id, json!([true]))));
        assert!(registry.dispatch(&event(&id, json!([true, false]))));
        let ElementKind::Checkbox { checked, .. } = &registry.get(&id).unwrap().kind else {
            panic!("kind changed");
        };
        assert_eq!(checked, &vec![true, false]);
    }

    #[test]
    fn radio_travels_as_one_flag_per_option() {
        let mut registry = ElementRegistry::new();
        let options = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        let id = registry.add(ElementKind::radio("axis", options, 1), None);
        assert_eq!(
            registry.get(&id).unwrap().descriptor(),
            json!({
                "element": "radio",
                "id": "0",
                "desc": "axis",
                "options": ["x", "y", "z"],
                "checked": [false, true, false]
            })
        );
        assert!(registry.dispatch(&event(&id, json!(2))));
        assert!(!registry.dispatch(&event(&id, json!(3))));
        let ElementKind::Radio { checked, .. } = &registry.get(&id).unwrap().kind else {
            panic!("kind changed");
        };
        assert_eq!(checked, &vec![false, false, true]);
    }

    #[test]
    fn control_side_edits_are_reported_once() {
        let mut registry = ElementRegistry::new();
        let label = registry.add(ElementKind::label("t = 0"), None);
        registry.add(ElementKind::button("reset"), None);
        assert!(registry.update(&label, |kind| *kind = ElementKind::label("t = 1")));
        let changed = registry.take_changed();
        assert_eq!(changed, vec![json!({"element": "label", "id": "0", "desc": "t = 1"})]);
        assert!(registry.take_changed().is_empty());
        assert!(!registry.update("9", |_| {}));
    }

    #[test]
    fn clear_restarts_ids() {
        let mut registry = ElementRegistry::new();
        registry.add(ElementKind::button("a"), None);
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.add(ElementKind::button("b"), None), "0");
    }
}
