//! A2UI component model and scene state.
//!
//! Components arrive as JSON pushes from the gateway. A push either replaces
//! the scene or appends to it; decoding is lenient and accepts a bare
//! component in place of a push envelope.

use std::sync::{Mutex, PoisonError};

use {
    serde::{Deserialize, Serialize},
    serde_json::value::RawValue,
};

use crate::CanvasError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Text,
    Box,
    Card,
    Button,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    #[default]
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Style {
    #[serde(rename = "fillGray", default, skip_serializing_if = "Option::is_none")]
    pub fill_gray: Option<u8>,
    #[serde(rename = "strokeGray", default, skip_serializing_if = "Option::is_none")]
    pub stroke_gray: Option<u8>,
}

/// Action attached to a component. The payload is opaque JSON from the wire
/// and is forwarded verbatim in outgoing action events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub align: Align,
    #[serde(default)]
    pub padding: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Style>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Component>,
}

impl Component {
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            id: None,
            kind,
            x: 0,
            y: 0,
            width: 0,
            height: 0,
            text: String::new(),
            align: Align::Left,
            padding: 0,
            style: None,
            action: None,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Push {
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub replace: bool,
}

/// Ordered component list accumulated from pushes. Guarded for concurrent
/// access; readers get a clone so rendering is decoupled from mutation.
#[derive(Default)]
pub struct SceneState {
    components: Mutex<Vec<Component>>,
}

impl SceneState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn apply_push(&self, push: Push) {
        let mut components = self.lock();
        if push.replace {
            *components = push.components;
        } else {
            components.extend(push.components);
        }
    }

    pub fn components(&self) -> Vec<Component> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Component>> {
        self.components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decode one push. Tries the `{components, replace?}` envelope first, then
/// falls back to a bare component wrapped in a single-element push.
pub fn decode_push(raw: &serde_json::Value) -> Result<Push, CanvasError> {
    if let Ok(push) = serde_json::from_value::<Push>(raw.clone()) {
        if !push.components.is_empty() {
            return Ok(push);
        }
    }
    if let Ok(component) = serde_json::from_value::<Component>(raw.clone()) {
        return Ok(Push {
            components: vec![component],
            replace: false,
        });
    }
    Err(CanvasError::InvalidPayload)
}

/// Decode a newline-delimited sequence of pushes. Blank lines are skipped;
/// the first undecodable line fails the whole batch.
pub fn decode_jsonl(data: &str) -> Result<Vec<Push>, CanvasError> {
    let mut pushes = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|_| CanvasError::InvalidPayload)?;
        pushes.push(decode_push(&value)?);
    }
    Ok(pushes)
}
