use serde::{Deserialize, Serialize};

use crate::codec::{Event, Payload};

/// Untyped event for hosts that exchange raw JSON documents.
///
/// `name` lets subscribers tell documents apart; `json` is passed through
/// as an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonEvent {
    pub name: String,
    pub json: String,
}

impl JsonEvent {
    pub fn new(name: impl Into<String>, json: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            json: json.into(),
        }
    }

    /// Parses the embedded document.
    pub fn parse<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.json)
    }
}

impl Payload for JsonEvent {
    const TYPE_ID: &'static str = "javelin:json";
}

impl Event for JsonEvent {}
