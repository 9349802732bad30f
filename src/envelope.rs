//! Frames carried on the outbound and inbound queues.
//!
//! On the wire an envelope is `[expectReply, [command, payload]]`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

/// Reply text returned by a fire-and-forget send.
pub const NO_REPLY: &str = "0";

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub expect_reply: bool,
    pub command: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(command: impl Into<String>, payload: Value, expect_reply: bool) -> Self {
        Self {
            expect_reply,
            command: command.into(),
            payload,
        }
    }

    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_wire(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.expect_reply, (&self.command, &self.payload)).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (expect_reply, (command, payload)) =
            <(bool, (String, Value))>::deserialize(deserializer)?;
        if command.is_empty() {
            return Err(D::Error::custom("envelope command must not be empty"));
        }
        Ok(Self {
            expect_reply,
            command,
            payload,
        })
    }
}

/// SDP offer or answer as exchanged over the signaling endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Network -> control thread.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// The peer's identification frame, sent once after connecting.
    Hello(String),
    /// Raw reply text for the outstanding expect-reply envelope.
    Reply(String),
    /// Unsolicited frame destined for element dispatch.
    Event(String),
    Offer(SessionDescription),
}

/// One UI interaction reported by the viewer.
#[derive(Clone, Debug, PartialEq)]
pub struct UiEvent {
    pub element_id: String,
    pub value: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventFrame {
    element_id: String,
    #[serde(default)]
    value: Value,
}

/// Parses either a single `{elementId, value}` frame or a batch object
/// `{id: value, ...}`. Anything else yields no events.
pub fn parse_events(text: &str) -> Vec<UiEvent> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == NO_REPLY {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            warn!("ignoring malformed event frame: {err}");
            return Vec::new();
        }
    };
    let Value::Object(map) = value else {
        return Vec::new();
    };
    if map.contains_key("elementId") {
        return match serde_json::from_value::<EventFrame>(Value::Object(map)) {
            Ok(frame) => vec![UiEvent {
                element_id: frame.element_id,
                value: frame.value,
            }],
            Err(err) => {
                warn!("ignoring malformed event frame: {err}");
                Vec::new()
            }
        };
    }
    map.into_iter()
        .map(|(element_id, value)| UiEvent { element_id, value })
        .collect()
}
