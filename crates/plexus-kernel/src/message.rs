//! Bus messages.
//!
//! A [`Message`] is the unit every component exchanges.  It is immutable once
//! built: the `id` is assigned at creation and never rewritten, and a reply
//! that belongs to a request reuses the request's id via [`Message::reply`].
//!
//! On the wire a message is a JSON object:
//!
//! ```json
//! {"id": "0192...", "route": "storage", "command": "store", "message": {"service": "db1"}}
//! ```
//!
//! `id` may be omitted on input; a fresh UUID v7 string is generated for it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// An immutable routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "generate_id")]
    id: String,
    route: String,
    command: String,
    #[serde(rename = "message", default)]
    data: Value,
}

fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

impl Message {
    /// Build a message with a freshly generated correlation id.
    pub fn new(route: impl Into<String>, command: impl Into<String>, data: Value) -> Self {
        Self::reply(generate_id(), route, command, data)
    }

    /// Build a message that shares `id` with the request it answers.
    pub fn reply(
        id: impl Into<String>,
        route: impl Into<String>,
        command: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: id.into(),
            route: route.into(),
            command: command.into(),
            data,
        }
    }

    /// Decode a message from its JSON wire form.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Encode the message to its JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// The opaque payload.  Usually a JSON object, sometimes a string that
    /// itself contains JSON.
    pub fn data(&self) -> &Value {
        &self.data
    }
}
