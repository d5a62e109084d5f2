use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Arbitrary key-value metadata attached to messages and artifacts.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// The role of the participant that authored a [`Message`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The requesting client.
    User,
    /// An agent (the orchestrator or a remote worker).
    Agent,
}

/// One piece of content inside a [`Message`] or [`Artifact`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// Structured JSON data.
    Data {
        /// The data payload.
        data: serde_json::Value,
    },
}

impl Part {
    /// Creates a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    /// Creates a data part.
    pub fn data(data: serde_json::Value) -> Self {
        Part::Data { data }
    }

    /// The text content, if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            Part::Data { .. } => None,
        }
    }
}

/// A single message exchanged between a client and an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier for this message.
    pub message_id: String,
    /// The role of the message author.
    pub role: Role,
    /// Ordered message content.
    pub parts: Vec<Part>,
    /// Conversation this message belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// Task this message continues, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Message {
    /// Creates a new message with the given role and parts.
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            role,
            parts,
            context_id: None,
            task_id: None,
        }
    }

    /// Creates a single-part text message with [`Role::User`].
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    /// Creates a single-part text message with [`Role::Agent`].
    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(Role::Agent, vec![Part::text(text)])
    }

    /// Attaches the task and context identifiers.
    pub fn for_task(mut self, task_id: impl Into<String>, context_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self.context_id = Some(context_id.into());
        self
    }

    /// All text parts joined with newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// An immutable, named bundle of result parts attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact name, unique per producer.
    pub name: String,
    /// Content.
    pub parts: Vec<Part>,
    /// Producer metadata such as `evidence_quality`.
    #[serde(default)]
    pub metadata: Metadata,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Artifact {
    /// Artifact stamped now.
    pub fn new(name: impl Into<String>, parts: Vec<Part>, metadata: Metadata) -> Self {
        Self {
            name: name.into(),
            parts,
            metadata,
            timestamp: Utc::now(),
        }
    }

    /// All text parts joined with newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Reads a numeric metadata entry.
    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(serde_json::Value::as_f64)
    }

    /// Reads a boolean metadata entry.
    pub fn metadata_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(serde_json::Value::as_bool)
    }
}
