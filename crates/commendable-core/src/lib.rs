//! Domain types and the set-algebra engine behind the recommendation service.
//!
//! This crate holds everything that does not depend on a runtime: the wire
//! messages, the order-preserving value codec, the [`OrderedStore`] capability
//! and its in-memory implementation, and the [`SetExpression`] evaluator.

pub mod codec;
pub mod dsl;
pub mod setop;
pub mod store;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub use setop::{
    evaluate, evaluate_op, Merge, SetExpression, SetNode, SetOp, SetOpKind, SetOpSource, SetResult,
};
pub use store::{Item, MemoryStore, OrderedStore, RangeKey, ScanRange};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("expression error: {0}")]
    Expression(String),
    #[error("message error: {0}")]
    Message(String),
}

pub const DEFAULT_LIKE_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EventKind {
    Like,
    View,
    Deactivate,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::View => "view",
            Self::Deactivate => "deactivate",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "like" => Some(Self::Like),
            "view" => Some(Self::View),
            "deactivate" => Some(Self::Deactivate),
            _ => None,
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON shape shared by ingestion datagrams and query responses.
///
/// Every field is omittable on the wire; empty fields are skipped when encoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dont_activate: bool,
}

/// A validated ingestion event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    View { user: String, object: String },
    Like { user: String, object: String, weight: f64, dont_activate: bool },
    Deactivate { object: String },
}

impl Event {
    /// Decode one datagram payload.
    ///
    /// # Errors
    /// Returns [`CoreError::Message`] when the payload is not a JSON message,
    /// names an unknown event type, or omits a field the event type requires.
    pub fn decode(payload: &[u8]) -> Result<Self, CoreError> {
        let message: Message = serde_json::from_slice(payload)
            .map_err(|err| CoreError::Message(format!("invalid message JSON: {err}")))?;
        Self::try_from(message)
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::View { .. } => EventKind::View,
            Self::Like { .. } => EventKind::Like,
            Self::Deactivate { .. } => EventKind::Deactivate,
        }
    }

    #[must_use]
    pub fn to_message(&self) -> Message {
        match self {
            Self::View { user, object } => Message {
                kind: Some(EventKind::View.as_str().to_string()),
                user: user.clone(),
                object: object.clone(),
                ..Message::default()
            },
            Self::Like { user, object, weight, dont_activate } => Message {
                kind: Some(EventKind::Like.as_str().to_string()),
                user: user.clone(),
                object: object.clone(),
                weight: Some(*weight),
                dont_activate: *dont_activate,
            },
            Self::Deactivate { object } => Message {
                kind: Some(EventKind::Deactivate.as_str().to_string()),
                object: object.clone(),
                ..Message::default()
            },
        }
    }
}

impl TryFrom<Message> for Event {
    type Error = CoreError;

    fn try_from(message: Message) -> Result<Self, Self::Error> {
        let raw_kind = message
            .kind
            .ok_or_else(|| CoreError::Message("message is missing Type".to_string()))?;
        let kind = EventKind::parse(&raw_kind)
            .ok_or_else(|| CoreError::Message(format!("unknown message Type: {raw_kind}")))?;

        if message.object.is_empty() {
            return Err(CoreError::Message(format!("{kind} message is missing Object")));
        }
        if kind != EventKind::Deactivate && message.user.is_empty() {
            return Err(CoreError::Message(format!("{kind} message is missing User")));
        }

        Ok(match kind {
            EventKind::View => Self::View { user: message.user, object: message.object },
            EventKind::Like => Self::Like {
                user: message.user,
                object: message.object,
                weight: message.weight.unwrap_or(DEFAULT_LIKE_WEIGHT),
                dont_activate: message.dont_activate,
            },
            EventKind::Deactivate => Self::Deactivate { object: message.object },
        })
    }
}

/// How a recommendation read treats one auxiliary range.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    #[default]
    #[serde(rename = "")]
    None,
    Intersect,
    Reject,
}

impl FilterMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Intersect => "intersect",
            Self::Reject => "reject",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" => Some(Self::None),
            "intersect" => Some(Self::Intersect),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }

    /// The set operation that applies this filter, if any.
    #[must_use]
    pub fn op_kind(self) -> Option<SetOpKind> {
        match self {
            Self::None => None,
            Self::Intersect => Some(SetOpKind::Intersection),
            Self::Reject => Some(SetOpKind::Difference),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RecommendationsRequest {
    #[serde(default)]
    pub num: usize,
    #[serde(default)]
    pub actives: FilterMode,
    #[serde(default)]
    pub viewed: FilterMode,
}
