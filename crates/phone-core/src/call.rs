//! Call session data model
//!
//! A [`CallSession`] is transient: it exists from call placement (or invite
//! arrival) until the post-call reset, and is never persisted. The
//! [`CallContext`] captured when the session is created is immutable and is
//! what the call log record is built from.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Locally minted identifier for one call attempt
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Widget-visible call status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Idle,
    Ringing,
    Connected,
    /// Terminal, held for the post-call delay before returning to `Idle`
    Disconnected,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Ringing => "ringing",
            CallStatus::Connected => "connected",
            CallStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a call relative to this widget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The business record a phone widget is mounted against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAssociation {
    pub client_id: Option<String>,
    pub person_id: Option<String>,
}

impl CallAssociation {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            person_id: None,
        }
    }

    pub fn with_person(mut self, person_id: impl Into<String>) -> Self {
        self.person_id = Some(person_id.into());
        self
    }

    /// Association with no client, calls will not be logged
    pub fn unassociated() -> Self {
        Self::default()
    }
}

/// Everything needed to attribute a call to a business record, frozen at
/// call creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub client_id: Option<String>,
    pub person_id: Option<String>,
    pub phone_number: String,
    pub session_id: SessionId,
    pub direction: CallDirection,
}

impl CallContext {
    pub fn new(
        association: &CallAssociation,
        phone_number: impl Into<String>,
        direction: CallDirection,
    ) -> Self {
        Self {
            client_id: association.client_id.clone(),
            person_id: association.person_id.clone(),
            phone_number: phone_number.into(),
            session_id: SessionId::new(),
            direction,
        }
    }

    /// Name of the first field that prevents logging, if any
    pub fn missing_field(&self) -> Option<&'static str> {
        match self.client_id.as_deref() {
            None | Some("") => Some("client_id"),
            _ if self.session_id.as_str().is_empty() => Some("session_id"),
            _ => None,
        }
    }

    /// Build the log payload for a completed call, `None` if the context is
    /// incomplete.
    pub fn log_record(&self, duration: u64) -> Option<CallLogRecord> {
        if self.missing_field().is_some() {
            return None;
        }
        Some(CallLogRecord {
            client_id: self.client_id.clone().unwrap_or_default(),
            person_id: self.person_id.clone(),
            phone_number: self.phone_number.clone(),
            direction: self.direction,
            duration,
            session_id: self.session_id.clone(),
        })
    }
}

/// One active call as seen by the widget
#[derive(Debug, Clone)]
pub struct CallSession {
    pub session_id: SessionId,
    pub phone_number: String,
    pub status: CallStatus,
    pub direction: CallDirection,
    pub duration_seconds: u64,
    pub is_muted: bool,
    pub is_on_hold: bool,
    /// Set once the completion log has been issued (or skipped)
    pub logged: bool,
    pub context: CallContext,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(context: CallContext) -> Self {
        Self {
            session_id: context.session_id.clone(),
            phone_number: context.phone_number.clone(),
            status: CallStatus::Ringing,
            direction: context.direction,
            duration_seconds: 0,
            is_muted: false,
            is_on_hold: false,
            logged: false,
            context,
            created_at: Utc::now(),
        }
    }
}

/// Payload of `POST /log-call`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLogRecord {
    pub client_id: String,
    pub person_id: Option<String>,
    pub phone_number: String,
    pub direction: CallDirection,
    /// Whole seconds between connection and first termination
    pub duration: u64,
    pub session_id: SessionId,
}
