//! Event types
//!
//! Two families live here:
//!
//! - [`CallEvent`]: lifecycle events coming *from* the telephony SDK. The
//!   SDK fires several differently-named events for what is logically one
//!   transition, so they are collapsed into one tagged enum and classified
//!   as connection or termination signals.
//! - [`PhoneEvent`]: notifications going *to* the presentation layer,
//!   delivered over a broadcast channel.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::{CallDirection, CallLogRecord, CallStatus, SessionId};

/// A lifecycle event observed on an SDK session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEvent {
    // Connection signals
    Progress,
    Accepted,
    Confirmed,
    Connecting,

    // Termination signals
    Terminated,
    Ended,
    Bye,
    Disposed,
    Cancel,
    Rejected,
    Failed,

    /// Local user hung up
    HangUp,
}

impl CallEvent {
    /// Parse an SDK event name
    pub fn from_sdk_name(name: &str) -> Option<Self> {
        let event = match name.trim().to_ascii_lowercase().as_str() {
            "progress" => CallEvent::Progress,
            "accepted" | "connected" => CallEvent::Accepted,
            "confirmed" => CallEvent::Confirmed,
            "connecting" => CallEvent::Connecting,
            "terminated" => CallEvent::Terminated,
            "ended" => CallEvent::Ended,
            "bye" => CallEvent::Bye,
            "disposed" => CallEvent::Disposed,
            "cancel" | "cancelled" => CallEvent::Cancel,
            "rejected" => CallEvent::Rejected,
            "failed" => CallEvent::Failed,
            "hangup" => CallEvent::HangUp,
            _ => return None,
        };
        Some(event)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallEvent::Progress => "progress",
            CallEvent::Accepted => "accepted",
            CallEvent::Confirmed => "confirmed",
            CallEvent::Connecting => "connecting",
            CallEvent::Terminated => "terminated",
            CallEvent::Ended => "ended",
            CallEvent::Bye => "bye",
            CallEvent::Disposed => "disposed",
            CallEvent::Cancel => "cancel",
            CallEvent::Rejected => "rejected",
            CallEvent::Failed => "failed",
            CallEvent::HangUp => "hangup",
        }
    }

    pub fn is_connection_signal(&self) -> bool {
        matches!(
            self,
            CallEvent::Progress | CallEvent::Accepted | CallEvent::Confirmed | CallEvent::Connecting
        )
    }

    pub fn is_termination_signal(&self) -> bool {
        !self.is_connection_signal()
    }
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeSeverity {
    Info,
    Warning,
    Error,
}

/// Dismissible message shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNotice {
    pub severity: NoticeSeverity,
    pub title: String,
    pub description: String,
}

impl UserNotice {
    pub fn new(
        severity: NoticeSeverity,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(NoticeSeverity::Info, title, description)
    }

    pub fn warning(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(NoticeSeverity::Warning, title, description)
    }
}

/// Notifications emitted by the softphone
#[derive(Debug, Clone, PartialEq)]
pub enum PhoneEvent {
    /// Call status changed
    StateChanged {
        session_id: SessionId,
        previous: CallStatus,
        current: CallStatus,
        timestamp: DateTime<Utc>,
    },

    /// Incoming call is ringing
    IncomingCall {
        session_id: SessionId,
        /// Display name or number, `"Unknown"` when the SDK gave neither
        caller: String,
    },

    /// Connected-call duration advanced
    DurationTick { session_id: SessionId, seconds: u64 },

    /// Mute flag changed after the SDK confirmed it
    MuteChanged { session_id: SessionId, muted: bool },

    /// Hold flag changed after the SDK confirmed it
    HoldChanged { session_id: SessionId, on_hold: bool },

    /// Completed call was recorded by the backend
    CallLogged { record: CallLogRecord },

    /// Something the user should see
    Notice(UserNotice),
}

impl PhoneEvent {
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            PhoneEvent::StateChanged { session_id, .. }
            | PhoneEvent::IncomingCall { session_id, .. }
            | PhoneEvent::DurationTick { session_id, .. }
            | PhoneEvent::MuteChanged { session_id, .. }
            | PhoneEvent::HoldChanged { session_id, .. } => Some(session_id),
            PhoneEvent::CallLogged { record } => Some(&record.session_id),
            PhoneEvent::Notice(_) => None,
        }
    }
}

/// Direction-aware wording for a call that ended before it connected
pub(crate) fn unanswered_notice(direction: CallDirection, event: CallEvent) -> UserNotice {
    match direction {
        CallDirection::Outbound => UserNotice::new(
            NoticeSeverity::Error,
            "Call Failed",
            format!("The call ended before it was answered ({event})."),
        ),
        CallDirection::Inbound => UserNotice::info("Missed Call", "The caller hung up before the call was answered."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sdk_names() {
        assert_eq!(CallEvent::from_sdk_name("progress"), Some(CallEvent::Progress));
        assert_eq!(CallEvent::from_sdk_name("Connected"), Some(CallEvent::Accepted));
        assert_eq!(CallEvent::from_sdk_name(" bye "), Some(CallEvent::Bye));
        assert_eq!(CallEvent::from_sdk_name("cancelled"), Some(CallEvent::Cancel));
        assert_eq!(CallEvent::from_sdk_name("registered"), None);
    }

    #[test]
    fn test_classification() {
        for ev in [CallEvent::Progress, CallEvent::Accepted, CallEvent::Confirmed, CallEvent::Connecting] {
            assert!(ev.is_connection_signal(), "{ev} should connect");
            assert!(!ev.is_termination_signal());
        }
        for ev in [
            CallEvent::Terminated,
            CallEvent::Ended,
            CallEvent::Bye,
            CallEvent::Disposed,
            CallEvent::Cancel,
            CallEvent::Rejected,
            CallEvent::Failed,
            CallEvent::HangUp,
        ] {
            assert!(ev.is_termination_signal(), "{ev} should terminate");
        }
    }

    #[test]
    fn test_names_round_trip() {
        for ev in [CallEvent::Confirmed, CallEvent::Disposed, CallEvent::HangUp] {
            assert_eq!(CallEvent::from_sdk_name(ev.as_str()), Some(ev));
        }
    }
}
