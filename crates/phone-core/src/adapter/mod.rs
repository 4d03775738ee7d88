//! Telephony SDK boundary
//!
//! The softphone never talks to a SIP/WebRTC library directly. An
//! integration layer implements [`TelephonyAdapter`] and [`SdkSession`] on
//! top of whatever SDK the deployment uses, converting the SDK's string
//! event names into [`CallEvent`]s on the session's event channel.
//!
//! SDK session objects differ in how they end a call (`terminate`,
//! `dispose` or `bye`). Adapters resolve that once with
//! [`SessionCapabilities::close_method`] and expose the result through the
//! single [`SdkSession::close`] operation.

pub mod loopback;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SdkError;
use crate::events::CallEvent;

pub use loopback::{
    LoopbackAdapter, LoopbackCall, LoopbackRemote, RecordingCallLogger, SessionOp,
    StaticProvisioner,
};

/// Credentials returned by `POST /sip-provision`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SipCredentials {
    pub username: String,
    pub password: String,
    pub domain: String,
    /// WebSocket signalling endpoint
    pub ws_server: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub caller_id: Option<String>,
}

impl fmt::Debug for SipCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SipCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .field("ws_server", &self.ws_server)
            .field("display_name", &self.display_name)
            .field("caller_id", &self.caller_id)
            .finish()
    }
}

/// One call as exposed by the SDK
#[async_trait]
pub trait SdkSession: Send + Sync {
    async fn mute(&self) -> Result<(), SdkError>;
    async fn unmute(&self) -> Result<(), SdkError>;
    async fn hold(&self) -> Result<(), SdkError>;
    async fn unhold(&self) -> Result<(), SdkError>;
    async fn answer(&self) -> Result<(), SdkError>;
    async fn decline(&self) -> Result<(), SdkError>;
    /// End the call through whichever close capability the SDK offers
    async fn close(&self) -> Result<(), SdkError>;
    /// Whether the SDK already considers the call established
    fn is_connected(&self) -> bool;
}

/// A session plus the channel its lifecycle events arrive on
pub struct SdkCall {
    pub session: Box<dyn SdkSession>,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
}

impl fmt::Debug for SdkCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkCall")
            .field("connected", &self.session.is_connected())
            .finish_non_exhaustive()
    }
}

/// Caller identity as reported by the SDK invite payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub display_name: Option<String>,
    pub number: Option<String>,
}

impl RemoteIdentity {
    /// Display name, else number, else `"Unknown"`
    pub fn display(&self) -> String {
        non_blank(&self.display_name)
            .or_else(|| non_blank(&self.number))
            .unwrap_or("Unknown")
            .to_string()
    }

    /// Number, else whatever [`display`](Self::display) yields
    pub fn number_or_display(&self) -> String {
        non_blank(&self.number)
            .map(str::to_string)
            .unwrap_or_else(|| self.display())
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// An inbound call waiting to be answered
#[derive(Debug)]
pub struct IncomingInvite {
    pub remote: RemoteIdentity,
    pub call: SdkCall,
}

/// Stream of invites handed back by [`TelephonyAdapter::start`]
pub type InviteStream = mpsc::UnboundedReceiver<IncomingInvite>;

/// The telephony SDK as the softphone sees it
#[async_trait]
pub trait TelephonyAdapter: Send + Sync {
    /// Register with the SIP service, returns the inbound invite stream
    async fn start(&self, credentials: &SipCredentials) -> Result<InviteStream, SdkError>;

    /// Ask the platform for microphone access
    async fn request_microphone(&self) -> Result<(), SdkError>;

    /// Place an outbound call to an already normalised number
    async fn call(&self, number: &str) -> Result<SdkCall, SdkError>;
}

/// How an SDK session object can be ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseMethod {
    Terminate,
    Dispose,
    Bye,
}

/// Close operations an SDK session object exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCapabilities {
    pub terminate: bool,
    pub dispose: bool,
    pub bye: bool,
}

impl Default for SessionCapabilities {
    fn default() -> Self {
        Self::all()
    }
}

impl SessionCapabilities {
    pub fn all() -> Self {
        Self {
            terminate: true,
            dispose: true,
            bye: true,
        }
    }

    pub fn none() -> Self {
        Self {
            terminate: false,
            dispose: false,
            bye: false,
        }
    }

    /// Preferred close operation: terminate, then dispose, then bye
    pub fn close_method(&self) -> Option<CloseMethod> {
        if self.terminate {
            Some(CloseMethod::Terminate)
        } else if self.dispose {
            Some(CloseMethod::Dispose)
        } else if self.bye {
            Some(CloseMethod::Bye)
        } else {
            None
        }
    }
}
