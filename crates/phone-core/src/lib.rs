//! # Link Phone Core - Softphone Call Sessions
//!
//! Call-session engine of the Link softphone widget. It tracks the single
//! active call through `idle → ringing → connected → disconnected → idle`,
//! keeps the call timers, and records every completed call against the
//! client it was made for (exactly once, however many times the SDK reports
//! the hangup).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use link_phone_core::{CallAssociation, LoopbackAdapter, PhoneConfig, Softphone};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let phone = Softphone::builder()
//!         .config(PhoneConfig::from_file("link-phone.toml")?)
//!         .adapter(LoopbackAdapter::new())
//!         .association(CallAssociation::new("client-42"))
//!         .build()?;
//!
//!     phone.initialize().await?;
//!     let session_id = phone.place_call("07700 900123").await?;
//!     println!("dialling, session {session_id}");
//!
//!     phone.hang_up().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`machine`]: the sans-I/O reducer every event is funnelled through
//! - [`phone`]: the async driver that owns timers and the SDK session
//! - [`adapter`]: the telephony SDK boundary, plus an in-process loopback
//! - [`api`]: backend client for provisioning and call logging

pub mod adapter;
pub mod api;
pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod machine;
pub mod number;
pub mod phone;
pub mod timers;

pub use adapter::{
    CloseMethod, IncomingInvite, InviteStream, LoopbackAdapter, LoopbackCall, LoopbackRemote,
    RecordingCallLogger, RemoteIdentity, SdkCall, SdkSession, SessionCapabilities, SessionOp,
    SipCredentials, StaticProvisioner, TelephonyAdapter,
};
pub use api::{BackendClient, CallLogger, Provisioner};
pub use call::{
    CallAssociation, CallContext, CallDirection, CallLogRecord, CallSession, CallStatus, SessionId,
};
pub use config::PhoneConfig;
pub use error::{PhoneError, PhoneResult, SdkError};
pub use events::{CallEvent, NoticeSeverity, PhoneEvent, UserNotice};
pub use machine::{CallMachine, Effect};
pub use number::normalize_phone_number;
pub use phone::{Softphone, SoftphoneBuilder};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
