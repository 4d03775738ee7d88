//! Error types for the phone core
//!
//! Every failure the widget can hit maps onto one of the categories below.
//! The first four abort the attempted transition and leave the phone idle;
//! a logging failure never rolls back a call that already happened; a
//! missing call context is a warned skip rather than a hard error.

use thiserror::Error;

use crate::events::{NoticeSeverity, UserNotice};

/// Result type for phone operations
pub type PhoneResult<T> = Result<T, PhoneError>;

/// Errors that can occur in the phone core
#[derive(Debug, Error)]
pub enum PhoneError {
    /// Microphone access was refused by the user or the platform
    #[error("Microphone permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// SIP provisioning, socket or registration failure
    #[error("Phone initialization failed: {reason}")]
    AdapterInit { reason: String },

    /// The SDK did not finish call setup in time
    #[error("Call setup timed out after {seconds} seconds")]
    SetupTimeout { seconds: u64 },

    /// The SDK refused to place the call
    #[error("Call rejected: {reason}")]
    CallRejected { reason: String },

    /// The call happened but the backend did not record it
    #[error("Call logging failed: {reason}")]
    LoggingFailed { reason: String },

    /// Call context lacks the fields needed to attribute the call
    #[error("Call context incomplete, missing {field}")]
    MissingContext { field: String },

    /// An operation was attempted before `initialize()` succeeded
    #[error("Phone is not initialized")]
    NotInitialized,

    /// A second call was attempted while one is active
    #[error("A call is already in progress")]
    CallInProgress,

    /// An in-call operation was attempted with no active call
    #[error("No active call")]
    NoActiveCall,

    /// The active call is not in a state that allows the operation
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// The dialled number could not be normalised
    #[error("Invalid phone number: {number:?}")]
    InvalidNumber { number: String },

    /// An SDK session operation failed
    #[error("SDK {operation} failed: {reason}")]
    Sdk { operation: String, reason: String },

    /// Transport-level HTTP failure talking to the backend
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl PhoneError {
    /// Create a permission-denied error
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied { reason: reason.into() }
    }

    /// Create an adapter initialization error
    pub fn adapter_init(reason: impl Into<String>) -> Self {
        Self::AdapterInit { reason: reason.into() }
    }

    /// Create a call rejection error
    pub fn call_rejected(reason: impl Into<String>) -> Self {
        Self::CallRejected { reason: reason.into() }
    }

    /// Create a logging failure error
    pub fn logging_failed(reason: impl Into<String>) -> Self {
        Self::LoggingFailed { reason: reason.into() }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    /// Create an SDK operation error
    pub fn sdk(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Sdk {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Short category name used in structured logs
    pub fn category(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "permission",
            Self::AdapterInit { .. } => "adapter",
            Self::SetupTimeout { .. } => "timeout",
            Self::CallRejected { .. } => "rejected",
            Self::LoggingFailed { .. } | Self::Http(_) => "logging",
            Self::MissingContext { .. } => "context",
            Self::NotInitialized
            | Self::CallInProgress
            | Self::NoActiveCall
            | Self::InvalidState { .. } => "state",
            Self::InvalidNumber { .. } => "input",
            Self::Sdk { .. } => "sdk",
            Self::Configuration { .. } => "configuration",
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SetupTimeout { .. } | Self::LoggingFailed { .. } | Self::AdapterInit { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Friendly, dismissible message for the presentation layer
    pub fn user_notice(&self) -> UserNotice {
        match self {
            Self::PermissionDenied { .. } => UserNotice::new(
                NoticeSeverity::Error,
                "Microphone Access Needed",
                "Allow microphone access in your browser to make calls.",
            ),
            Self::AdapterInit { .. } => UserNotice::new(
                NoticeSeverity::Error,
                "Phone Unavailable",
                "The phone could not connect. Try again in a moment.",
            ),
            Self::SetupTimeout { seconds } => UserNotice::new(
                NoticeSeverity::Error,
                "Call Failed",
                format!("The call did not connect within {seconds} seconds."),
            ),
            Self::CallRejected { reason } => UserNotice::new(
                NoticeSeverity::Error,
                "Call Failed",
                format!("The call could not be placed: {reason}"),
            ),
            Self::LoggingFailed { .. } | Self::Http(_) => UserNotice::new(
                NoticeSeverity::Error,
                "Call Not Logged",
                "The call completed but could not be saved to the client record.",
            ),
            Self::MissingContext { .. } => UserNotice::new(
                NoticeSeverity::Warning,
                "Call Not Logged",
                "This call was not recorded because no client is associated with it.",
            ),
            Self::InvalidNumber { number } => UserNotice::new(
                NoticeSeverity::Error,
                "Invalid Number",
                format!("{number:?} is not a valid phone number."),
            ),
            other => UserNotice::new(NoticeSeverity::Error, "Phone Error", other.to_string()),
        }
    }
}

/// Error reported by a telephony SDK adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SdkError {
    pub message: String,
}

impl SdkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}
