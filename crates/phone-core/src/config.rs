//! Softphone configuration
//!
//! Defaults match the behaviour the widget has always had: a 30 second
//! call-setup race, a 30 second auto-decline for unanswered inbound calls,
//! a 2 second post-call pause before the widget returns to idle and a one
//! second duration tick.
//!
//! ```rust
//! use link_phone_core::PhoneConfig;
//! use std::time::Duration;
//!
//! let config = PhoneConfig::new()
//!     .with_api_base_url("https://thelink.example.com/api")
//!     .with_country_code("44");
//!
//! assert_eq!(config.call_setup_timeout(), Duration::from_secs(30));
//! assert!(config.validate().is_ok());
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PhoneError, PhoneResult};

/// Configuration for a [`Softphone`](crate::Softphone)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    /// Base URL of the practice-management API (`/sip-provision`, `/log-call`)
    pub api_base_url: String,
    /// Optional bearer token sent with every backend request
    pub api_token: Option<String>,
    /// Home country calling code, digits only
    pub country_code: String,
    /// Maximum time the SDK may take to set up an outbound call
    pub call_setup_timeout_secs: u64,
    /// Unanswered inbound calls are declined after this long
    pub auto_decline_secs: u64,
    /// Pause between disconnect and returning to idle
    pub reset_delay_ms: u64,
    /// Interval of the connected-call duration tick
    pub tick_interval_ms: u64,
    /// Timeout for each backend HTTP request
    pub request_timeout_secs: u64,
    /// Capacity of the notification broadcast channel
    pub event_capacity: usize,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/api".to_string(),
            api_token: None,
            country_code: "44".to_string(),
            call_setup_timeout_secs: 30,
            auto_decline_secs: 30,
            reset_delay_ms: 2_000,
            tick_interval_ms: 1_000,
            request_timeout_secs: 10,
            event_capacity: 64,
        }
    }
}

impl PhoneConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document, missing keys take their defaults
    pub fn from_toml_str(source: &str) -> PhoneResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| PhoneError::config(format!("invalid phone config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> PhoneResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| PhoneError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_country_code(mut self, code: impl Into<String>) -> Self {
        self.country_code = code.into();
        self
    }

    /// Stored in whole seconds, a partial second rounds up
    pub fn with_call_setup_timeout(mut self, timeout: Duration) -> Self {
        self.call_setup_timeout_secs = whole_secs_ceil(timeout);
        self
    }

    /// Stored in whole seconds, a partial second rounds up
    pub fn with_auto_decline_after(mut self, after: Duration) -> Self {
        self.auto_decline_secs = whole_secs_ceil(after);
        self
    }

    /// Stored in whole milliseconds, a partial millisecond rounds up
    pub fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay_ms = whole_millis_ceil(delay);
        self
    }

    /// Stored in whole milliseconds, a partial millisecond rounds up
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = whole_millis_ceil(interval);
        self
    }

    pub fn call_setup_timeout(&self) -> Duration {
        Duration::from_secs(self.call_setup_timeout_secs)
    }

    pub fn auto_decline_after(&self) -> Duration {
        Duration::from_secs(self.auto_decline_secs)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Check the configuration for values the softphone cannot run with
    pub fn validate(&self) -> PhoneResult<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(PhoneError::config("api_base_url must not be empty"));
        }
        if self.country_code.is_empty() || !self.country_code.chars().all(|c| c.is_ascii_digit()) {
            return Err(PhoneError::config(format!(
                "country_code must be digits only, got {:?}",
                self.country_code
            )));
        }
        for (name, value) in [
            ("call_setup_timeout_secs", self.call_setup_timeout_secs),
            ("auto_decline_secs", self.auto_decline_secs),
            ("tick_interval_ms", self.tick_interval_ms),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(PhoneError::config(format!("{name} must be greater than zero")));
            }
        }
        if self.event_capacity == 0 {
            return Err(PhoneError::config("event_capacity must be greater than zero"));
        }
        Ok(())
    }
}

fn whole_secs_ceil(duration: Duration) -> u64 {
    let partial = duration.subsec_nanos() > 0;
    duration.as_secs().saturating_add(u64::from(partial))
}

fn whole_millis_ceil(duration: Duration) -> u64 {
    let partial = duration.subsec_nanos() % 1_000_000 > 0;
    u64::try_from(duration.as_millis())
        .unwrap_or(u64::MAX)
        .saturating_add(u64::from(partial))
}
