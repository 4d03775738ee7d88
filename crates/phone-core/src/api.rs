//! Practice-management backend client
//!
//! Two endpoints matter to the phone:
//!
//! - `POST /sip-provision` returns the SIP credentials the adapter
//!   registers with.
//! - `POST /log-call` records a completed call against a client.
//!
//! The softphone reaches them through the [`Provisioner`] and
//! [`CallLogger`] traits; [`BackendClient`] implements both over HTTP.
//! Log submission is never retried: a failed POST is reported, not
//! repeated, so a call can never be recorded twice.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use tracing::{debug, warn};

use crate::adapter::SipCredentials;
use crate::call::CallLogRecord;
use crate::config::PhoneConfig;
use crate::error::{PhoneError, PhoneResult};

/// Records completed calls
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallLogger: Send + Sync {
    async fn log_call(&self, record: &CallLogRecord) -> PhoneResult<()>;
}

/// Supplies SIP credentials for adapter start-up
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self) -> PhoneResult<SipCredentials>;
}

/// HTTP client for the backend endpoints the phone uses
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl BackendClient {
    pub fn new(config: &PhoneConfig) -> PhoneResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| PhoneError::config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self.http.post(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl CallLogger for BackendClient {
    async fn log_call(&self, record: &CallLogRecord) -> PhoneResult<()> {
        debug!(session_id = %record.session_id, duration = record.duration, "Submitting call log");
        let response = self
            .post("/log-call")
            .json(record)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(session_id = %record.session_id, status = %status, "Call log rejected by backend");
            return Err(PhoneError::logging_failed(format!("backend returned {status}: {body}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for BackendClient {
    async fn provision(&self) -> PhoneResult<SipCredentials> {
        let response = self
            .post("/sip-provision")
            .send()
            .await
            .map_err(|e| PhoneError::adapter_init(format!("SIP provisioning request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PhoneError::adapter_init(format!(
                "SIP provisioning returned {status}"
            )));
        }
        response
            .json::<SipCredentials>()
            .await
            .map_err(|e| PhoneError::adapter_init(format!("invalid SIP credentials: {e}")))
    }
}
