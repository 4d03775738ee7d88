//! In-process loopback telephony adapter
//!
//! Stands in for a real SDK: no network, no media. A [`LoopbackRemote`]
//! scripts the far end (answering, hanging up, inviting, refusing the
//! microphone) and inspects what the softphone asked the SDK to do. Used by
//! the test suite and by the `link-phone simulate` command.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    CloseMethod, IncomingInvite, InviteStream, RemoteIdentity, SdkCall, SdkSession,
    SessionCapabilities, SipCredentials, TelephonyAdapter,
};
use crate::api::{CallLogger, Provisioner};
use crate::call::CallLogRecord;
use crate::error::{PhoneError, PhoneResult, SdkError};
use crate::events::CallEvent;

/// Operation the softphone performed on a loopback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionOp {
    Mute,
    Unmute,
    Hold,
    Unhold,
    Answer,
    Decline,
    Close(CloseMethod),
}

#[derive(Debug, Default)]
enum NextCall {
    #[default]
    Ring,
    ConnectEarly,
    Fail(String),
    Hang,
    Delay(Duration),
}

#[derive(Debug)]
struct CallShared {
    events: mpsc::UnboundedSender<CallEvent>,
    connected: AtomicBool,
    capabilities: SessionCapabilities,
    operations: Mutex<Vec<SessionOp>>,
    failing: Mutex<Vec<SessionOp>>,
    media_delay: Mutex<Duration>,
}

impl CallShared {
    /// Mute and hold changes, which take `media_delay` to complete
    async fn perform_media(&self, op: SessionOp) -> Result<(), SdkError> {
        let delay = *self.media_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.perform(op)
    }

    fn perform(&self, op: SessionOp) -> Result<(), SdkError> {
        let fails = self
            .failing
            .lock()
            .iter()
            .any(|f| mem::discriminant(f) == mem::discriminant(&op));
        if fails {
            return Err(SdkError::new(format!("loopback {op:?} failed")));
        }
        self.operations.lock().push(op);
        Ok(())
    }

    fn emit(&self, event: CallEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

struct LoopbackSession {
    shared: Arc<CallShared>,
}

#[async_trait]
impl SdkSession for LoopbackSession {
    async fn mute(&self) -> Result<(), SdkError> {
        self.shared.perform_media(SessionOp::Mute).await
    }

    async fn unmute(&self) -> Result<(), SdkError> {
        self.shared.perform_media(SessionOp::Unmute).await
    }

    async fn hold(&self) -> Result<(), SdkError> {
        self.shared.perform_media(SessionOp::Hold).await
    }

    async fn unhold(&self) -> Result<(), SdkError> {
        self.shared.perform_media(SessionOp::Unhold).await
    }

    async fn answer(&self) -> Result<(), SdkError> {
        self.shared.perform(SessionOp::Answer)?;
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn decline(&self) -> Result<(), SdkError> {
        self.shared.perform(SessionOp::Decline)
    }

    async fn close(&self) -> Result<(), SdkError> {
        let method = self
            .shared
            .capabilities
            .close_method()
            .ok_or_else(|| SdkError::new("session exposes no close operation"))?;
        self.shared.perform(SessionOp::Close(method))?;
        self.shared.connected.store(false, Ordering::SeqCst);
        // a real hangup is reported several times over
        for event in [CallEvent::Terminated, CallEvent::Ended, CallEvent::Bye] {
            self.shared.emit(event);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

/// Test-side handle on one loopback call
#[derive(Debug, Clone)]
pub struct LoopbackCall {
    shared: Arc<CallShared>,
}

impl LoopbackCall {
    /// Deliver an SDK event, `false` once nobody listens any more
    pub fn emit(&self, event: CallEvent) -> bool {
        self.shared.emit(event)
    }

    /// Far end answered
    pub fn connect(&self) -> bool {
        self.shared.connected.store(true, Ordering::SeqCst);
        self.emit(CallEvent::Accepted)
    }

    /// Far end hung up, reported the way SDKs do: more than once
    pub fn remote_hangup(&self) -> bool {
        self.shared.connected.store(false, Ordering::SeqCst);
        let first = self.emit(CallEvent::Terminated);
        self.emit(CallEvent::Ended);
        first
    }

    /// Make every later `op` of the same kind fail
    pub fn fail_operation(&self, op: SessionOp) {
        self.shared.failing.lock().push(op);
    }

    /// Mute and hold requests on this call take `delay` from now on
    pub fn delay_media_operations(&self, delay: Duration) {
        *self.shared.media_delay.lock() = delay;
    }

    pub fn operations(&self) -> Vec<SessionOp> {
        self.shared.operations.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    microphone_denied: Option<String>,
    start_error: Option<String>,
    next_call: NextCall,
    capabilities: Option<SessionCapabilities>,
    credentials: Option<SipCredentials>,
    invite_tx: Option<mpsc::UnboundedSender<IncomingInvite>>,
    dialled: Vec<String>,
    calls: Vec<LoopbackCall>,
}

impl LoopbackState {
    fn new_call(&mut self, connected: bool) -> SdkCall {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(CallShared {
            events: tx,
            connected: AtomicBool::new(connected),
            capabilities: self.capabilities.unwrap_or_default(),
            operations: Mutex::new(Vec::new()),
            failing: Mutex::new(Vec::new()),
            media_delay: Mutex::new(Duration::ZERO),
        });
        self.calls.push(LoopbackCall {
            shared: shared.clone(),
        });
        SdkCall {
            session: Box::new(LoopbackSession { shared }),
            events: rx,
        }
    }
}

/// Scriptable in-process [`TelephonyAdapter`]
#[derive(Debug, Clone, Default)]
pub struct LoopbackAdapter {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for scripting the far end
    pub fn remote(&self) -> LoopbackRemote {
        LoopbackRemote {
            state: self.state.clone(),
        }
    }

    /// Credentials accepted by the loopback service
    pub fn credentials() -> SipCredentials {
        SipCredentials {
            username: "loopback".to_string(),
            password: "loopback".to_string(),
            domain: "loopback.invalid".to_string(),
            ws_server: "ws://loopback.invalid".to_string(),
            display_name: Some("Loopback".to_string()),
            caller_id: None,
        }
    }
}

#[async_trait]
impl TelephonyAdapter for LoopbackAdapter {
    async fn start(&self, credentials: &SipCredentials) -> Result<InviteStream, SdkError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.start_error.clone() {
            return Err(SdkError::new(reason));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.invite_tx = Some(tx);
        state.credentials = Some(credentials.clone());
        Ok(rx)
    }

    async fn request_microphone(&self) -> Result<(), SdkError> {
        match self.state.lock().microphone_denied.clone() {
            Some(reason) => Err(SdkError::new(reason)),
            None => Ok(()),
        }
    }

    async fn call(&self, number: &str) -> Result<SdkCall, SdkError> {
        let next = {
            let mut state = self.state.lock();
            state.dialled.push(number.to_string());
            mem::take(&mut state.next_call)
        };
        match next {
            NextCall::Hang => return std::future::pending().await,
            NextCall::Delay(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }

        let mut state = self.state.lock();
        match next {
            NextCall::Ring | NextCall::Hang | NextCall::Delay(_) => Ok(state.new_call(false)),
            NextCall::ConnectEarly => Ok(state.new_call(true)),
            NextCall::Fail(reason) => Err(SdkError::new(reason)),
        }
    }
}

/// Far-end controls for a [`LoopbackAdapter`]
#[derive(Debug, Clone)]
pub struct LoopbackRemote {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackRemote {
    pub fn deny_microphone(&self, reason: impl Into<String>) {
        self.state.lock().microphone_denied = Some(reason.into());
    }

    pub fn allow_microphone(&self) {
        self.state.lock().microphone_denied = None;
    }

    pub fn fail_start(&self, reason: impl Into<String>) {
        self.state.lock().start_error = Some(reason.into());
    }

    /// The next `call()` is rejected by the SDK
    pub fn fail_next_call(&self, reason: impl Into<String>) {
        self.state.lock().next_call = NextCall::Fail(reason.into());
    }

    /// The next `call()` never resolves
    pub fn hang_next_call(&self) {
        self.state.lock().next_call = NextCall::Hang;
    }

    /// The next `call()` rings only after `delay`
    pub fn delay_next_call(&self, delay: Duration) {
        self.state.lock().next_call = NextCall::Delay(delay);
    }

    /// The next `call()` resolves with a session that is already connected
    pub fn connect_next_call_early(&self) {
        self.state.lock().next_call = NextCall::ConnectEarly;
    }

    /// Close capabilities of sessions created from now on
    pub fn set_capabilities(&self, capabilities: SessionCapabilities) {
        self.state.lock().capabilities = Some(capabilities);
    }

    /// Ring the softphone, `None` if the adapter was never started
    pub fn invite(&self, display_name: Option<&str>, number: Option<&str>) -> Option<LoopbackCall> {
        let mut state = self.state.lock();
        let tx = state.invite_tx.clone()?;
        let call = state.new_call(false);
        let handle = state.calls.last().cloned();
        let invite = IncomingInvite {
            remote: RemoteIdentity {
                display_name: display_name.map(str::to_string),
                number: number.map(str::to_string),
            },
            call,
        };
        tx.send(invite).ok()?;
        handle
    }

    /// Most recently created session
    pub fn last_call(&self) -> Option<LoopbackCall> {
        self.state.lock().calls.last().cloned()
    }

    pub fn calls(&self) -> Vec<LoopbackCall> {
        self.state.lock().calls.clone()
    }

    /// Numbers handed to `call()`, in order
    pub fn dialled(&self) -> Vec<String> {
        self.state.lock().dialled.clone()
    }

    /// Credentials the adapter was started with
    pub fn credentials(&self) -> Option<SipCredentials> {
        self.state.lock().credentials.clone()
    }
}

/// [`Provisioner`] that hands out fixed credentials
#[derive(Debug, Clone)]
pub struct StaticProvisioner {
    credentials: SipCredentials,
}

impl StaticProvisioner {
    pub fn new(credentials: SipCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn provision(&self) -> PhoneResult<SipCredentials> {
        Ok(self.credentials.clone())
    }
}

/// [`CallLogger`] that keeps records in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingCallLogger {
    records: Arc<Mutex<Vec<CallLogRecord>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl RecordingCallLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every submission with `reason`
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock() = Some(reason.into());
    }

    pub fn records(&self) -> Vec<CallLogRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl CallLogger for RecordingCallLogger {
    async fn log_call(&self, record: &CallLogRecord) -> PhoneResult<()> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(PhoneError::logging_failed(reason));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}
