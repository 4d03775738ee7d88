//! The softphone driver
//!
//! [`Softphone`] owns the one [`CallMachine`] of a widget and carries out
//! the [`Effect`]s it returns: it arms and cancels timers, talks to the SDK
//! session, submits the completion log and publishes [`PhoneEvent`]s.
//!
//! Every input (user action, SDK event, timer expiry, arriving invite)
//! takes the state lock, feeds the machine and applies the resulting
//! effects before releasing it, so transitions never interleave. Spawned
//! tasks hold only a weak reference to the phone; dropping the last
//! [`Softphone`] handle tears everything down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapter::{IncomingInvite, InviteStream, SdkCall, SdkSession, TelephonyAdapter};
use crate::api::{BackendClient, CallLogger, Provisioner};
use crate::call::{CallAssociation, CallContext, CallDirection, CallSession, CallStatus, SessionId};
use crate::config::PhoneConfig;
use crate::error::{PhoneError, PhoneResult};
use crate::events::{CallEvent, PhoneEvent};
use crate::machine::{CallMachine, Effect};
use crate::number::normalize_phone_number;
use crate::timers::CallTimers;

/// Builder for [`Softphone`]
///
/// A telephony adapter is required. The call logger and provisioner default
/// to a [`BackendClient`] built from the configuration.
///
/// ```rust
/// use link_phone_core::{CallAssociation, LoopbackAdapter, PhoneConfig, SoftphoneBuilder};
///
/// # tokio_test::block_on(async {
/// let phone = SoftphoneBuilder::new()
///     .config(PhoneConfig::default().with_country_code("44"))
///     .adapter(LoopbackAdapter::new())
///     .association(CallAssociation::new("client-42"))
///     .build()
///     .unwrap();
/// assert!(!phone.is_initialized());
/// # })
/// ```
#[derive(Default)]
pub struct SoftphoneBuilder {
    config: PhoneConfig,
    adapter: Option<Arc<dyn TelephonyAdapter>>,
    association: CallAssociation,
    call_logger: Option<Arc<dyn CallLogger>>,
    provisioner: Option<Arc<dyn Provisioner>>,
}

impl SoftphoneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: PhoneConfig) -> Self {
        self.config = config;
        self
    }

    pub fn adapter(mut self, adapter: impl TelephonyAdapter + 'static) -> Self {
        self.adapter = Some(Arc::new(adapter));
        self
    }

    /// Client and person the widget is embedded for
    pub fn association(mut self, association: CallAssociation) -> Self {
        self.association = association;
        self
    }

    pub fn call_logger(mut self, logger: impl CallLogger + 'static) -> Self {
        self.call_logger = Some(Arc::new(logger));
        self
    }

    pub fn provisioner(mut self, provisioner: impl Provisioner + 'static) -> Self {
        self.provisioner = Some(Arc::new(provisioner));
        self
    }

    pub fn build(self) -> PhoneResult<Softphone> {
        self.config.validate()?;
        let adapter = self
            .adapter
            .ok_or_else(|| PhoneError::config("a telephony adapter is required"))?;

        let (call_logger, provisioner) = match (self.call_logger, self.provisioner) {
            (Some(logger), Some(provisioner)) => (logger, provisioner),
            (logger, provisioner) => {
                let backend = Arc::new(BackendClient::new(&self.config)?);
                let logger = logger.unwrap_or_else(|| backend.clone() as Arc<dyn CallLogger>);
                let provisioner = provisioner.unwrap_or_else(|| backend as Arc<dyn Provisioner>);
                (logger, provisioner)
            }
        };

        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        Ok(Softphone {
            inner: Arc::new(Inner {
                config: self.config,
                association: RwLock::new(self.association),
                adapter,
                provisioner,
                call_logger,
                events,
                state: Mutex::new(PhoneState::default()),
                initialized: AtomicBool::new(false),
            }),
        })
    }
}

struct Inner {
    config: PhoneConfig,
    association: RwLock<CallAssociation>,
    adapter: Arc<dyn TelephonyAdapter>,
    provisioner: Arc<dyn Provisioner>,
    call_logger: Arc<dyn CallLogger>,
    events: broadcast::Sender<PhoneEvent>,
    state: Mutex<PhoneState>,
    initialized: AtomicBool,
}

#[derive(Default)]
struct PhoneState {
    machine: CallMachine,
    /// SDK session of the active call, shared with in-flight SDK requests
    sdk: Option<Arc<dyn SdkSession>>,
    timers: CallTimers,
    invite_listener: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

impl PhoneState {
    fn stop_forwarder(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

impl Drop for PhoneState {
    fn drop(&mut self) {
        self.stop_forwarder();
        if let Some(handle) = self.invite_listener.take() {
            handle.abort();
        }
    }
}

/// One softphone widget
#[derive(Clone)]
pub struct Softphone {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Softphone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Softphone")
            .field("initialized", &self.is_initialized())
            .field("association", &*self.inner.association.read())
            .finish_non_exhaustive()
    }
}

impl Softphone {
    pub fn builder() -> SoftphoneBuilder {
        SoftphoneBuilder::new()
    }

    pub fn config(&self) -> &PhoneConfig {
        &self.inner.config
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Receive notifications published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PhoneEvent> {
        self.inner.events.subscribe()
    }

    pub fn association(&self) -> CallAssociation {
        self.inner.association.read().clone()
    }

    /// Change the client/person future calls are attributed to. A call in
    /// progress keeps the context it started with.
    pub fn set_association(&self, association: CallAssociation) {
        *self.inner.association.write() = association;
    }

    /// Copy of the active call, `None` when idle
    pub async fn snapshot(&self) -> Option<CallSession> {
        self.inner.state.lock().await.machine.session().cloned()
    }

    pub async fn status(&self) -> CallStatus {
        self.inner.state.lock().await.machine.status()
    }

    /// Provision SIP credentials, start the SDK and listen for invites
    pub async fn initialize(&self) -> PhoneResult<()> {
        if self.is_initialized() {
            debug!("Softphone already initialized");
            return Ok(());
        }

        let credentials = match self.inner.provisioner.provision().await {
            Ok(credentials) => credentials,
            Err(e @ PhoneError::AdapterInit { .. }) => return Err(self.fail(e)),
            Err(e) => return Err(self.fail(PhoneError::adapter_init(e.to_string()))),
        };
        let invites = match self.inner.adapter.start(&credentials).await {
            Ok(invites) => invites,
            Err(e) => return Err(self.fail(PhoneError::adapter_init(e.message))),
        };

        let listener = self.spawn_invite_listener(invites);
        let mut state = self.inner.state.lock().await;
        if let Some(previous) = state.invite_listener.replace(listener) {
            previous.abort();
        }
        self.inner.initialized.store(true, Ordering::SeqCst);
        info!(username = %credentials.username, domain = %credentials.domain, "Softphone initialized");
        Ok(())
    }

    /// Dial `number` and return the new call's session id
    ///
    /// The microphone is requested before anything else; a refusal leaves
    /// the phone idle with no session. The SDK has the configured setup
    /// timeout to hand back a session.
    pub async fn place_call(&self, number: &str) -> PhoneResult<SessionId> {
        if !self.is_initialized() {
            return Err(PhoneError::NotInitialized);
        }
        if !self.inner.state.lock().await.machine.is_idle() {
            return Err(PhoneError::CallInProgress);
        }

        if let Err(e) = self.inner.adapter.request_microphone().await {
            warn!(reason = %e, "Microphone permission denied");
            return Err(self.fail(PhoneError::permission_denied(e.message)));
        }

        let normalized = match normalize_phone_number(number, &self.inner.config.country_code) {
            Ok(normalized) => normalized,
            Err(e) => return Err(self.fail(e)),
        };
        let context = CallContext::new(&self.association(), normalized.clone(), CallDirection::Outbound);
        let session_id = context.session_id.clone();
        {
            let mut state = self.inner.state.lock().await;
            let effects = state.machine.begin_outbound(context.clone())?;
            self.apply(&mut state, effects);
        }

        let setup_timeout = self.inner.config.call_setup_timeout();
        let outcome = match time::timeout(setup_timeout, self.inner.adapter.call(&normalized)).await {
            Ok(Ok(call)) => Ok(call),
            Ok(Err(e)) => Err(PhoneError::call_rejected(e.message)),
            Err(_) => Err(PhoneError::SetupTimeout {
                seconds: setup_timeout.as_secs(),
            }),
        };

        let mut state = self.inner.state.lock().await;
        let call = match outcome {
            Ok(call) => call,
            Err(_) if !state.machine.is_active(&session_id) => {
                info!(session_id = %session_id, "Setup ended after the call was hung up");
                return Err(PhoneError::invalid_state("call was hung up before setup completed"));
            }
            Err(err) => {
                warn!(
                    session_id = %session_id,
                    number = %normalized,
                    category = err.category(),
                    error = %err,
                    "Call setup failed"
                );
                let effects = state.machine.reset_session(&session_id);
                self.apply(&mut state, effects);
                drop(state);
                return Err(self.fail(err));
            }
        };

        if !state.machine.is_active(&session_id) {
            drop(state);
            info!(session_id = %session_id, "Call was hung up during setup, closing SDK session");
            if let Err(e) = call.session.close().await {
                warn!(session_id = %session_id, error = %e, "Failed to close abandoned SDK session");
            }
            return Err(PhoneError::invalid_state("call was hung up before setup completed"));
        }

        let SdkCall { session, events } = call;
        let session: Arc<dyn SdkSession> = Arc::from(session);
        let connected_early = session.is_connected();
        state.sdk = Some(session);
        state.stop_forwarder();
        state.forwarder = Some(self.spawn_forwarder(context, events));

        if connected_early {
            debug!(session_id = %session_id, "SDK session already connected");
            let effects = state.machine.handle(&session_id, CallEvent::Confirmed, Instant::now());
            self.apply(&mut state, effects);
        }
        Ok(session_id)
    }

    /// End the active call
    ///
    /// Safe to call at any time and any number of times. A connected call
    /// is logged (once); the phone is idle when this returns.
    pub async fn hang_up(&self) -> PhoneResult<()> {
        let mut state = self.inner.state.lock().await;
        let sdk = state.sdk.take();
        let mut effects = match state.machine.active_session_id().cloned() {
            Some(session_id) => state.machine.handle(&session_id, CallEvent::HangUp, Instant::now()),
            None => {
                debug!("Hang up with no active call");
                Vec::new()
            }
        };
        effects.extend(state.machine.reset());
        self.apply(&mut state, effects);
        drop(state);

        if let Some(sdk) = sdk {
            if let Err(e) = sdk.close().await {
                warn!(error = %e, "SDK session did not close cleanly");
            }
        }
        Ok(())
    }

    /// Flip mute on the connected call, returns the new mute state
    ///
    /// The state lock is not held while the SDK works, so SDK events and
    /// timers keep flowing. If the call ends in the meantime the result is
    /// `NoActiveCall` and nothing changes.
    pub async fn toggle_mute(&self) -> PhoneResult<bool> {
        let (sdk, session) = connected_call(&*self.inner.state.lock().await)?;
        let muted = !session.is_muted;
        let (operation, result) = if muted {
            ("mute", sdk.mute().await)
        } else {
            ("unmute", sdk.unmute().await)
        };
        if let Err(e) = result {
            warn!(session_id = %session.session_id, operation, error = %e, "Mute change failed");
            return Err(self.fail(PhoneError::sdk(operation, e.message)));
        }
        let mut state = self.inner.state.lock().await;
        still_connected(&state, &session.session_id)?;
        let effects = state.machine.set_muted(muted);
        self.apply(&mut state, effects);
        Ok(muted)
    }

    /// Flip hold on the connected call, returns the new hold state
    pub async fn toggle_hold(&self) -> PhoneResult<bool> {
        let (sdk, session) = connected_call(&*self.inner.state.lock().await)?;
        let on_hold = !session.is_on_hold;
        let (operation, result) = if on_hold {
            ("hold", sdk.hold().await)
        } else {
            ("unhold", sdk.unhold().await)
        };
        if let Err(e) = result {
            warn!(session_id = %session.session_id, operation, error = %e, "Hold change failed");
            return Err(self.fail(PhoneError::sdk(operation, e.message)));
        }
        let mut state = self.inner.state.lock().await;
        still_connected(&state, &session.session_id)?;
        let effects = state.machine.set_on_hold(on_hold);
        self.apply(&mut state, effects);
        Ok(on_hold)
    }

    /// Answer the ringing inbound call
    pub async fn answer_call(&self) -> PhoneResult<()> {
        let mut state = self.inner.state.lock().await;
        let (sdk, session_id) = ringing_inbound(&state)?;
        let effects = state.machine.clear_auto_decline();
        self.apply(&mut state, effects);

        match sdk.answer().await {
            Ok(()) => {
                info!(session_id = %session_id, "Inbound call answered");
                let effects = state.machine.handle(&session_id, CallEvent::Accepted, Instant::now());
                self.apply(&mut state, effects);
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Answer failed");
                let effects = state.machine.reset();
                self.apply(&mut state, effects);
                drop(state);
                Err(self.fail(PhoneError::sdk("answer", e.message)))
            }
        }
    }

    /// Reject the ringing inbound call
    pub async fn decline_call(&self) -> PhoneResult<()> {
        let mut state = self.inner.state.lock().await;
        let (sdk, session_id) = ringing_inbound(&state)?;
        let effects = state.machine.clear_auto_decline();
        self.apply(&mut state, effects);

        let result = sdk.decline().await;
        let effects = state.machine.reset();
        self.apply(&mut state, effects);
        match result {
            Ok(()) => info!(session_id = %session_id, "Inbound call declined"),
            Err(e) => warn!(session_id = %session_id, error = %e, "SDK decline failed"),
        }
        Ok(())
    }

    /// Stop listening for invites and end any active call
    pub async fn shutdown(&self) {
        // hang_up never fails
        let _ = self.hang_up().await;
        let mut state = self.inner.state.lock().await;
        state.timers.cancel_all();
        if let Some(listener) = state.invite_listener.take() {
            listener.abort();
        }
        self.inner.initialized.store(false, Ordering::SeqCst);
        info!("Softphone shut down");
    }

    /// Feed one SDK lifecycle event for `session_id` into the state machine.
    /// Events for any other session are ignored.
    pub async fn dispatch(&self, session_id: &SessionId, event: CallEvent) {
        self.dispatch_at(session_id, event, Instant::now()).await;
    }

    /// Like [`Softphone::dispatch`], for an event the SDK reported at `at`.
    /// Connection and termination times come from `at`, not from when the
    /// state lock was obtained.
    pub async fn dispatch_at(&self, session_id: &SessionId, event: CallEvent, at: Instant) {
        let mut state = self.inner.state.lock().await;
        let effects = state.machine.handle(session_id, event, at);
        self.apply(&mut state, effects);
    }

    async fn on_invite(&self, invite: IncomingInvite) {
        let IncomingInvite { remote, call } = invite;
        let mut state = self.inner.state.lock().await;
        if !state.machine.is_idle() {
            drop(state);
            info!(caller = %remote.display(), "Declining invite, a call is already active");
            if let Err(e) = call.session.decline().await {
                warn!(error = %e, "Failed to decline invite while busy");
            }
            return;
        }

        let number = remote.number_or_display();
        let number = normalize_phone_number(&number, &self.inner.config.country_code).unwrap_or(number);
        let context = CallContext::new(&self.association(), number, CallDirection::Inbound);
        let effects = match state.machine.begin_inbound(context.clone(), remote.display()) {
            Ok(effects) => effects,
            Err(e) => {
                error!(error = %e, "Could not register inbound call");
                return;
            }
        };

        let SdkCall { session, events } = call;
        state.sdk = Some(Arc::from(session));
        state.stop_forwarder();
        state.forwarder = Some(self.spawn_forwarder(context, events));
        self.apply(&mut state, effects);
    }

    /// Duration tick, returns `false` once the call it belongs to is gone
    async fn on_tick(&self, session_id: &SessionId) -> bool {
        let mut state = self.inner.state.lock().await;
        if !state.machine.is_active(session_id) {
            return false;
        }
        let effects = state.machine.tick(Instant::now());
        self.apply(&mut state, effects);
        true
    }

    async fn on_auto_decline(&self, session_id: &SessionId) {
        let mut state = self.inner.state.lock().await;
        state.timers.auto_decline.detach();
        let effects = state.machine.auto_decline_expired(session_id);
        self.apply(&mut state, effects);
    }

    async fn on_reset_timer(&self, session_id: &SessionId) {
        let mut state = self.inner.state.lock().await;
        state.timers.reset.detach();
        let effects = state.machine.reset_session(session_id);
        self.apply(&mut state, effects);
    }

    fn apply(&self, state: &mut PhoneState, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartDurationTimer => {
                    if let Some(session_id) = state.machine.active_session_id().cloned() {
                        let handle = self.spawn_duration_tick(session_id);
                        state.timers.duration_tick.arm(handle);
                    }
                }
                Effect::StopDurationTimer => {
                    state.timers.duration_tick.cancel();
                }
                Effect::ArmAutoDecline => {
                    if let Some(session_id) = state.machine.active_session_id().cloned() {
                        let handle = self.spawn_auto_decline(session_id);
                        state.timers.auto_decline.arm(handle);
                    }
                }
                Effect::ClearAutoDecline => {
                    let was_live = state.timers.auto_decline.cancel();
                    debug!(was_live, "Auto-decline timer cleared");
                }
                Effect::DeclineSession => {
                    if let Some(sdk) = state.sdk.take() {
                        tokio::spawn(async move {
                            if let Err(e) = sdk.decline().await {
                                warn!(error = %e, "SDK decline failed");
                            }
                        });
                    }
                }
                Effect::SubmitLog(record) => {
                    let logger = self.inner.call_logger.clone();
                    let events = self.inner.events.clone();
                    tokio::spawn(async move {
                        match logger.log_call(&record).await {
                            Ok(()) => {
                                info!(session_id = %record.session_id, duration = record.duration, "Call logged");
                                let _ = events.send(PhoneEvent::CallLogged { record });
                            }
                            Err(e) => {
                                error!(
                                    session_id = %record.session_id,
                                    category = e.category(),
                                    recoverable = e.is_recoverable(),
                                    error = %e,
                                    "Call logging failed"
                                );
                                let _ = events.send(PhoneEvent::Notice(e.user_notice()));
                            }
                        }
                    });
                }
                Effect::SkipLog { session_id, missing } => {
                    warn!(session_id = %session_id, missing, "Call not logged, context incomplete");
                    let err = PhoneError::MissingContext {
                        field: missing.to_string(),
                    };
                    self.emit(PhoneEvent::Notice(err.user_notice()));
                }
                Effect::ScheduleReset => match state.machine.active_session_id().cloned() {
                    Some(session_id) => {
                        let handle = self.spawn_reset(session_id);
                        state.timers.reset.arm(handle);
                    }
                    None => debug!("Reset not scheduled, phone already idle"),
                },
                Effect::CancelTimers => {
                    state.timers.cancel_all();
                    state.sdk = None;
                    state.stop_forwarder();
                }
                Effect::Emit(event) => self.emit(event),
            }
        }
    }

    fn emit(&self, event: PhoneEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Publish the error's notice and hand the error back
    fn fail(&self, err: PhoneError) -> PhoneError {
        debug!(category = err.category(), recoverable = err.is_recoverable(), error = %err, "Operation failed");
        self.emit(PhoneEvent::Notice(err.user_notice()));
        err
    }

    fn spawn_invite_listener(&self, mut invites: InviteStream) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(invite) = invites.recv().await {
                let Some(phone) = upgrade(&weak) else { break };
                phone.on_invite(invite).await;
            }
            debug!("Invite stream closed");
        })
    }

    /// Forward one SDK session's events, tagged with the context the call
    /// was created with
    fn spawn_forwarder(
        &self,
        context: CallContext,
        mut events: mpsc::UnboundedReceiver<CallEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let seen = Instant::now();
                let Some(phone) = upgrade(&weak) else { break };
                debug!(
                    session_id = %context.session_id,
                    number = %context.phone_number,
                    direction = %context.direction,
                    event = %event,
                    "SDK event"
                );
                phone.dispatch_at(&context.session_id, event, seen).await;
            }
        })
    }

    fn spawn_duration_tick(&self, session_id: SessionId) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.tick_interval();
        let first = Instant::now() + period;
        tokio::spawn(async move {
            let mut interval = time::interval_at(first, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(phone) = upgrade(&weak) else { break };
                if !phone.on_tick(&session_id).await {
                    break;
                }
            }
        })
    }

    fn spawn_auto_decline(&self, session_id: SessionId) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let deadline = Instant::now() + self.inner.config.auto_decline_after();
        tokio::spawn(async move {
            time::sleep_until(deadline).await;
            if let Some(phone) = upgrade(&weak) {
                phone.on_auto_decline(&session_id).await;
            }
        })
    }

    fn spawn_reset(&self, session_id: SessionId) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let deadline = Instant::now() + self.inner.config.reset_delay();
        tokio::spawn(async move {
            time::sleep_until(deadline).await;
            if let Some(phone) = upgrade(&weak) {
                phone.on_reset_timer(&session_id).await;
            }
        })
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<Softphone> {
    weak.upgrade().map(|inner| Softphone { inner })
}

fn connected_call(state: &PhoneState) -> PhoneResult<(Arc<dyn SdkSession>, CallSession)> {
    let session = state.machine.session().ok_or(PhoneError::NoActiveCall)?;
    if session.status != CallStatus::Connected {
        return Err(PhoneError::invalid_state(format!("call is {}", session.status)));
    }
    let sdk = state.sdk.clone().ok_or(PhoneError::NoActiveCall)?;
    Ok((sdk, session.clone()))
}

/// The call a mute or hold request was made for is still up
fn still_connected(state: &PhoneState, session_id: &SessionId) -> PhoneResult<()> {
    match state.machine.session() {
        Some(session) if session.session_id == *session_id && session.status == CallStatus::Connected => Ok(()),
        _ => Err(PhoneError::NoActiveCall),
    }
}

fn ringing_inbound(state: &PhoneState) -> PhoneResult<(Arc<dyn SdkSession>, SessionId)> {
    let session = state.machine.session().ok_or(PhoneError::NoActiveCall)?;
    if session.status != CallStatus::Ringing || session.direction != CallDirection::Inbound {
        return Err(PhoneError::invalid_state(format!(
            "no inbound call ringing ({} {})",
            session.direction, session.status
        )));
    }
    let sdk = state.sdk.clone().ok_or(PhoneError::NoActiveCall)?;
    Ok((sdk, session.session_id.clone()))
}
