//! Call session state machine
//!
//! [`CallMachine`] is a synchronous reducer with no I/O. Every SDK
//! subscription, user action and timer expiry is funnelled through one of
//! its methods, which mutate the single [`CallSession`] and return the
//! [`Effect`]s the driver must carry out (timers, SDK calls, the log POST,
//! notifications).
//!
//! ```text
//!            place / invite            first connection signal
//!   Idle ─────────────────────▶ Ringing ───────────────────────▶ Connected
//!    ▲                             │                                  │
//!    │  auto-decline / decline /   │                first termination │
//!    │  rejected before answer     │                          signal  ▼
//!    └─────────────────────────────┘◀──────── reset delay ──── Disconnected
//! ```
//!
//! The SDK may fire several connection-style events (`progress`,
//! `accepted`, `confirmed`, `connecting`) and several termination-style
//! events (`terminated`, `ended`, `bye`, ...) for a single call. Only the
//! first of each kind has an effect: the duration timer is never restarted
//! and the completion log is issued at most once per session.

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::call::{CallContext, CallDirection, CallLogRecord, CallSession, CallStatus, SessionId};
use crate::error::{PhoneError, PhoneResult};
use crate::events::{unanswered_notice, CallEvent, PhoneEvent, UserNotice};

/// Side effect requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Start the connected-call duration tick
    StartDurationTimer,
    /// Stop the duration tick
    StopDurationTimer,
    /// Arm the unanswered-inbound-call timer
    ArmAutoDecline,
    /// Cancel the unanswered-inbound-call timer
    ClearAutoDecline,
    /// Decline the ringing SDK session
    DeclineSession,
    /// Issue the completion log request
    SubmitLog(CallLogRecord),
    /// Completion log skipped because the context is incomplete
    SkipLog {
        session_id: SessionId,
        missing: &'static str,
    },
    /// Return to idle after the post-call delay
    ScheduleReset,
    /// Cancel every timer owned by the call
    CancelTimers,
    /// Publish a notification
    Emit(PhoneEvent),
}

/// Owner of the (at most one) active call
#[derive(Debug, Default)]
pub struct CallMachine {
    session: Option<CallSession>,
    /// Set by the first connection signal, cleared by the first termination
    connected_at: Option<Instant>,
    auto_decline_armed: bool,
}

impl CallMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn status(&self) -> CallStatus {
        self.session
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(CallStatus::Idle)
    }

    pub fn is_idle(&self) -> bool {
        self.session.is_none()
    }

    pub fn active_session_id(&self) -> Option<&SessionId> {
        self.session.as_ref().map(|s| &s.session_id)
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.active_session_id() == Some(session_id)
    }

    /// Whether the duration timer has been started for the current call
    pub fn timer_running(&self) -> bool {
        self.connected_at.is_some()
    }

    /// `Idle → Ringing` for a call placed by the user
    pub fn begin_outbound(&mut self, context: CallContext) -> PhoneResult<Vec<Effect>> {
        self.begin(context, CallDirection::Outbound)
    }

    /// `Idle → Ringing` for an arriving invite, arms the auto-decline timer
    pub fn begin_inbound(&mut self, context: CallContext, caller: impl Into<String>) -> PhoneResult<Vec<Effect>> {
        let session_id = context.session_id.clone();
        let mut effects = self.begin(context, CallDirection::Inbound)?;
        self.auto_decline_armed = true;
        effects.push(Effect::ArmAutoDecline);
        effects.push(Effect::Emit(PhoneEvent::IncomingCall {
            session_id,
            caller: caller.into(),
        }));
        Ok(effects)
    }

    fn begin(&mut self, mut context: CallContext, direction: CallDirection) -> PhoneResult<Vec<Effect>> {
        if !self.is_idle() {
            return Err(PhoneError::CallInProgress);
        }
        context.direction = direction;
        let session = CallSession::new(context);
        let session_id = session.session_id.clone();
        info!(session_id = %session_id, direction = %direction, number = %session.phone_number, "Call session created");

        self.session = Some(session);
        self.connected_at = None;
        self.auto_decline_armed = false;
        Ok(vec![state_changed(session_id, CallStatus::Idle, CallStatus::Ringing)])
    }

    /// Apply one SDK (or local hang-up) event to the session it belongs to
    pub fn handle(&mut self, session_id: &SessionId, event: CallEvent, now: Instant) -> Vec<Effect> {
        if !self.is_active(session_id) {
            debug!(session_id = %session_id, event = %event, "Ignoring event for inactive session");
            return Vec::new();
        }
        if event.is_connection_signal() {
            self.on_connection_signal(event, now)
        } else {
            self.on_termination_signal(event, now)
        }
    }

    fn on_connection_signal(&mut self, event: CallEvent, now: Instant) -> Vec<Effect> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.status != CallStatus::Ringing || self.connected_at.is_some() {
            debug!(session_id = %session.session_id, event = %event, status = %session.status, "Connection signal ignored");
            return Vec::new();
        }

        session.status = CallStatus::Connected;
        self.connected_at = Some(now);
        info!(session_id = %session.session_id, event = %event, "Call connected");

        let mut effects = Vec::new();
        if std::mem::take(&mut self.auto_decline_armed) {
            effects.push(Effect::ClearAutoDecline);
        }
        effects.push(Effect::StartDurationTimer);
        effects.push(state_changed(
            session.session_id.clone(),
            CallStatus::Ringing,
            CallStatus::Connected,
        ));
        effects
    }

    fn on_termination_signal(&mut self, event: CallEvent, now: Instant) -> Vec<Effect> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.logged {
            debug!(session_id = %session.session_id, event = %event, "Duplicate termination signal ignored");
            return Vec::new();
        }

        match session.status {
            CallStatus::Ringing => {
                info!(session_id = %session.session_id, event = %event, "Call ended before it connected");
                let direction = session.direction;
                let mut effects = Vec::new();
                if std::mem::take(&mut self.auto_decline_armed) {
                    effects.push(Effect::ClearAutoDecline);
                }
                if event != CallEvent::HangUp {
                    effects.push(Effect::Emit(PhoneEvent::Notice(unanswered_notice(direction, event))));
                }
                effects.extend(self.reset());
                effects
            }
            CallStatus::Connected => {
                // Freeze the duration before the timer reference is dropped
                let duration = self
                    .connected_at
                    .take()
                    .map(|start| now.saturating_duration_since(start).as_secs())
                    .unwrap_or(session.duration_seconds);
                session.duration_seconds = duration;
                session.status = CallStatus::Disconnected;
                session.logged = true;
                info!(session_id = %session.session_id, event = %event, duration, "Call disconnected");

                let mut effects = vec![
                    Effect::StopDurationTimer,
                    state_changed(
                        session.session_id.clone(),
                        CallStatus::Connected,
                        CallStatus::Disconnected,
                    ),
                ];
                match session.context.log_record(duration) {
                    Some(record) => effects.push(Effect::SubmitLog(record)),
                    None => effects.push(Effect::SkipLog {
                        session_id: session.session_id.clone(),
                        missing: session.context.missing_field().unwrap_or("client_id"),
                    }),
                }
                effects.push(Effect::ScheduleReset);
                effects
            }
            CallStatus::Disconnected | CallStatus::Idle => Vec::new(),
        }
    }

    /// Refresh the running duration
    pub fn tick(&mut self, now: Instant) -> Vec<Effect> {
        let (Some(session), Some(start)) = (self.session.as_mut(), self.connected_at) else {
            return Vec::new();
        };
        if session.status != CallStatus::Connected {
            return Vec::new();
        }
        let seconds = now.saturating_duration_since(start).as_secs();
        if seconds <= session.duration_seconds {
            return Vec::new();
        }
        session.duration_seconds = seconds;
        vec![Effect::Emit(PhoneEvent::DurationTick {
            session_id: session.session_id.clone(),
            seconds,
        })]
    }

    /// Unanswered inbound call timed out
    pub fn auto_decline_expired(&mut self, session_id: &SessionId) -> Vec<Effect> {
        let ringing_inbound = self.session.as_ref().is_some_and(|s| {
            s.session_id == *session_id
                && s.status == CallStatus::Ringing
                && s.direction == CallDirection::Inbound
        });
        if !ringing_inbound || !self.auto_decline_armed {
            return Vec::new();
        }

        info!(session_id = %session_id, "Auto-declining unanswered call");
        self.auto_decline_armed = false;
        let mut effects = vec![Effect::ClearAutoDecline, Effect::DeclineSession];
        effects.extend(self.reset());
        effects.push(Effect::Emit(PhoneEvent::Notice(UserNotice::info(
            "Missed Call",
            "The incoming call was not answered.",
        ))));
        effects
    }

    /// Disarm the auto-decline timer ahead of an answer or decline
    pub fn clear_auto_decline(&mut self) -> Vec<Effect> {
        if std::mem::take(&mut self.auto_decline_armed) {
            vec![Effect::ClearAutoDecline]
        } else {
            Vec::new()
        }
    }

    /// Return to idle unconditionally
    pub fn reset(&mut self) -> Vec<Effect> {
        self.connected_at = None;
        self.auto_decline_armed = false;
        let mut effects = vec![Effect::CancelTimers];
        if let Some(session) = self.session.take() {
            debug!(session_id = %session.session_id, "Call session reset");
            if session.status != CallStatus::Idle {
                effects.push(state_changed(session.session_id, session.status, CallStatus::Idle));
            }
        }
        effects
    }

    /// Return to idle only if `session_id` is still the active call
    pub fn reset_session(&mut self, session_id: &SessionId) -> Vec<Effect> {
        if self.is_active(session_id) {
            self.reset()
        } else {
            Vec::new()
        }
    }

    /// Record an SDK-confirmed mute change
    pub fn set_muted(&mut self, muted: bool) -> Vec<Effect> {
        match self.session.as_mut() {
            Some(session) if session.is_muted != muted => {
                session.is_muted = muted;
                vec![Effect::Emit(PhoneEvent::MuteChanged {
                    session_id: session.session_id.clone(),
                    muted,
                })]
            }
            _ => Vec::new(),
        }
    }

    /// Record an SDK-confirmed hold change
    pub fn set_on_hold(&mut self, on_hold: bool) -> Vec<Effect> {
        match self.session.as_mut() {
            Some(session) if session.is_on_hold != on_hold => {
                session.is_on_hold = on_hold;
                vec![Effect::Emit(PhoneEvent::HoldChanged {
                    session_id: session.session_id.clone(),
                    on_hold,
                })]
            }
            _ => Vec::new(),
        }
    }
}

fn state_changed(session_id: SessionId, previous: CallStatus, current: CallStatus) -> Effect {
    Effect::Emit(PhoneEvent::StateChanged {
        session_id,
        previous,
        current,
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallAssociation;
    use std::time::Duration;

    const TERMINATIONS: [CallEvent; 7] = [
        CallEvent::Terminated,
        CallEvent::Ended,
        CallEvent::Bye,
        CallEvent::Disposed,
        CallEvent::Cancel,
        CallEvent::Rejected,
        CallEvent::Failed,
    ];

    fn context(assoc: &CallAssociation) -> CallContext {
        CallContext::new(assoc, "+447912345678", CallDirection::Outbound)
    }

    fn outbound(machine: &mut CallMachine) -> SessionId {
        let ctx = context(&CallAssociation::new("client-1").with_person("person-1"));
        let id = ctx.session_id.clone();
        machine.begin_outbound(ctx).unwrap();
        id
    }

    fn inbound(machine: &mut CallMachine) -> SessionId {
        let ctx = context(&CallAssociation::new("client-1"));
        let id = ctx.session_id.clone();
        machine.begin_inbound(ctx, "Alice").unwrap();
        id
    }

    fn log_count(effects: &[Effect]) -> usize {
        effects.iter().filter(|e| matches!(e, Effect::SubmitLog(_))).count()
    }

    fn count(effects: &[Effect], wanted: &Effect) -> usize {
        effects.iter().filter(|e| *e == wanted).count()
    }

    #[test]
    fn test_outbound_starts_ringing() {
        let mut machine = CallMachine::new();
        assert_eq!(machine.status(), CallStatus::Idle);
        let id = outbound(&mut machine);
        assert_eq!(machine.status(), CallStatus::Ringing);
        assert_eq!(machine.active_session_id(), Some(&id));
        assert_eq!(machine.session().unwrap().direction, CallDirection::Outbound);
    }

    #[test]
    fn test_second_call_rejected_while_active() {
        let mut machine = CallMachine::new();
        outbound(&mut machine);
        let err = machine
            .begin_outbound(context(&CallAssociation::new("client-2")))
            .unwrap_err();
        assert!(matches!(err, PhoneError::CallInProgress));
    }

    #[test]
    fn test_first_connection_signal_starts_timer_once() {
        let mut machine = CallMachine::new();
        let id = outbound(&mut machine);
        let t0 = Instant::now();

        let effects = machine.handle(&id, CallEvent::Progress, t0);
        assert_eq!(count(&effects, &Effect::StartDurationTimer), 1);
        assert_eq!(machine.status(), CallStatus::Connected);

        for ev in [CallEvent::Accepted, CallEvent::Confirmed, CallEvent::Connecting, CallEvent::Progress] {
            let effects = machine.handle(&id, ev, t0 + Duration::from_secs(5));
            assert!(effects.is_empty(), "{ev} restarted the timer");
        }
        assert!(machine.timer_running());
    }

    #[test]
    fn test_any_termination_sequence_logs_exactly_once() {
        // each rotation of the termination events
        for start in 0..TERMINATIONS.len() {
            let mut machine = CallMachine::new();
            let id = outbound(&mut machine);
            let t0 = Instant::now();
            machine.handle(&id, CallEvent::Accepted, t0);

            let mut logs = 0;
            for i in 0..TERMINATIONS.len() {
                let ev = TERMINATIONS[(start + i) % TERMINATIONS.len()];
                logs += log_count(&machine.handle(&id, ev, t0 + Duration::from_secs(3)));
            }
            logs += log_count(&machine.handle(&id, CallEvent::HangUp, t0 + Duration::from_secs(9)));
            assert_eq!(logs, 1, "starting at {:?}", TERMINATIONS[start]);
            assert!(machine.session().unwrap().logged);
        }
    }

    #[test]
    fn test_duration_frozen_at_first_termination() {
        let mut machine = CallMachine::new();
        let id = outbound(&mut machine);
        let t0 = Instant::now();

        machine.handle(&id, CallEvent::Progress, t0);
        machine.handle(&id, CallEvent::Confirmed, t0 + Duration::from_secs(2));

        let effects = machine.handle(&id, CallEvent::Terminated, t0 + Duration::from_secs(45));
        machine.handle(&id, CallEvent::Ended, t0 + Duration::from_secs(45));
        machine.handle(&id, CallEvent::Bye, t0 + Duration::from_secs(47));

        let record = effects
            .iter()
            .find_map(|e| match e {
                Effect::SubmitLog(r) => Some(r.clone()),
                _ => None,
            })
            .expect("log effect");
        assert_eq!(record.duration, 45);
        assert_eq!(record.session_id, id);
        assert_eq!(record.client_id, "client-1");
        assert_eq!(record.person_id.as_deref(), Some("person-1"));

        // ticks after termination do not move the frozen value
        assert!(machine.tick(t0 + Duration::from_secs(60)).is_empty());
        assert_eq!(machine.session().unwrap().duration_seconds, 45);
        assert_eq!(machine.status(), CallStatus::Disconnected);
    }

    #[test]
    fn test_termination_effect_order() {
        let mut machine = CallMachine::new();
        let id = outbound(&mut machine);
        let t0 = Instant::now();
        machine.handle(&id, CallEvent::Accepted, t0);

        let effects = machine.handle(&id, CallEvent::Bye, t0 + Duration::from_secs(1));
        assert_eq!(effects.first(), Some(&Effect::StopDurationTimer));
        assert_eq!(effects.last(), Some(&Effect::ScheduleReset));
    }

    #[test]
    fn test_missing_client_skips_log() {
        let mut machine = CallMachine::new();
        let ctx = context(&CallAssociation::unassociated());
        let id = ctx.session_id.clone();
        machine.begin_outbound(ctx).unwrap();
        let t0 = Instant::now();
        machine.handle(&id, CallEvent::Accepted, t0);

        let effects = machine.handle(&id, CallEvent::Terminated, t0 + Duration::from_secs(10));
        assert_eq!(log_count(&effects), 0);
        assert!(effects.contains(&Effect::SkipLog {
            session_id: id.clone(),
            missing: "client_id"
        }));
        // the guard still trips so later events stay silent
        assert!(machine.handle(&id, CallEvent::Ended, t0 + Duration::from_secs(11)).is_empty());
    }

    #[test]
    fn test_tick_only_while_connected() {
        let mut machine = CallMachine::new();
        let id = outbound(&mut machine);
        let t0 = Instant::now();
        assert!(machine.tick(t0 + Duration::from_secs(3)).is_empty());

        machine.handle(&id, CallEvent::Accepted, t0);
        let effects = machine.tick(t0 + Duration::from_millis(2500));
        assert!(matches!(
            effects.as_slice(),
            [Effect::Emit(PhoneEvent::DurationTick { seconds: 2, .. })]
        ));
        assert_eq!(machine.session().unwrap().duration_seconds, 2);
        // same second again is not re-emitted
        assert!(machine.tick(t0 + Duration::from_millis(2900)).is_empty());
    }

    #[test]
    fn test_stale_session_events_ignored() {
        let mut machine = CallMachine::new();
        let old = outbound(&mut machine);
        machine.reset();
        let current = outbound(&mut machine);
        assert_ne!(old, current);

        let t0 = Instant::now();
        assert!(machine.handle(&old, CallEvent::Accepted, t0).is_empty());
        assert_eq!(machine.status(), CallStatus::Ringing);
        assert!(machine.handle(&old, CallEvent::Terminated, t0).is_empty());
    }

    #[test]
    fn test_events_without_session_ignored() {
        let mut machine = CallMachine::new();
        let stray = SessionId::new();
        assert!(machine.handle(&stray, CallEvent::Terminated, Instant::now()).is_empty());
        assert!(machine.auto_decline_expired(&stray).is_empty());
    }

    #[test]
    fn test_inbound_arms_auto_decline() {
        let mut machine = CallMachine::new();
        let ctx = context(&CallAssociation::new("client-1"));
        let effects = machine.begin_inbound(ctx, "Alice").unwrap();
        assert_eq!(count(&effects, &Effect::ArmAutoDecline), 1);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Emit(PhoneEvent::IncomingCall { caller, .. }) if caller == "Alice")));
        assert_eq!(machine.session().unwrap().direction, CallDirection::Inbound);
    }

    #[test]
    fn test_auto_decline_clears_timer_exactly_once() {
        let mut machine = CallMachine::new();
        let id = inbound(&mut machine);

        let effects = machine.auto_decline_expired(&id);
        assert_eq!(count(&effects, &Effect::ClearAutoDecline), 1);
        assert_eq!(count(&effects, &Effect::DeclineSession), 1);
        assert_eq!(log_count(&effects), 0);
        assert_eq!(machine.status(), CallStatus::Idle);

        assert!(machine.auto_decline_expired(&id).is_empty());
    }

    #[test]
    fn test_answered_call_disarms_auto_decline() {
        let mut machine = CallMachine::new();
        let id = inbound(&mut machine);

        let effects = machine.handle(&id, CallEvent::Accepted, Instant::now());
        assert_eq!(count(&effects, &Effect::ClearAutoDecline), 1);
        assert!(machine.auto_decline_expired(&id).is_empty());
        assert_eq!(machine.status(), CallStatus::Connected);
    }

    #[test]
    fn test_clear_auto_decline_is_one_shot() {
        let mut machine = CallMachine::new();
        inbound(&mut machine);
        assert_eq!(machine.clear_auto_decline(), vec![Effect::ClearAutoDecline]);
        assert!(machine.clear_auto_decline().is_empty());
    }

    #[test]
    fn test_rejected_while_ringing_returns_to_idle_without_log() {
        let mut machine = CallMachine::new();
        let id = outbound(&mut machine);
        let effects = machine.handle(&id, CallEvent::Rejected, Instant::now());
        assert_eq!(log_count(&effects), 0);
        assert!(effects.iter().any(|e| matches!(e, Effect::Emit(PhoneEvent::Notice(_)))));
        assert!(machine.is_idle());
    }

    #[test]
    fn test_user_cancel_while_ringing_is_silent() {
        let mut machine = CallMachine::new();
        let id = outbound(&mut machine);
        let effects = machine.handle(&id, CallEvent::HangUp, Instant::now());
        assert!(!effects.iter().any(|e| matches!(e, Effect::Emit(PhoneEvent::Notice(_)))));
        assert!(machine.is_idle());
    }

    #[test]
    fn test_reset_session_requires_match() {
        let mut machine = CallMachine::new();
        let id = outbound(&mut machine);
        assert!(machine.reset_session(&SessionId::new()).is_empty());
        assert_eq!(machine.status(), CallStatus::Ringing);
        assert!(!machine.reset_session(&id).is_empty());
        assert!(machine.is_idle());
    }

    #[test]
    fn test_reset_when_idle_emits_no_state_change() {
        let mut machine = CallMachine::new();
        assert_eq!(machine.reset(), vec![Effect::CancelTimers]);
    }

    #[test]
    fn test_mute_and_hold_flags() {
        let mut machine = CallMachine::new();
        assert!(machine.set_muted(true).is_empty());

        let id = outbound(&mut machine);
        machine.handle(&id, CallEvent::Accepted, Instant::now());
        assert_eq!(machine.set_muted(true).len(), 1);
        assert!(machine.set_muted(true).is_empty());
        assert!(machine.session().unwrap().is_muted);

        assert_eq!(machine.set_on_hold(true).len(), 1);
        assert!(machine.session().unwrap().is_on_hold);
        assert_eq!(machine.set_on_hold(false).len(), 1);
        assert!(!machine.session().unwrap().is_on_hold);
    }
}
