//! Timer bookkeeping for the active call
//!
//! Each timer is a spawned task held in a [`TimerSlot`]. Arming a slot
//! aborts whatever it held before; clearing reports whether a live timer
//! was actually cancelled. A task that is itself firing must `detach` its
//! own slot before touching the others so it is not aborted mid-flight.

use tokio::task::JoinHandle;

/// Holder for one timer task
#[derive(Debug, Default)]
pub struct TimerSlot {
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    /// Replace the held task, aborting the previous one
    pub fn arm(&mut self, handle: JoinHandle<()>) {
        self.cancel();
        self.handle = Some(handle);
    }

    /// Abort the held task, returns `true` if it had not yet finished
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let live = !handle.is_finished();
                handle.abort();
                live
            }
            None => false,
        }
    }

    /// Forget the held task without aborting it
    pub fn detach(&mut self) {
        self.handle.take();
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// All timers owned by one softphone
#[derive(Debug, Default)]
pub struct CallTimers {
    /// Connected-call duration tick
    pub duration_tick: TimerSlot,
    /// Unanswered inbound call
    pub auto_decline: TimerSlot,
    /// Post-call return to idle
    pub reset: TimerSlot,
}

impl CallTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_all(&mut self) {
        self.duration_tick.cancel();
        self.auto_decline.cancel();
        self.reset.cancel();
    }

    pub fn any_armed(&self) -> bool {
        self.duration_tick.is_armed() || self.auto_decline.is_armed() || self.reset.is_armed()
    }
}

impl Drop for CallTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
