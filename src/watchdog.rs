/// Inactivity watchdog: one countdown slot and the rules for arming it.
///
/// Only a content change can start a countdown. Content changes, user
/// selection activity and terminal focus all restart an armed countdown at
/// its full duration. When a countdown runs out the alert sink fires once and
/// the watchdog is idle again, ready for the next edit.
///
/// ```text
///               on_code_change
///   Idle ────────────────────────► Armed ◄──┐ any intake
///    ▲                               │  └────┘ (rescheduled)
///    └───────── expiry / dispose ────┘
/// ```
use crate::alert::AlertSink;
use crate::config::WatchdogConfig;
use crate::timer::{Countdown, CountdownId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Armed,
}

/// Read-only view of the watchdog state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSnapshot {
    pub phase: Phase,
    /// Time left on the armed countdown.
    pub remaining: Option<Duration>,
    pub last_change: Option<Instant>,
    pub last_focus: Option<Instant>,
    pub active: bool,
}

struct WatchdogState {
    config: WatchdogConfig,
    timer: Option<Countdown>,
    next_id: u64,
    last_change: Option<Instant>,
    /// Recorded for every terminal focus, never consulted when scheduling.
    last_focus: Option<Instant>,
    active: bool,
}

impl WatchdogState {
    fn accepting(&self) -> bool {
        self.active && self.config.enabled
    }

    fn cancel_timer(&mut self) {
        if let Some(countdown) = self.timer.take() {
            debug!(countdown = %countdown.id(), "countdown canceled");
            countdown.cancel();
        }
    }
}

fn lock(state: &Mutex<WatchdogState>) -> MutexGuard<'_, WatchdogState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the single countdown slot.
///
/// Every method takes `&self`, so the controller can be shared behind an
/// `Arc` between the event router and the config reload callback. Countdowns
/// are tokio tasks: arming must happen inside a tokio runtime. Dropping the
/// controller disposes it.
pub struct WatchdogController {
    state: Arc<Mutex<WatchdogState>>,
    sink: Arc<dyn AlertSink>,
}

impl WatchdogController {
    pub fn new(config: WatchdogConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            state: Arc::new(Mutex::new(WatchdogState {
                config,
                timer: None,
                next_id: 0,
                last_change: None,
                last_focus: None,
                active: true,
            })),
            sink,
        }
    }

    /// A relevant document changed. Arms an idle watchdog, resets an armed one.
    pub fn on_code_change(&self) {
        let mut state = lock(&self.state);
        if !state.accepting() {
            return;
        }
        if state.timer.is_some() {
            debug!("code change, resetting countdown");
        } else {
            info!("code change, activating countdown");
            state.last_change = Some(Instant::now());
        }
        self.arm(&mut state);
    }

    /// Keyboard or mouse selection. Only extends an armed countdown.
    pub fn on_user_activity(&self) {
        let mut state = lock(&self.state);
        if !state.accepting() {
            return;
        }
        if state.timer.is_some() {
            debug!("user activity, resetting countdown");
            self.arm(&mut state);
        } else {
            debug!("user activity, no countdown to reset");
        }
    }

    /// A terminal gained focus or opened. Only extends an armed countdown.
    pub fn on_terminal_focus(&self) {
        let mut state = lock(&self.state);
        if !state.accepting() {
            return;
        }
        state.last_focus = Some(Instant::now());
        if state.timer.is_some() {
            debug!("terminal focus, resetting countdown");
            self.arm(&mut state);
        } else {
            debug!("terminal focus, no countdown to reset");
        }
    }

    /// Swap in a new config. An armed countdown keeps its current deadline.
    pub fn update_configuration(&self, config: WatchdogConfig) {
        let mut state = lock(&self.state);
        if !state.active {
            debug!("configuration update after dispose ignored");
            return;
        }
        info!(
            enabled = config.enabled,
            countdown_secs = config.countdown_duration.as_secs(),
            "watchdog configuration updated"
        );
        state.config = config;
    }

    /// Cancel any pending countdown and stop accepting events for good.
    pub fn dispose(&self) {
        let mut state = lock(&self.state);
        if !state.active {
            return;
        }
        state.cancel_timer();
        state.active = false;
        info!("watchdog disposed");
    }

    pub fn config(&self) -> WatchdogConfig {
        lock(&self.state).config
    }

    pub fn snapshot(&self) -> WatchdogSnapshot {
        let state = lock(&self.state);
        WatchdogSnapshot {
            phase: if state.timer.is_some() {
                Phase::Armed
            } else {
                Phase::Idle
            },
            remaining: state.timer.as_ref().map(Countdown::remaining),
            last_change: state.last_change,
            last_focus: state.last_focus,
            active: state.active,
        }
    }

    /// Cancel-then-reschedule. Used for both arming and resetting.
    fn arm(&self, state: &mut WatchdogState) {
        state.cancel_timer();

        let id = CountdownId(state.next_id);
        state.next_id += 1;
        let duration = state.config.countdown_duration;

        let shared = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        state.timer = Some(Countdown::schedule(id, duration, move || {
            expire(&shared, sink.as_ref(), id)
        }));

        let alert_at = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| chrono::Local::now().checked_add_signed(d))
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        debug!(
            countdown = %id,
            countdown_secs = duration.as_secs(),
            %alert_at,
            "countdown armed"
        );
    }
}

/// Expiry callback. Does nothing unless `id` is still the live countdown,
/// so a callback that lost a race with cancel cannot clear a newer countdown
/// or fire twice.
fn expire(shared: &Mutex<WatchdogState>, sink: &dyn AlertSink, id: CountdownId) {
    {
        let mut state = lock(shared);
        match state.timer.as_ref() {
            Some(live) if live.id() == id => {}
            _ => {
                debug!(countdown = %id, "stale countdown expiry ignored");
                return;
            }
        }
        // Idle before the sink runs, so a failing sink cannot wedge the slot.
        state.timer = None;
    }

    info!(countdown = %id, "inactivity countdown elapsed, firing alert");
    if let Err(e) = sink.fire() {
        warn!(error = %e, "alert delivery failed");
    }
}

impl Drop for WatchdogController {
    fn drop(&mut self) {
        self.dispose();
    }
}
