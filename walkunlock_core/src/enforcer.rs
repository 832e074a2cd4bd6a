//! App lock enforcement.
//!
//! The enforcer is a single task that owns the active usage session, the
//! blocked set and the last-usage cache. Foreground changes, registry edits,
//! billing ticks and control commands all arrive as messages and are handled
//! one at a time, so none of that state needs a lock.
//!
//! ## Transitions
//!
//! 1. **Foreground change**: the host app or no app ends tracking. An app
//!    that is not locked ends tracking. A locked app is checked against the
//!    balance right away: unaffordable apps are blocked without ever getting a
//!    session, affordable ones get a fresh session and a billing ticker.
//! 2. **Billing tick**: folds elapsed time into the session, charges whatever
//!    whole minutes are still unpaid (capped at the available balance) and
//!    blocks once the balance can no longer cover a minute.
//! 3. **Registry change**: a tracked or blocked app that left the registry is
//!    dropped; a tracked app whose cost changed is re-evaluated from zero.
//!
//! A blocked app stays blocked until the next foreground evaluation (a
//! foreground change or an explicit re-evaluate).

use crate::config::EnforcementConfig;
use crate::foreground::ForegroundObserver;
use crate::ledger::{Redemption, StepLedger};
use crate::notify::Notifier;
use crate::session::{SessionSnapshot, UsageSession};
use crate::{Error, LockedApp, Result, SessionEnd, StepBalance, UsageSummary};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

const CONTROL_CHANNEL_CAPACITY: usize = 16;
const TICK_CHANNEL_CAPACITY: usize = 4;

/// Runtime settings for the enforcer
#[derive(Clone, Debug)]
pub struct EnforcerSettings {
    /// Our own app id; its foreground time is never tracked
    pub host_app_id: String,
    /// How often the billing ticker fires
    pub tick_interval: Duration,
}

impl From<&EnforcementConfig> for EnforcerSettings {
    fn from(config: &EnforcementConfig) -> Self {
        Self {
            host_app_id: config.host_app_id.clone(),
            tick_interval: config.tick_interval(),
        }
    }
}

/// Snapshot returned by [`AppLockEnforcer::status`]
#[derive(Clone, Debug, Serialize)]
pub struct EnforcerStatus {
    pub foreground: Option<String>,
    pub tracking: Option<SessionSnapshot>,
    pub blocked: BTreeSet<String>,
    pub last_usage: BTreeMap<String, UsageSummary>,
    pub balance: StepBalance,
}

enum Control {
    Reevaluate,
    Status {
        resp: oneshot::Sender<EnforcerStatus>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
struct Tick {
    session: Uuid,
}

/// Handle to a running enforcer task
pub struct AppLockEnforcer {
    control_tx: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

impl AppLockEnforcer {
    /// Start enforcing on the current tokio runtime
    pub fn spawn(
        settings: EnforcerSettings,
        ledger: Arc<StepLedger>,
        foreground: ForegroundObserver,
        registry: watch::Receiver<Vec<LockedApp>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (tick_tx, tick_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);

        let state = EnforcerLoop {
            settings,
            ledger,
            notifier,
            foreground_rx: foreground,
            registry_rx: registry,
            control_rx,
            tick_tx,
            tick_rx,
            foreground: None,
            active: None,
            blocked: BTreeSet::new(),
            last_usage: BTreeMap::new(),
        };
        let task = tokio::spawn(state.run());

        Self { control_tx, task }
    }

    /// Re-run the foreground evaluation (the blocking screen's "try again")
    pub async fn reevaluate(&self) -> Result<()> {
        self.control_tx
            .send(Control::Reevaluate)
            .await
            .map_err(|_| Error::EnforcerStopped)
    }

    pub async fn status(&self) -> Result<EnforcerStatus> {
        let (resp, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Status { resp })
            .await
            .map_err(|_| Error::EnforcerStopped)?;
        rx.await.map_err(|_| Error::EnforcerStopped)
    }

    /// Stop the task, ending any session and clearing the blocked set
    pub async fn shutdown(self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        if self.control_tx.send(Control::Shutdown { resp }).await.is_ok() {
            let _ = rx.await;
        }
        self.task
            .await
            .map_err(|e| Error::Other(format!("enforcer task failed: {}", e)))
    }
}

/// Periodic tick source for one session; aborted on drop
struct BillingTicker {
    handle: JoinHandle<()>,
}

impl BillingTicker {
    fn spawn(session: Uuid, period: Duration, tx: mpsc::Sender<Tick>) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.send(Tick { session }).await.is_err() {
                    break;
                }
            }
        });
        Self { handle }
    }
}

impl Drop for BillingTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct ActiveSession {
    session: UsageSession,
    _ticker: BillingTicker,
}

struct EnforcerLoop {
    settings: EnforcerSettings,
    ledger: Arc<StepLedger>,
    notifier: Arc<dyn Notifier>,
    foreground_rx: ForegroundObserver,
    registry_rx: watch::Receiver<Vec<LockedApp>>,
    control_rx: mpsc::Receiver<Control>,
    tick_tx: mpsc::Sender<Tick>,
    tick_rx: mpsc::Receiver<Tick>,
    foreground: Option<String>,
    active: Option<ActiveSession>,
    blocked: BTreeSet<String>,
    last_usage: BTreeMap<String, UsageSummary>,
}

impl EnforcerLoop {
    async fn run(mut self) {
        tracing::info!(
            host = %self.settings.host_app_id,
            tick_secs = self.settings.tick_interval.as_secs_f64(),
            "App lock enforcer started"
        );

        let initial = self.foreground_rx.borrow_and_update().clone();
        self.on_foreground_change(initial);

        let mut registry_open = true;
        let mut foreground_open = true;

        loop {
            tokio::select! {
                biased;

                changed = self.registry_rx.changed(), if registry_open => match changed {
                    Ok(()) => {
                        let apps = self.registry_rx.borrow_and_update().clone();
                        self.on_registry_change(&apps);
                    }
                    Err(_) => {
                        tracing::warn!("Registry feed closed; keeping last snapshot");
                        registry_open = false;
                    }
                },

                changed = self.foreground_rx.changed(), if foreground_open => match changed {
                    Ok(()) => {
                        let app_id = self.foreground_rx.borrow_and_update().clone();
                        self.on_foreground_change(app_id);
                    }
                    Err(_) => {
                        tracing::warn!("Foreground feed closed; keeping current state");
                        foreground_open = false;
                    }
                },

                Some(tick) = self.tick_rx.recv() => self.on_tick(tick),

                cmd = self.control_rx.recv() => match cmd {
                    Some(Control::Reevaluate) => {
                        let app_id = self.foreground.clone();
                        tracing::debug!(app = ?app_id, "Re-evaluating foreground app");
                        self.evaluate(app_id);
                    }
                    Some(Control::Status { resp }) => {
                        let _ = resp.send(self.status());
                    }
                    Some(Control::Shutdown { resp }) => {
                        self.teardown();
                        let _ = resp.send(());
                        break;
                    }
                    None => {
                        self.teardown();
                        break;
                    }
                },
            }
        }

        tracing::info!("App lock enforcer stopped");
    }

    fn on_foreground_change(&mut self, app_id: Option<String>) {
        self.foreground = app_id.clone();
        self.evaluate(app_id);
    }

    fn evaluate(&mut self, app_id: Option<String>) {
        let Some(app_id) = app_id.filter(|id| *id != self.settings.host_app_id) else {
            self.end_session(SessionEnd::LeftForeground);
            return;
        };

        let Some(app) = self.lookup(&app_id) else {
            // Not locked: nothing to track
            self.end_session(SessionEnd::LeftForeground);
            return;
        };

        // Sessions never resume across a foreground gap
        if self.tracked_app_id() != Some(app_id.as_str()) {
            self.end_session(SessionEnd::LeftForeground);
        }

        let available = self.ledger.available();
        if !app.affordable_with(available) {
            self.block(app);
            return;
        }

        if self.blocked.remove(&app_id) {
            tracing::info!(app = %app_id, available, "App unblocked");
        }

        if self.active.is_none() {
            self.start_session(app);
        }
    }

    fn on_tick(&mut self, tick: Tick) {
        let now = Instant::now();
        let foreground = self.foreground.as_deref();

        let Some(active) = self.active.as_mut() else {
            tracing::trace!(session = %tick.session, "Tick without a session");
            return;
        };
        if active.session.id() != tick.session {
            tracing::trace!(session = %tick.session, "Stale tick ignored");
            return;
        }
        if foreground != Some(active.session.app_id()) {
            return;
        }

        active.session.record_elapsed(now);
        let owed = active.session.owed();
        if owed == 0 {
            return;
        }

        let app = active.session.app().clone();
        let minutes_used = active.session.whole_minutes();
        let available = self.ledger.available();
        let actual = owed.min(available);
        let mut remaining = available;

        if actual > 0 {
            match self.ledger.redeem(actual) {
                Ok(Redemption::Committed(balance)) => {
                    active.session.record_charge(actual);
                    remaining = balance.available;
                    tracing::info!(
                        app = %app.app_id,
                        session = %tick.session,
                        charged = actual,
                        minutes_used,
                        remaining,
                        "Usage charged"
                    );
                    self.notifier
                        .on_usage_charged(&app, minutes_used, remaining);
                }
                Ok(Redemption::Rejected { requested, .. }) => {
                    tracing::warn!(app = %app.app_id, requested, "Charge rejected by ledger");
                }
                Err(e) => {
                    tracing::warn!(app = %app.app_id, "Failed to record charge: {}", e);
                }
            }
        }

        if actual < owed {
            tracing::info!(
                app = %app.app_id,
                shortfall = owed - actual,
                "Balance could not cover usage; shortfall forgiven"
            );
        }

        if remaining < app.cost_per_minute {
            self.block(app);
        }
    }

    fn on_registry_change(&mut self, apps: &[LockedApp]) {
        let tracked = self.active.as_ref().map(|a| a.session.app().clone());
        if let Some(tracked) = tracked {
            match apps.iter().find(|a| a.app_id == tracked.app_id) {
                None => {
                    tracing::info!(app = %tracked.app_id, "Tracked app unlocked");
                    self.end_session(SessionEnd::Unlocked);
                }
                Some(app) if app.cost_per_minute != tracked.cost_per_minute => {
                    tracing::info!(
                        app = %app.app_id,
                        cost_per_minute = app.cost_per_minute,
                        "Tracked app cost changed; starting over"
                    );
                    self.end_session(SessionEnd::PolicyChanged);
                    let foreground = self.foreground.clone();
                    self.evaluate(foreground);
                }
                Some(app) => {
                    if let Some(active) = self.active.as_mut() {
                        active.session.refresh_app(app.clone());
                    }
                }
            }
        }

        self.blocked.retain(|app_id| {
            let still_locked = apps.iter().any(|a| &a.app_id == app_id);
            if !still_locked {
                tracing::info!(app = %app_id, "Blocked app unlocked");
            }
            still_locked
        });
    }

    fn lookup(&self, app_id: &str) -> Option<LockedApp> {
        self.registry_rx
            .borrow()
            .iter()
            .find(|app| app.app_id == app_id)
            .cloned()
    }

    fn tracked_app_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.session.app_id())
    }

    fn start_session(&mut self, app: LockedApp) {
        let session = UsageSession::start(app, Instant::now());
        let ticker = BillingTicker::spawn(
            session.id(),
            self.settings.tick_interval,
            self.tick_tx.clone(),
        );
        tracing::info!(
            app = %session.app_id(),
            session = %session.id(),
            cost_per_minute = session.app().cost_per_minute,
            "Tracking started"
        );
        self.active = Some(ActiveSession {
            session,
            _ticker: ticker,
        });
    }

    /// Drop the active session (aborting its ticker) and cache its figures
    fn end_session(&mut self, end: SessionEnd) {
        let Some(active) = self.active.take() else {
            return;
        };
        let summary = active.session.finish(end);
        tracing::info!(
            app = %summary.app_id,
            minutes_used = summary.minutes_used,
            steps_charged = summary.steps_charged,
            end = ?end,
            "Tracking stopped"
        );
        self.last_usage.insert(summary.app_id.clone(), summary);
    }

    fn block(&mut self, app: LockedApp) {
        if self.tracked_app_id() == Some(app.app_id.as_str()) {
            self.end_session(SessionEnd::Blocked);
        }
        self.blocked.insert(app.app_id.clone());

        let available = self.ledger.available();
        tracing::info!(
            app = %app.app_id,
            available,
            cost_per_minute = app.cost_per_minute,
            "Blocking app"
        );
        self.notifier.on_blocked(&app, available);
    }

    fn teardown(&mut self) {
        self.end_session(SessionEnd::Shutdown);
        self.blocked.clear();
        self.foreground = None;
    }

    fn status(&self) -> EnforcerStatus {
        EnforcerStatus {
            foreground: self.foreground.clone(),
            tracking: self.active.as_ref().map(|a| a.session.snapshot()),
            blocked: self.blocked.clone(),
            last_usage: self.last_usage.clone(),
            balance: self.ledger.balance(),
        }
    }
}
