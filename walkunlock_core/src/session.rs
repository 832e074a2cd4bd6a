//! Usage session bookkeeping for one continuous foreground span.
//!
//! A session never charges by tick. It keeps the running total of foreground
//! time and of steps already charged, and derives what is owed from whole
//! billing units, so the amount charged depends only on elapsed time no
//! matter how often (or how late) ticks arrive.

use crate::{LockedApp, SessionEnd, UsageSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Length of one billable unit of foreground time
pub const BILLING_UNIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct UsageSession {
    id: Uuid,
    app: LockedApp,
    started_at: DateTime<Utc>,
    last_checked: Instant,
    accumulated: Duration,
    steps_charged: u64,
}

/// Read-only view of a live session
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub app_id: String,
    pub cost_per_minute: u64,
    pub started_at: DateTime<Utc>,
    pub usage_secs: u64,
    pub minutes_used: u64,
    pub steps_charged: u64,
}

impl UsageSession {
    pub fn start(app: LockedApp, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            app,
            started_at: Utc::now(),
            last_checked: now,
            accumulated: Duration::ZERO,
            steps_charged: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn app(&self) -> &LockedApp {
        &self.app
    }

    pub fn app_id(&self) -> &str {
        &self.app.app_id
    }

    pub fn accumulated(&self) -> Duration {
        self.accumulated
    }

    pub fn steps_charged(&self) -> u64 {
        self.steps_charged
    }

    /// Pick up edited metadata or cost for the same app
    pub fn refresh_app(&mut self, app: LockedApp) {
        debug_assert_eq!(app.app_id, self.app.app_id);
        self.app = app;
    }

    /// Fold the time since the last check into the running total
    pub fn record_elapsed(&mut self, now: Instant) {
        self.accumulated += now.saturating_duration_since(self.last_checked);
        self.last_checked = self.last_checked.max(now);
    }

    /// Completed billing units so far
    pub fn whole_minutes(&self) -> u64 {
        self.accumulated.as_secs() / BILLING_UNIT.as_secs()
    }

    /// Steps the session should have been charged by now
    pub fn target_charge(&self) -> u64 {
        self.whole_minutes().saturating_mul(self.app.cost_per_minute)
    }

    /// Target minus what has already been charged
    pub fn owed(&self) -> u64 {
        self.target_charge().saturating_sub(self.steps_charged)
    }

    pub fn record_charge(&mut self, amount: u64) {
        self.steps_charged = self.steps_charged.saturating_add(amount);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            app_id: self.app.app_id.clone(),
            cost_per_minute: self.app.cost_per_minute,
            started_at: self.started_at,
            usage_secs: self.accumulated.as_secs(),
            minutes_used: self.whole_minutes(),
            steps_charged: self.steps_charged,
        }
    }

    /// Close the session and keep its final figures
    pub fn finish(self, end: SessionEnd) -> UsageSummary {
        UsageSummary {
            app_id: self.app.app_id,
            minutes_used: self.accumulated.as_secs() / BILLING_UNIT.as_secs(),
            steps_charged: self.steps_charged,
            started_at: self.started_at,
            ended_at: Utc::now(),
            end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(cost: u64) -> LockedApp {
        LockedApp::new("com.example.game", "Game", cost)
    }

    #[test]
    fn test_partial_minute_owes_nothing() {
        let t0 = Instant::now();
        let mut session = UsageSession::start(game(30), t0);

        session.record_elapsed(t0 + Duration::from_secs(59));
        assert_eq!(session.whole_minutes(), 0);
        assert_eq!(session.owed(), 0);
    }

    #[test]
    fn test_owed_tracks_whole_minutes() {
        let t0 = Instant::now();
        let mut session = UsageSession::start(game(30), t0);

        session.record_elapsed(t0 + Duration::from_secs(60));
        assert_eq!(session.owed(), 30);
        session.record_charge(30);
        assert_eq!(session.owed(), 0);

        session.record_elapsed(t0 + Duration::from_secs(119));
        assert_eq!(session.owed(), 0);
        session.record_elapsed(t0 + Duration::from_secs(120));
        assert_eq!(session.owed(), 30);
    }

    #[test]
    fn test_tick_granularity_does_not_change_charge() {
        let t0 = Instant::now();
        let mut fine = UsageSession::start(game(7), t0);
        let mut coarse = UsageSession::start(game(7), t0);

        for s in (10..=300).step_by(10) {
            fine.record_elapsed(t0 + Duration::from_secs(s));
            let owed = fine.owed();
            fine.record_charge(owed);
        }
        // A single late tick after a suspension catches up in one go
        coarse.record_elapsed(t0 + Duration::from_secs(300));
        let owed = coarse.owed();
        coarse.record_charge(owed);

        assert_eq!(fine.steps_charged(), 35);
        assert_eq!(coarse.steps_charged(), 35);
    }

    #[test]
    fn test_shortfall_stays_owed_within_session() {
        let t0 = Instant::now();
        let mut session = UsageSession::start(game(30), t0);
        session.record_elapsed(t0 + Duration::from_secs(60));
        session.record_charge(12);
        assert_eq!(session.owed(), 18);
    }

    #[test]
    fn test_free_app_never_owes() {
        let t0 = Instant::now();
        let mut session = UsageSession::start(game(0), t0);
        session.record_elapsed(t0 + Duration::from_secs(3600));
        assert_eq!(session.whole_minutes(), 60);
        assert_eq!(session.owed(), 0);
    }

    #[test]
    fn test_cost_change_applies_to_target() {
        let t0 = Instant::now();
        let mut session = UsageSession::start(game(10), t0);
        session.record_elapsed(t0 + Duration::from_secs(60));
        session.record_charge(session.owed());

        session.refresh_app(game(20));
        session.record_elapsed(t0 + Duration::from_secs(120));
        // Target is now 2 * 20 = 40, of which 10 was charged
        assert_eq!(session.owed(), 30);
    }

    #[test]
    fn test_clock_going_backwards_is_ignored() {
        let t0 = Instant::now() + Duration::from_secs(100);
        let mut session = UsageSession::start(game(1), t0);
        session.record_elapsed(t0 - Duration::from_secs(50));
        assert_eq!(session.accumulated(), Duration::ZERO);
    }

    #[test]
    fn test_finish_summary() {
        let t0 = Instant::now();
        let mut session = UsageSession::start(game(5), t0);
        session.record_elapsed(t0 + Duration::from_secs(150));
        session.record_charge(10);

        let summary = session.finish(SessionEnd::LeftForeground);
        assert_eq!(summary.app_id, "com.example.game");
        assert_eq!(summary.minutes_used, 2);
        assert_eq!(summary.steps_charged, 10);
        assert_eq!(summary.end, SessionEnd::LeftForeground);
    }
}
