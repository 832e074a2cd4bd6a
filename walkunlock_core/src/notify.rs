//! Presentation-layer callbacks.
//!
//! The core never renders anything. It reports block decisions, usage
//! charges and user-facing notices through a [`Notifier`], and nothing a
//! notifier does can flow back into core state.

use crate::LockedApp;

/// One-way notifications from the core to the UI collaborator
pub trait Notifier: Send + Sync {
    /// `app` was just blocked; the UI should show the blocking screen
    fn on_blocked(&self, app: &LockedApp, available_steps: u64);

    /// Steps were charged for `app` after `minutes_used` whole minutes
    fn on_usage_charged(&self, app: &LockedApp, minutes_used: u64, remaining_steps: u64);

    /// A transient user-visible message (e.g. a failed registry edit)
    fn on_notice(&self, message: &str);
}

/// Notifier that only writes to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn on_blocked(&self, app: &LockedApp, available_steps: u64) {
        tracing::info!(
            app = %app.app_id,
            available_steps,
            cost_per_minute = app.cost_per_minute,
            "App blocked"
        );
    }

    fn on_usage_charged(&self, app: &LockedApp, minutes_used: u64, remaining_steps: u64) {
        tracing::info!(
            "{}: Used {}min, {} steps remaining",
            app.display_name,
            minutes_used,
            remaining_steps
        );
    }

    fn on_notice(&self, message: &str) {
        tracing::warn!("{}", message);
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Notice {
        Blocked { app_id: String, available: u64 },
        Charged { app_id: String, minutes: u64, remaining: u64 },
        Message(String),
    }

    /// Collects every notification for assertions
    #[derive(Default)]
    pub struct RecordingNotifier {
        notices: Mutex<Vec<Notice>>,
    }

    impl RecordingNotifier {
        pub fn notices(&self) -> Vec<Notice> {
            self.notices.lock().unwrap().clone()
        }

        pub fn blocked(&self) -> Vec<(String, u64)> {
            self.notices()
                .into_iter()
                .filter_map(|n| match n {
                    Notice::Blocked { app_id, available } => Some((app_id, available)),
                    _ => None,
                })
                .collect()
        }

        pub fn charges(&self) -> Vec<(String, u64, u64)> {
            self.notices()
                .into_iter()
                .filter_map(|n| match n {
                    Notice::Charged {
                        app_id,
                        minutes,
                        remaining,
                    } => Some((app_id, minutes, remaining)),
                    _ => None,
                })
                .collect()
        }

        pub fn messages(&self) -> Vec<String> {
            self.notices()
                .into_iter()
                .filter_map(|n| match n {
                    Notice::Message(m) => Some(m),
                    _ => None,
                })
                .collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn on_blocked(&self, app: &LockedApp, available_steps: u64) {
            self.notices.lock().unwrap().push(Notice::Blocked {
                app_id: app.app_id.clone(),
                available: available_steps,
            });
        }

        fn on_usage_charged(&self, app: &LockedApp, minutes_used: u64, remaining_steps: u64) {
            self.notices.lock().unwrap().push(Notice::Charged {
                app_id: app.app_id.clone(),
                minutes: minutes_used,
                remaining: remaining_steps,
            });
        }

        fn on_notice(&self, message: &str) {
            self.notices
                .lock()
                .unwrap()
                .push(Notice::Message(message.to_string()));
        }
    }
}
