//! Foreground-app signal.
//!
//! The OS integration owns a [`ForegroundSignal`] and publishes the id of the
//! app in front (or `None`). Consumers hold a [`ForegroundObserver`], a watch
//! receiver that always yields the latest value. Publishing the value that is
//! already current is suppressed, so observers see one change per real
//! foreground switch.

use tokio::sync::watch;

/// Consumer half: the latest foreground app id
pub type ForegroundObserver = watch::Receiver<Option<String>>;

/// Producer half, owned by whatever watches the OS
#[derive(Debug)]
pub struct ForegroundSignal {
    tx: watch::Sender<Option<String>>,
}

impl ForegroundSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Publish the current foreground app; returns false for a duplicate
    pub fn publish(&self, app_id: Option<String>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == app_id {
                false
            } else {
                tracing::debug!(app = ?app_id, "Foreground app changed");
                *current = app_id;
                true
            }
        })
    }

    pub fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> ForegroundObserver {
        self.tx.subscribe()
    }
}

impl Default for ForegroundSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_are_suppressed() {
        let signal = ForegroundSignal::new();
        let mut observer = signal.subscribe();

        assert!(signal.publish(Some("com.example.game".into())));
        assert!(!signal.publish(Some("com.example.game".into())));
        assert!(observer.has_changed().unwrap());
        assert_eq!(
            observer.borrow_and_update().as_deref(),
            Some("com.example.game")
        );
        assert!(!observer.has_changed().unwrap());

        assert!(signal.publish(None));
        assert!(observer.has_changed().unwrap());
        assert_eq!(signal.current(), None);
    }
}
