//! Service wiring.
//!
//! [`WalkUnlockService`] owns one ledger, one registry, the enforcer and the
//! step intake, all sharing a single store. It is what a host process starts
//! at boot and stops on the explicit shutdown command.

use crate::config::EnforcementConfig;
use crate::enforcer::{AppLockEnforcer, EnforcerSettings, EnforcerStatus};
use crate::foreground::ForegroundObserver;
use crate::intake::StepIntake;
use crate::ledger::StepLedger;
use crate::notify::Notifier;
use crate::registry::LockedAppRegistry;
use crate::store::KeyValueStore;
use crate::{Result, StepBalance};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct WalkUnlockService {
    ledger: Arc<StepLedger>,
    registry: Arc<LockedAppRegistry>,
    enforcer: AppLockEnforcer,
    intake: StepIntake,
    registry_follower: JoinHandle<()>,
}

impl WalkUnlockService {
    /// Load persisted state and start every task on the current runtime
    pub fn start(
        config: &EnforcementConfig,
        store: Arc<dyn KeyValueStore>,
        foreground: ForegroundObserver,
        steps: mpsc::Receiver<u64>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let ledger = Arc::new(StepLedger::open(store.clone()));
        let registry = Arc::new(LockedAppRegistry::open(store, notifier.clone()));
        let registry_follower = registry.follow_store();

        let intake = StepIntake::spawn(ledger.clone(), steps);
        let enforcer = AppLockEnforcer::spawn(
            EnforcerSettings::from(config),
            ledger.clone(),
            foreground,
            registry.changes(),
            notifier,
        );

        tracing::info!(
            available = ledger.available(),
            locked_apps = registry.list().len(),
            "WalkUnlock service started"
        );

        Self {
            ledger,
            registry,
            enforcer,
            intake,
            registry_follower,
        }
    }

    pub fn ledger(&self) -> &Arc<StepLedger> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<LockedAppRegistry> {
        &self.registry
    }

    pub fn enforcer(&self) -> &AppLockEnforcer {
        &self.enforcer
    }

    pub async fn status(&self) -> Result<EnforcerStatus> {
        self.enforcer.status().await
    }

    /// Stop every task; persisted state is left as is
    pub async fn stop(self) -> Result<()> {
        self.intake.abort();
        self.registry_follower.abort();
        self.enforcer.shutdown().await?;
        tracing::info!("WalkUnlock service stopped");
        Ok(())
    }

    /// The explicit shutdown command: stop enforcing and zero the ledger
    pub async fn shutdown_and_reset(self) -> Result<StepBalance> {
        let ledger = self.ledger.clone();
        self.stop().await?;
        ledger.reset()
    }
}
