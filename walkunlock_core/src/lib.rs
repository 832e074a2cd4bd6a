#![forbid(unsafe_code)]

//! Core step economy and app lock enforcement for WalkUnlock.
//!
//! This crate provides:
//! - Domain types (locked apps, balances, usage summaries)
//! - The durable step ledger and locked-app registry
//! - Usage sessions and the app lock enforcer
//! - Persistence (key-value store), configuration and logging

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod store;
pub mod ledger;
pub mod registry;
pub mod notify;
pub mod foreground;
pub mod session;
pub mod enforcer;
pub mod intake;
pub mod service;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use ledger::{Redemption, StepLedger};
pub use registry::LockedAppRegistry;
pub use notify::{Notifier, TracingNotifier};
pub use foreground::{ForegroundObserver, ForegroundSignal};
pub use session::{SessionSnapshot, UsageSession, BILLING_UNIT};
pub use enforcer::{AppLockEnforcer, EnforcerSettings, EnforcerStatus};
pub use intake::StepIntake;
pub use service::WalkUnlockService;
