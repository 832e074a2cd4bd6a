//! Durable step ledger.
//!
//! The ledger owns two counters, steps earned and steps redeemed. The stored
//! pair is the source of truth: every mutation is a read-modify-write through
//! [`KeyValueStore::update`], so other handles on the same store (another
//! process included) never lose each other's updates, and a failed write
//! leaves both the stored pair and the cached balance untouched.

use crate::store::KeyValueStore;
use crate::{Error, Result, StepBalance};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Store key holding both counters
pub const LEDGER_KEY: &str = "step_ledger.json";

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct LedgerRecord {
    total_steps: u64,
    redeemed_steps: u64,
}

impl LedgerRecord {
    fn balance(&self) -> StepBalance {
        StepBalance::from_counters(self.total_steps, self.redeemed_steps)
    }
}

/// Outcome of a redemption attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Redemption {
    Committed(StepBalance),
    /// Redeeming would push redeemed past total; nothing changed.
    Rejected { requested: u64, available: u64 },
}

impl Redemption {
    pub fn is_committed(&self) -> bool {
        matches!(self, Redemption::Committed(_))
    }
}

/// Step counters shared by the sensor intake and the enforcer
pub struct StepLedger {
    store: Arc<dyn KeyValueStore>,
    // Last pair seen in the store
    counters: Mutex<LedgerRecord>,
    balance_tx: watch::Sender<StepBalance>,
}

impl StepLedger {
    /// Load the ledger from `store`
    ///
    /// A missing or corrupted record starts the ledger at 0/0.
    pub fn open(store: Arc<dyn KeyValueStore>) -> Self {
        let record = read_record(store.as_ref()).unwrap_or_else(|e| {
            tracing::warn!("Failed to read step ledger: {}. Starting at zero.", e);
            LedgerRecord::default()
        });
        if record.redeemed_steps > record.total_steps {
            tracing::warn!(
                total = record.total_steps,
                redeemed = record.redeemed_steps,
                "Stored ledger has more redeemed than earned steps; redemptions will be rejected"
            );
        }
        let (balance_tx, _) = watch::channel(record.balance());

        tracing::info!(
            total = record.total_steps,
            redeemed = record.redeemed_steps,
            "Step ledger loaded"
        );

        Self {
            store,
            counters: Mutex::new(record),
            balance_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerRecord> {
        // Counters are only assigned whole pairs, so a poisoned guard still
        // holds a consistent one.
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current totals as stored
    ///
    /// Falls back to the last known pair if the store cannot be read.
    pub fn balance(&self) -> StepBalance {
        let mut counters = self.lock();
        match read_record(self.store.as_ref()) {
            Ok(record) => self.publish(&mut counters, record),
            Err(e) => tracing::debug!("Step ledger unreadable, using last balance: {}", e),
        }
        counters.balance()
    }

    pub fn available(&self) -> u64 {
        self.balance().available
    }

    /// Observe every balance change this handle sees
    pub fn subscribe(&self) -> watch::Receiver<StepBalance> {
        self.balance_tx.subscribe()
    }

    /// Credit `delta` newly walked steps
    pub fn add_steps(&self, delta: u64) -> Result<StepBalance> {
        if delta == 0 {
            return Err(Error::InvalidStepDelta);
        }

        let record = self.transact(|current| {
            let total_steps = current
                .total_steps
                .checked_add(delta)
                .ok_or(Error::StepOverflow {
                    total: current.total_steps,
                    delta,
                })?;
            Ok(Some(LedgerRecord {
                total_steps,
                ..current
            }))
        })?;

        let balance = record.balance();
        tracing::debug!(delta, total = balance.total, "Steps added");
        Ok(balance)
    }

    /// Spend `amount` steps if they have been earned
    pub fn redeem(&self, amount: u64) -> Result<Redemption> {
        let mut rejected = None;
        let record = self.transact(|current| {
            rejected = None;
            match current.redeemed_steps.checked_add(amount) {
                Some(_) if amount == 0 => Ok(None),
                Some(next) if next <= current.total_steps => Ok(Some(LedgerRecord {
                    redeemed_steps: next,
                    ..current
                })),
                _ => {
                    rejected = Some(current);
                    Ok(None)
                }
            }
        })?;

        if let Some(current) = rejected {
            tracing::warn!(
                requested = amount,
                total = current.total_steps,
                redeemed = current.redeemed_steps,
                "Redemption would exceed earned steps; rejected"
            );
            return Ok(Redemption::Rejected {
                requested: amount,
                available: current.balance().available,
            });
        }

        let balance = record.balance();
        if amount > 0 {
            tracing::debug!(amount, available = balance.available, "Steps redeemed");
        }
        Ok(Redemption::Committed(balance))
    }

    /// Zero both counters (explicit shutdown only)
    pub fn reset(&self) -> Result<StepBalance> {
        let record = self.transact(|_| Ok(Some(LedgerRecord::default())))?;
        tracing::info!("Step ledger reset");
        Ok(record.balance())
    }

    /// Apply `f` to the freshly stored pair under the store's key lock
    ///
    /// `f` returns the pair to write, or `None` to leave it. Returns the pair
    /// that is stored afterwards.
    fn transact<F>(&self, mut f: F) -> Result<LedgerRecord>
    where
        F: FnMut(LedgerRecord) -> Result<Option<LedgerRecord>>,
    {
        let mut counters = self.lock();
        let mut outcome = None;

        self.store
            .update(LEDGER_KEY, &mut |bytes: Option<&[u8]>| {
                let current = decode_record(bytes);
                let next = f(current)?;
                outcome = Some(next.unwrap_or(current));
                match next {
                    Some(record) => Ok(Some(serde_json::to_vec(&record)?)),
                    None => Ok(None),
                }
            })?;

        let record = outcome.ok_or_else(|| Error::Store("ledger update did not run".into()))?;
        self.publish(&mut counters, record);
        Ok(record)
    }

    fn publish(&self, counters: &mut MutexGuard<'_, LedgerRecord>, record: LedgerRecord) {
        **counters = record;
        let balance = record.balance();
        self.balance_tx.send_if_modified(|current| {
            if *current == balance {
                false
            } else {
                *current = balance;
                true
            }
        });
    }
}

fn read_record(store: &dyn KeyValueStore) -> Result<LedgerRecord> {
    Ok(decode_record(store.get(LEDGER_KEY)?.as_deref()))
}

/// Decode a stored pair; absence or corruption reads as 0/0
fn decode_record(bytes: Option<&[u8]>) -> LedgerRecord {
    let Some(bytes) = bytes else {
        return LedgerRecord::default();
    };

    match serde_json::from_slice::<LedgerRecord>(bytes) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("Failed to parse step ledger: {}. Treating as zero.", e);
            LedgerRecord::default()
        }
    }
}
