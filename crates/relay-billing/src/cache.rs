use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// Hot user balances shared by every in-flight request.
///
/// Each balance is its own atomic counter; reserve and credit never read and
/// write in two steps. The map lock is only taken to find or insert a slot.
#[derive(Debug, Default)]
pub struct BalanceCache {
    balances: RwLock<HashMap<i64, Arc<AtomicI64>>>,
}

impl BalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, user_id: i64) -> Option<Arc<AtomicI64>> {
        self.balances.read().ok()?.get(&user_id).cloned()
    }

    /// Insert `balance` unless a slot already exists; returns the live slot.
    pub fn prime(&self, user_id: i64, balance: i64) -> Option<Arc<AtomicI64>> {
        let mut balances = self.balances.write().ok()?;
        Some(
            balances
                .entry(user_id)
                .or_insert_with(|| Arc::new(AtomicI64::new(balance)))
                .clone(),
        )
    }

    pub fn balance(&self, user_id: i64) -> Option<i64> {
        self.slot(user_id).map(|slot| slot.load(Ordering::SeqCst))
    }

    /// Take `amount` if the balance covers it. `Ok` carries the balance before
    /// the decrement, `Err` the balance that fell short.
    pub fn try_reserve(slot: &AtomicI64, amount: i64) -> Result<i64, i64> {
        slot.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |balance| {
            (balance >= amount).then(|| balance - amount)
        })
    }

    pub fn credit(&self, user_id: i64, amount: i64) {
        if amount == 0 {
            return;
        }
        if let Some(slot) = self.slot(user_id) {
            slot.fetch_add(amount, Ordering::SeqCst);
        }
    }
}
