use std::sync::{Arc, Mutex, PoisonError};

use fab_protocol::Batch;

/// A supplier's stock, shared between its negotiator and the supervisor's
/// refill hook.
///
/// Stock is never reserved at PROPOSE time; `try_debit` is the only point
/// where an order is charged, and it refuses rather than going negative.
#[derive(Debug, Clone, Default)]
pub struct StockLedger {
    inner: Arc<Mutex<Batch>>,
}

impl StockLedger {
    pub fn new(initial: Batch) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn level(&self) -> Batch {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Top up and return the new level.
    pub fn refill(&self, amount: &Batch) -> Batch {
        let mut stock = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *stock = stock.saturating_add(amount);
        *stock
    }

    /// Remove `batch` if fully available. Returns the remaining level.
    pub fn try_debit(&self, batch: &Batch) -> Option<Batch> {
        let mut stock = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = stock.checked_sub(batch)?;
        *stock = remaining;
        Some(remaining)
    }

    /// Give back a previously debited batch.
    pub fn credit(&self, batch: &Batch) {
        let mut stock = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *stock = stock.saturating_add(batch);
    }
}
