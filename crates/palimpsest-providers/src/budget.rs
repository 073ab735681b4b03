//! Process-wide daily spend ledger.
//!
//! Every outbound model call reserves its estimated cost before the request
//! leaves the process and settles the reservation with the actual token
//! counts afterwards. Reservations keep the parallel fan-out stage from
//! collectively overshooting the daily cap. The ledger rolls over lazily:
//! the first operation observed on a new UTC day zeroes spend and call count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use thiserror::Error;

use palimpsest_types::BudgetSnapshot;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error(
        "daily budget exhausted: {spent_usd:.4} spent + {reserved_usd:.4} reserved + {estimate_usd:.4} estimate exceeds cap {cap_usd:.2}"
    )]
    Exceeded {
        spent_usd: f64,
        reserved_usd: f64,
        estimate_usd: f64,
        cap_usd: f64,
    },
    #[error("model `{0}` has no registered unit cost")]
    UnknownModel(String),
}

/// A pending charge held on behalf of one not-yet-completed model call.
/// Consumed by value by exactly one of [`BudgetLedger::record`] or
/// [`BudgetLedger::release`]; move semantics enforce the exactly-once rule.
#[derive(Debug)]
pub struct InvocationTicket {
    model_id: String,
    estimate_usd: f64,
}

impl InvocationTicket {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn estimate_usd(&self) -> f64 {
        self.estimate_usd
    }
}

struct LedgerState {
    day: NaiveDate,
    spent_usd: f64,
    reserved_usd: f64,
    calls_today: u64,
    cap_usd: f64,
    /// USD per token, keyed by model id. The keys double as the registered
    /// model set: reserving against an unknown id is rejected.
    rates: HashMap<String, f64>,
}

impl LedgerState {
    fn rollover_if_needed(&mut self, today: NaiveDate) {
        if today > self.day {
            self.day = today;
            self.spent_usd = 0.0;
            self.calls_today = 0;
        }
    }
}

#[derive(Clone)]
pub struct BudgetLedger {
    inner: Arc<Mutex<LedgerState>>,
}

impl BudgetLedger {
    pub fn new(cap_usd: f64, rates: HashMap<String, f64>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerState {
                day: Utc::now().date_naive(),
                spent_usd: 0.0,
                reserved_usd: 0.0,
                calls_today: 0,
                cap_usd,
                rates,
            })),
        }
    }

    /// Atomically reserve the estimated cost of a call:
    /// `rate(model) × (input_chars / 4 + max_tokens)`.
    pub fn reserve(
        &self,
        model_id: &str,
        input_chars: usize,
        max_tokens: u32,
    ) -> Result<InvocationTicket, BudgetError> {
        let mut state = self.lock();
        let rate = *state
            .rates
            .get(model_id)
            .ok_or_else(|| BudgetError::UnknownModel(model_id.to_string()))?;
        let estimate_usd = rate * (input_chars as f64 / 4.0 + f64::from(max_tokens));
        if state.spent_usd + state.reserved_usd + estimate_usd > state.cap_usd {
            return Err(BudgetError::Exceeded {
                spent_usd: state.spent_usd,
                reserved_usd: state.reserved_usd,
                estimate_usd,
                cap_usd: state.cap_usd,
            });
        }
        state.reserved_usd += estimate_usd;
        Ok(InvocationTicket {
            model_id: model_id.to_string(),
            estimate_usd,
        })
    }

    /// Settle a reservation with the token count the endpoint reported.
    pub fn record(&self, ticket: InvocationTicket, total_tokens: u64) {
        let mut state = self.lock();
        let rate = state.rates.get(&ticket.model_id).copied().unwrap_or(0.0);
        state.reserved_usd = (state.reserved_usd - ticket.estimate_usd).max(0.0);
        state.spent_usd += rate * total_tokens as f64;
        state.calls_today += 1;
    }

    /// Roll a reservation back without charging anything.
    pub fn release(&self, ticket: InvocationTicket) {
        let mut state = self.lock();
        state.reserved_usd = (state.reserved_usd - ticket.estimate_usd).max(0.0);
    }

    pub fn set_cap(&self, cap_usd: f64) {
        self.lock().cap_usd = cap_usd.max(0.0);
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = self.lock();
        BudgetSnapshot {
            day: state.day,
            spent_usd: state.spent_usd,
            reserved_usd: state.reserved_usd,
            remaining_usd: (state.cap_usd - state.spent_usd - state.reserved_usd).max(0.0),
            cap_usd: state.cap_usd,
            calls_today: state.calls_today,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.rollover_if_needed(Utc::now().date_naive());
        state
    }

    #[cfg(test)]
    fn force_day(&self, day: NaiveDate) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).day = day;
    }
}
