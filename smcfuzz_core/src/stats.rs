use crate::call::{CallId, Outcome};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

/// Counters summarizing every call issued since the last reset.
#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStats {
    /// Calls issued through the executor, faulted ones included.
    pub total_iterations: u64,
    /// Reserved for watchdog reports through [`Statistics::record_crash`].
    pub crashes: u64,
    /// Reserved for watchdog reports through [`Statistics::record_hang`].
    pub hangs: u64,
    pub interesting_cases: u64,
    pub valid_responses: u64,
    pub error_responses: u64,
    pub last_id: CallId,
    pub last_result: u64,
}

impl CampaignStats {
    /// Calls that came back with a result register.
    pub fn classified(&self) -> u64 {
        self.valid_responses + self.error_responses + self.interesting_cases
    }
}

/// Shared handle to the statistics of one engine instance.
///
/// Cloning the handle shares the counters. Readers always get a complete
/// snapshot; the executor is the only writer of the classification counters.
#[derive(Clone, Debug, Default)]
pub struct Statistics {
    inner: Arc<RwLock<CampaignStats>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CampaignStats {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<T>(&self, f: impl FnOnce(&mut CampaignStats) -> T) -> T {
        let mut stats = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats)
    }

    /// Commits one returned call and reports how it was classified.
    pub(crate) fn record(&self, id: CallId, result: u64) -> Outcome {
        let outcome = Outcome::classify(result);
        self.update(|stats| {
            stats.total_iterations += 1;
            stats.last_id = id;
            stats.last_result = result;
            match outcome {
                Outcome::Valid => stats.valid_responses += 1,
                Outcome::Error => stats.error_responses += 1,
                Outcome::Interesting => stats.interesting_cases += 1,
            }
        });
        outcome
    }

    /// Records a call that never returned.
    pub fn record_hang(&self, id: CallId) {
        self.update(|stats| {
            stats.total_iterations += 1;
            stats.hangs += 1;
            stats.last_id = id;
        });
    }

    /// Records a call whose calling context crashed.
    pub fn record_crash(&self, id: CallId) {
        self.update(|stats| {
            stats.total_iterations += 1;
            stats.crashes += 1;
            stats.last_id = id;
        });
    }

    pub(crate) fn reset(&self) {
        self.update(|stats| *stats = CampaignStats::default());
    }
}
