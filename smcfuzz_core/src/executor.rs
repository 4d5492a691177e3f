use crate::call::{CallId, Outcome, ParamVector};
use crate::gate::{CallGate, GateFault};
use crate::stats::Statistics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Returned { result: u64, outcome: Outcome },
    Hang,
    Crash(String),
    /// The gate broke down; nothing was recorded.
    GateFailure(String),
}

/// One issued call and what came of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub id: CallId,
    pub params: ParamVector,
    pub status: ExecutionStatus,
}

impl Execution {
    pub fn outcome(&self) -> Option<Outcome> {
        match self.status {
            ExecutionStatus::Returned { outcome, .. } => Some(outcome),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<u64> {
        match self.status {
            ExecutionStatus::Returned { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// Issues calls through a gate and commits their classification.
///
/// Exactly one invocation per `execute`; there are no retries, so a slow
/// success and a hang look the same until a supervising gate gives up.
/// The executor never detects faults itself: a panic in an in-process gate
/// unwinds through `execute` with nothing recorded.
pub struct CallExecutor<G: CallGate> {
    gate: G,
    stats: Statistics,
}

impl<G: CallGate> CallExecutor<G> {
    pub fn new(gate: G, stats: Statistics) -> Self {
        Self { gate, stats }
    }

    pub fn gate_name(&self) -> &str {
        self.gate.name()
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn execute(&mut self, id: CallId, params: &ParamVector) -> Execution {
        let status = match self.gate.invoke(id, params) {
            Ok(result) => {
                let outcome = self.stats.record(id, result);
                match outcome {
                    Outcome::Interesting => {
                        tracing::info!("interesting response: id={id} result={result:#x}");
                    }
                    Outcome::Error => {
                        tracing::debug!("call rejected: id={id} result={result:#x}");
                    }
                    Outcome::Valid => {}
                }
                ExecutionStatus::Returned { result, outcome }
            }
            // Watchdog reports from a supervising gate are forwarded to the
            // watchdog surface of the statistics, never classified.
            Err(GateFault::Timeout(after)) => {
                tracing::warn!(%id, ?params, "watchdog: call did not return within {after:?}");
                self.stats.record_hang(id);
                ExecutionStatus::Hang
            }
            Err(GateFault::Crashed(desc)) => {
                tracing::warn!(%id, ?params, "watchdog: call crashed its context: {desc}");
                self.stats.record_crash(id);
                ExecutionStatus::Crash(desc)
            }
            Err(fault) => {
                tracing::warn!(%id, gate = self.gate.name(), "gate failure: {fault}");
                ExecutionStatus::GateFailure(fault.to_string())
            }
        };
        Execution {
            id,
            params: *params,
            status,
        }
    }

    /// Invokes the gate without touching the statistics.
    pub fn probe(&mut self, id: CallId, params: &ParamVector) -> Result<u64, GateFault> {
        self.gate.invoke(id, params)
    }
}
