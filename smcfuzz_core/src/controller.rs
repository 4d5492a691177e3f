use crate::call::{ParamVector, ZERO_PARAMS};
use crate::config::{ConfigError, SmcFuzzConfig};
use crate::corpus::{CorpusEntry, CorpusTable};
use crate::executor::{CallExecutor, ExecutionStatus};
use crate::gate::{CallGate, GateFault};
use crate::generator::ParamGenerator;
use crate::oracle::{DEFAULT_FINDING_CAPACITY, Finding, FindingLog, TriageOracle};
use crate::stats::{CampaignStats, Statistics};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors returned by controller operations. None of them change state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// Another command is holding the engine (a campaign or self-test is in progress).
    #[error("a campaign is already in progress")]
    Busy,
    /// The requested campaign exceeds the configured per-command bound.
    #[error("requested {requested} iterations, limit is {limit}")]
    IterationLimit { requested: u64, limit: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerState {
    Idle,
    Running,
    /// The last campaign ended before its requested count. Accepts commands
    /// like `Idle` and returns to it on the next enable, reset or campaign.
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::Idle => "idle",
            ControllerState::Running => "running",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Iterations between cooperative yield checkpoints.
    pub yield_every: u64,
    pub max_iterations_per_command: Option<u64>,
    pub report_rejections: bool,
    pub finding_capacity: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            yield_every: crate::config::default_yield_every(),
            max_iterations_per_command: None,
            report_rejections: false,
            finding_capacity: DEFAULT_FINDING_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    /// Run permission was cleared before the requested count was reached.
    Disabled,
    /// The gate itself broke down; the campaign cannot make progress.
    GateFailure(String),
}

#[derive(Debug, Clone)]
pub struct CampaignReport {
    pub requested: u64,
    pub executed: u64,
    pub stop_reason: StopReason,
    pub yields: u64,
    pub elapsed: Duration,
}

impl CampaignReport {
    pub fn interrupted(&self) -> bool {
        self.stop_reason != StopReason::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfTestResult {
    pub entry: CorpusEntry,
    pub result: Result<u64, GateFault>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfTestReport {
    pub results: Vec<SelfTestResult>,
}

/// Everything `status()` reports, captured at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub enabled: bool,
    pub state: ControllerState,
    pub stats: CampaignStats,
    pub findings: Vec<Finding>,
    pub unique_findings: usize,
    pub duplicate_findings: u64,
}

struct Engine {
    executor: CallExecutor<Box<dyn CallGate>>,
    generator: ParamGenerator<ChaCha8Rng>,
    corpus: CorpusTable,
}

/// Drives campaigns against one gate.
///
/// Commands that touch the gate (`run`, `test_known`, `reset`) are serialized
/// by the engine lock; a second one arriving while the first holds it is
/// rejected with [`ControllerError::Busy`]. `enable`, `disable` and `status`
/// never wait on the engine, so they can be issued from another thread while
/// a campaign is running.
pub struct Controller {
    engine: Mutex<Engine>,
    stats: Statistics,
    findings: Mutex<FindingLog>,
    oracle: TriageOracle,
    enabled: AtomicBool,
    state: Mutex<ControllerState>,
    settings: ControllerSettings,
}

impl Controller {
    pub fn new(
        gate: impl CallGate + 'static,
        corpus: CorpusTable,
        generator: ParamGenerator<ChaCha8Rng>,
        settings: ControllerSettings,
    ) -> Self {
        let stats = Statistics::new();
        let gate: Box<dyn CallGate> = Box::new(gate);
        Self {
            engine: Mutex::new(Engine {
                executor: CallExecutor::new(gate, stats.clone()),
                generator,
                corpus,
            }),
            stats,
            findings: Mutex::new(FindingLog::new(settings.finding_capacity)),
            oracle: TriageOracle::new(settings.report_rejections),
            enabled: AtomicBool::new(true),
            state: Mutex::new(ControllerState::Idle),
            settings,
        }
    }

    /// Builds a controller from validated configuration around `gate`.
    pub fn from_config(
        config: &SmcFuzzConfig,
        gate: impl CallGate + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let namespace = config.namespace()?;
        let corpus = config.corpus_table(&namespace)?;
        let rng = match config.campaign.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        let generator =
            ParamGenerator::new(rng, namespace).with_corpus_weight(config.campaign.corpus_weight);
        Ok(Self::new(gate, corpus, generator, config.controller_settings()))
    }

    fn acquire(&self) -> Result<MutexGuard<'_, Engine>, ControllerError> {
        match self.engine.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(ControllerError::Busy),
        }
    }

    fn set_state(&self, state: ControllerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn leave_stopped(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ControllerState::Stopped {
            *state = ControllerState::Idle;
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Handle to the statistics, for readers and for an external watchdog
    /// reporting crashes and hangs.
    pub fn statistics(&self) -> Statistics {
        self.stats.clone()
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Runs up to `iterations` generate/execute/update cycles.
    ///
    /// The enabled flag is checked before every iteration, and the thread
    /// yields every `yield_every` iterations. A gate failure ends the
    /// campaign early, since no further call can be issued.
    pub fn run(&self, iterations: u64) -> Result<CampaignReport, ControllerError> {
        if let Some(limit) = self
            .settings
            .max_iterations_per_command
            .filter(|&limit| iterations > limit)
        {
            return Err(ControllerError::IterationLimit {
                requested: iterations,
                limit,
            });
        }
        let mut engine = self.acquire()?;
        self.set_state(ControllerState::Running);
        tracing::info!("Starting fuzzing campaign ({iterations} iterations)");

        let Engine {
            executor,
            generator,
            corpus,
        } = &mut *engine;
        let yield_every = self.settings.yield_every.max(1);
        let start_time = Instant::now();
        let mut executed = 0u64;
        let mut yields = 0u64;
        let mut stop_reason = StopReason::Completed;

        while executed < iterations {
            if !self.is_enabled() {
                tracing::info!("Fuzzing stopped by user after {executed} iterations");
                stop_reason = StopReason::Disabled;
                break;
            }

            let (id, params) = generator.next_call(corpus);
            let execution = executor.execute(id, &params);
            if let ExecutionStatus::GateFailure(reason) = &execution.status {
                tracing::error!("Campaign aborted, gate '{}' failed: {reason}", executor.gate_name());
                stop_reason = StopReason::GateFailure(reason.clone());
                break;
            }
            executed += 1;

            if let Some(finding) = self.oracle.examine(&execution) {
                self.findings
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(finding);
            }

            if executed % yield_every == 0 {
                tracing::trace!("yield checkpoint at iteration {executed}");
                std::thread::yield_now();
                yields += 1;
            }
        }

        let report = CampaignReport {
            requested: iterations,
            executed,
            stop_reason,
            yields,
            elapsed: start_time.elapsed(),
        };
        self.set_state(if report.interrupted() {
            ControllerState::Stopped
        } else {
            ControllerState::Idle
        });
        tracing::info!(
            "Campaign complete. Iterations={} in {:.2?}",
            report.executed,
            report.elapsed
        );
        Ok(report)
    }

    /// Calls every corpus entry once, in order, with all-zero parameters.
    ///
    /// Results go into the report only; the campaign counters are untouched.
    pub fn test_known(&self) -> Result<SelfTestReport, ControllerError> {
        let mut engine = self.acquire()?;
        self.set_state(ControllerState::Running);
        tracing::info!("Testing known SMC IDs");

        let Engine {
            executor, corpus, ..
        } = &mut *engine;
        let params: ParamVector = ZERO_PARAMS;
        let results = corpus
            .list()
            .iter()
            .map(|entry| {
                let result = executor.probe(entry.id, &params);
                match &result {
                    Ok(value) => tracing::info!("SMC {} ({}) -> result={value:#x}", entry.id, entry.name),
                    Err(fault) if fault.is_target_fault() => {
                        tracing::warn!("SMC {} ({}) -> {fault}", entry.id, entry.name)
                    }
                    Err(fault) => tracing::error!("SMC {} ({}) -> {fault}", entry.id, entry.name),
                }
                SelfTestResult {
                    entry: entry.clone(),
                    result,
                }
            })
            .collect();

        self.set_state(ControllerState::Idle);
        Ok(SelfTestReport { results })
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        self.leave_stopped();
        tracing::info!("Fuzzing enabled");
    }

    /// Clears run permission. A running campaign stops after its current iteration.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        tracing::info!("Fuzzing disabled");
    }

    /// Zeroes statistics and findings. Rejected while a campaign is running.
    pub fn reset(&self) -> Result<(), ControllerError> {
        let _engine = self.acquire()?;
        self.stats.reset();
        self.findings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.leave_stopped();
        tracing::info!("Statistics reset");
        Ok(())
    }

    pub fn status(&self) -> StatusSnapshot {
        let findings = self.findings.lock().unwrap_or_else(PoisonError::into_inner);
        StatusSnapshot {
            enabled: self.is_enabled(),
            state: self.state(),
            stats: self.stats.snapshot(),
            findings: findings.recent().cloned().collect(),
            unique_findings: findings.unique(),
            duplicate_findings: findings.duplicates(),
        }
    }

    /// Withdraws run permission and logs the final tally.
    pub fn shutdown(&self) -> CampaignStats {
        self.enabled.store(false, Ordering::SeqCst);
        let stats = self.stats.snapshot();
        tracing::info!("Final statistics:");
        tracing::info!("  Total iterations: {}", stats.total_iterations);
        tracing::info!("  Interesting cases: {}", stats.interesting_cases);
        tracing::info!("  Crashes: {}", stats.crashes);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallId, Namespace};
    use crate::gate::{FnGate, ScriptedGate};
    use std::sync::Arc;
    use std::sync::mpsc;

    fn controller_with(gate: impl CallGate + 'static, settings: ControllerSettings) -> Controller {
        let generator = ParamGenerator::new(ChaCha8Rng::from_seed([7; 32]), Namespace::optee());
        Controller::new(gate, CorpusTable::optee(), generator, settings)
    }

    fn alternating_gate() -> impl CallGate {
        let mut n = 0u64;
        FnGate::new("alternating", move |_id: CallId, _params: &ParamVector| {
            n += 1;
            match n % 3 {
                0 => 0,
                1 => u64::MAX,
                _ => 0x1000 + n,
            }
        })
    }

    #[test]
    fn run_executes_exactly_the_requested_iterations() {
        let controller = controller_with(alternating_gate(), ControllerSettings::default());
        let report = controller.run(250).expect("campaign runs");
        assert_eq!(report.executed, 250);
        assert_eq!(report.stop_reason, StopReason::Completed);
        assert_eq!(report.yields, 2);

        let stats = controller.status().stats;
        assert_eq!(stats.total_iterations, 250);
        assert_eq!(stats.classified(), 250);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn in_process_campaign_classifies_every_iteration() {
        let controller = controller_with(alternating_gate(), ControllerSettings::default());
        controller.run(300).unwrap();
        let stats = controller.status().stats;
        assert_eq!(stats.classified(), stats.total_iterations);
        assert_eq!(stats.crashes, 0);
        assert_eq!(stats.hangs, 0);
    }

    #[test]
    fn panicking_gate_surfaces_to_the_caller_with_counters_consistent() {
        let mut calls = 0;
        let gate = FnGate::new("faulting", move |_id: CallId, _params: &ParamVector| {
            calls += 1;
            if calls == 3 {
                panic!("secure world fault");
            }
            0
        });
        let controller = controller_with(gate, ControllerSettings::default());
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| controller.run(5)));
        assert!(unwound.is_err());

        let stats = controller.status().stats;
        assert_eq!(stats.total_iterations, 2);
        assert_eq!(stats.classified(), stats.total_iterations);
        assert_eq!(stats.crashes, 0);
    }

    #[test]
    fn run_zero_is_a_successful_no_op() {
        let controller = controller_with(ScriptedGate::constant(0), ControllerSettings::default());
        let before = controller.status();
        let report = controller.run(0).expect("fuzz 0 succeeds");
        assert_eq!(report.executed, 0);
        assert_eq!(controller.status(), before);
    }

    #[test]
    fn fresh_reset_then_five_iterations() {
        let controller = controller_with(alternating_gate(), ControllerSettings::default());
        controller.run(17).unwrap();
        controller.reset().unwrap();
        controller.run(5).unwrap();
        let stats = controller.status().stats;
        assert_eq!(stats.total_iterations, 5);
        assert_eq!(stats.valid_responses + stats.error_responses + stats.interesting_cases, 5);
    }

    #[test]
    fn disabled_controller_runs_nothing_and_reports_stop() {
        let controller = controller_with(ScriptedGate::constant(0), ControllerSettings::default());
        controller.disable();
        let report = controller.run(10).unwrap();
        assert_eq!(report.executed, 0);
        assert_eq!(report.stop_reason, StopReason::Disabled);
        assert_eq!(controller.state(), ControllerState::Stopped);

        controller.enable();
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.run(10).unwrap().executed, 10);
    }

    #[test]
    fn disable_during_run_stops_after_current_iteration() {
        let (tx, rx) = mpsc::channel::<()>();
        let mut seen = 0;
        let gate = FnGate::new("signalling", move |_id: CallId, _params: &ParamVector| {
            seen += 1;
            if seen == 4 {
                let _ = tx.send(());
            }
            0
        });
        let controller = Arc::new(controller_with(gate, ControllerSettings::default()));
        let remote = Arc::clone(&controller);
        let watcher = std::thread::spawn(move || {
            rx.recv().expect("gate signals");
            remote.disable();
        });

        let report = controller.run(u64::MAX).unwrap();
        watcher.join().expect("watcher thread");

        assert!(report.executed >= 4);
        assert_eq!(report.stop_reason, StopReason::Disabled);
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert_eq!(controller.status().stats.total_iterations, report.executed);
    }

    #[test]
    fn iteration_limit_rejects_without_side_effects() {
        let settings = ControllerSettings {
            max_iterations_per_command: Some(10),
            ..ControllerSettings::default()
        };
        let controller = controller_with(ScriptedGate::constant(0), settings);
        let before = controller.status();
        assert_eq!(
            controller.run(11).unwrap_err(),
            ControllerError::IterationLimit {
                requested: 11,
                limit: 10
            }
        );
        assert_eq!(controller.status(), before);
        assert_eq!(controller.run(10).unwrap().executed, 10);
    }

    #[test]
    fn test_known_calls_each_entry_once_in_order_with_zero_params() {
        let gate = ScriptedGate::new([Ok(0), Ok(u64::MAX), Ok(0x42)], 0);
        let log = gate.call_log();
        let controller = controller_with(gate, ControllerSettings::default());
        let before = controller.status();

        let report = controller.test_known().expect("self-test runs");

        let calls = log.lock().unwrap().clone();
        let expected: Vec<(CallId, ParamVector)> = CorpusTable::optee()
            .list()
            .iter()
            .map(|entry| (entry.id, ZERO_PARAMS))
            .collect();
        assert_eq!(calls, expected);
        assert_eq!(report.results.len(), 6);
        assert_eq!(report.results[1].result, Ok(u64::MAX));
        assert_eq!(report.results[2].result, Ok(0x42));
        assert_eq!(controller.status(), before);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn reset_zeroes_counters_and_keeps_enabled_flag() {
        let controller = controller_with(alternating_gate(), ControllerSettings::default());
        controller.run(30).unwrap();
        controller.disable();
        controller.reset().unwrap();

        let status = controller.status();
        assert_eq!(status.stats, CampaignStats::default());
        assert!(status.findings.is_empty());
        assert!(!status.enabled);
    }

    #[test]
    fn interesting_responses_land_in_finding_log() {
        let controller = controller_with(ScriptedGate::constant(0x1000), ControllerSettings::default());
        controller.run(20).unwrap();
        let status = controller.status();
        assert_eq!(status.stats.interesting_cases, 20);
        assert!(!status.findings.is_empty());
        assert_eq!(status.findings.len(), status.unique_findings);
        assert!(status.findings.iter().all(|f| f.result == 0x1000));
    }

    #[test]
    fn long_campaign_keeps_finding_log_bounded() {
        let mut n = 0u64;
        let gate = FnGate::new("varied", move |_id: CallId, _params: &ParamVector| {
            n += 1;
            n
        });
        let settings = ControllerSettings {
            finding_capacity: 4,
            ..ControllerSettings::default()
        };
        let controller = controller_with(gate, settings);
        controller.run(5_000).unwrap();

        let status = controller.status();
        assert_eq!(status.stats.interesting_cases, 5_000);
        assert_eq!(status.findings.len(), 4);
        assert_eq!(status.unique_findings, 5_000);
        assert_eq!(status.findings.last().map(|f| f.result), Some(5_000));
    }

    #[test]
    fn status_is_idempotent() {
        let controller = controller_with(alternating_gate(), ControllerSettings::default());
        controller.run(12).unwrap();
        assert_eq!(controller.status(), controller.status());
    }

    #[test]
    fn gate_failure_aborts_campaign() {
        let gate = ScriptedGate::new(
            [Ok(0), Ok(0), Err(GateFault::Io("helper vanished".into()))],
            0,
        );
        let controller = controller_with(gate, ControllerSettings::default());
        let report = controller.run(10).unwrap();
        assert_eq!(report.executed, 2);
        assert!(matches!(report.stop_reason, StopReason::GateFailure(_)));
        assert_eq!(controller.status().stats.total_iterations, 2);
        assert_eq!(controller.state(), ControllerState::Stopped);
    }

    #[test]
    fn concurrent_commands_are_rejected_while_a_campaign_runs() {
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut first = true;
        let gate = FnGate::new("blocking", move |_id: CallId, _params: &ParamVector| {
            if first {
                first = false;
                let _ = entered_tx.send(());
                let _ = release_rx.recv();
            }
            0
        });
        let controller = Arc::new(controller_with(gate, ControllerSettings::default()));
        let runner = Arc::clone(&controller);
        let campaign = std::thread::spawn(move || runner.run(3));

        entered_rx.recv().expect("campaign reached the gate");
        assert_eq!(controller.state(), ControllerState::Running);
        assert_eq!(controller.run(1).unwrap_err(), ControllerError::Busy);
        assert_eq!(controller.test_known().unwrap_err(), ControllerError::Busy);
        assert_eq!(controller.reset().unwrap_err(), ControllerError::Busy);
        // Status and permission changes never wait on the campaign.
        assert!(controller.status().enabled);
        release_tx.send(()).expect("release gate");

        let report = campaign.join().expect("campaign thread").expect("campaign ok");
        assert_eq!(report.executed, 3);
        assert_eq!(controller.status().stats.total_iterations, 3);
    }

    #[test]
    fn from_config_applies_seed_and_settings() {
        let mut config = SmcFuzzConfig::default();
        config.campaign.seed = Some(11);
        config.campaign.max_iterations_per_command = Some(5);
        let controller = Controller::from_config(&config, ScriptedGate::constant(0)).unwrap();
        assert_eq!(controller.settings().max_iterations_per_command, Some(5));
        assert!(controller.run(6).is_err());
    }

    #[test]
    fn shutdown_withdraws_permission_and_returns_totals() {
        let controller = controller_with(alternating_gate(), ControllerSettings::default());
        controller.run(9).unwrap();
        let stats = controller.shutdown();
        assert_eq!(stats.total_iterations, 9);
        assert!(!controller.is_enabled());
    }
}
