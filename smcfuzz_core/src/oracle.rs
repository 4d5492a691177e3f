use crate::call::{CallId, Outcome, ParamVector};
use crate::executor::{Execution, ExecutionStatus};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

/// Default number of findings kept for read-back.
pub const DEFAULT_FINDING_CAPACITY: usize = 64;

/// A non-valid response worth keeping for offline triage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// The identifier that produced the response.
    pub id: CallId,
    /// The parameters of the first call that produced it.
    pub params: ParamVector,
    /// The raw result register.
    pub result: u64,
    pub outcome: Outcome,
    /// MD5 hex digest of the id and result, used for deduplication.
    /// Parameters are not hashed.
    pub fingerprint: String,
}

/// Hashes an (id, result) pair into the finding fingerprint.
pub fn fingerprint(id: CallId, result: u64) -> String {
    let mut bytes = [0u8; 12];
    bytes[..4].copy_from_slice(&id.raw().to_le_bytes());
    bytes[4..].copy_from_slice(&result.to_le_bytes());
    format!("{:x}", md5::compute(bytes))
}

/// Decides which executions become findings.
///
/// Interesting responses always do. Standard rejections are common and
/// expected, so they are only reported when `report_rejections` is set.
#[derive(Debug, Default, Clone, Copy)]
pub struct TriageOracle {
    pub report_rejections: bool,
}

impl TriageOracle {
    pub fn new(report_rejections: bool) -> Self {
        Self { report_rejections }
    }

    /// Examines a finished execution and returns a finding if it qualifies.
    /// Faulted executions are left to the statistics and the watchdog.
    pub fn examine(&self, execution: &Execution) -> Option<Finding> {
        let ExecutionStatus::Returned { result, outcome } = execution.status else {
            return None;
        };
        let keep = match outcome {
            Outcome::Interesting => true,
            Outcome::Error => self.report_rejections,
            Outcome::Valid => false,
        };
        keep.then(|| Finding {
            id: execution.id,
            params: execution.params,
            result,
            outcome,
            fingerprint: fingerprint(execution.id, result),
        })
    }
}

/// Bounded log of unique findings, oldest evicted first.
///
/// Deduplication covers the retained window only, so memory stays bounded by
/// `capacity`. A fingerprint that was evicted is reported again when it
/// reappears.
#[derive(Debug)]
pub struct FindingLog {
    capacity: usize,
    recent: VecDeque<Finding>,
    seen: HashSet<String>,
    accepted: usize,
    duplicates: u64,
}

impl FindingLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            recent: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            accepted: 0,
            duplicates: 0,
        }
    }

    /// Stores `finding` unless a retained finding has the same fingerprint.
    /// Returns `true` when it was new.
    pub fn push(&mut self, finding: Finding) -> bool {
        if self.seen.contains(&finding.fingerprint) {
            self.duplicates += 1;
            return false;
        }
        self.accepted += 1;
        if self.capacity == 0 {
            return true;
        }
        if self.recent.len() == self.capacity {
            if let Some(evicted) = self.recent.pop_front() {
                self.seen.remove(&evicted.fingerprint);
            }
        }
        self.seen.insert(finding.fingerprint.clone());
        self.recent.push_back(finding);
        true
    }

    /// Retained findings, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &Finding> {
        self.recent.iter()
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    /// Number of findings accepted as new since the last clear.
    pub fn unique(&self) -> usize {
        self.accepted
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn clear(&mut self) {
        self.recent.clear();
        self.seen.clear();
        self.accepted = 0;
        self.duplicates = 0;
    }
}

impl Default for FindingLog {
    fn default() -> Self {
        Self::new(DEFAULT_FINDING_CAPACITY)
    }
}
