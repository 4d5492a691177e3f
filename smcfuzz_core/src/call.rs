use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of argument registers passed with every call after the function id.
pub const PARAM_COUNT: usize = 6;

/// The argument registers of a single call, in register order.
pub type ParamVector = [u64; PARAM_COUNT];

/// An all-zero parameter vector, used by the corpus self-test.
pub const ZERO_PARAMS: ParamVector = [0; PARAM_COUNT];

/// A function identifier on the privileged call interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u32);

impl CallId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl From<u32> for CallId {
    fn from(raw: u32) -> Self {
        CallId(raw)
    }
}

/// The identifier space owned by the target interface.
///
/// An id belongs to the namespace when all bits outside `variable_bits`
/// equal `prefix`. The default is the OP-TEE fast/yielding SMC range
/// `0xb2000000..=0xb2ffffff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespace {
    prefix: u32,
    variable_bits: u32,
}

pub const OPTEE_PREFIX: u32 = 0xb200_0000;
pub const OPTEE_VARIABLE_BITS: u32 = 0x00ff_ffff;

impl Namespace {
    /// Returns `None` when the prefix overlaps the variable bits.
    pub fn new(prefix: u32, variable_bits: u32) -> Option<Self> {
        if prefix & variable_bits != 0 {
            return None;
        }
        Some(Self {
            prefix,
            variable_bits,
        })
    }

    pub fn optee() -> Self {
        Self {
            prefix: OPTEE_PREFIX,
            variable_bits: OPTEE_VARIABLE_BITS,
        }
    }

    pub fn prefix(&self) -> u32 {
        self.prefix
    }

    pub fn variable_bits(&self) -> u32 {
        self.variable_bits
    }

    pub fn contains(&self, id: CallId) -> bool {
        id.0 & !self.variable_bits == self.prefix
    }

    /// Builds an id inside the namespace from arbitrary low-order bits.
    pub fn compose(&self, low_bits: u32) -> CallId {
        CallId(self.prefix | (low_bits & self.variable_bits))
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::optee()
    }
}

/// Classification of a returned primary register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Valid,
    Error,
    Interesting,
}

impl Outcome {
    /// `0` is success, negative (as a signed register) is the standard
    /// rejection convention, anything else is worth a second look.
    pub fn classify(result: u64) -> Self {
        if result == 0 {
            Outcome::Valid
        } else if (result as i64) < 0 {
            Outcome::Error
        } else {
            Outcome::Interesting
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Valid => "valid",
            Outcome::Error => "error",
            Outcome::Interesting => "interesting",
        };
        f.write_str(s)
    }
}
