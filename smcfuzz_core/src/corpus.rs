use crate::call::{CallId, Namespace};
use rand_core::RngCore;
use std::collections::HashSet;
use thiserror::Error;

/// Errors raised while building a [`CorpusTable`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CorpusError {
    /// A table needs at least one entry to seed generation and self-test.
    #[error("Corpus table must contain at least one call identifier")]
    Empty,

    /// The same identifier was listed twice.
    #[error("Call identifier {0} appears more than once in the corpus table")]
    Duplicate(CallId),

    /// The identifier is not part of the target interface's namespace.
    #[error("Call identifier {id} lies outside namespace prefix 0x{prefix:08x}")]
    OutsideNamespace { id: CallId, prefix: u32 },
}

pub const OPTEE_SMC_CALL_RETURN_FROM_RPC: CallId = CallId(0xb200_0003);
pub const OPTEE_SMC_CALL_WITH_ARG: CallId = CallId(0xb200_0004);
pub const OPTEE_SMC_GET_SHM_CONFIG: CallId = CallId(0xb200_0007);
pub const OPTEE_SMC_EXCHANGE_CAPABILITIES: CallId = CallId(0xb200_0009);
pub const OPTEE_SMC_DISABLE_SHM_CACHE: CallId = CallId(0xb200_000a);
pub const OPTEE_SMC_ENABLE_SHM_CACHE: CallId = CallId(0xb200_000b);

const OPTEE_KNOWN_CALLS: [(CallId, &str); 6] = [
    (OPTEE_SMC_CALL_RETURN_FROM_RPC, "CALL_RETURN_FROM_RPC"),
    (OPTEE_SMC_CALL_WITH_ARG, "CALL_WITH_ARG"),
    (OPTEE_SMC_GET_SHM_CONFIG, "GET_SHM_CONFIG"),
    (OPTEE_SMC_EXCHANGE_CAPABILITIES, "EXCHANGE_CAPABILITIES"),
    (OPTEE_SMC_DISABLE_SHM_CACHE, "DISABLE_SHM_CACHE"),
    (OPTEE_SMC_ENABLE_SHM_CACHE, "ENABLE_SHM_CACHE"),
];

/// Name of a documented OP-TEE call, if `id` is one.
pub fn optee_name(id: CallId) -> Option<&'static str> {
    OPTEE_KNOWN_CALLS
        .iter()
        .find(|(known, _)| *known == id)
        .map(|(_, name)| *name)
}

/// A documented call identifier believed to map to a real operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub id: CallId,
    /// Human-readable operation name, or the hex id for unnamed entries.
    pub name: String,
}

impl CorpusEntry {
    pub fn new(id: CallId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// An entry known only by its number, named after its hex form.
    pub fn unnamed(id: CallId) -> Self {
        Self {
            id,
            name: id.to_string(),
        }
    }
}

/// The fixed set of known identifiers for the target interface.
///
/// The table is validated and frozen at construction: entries keep the order
/// they were given in, and nothing can be added or removed afterwards. The
/// generator draws from it for corpus-weighted identifier selection and the
/// controller walks it in order for the self-test.
#[derive(Debug, Clone)]
pub struct CorpusTable {
    entries: Vec<CorpusEntry>,
}

impl CorpusTable {
    /// Builds a table from `entries`, checking each id against `namespace`.
    ///
    /// # Errors
    /// Returns [`CorpusError::Empty`] for an empty list,
    /// [`CorpusError::Duplicate`] when an id repeats, and
    /// [`CorpusError::OutsideNamespace`] for ids the interface does not own.
    pub fn new(entries: Vec<CorpusEntry>, namespace: &Namespace) -> Result<Self, CorpusError> {
        if entries.is_empty() {
            return Err(CorpusError::Empty);
        }
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !namespace.contains(entry.id) {
                return Err(CorpusError::OutsideNamespace {
                    id: entry.id,
                    prefix: namespace.prefix(),
                });
            }
            if !seen.insert(entry.id) {
                return Err(CorpusError::Duplicate(entry.id));
            }
        }
        Ok(Self { entries })
    }

    /// Convenience constructor for a list of bare identifiers.
    pub fn from_ids(ids: &[CallId], namespace: &Namespace) -> Result<Self, CorpusError> {
        let entries = ids
            .iter()
            .map(|&id| match optee_name(id) {
                Some(name) => CorpusEntry::new(id, name),
                None => CorpusEntry::unnamed(id),
            })
            .collect();
        Self::new(entries, namespace)
    }

    /// The six documented OP-TEE SMC function ids.
    pub fn optee() -> Self {
        Self {
            entries: OPTEE_KNOWN_CALLS
                .iter()
                .map(|(id, name)| CorpusEntry::new(*id, *name))
                .collect(),
        }
    }

    /// All entries in construction order.
    pub fn list(&self) -> &[CorpusEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&CorpusEntry> {
        self.entries.get(index)
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Picks an entry uniformly at random.
    pub fn random_select(&self, rng: &mut dyn RngCore) -> &CorpusEntry {
        let index = rng.next_u64() as usize % self.entries.len();
        &self.entries[index]
    }
}

impl Default for CorpusTable {
    fn default() -> Self {
        Self::optee()
    }
}
