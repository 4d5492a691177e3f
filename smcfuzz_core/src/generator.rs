use crate::call::{CallId, Namespace, PARAM_COUNT, ParamVector};
use crate::corpus::CorpusTable;
use rand::Rng;

/// Probability of drawing the identifier from the corpus table, if not overridden.
pub const DEFAULT_CORPUS_WEIGHT: f64 = 0.5;

pub const PAGE_SIZE: u64 = 0x1000;
const PAGE_OFFSET_MASK: u64 = 0xfff;
const LOW_32_MASK: u64 = 0xffff_ffff;

/// The value classes a parameter slot is drawn from.
///
/// Every class is equally likely. Most of them are fixed boundary values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamClass {
    Zero,
    AllOnes,
    SignBit,
    MaxPositive,
    RandomLowHalf,
    RandomFull,
    PageSize,
    NearPage,
    /// Same bit pattern as `AllOnes`, drawn as a separate class.
    MaxValue,
    RandomMasked32,
}

impl ParamClass {
    pub const ALL: [ParamClass; 10] = [
        ParamClass::Zero,
        ParamClass::AllOnes,
        ParamClass::SignBit,
        ParamClass::MaxPositive,
        ParamClass::RandomLowHalf,
        ParamClass::RandomFull,
        ParamClass::PageSize,
        ParamClass::NearPage,
        ParamClass::MaxValue,
        ParamClass::RandomMasked32,
    ];

    /// Produces a concrete register value of this class.
    pub fn value<R: Rng + ?Sized>(self, rng: &mut R) -> u64 {
        match self {
            ParamClass::Zero => 0,
            ParamClass::AllOnes => 0xffff_ffff_ffff_ffff,
            ParamClass::SignBit => 0x8000_0000_0000_0000,
            ParamClass::MaxPositive => 0x7fff_ffff_ffff_ffff,
            ParamClass::RandomLowHalf => u64::from(rng.random::<u32>()),
            ParamClass::RandomFull => rng.random::<u64>(),
            ParamClass::PageSize => PAGE_SIZE,
            ParamClass::NearPage => PAGE_SIZE + (u64::from(rng.random::<u32>()) & PAGE_OFFSET_MASK),
            ParamClass::MaxValue => u64::MAX,
            ParamClass::RandomMasked32 => rng.random::<u64>() & LOW_32_MASK,
        }
    }
}

/// Produces one (identifier, parameter vector) pair per fuzzing iteration.
///
/// Identifiers come from the corpus table with probability `corpus_weight`;
/// otherwise they are synthesized inside the interface namespace with the
/// prefix fixed and the low-order bits random, which keeps pressure on the
/// legal range while still probing unallocated slots. Parameter slots are
/// filled independently from the [`ParamClass`] palette.
///
/// # Type Parameters
/// * `R`: The random number generator driving every decision.
pub struct ParamGenerator<R: Rng> {
    rng: R,
    namespace: Namespace,
    corpus_weight: f64,
}

impl<R: Rng> ParamGenerator<R> {
    /// Creates a generator with the default corpus weight.
    pub fn new(rng: R, namespace: Namespace) -> Self {
        Self {
            rng,
            namespace,
            corpus_weight: DEFAULT_CORPUS_WEIGHT,
        }
    }

    /// Sets the probability of reusing a corpus identifier.
    /// Values outside `0.0..=1.0` fall back to the default.
    pub fn with_corpus_weight(mut self, corpus_weight: f64) -> Self {
        self.corpus_weight = if (0.0..=1.0).contains(&corpus_weight) {
            corpus_weight
        } else {
            DEFAULT_CORPUS_WEIGHT
        };
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn corpus_weight(&self) -> f64 {
        self.corpus_weight
    }

    pub fn next_call(&mut self, corpus: &CorpusTable) -> (CallId, ParamVector) {
        let id = self.next_id(corpus);
        (id, self.next_params())
    }

    pub fn next_id(&mut self, corpus: &CorpusTable) -> CallId {
        if !corpus.is_empty() && self.rng.random_bool(self.corpus_weight) {
            return corpus.random_select(&mut self.rng).id;
        }
        let low_bits = self.rng.random::<u32>();
        self.namespace.compose(low_bits)
    }

    pub fn next_params(&mut self) -> ParamVector {
        let mut params = [0u64; PARAM_COUNT];
        for slot in params.iter_mut() {
            let class = self.sample_class();
            *slot = class.value(&mut self.rng);
        }
        params
    }

    pub fn sample_class(&mut self) -> ParamClass {
        ParamClass::ALL[self.rng.random_range(0..ParamClass::ALL.len())]
    }
}
