//! Sampling and filter policy applied to every measurement of a cycle.

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use regex::Regex;

use crate::measurement::Measurement;

/// Uniform `[0, 1)` random source.
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::rng().random::<f64>()
    }
}

/// Predicate deciding whether a measurement is eligible at all.
pub type Predicate = Arc<dyn Fn(&Measurement) -> bool + Send + Sync>;

/// Probabilistic sampling plus an optional predicate filter.
///
/// `keep` drops a measurement the predicate rejects; otherwise, when
/// `rate < 1.0`, it draws `r` from the random source and keeps iff
/// `r <= rate`.
#[derive(Clone)]
pub struct SamplingPolicy {
    rate: f64,
    predicate: Option<Predicate>,
    random: Arc<dyn RandomSource>,
}

impl fmt::Debug for SamplingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingPolicy")
            .field("rate", &self.rate)
            .field("predicate", &self.predicate.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl SamplingPolicy {
    /// Create a policy keeping measurements with probability `rate`
    /// (clamped to `[0, 1]`).
    pub fn new(rate: f64) -> Self {
        Self {
            rate: if rate.is_nan() { 1.0 } else { rate.clamp(0.0, 1.0) },
            predicate: None,
            random: Arc::new(ThreadRandom),
        }
    }

    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Measurement) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn with_filter(self, filter: NameFilter) -> Self {
        if filter.is_empty() {
            return self;
        }
        self.with_predicate(move |m| filter.matches(m.name()))
    }

    #[must_use]
    pub fn with_random(mut self, random: impl RandomSource + 'static) -> Self {
        self.random = Arc::new(random);
        self
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn keep(&self, measurement: &Measurement) -> bool {
        if let Some(predicate) = &self.predicate
            && !predicate(measurement)
        {
            return false;
        }
        if self.rate < 1.0 {
            return self.random.next_f64() <= self.rate;
        }
        true
    }

    /// Filter a batch in place, returning how many were dropped.
    pub fn apply(&self, batch: &mut Vec<Measurement>) -> usize {
        let before = batch.len();
        batch.retain(|m| self.keep(m));
        before - batch.len()
    }
}

/// Include/exclude regular expressions over measurement names.
///
/// A name passes if it matches any include pattern (or there are none) and
/// matches no exclude pattern.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl NameFilter {
    /// Compile the pattern lists.
    ///
    /// # Errors
    /// Returns the first pattern that fails to compile.
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self, regex::Error> {
        let compile = |patterns: &[S]| {
            patterns
                .iter()
                .map(|p| Regex::new(p.as_ref()))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        (self.include.is_empty() || self.include.iter().any(|r| r.is_match(name)))
            && !self.exclude.iter().any(|r| r.is_match(name))
    }
}
