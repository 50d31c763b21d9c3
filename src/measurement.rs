//! Core measurement types.
//!
//! A [`Measurement`] is one named, tagged numeric observation produced by a
//! collector during a single collection call. Fields are private: a
//! measurement is assembled with the consuming `with_*` builders and is
//! read-only once handed to the scheduler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Maximum length (in characters) of a tag value.
pub const MAX_TAG_VALUE_LEN: usize = 160;

/// Maximum number of tags kept on a single measurement.
pub const MAX_TAG_COUNT: usize = 32;

/// Tag key reserved for the status marker of degenerate measurements.
pub const STATUS_TAG: &str = "status";

/// Tag key carrying the truncated failure reason of an error measurement.
pub const REASON_TAG: &str = "reason";

/// Measurement tags. Keys are unique; ordering carries no meaning.
pub type Tags = BTreeMap<String, String>;

/// Metric kind marker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MetricKind {
    Gauge,
    Counter,
    Histogram,
    Summary,
}

/// Status marker attached to placeholder measurements.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Status {
    /// Regular sample.
    Ok,
    /// Not enough history to report a value (e.g. first rate sample).
    Empty,
    /// Collection was cancelled before a value was produced.
    Cancelled,
    /// Collection failed; see the `reason` tag.
    Error,
}

/// One histogram bucket (cumulative count of observations `<= upper_bound`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub upper_bound: f64,
    pub count: u64,
}

/// One summary quantile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantile {
    pub quantile: f64,
    pub value: f64,
}

/// Numeric payload of a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MeasurementValue {
    /// Single value (gauges and counters).
    Scalar { value: f64 },
    /// Histogram buckets plus total sum and count.
    Histogram {
        buckets: Vec<Bucket>,
        sum: f64,
        count: u64,
    },
    /// Summary quantiles plus total sum and count.
    Summary {
        quantiles: Vec<Quantile>,
        sum: f64,
        count: u64,
    },
}

/// A named, tagged numeric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    name: String,
    kind: MetricKind,
    value: MeasurementValue,
    tags: Tags,
    timestamp: DateTime<Utc>,
}

impl Measurement {
    fn new(name: impl Into<String>, kind: MetricKind, value: MeasurementValue) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            tags: Tags::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a gauge measurement.
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Gauge, MeasurementValue::Scalar { value })
    }

    /// Create a counter measurement.
    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Counter, MeasurementValue::Scalar { value })
    }

    /// Create a histogram measurement from cumulative buckets.
    pub fn histogram(name: impl Into<String>, buckets: Vec<Bucket>, sum: f64, count: u64) -> Self {
        Self::new(
            name,
            MetricKind::Histogram,
            MeasurementValue::Histogram {
                buckets,
                sum,
                count,
            },
        )
    }

    /// Create a summary measurement.
    pub fn summary(
        name: impl Into<String>,
        quantiles: Vec<Quantile>,
        sum: f64,
        count: u64,
    ) -> Self {
        Self::new(
            name,
            MetricKind::Summary,
            MeasurementValue::Summary {
                quantiles,
                sum,
                count,
            },
        )
    }

    /// Create a status-tagged placeholder gauge with value `0`.
    pub fn degenerate(name: impl Into<String>, status: Status) -> Self {
        Self::gauge(name, 0.0).with_tag(STATUS_TAG, status.as_ref())
    }

    /// Placeholder for a rate collector without enough history.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::degenerate(name, Status::Empty)
    }

    /// Placeholder for a cancelled collection.
    pub fn cancelled(name: impl Into<String>) -> Self {
        Self::degenerate(name, Status::Cancelled)
    }

    /// Placeholder for a failed collection. The reason is truncated.
    pub fn error(name: impl Into<String>, reason: impl AsRef<str>) -> Self {
        Self::degenerate(name, Status::Error).with_tag(REASON_TAG, reason.as_ref())
    }

    /// Add a tag. Values are truncated to [`MAX_TAG_VALUE_LEN`] characters;
    /// new keys beyond [`MAX_TAG_COUNT`] are ignored.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl AsRef<str>) -> Self {
        let key = key.into();
        if self.tags.len() >= MAX_TAG_COUNT && !self.tags.contains_key(&key) {
            tracing::trace!(metric = %self.name, tag = %key, "Tag limit reached, dropping tag");
            return self;
        }
        self.tags.insert(key, truncate_tag_value(value.as_ref()));
        self
    }

    /// Add several tags, with the same limits as [`Self::with_tag`].
    #[must_use]
    pub fn with_tags<K, V, I>(self, tags: I) -> Self
    where
        K: Into<String>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        tags.into_iter().fold(self, |m, (k, v)| m.with_tag(k, v))
    }

    /// Override the collection timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Return a copy renamed with `prefix` prepended.
    #[must_use]
    pub fn prefixed(mut self, prefix: &str) -> Self {
        if !prefix.is_empty() {
            self.name = format!("{prefix}{}", self.name);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn value(&self) -> &MeasurementValue {
        &self.value
    }

    /// Scalar value, if this is a gauge or counter.
    pub fn scalar(&self) -> Option<f64> {
        match self.value {
            MeasurementValue::Scalar { value } => Some(value),
            _ => None,
        }
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Status marker; measurements without one are regular samples.
    pub fn status(&self) -> Status {
        self.tag(STATUS_TAG)
            .and_then(|s| s.parse().ok())
            .unwrap_or(Status::Ok)
    }

    /// Whether this is a status-tagged placeholder.
    pub fn is_degenerate(&self) -> bool {
        self.status() != Status::Ok
    }
}

/// Truncate a tag value to at most [`MAX_TAG_VALUE_LEN`] characters,
/// respecting UTF-8 boundaries.
pub fn truncate_tag_value(value: &str) -> String {
    match value.char_indices().nth(MAX_TAG_VALUE_LEN) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
