//! Transport envelope for the push path.

use serde::{Deserialize, Serialize};

use crate::measurement::{Measurement, MeasurementValue, MetricKind, Tags};

/// One measurement translated into the push backend's point type.
///
/// Owned value: it moves from the producer into the channel and then to
/// the sender, and is never shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    pub kind: MetricKind,
    #[serde(flatten)]
    pub value: MeasurementValue,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
    /// Collection time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl From<&Measurement> for Envelope {
    fn from(m: &Measurement) -> Self {
        Self {
            name: m.name().to_string(),
            kind: m.kind(),
            value: m.value().clone(),
            tags: m.tags().clone(),
            timestamp_ms: m.timestamp().timestamp_millis(),
        }
    }
}

impl From<Measurement> for Envelope {
    fn from(m: Measurement) -> Self {
        Self::from(&m)
    }
}
