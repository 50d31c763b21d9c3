//! Prometheus text exposition format.
//!
//! Output is sorted by metric family then by label set, so two renders of the
//! same batch are byte-identical.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::measurement::{Measurement, MeasurementValue, MetricKind, Tags};

/// Content type for the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

struct Family<'a> {
    kind: MetricKind,
    series: Vec<(String, &'a Measurement)>,
}

/// Render a batch as exposition text.
pub fn render(batch: &[Measurement]) -> String {
    let mut families: BTreeMap<String, Family<'_>> = BTreeMap::new();
    for m in batch {
        let family = families
            .entry(sanitize_name(m.name()))
            .or_insert_with(|| Family {
                kind: m.kind(),
                series: Vec::new(),
            });
        if family.kind != m.kind() {
            tracing::debug!(metric = %m.name(), kind = %m.kind(), "Kind conflicts with family, skipped");
            continue;
        }
        family.series.push((render_labels(m.tags(), None), m));
    }

    let mut out = String::new();
    for (name, mut family) in families {
        family.series.sort_by(|a, b| a.0.cmp(&b.0));
        let _ = writeln!(out, "# TYPE {name} {}", family.kind);
        for (labels, m) in &family.series {
            write_series(&mut out, &name, labels, m);
        }
    }
    out
}

fn write_series(out: &mut String, name: &str, labels: &str, m: &Measurement) {
    match m.value() {
        MeasurementValue::Scalar { value } => {
            let _ = writeln!(out, "{name}{labels} {}", format_value(*value));
        }
        MeasurementValue::Histogram {
            buckets,
            sum,
            count,
        } => {
            let mut has_inf = false;
            for bucket in buckets {
                has_inf |= bucket.upper_bound == f64::INFINITY;
                let le = render_labels(m.tags(), Some(("le", &format_value(bucket.upper_bound))));
                let _ = writeln!(out, "{name}_bucket{le} {}", bucket.count);
            }
            if !has_inf {
                let le = render_labels(m.tags(), Some(("le", "+Inf")));
                let _ = writeln!(out, "{name}_bucket{le} {count}");
            }
            let _ = writeln!(out, "{name}_sum{labels} {}", format_value(*sum));
            let _ = writeln!(out, "{name}_count{labels} {count}");
        }
        MeasurementValue::Summary {
            quantiles,
            sum,
            count,
        } => {
            for q in quantiles {
                let ql = render_labels(m.tags(), Some(("quantile", &format_value(q.quantile))));
                let _ = writeln!(out, "{name}{ql} {}", format_value(q.value));
            }
            let _ = writeln!(out, "{name}_sum{labels} {}", format_value(*sum));
            let _ = writeln!(out, "{name}_count{labels} {count}");
        }
    }
}

/// Map a dotted metric name onto `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn sanitize_name(name: &str) -> String {
    sanitize(name, true)
}

fn sanitize(raw: &str, allow_colon: bool) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || (allow_colon && c == ':') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn render_labels(tags: &Tags, extra: Option<(&str, &str)>) -> String {
    if tags.is_empty() && extra.is_none() {
        return String::new();
    }

    let mut out = String::from("{");
    let pairs = tags
        .iter()
        .map(|(k, v)| (sanitize(k, false), v.as_str()))
        .chain(extra.map(|(k, v)| (k.to_string(), v)));
    for (idx, (key, value)) in pairs.enumerate() {
        if idx > 0 {
            out.push(',');
        }
        let _ = write!(out, "{key}=\"{}\"", escape_label_value(value));
    }
    out.push('}');
    out
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Bucket, Quantile};

    #[test]
    fn test_render_gauge_with_labels() {
        let batch = vec![
            Measurement::gauge("cpu.core_usage", 12.5).with_tag("core", "1"),
            Measurement::gauge("cpu.core_usage", 3.0).with_tag("core", "0"),
        ];
        let text = render(&batch);
        assert_eq!(
            text,
            "# TYPE cpu_core_usage gauge\n\
             cpu_core_usage{core=\"0\"} 3\n\
             cpu_core_usage{core=\"1\"} 12.5\n"
        );
    }

    #[test]
    fn test_render_is_order_independent() {
        let a = Measurement::counter("net-bytes", 10.0);
        let b = Measurement::gauge("memory.used", 2.0);
        assert_eq!(render(&[a.clone(), b.clone()]), render(&[b, a]));
    }

    #[test]
    fn test_render_histogram_adds_inf_bucket() {
        let m = Measurement::histogram(
            "latency",
            vec![
                Bucket {
                    upper_bound: 0.1,
                    count: 2,
                },
                Bucket {
                    upper_bound: 1.0,
                    count: 3,
                },
            ],
            0.75,
            4,
        );
        let text = render(&[m]);
        assert!(text.contains("# TYPE latency histogram\n"));
        assert!(text.contains("latency_bucket{le=\"0.1\"} 2\n"));
        assert!(text.contains("latency_bucket{le=\"1\"} 3\n"));
        assert!(text.contains("latency_bucket{le=\"+Inf\"} 4\n"));
        assert!(text.contains("latency_sum 0.75\n"));
        assert!(text.contains("latency_count 4\n"));
    }

    #[test]
    fn test_render_summary() {
        let m = Measurement::summary(
            "gc.pause",
            vec![Quantile {
                quantile: 0.5,
                value: 0.002,
            }],
            0.01,
            5,
        )
        .with_tag("gen", "0");
        let text = render(&[m]);
        assert!(text.contains("gc_pause{gen=\"0\",quantile=\"0.5\"} 0.002\n"));
        assert!(text.contains("gc_pause_count{gen=\"0\"} 5\n"));
    }

    #[test]
    fn test_label_values_escaped() {
        let m = Measurement::error("disk", "bad \"path\"\nC:\\x");
        let text = render(&[m]);
        assert!(text.contains(r#"reason="bad \"path\"\nC:\\x""#), "{text}");
        assert!(text.contains(r#"status="error""#));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("network.bytes_recv.rate"), "network_bytes_recv_rate");
        assert_eq!(sanitize_name("a-b:c"), "a_b:c");
        assert_eq!(sanitize_name("9lives"), "_9lives");
    }

    #[test]
    fn test_conflicting_kind_skipped() {
        let text = render(&[
            Measurement::gauge("x", 1.0),
            Measurement::counter("x", 2.0),
        ]);
        assert_eq!(text, "# TYPE x gauge\nx 1\n");
    }

    #[test]
    fn test_empty_batch() {
        assert_eq!(render(&[]), "");
    }
}
