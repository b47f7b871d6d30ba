//! Labels and the canonical metric-name encoding.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A time-series label. Labels with an empty name or value are ignored when
/// building series identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    /// Creates a new label.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Checks that both name and value are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.value.is_empty()
    }
}

impl Ord for Label {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.value.cmp(&other.value))
    }
}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Marshals a metric name and its labels into a canonical, injective byte key.
///
/// A metric without labels marshals to its raw UTF-8 bytes. With labels, every
/// component is length-prefixed (u16 little-endian) and labels are sorted, so
/// equal series always produce equal keys and distinct series never collide.
pub fn marshal_metric_name(metric: &str, labels: &[Label]) -> Vec<u8> {
    if labels.is_empty() {
        return metric.as_bytes().to_vec();
    }

    let mut sorted: Vec<&Label> = labels.iter().filter(|l| l.is_valid()).collect();
    sorted.sort();

    let mut out = Vec::with_capacity(
        2 + metric.len() + sorted.iter().map(|l| 4 + l.name.len() + l.value.len()).sum::<usize>(),
    );
    push_component(&mut out, metric.as_bytes());
    for label in sorted {
        push_component(&mut out, label.name.as_bytes());
        push_component(&mut out, label.value.as_bytes());
    }
    out
}

fn push_component(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len().min(u16::MAX as usize);
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&bytes[..len]);
}

/// Reverses [`marshal_metric_name`]. Byte keys that do not parse as the
/// length-prefixed layout are treated as plain label-less metric names.
pub fn unmarshal_metric_name(marshaled: &[u8]) -> (String, Vec<Label>) {
    let Some(components) = split_components(marshaled) else {
        return (String::from_utf8_lossy(marshaled).into_owned(), Vec::new());
    };

    // Labels come in pairs after the metric name.
    if components.is_empty() || components.len() % 2 == 0 {
        return (String::from_utf8_lossy(marshaled).into_owned(), Vec::new());
    }

    let metric = String::from_utf8_lossy(components[0]).into_owned();
    let labels = components[1..]
        .chunks_exact(2)
        .map(|pair| {
            Label::new(
                String::from_utf8_lossy(pair[0]).into_owned(),
                String::from_utf8_lossy(pair[1]).into_owned(),
            )
        })
        .collect();
    (metric, labels)
}

fn split_components(bytes: &[u8]) -> Option<Vec<&[u8]>> {
    let mut components = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let len = u16::from_le_bytes([*bytes.get(pos)?, *bytes.get(pos + 1)?]) as usize;
        pos += 2;
        components.push(bytes.get(pos..pos + len)?);
        pos += len;
    }
    Some(components)
}
