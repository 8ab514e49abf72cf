//! The unit of data flowing from watchers through the collector to sinks.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// An observed data point or event, tagged with the component that produced it.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Sample {
    source: Arc<str>,
    /// Milliseconds since the UNIX epoch.
    timestamp: u64,
    payload: Payload,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// A scheduling trigger carrying the tick sequence number.
    Tick { seq: u64 },
    Metric {
        name: String,
        value: f64,
        labels: BTreeMap<String, String>,
    },
    Event {
        name: String,
        message: String,
    },
}

impl Sample {
    pub fn new(source: impl Into<Arc<str>>, payload: Payload) -> Self {
        Self::at(source, now_millis(), payload)
    }

    /// A sample with an explicit timestamp in milliseconds since the epoch.
    pub fn at(source: impl Into<Arc<str>>, timestamp: u64, payload: Payload) -> Self {
        Self {
            source: source.into(),
            timestamp,
            payload,
        }
    }

    /// Convenience constructor for a metric sample.
    pub fn metric<'a>(
        source: impl Into<Arc<str>>,
        name: impl Into<String>,
        value: f64,
        labels: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        Self::new(
            source,
            Payload::Metric {
                name: name.into(),
                value,
                labels: labels
                    .into_iter()
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .collect(),
            },
        )
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
