use sqlx::MySqlPool;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{Error, Result, SampleReceiver, Sink};
use crate::container::MachineID;
use crate::sample::{Payload, Sample};

/// Maximum number of samples written per transaction.
const MAX_BATCH: usize = 256;

const INSERT_QUERY: &str = r#"
INSERT INTO samples (
    machine_id, hostname, source, timestamp_ms,
    kind, name, value, labels, message
) VALUES (
    ?, ?, ?, ?,
    ?, ?, ?, ?, ?
)"#;

/// Flattened form of a [`Sample`] as stored in the `samples` table.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    pub source: String,
    pub timestamp_ms: u64,
    pub kind: &'static str,
    pub name: Option<String>,
    pub value: Option<f64>,
    /// JSON object of the metric labels.
    pub labels: Option<String>,
    pub message: Option<String>,
}

impl From<&Sample> for SampleRow {
    fn from(sample: &Sample) -> Self {
        let base = Self {
            source: sample.source().to_owned(),
            timestamp_ms: sample.timestamp(),
            kind: "tick",
            name: None,
            value: None,
            labels: None,
            message: None,
        };
        match sample.payload() {
            Payload::Tick { seq } => Self {
                value: Some(*seq as f64),
                ..base
            },
            Payload::Metric {
                name,
                value,
                labels,
            } => Self {
                kind: "metric",
                name: Some(name.clone()),
                value: Some(*value),
                labels: serde_json::to_string(labels).ok(),
                ..base
            },
            Payload::Event { name, message } => Self {
                kind: "event",
                name: Some(name.clone()),
                message: Some(message.clone()),
                ..base
            },
        }
    }
}

/// Persists samples into MySQL, batching whatever is queued at the time of a write.
#[derive(Debug, Clone)]
pub struct MySqlSink {
    db: MySqlPool,
    machine_id: MachineID,
    hostname: String,
}

impl MySqlSink {
    /// Connects to `url` and applies the embedded migrations.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the pool cannot be established.
    /// - [`Error::Migration`] if the schema migration fails.
    pub async fn connect(url: &str, machine_id: MachineID, hostname: String) -> Result<Self> {
        let db = sqlx::mysql::MySqlPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_secs(10))
            .max_connections(4)
            .connect(url)
            .await
            .map_err(Error::Connection)?;

        sqlx::migrate!().run(&db).await.map_err(Error::Migration)?;

        Ok(Self {
            db,
            machine_id,
            hostname,
        })
    }

    /// Inserts `rows` in a single transaction; on failure nothing is written.
    async fn persist(&self, rows: &[SampleRow]) -> Result<()> {
        let mut tx = self.db.begin().await.map_err(Error::Insert)?;
        let machine_id = self.machine_id.as_raw();
        for row in rows {
            sqlx::query(INSERT_QUERY)
                .bind(machine_id.as_slice())
                .bind(&self.hostname)
                .bind(&row.source)
                .bind(row.timestamp_ms)
                .bind(row.kind)
                .bind(&row.name)
                .bind(row.value)
                .bind(&row.labels)
                .bind(&row.message)
                .execute(&mut *tx)
                .await
                .map_err(Error::Insert)?;
        }
        tx.commit().await.map_err(Error::Insert)?;
        Ok(())
    }
}

impl Sink for MySqlSink {
    fn name(&self) -> &str {
        "mysql"
    }

    fn start(
        self: Box<Self>,
        token: CancellationToken,
        tracker: &TaskTracker,
        mut samples: SampleReceiver,
    ) {
        tracker.spawn(async move {
            let mut rows = Vec::with_capacity(MAX_BATCH);
            loop {
                let first = tokio::select! {
                    _ = token.cancelled() => break,
                    next = samples.recv() => match next {
                        Some(sample) => sample,
                        None => break,
                    },
                };
                rows.push(SampleRow::from(first.as_ref()));
                while rows.len() < MAX_BATCH {
                    match samples.try_recv() {
                        Ok(sample) => rows.push(SampleRow::from(sample.as_ref())),
                        Err(_) => break,
                    }
                }
                if let Err(err) = self.persist(&rows).await {
                    log::error!("failed to persist {} samples: {}", rows.len(), err);
                }
                rows.clear();
            }
            log::debug!("Sink `mysql` stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_row() {
        let sample = Sample::metric("process", "cpu_user_ticks", 12.0, [("pid", "42")]);
        let row = SampleRow::from(&sample);
        assert_eq!(row.kind, "metric");
        assert_eq!(row.name.as_deref(), Some("cpu_user_ticks"));
        assert_eq!(row.value, Some(12.0));
        assert_eq!(row.labels.as_deref(), Some(r#"{"pid":"42"}"#));
        assert_eq!(row.message, None);
    }

    #[test]
    fn test_event_row() {
        let sample = Sample::at(
            "journal",
            5,
            Payload::Event {
                name: "restart".to_owned(),
                message: "node restarted".to_owned(),
            },
        );
        let row = SampleRow::from(&sample);
        assert_eq!(row.kind, "event");
        assert_eq!(row.timestamp_ms, 5);
        assert_eq!(row.value, None);
        assert_eq!(row.message.as_deref(), Some("node restarted"));
    }

    #[test]
    fn test_tick_row() {
        let sample = Sample::at("timer", 1, Payload::Tick { seq: 9 });
        let row = SampleRow::from(&sample);
        assert_eq!(row.kind, "tick");
        assert_eq!(row.value, Some(9.0));
        assert_eq!(row.source, "timer");
    }
}
