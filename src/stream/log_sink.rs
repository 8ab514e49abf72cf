use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{SampleReceiver, Sink};
use crate::sample::Payload;

/// Writes every sample to the log facade.
#[derive(Debug, Clone)]
pub struct LogSink {
    name: String,
    level: log::Level,
}

impl LogSink {
    pub fn new(name: impl Into<String>, level: log::Level) -> Self {
        Self {
            name: name.into(),
            level,
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new("log", log::Level::Info)
    }
}

impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(
        self: Box<Self>,
        token: CancellationToken,
        tracker: &TaskTracker,
        mut samples: SampleReceiver,
    ) {
        tracker.spawn(async move {
            loop {
                let sample = tokio::select! {
                    _ = token.cancelled() => break,
                    next = samples.recv() => match next {
                        Some(sample) => sample,
                        None => break,
                    },
                };
                match sample.payload() {
                    Payload::Tick { seq } => {
                        log::log!(self.level, "[{}] tick #{}", sample.source(), seq)
                    }
                    Payload::Metric {
                        name,
                        value,
                        labels,
                    } => log::log!(
                        self.level,
                        "[{}] {}{:?} = {}",
                        sample.source(),
                        name,
                        labels,
                        value
                    ),
                    Payload::Event { name, message } => {
                        log::log!(self.level, "[{}] {}: {}", sample.source(), name, message)
                    }
                }
            }
            log::debug!("Sink `{}` stopped", self.name);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Sample;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_exits_when_queue_closes() {
        let tracker = TaskTracker::new();
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        Box::new(LogSink::default()).start(CancellationToken::new(), &tracker, rx);

        tx.send(Arc::new(Sample::metric("process", "threads", 12.0, [("pid", "1")])))
            .await
            .unwrap();
        drop(tx);
        tracker.close();
        tracker.wait().await;
        assert!(tracker.is_empty());
    }
}
