//! Fan-out of the shared sample stream to the registered sinks.
//!
//! The collector pushes [`Sample`]s onto a single ingress channel. Once
//! [`StreamRegistry::start`] is called, a fan-out task forwards every sample, as
//! the same `Arc<Sample>`, to each sink's bounded queue in registration order.
//! Sends wait for room, so a slow sink slows the whole stream down instead of
//! growing an unbounded buffer.
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::sample::Sample;

mod error;
mod log_sink;
mod mysql;

pub use error::{Error, Result};
pub use log_sink::LogSink;
pub use mysql::{MySqlSink, SampleRow};

/// The receiving end handed to every sink.
pub type SampleReceiver = mpsc::Receiver<Arc<Sample>>;

/// Default capacity of each sink queue.
pub const DEFAULT_SINK_CAPACITY: usize = 64;

/// A consumer of the shared sample stream responsible for external delivery.
///
/// Implementations spawn their run loop onto `tracker` and consume `samples`
/// until the queue is closed or `token` is cancelled. Delivery errors are the
/// sink's own business and are logged, never propagated.
pub trait Sink: Send + 'static {
    fn name(&self) -> &str;

    fn start(
        self: Box<Self>,
        token: CancellationToken,
        tracker: &TaskTracker,
        samples: SampleReceiver,
    );
}

/// Ordered set of sinks sharing one sample stream.
///
/// Sinks can only be registered before [`start`](Self::start); the set is fixed
/// while the pipeline runs.
pub struct StreamRegistry {
    sinks: Vec<Box<dyn Sink>>,
    names: Vec<Arc<str>>,
    capacity: usize,
    started: bool,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SINK_CAPACITY)
    }
}

impl StreamRegistry {
    /// An empty registry whose per sink queues hold `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            sinks: Vec::new(),
            names: Vec::new(),
            capacity: capacity.max(1),
            started: false,
        }
    }

    /// Appends `sinks` in order.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] if the registry is running.
    /// - [`Error::DuplicateSink`] if a sink name is already registered. Sinks
    ///   preceding the duplicate in `sinks` remain registered.
    pub fn register(&mut self, sinks: impl IntoIterator<Item = Box<dyn Sink>>) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        for sink in sinks {
            if self.names.iter().any(|name| &**name == sink.name()) {
                return Err(Error::DuplicateSink(sink.name().to_owned()));
            }
            log::debug!("Registered sink `{}`", sink.name());
            self.names.push(Arc::from(sink.name()));
            self.sinks.push(sink);
        }
        Ok(())
    }

    /// Names of the registered sinks in dispatch order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|name| &**name)
    }

    /// Number of registered sinks.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Starts every sink and the fan-out task reading from `ingress`.
    ///
    /// All tasks are spawned onto `tracker`, so waiting on the tracker after
    /// cancelling `token` (or dropping every ingress sender) waits for a full
    /// drain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call.
    pub fn start(
        &mut self,
        token: &CancellationToken,
        tracker: &TaskTracker,
        ingress: mpsc::Receiver<Sample>,
    ) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.started = true;
        if self.sinks.is_empty() {
            log::warn!("Starting stream registry without sinks, samples will be discarded");
        }

        let mut outlets = Vec::with_capacity(self.sinks.len());
        for (sink, name) in self.sinks.drain(..).zip(self.names.iter()) {
            let (tx, rx) = mpsc::channel(self.capacity);
            sink.start(token.clone(), tracker, rx);
            outlets.push((Arc::clone(name), tx));
        }
        log::debug!("Started {} sinks", outlets.len());

        tracker.spawn(fan_out(token.clone(), ingress, outlets));
        Ok(())
    }
}

async fn fan_out(
    token: CancellationToken,
    mut ingress: mpsc::Receiver<Sample>,
    mut outlets: Vec<(Arc<str>, mpsc::Sender<Arc<Sample>>)>,
) {
    let mut forwarded: u64 = 0;
    loop {
        let sample = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = ingress.recv() => match next {
                Some(sample) => Arc::new(sample),
                None => break,
            },
        };

        let mut detached = Vec::new();
        for (idx, (name, tx)) in outlets.iter().enumerate() {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                sent = tx.send(Arc::clone(&sample)) => {
                    if sent.is_err() {
                        log::warn!("Sink `{}` stopped consuming, detaching it from the stream", name);
                        detached.push(idx);
                    }
                }
            }
        }
        for idx in detached.into_iter().rev() {
            outlets.remove(idx);
        }
        forwarded += 1;
        log::trace!("Forwarded sample #{forwarded} from `{}`", sample.source());
    }
    log::debug!("Stream fan-out exited after {forwarded} samples");
}
