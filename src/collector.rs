//! Turns timer ticks into samples on the stream registry's ingress channel.
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::node::NodeIdentity;
use crate::sample::Sample;
use crate::sampler::{self, Sampler};
use crate::watch::Subscription;

/// The current node identity, `None` while the node is being (re)discovered.
pub type SharedIdentity = Arc<RwLock<Option<NodeIdentity>>>;

/// Runs every sampler once per tick.
pub struct Collector {
    samplers: Vec<Box<dyn Sampler>>,
    identity: SharedIdentity,
    ingress: mpsc::Sender<Sample>,
}

impl Collector {
    pub fn new(identity: SharedIdentity, ingress: mpsc::Sender<Sample>) -> Self {
        Self {
            samplers: Vec::new(),
            identity,
            ingress,
        }
    }

    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.samplers.push(Box::new(sampler));
        self
    }

    /// Number of registered samplers.
    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    /// Consumes `ticks` until it closes or `token` is cancelled.
    pub fn start(self, ticks: Subscription<u64>, token: CancellationToken, tracker: &TaskTracker) {
        tracker.spawn(self.run(ticks, token));
    }

    async fn run(self, mut ticks: Subscription<u64>, token: CancellationToken) {
        let Self {
            mut samplers,
            identity,
            ingress,
        } = self;

        loop {
            let seq = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                tick = ticks.recv() => match tick {
                    Some(seq) => seq,
                    None => break,
                },
            };
            let current = identity.read().clone();

            // samplers do blocking procfs reads
            let round = tokio::task::spawn_blocking(move || {
                let before = std::time::Instant::now();
                let mut out = Vec::new();
                for sampler in samplers.iter_mut() {
                    if let Err(err) = sampler.sample(current.as_ref(), &mut out) {
                        match err {
                            sampler::Error::ProcessGone { pid } => {
                                log::debug!("Sampler `{}` lost node process {pid}", sampler.name());
                            }
                            err => log::warn!("Sampler `{}` failed: {err}", sampler.name()),
                        }
                    }
                }
                log::trace!(
                    "Sampling round took {} nanoseconds",
                    before.elapsed().as_nanos()
                );
                (samplers, out)
            })
            .await;
            let out;
            (samplers, out) = match round {
                Ok(round) => round,
                Err(err) => {
                    log::error!("Sampling round panicked, stopping collector: {err}");
                    return;
                }
            };

            log::trace!("Tick #{seq} produced {} samples", out.len());
            for sample in out {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    sent = ingress.send(sample) => {
                        if sent.is_err() {
                            log::debug!("Stream ingress closed, stopping collector");
                            return;
                        }
                    }
                }
            }
        }
        log::debug!("Collector exited");
    }
}
