//! Start/stop lifecycle and publish/subscribe fan-out for data producers.
//!
//! A [`Watch`] is the shared core every producer embeds. It owns the
//! [`WatcherState`], the one-shot start gate, the stop signal and the list of
//! subscriber queues. Producers implement [`Watcher`] to hook their own startup
//! and teardown work into [`Watcher::start`] and [`Watcher::stop`].
//!
//! Every subscriber gets its own bounded queue. What happens when that queue is
//! full is decided by the [`OverflowPolicy`] of the watch:
//!
//! - [`OverflowPolicy::Block`] waits for room, so a stalled subscriber delays
//!   delivery to the subscribers after it.
//! - [`OverflowPolicy::DropOldest`] overwrites the oldest queued sample and
//!   never blocks the producer.
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Once};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

mod error;
pub mod timer;

pub use error::{Error, Result};
pub use timer::{TimerWatch, TimerWatchConfig};

/// Default number of samples buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 64;

/// Lifecycle of a watcher. `Created -> Running -> Stopped`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Created,
    Running,
    Stopped,
}

/// Behaviour of a subscriber queue that is full when a sample is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    #[default]
    Block,
    DropOldest,
}

impl FromStr for OverflowPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "block" => Ok(Self::Block),
            "drop-oldest" | "drop_oldest" => Ok(Self::DropOldest),
            other => Err(Error::UnknownOverflowPolicy(other.to_owned())),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => f.write_str("block"),
            Self::DropOldest => f.write_str("drop-oldest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    /// Per-subscriber queue capacity, at least 1.
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Sending half of one subscriber queue.
#[derive(Debug)]
enum Outlet<T> {
    Block(mpsc::Sender<T>),
    DropOldest(broadcast::Sender<T>),
}

impl<T> Clone for Outlet<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Block(tx) => Self::Block(tx.clone()),
            Self::DropOldest(tx) => Self::DropOldest(tx.clone()),
        }
    }
}

impl<T> Outlet<T> {
    fn is_open(&self) -> bool {
        match self {
            Self::Block(tx) => !tx.is_closed(),
            Self::DropOldest(tx) => tx.receiver_count() > 0,
        }
    }
}

#[derive(Debug)]
enum Inlet<T> {
    Block(mpsc::Receiver<T>),
    DropOldest(broadcast::Receiver<T>),
}

/// Receiving end of a subscription created by [`Watch::subscribe`].
///
/// The stream ends (`recv` returns `None`) once the watch is stopped and the
/// queued samples are drained.
#[derive(Debug)]
pub struct Subscription<T> {
    watch: Arc<str>,
    inlet: Inlet<T>,
}

impl<T: Clone> Subscription<T> {
    /// Waits for the next sample.
    ///
    /// Returns `None` once the watch is stopped and the queue is drained. A
    /// [`OverflowPolicy::DropOldest`] subscriber that fell behind logs how many
    /// samples it lost and continues with the oldest one still queued.
    pub async fn recv(&mut self) -> Option<T> {
        match &mut self.inlet {
            Inlet::Block(rx) => rx.recv().await,
            Inlet::DropOldest(rx) => loop {
                match rx.recv().await {
                    Ok(sample) => return Some(sample),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!(
                            "subscriber of `{}` fell behind, dropped {} oldest samples",
                            self.watch,
                            skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    /// Returns the next queued sample without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        match &mut self.inlet {
            Inlet::Block(rx) => rx.try_recv().ok(),
            Inlet::DropOldest(rx) => loop {
                match rx.try_recv() {
                    Ok(sample) => return Some(sample),
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        log::warn!(
                            "subscriber of `{}` fell behind, dropped {} oldest samples",
                            self.watch,
                            skipped
                        );
                    }
                    Err(_) => return None,
                }
            },
        }
    }
}

struct Shared<T> {
    name: Arc<str>,
    config: WatchConfig,
    state: Mutex<WatcherState>,
    start_gate: Once,
    stop: CancellationToken,
    tracker: Option<TaskTracker>,
    outlets: Mutex<Vec<Outlet<T>>>,
}

/// Shared lifecycle and fan-out state of a producer. Cloning is cheap and every
/// clone refers to the same watch.
pub struct Watch<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Watch<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Watch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("name", &self.shared.name)
            .field("state", &*self.shared.state.lock())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Watch<T> {
    /// Creates a standalone watch with its own stop signal.
    pub fn new(name: impl Into<Arc<str>>, config: WatchConfig) -> Self {
        Self::build(name.into(), config, CancellationToken::new(), None)
    }

    /// Creates a watch whose stop signal is a child of `token` and whose tasks
    /// are spawned onto `tracker`, so cancelling `token` stops its tasks too.
    pub fn attached(
        name: impl Into<Arc<str>>,
        config: WatchConfig,
        token: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        Self::build(
            name.into(),
            config,
            token.child_token(),
            Some(tracker.clone()),
        )
    }

    fn build(
        name: Arc<str>,
        config: WatchConfig,
        stop: CancellationToken,
        tracker: Option<TaskTracker>,
    ) -> Self {
        let config = WatchConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            shared: Arc::new(Shared {
                name,
                config,
                state: Mutex::new(WatcherState::Created),
                start_gate: Once::new(),
                stop,
                tracker,
                outlets: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Name the watch was created with, used in log messages.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> WatcherState {
        *self.shared.state.lock()
    }

    /// True between a successful start and the stop.
    pub fn is_running(&self) -> bool {
        self.state() == WatcherState::Running
    }

    /// Signal that fires when the watch is stopped (or its parent is cancelled).
    pub fn stop_token(&self) -> CancellationToken {
        self.shared.stop.clone()
    }

    /// Transitions `Created -> Running` and runs `startup` exactly once, even
    /// under concurrent callers. Concurrent callers wait until `startup` has
    /// finished. Returns `true` for the call that performed the startup.
    pub fn start_once(&self, startup: impl FnOnce()) -> bool {
        let mut started = false;
        self.shared.start_gate.call_once(|| {
            {
                let mut state = self.shared.state.lock();
                if *state != WatcherState::Created {
                    return;
                }
                *state = WatcherState::Running;
            }
            log::debug!("Starting watcher `{}`", self.shared.name);
            startup();
            started = true;
        });
        started
    }

    /// Transitions `Running -> Stopped`, runs `teardown`, fires the stop signal
    /// and closes all subscriber queues. No-op unless running. Returns `true`
    /// for the call that performed the stop.
    pub fn stop(&self, teardown: impl FnOnce()) -> bool {
        {
            let mut state = self.shared.state.lock();
            if *state != WatcherState::Running {
                return false;
            }
            *state = WatcherState::Stopped;
        }
        log::debug!("Stopping watcher `{}`", self.shared.name);
        teardown();
        self.shared.stop.cancel();
        self.shared.outlets.lock().clear();
        true
    }

    /// Registers a new subscriber. Samples emitted before this call are not
    /// replayed. Subscribing to a stopped watch yields an already closed stream.
    pub fn subscribe(&self) -> Subscription<T> {
        let capacity = self.shared.config.capacity;
        let (outlet, inlet) = match self.shared.config.overflow {
            OverflowPolicy::Block => {
                let (tx, rx) = mpsc::channel(capacity);
                (Outlet::Block(tx), Inlet::Block(rx))
            }
            OverflowPolicy::DropOldest => {
                let (tx, rx) = broadcast::channel(capacity);
                (Outlet::DropOldest(tx), Inlet::DropOldest(rx))
            }
        };

        if self.state() != WatcherState::Stopped {
            let mut outlets = self.shared.outlets.lock();
            outlets.push(outlet);
            log::trace!(
                "Watcher `{}` has {} subscribers",
                self.shared.name,
                outlets.len()
            );
        }

        Subscription {
            watch: Arc::clone(&self.shared.name),
            inlet,
        }
    }

    /// Delivers `sample` to every subscriber in subscription order.
    ///
    /// Never fails. Under [`OverflowPolicy::Block`] this waits for room in each
    /// queue in turn; the wait is abandoned when the watch is stopped. Nothing
    /// is delivered once the watch is stopped.
    pub async fn emit(&self, sample: T) {
        if self.shared.stop.is_cancelled() {
            return;
        }

        let outlets = self.shared.outlets.lock().clone();
        let mut saw_closed = false;
        for outlet in &outlets {
            if self.shared.stop.is_cancelled() {
                return;
            }
            match outlet {
                Outlet::Block(tx) => {
                    tokio::select! {
                        biased;
                        _ = self.shared.stop.cancelled() => return,
                        sent = tx.send(sample.clone()) => saw_closed |= sent.is_err(),
                    }
                }
                Outlet::DropOldest(tx) => saw_closed |= tx.send(sample.clone()).is_err(),
            }
        }

        if saw_closed {
            let mut outlets = self.shared.outlets.lock();
            outlets.retain(Outlet::is_open);
            log::debug!(
                "Pruned closed subscribers of `{}`, {} remaining",
                self.shared.name,
                outlets.len()
            );
        }
    }

    /// Spawns a task bound to this watch, onto the tracker if one is attached.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.shared.tracker {
            Some(tracker) => {
                tracker.spawn(task);
            }
            None => {
                tokio::spawn(task);
            }
        }
    }
}

/// A data producer with start/stop semantics built on a [`Watch`].
pub trait Watcher {
    type Sample: Clone + Send + 'static;

    fn watch(&self) -> &Watch<Self::Sample>;

    /// Producer specific startup work, run once by [`start`](Self::start).
    fn on_start(&self) {}

    /// Producer specific teardown work, run once by [`stop`](Self::stop).
    fn on_stop(&self) {}

    fn start(&self) {
        self.watch().start_once(|| self.on_start());
    }

    fn stop(&self) {
        self.watch().stop(|| self.on_stop());
    }

    fn subscribe(&self) -> Subscription<Self::Sample> {
        self.watch().subscribe()
    }

    fn state(&self) -> WatcherState {
        self.watch().state()
    }
}
