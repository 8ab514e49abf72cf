//! Bootstrap and supervision of the telemetry pipeline.
//!
//! [`run`] reads the configuration, discovers the node, verifies its
//! fingerprint and then keeps the sampling pipeline running until SIGINT or
//! SIGTERM. A node process that disappears is rediscovered in place.
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::collector::{Collector, SharedIdentity};
use crate::config::{self, AgentConfig};
use crate::container::{self, MachineID};
use crate::discovery::{self, ContainerdProbe, DockerProbe, Probes, systemd::SystemdProbe};
use crate::error::ResultOkLogExt;
use crate::fingerprint::{self, Fingerprint, FingerprintFile, ValidationError};
use crate::host::{self, HostRoot, procfs};
use crate::node::{self, Adapter, IdentityCache, NodeAdapter};
use crate::sampler::{LogEventSampler, NetClassSampler, NetDevSampler, ProcessSampler};
use crate::stream::{self, LogSink, MySqlSink, Sink, StreamRegistry};
use crate::watch::{TimerWatch, TimerWatchConfig, WatchConfig, Watcher};

/// Lines of node output logged after a successful discovery.
const RECENT_LOG_LINES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Host(#[from] host::Error),
    #[error(transparent)]
    Node(#[from] node::Error),
    #[error(transparent)]
    Fingerprint(#[from] fingerprint::Error),
    #[error(transparent)]
    Stream(#[from] stream::Error),
    #[error(transparent)]
    Sampler(#[from] crate::sampler::Error),
    #[error(transparent)]
    MachineID(#[from] container::Error),
    #[error("failed to read `{path}`: {source}")]
    HostFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Runs the agent until a shutdown signal arrives or a fatal error occurs.
///
/// # Errors
///
/// - [`Error::Config`] for invalid environment variables.
/// - [`Error::Host`] if the host root mount is missing.
/// - [`Error::Node`] for an unknown chain, broken patterns, or when no
///   discovery backend is enabled.
/// - [`Error::Fingerprint`] if the persisted digest cannot be read or written.
/// - [`Error::Stream`] if a configured sink cannot be set up.
pub async fn run() -> Result<()> {
    let config = AgentConfig::from_env()?;
    let host = HostRoot::detect(&config.rootfs_mount)?;
    let probes = build_probes(&config, &host);
    log::debug!("Enabled discovery backends: {:?}", probes.backends());

    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(watch_signals(token.clone()));

    let shutdown_timeout = config.shutdown_timeout;
    let outcome = match Agent::new(config, host, probes) {
        Ok(agent) => agent.run(&token, &tracker).await,
        Err(err) => Err(err),
    };

    token.cancel();
    tracker.close();
    if tokio::time::timeout(shutdown_timeout, tracker.wait())
        .await
        .is_err()
    {
        log::warn!(
            "{} tasks still running after {:?}, exiting anyway",
            tracker.len(),
            shutdown_timeout
        );
    } else {
        log::info!("Shutdown complete");
    }
    outcome
}

/// Probes for every enabled backend. Sockets and absolute binary paths are
/// resolved below the host root.
pub fn build_probes(config: &AgentConfig, host: &HostRoot) -> Probes {
    let mut probes = Probes::new(config.probe_timeout);
    if config.docker {
        probes = probes.with_docker(DockerProbe::new(host.resolve(&config.docker_socket)));
    }
    if config.containerd {
        probes = probes.with_containerd(
            ContainerdProbe::new(host.resolve(&config.containerd_socket))
                .with_timeout(config.probe_timeout),
        );
    }
    if config.systemd {
        let binary = |path: &PathBuf| {
            if path.is_absolute() {
                host.resolve(path)
            } else {
                path.clone()
            }
        };
        probes = probes.with_systemd(SystemdProbe::new(
            binary(&config.systemctl),
            binary(&config.journalctl),
        ));
    }
    probes
}

async fn watch_signals(token: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())
        .map_err(|err| log::warn!("Failed to install SIGTERM handler: {err}"))
        .ok();
    let sigterm = async {
        match terminate.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT, shutting down"),
        _ = sigterm => log::info!("Received SIGTERM, shutting down"),
    }
    token.cancel();
}

struct Agent {
    config: AgentConfig,
    host: HostRoot,
    probes: Probes,
    adapter: Adapter,
    cache: IdentityCache,
    fingerprints: FingerprintFile,
    identity: SharedIdentity,
}

impl Agent {
    fn new(config: AgentConfig, host: HostRoot, probes: Probes) -> Result<Self> {
        let adapter = Adapter::for_chain(&config.chain, host.clone())?
            .with_patterns(&config.container_patterns, &config.service_patterns)?;
        log::info!("Monitoring {} node", adapter.hello());
        Ok(Self {
            cache: IdentityCache::new(config.identity_cache_path(adapter.chain())),
            fingerprints: FingerprintFile::new(config.fingerprint_path(adapter.chain())),
            identity: Arc::new(RwLock::new(None)),
            config,
            host,
            probes,
            adapter,
        })
    }

    async fn run(mut self, token: &CancellationToken, tracker: &TaskTracker) -> Result<()> {
        if let Some(cached) = self
            .cache
            .load()
            .ok_log_with("Ignoring identity cache")
            .flatten()
        {
            if self.adapter.restore(cached) {
                log::info!("Restored node identity from `{}`", self.cache.path().display());
            } else {
                log::debug!("Cached node identity is stale, discovering from scratch");
            }
        }
        if !self.establish(token).await? {
            return Ok(());
        }

        let (ingress, samples) = mpsc::channel(self.config.channel_capacity);
        let mut registry = StreamRegistry::new(self.config.channel_capacity);
        registry.register(self.sinks().await?)?;
        registry.start(token, tracker, samples)?;

        let watch = WatchConfig {
            capacity: self.config.channel_capacity,
            overflow: self.config.overflow,
        };
        let sample_timer = TimerWatch::attached(
            "sample-timer",
            TimerWatchConfig {
                interval: self.config.sample_interval,
                watch,
            },
            token,
            tracker,
        );
        let collector = Collector::new(Arc::clone(&self.identity), ingress)
            .with_sampler(ProcessSampler::new(self.host.clone()))
            .with_sampler(NetDevSampler::new(self.host.clone()))
            .with_sampler(NetClassSampler::new(
                &self.host,
                &self.config.netclass_ignored_devices,
            )?)
            .with_sampler(LogEventSampler::new(self.adapter.log_events_list().clone()));
        log::debug!("Starting collector with {} samplers", collector.len());
        collector.start(sample_timer.subscribe(), token.clone(), tracker);
        sample_timer.start();

        let liveness = TimerWatch::attached(
            "liveness",
            TimerWatchConfig {
                interval: self.config.liveness_interval,
                ..Default::default()
            },
            token,
            tracker,
        );
        let mut ticks = liveness.subscribe();
        liveness.start();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                tick = ticks.recv() => if tick.is_none() { break },
            }
            if !self.ensure_alive(token).await? {
                break;
            }
        }
        Ok(())
    }

    /// Rediscovers the node if its process is gone. Samplers see no identity
    /// until the node is found again.
    ///
    /// Returns `false` if cancelled before the node came back.
    async fn ensure_alive(&mut self, token: &CancellationToken) -> Result<bool> {
        if self.node_alive() {
            return Ok(true);
        }
        log::warn!(
            "Node process {:?} is gone, rediscovering {} node",
            self.adapter.identity().pid(),
            self.adapter.hello()
        );
        *self.identity.write() = None;
        self.adapter.reset_config();
        self.cache.clear().ok_log_with("Failed to clear identity cache");
        self.establish(token).await
    }

    fn node_alive(&self) -> bool {
        self.adapter
            .identity()
            .pid()
            .is_some_and(|pid| procfs::process_exists(&self.host, pid))
    }

    /// Discovers the node, verifies its fingerprint and publishes the identity.
    /// Returns `false` if cancelled first.
    async fn establish(&mut self, token: &CancellationToken) -> Result<bool> {
        if !self.discover(token).await? {
            return Ok(false);
        }
        if let Some(drift) = self.verify_fingerprint()? {
            log::warn!(
                "Node identity drifted: expected fingerprint {}, got {}; rediscovering",
                drift.expected(),
                drift.actual()
            );
            self.adapter.reset_config();
            self.cache.clear().ok_log_with("Failed to clear identity cache");
            if !self.discover(token).await? {
                return Ok(false);
            }
            let fingerprint = Fingerprint::compute(&self.adapter.identity().canonical_bytes()?)?;
            self.fingerprints.store(&fingerprint)?;
            log::info!("Recorded new node fingerprint {fingerprint}");
        }

        self.cache
            .store(self.adapter.identity())
            .ok_log_with("Failed to cache node identity");
        *self.identity.write() = Some(self.adapter.identity().clone());
        self.log_recent_output().await;
        Ok(true)
    }

    /// Retries discovery until it succeeds. Returns `false` if cancelled first.
    async fn discover(&mut self, token: &CancellationToken) -> Result<bool> {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(false),
                attempt = self.adapter.discover(&self.probes) => attempt,
            };
            match attempt {
                Ok(()) => return Ok(true),
                Err(node::Error::Discovery(discovery::Error::NoBackend)) => {
                    return Err(node::Error::Discovery(discovery::Error::NoBackend).into());
                }
                Err(node::Error::Discovery(discovery::Error::Unreachable { failures })) => {
                    for failure in failures {
                        log::warn!("Discovery backend unreachable: {failure}");
                    }
                }
                Err(err @ (node::Error::Discovery(_)
                | node::Error::Incomplete { .. }
                | node::Error::Host(_))) => log::info!("{err}"),
                Err(err) => return Err(err.into()),
            }

            log::debug!("Retrying discovery in {:?}", self.config.discovery_retry);
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.config.discovery_retry) => {}
            }
        }
    }

    /// Compares the current identity against the persisted digest, storing
    /// the digest when it matches or none was recorded yet.
    fn verify_fingerprint(&self) -> Result<Option<ValidationError>> {
        let snapshot = self.adapter.identity().canonical_bytes()?;
        match Fingerprint::new_with_validation(&snapshot, self.fingerprints.reader()?) {
            Ok(fingerprint) => {
                self.fingerprints.store(&fingerprint)?;
                log::debug!("Node fingerprint {fingerprint} verified");
                Ok(None)
            }
            Err(fingerprint::Error::Validation(drift)) => Ok(Some(drift)),
            Err(err) => Err(err.into()),
        }
    }

    async fn log_recent_output(&self) {
        let identity = self.adapter.identity();
        let (Some(backend), Some(id)) = (identity.origin, identity.backend_id()) else {
            return;
        };
        match self.probes.recent_logs(backend, id, RECENT_LOG_LINES).await {
            Ok(lines) => {
                for line in lines {
                    log::info!("[{backend}] {line}");
                }
            }
            Err(err) => log::debug!("No recent output from {backend}: {err}"),
        }
    }

    async fn sinks(&self) -> Result<Vec<Box<dyn Sink>>> {
        let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(LogSink::new("log", log::Level::Debug))];
        if let Some(url) = &self.config.database_url {
            let machine_id = read_machine_id(&self.host)?;
            let hostname = read_hostname(&self.host)?;
            log::debug!("Hostname: {hostname}");
            sinks.push(Box::new(MySqlSink::connect(url, machine_id, hostname).await?));
        }
        Ok(sinks)
    }
}

fn read_host_file(host: &HostRoot, path: &str) -> Result<String> {
    let path = host.resolve(path);
    std::fs::read_to_string(&path)
        .map(|contents| contents.trim().to_owned())
        .map_err(|source| Error::HostFile { path, source })
}

fn read_machine_id(host: &HostRoot) -> Result<MachineID> {
    Ok(MachineID::from_str(&read_host_file(host, "/etc/machine-id")?)?)
}

fn read_hostname(host: &HostRoot) -> Result<String> {
    read_host_file(host, "/etc/hostname").or_else(|_| read_host_file(host, "/proc/sys/kernel/hostname"))
}
