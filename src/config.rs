//! Agent settings read from environment variables.
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::discovery::{DEFAULT_PROBE_TIMEOUT, docker, systemd};
use crate::sampler::netclass::DEFAULT_IGNORED_DEVICES;
use crate::watch::{DEFAULT_CAPACITY, OverflowPolicy};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value `{value}` for `{var}`: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub chain: String,
    pub rootfs_mount: PathBuf,
    pub state_dir: PathBuf,
    pub docker: bool,
    pub containerd: bool,
    pub systemd: bool,
    pub docker_socket: PathBuf,
    pub containerd_socket: PathBuf,
    pub systemctl: PathBuf,
    pub journalctl: PathBuf,
    /// Overrides the adapter's container patterns when non-empty.
    pub container_patterns: Vec<String>,
    /// Overrides the adapter's service patterns when non-empty.
    pub service_patterns: Vec<String>,
    pub probe_timeout: Duration,
    pub discovery_retry: Duration,
    pub sample_interval: Duration,
    pub liveness_interval: Duration,
    pub channel_capacity: usize,
    pub overflow: OverflowPolicy,
    pub shutdown_timeout: Duration,
    pub netclass_ignored_devices: String,
    pub database_url: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            chain: "algorand".to_owned(),
            rootfs_mount: PathBuf::from("/rootfs"),
            state_dir: PathBuf::from("/var/lib/chain-telemetry"),
            docker: true,
            containerd: true,
            systemd: true,
            docker_socket: PathBuf::from(docker::DEFAULT_SOCKET),
            containerd_socket: PathBuf::from(crate::discovery::containerd::DEFAULT_SOCKET),
            systemctl: PathBuf::from(systemd::DEFAULT_SYSTEMCTL),
            journalctl: PathBuf::from(systemd::DEFAULT_JOURNALCTL),
            container_patterns: Vec::new(),
            service_patterns: Vec::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            discovery_retry: Duration::from_secs(10),
            sample_interval: Duration::from_secs(1),
            liveness_interval: Duration::from_secs(15),
            channel_capacity: DEFAULT_CAPACITY,
            overflow: OverflowPolicy::Block,
            shutdown_timeout: Duration::from_secs(10),
            netclass_ignored_devices: DEFAULT_IGNORED_DEVICES.to_owned(),
            database_url: None,
        }
    }
}

impl AgentConfig {
    /// Reads the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] for the first variable that does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the configuration from `lookup`. Unset or empty variables keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(lookup);
        let defaults = Self::default();
        let channel_capacity = env.parse("CHANNEL_CAPACITY", defaults.channel_capacity)?;
        if channel_capacity == 0 {
            return Err(Error::Invalid {
                var: "CHANNEL_CAPACITY",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            chain: env.string("NODE_CHAIN").unwrap_or(defaults.chain),
            rootfs_mount: env.path("ROOTFS_MOUNT_PATH").unwrap_or(defaults.rootfs_mount),
            state_dir: env.path("STATE_DIR").unwrap_or(defaults.state_dir),
            docker: env.flag("DISCOVERY_DOCKER", defaults.docker)?,
            containerd: env.flag("DISCOVERY_CONTAINERD", defaults.containerd)?,
            systemd: env.flag("DISCOVERY_SYSTEMD", defaults.systemd)?,
            docker_socket: env.path("DOCKER_SOCKET").unwrap_or(defaults.docker_socket),
            containerd_socket: env
                .path("CONTAINERD_SOCKET")
                .unwrap_or(defaults.containerd_socket),
            systemctl: env.path("SYSTEMCTL_PATH").unwrap_or(defaults.systemctl),
            journalctl: env.path("JOURNALCTL_PATH").unwrap_or(defaults.journalctl),
            container_patterns: env.list("CONTAINER_REGEX"),
            service_patterns: env.list("SERVICE_REGEX"),
            probe_timeout: env.millis("PROBE_TIMEOUT_MS", defaults.probe_timeout)?,
            discovery_retry: env.millis("DISCOVERY_RETRY_MS", defaults.discovery_retry)?,
            sample_interval: env.millis("SAMPLE_INTERVAL_MS", defaults.sample_interval)?,
            liveness_interval: env.millis("LIVENESS_INTERVAL_MS", defaults.liveness_interval)?,
            channel_capacity,
            overflow: env.parse("OVERFLOW_POLICY", defaults.overflow)?,
            shutdown_timeout: env.millis("SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout)?,
            netclass_ignored_devices: env
                .string("NETCLASS_IGNORED_DEVICES")
                .unwrap_or(defaults.netclass_ignored_devices),
            database_url: env.string("DATABASE_URL"),
        })
    }

    /// `<state_dir>/<chain>.fingerprint`
    ///
    /// `chain` is the adapter's canonical key, not the raw `NODE_CHAIN` value,
    /// so aliases of one chain share their state files.
    pub fn fingerprint_path(&self, chain: &str) -> PathBuf {
        self.state_dir.join(format!("{chain}.fingerprint"))
    }

    /// `<state_dir>/<chain>.identity.json`, keyed like [`Self::fingerprint_path`].
    pub fn identity_cache_path(&self, chain: &str) -> PathBuf {
        self.state_dir.join(format!("{chain}.identity.json"))
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn path(&self, var: &str) -> Option<PathBuf> {
        self.string(var).map(PathBuf::from)
    }

    fn list(&self, var: &str) -> Vec<String> {
        self.string(var)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|err: T::Err| Error::Invalid {
                var,
                reason: err.to_string(),
                value,
            }),
        }
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(var, default).map(Duration::from_millis)
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool> {
        let Some(value) = self.string(var) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::Invalid {
                var,
                value,
                reason: "expected a boolean".to_owned(),
            }),
        }
    }
}
