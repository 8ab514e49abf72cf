//! Per chain discovery adapters and the identity they produce.
//!
//! Every supported chain implements [`NodeAdapter`]; [`Adapter`] dispatches
//! over the implementations and is selected by chain name at startup.
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::discovery::{Probes, Target};
use crate::host::HostRoot;
use crate::host::procfs::{self, ProcessInfo};

mod algorand;
mod error;
mod geth;
mod identity;

pub use algorand::Algorand;
pub use error::{Error, Result};
pub use geth::Geth;
pub use identity::{Field, IdentityCache, NodeIdentity};

/// Names accepted by [`Adapter::for_chain`].
pub const CHAINS: &[&str] = &["algorand", "geth"];

/// Named patterns extracting events from node log lines. A `value` capture
/// group, if present, carries the event's value.
pub type LogEvents = BTreeMap<&'static str, Regex>;

/// Discovery contract of one chain.
pub trait NodeAdapter: Send {
    /// Human readable chain name.
    fn hello(&self) -> &'static str;

    /// Patterns matched against container names and images.
    fn container_regex(&self) -> &[Regex];

    /// Patterns matched against service unit names.
    fn service_regex(&self) -> &[Regex];

    fn log_events_list(&self) -> &LogEvents;

    /// Fields required on top of those implied by the origin.
    fn required_fields(&self) -> &'static [Field];

    fn identity(&self) -> &NodeIdentity;

    /// True iff every required identity field is set.
    fn is_configured(&self) -> bool {
        self.identity().missing(self.required_fields()).is_empty()
    }

    /// Forgets the discovered identity.
    fn reset_config(&mut self);

    /// Adopts a previously discovered identity if its process is still alive.
    /// Returns whether the identity was adopted.
    fn restore(&mut self, identity: NodeIdentity) -> bool;

    /// Probes for the node unless already configured.
    ///
    /// # Errors
    ///
    /// - [`Error::Discovery`] if nothing matched or no backend answered.
    /// - [`Error::Incomplete`] if the matched process lacks required facts.
    fn discover(&mut self, probes: &Probes) -> impl Future<Output = Result<()>> + Send;

    /// Primary node log on the host.
    fn node_log_path(&self) -> Result<&Path> {
        if !self.is_configured() {
            return Err(Error::NotConfigured(self.hello()));
        }
        self.identity()
            .primary_log()
            .ok_or(Error::NotConfigured(self.hello()))
    }
}

/// The adapter of the configured chain.
#[derive(Debug, Clone)]
pub enum Adapter {
    Algorand(Algorand),
    Geth(Geth),
}

impl Adapter {
    /// # Errors
    ///
    /// Returns [`Error::UnknownChain`] for chains without an adapter.
    pub fn for_chain(name: &str, host: HostRoot) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "algorand" | "algod" => Ok(Self::Algorand(Algorand::new(host)?)),
            "geth" | "ethereum" => Ok(Self::Geth(Geth::new(host)?)),
            _ => Err(Error::UnknownChain {
                name: name.to_owned(),
                supported: CHAINS,
            }),
        }
    }

    /// Registry key of the adapter, used for state file names.
    pub fn chain(&self) -> &'static str {
        match self {
            Self::Algorand(_) => "algorand",
            Self::Geth(_) => "geth",
        }
    }

    /// Replaces the built in patterns. Empty lists keep the defaults.
    pub fn with_patterns(mut self, containers: &[String], services: &[String]) -> Result<Self> {
        let state = match &mut self {
            Self::Algorand(adapter) => &mut adapter.state,
            Self::Geth(adapter) => &mut adapter.state,
        };
        if !containers.is_empty() {
            state.container_regex = compile_patterns(containers)?;
        }
        if !services.is_empty() {
            state.service_regex = compile_patterns(services)?;
        }
        Ok(self)
    }
}

impl NodeAdapter for Adapter {
    fn hello(&self) -> &'static str {
        match self {
            Self::Algorand(adapter) => adapter.hello(),
            Self::Geth(adapter) => adapter.hello(),
        }
    }

    fn container_regex(&self) -> &[Regex] {
        match self {
            Self::Algorand(adapter) => adapter.container_regex(),
            Self::Geth(adapter) => adapter.container_regex(),
        }
    }

    fn service_regex(&self) -> &[Regex] {
        match self {
            Self::Algorand(adapter) => adapter.service_regex(),
            Self::Geth(adapter) => adapter.service_regex(),
        }
    }

    fn log_events_list(&self) -> &LogEvents {
        match self {
            Self::Algorand(adapter) => adapter.log_events_list(),
            Self::Geth(adapter) => adapter.log_events_list(),
        }
    }

    fn required_fields(&self) -> &'static [Field] {
        match self {
            Self::Algorand(adapter) => adapter.required_fields(),
            Self::Geth(adapter) => adapter.required_fields(),
        }
    }

    fn identity(&self) -> &NodeIdentity {
        match self {
            Self::Algorand(adapter) => adapter.identity(),
            Self::Geth(adapter) => adapter.identity(),
        }
    }

    fn reset_config(&mut self) {
        match self {
            Self::Algorand(adapter) => adapter.reset_config(),
            Self::Geth(adapter) => adapter.reset_config(),
        }
    }

    fn restore(&mut self, identity: NodeIdentity) -> bool {
        match self {
            Self::Algorand(adapter) => adapter.restore(identity),
            Self::Geth(adapter) => adapter.restore(identity),
        }
    }

    async fn discover(&mut self, probes: &Probes) -> Result<()> {
        match self {
            Self::Algorand(adapter) => adapter.discover(probes).await,
            Self::Geth(adapter) => adapter.discover(probes).await,
        }
    }
}

pub(crate) fn compile_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            let pattern = pattern.as_ref();
            Regex::new(pattern).map_err(|source| Error::Pattern {
                pattern: pattern.to_owned(),
                source,
            })
        })
        .collect()
}

/// State shared by every adapter implementation.
#[derive(Debug, Clone)]
pub(crate) struct NodeState {
    host: HostRoot,
    identity: NodeIdentity,
    container_regex: Vec<Regex>,
    service_regex: Vec<Regex>,
}

impl NodeState {
    fn new(host: HostRoot, containers: &[&str], services: &[&str]) -> Result<Self> {
        Ok(Self {
            host,
            identity: NodeIdentity::default(),
            container_regex: compile_patterns(containers)?,
            service_regex: compile_patterns(services)?,
        })
    }

    fn reset(&mut self, chain: &str) {
        if !self.identity.is_empty() {
            log::info!("Resetting discovered {chain} node configuration");
        }
        self.identity = NodeIdentity::default();
    }

    fn restore(&mut self, chain: &str, identity: NodeIdentity, required: &[Field]) -> bool {
        let missing = identity.missing(required);
        if !missing.is_empty() {
            log::debug!("Ignoring cached {chain} identity missing {missing:?}");
            return false;
        }
        let Some(pid) = identity
            .pid()
            .filter(|pid| procfs::process_exists(&self.host, *pid))
        else {
            log::info!("Cached {chain} node process {:?} is gone, rediscovering", identity.pid());
            self.reset(chain);
            return false;
        };
        match ProcessInfo::read(&self.host, pid) {
            Ok(process) if identity.matches_process(&process) => {
                log::debug!("Restored cached {chain} identity of pid {pid}");
                self.identity = identity;
                true
            }
            Ok(process) => {
                log::info!(
                    "Pid {pid} now runs {:?}, not the cached {chain} node, rediscovering",
                    process.executable()
                );
                self.reset(chain);
                false
            }
            Err(err) => {
                log::info!("Cannot verify cached {chain} node process: {err}");
                self.reset(chain);
                false
            }
        }
    }

    /// Finds the node and builds its identity with `identify`.
    async fn discover(
        &mut self,
        probes: &Probes,
        chain: &'static str,
        required: &[Field],
        identify: impl FnOnce(&HostRoot, &Target, &ProcessInfo) -> NodeIdentity + Send,
    ) -> Result<()> {
        if self.identity.missing(required).is_empty() {
            log::debug!("{chain} node already configured, skipping discovery");
            return Ok(());
        }

        let target = probes
            .find(&self.container_regex, &self.service_regex)
            .await?;
        let process = ProcessInfo::read(&self.host, target.pid)?;
        let identity = identify(&self.host, &target, &process);
        let missing = identity.missing(required);
        if !missing.is_empty() {
            return Err(Error::Incomplete { chain, missing });
        }

        log::info!(
            "Discovered {chain} node `{}` with pid {} via {}",
            target.name,
            target.pid,
            target.backend
        );
        self.identity = identity;
        Ok(())
    }
}

/// Identity fields every backend provides, plus the facts that pin down
/// `process` itself.
fn base_identity(target: &Target, process: &ProcessInfo) -> NodeIdentity {
    NodeIdentity {
        origin: Some(target.backend),
        pid: Some(target.pid),
        container_id: target.container_id.clone(),
        container_name: target
            .backend
            .is_container()
            .then(|| target.name.clone()),
        service_unit: target.service_unit.clone(),
        executable: process.executable().map(str::to_owned),
        start_ticks: process.start_ticks,
        log_paths: Vec::new(),
        extra: BTreeMap::new(),
    }
}

/// Maps a path as seen by the node process to the host.
fn host_path(host: &HostRoot, target: &Target, path: &Path) -> PathBuf {
    if target.backend.is_container() {
        host.process_view(target.pid, path)
    } else {
        host.resolve(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_maps_chain_names() {
        let host = HostRoot::default();
        assert_eq!(Adapter::for_chain("algorand", host.clone()).unwrap().chain(), "algorand");
        assert_eq!(Adapter::for_chain(" Geth ", host.clone()).unwrap().chain(), "geth");
        assert_eq!(Adapter::for_chain("geth", host.clone()).unwrap().hello(), "Geth");
        match Adapter::for_chain("solana", host) {
            Err(Error::UnknownChain { name, supported }) => {
                assert_eq!(name, "solana");
                assert_eq!(supported, CHAINS);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_pattern_override() {
        let adapter = Adapter::for_chain("algorand", HostRoot::default())
            .unwrap()
            .with_patterns(&["my-node.*".to_owned()], &[])
            .unwrap();
        let patterns: Vec<_> = adapter.container_regex().iter().map(Regex::as_str).collect();
        assert_eq!(patterns, ["my-node.*"]);
        assert!(!adapter.service_regex().is_empty());

        let err = Adapter::for_chain("geth", HostRoot::default())
            .unwrap()
            .with_patterns(&["(".to_owned()], &[])
            .unwrap_err();
        assert!(matches!(err, Error::Pattern { .. }));
    }

    #[test]
    fn test_unconfigured_adapter_has_no_log_path() {
        let adapter = Adapter::for_chain("geth", HostRoot::default()).unwrap();
        assert!(!adapter.is_configured());
        assert!(matches!(adapter.node_log_path(), Err(Error::NotConfigured("Geth"))));
    }
}
