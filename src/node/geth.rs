use std::path::{Path, PathBuf};

use regex::Regex;

use super::{
    Error, Field, LogEvents, NodeAdapter, NodeIdentity, NodeState, Result, base_identity,
    host_path,
};
use crate::discovery::{Probes, Target};
use crate::host::HostRoot;
use crate::host::procfs::ProcessInfo;

const CHAIN: &str = "geth";
const CONTAINER_PATTERNS: &[&str] = &["geth", "go-ethereum"];
const SERVICE_PATTERNS: &[&str] = &[r"^geth.*\.service$"];
const REQUIRED: &[Field] = &[Field::Pid, Field::LogPath];

/// Key of the data directory in [`NodeIdentity::extra`], if given.
pub const DATADIR: &str = "datadir";

const LOG_EVENTS: &[(&str, &str)] = &[
    (
        "chain_segment_imported",
        r"Imported new (?:potential )?chain segment.*\bnumber=(?P<value>[\d,]+)",
    ),
    (
        "chain_head_updated",
        r"Chain head was updated.*\bnumber=(?P<value>[\d,]+)",
    ),
    ("peer_count", r"Looking for peers.*\bpeercount=(?P<value>\d+)"),
    (
        "sync_progress",
        r"Syncing: chain download in progress.*\bsynced=(?P<value>[\d.]+)%",
    ),
];

/// Discovers `geth`.
///
/// The node log is the `--log.file` target, falling back to docker's json log
/// for containers. A service unit logging only to the journal cannot be
/// configured.
#[derive(Debug, Clone)]
pub struct Geth {
    pub(super) state: NodeState,
    log_events: LogEvents,
}

impl Geth {
    /// # Errors
    ///
    /// Returns [`Error::Pattern`] if a built-in pattern fails to compile.
    pub fn new(host: HostRoot) -> Result<Self> {
        let log_events = LOG_EVENTS
            .iter()
            .map(|(name, pattern)| {
                Regex::new(pattern)
                    .map(|regex| (*name, regex))
                    .map_err(|source| Error::Pattern {
                        pattern: (*pattern).to_owned(),
                        source,
                    })
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            state: NodeState::new(host, CONTAINER_PATTERNS, SERVICE_PATTERNS)?,
            log_events,
        })
    }

    /// `--datadir` of the discovered process, if it was given.
    pub fn datadir(&self) -> Option<&Path> {
        self.state.identity.extra.get(DATADIR).map(Path::new)
    }
}

fn identify(host: &HostRoot, target: &Target, process: &ProcessInfo) -> NodeIdentity {
    let mut identity = base_identity(target, process);
    if let Some(log_file) = process.flag(&["--log.file", "--log-file"]) {
        identity
            .log_paths
            .push(host_path(host, target, &PathBuf::from(log_file)));
    }
    if let Some(runtime_log) = &target.runtime_log {
        identity.log_paths.push(host.resolve(runtime_log));
    }
    if let Some(datadir) = process.flag(&["--datadir"]) {
        identity.extra.insert(DATADIR.to_owned(), datadir.to_owned());
    }
    identity
}

impl NodeAdapter for Geth {
    fn hello(&self) -> &'static str {
        "Geth"
    }

    fn container_regex(&self) -> &[Regex] {
        &self.state.container_regex
    }

    fn service_regex(&self) -> &[Regex] {
        &self.state.service_regex
    }

    fn log_events_list(&self) -> &LogEvents {
        &self.log_events
    }

    fn required_fields(&self) -> &'static [Field] {
        REQUIRED
    }

    fn identity(&self) -> &NodeIdentity {
        &self.state.identity
    }

    fn reset_config(&mut self) {
        self.state.reset(CHAIN);
    }

    fn restore(&mut self, identity: NodeIdentity) -> bool {
        self.state.restore(CHAIN, identity, REQUIRED)
    }

    async fn discover(&mut self, probes: &Probes) -> Result<()> {
        self.state.discover(probes, CHAIN, REQUIRED, identify).await
    }
}
