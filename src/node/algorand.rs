use std::path::{Path, PathBuf};

use regex::Regex;

use super::{
    Field, LogEvents, NodeAdapter, NodeIdentity, NodeState, Result, base_identity, host_path,
};
use crate::discovery::{Backend, Probes, Target};
use crate::host::HostRoot;
use crate::host::procfs::ProcessInfo;

const CHAIN: &str = "algorand";
const CONTAINER_PATTERNS: &[&str] = &["algod", "algorand"];
const SERVICE_PATTERNS: &[&str] = &[r"^algorand(@.*)?\.service$", r"^algod\.service$"];
const REQUIRED: &[Field] = &[Field::Pid, Field::LogPath, Field::Extra(DATA_DIR)];

/// Key of the data directory in [`NodeIdentity::extra`].
pub const DATA_DIR: &str = "data_dir";

const DATA_DIR_ENV: &str = "ALGORAND_DATA";
/// Data directory of the official container images.
const CONTAINER_DATA_DIR: &str = "/algod/data";
/// Data directory of the deb and rpm packages.
const SERVICE_DATA_DIR: &str = "/var/lib/algorand";

/// Discovers `algod`.
///
/// The data directory comes from `-d`, else `ALGORAND_DATA`, else the packaging
/// default; the node writes `node.log` into it.
#[derive(Debug, Clone)]
pub struct Algorand {
    pub(super) state: NodeState,
    log_events: LogEvents,
}

impl Algorand {
    pub fn new(host: HostRoot) -> Result<Self> {
        Ok(Self {
            state: NodeState::new(host, CONTAINER_PATTERNS, SERVICE_PATTERNS)?,
            log_events: LogEvents::new(),
        })
    }

    /// Data directory as seen by the node process.
    pub fn data_dir(&self) -> Option<&Path> {
        self.state.identity.extra.get(DATA_DIR).map(Path::new)
    }
}

fn identify(host: &HostRoot, target: &Target, process: &ProcessInfo) -> NodeIdentity {
    let data_dir = process
        .flag(&["-d"])
        .or_else(|| process.env(DATA_DIR_ENV))
        .map(PathBuf::from)
        .unwrap_or_else(|| match target.backend {
            Backend::Docker | Backend::Containerd => PathBuf::from(CONTAINER_DATA_DIR),
            Backend::Systemd => PathBuf::from(SERVICE_DATA_DIR),
        });

    let mut identity = base_identity(target, process);
    identity
        .log_paths
        .push(host_path(host, target, &data_dir.join("node.log")));
    if let Some(runtime_log) = &target.runtime_log {
        identity.log_paths.push(host.resolve(runtime_log));
    }
    identity
        .extra
        .insert(DATA_DIR.to_owned(), data_dir.to_string_lossy().into_owned());
    identity
}

impl NodeAdapter for Algorand {
    fn hello(&self) -> &'static str {
        "Algorand"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerID;
    use crate::discovery::{DockerProbe, docker};
    use crate::fingerprint::Fingerprint;
    use crate::host::procfs::testing::{fake_process, fake_start};

    fn target(backend: Backend, pid: u32) -> Target {
        Target {
            backend,
            name: "algod".to_owned(),
            pid,
            container_id: backend
                .is_container()
                .then(|| ContainerID::new("c0ffee").unwrap()),
            service_unit: (!backend.is_container()).then(|| "algorand.service".to_owned()),
            image: None,
            runtime_log: None,
        }
    }

    fn process(argv: &[&str], env: &[(&str, &str)]) -> ProcessInfo {
        ProcessInfo {
            pid: 10,
            cmdline: argv.iter().map(|s| s.to_string()).collect(),
            environ: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            start_ticks: None,
        }
    }

    #[test]
    fn test_data_dir_precedence() {
        let host = HostRoot::new("/rootfs");
        let flagged = identify(
            &host,
            &target(Backend::Systemd, 10),
            &process(&["algod", "-d", "/srv/algo"], &[(DATA_DIR_ENV, "/env/algo")]),
        );
        assert_eq!(flagged.extra[DATA_DIR], "/srv/algo");
        assert_eq!(flagged.log_paths, [PathBuf::from("/rootfs/srv/algo/node.log")]);

        let from_env = identify(
            &host,
            &target(Backend::Systemd, 10),
            &process(&["algod"], &[(DATA_DIR_ENV, "/env/algo")]),
        );
        assert_eq!(from_env.extra[DATA_DIR], "/env/algo");

        let service = identify(&host, &target(Backend::Systemd, 10), &process(&["algod"], &[]));
        assert_eq!(service.extra[DATA_DIR], SERVICE_DATA_DIR);
        assert_eq!(service.service_unit.as_deref(), Some("algorand.service"));
    }

    #[test]
    fn test_container_paths_resolve_through_process_root() {
        let host = HostRoot::new("/rootfs");
        let mut target = target(Backend::Docker, 77);
        target.runtime_log = Some(PathBuf::from("/var/lib/docker/containers/c0ffee/c0ffee-json.log"));
        let identity = identify(&host, &target, &process(&["algod"], &[]));
        assert_eq!(
            identity.log_paths,
            [
                PathBuf::from("/rootfs/proc/77/root/algod/data/node.log"),
                PathBuf::from("/rootfs/var/lib/docker/containers/c0ffee/c0ffee-json.log"),
            ]
        );
        assert!(identity.missing(REQUIRED).is_empty());
    }

    #[test]
    fn test_reset_config_clears_identity() {
        let dir = tempfile::tempdir().unwrap();
        fake_process(dir.path(), 77, &["algod"], &[]);
        let host = HostRoot::new(dir.path());
        let mut adapter = Algorand::new(host.clone()).unwrap();
        let identity = identify(&host, &target(Backend::Docker, 77), &process(&["algod"], &[]));

        assert!(adapter.restore(identity));
        assert!(adapter.is_configured());
        adapter.reset_config();
        assert!(!adapter.is_configured());
        assert!(adapter.identity().is_empty());
    }

    #[test]
    fn test_restore_rejects_dead_process() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostRoot::new(dir.path());
        let mut adapter = Algorand::new(host.clone()).unwrap();
        let identity = identify(&host, &target(Backend::Docker, 78), &process(&["algod"], &[]));
        assert!(!adapter.restore(identity));
        assert!(!adapter.is_configured());
    }

    #[test]
    fn test_restore_rejects_reused_pid() {
        let dir = tempfile::tempdir().unwrap();
        fake_process(dir.path(), 77, &["/usr/sbin/sshd", "-D"], &[]);
        let host = HostRoot::new(dir.path());
        let mut adapter = Algorand::new(host.clone()).unwrap();
        let identity = identify(&host, &target(Backend::Docker, 77), &process(&["algod"], &[]));
        assert!(!adapter.restore(identity));
        assert!(!adapter.is_configured());
    }

    #[test]
    fn test_restore_rejects_restarted_process() {
        let dir = tempfile::tempdir().unwrap();
        fake_process(dir.path(), 77, &["algod"], &[]);
        fake_start(dir.path(), 77, 9000);
        let host = HostRoot::new(dir.path());
        let mut adapter = Algorand::new(host.clone()).unwrap();
        let mut identity = identify(&host, &target(Backend::Docker, 77), &process(&["algod"], &[]));
        identity.start_ticks = Some(5521);
        assert!(!adapter.restore(identity.clone()));

        identity.start_ticks = Some(9000);
        assert!(adapter.restore(identity));
    }

    #[tokio::test]
    async fn test_discovers_matching_container() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        fake_process(&rootfs, 4242, &["/node/bin/algod", "-d", "/algod/data"], &[]);
        fake_process(&rootfs, 4343, &["/node/bin/algod", "-d", "/algod/data"], &[]);
        let socket = docker::testing::serve(dir.path(), docker::testing::my_node_routes(4242));
        let probes = Probes::default().with_docker(DockerProbe::new(socket));

        let mut adapter = crate::node::Adapter::Algorand(Algorand::new(HostRoot::new(&rootfs)).unwrap())
            .with_patterns(&["my-node.*".to_owned()], &[])
            .unwrap();
        adapter.discover(&probes).await.unwrap();
        assert!(adapter.is_configured());

        let log_path = adapter.node_log_path().unwrap();
        assert!(!log_path.as_os_str().is_empty());
        assert_eq!(log_path, rootfs.join("proc/4242/root/algod/data/node.log"));
        assert_eq!(adapter.identity().container_name.as_deref(), Some("my-node-1"));
        assert_eq!(adapter.identity().executable.as_deref(), Some("algod"));

        let fingerprint = Fingerprint::compute(&adapter.identity().canonical_bytes().unwrap()).unwrap();
        let mut moved = adapter.identity().clone();
        moved.pid = Some(4343);
        let other = Fingerprint::compute(&moved.canonical_bytes().unwrap()).unwrap();
        assert_ne!(fingerprint, other);

        // already configured, no probing needed
        adapter.discover(&Probes::default()).await.unwrap();
    }
}
