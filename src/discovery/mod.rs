//! Locating the node process through the container runtimes and the service
//! manager of the host.
//!
//! Backends are always queried in the order docker, containerd, systemd and
//! the first backend with a match wins, so a containerized node takes priority
//! over a service unit of the same chain. Within a backend, patterns are tried
//! in the given order against candidates sorted by name; for each pattern the
//! container or unit name is matched before the image reference. A candidate
//! that cannot be resolved, e.g. a stopped container, falls through to the
//! next one in that order.
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::container::ContainerID;

pub mod containerd;
pub mod docker;
mod error;
pub mod systemd;

pub use containerd::ContainerdProbe;
pub use docker::DockerProbe;
pub use error::{BackendFailure, Error, ProbeError, Result};

/// Default bound for a single backend call.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The process manager a node was found through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Docker,
    Containerd,
    Systemd,
}

impl Backend {
    pub fn is_container(&self) -> bool {
        !matches!(self, Self::Systemd)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Docker => "docker",
            Self::Containerd => "containerd",
            Self::Systemd => "systemd",
        })
    }
}

/// A running container or service unit as listed by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub backend: Backend,
    /// Container id, or the unit name for systemd.
    pub id: String,
    /// Display name matched against the patterns.
    pub name: String,
    pub image: Option<String>,
    /// containerd namespace the container lives in.
    pub namespace: Option<String>,
}

/// A matched candidate with its process facts resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub backend: Backend,
    pub name: String,
    pub pid: u32,
    pub container_id: Option<ContainerID>,
    pub service_unit: Option<String>,
    pub image: Option<String>,
    /// Log file kept by the runtime itself, e.g. docker's json log.
    pub runtime_log: Option<PathBuf>,
}

/// Candidates matching any of `patterns`, best match first, following the
/// precedence described in the module docs. Each candidate appears once.
pub fn rank<'a>(candidates: &'a [Candidate], patterns: &[Regex]) -> Vec<&'a Candidate> {
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    let mut ranked: Vec<&Candidate> = Vec::new();
    for pattern in patterns {
        let by_name = sorted.iter().filter(|candidate| pattern.is_match(&candidate.name));
        let by_image = sorted.iter().filter(|candidate| {
            candidate
                .image
                .as_deref()
                .is_some_and(|image| pattern.is_match(image))
        });
        for candidate in by_name.chain(by_image) {
            if !ranked.iter().any(|seen| std::ptr::eq(*seen, *candidate)) {
                ranked.push(*candidate);
            }
        }
    }
    ranked
}

/// The enabled discovery backends.
#[derive(Debug, Clone)]
pub struct Probes {
    docker: Option<DockerProbe>,
    containerd: Option<ContainerdProbe>,
    systemd: Option<systemd::SystemdProbe>,
    timeout: Duration,
}

impl Default for Probes {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl Probes {
    /// No backend enabled; add them with the `with_*` builders.
    pub fn new(timeout: Duration) -> Self {
        Self {
            docker: None,
            containerd: None,
            systemd: None,
            timeout,
        }
    }

    /// Enables docker, queried first.
    pub fn with_docker(mut self, probe: DockerProbe) -> Self {
        self.docker = Some(probe);
        self
    }

    pub fn with_containerd(mut self, probe: ContainerdProbe) -> Self {
        self.containerd = Some(probe);
        self
    }

    pub fn with_systemd(mut self, probe: systemd::SystemdProbe) -> Self {
        self.systemd = Some(probe);
        self
    }

    /// Bound applied to every single backend call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Enabled backends in query order.
    pub fn backends(&self) -> Vec<Backend> {
        let mut backends = Vec::with_capacity(3);
        if self.docker.is_some() {
            backends.push(Backend::Docker);
        }
        if self.containerd.is_some() {
            backends.push(Backend::Containerd);
        }
        if self.systemd.is_some() {
            backends.push(Backend::Systemd);
        }
        backends
    }

    /// Finds the running node. Containers are matched against
    /// `container_patterns`, service units against `service_patterns`.
    ///
    /// # Errors
    ///
    /// - [`Error::NoBackend`] if no backend is enabled.
    /// - [`Error::Unreachable`] if no enabled backend answered.
    /// - [`Error::NotFound`] if at least one backend answered and nothing
    ///   matched. Backends failing alongside are logged.
    pub async fn find(
        &self,
        container_patterns: &[Regex],
        service_patterns: &[Regex],
    ) -> Result<Target> {
        let backends = self.backends();
        if backends.is_empty() {
            return Err(Error::NoBackend);
        }

        let mut searched = Vec::with_capacity(backends.len());
        let mut failures = Vec::new();
        for backend in backends {
            let patterns = match backend {
                Backend::Systemd => service_patterns,
                Backend::Docker | Backend::Containerd => container_patterns,
            };
            if patterns.is_empty() {
                log::debug!("Skipping {backend}, no patterns to match");
                continue;
            }

            let candidates = match self.bounded(self.list(backend)).await {
                Ok(candidates) => candidates,
                Err(error) => {
                    let failure = BackendFailure { backend, error };
                    log::warn!("Discovery backend unavailable, {failure}");
                    failures.push(failure);
                    continue;
                }
            };
            searched.push(backend);
            log::debug!("{backend} reported {} candidates", candidates.len());

            for candidate in rank(&candidates, patterns) {
                log::debug!("{backend} candidate `{}` matched", candidate.name);
                match self.bounded(self.resolve(candidate)).await {
                    Ok(target) => return Ok(target),
                    Err(error) => {
                        let failure = BackendFailure { backend, error };
                        log::info!("Skipping `{}`, {failure}", candidate.name);
                        failures.push(failure);
                    }
                }
            }
        }

        if searched.is_empty() && !failures.is_empty() {
            return Err(Error::Unreachable { failures });
        }
        Err(Error::NotFound {
            searched,
            patterns: container_patterns
                .iter()
                .chain(service_patterns)
                .map(|pattern| pattern.as_str().to_owned())
                .collect(),
        })
    }

    /// Last `lines` log lines of the target as recorded by its backend.
    pub async fn recent_logs(
        &self,
        backend: Backend,
        id: &str,
        lines: usize,
    ) -> std::result::Result<Vec<String>, ProbeError> {
        self.bounded(async {
            match backend {
                Backend::Docker => match &self.docker {
                    Some(probe) => Ok(probe.logs(id, lines).await?),
                    None => Ok(Vec::new()),
                },
                Backend::Systemd => match &self.systemd {
                    Some(probe) => Ok(probe.recent_logs(id, lines).await?),
                    None => Ok(Vec::new()),
                },
                // containerd keeps no logs of its own
                Backend::Containerd => Ok(Vec::new()),
            }
        })
        .await
    }

    async fn list(&self, backend: Backend) -> std::result::Result<Vec<Candidate>, ProbeError> {
        match backend {
            Backend::Docker => match &self.docker {
                Some(probe) => Ok(probe.list().await?),
                None => Ok(Vec::new()),
            },
            Backend::Containerd => match &self.containerd {
                Some(probe) => Ok(probe.list().await?),
                None => Ok(Vec::new()),
            },
            Backend::Systemd => match &self.systemd {
                Some(probe) => Ok(probe.list().await?),
                None => Ok(Vec::new()),
            },
        }
    }

    async fn resolve(&self, candidate: &Candidate) -> std::result::Result<Target, ProbeError> {
        let backend = candidate.backend;
        match backend {
            Backend::Docker => match &self.docker {
                Some(probe) => Ok(probe.resolve(candidate).await?),
                None => Err(ProbeError::Disabled(backend)),
            },
            Backend::Containerd => match &self.containerd {
                Some(probe) => Ok(probe.resolve(candidate).await?),
                None => Err(ProbeError::Disabled(backend)),
            },
            Backend::Systemd => match &self.systemd {
                Some(probe) => Ok(probe.resolve(candidate).await?),
                None => Err(ProbeError::Disabled(backend)),
            },
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, ProbeError>>,
    ) -> std::result::Result<T, ProbeError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(backend: Backend, name: &str, image: Option<&str>) -> Candidate {
        Candidate {
            backend,
            id: format!("{name}-id"),
            name: name.to_owned(),
            image: image.map(str::to_owned),
            namespace: None,
        }
    }

    fn patterns(raw: &[&str]) -> Vec<Regex> {
        raw.iter().map(|p| Regex::new(p).unwrap()).collect()
    }

    fn names<'a>(ranked: &[&'a Candidate]) -> Vec<&'a str> {
        ranked.iter().map(|candidate| candidate.name.as_str()).collect()
    }

    #[test]
    fn test_rank_follows_pattern_order_then_name() {
        let candidates = [
            candidate(Backend::Docker, "relay-2", None),
            candidate(Backend::Docker, "relay-1", None),
            candidate(Backend::Docker, "archiver", None),
        ];
        let ranked = rank(&candidates, &patterns(&["relay-.*", "archiver"]));
        assert_eq!(names(&ranked), ["relay-1", "relay-2", "archiver"]);

        let ranked = rank(&candidates, &patterns(&["archiver", "relay-.*"]));
        assert_eq!(names(&ranked), ["archiver", "relay-1", "relay-2"]);
    }

    #[test]
    fn test_rank_matches_name_before_image() {
        let candidates = [
            candidate(Backend::Docker, "a-sidecar", Some("algorand/algod:latest")),
            candidate(Backend::Docker, "z-algod", Some("custom/node:1")),
        ];
        let ranked = rank(&candidates, &patterns(&["algod"]));
        assert_eq!(names(&ranked), ["z-algod", "a-sidecar"]);

        let ranked = rank(&candidates, &patterns(&["algorand/", "algod"]));
        assert_eq!(names(&ranked), ["a-sidecar", "z-algod"]);
        assert!(rank(&candidates, &patterns(&["geth"])).is_empty());
    }

    #[tokio::test]
    async fn test_find_without_backends() {
        let err = Probes::default()
            .find(&patterns(&[".*"]), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoBackend));
    }

    #[tokio::test]
    async fn test_unreachable_backends_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let probes = Probes::default()
            .with_docker(DockerProbe::new(dir.path().join("missing.sock")))
            .with_containerd(ContainerdProbe::new(dir.path().join("missing-containerd.sock")));
        match probes.find(&patterns(&["my-node.*"]), &[]).await {
            Err(Error::Unreachable { failures }) => {
                let backends: Vec<_> = failures.iter().map(|f| f.backend).collect();
                assert_eq!(backends, [Backend::Docker, Backend::Containerd]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_answering_backend_turns_failures_into_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let socket = docker::testing::serve(
            dir.path(),
            [("/containers/json".to_owned(), (200, b"[]".to_vec()))],
        );
        let probes = Probes::default()
            .with_docker(DockerProbe::new(socket))
            .with_containerd(ContainerdProbe::new(dir.path().join("missing-containerd.sock")));
        let err = probes.find(&patterns(&["my-node.*"]), &[]).await.unwrap_err();
        match err {
            Error::NotFound { searched, patterns } => {
                assert_eq!(searched, [Backend::Docker]);
                assert_eq!(patterns, ["my-node.*"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_find_resolves_docker_container() {
        let dir = tempfile::tempdir().unwrap();
        let socket = docker::testing::serve(dir.path(), docker::testing::my_node_routes(4242));
        let probes = Probes::default().with_docker(DockerProbe::new(socket));
        let target = probes.find(&patterns(&["my-node.*"]), &[]).await.unwrap();
        assert_eq!(target.backend, Backend::Docker);
        assert_eq!(target.name, "my-node-1");
        assert_eq!(target.pid, 4242);
        assert_eq!(
            target.container_id.as_ref().map(ContainerID::short),
            Some("8dfafdbc3a40")
        );
        assert!(target.runtime_log.is_some());
    }

    #[tokio::test]
    async fn test_find_skips_stopped_container() {
        let dir = tempfile::tempdir().unwrap();
        let stopped = "2".repeat(64);
        let list = format!(
            r#"[
                {{"Id":"{stopped}","Names":["/my-node-0"],"Image":"algorand/algod"}},
                {{"Id":"{running}","Names":["/my-node-1"],"Image":"algorand/algod"}}
            ]"#,
            running = docker::testing::MY_NODE_ID,
        );
        let mut routes = docker::testing::my_node_routes(4242);
        routes.retain(|(path, _)| path != "/containers/json");
        routes.push(("/containers/json".to_owned(), (200, list.into_bytes())));
        routes.push((
            format!("/containers/{stopped}/json"),
            (
                200,
                format!(r#"{{"Id":"{stopped}","Name":"/my-node-0","State":{{"Running":false,"Pid":0}}}}"#)
                    .into_bytes(),
            ),
        ));
        let socket = docker::testing::serve(dir.path(), routes);
        let probes = Probes::default().with_docker(DockerProbe::new(socket));

        let target = probes.find(&patterns(&["my-node.*"]), &[]).await.unwrap();
        assert_eq!(target.name, "my-node-1");
        assert_eq!(target.pid, 4242);
    }

    #[test]
    fn test_permission_hint() {
        let failure = BackendFailure {
            backend: Backend::Docker,
            error: ProbeError::Docker(docker::Error::Connect {
                socket: PathBuf::from("/var/run/docker.sock"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            }),
        };
        assert!(failure.hint().is_some());
        assert!(failure.to_string().contains("docker socket"));

        let timeout = BackendFailure {
            backend: Backend::Systemd,
            error: ProbeError::Timeout(Duration::from_secs(1)),
        };
        assert!(timeout.hint().is_none());
    }
}
