use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::{Error, Result};

/// Where the agent itself is running.
#[derive(Debug, PartialEq, Eq)]
pub enum RuntimeEnvironment {
    Host,
    /// Inside a containerized environment (e.g., Docker, Kubernetes, Podman).
    Container,
}

/// Detects whether the agent runs in a container or on the host.
///
/// Checks, in order: a PID namespace differing from the init process under
/// `rootfs`, container markers in `/proc/self/cgroup`, and marker files or the
/// `container` environment variable. Failed checks are logged and skipped.
pub fn detect_runtime_environment(rootfs: impl AsRef<Path>) -> RuntimeEnvironment {
    let rootfs = rootfs.as_ref();
    match rootfs.join("proc").try_exists() {
        Ok(true) => match is_pid_namespace_isolated(rootfs) {
            Ok(true) => return RuntimeEnvironment::Container,
            Ok(false) => {}
            Err(err) => log::warn!(
                "Namespace check failed when detecting runtime environment: {}",
                err
            ),
        },
        Ok(false) => {}
        Err(err) => log::warn!("Failed to determine presence of /proc in rootfs: {}", err),
    }

    let cgroup = Path::new("/proc/self/cgroup");
    match fs::File::open(cgroup) {
        Ok(file) => {
            if matches_container_cgroup(BufReader::new(file)) {
                return RuntimeEnvironment::Container;
            }
        }
        Err(err) => log::warn!("Cgroup analysis failed during runtime detection: {}", err),
    }

    if fs::metadata("/.dockerenv").is_ok()
        || fs::metadata("/run/.containerenv").is_ok()
        || std::env::var_os("container").is_some()
    {
        return RuntimeEnvironment::Container;
    }

    RuntimeEnvironment::Host
}

fn is_pid_namespace_isolated(rootfs: &Path) -> Result<bool> {
    let read = |path: &Path| {
        fs::read_link(path).map_err(|source| Error::ReadSymlink {
            path: path.to_path_buf(),
            source,
        })
    };
    let own = read(Path::new("/proc/self/ns/pid"))?;
    let init = read(&rootfs.join("proc/1/ns/pid"))?;
    Ok(own != init)
}

/// True if any cgroup line names a container manager or carries a container id.
fn matches_container_cgroup(reader: impl BufRead) -> bool {
    const MARKERS: [&str; 4] = ["docker", "kubepods", "containerd", "libpod"];
    reader.lines().map_while(|line| line.ok()).any(|line| {
        MARKERS.iter().any(|marker| line.contains(marker))
            || line
                .split(['/', '-', '.'])
                .any(|part| part.len() >= 32 && part.chars().all(|c| c.is_ascii_hexdigit()))
    })
}
