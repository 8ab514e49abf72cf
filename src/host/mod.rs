//! Host filesystem access for an agent that may itself run in a container.
//!
//! When containerized, the host root is expected to be bind mounted (by default
//! at `/rootfs`) and every procfs or sysfs path is resolved below it.
mod detect;
mod error;
pub mod procfs;

use std::path::{Path, PathBuf};

pub use detect::{RuntimeEnvironment, detect_runtime_environment};
pub use error::{Error, Result};

/// Resolves absolute host paths against the host root mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRoot {
    rootfs: PathBuf,
}

impl Default for HostRoot {
    fn default() -> Self {
        Self::new("/")
    }
}

impl HostRoot {
    /// A host mounted at `rootfs`; use `/` when not running in a container.
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
        }
    }

    /// Picks `mount` when running in a container, `/` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingRootMount`] if the agent runs in a container
    /// but `mount` does not exist.
    pub fn detect(mount: impl AsRef<Path>) -> Result<Self> {
        let mount = mount.as_ref();
        let root = match detect_runtime_environment(mount) {
            RuntimeEnvironment::Container if !mount.exists() => {
                return Err(Error::MissingRootMount(mount.to_path_buf()));
            }
            RuntimeEnvironment::Container => Self::new(mount),
            RuntimeEnvironment::Host => Self::default(),
        };
        log::debug!("Final rootfs: {}", root.rootfs.display());
        Ok(root)
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Maps an absolute host path below the root mount.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.rootfs
            .join(path.strip_prefix("/").unwrap_or(path))
    }

    /// `<rootfs>/proc/<pid>/<entry>`.
    pub fn proc_entry(&self, pid: u32, entry: &str) -> PathBuf {
        self.rootfs.join(format!("proc/{pid}/{entry}"))
    }

    /// Maps a path seen by process `pid` (possibly inside a container's mount
    /// namespace) to a host path through `/proc/<pid>/root`.
    pub fn process_view(&self, pid: u32, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.proc_entry(pid, "root")
            .join(path.strip_prefix("/").unwrap_or(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_below_rootfs() {
        let root = HostRoot::new("/rootfs");
        assert_eq!(root.resolve("/etc/hostname"), PathBuf::from("/rootfs/etc/hostname"));
        assert_eq!(root.proc_entry(42, "cmdline"), PathBuf::from("/rootfs/proc/42/cmdline"));
    }

    #[test]
    fn test_process_view() {
        let root = HostRoot::default();
        assert_eq!(
            root.process_view(7, "/algod/data/node.log"),
            PathBuf::from("/proc/7/root/algod/data/node.log")
        );
    }
}
