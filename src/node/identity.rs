use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use super::{Error, Result};
use crate::container::ContainerID;
use crate::discovery::Backend;
use crate::host::procfs::ProcessInfo;

/// A discovered fact an adapter may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Pid,
    ContainerId,
    ServiceUnit,
    LogPath,
    /// A chain specific entry of [`NodeIdentity::extra`].
    Extra(&'static str),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pid => f.write_str("pid"),
            Self::ContainerId => f.write_str("container_id"),
            Self::ServiceUnit => f.write_str("service_unit"),
            Self::LogPath => f.write_str("log_path"),
            Self::Extra(key) => f.write_str(key),
        }
    }
}

/// Facts identifying the monitored node process.
///
/// The serialized form is the canonical byte representation used for
/// fingerprinting: fields serialize in declaration order and extras are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeIdentity {
    pub origin: Option<Backend>,
    pub pid: Option<u32>,
    pub container_id: Option<ContainerID>,
    pub container_name: Option<String>,
    pub service_unit: Option<String>,
    /// File name of the node executable when discovered.
    #[serde(default)]
    pub executable: Option<String>,
    /// Process start time after boot in clock ticks. Together with
    /// `executable` it tells a reused pid apart from the discovered process.
    #[serde(default)]
    pub start_ticks: Option<u64>,
    /// Host paths of the node logs, primary log first.
    #[serde(default)]
    pub log_paths: Vec<PathBuf>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl NodeIdentity {
    /// An identity knowing nothing but the process id.
    pub fn for_pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            ..Default::default()
        }
    }

    /// True if `process` is the process this identity was discovered from.
    ///
    /// The executable must match. The start time is compared when both sides
    /// know it.
    pub fn matches_process(&self, process: &ProcessInfo) -> bool {
        if self.pid != Some(process.pid) {
            return false;
        }
        let Some(executable) = &self.executable else {
            return false;
        };
        if process.executable() != Some(executable.as_str()) {
            return false;
        }
        match (self.start_ticks, process.start_ticks) {
            (Some(cached), Some(current)) => cached == current,
            _ => true,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// True if `field` holds a usable value. A zero pid and empty strings or
    /// paths count as unset.
    pub fn is_set(&self, field: Field) -> bool {
        match field {
            Field::Pid => self.pid.is_some_and(|pid| pid != 0),
            Field::ContainerId => self.container_id.is_some(),
            Field::ServiceUnit => self.service_unit.as_deref().is_some_and(|u| !u.is_empty()),
            Field::LogPath => self.log_paths.iter().any(|p| !p.as_os_str().is_empty()),
            Field::Extra(key) => self.extra.get(key).is_some_and(|v| !v.is_empty()),
        }
    }

    /// Fields of `required`, plus those implied by the origin, that are empty.
    pub fn missing(&self, required: &[Field]) -> Vec<Field> {
        let implied = match self.origin {
            Some(origin) if origin.is_container() => Some(Field::ContainerId),
            Some(_) => Some(Field::ServiceUnit),
            None => None,
        };
        required
            .iter()
            .copied()
            .chain(implied)
            .filter(|field| !self.is_set(*field))
            .collect()
    }

    /// First non-empty entry of `log_paths`.
    pub fn primary_log(&self) -> Option<&Path> {
        self.log_paths
            .iter()
            .map(PathBuf::as_path)
            .find(|p| !p.as_os_str().is_empty())
    }

    /// Identifier the origin backend knows the node by.
    pub fn backend_id(&self) -> Option<&str> {
        match self.origin? {
            Backend::Systemd => self.service_unit.as_deref(),
            Backend::Docker | Backend::Containerd => self.container_id.as_ref().map(ContainerID::as_str),
        }
    }

    /// Serialized form fed to the fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] if serialization fails.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::Encode)
    }
}

/// The last discovered identity persisted between runs.
#[derive(Debug, Clone)]
pub struct IdentityCache {
    path: PathBuf,
}

impl IdentityCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The cached identity, `None` if nothing was cached yet.
    pub fn load(&self) -> Result<Option<NodeIdentity>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(Error::Cache {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| Error::CacheDecode {
                path: self.path.clone(),
                source,
            })
    }

    /// Replaces the cached identity, creating the parent directory if needed.
    /// The file is written under a temporary name and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if any file operation fails.
    pub fn store(&self, identity: &NodeIdentity) -> Result<()> {
        let cache_error = |source| Error::Cache {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(cache_error)?;
        }
        let raw = serde_json::to_vec_pretty(identity).map_err(Error::Encode)?;
        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, raw).map_err(cache_error)?;
        std::fs::rename(&staging, &self.path).map_err(cache_error)
    }

    /// Removes the cache file. A missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(Error::Cache {
                path: self.path.clone(),
                source: err,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docker_identity() -> NodeIdentity {
        NodeIdentity {
            origin: Some(Backend::Docker),
            pid: Some(4242),
            container_id: Some(ContainerID::new("abc123").unwrap()),
            container_name: Some("my-node-1".to_owned()),
            service_unit: None,
            executable: Some("algod".to_owned()),
            start_ticks: Some(5521),
            log_paths: vec![PathBuf::from("/rootfs/proc/4242/root/algod/data/node.log")],
            extra: BTreeMap::from([("data_dir".to_owned(), "/algod/data".to_owned())]),
        }
    }

    #[test]
    fn test_missing_fields() {
        let empty = NodeIdentity::default();
        assert!(empty.is_empty());
        assert_eq!(empty.missing(&[Field::Pid, Field::LogPath]), [Field::Pid, Field::LogPath]);

        let mut identity = docker_identity();
        assert!(identity.missing(&[Field::Pid, Field::LogPath, Field::Extra("data_dir")]).is_empty());

        identity.container_id = None;
        assert_eq!(identity.missing(&[Field::Pid]), [Field::ContainerId]);

        identity.origin = Some(Backend::Systemd);
        assert_eq!(identity.missing(&[]), [Field::ServiceUnit]);
    }

    #[test]
    fn test_zero_pid_and_empty_extra_are_unset() {
        let mut identity = NodeIdentity::for_pid(0);
        identity.extra.insert("data_dir".to_owned(), String::new());
        assert!(!identity.is_set(Field::Pid));
        assert!(!identity.is_set(Field::Extra("data_dir")));
    }

    #[test]
    fn test_canonical_bytes_follow_content() {
        let identity = docker_identity();
        assert_eq!(
            identity.canonical_bytes().unwrap(),
            identity.clone().canonical_bytes().unwrap()
        );

        let mut restarted = identity.clone();
        restarted.pid = Some(4243);
        assert_ne!(identity.canonical_bytes().unwrap(), restarted.canonical_bytes().unwrap());
    }

    #[test]
    fn test_matches_only_the_discovered_process() {
        let identity = docker_identity();
        let process = |pid: u32, argv: &[&str], start_ticks: Option<u64>| ProcessInfo {
            pid,
            cmdline: argv.iter().map(|arg| arg.to_string()).collect(),
            start_ticks,
            ..Default::default()
        };

        assert!(identity.matches_process(&process(4242, &["/node/bin/algod"], Some(5521))));
        assert!(identity.matches_process(&process(4242, &["algod"], None)));
        assert!(!identity.matches_process(&process(4242, &["/usr/sbin/sshd", "-D"], Some(5521))));
        assert!(!identity.matches_process(&process(4242, &["algod"], Some(9000))));
        assert!(!identity.matches_process(&process(4243, &["algod"], Some(5521))));

        let unverifiable = NodeIdentity {
            executable: None,
            ..identity
        };
        assert!(!unverifiable.matches_process(&process(4242, &["algod"], Some(5521))));
    }

    #[test]
    fn test_backend_id() {
        assert_eq!(docker_identity().backend_id(), Some("abc123"));
        let service = NodeIdentity {
            origin: Some(Backend::Systemd),
            service_unit: Some("algorand.service".to_owned()),
            ..Default::default()
        };
        assert_eq!(service.backend_id(), Some("algorand.service"));
        assert_eq!(NodeIdentity::default().backend_id(), None);
    }

    #[test]
    fn test_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IdentityCache::new(dir.path().join("state/algorand.identity.json"));
        assert_eq!(cache.load().unwrap(), None);

        cache.store(&docker_identity()).unwrap();
        assert_eq!(cache.load().unwrap(), Some(docker_identity()));

        cache.clear().unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.load().unwrap(), None);
    }

    #[test]
    fn test_corrupt_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geth.identity.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = IdentityCache::new(path).load().unwrap_err();
        assert!(matches!(err, Error::CacheDecode { .. }));
    }
}
