//! Readers for the per-process procfs entries the agent relies on.
use std::collections::BTreeMap;
use std::path::Path;

use super::{Error, HostRoot, Result};

/// Command line and environment of a running process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmdline: Vec<String>,
    pub environ: BTreeMap<String, String>,
    /// Start time after boot in clock ticks, field 22 of `/proc/<pid>/stat`.
    pub start_ticks: Option<u64>,
}

impl ProcessInfo {
    /// Reads `/proc/<pid>/cmdline`, `/proc/<pid>/environ` and the start time
    /// from `/proc/<pid>/stat` below `host`.
    ///
    /// An unreadable `environ` (it requires ptrace access) leaves the
    /// environment empty, an unreadable `stat` leaves the start time unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadFile`] if `cmdline` cannot be read, which usually
    /// means the process is gone.
    pub fn read(host: &HostRoot, pid: u32) -> Result<Self> {
        let cmdline = split_nul(&read_bytes(&host.proc_entry(pid, "cmdline"))?);
        let environ = match read_bytes(&host.proc_entry(pid, "environ")) {
            Ok(raw) => split_nul(&raw)
                .into_iter()
                .filter_map(|pair| {
                    let (key, value) = pair.split_once('=')?;
                    Some((key.to_owned(), value.to_owned()))
                })
                .collect(),
            Err(err) => {
                log::debug!("Skipping environment of pid {pid}: {err}");
                BTreeMap::new()
            }
        };
        let start_ticks = match read_string(&host.proc_entry(pid, "stat")) {
            Ok(raw) => parse_start_ticks(&raw),
            Err(err) => {
                log::debug!("Skipping start time of pid {pid}: {err}");
                None
            }
        };
        Ok(Self {
            pid,
            cmdline,
            environ,
            start_ticks,
        })
    }

    /// Value of the first present flag among `names`.
    ///
    /// Accepts both `--flag value` and `--flag=value`.
    pub fn flag(&self, names: &[&str]) -> Option<&str> {
        let mut args = self.cmdline.iter().skip(1);
        while let Some(arg) = args.next() {
            for name in names {
                if arg == name {
                    return args.next().map(String::as_str);
                }
                if let Some(value) = arg
                    .strip_prefix(name)
                    .and_then(|rest| rest.strip_prefix('='))
                {
                    return Some(value);
                }
            }
        }
        None
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.environ.get(key).map(String::as_str)
    }

    /// File name of the executable, e.g. `algod`.
    pub fn executable(&self) -> Option<&str> {
        let first = self.cmdline.first()?;
        Path::new(first).file_name()?.to_str()
    }
}

/// True if `/proc/<pid>` exists below `host`.
pub fn process_exists(host: &HostRoot, pid: u32) -> bool {
    pid != 0 && host.rootfs().join(format!("proc/{pid}")).is_dir()
}

pub(crate) fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn read_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Field 22 of a `stat` line. The command name before it is parenthesised and
/// may itself contain spaces or parentheses.
pub(crate) fn parse_start_ticks(raw: &str) -> Option<u64> {
    let (_, rest) = raw.rsplit_once(')')?;
    rest.split_whitespace().nth(22 - 3)?.parse().ok()
}

fn split_nul(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_process_info() {
        let dir = tempfile::tempdir().unwrap();
        testing::fake_process(
            dir.path(),
            314,
            &["/usr/bin/algod", "-d", "/var/lib/algorand"],
            &[("ALGORAND_DATA", "/data"), ("HOME", "/root")],
        );
        let host = HostRoot::new(dir.path());
        let info = ProcessInfo::read(&host, 314).unwrap();
        assert_eq!(info.executable(), Some("algod"));
        assert_eq!(info.flag(&["-d"]), Some("/var/lib/algorand"));
        assert_eq!(info.env("ALGORAND_DATA"), Some("/data"));
        assert_eq!(info.start_ticks, None);
        assert!(process_exists(&host, 314));
        assert!(!process_exists(&host, 315));

        testing::fake_start(dir.path(), 314, 5521);
        assert_eq!(ProcessInfo::read(&host, 314).unwrap().start_ticks, Some(5521));
    }

    #[test]
    fn test_start_ticks_skip_command_name() {
        let stat = "4242 (algod (main) x) S 1 4242 4242 0 -1 4194560 1234 0 0 0 \
            815 97 0 0 20 0 24 0 5521 2239488000 61234";
        assert_eq!(parse_start_ticks(stat), Some(5521));
        assert_eq!(parse_start_ticks("1 (init) S 0 1"), None);
        assert_eq!(parse_start_ticks("garbage"), None);
    }

    #[test]
    fn test_flag_forms() {
        let info = ProcessInfo {
            pid: 1,
            cmdline: ["geth", "--datadir=/chain", "--log.file", "/var/log/geth.log"]
                .map(String::from)
                .to_vec(),
            environ: BTreeMap::new(),
            start_ticks: None,
        };
        assert_eq!(info.flag(&["--datadir"]), Some("/chain"));
        assert_eq!(info.flag(&["--log.file"]), Some("/var/log/geth.log"));
        assert_eq!(info.flag(&["--missing"]), None);
    }

    #[test]
    fn test_missing_process_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessInfo::read(&HostRoot::new(dir.path()), 9).unwrap_err();
        assert!(err.is_not_found());
    }
}
