use std::path::Path;

use super::{Error, Result, Sampler};
use crate::host::{self, HostRoot};
use crate::node::NodeIdentity;
use crate::sample::Sample;

/// Counters of a single process from `/proc/<pid>/stat` and `/proc/<pid>/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessStat {
    /// Time spent in user mode, in clock ticks.
    pub utime_ticks: u64,
    /// Time spent in kernel mode, in clock ticks.
    pub stime_ticks: u64,
    pub threads: u64,
    /// Start time after boot, in clock ticks.
    pub start_ticks: u64,
    /// Resident set size from `VmRSS`.
    pub rss_bytes: Option<u64>,
}

impl ProcessStat {
    /// Reads the counters of `pid` below `host`. A missing `status` leaves
    /// `rss_bytes` unset.
    ///
    /// # Errors
    ///
    /// - [`Error::ProcessGone`] if the process no longer exists.
    /// - [`Error::Host`] if `stat` cannot be read or parsed.
    pub fn read(host: &HostRoot, pid: u32) -> Result<Self> {
        let stat_path = host.proc_entry(pid, "stat");
        let raw = host::procfs::read_string(&stat_path).map_err(|err| {
            if err.is_not_found() {
                Error::ProcessGone { pid }
            } else {
                err.into()
            }
        })?;
        let mut stat = parse_stat(&raw).ok_or_else(|| malformed(&stat_path, "too few fields"))?;

        let status_path = host.proc_entry(pid, "status");
        match host::procfs::read_string(&status_path) {
            Ok(status) => stat.rss_bytes = parse_vm_rss(&status),
            Err(err) => log::debug!("Skipping rss of pid {pid}: {err}"),
        }
        Ok(stat)
    }
}

fn malformed(path: &Path, reason: &str) -> Error {
    host::Error::Malformed {
        path: path.to_path_buf(),
        reason: reason.to_owned(),
    }
    .into()
}

/// Parses the fields after the parenthesised command name, which itself may
/// contain spaces or parentheses.
fn parse_stat(raw: &str) -> Option<ProcessStat> {
    let (_, rest) = raw.rsplit_once(')')?;
    // rest starts at field 3 (state)
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let field = |n: usize| fields.get(n - 3)?.parse::<u64>().ok();
    Some(ProcessStat {
        utime_ticks: field(14)?,
        stime_ticks: field(15)?,
        threads: field(20)?,
        start_ticks: field(22)?,
        rss_bytes: None,
    })
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Samples cpu, memory and thread counters of the discovered node process.
#[derive(Debug, Clone)]
pub struct ProcessSampler {
    host: HostRoot,
}

impl ProcessSampler {
    pub fn new(host: HostRoot) -> Self {
        Self { host }
    }
}

impl Sampler for ProcessSampler {
    fn name(&self) -> &str {
        "process"
    }

    fn sample(&mut self, identity: Option<&NodeIdentity>, out: &mut Vec<Sample>) -> Result<()> {
        let Some(pid) = identity.and_then(NodeIdentity::pid) else {
            return Ok(());
        };
        let stat = ProcessStat::read(&self.host, pid)?;
        let pid = pid.to_string();
        let labels = [("pid", pid.as_str())];
        out.push(Sample::metric("process", "cpu_user_ticks_total", stat.utime_ticks as f64, labels));
        out.push(Sample::metric("process", "cpu_system_ticks_total", stat.stime_ticks as f64, labels));
        out.push(Sample::metric("process", "threads", stat.threads as f64, labels));
        if let Some(rss) = stat.rss_bytes {
            out.push(Sample::metric("process", "resident_memory_bytes", rss as f64, labels));
        }
        Ok(())
    }
}
