//! Service unit discovery through `systemctl`, with recent lines from `journalctl`.
use std::path::{Path, PathBuf};
use std::process::Stdio;

use super::{Backend, Candidate, Target};

pub const DEFAULT_SYSTEMCTL: &str = "systemctl";
pub const DEFAULT_JOURNALCTL: &str = "journalctl";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to execute `{program}`: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` exited with {status}: {stderr}")]
    Exit {
        program: PathBuf,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("unexpected MainPID `{value}` for unit `{unit}`")]
    MainPid { unit: String, value: String },
    #[error("unit `{0}` has no running main process")]
    NotRunning(String),
}

impl Error {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Spawn { source, .. } => source.kind() == std::io::ErrorKind::PermissionDenied,
            Self::Exit { stderr, .. } => {
                let stderr = stderr.to_ascii_lowercase();
                stderr.contains("access denied") || stderr.contains("permission denied")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemdProbe {
    systemctl: PathBuf,
    journalctl: PathBuf,
}

impl Default for SystemdProbe {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEMCTL, DEFAULT_JOURNALCTL)
    }
}

impl SystemdProbe {
    pub fn new(systemctl: impl Into<PathBuf>, journalctl: impl Into<PathBuf>) -> Self {
        Self {
            systemctl: systemctl.into(),
            journalctl: journalctl.into(),
        }
    }

    /// Running service units.
    pub async fn list(&self) -> Result<Vec<Candidate>> {
        let output = run(
            &self.systemctl,
            &[
                "list-units",
                "--type=service",
                "--state=running",
                "--no-legend",
                "--no-pager",
                "--plain",
            ],
        )
        .await?;
        Ok(parse_units(&output)
            .into_iter()
            .map(|unit| Candidate {
                backend: Backend::Systemd,
                id: unit.clone(),
                name: unit,
                image: None,
                namespace: None,
            })
            .collect())
    }

    /// Reads the main pid of the unit.
    pub async fn resolve(&self, candidate: &Candidate) -> Result<Target> {
        let unit = candidate.id.as_str();
        let output = run(
            &self.systemctl,
            &["show", "--property=MainPID", "--value", unit],
        )
        .await?;
        let pid = parse_main_pid(unit, &output)?;
        Ok(Target {
            backend: Backend::Systemd,
            name: candidate.name.clone(),
            pid,
            container_id: None,
            service_unit: Some(unit.to_owned()),
            image: None,
            runtime_log: None,
        })
    }

    /// Last `lines` journal messages of `unit`.
    pub async fn recent_logs(&self, unit: &str, lines: usize) -> Result<Vec<String>> {
        let lines = lines.to_string();
        let output = run(
            &self.journalctl,
            &["--unit", unit, "--lines", &lines, "--output=cat", "--no-pager"],
        )
        .await?;
        Ok(output.lines().map(str::to_owned).collect())
    }
}

async fn run(program: &Path, args: &[&str]) -> Result<String> {
    log::trace!("Running {} {}", program.display(), args.join(" "));
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| Error::Spawn {
            program: program.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(Error::Exit {
            program: program.to_path_buf(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// First column of `systemctl list-units --plain --no-legend`.
fn parse_units(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            // failed units are prefixed with a marker even in plain mode
            let line = line.trim_start().trim_start_matches('●').trim_start();
            line.split_whitespace().next()
        })
        .filter(|unit| unit.ends_with(".service"))
        .map(str::to_owned)
        .collect()
}

fn parse_main_pid(unit: &str, output: &str) -> Result<u32> {
    let value = output.trim();
    match value.parse::<u32>() {
        Ok(0) => Err(Error::NotRunning(unit.to_owned())),
        Ok(pid) => Ok(pid),
        Err(_) => Err(Error::MainPid {
            unit: unit.to_owned(),
            value: value.to_owned(),
        }),
    }
}
