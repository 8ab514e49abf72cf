use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::{Result, Sampler};
use crate::host;
use crate::node::{LogEvents, NodeIdentity};
use crate::sample::{Payload, Sample};

/// Upper bound of log bytes consumed per round.
const MAX_READ: u64 = 1 << 20;

/// Follows the primary node log and turns lines matching the chain's log
/// events into samples.
///
/// Reading starts at the end of the file the first time it is seen; a file
/// that shrank was rotated and is read from the start. A line longer than one
/// round's read budget is skipped without being matched.
#[derive(Debug, Clone)]
pub struct LogEventSampler {
    events: LogEvents,
    position: Option<(PathBuf, u64)>,
    /// Set while the rest of an oversized line is still being skipped.
    discarding: bool,
}

impl LogEventSampler {
    pub fn new(events: LogEvents) -> Self {
        Self {
            events,
            position: None,
            discarding: false,
        }
    }

    fn read_new(&mut self, path: &Path) -> Result<Vec<u8>> {
        let mut file = std::fs::File::open(path).map_err(|source| read_error(path, source))?;
        let len = file
            .metadata()
            .map_err(|source| read_error(path, source))?
            .len();
        let offset = match &self.position {
            Some((known, offset)) if known == path && *offset <= len => *offset,
            Some((known, _)) if known == path => {
                log::debug!("Log `{}` was truncated, reading from start", path.display());
                self.discarding = false;
                0
            }
            _ => {
                self.discarding = false;
                len
            }
        };

        file.seek(SeekFrom::Start(offset))
            .map_err(|source| read_error(path, source))?;
        let mut buf = Vec::new();
        file.take(MAX_READ)
            .read_to_end(&mut buf)
            .map_err(|source| read_error(path, source))?;

        let mut start = 0;
        if self.discarding {
            match buf.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    start = idx + 1;
                    self.discarding = false;
                }
                None => {
                    self.position = Some((path.to_path_buf(), offset + buf.len() as u64));
                    return Ok(Vec::new());
                }
            }
        }

        // an incomplete last line is read again next round
        let complete = buf[start..]
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(start, |idx| start + idx + 1);
        if complete == 0 && buf.len() as u64 == MAX_READ {
            log::debug!(
                "Skipping line longer than {MAX_READ} bytes in `{}`",
                path.display()
            );
            self.discarding = true;
            self.position = Some((path.to_path_buf(), offset + MAX_READ));
            return Ok(Vec::new());
        }
        self.position = Some((path.to_path_buf(), offset + complete as u64));
        buf.truncate(complete);
        Ok(buf.split_off(start))
    }

    fn match_line(&self, line: &str, out: &mut Vec<Sample>) {
        for (name, pattern) in &self.events {
            let Some(caps) = pattern.captures(line) else {
                continue;
            };
            let value = caps.name("value").map(|m| m.as_str());
            let numeric = value.and_then(|value| value.replace(',', "").parse::<f64>().ok());
            let payload = match numeric {
                Some(value) => Payload::Metric {
                    name: (*name).to_owned(),
                    value,
                    labels: Default::default(),
                },
                None => Payload::Event {
                    name: (*name).to_owned(),
                    message: value.unwrap_or(line).to_owned(),
                },
            };
            out.push(Sample::new("logs", payload));
        }
    }
}

fn read_error(path: &Path, source: std::io::Error) -> host::Error {
    host::Error::ReadFile {
        path: path.to_path_buf(),
        source,
    }
}

impl Sampler for LogEventSampler {
    fn name(&self) -> &str {
        "logs"
    }

    fn sample(&mut self, identity: Option<&NodeIdentity>, out: &mut Vec<Sample>) -> Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }
        let Some(path) = identity.and_then(NodeIdentity::primary_log) else {
            return Ok(());
        };
        let path = path.to_path_buf();
        let raw = match self.read_new(&path) {
            Ok(raw) => raw,
            Err(super::Error::Host(err)) if err.is_not_found() => {
                log::trace!("Node log `{}` does not exist yet", path.display());
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        for line in String::from_utf8_lossy(&raw).lines() {
            self.match_line(line, out);
        }
        Ok(())
    }
}
