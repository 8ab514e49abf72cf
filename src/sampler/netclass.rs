use std::path::{Path, PathBuf};

use regex::Regex;

use super::{Error, Result, Sampler};
use crate::host::{self, HostRoot};
use crate::node::NodeIdentity;
use crate::sample::Sample;

/// Matches no device name.
pub const DEFAULT_IGNORED_DEVICES: &str = "^$";

/// Numeric attributes of `/sys/class/net/<iface>` and the metric each feeds.
const NUMERIC_ATTRIBUTES: [(&str, &str); 11] = [
    ("addr_assign_type", "address_assign_type"),
    ("carrier", "carrier"),
    ("carrier_changes", "carrier_changes_total"),
    ("carrier_up_count", "carrier_up_changes_total"),
    ("carrier_down_count", "carrier_down_changes_total"),
    ("dormant", "dormant"),
    ("flags", "flags"),
    ("ifindex", "iface_id"),
    ("mtu", "mtu_bytes"),
    ("tx_queue_len", "transmit_queue_length"),
    ("type", "protocol_type"),
];

/// Attributes of one network device read from sysfs. Attributes the kernel
/// refuses to report (e.g. `carrier` of a down device) are absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetClassDevice {
    pub name: String,
    pub operstate: String,
    pub address: String,
    pub duplex: String,
    /// Link speed in Mbit/s, `-1` if unknown.
    pub speed: Option<i64>,
    pub numeric: Vec<(&'static str, i64)>,
}

impl NetClassDevice {
    fn read(dir: &Path, name: &str) -> Self {
        let text = |attr: &str| read_attribute(&dir.join(attr)).unwrap_or_default();
        Self {
            name: name.to_owned(),
            operstate: text("operstate"),
            address: text("address"),
            duplex: text("duplex"),
            speed: read_attribute(&dir.join("speed")).and_then(|raw| parse_numeric(&raw)),
            numeric: NUMERIC_ATTRIBUTES
                .iter()
                .filter_map(|(attr, metric)| {
                    let value = parse_numeric(&read_attribute(&dir.join(attr))?)?;
                    Some((*metric, value))
                })
                .collect(),
        }
    }

    fn push_samples(&self, out: &mut Vec<Sample>) {
        let device = [("device", self.name.as_str())];
        let up = if self.operstate == "up" { 1.0 } else { 0.0 };
        out.push(Sample::metric("netclass", "network_up", up, device));
        out.push(Sample::metric(
            "netclass",
            "network_info",
            1.0,
            [
                ("device", self.name.as_str()),
                ("address", self.address.as_str()),
                ("duplex", self.duplex.as_str()),
                ("operstate", self.operstate.as_str()),
            ],
        ));
        for (metric, value) in &self.numeric {
            out.push(Sample::metric(
                "netclass",
                format!("network_{metric}"),
                *value as f64,
                device,
            ));
        }
        if let Some(speed) = self.speed {
            let bytes = speed * 1000 * 1000 / 8;
            out.push(Sample::metric(
                "netclass",
                "network_speed_bytes",
                bytes as f64,
                device,
            ));
        }
    }
}

fn read_attribute(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|raw| raw.trim().to_owned())
}

/// Decimal, or hex with a `0x` prefix as used by `flags`.
fn parse_numeric(raw: &str) -> Option<i64> {
    match raw.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Samples link state of the host network devices from `/sys/class/net`.
#[derive(Debug, Clone)]
pub struct NetClassSampler {
    class_dir: PathBuf,
    ignored_devices: Regex,
}

impl NetClassSampler {
    /// # Errors
    ///
    /// Returns [`Error::Pattern`] if `ignored_devices` is not a valid regex.
    pub fn new(host: &HostRoot, ignored_devices: &str) -> Result<Self> {
        let ignored_devices = Regex::new(ignored_devices).map_err(|source| Error::Pattern {
            pattern: ignored_devices.to_owned(),
            source,
        })?;
        Ok(Self {
            class_dir: host.resolve("/sys/class/net"),
            ignored_devices,
        })
    }

    /// Devices in name order, without the ignored ones.
    pub fn devices(&self) -> Result<Vec<NetClassDevice>> {
        let entries = std::fs::read_dir(&self.class_dir).map_err(|source| host::Error::ReadFile {
            path: self.class_dir.clone(),
            source,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !self.ignored_devices.is_match(name))
            .collect();
        names.sort();
        Ok(names
            .iter()
            .map(|name| NetClassDevice::read(&self.class_dir.join(name), name))
            .collect())
    }
}

impl Sampler for NetClassSampler {
    fn name(&self) -> &str {
        "netclass"
    }

    fn sample(&mut self, _identity: Option<&NodeIdentity>, out: &mut Vec<Sample>) -> Result<()> {
        match self.devices() {
            Ok(devices) => {
                for device in devices {
                    device.push_samples(out);
                }
                Ok(())
            }
            Err(Error::Host(err)) if err.is_not_found() => {
                log::debug!("Could not read netclass directory: {err}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Payload;

    fn fake_device(root: &Path, name: &str, attrs: &[(&str, &str)]) {
        let dir = root.join("sys/class/net").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for (attr, value) in attrs {
            std::fs::write(dir.join(attr), format!("{value}\n")).unwrap();
        }
    }

    fn metric_value(samples: &[Sample], wanted: &str, device: &str) -> Option<f64> {
        samples.iter().find_map(|sample| match sample.payload() {
            Payload::Metric {
                name,
                value,
                labels,
            } if name == wanted && labels.get("device").map(String::as_str) == Some(device) => {
                Some(*value)
            }
            _ => None,
        })
    }

    #[test]
    fn test_parse_numeric() {
        assert_eq!(parse_numeric("1500"), Some(1500));
        assert_eq!(parse_numeric("0x1003"), Some(0x1003));
        assert_eq!(parse_numeric("-1"), Some(-1));
        assert_eq!(parse_numeric("up"), None);
    }

    #[test]
    fn test_devices_are_sampled() {
        let dir = tempfile::tempdir().unwrap();
        fake_device(
            dir.path(),
            "eth0",
            &[
                ("operstate", "up"),
                ("address", "02:42:ac:11:00:02"),
                ("mtu", "1500"),
                ("speed", "1000"),
                ("flags", "0x1003"),
                ("carrier", "1"),
            ],
        );
        fake_device(dir.path(), "wlan0", &[("operstate", "down")]);

        let mut sampler =
            NetClassSampler::new(&HostRoot::new(dir.path()), DEFAULT_IGNORED_DEVICES).unwrap();
        let mut out = Vec::new();
        sampler.sample(None, &mut out).unwrap();

        assert_eq!(metric_value(&out, "network_up", "eth0"), Some(1.0));
        assert_eq!(metric_value(&out, "network_up", "wlan0"), Some(0.0));
        assert_eq!(metric_value(&out, "network_mtu_bytes", "eth0"), Some(1500.0));
        assert_eq!(metric_value(&out, "network_flags", "eth0"), Some(4099.0));
        assert_eq!(
            metric_value(&out, "network_speed_bytes", "eth0"),
            Some(125_000_000.0)
        );
        assert_eq!(metric_value(&out, "network_carrier", "wlan0"), None);
    }

    #[test]
    fn test_ignored_devices_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fake_device(dir.path(), "eth0", &[("operstate", "up")]);
        fake_device(dir.path(), "veth12ab", &[("operstate", "up")]);

        let sampler = NetClassSampler::new(&HostRoot::new(dir.path()), "^veth").unwrap();
        let names: Vec<_> = sampler.devices().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["eth0"]);
    }

    #[test]
    fn test_missing_sysfs_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler =
            NetClassSampler::new(&HostRoot::new(dir.path()), DEFAULT_IGNORED_DEVICES).unwrap();
        let mut out = Vec::new();
        sampler.sample(None, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_invalid_pattern() {
        let err = NetClassSampler::new(&HostRoot::default(), "(").unwrap_err();
        assert!(matches!(err, Error::Pattern { .. }));
    }
}
