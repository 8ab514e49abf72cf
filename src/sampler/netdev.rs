use std::io::BufRead;

use super::{Result, Sampler};
use crate::host::HostRoot;
use crate::node::NodeIdentity;
use crate::sample::Sample;

/// Traffic counters of one interface as listed in `/proc/<pid>/net/dev`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errs: u64,
    pub rx_drop: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errs: u64,
    pub tx_drop: u64,
}

impl InterfaceCounters {
    fn metrics(&self) -> [(&'static str, u64); 8] {
        [
            ("receive_bytes_total", self.rx_bytes),
            ("receive_packets_total", self.rx_packets),
            ("receive_errs_total", self.rx_errs),
            ("receive_drop_total", self.rx_drop),
            ("transmit_bytes_total", self.tx_bytes),
            ("transmit_packets_total", self.tx_packets),
            ("transmit_errs_total", self.tx_errs),
            ("transmit_drop_total", self.tx_drop),
        ]
    }
}

/// Bridge and loopback devices carry no node traffic of their own.
const IGNORED_INTERFACES: [&str; 4] = ["lo", "veth", "docker", "nerdctl"];

fn is_ignored_interface(iface: &str) -> bool {
    IGNORED_INTERFACES
        .iter()
        .any(|prefix| iface.starts_with(prefix))
}

/// Splits off the interface name and builds its counters. Lines with fewer than
/// the 16 kernel columns are skipped; unparsable values count as zero.
fn parse_interface_line(line: &str) -> Option<(String, InterfaceCounters)> {
    let (iface, data) = line.trim().split_once(':')?;
    let fields: Vec<u64> = data
        .split_whitespace()
        .map(|field| field.parse().unwrap_or(0))
        .collect();
    if fields.len() < 16 {
        return None;
    }
    Some((
        iface.trim().to_owned(),
        InterfaceCounters {
            rx_bytes: fields[0],
            rx_packets: fields[1],
            rx_errs: fields[2],
            rx_drop: fields[3],
            tx_bytes: fields[8],
            tx_packets: fields[9],
            tx_errs: fields[10],
            tx_drop: fields[11],
        },
    ))
}

/// Reads every non ignored interface, in file order.
pub fn read_interfaces<R: BufRead>(buf: &mut R) -> std::io::Result<Vec<(String, InterfaceCounters)>> {
    let mut interfaces = Vec::new();
    let mut line = String::new();

    // two header lines
    for _ in 0..2 {
        buf.read_line(&mut line)?;
        line.clear();
    }

    while buf.read_line(&mut line)? != 0 {
        if let Some((iface, counters)) = parse_interface_line(&line) {
            if !is_ignored_interface(&iface) {
                interfaces.push((iface, counters));
            }
        }
        line.clear();
    }
    Ok(interfaces)
}

/// Samples interface counters from the network namespace of the node process,
/// falling back to the host namespace while no node is discovered.
#[derive(Debug, Clone)]
pub struct NetDevSampler {
    host: HostRoot,
}

impl NetDevSampler {
    pub fn new(host: HostRoot) -> Self {
        Self { host }
    }
}

impl Sampler for NetDevSampler {
    fn name(&self) -> &str {
        "netdev"
    }

    fn sample(&mut self, identity: Option<&NodeIdentity>, out: &mut Vec<Sample>) -> Result<()> {
        let path = match identity.and_then(NodeIdentity::pid) {
            Some(pid) => self.host.proc_entry(pid, "net/dev"),
            None => self.host.resolve("/proc/net/dev"),
        };
        let raw = crate::host::procfs::read_bytes(&path)?;
        let interfaces = read_interfaces(&mut &raw[..]).map_err(|source| {
            crate::host::Error::ReadFile {
                path: path.clone(),
                source,
            }
        })?;
        for (iface, counters) in interfaces {
            for (name, value) in counters.metrics() {
                out.push(Sample::metric(
                    "netdev",
                    name,
                    value as f64,
                    [("device", iface.as_str())],
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
";

    fn parse(body: &str) -> Vec<(String, InterfaceCounters)> {
        let data = format!("{HEADER}{body}");
        read_interfaces(&mut data.as_bytes()).unwrap()
    }

    #[test]
    fn test_only_headers() {
        assert!(parse("").is_empty());
        assert!(read_interfaces(&mut &b""[..]).unwrap().is_empty());
    }

    #[test]
    fn test_interfaces_are_kept_apart() {
        let interfaces = parse(
            "    lo: 422198341   75815    0    0    0     0          0         0 422198341   75815    0    0    0     0       0          0
  eth0: 10240    100     1    2    0     0          0         0  20480   200     3    4    0     0       0          0
  eth1: 10 20 0 0 0 0 0 0  30 40 0 0 0 0 0 0
",
        );
        assert_eq!(interfaces.len(), 2);
        let (name, eth0) = &interfaces[0];
        assert_eq!(name, "eth0");
        assert_eq!(
            *eth0,
            InterfaceCounters {
                rx_bytes: 10240,
                rx_packets: 100,
                rx_errs: 1,
                rx_drop: 2,
                tx_bytes: 20480,
                tx_packets: 200,
                tx_errs: 3,
                tx_drop: 4,
            }
        );
        assert_eq!(interfaces[1].0, "eth1");
        assert_eq!(interfaces[1].1.tx_packets, 40);
    }

    #[test]
    fn test_ignored_and_malformed_lines() {
        let interfaces = parse(
            "    docker0: 999 999 0 0 0 0 0 0 999 999 0 0 0 0 0 0
    veth0: 999 999 0 0 0 0 0 0 999 999 0 0 0 0 0 0
 badif: 123 456
",
        );
        assert!(interfaces.is_empty());
    }

    #[test]
    fn test_unparsable_values_count_as_zero() {
        let interfaces = parse("  eth0: xyz abc 0 0 0 0 0 0  20480 200 0 0 0 0 0 0\n");
        assert_eq!(interfaces[0].1.rx_bytes, 0);
        assert_eq!(interfaces[0].1.tx_bytes, 20480);
    }

    #[test]
    fn test_sampler_reads_node_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let net = dir.path().join("proc/31/net");
        std::fs::create_dir_all(&net).unwrap();
        std::fs::write(
            net.join("dev"),
            format!("{HEADER}  eth0: 1 2 0 0 0 0 0 0 3 4 0 0 0 0 0 0\n"),
        )
        .unwrap();

        let mut sampler = NetDevSampler::new(HostRoot::new(dir.path()));
        let mut out = Vec::new();
        sampler
            .sample(Some(&NodeIdentity::for_pid(31)), &mut out)
            .unwrap();
        assert_eq!(out.len(), 8);
        assert!(out.iter().all(|sample| sample.source() == "netdev"));
    }
}
