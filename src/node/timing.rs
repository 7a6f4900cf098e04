//! Timing and probing policy
//!
//! The election engine asks a [`Timing`] for every timer period and for addresses
//! to probe, so tests and simulations can run the same state machine with their own
//! clocks and peer lists.
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config_error;
use crate::error::Result;

pub const DEFAULT_CIDR_BITS: u8 = 28;
pub const MIN_CIDR_BITS: u8 = 12;
pub const MAX_CIDR_BITS: u8 = 29;
pub const DEFAULT_PROBE_N: usize = 12;
pub const CHECKPOINT_PERIOD: Duration = Duration::from_secs(60);

pub trait Timing: Send + Sync {
    fn heartbeat(&self) -> Duration;
    fn key_period(&self) -> Duration;
    fn node_prune(&self) -> Duration;
    fn history_prune(&self) -> Duration;
    fn checkpoint(&self) -> Duration;
    fn probebeat(&self) -> Duration;
    /// Number of probes per makework tick
    fn probe_n(&self) -> usize;
    /// An address to probe, or `None` for a deliberate miss.
    fn probe(&self) -> Option<String>;
}

/// Where probe addresses come from
#[derive(Clone, Debug, PartialEq)]
pub enum ProbeSource {
    /// Random other hosts in our own IPv4 subnet of the given prefix length
    Subnet { ip: Ipv4Addr, bits: u8 },
    /// Every host address of a set of configured networks
    Hosts(Vec<Ipv4Addr>),
    /// An explicit address list; each probe misses with probability `miss`
    List { addrs: Vec<String>, miss: f64 },
}

impl std::fmt::Display for ProbeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeSource::Subnet { ip, bits } => write!(f, "subnet {}/{}", ip, bits),
            ProbeSource::Hosts(hosts) => write!(f, "{} configured hosts", hosts.len()),
            ProbeSource::List { addrs, miss } => {
                write!(f, "{} listed addresses (miss {})", addrs.len(), miss)
            }
        }
    }
}

/// The UDP deployment policy: every period is a multiple of the heartbeat.
#[derive(Clone, Debug)]
pub struct ProbeTiming {
    heartbeat: Duration,
    probe_n: usize,
    source: ProbeSource,
}

impl ProbeTiming {
    pub fn new(heartbeat: Duration, source: ProbeSource) -> Self {
        Self {
            heartbeat,
            probe_n: DEFAULT_PROBE_N,
            source,
        }
    }

    /// Probe our own subnet. The prefix length is clamped to a sane range.
    pub fn subnet(heartbeat: Duration, ip: Ipv4Addr, bits: u8) -> Self {
        let bits = bits.clamp(MIN_CIDR_BITS, MAX_CIDR_BITS);
        Self::new(heartbeat, ProbeSource::Subnet { ip, bits })
    }

    /// Probe the hosts of comma-separated CIDR networks, skipping our own address.
    pub fn networks(heartbeat: Duration, csv: &str, own_ip: Ipv4Addr) -> Result<Self> {
        let networks = parse_networks(csv)?;
        let hosts: Vec<Ipv4Addr> = make_host_addrs(&networks)?
            .into_iter()
            .filter(|ip| *ip != own_ip)
            .collect();
        if hosts.is_empty() {
            return Err(config_error!("networks '{}' contain no hosts besides us", csv));
        }
        Ok(Self::new(heartbeat, ProbeSource::Hosts(hosts)))
    }

    /// Probe an explicit address list, one address per line. A line `nil <p>` sets
    /// the probability that a probe misses.
    pub fn address_list(heartbeat: Duration, text: &str) -> Result<Self> {
        let (addrs, miss) = parse_address_list(text)?;
        Ok(Self::new(heartbeat, ProbeSource::List { addrs, miss }))
    }

    pub fn source(&self) -> &ProbeSource {
        &self.source
    }
}

impl Timing for ProbeTiming {
    fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    fn key_period(&self) -> Duration {
        self.heartbeat * 100
    }

    fn node_prune(&self) -> Duration {
        self.heartbeat * 3
    }

    fn history_prune(&self) -> Duration {
        self.heartbeat * 2
    }

    fn checkpoint(&self) -> Duration {
        CHECKPOINT_PERIOD
    }

    fn probebeat(&self) -> Duration {
        self.heartbeat * 3
    }

    fn probe_n(&self) -> usize {
        self.probe_n
    }

    fn probe(&self) -> Option<String> {
        let mut rng = rand::thread_rng();
        let addr = match &self.source {
            ProbeSource::List { addrs, miss } => {
                if addrs.is_empty() || rng.gen::<f64>() < *miss {
                    return None;
                }
                addrs[rng.gen_range(0..addrs.len())].clone()
            }
            ProbeSource::Hosts(hosts) => {
                if hosts.is_empty() {
                    return None;
                }
                hosts[rng.gen_range(0..hosts.len())].to_string()
            }
            ProbeSource::Subnet { ip, bits } => subnet_neighbour(*ip, *bits, &mut rng).to_string(),
        };
        debug!("probe: {}", addr);
        Some(addr)
    }
}

/// A random host in `ip`'s subnet whose host part differs from `ip`'s.
fn subnet_neighbour(ip: Ipv4Addr, bits: u8, rng: &mut impl Rng) -> Ipv4Addr {
    let bits = bits.clamp(MIN_CIDR_BITS, MAX_CIDR_BITS);
    let mask = u32::MAX << (32 - u32::from(bits));
    let raw = u32::from(ip);
    let size = 1u32 << (32 - u32::from(bits));
    let own_host = raw & !mask;
    let host = loop {
        let candidate = rng.gen_range(0..size);
        if candidate != own_host {
            break candidate;
        }
    };
    Ipv4Addr::from((raw & mask) | host)
}

/// An IPv4 network in CIDR form
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Network {
    pub addr: Ipv4Addr,
    pub bits: u8,
}

impl Network {
    pub fn mask(&self) -> u32 {
        if self.bits == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.bits))
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.addr) & self.mask()
    }
}

impl std::str::FromStr for Network {
    type Err = crate::error::FlockError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, bits) = s
            .split_once('/')
            .ok_or_else(|| config_error!("network '{}' is not in CIDR form", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| config_error!("couldn't parse network {}: {}", s, e))?;
        let bits: u8 = bits
            .parse()
            .map_err(|e| config_error!("couldn't parse network {}: {}", s, e))?;
        if bits > 32 {
            return Err(config_error!("couldn't parse network {}: prefix too long", s));
        }
        let network = Network { addr, bits };
        Ok(Network {
            addr: Ipv4Addr::from(u32::from(addr) & network.mask()),
            bits,
        })
    }
}

/// Parse comma-separated CIDR networks. Empty elements are skipped; any element
/// that fails to parse is an error.
pub fn parse_networks(csv: &str) -> Result<Vec<Network>> {
    csv.split(',')
        .filter(|n| !n.is_empty())
        .map(|n| n.parse::<Network>())
        .collect()
}

/// All host addresses of `networks`, leaving out each network's own address and
/// its broadcast address.
pub fn make_host_addrs(networks: &[Network]) -> Result<Vec<Ipv4Addr>> {
    let mut hosts = Vec::new();
    for network in networks {
        let mut addrs = Vec::new();
        let mut addr = network.addr;
        while network.contains(addr) {
            addrs.push(addr);
            match increment_ip(addr) {
                Some(next) => addr = next,
                None => break,
            }
        }
        if addrs.len() > 2 {
            hosts.extend_from_slice(&addrs[1..addrs.len() - 1]);
        }
    }
    if hosts.is_empty() {
        return Err(config_error!(
            "couldn't find any host addresses in networks {:?}",
            networks
        ));
    }
    Ok(hosts)
}

/// The next address, or `None` past 255.255.255.255.
pub fn increment_ip(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    u32::from(ip).checked_add(1).map(Ipv4Addr::from)
}

fn parse_address_list(text: &str) -> Result<(Vec<String>, f64)> {
    let mut addrs = Vec::new();
    let mut miss = 0.0;
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(first) = fields.next() else {
            continue;
        };
        if first == "nil" {
            if let Some(p) = fields.next().and_then(|p| p.parse::<f64>().ok()) {
                miss = p;
                continue;
            }
        }
        if first.parse::<IpAddr>().is_err() && !is_hostname(first) {
            return Err(config_error!("bad address '{}' in address list", first));
        }
        addrs.push(first.to_string());
    }
    if addrs.is_empty() {
        return Err(config_error!("address list contained no addresses"));
    }
    Ok((addrs, miss))
}

fn is_hostname(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && s.chars().any(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_networks() {
        let nets = parse_networks("10.1.2.0/24,,192.168.0.17/30").unwrap();
        assert_eq!(nets.len(), 2);
        assert_eq!(nets[0].addr, Ipv4Addr::new(10, 1, 2, 0));
        // host bits are masked away
        assert_eq!(nets[1].addr, Ipv4Addr::new(192, 168, 0, 16));
        assert!(parse_networks("").unwrap().is_empty());
        assert!(parse_networks("10.0.0.0/33").is_err());
        assert!(parse_networks("10.0.0.0").is_err());
        assert!(parse_networks("10.0.0.0/24, 10.0.1.0/24").is_err());
    }

    #[test]
    fn test_make_host_addrs() {
        let nets = parse_networks("10.0.0.0/30,10.0.1.0/29").unwrap();
        let hosts = make_host_addrs(&nets).unwrap();
        assert_eq!(hosts.len(), 2 + 6);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(hosts[1], Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(hosts[7], Ipv4Addr::new(10, 0, 1, 6));

        // a /31 has no hosts once network and broadcast are dropped
        let nets = parse_networks("10.0.0.0/31").unwrap();
        assert!(make_host_addrs(&nets).is_err());
    }

    #[test]
    fn test_increment_ip() {
        assert_eq!(
            increment_ip(Ipv4Addr::new(10, 0, 0, 255)),
            Some(Ipv4Addr::new(10, 0, 1, 0))
        );
        assert_eq!(
            increment_ip(Ipv4Addr::new(10, 255, 255, 255)),
            Some(Ipv4Addr::new(11, 0, 0, 0))
        );
        assert_eq!(increment_ip(Ipv4Addr::BROADCAST), None);
    }

    #[test]
    fn test_subnet_probe_stays_in_subnet() {
        let own = Ipv4Addr::new(192, 168, 7, 37);
        let timing = ProbeTiming::subnet(Duration::from_secs(1), own, 28);
        let network: Network = "192.168.7.32/28".parse().unwrap();
        for _ in 0..200 {
            let addr: Ipv4Addr = timing.probe().unwrap().parse().unwrap();
            assert!(network.contains(addr));
            assert_ne!(addr, own);
        }
    }

    #[test]
    fn test_probe_source_display() {
        let subnet = ProbeTiming::subnet(Duration::from_secs(1), Ipv4Addr::new(10, 0, 0, 1), 24);
        assert_eq!(subnet.source().to_string(), "subnet 10.0.0.1/24");
        let list = ProbeTiming::address_list(Duration::from_secs(1), "a.local\nb.local\nnil 0.5\n").unwrap();
        assert_eq!(list.source().to_string(), "2 listed addresses (miss 0.5)");
    }

    #[test]
    fn test_subnet_bits_are_clamped() {
        let timing = ProbeTiming::subnet(Duration::from_secs(1), Ipv4Addr::new(10, 0, 0, 1), 31);
        assert_eq!(
            timing.source(),
            &ProbeSource::Subnet {
                ip: Ipv4Addr::new(10, 0, 0, 1),
                bits: MAX_CIDR_BITS
            }
        );
    }

    #[test]
    fn test_networks_skip_own_address() {
        let own = Ipv4Addr::new(10, 0, 0, 1);
        let timing = ProbeTiming::networks(Duration::from_secs(1), "10.0.0.0/30", own).unwrap();
        for _ in 0..20 {
            assert_eq!(timing.probe().as_deref(), Some("10.0.0.2"));
        }
        assert!(ProbeTiming::networks(Duration::from_secs(1), "10.0.0.0/31", own).is_err());
    }

    #[test]
    fn test_address_list() {
        let text = "10.0.0.5\nnil 0.25\n\nnode-b.local\n";
        let timing = ProbeTiming::address_list(Duration::from_secs(1), text).unwrap();
        match timing.source() {
            ProbeSource::List { addrs, miss } => {
                assert_eq!(addrs, &vec!["10.0.0.5".to_string(), "node-b.local".to_string()]);
                assert_eq!(*miss, 0.25);
            }
            other => panic!("unexpected source {:?}", other),
        }

        let always_miss = ProbeTiming::address_list(Duration::from_secs(1), "10.0.0.5\nnil 1.0\n").unwrap();
        assert!(always_miss.probe().is_none());

        assert!(ProbeTiming::address_list(Duration::from_secs(1), "nil 0.5\n").is_err());
        assert!(ProbeTiming::address_list(Duration::from_secs(1), "10.0.0.5\n!!bad\n").is_err());
    }

    #[test]
    fn test_periods_follow_heartbeat() {
        let timing = ProbeTiming::subnet(Duration::from_millis(200), Ipv4Addr::LOCALHOST, 28);
        assert_eq!(timing.key_period(), Duration::from_secs(20));
        assert_eq!(timing.node_prune(), Duration::from_millis(600));
        assert_eq!(timing.history_prune(), Duration::from_millis(400));
        assert_eq!(timing.probebeat(), Duration::from_millis(600));
        assert_eq!(timing.checkpoint(), CHECKPOINT_PERIOD);
        assert_eq!(timing.probe_n(), DEFAULT_PROBE_N);
    }
}
