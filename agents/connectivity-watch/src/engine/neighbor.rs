//! Neighbor-discovery / ARP table lookup
//!
//! Used after a transport failure to tell "host not on the network" apart from
//! "host present but filtered".

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const PROC_ARP: &str = "/proc/net/arp";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Best-effort neighbor-table query
#[async_trait]
pub trait NeighborTable: Send + Sync {
    /// Whether a resolved link-layer entry exists for `host`
    async fn has_entry(&self, host: &str) -> bool;
}

/// Reads the operating system's tables: `/proc/net/arp`, then `ip neigh`,
/// then `arp -a`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNeighborTable;

#[async_trait]
impl NeighborTable for SystemNeighborTable {
    async fn has_entry(&self, host: &str) -> bool {
        let addresses = candidate_addresses(host).await;
        if addresses.is_empty() {
            return false;
        }

        if let Ok(table) = tokio::fs::read_to_string(PROC_ARP).await {
            if proc_arp_contains(&table, &addresses) {
                return true;
            }
        }

        if let Some(output) = run_quiet("ip", &["neigh", "show"]).await {
            if ip_neigh_contains(&output, &addresses) {
                return true;
            }
        }

        if let Some(output) = run_quiet("arp", &["-a"]).await {
            if arp_a_contains(&output, &addresses) {
                return true;
            }
        }

        false
    }
}

/// Fixed set of present hosts
#[derive(Debug, Clone, Default)]
pub struct StaticNeighborTable {
    present: HashSet<String>,
}

impl StaticNeighborTable {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            present: hosts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NeighborTable for StaticNeighborTable {
    async fn has_entry(&self, host: &str) -> bool {
        self.present.contains(host)
    }
}

/// Literal IPs pass through; names are resolved
async fn candidate_addresses(host: &str) -> Vec<String> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return vec![ip.to_string()];
    }
    match timeout(COMMAND_TIMEOUT, tokio::net::lookup_host((host, 0))).await {
        Ok(Ok(addrs)) => {
            let mut ips: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
            ips.dedup();
            ips
        }
        _ => Vec::new(),
    }
}

async fn run_quiet(program: &str, args: &[&str]) -> Option<String> {
    let output = timeout(COMMAND_TIMEOUT, Command::new(program).args(args).kill_on_drop(true).output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `IP address  HW type  Flags  HW address  Mask  Device`; flags 0x0 is incomplete
fn proc_arp_contains(table: &str, addresses: &[String]) -> bool {
    table.lines().skip(1).any(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [ip, _, flags, mac, ..] => {
                addresses.iter().any(|a| a == ip)
                    && *flags != "0x0"
                    && *mac != "00:00:00:00:00:00"
            }
            _ => false,
        }
    })
}

/// `192.168.1.1 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE`
fn ip_neigh_contains(output: &str, addresses: &[String]) -> bool {
    output.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let Some(ip) = fields.next() else {
            return false;
        };
        addresses.iter().any(|a| a == ip)
            && line.contains("lladdr")
            && !line.contains("FAILED")
            && !line.contains("INCOMPLETE")
    })
}

/// `? (192.168.1.1) at aa:bb:cc:dd:ee:ff on en0 ...`
fn arp_a_contains(output: &str, addresses: &[String]) -> bool {
    output.lines().any(|line| {
        let lower = line.to_lowercase();
        if lower.contains("incomplete") {
            return false;
        }
        line.split_whitespace()
            .map(|token| token.trim_matches(|c| c == '(' || c == ')'))
            .any(|token| addresses.iter().any(|a| a == token))
    })
}
