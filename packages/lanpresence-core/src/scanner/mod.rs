//! Network sweep.
//!
//! One sweep cycle: figure out the local subnet for the configured
//! interface, probe every usable host with bounded parallelism,
//! resolve the responders' hardware addresses and package the result
//! as presence reports for the reconciliation side.

pub mod arp;
pub mod ping;
pub mod vendor;

pub use arp::{NeighborTableResolver, Resolver};
pub use ping::{Prober, SweepOptions, SystemPingProber, TcpConnectProber};

use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One observed (network, device) pairing, the wire unit between the
/// sweep side and the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceReport {
    pub network_ssid: String,
    pub device_mac_addr: String,
    pub device_ipv4_addr: String,
}

/// Local addressing of the interface a sweep runs on.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub interface: String,
    pub subnet: Ipv4Network,
    pub local_ip: Ipv4Addr,
}

/// Which probe implementation a sweep uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Icmp,
    /// TCP connect against the given port, for links that filter ICMP.
    Tcp(u16),
}

impl ProbeMethod {
    fn prober(self) -> Arc<dyn Prober> {
        match self {
            ProbeMethod::Icmp => Arc::new(SystemPingProber),
            ProbeMethod::Tcp(port) => Arc::new(TcpConnectProber { port }),
        }
    }
}

/// Run one full sweep cycle for `ssid` on `interface`.
///
/// Per-host failures (probe timeouts, unresolvable MACs) are absorbed
/// and logged; the only fatal outcome is failing to determine the
/// interface's subnet in the first place.
pub async fn run_cycle(
    ssid: &str,
    interface: &str,
    method: ProbeMethod,
    options: &SweepOptions,
) -> Result<Vec<PresenceReport>> {
    let start = Instant::now();

    let info = interface_info(interface)
        .await
        .with_context(|| format!("failed to determine subnet for interface `{interface}`"))?;
    tracing::info!(
        "Sweeping {} on {} (local ip {}, ssid `{}`)",
        info.subnet,
        info.interface,
        info.local_ip,
        ssid
    );

    let exclude: HashSet<Ipv4Addr> = [info.local_ip].into_iter().collect();
    let responding = ping::probe_sweep(info.subnet, &exclude, method.prober(), options).await;

    let reports = resolve_and_report(
        ssid,
        &responding,
        &NeighborTableResolver,
        arp::DEFAULT_RESOLVE_TIMEOUT,
    )
    .await;

    tracing::info!(
        "Cycle complete: {} reports from {} responders in {:.1}s",
        reports.len(),
        responding.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(reports)
}

/// Resolve each responder's hardware address and assemble the cycle's
/// report batch. Responders that stay unresolved are dropped: without
/// a hardware identity the host cannot be correlated to a device.
async fn resolve_and_report(
    ssid: &str,
    responding: &[Ipv4Addr],
    resolver: &dyn Resolver,
    timeout: Duration,
) -> Vec<PresenceReport> {
    let resolved = arp::resolve_many(resolver, responding, timeout).await;

    let mut reports = Vec::with_capacity(resolved.len());
    for (ip, mac) in resolved {
        match mac {
            Some(mac) => reports.push(PresenceReport {
                network_ssid: ssid.to_string(),
                device_mac_addr: mac,
                device_ipv4_addr: ip.to_string(),
            }),
            None => tracing::debug!("Dropping {}: hardware address unresolved", ip),
        }
    }
    reports
}

/// Determine the IPv4 subnet and address of a named interface.
pub async fn interface_info(interface: &str) -> Result<InterfaceInfo> {
    let interface = interface.to_string();
    tokio::task::spawn_blocking(move || {
        #[cfg(target_os = "linux")]
        {
            let output = Command::new("ip")
                .args(["-4", "addr", "show", "dev", &interface])
                .output()
                .context("failed to run `ip addr`")?;
            let stdout = String::from_utf8_lossy(&output.stdout);
            let (subnet, local_ip) = parse_linux_addr_output(&stdout)
                .with_context(|| format!("no usable IPv4 address on `{interface}`"))?;
            Ok(InterfaceInfo {
                interface,
                subnet,
                local_ip,
            })
        }

        #[cfg(target_os = "macos")]
        {
            let output = Command::new("ifconfig")
                .arg(&interface)
                .output()
                .context("failed to run ifconfig")?;
            let stdout = String::from_utf8_lossy(&output.stdout);
            let (subnet, local_ip) = parse_macos_ifconfig_output(&stdout)
                .with_context(|| format!("no usable IPv4 address on `{interface}`"))?;
            Ok(InterfaceInfo {
                interface,
                subnet,
                local_ip,
            })
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            let _ = interface;
            Err(anyhow::anyhow!("unsupported platform"))
        }
    })
    .await
    .context("interface lookup task panicked")?
}

/// Parse `ip -4 addr show dev <iface>` output and return the
/// interface's subnet plus its own address.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_linux_addr_output(output: &str) -> Option<(Ipv4Network, Ipv4Addr)> {
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with("inet ") || trimmed.contains("127.0.0.1") {
            continue;
        }
        if let Some(cidr) = trimmed.split_whitespace().nth(1) {
            if let Ok(with_host) = cidr.parse::<Ipv4Network>() {
                let local_ip = with_host.ip();
                let subnet = Ipv4Network::new(with_host.network(), with_host.prefix()).ok()?;
                return Some((subnet, local_ip));
            }
        }
    }
    None
}

/// Parse `ifconfig <iface>` output on macOS
/// (`inet 192.168.1.10 netmask 0xffffff00 broadcast ...`).
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_macos_ifconfig_output(output: &str) -> Option<(Ipv4Network, Ipv4Addr)> {
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with("inet ") || trimmed.contains("127.0.0.1") {
            continue;
        }
        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        let ip: Ipv4Addr = parts.get(1)?.parse().ok()?;
        let mask_pos = parts.iter().position(|w| *w == "netmask")?;
        let mask_word = parts.get(mask_pos + 1)?;
        let mask = u32::from_str_radix(mask_word.trim_start_matches("0x"), 16).ok()?;
        let prefix = mask.count_ones() as u8;
        let network = Ipv4Addr::from(u32::from(ip) & mask);
        let subnet = Ipv4Network::new(network, prefix).ok()?;
        return Some((subnet, ip));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Resolver with a fixed table; everything else stays unresolved.
    struct TableResolver {
        known: HashMap<Ipv4Addr, String>,
    }

    #[async_trait]
    impl Resolver for TableResolver {
        async fn resolve(&self, ip: Ipv4Addr, _timeout: Duration) -> Option<String> {
            self.known.get(&ip).cloned()
        }
    }

    #[tokio::test]
    async fn unresolved_responders_are_dropped_from_the_batch() {
        let resolver = TableResolver {
            known: [(
                "192.168.1.42".parse().unwrap(),
                "AA:BB:CC:DD:EE:FF".to_string(),
            )]
            .into_iter()
            .collect(),
        };
        let responding: Vec<Ipv4Addr> = vec![
            "192.168.1.42".parse().unwrap(),
            "192.168.1.43".parse().unwrap(),
        ];

        let reports =
            resolve_and_report("Home", &responding, &resolver, Duration::from_secs(1)).await;

        assert_eq!(
            reports,
            vec![PresenceReport {
                network_ssid: "Home".to_string(),
                device_mac_addr: "AA:BB:CC:DD:EE:FF".to_string(),
                device_ipv4_addr: "192.168.1.42".to_string(),
            }]
        );
    }

    #[test]
    fn parses_linux_ip_addr_output() {
        let output = "\
2: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP group default qlen 1000
    inet 192.168.1.10/24 brd 192.168.1.255 scope global dynamic noprefixroute wlan0
       valid_lft 85676sec preferred_lft 85676sec
";
        let (subnet, local_ip) = parse_linux_addr_output(output).unwrap();
        assert_eq!(subnet.to_string(), "192.168.1.0/24");
        assert_eq!(local_ip, "192.168.1.10".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn linux_parser_skips_loopback() {
        let output = "    inet 127.0.0.1/8 scope host lo\n";
        assert!(parse_linux_addr_output(output).is_none());
        assert!(parse_linux_addr_output("").is_none());
    }

    #[test]
    fn parses_macos_ifconfig_output() {
        let output = "\
en0: flags=8863<UP,BROADCAST,SMART,RUNNING,SIMPLEX,MULTICAST> mtu 1500
	inet 192.168.1.10 netmask 0xffffff00 broadcast 192.168.1.255
";
        let (subnet, local_ip) = parse_macos_ifconfig_output(output).unwrap();
        assert_eq!(subnet.to_string(), "192.168.1.0/24");
        assert_eq!(local_ip, "192.168.1.10".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn report_wire_format_matches_collector_contract() {
        let report = PresenceReport {
            network_ssid: "Home".to_string(),
            device_mac_addr: "AA:BB:CC:DD:EE:FF".to_string(),
            device_ipv4_addr: "192.168.1.42".to_string(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "network_ssid": "Home",
                "device_mac_addr": "AA:BB:CC:DD:EE:FF",
                "device_ipv4_addr": "192.168.1.42",
            })
        );
    }
}
