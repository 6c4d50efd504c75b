//! Hardware address resolution.
//!
//! `resolve_mac` answers "which MAC owns this IP" for hosts on the
//! local link. Sending any datagram at the target makes the kernel
//! run the ARP broadcast exchange; we then read the answer out of the
//! neighbour table (`ip neigh` on Linux, `arp -n` on macOS). Only the
//! first usable answer matters, and a missing answer is an expected
//! outcome, not an error.

use super::vendor::normalize_mac;
use async_trait::async_trait;
use futures::future::join_all;
use std::net::Ipv4Addr;
use std::process::Command;
use std::time::Duration;
use tokio::time::Instant;

/// Default time to wait for the ARP exchange to settle.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Answers "which MAC owns this IP". A missing answer is an expected
/// outcome, not an error; implementations must never fail the sweep.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, ip: Ipv4Addr, timeout: Duration) -> Option<String>;
}

/// Resolver backed by the kernel neighbour table.
#[derive(Debug, Default)]
pub struct NeighborTableResolver;

#[async_trait]
impl Resolver for NeighborTableResolver {
    async fn resolve(&self, ip: Ipv4Addr, timeout: Duration) -> Option<String> {
        resolve_mac(ip, timeout).await
    }
}

/// Resolve `ip` to its hardware address, waiting up to `timeout`.
/// Returns `None` when no reply arrived in time - unreachable hosts
/// and hosts that ignore ARP both end up here.
pub async fn resolve_mac(ip: Ipv4Addr, timeout: Duration) -> Option<String> {
    nudge(ip).await;

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(mac) = query_neighbor_table(ip).await {
            return Some(mac);
        }
        if Instant::now() + POLL_INTERVAL > deadline {
            tracing::debug!("No ARP entry for {} within {:?}", ip, timeout);
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Resolve a batch of addresses with moderate parallelism (the
/// entries are usually already cached after a sweep, so this is
/// cheap).
pub async fn resolve_many(
    resolver: &dyn Resolver,
    ips: &[Ipv4Addr],
    timeout: Duration,
) -> Vec<(Ipv4Addr, Option<String>)> {
    const BATCH_SIZE: usize = 32;

    let mut results = Vec::with_capacity(ips.len());
    for chunk in ips.chunks(BATCH_SIZE) {
        let futures: Vec<_> = chunk
            .iter()
            .map(|&ip| async move { (ip, resolver.resolve(ip, timeout).await) })
            .collect();
        results.extend(join_all(futures).await);
    }
    results
}

/// Fire a throwaway datagram at the target's discard port so the
/// kernel (re)runs the ARP request broadcast for it.
async fn nudge(ip: Ipv4Addr) {
    if let Ok(socket) = tokio::net::UdpSocket::bind("0.0.0.0:0").await {
        let _ = socket.send_to(&[0u8], (ip, 9)).await;
    }
}

/// Read the neighbour table entry for `ip`, if the kernel has a
/// complete one.
async fn query_neighbor_table(ip: Ipv4Addr) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        #[cfg(target_os = "linux")]
        {
            let output = Command::new("ip")
                .args(["neigh", "show", &ip.to_string()])
                .output()
                .ok()?;
            return parse_ip_neigh_output(&String::from_utf8_lossy(&output.stdout));
        }

        #[cfg(target_os = "macos")]
        {
            let output = Command::new("arp")
                .args(["-n", &ip.to_string()])
                .output()
                .ok()?;
            return parse_arp_output(&String::from_utf8_lossy(&output.stdout));
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            let _ = ip;
            None
        }
    })
    .await
    .ok()
    .flatten()
}

/// Parse `ip neigh show <ip>` output, e.g.
/// `192.168.1.42 dev wlan0 lladdr aa:bb:cc:dd:ee:ff REACHABLE`.
/// Entries without a complete link-layer address (FAILED/INCOMPLETE)
/// yield nothing. Should more than one line match, the first wins.
fn parse_ip_neigh_output(output: &str) -> Option<String> {
    for line in output.lines() {
        if line.contains("FAILED") || line.contains("INCOMPLETE") {
            continue;
        }
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word == "lladdr" {
                if let Some(mac) = words.next().and_then(normalize_mac) {
                    return Some(mac);
                }
            }
        }
    }
    None
}

/// Parse `arp -n <ip>` output on macOS, e.g.
/// `? (192.168.1.42) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]`.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_arp_output(output: &str) -> Option<String> {
    for line in output.lines() {
        if line.contains("(incomplete)") || line.contains("no entry") {
            continue;
        }
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word == "at" {
                if let Some(mac) = words.next().and_then(normalize_mac) {
                    return Some(mac);
                }
            }
        }
    }
    None
}
