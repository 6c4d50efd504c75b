//! Reachability probing with bounded parallelism.
//!
//! One probe task per candidate address, dispatched onto a pool whose
//! size is capped by a semaphore; each task retries a few times
//! before giving up on its address. A bad host can only ever fail its
//! own task, never the sweep.

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// A single reachability check against one address. Implementations
/// must swallow transport errors and report them as "not reachable".
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: Ipv4Addr, timeout: Duration) -> bool;
}

/// Sweep tuning knobs. Defaults match the agent's production
/// behavior: three pings per host, a second apart, two-second
/// timeout, a hundred hosts in flight.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// Probes per address; one acknowledged probe marks the address
    /// reachable.
    pub count: u32,
    /// Upper bound for a single probe.
    pub timeout: Duration,
    /// Spacing between probes to the same address.
    pub interval: Duration,
    /// Maximum number of in-flight probe tasks.
    pub concurrency: usize,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            count: 3,
            timeout: Duration::from_secs(2),
            interval: Duration::from_secs(1),
            concurrency: 100,
        }
    }
}

/// Enumerate the usable host addresses of `subnet`: everything except
/// the network address, the broadcast address and the explicit
/// exclusions (normally the sweeping host itself).
pub fn usable_hosts(subnet: Ipv4Network, exclude: &HashSet<Ipv4Addr>) -> Vec<Ipv4Addr> {
    let network = subnet.network();
    let broadcast = subnet.broadcast();
    subnet
        .iter()
        .filter(|ip| *ip != network && *ip != broadcast && !exclude.contains(ip))
        .collect()
}

/// Probe every usable host of `subnet` and return the reachable ones.
/// Blocks until every probe task has finished; there is no partial
/// result.
pub async fn probe_sweep(
    subnet: Ipv4Network,
    exclude: &HashSet<Ipv4Addr>,
    prober: Arc<dyn Prober>,
    options: &SweepOptions,
) -> Vec<Ipv4Addr> {
    let targets = usable_hosts(subnet, exclude);
    tracing::info!(
        "Probing {} hosts in {} (excluding {})",
        targets.len(),
        subnet,
        exclude.len() + 2
    );

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut tasks = Vec::with_capacity(targets.len());

    for target in targets {
        let semaphore = semaphore.clone();
        let prober = prober.clone();
        let count = options.count.max(1);
        let timeout = options.timeout;
        let interval = options.interval;

        tasks.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return None;
            };
            for attempt in 0..count {
                if prober.probe(target, timeout).await {
                    return Some(target);
                }
                if attempt + 1 < count {
                    tokio::time::sleep(interval).await;
                }
            }
            None
        }));
    }

    let mut responding = Vec::new();
    for task in tasks {
        // A panicked probe task counts as a miss for its address only.
        if let Ok(Some(ip)) = task.await {
            responding.push(ip);
        }
    }

    responding.sort_unstable();
    tracing::info!("{} hosts responded", responding.len());
    responding
}

/// ICMP probe via the system `ping` binary, so the agent needs no raw
/// socket privileges.
#[derive(Debug, Default)]
pub struct SystemPingProber;

#[async_trait]
impl Prober for SystemPingProber {
    async fn probe(&self, target: Ipv4Addr, timeout: Duration) -> bool {
        let timeout_secs = timeout.as_secs().max(1).to_string();
        let result = tokio::task::spawn_blocking(move || {
            #[cfg(any(target_os = "linux", target_os = "macos"))]
            let output = Command::new("ping")
                .args(["-c", "1", "-W", &timeout_secs, &target.to_string()])
                .output();

            #[cfg(not(any(target_os = "linux", target_os = "macos")))]
            let output: std::io::Result<std::process::Output> = {
                let _ = &timeout_secs;
                Err(std::io::Error::other("unsupported platform"))
            };

            match output {
                Ok(output) => output.status.success(),
                // Failure to even spawn ping is a miss, not a sweep error.
                Err(_) => false,
            }
        })
        .await;

        result.unwrap_or(false)
    }
}

/// TCP connect probe for hosts that drop ICMP: reachable when the
/// connect attempt finishes within the timeout, whether accepted or
/// refused (a refusal still proves the host is up).
#[derive(Debug)]
pub struct TcpConnectProber {
    pub port: u16,
}

#[async_trait]
impl Prober for TcpConnectProber {
    async fn probe(&self, target: Ipv4Addr, timeout: Duration) -> bool {
        use std::io::ErrorKind;

        let addr = std::net::SocketAddr::from((target, self.port));
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => e.kind() == ErrorKind::ConnectionRefused,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Prober that records how many probes run concurrently.
    struct CountingProber {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        respond: HashSet<Ipv4Addr>,
    }

    impl CountingProber {
        fn new(respond: impl IntoIterator<Item = Ipv4Addr>) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                respond: respond.into_iter().collect(),
            }
        }
    }

    #[async_trait]
    impl Prober for CountingProber {
        async fn probe(&self, target: Ipv4Addr, _timeout: Duration) -> bool {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.respond.contains(&target)
        }
    }

    fn subnet(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn usable_hosts_skips_network_broadcast_and_exclusions() {
        let exclude: HashSet<Ipv4Addr> = ["192.168.1.3".parse().unwrap()].into_iter().collect();
        let hosts = usable_hosts(subnet("192.168.1.0/29"), &exclude);
        let expected: Vec<Ipv4Addr> = ["192.168.1.1", "192.168.1.2", "192.168.1.4", "192.168.1.5", "192.168.1.6"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(hosts, expected);
    }

    #[test]
    fn usable_hosts_of_full_subnet() {
        let hosts = usable_hosts(subnet("192.168.1.0/24"), &HashSet::new());
        assert_eq!(hosts.len(), 254);
        assert!(!hosts.contains(&"192.168.1.0".parse().unwrap()));
        assert!(!hosts.contains(&"192.168.1.255".parse().unwrap()));
    }

    #[tokio::test]
    async fn concurrency_stays_within_bound() {
        let responders: Vec<Ipv4Addr> = (1..=50).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();
        let prober = Arc::new(CountingProber::new(responders));
        let options = SweepOptions {
            count: 1,
            concurrency: 5,
            ..SweepOptions::default()
        };

        let responding = probe_sweep(subnet("10.0.0.0/24"), &HashSet::new(), prober.clone(), &options).await;

        assert_eq!(responding.len(), 50);
        let max = prober.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 5, "observed {max} in-flight probes");
        assert!(max > 1, "pool never ran in parallel");
    }

    #[tokio::test]
    async fn only_responding_hosts_are_reported() {
        let prober = Arc::new(CountingProber::new([
            Ipv4Addr::new(192, 168, 1, 42),
            Ipv4Addr::new(192, 168, 1, 7),
        ]));
        let options = SweepOptions {
            count: 1,
            concurrency: 16,
            ..SweepOptions::default()
        };

        let responding =
            probe_sweep(subnet("192.168.1.0/24"), &HashSet::new(), prober, &options).await;
        let expected: Vec<Ipv4Addr> =
            vec!["192.168.1.7".parse().unwrap(), "192.168.1.42".parse().unwrap()];
        assert_eq!(responding, expected);
    }

    /// Prober that only answers on its n-th attempt per address.
    struct FlakyProber {
        attempts: AtomicUsize,
        succeed_on: usize,
    }

    #[async_trait]
    impl Prober for FlakyProber {
        async fn probe(&self, _target: Ipv4Addr, _timeout: Duration) -> bool {
            self.attempts.fetch_add(1, Ordering::SeqCst) + 1 >= self.succeed_on
        }
    }

    #[tokio::test]
    async fn retries_within_one_task() {
        let prober = Arc::new(FlakyProber {
            attempts: AtomicUsize::new(0),
            succeed_on: 2,
        });
        let options = SweepOptions {
            count: 2,
            interval: Duration::from_millis(1),
            concurrency: 1,
            ..SweepOptions::default()
        };

        let responding =
            probe_sweep(subnet("10.0.0.0/30"), &HashSet::new(), prober, &options).await;
        // /30 has two usable hosts; the first misses once then hits on
        // its retry, the second hits immediately.
        assert_eq!(responding.len(), 2);
    }
}
