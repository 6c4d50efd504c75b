//! Session reconciliation.
//!
//! One call per network per sweep cycle. The input is the set of
//! devices seen on the network this cycle and the cycle timestamp;
//! the output is the list of session transitions the cycle caused.

use super::{
    Device, DeviceClass, ProbePreference, Session, SessionStatus, Tracker, TrackerError,
    DEFAULT_MISSED_PINGS_THRESHOLD,
};
use crate::scanner::vendor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// A device observed on a network during one sweep cycle. The MAC is
/// expected to be normalized already (ingestion does that).
#[derive(Debug, Clone)]
pub struct SeenDevice {
    pub mac: String,
    pub ipv4: Ipv4Addr,
}

/// A session transition caused by one reconcile call. Matched
/// exhaustively by the notification side; a missed heartbeat that
/// stays under the threshold deliberately has no variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresenceChange {
    SessionOpened {
        mac: String,
        ssid: String,
        at: DateTime<Utc>,
    },
    SessionClosed {
        mac: String,
        ssid: String,
        at: DateTime<Utc>,
        /// True when the close was forced by the device surfacing on
        /// another network, false when it timed out past its
        /// missed-pings threshold.
        forced: bool,
    },
}

impl PresenceChange {
    pub fn mac(&self) -> &str {
        match self {
            PresenceChange::SessionOpened { mac, .. } => mac,
            PresenceChange::SessionClosed { mac, .. } => mac,
        }
    }
}

impl Tracker {
    /// Reconcile one network against the devices seen on it this
    /// cycle.
    ///
    /// Cycles are processed one network at a time, never interleaved;
    /// when a device shows up in two networks' batches of the same
    /// pass, the cycle reconciled last wins because its `observed_at`
    /// is the most recent confirmation. Replaying the same
    /// `observed_at` for the same network is a no-op for the
    /// missed-ping counters, which makes the call idempotent within a
    /// cycle.
    pub fn reconcile(
        &mut self,
        ssid: &str,
        seen: &[SeenDevice],
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<PresenceChange>, TrackerError> {
        if self.network(ssid).is_none() {
            return Err(TrackerError::UnknownNetwork(ssid.to_string()));
        }

        let mut changes = Vec::new();
        let seen_macs: HashSet<&str> = seen.iter().map(|d| d.mac.as_str()).collect();

        // 1. Upsert every seen device and refresh its address.
        for observed in seen {
            self.upsert_device(observed, observed_at);
            if let Some(network) = self.networks_mut().get_mut(ssid) {
                network.known_devices.insert(observed.mac.clone());
            }
        }

        // 2. A device cannot be on two networks at once: force-close
        //    active sessions that the new observation supersedes.
        for observed in seen {
            for session in self
                .sessions_mut()
                .iter_mut()
                .filter(|s| s.is_active() && s.mac == observed.mac && s.ssid != ssid)
            {
                session.status = SessionStatus::ClosedForcibly;
                session.end = Some(observed_at);
                tracing::info!(
                    "Force-closed session of {} on `{}` (now seen on `{}`)",
                    session.mac,
                    session.ssid,
                    ssid
                );
                changes.push(PresenceChange::SessionClosed {
                    mac: session.mac.clone(),
                    ssid: session.ssid.clone(),
                    at: observed_at,
                    forced: true,
                });
            }
        }

        // 3. Open sessions for newly present devices.
        for observed in seen {
            let has_active = self
                .sessions()
                .iter()
                .any(|s| s.is_active() && s.mac == observed.mac && s.ssid == ssid);
            if !has_active {
                self.sessions_mut().push(Session {
                    ssid: ssid.to_string(),
                    mac: observed.mac.clone(),
                    status: SessionStatus::Active,
                    start: observed_at,
                    end: None,
                });
                tracing::info!("Opened session for {} on `{}`", observed.mac, ssid);
                changes.push(PresenceChange::SessionOpened {
                    mac: observed.mac.clone(),
                    ssid: ssid.to_string(),
                    at: observed_at,
                });
            }
        }

        // 4 + 5. Heartbeat bookkeeping, skipped when this exact cycle
        //    was already counted.
        let already_counted = self
            .network(ssid)
            .and_then(|n| n.last_reconciled_at)
            .is_some_and(|at| at == observed_at);

        if !already_counted {
            let mut timed_out: Vec<String> = Vec::new();

            let session_macs: Vec<String> = self
                .sessions()
                .iter()
                .filter(|s| s.is_active() && s.ssid == ssid)
                .map(|s| s.mac.clone())
                .collect();

            for mac in session_macs {
                let Some(device) = self.devices_mut().get_mut(&mac) else {
                    continue;
                };
                if seen_macs.contains(mac.as_str()) {
                    device.missed_pings = 0;
                } else {
                    device.missed_pings += 1;
                    tracing::debug!(
                        "{} missed a heartbeat on `{}` ({}/{})",
                        mac,
                        ssid,
                        device.missed_pings,
                        device.missed_pings_threshold
                    );
                }
                device.last_modified = observed_at;

                if device.missed_pings > device.missed_pings_threshold {
                    device.missed_pings = 0;
                    timed_out.push(mac);
                }
            }

            for mac in timed_out {
                if let Some(session) = self
                    .sessions_mut()
                    .iter_mut()
                    .find(|s| s.is_active() && s.ssid == ssid && s.mac == mac)
                {
                    session.status = SessionStatus::Closed;
                    session.end = Some(observed_at);
                    tracing::info!("Closed session of {} on `{}` (missed too many pings)", mac, ssid);
                    changes.push(PresenceChange::SessionClosed {
                        mac,
                        ssid: ssid.to_string(),
                        at: observed_at,
                        forced: false,
                    });
                }
            }
        }

        if let Some(network) = self.networks_mut().get_mut(ssid) {
            network.last_reconciled_at = Some(observed_at);
        }

        Ok(changes)
    }

    /// Create the device on first sighting, refresh its address on
    /// every later one. New devices get their class guessed from the
    /// MAC OUI.
    fn upsert_device(&mut self, observed: &SeenDevice, observed_at: DateTime<Utc>) {
        if let Some(device) = self.devices_mut().get_mut(&observed.mac) {
            if device.ipv4 != observed.ipv4 {
                tracing::debug!(
                    "Device {} moved from {} to {}",
                    observed.mac,
                    device.ipv4,
                    observed.ipv4
                );
                device.ipv4 = observed.ipv4;
            }
            device.last_modified = observed_at;
            return;
        }

        let class = vendor::lookup_vendor(&observed.mac)
            .as_deref()
            .and_then(vendor::infer_class)
            .unwrap_or(DeviceClass::Unknown);

        tracing::info!(
            "New device {} at {} (class: {:?})",
            observed.mac,
            observed.ipv4,
            class
        );
        self.devices_mut().insert(
            observed.mac.clone(),
            Device {
                mac: observed.mac.clone(),
                ipv4: observed.ipv4,
                name: String::new(),
                class,
                probe: ProbePreference::Icmp,
                missed_pings: 0,
                missed_pings_threshold: DEFAULT_MISSED_PINGS_THRESHOLD,
                last_modified: observed_at,
            },
        );
    }

    /// Test/debug helper: true when no device holds more than one
    /// active session, across all networks.
    pub fn single_active_session_invariant_holds(&self) -> bool {
        let mut active: HashSet<&str> = HashSet::new();
        self.sessions()
            .iter()
            .filter(|s| s.is_active())
            .all(|s| active.insert(s.mac.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Medium;
    use chrono::Duration;

    fn seen(mac: &str, ip: &str) -> SeenDevice {
        SeenDevice {
            mac: mac.to_string(),
            ipv4: ip.parse().unwrap(),
        }
    }

    fn tracker_with(networks: &[&str]) -> Tracker {
        let mut tracker = Tracker::new();
        for ssid in networks {
            tracker.register_network(ssid, "", Medium::Wifi).unwrap();
        }
        tracker
    }

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    #[test]
    fn first_sighting_creates_device_and_opens_session() {
        let mut tracker = tracker_with(&["Home"]);
        let now = Utc::now();

        let changes = tracker
            .reconcile("Home", &[seen(MAC, "192.168.1.42")], now)
            .unwrap();

        assert_eq!(
            changes,
            vec![PresenceChange::SessionOpened {
                mac: MAC.to_string(),
                ssid: "Home".to_string(),
                at: now,
            }]
        );
        let session = tracker.active_session(MAC).unwrap();
        assert_eq!(session.start, now);
        assert_eq!(session.end, None);
        assert!(tracker.network("Home").unwrap().known_devices.contains(MAC));
    }

    #[test]
    fn unknown_network_is_a_hard_error() {
        let mut tracker = Tracker::new();
        let err = tracker
            .reconcile("Nowhere", &[seen(MAC, "192.168.1.42")], Utc::now())
            .unwrap_err();
        assert!(matches!(err, TrackerError::UnknownNetwork(_)));
    }

    #[test]
    fn replaying_the_same_cycle_is_idempotent() {
        let mut tracker = tracker_with(&["Home"]);
        let t0 = Utc::now();
        tracker
            .reconcile("Home", &[seen(MAC, "192.168.1.42")], t0)
            .unwrap();

        // One later cycle where the device goes quiet.
        let t1 = t0 + Duration::seconds(120);
        let changes = tracker.reconcile("Home", &[], t1).unwrap();
        assert!(changes.is_empty());
        assert_eq!(tracker.device(MAC).unwrap().missed_pings, 1);

        // Replaying t1 must not count the miss twice nor emit anything.
        let replay = tracker.reconcile("Home", &[], t1).unwrap();
        assert!(replay.is_empty());
        assert_eq!(tracker.device(MAC).unwrap().missed_pings, 1);
        assert_eq!(tracker.sessions().len(), 1);
    }

    #[test]
    fn session_closes_when_counter_exceeds_threshold() {
        let mut tracker = tracker_with(&["Home"]);
        let t0 = Utc::now();
        tracker
            .reconcile("Home", &[seen(MAC, "192.168.1.42")], t0)
            .unwrap();
        assert_eq!(tracker.device(MAC).unwrap().missed_pings_threshold, 2);

        // Two misses: counter reaches the threshold, session stays open.
        let t1 = t0 + Duration::seconds(120);
        assert!(tracker.reconcile("Home", &[], t1).unwrap().is_empty());
        let t2 = t0 + Duration::seconds(240);
        assert!(tracker.reconcile("Home", &[], t2).unwrap().is_empty());
        assert_eq!(tracker.device(MAC).unwrap().missed_pings, 2);
        assert!(tracker.active_session(MAC).is_some());

        // Third miss: counter becomes 3 and the session closes.
        let t3 = t0 + Duration::seconds(360);
        let changes = tracker.reconcile("Home", &[], t3).unwrap();
        assert_eq!(
            changes,
            vec![PresenceChange::SessionClosed {
                mac: MAC.to_string(),
                ssid: "Home".to_string(),
                at: t3,
                forced: false,
            }]
        );
        assert!(tracker.active_session(MAC).is_none());
        // Counter resets once the session is closed.
        assert_eq!(tracker.device(MAC).unwrap().missed_pings, 0);
        let session = &tracker.sessions()[0];
        assert_eq!(session.status, SessionStatus::Closed);
        assert_eq!(session.end, Some(t3));
    }

    #[test]
    fn reappearing_device_resets_the_counter() {
        let mut tracker = tracker_with(&["Home"]);
        let t0 = Utc::now();
        tracker
            .reconcile("Home", &[seen(MAC, "192.168.1.42")], t0)
            .unwrap();

        let t1 = t0 + Duration::seconds(120);
        tracker.reconcile("Home", &[], t1).unwrap();
        let t2 = t0 + Duration::seconds(240);
        tracker.reconcile("Home", &[], t2).unwrap();
        assert_eq!(tracker.device(MAC).unwrap().missed_pings, 2);

        let t3 = t0 + Duration::seconds(360);
        let changes = tracker
            .reconcile("Home", &[seen(MAC, "192.168.1.42")], t3)
            .unwrap();
        assert!(changes.is_empty(), "the session was already open");
        assert_eq!(tracker.device(MAC).unwrap().missed_pings, 0);
        assert!(tracker.active_session(MAC).is_some());
    }

    #[test]
    fn roaming_closes_forcibly_and_reopens() {
        let mut tracker = tracker_with(&["Home", "Office"]);
        let t0 = Utc::now();
        tracker
            .reconcile("Home", &[seen(MAC, "192.168.1.42")], t0)
            .unwrap();

        let t1 = t0 + Duration::seconds(120);
        let changes = tracker
            .reconcile("Office", &[seen(MAC, "10.0.0.7")], t1)
            .unwrap();

        assert_eq!(
            changes,
            vec![
                PresenceChange::SessionClosed {
                    mac: MAC.to_string(),
                    ssid: "Home".to_string(),
                    at: t1,
                    forced: true,
                },
                PresenceChange::SessionOpened {
                    mac: MAC.to_string(),
                    ssid: "Office".to_string(),
                    at: t1,
                },
            ]
        );

        let home_session = tracker
            .sessions()
            .iter()
            .find(|s| s.ssid == "Home")
            .unwrap();
        assert_eq!(home_session.status, SessionStatus::ClosedForcibly);
        assert_eq!(home_session.end, Some(t1));

        let active = tracker.active_session(MAC).unwrap();
        assert_eq!(active.ssid, "Office");
        assert_eq!(active.start, t1);
        assert_eq!(tracker.device(MAC).unwrap().ipv4, "10.0.0.7".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn at_most_one_active_session_per_device() {
        let mut tracker = tracker_with(&["Home", "Office", "Lab"]);
        let mut at = Utc::now();

        // Bounce the device across networks, with a second device in
        // the mix, and check the invariant after every cycle.
        let hops = [
            ("Home", "192.168.1.42"),
            ("Office", "10.0.0.7"),
            ("Office", "10.0.0.7"),
            ("Lab", "172.16.0.9"),
            ("Home", "192.168.1.42"),
        ];
        for (ssid, ip) in hops {
            at += Duration::seconds(120);
            let batch = vec![seen(MAC, ip), seen("11:22:33:44:55:66", "192.168.1.77")];
            let batch = if ssid == "Home" {
                batch
            } else {
                vec![batch[0].clone()]
            };
            tracker.reconcile(ssid, &batch, at).unwrap();
            assert!(tracker.single_active_session_invariant_holds());
        }
    }

    #[test]
    fn missed_heartbeat_alone_emits_no_change() {
        let mut tracker = tracker_with(&["Home"]);
        let t0 = Utc::now();
        tracker
            .reconcile("Home", &[seen(MAC, "192.168.1.42")], t0)
            .unwrap();

        let t1 = t0 + Duration::seconds(120);
        let changes = tracker.reconcile("Home", &[], t1).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn ip_change_updates_device_record() {
        let mut tracker = tracker_with(&["Home"]);
        let t0 = Utc::now();
        tracker
            .reconcile("Home", &[seen(MAC, "192.168.1.42")], t0)
            .unwrap();

        let t1 = t0 + Duration::seconds(120);
        tracker
            .reconcile("Home", &[seen(MAC, "192.168.1.99")], t1)
            .unwrap();
        let device = tracker.device(MAC).unwrap();
        assert_eq!(device.ipv4, "192.168.1.99".parse::<Ipv4Addr>().unwrap());
        assert_eq!(device.last_modified, t1);
    }
}
