//! Device, network and session registry.
//!
//! This is the stateful half of the agent: the sweep side produces
//! presence reports, and everything in here turns those reports into
//! device records, presence sessions and notification fan-out.

mod reconcile;

pub use reconcile::{PresenceChange, SeenDevice};

use crate::scanner::vendor;
use crate::scanner::PresenceReport;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Length of a network join secret.
pub const JOIN_SECRET_LENGTH: usize = 6;

/// Uppercase alphanumerics only, so secrets survive being typed into a chat.
const JOIN_SECRET_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// How many collisions we tolerate before giving up on secret generation.
const JOIN_SECRET_ATTEMPTS: u32 = 100;

/// Default number of consecutive missed sweeps before a session closes.
pub const DEFAULT_MISSED_PINGS_THRESHOLD: u32 = 2;

/// Opaque identifier of a notification channel (chat, webhook, ...).
pub type ChannelId = i64;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("unknown network ssid `{0}` - register it first")]
    UnknownNetwork(String),

    #[error("network `{0}` is already registered")]
    NetworkExists(String),

    #[error("join secret generation exhausted after {0} attempts")]
    JoinSecretExhausted(u32),

    #[error("no network matches the given join secret")]
    UnknownJoinSecret,

    #[error("unknown device `{0}`")]
    UnknownDevice(String),

    #[error("invalid report at index {index}: {reason}")]
    InvalidReport { index: usize, reason: String },
}

/// Rough device category, auto-inferred from the MAC OUI on first
/// sighting and editable by the owner afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Smartphone,
    Tv,
    Tablet,
    Laptop,
    Pc,
    Watch,
    Router,
    Console,
    Unknown,
}

/// How a device prefers to be probed. Exactly one method is active at
/// a time; the enum makes the mutual exclusion structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePreference {
    Icmp,
    TcpConnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Medium {
    Wifi,
    Lan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
    ClosedForcibly,
}

/// A tracked device, keyed by its (normalized) MAC address.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub mac: String,
    pub ipv4: Ipv4Addr,
    pub name: String,
    pub class: DeviceClass,
    pub probe: ProbePreference,
    pub missed_pings: u32,
    pub missed_pings_threshold: u32,
    pub last_modified: DateTime<Utc>,
}

/// A registered network, keyed by its SSID. The SSID is immutable
/// after registration.
#[derive(Debug, Clone)]
pub struct Network {
    pub ssid: String,
    pub join_secret: String,
    pub description: String,
    pub medium: Medium,
    /// Every device ever seen on this network.
    pub known_devices: HashSet<String>,
    /// Timestamp of the last reconciled cycle. Replaying the same
    /// cycle timestamp must not advance the missed-ping counters.
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

/// One continuous presence interval of a device on a network.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub ssid: String,
    pub mac: String,
    pub status: SessionStatus,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Result of a successful network registration.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredNetwork {
    pub ssid: String,
    pub join_secret: String,
}

/// Row returned by [`Tracker::list_active_devices`].
#[derive(Debug, Clone, Serialize)]
pub struct ActiveDevice {
    pub mac: String,
    pub class: DeviceClass,
    pub name: String,
    pub missed_pings: u32,
    pub last_modified: DateTime<Utc>,
}

/// In-memory registry of devices, networks, sessions and
/// subscriptions. All mutation goes through `&mut self`, which gives
/// the single-writer guarantee the reconciler relies on.
#[derive(Debug, Default)]
pub struct Tracker {
    devices: HashMap<String, Device>,
    networks: HashMap<String, Network>,
    sessions: Vec<Session>,
    device_followers: HashMap<String, HashSet<ChannelId>>,
    network_followers: HashMap<String, HashSet<ChannelId>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- registration ----------------------------------------------------

    /// Register a new network and hand back its generated join secret.
    pub fn register_network(
        &mut self,
        ssid: &str,
        description: &str,
        medium: Medium,
    ) -> Result<RegisteredNetwork, TrackerError> {
        if self.networks.contains_key(ssid) {
            return Err(TrackerError::NetworkExists(ssid.to_string()));
        }

        let mut rng = rand::thread_rng();
        let join_secret = generate_secret_with(
            || {
                (0..JOIN_SECRET_LENGTH)
                    .map(|_| JOIN_SECRET_CHARSET[rng.gen_range(0..JOIN_SECRET_CHARSET.len())] as char)
                    .collect()
            },
            |candidate| self.networks.values().any(|n| n.join_secret == candidate),
        )?;

        tracing::info!("Registered network `{}` ({:?})", ssid, medium);

        self.networks.insert(
            ssid.to_string(),
            Network {
                ssid: ssid.to_string(),
                join_secret: join_secret.clone(),
                description: description.to_string(),
                medium,
                known_devices: HashSet::new(),
                last_reconciled_at: None,
            },
        );

        Ok(RegisteredNetwork {
            ssid: ssid.to_string(),
            join_secret,
        })
    }

    /// Delete a network and, atomically with it, every session that
    /// ever belonged to it.
    pub fn remove_network(&mut self, ssid: &str) -> Result<(), TrackerError> {
        if self.networks.remove(ssid).is_none() {
            return Err(TrackerError::UnknownNetwork(ssid.to_string()));
        }
        self.sessions.retain(|s| s.ssid != ssid);
        self.network_followers.remove(ssid);
        tracing::info!("Removed network `{}` and its sessions", ssid);
        Ok(())
    }

    /// Delete a device and, atomically with it, every session that
    /// ever belonged to it.
    pub fn remove_device(&mut self, mac: &str) -> Result<(), TrackerError> {
        let mac = normalize_or_err(mac)?;
        if self.devices.remove(&mac).is_none() {
            return Err(TrackerError::UnknownDevice(mac));
        }
        self.sessions.retain(|s| s.mac != mac);
        self.device_followers.remove(&mac);
        for network in self.networks.values_mut() {
            network.known_devices.remove(&mac);
        }
        tracing::info!("Removed device `{}` and its sessions", mac);
        Ok(())
    }

    // ---- owner edits -----------------------------------------------------

    pub fn rename_device(&mut self, mac: &str, name: &str) -> Result<(), TrackerError> {
        let device = self.device_mut(mac)?;
        device.name = name.to_string();
        device.last_modified = Utc::now();
        Ok(())
    }

    pub fn set_device_class(&mut self, mac: &str, class: DeviceClass) -> Result<(), TrackerError> {
        let device = self.device_mut(mac)?;
        device.class = class;
        device.last_modified = Utc::now();
        Ok(())
    }

    pub fn set_probe_preference(
        &mut self,
        mac: &str,
        probe: ProbePreference,
    ) -> Result<(), TrackerError> {
        let device = self.device_mut(mac)?;
        device.probe = probe;
        device.last_modified = Utc::now();
        Ok(())
    }

    pub fn set_missed_pings_threshold(
        &mut self,
        mac: &str,
        threshold: u32,
    ) -> Result<(), TrackerError> {
        let device = self.device_mut(mac)?;
        device.missed_pings_threshold = threshold;
        device.last_modified = Utc::now();
        Ok(())
    }

    // ---- subscriptions ---------------------------------------------------

    /// Subscribe a channel to a network. The join secret, not the
    /// SSID, is the capability here.
    pub fn subscribe_network(
        &mut self,
        channel: ChannelId,
        join_secret: &str,
    ) -> Result<String, TrackerError> {
        let ssid = self
            .networks
            .values()
            .find(|n| n.join_secret == join_secret)
            .map(|n| n.ssid.clone())
            .ok_or(TrackerError::UnknownJoinSecret)?;

        self.network_followers
            .entry(ssid.clone())
            .or_default()
            .insert(channel);
        tracing::info!("Channel {} subscribed to network `{}`", channel, ssid);
        Ok(ssid)
    }

    /// Follow or unfollow a single device.
    pub fn follow_device(
        &mut self,
        channel: ChannelId,
        mac: &str,
        follow: bool,
    ) -> Result<(), TrackerError> {
        let mac = normalize_or_err(mac)?;
        if !self.devices.contains_key(&mac) {
            return Err(TrackerError::UnknownDevice(mac));
        }
        let followers = self.device_followers.entry(mac).or_default();
        if follow {
            followers.insert(channel);
        } else {
            followers.remove(&channel);
        }
        Ok(())
    }

    /// Channels that should be pinged for this cycle's changes: every
    /// follower of a changed device, plus every subscriber of the
    /// swept network (when anything changed at all).
    pub fn notification_targets(&self, ssid: &str, changes: &[PresenceChange]) -> Vec<ChannelId> {
        if changes.is_empty() {
            return Vec::new();
        }

        let mut targets: HashSet<ChannelId> = HashSet::new();
        for change in changes {
            if let Some(followers) = self.device_followers.get(change.mac()) {
                targets.extend(followers);
            }
        }
        if let Some(subscribers) = self.network_followers.get(ssid) {
            targets.extend(subscribers);
        }

        let mut targets: Vec<ChannelId> = targets.into_iter().collect();
        targets.sort_unstable();
        targets
    }

    // ---- ingestion -------------------------------------------------------

    /// Accept a batch of presence reports, as produced by the sweep
    /// side. Validation is all-or-nothing: the first malformed entry
    /// rejects the whole batch and no state is touched. An accepted
    /// batch is reconciled one network at a time, in order of first
    /// appearance, each as one cycle stamped with `observed_at`.
    pub fn ingest(
        &mut self,
        batch: &[PresenceReport],
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<PresenceChange>, TrackerError> {
        let mut ssid_order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<SeenDevice>> = HashMap::new();

        for (index, report) in batch.iter().enumerate() {
            let seen = self.parse_report(index, report)?;
            if !self.networks.contains_key(&report.network_ssid) {
                return Err(TrackerError::InvalidReport {
                    index,
                    reason: format!("unknown network ssid `{}`", report.network_ssid),
                });
            }

            if !groups.contains_key(&report.network_ssid) {
                ssid_order.push(report.network_ssid.clone());
            }
            groups
                .entry(report.network_ssid.clone())
                .or_default()
                .push(seen);
        }

        let mut changes = Vec::new();
        for ssid in &ssid_order {
            let seen = &groups[ssid];
            changes.extend(self.reconcile(ssid, seen, observed_at)?);
        }
        Ok(changes)
    }

    /// Accept one network's sweep cycle. Unlike [`Tracker::ingest`],
    /// which derives the networks to reconcile from the reports
    /// themselves, the cycle's network is named explicitly, so an
    /// empty batch is a real observation: nobody answered this cycle,
    /// and the missed-ping bookkeeping still runs. Reports tagged
    /// with another SSID reject the batch.
    pub fn ingest_cycle(
        &mut self,
        ssid: &str,
        batch: &[PresenceReport],
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<PresenceChange>, TrackerError> {
        let mut seen = Vec::with_capacity(batch.len());
        for (index, report) in batch.iter().enumerate() {
            if report.network_ssid != ssid {
                return Err(TrackerError::InvalidReport {
                    index,
                    reason: format!(
                        "report for `{}` in a `{}` cycle",
                        report.network_ssid, ssid
                    ),
                });
            }
            seen.push(self.parse_report(index, report)?);
        }
        self.reconcile(ssid, &seen, observed_at)
    }

    // ---- queries ---------------------------------------------------------

    /// Devices with an active session on `ssid`. Unknown SSIDs are an
    /// error, never a silent empty list.
    pub fn list_active_devices(&self, ssid: &str) -> Result<Vec<ActiveDevice>, TrackerError> {
        if !self.networks.contains_key(ssid) {
            return Err(TrackerError::UnknownNetwork(ssid.to_string()));
        }

        let mut rows: Vec<ActiveDevice> = self
            .sessions
            .iter()
            .filter(|s| s.is_active() && s.ssid == ssid)
            .filter_map(|s| self.devices.get(&s.mac))
            .map(|d| ActiveDevice {
                mac: d.mac.clone(),
                class: d.class,
                name: d.name.clone(),
                missed_pings: d.missed_pings,
                last_modified: d.last_modified,
            })
            .collect();
        rows.sort_by(|a, b| a.mac.cmp(&b.mac));
        Ok(rows)
    }

    pub fn device(&self, mac: &str) -> Option<&Device> {
        self.devices.get(mac)
    }

    pub fn network(&self, ssid: &str) -> Option<&Network> {
        self.networks.get(ssid)
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// The active session of a device, on any network.
    pub fn active_session(&self, mac: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.is_active() && s.mac == mac)
    }

    // ---- internal --------------------------------------------------------

    fn parse_report(
        &self,
        index: usize,
        report: &PresenceReport,
    ) -> Result<SeenDevice, TrackerError> {
        let mac = vendor::normalize_mac(&report.device_mac_addr).ok_or_else(|| {
            TrackerError::InvalidReport {
                index,
                reason: format!("malformed MAC address `{}`", report.device_mac_addr),
            }
        })?;
        let ipv4: Ipv4Addr = report.device_ipv4_addr.parse().map_err(|_| {
            TrackerError::InvalidReport {
                index,
                reason: format!("malformed IPv4 address `{}`", report.device_ipv4_addr),
            }
        })?;
        Ok(SeenDevice { mac, ipv4 })
    }

    fn device_mut(&mut self, mac: &str) -> Result<&mut Device, TrackerError> {
        let mac = normalize_or_err(mac)?;
        self.devices
            .get_mut(&mac)
            .ok_or(TrackerError::UnknownDevice(mac))
    }

    pub(crate) fn devices_mut(&mut self) -> &mut HashMap<String, Device> {
        &mut self.devices
    }

    pub(crate) fn networks_mut(&mut self) -> &mut HashMap<String, Network> {
        &mut self.networks
    }

    pub(crate) fn sessions_mut(&mut self) -> &mut Vec<Session> {
        &mut self.sessions
    }
}

fn normalize_or_err(mac: &str) -> Result<String, TrackerError> {
    vendor::normalize_mac(mac).ok_or_else(|| TrackerError::UnknownDevice(mac.to_string()))
}

/// Draw candidates until one is free, giving up after
/// [`JOIN_SECRET_ATTEMPTS`] collisions. Generation is injectable so
/// the exhaustion path is testable.
fn generate_secret_with<G, T>(mut candidate: G, mut taken: T) -> Result<String, TrackerError>
where
    G: FnMut() -> String,
    T: FnMut(&str) -> bool,
{
    for _ in 0..JOIN_SECRET_ATTEMPTS {
        let secret = candidate();
        if !taken(&secret) {
            return Ok(secret);
        }
    }
    Err(TrackerError::JoinSecretExhausted(JOIN_SECRET_ATTEMPTS))
}
