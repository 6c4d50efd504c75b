//! Notification boundary.
//!
//! Delivery itself (chat bot, webhook, whatever) lives outside this
//! crate; the core only decides who gets poked and calls
//! [`Notifier::notify`] once per interested channel.

use crate::tracker::{ChannelId, PresenceChange, Tracker};
use async_trait::async_trait;

/// Fire-and-forget delivery of "something changed on this network".
/// Implementations must not fail the caller; delivery problems are
/// theirs to log.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: ChannelId, ssid: &str);
}

/// Notifier that only writes to the log. Useful standalone and as the
/// default when no delivery backend is wired up.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, channel: ChannelId, ssid: &str) {
        tracing::info!("notify channel {}: presence changed on `{}`", channel, ssid);
    }
}

/// Fan this cycle's changes out to every interested channel.
pub async fn dispatch(
    notifier: &dyn Notifier,
    tracker: &Tracker,
    ssid: &str,
    changes: &[PresenceChange],
) {
    let targets = tracker.notification_targets(ssid, changes);
    if targets.is_empty() {
        return;
    }
    tracing::debug!(
        "Dispatching {} change(s) on `{}` to {} channel(s)",
        changes.len(),
        ssid,
        targets.len()
    );
    for channel in targets {
        notifier.notify(channel, ssid).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::PresenceReport;
    use crate::tracker::Medium;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(ChannelId, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, channel: ChannelId, ssid: &str) {
            self.calls.lock().unwrap().push((channel, ssid.to_string()));
        }
    }

    #[tokio::test]
    async fn notifies_each_interested_channel_once() {
        let mut tracker = Tracker::new();
        let registered = tracker.register_network("Home", "", Medium::Wifi).unwrap();
        let changes = tracker
            .ingest(
                &[PresenceReport {
                    network_ssid: "Home".to_string(),
                    device_mac_addr: "AA:BB:CC:DD:EE:FF".to_string(),
                    device_ipv4_addr: "192.168.1.42".to_string(),
                }],
                Utc::now(),
            )
            .unwrap();
        tracker.subscribe_network(5, &registered.join_secret).unwrap();
        tracker.follow_device(5, "AA:BB:CC:DD:EE:FF", true).unwrap();

        let notifier = RecordingNotifier::default();
        dispatch(&notifier, &tracker, "Home", &changes).await;

        let calls = notifier.calls.lock().unwrap();
        assert_eq!(*calls, vec![(5, "Home".to_string())]);
    }

    #[tokio::test]
    async fn no_changes_means_no_notifications() {
        let mut tracker = Tracker::new();
        let registered = tracker.register_network("Home", "", Medium::Wifi).unwrap();
        tracker.subscribe_network(5, &registered.join_secret).unwrap();

        let notifier = RecordingNotifier::default();
        dispatch(&notifier, &tracker, "Home", &[]).await;
        assert!(notifier.calls.lock().unwrap().is_empty());
    }
}
