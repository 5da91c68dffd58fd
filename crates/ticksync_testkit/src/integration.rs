//! Cross-crate integration test helpers.
//!
//! Drives several reference clients against one center and checks that
//! they converge.

use crate::fixtures::{TestCenter, TestClient};
use std::collections::BTreeMap;
use ticksync_client::{LoopbackTransport, SyncClient, SyncOutcome};
use ticksync_protocol::SyncChange;

/// A test harness for multi-device integration testing.
pub struct IntegrationHarness {
    /// The center every device syncs with.
    pub center: TestCenter,
    devices: BTreeMap<String, TestClient>,
}

impl IntegrationHarness {
    /// Creates a harness around an in-memory center.
    pub fn new() -> Self {
        Self::with_center(TestCenter::memory())
    }

    /// Creates a harness around `center`.
    pub fn with_center(center: TestCenter) -> Self {
        Self {
            center,
            devices: BTreeMap::new(),
        }
    }

    /// Registers a device serving `facilities`, replacing any earlier one
    /// of the same name.
    pub fn add_device(&mut self, name: &str, facilities: &[&str]) -> &TestClient {
        let client = self.center.client(name, facilities);
        self.devices.insert(name.to_string(), client);
        &self.devices[name]
    }

    /// Returns a device, registering it for facility `f1` if unknown.
    pub fn device(&mut self, name: &str) -> &TestClient {
        if !self.devices.contains_key(name) {
            self.add_device(name, &["f1"]);
        }
        &self.devices[name]
    }

    /// Makes a local edit on a device.
    pub fn write(&mut self, device: &str, change: SyncChange) {
        self.device(device).store().write(change);
    }

    /// Runs one sync for a device.
    pub async fn sync(&mut self, device: &str) -> SyncOutcome {
        self.device(device)
            .sync()
            .await
            .unwrap_or_else(|e| panic!("sync of {device} failed: {e}"))
    }

    /// Syncs every device once, in name order.
    pub async fn sync_all(&mut self) -> Vec<SyncOutcome> {
        let mut outcomes = Vec::with_capacity(self.devices.len());
        for client in self.devices.values() {
            let outcome = client
                .sync()
                .await
                .unwrap_or_else(|e| panic!("sync of {} failed: {e}", client.config().device_id));
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Syncs every device twice so each sees every other device's edits.
    pub async fn converge(&mut self) {
        self.sync_all().await;
        self.sync_all().await;
    }

    /// Asserts that every device holds exactly the center's live records of
    /// `record_type`, with the same data.
    pub fn assert_converged(&self, record_type: &str) {
        let expected = self.center.ids(record_type);
        for (name, client) in &self.devices {
            assert_eq!(
                client.store().ids(record_type),
                expected,
                "{name} disagrees with the center on {record_type}"
            );
            for id in &expected {
                let central = self.center.get(record_type, id).expect("listed record exists");
                let local = client.store().get(record_type, id).expect("listed record exists");
                assert_eq!(local.data, central.data, "{name} holds stale {record_type}/{id}");
            }
        }
    }

    /// Restarts the center from a checkpoint and reconnects every device,
    /// keeping its local state.
    pub fn restart_center(self) -> Self {
        let center = self.center.restart();
        let devices = self
            .devices
            .into_iter()
            .map(|(name, client)| {
                let (config, _, store) = client.into_parts();
                let client = SyncClient::new(config, LoopbackTransport::from_server(&center), store);
                (name, client)
            })
            .collect();
        Self { center, devices }
    }

    /// Returns the count of registered devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}
