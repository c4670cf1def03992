use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    relay::{default_label, normalize_label, RelayBank, RELAY_COUNT},
    schedule::Schedule,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub probe_attempts: u8,
    pub probe_timeout_ms: u64,
    pub recovery_cooldown_ms: u64,
    pub heartbeat_on_ms: u64,
    pub heartbeat_off_ms: u64,
    pub restart_grace_ms: u64,
    pub unscheduled_poll_interval_ms: u64,
    pub suspend_when_off: bool,
    pub log_tail_bytes: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            probe_attempts: 10,
            probe_timeout_ms: 1_000,
            recovery_cooldown_ms: 10_000,
            heartbeat_on_ms: 3_000,
            heartbeat_off_ms: 1_500,
            restart_grace_ms: 1_000,
            unscheduled_poll_interval_ms: 300_000,
            suspend_when_off: false,
            log_tail_bytes: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub syslog_host: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

/// Persisted record, laid out as parallel per-relay arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConfig {
    #[serde(rename = "relayLabels", default)]
    pub relay_labels: Vec<Option<String>>,
    #[serde(rename = "relayIPs", default)]
    pub relay_ips: Vec<Option<String>>,
    #[serde(rename = "relayStates", default)]
    pub relay_states: Vec<Option<bool>>,
    #[serde(rename = "pingEnabled", default)]
    pub ping_enabled: Vec<Option<bool>>,
    #[serde(rename = "resetEnabled", default)]
    pub reset_enabled: Vec<Option<bool>>,
    #[serde(rename = "globalSchedule", default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub wifi: WifiCredentials,
    #[serde(default)]
    pub syslog: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored config is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("config store backend failed: {0}")]
    Backend(String),
}

pub trait ConfigStore {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<StoredConfig>, StoreError>;
    fn save(&self, config: &StoredConfig) -> Result<(), StoreError>;
}

fn slot<T: Clone>(values: &[Option<T>], index: usize) -> Option<T> {
    values.get(index).cloned().flatten()
}

impl StoredConfig {
    pub fn parse(raw: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn capture(relays: &RelayBank, schedule: &Schedule, network: &NetworkConfig) -> Self {
        Self {
            relay_labels: relays.iter().map(|r| Some(r.label.clone())).collect(),
            relay_ips: relays.iter().map(|r| Some(r.monitor_address.clone())).collect(),
            relay_states: relays.iter().map(|r| Some(r.commanded_on)).collect(),
            ping_enabled: relays.iter().map(|r| Some(r.ping_enabled)).collect(),
            reset_enabled: relays.iter().map(|r| Some(r.reset_on_failure)).collect(),
            schedule: schedule.clone(),
            wifi: WifiCredentials {
                ssid: network.wifi_ssid.clone(),
                password: network.wifi_pass.clone(),
            },
            syslog: network.syslog_host.clone(),
        }
    }

    /// Copies stored per-relay settings into `relays`, filling gaps with defaults.
    pub fn restore_relays(&self, relays: &mut RelayBank) {
        for (index, relay) in relays.iter_mut().enumerate().take(RELAY_COUNT) {
            relay.label = slot(&self.relay_labels, index)
                .map(|label| normalize_label(index, &label))
                .unwrap_or_else(|| default_label(index));
            relay.monitor_address = slot(&self.relay_ips, index)
                .map(|address| address.trim().to_string())
                .unwrap_or_default();
            relay.commanded_on = slot(&self.relay_states, index).unwrap_or(true);
            relay.ping_enabled = slot(&self.ping_enabled, index).unwrap_or(false);
            relay.reset_on_failure = slot(&self.reset_enabled, index).unwrap_or(false);
        }
    }

    pub fn restore_schedule(&self) -> Schedule {
        let mut schedule = self.schedule.clone();
        schedule.sanitize();
        schedule
    }

    pub fn restore_network(&self) -> NetworkConfig {
        NetworkConfig {
            wifi_ssid: self.wifi.ssid.clone(),
            wifi_pass: self.wifi.password.clone(),
            syslog_host: self.syslog.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::relay::ESP32_S3;

    #[test]
    fn round_trips_relays_schedule_and_network() {
        let mut relays = RelayBank::new(ESP32_S3.relay_pins);
        for (index, relay) in relays.iter_mut().enumerate() {
            relay.label = format!("Port {index}");
            relay.monitor_address = format!("10.0.0.{}", index + 1);
            relay.commanded_on = index % 2 == 0;
            relay.ping_enabled = index % 3 != 0;
            relay.reset_on_failure = index > 2;
        }
        let schedule = Schedule {
            enabled: true,
            power_on_time: "21:15".to_string(),
            power_off_time: "05:45".to_string(),
            poll_interval_minutes: 30,
        };
        let network = NetworkConfig {
            wifi_ssid: "shack".to_string(),
            wifi_pass: "hunter2".to_string(),
            syslog_host: "192.168.1.5".to_string(),
        };

        let raw = StoredConfig::capture(&relays, &schedule, &network)
            .to_json()
            .unwrap();
        let stored = StoredConfig::parse(&raw).unwrap();

        let mut restored = RelayBank::new(ESP32_S3.relay_pins);
        stored.restore_relays(&mut restored);
        assert_eq!(restored, relays);
        assert_eq!(stored.restore_schedule(), schedule);
        assert_eq!(stored.restore_network(), network);
    }

    #[test]
    fn keeps_original_field_names() {
        let relays = RelayBank::new(ESP32_S3.relay_pins);
        let raw = StoredConfig::capture(&relays, &Schedule::default(), &NetworkConfig::default())
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();

        for key in [
            "relayLabels",
            "relayIPs",
            "relayStates",
            "pingEnabled",
            "resetEnabled",
            "globalSchedule",
            "wifi",
            "syslog",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["globalSchedule"]["powerOnTime"], "06:00");
        assert_eq!(value["globalSchedule"]["pollIntervalMinutes"], 10);
    }

    #[test]
    fn fills_missing_entries_with_defaults() {
        let raw = br#"{
            "relayLabels": ["Modem", null],
            "relayStates": [false],
            "pingEnabled": [true, true],
            "globalSchedule": { "enabled": true, "pollIntervalMinutes": 9000 }
        }"#;
        let stored = StoredConfig::parse(raw).unwrap();
        let mut relays = RelayBank::new(ESP32_S3.relay_pins);
        stored.restore_relays(&mut relays);

        let first = relays.get(0).unwrap();
        assert_eq!(first.label, "Modem");
        assert!(!first.commanded_on);
        assert!(first.ping_enabled);
        assert!(!first.is_monitored());

        let second = relays.get(1).unwrap();
        assert_eq!(second.label, "Relay 2");
        assert!(second.commanded_on);

        let schedule = stored.restore_schedule();
        assert!(schedule.enabled);
        assert_eq!(schedule.power_on_time, "06:00");
        assert_eq!(schedule.power_off_time, "23:00");
        assert_eq!(schedule.poll_interval_minutes, 5);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = StoredConfig::parse(b"{\"relayLabels\": [").unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
    }
}
