use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    relay::RELAY_COUNT,
    schedule::{parse_time_of_day, Schedule},
};

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub states: Vec<bool>,
    pub labels: Vec<String>,
    pub ips: Vec<String>,
    pub ping: Vec<bool>,
    pub reset: Vec<bool>,
    pub pins: Vec<u8>,
    pub profile: &'static str,
    #[serde(rename = "scheduleEnabled")]
    pub schedule_enabled: bool,
    #[serde(rename = "powerOnTime")]
    pub power_on_time: String,
    #[serde(rename = "powerOffTime")]
    pub power_off_time: String,
    #[serde(rename = "pollIntervalMinutes")]
    pub poll_interval_minutes: u32,
    #[serde(rename = "scheduleOn")]
    pub schedule_on: bool,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "localTime")]
    pub local_time: Option<String>,
    #[serde(rename = "nextPollInMs")]
    pub next_poll_in_ms: u64,
    #[serde(rename = "restartPending")]
    pub restart_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    pub label: String,
    #[serde(rename = "monitorAddress", default)]
    pub monitor_address: String,
    #[serde(rename = "pingEnabled", default)]
    pub ping_enabled: bool,
    #[serde(rename = "resetOnFailure", default)]
    pub reset_on_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub relays: Vec<RelaySettings>,
    pub schedule: Schedule,
}

impl SettingsUpdate {
    /// Merges the settings form (`label0`, `ip0`, `ping0`, `reset0`, ...).
    /// Unchecked boxes are absent from a submitted form.
    pub fn merge_form(&mut self, form: &HashMap<String, String>) {
        for (index, relay) in self.relays.iter_mut().enumerate() {
            if let Some(label) = form.get(&format!("label{index}")) {
                relay.label = label.clone();
            }
            if let Some(address) = form.get(&format!("ip{index}")) {
                relay.monitor_address = address.trim().to_string();
            }
            relay.ping_enabled = form.contains_key(&format!("ping{index}"));
            relay.reset_on_failure = form.contains_key(&format!("reset{index}"));
        }

        self.schedule.enabled = form.contains_key("globalScheduleEnabled");
        if let Some(on) = form.get("globalOnTime") {
            self.schedule.power_on_time = on.trim().to_string();
        }
        if let Some(off) = form.get("globalOffTime") {
            self.schedule.power_off_time = off.trim().to_string();
        }
        if let Some(minutes) = form
            .get("pollInterval")
            .and_then(|value| value.trim().parse::<u32>().ok())
        {
            self.schedule.poll_interval_minutes = minutes;
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.relays.len() > RELAY_COUNT {
            return Err("Too many relays");
        }
        if parse_time_of_day(&self.schedule.power_on_time).is_none() {
            return Err("powerOnTime must be HH:MM");
        }
        if parse_time_of_day(&self.schedule.power_off_time).is_none() {
            return Err("powerOffTime must be HH:MM");
        }
        Ok(())
    }
}
