use serde::{Deserialize, Serialize};

pub const RELAY_COUNT: usize = 6;
pub const MAX_LABEL_CHARS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Electrical level that energizes a relay on a given board revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    pub fn level(self, on: bool) -> Level {
        match (self, on) {
            (Self::ActiveHigh, true) | (Self::ActiveLow, false) => Level::High,
            (Self::ActiveHigh, false) | (Self::ActiveLow, true) => Level::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareProfile {
    pub name: &'static str,
    pub relay_pins: [u8; RELAY_COUNT],
    pub status_led_pin: u8,
    pub polarity: Polarity,
}

pub const ESP32: HardwareProfile = HardwareProfile {
    name: "esp32",
    relay_pins: [14, 27, 26, 25, 33, 32],
    status_led_pin: 2,
    polarity: Polarity::ActiveHigh,
};

pub const ESP32_S3: HardwareProfile = HardwareProfile {
    name: "esp32s3",
    relay_pins: [19, 20, 26, 48, 47, 33],
    status_led_pin: 2,
    polarity: Polarity::ActiveLow,
};

impl HardwareProfile {
    pub fn by_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "esp32" => Some(ESP32),
            "esp32s3" | "esp32-s3" => Some(ESP32_S3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relay {
    pub pin: u8,
    pub commanded_on: bool,
    pub label: String,
    pub monitor_address: String,
    pub ping_enabled: bool,
    pub reset_on_failure: bool,
}

pub fn default_label(index: usize) -> String {
    format!("Relay {}", index + 1)
}

/// Trims and truncates a user label; blank labels fall back to the default.
pub fn normalize_label(index: usize, label: &str) -> String {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return default_label(index);
    }
    trimmed.chars().take(MAX_LABEL_CHARS).collect()
}

impl Relay {
    pub fn new(index: usize, pin: u8) -> Self {
        Self {
            pin,
            commanded_on: false,
            label: default_label(index),
            monitor_address: String::new(),
            ping_enabled: false,
            reset_on_failure: false,
        }
    }

    pub fn is_monitored(&self) -> bool {
        self.ping_enabled && !self.monitor_address.trim().is_empty()
    }

    pub fn recovery_armed(&self) -> bool {
        self.is_monitored() && self.reset_on_failure
    }
}

/// The fixed set of relays, addressed by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayBank {
    relays: [Relay; RELAY_COUNT],
}

impl RelayBank {
    pub fn new(pins: [u8; RELAY_COUNT]) -> Self {
        Self {
            relays: std::array::from_fn(|index| Relay::new(index, pins[index])),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Relay> {
        self.relays.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Relay> {
        self.relays.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relay> {
        self.relays.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Relay> {
        self.relays.iter_mut()
    }

    pub fn states(&self) -> [bool; RELAY_COUNT] {
        std::array::from_fn(|index| self.relays[index].commanded_on)
    }
}
