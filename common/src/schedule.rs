use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

pub const MINUTES_PER_DAY: u16 = 24 * 60;
pub const MAX_POLL_INTERVAL_MINUTES: u32 = 1_440;

const DEFAULT_POWER_ON_TIME: &str = "06:00";
const DEFAULT_POWER_OFF_TIME: &str = "23:00";
const DEFAULT_POLL_INTERVAL_MINUTES: u32 = 10;
const OUT_OF_RANGE_POLL_INTERVAL_MINUTES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "powerOnTime", default = "default_power_on_time")]
    pub power_on_time: String,
    #[serde(rename = "powerOffTime", default = "default_power_off_time")]
    pub power_off_time: String,
    #[serde(rename = "pollIntervalMinutes", default = "default_poll_interval")]
    pub poll_interval_minutes: u32,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            enabled: false,
            power_on_time: default_power_on_time(),
            power_off_time: default_power_off_time(),
            poll_interval_minutes: DEFAULT_POLL_INTERVAL_MINUTES,
        }
    }
}

fn default_power_on_time() -> String {
    DEFAULT_POWER_ON_TIME.to_string()
}

fn default_power_off_time() -> String {
    DEFAULT_POWER_OFF_TIME.to_string()
}

fn default_poll_interval() -> u32 {
    DEFAULT_POLL_INTERVAL_MINUTES
}

/// Parses `H:M` / `HH:MM` into minutes since midnight.
pub fn parse_time_of_day(text: &str) -> Option<u16> {
    let (hour, minute) = text.trim().split_once(':')?;
    let hour = parse_clock_field(hour, 23)?;
    let minute = parse_clock_field(minute, 59)?;
    Some(hour * 60 + minute)
}

fn parse_clock_field(field: &str, max: u16) -> Option<u16> {
    if field.is_empty() || field.len() > 2 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse::<u16>().ok().filter(|value| *value <= max)
}

pub fn minutes_of_day(time: NaiveTime) -> u16 {
    (time.hour() * 60 + time.minute()) as u16
}

pub fn format_time_of_day(minutes: u16) -> String {
    let minutes = minutes % MINUTES_PER_DAY;
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

impl Schedule {
    pub fn sanitize(&mut self) {
        self.power_on_time = self.power_on_time.trim().to_string();
        self.power_off_time = self.power_off_time.trim().to_string();

        if self.poll_interval_minutes > MAX_POLL_INTERVAL_MINUTES {
            self.poll_interval_minutes = OUT_OF_RANGE_POLL_INTERVAL_MINUTES;
        } else if self.poll_interval_minutes == 0 {
            self.poll_interval_minutes = 1;
        }
    }

    /// `(on, off)` in minutes of day, or `None` if either field is unparsable.
    pub fn window(&self) -> Option<(u16, u16)> {
        let on = parse_time_of_day(&self.power_on_time)?;
        let off = parse_time_of_day(&self.power_off_time)?;
        Some((on, off))
    }

    /// Whether the system should be powered at `now` (minutes of day).
    ///
    /// `None` means the clock has no synced time. Missing time and
    /// unparsable schedule fields both resolve to ON.
    pub fn should_be_on(&self, now: Option<u16>) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(now) = now else {
            return true;
        };

        let Some((on, off)) = self.window() else {
            return true;
        };

        if on == off {
            return false;
        }

        if on < off {
            on <= now && now < off
        } else {
            now >= on || now < off
        }
    }

    pub fn poll_interval_ms(&self, unscheduled_ms: u64) -> u64 {
        if self.enabled {
            u64::from(self.poll_interval_minutes.clamp(1, MAX_POLL_INTERVAL_MINUTES)) * 60_000
        } else {
            unscheduled_ms
        }
    }

    /// Minutes from `now` until the next power-on instant.
    pub fn minutes_until_on(&self, now: u16) -> Option<u16> {
        let (on, _) = self.window()?;
        let now = now % MINUTES_PER_DAY;
        let minutes = if on > now {
            on - now
        } else {
            MINUTES_PER_DAY - now + on
        };
        Some(minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overnight() -> Schedule {
        Schedule {
            enabled: true,
            power_on_time: "22:00".to_string(),
            power_off_time: "06:00".to_string(),
            poll_interval_minutes: 10,
        }
    }

    fn at(hour: u16, minute: u16) -> Option<u16> {
        Some(hour * 60 + minute)
    }

    #[test]
    fn disabled_schedule_is_always_on() {
        let mut schedule = overnight();
        schedule.enabled = false;
        schedule.power_off_time = schedule.power_on_time.clone();

        for now in [at(0, 0), at(12, 0), at(23, 59), None] {
            assert!(schedule.should_be_on(now));
        }
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let schedule = overnight();

        assert!(schedule.should_be_on(at(23, 0)));
        assert!(schedule.should_be_on(at(22, 0)));
        assert!(schedule.should_be_on(at(0, 30)));
        assert!(!schedule.should_be_on(at(12, 0)));
        assert!(!schedule.should_be_on(at(21, 59)));
    }

    #[test]
    fn off_time_boundary_is_exclusive() {
        let schedule = overnight();

        assert!(schedule.should_be_on(at(5, 59)));
        assert!(!schedule.should_be_on(at(6, 0)));
    }

    #[test]
    fn daytime_window_excludes_night() {
        let schedule = Schedule {
            enabled: true,
            power_on_time: "08:00".to_string(),
            power_off_time: "20:00".to_string(),
            poll_interval_minutes: 10,
        };

        assert!(!schedule.should_be_on(at(7, 59)));
        assert!(schedule.should_be_on(at(8, 0)));
        assert!(schedule.should_be_on(at(19, 59)));
        assert!(!schedule.should_be_on(at(20, 0)));
    }

    #[test]
    fn equal_times_mean_off_all_day() {
        let schedule = Schedule {
            enabled: true,
            power_on_time: "07:30".to_string(),
            power_off_time: "07:30".to_string(),
            poll_interval_minutes: 10,
        };

        for minute in (0..MINUTES_PER_DAY).step_by(15) {
            assert!(!schedule.should_be_on(Some(minute)));
        }
    }

    #[test]
    fn fails_open_without_time_or_valid_fields() {
        let schedule = Schedule {
            enabled: true,
            power_on_time: "07:30".to_string(),
            power_off_time: "07:30".to_string(),
            poll_interval_minutes: 10,
        };
        assert!(schedule.should_be_on(None));

        let mut garbled = overnight();
        garbled.power_off_time = "six".to_string();
        assert!(garbled.should_be_on(at(12, 0)));
    }

    #[test]
    fn evaluation_is_repeatable() {
        let schedule = overnight();
        let first: Vec<bool> = (0..MINUTES_PER_DAY)
            .map(|m| schedule.should_be_on(Some(m)))
            .collect();
        let second: Vec<bool> = (0..MINUTES_PER_DAY)
            .map(|m| schedule.should_be_on(Some(m)))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn parses_clock_text() {
        assert_eq!(parse_time_of_day("22:00"), Some(1_320));
        assert_eq!(parse_time_of_day("6:5"), Some(365));
        assert_eq!(parse_time_of_day(" 05:59 "), Some(359));
        assert_eq!(parse_time_of_day("24:00"), None);
        assert_eq!(parse_time_of_day("12:60"), None);
        assert_eq!(parse_time_of_day("1200"), None);
        assert_eq!(parse_time_of_day("-1:00"), None);
        assert_eq!(parse_time_of_day(""), None);
    }

    #[test]
    fn formats_minutes_back_to_clock_text() {
        assert_eq!(format_time_of_day(365), "06:05");
        assert_eq!(format_time_of_day(0), "00:00");
        assert_eq!(minutes_of_day(NaiveTime::from_hms_opt(23, 59, 30).unwrap()), 1_439);
    }

    #[test]
    fn sanitize_bounds_poll_interval() {
        let mut schedule = Schedule {
            poll_interval_minutes: 5_000,
            ..Schedule::default()
        };
        schedule.sanitize();
        assert_eq!(schedule.poll_interval_minutes, 5);

        schedule.poll_interval_minutes = 0;
        schedule.sanitize();
        assert_eq!(schedule.poll_interval_minutes, 1);

        schedule.poll_interval_minutes = 1_440;
        schedule.sanitize();
        assert_eq!(schedule.poll_interval_minutes, 1_440);
    }

    #[test]
    fn poll_interval_falls_back_when_disabled() {
        let mut schedule = Schedule::default();
        assert_eq!(schedule.poll_interval_ms(300_000), 300_000);

        schedule.enabled = true;
        assert_eq!(schedule.poll_interval_ms(300_000), 600_000);
    }

    #[test]
    fn counts_minutes_until_power_on() {
        let schedule = overnight();
        assert_eq!(schedule.minutes_until_on(12 * 60), Some(600));
        assert_eq!(schedule.minutes_until_on(23 * 60), Some(23 * 60));
        assert_eq!(schedule.minutes_until_on(22 * 60), Some(MINUTES_PER_DAY));
    }
}
