use std::time::Duration;

use chrono::NaiveDateTime;

use crate::{
    board::{Board, Clock, RelayOutput},
    config::{ConfigStore, ControllerConfig, NetworkConfig, StoreError, StoredConfig},
    journal::{LogEntry, LogSink},
    monitor::{probe_relay, ProbeBudget, ProbeOutcome},
    relay::{normalize_label, HardwareProfile, RelayBank, RELAY_COUNT},
    schedule::{minutes_of_day, Schedule},
    types::{ControllerStatus, RelaySettings, SettingsUpdate},
};

const MIN_SUSPEND: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayChange {
    pub index: usize,
    pub pin: u8,
    pub was_on: bool,
    pub now_on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    Idle,
    Pending { requested_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Restart,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub schedule_on: bool,
    pub suspended_for: Option<Duration>,
    pub probes: Vec<(usize, ProbeOutcome)>,
    pub recovered: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    on_ms: u64,
    off_ms: u64,
    lit: Option<bool>,
}

impl Heartbeat {
    /// New LED state when the phase flips, `None` otherwise.
    fn update(&mut self, now_ms: u64) -> Option<bool> {
        let period = self.on_ms + self.off_ms;
        if period == 0 {
            return None;
        }
        let lit = now_ms % period < self.on_ms;
        if self.lit == Some(lit) {
            return None;
        }
        self.lit = Some(lit);
        Some(lit)
    }
}

/// Appends a timestamped line to the board's log.
pub fn record<B: LogSink + Clock + ?Sized>(board: &mut B, message: impl Into<String>) {
    let entry = LogEntry::new(board.local_time(), message);
    board.append(&entry);
}

#[derive(Debug, Clone)]
pub struct RelayController {
    pub config: ControllerConfig,
    profile: HardwareProfile,
    relays: RelayBank,
    schedule: Schedule,
    network: NetworkConfig,

    heartbeat: Heartbeat,
    last_poll_ms: u64,
    restart: RestartState,
}

impl RelayController {
    pub fn new(config: ControllerConfig, profile: HardwareProfile) -> Self {
        Self {
            heartbeat: Heartbeat {
                on_ms: config.heartbeat_on_ms,
                off_ms: config.heartbeat_off_ms,
                lit: None,
            },
            config,
            profile,
            relays: RelayBank::new(profile.relay_pins),
            schedule: Schedule::default(),
            network: NetworkConfig::default(),
            last_poll_ms: 0,
            restart: RestartState::Idle,
        }
    }

    pub fn profile(&self) -> HardwareProfile {
        self.profile
    }

    pub fn relays(&self) -> &RelayBank {
        &self.relays
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn restart_state(&self) -> RestartState {
        self.restart
    }

    pub fn restart_pending(&self) -> bool {
        matches!(self.restart, RestartState::Pending { .. })
    }

    /// Restores persisted settings. A missing or unreadable record leaves the defaults in place.
    pub fn load<S, B>(&mut self, store: &S, board: &mut B) -> bool
    where
        S: ConfigStore + ?Sized,
        B: LogSink + Clock + ?Sized,
    {
        match store.load() {
            Ok(Some(stored)) => {
                self.apply_stored(&stored);
                record(board, "Configuration loaded");
                true
            }
            Ok(None) => {
                record(board, "No saved configuration, using defaults");
                false
            }
            Err(err) => {
                record(board, format!("Failed to load configuration: {err}"));
                false
            }
        }
    }

    pub fn apply_stored(&mut self, stored: &StoredConfig) {
        stored.restore_relays(&mut self.relays);
        self.schedule = stored.restore_schedule();
        self.network = stored.restore_network();
    }

    pub fn stored_config(&self) -> StoredConfig {
        StoredConfig::capture(&self.relays, &self.schedule, &self.network)
    }

    /// Saves the current settings. Failures are logged and otherwise ignored.
    pub fn persist<S, B>(&self, store: &S, board: &mut B) -> bool
    where
        S: ConfigStore + ?Sized,
        B: LogSink + Clock + ?Sized,
    {
        match store.save(&self.stored_config()) {
            Ok(()) => true,
            Err(err) => {
                record(board, format!("Failed to save configuration: {err}"));
                false
            }
        }
    }

    /// Drives every output to its commanded state, used once at boot.
    pub fn drive_all<B: RelayOutput + ?Sized>(&self, board: &mut B) {
        for relay in self.relays.iter() {
            board.write(relay.pin, self.profile.polarity.level(relay.commanded_on));
        }
    }

    pub fn toggle<B>(&mut self, index: usize, board: &mut B) -> Option<RelayChange>
    where
        B: RelayOutput + LogSink + Clock + ?Sized,
    {
        let on = self.relays.get(index)?.commanded_on;
        self.set_state(index, !on, board)
    }

    /// Commands relay `index`. Out-of-range indexes are ignored.
    pub fn set_state<B>(&mut self, index: usize, on: bool, board: &mut B) -> Option<RelayChange>
    where
        B: RelayOutput + LogSink + Clock + ?Sized,
    {
        let polarity = self.profile.polarity;
        let relay = self.relays.get_mut(index)?;
        let was_on = relay.commanded_on;
        relay.commanded_on = on;
        let (pin, label) = (relay.pin, relay.label.clone());

        board.write(pin, polarity.level(on));
        record(
            board,
            format!(
                "Switch Pin:{pin} - {label} {} >> {}",
                u8::from(was_on),
                u8::from(on)
            ),
        );

        Some(RelayChange {
            index,
            pin,
            was_on,
            now_on: on,
        })
    }

    /// Power-cycles relay `index`: OFF, cool-down, ON. Blocks for the cool-down.
    pub fn recover<B, S>(&mut self, index: usize, board: &mut B, store: &S) -> bool
    where
        B: Board + ?Sized,
        S: ConfigStore + ?Sized,
    {
        let Some(label) = self.relays.get(index).map(|relay| relay.label.clone()) else {
            return false;
        };

        record(board, format!("Resetting {label}"));
        self.set_state(index, false, board);
        self.persist(store, board);
        board.delay_ms(self.config.recovery_cooldown_ms);
        self.set_state(index, true, board);
        self.persist(store, board);
        true
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.schedule
            .poll_interval_ms(self.config.unscheduled_poll_interval_ms)
    }

    pub fn poll_due(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_poll_ms) >= self.poll_interval_ms()
    }

    /// One monitoring pass: schedule check, then probe and recover each relay in order.
    pub fn poll<B, S>(&mut self, now_ms: u64, board: &mut B, store: &S) -> PollReport
    where
        B: Board + ?Sized,
        S: ConfigStore + ?Sized,
    {
        self.last_poll_ms = now_ms;

        let now = board.local_time().map(|time| minutes_of_day(time.time()));
        let mut report = PollReport {
            schedule_on: self.schedule.should_be_on(now),
            ..PollReport::default()
        };

        if !report.schedule_on {
            record(board, "Outside scheduled power window");
            if self.config.suspend_when_off {
                let duration = self.suspend_duration(now);
                record(board, format!("Suspending for {}s", duration.as_secs()));
                board.suspend_for(duration);
                report.suspended_for = Some(duration);
            }
        }

        let budget = ProbeBudget {
            attempts: self.config.probe_attempts,
            timeout: Duration::from_millis(self.config.probe_timeout_ms),
        };

        for index in 0..RELAY_COUNT {
            let Some(relay) = self.relays.get(index) else {
                continue;
            };
            let Some(outcome) = probe_relay(relay, board, budget) else {
                continue;
            };
            let label = relay.label.clone();
            let reset_on_failure = relay.reset_on_failure;

            match &outcome {
                ProbeOutcome::InvalidAddress(text) => {
                    record(board, format!("Invalid IP for {label} ({text})"))
                }
                ProbeOutcome::Probed(result) if result.reachable() => record(
                    board,
                    format!("Ping OK for {label} ({})", result.address),
                ),
                ProbeOutcome::Probed(_) => record(board, format!("Ping failed for {label}")),
            }

            let recover = outcome.unreachable() && reset_on_failure;
            report.probes.push((index, outcome));
            if recover && self.recover(index, board, store) {
                report.recovered.push(index);
            }
        }

        report
    }

    /// One control-loop iteration.
    pub fn tick<B, S>(&mut self, now_ms: u64, board: &mut B, store: &S) -> TickOutcome
    where
        B: Board + ?Sized,
        S: ConfigStore + ?Sized,
    {
        if let Some(lit) = self.heartbeat.update(now_ms) {
            board.set_lit(lit);
        }

        if self.poll_due(now_ms) {
            self.poll(now_ms, board, store);
        }

        while let Some(message) = board.try_receive() {
            record(board, format!("Radio message: {message}"));
        }

        if let RestartState::Pending { requested_ms } = self.restart {
            if now_ms.saturating_sub(requested_ms) > self.config.restart_grace_ms {
                record(board, "Rebooting");
                return TickOutcome::Restart;
            }
        }

        TickOutcome::Continue
    }

    /// Schedules a restart after the grace period. Repeated requests keep the first deadline.
    pub fn request_restart(&mut self, now_ms: u64) {
        if self.restart == RestartState::Idle {
            self.restart = RestartState::Pending {
                requested_ms: now_ms,
            };
        }
    }

    /// Saves an uploaded record and schedules the restart that applies it.
    /// Until then the in-memory settings follow the record, so any persist
    /// in the grace period writes the upload back rather than the old state.
    pub fn install_upload<S, B>(
        &mut self,
        stored: &StoredConfig,
        now_ms: u64,
        store: &S,
        board: &mut B,
    ) -> Result<(), StoreError>
    where
        S: ConfigStore + ?Sized,
        B: LogSink + Clock + ?Sized,
    {
        store.save(stored)?;
        self.apply_stored(stored);
        record(board, "New config uploaded");
        self.request_restart(now_ms);
        Ok(())
    }

    pub fn settings(&self) -> SettingsUpdate {
        SettingsUpdate {
            relays: self
                .relays
                .iter()
                .map(|relay| RelaySettings {
                    label: relay.label.clone(),
                    monitor_address: relay.monitor_address.clone(),
                    ping_enabled: relay.ping_enabled,
                    reset_on_failure: relay.reset_on_failure,
                })
                .collect(),
            schedule: self.schedule.clone(),
        }
    }

    pub fn apply_settings(&mut self, update: &SettingsUpdate) {
        for (index, settings) in update.relays.iter().enumerate().take(RELAY_COUNT) {
            let Some(relay) = self.relays.get_mut(index) else {
                continue;
            };
            relay.label = normalize_label(index, &settings.label);
            relay.monitor_address = settings.monitor_address.trim().to_string();
            relay.ping_enabled = settings.ping_enabled;
            relay.reset_on_failure = settings.reset_on_failure;
        }

        let mut schedule = update.schedule.clone();
        schedule.sanitize();
        self.schedule = schedule;
    }

    pub fn status(&self, now_ms: u64, local_time: Option<NaiveDateTime>) -> ControllerStatus {
        let now = local_time.map(|time| minutes_of_day(time.time()));
        let next_poll_ms = self.last_poll_ms.saturating_add(self.poll_interval_ms());

        ControllerStatus {
            states: self.relays.iter().map(|r| r.commanded_on).collect(),
            labels: self.relays.iter().map(|r| r.label.clone()).collect(),
            ips: self.relays.iter().map(|r| r.monitor_address.clone()).collect(),
            ping: self.relays.iter().map(|r| r.ping_enabled).collect(),
            reset: self.relays.iter().map(|r| r.reset_on_failure).collect(),
            pins: self.relays.iter().map(|r| r.pin).collect(),
            profile: self.profile.name,
            schedule_enabled: self.schedule.enabled,
            power_on_time: self.schedule.power_on_time.clone(),
            power_off_time: self.schedule.power_off_time.clone(),
            poll_interval_minutes: self.schedule.poll_interval_minutes,
            schedule_on: self.schedule.should_be_on(now),
            time_synced: local_time.is_some(),
            local_time: local_time.map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string()),
            next_poll_in_ms: next_poll_ms.saturating_sub(now_ms),
            restart_pending: self.restart_pending(),
        }
    }

    fn suspend_duration(&self, now: Option<u16>) -> Duration {
        let interval = Duration::from_millis(self.poll_interval_ms());
        let until_on = now
            .and_then(|now| self.schedule.minutes_until_on(now))
            .map(|minutes| Duration::from_secs(u64::from(minutes) * 60));

        match until_on {
            Some(until_on) => interval.min(until_on).max(MIN_SUSPEND),
            None => interval.max(MIN_SUSPEND),
        }
    }
}
