pub mod board;
pub mod config;
pub mod controller;
pub mod form;
pub mod journal;
pub mod monitor;
pub mod relay;
pub mod schedule;
pub mod types;

pub use board::{Board, Clock, Delay, PowerManager, RadioLink, RelayOutput, StatusIndicator};
pub use config::{
    ConfigStore, ControllerConfig, NetworkConfig, StoreError, StoredConfig, WifiCredentials,
};
pub use controller::{
    record, PollReport, RelayChange, RelayController, RestartState, TickOutcome,
};
pub use journal::{
    syslog_datagram, Journal, JournalError, LogEntry, LogSink, LogTail, SyslogForwarder,
    NO_TIME_MARKER, SYSLOG_PORT,
};
pub use monitor::{
    parse_monitor_address, probe_relay, ProbeBudget, ProbeOutcome, ProbeResult, Prober,
};
pub use relay::{HardwareProfile, Level, Polarity, Relay, RelayBank, ESP32, ESP32_S3, RELAY_COUNT};
pub use schedule::Schedule;
pub use types::{ControllerStatus, RelaySettings, SettingsUpdate};
