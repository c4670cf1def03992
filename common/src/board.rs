use std::time::Duration;

use chrono::NaiveDateTime;

use crate::{journal::LogSink, monitor::Prober, relay::Level};

pub trait RelayOutput {
    fn write(&mut self, pin: u8, level: Level);
}

/// Liveness LED.
pub trait StatusIndicator {
    fn set_lit(&mut self, lit: bool);
}

pub trait Clock {
    /// Network-synced local wall time, `None` until the clock has been set.
    fn local_time(&self) -> Option<NaiveDateTime>;
}

pub trait Delay {
    fn delay_ms(&mut self, ms: u64);
}

pub trait PowerManager {
    fn suspend_for(&mut self, duration: Duration);
}

/// Opaque inbound messages from the long-range radio. Must not block.
pub trait RadioLink {
    fn try_receive(&mut self) -> Option<String>;
}

/// Everything the control loop needs from the platform.
pub trait Board:
    RelayOutput + StatusIndicator + Clock + Delay + PowerManager + RadioLink + LogSink + Prober
{
}

impl<T> Board for T where
    T: RelayOutput
        + StatusIndicator
        + Clock
        + Delay
        + PowerManager
        + RadioLink
        + LogSink
        + Prober
        + ?Sized
{
}
