use std::{net::IpAddr, time::Duration};

use crate::relay::Relay;

/// Echo-style reachability primitive. Returns how many of `attempts` got a reply.
///
/// Implementations must bound the call by roughly `attempts * timeout`.
pub trait Prober {
    fn probe(&mut self, address: IpAddr, attempts: u8, timeout: Duration) -> u8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeBudget {
    pub attempts: u8,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub address: IpAddr,
    pub attempts: u8,
    pub failures: u8,
}

impl ProbeResult {
    pub fn from_successes(address: IpAddr, attempts: u8, successes: u8) -> Self {
        Self {
            address,
            attempts,
            failures: attempts.saturating_sub(successes),
        }
    }

    /// Unreachable only when every attempt in the budget failed.
    pub fn reachable(&self) -> bool {
        self.failures < self.attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    InvalidAddress(String),
    Probed(ProbeResult),
}

impl ProbeOutcome {
    pub fn unreachable(&self) -> bool {
        matches!(self, Self::Probed(result) if !result.reachable())
    }
}

pub fn parse_monitor_address(text: &str) -> Option<IpAddr> {
    text.trim().parse::<IpAddr>().ok()
}

/// Probes the relay's monitored host. `None` if the relay is not monitored.
pub fn probe_relay<P: Prober + ?Sized>(
    relay: &Relay,
    prober: &mut P,
    budget: ProbeBudget,
) -> Option<ProbeOutcome> {
    if !relay.is_monitored() {
        return None;
    }

    let Some(address) = parse_monitor_address(&relay.monitor_address) else {
        return Some(ProbeOutcome::InvalidAddress(
            relay.monitor_address.trim().to_string(),
        ));
    };

    let attempts = budget.attempts.max(1);
    let successes = prober.probe(address, attempts, budget.timeout).min(attempts);
    Some(ProbeOutcome::Probed(ProbeResult::from_successes(
        address, attempts, successes,
    )))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    struct Scripted {
        successes: u8,
        calls: Vec<(IpAddr, u8)>,
    }

    impl Prober for Scripted {
        fn probe(&mut self, address: IpAddr, attempts: u8, _timeout: Duration) -> u8 {
            self.calls.push((address, attempts));
            self.successes
        }
    }

    fn budget() -> ProbeBudget {
        ProbeBudget {
            attempts: 10,
            timeout: Duration::from_secs(1),
        }
    }

    fn monitored(address: &str) -> Relay {
        let mut relay = Relay::new(0, 19);
        relay.ping_enabled = true;
        relay.monitor_address = address.to_string();
        relay
    }

    #[test]
    fn single_reply_out_of_ten_is_reachable() {
        let mut prober = Scripted {
            successes: 1,
            calls: Vec::new(),
        };
        let outcome = probe_relay(&monitored("192.168.1.20"), &mut prober, budget()).unwrap();

        let ProbeOutcome::Probed(result) = outcome else {
            panic!("expected a probe result");
        };
        assert_eq!(result.failures, 9);
        assert!(result.reachable());
        assert_eq!(
            prober.calls,
            vec![(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 10)]
        );
    }

    #[test]
    fn exhausted_budget_is_unreachable() {
        let mut prober = Scripted {
            successes: 0,
            calls: Vec::new(),
        };
        let outcome = probe_relay(&monitored("10.0.0.1"), &mut prober, budget()).unwrap();
        assert!(outcome.unreachable());
    }

    #[test]
    fn invalid_address_is_not_probed() {
        let mut prober = Scripted {
            successes: 0,
            calls: Vec::new(),
        };
        let outcome = probe_relay(&monitored("300.1.1.1"), &mut prober, budget()).unwrap();

        assert_eq!(outcome, ProbeOutcome::InvalidAddress("300.1.1.1".to_string()));
        assert!(!outcome.unreachable());
        assert!(prober.calls.is_empty());
    }

    #[test]
    fn unmonitored_relays_are_skipped() {
        let mut prober = Scripted {
            successes: 0,
            calls: Vec::new(),
        };
        let mut relay = monitored("10.0.0.1");
        relay.ping_enabled = false;
        assert!(probe_relay(&relay, &mut prober, budget()).is_none());

        let relay = monitored("");
        assert!(probe_relay(&relay, &mut prober, budget()).is_none());
        assert!(prober.calls.is_empty());
    }

    #[test]
    fn accepts_ipv6_hosts() {
        assert!(parse_monitor_address(" fe80::1 ").is_some());
        assert!(parse_monitor_address("router.local").is_none());
    }
}
