//! Defender interface: the banning subsystem consumed by admission.
//!
//! Front-ends only report events and ask whether an address is banned;
//! scoring and ban bookkeeping live behind the trait.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::user::Protocol;

/// Events the authentication and admission layers report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    LoginFailed,
    UserNotFound,
    NoLoginTried,
    LimitExceeded,
}

impl HostEvent {
    /// Relative weight of the event towards a ban.
    pub fn score(&self) -> u32 {
        match self {
            HostEvent::LoginFailed => 1,
            HostEvent::UserNotFound | HostEvent::NoLoginTried => 2,
            HostEvent::LimitExceeded => 3,
        }
    }
}

pub trait Defender: Send + Sync {
    fn add_event(&self, ip: IpAddr, protocol: Protocol, event: HostEvent);
    fn is_banned(&self, ip: IpAddr) -> bool;
}

/// Defender that never bans. Used when banning is disabled.
#[derive(Default)]
pub struct NullDefender;

impl Defender for NullDefender {
    fn add_event(&self, _ip: IpAddr, _protocol: Protocol, _event: HostEvent) {}

    fn is_banned(&self, _ip: IpAddr) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct MemoryDefenderConfig {
    /// Accumulated score that triggers a ban
    pub score_threshold: u32,
    /// How long events count towards the score
    pub observation_window: Duration,
    /// How long a ban lasts
    pub ban_duration: Duration,
}

impl Default for MemoryDefenderConfig {
    fn default() -> Self {
        Self {
            score_threshold: 15,
            observation_window: Duration::from_secs(30 * 60),
            ban_duration: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Default)]
struct HostRecord {
    events: Vec<(Instant, u32)>,
    banned_until: Option<Instant>,
}

/// In-memory scoring [`Defender`].
pub struct MemoryDefender {
    config: MemoryDefenderConfig,
    hosts: Mutex<HashMap<IpAddr, HostRecord>>,
}

impl MemoryDefender {
    pub fn new(config: MemoryDefenderConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Current score for an address, expired events excluded.
    pub fn score(&self, ip: IpAddr) -> u32 {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = Instant::now() - self.config.observation_window;
        match hosts.get_mut(&ip) {
            Some(record) => {
                record.events.retain(|(at, _)| *at >= cutoff);
                record.events.iter().map(|(_, s)| s).sum()
            }
            None => 0,
        }
    }
}

impl Default for MemoryDefender {
    fn default() -> Self {
        Self::new(MemoryDefenderConfig::default())
    }
}

impl Defender for MemoryDefender {
    fn add_event(&self, ip: IpAddr, protocol: Protocol, event: HostEvent) {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let record = hosts.entry(ip).or_default();
        let now = Instant::now();
        let cutoff = now - self.config.observation_window;
        record.events.retain(|(at, _)| *at >= cutoff);
        record.events.push((now, event.score()));
        let total: u32 = record.events.iter().map(|(_, s)| s).sum();
        debug!(%ip, %protocol, ?event, total, "defender event");
        if total >= self.config.score_threshold && record.banned_until.is_none() {
            record.banned_until = Some(now + self.config.ban_duration);
            warn!(%ip, total, "address banned");
        }
    }

    fn is_banned(&self, ip: IpAddr) -> bool {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        match hosts.get_mut(&ip) {
            Some(record) => match record.banned_until {
                Some(until) if Instant::now() < until => true,
                Some(_) => {
                    record.banned_until = None;
                    record.events.clear();
                    false
                }
                None => false,
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_ban_after_threshold() {
        let defender = MemoryDefender::new(MemoryDefenderConfig {
            score_threshold: 4,
            ..Default::default()
        });
        assert!(!defender.is_banned(ip(1)));
        defender.add_event(ip(1), Protocol::Ssh, HostEvent::UserNotFound);
        assert!(!defender.is_banned(ip(1)));
        defender.add_event(ip(1), Protocol::Ssh, HostEvent::UserNotFound);
        assert!(defender.is_banned(ip(1)));
        // other addresses are unaffected
        assert!(!defender.is_banned(ip(2)));
    }

    #[test]
    fn test_ban_expires() {
        let defender = MemoryDefender::new(MemoryDefenderConfig {
            score_threshold: 1,
            ban_duration: Duration::from_millis(0),
            ..Default::default()
        });
        defender.add_event(ip(3), Protocol::Ssh, HostEvent::LoginFailed);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!defender.is_banned(ip(3)));
        assert_eq!(defender.score(ip(3)), 0);
    }

    #[test]
    fn test_event_scores() {
        assert_eq!(HostEvent::LoginFailed.score(), 1);
        assert_eq!(HostEvent::UserNotFound.score(), 2);
        assert_eq!(HostEvent::NoLoginTried.score(), 2);
        assert_eq!(HostEvent::LimitExceeded.score(), 3);
    }

    #[test]
    fn test_null_defender() {
        let defender = NullDefender;
        defender.add_event(ip(4), Protocol::Ssh, HostEvent::LimitExceeded);
        assert!(!defender.is_banned(ip(4)));
    }
}
