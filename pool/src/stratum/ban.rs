/// Temporary IP bans
///
/// Every failure (malformed line, unknown method, bad params) bumps a
/// per-IP counter and pushes its expiry 60 s out. An IP whose counter is
/// above the threshold is banned until the counter expires.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::metrics::prometheus as metrics;

pub const BAN_THRESHOLD: u32 = 50;
pub const BAN_WINDOW: Duration = Duration::from_secs(60);
pub const BAN_MESSAGE: &str = "Your IP Is Temporary banned. DDoS attack is suspected.";

#[derive(Debug)]
pub struct BanList {
    failures: Mutex<HashMap<IpAddr, (u32, Instant)>>,
    threshold: u32,
    window: Duration,
}

impl Default for BanList {
    fn default() -> Self {
        Self::new(BAN_THRESHOLD, BAN_WINDOW)
    }
}

impl BanList {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self { failures: Mutex::new(HashMap::new()), threshold, window }
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, HashMap<IpAddr, (u32, Instant)>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_failure(&self, ip: IpAddr) {
        self.record_failure_at(ip, Instant::now());
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.is_banned_at(ip, Instant::now())
    }

    fn record_failure_at(&self, ip: IpAddr, now: Instant) {
        let mut failures = self.failures();
        let entry = failures.entry(ip).or_insert((0, now));
        // expired counters restart from zero
        if entry.1 <= now {
            entry.0 = 0;
        }
        entry.0 += 1;
        entry.1 = now + self.window;
        if entry.0 == self.threshold + 1 {
            metrics::inc_bans();
            tracing::warn!("🚫 Banning {} for {:?} after {} failures", ip, self.window, entry.0);
        }
    }

    fn is_banned_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut failures = self.failures();
        match failures.get(&ip) {
            Some((_, expiry)) if *expiry <= now => {
                failures.remove(&ip);
                false
            }
            Some((count, _)) => *count > self.threshold,
            None => false,
        }
    }

    /// Drop expired counters. Called on every updater tick.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        self.failures().retain(|_, (_, expiry)| *expiry > now);
    }

    /// Number of IPs with a live failure counter.
    pub fn tracked(&self) -> usize {
        self.failures().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_banned_above_threshold() {
        let bans = BanList::default();
        let now = Instant::now();
        for _ in 0..BAN_THRESHOLD {
            bans.record_failure_at(ip(), now);
        }
        assert!(!bans.is_banned_at(ip(), now));
        bans.record_failure_at(ip(), now);
        assert!(bans.is_banned_at(ip(), now));
        assert!(!bans.is_banned_at("10.0.0.2".parse().unwrap(), now));
    }

    #[test]
    fn test_ban_expires_after_quiet_window() {
        let bans = BanList::new(2, Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0..3 {
            bans.record_failure_at(ip(), now);
        }
        assert!(bans.is_banned_at(ip(), now + Duration::from_secs(59)));
        assert!(!bans.is_banned_at(ip(), now + Duration::from_secs(60)));
    }

    #[test]
    fn test_each_failure_extends_window() {
        let bans = BanList::new(2, Duration::from_secs(60));
        let start = Instant::now();
        bans.record_failure_at(ip(), start);
        bans.record_failure_at(ip(), start + Duration::from_secs(50));
        bans.record_failure_at(ip(), start + Duration::from_secs(100));
        assert!(bans.is_banned_at(ip(), start + Duration::from_secs(120)));
    }

    #[test]
    fn test_counter_restarts_after_expiry() {
        let bans = BanList::new(2, Duration::from_secs(60));
        let start = Instant::now();
        bans.record_failure_at(ip(), start);
        bans.record_failure_at(ip(), start);
        let later = start + Duration::from_secs(61);
        bans.record_failure_at(ip(), later);
        assert!(!bans.is_banned_at(ip(), later));
    }

    #[test]
    fn test_sweep_evicts_peers_that_never_return() {
        let bans = BanList::new(2, Duration::from_secs(60));
        let start = Instant::now();
        let stale: IpAddr = "10.0.0.9".parse().unwrap();
        bans.record_failure_at(stale, start);
        bans.record_failure_at(ip(), start + Duration::from_secs(30));
        assert_eq!(bans.tracked(), 2);

        bans.sweep_at(start + Duration::from_secs(61));
        assert_eq!(bans.tracked(), 1);
        assert!(bans.failures().get(&stale).is_none());
        bans.record_failure_at(ip(), start + Duration::from_secs(61));
        assert_eq!(bans.failures().get(&ip()).map(|(count, _)| *count), Some(2));
    }
}
