//! API lease tracking
//!
//! A lease is a time-bounded grant from the server allowing this client to
//! talk to it. It can lapse while the socket stays up, so validity is tracked
//! separately from the connection. A zero duration disables leasing.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::sync::lock;

pub struct LeaseManager {
    duration: Duration,
    expires_at: Mutex<Option<Instant>>,
}

impl LeaseManager {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            expires_at: Mutex::new(None),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        !self.duration.is_zero()
    }

    /// Requested lease length
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// How often to renew: half the lease, so one missed renewal is survivable
    pub fn renewal_interval(&self) -> Duration {
        self.duration / 2
    }

    /// Always true when leasing is disabled
    pub fn is_valid(&self) -> bool {
        if !self.is_enabled() {
            return true;
        }
        matches!(*lock(&self.expires_at), Some(at) if Instant::now() < at)
    }

    /// Time left on the current grant, `None` when disabled or never granted
    pub fn remaining(&self) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }
        lock(&self.expires_at).map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn record_grant(&self, granted: Duration) {
        *lock(&self.expires_at) = Some(Instant::now() + granted);
        debug!(granted_ms = granted.as_millis() as u64, "Lease granted");
    }

    /// Drop the current grant, e.g. when the server revokes it
    pub fn expire(&self) {
        *lock(&self.expires_at) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_lease_is_always_valid() {
        let lease = LeaseManager::disabled();
        assert!(lease.is_valid());
        assert!(lease.remaining().is_none());
    }

    #[test]
    fn test_enabled_lease_needs_a_grant() {
        let lease = LeaseManager::new(Duration::from_secs(60));
        assert!(!lease.is_valid());

        lease.record_grant(Duration::from_secs(60));
        assert!(lease.is_valid());
        assert!(lease.remaining().unwrap() > Duration::from_secs(59));
        assert_eq!(lease.renewal_interval(), Duration::from_secs(30));

        lease.expire();
        assert!(!lease.is_valid());
    }

    #[test]
    fn test_zero_grant_is_immediately_expired() {
        let lease = LeaseManager::new(Duration::from_secs(60));
        lease.record_grant(Duration::ZERO);
        assert!(!lease.is_valid());
    }
}
