//! Per-user key contexts and the user key store
//!
//! One [`UserContext`] exists per authorized user number. Session keys are
//! owned by the context and zeroized whenever they are replaced or
//! invalidated; installation is atomic, either both direction keys are
//! replaced and the status set OK, or nothing changes.

use crate::crypto::KeyWrapAlgorithm;
use crate::error::{Error, Result};
use crate::objects::KeyStatusCode;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

/// Control- and monitor-direction session keys
#[derive(Debug, Zeroize)]
#[zeroize(drop)]
pub struct SessionKeys {
    /// Key for master-to-outstation traffic
    pub control: Vec<u8>,
    /// Key for outstation-to-master traffic
    pub monitor: Vec<u8>,
}

/// Per-user authentication state
#[derive(Debug)]
pub struct UserContext {
    user: u16,
    pub(crate) keys: Option<SessionKeys>,
    pub(crate) key_wrap: KeyWrapAlgorithm,
    pub(crate) status: KeyStatusCode,
    /// Last accepted key change sequence number
    pub(crate) key_change_seq: u32,
    /// ASDUs authenticated since the last key change
    pub(crate) asdu_count: u32,
    /// Key status requests received in the current key change interval
    pub(crate) key_status_requests: u32,
    /// Session key expiry deadline
    pub(crate) key_expiry: Option<Instant>,
    /// Challenge data from the last key status sent, bound into key changes
    pub(crate) status_challenge: Vec<u8>,
    /// Last key status message sent, verbatim, re-sendable
    pub(crate) last_key_status: Option<Vec<u8>>,
    /// Last key change message received, verbatim, for duplicate detection
    pub(crate) last_key_change: Option<Vec<u8>>,
    /// Long-lived update key delivering new session keys
    pub(crate) update_key: Option<Zeroizing<Vec<u8>>>,
    /// A challenge reply from this user has verified at least once;
    /// gates aggressive mode against the bootstrap attack window
    pub(crate) rcvd_valid_reply: bool,
    /// Last accepted user status change sequence number
    pub(crate) status_change_seq: u32,
}

impl UserContext {
    fn new(user: u16, key_wrap: KeyWrapAlgorithm) -> Self {
        Self {
            user,
            keys: None,
            key_wrap,
            status: KeyStatusCode::NotInit,
            key_change_seq: 0,
            asdu_count: 0,
            key_status_requests: 0,
            key_expiry: None,
            status_challenge: Vec::new(),
            last_key_status: None,
            last_key_change: None,
            update_key: None,
            rcvd_valid_reply: false,
            status_change_seq: 0,
        }
    }

    pub fn user_number(&self) -> u16 {
        self.user
    }

    pub fn key_status(&self) -> KeyStatusCode {
        self.status
    }

    pub fn key_change_sequence(&self) -> u32 {
        self.key_change_seq
    }

    pub fn has_session_keys(&self) -> bool {
        self.keys.is_some()
    }

    pub fn has_update_key(&self) -> bool {
        self.update_key.is_some()
    }
}

/// Collection of user contexts, bounded by the configured maximum
pub struct UserKeyStore {
    max_users: usize,
    key_wrap: KeyWrapAlgorithm,
    users: HashMap<u16, UserContext>,
}

impl UserKeyStore {
    pub fn new(max_users: usize, key_wrap: KeyWrapAlgorithm) -> Self {
        Self {
            max_users,
            key_wrap,
            users: HashMap::new(),
        }
    }

    /// Fetch the context for a user number, creating a NOT-INIT context on
    /// first reference. Fails once the configured user limit is reached.
    pub fn lookup(&mut self, user: u16) -> Result<&mut UserContext> {
        if !self.users.contains_key(&user) {
            if self.users.len() >= self.max_users {
                return Err(Error::ResourceExhaustion(format!(
                    "User limit {} reached; cannot create user {}",
                    self.max_users, user
                )));
            }
            self.users.insert(user, UserContext::new(user, self.key_wrap));
        }
        Ok(self.users.get_mut(&user).expect("just inserted"))
    }

    /// Fetch an existing context without creating one.
    pub fn get(&self, user: u16) -> Option<&UserContext> {
        self.users.get(&user)
    }

    /// Install both direction keys atomically and set status OK.
    pub fn install_keys(
        &mut self,
        user: u16,
        control: Vec<u8>,
        monitor: Vec<u8>,
        now: Instant,
        expiry_interval: Duration,
    ) -> Result<()> {
        if control.is_empty() || monitor.is_empty() {
            return Err(Error::KeyLifecycle(
                "Session keys must be non-empty".to_string(),
            ));
        }
        let context = self.lookup(user)?;
        context.keys = Some(SessionKeys { control, monitor });
        context.status = KeyStatusCode::Ok;
        context.asdu_count = 0;
        context.key_expiry = Some(now + expiry_interval);
        debug!(user, "session keys installed");
        Ok(())
    }

    /// Zeroize session keys and record the given status.
    pub fn invalidate_keys(&mut self, user: u16, status: KeyStatusCode) {
        if let Some(context) = self.users.get_mut(&user) {
            // SessionKeys zeroizes on drop
            context.keys = None;
            context.status = status;
            context.key_expiry = None;
            context.asdu_count = 0;
            debug!(user, ?status, "session keys invalidated");
        }
    }

    /// Advance the key change sequence number. Strictly monotonic per user,
    /// wrapping over the full 32-bit field.
    pub fn advance_key_change_sequence(&mut self, user: u16) -> Result<u32> {
        let context = self.lookup(user)?;
        context.key_change_seq = context.key_change_seq.wrapping_add(1);
        Ok(context.key_change_seq)
    }

    /// Count one authenticated ASDU; true when the key change count is
    /// exceeded and the session keys must be considered expired.
    pub fn increment_asdu_count(&mut self, user: u16, max: u32) -> Result<bool> {
        let context = self.lookup(user)?;
        context.asdu_count = context.asdu_count.saturating_add(1);
        Ok(context.asdu_count > max)
    }

    /// Provision the long-lived update key for a user.
    pub fn provision_update_key(&mut self, user: u16, key: Vec<u8>) -> Result<()> {
        let context = self.lookup(user)?;
        context.update_key = Some(Zeroizing::new(key));
        Ok(())
    }

    /// Remove a user entirely (user status change delete operation).
    pub fn remove_user(&mut self, user: u16) -> Result<()> {
        self.users
            .remove(&user)
            .map(|_| ())
            .ok_or_else(|| Error::Protocol(format!("Unknown user: {}", user)))
    }

    /// Users whose expected session key deadline has passed.
    pub fn expired_users(&self, now: Instant) -> Vec<u16> {
        let mut expired: Vec<u16> = self
            .users
            .values()
            .filter(|c| c.key_expiry.is_some_and(|deadline| now >= deadline))
            .map(|c| c.user)
            .collect();
        expired.sort_unstable();
        expired
    }

    /// Start a new key change interval: per-interval counters reset.
    pub fn reset_interval_counters(&mut self) {
        for context in self.users.values_mut() {
            context.key_status_requests = 0;
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn user_numbers(&self) -> Vec<u16> {
        let mut numbers: Vec<u16> = self.users.keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> UserKeyStore {
        UserKeyStore::new(2, KeyWrapAlgorithm::Aes128)
    }

    #[test]
    fn test_lookup_creates_not_init_context() {
        let mut store = store();
        let context = store.lookup(1).unwrap();
        assert_eq!(context.key_status(), KeyStatusCode::NotInit);
        assert!(!context.has_session_keys());
    }

    #[test]
    fn test_user_limit_enforced() {
        let mut store = store();
        store.lookup(1).unwrap();
        store.lookup(2).unwrap();
        let err = store.lookup(3).unwrap_err();
        assert!(matches!(err, Error::ResourceExhaustion(_)));
        // Existing users still resolve
        assert!(store.lookup(1).is_ok());
    }

    #[test]
    fn test_install_and_invalidate_keys() {
        let mut store = store();
        let now = Instant::now();
        store
            .install_keys(1, vec![1; 16], vec![2; 16], now, Duration::from_secs(60))
            .unwrap();
        assert_eq!(store.get(1).unwrap().key_status(), KeyStatusCode::Ok);
        assert!(store.get(1).unwrap().has_session_keys());

        store.invalidate_keys(1, KeyStatusCode::NotInit);
        assert_eq!(store.get(1).unwrap().key_status(), KeyStatusCode::NotInit);
        assert!(!store.get(1).unwrap().has_session_keys());
    }

    #[test]
    fn test_install_rejects_empty_keys() {
        let mut store = store();
        let now = Instant::now();
        assert!(store
            .install_keys(1, vec![], vec![2; 16], now, Duration::from_secs(60))
            .is_err());
        // Nothing was created with keys
        assert!(!store.get(1).is_some_and(|c| c.has_session_keys()));
    }

    #[test]
    fn test_key_change_sequence_wraps() {
        let mut store = store();
        store.lookup(1).unwrap().key_change_seq = u32::MAX;
        assert_eq!(store.advance_key_change_sequence(1).unwrap(), 0);
        assert_eq!(store.advance_key_change_sequence(1).unwrap(), 1);
    }

    #[test]
    fn test_asdu_count_threshold() {
        let mut store = store();
        assert!(!store.increment_asdu_count(1, 2).unwrap());
        assert!(!store.increment_asdu_count(1, 2).unwrap());
        assert!(store.increment_asdu_count(1, 2).unwrap());
    }

    #[test]
    fn test_expired_users() {
        let mut store = store();
        let now = Instant::now();
        store
            .install_keys(1, vec![1; 16], vec![2; 16], now, Duration::from_secs(1))
            .unwrap();
        assert!(store.expired_users(now).is_empty());
        assert_eq!(
            store.expired_users(now + Duration::from_secs(2)),
            vec![1]
        );
    }
}
