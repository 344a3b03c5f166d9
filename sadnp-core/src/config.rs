//! Per-session secure authentication configuration
//!
//! Loaded once when a session with authentication enabled is opened.

use crate::crypto::{KeyWrapAlgorithm, MacAlgorithm};
use crate::error::{Error, Result};
use crate::stats::StatId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Protocol variant selected at session configuration time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaVariant {
    /// Symmetric-key only, no aggressive mode
    V2,
    /// Aggressive mode, key status MACs, update key exchange
    V5,
}

/// Default critical function codes: controls, restarts, writes and the
/// other request types whose execution requires proof of authenticity.
pub const DEFAULT_CRITICAL_FCS: &[u8] = &[
    2,  // WRITE
    3,  // SELECT
    4,  // OPERATE
    5,  // DIRECT_OPERATE
    6,  // DIRECT_OPERATE_NO_RESP
    13, // COLD_RESTART
    14, // WARM_RESTART
    15, // INITIALIZE_DATA
    16, // INITIALIZE_APPL
    17, // START_APPL
    18, // STOP_APPL
    19, // SAVE_CONFIG
    25, // OPEN_FILE
    27, // DELETE_FILE
    29, // ACTIVATE_CONFIG
    31, // AUTH_REQUEST_NO_ACK
];

/// A provisioned user: number plus the long-lived update key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// User number (1 is the default user)
    pub number: u16,
    /// Update key as hex; length must match the key wrap algorithm
    pub update_key: String,
}

/// An informational threshold for one statistic
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrdinaryThreshold {
    pub stat: StatId,
    pub threshold: u32,
}

/// Statistics thresholds and the four distinguished maximum values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatThresholds {
    /// Informational thresholds; crossing is report-only
    #[serde(default)]
    pub ordinary: Vec<OrdinaryThreshold>,
    /// Max authentication failures before the one-shot device action
    pub max_authentication_failures: u32,
    /// Max reply timeouts before the one-shot device action
    pub max_reply_timeouts: u32,
    /// Max rekeys-due-to-failure before the one-shot device action
    pub max_rekeys_due_to_failure: u32,
    /// Max error messages sent before the one-shot device action
    pub max_error_messages_sent: u32,
}

impl Default for StatThresholds {
    fn default() -> Self {
        Self {
            ordinary: Vec::new(),
            max_authentication_failures: 5,
            max_reply_timeouts: 3,
            max_rekeys_due_to_failure: 3,
            max_error_messages_sent: 10,
        }
    }
}

/// Secure authentication session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaConfig {
    /// Protocol variant
    pub variant: SaVariant,
    /// Association id reported in error objects
    pub association_id: u16,
    /// Maximum number of user contexts
    pub max_users: usize,
    /// Random challenge data length in octets
    pub challenge_data_len: usize,
    /// Reply timer for outstanding challenges, seconds
    pub reply_timeout_secs: u64,
    /// Session key change interval, seconds
    pub key_change_interval_secs: u64,
    /// ASDU count triggering session key expiry
    pub max_key_change_count: u32,
    /// Key status requests tolerated per key change interval
    pub max_key_status_requests: u32,
    /// Error objects transmitted per key change interval
    pub max_error_count: u32,
    /// Re-challenges after a failed reply before giving up
    pub max_rechallenges: u32,
    /// Consecutive application-confirm timeouts treated as comm failure
    pub max_comm_fail_confirms: u32,
    /// Negotiated MAC algorithm
    pub mac_algorithm: MacAlgorithm,
    /// Negotiated key wrap algorithm
    pub key_wrap_algorithm: KeyWrapAlgorithm,
    /// Aggressive mode enablement (SAv5 only)
    pub aggressive_mode_enabled: bool,
    /// Site-configured critical function codes beyond the default set
    #[serde(default)]
    pub additional_critical_fcs: Vec<u8>,
    /// Authority key for user status changes and update key delivery, hex
    #[serde(default)]
    pub authority_key: String,
    /// Provisioned users
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// Statistics thresholds
    #[serde(default)]
    pub thresholds: StatThresholds,
}

impl Default for SaConfig {
    fn default() -> Self {
        Self {
            variant: SaVariant::V5,
            association_id: 0,
            max_users: 16,
            challenge_data_len: 20,
            reply_timeout_secs: 2,
            key_change_interval_secs: 900,
            max_key_change_count: 1000,
            max_key_status_requests: 4,
            max_error_count: 2,
            max_rechallenges: 0,
            max_comm_fail_confirms: 3,
            mac_algorithm: MacAlgorithm::HmacSha256Trunc16,
            key_wrap_algorithm: KeyWrapAlgorithm::Aes128,
            aggressive_mode_enabled: true,
            additional_critical_fcs: Vec::new(),
            authority_key: String::new(),
            users: Vec::new(),
            thresholds: StatThresholds::default(),
        }
    }
}

impl SaConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SaConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check protocol-fixed bounds.
    pub fn validate(&self) -> Result<()> {
        if !(crate::MIN_CHALLENGE_DATA_LEN..=crate::MAX_CHALLENGE_DATA_LEN)
            .contains(&self.challenge_data_len)
        {
            return Err(Error::Config(format!(
                "Challenge data length {} outside {}..={}",
                self.challenge_data_len,
                crate::MIN_CHALLENGE_DATA_LEN,
                crate::MAX_CHALLENGE_DATA_LEN
            )));
        }
        if self.max_users == 0 {
            return Err(Error::Config("max_users must be at least 1".to_string()));
        }
        if self.max_rechallenges > 10 {
            return Err(Error::Config(format!(
                "max_rechallenges {} exceeds limit 10",
                self.max_rechallenges
            )));
        }
        if self.reply_timeout_secs == 0 {
            return Err(Error::Config("reply_timeout_secs must be non-zero".to_string()));
        }
        if self.variant == SaVariant::V2 && self.aggressive_mode_enabled {
            return Err(Error::Config(
                "Aggressive mode is not available in SAv2".to_string(),
            ));
        }
        if self.variant == SaVariant::V2 && self.mac_algorithm == MacAlgorithm::AesGmac {
            return Err(Error::Config("AES-GMAC is not available in SAv2".to_string()));
        }
        for user in &self.users {
            let key = hex::decode(&user.update_key)?;
            if key.len() != self.key_wrap_algorithm.key_len() {
                return Err(Error::Config(format!(
                    "Update key for user {} has {} octets, expected {}",
                    user.number,
                    key.len(),
                    self.key_wrap_algorithm.key_len()
                )));
            }
        }
        if !self.authority_key.is_empty() {
            hex::decode(&self.authority_key)?;
        }
        Ok(())
    }

    /// Reply timer as a duration.
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    /// Expected session key interval as a duration.
    pub fn key_change_interval(&self) -> Duration {
        Duration::from_secs(self.key_change_interval_secs)
    }

    /// Whether the function code is critical for this site.
    pub fn is_critical(&self, function_code: u8) -> bool {
        DEFAULT_CRITICAL_FCS.contains(&function_code)
            || self.additional_critical_fcs.contains(&function_code)
    }
}
