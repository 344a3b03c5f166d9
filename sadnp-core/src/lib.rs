//! sadnp-core - DNP3 Secure Authentication outstation engine
//!
//! This crate implements the outstation side of the DNP3 Secure
//! Authentication extension: classification of critical requests, challenge
//! generation and verification, session key issuance and expiry, per-user
//! key contexts and the security statistics with their exceeds-maximum
//! behaviors. Link/transport framing, general application-layer processing
//! and master-side behavior are out of scope; the host integrates through
//! [`engine::Fragment`] and [`engine::Action`].

pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod keys;
pub mod objects;
pub mod pending;
pub mod stats;
pub mod store;

// Re-export commonly used types
pub use codec::{ChallengeCodec, ChallengePurpose, Verification};
pub use config::{SaConfig, SaVariant};
pub use crypto::{CryptoProvider, KeyWrapAlgorithm, MacAlgorithm, SoftwareCrypto};
pub use engine::{Action, AuthState, Fragment, SecureAuthEngine, WireObject};
pub use error::{Error, Result};
pub use keys::{UserContext, UserKeyStore};
pub use objects::{AuthErrorCode, AuthObject, KeyStatusCode};
pub use pending::{PendingBuffer, PendingRequest};
pub use stats::{StatId, StatisticsMonitor};
pub use store::{FileStore, MemoryStore, StatStore};

/// User number challenged when a critical request carries no explicit user
pub const DEFAULT_USER_NUMBER: u16 = 1;

/// Maximum application fragment size, bounding the pending request buffer
pub const MAX_FRAGMENT_SIZE: usize = 2048;

/// Maximum size of a single Group 120 object; oversized input is a hard
/// parse failure
pub const MAX_OBJECT_SIZE: usize = MAX_FRAGMENT_SIZE;

/// Minimum random challenge data length in octets
pub const MIN_CHALLENGE_DATA_LEN: usize = 4;

/// Maximum random challenge data length in octets
pub const MAX_CHALLENGE_DATA_LEN: usize = 64;
