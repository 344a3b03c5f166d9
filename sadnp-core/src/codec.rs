//! Challenge codec
//!
//! Builds and verifies the challenge, reply, key status and error objects,
//! delegating MAC computation and key wrap/unwrap to the crypto provider.
//! The MAC over a challenge reply covers the serialized challenge followed
//! by the associated request fragment; the MAC over an aggressive mode
//! request covers the last challenge, the aggressive CSQ and the fragment
//! up to the trailing MAC object.

use crate::crypto::{CryptoProvider, KeyWrapAlgorithm, MacAlgorithm};
use crate::error::{Error, Result};
use crate::objects::{
    AuthErrorCode, Challenge, ChallengeReply, ErrorObject, SessionKeyStatus, dnp3_time_now,
    CHALLENGE_REASON_CRITICAL,
};

/// Why a challenge is being issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengePurpose {
    /// A reply is required before the pending request is processed
    ReplyRequired,
    /// Challenge issued ahead of an application confirm
    PreChallengeForConfirm,
    /// Opens an aggressive mode sequence
    AggressiveModeStart,
    /// Closes an aggressive mode sequence
    AggressiveModeEnd,
}

impl ChallengePurpose {
    fn reason(&self) -> u8 {
        match self {
            // The registry defines a single reason today; the purpose still
            // selects which sequence bookkeeping the state machine applies.
            ChallengePurpose::ReplyRequired
            | ChallengePurpose::PreChallengeForConfirm
            | ChallengePurpose::AggressiveModeStart
            | ChallengePurpose::AggressiveModeEnd => CHALLENGE_REASON_CRITICAL,
        }
    }
}

/// Outcome of verifying a reply or aggressive mode MAC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    MacMismatch,
    SequenceMismatch,
}

/// Builds and verifies authentication objects for one session
pub struct ChallengeCodec {
    challenge_data_len: usize,
    mac_algorithm: MacAlgorithm,
}

impl ChallengeCodec {
    pub fn new(challenge_data_len: usize, mac_algorithm: MacAlgorithm) -> Self {
        Self {
            challenge_data_len,
            mac_algorithm,
        }
    }

    pub fn mac_algorithm(&self) -> MacAlgorithm {
        self.mac_algorithm
    }

    /// Build a challenge with fresh random data. Returns the object and its
    /// serialized bytes; the caller records the bytes as the last challenge
    /// sent for later verification.
    pub fn build_challenge(
        &self,
        crypto: &dyn CryptoProvider,
        csq: u32,
        user: u16,
        purpose: ChallengePurpose,
    ) -> Result<(Challenge, Vec<u8>)> {
        let mut challenge_data = vec![0u8; self.challenge_data_len];
        crypto.fill_random(&mut challenge_data)?;
        let challenge = Challenge {
            csq,
            user,
            mac_algorithm: self.mac_algorithm.code(),
            reason: purpose.reason(),
            challenge_data,
        };
        let bytes = challenge.serialize()?;
        Ok((challenge, bytes))
    }

    fn reply_mac_input(challenge_bytes: &[u8], request_bytes: &[u8]) -> Vec<u8> {
        let mut input = Vec::with_capacity(challenge_bytes.len() + request_bytes.len());
        input.extend_from_slice(challenge_bytes);
        input.extend_from_slice(request_bytes);
        input
    }

    /// Verify a challenge reply against the last challenge sent and the
    /// pending request it authenticates.
    pub fn verify_reply(
        &self,
        crypto: &dyn CryptoProvider,
        control_key: &[u8],
        last_challenge_bytes: &[u8],
        expected_csq: u32,
        expected_user: u16,
        reply: &ChallengeReply,
        associated_request_bytes: &[u8],
    ) -> Result<Verification> {
        if reply.csq != expected_csq || reply.user != expected_user {
            return Ok(Verification::SequenceMismatch);
        }
        let input = Self::reply_mac_input(last_challenge_bytes, associated_request_bytes);
        match crypto.verify_mac(self.mac_algorithm, control_key, &input, &reply.mac) {
            Ok(true) => Ok(Verification::Verified),
            Ok(false) => Ok(Verification::MacMismatch),
            // Wrong MAC length is a protocol error but still a failed reply
            Err(Error::Protocol(_)) => Ok(Verification::MacMismatch),
            Err(e) => Err(e),
        }
    }

    /// Build the reply to a challenge received from the master, MACed with
    /// the monitor-direction key.
    pub fn build_reply(
        &self,
        crypto: &dyn CryptoProvider,
        monitor_key: &[u8],
        challenge: &Challenge,
        associated_bytes: &[u8],
    ) -> Result<ChallengeReply> {
        let algorithm = MacAlgorithm::from_code(challenge.mac_algorithm)?;
        let challenge_bytes = challenge.serialize()?;
        let input = Self::reply_mac_input(&challenge_bytes, associated_bytes);
        let mac = crypto.compute_mac(algorithm, monitor_key, &input)?;
        Ok(ChallengeReply {
            csq: challenge.csq,
            user: challenge.user,
            mac,
        })
    }

    fn aggressive_mac_input(
        last_challenge_bytes: &[u8],
        csq: u32,
        fragment_prefix: &[u8],
    ) -> Vec<u8> {
        let mut input =
            Vec::with_capacity(last_challenge_bytes.len() + 4 + fragment_prefix.len());
        input.extend_from_slice(last_challenge_bytes);
        input.extend_from_slice(&csq.to_le_bytes());
        input.extend_from_slice(fragment_prefix);
        input
    }

    /// Verify the trailing MAC of an aggressive mode fragment.
    pub fn verify_aggressive(
        &self,
        crypto: &dyn CryptoProvider,
        control_key: &[u8],
        last_challenge_bytes: &[u8],
        csq: u32,
        expected_csq: u32,
        fragment_prefix: &[u8],
        mac: &[u8],
    ) -> Result<Verification> {
        if csq != expected_csq {
            return Ok(Verification::SequenceMismatch);
        }
        let input = Self::aggressive_mac_input(last_challenge_bytes, csq, fragment_prefix);
        match crypto.verify_mac(self.mac_algorithm, control_key, &input, mac) {
            Ok(true) => Ok(Verification::Verified),
            Ok(false) => Ok(Verification::MacMismatch),
            Err(Error::Protocol(_)) => Ok(Verification::MacMismatch),
            Err(e) => Err(e),
        }
    }

    /// Compute the MAC a well-behaved master would attach, for tooling and
    /// tests.
    pub fn compute_reply_mac(
        &self,
        crypto: &dyn CryptoProvider,
        control_key: &[u8],
        challenge_bytes: &[u8],
        associated_request_bytes: &[u8],
    ) -> Result<Vec<u8>> {
        let input = Self::reply_mac_input(challenge_bytes, associated_request_bytes);
        crypto.compute_mac(self.mac_algorithm, control_key, &input)
    }

    /// Compute the aggressive-mode MAC a master would place in g120v9.
    pub fn compute_aggressive_mac(
        &self,
        crypto: &dyn CryptoProvider,
        control_key: &[u8],
        last_challenge_bytes: &[u8],
        csq: u32,
        fragment_prefix: &[u8],
    ) -> Result<Vec<u8>> {
        let input = Self::aggressive_mac_input(last_challenge_bytes, csq, fragment_prefix);
        crypto.compute_mac(self.mac_algorithm, control_key, &input)
    }

    /// Build a v7 error object stamped with the current time.
    pub fn build_error(
        &self,
        seq: u32,
        user: u16,
        association_id: u16,
        error_code: AuthErrorCode,
        text: &str,
    ) -> ErrorObject {
        ErrorObject {
            seq,
            user,
            association_id,
            error_code: error_code as u8,
            time_of_error: dnp3_time_now(),
            error_text: text.as_bytes().to_vec(),
        }
    }

    /// Build a key status object with fresh challenge data. The MAC, when
    /// required by the variant, covers the serialized status with an empty
    /// MAC field.
    pub fn build_key_status(
        &self,
        crypto: &dyn CryptoProvider,
        ksq: u32,
        user: u16,
        key_wrap_algorithm: KeyWrapAlgorithm,
        key_status: u8,
        monitor_key: Option<&[u8]>,
    ) -> Result<SessionKeyStatus> {
        let mut challenge_data = vec![0u8; self.challenge_data_len];
        crypto.fill_random(&mut challenge_data)?;
        let mut status = SessionKeyStatus {
            ksq,
            user,
            key_wrap_algorithm: key_wrap_algorithm.code(),
            key_status,
            mac_algorithm: self.mac_algorithm.code(),
            challenge_data,
            mac: Vec::new(),
        };
        if let Some(key) = monitor_key {
            let unmacced = status.serialize()?;
            status.mac = crypto.compute_mac(self.mac_algorithm, key, &unmacced)?;
        }
        Ok(status)
    }
}

/// Layout of the plaintext inside g120v6 wrapped key data: key length,
/// control key, monitor key, the key status challenge data being answered,
/// zero padding to the key wrap block size.
pub fn encode_session_keys(
    control: &[u8],
    monitor: &[u8],
    status_challenge: &[u8],
) -> Result<Vec<u8>> {
    if control.len() != monitor.len() || control.is_empty() {
        return Err(Error::KeyLifecycle(
            "Control and monitor keys must be non-empty and equal length".to_string(),
        ));
    }
    let mut blob =
        Vec::with_capacity(2 + control.len() + monitor.len() + status_challenge.len() + 8);
    blob.extend_from_slice(&(control.len() as u16).to_le_bytes());
    blob.extend_from_slice(control);
    blob.extend_from_slice(monitor);
    blob.extend_from_slice(status_challenge);
    while blob.len() % 8 != 0 {
        blob.push(0);
    }
    Ok(blob)
}

/// Parse unwrapped g120v6 key data, binding it to the challenge data from
/// the key status message it answers.
pub fn decode_session_keys(
    blob: &[u8],
    expected_challenge: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    if blob.len() < 2 {
        return Err(Error::KeyLifecycle("Key data too short".to_string()));
    }
    let key_len = u16::from_le_bytes([blob[0], blob[1]]) as usize;
    if key_len == 0 || blob.len() < 2 + 2 * key_len + expected_challenge.len() {
        return Err(Error::KeyLifecycle("Key data truncated".to_string()));
    }
    let control = blob[2..2 + key_len].to_vec();
    let monitor = blob[2 + key_len..2 + 2 * key_len].to_vec();
    let challenge_start = 2 + 2 * key_len;
    let challenge = &blob[challenge_start..challenge_start + expected_challenge.len()];
    if challenge != expected_challenge {
        return Err(Error::Authentication(
            "Key change does not answer the last key status challenge".to_string(),
        ));
    }
    Ok((control, monitor))
}

/// Layout of the plaintext inside g120v13 encrypted update key data: key
/// length, the new update key, the outstation challenge being answered,
/// zero padding to the key wrap block size.
pub fn encode_update_key(update_key: &[u8], outstation_challenge: &[u8]) -> Result<Vec<u8>> {
    if update_key.is_empty() {
        return Err(Error::KeyLifecycle("Update key must be non-empty".to_string()));
    }
    let mut blob = Vec::with_capacity(2 + update_key.len() + outstation_challenge.len() + 8);
    blob.extend_from_slice(&(update_key.len() as u16).to_le_bytes());
    blob.extend_from_slice(update_key);
    blob.extend_from_slice(outstation_challenge);
    while blob.len() % 8 != 0 {
        blob.push(0);
    }
    Ok(blob)
}

/// Parse unwrapped g120v13 key data, binding it to the outstation challenge
/// issued in the update key change reply.
pub fn decode_update_key(blob: &[u8], expected_challenge: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < 2 {
        return Err(Error::KeyLifecycle("Update key data too short".to_string()));
    }
    let key_len = u16::from_le_bytes([blob[0], blob[1]]) as usize;
    if key_len == 0 || blob.len() < 2 + key_len + expected_challenge.len() {
        return Err(Error::KeyLifecycle("Update key data truncated".to_string()));
    }
    let key = blob[2..2 + key_len].to_vec();
    let challenge = &blob[2 + key_len..2 + key_len + expected_challenge.len()];
    if challenge != expected_challenge {
        return Err(Error::Authentication(
            "Update key change does not answer the outstation challenge".to_string(),
        ));
    }
    Ok(key)
}
