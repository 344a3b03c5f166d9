//! DNP3 Object Group 120 wire codecs
//!
//! This module defines the byte-exact encodings of the thirteen secure
//! authentication object variations. All multi-octet integers are
//! little-endian per the DNP3 application layer; timestamps are 48-bit
//! milliseconds since the UNIX epoch.
//!
//! Decoding enforces the configured maximum object size up front; an
//! oversized or short buffer is a hard parse failure.

use crate::error::{Error, Result};
use crate::MAX_OBJECT_SIZE;

/// Reason-for-challenge code carried in g120v1.
pub const CHALLENGE_REASON_CRITICAL: u8 = 1;

/// g120v7 error codes from the protocol registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthErrorCode {
    AuthenticationFailed = 1,
    UnexpectedReply = 2,
    NoResponse = 3,
    AggressiveModeNotSupported = 4,
    MacAlgorithmNotSupported = 5,
    KeyWrapAlgorithmNotSupported = 6,
    AuthorizationFailed = 7,
    UpdateKeyMethodNotPermitted = 8,
    InvalidSignature = 9,
    InvalidCertificationData = 10,
    UnknownUser = 11,
    MaxSessionKeyStatusRequestsExceeded = 12,
}

impl TryFrom<u8> for AuthErrorCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(AuthErrorCode::AuthenticationFailed),
            2 => Ok(AuthErrorCode::UnexpectedReply),
            3 => Ok(AuthErrorCode::NoResponse),
            4 => Ok(AuthErrorCode::AggressiveModeNotSupported),
            5 => Ok(AuthErrorCode::MacAlgorithmNotSupported),
            6 => Ok(AuthErrorCode::KeyWrapAlgorithmNotSupported),
            7 => Ok(AuthErrorCode::AuthorizationFailed),
            8 => Ok(AuthErrorCode::UpdateKeyMethodNotPermitted),
            9 => Ok(AuthErrorCode::InvalidSignature),
            10 => Ok(AuthErrorCode::InvalidCertificationData),
            11 => Ok(AuthErrorCode::UnknownUser),
            12 => Ok(AuthErrorCode::MaxSessionKeyStatusRequestsExceeded),
            _ => Err(Error::Protocol(format!("Unknown error code: {}", value))),
        }
    }
}

/// Key status codes carried in g120v5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyStatusCode {
    Ok = 1,
    NotInit = 2,
    CommFail = 3,
    AuthFail = 4,
}

impl TryFrom<u8> for KeyStatusCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(KeyStatusCode::Ok),
            2 => Ok(KeyStatusCode::NotInit),
            3 => Ok(KeyStatusCode::CommFail),
            4 => Ok(KeyStatusCode::AuthFail),
            _ => Err(Error::Protocol(format!("Unknown key status: {}", value))),
        }
    }
}

/// User status change operations carried in g120v10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UserOperation {
    Add = 1,
    Change = 2,
    Delete = 3,
}

impl TryFrom<u8> for UserOperation {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(UserOperation::Add),
            2 => Ok(UserOperation::Change),
            3 => Ok(UserOperation::Delete),
            _ => Err(Error::Protocol(format!("Unknown user operation: {}", value))),
        }
    }
}

/// Bounds-checked little-endian field reader.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() > MAX_OBJECT_SIZE {
            return Err(Error::Protocol(format!(
                "Object of {} octets exceeds maximum {}",
                data.len(),
                MAX_OBJECT_SIZE
            )));
        }
        Ok(Self { data, pos: 0 })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(Error::Protocol("Object truncated".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u48_le(&mut self) -> Result<u64> {
        let b = self.take(6)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], 0, 0]))
    }

    fn rest(&mut self) -> Vec<u8> {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice.to_vec()
    }
}

fn put_u48_le(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes()[..6]);
}

/// g120v1 — challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Challenge sequence number
    pub csq: u32,
    /// User number being challenged
    pub user: u16,
    /// MAC algorithm (MAL registry code)
    pub mac_algorithm: u8,
    /// Reason for challenge
    pub reason: u8,
    /// Random challenge data
    pub challenge_data: Vec<u8>,
}

impl Challenge {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(8 + self.challenge_data.len());
        buf.extend_from_slice(&self.csq.to_le_bytes());
        buf.extend_from_slice(&self.user.to_le_bytes());
        buf.push(self.mac_algorithm);
        buf.push(self.reason);
        buf.extend_from_slice(&self.challenge_data);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let csq = r.u32_le()?;
        let user = r.u16_le()?;
        let mac_algorithm = r.u8()?;
        let reason = r.u8()?;
        let challenge_data = r.rest();
        if challenge_data.is_empty() {
            return Err(Error::Protocol("Challenge carries no data".to_string()));
        }
        Ok(Self {
            csq,
            user,
            mac_algorithm,
            reason,
            challenge_data,
        })
    }
}

/// g120v2 — challenge reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeReply {
    /// Challenge sequence number being answered
    pub csq: u32,
    /// Replying user number
    pub user: u16,
    /// MAC value
    pub mac: Vec<u8>,
}

impl ChallengeReply {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(6 + self.mac.len());
        buf.extend_from_slice(&self.csq.to_le_bytes());
        buf.extend_from_slice(&self.user.to_le_bytes());
        buf.extend_from_slice(&self.mac);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let csq = r.u32_le()?;
        let user = r.u16_le()?;
        let mac = r.rest();
        if mac.is_empty() {
            return Err(Error::Protocol("Challenge reply carries no MAC".to_string()));
        }
        Ok(Self { csq, user, mac })
    }
}

/// g120v3 — aggressive mode request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggressiveModeRequest {
    /// Challenge sequence number the requester believes is current
    pub csq: u32,
    /// Requesting user number
    pub user: u16,
}

impl AggressiveModeRequest {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(6);
        buf.extend_from_slice(&self.csq.to_le_bytes());
        buf.extend_from_slice(&self.user.to_le_bytes());
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let csq = r.u32_le()?;
        let user = r.u16_le()?;
        Ok(Self { csq, user })
    }
}

/// g120v4 — session key status request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeyStatusRequest {
    /// User number whose key status is requested
    pub user: u16,
}

impl SessionKeyStatusRequest {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.user.to_le_bytes().to_vec())
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let user = r.u16_le()?;
        Ok(Self { user })
    }
}

/// g120v5 — session key status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyStatus {
    /// Key change sequence number
    pub ksq: u32,
    /// User number
    pub user: u16,
    /// Key wrap algorithm (KWA registry code)
    pub key_wrap_algorithm: u8,
    /// Key status code
    pub key_status: u8,
    /// MAC algorithm (MAL registry code)
    pub mac_algorithm: u8,
    /// Challenge data for the next key change
    pub challenge_data: Vec<u8>,
    /// MAC over the status message (empty before the first key change)
    pub mac: Vec<u8>,
}

impl SessionKeyStatus {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(11 + self.challenge_data.len() + self.mac.len());
        buf.extend_from_slice(&self.ksq.to_le_bytes());
        buf.extend_from_slice(&self.user.to_le_bytes());
        buf.push(self.key_wrap_algorithm);
        buf.push(self.key_status);
        buf.push(self.mac_algorithm);
        buf.extend_from_slice(&(self.challenge_data.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.challenge_data);
        buf.extend_from_slice(&self.mac);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let ksq = r.u32_le()?;
        let user = r.u16_le()?;
        let key_wrap_algorithm = r.u8()?;
        let key_status = r.u8()?;
        let mac_algorithm = r.u8()?;
        let cdl = r.u16_le()? as usize;
        let challenge_data = r.take(cdl)?.to_vec();
        let mac = r.rest();
        Ok(Self {
            ksq,
            user,
            key_wrap_algorithm,
            key_status,
            mac_algorithm,
            challenge_data,
            mac,
        })
    }
}

/// g120v6 — session key change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyChange {
    /// Key change sequence number (must be exactly one greater than stored)
    pub ksq: u32,
    /// User number
    pub user: u16,
    /// Session keys wrapped under the user's update key
    pub wrapped_key_data: Vec<u8>,
}

impl SessionKeyChange {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(6 + self.wrapped_key_data.len());
        buf.extend_from_slice(&self.ksq.to_le_bytes());
        buf.extend_from_slice(&self.user.to_le_bytes());
        buf.extend_from_slice(&self.wrapped_key_data);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let ksq = r.u32_le()?;
        let user = r.u16_le()?;
        let wrapped_key_data = r.rest();
        if wrapped_key_data.is_empty() {
            return Err(Error::Protocol("Key change carries no key data".to_string()));
        }
        Ok(Self {
            ksq,
            user,
            wrapped_key_data,
        })
    }
}

/// g120v7 — error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorObject {
    /// Sequence number of the exchange in error
    pub seq: u32,
    /// User number
    pub user: u16,
    /// Association id of the originating association
    pub association_id: u16,
    /// Error code
    pub error_code: u8,
    /// Time of error, milliseconds since epoch (48-bit)
    pub time_of_error: u64,
    /// Optional error text
    pub error_text: Vec<u8>,
}

impl ErrorObject {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(15 + self.error_text.len());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.user.to_le_bytes());
        buf.extend_from_slice(&self.association_id.to_le_bytes());
        buf.push(self.error_code);
        put_u48_le(&mut buf, self.time_of_error);
        buf.extend_from_slice(&self.error_text);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let seq = r.u32_le()?;
        let user = r.u16_le()?;
        let association_id = r.u16_le()?;
        let error_code = r.u8()?;
        let time_of_error = r.u48_le()?;
        let error_text = r.rest();
        Ok(Self {
            seq,
            user,
            association_id,
            error_code,
            time_of_error,
            error_text,
        })
    }
}

/// g120v8 — user certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCertificate {
    /// Key change method
    pub key_change_method: u8,
    /// Certificate type
    pub certificate_type: u8,
    /// Certificate bytes (semantics belong to the authority)
    pub certificate: Vec<u8>,
}

impl UserCertificate {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(2 + self.certificate.len());
        buf.push(self.key_change_method);
        buf.push(self.certificate_type);
        buf.extend_from_slice(&self.certificate);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let key_change_method = r.u8()?;
        let certificate_type = r.u8()?;
        let certificate = r.rest();
        if certificate.is_empty() {
            return Err(Error::Protocol("Certificate object is empty".to_string()));
        }
        Ok(Self {
            key_change_method,
            certificate_type,
            certificate,
        })
    }
}

/// g120v9 — MAC value (trails an aggressive mode fragment)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacValue {
    /// MAC over the preceding challenge and the fragment up to this object
    pub mac: Vec<u8>,
}

impl MacValue {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.mac.clone())
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let mac = r.rest();
        if mac.is_empty() {
            return Err(Error::Protocol("MAC object is empty".to_string()));
        }
        Ok(Self { mac })
    }
}

/// g120v10 — user status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStatusChange {
    /// Key change method
    pub key_change_method: u8,
    /// Operation (add / change / delete)
    pub operation: u8,
    /// Status change sequence number
    pub scs: u32,
    /// User role
    pub user_role: u16,
    /// Role expiry interval in days
    pub user_role_expiry_days: u16,
    /// User name
    pub user_name: Vec<u8>,
    /// User public key (empty for symmetric methods)
    pub user_public_key: Vec<u8>,
    /// Certification data from the authority
    pub certification_data: Vec<u8>,
}

impl UserStatusChange {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(
            16 + self.user_name.len() + self.user_public_key.len() + self.certification_data.len(),
        );
        buf.push(self.key_change_method);
        buf.push(self.operation);
        buf.extend_from_slice(&self.scs.to_le_bytes());
        buf.extend_from_slice(&self.user_role.to_le_bytes());
        buf.extend_from_slice(&self.user_role_expiry_days.to_le_bytes());
        buf.extend_from_slice(&(self.user_name.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.user_public_key.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.certification_data.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.user_name);
        buf.extend_from_slice(&self.user_public_key);
        buf.extend_from_slice(&self.certification_data);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let key_change_method = r.u8()?;
        let operation = r.u8()?;
        let scs = r.u32_le()?;
        let user_role = r.u16_le()?;
        let user_role_expiry_days = r.u16_le()?;
        let unl = r.u16_le()? as usize;
        let ukl = r.u16_le()? as usize;
        let cdl = r.u16_le()? as usize;
        let user_name = r.take(unl)?.to_vec();
        let user_public_key = r.take(ukl)?.to_vec();
        let certification_data = r.take(cdl)?.to_vec();
        Ok(Self {
            key_change_method,
            operation,
            scs,
            user_role,
            user_role_expiry_days,
            user_name,
            user_public_key,
            certification_data,
        })
    }
}

/// g120v11 — update key change request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateKeyChangeRequest {
    /// Key change method
    pub key_change_method: u8,
    /// Name of the user whose update key is being changed
    pub user_name: Vec<u8>,
    /// Master challenge data
    pub master_challenge: Vec<u8>,
}

impl UpdateKeyChangeRequest {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf =
            Vec::with_capacity(5 + self.user_name.len() + self.master_challenge.len());
        buf.push(self.key_change_method);
        buf.extend_from_slice(&(self.user_name.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.master_challenge.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.user_name);
        buf.extend_from_slice(&self.master_challenge);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let key_change_method = r.u8()?;
        let unl = r.u16_le()? as usize;
        let mcl = r.u16_le()? as usize;
        let user_name = r.take(unl)?.to_vec();
        let master_challenge = r.take(mcl)?.to_vec();
        if user_name.is_empty() {
            return Err(Error::Protocol("Update key request names no user".to_string()));
        }
        Ok(Self {
            key_change_method,
            user_name,
            master_challenge,
        })
    }
}

/// g120v12 — update key change reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateKeyChangeReply {
    /// Key change sequence number allocated for this exchange
    pub ksq: u32,
    /// User number assigned to the named user
    pub user: u16,
    /// Outstation challenge data
    pub outstation_challenge: Vec<u8>,
}

impl UpdateKeyChangeReply {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(6 + self.outstation_challenge.len());
        buf.extend_from_slice(&self.ksq.to_le_bytes());
        buf.extend_from_slice(&self.user.to_le_bytes());
        buf.extend_from_slice(&self.outstation_challenge);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let ksq = r.u32_le()?;
        let user = r.u16_le()?;
        let outstation_challenge = r.rest();
        if outstation_challenge.is_empty() {
            return Err(Error::Protocol("Update key reply carries no challenge".to_string()));
        }
        Ok(Self {
            ksq,
            user,
            outstation_challenge,
        })
    }
}

/// g120v13 — update key change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateKeyChange {
    /// Key change sequence number echoed from the reply
    pub ksq: u32,
    /// User number echoed from the reply
    pub user: u16,
    /// Update key material wrapped under the authority key
    pub encrypted_update_key: Vec<u8>,
}

impl UpdateKeyChange {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(6 + self.encrypted_update_key.len());
        buf.extend_from_slice(&self.ksq.to_le_bytes());
        buf.extend_from_slice(&self.user.to_le_bytes());
        buf.extend_from_slice(&self.encrypted_update_key);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data)?;
        let ksq = r.u32_le()?;
        let user = r.u16_le()?;
        let encrypted_update_key = r.rest();
        if encrypted_update_key.is_empty() {
            return Err(Error::Protocol("Update key change carries no key".to_string()));
        }
        Ok(Self {
            ksq,
            user,
            encrypted_update_key,
        })
    }
}

/// A decoded Group 120 object of any variation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthObject {
    Challenge(Challenge),
    ChallengeReply(ChallengeReply),
    AggressiveModeRequest(AggressiveModeRequest),
    SessionKeyStatusRequest(SessionKeyStatusRequest),
    SessionKeyStatus(SessionKeyStatus),
    SessionKeyChange(SessionKeyChange),
    Error(ErrorObject),
    UserCertificate(UserCertificate),
    MacValue(MacValue),
    UserStatusChange(UserStatusChange),
    UpdateKeyChangeRequest(UpdateKeyChangeRequest),
    UpdateKeyChangeReply(UpdateKeyChangeReply),
    UpdateKeyChange(UpdateKeyChange),
}

impl AuthObject {
    /// Object group 120 variation number of this object.
    pub fn variation(&self) -> u8 {
        match self {
            AuthObject::Challenge(_) => 1,
            AuthObject::ChallengeReply(_) => 2,
            AuthObject::AggressiveModeRequest(_) => 3,
            AuthObject::SessionKeyStatusRequest(_) => 4,
            AuthObject::SessionKeyStatus(_) => 5,
            AuthObject::SessionKeyChange(_) => 6,
            AuthObject::Error(_) => 7,
            AuthObject::UserCertificate(_) => 8,
            AuthObject::MacValue(_) => 9,
            AuthObject::UserStatusChange(_) => 10,
            AuthObject::UpdateKeyChangeRequest(_) => 11,
            AuthObject::UpdateKeyChangeReply(_) => 12,
            AuthObject::UpdateKeyChange(_) => 13,
        }
    }

    /// Decode the object data of the given variation.
    pub fn deserialize(variation: u8, data: &[u8]) -> Result<Self> {
        match variation {
            1 => Ok(AuthObject::Challenge(Challenge::deserialize(data)?)),
            2 => Ok(AuthObject::ChallengeReply(ChallengeReply::deserialize(data)?)),
            3 => Ok(AuthObject::AggressiveModeRequest(
                AggressiveModeRequest::deserialize(data)?,
            )),
            4 => Ok(AuthObject::SessionKeyStatusRequest(
                SessionKeyStatusRequest::deserialize(data)?,
            )),
            5 => Ok(AuthObject::SessionKeyStatus(SessionKeyStatus::deserialize(data)?)),
            6 => Ok(AuthObject::SessionKeyChange(SessionKeyChange::deserialize(data)?)),
            7 => Ok(AuthObject::Error(ErrorObject::deserialize(data)?)),
            8 => Ok(AuthObject::UserCertificate(UserCertificate::deserialize(data)?)),
            9 => Ok(AuthObject::MacValue(MacValue::deserialize(data)?)),
            10 => Ok(AuthObject::UserStatusChange(UserStatusChange::deserialize(data)?)),
            11 => Ok(AuthObject::UpdateKeyChangeRequest(
                UpdateKeyChangeRequest::deserialize(data)?,
            )),
            12 => Ok(AuthObject::UpdateKeyChangeReply(
                UpdateKeyChangeReply::deserialize(data)?,
            )),
            13 => Ok(AuthObject::UpdateKeyChange(UpdateKeyChange::deserialize(data)?)),
            _ => Err(Error::Protocol(format!("Unknown g120 variation: {}", variation))),
        }
    }

    /// Encode the object data (without the application-layer object header).
    pub fn serialize(&self) -> Result<Vec<u8>> {
        match self {
            AuthObject::Challenge(o) => o.serialize(),
            AuthObject::ChallengeReply(o) => o.serialize(),
            AuthObject::AggressiveModeRequest(o) => o.serialize(),
            AuthObject::SessionKeyStatusRequest(o) => o.serialize(),
            AuthObject::SessionKeyStatus(o) => o.serialize(),
            AuthObject::SessionKeyChange(o) => o.serialize(),
            AuthObject::Error(o) => o.serialize(),
            AuthObject::UserCertificate(o) => o.serialize(),
            AuthObject::MacValue(o) => o.serialize(),
            AuthObject::UserStatusChange(o) => o.serialize(),
            AuthObject::UpdateKeyChangeRequest(o) => o.serialize(),
            AuthObject::UpdateKeyChangeReply(o) => o.serialize(),
            AuthObject::UpdateKeyChange(o) => o.serialize(),
        }
    }
}

/// Current time as a 48-bit DNP3 timestamp (milliseconds since epoch).
pub fn dnp3_time_now() -> u64 {
    (chrono::Utc::now().timestamp_millis() as u64) & 0x0000_FFFF_FFFF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_round_trip() {
        let challenge = Challenge {
            csq: 0x01020304,
            user: 7,
            mac_algorithm: 4,
            reason: CHALLENGE_REASON_CRITICAL,
            challenge_data: vec![0xAA; 16],
        };
        let bytes = challenge.serialize().unwrap();
        // CSQ is little-endian on the wire
        assert_eq!(&bytes[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..6], &[7, 0]);
        assert_eq!(bytes[6], 4);
        assert_eq!(bytes[7], 1);
        assert_eq!(Challenge::deserialize(&bytes).unwrap(), challenge);
    }

    #[test]
    fn test_challenge_rejects_empty_data() {
        let bytes = [1, 0, 0, 0, 1, 0, 4, 1];
        assert!(Challenge::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_key_status_round_trip() {
        let status = SessionKeyStatus {
            ksq: 9,
            user: 1,
            key_wrap_algorithm: 1,
            key_status: KeyStatusCode::NotInit as u8,
            mac_algorithm: 4,
            challenge_data: vec![1, 2, 3, 4],
            mac: vec![],
        };
        let bytes = status.serialize().unwrap();
        assert_eq!(SessionKeyStatus::deserialize(&bytes).unwrap(), status);

        let with_mac = SessionKeyStatus {
            mac: vec![0xCC; 16],
            ..status
        };
        let bytes = with_mac.serialize().unwrap();
        assert_eq!(SessionKeyStatus::deserialize(&bytes).unwrap(), with_mac);
    }

    #[test]
    fn test_error_object_round_trip() {
        let error = ErrorObject {
            seq: 42,
            user: 1,
            association_id: 3,
            error_code: AuthErrorCode::AuthenticationFailed as u8,
            time_of_error: 0x0000_0123_4567_89AB,
            error_text: b"MAC mismatch".to_vec(),
        };
        let bytes = error.serialize().unwrap();
        assert_eq!(ErrorObject::deserialize(&bytes).unwrap(), error);
    }

    #[test]
    fn test_timestamp_is_48_bits() {
        let error = ErrorObject {
            seq: 0,
            user: 0,
            association_id: 0,
            error_code: 1,
            time_of_error: u64::MAX,
            error_text: vec![],
        };
        let bytes = error.serialize().unwrap();
        let decoded = ErrorObject::deserialize(&bytes).unwrap();
        assert_eq!(decoded.time_of_error, 0x0000_FFFF_FFFF_FFFF);
    }

    #[test]
    fn test_user_status_change_round_trip() {
        let change = UserStatusChange {
            key_change_method: 3,
            operation: UserOperation::Add as u8,
            scs: 17,
            user_role: 2,
            user_role_expiry_days: 365,
            user_name: b"operator-7".to_vec(),
            user_public_key: vec![],
            certification_data: vec![0xDD; 16],
        };
        let bytes = change.serialize().unwrap();
        assert_eq!(UserStatusChange::deserialize(&bytes).unwrap(), change);
    }

    #[test]
    fn test_update_key_request_round_trip() {
        let request = UpdateKeyChangeRequest {
            key_change_method: 3,
            user_name: b"operator-7".to_vec(),
            master_challenge: vec![5; 8],
        };
        let bytes = request.serialize().unwrap();
        assert_eq!(UpdateKeyChangeRequest::deserialize(&bytes).unwrap(), request);
    }

    #[test]
    fn test_truncated_object_is_parse_failure() {
        assert!(SessionKeyStatus::deserialize(&[1, 2, 3]).is_err());
        assert!(UserStatusChange::deserialize(&[3, 1, 0, 0, 0, 0]).is_err());
        // Length field pointing past the end of the buffer
        let mut bytes = SessionKeyStatus {
            ksq: 1,
            user: 1,
            key_wrap_algorithm: 1,
            key_status: 1,
            mac_algorithm: 4,
            challenge_data: vec![9; 4],
            mac: vec![],
        }
        .serialize()
        .unwrap();
        bytes[9] = 0xFF;
        assert!(SessionKeyStatus::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_oversized_object_is_parse_failure() {
        let data = vec![0u8; MAX_OBJECT_SIZE + 1];
        assert!(MacValue::deserialize(&data).is_err());
    }

    #[test]
    fn test_auth_object_dispatch() {
        let reply = ChallengeReply {
            csq: 5,
            user: 1,
            mac: vec![0xAB; 16],
        };
        let bytes = reply.serialize().unwrap();
        let decoded = AuthObject::deserialize(2, &bytes).unwrap();
        assert_eq!(decoded.variation(), 2);
        assert_eq!(decoded.serialize().unwrap(), bytes);
        assert!(AuthObject::deserialize(14, &bytes).is_err());
    }
}
