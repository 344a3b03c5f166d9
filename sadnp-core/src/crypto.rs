//! Cryptographic algorithm registry and provider interface
//!
//! Algorithm identifiers mirror the DNP3 Secure Authentication registry.
//! All MAC computation, MAC verification, and key wrap/unwrap is delegated
//! through the [`CryptoProvider`] trait; [`SoftwareCrypto`] is the default
//! software-only provider.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use ring::rand::SecureRandom;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// MAC algorithms from the protocol registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacAlgorithm {
    /// HMAC-SHA1 truncated to 4 octets (deprecated, SAv2 only)
    HmacSha1Trunc4,
    /// HMAC-SHA1 truncated to 8 octets
    HmacSha1Trunc8,
    /// HMAC-SHA1 truncated to 10 octets
    HmacSha1Trunc10,
    /// HMAC-SHA256 truncated to 8 octets
    HmacSha256Trunc8,
    /// HMAC-SHA256 truncated to 16 octets
    HmacSha256Trunc16,
    /// AES-GMAC, 12 octets
    AesGmac,
}

impl MacAlgorithm {
    /// Wire identifier carried in the MAL field of challenge objects.
    pub fn code(&self) -> u8 {
        match self {
            MacAlgorithm::HmacSha1Trunc4 => 1,
            MacAlgorithm::HmacSha1Trunc10 => 2,
            MacAlgorithm::HmacSha256Trunc8 => 3,
            MacAlgorithm::HmacSha256Trunc16 => 4,
            MacAlgorithm::HmacSha1Trunc8 => 5,
            MacAlgorithm::AesGmac => 6,
        }
    }

    /// Decode a MAL field value.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(MacAlgorithm::HmacSha1Trunc4),
            2 => Ok(MacAlgorithm::HmacSha1Trunc10),
            3 => Ok(MacAlgorithm::HmacSha256Trunc8),
            4 => Ok(MacAlgorithm::HmacSha256Trunc16),
            5 => Ok(MacAlgorithm::HmacSha1Trunc8),
            6 => Ok(MacAlgorithm::AesGmac),
            _ => Err(Error::Protocol(format!("Unknown MAC algorithm: {}", code))),
        }
    }

    /// Truncated MAC output length in octets.
    pub fn mac_len(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1Trunc4 => 4,
            MacAlgorithm::HmacSha1Trunc8 => 8,
            MacAlgorithm::HmacSha1Trunc10 => 10,
            MacAlgorithm::HmacSha256Trunc8 => 8,
            MacAlgorithm::HmacSha256Trunc16 => 16,
            MacAlgorithm::AesGmac => 12,
        }
    }
}

/// Key wrap algorithms from the protocol registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyWrapAlgorithm {
    /// AES-128 key wrap (RFC 3394)
    Aes128,
    /// AES-256 key wrap (RFC 3394)
    Aes256,
}

impl KeyWrapAlgorithm {
    /// Wire identifier carried in the KWA field of key status objects.
    pub fn code(&self) -> u8 {
        match self {
            KeyWrapAlgorithm::Aes128 => 1,
            KeyWrapAlgorithm::Aes256 => 2,
        }
    }

    /// Decode a KWA field value.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(KeyWrapAlgorithm::Aes128),
            2 => Ok(KeyWrapAlgorithm::Aes256),
            _ => Err(Error::Protocol(format!(
                "Unknown key wrap algorithm: {}",
                code
            ))),
        }
    }

    /// Key-encrypting key length in octets.
    pub fn key_len(&self) -> usize {
        match self {
            KeyWrapAlgorithm::Aes128 => 16,
            KeyWrapAlgorithm::Aes256 => 32,
        }
    }
}

/// Abstract cryptographic capability consumed by the engine
pub trait CryptoProvider {
    /// Compute a truncated MAC over `data`.
    fn compute_mac(&self, algorithm: MacAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Verify a truncated MAC in constant time.
    fn verify_mac(
        &self,
        algorithm: MacAlgorithm,
        key: &[u8],
        data: &[u8],
        mac: &[u8],
    ) -> Result<bool>;

    /// Wrap `plain` under `wrapping_key`. Input must be a multiple of 8 octets.
    fn wrap_key(
        &self,
        algorithm: KeyWrapAlgorithm,
        wrapping_key: &[u8],
        plain: &[u8],
    ) -> Result<Vec<u8>>;

    /// Unwrap `wrapped` under `wrapping_key`, authenticating the integrity check value.
    fn unwrap_key(
        &self,
        algorithm: KeyWrapAlgorithm,
        wrapping_key: &[u8],
        wrapped: &[u8],
    ) -> Result<Vec<u8>>;

    /// Fill `buf` with cryptographically secure random octets.
    fn fill_random(&self, buf: &mut [u8]) -> Result<()>;
}

/// Default software provider backed by ring, aes-gcm and aes-kw
pub struct SoftwareCrypto {
    rng: ring::rand::SystemRandom,
}

impl SoftwareCrypto {
    pub fn new() -> Self {
        Self {
            rng: ring::rand::SystemRandom::new(),
        }
    }

    fn hmac(algorithm: ring::hmac::Algorithm, key: &[u8], data: &[u8]) -> Vec<u8> {
        let key = ring::hmac::Key::new(algorithm, key);
        ring::hmac::sign(&key, data).as_ref().to_vec()
    }

    // AES-GMAC is GCM with all input presented as additional authenticated
    // data; the authentication tag is the MAC.
    fn gmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: b"",
            aad: data,
        };
        let nonce = Nonce::from_slice(&[0u8; 12]);
        let tag = match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map_err(|_| Error::Crypto("Invalid AES-128 key length".to_string()))?
                .encrypt(nonce, payload),
            32 => Aes256Gcm::new_from_slice(key)
                .map_err(|_| Error::Crypto("Invalid AES-256 key length".to_string()))?
                .encrypt(nonce, payload),
            n => return Err(Error::Crypto(format!("Unsupported GMAC key length: {}", n))),
        }
        .map_err(|_| Error::Crypto("GMAC computation failed".to_string()))?;
        Ok(tag)
    }
}

impl Default for SoftwareCrypto {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider for SoftwareCrypto {
    fn compute_mac(&self, algorithm: MacAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(Error::Crypto("Empty MAC key".to_string()));
        }
        let mut full = match algorithm {
            MacAlgorithm::HmacSha1Trunc4
            | MacAlgorithm::HmacSha1Trunc8
            | MacAlgorithm::HmacSha1Trunc10 => {
                Self::hmac(ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key, data)
            }
            MacAlgorithm::HmacSha256Trunc8 | MacAlgorithm::HmacSha256Trunc16 => {
                Self::hmac(ring::hmac::HMAC_SHA256, key, data)
            }
            MacAlgorithm::AesGmac => Self::gmac(key, data)?,
        };
        full.truncate(algorithm.mac_len());
        Ok(full)
    }

    fn verify_mac(
        &self,
        algorithm: MacAlgorithm,
        key: &[u8],
        data: &[u8],
        mac: &[u8],
    ) -> Result<bool> {
        if mac.len() != algorithm.mac_len() {
            return Err(Error::Protocol(format!(
                "MAC length {} does not match algorithm length {}",
                mac.len(),
                algorithm.mac_len()
            )));
        }
        let computed = self.compute_mac(algorithm, key, data)?;
        Ok(computed.ct_eq(mac).into())
    }

    fn wrap_key(
        &self,
        algorithm: KeyWrapAlgorithm,
        wrapping_key: &[u8],
        plain: &[u8],
    ) -> Result<Vec<u8>> {
        if plain.is_empty() || plain.len() % 8 != 0 {
            return Err(Error::KeyLifecycle(
                "Key wrap input must be a non-empty multiple of 8 octets".to_string(),
            ));
        }
        let mut out = vec![0u8; plain.len() + 8];
        match algorithm {
            KeyWrapAlgorithm::Aes128 => {
                let kek = aes_kw::KekAes128::try_from(wrapping_key)
                    .map_err(|_| Error::KeyLifecycle("Invalid AES-128 KEK length".to_string()))?;
                kek.wrap(plain, &mut out)
                    .map_err(|e| Error::KeyLifecycle(format!("Key wrap failed: {}", e)))?;
            }
            KeyWrapAlgorithm::Aes256 => {
                let kek = aes_kw::KekAes256::try_from(wrapping_key)
                    .map_err(|_| Error::KeyLifecycle("Invalid AES-256 KEK length".to_string()))?;
                kek.wrap(plain, &mut out)
                    .map_err(|e| Error::KeyLifecycle(format!("Key wrap failed: {}", e)))?;
            }
        }
        Ok(out)
    }

    fn unwrap_key(
        &self,
        algorithm: KeyWrapAlgorithm,
        wrapping_key: &[u8],
        wrapped: &[u8],
    ) -> Result<Vec<u8>> {
        if wrapped.len() < 16 || wrapped.len() % 8 != 0 {
            return Err(Error::KeyLifecycle(
                "Wrapped key data has invalid length".to_string(),
            ));
        }
        let mut out = vec![0u8; wrapped.len() - 8];
        match algorithm {
            KeyWrapAlgorithm::Aes128 => {
                let kek = aes_kw::KekAes128::try_from(wrapping_key)
                    .map_err(|_| Error::KeyLifecycle("Invalid AES-128 KEK length".to_string()))?;
                kek.unwrap(wrapped, &mut out)
                    .map_err(|_| Error::KeyLifecycle("Key unwrap failed".to_string()))?;
            }
            KeyWrapAlgorithm::Aes256 => {
                let kek = aes_kw::KekAes256::try_from(wrapping_key)
                    .map_err(|_| Error::KeyLifecycle("Invalid AES-256 KEK length".to_string()))?;
                kek.unwrap(wrapped, &mut out)
                    .map_err(|_| Error::KeyLifecycle("Key unwrap failed".to_string()))?;
            }
        }
        Ok(out)
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        self.rng
            .fill(buf)
            .map_err(|_| Error::Crypto("Random generation failed".to_string()))
    }
}
