//! Pending request buffer
//!
//! Holds the one critical application fragment that triggered a challenge
//! until it is authenticated or discarded. Capacity is fixed at session
//! configuration; an oversized fragment is rejected before anything is
//! retained.

use crate::error::{Error, Result};

/// A critical application fragment awaiting authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Application-layer function code
    pub function_code: u8,
    /// Application-layer sequence number
    pub app_seq: u8,
    /// Raw fragment bytes, released unchanged on success
    pub bytes: Vec<u8>,
}

/// Single-slot buffer, at most one in-flight request per session
pub struct PendingBuffer {
    capacity: usize,
    slot: Option<PendingRequest>,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slot: None,
        }
    }

    /// Store a request, returning any previously held request so the caller
    /// can discard it explicitly.
    pub fn store(&mut self, request: PendingRequest) -> Result<Option<PendingRequest>> {
        if request.bytes.len() > self.capacity {
            return Err(Error::ResourceExhaustion(format!(
                "Fragment of {} octets exceeds buffer capacity {}",
                request.bytes.len(),
                self.capacity
            )));
        }
        Ok(self.slot.replace(request))
    }

    /// Remove and return the held request.
    pub fn take(&mut self) -> Option<PendingRequest> {
        self.slot.take()
    }

    /// Peek at the held request.
    pub fn get(&self) -> Option<&PendingRequest> {
        self.slot.as_ref()
    }

    pub fn is_occupied(&self) -> bool {
        self.slot.is_some()
    }
}
