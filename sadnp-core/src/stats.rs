//! Security statistics and threshold monitoring
//!
//! Ordinary statistics carry an optional informational threshold. Four
//! distinguished statistics additionally carry a maximum value with a
//! one-shot latch: the first increment past the maximum fires a device
//! action exactly once until the latch is explicitly reset.

use crate::config::StatThresholds;
use crate::error::Result;
use crate::store::StatStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Increments between coalesced persistence writes.
const FLUSH_EVERY: u32 = 16;

/// Security statistic identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatId {
    UnexpectedMessages,
    AuthorizationFailures,
    AuthenticationFailures,
    ReplyTimeouts,
    RekeysDueToFailure,
    TotalMessagesSent,
    TotalMessagesReceived,
    CriticalMessagesSent,
    CriticalMessagesReceived,
    DiscardedMessages,
    ErrorMessagesSent,
    ErrorMessagesReceived,
    SuccessfulAuthentications,
    SessionKeyChanges,
    FailedSessionKeyChanges,
    UpdateKeyChanges,
    FailedUpdateKeyChanges,
    RekeysDueToRestart,
    KeyStatusRequests,
    AggressiveModeRequests,
}

impl StatId {
    /// Every statistic the engine maintains.
    pub const ALL: [StatId; 20] = [
        StatId::UnexpectedMessages,
        StatId::AuthorizationFailures,
        StatId::AuthenticationFailures,
        StatId::ReplyTimeouts,
        StatId::RekeysDueToFailure,
        StatId::TotalMessagesSent,
        StatId::TotalMessagesReceived,
        StatId::CriticalMessagesSent,
        StatId::CriticalMessagesReceived,
        StatId::DiscardedMessages,
        StatId::ErrorMessagesSent,
        StatId::ErrorMessagesReceived,
        StatId::SuccessfulAuthentications,
        StatId::SessionKeyChanges,
        StatId::FailedSessionKeyChanges,
        StatId::UpdateKeyChanges,
        StatId::FailedUpdateKeyChanges,
        StatId::RekeysDueToRestart,
        StatId::KeyStatusRequests,
        StatId::AggressiveModeRequests,
    ];
}

/// Threshold behavior attached to a statistic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Threshold {
    /// Informational only; crossing carries no device action
    Ordinary { threshold: Option<u32> },
    /// Carries the one-shot exceeds-maximum latch
    Distinguished {
        threshold: Option<u32>,
        max_value: u32,
        latched: bool,
    },
}

/// Outcome of one increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increment {
    /// Counter value after the increment
    pub value: u32,
    /// Value is past the informational threshold
    pub threshold_crossed: bool,
    /// Value exceeded the distinguished maximum for the first time
    pub max_exceeded_first_time: bool,
}

struct Entry {
    value: Option<u32>,
    threshold: Threshold,
    dirty: bool,
}

/// Per-session statistics monitor
pub struct StatisticsMonitor {
    session: u16,
    entries: HashMap<StatId, Entry>,
    increments_since_flush: u32,
}

impl StatisticsMonitor {
    pub fn new(session: u16, thresholds: &StatThresholds) -> Self {
        let mut entries = HashMap::with_capacity(StatId::ALL.len());
        for stat in StatId::ALL {
            let ordinary = thresholds
                .ordinary
                .iter()
                .find(|t| t.stat == stat)
                .map(|t| t.threshold);
            let threshold = match stat {
                StatId::AuthenticationFailures => Threshold::Distinguished {
                    threshold: ordinary,
                    max_value: thresholds.max_authentication_failures,
                    latched: false,
                },
                StatId::ReplyTimeouts => Threshold::Distinguished {
                    threshold: ordinary,
                    max_value: thresholds.max_reply_timeouts,
                    latched: false,
                },
                StatId::RekeysDueToFailure => Threshold::Distinguished {
                    threshold: ordinary,
                    max_value: thresholds.max_rekeys_due_to_failure,
                    latched: false,
                },
                StatId::ErrorMessagesSent => Threshold::Distinguished {
                    threshold: ordinary,
                    max_value: thresholds.max_error_messages_sent,
                    latched: false,
                },
                _ => Threshold::Ordinary { threshold: ordinary },
            };
            entries.insert(
                stat,
                Entry {
                    value: None,
                    threshold,
                    dirty: false,
                },
            );
        }
        Self {
            session,
            entries,
            increments_since_flush: 0,
        }
    }

    fn load_value(
        session: u16,
        store: &mut dyn StatStore,
        stat: StatId,
        entry: &mut Entry,
    ) -> Result<u32> {
        if let Some(value) = entry.value {
            return Ok(value);
        }
        let value = store.load(session, stat)?.unwrap_or(0);
        entry.value = Some(value);
        Ok(value)
    }

    /// Increment one statistic, reporting threshold and one-shot latch state.
    pub fn increment(&mut self, store: &mut dyn StatStore, stat: StatId) -> Result<Increment> {
        let session = self.session;
        let entry = self
            .entries
            .get_mut(&stat)
            .expect("all statistics preallocated");
        let value = Self::load_value(session, store, stat, entry)?.saturating_add(1);
        entry.value = Some(value);
        entry.dirty = true;

        let (threshold_crossed, max_exceeded_first_time) = match &mut entry.threshold {
            Threshold::Ordinary { threshold } => {
                (threshold.is_some_and(|t| value > t), false)
            }
            Threshold::Distinguished {
                threshold,
                max_value,
                latched,
            } => {
                let crossed = threshold.is_some_and(|t| value > t);
                let first = value > *max_value && !*latched;
                if first {
                    *latched = true;
                }
                (crossed, first)
            }
        };

        self.increments_since_flush += 1;
        if self.increments_since_flush >= FLUSH_EVERY {
            self.flush(store)?;
        }

        Ok(Increment {
            value,
            threshold_crossed,
            max_exceeded_first_time,
        })
    }

    /// Current counter value, lazily loading it from the store.
    pub fn value(&mut self, store: &mut dyn StatStore, stat: StatId) -> Result<u32> {
        let session = self.session;
        let entry = self
            .entries
            .get_mut(&stat)
            .expect("all statistics preallocated");
        Self::load_value(session, store, stat, entry)
    }

    /// Whether the distinguished latch is set.
    pub fn is_latched(&self, stat: StatId) -> bool {
        matches!(
            self.entries.get(&stat).map(|e| &e.threshold),
            Some(Threshold::Distinguished { latched: true, .. })
        )
    }

    /// Operator/test action: clear the one-shot latch.
    pub fn reset_latch(&mut self, stat: StatId) {
        if let Some(Entry {
            threshold: Threshold::Distinguished { latched, .. },
            ..
        }) = self.entries.get_mut(&stat)
        {
            *latched = false;
        }
    }

    /// Write all dirty counters to the store in one batch.
    pub fn flush(&mut self, store: &mut dyn StatStore) -> Result<()> {
        let mut batch = Vec::new();
        for (stat, entry) in self.entries.iter_mut() {
            if entry.dirty {
                if let Some(value) = entry.value {
                    batch.push((*stat, value));
                }
                entry.dirty = false;
            }
        }
        if !batch.is_empty() {
            store.save(self.session, &batch)?;
        }
        self.increments_since_flush = 0;
        Ok(())
    }
}
