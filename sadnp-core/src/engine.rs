//! Authentication state machine
//!
//! One [`SecureAuthEngine`] exists per DNP3 session with authentication
//! enabled. The engine is event-driven and single-threaded: the host feeds
//! it one inbound fragment or timer poll at a time and routes the returned
//! actions (transmissions, releases, device notifications). Nothing here
//! blocks or schedules; timers are deadlines checked against the instant
//! the host passes in.
//!
//! At most one user may be mid-handshake at a time. Every exit from
//! `WaitForReply` other than successful authentication either discards the
//! pending request or answers it with an error object.

use crate::codec::{
    decode_session_keys, decode_update_key, ChallengeCodec, ChallengePurpose, Verification,
};
use crate::config::SaConfig;
use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};
use crate::keys::UserKeyStore;
use crate::objects::{
    AggressiveModeRequest, AuthErrorCode, AuthObject, Challenge, ChallengeReply, ErrorObject,
    KeyStatusCode, MacValue, SessionKeyChange, SessionKeyStatusRequest, UpdateKeyChange,
    UpdateKeyChangeReply, UpdateKeyChangeRequest, UserCertificate, UserOperation,
    UserStatusChange,
};
use crate::pending::{PendingBuffer, PendingRequest};
use crate::stats::{StatId, StatisticsMonitor};
use crate::store::StatStore;
use crate::{DEFAULT_USER_NUMBER, MAX_FRAGMENT_SIZE};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Authentication state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Session just opened, no challenge activity yet
    Init,
    /// No user mid-handshake
    Idle,
    /// A challenge was issued and a reply is expected before the timer expires
    WaitForReply,
}

/// The trailing g120v9 MAC of an aggressive mode fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggressiveMac {
    /// Parsed MAC object
    pub mac: MacValue,
    /// Offset in the fragment where the MAC object data begins; the MAC
    /// covers the fragment up to this offset
    pub fragment_mac_offset: usize,
}

/// An inbound application fragment, classified and pre-parsed by the host
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Application-layer function code
    pub function_code: u8,
    /// Application-layer sequence number
    pub app_seq: u8,
    /// Explicit user number, if the request carries one
    pub user: Option<u16>,
    /// Raw fragment bytes
    pub bytes: Vec<u8>,
    /// Authentication object attached to the fragment, if any
    pub auth: Option<AuthObject>,
    /// Trailing MAC object for aggressive mode fragments
    pub aggressive_mac: Option<AggressiveMac>,
}

impl Fragment {
    /// A plain (non-authentication) fragment.
    pub fn plain(function_code: u8, app_seq: u8, bytes: Vec<u8>) -> Self {
        Self {
            function_code,
            app_seq,
            user: None,
            bytes,
            auth: None,
            aggressive_mac: None,
        }
    }

    /// A fragment carrying one authentication object.
    pub fn with_auth(function_code: u8, app_seq: u8, auth: AuthObject) -> Self {
        Self {
            function_code,
            app_seq,
            user: None,
            bytes: Vec::new(),
            auth: Some(auth),
            aggressive_mac: None,
        }
    }
}

/// A wire object the host must transmit on this session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireObject {
    /// Group 120 variation number
    pub variation: u8,
    /// Serialized object data
    pub data: Vec<u8>,
}

/// What the host must do after an event is processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Transmit this object on the originating association
    Transmit(WireObject),
    /// The fragment is authenticated; process it through the application layer
    Release(PendingRequest),
    /// A distinguished statistic exceeded its maximum for the first time;
    /// notify the operator
    NotifyMaxExceeded(StatId),
    /// Raise this error object on every other association as a security notice
    BroadcastSecurityNotice(WireObject),
    /// Surface a received user certificate to the authority
    ForwardCertificate(UserCertificate),
}

/// Behavior differences between the protocol variants, selected once at
/// session configuration time.
trait VariantOps {
    fn aggressive_mode(&self) -> bool;
    fn key_status_mac(&self) -> bool;
    fn update_key_exchange(&self) -> bool;
}

struct VariantV2;

impl VariantOps for VariantV2 {
    fn aggressive_mode(&self) -> bool {
        false
    }
    fn key_status_mac(&self) -> bool {
        false
    }
    fn update_key_exchange(&self) -> bool {
        false
    }
}

struct VariantV5;

impl VariantOps for VariantV5 {
    fn aggressive_mode(&self) -> bool {
        true
    }
    fn key_status_mac(&self) -> bool {
        true
    }
    fn update_key_exchange(&self) -> bool {
        true
    }
}

fn variant_ops(variant: crate::config::SaVariant) -> &'static dyn VariantOps {
    match variant {
        crate::config::SaVariant::V2 => &VariantV2,
        crate::config::SaVariant::V5 => &VariantV5,
    }
}

/// An update key exchange awaiting its g120v13 completion
struct PendingUpdateKey {
    user: u16,
    ksq: u32,
    outstation_challenge: Vec<u8>,
}

/// The per-session authentication engine
pub struct SecureAuthEngine {
    config: SaConfig,
    variant: &'static dyn VariantOps,
    crypto: Box<dyn CryptoProvider>,
    store: Box<dyn StatStore>,
    stats: StatisticsMonitor,
    users: UserKeyStore,
    pending: PendingBuffer,
    codec: ChallengeCodec,
    state: AuthState,
    current_user: Option<u16>,
    /// Per-device challenge sequence number, incremented each challenge sent
    csq: u32,
    /// CSQ of the last accepted challenge reply or aggressive request
    aggressive_csq: u32,
    last_challenge_sent: Option<Vec<u8>>,
    last_challenge_rcvd: Option<Challenge>,
    reply_deadline: Option<Instant>,
    rechallenges_used: u32,
    confirm_timeouts: u32,
    errors_sent_in_interval: u32,
    interval_started: Instant,
    authority_key: Vec<u8>,
    user_names: HashMap<Vec<u8>, u16>,
    status_change_seq: u32,
    pending_update_key: Option<PendingUpdateKey>,
}

impl SecureAuthEngine {
    /// Open a session with authentication enabled.
    pub fn new(
        config: SaConfig,
        crypto: Box<dyn CryptoProvider>,
        store: Box<dyn StatStore>,
        now: Instant,
    ) -> Result<Self> {
        config.validate()?;
        let stats = StatisticsMonitor::new(config.association_id, &config.thresholds);
        let mut users = UserKeyStore::new(config.max_users, config.key_wrap_algorithm);
        for user in &config.users {
            users.provision_update_key(user.number, hex::decode(&user.update_key)?)?;
        }
        let authority_key = if config.authority_key.is_empty() {
            Vec::new()
        } else {
            hex::decode(&config.authority_key)?
        };
        let codec = ChallengeCodec::new(config.challenge_data_len, config.mac_algorithm);
        let variant = variant_ops(config.variant);
        info!(
            association = config.association_id,
            variant = ?config.variant,
            "secure authentication session opened"
        );
        Ok(Self {
            config,
            variant,
            crypto,
            store,
            stats,
            users,
            pending: PendingBuffer::new(MAX_FRAGMENT_SIZE),
            codec,
            state: AuthState::Init,
            current_user: None,
            csq: 0,
            aggressive_csq: 0,
            last_challenge_sent: None,
            last_challenge_rcvd: None,
            reply_deadline: None,
            rechallenges_used: 0,
            confirm_timeouts: 0,
            errors_sent_in_interval: 0,
            interval_started: now,
            authority_key,
            user_names: HashMap::new(),
            status_change_seq: 0,
            pending_update_key: None,
        })
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn current_user(&self) -> Option<u16> {
        self.current_user
    }

    pub fn user_store(&self) -> &UserKeyStore {
        &self.users
    }

    /// The last challenge received from the master, if any.
    pub fn last_challenge_received(&self) -> Option<&Challenge> {
        self.last_challenge_rcvd.as_ref()
    }

    /// Current counter value for a statistic.
    pub fn statistic(&mut self, stat: StatId) -> Result<u32> {
        self.stats.value(&mut *self.store, stat)
    }

    /// Whether a distinguished statistic's one-shot latch is set.
    pub fn is_latched(&self, stat: StatId) -> bool {
        self.stats.is_latched(stat)
    }

    /// Operator/test action: re-arm a distinguished statistic.
    pub fn reset_latch(&mut self, stat: StatId) {
        self.stats.reset_latch(stat);
    }

    /// Write coalesced statistics to the persistent store.
    pub fn flush_statistics(&mut self) -> Result<()> {
        self.stats.flush(&mut *self.store)
    }

    /// Count a statistic maintained by the host rather than the engine
    /// (critical responses transmitted, rekeys after a device restart).
    pub fn record(&mut self, stat: StatId) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        self.bump(&mut actions, stat)?;
        Ok(actions)
    }

    fn bump(&mut self, actions: &mut Vec<Action>, stat: StatId) -> Result<()> {
        let increment = self.stats.increment(&mut *self.store, stat)?;
        if increment.threshold_crossed {
            debug!(?stat, value = increment.value, "statistic threshold crossed");
        }
        if increment.max_exceeded_first_time {
            warn!(?stat, value = increment.value, "statistic exceeded maximum");
            actions.push(Action::NotifyMaxExceeded(stat));
        }
        Ok(())
    }

    fn push_transmit(
        &mut self,
        actions: &mut Vec<Action>,
        variation: u8,
        data: Vec<u8>,
    ) -> Result<()> {
        self.bump(actions, StatId::TotalMessagesSent)?;
        actions.push(Action::Transmit(WireObject { variation, data }));
        Ok(())
    }

    /// Answer with a v7 error object, bounded by the per-interval error
    /// budget. Suppressed errors are counted but never transmitted.
    fn push_error(
        &mut self,
        actions: &mut Vec<Action>,
        user: u16,
        code: AuthErrorCode,
        text: &str,
    ) -> Result<()> {
        if self.errors_sent_in_interval >= self.config.max_error_count {
            debug!(user, ?code, "error object suppressed by rate limit");
            self.bump(actions, StatId::DiscardedMessages)?;
            return Ok(());
        }
        self.errors_sent_in_interval += 1;
        let error = self.build_error(user, code, text);
        self.bump(actions, StatId::ErrorMessagesSent)?;
        self.push_transmit(actions, 7, error.serialize()?)?;
        Ok(())
    }

    fn build_error(&self, user: u16, code: AuthErrorCode, text: &str) -> ErrorObject {
        self.codec
            .build_error(self.csq, user, self.config.association_id, code, text)
    }

    fn to_idle(&mut self) {
        self.state = AuthState::Idle;
        self.current_user = None;
        self.reply_deadline = None;
        self.rechallenges_used = 0;
    }

    fn issue_challenge(
        &mut self,
        actions: &mut Vec<Action>,
        user: u16,
        purpose: ChallengePurpose,
        now: Instant,
    ) -> Result<()> {
        self.csq = self.csq.wrapping_add(1);
        let (challenge, bytes) =
            self.codec
                .build_challenge(&*self.crypto, self.csq, user, purpose)?;
        self.last_challenge_sent = Some(bytes);
        self.state = AuthState::WaitForReply;
        self.current_user = Some(user);
        self.reply_deadline = Some(now + self.config.reply_timeout());
        debug!(user, csq = self.csq, "challenge issued");
        self.push_transmit(actions, 1, challenge.serialize()?)
    }

    /// Count one authenticated ASDU for the user and expire the session keys
    /// when the key change count is exceeded.
    fn count_authenticated_asdu(
        &mut self,
        actions: &mut Vec<Action>,
        user: u16,
    ) -> Result<()> {
        if self
            .users
            .increment_asdu_count(user, self.config.max_key_change_count)?
        {
            warn!(user, "key change count exceeded; invalidating session keys");
            self.users.invalidate_keys(user, KeyStatusCode::NotInit);
            self.bump(actions, StatId::RekeysDueToFailure)?;
        }
        Ok(())
    }

    /// Process one inbound fragment to completion.
    pub fn on_fragment(&mut self, fragment: Fragment, now: Instant) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        if self.state == AuthState::Init {
            self.state = AuthState::Idle;
        }
        self.bump(&mut actions, StatId::TotalMessagesReceived)?;

        match fragment.auth.clone() {
            None => self.on_plain_fragment(&mut actions, fragment, now)?,
            Some(AuthObject::ChallengeReply(reply)) => {
                self.on_challenge_reply(&mut actions, reply, now)?
            }
            Some(AuthObject::AggressiveModeRequest(request)) => {
                self.on_aggressive(&mut actions, request, fragment)?
            }
            Some(AuthObject::SessionKeyStatusRequest(request)) => {
                self.on_key_status_request(&mut actions, request)?
            }
            Some(AuthObject::SessionKeyChange(change)) => {
                self.on_key_change(&mut actions, change, now)?
            }
            Some(AuthObject::Challenge(challenge)) => {
                self.on_challenge_received(&mut actions, challenge)?
            }
            Some(AuthObject::Error(error)) => {
                warn!(
                    code = error.error_code,
                    user = error.user,
                    "error object received"
                );
                self.bump(&mut actions, StatId::ErrorMessagesReceived)?;
            }
            Some(AuthObject::UserCertificate(certificate)) => {
                self.on_user_certificate(&mut actions, certificate)?
            }
            Some(AuthObject::UserStatusChange(change)) => {
                self.on_user_status_change(&mut actions, change)?
            }
            Some(AuthObject::UpdateKeyChangeRequest(request)) => {
                self.on_update_key_request(&mut actions, request)?
            }
            Some(AuthObject::UpdateKeyChange(change)) => {
                self.on_update_key_change(&mut actions, change)?
            }
            Some(AuthObject::SessionKeyStatus(_))
            | Some(AuthObject::UpdateKeyChangeReply(_))
            | Some(AuthObject::MacValue(_)) => {
                // Objects only an outstation sends; receiving one is a
                // protocol violation.
                self.bump(&mut actions, StatId::UnexpectedMessages)?;
                self.push_error(
                    &mut actions,
                    DEFAULT_USER_NUMBER,
                    AuthErrorCode::UnexpectedReply,
                    "object not valid in this direction",
                )?;
            }
        }
        Ok(actions)
    }

    fn on_plain_fragment(
        &mut self,
        actions: &mut Vec<Action>,
        fragment: Fragment,
        now: Instant,
    ) -> Result<()> {
        let request = PendingRequest {
            function_code: fragment.function_code,
            app_seq: fragment.app_seq,
            bytes: fragment.bytes,
        };
        if !self.config.is_critical(request.function_code) {
            // Non-critical requests pass straight through
            actions.push(Action::Release(request));
            return Ok(());
        }
        self.bump(actions, StatId::CriticalMessagesReceived)?;

        let user = fragment.user.unwrap_or(DEFAULT_USER_NUMBER);
        if let Err(e) = self.users.lookup(user) {
            warn!(user, %e, "cannot challenge critical request");
            self.bump(actions, StatId::AuthorizationFailures)?;
            self.push_error(actions, user, AuthErrorCode::UnknownUser, "user unavailable")?;
            return Ok(());
        }
        let displaced = match self.pending.store(request) {
            Ok(displaced) => displaced,
            Err(Error::ResourceExhaustion(reason)) => {
                self.bump(actions, StatId::DiscardedMessages)?;
                self.push_error(actions, user, AuthErrorCode::AuthorizationFailed, &reason)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if displaced.is_some() {
            // A newer critical request supersedes the one being challenged
            self.bump(actions, StatId::DiscardedMessages)?;
        }
        self.issue_challenge(actions, user, ChallengePurpose::ReplyRequired, now)
    }

    fn on_challenge_reply(
        &mut self,
        actions: &mut Vec<Action>,
        reply: ChallengeReply,
        now: Instant,
    ) -> Result<()> {
        if self.state != AuthState::WaitForReply {
            self.bump(actions, StatId::UnexpectedMessages)?;
            self.push_error(
                actions,
                reply.user,
                AuthErrorCode::UnexpectedReply,
                "no challenge outstanding",
            )?;
            return Ok(());
        }
        let user = self.current_user.expect("WaitForReply implies a current user");
        let last_challenge = self.last_challenge_sent.clone().unwrap_or_default();
        let pending_bytes = self
            .pending
            .get()
            .map(|p| p.bytes.clone())
            .unwrap_or_default();

        let control_key = self
            .users
            .get(user)
            .and_then(|c| c.keys.as_ref())
            .map(|k| k.control.clone());
        let verdict = match control_key {
            Some(key) => self.codec.verify_reply(
                &*self.crypto,
                &key,
                &last_challenge,
                self.csq,
                user,
                &reply,
                &pending_bytes,
            )?,
            // No session keys: the reply cannot verify
            None => Verification::MacMismatch,
        };

        match verdict {
            Verification::Verified => {
                debug!(user, csq = self.csq, "challenge reply verified");
                self.users.lookup(user)?.rcvd_valid_reply = true;
                self.aggressive_csq = self.csq;
                self.confirm_timeouts = 0;
                self.bump(actions, StatId::SuccessfulAuthentications)?;
                self.count_authenticated_asdu(actions, user)?;
                self.to_idle();
                if let Some(request) = self.pending.take() {
                    actions.push(Action::Release(request));
                }
            }
            Verification::MacMismatch | Verification::SequenceMismatch => {
                warn!(user, ?verdict, "challenge reply failed");
                self.bump(actions, StatId::AuthenticationFailures)?;
                if self.rechallenges_used < self.config.max_rechallenges {
                    self.rechallenges_used += 1;
                    self.issue_challenge(actions, user, ChallengePurpose::ReplyRequired, now)?;
                } else {
                    if self.pending.take().is_some() {
                        self.bump(actions, StatId::DiscardedMessages)?;
                    }
                    self.push_error(
                        actions,
                        user,
                        AuthErrorCode::AuthenticationFailed,
                        "challenge reply failed",
                    )?;
                    self.to_idle();
                }
            }
        }
        Ok(())
    }

    fn on_aggressive(
        &mut self,
        actions: &mut Vec<Action>,
        request: AggressiveModeRequest,
        fragment: Fragment,
    ) -> Result<()> {
        self.bump(actions, StatId::AggressiveModeRequests)?;
        let user = request.user;

        if !self.variant.aggressive_mode() || !self.config.aggressive_mode_enabled {
            self.bump(actions, StatId::UnexpectedMessages)?;
            self.push_error(
                actions,
                user,
                AuthErrorCode::AggressiveModeNotSupported,
                "aggressive mode not supported",
            )?;
            return Ok(());
        }

        let Some(aggressive_mac) = fragment.aggressive_mac else {
            self.bump(actions, StatId::UnexpectedMessages)?;
            self.push_error(
                actions,
                user,
                AuthErrorCode::AuthenticationFailed,
                "aggressive fragment carries no MAC",
            )?;
            return Ok(());
        };
        if aggressive_mac.fragment_mac_offset > fragment.bytes.len() {
            self.bump(actions, StatId::UnexpectedMessages)?;
            self.push_error(
                actions,
                user,
                AuthErrorCode::AuthenticationFailed,
                "invalid MAC offset",
            )?;
            return Ok(());
        }

        // Aggressive mode is honored only after this user has completed a
        // full challenge round trip; the request is rejected before MAC
        // verification so a valid MAC cannot open the bootstrap window.
        let (trusted, control_key) = match self.users.get(user) {
            Some(context) => (
                context.rcvd_valid_reply,
                context.keys.as_ref().map(|k| k.control.clone()),
            ),
            None => (false, None),
        };
        if !trusted {
            warn!(user, "aggressive mode before first challenge reply");
            self.bump(actions, StatId::AuthenticationFailures)?;
            self.push_error(
                actions,
                user,
                AuthErrorCode::AggressiveModeNotSupported,
                "no prior challenge reply",
            )?;
            return Ok(());
        }
        let Some(control_key) = control_key else {
            self.bump(actions, StatId::AuthenticationFailures)?;
            self.push_error(
                actions,
                user,
                AuthErrorCode::AuthenticationFailed,
                "session keys not established",
            )?;
            return Ok(());
        };

        let last_challenge = self.last_challenge_sent.clone().unwrap_or_default();
        let expected_csq = self.aggressive_csq.wrapping_add(1);
        let verdict = self.codec.verify_aggressive(
            &*self.crypto,
            &control_key,
            &last_challenge,
            request.csq,
            expected_csq,
            &fragment.bytes[..aggressive_mac.fragment_mac_offset],
            &aggressive_mac.mac.mac,
        )?;

        match verdict {
            Verification::Verified => {
                debug!(user, csq = request.csq, "aggressive mode request verified");
                self.aggressive_csq = request.csq;
                self.bump(actions, StatId::SuccessfulAuthentications)?;
                self.bump(actions, StatId::CriticalMessagesReceived)?;
                self.count_authenticated_asdu(actions, user)?;
                actions.push(Action::Release(PendingRequest {
                    function_code: fragment.function_code,
                    app_seq: fragment.app_seq,
                    bytes: fragment.bytes,
                }));
            }
            Verification::MacMismatch | Verification::SequenceMismatch => {
                warn!(user, ?verdict, "aggressive mode request failed");
                self.bump(actions, StatId::AuthenticationFailures)?;
                self.push_error(
                    actions,
                    user,
                    AuthErrorCode::AuthenticationFailed,
                    "aggressive mode verification failed",
                )?;
            }
        }
        Ok(())
    }

    /// Key status requests are always answered, regardless of any pending
    /// challenge. Receiving one signals the master no longer trusts the
    /// session keys, so they are destroyed before the status is reported.
    fn on_key_status_request(
        &mut self,
        actions: &mut Vec<Action>,
        request: SessionKeyStatusRequest,
    ) -> Result<()> {
        self.bump(actions, StatId::KeyStatusRequests)?;
        let user = request.user;
        if let Err(e) = self.users.lookup(user) {
            warn!(user, %e, "key status request for unavailable user");
            self.bump(actions, StatId::AuthorizationFailures)?;
            self.push_error(actions, user, AuthErrorCode::UnknownUser, "user unavailable")?;
            return Ok(());
        }

        let context = self.users.lookup(user)?;
        context.key_status_requests += 1;
        let flooding = context.key_status_requests > self.config.max_key_status_requests;
        if flooding {
            warn!(user, "key status request limit exceeded in interval");
            let notice = self.build_error(
                user,
                AuthErrorCode::MaxSessionKeyStatusRequestsExceeded,
                "key status request flood",
            );
            self.push_error(
                actions,
                user,
                AuthErrorCode::MaxSessionKeyStatusRequestsExceeded,
                "key status request flood",
            )?;
            actions.push(Action::BroadcastSecurityNotice(WireObject {
                variation: 7,
                data: notice.serialize()?,
            }));
            return Ok(());
        }

        if self.users.get(user).is_some_and(|c| c.keys.is_some()) {
            self.users.invalidate_keys(user, KeyStatusCode::NotInit);
        }
        let (ksq, status) = {
            let context = self.users.lookup(user)?;
            (context.key_change_seq, context.status)
        };
        let key_status = self.codec.build_key_status(
            &*self.crypto,
            ksq,
            user,
            self.config.key_wrap_algorithm,
            status as u8,
            None,
        )?;
        let bytes = key_status.serialize()?;
        {
            let context = self.users.lookup(user)?;
            context.status_challenge = key_status.challenge_data.clone();
            context.last_key_status = Some(bytes.clone());
        }
        self.push_transmit(actions, 5, bytes)
    }

    fn on_key_change(
        &mut self,
        actions: &mut Vec<Action>,
        change: SessionKeyChange,
        now: Instant,
    ) -> Result<()> {
        let user = change.user;
        if let Err(e) = self.users.lookup(user) {
            warn!(user, %e, "key change for unavailable user");
            self.bump(actions, StatId::AuthorizationFailures)?;
            self.push_error(actions, user, AuthErrorCode::UnknownUser, "user unavailable")?;
            return Ok(());
        }
        let raw = change.serialize()?;

        // A retransmitted key change is answered with the saved key status
        let (duplicate, saved_status) = {
            let context = self.users.lookup(user)?;
            (
                context.last_key_change.as_deref() == Some(raw.as_slice()),
                context.last_key_status.clone(),
            )
        };
        if duplicate {
            debug!(user, "duplicate key change; re-sending key status");
            if let Some(bytes) = saved_status {
                self.push_transmit(actions, 5, bytes)?;
            }
            return Ok(());
        }

        let (expected_ksq, update_key, status_challenge) = {
            let context = self.users.lookup(user)?;
            (
                context.key_change_seq.wrapping_add(1),
                context.update_key.clone(),
                context.status_challenge.clone(),
            )
        };
        if change.ksq != expected_ksq {
            warn!(
                user,
                got = change.ksq,
                expected = expected_ksq,
                "key change sequence mismatch"
            );
            return self.fail_key_change(actions, user, "key change sequence mismatch");
        }
        let Some(update_key) = update_key else {
            warn!(user, "key change without provisioned update key");
            return self.fail_key_change(actions, user, "no update key provisioned");
        };
        if status_challenge.is_empty() {
            warn!(user, "key change without preceding key status");
            return self.fail_key_change(actions, user, "no key status outstanding");
        }

        let mut unwrapped = match self.crypto.unwrap_key(
            self.config.key_wrap_algorithm,
            &update_key,
            &change.wrapped_key_data,
        ) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(user, %e, "key unwrap failed");
                return self.fail_key_change(actions, user, "key unwrap failed");
            }
        };
        let decoded = decode_session_keys(&unwrapped, &status_challenge);
        unwrapped.zeroize();
        let (control, monitor) = match decoded {
            Ok(keys) => keys,
            Err(e) => {
                warn!(user, %e, "key change rejected");
                return self.fail_key_change(actions, user, "key data invalid");
            }
        };

        // Point of no return: install both keys, advance the sequence and
        // answer with an OK status
        let monitor_for_mac = self.variant.key_status_mac().then(|| monitor.clone());
        self.users
            .install_keys(user, control, monitor, now, self.config.key_change_interval())?;
        let ksq = self.users.advance_key_change_sequence(user)?;
        debug_assert_eq!(ksq, change.ksq);
        self.bump(actions, StatId::SessionKeyChanges)?;
        info!(user, ksq, "session keys changed");

        let key_status = self.codec.build_key_status(
            &*self.crypto,
            ksq,
            user,
            self.config.key_wrap_algorithm,
            KeyStatusCode::Ok as u8,
            monitor_for_mac.as_deref(),
        )?;
        let bytes = key_status.serialize()?;
        {
            let context = self.users.lookup(user)?;
            context.status_challenge = key_status.challenge_data.clone();
            context.last_key_status = Some(bytes.clone());
            context.last_key_change = Some(raw);
        }
        self.push_transmit(actions, 5, bytes)
    }

    /// Failure path for session key changes: prior keys and status remain
    /// untouched.
    fn fail_key_change(
        &mut self,
        actions: &mut Vec<Action>,
        user: u16,
        text: &str,
    ) -> Result<()> {
        self.bump(actions, StatId::AuthenticationFailures)?;
        self.bump(actions, StatId::FailedSessionKeyChanges)?;
        self.push_error(actions, user, AuthErrorCode::AuthenticationFailed, text)
    }

    /// The master challenged one of our responses; answer with a reply MACed
    /// with the monitor-direction key.
    fn on_challenge_received(
        &mut self,
        actions: &mut Vec<Action>,
        challenge: Challenge,
    ) -> Result<()> {
        let user = challenge.user;
        let monitor_key = self
            .users
            .get(user)
            .and_then(|c| c.keys.as_ref())
            .map(|k| k.monitor.clone());
        let Some(monitor_key) = monitor_key else {
            self.bump(actions, StatId::AuthenticationFailures)?;
            self.push_error(
                actions,
                user,
                AuthErrorCode::AuthenticationFailed,
                "session keys not established",
            )?;
            return Ok(());
        };
        let reply = self
            .codec
            .build_reply(&*self.crypto, &monitor_key, &challenge, &[])?;
        self.last_challenge_rcvd = Some(challenge);
        self.push_transmit(actions, 2, reply.serialize()?)
    }

    fn on_user_certificate(
        &mut self,
        actions: &mut Vec<Action>,
        certificate: UserCertificate,
    ) -> Result<()> {
        if !self.variant.update_key_exchange() {
            self.bump(actions, StatId::UnexpectedMessages)?;
            self.push_error(
                actions,
                DEFAULT_USER_NUMBER,
                AuthErrorCode::UpdateKeyMethodNotPermitted,
                "certificates not supported in this variant",
            )?;
            return Ok(());
        }
        // Framing already validated by the codec; certificate semantics
        // belong to the authority
        actions.push(Action::ForwardCertificate(certificate));
        Ok(())
    }

    fn on_user_status_change(
        &mut self,
        actions: &mut Vec<Action>,
        change: UserStatusChange,
    ) -> Result<()> {
        if !self.variant.update_key_exchange() {
            self.bump(actions, StatId::UnexpectedMessages)?;
            self.push_error(
                actions,
                DEFAULT_USER_NUMBER,
                AuthErrorCode::UpdateKeyMethodNotPermitted,
                "user status changes not supported in this variant",
            )?;
            return Ok(());
        }
        if self.authority_key.is_empty() {
            self.bump(actions, StatId::AuthorizationFailures)?;
            self.push_error(
                actions,
                DEFAULT_USER_NUMBER,
                AuthErrorCode::InvalidCertificationData,
                "no authority key configured",
            )?;
            return Ok(());
        }
        if change.scs <= self.status_change_seq {
            warn!(scs = change.scs, "stale user status change sequence");
            self.bump(actions, StatId::UnexpectedMessages)?;
            self.push_error(
                actions,
                DEFAULT_USER_NUMBER,
                AuthErrorCode::InvalidCertificationData,
                "stale status change sequence",
            )?;
            return Ok(());
        }

        // Certification data is the MAC of the object with that field empty
        let mut unsigned = change.clone();
        unsigned.certification_data = Vec::new();
        let certified = self.crypto.verify_mac(
            self.codec.mac_algorithm(),
            &self.authority_key,
            &unsigned.serialize()?,
            &change.certification_data,
        );
        if !matches!(certified, Ok(true)) {
            warn!("user status change certification failed");
            self.bump(actions, StatId::AuthorizationFailures)?;
            self.push_error(
                actions,
                DEFAULT_USER_NUMBER,
                AuthErrorCode::InvalidCertificationData,
                "certification data invalid",
            )?;
            return Ok(());
        }

        let operation = match UserOperation::try_from(change.operation) {
            Ok(op) => op,
            Err(_) => {
                self.bump(actions, StatId::UnexpectedMessages)?;
                self.push_error(
                    actions,
                    DEFAULT_USER_NUMBER,
                    AuthErrorCode::InvalidCertificationData,
                    "unknown operation",
                )?;
                return Ok(());
            }
        };
        match operation {
            UserOperation::Add | UserOperation::Change => {
                let user = match self.user_names.get(&change.user_name) {
                    Some(user) => *user,
                    None => {
                        let user = self
                            .users
                            .user_numbers()
                            .last()
                            .copied()
                            .unwrap_or(DEFAULT_USER_NUMBER)
                            .saturating_add(1);
                        self.user_names.insert(change.user_name.clone(), user);
                        user
                    }
                };
                if let Err(e) = self.users.lookup(user) {
                    warn!(user, %e, "cannot create user");
                    self.user_names.remove(&change.user_name);
                    self.bump(actions, StatId::AuthorizationFailures)?;
                    self.push_error(actions, user, AuthErrorCode::UnknownUser, "user limit")?;
                    return Ok(());
                }
                info!(user, ?operation, "user status change applied");
            }
            UserOperation::Delete => {
                let Some(user) = self.user_names.remove(&change.user_name) else {
                    self.bump(actions, StatId::UnexpectedMessages)?;
                    self.push_error(
                        actions,
                        DEFAULT_USER_NUMBER,
                        AuthErrorCode::UnknownUser,
                        "unknown user name",
                    )?;
                    return Ok(());
                };
                self.users.remove_user(user)?;
                if self.current_user == Some(user) {
                    // The deleted user cannot complete its handshake
                    if self.pending.take().is_some() {
                        self.bump(actions, StatId::DiscardedMessages)?;
                    }
                    self.to_idle();
                }
                info!(user, "user deleted");
            }
        }
        self.status_change_seq = change.scs;
        Ok(())
    }

    fn on_update_key_request(
        &mut self,
        actions: &mut Vec<Action>,
        request: UpdateKeyChangeRequest,
    ) -> Result<()> {
        if !self.variant.update_key_exchange() {
            self.bump(actions, StatId::UnexpectedMessages)?;
            self.push_error(
                actions,
                DEFAULT_USER_NUMBER,
                AuthErrorCode::UpdateKeyMethodNotPermitted,
                "update key exchange not supported in this variant",
            )?;
            return Ok(());
        }
        if self.authority_key.is_empty() {
            self.bump(actions, StatId::AuthorizationFailures)?;
            self.push_error(
                actions,
                DEFAULT_USER_NUMBER,
                AuthErrorCode::UpdateKeyMethodNotPermitted,
                "no authority key configured",
            )?;
            return Ok(());
        }
        let Some(user) = self.user_names.get(&request.user_name).copied() else {
            self.bump(actions, StatId::AuthorizationFailures)?;
            self.push_error(
                actions,
                DEFAULT_USER_NUMBER,
                AuthErrorCode::UnknownUser,
                "unknown user name",
            )?;
            return Ok(());
        };

        let ksq = self.users.advance_key_change_sequence(user)?;
        let mut outstation_challenge = vec![0u8; self.config.challenge_data_len];
        self.crypto.fill_random(&mut outstation_challenge)?;
        let reply = UpdateKeyChangeReply {
            ksq,
            user,
            outstation_challenge: outstation_challenge.clone(),
        };
        self.pending_update_key = Some(PendingUpdateKey {
            user,
            ksq,
            outstation_challenge,
        });
        debug!(user, ksq, "update key exchange opened");
        self.push_transmit(actions, 12, reply.serialize()?)
    }

    fn on_update_key_change(
        &mut self,
        actions: &mut Vec<Action>,
        change: UpdateKeyChange,
    ) -> Result<()> {
        if !self.variant.update_key_exchange() {
            self.bump(actions, StatId::UnexpectedMessages)?;
            self.push_error(
                actions,
                DEFAULT_USER_NUMBER,
                AuthErrorCode::UpdateKeyMethodNotPermitted,
                "update key exchange not supported in this variant",
            )?;
            return Ok(());
        }
        let Some(pending) = self.pending_update_key.take() else {
            self.bump(actions, StatId::UnexpectedMessages)?;
            self.push_error(
                actions,
                change.user,
                AuthErrorCode::UnexpectedReply,
                "no update key exchange outstanding",
            )?;
            return Ok(());
        };
        if change.ksq != pending.ksq || change.user != pending.user {
            warn!(
                user = change.user,
                ksq = change.ksq,
                "update key change does not match the open exchange"
            );
            return self.fail_update_key_change(actions, change.user);
        }

        let mut unwrapped = match self.crypto.unwrap_key(
            self.config.key_wrap_algorithm,
            &self.authority_key,
            &change.encrypted_update_key,
        ) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(user = change.user, %e, "update key unwrap failed");
                return self.fail_update_key_change(actions, change.user);
            }
        };
        let decoded = decode_update_key(&unwrapped, &pending.outstation_challenge);
        unwrapped.zeroize();
        let update_key = match decoded {
            Ok(key) => key,
            Err(e) => {
                warn!(user = change.user, %e, "update key change rejected");
                return self.fail_update_key_change(actions, change.user);
            }
        };

        let user = pending.user;
        self.users.provision_update_key(user, update_key)?;
        // A new update key obsoletes the session keys established under the
        // old one
        self.users.invalidate_keys(user, KeyStatusCode::NotInit);
        self.bump(actions, StatId::UpdateKeyChanges)?;
        info!(user, "update key changed");

        let (ksq, status) = {
            let context = self.users.lookup(user)?;
            (context.key_change_seq, context.status)
        };
        let key_status = self.codec.build_key_status(
            &*self.crypto,
            ksq,
            user,
            self.config.key_wrap_algorithm,
            status as u8,
            None,
        )?;
        let bytes = key_status.serialize()?;
        {
            let context = self.users.lookup(user)?;
            context.status_challenge = key_status.challenge_data.clone();
            context.last_key_status = Some(bytes.clone());
        }
        self.push_transmit(actions, 5, bytes)
    }

    fn fail_update_key_change(&mut self, actions: &mut Vec<Action>, user: u16) -> Result<()> {
        self.bump(actions, StatId::FailedUpdateKeyChanges)?;
        self.bump(actions, StatId::AuthenticationFailures)?;
        self.push_error(
            actions,
            user,
            AuthErrorCode::InvalidCertificationData,
            "update key change failed",
        )
    }

    /// Check all deadlines against `now`, raising the resulting internal
    /// events. The host calls this from its scheduler; nothing inside the
    /// engine blocks.
    pub fn poll_timers(&mut self, now: Instant) -> Result<Vec<Action>> {
        let mut actions = Vec::new();

        // Reply timeout: discard the pending request and go idle without
        // issuing another challenge
        if self.state == AuthState::WaitForReply
            && self.reply_deadline.is_some_and(|deadline| now >= deadline)
        {
            let user = self.current_user;
            warn!(?user, "challenge reply timer expired");
            self.bump(&mut actions, StatId::ReplyTimeouts)?;
            if self.pending.take().is_some() {
                self.bump(&mut actions, StatId::DiscardedMessages)?;
            }
            self.to_idle();
        }

        // Expected session key expiry per user
        for user in self.users.expired_users(now) {
            warn!(user, "expected session key interval expired");
            self.users.invalidate_keys(user, KeyStatusCode::NotInit);
            self.bump(&mut actions, StatId::RekeysDueToFailure)?;
        }

        // Key change interval rollover resets the per-interval budgets
        if now.duration_since(self.interval_started) >= self.config.key_change_interval() {
            self.interval_started = now;
            self.errors_sent_in_interval = 0;
            self.users.reset_interval_counters();
        }

        Ok(actions)
    }

    /// One application-layer confirm timed out. Enough consecutive timeouts
    /// on any traffic are treated as a device-level communications failure.
    pub fn on_app_confirm_timeout(&mut self, _now: Instant) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        self.confirm_timeouts += 1;
        if self.confirm_timeouts < self.config.max_comm_fail_confirms {
            return Ok(actions);
        }
        self.confirm_timeouts = 0;
        warn!("communications failure detected");
        if self.state == AuthState::WaitForReply {
            if let Some(user) = self.current_user {
                self.users.invalidate_keys(user, KeyStatusCode::CommFail);
            }
            self.bump(&mut actions, StatId::ReplyTimeouts)?;
            if self.pending.take().is_some() {
                self.bump(&mut actions, StatId::DiscardedMessages)?;
            }
            self.to_idle();
        }
        Ok(actions)
    }

    /// An application-layer confirm arrived; the failure counter restarts.
    pub fn on_app_confirm(&mut self) {
        self.confirm_timeouts = 0;
    }

    /// Session close: flush statistics; key material zeroizes on drop.
    pub fn close(mut self) -> Result<()> {
        self.flush_statistics()
    }

    /// Register a user name for the update key exchange, as the authority
    /// provisions it.
    pub fn register_user_name(&mut self, name: Vec<u8>, user: u16) -> Result<()> {
        self.users.lookup(user)?;
        self.user_names.insert(name, user);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_session_keys;
    use crate::config::{SaConfig, SaVariant, UserConfig};
    use crate::crypto::{MacAlgorithm, SoftwareCrypto};
    use crate::objects::SessionKeyStatus;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const UPDATE_KEY: [u8; 16] = [0x5A; 16];

    fn test_config() -> SaConfig {
        SaConfig {
            users: vec![UserConfig {
                number: 1,
                update_key: hex::encode(UPDATE_KEY),
            }],
            ..SaConfig::default()
        }
    }

    fn engine_with(config: SaConfig) -> SecureAuthEngine {
        SecureAuthEngine::new(
            config,
            Box::new(SoftwareCrypto::new()),
            Box::new(MemoryStore::new()),
            Instant::now(),
        )
        .unwrap()
    }

    fn engine() -> SecureAuthEngine {
        engine_with(test_config())
    }

    fn transmitted(actions: &[Action], variation: u8) -> Option<WireObject> {
        actions.iter().find_map(|a| match a {
            Action::Transmit(obj) if obj.variation == variation => Some(obj.clone()),
            _ => None,
        })
    }

    fn released(actions: &[Action]) -> Option<PendingRequest> {
        actions.iter().find_map(|a| match a {
            Action::Release(request) => Some(request.clone()),
            _ => None,
        })
    }

    /// Drive a full session key establishment for the user, returning the
    /// installed control and monitor keys.
    fn establish_keys(engine: &mut SecureAuthEngine, user: u16) -> (Vec<u8>, Vec<u8>) {
        let now = Instant::now();
        let actions = engine
            .on_fragment(
                Fragment::with_auth(
                    32,
                    0,
                    AuthObject::SessionKeyStatusRequest(SessionKeyStatusRequest { user }),
                ),
                now,
            )
            .unwrap();
        let status_bytes = transmitted(&actions, 5).expect("key status").data;
        let status = SessionKeyStatus::deserialize(&status_bytes).unwrap();
        assert_eq!(status.key_status, KeyStatusCode::NotInit as u8);

        let control = vec![0x11u8; 16];
        let monitor = vec![0x22u8; 16];
        let blob = encode_session_keys(&control, &monitor, &status.challenge_data).unwrap();
        let crypto = SoftwareCrypto::new();
        let wrapped = crypto
            .wrap_key(crate::crypto::KeyWrapAlgorithm::Aes128, &UPDATE_KEY, &blob)
            .unwrap();
        let change = SessionKeyChange {
            ksq: status.ksq.wrapping_add(1),
            user,
            wrapped_key_data: wrapped,
        };
        let actions = engine
            .on_fragment(
                Fragment::with_auth(32, 0, AuthObject::SessionKeyChange(change)),
                now,
            )
            .unwrap();
        let ok_status = transmitted(&actions, 5).expect("OK key status");
        let ok = SessionKeyStatus::deserialize(&ok_status.data).unwrap();
        assert_eq!(ok.key_status, KeyStatusCode::Ok as u8);
        (control, monitor)
    }

    /// Authenticate one critical request end to end, marking the user as
    /// having completed a challenge round trip.
    fn authenticate_once(engine: &mut SecureAuthEngine, control: &[u8]) {
        let now = Instant::now();
        let request_bytes = b"select CROB point 4".to_vec();
        let actions = engine
            .on_fragment(Fragment::plain(3, 1, request_bytes.clone()), now)
            .unwrap();
        let challenge_bytes = transmitted(&actions, 1).expect("challenge").data;
        let challenge = Challenge::deserialize(&challenge_bytes).unwrap();

        let crypto = SoftwareCrypto::new();
        let codec = ChallengeCodec::new(20, MacAlgorithm::HmacSha256Trunc16);
        let mac = codec
            .compute_reply_mac(&crypto, control, &challenge_bytes, &request_bytes)
            .unwrap();
        let reply = ChallengeReply {
            csq: challenge.csq,
            user: challenge.user,
            mac,
        };
        let actions = engine
            .on_fragment(
                Fragment::with_auth(131, 1, AuthObject::ChallengeReply(reply)),
                now,
            )
            .unwrap();
        assert_eq!(released(&actions).unwrap().bytes, request_bytes);
        assert_eq!(engine.state(), AuthState::Idle);
    }

    #[test]
    fn test_non_critical_passes_through() {
        let mut engine = engine();
        let actions = engine
            .on_fragment(Fragment::plain(1, 0, b"read class 0".to_vec()), Instant::now())
            .unwrap();
        let request = released(&actions).unwrap();
        assert_eq!(request.function_code, 1);
        assert_eq!(engine.state(), AuthState::Idle);
    }

    #[test]
    fn test_critical_request_triggers_challenge() {
        let mut engine = engine();
        let actions = engine
            .on_fragment(Fragment::plain(5, 0, b"direct operate".to_vec()), Instant::now())
            .unwrap();
        assert!(released(&actions).is_none());
        let challenge_bytes = transmitted(&actions, 1).expect("challenge").data;
        let challenge = Challenge::deserialize(&challenge_bytes).unwrap();
        assert_eq!(challenge.user, DEFAULT_USER_NUMBER);
        assert_eq!(challenge.csq, 1);
        assert!(!challenge.challenge_data.is_empty());
        assert_eq!(engine.state(), AuthState::WaitForReply);
        assert_eq!(engine.current_user(), Some(1));
    }

    #[test]
    fn test_challenge_reply_round_trip_releases_request() {
        let mut engine = engine();
        let (control, _) = establish_keys(&mut engine, 1);
        authenticate_once(&mut engine, &control);
        assert_eq!(engine.statistic(StatId::SuccessfulAuthentications).unwrap(), 1);
    }

    #[test]
    fn test_bad_reply_counts_failure_and_errors() {
        let mut engine = engine();
        let (_, _) = establish_keys(&mut engine, 1);
        let now = Instant::now();
        let actions = engine
            .on_fragment(Fragment::plain(5, 0, b"operate".to_vec()), now)
            .unwrap();
        let challenge_bytes = transmitted(&actions, 1).unwrap().data;
        let challenge = Challenge::deserialize(&challenge_bytes).unwrap();
        let reply = ChallengeReply {
            csq: challenge.csq,
            user: 1,
            mac: vec![0u8; 16],
        };
        let actions = engine
            .on_fragment(
                Fragment::with_auth(131, 0, AuthObject::ChallengeReply(reply)),
                now,
            )
            .unwrap();
        assert!(released(&actions).is_none());
        assert!(transmitted(&actions, 7).is_some());
        assert_eq!(engine.state(), AuthState::Idle);
        assert_eq!(engine.statistic(StatId::AuthenticationFailures).unwrap(), 1);
        // The discarded pending request is not held anywhere
        assert_eq!(engine.statistic(StatId::DiscardedMessages).unwrap(), 1);
    }

    #[test]
    fn test_reply_timeout_scenario_one_shot_on_third() {
        let mut config = test_config();
        config.thresholds.max_reply_timeouts = 2;
        let mut engine = engine_with(config);
        let mut now = Instant::now();

        for round in 1..=3u32 {
            let actions = engine
                .on_fragment(Fragment::plain(5, 0, b"operate".to_vec()), now)
                .unwrap();
            assert!(transmitted(&actions, 1).is_some());
            now += Duration::from_secs(3);
            let actions = engine.poll_timers(now).unwrap();
            assert_eq!(engine.state(), AuthState::Idle);
            let notified = actions
                .iter()
                .any(|a| matches!(a, Action::NotifyMaxExceeded(StatId::ReplyTimeouts)));
            if round == 3 {
                assert!(notified, "one-shot action fires on the 3rd timeout");
            } else {
                assert!(!notified, "no action before the max is exceeded");
            }
        }
        assert_eq!(engine.statistic(StatId::ReplyTimeouts).unwrap(), 3);

        // Further timeouts do not re-fire the latch
        let actions = engine
            .on_fragment(Fragment::plain(5, 0, b"operate".to_vec()), now)
            .unwrap();
        assert!(transmitted(&actions, 1).is_some());
        now += Duration::from_secs(3);
        let actions = engine.poll_timers(now).unwrap();
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::NotifyMaxExceeded(_))));
    }

    #[test]
    fn test_aggressive_rejected_before_first_reply() {
        let mut engine = engine();
        let (control, _) = establish_keys(&mut engine, 1);

        // Craft an aggressive request with a cryptographically valid MAC
        let crypto = SoftwareCrypto::new();
        let codec = ChallengeCodec::new(20, MacAlgorithm::HmacSha256Trunc16);
        let bytes = b"direct operate".to_vec();
        let mac = codec
            .compute_aggressive_mac(&crypto, &control, &[], 1, &bytes)
            .unwrap();
        let fragment = Fragment {
            function_code: 5,
            app_seq: 0,
            user: Some(1),
            bytes,
            auth: Some(AuthObject::AggressiveModeRequest(AggressiveModeRequest {
                csq: 1,
                user: 1,
            })),
            aggressive_mac: Some(AggressiveMac {
                mac: MacValue { mac },
                fragment_mac_offset: 14,
            }),
        };
        let actions = engine.on_fragment(fragment, Instant::now()).unwrap();
        assert!(released(&actions).is_none());
        assert!(transmitted(&actions, 7).is_some());
        assert_eq!(engine.statistic(StatId::AuthenticationFailures).unwrap(), 1);
    }

    #[test]
    fn test_aggressive_accepted_after_trust_established() {
        let mut engine = engine();
        let (control, _) = establish_keys(&mut engine, 1);
        authenticate_once(&mut engine, &control);

        // The last challenge sent and its CSQ anchor the aggressive sequence
        let crypto = SoftwareCrypto::new();
        let codec = ChallengeCodec::new(20, MacAlgorithm::HmacSha256Trunc16);
        let last_challenge = engine.last_challenge_sent.clone().unwrap();
        let csq = engine.aggressive_csq.wrapping_add(1);
        let bytes = b"direct operate point 9".to_vec();
        let mac = codec
            .compute_aggressive_mac(&crypto, &control, &last_challenge, csq, &bytes)
            .unwrap();
        let fragment = Fragment {
            function_code: 5,
            app_seq: 2,
            user: Some(1),
            bytes: bytes.clone(),
            auth: Some(AuthObject::AggressiveModeRequest(AggressiveModeRequest {
                csq,
                user: 1,
            })),
            aggressive_mac: Some(AggressiveMac {
                mac: MacValue { mac },
                fragment_mac_offset: bytes.len(),
            }),
        };
        let actions = engine.on_fragment(fragment, Instant::now()).unwrap();
        assert_eq!(released(&actions).unwrap().bytes, bytes);
        // Replay of the same CSQ is rejected
        assert_eq!(engine.aggressive_csq, csq);
    }

    #[test]
    fn test_key_change_replay_rejected_keys_unchanged() {
        let mut engine = engine();
        let (_, _) = establish_keys(&mut engine, 1);
        let ksq_before = engine.user_store().get(1).unwrap().key_change_sequence();

        // Same KSQ again with different bytes: replayed sequence number
        let change = SessionKeyChange {
            ksq: ksq_before,
            user: 1,
            wrapped_key_data: vec![0xEE; 48],
        };
        let actions = engine
            .on_fragment(
                Fragment::with_auth(32, 0, AuthObject::SessionKeyChange(change)),
                Instant::now(),
            )
            .unwrap();
        assert!(transmitted(&actions, 7).is_some());
        let context = engine.user_store().get(1).unwrap();
        assert_eq!(context.key_change_sequence(), ksq_before);
        assert_eq!(context.key_status(), KeyStatusCode::Ok);
        assert!(context.has_session_keys());
        assert_eq!(engine.statistic(StatId::FailedSessionKeyChanges).unwrap(), 1);
    }

    #[test]
    fn test_key_change_unwrap_failure_leaves_prior_keys() {
        let mut engine = engine();
        let (_, _) = establish_keys(&mut engine, 1);
        let ksq = engine.user_store().get(1).unwrap().key_change_sequence();

        let change = SessionKeyChange {
            ksq: ksq.wrapping_add(1),
            user: 1,
            wrapped_key_data: vec![0xEE; 48],
        };
        let actions = engine
            .on_fragment(
                Fragment::with_auth(32, 0, AuthObject::SessionKeyChange(change)),
                Instant::now(),
            )
            .unwrap();
        assert!(transmitted(&actions, 7).is_some());
        let context = engine.user_store().get(1).unwrap();
        assert!(context.has_session_keys());
        assert_eq!(context.key_status(), KeyStatusCode::Ok);
        // The failed attempt did not consume the sequence number
        assert_eq!(context.key_change_sequence(), ksq);
    }

    #[test]
    fn test_key_status_flood_raises_broadcast_notice() {
        let mut config = test_config();
        config.max_key_status_requests = 1;
        let mut engine = engine_with(config);
        let now = Instant::now();
        let request = Fragment::with_auth(
            32,
            0,
            AuthObject::SessionKeyStatusRequest(SessionKeyStatusRequest { user: 1 }),
        );

        let actions = engine.on_fragment(request.clone(), now).unwrap();
        assert!(transmitted(&actions, 5).is_some());

        let actions = engine.on_fragment(request, now).unwrap();
        assert!(transmitted(&actions, 5).is_none());
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::BroadcastSecurityNotice(_))));
    }

    #[test]
    fn test_single_flight_invariant() {
        let mut engine = engine();
        let now = Instant::now();
        engine
            .on_fragment(Fragment::plain(5, 0, b"first".to_vec()), now)
            .unwrap();
        assert_eq!(engine.current_user(), Some(1));

        // A second critical request while waiting displaces the first; there
        // is still exactly one user mid-handshake and one pending request
        let actions = engine
            .on_fragment(Fragment::plain(3, 1, b"second".to_vec()), now)
            .unwrap();
        assert!(transmitted(&actions, 1).is_some());
        assert_eq!(engine.state(), AuthState::WaitForReply);
        assert_eq!(engine.current_user(), Some(1));
        assert_eq!(engine.pending.get().unwrap().bytes, b"second".to_vec());
        assert_eq!(engine.statistic(StatId::DiscardedMessages).unwrap(), 1);
    }

    #[test]
    fn test_comm_failure_clears_wait_for_reply() {
        let mut engine = engine();
        let now = Instant::now();
        engine
            .on_fragment(Fragment::plain(5, 0, b"operate".to_vec()), now)
            .unwrap();
        assert_eq!(engine.state(), AuthState::WaitForReply);

        for _ in 0..2 {
            let actions = engine.on_app_confirm_timeout(now).unwrap();
            assert!(actions.is_empty());
            assert_eq!(engine.state(), AuthState::WaitForReply);
        }
        engine.on_app_confirm_timeout(now).unwrap();
        assert_eq!(engine.state(), AuthState::Idle);
        assert!(!engine.pending.is_occupied());
        assert_eq!(
            engine.user_store().get(1).unwrap().key_status(),
            KeyStatusCode::CommFail
        );
    }

    #[test]
    fn test_app_confirm_resets_failure_counter() {
        let mut engine = engine();
        let now = Instant::now();
        engine
            .on_fragment(Fragment::plain(5, 0, b"operate".to_vec()), now)
            .unwrap();
        engine.on_app_confirm_timeout(now).unwrap();
        engine.on_app_confirm_timeout(now).unwrap();
        engine.on_app_confirm();
        engine.on_app_confirm_timeout(now).unwrap();
        assert_eq!(engine.state(), AuthState::WaitForReply);
    }

    #[test]
    fn test_expected_key_timeout_invalidates_keys() {
        let mut engine = engine();
        let (_, _) = establish_keys(&mut engine, 1);
        assert!(engine.user_store().get(1).unwrap().has_session_keys());

        let later = Instant::now() + Duration::from_secs(1000);
        engine.poll_timers(later).unwrap();
        let context = engine.user_store().get(1).unwrap();
        assert!(!context.has_session_keys());
        assert_eq!(context.key_status(), KeyStatusCode::NotInit);
        assert_eq!(engine.statistic(StatId::RekeysDueToFailure).unwrap(), 1);
    }

    #[test]
    fn test_sav2_rejects_aggressive_and_update_key_objects() {
        let mut config = test_config();
        config.variant = SaVariant::V2;
        config.aggressive_mode_enabled = false;
        config.mac_algorithm = MacAlgorithm::HmacSha1Trunc8;
        let mut engine = engine_with(config);
        let now = Instant::now();

        let fragment = Fragment {
            function_code: 5,
            app_seq: 0,
            user: Some(1),
            bytes: b"op".to_vec(),
            auth: Some(AuthObject::AggressiveModeRequest(AggressiveModeRequest {
                csq: 1,
                user: 1,
            })),
            aggressive_mac: None,
        };
        let actions = engine.on_fragment(fragment, now).unwrap();
        let error = transmitted(&actions, 7).unwrap();
        let decoded = ErrorObject::deserialize(&error.data).unwrap();
        assert_eq!(
            decoded.error_code,
            AuthErrorCode::AggressiveModeNotSupported as u8
        );

        let request = Fragment::with_auth(
            32,
            0,
            AuthObject::UpdateKeyChangeRequest(UpdateKeyChangeRequest {
                key_change_method: 3,
                user_name: b"op".to_vec(),
                master_challenge: vec![1; 4],
            }),
        );
        let actions = engine.on_fragment(request, now).unwrap();
        let error = transmitted(&actions, 7).unwrap();
        let decoded = ErrorObject::deserialize(&error.data).unwrap();
        assert_eq!(
            decoded.error_code,
            AuthErrorCode::UpdateKeyMethodNotPermitted as u8
        );
    }

    #[test]
    fn test_update_key_exchange_round_trip() {
        const AUTHORITY_KEY: [u8; 16] = [0x77; 16];
        let mut config = test_config();
        config.authority_key = hex::encode(AUTHORITY_KEY);
        let mut engine = engine_with(config);
        engine.register_user_name(b"operator-7".to_vec(), 2).unwrap();
        let now = Instant::now();

        let request = Fragment::with_auth(
            32,
            0,
            AuthObject::UpdateKeyChangeRequest(UpdateKeyChangeRequest {
                key_change_method: 3,
                user_name: b"operator-7".to_vec(),
                master_challenge: vec![1; 8],
            }),
        );
        let actions = engine.on_fragment(request, now).unwrap();
        let reply_bytes = transmitted(&actions, 12).expect("update key reply").data;
        let reply = UpdateKeyChangeReply::deserialize(&reply_bytes).unwrap();
        assert_eq!(reply.user, 2);

        let new_update_key = vec![0x99u8; 16];
        let blob =
            crate::codec::encode_update_key(&new_update_key, &reply.outstation_challenge)
                .unwrap();
        let crypto = SoftwareCrypto::new();
        let wrapped = crypto
            .wrap_key(crate::crypto::KeyWrapAlgorithm::Aes128, &AUTHORITY_KEY, &blob)
            .unwrap();
        let change = Fragment::with_auth(
            32,
            1,
            AuthObject::UpdateKeyChange(UpdateKeyChange {
                ksq: reply.ksq,
                user: reply.user,
                encrypted_update_key: wrapped,
            }),
        );
        let actions = engine.on_fragment(change, now).unwrap();
        assert!(transmitted(&actions, 5).is_some());
        assert!(engine.user_store().get(2).unwrap().has_update_key());
        assert_eq!(engine.statistic(StatId::UpdateKeyChanges).unwrap(), 1);
    }

    #[test]
    fn test_update_key_change_tampered_fails() {
        const AUTHORITY_KEY: [u8; 16] = [0x77; 16];
        let mut config = test_config();
        config.authority_key = hex::encode(AUTHORITY_KEY);
        let mut engine = engine_with(config);
        engine.register_user_name(b"operator-7".to_vec(), 2).unwrap();
        let now = Instant::now();

        let request = Fragment::with_auth(
            32,
            0,
            AuthObject::UpdateKeyChangeRequest(UpdateKeyChangeRequest {
                key_change_method: 3,
                user_name: b"operator-7".to_vec(),
                master_challenge: vec![1; 8],
            }),
        );
        let actions = engine.on_fragment(request, now).unwrap();
        let reply_bytes = transmitted(&actions, 12).unwrap().data;
        let reply = UpdateKeyChangeReply::deserialize(&reply_bytes).unwrap();

        let change = Fragment::with_auth(
            32,
            1,
            AuthObject::UpdateKeyChange(UpdateKeyChange {
                ksq: reply.ksq,
                user: reply.user,
                encrypted_update_key: vec![0xAB; 32],
            }),
        );
        let actions = engine.on_fragment(change, now).unwrap();
        assert!(transmitted(&actions, 7).is_some());
        assert!(!engine.user_store().get(2).unwrap().has_update_key());
        assert_eq!(engine.statistic(StatId::FailedUpdateKeyChanges).unwrap(), 1);
    }

    #[test]
    fn test_user_status_change_certified_add_then_delete() {
        const AUTHORITY_KEY: [u8; 16] = [0x77; 16];
        let mut config = test_config();
        config.authority_key = hex::encode(AUTHORITY_KEY);
        let mut engine = engine_with(config);
        let now = Instant::now();
        let crypto = SoftwareCrypto::new();

        let mut change = UserStatusChange {
            key_change_method: 3,
            operation: UserOperation::Add as u8,
            scs: 1,
            user_role: 2,
            user_role_expiry_days: 365,
            user_name: b"operator-9".to_vec(),
            user_public_key: vec![],
            certification_data: vec![],
        };
        change.certification_data = crypto
            .compute_mac(
                MacAlgorithm::HmacSha256Trunc16,
                &AUTHORITY_KEY,
                &change.serialize().unwrap(),
            )
            .unwrap();
        let users_before = engine.user_store().user_count();
        let actions = engine
            .on_fragment(
                Fragment::with_auth(32, 0, AuthObject::UserStatusChange(change.clone())),
                now,
            )
            .unwrap();
        assert!(transmitted(&actions, 7).is_none());
        assert_eq!(engine.user_store().user_count(), users_before + 1);

        // Replayed sequence number is rejected
        let actions = engine
            .on_fragment(
                Fragment::with_auth(32, 0, AuthObject::UserStatusChange(change)),
                now,
            )
            .unwrap();
        assert!(transmitted(&actions, 7).is_some());

        let mut delete = UserStatusChange {
            key_change_method: 3,
            operation: UserOperation::Delete as u8,
            scs: 2,
            user_role: 2,
            user_role_expiry_days: 0,
            user_name: b"operator-9".to_vec(),
            user_public_key: vec![],
            certification_data: vec![],
        };
        delete.certification_data = crypto
            .compute_mac(
                MacAlgorithm::HmacSha256Trunc16,
                &AUTHORITY_KEY,
                &delete.serialize().unwrap(),
            )
            .unwrap();
        let actions = engine
            .on_fragment(
                Fragment::with_auth(32, 0, AuthObject::UserStatusChange(delete)),
                now,
            )
            .unwrap();
        assert!(transmitted(&actions, 7).is_none());
        assert_eq!(engine.user_store().user_count(), users_before);
    }

    #[test]
    fn test_user_status_change_bad_certification_rejected() {
        const AUTHORITY_KEY: [u8; 16] = [0x77; 16];
        let mut config = test_config();
        config.authority_key = hex::encode(AUTHORITY_KEY);
        let mut engine = engine_with(config);

        let change = UserStatusChange {
            key_change_method: 3,
            operation: UserOperation::Add as u8,
            scs: 1,
            user_role: 2,
            user_role_expiry_days: 365,
            user_name: b"operator-9".to_vec(),
            user_public_key: vec![],
            certification_data: vec![0u8; 16],
        };
        let users_before = engine.user_store().user_count();
        let actions = engine
            .on_fragment(
                Fragment::with_auth(32, 0, AuthObject::UserStatusChange(change)),
                Instant::now(),
            )
            .unwrap();
        let error = transmitted(&actions, 7).unwrap();
        let decoded = ErrorObject::deserialize(&error.data).unwrap();
        assert_eq!(
            decoded.error_code,
            AuthErrorCode::InvalidCertificationData as u8
        );
        assert_eq!(engine.user_store().user_count(), users_before);
    }

    #[test]
    fn test_error_rate_limit_suppresses_transmission() {
        let mut config = test_config();
        config.max_error_count = 1;
        let mut engine = engine_with(config);
        let now = Instant::now();
        let bogus = Fragment::with_auth(
            131,
            0,
            AuthObject::ChallengeReply(ChallengeReply {
                csq: 9,
                user: 1,
                mac: vec![0; 16],
            }),
        );
        let actions = engine.on_fragment(bogus.clone(), now).unwrap();
        assert!(transmitted(&actions, 7).is_some());

        let actions = engine.on_fragment(bogus, now).unwrap();
        assert!(transmitted(&actions, 7).is_none());
        assert_eq!(engine.statistic(StatId::ErrorMessagesSent).unwrap(), 1);
    }
}
