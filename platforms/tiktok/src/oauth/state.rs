//! Single-use CSRF state tokens for in-flight authorizations.

use crate::credentials::SubjectId;
use crate::error::TikTokError;
use jiff::{SignedDuration, Timestamp};
use oauth2::CsrfToken;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// An authorization request that has been sent to TikTok but not yet redeemed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub subject: SubjectId,
    pub created_at: Timestamp,
}

/// Maps issued state tokens to the subject that started the flow.
///
/// Each state can be consumed exactly once. States older than the TTL are rejected on
/// consumption and removed by [`OAuthStateStore::sweep`].
#[derive(Debug)]
pub struct OAuthStateStore {
    ttl: SignedDuration,
    pending: Mutex<HashMap<String, PendingAuthorization>>,
}

impl OAuthStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: SignedDuration::try_from(ttl).unwrap_or(SignedDuration::MAX),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Records that `state` was handed out on behalf of `subject`.
    pub fn remember(&self, state: &CsrfToken, subject: SubjectId) {
        self.remember_at(state, subject, Timestamp::now());
    }

    pub(crate) fn remember_at(&self, state: &CsrfToken, subject: SubjectId, now: Timestamp) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                state.secret().clone(),
                PendingAuthorization {
                    subject,
                    created_at: now,
                },
            );
    }

    /// Redeems a state presented by a callback and returns the subject it was issued for.
    ///
    /// The entry is removed whether or not it had expired, so a second presentation of the
    /// same state always fails.
    pub fn consume(&self, state: &str) -> Result<SubjectId, TikTokError> {
        self.consume_at(state, Timestamp::now())
    }

    pub(crate) fn consume_at(&self, state: &str, now: Timestamp) -> Result<SubjectId, TikTokError> {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(state);

        match entry {
            Some(pending) if now.duration_since(pending.created_at) <= self.ttl => {
                Ok(pending.subject)
            }
            Some(pending) => {
                tracing::warn!(subject = %pending.subject, "rejected expired OAuth state");
                Err(TikTokError::InvalidState)
            }
            None => {
                tracing::warn!("rejected unknown or reused OAuth state");
                Err(TikTokError::InvalidState)
            }
        }
    }

    /// Drops every state older than the TTL and returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Timestamp::now())
    }

    pub(crate) fn sweep_at(&self, now: Timestamp) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let before = pending.len();
        pending.retain(|_, p| now.duration_since(p.created_at) <= self.ttl);
        before - pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs [`Self::sweep`] every `every` until the returned task is aborted.
    ///
    /// Periods shorter than one second are raised to one second.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        let every = every.max(MIN_SWEEP_PERIOD);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let evicted = self.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, "swept expired OAuth states");
                }
            }
        })
    }
}
