//! Relay access token service.
//!
//! Issues opaque bearer tokens that public clients present when opening a
//! relay tunnel. Every token carries a TTL, a refresh window, and a
//! per-subject sequence number that increases monotonically — a refresh or
//! reissue supersedes all earlier tokens for that subject, and verification
//! reports a superseded token as `sequence-mismatch` rather than `unknown`.
//!
//! # Security model
//!
//! - Tokens are 128 bits of OS CSPRNG randomness (UUID v4, hex).
//! - Comparison uses `subtle::ConstantTimeEq` to prevent timing
//!   side-channels.
//! - Verification is O(1) key-value lookups and never blocks on the write
//!   path; mutations serialize behind a single async mutex.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::info;

use hypertuna_storage::StorageBackend;

use crate::error::TokenError;

/// Storage prefix for per-subject token records.
const SUBJECT_PREFIX: &str = "tokens/subject/";

/// Storage prefix for token → subject index entries.
const INDEX_PREFIX: &str = "tokens/index/";

/// Default token TTL when the caller does not request one.
const DEFAULT_TTL_SECONDS: i64 = 3600;

/// Refresh window floor — never shorter than this, whatever the TTL.
const MIN_REFRESH_WINDOW_MS: i64 = 500;

/// Observer notified when a revocation should reach other gateway instances.
pub trait TokenRevocationBroadcast: Send + Sync {
    /// Called once per broadcast revocation.
    fn token_revoked(&self, subject: &str, reason: &str);
}

/// The persisted state for a subject's current token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// The current opaque token (hex, 32 chars).
    pub token: String,
    /// Subject this token authenticates (relay key or peer id).
    pub subject: String,
    /// Scope string, e.g. `relay`.
    pub scope: String,
    /// Optional Nostr pubkey bound at issue time.
    pub pubkey: Option<String>,
    /// Worker-issued relay auth token carried through opaquely.
    pub relay_auth_token: Option<String>,
    /// Who requested the issue (for audit).
    pub issued_by: Option<String>,
    /// Monotonically increasing per-subject sequence.
    pub sequence: u64,
    /// TTL used at issue time; refreshes reuse it unless overridden.
    pub ttl_seconds: i64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Clients should refresh after this instant and before `expires_at`.
    pub refresh_after: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Options for [`TokenService::issue`].
#[derive(Debug, Default, Clone)]
pub struct IssueOptions {
    pub scope: Option<String>,
    pub ttl_seconds: Option<i64>,
    pub issued_by: Option<String>,
    pub pubkey: Option<String>,
    pub relay_auth_token: Option<String>,
}

/// Options for [`TokenService::refresh`].
#[derive(Debug, Clone)]
pub struct RefreshOptions {
    /// The current token string; must match the stored record.
    pub token: String,
    /// When present, must equal the stored sequence.
    pub sequence: Option<u64>,
    /// Override the TTL for the refreshed token.
    pub requested_ttl_seconds: Option<i64>,
}

/// Options for [`TokenService::revoke`].
#[derive(Debug, Clone)]
pub struct RevokeOptions {
    pub reason: String,
    /// Notify other gateway instances through the broadcast observer.
    pub broadcast: bool,
}

/// Result of issuing or refreshing a token.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_after: DateTime<Utc>,
    pub sequence: u64,
}

/// Why a token failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyReason {
    Unknown,
    Expired,
    Revoked,
    SequenceMismatch,
}

impl VerifyReason {
    /// Wire slug for REST errors and NOTICE frames.
    #[must_use]
    pub fn as_slug(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::SequenceMismatch => "sequence-mismatch",
        }
    }
}

/// Result of [`TokenService::verify`].
#[derive(Debug, Clone)]
pub struct Verification {
    pub valid: bool,
    pub subject: Option<String>,
    pub scope: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<VerifyReason>,
}

impl Verification {
    fn rejected(reason: VerifyReason) -> Self {
        Self {
            valid: false,
            subject: None,
            scope: None,
            expires_at: None,
            reason: Some(reason),
        }
    }
}

/// Issues, refreshes, revokes, and verifies relay access tokens.
pub struct TokenService {
    storage: Arc<dyn StorageBackend>,
    broadcast: Option<Arc<dyn TokenRevocationBroadcast>>,
    /// Serializes all mutations. Verification does not take this lock.
    write_lock: tokio::sync::Mutex<()>,
}

impl TokenService {
    /// Create a token service backed by the given key-value store.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            broadcast: None,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Attach a revocation broadcast observer.
    #[must_use]
    pub fn with_broadcast(mut self, broadcast: Arc<dyn TokenRevocationBroadcast>) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    /// Issue a new token for `subject`, superseding any existing one.
    ///
    /// The sequence picks up from the stored record, so a second issue
    /// without a revoke returns `sequence + 1` and invalidates the first
    /// token (it will verify as `sequence-mismatch` from then on).
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Storage`] if the key-value store fails.
    pub async fn issue(
        &self,
        subject: &str,
        options: IssueOptions,
    ) -> Result<IssuedToken, TokenError> {
        let _guard = self.write_lock.lock().await;

        let previous = self.load_record(subject).await?;
        let sequence = previous.as_ref().map_or(1, |r| r.sequence.saturating_add(1));

        let record = build_record(subject, sequence, &options, Utc::now());
        self.store_record(&record).await?;

        info!(subject = %subject, sequence, "token issued");

        Ok(issued_view(&record))
    }

    /// Refresh `subject`'s token, rotating the token string and bumping the
    /// sequence. Preserves scope, pubkey, and the relay auth token; clears
    /// any revocation.
    ///
    /// A refresh that presents the wrong token or an older sequence fails
    /// and does not mutate state.
    ///
    /// # Errors
    ///
    /// - [`TokenError::UnknownSubject`] when no record exists.
    /// - [`TokenError::Unauthorized`] when the token does not match or has
    ///   already expired.
    /// - [`TokenError::SequenceMismatch`] when an explicit sequence is stale.
    /// - [`TokenError::Storage`] if the key-value store fails.
    pub async fn refresh(
        &self,
        subject: &str,
        options: RefreshOptions,
    ) -> Result<IssuedToken, TokenError> {
        let _guard = self.write_lock.lock().await;

        let stored = self
            .load_record(subject)
            .await?
            .ok_or(TokenError::UnknownSubject)?;

        if !tokens_equal(&stored.token, &options.token) {
            return Err(TokenError::Unauthorized {
                reason: "token does not match current record".to_owned(),
            });
        }

        if let Some(sequence) = options.sequence {
            if sequence != stored.sequence {
                return Err(TokenError::SequenceMismatch {
                    presented: sequence,
                    current: stored.sequence,
                });
            }
        }

        let now = Utc::now();
        if now >= stored.expires_at {
            return Err(TokenError::Unauthorized {
                reason: "token expired; reissue instead of refreshing".to_owned(),
            });
        }

        let carried = IssueOptions {
            scope: Some(stored.scope.clone()),
            ttl_seconds: Some(options.requested_ttl_seconds.unwrap_or(stored.ttl_seconds)),
            issued_by: stored.issued_by.clone(),
            pubkey: stored.pubkey.clone(),
            relay_auth_token: stored.relay_auth_token.clone(),
        };
        let record = build_record(subject, stored.sequence.saturating_add(1), &carried, now);
        self.store_record(&record).await?;

        info!(subject = %subject, sequence = record.sequence, "token refreshed");

        Ok(issued_view(&record))
    }

    /// Revoke `subject`'s current token.
    ///
    /// # Errors
    ///
    /// - [`TokenError::UnknownSubject`] when no record exists.
    /// - [`TokenError::Storage`] if the key-value store fails.
    pub async fn revoke(&self, subject: &str, options: RevokeOptions) -> Result<(), TokenError> {
        let _guard = self.write_lock.lock().await;

        let mut record = self
            .load_record(subject)
            .await?
            .ok_or(TokenError::UnknownSubject)?;
        record.revoked_at = Some(Utc::now());
        self.store_record(&record).await?;

        info!(subject = %subject, reason = %options.reason, "token revoked");

        if options.broadcast {
            if let Some(broadcast) = &self.broadcast {
                broadcast.token_revoked(subject, &options.reason);
            }
        }

        Ok(())
    }

    /// Verify a presented token. Never mutates state.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Storage`] if the key-value store fails; all
    /// authentication outcomes are carried in the returned [`Verification`].
    pub async fn verify(&self, token: &str) -> Result<Verification, TokenError> {
        let index_key = format!("{INDEX_PREFIX}{token}");
        let Some(subject_bytes) = self.storage.get(&index_key).await? else {
            return Ok(Verification::rejected(VerifyReason::Unknown));
        };
        let subject = String::from_utf8(subject_bytes).map_err(|e| TokenError::Corrupt {
            reason: format!("index entry not utf-8: {e}"),
        })?;

        let Some(record) = self.load_record(&subject).await? else {
            return Ok(Verification::rejected(VerifyReason::Unknown));
        };

        // A token that maps to the subject but no longer matches the record
        // was superseded by a later issue or refresh.
        if !tokens_equal(&record.token, token) {
            return Ok(Verification::rejected(VerifyReason::SequenceMismatch));
        }

        if record.revoked_at.is_some() {
            return Ok(Verification::rejected(VerifyReason::Revoked));
        }

        if Utc::now() >= record.expires_at {
            return Ok(Verification::rejected(VerifyReason::Expired));
        }

        Ok(Verification {
            valid: true,
            subject: Some(record.subject),
            scope: Some(record.scope),
            expires_at: Some(record.expires_at),
            reason: None,
        })
    }

    async fn load_record(&self, subject: &str) -> Result<Option<TokenRecord>, TokenError> {
        let key = format!("{SUBJECT_PREFIX}{subject}");
        let Some(bytes) = self.storage.get(&key).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&bytes).map_err(|e| TokenError::Corrupt {
            reason: format!("record decode failed: {e}"),
        })?;
        Ok(Some(record))
    }

    async fn store_record(&self, record: &TokenRecord) -> Result<(), TokenError> {
        let bytes = serde_json::to_vec(record).map_err(|e| TokenError::Corrupt {
            reason: format!("record encode failed: {e}"),
        })?;
        let subject_key = format!("{SUBJECT_PREFIX}{}", record.subject);
        self.storage.put(&subject_key, &bytes).await?;

        // Stale index entries are kept on purpose: a superseded token then
        // verifies as sequence-mismatch instead of unknown.
        let index_key = format!("{INDEX_PREFIX}{}", record.token);
        self.storage
            .put(&index_key, record.subject.as_bytes())
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService").finish_non_exhaustive()
    }
}

fn build_record(
    subject: &str,
    sequence: u64,
    options: &IssueOptions,
    now: DateTime<Utc>,
) -> TokenRecord {
    let ttl_seconds = options
        .ttl_seconds
        .filter(|ttl| *ttl > 0)
        .unwrap_or(DEFAULT_TTL_SECONDS);
    let ttl_ms = ttl_seconds.saturating_mul(1000);
    // Refresh window is 20% of the TTL, clamped to a 500ms floor.
    let refresh_window_ms = (ttl_ms / 5).max(MIN_REFRESH_WINDOW_MS);

    let expires_at = now + Duration::milliseconds(ttl_ms);
    let refresh_after = expires_at - Duration::milliseconds(refresh_window_ms);

    TokenRecord {
        token: uuid::Uuid::new_v4().simple().to_string(),
        subject: subject.to_owned(),
        scope: options.scope.clone().unwrap_or_else(|| "relay".to_owned()),
        pubkey: options.pubkey.clone(),
        relay_auth_token: options.relay_auth_token.clone(),
        issued_by: options.issued_by.clone(),
        sequence,
        ttl_seconds,
        issued_at: now,
        expires_at,
        refresh_after,
        revoked_at: None,
    }
}

fn issued_view(record: &TokenRecord) -> IssuedToken {
    IssuedToken {
        token: record.token.clone(),
        expires_at: record.expires_at,
        refresh_after: record.refresh_after,
        sequence: record.sequence,
    }
}

fn tokens_equal(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).unwrap_u8() == 1
}
