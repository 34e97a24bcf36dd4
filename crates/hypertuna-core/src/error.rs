//! Error types for `hypertuna-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Crypto errors never include key material — only identifiers
//! or operation descriptions.

use hypertuna_storage::StorageError;

/// Errors from request signing and verification.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// The signature did not match the computed HMAC.
    #[error("invalid signature for client '{client_id}'")]
    InvalidSignature { client_id: String },

    /// The request timestamp fell outside the allowed clock tolerance.
    #[error("request timestamp {ts_ms} outside tolerance of {tolerance_ms}ms")]
    Expired { ts_ms: i64, tolerance_ms: i64 },

    /// The signature was not valid hex, or the payload was not encodable.
    #[error("bad encoding: {reason}")]
    BadEncoding { reason: String },
}

/// Errors from sealed-payload encryption.
#[derive(Debug, thiserror::Error)]
pub enum SealedError {
    /// Encrypting the payload for the recipient failed.
    #[error("sealing failed: {reason}")]
    SealingFailed { reason: String },

    /// Decryption failed (wrong recipient key, corrupted data, or tampered tag).
    #[error("opening failed: {reason}")]
    OpeningFailed { reason: String },

    /// A base64 field or key was malformed.
    #[error("bad encoding: {reason}")]
    BadEncoding { reason: String },
}

/// Errors from token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// No record exists for the subject.
    #[error("no token record for subject")]
    UnknownSubject,

    /// The presented token or sequence did not match the current record.
    #[error("token refresh rejected: {reason}")]
    Unauthorized { reason: String },

    /// The presented sequence is older than the stored one.
    #[error("sequence mismatch: presented {presented}, current {current}")]
    SequenceMismatch { presented: u64, current: u64 },

    /// A stored record could not be decoded.
    #[error("token record corrupt: {reason}")]
    Corrupt { reason: String },

    /// The underlying key-value store failed.
    #[error("token storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the lease vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// No lease is tracked for the given relay key.
    #[error("no lease tracked for relay '{relay_key}'")]
    NotFound { relay_key: String },

    /// The vault has been destroyed and no longer accepts leases.
    #[error("lease vault destroyed")]
    Destroyed,
}

/// Errors from the escrow client.
#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    /// The escrow service answered with a non-2xx status.
    /// The HTTP code and parsed body are preserved for the caller.
    #[error("escrow api error {status}: {body}")]
    Api {
        status: u16,
        body: serde_json::Value,
    },

    /// The request could not be delivered within the deadline.
    #[error("escrow request failed: {reason}")]
    Transport { reason: String },

    /// The overall call deadline elapsed across retries.
    #[error("escrow deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    /// A response body could not be decoded.
    #[error("escrow response decode failed: {reason}")]
    Decode { reason: String },

    /// The client configuration was unusable (bad TLS material, bad URL).
    #[error("escrow client config error: {reason}")]
    Config { reason: String },

    /// Opening the sealed writer key returned by unlock failed.
    #[error("escrow sealed payload error: {0}")]
    Sealed(#[from] SealedError),
}

/// Errors from the relay registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The relay identifier did not resolve to a known relay.
    #[error("unknown relay '{identifier}'")]
    UnknownRelay { identifier: String },

    /// The relay exists but no peer with a fresh heartbeat hosts it.
    #[error("no live peer for relay '{identifier}'")]
    NoLivePeer { identifier: String },

    /// The registration proof of possession did not verify.
    #[error("invalid registration proof: {0}")]
    InvalidProof(#[from] SigningError),

    /// The identifier was neither a 64-hex relay key nor `npub:name`.
    #[error("malformed relay identifier '{identifier}'")]
    InvalidIdentifier { identifier: String },

    /// A stored registration record could not be decoded.
    #[error("registration record corrupt: {reason}")]
    Corrupt { reason: String },

    /// The underlying key-value store failed.
    #[error("registry storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the dispatcher's feedback paths.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The job id is not (or no longer) tracked.
    #[error("unknown dispatch job '{job_id}'")]
    UnknownJob { job_id: String },
}

/// Errors from the blind-peer mirror.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// Initialization failed (allowlist unreadable, storage dir not creatable).
    /// Fatal for the subsystem, never for the gateway.
    #[error("mirror initialization failed: {reason}")]
    Init { reason: String },

    /// Persisting the trusted-peer allowlist failed.
    #[error("allowlist persist failed at '{path}': {reason}")]
    Persist { path: String, reason: String },

    /// The underlying key-value store failed.
    #[error("mirror storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the discovery advertiser.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Advertising is disabled (`enabled` or `open_access` is false).
    #[error("discovery advertising disabled")]
    Disabled,

    /// Binding or serving the overlay listener failed.
    #[error("discovery io error: {reason}")]
    Io { reason: String },

    /// An announcement could not be encoded or decoded.
    #[error("announcement encoding error: {reason}")]
    Encoding { reason: String },

    /// An announcement's detached signature did not verify.
    #[error("announcement signature invalid")]
    BadSignature,
}
