//! Layered error taxonomy. Each component owns a focused enum; `Nip46Error`
//! aggregates them for the public surface.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

/// Codec-level errors, carrying the `NIP46_ENCODE_ERROR` / `NIP46_DECODE_ERROR`
/// discriminant the queue relies on to decide whether a fallback decode
/// attempt is warranted.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("NIP46_ENCODE_ERROR: {0}")]
    Encode(String),
    #[error("NIP46_DECODE_ERROR: {0}")]
    Decode(String),
}

impl CodecError {
    pub fn is_decode(&self) -> bool {
        matches!(self, CodecError::Decode(_))
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("NIP46_UNEXPECTED_PAYLOAD: {0}")]
    UnexpectedPayload(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum UriError {
    #[error("unknown scheme: {0}")]
    UnknownScheme(String),
    #[error("missing primary key")]
    MissingPrimaryKey,
    #[error("invalid primary key: {0}")]
    InvalidPrimaryKey(#[from] KeyError),
    #[error("invalid uri: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("quota exceeded, writes disabled for this process")]
    QuotaExceeded,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no-relays")]
    NoRelays,
    #[error("relay-not-connected: {0}")]
    RelayNotConnected(String),
    #[error("publish failed on all relays: {0}")]
    PublishFailed(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("signer-pubkey-unknown")]
    SignerPubkeyUnknown,
    #[error("timeout waiting for response")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("remote response carried an error: {0}")]
    RemoteError(String),
}

/// Top-level aggregate error returned from the public service facade.
#[derive(Debug, Error)]
pub enum Nip46Error {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("other: {0}")]
    Other(String),
}
