use thiserror::Error;

/// Failure decoding, encoding, or signing a claim.
///
/// Every variant here is a `Malformed` outcome in the resolver's error model
/// (spec-level "decode failures are never recovered locally"): the caller's
/// only recourse is to reject the request, never to repair the token.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("invalid token format: {0}")]
    Malformed(String),
    #[error("invalid jwt algorithm, only Ed25519 is supported")]
    InvalidAlgorithm,
    #[error("invalid jwt header")]
    InvalidHeader,
    #[error("serialization failure: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("base64url decode failure: {0}")]
    Decode(#[from] data_encoding::DecodeError),
    #[error("claim body is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("key error: {0}")]
    Key(#[from] nkeys::error::Error),
}
