use thiserror::Error;

/// The six error kinds the resolver distinguishes, independent of which
/// component raised them. Every HTTP-facing failure maps to exactly one of
/// these so the handler can pick a status code without inspecting the
/// underlying cause.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("policy rejected: {0}")]
    PolicyRejected(String),
    #[error("not found")]
    NotFound,
    #[error("read-only store")]
    Conflict,
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ResolverError {
    /// Short code used in log lines in place of a full public key, per the
    /// "never leak full public keys at INFO" rule: the first 12 characters
    /// of whatever key was involved.
    pub fn short_code(key: &str) -> String {
        key.chars().take(12).collect()
    }
}

impl From<claimsrv_claims::ClaimError> for ResolverError {
    fn from(err: claimsrv_claims::ClaimError) -> Self {
        ResolverError::Malformed(err.to_string())
    }
}

impl From<claimsrv_store::StoreError> for ResolverError {
    fn from(err: claimsrv_store::StoreError) -> Self {
        match err {
            claimsrv_store::StoreError::NotFound => ResolverError::NotFound,
            claimsrv_store::StoreError::ReadOnly => ResolverError::Conflict,
            claimsrv_store::StoreError::InvalidKey(msg) => ResolverError::PolicyRejected(msg),
            claimsrv_store::StoreError::Format(msg) => ResolverError::Malformed(msg),
            claimsrv_store::StoreError::Io(err) => ResolverError::Transient(err.to_string()),
        }
    }
}
