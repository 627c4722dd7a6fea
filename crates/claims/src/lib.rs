//! Typed decoding, encoding and validation of the three claim kinds circulated
//! by the resolver: operator, account, and activation.
//!
//! A claim is a three-segment base64url JWT (`header.body.signature`) signed
//! with an Ed25519 key. This crate never re-serializes an accepted claim: the
//! encoded string handed to [`decode`] is the canonical form and is returned
//! unchanged by every caller that needs to persist or forward it.
//!
//! ```rust
//! use claimsrv_claims::{Account, Claims};
//! use nkeys::KeyPair;
//!
//! let operator = KeyPair::new_operator();
//! let account = KeyPair::new_account();
//!
//! let claims = Claims::<Account>::new(account.public_key(), operator.public_key());
//! let encoded = claims.encode(&operator).unwrap();
//!
//! let decoded = Claims::<Account>::decode(&encoded).unwrap();
//! assert_eq!(decoded.subject, account.public_key());
//! ```

pub type Result<T> = std::result::Result<T, ClaimError>;

mod claim;
mod error;

pub use claim::{
    hash_id, human_relative, peek_envelope, validate, Account, Activation, Claims, ClaimKind,
    ClaimMetadata, Envelope, ImportType, Operator, Severity, ValidationIssue,
};
pub use error::ClaimError;

pub mod prelude {
    //! Re-exports of the types most call sites need.
    pub use crate::{
        hash_id, peek_envelope, validate, Account, Activation, ClaimError, ClaimKind, Claims,
        Envelope, ImportType, Operator, Result, Severity, ValidationIssue,
    };
    pub use nkeys::KeyPair;
}
