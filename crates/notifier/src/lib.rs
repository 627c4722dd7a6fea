//! Mutation broadcast, peer lookup, and hash-gossip reconciliation for a
//! claim store over the broker's `$SYS` subject tree.
//!
//! - `$SYS.ACCOUNT.{account}.CLAIMS.UPDATE` — account mutation broadcast.
//! - `$SYS.ACCOUNT.{account}.CLAIMS.ACTIVATE.{hash}` — activation mutation
//!   broadcast, keyed by the activation's hash id.
//! - `$SYS.REQ.ACCOUNT.{account}.CLAIMS.LOOKUP` — request/reply point
//!   lookup by account.
//! - `$SYS.REQ.CLAIMS.PACK` — hash-gossip reconciliation; payload is the
//!   requester's 32-byte store hash, replies stream back on an ephemeral
//!   inbox and may come from more than one peer.

mod error;
mod notifier;

pub use error::NotifierError;
pub use notifier::Notifier;
