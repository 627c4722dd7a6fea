//! Durable key to encoded-claim storage.
//!
//! A [`Store`] holds every claim the resolver has accepted, keyed by public
//! key (operators, accounts) or activation hash id. It tracks a commutative
//! content hash over its whole entry set for cheap peer reconciliation, and
//! optionally enforces expiration and an LRU entry cap. Entries can be bulk
//! exported and imported via the newline-delimited pack format used for
//! replica bootstrap and gossip sync.

mod error;
mod hash;
mod pack;
mod store;
mod watcher;

pub use error::StoreError;
pub use hash::StoreHash;
pub use pack::PackEntry;
pub use store::{Backend, ExpiryPolicy, Store};
pub use watcher::DirectoryWatcher;
