use sha2::{Digest, Sha256};

/// The store's reconciliation fingerprint: a 32-byte XOR-fold of
/// `sha256(encoded)` over every entry currently resident.
///
/// Commutative and self-inverse by construction, so entries can be added and
/// removed from the accumulator in any order: an empty store is all zeros,
/// and replaying the same add/remove pair twice cancels out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreHash([u8; 32]);

impl StoreHash {
    #[must_use]
    pub fn zero() -> Self {
        StoreHash([0u8; 32])
    }

    #[must_use]
    pub fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        StoreHash(bytes)
    }

    /// XOR-folds `sha256(content)` into the accumulator.
    pub fn toggle(&mut self, content: &[u8]) {
        self.toggle_digest(&sha256_of(content));
    }

    /// XOR-folds an already-computed digest into the accumulator. Lets a
    /// caller that cached an entry's digest retire it without re-reading
    /// and re-hashing the original content.
    pub fn toggle_digest(&mut self, digest: &[u8; 32]) {
        for (acc, d) in self.0.iter_mut().zip(digest.iter()) {
            *acc ^= d;
        }
    }
}

#[must_use]
pub fn sha256_of(content: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(content);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}
