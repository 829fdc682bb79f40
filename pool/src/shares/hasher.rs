/// Proof-of-work hashers
///
/// The PoW primitive is pluggable: the registry maps an algorithm name to a
/// `ProofOfWorkHasher` and is resolved once at startup from the coin
/// profile. Only the digests the pool can compute natively are built in;
/// memory-hard algorithms are registered by the embedding binary.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{keccak256, sha256d};
use crate::error::ConfigError;

pub trait ProofOfWorkHasher: Send + Sync {
    /// Digest of the serialized header (plus solution for equihash variants),
    /// in the byte order compared against targets.
    fn hash(&self, data: &[u8]) -> [u8; 32];
}

#[derive(Debug, Default)]
pub struct Sha256dHasher;

impl ProofOfWorkHasher for Sha256dHasher {
    fn hash(&self, data: &[u8]) -> [u8; 32] {
        sha256d(data)
    }
}

#[derive(Debug, Default)]
pub struct KeccakHasher;

impl ProofOfWorkHasher for KeccakHasher {
    fn hash(&self, data: &[u8]) -> [u8; 32] {
        keccak256(data)
    }
}

/// Algorithm name -> hasher
#[derive(Clone)]
pub struct HasherRegistry {
    hashers: HashMap<String, Arc<dyn ProofOfWorkHasher>>,
}

impl Default for HasherRegistry {
    fn default() -> Self {
        let mut registry = Self { hashers: HashMap::new() };
        registry.register("sha256d", Arc::new(Sha256dHasher));
        registry.register("sha256", Arc::new(Sha256dHasher));
        registry.register("keccak", Arc::new(KeccakHasher));
        registry.register("keccakc", Arc::new(KeccakHasher));
        // equihash shares are judged by sha256d(header + solution)
        registry.register("equihash", Arc::new(Sha256dHasher));
        registry.register("zhash", Arc::new(Sha256dHasher));
        registry
    }
}

impl HasherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, algorithm: &str, hasher: Arc<dyn ProofOfWorkHasher>) {
        self.hashers.insert(algorithm.to_ascii_lowercase(), hasher);
    }

    pub fn resolve(&self, algorithm: &str) -> Result<Arc<dyn ProofOfWorkHasher>, ConfigError> {
        self.hashers
            .get(&algorithm.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ConfigError::UnknownAlgorithm(algorithm.to_string()))
    }

    pub fn algorithms(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.hashers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
