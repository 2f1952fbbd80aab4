//! Security Provider (C3): session keys and AEAD framing. External
//! collaborator; the engine depends only on this trait, never a concrete
//! cryptographic primitive.

use crate::error::SecurityError;
use crate::frame::PeerId;

pub trait SecurityProvider: Send + Sync {
    fn has_session_key(&self, peer: &PeerId) -> bool;
    fn encrypt(&self, bytes: &[u8], for_peer: &PeerId) -> Result<Vec<u8>, SecurityError>;
    fn decrypt(&self, bytes: &[u8], from_peer: &PeerId) -> Result<Vec<u8>, SecurityError>;
    fn public_key(&self) -> Vec<u8>;
    fn remove_session_key(&self, peer: &PeerId);
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_double {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// No-op provider for tests: frames pass through unencrypted unless a
    /// key has been registered, in which case bytes are XOR'd with a fixed
    /// marker so tests can assert encryption actually happened.
    #[derive(Default)]
    pub struct NoopSecurityProvider {
        keyed_peers: Mutex<HashSet<PeerId>>,
    }

    impl NoopSecurityProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn grant_key(&self, peer: &PeerId) {
            self.keyed_peers.lock().insert(peer.clone());
        }
    }

    impl SecurityProvider for NoopSecurityProvider {
        fn has_session_key(&self, peer: &PeerId) -> bool {
            self.keyed_peers.lock().contains(peer)
        }

        fn encrypt(&self, bytes: &[u8], for_peer: &PeerId) -> Result<Vec<u8>, SecurityError> {
            if !self.has_session_key(for_peer) {
                return Err(SecurityError::MissingKey(for_peer.clone()));
            }
            Ok(bytes.iter().map(|b| b ^ 0xAA).collect())
        }

        fn decrypt(&self, bytes: &[u8], from_peer: &PeerId) -> Result<Vec<u8>, SecurityError> {
            if !self.has_session_key(from_peer) {
                return Err(SecurityError::MissingKey(from_peer.clone()));
            }
            Ok(bytes.iter().map(|b| b ^ 0xAA).collect())
        }

        fn public_key(&self) -> Vec<u8> {
            vec![0u8; 32]
        }

        fn remove_session_key(&self, peer: &PeerId) {
            self.keyed_peers.lock().remove(peer);
        }
    }
}
