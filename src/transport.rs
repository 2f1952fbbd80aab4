//! Transport (C1): the OS peer-to-peer link. External collaborator,
//! injected into the engine rather than owned by it.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::frame::PeerId;

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_id(&self) -> PeerId;
    fn connected_peers(&self) -> Vec<PeerId>;
    async fn send(&self, bytes: Vec<u8>, to: &[PeerId]) -> Result<(), TransportError>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_double {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// In-memory transport used by the engine's own tests and available to
    /// downstream integration tests that want to exercise the engine
    /// without real radio hardware.
    pub struct LoopbackTransport {
        local: PeerId,
        peers: Mutex<Vec<PeerId>>,
        pub sent: Arc<Mutex<Vec<(Vec<u8>, Vec<PeerId>)>>>,
        pub fail_next: Mutex<u32>,
    }

    impl LoopbackTransport {
        pub fn new(local: impl Into<PeerId>) -> Self {
            Self {
                local: local.into(),
                peers: Mutex::new(Vec::new()),
                sent: Arc::new(Mutex::new(Vec::new())),
                fail_next: Mutex::new(0),
            }
        }

        pub fn connect(&self, peer: impl Into<PeerId>) {
            self.peers.lock().push(peer.into());
        }

        pub fn fail_next_n(&self, n: u32) {
            *self.fail_next.lock() = n;
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        fn local_id(&self) -> PeerId {
            self.local.clone()
        }

        fn connected_peers(&self) -> Vec<PeerId> {
            self.peers.lock().clone()
        }

        async fn send(&self, bytes: Vec<u8>, to: &[PeerId]) -> Result<(), TransportError> {
            let mut fail_next = self.fail_next.lock();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(TransportError::SendFailed(to.first().cloned().unwrap_or_default()));
            }
            drop(fail_next);
            self.sent.lock().push((bytes, to.to_vec()));
            Ok(())
        }
    }
}
