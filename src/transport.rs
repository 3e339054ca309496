/// Opaque handle identifying a connected peer at the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// The network layer boundary: canopy produces finished datagrams, the
/// transport delivers them (unreliably) to identified peers.
///
/// Implementations must be cheap to call from many send-loop threads at once.
pub trait Transport: Send + Sync {
    fn send_unreliable(&self, peer: PeerId, bytes: &[u8]);
}

/// Discards everything. Useful as a placeholder while wiring up a server.
pub struct NullTransport;

impl Transport for NullTransport {
    fn send_unreliable(&self, _peer: PeerId, _bytes: &[u8]) {}
}
