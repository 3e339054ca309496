use crate::config::CanopyConfig;
use crate::packet::parse_nack_packet;
use crate::peer::{PeerQuery, PeerSession, SharedPeer};
use crate::send_loop::SendLoop;
use crate::stats::CanopyStats;
use crate::store::{SendTracker, SpatialStore};
use crate::transport::{PeerId, Transport};
use crate::view::AACube;
use crate::CanopyError;
use log::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

struct PeerHandle {
    session: SharedPeer,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// The per-connection registry: owns every `PeerSession`, runs one send loop
/// thread per attached peer, and routes inbound NACKs to the right peer.
///
/// The spatial store is shared read-mostly: send loops take read locks while
/// encoding, writers elsewhere take the write lock.
pub struct StreamServer<S: SpatialStore + Send + Sync + 'static> {
    config: CanopyConfig,
    store: Arc<RwLock<S>>,
    stats: Arc<CanopyStats>,
    transport: Arc<dyn Transport>,
    jurisdiction: Option<AACube>,
    initial_load_complete: Arc<AtomicBool>,
    peers: HashMap<PeerId, PeerHandle>,
}

impl<S: SpatialStore + Send + Sync + 'static> StreamServer<S> {
    pub fn new(config: CanopyConfig, store: S, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            store: Arc::new(RwLock::new(store)),
            stats: Arc::new(CanopyStats::default()),
            transport,
            jurisdiction: None,
            initial_load_complete: Arc::new(AtomicBool::new(false)),
            peers: HashMap::new(),
        }
    }

    pub fn store(&self) -> Arc<RwLock<S>> {
        Arc::clone(&self.store)
    }

    pub fn stats(&self) -> Arc<CanopyStats> {
        Arc::clone(&self.stats)
    }

    pub fn set_jurisdiction(&mut self, jurisdiction: Option<AACube>) {
        self.jurisdiction = jurisdiction;
    }

    /// Send loops idle until this is called, so peers attached during startup
    /// don't get partial scenes of a half-loaded tree.
    pub fn set_initial_load_complete(&self) {
        self.initial_load_complete.store(true, Ordering::Relaxed);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, id: PeerId) -> Option<SharedPeer> {
        self.peers.get(&id).map(|h| Arc::clone(&h.session))
    }

    /// A client attached: create its session and start its sending thread.
    pub fn attach_peer(&mut self, id: PeerId, tracker: Option<Box<dyn SendTracker + Send>>) -> SharedPeer {
        let session = PeerSession::shared(id, &self.config);
        let mut send_loop = SendLoop::new(
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&session),
            Arc::clone(&self.transport),
            Arc::clone(&self.stats),
        );
        send_loop.set_jurisdiction(self.jurisdiction);
        send_loop.set_initial_load_flag(Arc::clone(&self.initial_load_complete));
        if let Some(tracker) = tracker {
            send_loop.set_tracker(tracker);
        }
        let shutdown = send_loop.shutdown_flag();
        debug!("{id}: client connected, starting sending thread");
        let thread = send_loop.spawn();
        self.peers.insert(
            id,
            PeerHandle {
                session: Arc::clone(&session),
                shutdown,
                thread: Some(thread),
            },
        );
        session
    }

    /// Apply a query update reported by the peer (frustum, LOD, PPS, ...).
    pub fn update_peer_query(
        &self,
        id: PeerId,
        update: impl FnOnce(&mut PeerQuery),
    ) -> Result<(), CanopyError> {
        let handle = self.peers.get(&id).ok_or(CanopyError::NoSuchPeer)?;
        if let Ok(mut session) = handle.session.lock() {
            update(&mut session.query);
        }
        Ok(())
    }

    /// Queue a non-tree packet for delivery after the next traversal pass.
    pub fn queue_special_packet(
        &self,
        id: PeerId,
        kind: u8,
        bytes: Vec<u8>,
    ) -> Result<(), CanopyError> {
        let handle = self.peers.get(&id).ok_or(CanopyError::NoSuchPeer)?;
        if let Ok(mut session) = handle.session.lock() {
            session.queue_special_packet(kind, bytes);
        }
        Ok(())
    }

    /// An inbound NACK datagram from a peer: queue the named sequence numbers
    /// for retransmission on its next tick.
    pub fn handle_nack_packet(&self, id: PeerId, bytes: &[u8]) -> Result<(), CanopyError> {
        let missing = parse_nack_packet(bytes)?;
        let handle = self.peers.get(&id).ok_or(CanopyError::NoSuchPeer)?;
        if let Ok(mut session) = handle.session.lock() {
            trace!("{id}: nack for {} sequence numbers", missing.len());
            session.queue_nacks(missing);
        }
        Ok(())
    }

    /// A client disconnected: stop its sending thread and drop its session.
    pub fn detach_peer(&mut self, id: PeerId) -> Result<(), CanopyError> {
        let mut handle = self.peers.remove(&id).ok_or(CanopyError::NoSuchPeer)?;
        if let Ok(mut session) = handle.session.lock() {
            session.set_shutting_down();
        }
        handle.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = handle.thread.take() {
            let _ = thread.join();
        }
        debug!("{id}: client disconnected, sending thread ended");
        Ok(())
    }

    /// Stop every peer's sending thread.
    pub fn shutdown(&mut self) {
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            let _ = self.detach_peer(id);
        }
    }
}

impl<S: SpatialStore + Send + Sync + 'static> Drop for StreamServer<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
