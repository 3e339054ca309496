use crate::config::CanopyConfig;
use crate::packet::{WirePacket, FLAG_COMPRESSED};
use crate::retransmit::{RetainedPacket, RetransmitQueue};
use crate::stats::SceneStats;
use crate::transport::PeerId;
use crate::view::{LodParams, ViewFrustum, ViewState};
use crate::TraversalBag;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// The live query parameters a peer reports to the server: what it can see
/// and how fast it is willing to receive. Written by the ingest side, read by
/// the peer's send loop every tick.
#[derive(Debug, Clone)]
pub struct PeerQuery {
    pub frustum: Option<ViewFrustum>,
    pub lod: LodParams,
    /// Packets-per-second quota requested by the client; the server config
    /// supplies a fallback and a ceiling.
    pub max_query_pps: Option<u32>,
    pub uses_frustum_culling: bool,
    /// Bumped whenever out-of-band query parameters change; forces a full
    /// scene on the next tick.
    pub revision: u32,
}

impl Default for PeerQuery {
    fn default() -> Self {
        Self {
            frustum: None,
            lod: LodParams::default(),
            max_query_pps: None,
            uses_frustum_culling: true,
            revision: 0,
        }
    }
}

/// Everything the server tracks for one connected viewer: view state, the
/// traversal bag for the in-progress scene, the live outbound packet, scene
/// stats, retransmit state, and the special-packet outbox.
///
/// Owned by the server's per-connection registry; the peer's send loop holds
/// a shared reference for its lifetime.
pub struct PeerSession {
    id: PeerId,
    pub query: PeerQuery,
    pub view: ViewState,
    pub bag: TraversalBag,
    pub stats: SceneStats,
    packet: WirePacket,
    sequence: u16,
    /// Payload of the last packet handed to the transport, for duplicate
    /// suppression of identical re-sends in a static scene.
    last_sent_payload: Vec<u8>,
    retransmit: RetransmitQueue,
    /// Pending non-tree packets, keyed by a one-byte kind.
    special_outbox: smallmap::Map<u8, VecDeque<Vec<u8>>>,
    shutting_down: bool,
    view_sent: bool,
    scene_start_usecs: Option<u64>,
    /// Start of the previously delivered scene: the incremental watermark.
    prev_scene_start_usecs: Option<u64>,
    last_root_timestamp: u64,
    seen_query_revision: u32,
}

pub type SharedPeer = Arc<Mutex<PeerSession>>;

impl PeerSession {
    pub fn new(id: PeerId, config: &CanopyConfig) -> Self {
        Self {
            id,
            query: PeerQuery::default(),
            view: ViewState::default(),
            bag: TraversalBag::default(),
            stats: SceneStats::default(),
            packet: WirePacket::new(config.max_packet_size, FLAG_COMPRESSED),
            sequence: 0,
            last_sent_payload: Vec::new(),
            retransmit: RetransmitQueue::with_capacity(config.sent_packets_buffer_size),
            special_outbox: smallmap::Map::default(),
            shutting_down: false,
            view_sent: false,
            scene_start_usecs: None,
            prev_scene_start_usecs: None,
            last_root_timestamp: 0,
            seen_query_revision: 0,
        }
    }

    pub fn shared(id: PeerId, config: &CanopyConfig) -> SharedPeer {
        Arc::new(Mutex::new(Self::new(id, config)))
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn max_query_pps(&self, config: &CanopyConfig) -> u32 {
        self.query.max_query_pps.unwrap_or(config.default_max_query_pps)
    }

    /// Has the peer changed its out-of-band query parameters since we last
    /// looked? Consuming this check forces a full scene.
    pub fn query_params_changed(&mut self) -> bool {
        let changed = self.query.revision != self.seen_query_revision;
        self.seen_query_revision = self.query.revision;
        changed
    }

    // --- live outbound packet ---

    pub fn packet(&self) -> &WirePacket {
        &self.packet
    }
    pub fn packet_mut(&mut self) -> &mut WirePacket {
        &mut self.packet
    }
    pub fn is_packet_waiting(&self) -> bool {
        self.packet.has_content()
    }
    pub fn available(&self) -> usize {
        self.packet.available()
    }
    pub fn reset_packet(&mut self) {
        self.packet.reset();
    }

    /// Sequence numbers are assigned at the point of send, so retransmits
    /// keep their original numbers.
    pub fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    pub fn should_suppress_duplicate(&self) -> bool {
        self.packet.payload() == self.last_sent_payload.as_slice()
    }

    pub fn note_payload_sent(&mut self) {
        self.last_sent_payload = self.packet.payload().to_vec();
    }

    // --- scene bookkeeping ---

    pub fn scene_start(&mut self, now_usecs: u64) {
        self.prev_scene_start_usecs = self.scene_start_usecs;
        self.scene_start_usecs = Some(now_usecs);
    }

    /// Watermark for incremental scenes: elements unchanged since the prior
    /// scene began have already been delivered.
    pub fn changed_since(&self) -> Option<u64> {
        self.prev_scene_start_usecs
    }

    pub fn view_sent(&self) -> bool {
        self.view_sent
    }
    pub fn set_view_sent(&mut self, sent: bool) {
        self.view_sent = sent;
    }

    pub fn last_root_timestamp(&self) -> u64 {
        self.last_root_timestamp
    }
    pub fn set_last_root_timestamp(&mut self, t: u64) {
        self.last_root_timestamp = t;
    }

    /// Drop traversal work for content that moved out of view.
    pub fn dump_out_of_view(&mut self) {
        self.bag.clear();
    }

    // --- shutdown ---

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }
    pub fn set_shutting_down(&mut self) {
        self.shutting_down = true;
    }

    // --- retransmission ---

    pub fn record_sent_packet(&mut self, sequence: u16, bytes: Vec<u8>, now_usecs: u64) {
        self.retransmit.record_sent(sequence, bytes, now_usecs);
    }

    pub fn queue_nacks(&mut self, missing: impl IntoIterator<Item = u16>) {
        self.retransmit.queue_nacks(missing);
    }

    pub fn has_next_nacked_packet(&self) -> bool {
        self.retransmit.has_next()
    }

    pub fn next_nacked_packet(&mut self) -> Option<RetainedPacket> {
        self.retransmit.next()
    }

    // --- special (non-tree) packets ---

    pub fn queue_special_packet(&mut self, kind: u8, bytes: Vec<u8>) {
        self.special_outbox.entry(kind).or_default().push_back(bytes);
    }

    pub fn has_special_packets(&self) -> bool {
        self.special_outbox.iter().any(|&(_, ref q)| !q.is_empty())
    }

    pub fn next_special_packet(&mut self) -> Option<Vec<u8>> {
        for &mut (_, ref mut q) in self.special_outbox.iter_mut() {
            if let Some(bytes) = q.pop_front() {
                return Some(bytes);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_increments_per_send() {
        let config = CanopyConfig::default();
        let mut peer = PeerSession::new(PeerId(1), &config);
        assert_eq!(peer.next_sequence(), 1);
        assert_eq!(peer.next_sequence(), 2);
    }

    #[test]
    fn query_revision_consumed_once() {
        let config = CanopyConfig::default();
        let mut peer = PeerSession::new(PeerId(1), &config);
        assert!(!peer.query_params_changed());
        peer.query.revision += 1;
        assert!(peer.query_params_changed());
        assert!(!peer.query_params_changed());
    }

    #[test]
    fn duplicate_suppression_tracks_last_payload() {
        let config = CanopyConfig::default();
        let mut peer = PeerSession::new(PeerId(1), &config);
        // nothing sent yet, and the packet is empty: identical
        assert!(peer.should_suppress_duplicate());
        peer.packet_mut().write_section(b"fresh").unwrap();
        assert!(!peer.should_suppress_duplicate());
        peer.note_payload_sent();
        assert!(peer.should_suppress_duplicate());
    }

    #[test]
    fn special_outbox_fifo_per_kind() {
        let config = CanopyConfig::default();
        let mut peer = PeerSession::new(PeerId(1), &config);
        assert!(!peer.has_special_packets());
        peer.queue_special_packet(3, vec![1]);
        peer.queue_special_packet(3, vec![2]);
        assert!(peer.has_special_packets());
        assert_eq!(peer.next_special_packet(), Some(vec![1]));
        assert_eq!(peer.next_special_packet(), Some(vec![2]));
        assert_eq!(peer.next_special_packet(), None);
    }

    #[test]
    fn scene_start_rotates_watermark() {
        let config = CanopyConfig::default();
        let mut peer = PeerSession::new(PeerId(1), &config);
        assert_eq!(peer.changed_since(), None);
        peer.scene_start(1_000);
        assert_eq!(peer.changed_since(), None);
        peer.scene_start(2_000);
        assert_eq!(peer.changed_since(), Some(1_000));
    }
}
