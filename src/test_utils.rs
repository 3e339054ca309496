#![allow(unused)]
#![allow(missing_docs)]
//! A test harness that runs one peer's send loop tick-by-tick against a
//! synthetic octree, with a fake client on the other end that parses the
//! datagrams, tracks missing sequence numbers, and can drop packets by index
//! or by chance.
//!
//! Used in unit and integration tests.
use crate::packet::{parse_packet, ParsedPacket, FLAG_CONTAINS_STATS, PACKET_HEADER_SIZE};
use crate::peer::{PeerSession, SharedPeer};
use crate::retransmit::MissingTracker;
use crate::send_loop::{now_usecs, SendLoop};
use crate::stats::CanopyStats;
use crate::store::{NodeId, SimpleOctree, SpatialStore};
use crate::transport::{PeerId, Transport};
use crate::view::{AACube, ViewFrustum};
use crate::CanopyConfig;
use byteorder::{NetworkEndian, ReadBytesExt};
use glam::Vec3;
use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex, RwLock};

pub fn init_logger() {
    let _ = env_logger::builder()
        .write_style(env_logger::WriteStyle::Always)
        .try_init();
}

pub fn random_payload(size: u32) -> Vec<u8> {
    let mut b = Vec::with_capacity(size as usize);
    for _ in 0..size {
        b.push(rand::random::<u8>());
    }
    b
}

/// Captures every datagram the send loop hands to the network layer.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
}

impl Transport for RecordingTransport {
    fn send_unreliable(&self, peer: PeerId, bytes: &[u8]) {
        self.sent.lock().unwrap().push((peer, bytes.to_vec()));
    }
}

impl RecordingTransport {
    pub fn drain(&self) -> Vec<(PeerId, Vec<u8>)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

/// Build a tree of `node_count` payload-carrying elements (plus the empty
/// root), filled breadth-first with a branching factor of 8, all inside the
/// root cube so nothing is accidentally culled.
pub fn synthetic_tree(node_count: usize, payload_len: usize) -> SimpleOctree {
    let root_cube = AACube::new(Vec3::ZERO, 512.0);
    let mut tree = SimpleOctree::new(root_cube, 1);
    let mut parents = VecDeque::from([(NodeId(0), root_cube)]);
    let mut created = 0u64;
    'outer: while let Some((parent, cube)) = parents.pop_front() {
        for octant in 0..8 {
            if created as usize >= node_count {
                break 'outer;
            }
            created += 1;
            let half = cube.half / 2.0;
            let offset = Vec3::new(
                if octant & 1 == 0 { -half } else { half },
                if octant & 2 == 0 { -half } else { half },
                if octant & 4 == 0 { -half } else { half },
            );
            let child_cube = AACube::new(cube.center + offset, half);
            let id = tree.add_child(
                parent,
                created,
                child_cube,
                vec![(created % 251) as u8; payload_len],
                1,
            );
            parents.push_back((id, child_cube));
        }
    }
    tree
}

/// One element parsed back out of a tree-content section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedElement {
    pub item_id: u64,
    pub payload: Vec<u8>,
}

pub fn parse_elements(section: &[u8]) -> Vec<ReceivedElement> {
    let mut out = Vec::new();
    let mut reader = Cursor::new(section);
    while (reader.position() as usize) < section.len() {
        let item_id = reader.read_u64::<NetworkEndian>().unwrap();
        let len = reader.read_u16::<NetworkEndian>().unwrap() as usize;
        let mut payload = vec![0; len];
        reader.read_exact(&mut payload).unwrap();
        out.push(ReceivedElement { item_id, payload });
    }
    out
}

/// Drives a single peer's `SendLoop` deterministically, one tick at a time,
/// playing the part of both the network and the client.
pub struct StreamTestHarness {
    pub config: CanopyConfig,
    pub store: Arc<RwLock<SimpleOctree>>,
    pub peer: SharedPeer,
    pub send_loop: SendLoop<SimpleOctree>,
    pub transport: Arc<RecordingTransport>,
    pub stats: Arc<CanopyStats>,
    /// Client-side gap tracking, fed by every delivered packet.
    pub missing: MissingTracker,
    /// item id -> number of times an element arrived.
    pub elements_received: HashMap<u64, usize>,
    pub packets_delivered: Vec<ParsedPacket>,
    pub stats_packets_received: usize,
    /// Datagrams delivered but not yet processed by the fake client, the
    /// queue that the NACK suppression rule consults.
    pub inbound_queue: VecDeque<Vec<u8>>,
    /// How many packets the send loop emitted on the most recent tick,
    /// counted before any loss is applied.
    pub last_tick_packet_count: usize,
    drop_indices: Option<Vec<usize>>,
    drop_chance: f32,
}

impl StreamTestHarness {
    pub fn new(node_count: usize, payload_len: usize) -> Self {
        Self::with_config(CanopyConfig::default(), node_count, payload_len)
    }

    pub fn with_config(config: CanopyConfig, node_count: usize, payload_len: usize) -> Self {
        let store = Arc::new(RwLock::new(synthetic_tree(node_count, payload_len)));
        let peer = PeerSession::shared(PeerId(1), &config);
        let transport = Arc::new(RecordingTransport::default());
        let stats = Arc::new(CanopyStats::default());
        let send_loop = SendLoop::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&peer),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&stats),
        );
        Self {
            config,
            store,
            peer,
            send_loop,
            transport,
            stats,
            missing: MissingTracker::default(),
            elements_received: HashMap::new(),
            packets_delivered: Vec::new(),
            stats_packets_received: 0,
            inbound_queue: VecDeque::new(),
            last_tick_packet_count: 0,
            drop_indices: None,
            drop_chance: 0.0,
        }
    }

    pub fn set_view(&mut self, frustum: ViewFrustum) {
        let mut peer = self.peer.lock().unwrap();
        peer.query.frustum = Some(frustum);
    }

    pub fn disable_frustum_culling(&mut self) {
        let mut peer = self.peer.lock().unwrap();
        peer.query.uses_frustum_culling = false;
    }

    pub fn set_max_query_pps(&mut self, pps: u32) {
        let mut peer = self.peer.lock().unwrap();
        peer.query.max_query_pps = Some(pps);
    }

    pub fn touch_node(&mut self, id: NodeId) {
        self.store.write().unwrap().touch(id, now_usecs());
    }

    pub fn set_drop_chance(&mut self, chance: f32) {
        self.drop_chance = chance;
    }

    /// Run one tick; surviving packets are delivered to the fake client and
    /// processed immediately.
    pub fn tick(&mut self) {
        self.tick_without_processing();
        self.process_inbound();
    }

    /// Run one tick, delivering packets into the client's inbound queue
    /// without processing them, as when the client is lagging.
    pub fn tick_without_processing(&mut self) {
        self.send_loop.process_tick();
        self.deliver();
    }

    /// Run one tick, losing the packets at the given indexes (first packet
    /// sent this tick has index 0).
    pub fn tick_with_drops(&mut self, drop_indices: Vec<usize>) {
        self.drop_indices = Some(drop_indices);
        self.tick();
        self.drop_indices = None;
    }

    fn deliver(&mut self) {
        let drop_indices = self.drop_indices.take().unwrap_or_default();
        let sent = self.transport.drain();
        self.last_tick_packet_count = sent.len();
        for (index, (_, bytes)) in sent.into_iter().enumerate() {
            if drop_indices.contains(&index) {
                continue;
            }
            if self.drop_chance > 0.0 && rand::random::<f32>() < self.drop_chance {
                continue;
            }
            self.inbound_queue.push_back(bytes);
        }
    }

    pub fn has_packets_to_process(&self) -> bool {
        !self.inbound_queue.is_empty()
    }

    /// Process everything sitting in the client's inbound queue.
    pub fn process_inbound(&mut self) {
        while let Some(bytes) = self.inbound_queue.pop_front() {
            self.receive(&bytes);
        }
    }

    /// Client-side packet handling: sequence tracking and element accounting.
    pub fn receive(&mut self, bytes: &[u8]) {
        let packet = parse_packet(bytes).expect("harness received a malformed packet");
        self.missing.record_received(packet.sequence);
        let mut sections = packet.sections.iter();
        if packet.flags & FLAG_CONTAINS_STATS != 0 {
            self.stats_packets_received += 1;
            sections.next(); // the stats section isn't tree content
        }
        for section in sections {
            for element in parse_elements(section) {
                *self.elements_received.entry(element.item_id).or_default() += 1;
            }
        }
        self.packets_delivered.push(packet);
    }

    /// The client's NACK cycle: prune the missing set, frame NACK packets,
    /// and feed them straight back into the peer's retransmit queue.
    ///
    /// Suppressed while inbound packets are still queued for processing: the
    /// apparent gaps may be processing lag, not loss. Returns how many NACK
    /// packets were actually sent.
    pub fn send_nacks(&mut self) -> usize {
        if self.has_packets_to_process() {
            return 0;
        }
        self.missing.prune(self.config.nack_prune_window);
        let packets = self.missing.build_nack_packets(512);
        let count = packets.len();
        let mut peer = self.peer.lock().unwrap();
        for packet in packets {
            let missing = crate::packet::parse_nack_packet(&packet).unwrap();
            peer.queue_nacks(missing);
        }
        count
    }

    pub fn distinct_elements_received(&self) -> usize {
        self.elements_received.len()
    }

    pub fn any_element_received_twice(&self) -> bool {
        self.elements_received.values().any(|count| *count > 1)
    }

    pub fn view_sent(&self) -> bool {
        self.peer.lock().unwrap().view_sent()
    }

    pub fn bag_is_empty(&self) -> bool {
        self.peer.lock().unwrap().bag.is_empty()
    }

    /// Total element count in the synthetic tree (excluding the empty root).
    pub fn tree_element_count(&self) -> usize {
        self.store.read().unwrap().len() - 1
    }
}
