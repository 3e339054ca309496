use crate::assembler::{self, PackDecision};
use crate::budget::PacketBudgetTracker;
use crate::config::CanopyConfig;
use crate::encoder::{EncodeStop, IncrementalEncoder};
use crate::packet::{WirePacket, FLAG_COMPRESSED, FLAG_CONTAINS_STATS, INTERNAL_SECTION_SIZE_BYTES};
use crate::peer::{PeerSession, SharedPeer};
use crate::stats::CanopyStats;
use crate::store::{EncodeParams, NullTracker, SendTracker, SpatialStore};
use crate::transport::Transport;
use crate::view::{AACube, LOW_RES_MOVING_ADJUST, NO_BOUNDARY_ADJUST};
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Microseconds since the unix epoch; the timestamp unit used on the wire and
/// for change watermarks.
pub fn now_usecs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Scene starts are back-dated by this much, so edits racing the scene
/// boundary land on the changed side of the watermark.
const SCENE_CHANGE_FUDGE_USECS: u64 = 100_000;

/// Always yield at least this long at the end of a tick, even under overload.
const MIN_SLEEP_USECS: u64 = 1;

/// One peer's delivery timeline: decides every tick what fraction of the tree
/// to encode and send, under the per-interval packet budget.
///
/// Runs on its own OS thread (`spawn`), or is driven tick-by-tick in tests via
/// `process_tick`. All cross-peer parallelism is thread-level; nothing here is
/// shared between peers except the tree's read lock and the stats handle.
pub struct SendLoop<S: SpatialStore> {
    config: CanopyConfig,
    store: Arc<RwLock<S>>,
    peer: SharedPeer,
    transport: Arc<dyn Transport>,
    stats: Arc<CanopyStats>,
    jurisdiction: Option<AACube>,
    tracker: Box<dyn SendTracker + Send>,
    shutdown: Arc<AtomicBool>,
    initial_load_complete: Arc<AtomicBool>,
    encoder: IncrementalEncoder,
    packets_sent_this_interval: usize,
}

impl<S: SpatialStore> SendLoop<S> {
    pub fn new(
        config: CanopyConfig,
        store: Arc<RwLock<S>>,
        peer: SharedPeer,
        transport: Arc<dyn Transport>,
        stats: Arc<CanopyStats>,
    ) -> Self {
        Self {
            config,
            store,
            peer,
            transport,
            stats,
            jurisdiction: None,
            tracker: Box::new(NullTracker),
            shutdown: Arc::new(AtomicBool::new(false)),
            initial_load_complete: Arc::new(AtomicBool::new(true)),
            encoder: IncrementalEncoder::default(),
            packets_sent_this_interval: 0,
        }
    }

    pub fn set_jurisdiction(&mut self, jurisdiction: Option<AACube>) {
        self.jurisdiction = jurisdiction;
    }

    pub fn set_tracker(&mut self, tracker: Box<dyn SendTracker + Send>) {
        self.tracker = tracker;
    }

    /// Gate ticks on the server's initial tree load.
    pub fn set_initial_load_flag(&mut self, flag: Arc<AtomicBool>) {
        self.initial_load_complete = flag;
    }

    /// Handle for requesting cooperative shutdown from another thread.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn packets_sent_this_interval(&self) -> usize {
        self.packets_sent_this_interval
    }

    /// One tick of the send loop. Returns false once shutdown is requested.
    pub fn process_tick(&mut self) -> bool {
        if self.shutdown.load(Ordering::Relaxed) {
            return false;
        }

        // don't do any send processing until the initial tree load completes
        if self.initial_load_complete.load(Ordering::Relaxed) {
            let peer = Arc::clone(&self.peer);
            let Ok(mut peer) = peer.lock() else {
                warn!("peer session lock poisoned, stopping send loop");
                return false;
            };
            // the session may not be linked yet, or may be going away
            if !peer.is_shutting_down() {
                let frustum = peer.query.frustum;
                let lod = peer.query.lod;
                let view_changed = peer.view.update(frustum, lod);
                self.packet_distributor(&mut peer, view_changed);
            }
        }

        !self.shutdown.load(Ordering::Relaxed)
    }

    /// Run until shutdown, sleeping out the remainder of each fixed interval.
    pub fn run(mut self) {
        let peer_id = match self.peer.lock() {
            Ok(p) => p.id(),
            Err(_) => crate::transport::PeerId(0),
        };
        debug!("{peer_id}: send loop starting");
        loop {
            let start = Instant::now();
            if !self.process_tick() {
                break;
            }
            let elapsed = start.elapsed().as_micros() as u64;
            let to_sleep = self
                .config
                .send_interval_usecs
                .saturating_sub(elapsed)
                .max(MIN_SLEEP_USECS);
            std::thread::sleep(Duration::from_micros(to_sleep));
        }
        debug!("{peer_id}: send loop exiting");
    }

    pub fn spawn(self) -> JoinHandle<()>
    where
        S: Send + Sync + 'static,
    {
        std::thread::Builder::new()
            .name("canopy-send".to_string())
            .spawn(move || self.run())
            .expect("spawning send thread")
    }

    /// The per-tick distributor: decide full vs incremental scene, restart the
    /// traversal when needed, drive the encoder under the packet budget, then
    /// drain specials and retransmits with whatever budget remains.
    fn packet_distributor(&mut self, peer: &mut PeerSession, view_changed: bool) {
        self.packets_sent_this_interval = 0;
        let budget = PacketBudgetTracker::new(&self.config, peer.max_query_pps(&self.config));

        let mut is_full_scene = peer.view.should_force_full_scene();
        if !is_full_scene {
            // the force flag wasn't set; check if something else suggests it
            is_full_scene = peer.query_params_changed()
                || (peer.query.uses_frustum_culling
                    && ((!view_changed && peer.view.just_stopped_changing())
                        || peer.view.has_lod_changed()));
        }

        if peer.is_packet_waiting() {
            // a packet left over from last tick goes out first
            self.handle_packet_send(peer, false);
        } else {
            peer.reset_packet();
        }

        self.encoder
            .change_settings(true, assembler::full_target_size(peer.packet()));

        // if the view changed, or there's nothing owed, start a new scene
        if view_changed || peer.bag.is_empty() {
            if view_changed && peer.view.has_lod_changed() {
                peer.dump_out_of_view();
            }

            peer.stats.scene_completed();
            {
                let Ok(store) = self.store.read() else {
                    warn!("tree lock poisoned, skipping tick");
                    return;
                };
                peer.set_last_root_timestamp(store.root_last_changed());
                store.release_scene();
            }

            self.handle_packet_send(peer, is_full_scene);

            if is_full_scene {
                peer.bag.clear();
            }

            peer.scene_start(now_usecs().saturating_sub(SCENE_CHANGE_FUDGE_USECS));
            peer.stats.scene_started(is_full_scene, view_changed);
            peer.set_view_sent(false);

            let root = match self.store.read() {
                Ok(store) => store.root(),
                Err(_) => return,
            };
            peer.bag.insert(root);
        }

        if !peer.bag.is_empty() {
            self.traverse_and_send(peer, view_changed, is_full_scene, &budget);

            // other data the server owes this peer, before retransmits
            while peer.has_special_packets()
                && !budget.is_exhausted(self.packets_sent_this_interval)
                && !peer.is_shutting_down()
            {
                if let Some(bytes) = peer.next_special_packet() {
                    self.transport.send_unreliable(peer.id(), &bytes);
                    self.stats.add_special_packet(bytes.len());
                    self.packets_sent_this_interval += 1;
                }
            }

            // replay packets the peer reported missing, up to remaining budget
            while peer.has_next_nacked_packet()
                && !budget.is_exhausted(self.packets_sent_this_interval)
            {
                if let Some(retained) = peer.next_nacked_packet() {
                    trace!("{}: retransmitting {} bytes", peer.id(), retained.bytes.len());
                    self.transport.send_unreliable(peer.id(), &retained.bytes);
                    self.stats.add_packet(
                        retained.bytes.len(),
                        self.config.max_packet_size.saturating_sub(retained.bytes.len()),
                    );
                    self.packets_sent_this_interval += 1;
                }
            }

            // emptied the bag: everything in the current view has been sent
            if peer.bag.is_empty() {
                peer.view.update_last_known();
                peer.set_view_sent(true);

                // completing a forced full scene gets one more stats packet,
                // so the peer can tell the scene is stable
                if is_full_scene {
                    peer.stats.scene_completed();
                    self.handle_packet_send(peer, true);
                }
            }
        }
    }

    /// Pull subtrees from the bag and pack them into wire packets until the
    /// bag is dry, the budget is spent, or shutdown is requested.
    fn traverse_and_send(
        &mut self,
        peer: &mut PeerSession,
        view_changed: bool,
        is_full_scene: bool,
        budget: &PacketBudgetTracker,
    ) {
        let mut extra_packing_attempts = 0usize;
        let mut completed_scene = false;
        let mut something_to_send = true;

        while something_to_send
            && !budget.is_exhausted(self.packets_sent_this_interval)
            && !peer.is_shutting_down()
            && !self.shutdown.load(Ordering::Relaxed)
        {
            let mut last_didnt_fit = false;

            if peer.bag.is_empty() {
                something_to_send = false;
            } else {
                let lock_wait_start = Instant::now();
                let Ok(store) = self.store.read() else {
                    warn!("tree lock poisoned, abandoning traversal");
                    return;
                };
                self.stats
                    .lock_wait_usecs
                    .fetch_add(lock_wait_start.elapsed().as_micros() as u64, Ordering::Relaxed);

                if let Some(subtree) = peer.bag.extract() {
                    let current = peer.view.current().copied();
                    let last_known = if view_changed {
                        peer.view.last_known().copied()
                    } else {
                        None
                    };
                    let params = EncodeParams {
                        frustum: if peer.query.uses_frustum_culling {
                            current.as_ref()
                        } else {
                            None
                        },
                        last_frustum: last_known.as_ref(),
                        lod: peer.view.lod(),
                        extra_boundary_adjust: if view_changed {
                            LOW_RES_MOVING_ADJUST
                        } else {
                            NO_BOUNDARY_ADJUST
                        },
                        full_scene: is_full_scene,
                        changed_since: if is_full_scene {
                            None
                        } else {
                            peer.changed_since()
                        },
                        jurisdiction: self.jurisdiction,
                        section_capacity: self.config.max_packet_size
                            - crate::packet::PACKET_HEADER_SIZE
                            - INTERNAL_SECTION_SIZE_BYTES,
                    };

                    peer.stats.encode_started(now_usecs());
                    let encode_start = Instant::now();
                    let result = self.encoder.encode(
                        &*store,
                        subtree,
                        &mut peer.bag,
                        &params,
                        self.tracker.as_mut(),
                    );
                    self.stats
                        .encode_usecs
                        .fetch_add(encode_start.elapsed().as_micros() as u64, Ordering::Relaxed);
                    peer.stats.encode_stopped(now_usecs());

                    // nothing left in the bag means the whole scene is encoded
                    completed_scene = !result.subtrees_remaining;
                    if result.stop == EncodeStop::BufferFull {
                        last_didnt_fit = true;
                        extra_packing_attempts += 1;
                    }
                }
            }

            if completed_scene || last_didnt_fit {
                if self.encoder.has_content() {
                    let write_start = Instant::now();
                    let additional = self.encoder.finalized_size() + INTERNAL_SECTION_SIZE_BYTES;
                    if additional > peer.available() {
                        // no room: flush what the wire packet already holds
                        self.handle_packet_send(peer, false);
                    }
                    assembler::write_to_packet(self.encoder.scratch(), peer.packet_mut());
                    self.stats
                        .write_usecs
                        .fetch_add(write_start.elapsed().as_micros() as u64, Ordering::Relaxed);
                }

                match assembler::pack_decision(
                    &self.config,
                    completed_scene,
                    peer.available(),
                    extra_packing_attempts,
                ) {
                    PackDecision::SendNow => {
                        self.handle_packet_send(peer, false);
                        extra_packing_attempts = 0;
                        self.encoder
                            .change_settings(true, assembler::full_target_size(peer.packet()));
                    }
                    PackDecision::PackMore => {
                        // keep accumulating into the current wire packet: new
                        // section, shrunk to the remaining room
                        self.encoder.change_settings(
                            true,
                            assembler::shrunk_target_size(&self.config, peer.packet()),
                        );
                    }
                }
            }
        }

        if something_to_send {
            debug!(
                "{}: hit packet budget, sent {} of max {}",
                peer.id(),
                self.packets_sent_this_interval,
                budget.max_packets_per_interval()
            );
        }
    }

    /// Send whatever the peer's live packet holds, piggybacking a pending
    /// stats message when there is one. Returns packets actually sent.
    ///
    /// Unless `dont_suppress_duplicate`, a packet whose payload is identical
    /// to the previous send is silently dropped; upper layers never need to
    /// know about this rate-control saving.
    fn handle_packet_send(&mut self, peer: &mut PeerSession, dont_suppress_duplicate: bool) -> usize {
        if peer.is_shutting_down() {
            return 0;
        }
        if !dont_suppress_duplicate && peer.should_suppress_duplicate() {
            peer.reset_packet();
            return 0;
        }

        let now = now_usecs();
        let mut packets = 0;

        if peer.stats.is_ready_to_send() {
            let stats_msg = peer.stats.stats_message();
            let mut stats_packet = WirePacket::new(
                self.config.max_packet_size,
                FLAG_COMPRESSED | FLAG_CONTAINS_STATS,
            );
            if let Err(e) = stats_packet.write_section(&stats_msg) {
                warn!("stats message exceeds packet capacity, dropping: {e}");
            }

            let tree_payload = peer.packet().payload().to_vec();
            let tree_sections = peer.packet().section_count();
            peer.note_payload_sent();

            if tree_sections > 0 && tree_payload.len() <= stats_packet.available() {
                // stats and tree content fit together in one packet
                stats_packet
                    .append_sections(&tree_payload, tree_sections)
                    .expect("checked against available space");
                // the stats section exists because there was nothing else to
                // send; none of these bytes count as wasted
                packets += self.dispatch(peer, &mut stats_packet, 0, now);
            } else if tree_sections > 0 {
                // not enough room: stats first, tree content separately
                packets += self.dispatch(peer, &mut stats_packet, 0, now);
                let mut live = self.take_live_packet(peer);
                let wasted = self.config.max_packet_size - live.data_size();
                packets += self.dispatch(peer, &mut live, wasted, now);
            } else {
                packets += self.dispatch(peer, &mut stats_packet, 0, now);
            }
            peer.stats.mark_as_sent();
        } else if peer.is_packet_waiting() {
            peer.note_payload_sent();
            let mut live = self.take_live_packet(peer);
            let wasted = self.config.max_packet_size - live.data_size();
            packets += self.dispatch(peer, &mut live, wasted, now);
        }

        if packets > 0 {
            peer.reset_packet();
        }
        self.packets_sent_this_interval += packets;
        packets
    }

    /// Swap the peer's live packet out for a fresh one, so it can be
    /// finalized and dispatched while the session stays borrowed.
    fn take_live_packet(&self, peer: &mut PeerSession) -> WirePacket {
        std::mem::replace(
            peer.packet_mut(),
            WirePacket::new(self.config.max_packet_size, FLAG_COMPRESSED),
        )
    }

    /// Stamp sequence + timestamp, hand to the transport, retain for NACK
    /// replay, and count.
    fn dispatch(
        &self,
        peer: &mut PeerSession,
        packet: &mut WirePacket,
        wasted: usize,
        now: u64,
    ) -> usize {
        let sequence = peer.next_sequence();
        let bytes = packet.finalize(sequence, now).to_vec();
        trace!(
            ">>> {}: sending seq:{sequence} size:{} wasted:{wasted}",
            peer.id(),
            bytes.len()
        );
        let send_start = Instant::now();
        self.transport.send_unreliable(peer.id(), &bytes);
        self.stats
            .send_usecs
            .fetch_add(send_start.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.stats.add_packet(bytes.len(), wasted);
        peer.stats.packet_sent(bytes.len());
        peer.record_sent_packet(sequence, bytes, now);
        1
    }
}
