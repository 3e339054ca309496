use byteorder::{NetworkEndian, WriteBytesExt};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide send counters, shared by every peer's send loop via an
/// injected `Arc<CanopyStats>`.
///
/// These are a write-only observability surface: nothing in the scheduling
/// logic reads them back. Control decisions use the per-tick local counters
/// inside `SendLoop`.
#[derive(Default, Debug)]
pub struct CanopyStats {
    pub total_bytes: AtomicU64,
    /// Padding left in underfull wire packets.
    pub total_wasted_bytes: AtomicU64,
    pub total_packets: AtomicU64,
    pub total_special_bytes: AtomicU64,
    pub total_special_packets: AtomicU64,
    /// Accumulated microseconds spent waiting on the tree read lock.
    pub lock_wait_usecs: AtomicU64,
    /// Accumulated microseconds spent inside subtree encodes.
    pub encode_usecs: AtomicU64,
    /// Accumulated microseconds spent transferring scratch content into wire packets.
    pub write_usecs: AtomicU64,
    /// Accumulated microseconds spent handing packets to the transport.
    pub send_usecs: AtomicU64,
}

impl CanopyStats {
    pub fn add_packet(&self, bytes: usize, wasted: usize) {
        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_wasted_bytes
            .fetch_add(wasted as u64, Ordering::Relaxed);
    }

    pub fn add_special_packet(&self, bytes: usize) {
        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_special_packets.fetch_add(1, Ordering::Relaxed);
        self.total_special_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.total_packets.load(Ordering::Relaxed)
    }
    pub fn bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

/// Per-peer scene delivery stats, serialized into the stats message that is
/// piggybacked onto (or sent alongside) tree-content packets at scene
/// boundaries, so the client can tell when its view of the scene is stable.
#[derive(Debug, Default, Clone)]
pub struct SceneStats {
    /// Counts completed scene deliveries to this peer.
    scene_number: u64,
    is_full_scene: bool,
    is_moving: bool,
    elements_sent_in_scene: u64,
    packets_sent_in_scene: u64,
    bytes_sent_in_scene: u64,
    encode_usecs_in_scene: u64,
    encode_started_at: Option<u64>,
    /// Set by `scene_completed()`, cleared once the stats message goes out.
    ready_to_send: bool,
    in_progress: bool,
}

impl SceneStats {
    pub fn scene_started(&mut self, is_full_scene: bool, is_moving: bool) {
        self.is_full_scene = is_full_scene;
        self.is_moving = is_moving;
        self.elements_sent_in_scene = 0;
        self.packets_sent_in_scene = 0;
        self.bytes_sent_in_scene = 0;
        self.encode_usecs_in_scene = 0;
        self.in_progress = true;
    }

    /// Completing a scene arms the stats message. Idle ticks where no scene
    /// was in progress are a no-op, so static views don't spam stats.
    pub fn scene_completed(&mut self) {
        if !self.in_progress {
            return;
        }
        self.in_progress = false;
        self.scene_number += 1;
        self.ready_to_send = true;
    }

    pub fn encode_started(&mut self, now_usecs: u64) {
        self.encode_started_at = Some(now_usecs);
    }

    pub fn encode_stopped(&mut self, now_usecs: u64) {
        if let Some(start) = self.encode_started_at.take() {
            self.encode_usecs_in_scene += now_usecs.saturating_sub(start);
        }
    }

    pub fn element_sent(&mut self) {
        self.elements_sent_in_scene += 1;
    }

    pub fn packet_sent(&mut self, payload_bytes: usize) {
        self.packets_sent_in_scene += 1;
        self.bytes_sent_in_scene += payload_bytes as u64;
    }

    pub fn is_ready_to_send(&self) -> bool {
        self.ready_to_send
    }

    pub fn mark_as_sent(&mut self) {
        self.ready_to_send = false;
    }

    pub fn scene_number(&self) -> u64 {
        self.scene_number
    }
    pub fn elements_sent(&self) -> u64 {
        self.elements_sent_in_scene
    }

    /// Serialize the compact stats message. The exact element payload encoding is
    /// a collaborator concern; this message is small fixed-layout bookkeeping.
    pub fn stats_message(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(34);
        // scene number, flags, element/packet/byte counts, encode time
        out.write_u64::<NetworkEndian>(self.scene_number).unwrap();
        let mut flags = 0u8;
        if self.is_full_scene {
            flags |= 1;
        }
        if self.is_moving {
            flags |= 1 << 1;
        }
        out.write_u8(flags).unwrap();
        out.write_u64::<NetworkEndian>(self.elements_sent_in_scene)
            .unwrap();
        out.write_u64::<NetworkEndian>(self.packets_sent_in_scene)
            .unwrap();
        out.write_u64::<NetworkEndian>(self.bytes_sent_in_scene)
            .unwrap();
        out.write_u64::<NetworkEndian>(self.encode_usecs_in_scene)
            .unwrap();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_ready_flag_lifecycle() {
        let mut stats = SceneStats::default();
        assert!(!stats.is_ready_to_send());
        stats.scene_started(true, false);
        stats.element_sent();
        stats.packet_sent(100);
        stats.scene_completed();
        assert!(stats.is_ready_to_send());
        assert_eq!(stats.scene_number(), 1);
        stats.mark_as_sent();
        assert!(!stats.is_ready_to_send());
    }

    #[test]
    fn encode_time_accumulates() {
        let mut stats = SceneStats::default();
        stats.scene_started(false, false);
        stats.encode_started(1000);
        stats.encode_stopped(1500);
        stats.encode_started(2000);
        stats.encode_stopped(2250);
        assert_eq!(stats.encode_usecs_in_scene, 750);
    }
}
