use crate::config::CanopyConfig;
use crate::packet::{WirePacket, INTERNAL_SECTION_SIZE_BYTES};
use log::*;

/// Scratch buffer that accumulates encoded subtree content for one section of
/// the outbound wire packet.
///
/// The encoder appends into it up to the target size established by the last
/// `change_settings()`; finalized content is then transferred into the peer's
/// live packet as a size-prefixed section.
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    buf: Vec<u8>,
    target_size: usize,
    compressed: bool,
}

impl ScratchBuffer {
    /// Reset the buffer and establish a new capacity ceiling. Called whenever
    /// the size envelope changes: after a flush, or when shrinking the target
    /// to the room left in the current wire packet.
    pub fn change_settings(&mut self, compressed: bool, target_size: usize) {
        self.buf.clear();
        self.compressed = compressed;
        self.target_size = target_size;
    }

    pub fn has_content(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.target_size.saturating_sub(self.buf.len())
    }

    /// Append encoded bytes, refusing rather than exceeding the target size.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.buf.extend_from_slice(bytes);
        true
    }

    pub fn finalized_size(&self) -> usize {
        self.buf.len()
    }

    pub fn finalized_data(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }
}

/// Outcome of one flush decision in the traversal loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackDecision {
    /// Flush the live packet now and re-arm the scratch at full target size.
    SendNow,
    /// Keep accumulating: shrink the scratch target to the remaining room.
    PackMore,
}

/// The send-now policy from the traversal loop: flush when the scene just
/// completed, when the live packet is too full for another useful attempt, or
/// when we've already repacked against this wire packet too many times.
pub fn pack_decision(
    config: &CanopyConfig,
    completed_scene: bool,
    available: usize,
    packing_attempts: usize,
) -> PackDecision {
    if completed_scene
        || available < config.min_bytes_for_more_packing
        || packing_attempts > config.max_packing_attempts
    {
        PackDecision::SendNow
    } else {
        PackDecision::PackMore
    }
}

/// Transfer finalized scratch content into the live wire packet as one
/// section. The caller has already ensured it fits (flushing first if not).
pub fn write_to_packet(scratch: &ScratchBuffer, packet: &mut WirePacket) {
    debug_assert!(scratch.has_content());
    if let Err(e) = packet.write_section(scratch.finalized_data()) {
        // Can't happen when the caller respects available(); losing a
        // section to a logic bug degrades to a sparser packet, not a crash.
        warn!("dropping section that no longer fits: {e}");
    }
}

/// Scratch target for a fresh section: the room left in the live packet minus
/// the section size prefix.
pub fn full_target_size(packet: &WirePacket) -> usize {
    packet.available().saturating_sub(INTERNAL_SECTION_SIZE_BYTES)
}

/// Scratch target when continuing to pack into a partially used packet: also
/// reserve a little room for compression bookkeeping.
pub fn shrunk_target_size(config: &CanopyConfig, packet: &WirePacket) -> usize {
    packet
        .available()
        .saturating_sub(INTERNAL_SECTION_SIZE_BYTES + config.compress_padding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_respects_target() {
        let mut scratch = ScratchBuffer::default();
        scratch.change_settings(true, 10);
        assert!(scratch.append(&[0; 6]));
        assert!(!scratch.append(&[0; 6])); // would exceed
        assert!(scratch.append(&[0; 4]));
        assert_eq!(scratch.finalized_size(), 10);
        assert_eq!(scratch.remaining(), 0);
    }

    #[test]
    fn change_settings_resets() {
        let mut scratch = ScratchBuffer::default();
        scratch.change_settings(true, 100);
        scratch.append(&[1, 2, 3]);
        assert!(scratch.has_content());
        scratch.change_settings(true, 50);
        assert!(!scratch.has_content());
        assert_eq!(scratch.remaining(), 50);
    }

    #[test]
    fn send_now_policy() {
        let config = CanopyConfig::default();
        assert_eq!(
            pack_decision(&config, true, 1000, 0),
            PackDecision::SendNow
        );
        assert_eq!(
            pack_decision(&config, false, config.min_bytes_for_more_packing - 1, 0),
            PackDecision::SendNow
        );
        assert_eq!(
            pack_decision(&config, false, 1000, config.max_packing_attempts + 1),
            PackDecision::SendNow
        );
        assert_eq!(pack_decision(&config, false, 1000, 1), PackDecision::PackMore);
    }
}
