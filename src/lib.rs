//! Canopy streams a large octree of spatial elements to connected viewers
//! over unreliable datagrams.
//!
//! Each attached peer gets its own send loop (one OS thread per connection)
//! that wakes on a fixed interval and decides what fraction of the tree that
//! peer is owed: a full scene after its view or LOD changes, otherwise an
//! incremental update of what changed since the last delivered scene. Encoded
//! content is packed into size-bounded wire packets under a hard per-interval
//! packet budget, and packets the peer reports missing (via NACK) are
//! retransmitted out of a retained-history ring.
//!
//! The tree itself is a collaborator behind the [`SpatialStore`] trait: canopy
//! owns scheduling, budgeting, view tracking, and loss recovery, not the
//! per-element wire encoding. [`SimpleOctree`] is the in-crate reference
//! store, also used by the test harness in [`testing`].
mod assembler;
mod bag;
mod budget;
mod config;
mod encoder;
mod error;
mod packet;
mod peer;
mod retransmit;
mod send_loop;
mod sequence_buffer;
mod server;
mod stats;
mod store;
mod test_utils;
mod transport;
mod view;

pub use assembler::ScratchBuffer;
pub use bag::TraversalBag;
pub use budget::PacketBudgetTracker;
pub use config::CanopyConfig;
pub use encoder::{EncodeResult, EncodeStop, IncrementalEncoder};
pub use error::CanopyError;
pub use packet::{
    parse_nack_packet, parse_packet, write_nack_packet, ParsedPacket, WirePacket, FLAG_COMPRESSED,
    FLAG_CONTAINS_STATS, PACKET_HEADER_SIZE,
};
pub use peer::{PeerQuery, PeerSession, SharedPeer};
pub use retransmit::{MissingTracker, RetainedPacket, RetransmitQueue};
pub use send_loop::{now_usecs, SendLoop};
pub use sequence_buffer::SequenceBuffer;
pub use server::StreamServer;
pub use stats::{CanopyStats, SceneStats};
pub use store::{
    EncodeParams, NodeId, NullTracker, SendTracker, SimpleOctree, SpatialStore, StoreStop,
};
pub use transport::{NullTransport, PeerId, Transport};
pub use view::{
    AACube, LodParams, ViewFrustum, ViewState, LOW_RES_MOVING_ADJUST, NO_BOUNDARY_ADJUST,
};

pub mod prelude {
    pub use super::config::CanopyConfig;
    pub use super::error::CanopyError;
    pub use super::peer::{PeerQuery, PeerSession};
    pub use super::server::StreamServer;
    pub use super::stats::CanopyStats;
    pub use super::store::{SimpleOctree, SpatialStore};
    pub use super::transport::{PeerId, Transport};
    pub use super::view::{AACube, LodParams, ViewFrustum};
}

/// Test harness: a tick-by-tick send loop driver with a fake client on the
/// other end. Used by the integration tests and usable from dependents' tests.
pub mod testing {
    pub use super::test_utils::*;
}
