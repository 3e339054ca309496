use crate::assembler::ScratchBuffer;
use crate::bag::TraversalBag;
use crate::store::{EncodeParams, NodeId, SendTracker, SpatialStore, StoreStop};

/// Why one incremental encode pass stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStop {
    /// The subtree was consumed: fully appended, or filtered away entirely
    /// (out of view, out of jurisdiction, LOD-skipped, unchanged).
    FullyEncoded,
    /// The scratch buffer filled; the unsent remainder went back in the bag.
    BufferFull,
}

/// Result of encoding one subtree pulled from the bag.
#[derive(Debug, Clone, Copy)]
pub struct EncodeResult {
    /// Whether the bag still holds work for the current scene.
    pub subtrees_remaining: bool,
    pub stop: EncodeStop,
}

/// Wraps the store's tree-encode primitive with the size-bounded scratch
/// buffer it encodes into: one subtree per call, resumable across calls.
///
/// Work-splitting is the store's responsibility (it re-queues whatever didn't
/// fit); this wrapper owns the scratch envelope and reduces the store's stop
/// status to the two outcomes the traversal loop acts on.
#[derive(Debug, Default)]
pub struct IncrementalEncoder {
    scratch: ScratchBuffer,
}

impl IncrementalEncoder {
    /// Reset the scratch and establish a new target size envelope.
    pub fn change_settings(&mut self, compressed: bool, target_size: usize) {
        self.scratch.change_settings(compressed, target_size);
    }

    pub fn scratch(&self) -> &ScratchBuffer {
        &self.scratch
    }

    pub fn has_content(&self) -> bool {
        self.scratch.has_content()
    }

    pub fn finalized_size(&self) -> usize {
        self.scratch.finalized_size()
    }

    /// Encode one subtree (already extracted from the bag by the caller) into
    /// the scratch buffer.
    pub fn encode<S: SpatialStore + ?Sized>(
        &mut self,
        store: &S,
        subtree: NodeId,
        bag: &mut TraversalBag,
        params: &EncodeParams,
        tracker: &mut dyn SendTracker,
    ) -> EncodeResult {
        let stop = store.encode_subtree(subtree, &mut self.scratch, bag, params, tracker);
        EncodeResult {
            subtrees_remaining: !bag.is_empty(),
            stop: match stop {
                StoreStop::DidntFit => EncodeStop::BufferFull,
                _ => EncodeStop::FullyEncoded,
            },
        }
    }
}
