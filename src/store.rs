use crate::assembler::ScratchBuffer;
use crate::bag::TraversalBag;
use crate::view::{AACube, LodParams, ViewFrustum};
use byteorder::{NetworkEndian, WriteBytesExt};
use log::*;

/// Opaque handle to a subtree within a spatial store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Why a subtree encode stopped. Everything is a status, never an error: the
/// send loop consumes these to drive re-queueing and flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStop {
    /// The whole subtree (everything the filters allowed) was appended.
    Complete,
    /// The scratch buffer filled up; the unsent remainder is back in the bag.
    DidntFit,
    /// The subtree root is outside the current view frustum.
    OutOfView,
    /// The subtree root is outside this server's spatial partition.
    OutOfJurisdiction,
    /// The subtree is too small/distant for the requested level of detail.
    LodSkip,
    /// Nothing beneath this subtree changed since the incremental watermark.
    NoChange,
}

/// Per-encode parameters assembled by the send loop each time it pulls a
/// subtree from the bag.
#[derive(Debug, Clone, Copy)]
pub struct EncodeParams<'a> {
    /// Current view frustum; `None` disables frustum culling.
    pub frustum: Option<&'a ViewFrustum>,
    /// The previously delivered frustum, supplied only on view-changed ticks.
    /// Elements already inside it are sent only if they changed.
    pub last_frustum: Option<&'a ViewFrustum>,
    pub lod: LodParams,
    /// Additional boundary coarsening while the view is in motion.
    pub extra_boundary_adjust: i32,
    /// Full scenes ignore the incremental watermark and resend everything.
    pub full_scene: bool,
    /// Incremental watermark: elements unchanged since this are skipped.
    pub changed_since: Option<u64>,
    /// This server's assigned spatial partition; subtrees outside are clipped.
    pub jurisdiction: Option<AACube>,
    /// The largest section a fresh wire packet can carry. An element that
    /// exceeds this can never be delivered and is dropped rather than
    /// re-queued forever.
    pub section_capacity: usize,
}

/// Tracking hook invoked once per logical element encoded, decoupled from
/// packet boundaries. Lets the server audit exactly what went to which peer.
pub trait SendTracker {
    fn track_send(&mut self, item_id: u64, edited_at_usecs: u64);
}

/// No-op tracker.
pub struct NullTracker;
impl SendTracker for NullTracker {
    fn track_send(&mut self, _item_id: u64, _edited_at_usecs: u64) {}
}

/// The spatial data store boundary. The send loop only ever reads: it acquires
/// a read lock around extract+encode, and writers elsewhere block until all
/// peer loops release.
pub trait SpatialStore {
    fn root(&self) -> NodeId;
    fn root_last_changed(&self) -> u64;

    /// Encode one subtree into the scratch buffer, pushing any subtrees that
    /// didn't fit back into `bag`. Never emits more bytes than the scratch
    /// target allows; a subtree reported `Complete` must not be re-queued.
    fn encode_subtree(
        &self,
        subtree: NodeId,
        scratch: &mut ScratchBuffer,
        bag: &mut TraversalBag,
        params: &EncodeParams,
        tracker: &mut dyn SendTracker,
    ) -> StoreStop;

    /// Drop any per-scene encode state retained for a peer's delivery.
    fn release_scene(&self) {}
}

/// Per-element wire prefix: item id + payload length.
const ELEMENT_OVERHEAD: usize = 8 + 2;

#[derive(Debug, Clone)]
struct OctreeNode {
    item_id: u64,
    cube: AACube,
    payload: Vec<u8>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    last_changed: u64,
    /// Max `last_changed` across this node and all descendants, maintained on
    /// every mutation so incremental scenes can prune unchanged subtrees.
    subtree_changed: u64,
}

/// Reference octree store: spatial elements with opaque payload bytes.
///
/// The element payload encoding is deliberately trivial (id + length + bytes);
/// the interesting part is the resumable traversal that splits work back into
/// the bag whenever the scratch buffer fills.
#[derive(Debug, Default)]
pub struct SimpleOctree {
    nodes: Vec<OctreeNode>,
}

impl SimpleOctree {
    pub fn new(root_cube: AACube, changed_at: u64) -> Self {
        Self {
            nodes: vec![OctreeNode {
                item_id: 0,
                cube: root_cube,
                payload: Vec::new(),
                children: Vec::new(),
                parent: None,
                last_changed: changed_at,
                subtree_changed: changed_at,
            }],
        }
    }

    pub fn add_child(
        &mut self,
        parent: NodeId,
        item_id: u64,
        cube: AACube,
        payload: Vec<u8>,
        changed_at: u64,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(OctreeNode {
            item_id,
            cube,
            payload,
            children: Vec::new(),
            parent: Some(parent),
            last_changed: changed_at,
            subtree_changed: changed_at,
        });
        self.nodes[parent.0 as usize].children.push(id);
        self.bump_ancestors(parent, changed_at);
        id
    }

    /// Mark an element as edited, propagating the change stamp to the root.
    pub fn touch(&mut self, id: NodeId, changed_at: u64) {
        let node = &mut self.nodes[id.0 as usize];
        node.last_changed = changed_at;
        node.subtree_changed = node.subtree_changed.max(changed_at);
        if let Some(parent) = node.parent {
            self.bump_ancestors(parent, changed_at);
        }
    }

    fn bump_ancestors(&mut self, from: NodeId, changed_at: u64) {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let node = &mut self.nodes[id.0 as usize];
            if node.subtree_changed >= changed_at {
                break;
            }
            node.subtree_changed = changed_at;
            cursor = node.parent;
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
    pub fn cube(&self, id: NodeId) -> AACube {
        self.nodes[id.0 as usize].cube
    }

    /// Encoded size of one element in the bitstream.
    pub fn encoded_size(&self, id: NodeId) -> usize {
        ELEMENT_OVERHEAD + self.nodes[id.0 as usize].payload.len()
    }

    fn append_element(&self, node: &OctreeNode, scratch: &mut ScratchBuffer) -> bool {
        if scratch.remaining() < ELEMENT_OVERHEAD + node.payload.len() {
            return false;
        }
        let mut bytes = Vec::with_capacity(ELEMENT_OVERHEAD + node.payload.len());
        bytes.write_u64::<NetworkEndian>(node.item_id).unwrap();
        bytes
            .write_u16::<NetworkEndian>(node.payload.len() as u16)
            .unwrap();
        bytes.extend_from_slice(&node.payload);
        scratch.append(&bytes)
    }

    /// Would this node survive the clip/cull/LOD filters?
    fn passes_filters(&self, node: &OctreeNode, params: &EncodeParams) -> Option<StoreStop> {
        if let Some(jurisdiction) = &params.jurisdiction {
            if !jurisdiction.intersects_cube(&node.cube) {
                return Some(StoreStop::OutOfJurisdiction);
            }
        }
        if let Some(frustum) = params.frustum {
            if !frustum.intersects_cube(&node.cube) {
                return Some(StoreStop::OutOfView);
            }
            if !params
                .lod
                .should_traverse(&node.cube, frustum.position, params.extra_boundary_adjust)
            {
                return Some(StoreStop::LodSkip);
            }
        }
        // timestamp pruning is only safe while the view is stable; on a
        // view-changed scene an unchanged subtree may hold newly revealed
        // content that the per-element check below has to consider
        if !params.full_scene && params.last_frustum.is_none() {
            if let Some(since) = params.changed_since {
                if node.subtree_changed <= since {
                    return Some(StoreStop::NoChange);
                }
            }
        }
        None
    }

    /// Should the element itself be written (as opposed to merely descended
    /// through)? Unchanged elements already covered by the last delivered
    /// frustum are skipped on incremental scenes.
    fn should_emit(&self, node: &OctreeNode, params: &EncodeParams) -> bool {
        if params.full_scene {
            return true;
        }
        let changed = params
            .changed_since
            .map_or(true, |since| node.last_changed > since);
        if changed {
            return true;
        }
        match params.last_frustum {
            // unchanged, but only newly revealed content needs sending
            Some(last) => !last.intersects_cube(&node.cube),
            None => false,
        }
    }
}

impl SpatialStore for SimpleOctree {
    fn root(&self) -> NodeId {
        NodeId(0)
    }

    fn root_last_changed(&self) -> u64 {
        self.nodes[0].subtree_changed
    }

    fn encode_subtree(
        &self,
        subtree: NodeId,
        scratch: &mut ScratchBuffer,
        bag: &mut TraversalBag,
        params: &EncodeParams,
        tracker: &mut dyn SendTracker,
    ) -> StoreStop {
        let root = &self.nodes[subtree.0 as usize];
        if let Some(stop) = self.passes_filters(root, params) {
            trace!("skipping subtree {subtree:?}: {stop:?}");
            return stop;
        }

        let mut stack = vec![subtree];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0 as usize];
            if self.passes_filters(node, params).is_some() {
                continue;
            }

            if self.should_emit(node, params) && !node.payload.is_empty() {
                if self.encoded_size(id) > params.section_capacity {
                    warn!(
                        "element {} ({} bytes) exceeds section capacity, skipping",
                        node.item_id,
                        self.encoded_size(id)
                    );
                } else if !self.append_element(node, scratch) {
                    // this element was not sent: it goes back in the bag,
                    // along with every subtree we hadn't visited yet
                    bag.insert(id);
                    for unvisited in stack.drain(..) {
                        bag.insert(unvisited);
                    }
                    return StoreStop::DidntFit;
                } else {
                    tracker.track_send(node.item_id, node.last_changed);
                }
            }

            // reversed so the first child is popped (and therefore sent) first
            for child in node.children.iter().rev() {
                stack.push(*child);
            }
        }
        StoreStop::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::NO_BOUNDARY_ADJUST;
    use glam::Vec3;
    use std::collections::HashSet;

    fn flat_tree(children: usize, payload_len: usize) -> SimpleOctree {
        let mut tree = SimpleOctree::new(AACube::new(Vec3::ZERO, 512.0), 1);
        for i in 0..children {
            tree.add_child(
                NodeId(0),
                i as u64 + 1,
                AACube::new(Vec3::new(i as f32, 0.0, 0.0), 1.0),
                vec![i as u8; payload_len],
                1,
            );
        }
        tree
    }

    fn open_params() -> EncodeParams<'static> {
        EncodeParams {
            frustum: None,
            last_frustum: None,
            lod: LodParams::default(),
            extra_boundary_adjust: NO_BOUNDARY_ADJUST,
            full_scene: true,
            changed_since: None,
            jurisdiction: None,
            section_capacity: 4096,
        }
    }

    struct CountingTracker(Vec<u64>);
    impl SendTracker for CountingTracker {
        fn track_send(&mut self, item_id: u64, _edited: u64) {
            self.0.push(item_id);
        }
    }

    #[test]
    fn whole_tree_fits_in_one_pass() {
        let tree = flat_tree(10, 4);
        let mut scratch = ScratchBuffer::default();
        scratch.change_settings(true, 4096);
        let mut bag = TraversalBag::default();
        let mut tracker = CountingTracker(Vec::new());

        let stop = tree.encode_subtree(
            tree.root(),
            &mut scratch,
            &mut bag,
            &open_params(),
            &mut tracker,
        );
        assert_eq!(stop, StoreStop::Complete);
        assert!(bag.is_empty());
        assert_eq!(tracker.0.len(), 10);
    }

    #[test]
    fn buffer_full_requeues_exact_remainder() {
        let tree = flat_tree(10, 4);
        let per_element = ELEMENT_OVERHEAD + 4;
        let mut scratch = ScratchBuffer::default();
        // room for exactly 3 elements
        scratch.change_settings(true, per_element * 3 + 1);
        let mut bag = TraversalBag::default();
        let mut tracker = CountingTracker(Vec::new());

        let stop = tree.encode_subtree(
            tree.root(),
            &mut scratch,
            &mut bag,
            &open_params(),
            &mut tracker,
        );
        assert_eq!(stop, StoreStop::DidntFit);
        assert_eq!(tracker.0.len(), 3);

        // drain the remainder with a roomy scratch: everything else, exactly once
        let mut sent: HashSet<u64> = tracker.0.iter().copied().collect();
        scratch.change_settings(true, 4096);
        let mut tracker2 = CountingTracker(Vec::new());
        while let Some(next) = bag.extract() {
            let stop = tree.encode_subtree(
                next,
                &mut scratch,
                &mut bag,
                &open_params(),
                &mut tracker2,
            );
            assert_eq!(stop, StoreStop::Complete);
        }
        for id in &tracker2.0 {
            assert!(sent.insert(*id), "element {id} was sent twice");
        }
        assert_eq!(sent.len(), 10);
    }

    #[test]
    fn out_of_view_subtree_is_skipped() {
        let mut tree = SimpleOctree::new(AACube::new(Vec3::ZERO, 512.0), 1);
        let child = tree.add_child(
            NodeId(0),
            1,
            AACube::new(Vec3::new(0.0, 0.0, -100.0), 1.0),
            vec![1, 2, 3],
            1,
        );
        let frustum = ViewFrustum::new(Vec3::ZERO, Vec3::Z, Vec3::Y);
        let params = EncodeParams {
            frustum: Some(&frustum),
            ..open_params()
        };
        let mut scratch = ScratchBuffer::default();
        scratch.change_settings(true, 4096);
        let mut bag = TraversalBag::default();
        let stop = tree.encode_subtree(child, &mut scratch, &mut bag, &params, &mut NullTracker);
        assert_eq!(stop, StoreStop::OutOfView);
        assert!(!scratch.has_content());
    }

    #[test]
    fn jurisdiction_clips_subtree() {
        let tree = flat_tree(3, 4);
        let params = EncodeParams {
            jurisdiction: Some(AACube::new(Vec3::new(10_000.0, 0.0, 0.0), 1.0)),
            ..open_params()
        };
        let mut scratch = ScratchBuffer::default();
        scratch.change_settings(true, 4096);
        let mut bag = TraversalBag::default();
        let stop =
            tree.encode_subtree(tree.root(), &mut scratch, &mut bag, &params, &mut NullTracker);
        assert_eq!(stop, StoreStop::OutOfJurisdiction);
    }

    #[test]
    fn incremental_scene_sends_only_changes() {
        let mut tree = flat_tree(5, 4);
        tree.touch(NodeId(3), 100);

        let params = EncodeParams {
            full_scene: false,
            changed_since: Some(50),
            ..open_params()
        };
        let mut scratch = ScratchBuffer::default();
        scratch.change_settings(true, 4096);
        let mut bag = TraversalBag::default();
        let mut tracker = CountingTracker(Vec::new());
        let stop = tree.encode_subtree(tree.root(), &mut scratch, &mut bag, &params, &mut tracker);
        assert_eq!(stop, StoreStop::Complete);
        assert_eq!(tracker.0, vec![3]);
    }

    #[test]
    fn unchanged_subtree_reports_no_change() {
        let tree = flat_tree(5, 4);
        let params = EncodeParams {
            full_scene: false,
            changed_since: Some(1_000),
            ..open_params()
        };
        let mut scratch = ScratchBuffer::default();
        scratch.change_settings(true, 4096);
        let mut bag = TraversalBag::default();
        let stop =
            tree.encode_subtree(tree.root(), &mut scratch, &mut bag, &params, &mut NullTracker);
        assert_eq!(stop, StoreStop::NoChange);
    }
}
