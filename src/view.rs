use glam::Vec3;

/// Axis-aligned cube, the bounding volume of every octree cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AACube {
    pub center: Vec3,
    pub half: f32,
}

impl AACube {
    pub fn new(center: Vec3, half: f32) -> Self {
        Self { center, half }
    }
    pub fn size(&self) -> f32 {
        self.half * 2.0
    }
    /// Radius of the bounding sphere.
    pub fn radius(&self) -> f32 {
        self.half * 3.0_f32.sqrt()
    }
    pub fn contains_point(&self, p: Vec3) -> bool {
        (p - self.center).abs().max_element() <= self.half
    }
    pub fn intersects_cube(&self, other: &AACube) -> bool {
        (other.center - self.center).abs().max_element() <= self.half + other.half
    }
}

/// A viewer's camera frustum, reduced to the six planes we cull against.
///
/// Culling is conservative: cells are tested as bounding spheres, so a cell
/// is only skipped when it is provably outside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewFrustum {
    pub position: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl ViewFrustum {
    pub fn new(position: Vec3, forward: Vec3, up: Vec3) -> Self {
        Self {
            position,
            forward: forward.normalize(),
            up: up.normalize(),
            fov_y: std::f32::consts::FRAC_PI_2,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1024.0,
        }
    }

    /// Plane normals point inward; a point is inside when its signed distance
    /// to every plane is >= 0.
    fn planes(&self) -> [(Vec3, f32); 6] {
        let right = self.forward.cross(self.up).normalize();
        let up = right.cross(self.forward);
        let half_v = (self.fov_y * 0.5).tan();
        let half_h = half_v * self.aspect;

        let near_center = self.position + self.forward * self.near;
        let far_center = self.position + self.forward * self.far;

        let top_n = (self.forward + up * half_v).cross(right).normalize();
        let bottom_n = right.cross(self.forward - up * half_v).normalize();
        let left_n = (self.forward - right * half_h).cross(up).normalize();
        let right_n = up.cross(self.forward + right * half_h).normalize();

        [
            (self.forward, -self.forward.dot(near_center)),
            (-self.forward, self.forward.dot(far_center)),
            (top_n, -top_n.dot(self.position)),
            (bottom_n, -bottom_n.dot(self.position)),
            (left_n, -left_n.dot(self.position)),
            (right_n, -right_n.dot(self.position)),
        ]
    }

    pub fn intersects_cube(&self, cube: &AACube) -> bool {
        let radius = cube.radius();
        for (normal, d) in self.planes() {
            if normal.dot(cube.center) + d < -radius {
                return false;
            }
        }
        true
    }

    /// Similarity predicate used instead of exact equality when deciding whether
    /// the view "changed", so floating point jitter in a stationary camera never
    /// forces a scene restart.
    pub fn is_very_similar(&self, other: &ViewFrustum) -> bool {
        const POSITION_SLOP_FRACTION: f32 = 0.01; // of far clip distance
        const ANGLE_SLOP_COS: f32 = 0.999_95;
        let position_slop = self.far * POSITION_SLOP_FRACTION;
        self.position.distance(other.position) <= position_slop
            && self.forward.dot(other.forward) >= ANGLE_SLOP_COS
            && self.up.dot(other.up) >= ANGLE_SLOP_COS
            && (self.fov_y - other.fov_y).abs() < f32::EPSILON
            && (self.aspect - other.aspect).abs() < f32::EPSILON
            && (self.near - other.near).abs() < f32::EPSILON
            && (self.far - other.far).abs() < f32::EPSILON
    }
}

/// Level-of-detail parameters supplied by the peer's query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LodParams {
    /// Distance scale: a cell of size `s` stays visible out to `s * size_scale`.
    pub size_scale: f32,
    /// Client-requested boundary adjustment. Each +1 halves the visible distance.
    pub boundary_level_adjust: i32,
}

impl Default for LodParams {
    fn default() -> Self {
        Self {
            size_scale: 32768.0,
            boundary_level_adjust: 0,
        }
    }
}

/// Extra boundary adjustment applied while the view frustum is changing, to
/// shed bandwidth on content the viewer is sweeping past.
pub const LOW_RES_MOVING_ADJUST: i32 = 1;
pub const NO_BOUNDARY_ADJUST: i32 = 0;

impl LodParams {
    /// Should a cell of this size at this distance be traversed at all?
    pub fn should_traverse(&self, cube: &AACube, view_position: Vec3, extra_adjust: i32) -> bool {
        let adjust = self.boundary_level_adjust + extra_adjust;
        let visible_distance = cube.size() * self.size_scale / 2.0_f32.powi(adjust);
        let distance = view_position.distance(cube.center) - cube.radius();
        distance <= visible_distance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Motion {
    Stable,
    Changing,
}

/// Tracks one peer's last-known view and detects the conditions that force a
/// scene restart: frustum movement, the tick on which movement stops, LOD
/// changes, and an externally set force-full-scene flag.
#[derive(Debug)]
pub struct ViewState {
    current: Option<ViewFrustum>,
    /// The frustum in effect when we last finished delivering a scene.
    last_known: Option<ViewFrustum>,
    lod: LodParams,
    motion: Motion,
    just_stopped: bool,
    lod_changed: bool,
    force_full_scene: bool,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            current: None,
            last_known: None,
            lod: LodParams::default(),
            motion: Motion::Stable,
            just_stopped: false,
            lod_changed: false,
            force_full_scene: false,
        }
    }
}

impl ViewState {
    /// Pull the latest frustum/LOD from the peer's query state. Returns whether
    /// the frustum changed beyond the similarity threshold.
    ///
    /// A peer that has not yet supplied a frustum reports `false`: the send
    /// loop skips processing rather than asserting.
    pub fn update(&mut self, frustum: Option<ViewFrustum>, lod: LodParams) -> bool {
        self.lod_changed = lod != self.lod;
        self.lod = lod;

        let Some(new) = frustum else {
            self.just_stopped = false;
            return false;
        };

        let changed = match &self.current {
            None => true,
            Some(current) => !current.is_very_similar(&new),
        };
        self.current = Some(new);

        if changed {
            self.motion = Motion::Changing;
            self.just_stopped = false;
        } else {
            self.just_stopped = self.motion == Motion::Changing;
            self.motion = Motion::Stable;
        }
        changed
    }

    pub fn current(&self) -> Option<&ViewFrustum> {
        self.current.as_ref()
    }
    pub fn last_known(&self) -> Option<&ViewFrustum> {
        self.last_known.as_ref()
    }
    pub fn lod(&self) -> LodParams {
        self.lod
    }

    /// True exactly on the tick after the frustum stopped changing. Content that
    /// entered view mid-movement may have been missed, so this triggers one full
    /// re-traversal.
    pub fn just_stopped_changing(&self) -> bool {
        self.just_stopped
    }

    pub fn has_lod_changed(&self) -> bool {
        self.lod_changed
    }

    pub fn set_force_full_scene(&mut self) {
        self.force_full_scene = true;
    }

    /// Sticky flag, auto-cleared once consumed.
    pub fn should_force_full_scene(&mut self) -> bool {
        std::mem::take(&mut self.force_full_scene)
    }

    /// Called when the element bag empties: the current view has been fully sent.
    pub fn update_last_known(&mut self) {
        self.last_known = self.current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_float_eq::*;

    fn frustum_at(x: f32) -> ViewFrustum {
        ViewFrustum::new(Vec3::new(x, 0.0, 0.0), Vec3::Z, Vec3::Y)
    }

    #[test]
    fn cube_in_front_is_visible() {
        let f = frustum_at(0.0);
        let cube = AACube::new(Vec3::new(0.0, 0.0, 50.0), 5.0);
        assert!(f.intersects_cube(&cube));
    }

    #[test]
    fn cube_behind_is_culled() {
        let f = frustum_at(0.0);
        let cube = AACube::new(Vec3::new(0.0, 0.0, -50.0), 5.0);
        assert!(!f.intersects_cube(&cube));
    }

    #[test]
    fn jitter_is_similar_movement_is_not() {
        let f = frustum_at(0.0);
        assert!(f.is_very_similar(&frustum_at(0.01)));
        assert!(!f.is_very_similar(&frustum_at(100.0)));
    }

    #[test]
    fn lod_distance_halves_per_adjust_level() {
        let lod = LodParams {
            size_scale: 100.0,
            boundary_level_adjust: 0,
        };
        let cube = AACube::new(Vec3::ZERO, 0.5);
        let d0 = cube.size() * lod.size_scale;
        assert_f32_near!(d0, 100.0);
        // visible at the unadjusted boundary...
        assert!(lod.should_traverse(&cube, Vec3::new(d0 * 0.9, 0.0, 0.0), NO_BOUNDARY_ADJUST));
        // ...but not once the moving adjustment halves the range
        assert!(!lod.should_traverse(&cube, Vec3::new(d0 * 0.9, 0.0, 0.0), LOW_RES_MOVING_ADJUST));
    }

    #[test]
    fn just_stopped_fires_exactly_once() {
        let mut vs = ViewState::default();
        let lod = LodParams::default();
        assert!(vs.update(Some(frustum_at(0.0)), lod)); // first sight counts as a change
        assert!(vs.update(Some(frustum_at(100.0)), lod));
        assert!(vs.update(Some(frustum_at(200.0)), lod));
        // movement stops:
        assert!(!vs.update(Some(frustum_at(200.0)), lod));
        assert!(vs.just_stopped_changing());
        assert!(!vs.update(Some(frustum_at(200.0)), lod));
        assert!(!vs.just_stopped_changing());
    }

    #[test]
    fn missing_frustum_reports_unchanged() {
        let mut vs = ViewState::default();
        assert!(!vs.update(None, LodParams::default()));
        assert!(!vs.just_stopped_changing());
    }

    #[test]
    fn force_full_scene_is_consumed() {
        let mut vs = ViewState::default();
        vs.set_force_full_scene();
        assert!(vs.should_force_full_scene());
        assert!(!vs.should_force_full_scene());
    }
}
