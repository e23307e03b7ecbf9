//! Affine coordinate transforms and the device transform tree.
//!
//! Every positioning device and camera owns a [`TransformNode`] whose device
//! transform maps its local coordinates into its parent's frame. Composing the
//! chain up to the root yields the node's global transform, which is cached and
//! recomputed lazily after any ancestor changes.

use crate::error::{EphysError, Result};
use crate::signal::Signal;
use nalgebra::{Matrix4, Point3, Rotation3, Vector3};
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};

/// A point in 3D space, in meters.
pub type Position = [f64; 3];

/// Affine 3D transform backed by a homogeneous 4x4 matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3 {
    matrix: Matrix4<f64>,
}

impl Default for Transform3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    /// Wrap a homogeneous matrix.
    pub fn from_matrix(matrix: Matrix4<f64>) -> Self {
        Self { matrix }
    }

    /// Pure translation.
    pub fn from_offset(offset: Position) -> Self {
        Self {
            matrix: Matrix4::new_translation(&Vector3::from(offset)),
        }
    }

    /// Pure per-axis scale.
    pub fn from_scale(scale: Position) -> Self {
        Self {
            matrix: Matrix4::new_nonuniform_scaling(&Vector3::from(scale)),
        }
    }

    /// Scale, then rotate about z, then translate.
    pub fn from_parts(scale: Position, rotation_z: f64, offset: Position) -> Self {
        let rotation = Rotation3::from_axis_angle(&Vector3::z_axis(), rotation_z).to_homogeneous();
        let translation = Matrix4::new_translation(&Vector3::from(offset));
        let scaling = Matrix4::new_nonuniform_scaling(&Vector3::from(scale));
        Self {
            matrix: translation * rotation * scaling,
        }
    }

    /// The homogeneous matrix.
    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    /// Map a point.
    pub fn map(&self, point: Position) -> Position {
        let p = self.matrix.transform_point(&Point3::from(point));
        [p.x, p.y, p.z]
    }

    /// Map a direction (translation ignored).
    pub fn map_vector(&self, vector: Position) -> Position {
        let v = self.matrix.transform_vector(&Vector3::from(vector));
        [v.x, v.y, v.z]
    }

    /// Inverse transform. Singular transforms are rejected.
    pub fn inverse(&self) -> Result<Self> {
        self.matrix
            .try_inverse()
            .map(Self::from_matrix)
            .ok_or_else(|| EphysError::InvalidInput("transform is not invertible".into()))
    }

    /// Apply `self` first, then `outer`.
    pub fn then(&self, outer: &Transform3) -> Self {
        Self {
            matrix: outer.matrix * self.matrix,
        }
    }

    /// Compose a child transform under its parent (`parent * child`).
    pub fn compose(parent: &Transform3, child: &Transform3) -> Self {
        child.then(parent)
    }

    /// Length of each mapped unit axis.
    pub fn scale_factors(&self) -> Position {
        [
            self.matrix.fixed_view::<3, 1>(0, 0).norm(),
            self.matrix.fixed_view::<3, 1>(0, 1).norm(),
            self.matrix.fixed_view::<3, 1>(0, 2).norm(),
        ]
    }

    /// Translation part.
    pub fn offset(&self) -> Position {
        [self.matrix[(0, 3)], self.matrix[(1, 3)], self.matrix[(2, 3)]]
    }
}

struct NodeState {
    device_transform: Transform3,
    parent: Option<Arc<TransformNode>>,
    children: Vec<Weak<TransformNode>>,
    cached_global: Option<Transform3>,
    generation: u64,
}

/// One node in the device transform tree.
///
/// Shared as `Arc<TransformNode>`. Parents are held strongly, children weakly.
pub struct TransformNode {
    name: String,
    state: RwLock<NodeState>,
    transform_changed: Signal<()>,
}

impl fmt::Debug for TransformNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.read();
        f.debug_struct("TransformNode")
            .field("name", &self.name)
            .field("parent", &st.parent.as_ref().map(|p| p.name.clone()))
            .field("device_transform", &st.device_transform)
            .finish_non_exhaustive()
    }
}

impl TransformNode {
    /// A root node with an identity transform.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_transform(name, Transform3::identity())
    }

    /// A root node with the given device transform.
    pub fn with_transform(name: impl Into<String>, device_transform: Transform3) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            transform_changed: Signal::new(format!("{name}.transform_changed")),
            name,
            state: RwLock::new(NodeState {
                device_transform,
                parent: None,
                children: Vec::new(),
                cached_global: None,
                generation: 0,
            }),
        })
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current parent.
    pub fn parent(&self) -> Option<Arc<TransformNode>> {
        self.state.read().parent.clone()
    }

    /// Fired whenever this node's global transform is invalidated.
    pub fn transform_changed(&self) -> &Signal<()> {
        &self.transform_changed
    }

    /// Attach to `parent`, or detach with `None`. Cycles are rejected.
    pub fn set_parent(self: &Arc<Self>, parent: Option<&Arc<TransformNode>>) -> Result<()> {
        if let Some(parent) = parent {
            let mut cursor = Some(Arc::clone(parent));
            while let Some(node) = cursor {
                if Arc::ptr_eq(&node, self) {
                    return Err(EphysError::InvalidInput(format!(
                        "setting parent of '{}' to '{}' would create a cycle",
                        self.name, parent.name
                    )));
                }
                cursor = node.parent();
            }
        }

        let old = {
            let mut st = self.state.write();
            std::mem::replace(&mut st.parent, parent.cloned())
        };
        if let Some(old) = old {
            old.state
                .write()
                .children
                .retain(|c| c.upgrade().is_some_and(|c| !Arc::ptr_eq(&c, self)));
        }
        if let Some(parent) = parent {
            parent.state.write().children.push(Arc::downgrade(self));
        }
        self.invalidate();
        Ok(())
    }

    /// Transform from local coordinates to the parent frame.
    pub fn device_transform(&self) -> Transform3 {
        self.state.read().device_transform
    }

    /// Replace the device transform, invalidating this node and its descendants.
    pub fn set_device_transform(&self, transform: Transform3) {
        self.state.write().device_transform = transform;
        self.invalidate();
    }

    /// Local-to-global transform, cached until an ancestor changes.
    pub fn global_transform(&self) -> Transform3 {
        let (parent, device, generation) = {
            let st = self.state.read();
            if let Some(cached) = st.cached_global {
                return cached;
            }
            (st.parent.clone(), st.device_transform, st.generation)
        };
        let global = match parent {
            Some(parent) => Transform3::compose(&parent.global_transform(), &device),
            None => device,
        };
        let mut st = self.state.write();
        if st.generation == generation {
            st.cached_global = Some(global);
        }
        global
    }

    /// Map a local point to global coordinates.
    pub fn map_to_global(&self, point: Position) -> Position {
        self.global_transform().map(point)
    }

    /// Map a global point to local coordinates.
    pub fn map_from_global(&self, point: Position) -> Result<Position> {
        Ok(self.global_transform().inverse()?.map(point))
    }

    fn invalidate(&self) {
        let children: Vec<Arc<TransformNode>> = {
            let mut st = self.state.write();
            st.cached_global = None;
            st.generation = st.generation.wrapping_add(1);
            st.children.retain(|c| c.strong_count() > 0);
            st.children.iter().filter_map(Weak::upgrade).collect()
        };
        self.transform_changed.emit(&());
        for child in children {
            child.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn assert_pos_eq(a: Position, b: Position) {
        for i in 0..3 {
            assert_relative_eq!(a[i], b[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_from_parts_maps_points() {
        let t = Transform3::from_parts([2.0, 2.0, 1.0], std::f64::consts::FRAC_PI_2, [1.0, 0.0, 0.0]);
        assert_pos_eq(t.map([1.0, 0.0, 0.0]), [1.0, 2.0, 0.0]);
        assert_pos_eq(t.scale_factors(), [2.0, 2.0, 1.0]);
        assert_pos_eq(t.offset(), [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_inverse_round_trip_and_singular() {
        let t = Transform3::from_parts([1e-6, 1e-6, 1e-6], 0.3, [0.01, -0.02, 0.0]);
        let p = [3.0, 4.0, 5.0];
        assert_pos_eq(t.inverse().unwrap().map(t.map(p)), p);
        assert!(Transform3::from_scale([1.0, 0.0, 1.0]).inverse().is_err());
    }

    #[test]
    fn test_global_transform_composes_chain() {
        let root = TransformNode::with_transform("stage", Transform3::from_offset([1.0, 0.0, 0.0]));
        let child = TransformNode::with_transform("camera", Transform3::from_offset([0.0, 2.0, 0.0]));
        child.set_parent(Some(&root)).unwrap();

        assert_pos_eq(child.map_to_global([0.0, 0.0, 3.0]), [1.0, 2.0, 3.0]);
        assert_pos_eq(child.map_from_global([1.0, 2.0, 3.0]).unwrap(), [0.0, 0.0, 3.0]);
    }

    #[test]
    fn test_ancestor_change_invalidates_descendants() {
        let root = TransformNode::new("root");
        let mid = TransformNode::new("mid");
        let leaf = TransformNode::new("leaf");
        mid.set_parent(Some(&root)).unwrap();
        leaf.set_parent(Some(&mid)).unwrap();
        assert_pos_eq(leaf.map_to_global([0.0; 3]), [0.0; 3]);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        leaf.transform_changed().connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        root.set_device_transform(Transform3::from_offset([0.0, 0.0, 5.0]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_pos_eq(leaf.map_to_global([0.0; 3]), [0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_cycles_are_rejected() {
        let a = TransformNode::new("a");
        let b = TransformNode::new("b");
        b.set_parent(Some(&a)).unwrap();
        assert!(a.set_parent(Some(&b)).is_err());
        assert!(a.set_parent(Some(&a)).is_err());
    }

    #[test]
    fn test_reparent_detaches_from_old_parent() {
        let old = TransformNode::with_transform("old", Transform3::from_offset([1.0, 0.0, 0.0]));
        let new = TransformNode::with_transform("new", Transform3::from_offset([0.0, 1.0, 0.0]));
        let node = TransformNode::new("node");
        node.set_parent(Some(&old)).unwrap();
        node.set_parent(Some(&new)).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        node.transform_changed().connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        old.set_device_transform(Transform3::identity());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_pos_eq(node.map_to_global([0.0; 3]), [0.0, 1.0, 0.0]);
    }
}
