//! Typed joint constraints.
//!
//! A [`Joint`] is a tagged variant over seven constraint kinds. Each
//! variant knows how to (a) declare which links and lanes it touches
//! ([`Joint::fill_sparsity`]), (b) write its rows into the block Jacobian
//! ([`Joint::fill_jacobian`]), and (c) compute its current position and
//! velocity error ([`Joint::calculate_errors`]), which folds each row's
//! [`Spring`] into gamma/bias via the row writer.
//!
//! Link references are `Option<usize>`: `None` anchors the joint to the
//! world. Every variant occupies three consecutive rows of the global
//! constraint vector; the row offset is assigned once at allocation and
//! never changes for the life of the topology.
//!
//! Disabled (free-spring) axes still occupy their rows: the Jacobian entry
//! is scaled to zero and the spring contributes an identity CFM term, so
//! the row cancels without changing the sparsity plan.

use nalgebra::{UnitQuaternion, Vector3};

use crate::jacobian::skew;
use crate::solver::RowWriter;
use crate::{SolverContext, Spring};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How an angular joint's target rotation is interpreted relative to the
/// connected (parent) link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RotationTargetMode {
    /// Target in the joint's own rigged frame:
    /// `parent.rotation * rigged_offset * target`.
    #[default]
    SelfOffset,
    /// Target in the connected body's frame, applied before the rigged
    /// offset: `parent.rotation * target * rigged_offset`.
    ParentOffset,
    /// Target relative to the parent, no rigged offset:
    /// `parent.rotation * target`.
    Relative,
    /// World-space target, damping still acts on the joint's relative
    /// velocity.
    AbsolutePosRelativeVel,
    /// World-space target with the damper between the body and the world;
    /// the connected link's angular velocity feeds back into the velocity
    /// target.
    Absolute,
}

/// Constrains the relative orientation of two links (all three axes share
/// one spring).
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AngularJoint {
    /// Spring shared by the three angular rows.
    pub spring: Spring,
    /// Parent link; `None` means the world frame.
    pub connected: Option<usize>,
    /// Constrained link.
    pub link: Option<usize>,
    /// Rigged rest rotation relative to the connected link.
    pub connected_rotation: UnitQuaternion<f64>,
    /// Target rotation, interpreted per `mode`.
    pub target_rotation: UnitQuaternion<f64>,
    /// Target angular velocity.
    pub target_velocity: Vector3<f64>,
    /// Target interpretation mode.
    pub mode: RotationTargetMode,
    /// In `Absolute` mode, how much of the parent's angular velocity is
    /// ignored by the damper (0 = damp against the parent, 1 = damp
    /// against the world).
    pub relative_vel_influence: f64,
}

impl AngularJoint {
    /// Joint driving `link` toward its rigged orientation on `connected`.
    #[must_use]
    pub fn new(link: Option<usize>, connected: Option<usize>) -> Self {
        Self {
            spring: Spring::free(),
            connected,
            link,
            connected_rotation: UnitQuaternion::identity(),
            target_rotation: UnitQuaternion::identity(),
            target_velocity: Vector3::zeros(),
            mode: RotationTargetMode::SelfOffset,
            relative_vel_influence: 0.0,
        }
    }

    fn fill_sparsity(&self, w: &mut RowWriter<'_>, row: usize) {
        if let Some(l) = self.connected {
            w.mark(row, 3, l, true, false);
        }
        if let Some(l) = self.link {
            w.mark(row, 3, l, true, false);
        }
    }

    fn fill_jacobian<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, _ctx: &C, row: usize) {
        let j = if self.spring.is_free() { 0.0 } else { 1.0 };
        if let Some(l) = self.connected {
            w.write_diagonal(row, l, 0, &Vector3::new(-j, -j, -j));
        }
        if let Some(l) = self.link {
            w.write_diagonal(row, l, 0, &Vector3::new(j, j, j));
        }
    }

    fn calculate_errors<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        let (err, vel_err) = angular_error(
            ctx,
            self.connected,
            self.link,
            &self.connected_rotation,
            &self.target_rotation,
            &self.target_velocity,
            self.mode,
            self.relative_vel_influence,
        );
        w.write_error3(row, [&self.spring; 3], &err, &vel_err);
    }
}

/// Constrains relative orientation along three explicit axes, each with
/// its own spring. Stiff axes and a free axis make a hinge.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Angular3Joint {
    /// Spring of the X axis row.
    pub spring_x: Spring,
    /// Spring of the Y axis row.
    pub spring_y: Spring,
    /// Spring of the Z axis row.
    pub spring_z: Spring,
    /// Parent link; `None` means the world frame.
    pub connected: Option<usize>,
    /// Constrained link.
    pub link: Option<usize>,
    /// Rigged rest rotation relative to the connected link.
    pub connected_rotation: UnitQuaternion<f64>,
    /// Target rotation, interpreted per `mode`.
    pub target_rotation: UnitQuaternion<f64>,
    /// Target angular velocity.
    pub target_velocity: Vector3<f64>,
    /// Target interpretation mode.
    pub mode: RotationTargetMode,
    /// See [`AngularJoint::relative_vel_influence`].
    pub relative_vel_influence: f64,
    /// Constraint axis X, in the link frame unless `world_axes`.
    pub axis_x: Vector3<f64>,
    /// Constraint axis Y.
    pub axis_y: Vector3<f64>,
    /// Constraint axis Z.
    pub axis_z: Vector3<f64>,
    /// Interpret the axes as world-space directions.
    pub world_axes: bool,
    world_x: Vector3<f64>,
    world_y: Vector3<f64>,
    world_z: Vector3<f64>,
}

impl Angular3Joint {
    /// Per-axis angular joint with the given axes.
    #[must_use]
    pub fn new(
        link: Option<usize>,
        connected: Option<usize>,
        axis_x: Vector3<f64>,
        axis_y: Vector3<f64>,
        axis_z: Vector3<f64>,
    ) -> Self {
        Self {
            spring_x: Spring::free(),
            spring_y: Spring::free(),
            spring_z: Spring::free(),
            connected,
            link,
            connected_rotation: UnitQuaternion::identity(),
            target_rotation: UnitQuaternion::identity(),
            target_velocity: Vector3::zeros(),
            mode: RotationTargetMode::SelfOffset,
            relative_vel_influence: 0.0,
            axis_x,
            axis_y,
            axis_z,
            world_axes: false,
            world_x: axis_x,
            world_y: axis_y,
            world_z: axis_z,
        }
    }

    /// Hinge about `axis_x`: the two perpendicular axes are rigid, the
    /// hinge axis free until a drive spring is set.
    #[must_use]
    pub fn hinge(
        link: Option<usize>,
        connected: Option<usize>,
        axis_x: Vector3<f64>,
        axis_y: Vector3<f64>,
        axis_z: Vector3<f64>,
    ) -> Self {
        let mut joint = Self::new(link, connected, axis_x, axis_y, axis_z);
        joint.spring_y = Spring::stiff();
        joint.spring_z = Spring::stiff();
        joint
    }

    /// Set the same spring on all three axes.
    pub fn set_spring(&mut self, spring: Spring) {
        self.spring_x = spring;
        self.spring_y = spring;
        self.spring_z = spring;
    }

    fn fill_sparsity(&self, w: &mut RowWriter<'_>, row: usize) {
        if let Some(l) = self.connected {
            w.mark(row, 3, l, true, false);
        }
        if let Some(l) = self.link {
            w.mark(row, 3, l, true, false);
        }
    }

    fn fill_jacobian<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        ortho_normalize(&mut self.axis_x, &mut self.axis_y, &mut self.axis_z);
        if self.world_axes {
            self.world_x = self.axis_x;
            self.world_y = self.axis_y;
            self.world_z = self.axis_z;
        } else {
            let rot = self
                .link
                .map_or_else(UnitQuaternion::identity, |l| ctx.body(l).pose.rotation);
            self.world_x = rot * self.axis_x;
            self.world_y = rot * self.axis_y;
            self.world_z = rot * self.axis_z;
        }
        let jx = if self.spring_x.is_free() { 0.0 } else { 1.0 };
        let jy = if self.spring_y.is_free() { 0.0 } else { 1.0 };
        let jz = if self.spring_z.is_free() { 0.0 } else { 1.0 };
        if let Some(l) = self.connected {
            w.write_row(row, l, 0, &(-self.world_x * jx));
            w.write_row(row + 1, l, 0, &(-self.world_y * jy));
            w.write_row(row + 2, l, 0, &(-self.world_z * jz));
        }
        if let Some(l) = self.link {
            w.write_row(row, l, 0, &(self.world_x * jx));
            w.write_row(row + 1, l, 0, &(self.world_y * jy));
            w.write_row(row + 2, l, 0, &(self.world_z * jz));
        }
    }

    fn calculate_errors<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        let (err, vel_err) = angular_error(
            ctx,
            self.connected,
            self.link,
            &self.connected_rotation,
            &self.target_rotation,
            &self.target_velocity,
            self.mode,
            self.relative_vel_influence,
        );
        w.write_error(row, &self.spring_x, err.dot(&self.world_x), vel_err.dot(&self.world_x));
        w.write_error(
            row + 1,
            &self.spring_y,
            err.dot(&self.world_y),
            vel_err.dot(&self.world_y),
        );
        w.write_error(
            row + 2,
            &self.spring_z,
            err.dot(&self.world_z),
            vel_err.dot(&self.world_z),
        );
    }
}

/// Pins an anchor on one link to an anchor on another (or to a world
/// point). One spring for all three rows.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinearJoint {
    /// Spring shared by the three linear rows.
    pub spring: Spring,
    /// Parent link; `None` means `connected_anchor` is a world point.
    pub connected: Option<usize>,
    /// Constrained link; `None` means `anchor` is a world point.
    pub link: Option<usize>,
    /// Anchor in the connected link's frame.
    pub connected_anchor: Vector3<f64>,
    /// Anchor in the constrained link's frame.
    pub anchor: Vector3<f64>,
    /// Target offset of the anchors.
    pub target_position: Vector3<f64>,
    /// Target relative velocity.
    pub target_velocity: Vector3<f64>,
}

impl LinearJoint {
    /// Rigid pin between two anchors.
    #[must_use]
    pub fn rigid(
        link: Option<usize>,
        connected: Option<usize>,
        anchor: Vector3<f64>,
        connected_anchor: Vector3<f64>,
    ) -> Self {
        Self {
            spring: Spring::stiff(),
            connected,
            link,
            connected_anchor,
            anchor,
            target_position: Vector3::zeros(),
            target_velocity: Vector3::zeros(),
        }
    }

    fn fill_sparsity(&self, w: &mut RowWriter<'_>, row: usize) {
        if let Some(l) = self.connected {
            w.mark(row, 3, l, true, true);
        }
        if let Some(l) = self.link {
            w.mark(row, 3, l, true, true);
        }
    }

    fn fill_jacobian<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        let j = if self.spring.is_free() { 0.0 } else { 1.0 };
        if let Some(l) = self.connected {
            let r_a = ctx.transform_direction(Some(l), &self.connected_anchor);
            w.write_matrix(row, l, 0, &skew(&(r_a * j)));
            w.write_diagonal(row, l, 1, &Vector3::new(-j, -j, -j));
        }
        if let Some(l) = self.link {
            let r_b = ctx.transform_direction(Some(l), &self.anchor);
            w.write_matrix(row, l, 0, &(-skew(&(r_b * j))));
            w.write_diagonal(row, l, 1, &Vector3::new(j, j, j));
        }
    }

    fn calculate_errors<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        let (err, vel_err) = linear_error(
            ctx,
            self.connected,
            &self.connected_anchor,
            self.link,
            &self.anchor,
            &self.target_position,
            &self.target_velocity,
        );
        w.write_error3(row, [&self.spring; 3], &err, &vel_err);
    }
}

/// Like [`LinearJoint`] but constrained along three explicit axes with
/// independent springs (a prismatic rail when one axis is free).
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Linear3Joint {
    /// Spring of the X axis row.
    pub spring_x: Spring,
    /// Spring of the Y axis row.
    pub spring_y: Spring,
    /// Spring of the Z axis row.
    pub spring_z: Spring,
    /// Parent link; `None` means `connected_anchor` is a world point.
    pub connected: Option<usize>,
    /// Constrained link.
    pub link: Option<usize>,
    /// Anchor in the connected link's frame.
    pub connected_anchor: Vector3<f64>,
    /// Anchor in the constrained link's frame.
    pub anchor: Vector3<f64>,
    /// Target offset of the anchors.
    pub target_position: Vector3<f64>,
    /// Target relative velocity.
    pub target_velocity: Vector3<f64>,
    /// Constraint axis X (world space).
    pub axis_x: Vector3<f64>,
    /// Constraint axis Y.
    pub axis_y: Vector3<f64>,
    /// Constraint axis Z.
    pub axis_z: Vector3<f64>,
    /// Measure the connected link's lever arm at its own anchor instead of
    /// at the constrained link's anchor.
    pub feedback_at_connected_anchor: bool,
}

impl Linear3Joint {
    /// Axis-aligned linear joint with free springs.
    #[must_use]
    pub fn new(link: Option<usize>, connected: Option<usize>) -> Self {
        Self {
            spring_x: Spring::free(),
            spring_y: Spring::free(),
            spring_z: Spring::free(),
            connected,
            link,
            connected_anchor: Vector3::zeros(),
            anchor: Vector3::zeros(),
            target_position: Vector3::zeros(),
            target_velocity: Vector3::zeros(),
            axis_x: Vector3::x(),
            axis_y: Vector3::y(),
            axis_z: Vector3::z(),
            feedback_at_connected_anchor: false,
        }
    }

    fn fill_sparsity(&self, w: &mut RowWriter<'_>, row: usize) {
        if let Some(l) = self.connected {
            w.mark(row, 3, l, true, true);
        }
        if let Some(l) = self.link {
            w.mark(row, 3, l, true, true);
        }
    }

    fn fill_jacobian<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        ortho_normalize(&mut self.axis_x, &mut self.axis_y, &mut self.axis_z);
        let jx = if self.spring_x.is_free() { 0.0 } else { 1.0 };
        let jy = if self.spring_y.is_free() { 0.0 } else { 1.0 };
        let jz = if self.spring_z.is_free() { 0.0 } else { 1.0 };

        if let Some(l) = self.connected {
            let r_a = if self.feedback_at_connected_anchor {
                ctx.transform_direction(Some(l), &self.connected_anchor)
            } else {
                ctx.transform_point(self.link, &self.anchor)
                    - ctx.transform_point(Some(l), &Vector3::zeros())
            };
            w.write_row(row, l, 0, &self.axis_x.cross(&(r_a * jx)));
            w.write_row(row + 1, l, 0, &self.axis_y.cross(&(r_a * jy)));
            w.write_row(row + 2, l, 0, &self.axis_z.cross(&(r_a * jz)));
            w.write_row(row, l, 1, &(-self.axis_x * jx));
            w.write_row(row + 1, l, 1, &(-self.axis_y * jy));
            w.write_row(row + 2, l, 1, &(-self.axis_z * jz));
        }
        if let Some(l) = self.link {
            let r_b = ctx.transform_direction(Some(l), &self.anchor);
            w.write_row(row, l, 0, &(-self.axis_x.cross(&(r_b * jx))));
            w.write_row(row + 1, l, 0, &(-self.axis_y.cross(&(r_b * jy))));
            w.write_row(row + 2, l, 0, &(-self.axis_z.cross(&(r_b * jz))));
            w.write_row(row, l, 1, &(self.axis_x * jx));
            w.write_row(row + 1, l, 1, &(self.axis_y * jy));
            w.write_row(row + 2, l, 1, &(self.axis_z * jz));
        }
    }

    fn calculate_errors<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        let (err, vel_err) = linear_error(
            ctx,
            self.connected,
            &self.connected_anchor,
            self.link,
            &self.anchor,
            &self.target_position,
            &self.target_velocity,
        );
        w.write_error(row, &self.spring_x, err.dot(&self.axis_x), vel_err.dot(&self.axis_x));
        w.write_error(
            row + 1,
            &self.spring_y,
            err.dot(&self.axis_y),
            vel_err.dot(&self.axis_y),
        );
        w.write_error(
            row + 2,
            &self.spring_z,
            err.dot(&self.axis_z),
            vel_err.dot(&self.axis_z),
        );
    }
}

/// Constrains one link's anchor to track the weighted average of up to
/// four other anchors - shared-load coupling, e.g. two arms jointly
/// carrying one point.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FulcrumJoint {
    /// Spring of the X row.
    pub spring_x: Spring,
    /// Spring of the Y row.
    pub spring_y: Spring,
    /// Spring of the Z row.
    pub spring_z: Spring,
    /// The tracked link; `None` means `anchor` is a world point.
    pub link: Option<usize>,
    /// Anchor on the tracked link.
    pub anchor: Vector3<f64>,
    /// Participant links; `None` entries with nonzero weight are fixed
    /// world points.
    pub links: [Option<usize>; 4],
    /// Participant weights, normalized by their sum.
    pub weights: [f64; 4],
    /// Participant anchors in their links' frames.
    pub anchors: [Vector3<f64>; 4],
    /// Target offset between the tracked anchor and the average.
    pub target_position: Vector3<f64>,
    total_weight: f64,
}

impl FulcrumJoint {
    /// Fulcrum with the given participants at weight 1; unused slots carry
    /// weight 0.
    #[must_use]
    pub fn new(
        link: Option<usize>,
        anchor: Vector3<f64>,
        participants: &[(Option<usize>, Vector3<f64>)],
    ) -> Self {
        debug_assert!(participants.len() <= 4);
        let mut links = [None; 4];
        let mut weights = [0.0; 4];
        let mut anchors = [Vector3::zeros(); 4];
        for (i, &(l, a)) in participants.iter().take(4).enumerate() {
            links[i] = l;
            weights[i] = 1.0;
            anchors[i] = a;
        }
        Self {
            spring_x: Spring::stiff(),
            spring_y: Spring::stiff(),
            spring_z: Spring::stiff(),
            link,
            anchor,
            links,
            weights,
            anchors,
            target_position: Vector3::zeros(),
            total_weight: 0.0,
        }
    }

    fn fill_sparsity(&self, w: &mut RowWriter<'_>, row: usize) {
        for l in self.links.iter().flatten() {
            w.mark(row, 3, *l, true, true);
        }
        if let Some(l) = self.link {
            w.mark(row, 3, l, true, true);
        }
    }

    fn fill_jacobian<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        self.total_weight = self.weights.iter().sum();

        let x = Vector3::x();
        let y = Vector3::y();
        let z = Vector3::z();
        let zero_weight = self.total_weight == 0.0;
        let mut jx = if self.spring_x.is_free() || zero_weight { 0.0 } else { 1.0 };
        let mut jy = if self.spring_y.is_free() || zero_weight { 0.0 } else { 1.0 };
        let mut jz = if self.spring_z.is_free() || zero_weight { 0.0 } else { 1.0 };

        if let Some(l) = self.link {
            let r_b = ctx.transform_direction(Some(l), &self.anchor);
            w.write_row(row, l, 0, &(-x.cross(&(r_b * jx))));
            w.write_row(row + 1, l, 0, &(-y.cross(&(r_b * jy))));
            w.write_row(row + 2, l, 0, &(-z.cross(&(r_b * jz))));
            w.write_row(row, l, 1, &(x * jx));
            w.write_row(row + 1, l, 1, &(y * jy));
            w.write_row(row + 2, l, 1, &(z * jz));
        }
        if self.total_weight > 0.0 {
            jx /= self.total_weight;
            jy /= self.total_weight;
            jz /= self.total_weight;
        }
        for i in 0..4 {
            let weight = self.weights[i];
            if let Some(l) = self.links[i] {
                let r_a = ctx.transform_direction(Some(l), &self.anchors[i]);
                w.write_row(row, l, 0, &x.cross(&(r_a * jx * weight)));
                w.write_row(row + 1, l, 0, &y.cross(&(r_a * jy * weight)));
                w.write_row(row + 2, l, 0, &z.cross(&(r_a * jz * weight)));
                w.write_row(row, l, 1, &(-x * jx * weight));
                w.write_row(row + 1, l, 1, &(-y * jy * weight));
                w.write_row(row + 2, l, 1, &(-z * jz * weight));
            }
        }
    }

    fn calculate_errors<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        let mut err = Vector3::zeros();
        let vel_err = Vector3::zeros();
        if self.total_weight > 0.0 {
            err = ctx.transform_point(self.link, &self.anchor);
            for i in 0..4 {
                let weight = self.weights[i];
                if weight > 0.0 {
                    err -= ctx.transform_point(self.links[i], &self.anchors[i]) * weight
                        / self.total_weight;
                }
            }
            err -= self.target_position;
        }

        let fade = self.total_weight.clamp(0.0, 1.0);
        w.write_error(row, &(self.spring_x * fade), err.x, vel_err.x);
        w.write_error(row + 1, &(self.spring_y * fade), err.y, vel_err.y);
        w.write_error(row + 2, &(self.spring_z * fade), err.z, vel_err.z);
    }
}

/// Maximum link count of a center-of-gravity joint.
const CG_MAX_LINKS: usize = 12;

/// Ties the mass-weighted average position of a link range (plus optional
/// external point-mass attachments) to a target.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CgJoint {
    /// Spring shared by the X and Z rows.
    pub spring: Spring,
    /// Spring of the Y (vertical) row.
    pub spring_y: Spring,
    /// Reference link the average is measured against; `None` measures in
    /// world space.
    pub connected: Option<usize>,
    /// First link of the averaged range.
    pub link_start: usize,
    /// Number of links in the range (at most [`CG_MAX_LINKS`]).
    pub link_count: usize,
    /// Target position of the averaged center.
    pub target_position: Vector3<f64>,
    /// First external attachment position (world space).
    pub attachment1_pos: Vector3<f64>,
    /// First external attachment mass.
    pub attachment1_mass: f64,
    /// Second external attachment position (world space).
    pub attachment2_pos: Vector3<f64>,
    /// Second external attachment mass.
    pub attachment2_mass: f64,
    /// Per-link weights on top of the mass weighting.
    pub weights: [f64; CG_MAX_LINKS],
    total_weight: f64,
}

impl CgJoint {
    /// Center-of-gravity joint over `link_start..=link_end`, relative to
    /// `connected`.
    #[must_use]
    pub fn new(link_start: usize, link_end: usize, connected: Option<usize>) -> Self {
        let link_count = link_end - link_start + 1;
        debug_assert!(link_count <= CG_MAX_LINKS, "CG joint supports at most 12 links");
        Self {
            spring: Spring::free(),
            spring_y: Spring::free(),
            connected,
            link_start,
            link_count,
            target_position: Vector3::zeros(),
            attachment1_pos: Vector3::zeros(),
            attachment1_mass: 0.0,
            attachment2_pos: Vector3::zeros(),
            attachment2_mass: 0.0,
            weights: [1.0; CG_MAX_LINKS],
            total_weight: 0.0,
        }
    }

    fn fill_sparsity(&self, w: &mut RowWriter<'_>, row: usize) {
        for i in 0..self.link_count {
            w.mark(row, 3, self.link_start + i, false, true);
        }
        if let Some(l) = self.connected {
            w.mark(row, 3, l, false, true);
        }
    }

    fn fill_jacobian<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        self.total_weight = 0.0;
        for i in 0..self.link_count {
            self.total_weight += self.weights[i] * ctx.body(self.link_start + i).mass;
        }

        let zero_weight = self.total_weight == 0.0;
        let mut j = if self.spring.is_free() || zero_weight { 0.0 } else { 1.0 };
        let mut jy = if self.spring_y.is_free() || zero_weight { 0.0 } else { 1.0 };

        if let Some(l) = self.connected {
            w.write_row(row, l, 1, &Vector3::new(-j, 0.0, 0.0));
            w.write_row(row + 1, l, 1, &Vector3::new(0.0, -jy, 0.0));
            w.write_row(row + 2, l, 1, &Vector3::new(0.0, 0.0, -j));
        }
        if self.total_weight > 0.0 {
            j /= self.total_weight;
            jy /= self.total_weight;
        }
        for i in 0..self.link_count {
            let l = self.link_start + i;
            let m = ctx.body(l).mass * self.weights[i];
            w.write_row(row, l, 1, &Vector3::new(m * j, 0.0, 0.0));
            w.write_row(row + 1, l, 1, &Vector3::new(0.0, m * jy, 0.0));
            w.write_row(row + 2, l, 1, &Vector3::new(0.0, 0.0, m * j));
        }
    }

    fn calculate_errors<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        let mut total_mass = self.total_weight + self.attachment1_mass + self.attachment2_mass;
        if total_mass == 0.0 {
            total_mass = 1.0;
        }
        let mut err = self.attachment1_pos * self.attachment1_mass / total_mass
            + self.attachment2_pos * self.attachment2_mass / total_mass;
        for i in 0..self.link_count {
            let l = self.link_start + i;
            let body = ctx.body(l);
            let m = body.mass * self.weights[i];
            err += body.pose.position.coords * m / total_mass;
        }
        if let Some(l) = self.connected {
            err -= ctx.body(l).pose.position.coords;
        }
        err -= self.target_position;

        w.write_error(row, &self.spring, err.x, 0.0);
        w.write_error(row + 1, &self.spring_y, err.y, 0.0);
        w.write_error(row + 2, &self.spring, err.z, 0.0);
    }
}

/// Constrains the net angular momentum of a link range about its
/// instantaneous center of mass, keeping the solve from pumping
/// unphysical spin into the character.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PreserveAngularJoint {
    /// Spring shared by the three momentum rows.
    pub spring: Spring,
    /// First link of the range.
    pub link_start: usize,
    /// Number of links in the range.
    pub link_count: usize,
    center: Vector3<f64>,
}

impl PreserveAngularJoint {
    /// Momentum constraint over `link_start..=link_end`.
    #[must_use]
    pub fn new(link_start: usize, link_end: usize) -> Self {
        Self {
            spring: Spring::free(),
            link_start,
            link_count: link_end - link_start + 1,
            center: Vector3::zeros(),
        }
    }

    fn fill_sparsity(&self, w: &mut RowWriter<'_>, row: usize) {
        for i in 0..self.link_count {
            w.mark(row, 3, self.link_start + i, true, true);
        }
    }

    fn fill_jacobian<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        let j = if self.spring.is_free() { 0.0 } else { 1.0 };
        self.center = ctx.center_of_mass(self.link_start, self.link_count);

        for i in 0..self.link_count {
            let l = self.link_start + i;
            let body = ctx.body(l);
            let r = body.pose.position.coords - self.center;
            w.write_matrix(row, l, 0, &(body.inertia.to_matrix() * j));
            w.write_matrix(row, l, 1, &(skew(&r) * body.mass * j));
        }
    }

    fn calculate_errors<C: SolverContext>(&mut self, w: &mut RowWriter<'_>, ctx: &C, row: usize) {
        let mut momentum = Vector3::zeros();
        for i in 0..self.link_count {
            let l = self.link_start + i;
            let body = ctx.body(l);
            let r = body.pose.position.coords - self.center;
            let v = ctx.twist(l);
            momentum +=
                body.inertia.mul_vec(&v.angular) + r.cross(&(v.linear * body.mass));
        }
        if self.spring.is_free() {
            momentum = Vector3::zeros();
        }
        // Zero positional error with the current momentum as the velocity
        // target: the row holds the momentum constant through the solve
        // instead of driving it anywhere.
        w.write_error3(row, [&self.spring; 3], &Vector3::zeros(), &-momentum);
    }
}

/// A typed joint constraint: exactly one variant is active, dispatched
/// through a single match in each of the three solver-facing operations.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Joint {
    /// Relative orientation, one spring.
    Angular(AngularJoint),
    /// Relative orientation along explicit axes.
    Angular3(Angular3Joint),
    /// Anchor-to-anchor pin.
    Linear(LinearJoint),
    /// Anchor-to-anchor along explicit axes.
    Linear3(Linear3Joint),
    /// Weighted center of gravity.
    CenterOfGravity(CgJoint),
    /// Net angular momentum preservation.
    PreserveAngularMomentum(PreserveAngularJoint),
    /// Weighted multi-link average tracking.
    Fulcrum(FulcrumJoint),
}

impl Joint {
    /// Rows this joint occupies in the global constraint vector.
    #[must_use]
    pub fn row_count(&self) -> usize {
        match self {
            Joint::Angular(_)
            | Joint::Angular3(_)
            | Joint::Linear(_)
            | Joint::Linear3(_)
            | Joint::CenterOfGravity(_)
            | Joint::PreserveAngularMomentum(_)
            | Joint::Fulcrum(_) => 3,
        }
    }

    /// Every link index this joint references (for allocation-time
    /// validation).
    pub(crate) fn referenced_links(&self) -> Vec<usize> {
        let mut out = Vec::new();
        match self {
            Joint::Angular(j) => out.extend(j.connected.iter().chain(j.link.iter())),
            Joint::Angular3(j) => out.extend(j.connected.iter().chain(j.link.iter())),
            Joint::Linear(j) => out.extend(j.connected.iter().chain(j.link.iter())),
            Joint::Linear3(j) => out.extend(j.connected.iter().chain(j.link.iter())),
            Joint::CenterOfGravity(j) => {
                out.extend(j.connected.iter());
                out.extend(j.link_start..j.link_start + j.link_count);
            }
            Joint::PreserveAngularMomentum(j) => {
                out.extend(j.link_start..j.link_start + j.link_count);
            }
            Joint::Fulcrum(j) => {
                out.extend(j.link.iter());
                out.extend(j.links.iter().flatten());
            }
        }
        out
    }

    pub(crate) fn fill_sparsity(&self, w: &mut RowWriter<'_>, row: usize) {
        match self {
            Joint::Angular(j) => j.fill_sparsity(w, row),
            Joint::Angular3(j) => j.fill_sparsity(w, row),
            Joint::Linear(j) => j.fill_sparsity(w, row),
            Joint::Linear3(j) => j.fill_sparsity(w, row),
            Joint::CenterOfGravity(j) => j.fill_sparsity(w, row),
            Joint::PreserveAngularMomentum(j) => j.fill_sparsity(w, row),
            Joint::Fulcrum(j) => j.fill_sparsity(w, row),
        }
    }

    pub(crate) fn fill_jacobian<C: SolverContext>(
        &mut self,
        w: &mut RowWriter<'_>,
        ctx: &C,
        row: usize,
    ) {
        match self {
            Joint::Angular(j) => j.fill_jacobian(w, ctx, row),
            Joint::Angular3(j) => j.fill_jacobian(w, ctx, row),
            Joint::Linear(j) => j.fill_jacobian(w, ctx, row),
            Joint::Linear3(j) => j.fill_jacobian(w, ctx, row),
            Joint::CenterOfGravity(j) => j.fill_jacobian(w, ctx, row),
            Joint::PreserveAngularMomentum(j) => j.fill_jacobian(w, ctx, row),
            Joint::Fulcrum(j) => j.fill_jacobian(w, ctx, row),
        }
    }

    pub(crate) fn calculate_errors<C: SolverContext>(
        &mut self,
        w: &mut RowWriter<'_>,
        ctx: &C,
        row: usize,
    ) {
        match self {
            Joint::Angular(j) => j.calculate_errors(w, ctx, row),
            Joint::Angular3(j) => j.calculate_errors(w, ctx, row),
            Joint::Linear(j) => j.calculate_errors(w, ctx, row),
            Joint::Linear3(j) => j.calculate_errors(w, ctx, row),
            Joint::CenterOfGravity(j) => j.calculate_errors(w, ctx, row),
            Joint::PreserveAngularMomentum(j) => j.calculate_errors(w, ctx, row),
            Joint::Fulcrum(j) => j.calculate_errors(w, ctx, row),
        }
    }
}

/// Positional and velocity error of an anchor pair.
fn linear_error<C: SolverContext>(
    ctx: &C,
    connected: Option<usize>,
    connected_anchor: &Vector3<f64>,
    link: Option<usize>,
    anchor: &Vector3<f64>,
    target_position: &Vector3<f64>,
    target_velocity: &Vector3<f64>,
) -> (Vector3<f64>, Vector3<f64>) {
    let err = ctx.transform_point(link, anchor) - ctx.transform_point(connected, connected_anchor)
        - target_position;
    (err, -target_velocity)
}

/// Rotational and velocity error of an orientation target under the given
/// target mode.
#[allow(clippy::too_many_arguments)]
fn angular_error<C: SolverContext>(
    ctx: &C,
    connected: Option<usize>,
    link: Option<usize>,
    connected_rotation: &UnitQuaternion<f64>,
    target_rotation: &UnitQuaternion<f64>,
    target_velocity: &Vector3<f64>,
    mode: RotationTargetMode,
    relative_vel_influence: f64,
) -> (Vector3<f64>, Vector3<f64>) {
    use RotationTargetMode::{Absolute, AbsolutePosRelativeVel, ParentOffset, Relative, SelfOffset};

    let parent_rot = match (mode, connected) {
        (Absolute | AbsolutePosRelativeVel, _) | (_, None) => UnitQuaternion::identity(),
        (_, Some(l)) => ctx.body(l).pose.rotation,
    };
    let world_target = match mode {
        Absolute | AbsolutePosRelativeVel => *target_rotation,
        Relative => parent_rot * target_rotation,
        ParentOffset => parent_rot * target_rotation * connected_rotation,
        SelfOffset => parent_rot * connected_rotation * target_rotation,
    };
    let err = match link {
        Some(l) => angle_axis(&(ctx.body(l).pose.rotation * world_target.inverse())),
        None => angle_axis(&world_target.inverse()),
    };

    let world_target_vel = match mode {
        Absolute => match connected {
            // Relative to the world, the damper target absorbs (part of)
            // the parent's spin so the joint does not fight it.
            Some(l) => {
                *target_velocity - (1.0 - relative_vel_influence) * ctx.twist(l).angular
            }
            None => *target_velocity,
        },
        AbsolutePosRelativeVel => *target_velocity,
        Relative | ParentOffset => parent_rot * target_velocity,
        SelfOffset => parent_rot * (connected_rotation * target_velocity),
    };
    (err, -world_target_vel)
}

/// Shortest-arc angle*axis of a rotation.
fn angle_axis(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let mut q = q.into_inner();
    if q.w < 0.0 {
        q = -q;
    }
    let w = q.w.min(1.0);
    let angle = 2.0 * w.acos();
    let s = (1.0 - w * w).sqrt();
    if s < 1e-7 {
        q.imag()
    } else {
        q.imag() / s * angle
    }
}

/// Gram-Schmidt with a right-handed third axis.
fn ortho_normalize(x: &mut Vector3<f64>, y: &mut Vector3<f64>, z: &mut Vector3<f64>) {
    *x = x.normalize();
    *y = (*y - *x * x.dot(y)).normalize();
    *z = x.cross(y);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::extract_lanes;
    use crate::{ArticulationContext, Solver};
    use armature_types::{Body, MassProperties, Pose, Twist};
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    const H: f64 = 1.0 / 50.0;

    fn sphere_at(x: f64) -> Body {
        Body::new(
            MassProperties::sphere(1.0, 0.5),
            Pose::from_position(Point3::new(x, 0.0, 0.0)),
        )
    }

    /// Build, then run one no-bias iteration over scratch velocities.
    fn solve_once(solver: &mut Solver, bodies: &mut [Body]) {
        let links: Vec<usize> = solver.links().to_vec();
        let mut v = extract_lanes(bodies, &links);
        {
            let ctx = ArticulationContext::new(bodies, &links, &mut v);
            solver.build_jacobians(&ctx);
        }
        {
            let mut ctx = ArticulationContext::new(bodies, &links, &mut v);
            solver.velocity_iteration_no_bias(&mut ctx);
        }
        crate::context::write_back_lanes(bodies, &links, &v);
    }

    #[test]
    fn hinge_keeps_only_its_axis() {
        let mut bodies = vec![sphere_at(0.0)];
        bodies[0].twist = Twist::angular(Vector3::new(1.0, 2.0, 3.0));
        let hinge = Angular3Joint::hinge(
            Some(0),
            None,
            Vector3::x(),
            Vector3::y(),
            Vector3::z(),
        );
        let mut solver = Solver::new(vec![0], vec![Joint::Angular3(hinge)], H).unwrap();
        solve_once(&mut solver, &mut bodies);

        let w = bodies[0].twist.angular;
        assert_relative_eq!(w.x, 1.0, epsilon = 1e-6);
        assert!(w.y.abs() < 1e-6, "stiff axis leaked {}", w.y);
        assert!(w.z.abs() < 1e-6, "stiff axis leaked {}", w.z);
    }

    #[test]
    fn fulcrum_pulls_link_toward_weighted_average() {
        let mut bodies = vec![sphere_at(0.0)];
        // Two fixed world points; their average sits at (0, 0, 1).
        let mut fulcrum = FulcrumJoint::new(
            Some(0),
            Vector3::zeros(),
            &[
                (None, Vector3::new(1.0, 0.0, 1.0)),
                (None, Vector3::new(-1.0, 0.0, 1.0)),
            ],
        );
        let soft = Spring::new(100.0, 10.0);
        fulcrum.spring_x = soft;
        fulcrum.spring_y = soft;
        fulcrum.spring_z = soft;
        let mut solver = Solver::new(vec![0], vec![Joint::Fulcrum(fulcrum)], H).unwrap();
        solve_once(&mut solver, &mut bodies);

        let v = bodies[0].twist.linear;
        assert!(v.z > 1e-4, "no pull toward the average: {v:?}");
        assert!(v.x.abs() < 1e-9);
    }

    #[test]
    fn cg_joint_drives_center_of_mass_to_target() {
        let mut bodies = vec![sphere_at(0.0), sphere_at(1.0)];
        // Combined CoM is at x = 0.5; target is x = 0.2.
        let mut cg = CgJoint::new(0, 1, None);
        cg.spring = Spring::new(100.0, 10.0);
        cg.spring_y = Spring::new(100.0, 10.0);
        cg.target_position = Vector3::new(0.2, 0.0, 0.0);
        let mut solver = Solver::new(vec![0, 1], vec![Joint::CenterOfGravity(cg)], H).unwrap();
        solve_once(&mut solver, &mut bodies);

        assert!(bodies[0].twist.linear.x < -1e-4);
        assert!(bodies[1].twist.linear.x < -1e-4);
    }

    #[test]
    fn preserve_angular_momentum_row_is_neutral_alone() {
        // With nothing else pushing, the momentum rows see exactly the
        // momentum they are preserving and produce no correction.
        let mut bodies = vec![sphere_at(0.0), sphere_at(1.0)];
        bodies[0].twist = Twist::new(Vector3::new(0.3, -0.1, 0.0), Vector3::new(0.0, 0.5, 0.0));
        bodies[1].twist = Twist::new(Vector3::new(0.0, 0.2, 0.1), Vector3::new(0.0, -0.5, 0.0));
        let before = [bodies[0].twist, bodies[1].twist];

        let mut preserve = PreserveAngularJoint::new(0, 1);
        preserve.spring = Spring::stiff();
        let mut solver = Solver::new(
            vec![0, 1],
            vec![Joint::PreserveAngularMomentum(preserve)],
            H,
        )
        .unwrap();
        solve_once(&mut solver, &mut bodies);

        for (body, before) in bodies.iter().zip(before.iter()) {
            assert_relative_eq!(body.twist.angular, before.angular, epsilon = 1e-9);
            assert_relative_eq!(body.twist.linear, before.linear, epsilon = 1e-9);
        }
    }

    #[test]
    fn angle_axis_small_and_large() {
        let q = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.3);
        assert_relative_eq!(angle_axis(&q), Vector3::z() * 0.3, epsilon = 1e-10);

        // The long way around must come back as the short arc.
        let q = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 5.0);
        let aa = angle_axis(&q);
        assert!(aa.norm() < std::f64::consts::PI + 1e-9);
        assert_relative_eq!(
            aa,
            Vector3::z() * (5.0 - 2.0 * std::f64::consts::PI),
            epsilon = 1e-9
        );
    }

    #[test]
    fn ortho_normalize_right_handed() {
        let mut x = Vector3::new(2.0, 0.0, 0.0);
        let mut y = Vector3::new(0.4, 1.0, 0.0);
        let mut z = Vector3::new(0.0, 0.0, 9.0);
        ortho_normalize(&mut x, &mut y, &mut z);
        assert_relative_eq!(x.dot(&y), 0.0, epsilon = 1e-12);
        assert_relative_eq!(z, x.cross(&y), epsilon = 1e-12);
        assert_relative_eq!(x.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(y.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn referenced_links_cover_all_variants() {
        let j = Joint::Fulcrum(FulcrumJoint::new(
            Some(0),
            Vector3::zeros(),
            &[(Some(1), Vector3::zeros()), (Some(3), Vector3::zeros())],
        ));
        let mut links = j.referenced_links();
        links.sort_unstable();
        assert_eq!(links, vec![0, 1, 3]);

        let j = Joint::CenterOfGravity(CgJoint::new(1, 3, Some(0)));
        let mut links = j.referenced_links();
        links.sort_unstable();
        assert_eq!(links, vec![0, 1, 2, 3]);
    }
}
