//! Per-articulation solve pipeline.
//!
//! A [`Solver`] is bound at allocation to a fixed link list and joint list.
//! Row offsets, block counts and every per-tick buffer are sized then;
//! only values change afterwards. The per-tick sequence is:
//!
//! 1. [`Solver::build_jacobians`] - every joint fills sparsity, Jacobian
//!    blocks and errors in row order; `WJT` is derived; the sparse plan is
//!    built on the first tick; `K = J W J^T + diag(gamma)` is assembled
//!    and factored; the running impulse resets to zero.
//! 2. [`Solver::velocity_iteration`] (N times) - recompute errors against
//!    current velocities, form `b = bias + gamma impulse + J v`, solve
//!    `K dl = b` on the factored blocks, apply `-W J^T dl` to every
//!    touched link, and accumulate the impulse for warm-starting the next
//!    round.
//!
//! The bias flavor subtracts the precomputed external-acceleration
//! velocity (gravity for one tick) before iterating and restores it after,
//! so nested solve passes do not double-count it.

use armature_types::{ArmatureError, ArticulatedInertia, Body, SymMat3, Twist, Wrench};
use nalgebra::{Matrix3, Vector3, Vector4};

use crate::context::extract_lanes;
use crate::{Jacobian, Joint, SolverContext, SparseLdl, Spring};

/// Write access to the Jacobian and the gamma/bias rows during the joint
/// fill phase. Splits the solver's buffers so joints can write while the
/// joint list itself is being iterated.
pub struct RowWriter<'a> {
    jacobian: &'a mut Jacobian,
    gamma: &'a mut [f64],
    bias: &'a mut [f64],
    h: f64,
}

impl RowWriter<'_> {
    /// Mark `n_rows` rows touching a link's angular and/or linear lanes.
    pub fn mark(&mut self, row: usize, n_rows: usize, link: usize, angular: bool, linear: bool) {
        self.jacobian.mark(row, n_rows, link, angular, linear);
    }

    /// Write one row of one lane.
    pub fn write_row(&mut self, row: usize, link: usize, off: usize, j: &Vector3<f64>) {
        self.jacobian.write_row(row, link, off, j);
    }

    /// Write a diagonal 3x3 starting at `row`.
    pub fn write_diagonal(&mut self, row: usize, link: usize, off: usize, d: &Vector3<f64>) {
        self.jacobian.write_diagonal(row, link, off, d);
    }

    /// Write a full 3x3 starting at `row`.
    pub fn write_matrix(&mut self, row: usize, link: usize, off: usize, m: &Matrix3<f64>) {
        self.jacobian.write_matrix(row, link, off, m);
    }

    /// Evaluate a spring against one row's error and store gamma/bias.
    pub fn write_error(&mut self, row: usize, spring: &Spring, err: f64, vel_err: f64) {
        let (gamma, bias) = spring.calculate(err, vel_err, self.h);
        self.gamma[row] = gamma;
        self.bias[row] = bias;
    }

    /// Evaluate three rows sharing an error vector.
    pub fn write_error3(
        &mut self,
        row: usize,
        springs: [&Spring; 3],
        err: &Vector3<f64>,
        vel_err: &Vector3<f64>,
    ) {
        for i in 0..3 {
            self.write_error(row + i, springs[i], err[i], vel_err[i]);
        }
    }
}

#[derive(Debug)]
struct JointSlot {
    row: usize,
    joint: Joint,
}

/// Constraint solver for one articulation: fixed topology, per-tick
/// numeric state.
#[derive(Debug)]
pub struct Solver {
    links: Vec<usize>,
    joints: Vec<JointSlot>,
    n_rows: usize,
    n_blocks: usize,
    n_body_blocks: usize,
    h: f64,
    /// Running impulse accumulator, scalar per row (4-padded).
    impulse: Vec<f64>,
    gamma: Vec<f64>,
    bias: Vec<f64>,
    /// Per-link external-acceleration velocity for this tick.
    bias_dv: Vec<Twist>,
    jacobian: Jacobian,
    ldl: Option<SparseLdl>,
}

impl Solver {
    /// Bind a solver to world body ids and a joint list.
    ///
    /// Row offsets are assigned here by summing the preceding joints' row
    /// counts and stay fixed for the life of the topology. All buffers are
    /// allocated here; the sparsity plan is built lazily on the first
    /// [`Solver::build_jacobians`].
    pub fn new(links: Vec<usize>, joints: Vec<Joint>, h: f64) -> Result<Self, ArmatureError> {
        if links.is_empty() {
            return Err(ArmatureError::EmptyArticulation);
        }
        if !(h > 0.0 && h.is_finite()) {
            return Err(ArmatureError::InvalidTimestep(h));
        }
        for (i, joint) in joints.iter().enumerate() {
            for link in joint.referenced_links() {
                if link >= links.len() {
                    return Err(ArmatureError::LinkOutOfRange {
                        joint: i,
                        link,
                        links: links.len(),
                    });
                }
            }
        }

        let mut n_rows = 0;
        let joints: Vec<JointSlot> = joints
            .into_iter()
            .map(|joint| {
                let slot = JointSlot { row: n_rows, joint };
                n_rows += slot.joint.row_count();
                slot
            })
            .collect();

        let n_blocks = (n_rows + 3) / 4;
        let n_body_blocks = links.len() * 2;
        let padded = n_blocks * 4;

        Ok(Self {
            jacobian: Jacobian::new(n_blocks, n_body_blocks),
            impulse: vec![0.0; padded],
            gamma: vec![0.0; padded],
            bias: vec![0.0; padded],
            bias_dv: vec![Twist::zero(); links.len()],
            links,
            joints,
            n_rows,
            n_blocks,
            n_body_blocks,
            h,
            ldl: None,
        })
    }

    /// World body ids of this articulation's links.
    #[must_use]
    pub fn links(&self) -> &[usize] {
        &self.links
    }

    /// Number of scalar constraint rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.n_rows
    }

    /// Tick length the solver was allocated with.
    #[must_use]
    pub fn timestep(&self) -> f64 {
        self.h
    }

    /// Number of joints.
    #[must_use]
    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    /// Read a joint.
    #[must_use]
    pub fn joint(&self, index: usize) -> &Joint {
        &self.joints[index].joint
    }

    /// Mutate a joint (targets and springs are updated by gameplay code
    /// every tick before [`Solver::build_jacobians`] runs). The topology -
    /// which links a joint touches - must not change.
    pub fn joint_mut(&mut self, index: usize) -> &mut Joint {
        &mut self.joints[index].joint
    }

    /// Precompute the per-link velocity the given external acceleration
    /// contributes over one tick, as filtered through the articulation's
    /// constraints: the raw `h * a` of every finite-mass link, projected
    /// through the factored system so that e.g. a pinned link expects no
    /// gravity motion while a hanging link expects its tangential share.
    ///
    /// [`Solver::velocity_iteration_bias`] removes this expected motion
    /// while iterating and restores it after, so nested solve passes do
    /// not fight the host's gravity integration. Runs against the
    /// previous tick's factorization (it is called before
    /// [`Solver::build_jacobians`]); on the very first tick, before any
    /// factorization exists, the bias stays zero and the first solve is
    /// merely a little stiffer than steady state.
    pub fn calculate_bias_delta_v<C: SolverContext>(&mut self, ctx: &C, acceleration: Twist) {
        let Some(ldl) = self.ldl.as_ref() else {
            self.bias_dv.fill(Twist::zero());
            return;
        };
        let raw = acceleration * self.h;
        for (i, dv) in self.bias_dv.iter_mut().enumerate() {
            *dv = if ctx.body(i).inv_mass > 0.0 {
                raw
            } else {
                Twist::zero()
            };
        }

        let nb = self.n_blocks;
        let nbb = self.n_body_blocks;
        let lane_of = |dv: &Twist, off: usize| -> Vector4<f64> {
            let v = if off == 0 { dv.angular } else { dv.linear };
            Vector4::new(v.x, v.y, v.z, 0.0)
        };

        let mut x = vec![Vector4::zeros(); nb];
        for r in 0..nb {
            for (link, dv) in self.bias_dv.iter().enumerate() {
                if self.jacobian.occupied(r, 2 * link) {
                    x[r] += self.jacobian.j[r * nbb + 2 * link] * lane_of(dv, 0);
                }
                if self.jacobian.occupied(r, 2 * link + 1) {
                    x[r] += self.jacobian.j[r * nbb + 2 * link + 1] * lane_of(dv, 1);
                }
            }
        }
        ldl.solve_in_place(&mut x);

        let filtered: Vec<Twist> = self
            .bias_dv
            .iter()
            .enumerate()
            .map(|(link, dv)| {
                let mut ang = lane_of(dv, 0);
                let mut lin = lane_of(dv, 1);
                for (r, xr) in x.iter().enumerate() {
                    if self.jacobian.occupied(r, 2 * link) {
                        ang -= self.jacobian.wjt[(2 * link) * nb + r] * xr;
                    }
                    if self.jacobian.occupied(r, 2 * link + 1) {
                        lin -= self.jacobian.wjt[(2 * link + 1) * nb + r] * xr;
                    }
                }
                Twist::new(ang.xyz(), lin.xyz())
            })
            .collect();
        self.bias_dv = filtered;
    }

    /// Build the Jacobian and errors, assemble and factor K, reset the
    /// impulse accumulator. First call also builds the sparsity plan.
    pub fn build_jacobians<C: SolverContext>(&mut self, ctx: &C) {
        let mut row = 0;
        let mut writer = RowWriter {
            jacobian: &mut self.jacobian,
            gamma: &mut self.gamma,
            bias: &mut self.bias,
            h: self.h,
        };
        for slot in &mut self.joints {
            debug_assert_eq!(slot.row, row);
            slot.joint.fill_sparsity(&mut writer, row);
            slot.joint.fill_jacobian(&mut writer, ctx, row);
            slot.joint.calculate_errors(&mut writer, ctx, row);
            row += slot.joint.row_count();
        }
        self.jacobian.calculate_wjt(ctx);

        let ldl = self
            .ldl
            .get_or_insert_with(|| SparseLdl::build_plan(&self.jacobian));
        ldl.build_k(&self.jacobian, self.n_rows);
        ldl.add_gamma(&self.gamma);
        ldl.factor();

        self.impulse.fill(0.0);
    }

    /// Recompute every joint's errors against the context's current
    /// velocities.
    pub fn recalculate_errors<C: SolverContext>(&mut self, ctx: &C) {
        let mut writer = RowWriter {
            jacobian: &mut self.jacobian,
            gamma: &mut self.gamma,
            bias: &mut self.bias,
            h: self.h,
        };
        for slot in &mut self.joints {
            slot.joint.calculate_errors(&mut writer, ctx, slot.row);
        }
    }

    /// One velocity iteration with the external-acceleration bias
    /// temporarily removed.
    pub fn velocity_iteration_bias<C: SolverContext>(&mut self, ctx: &mut C) {
        for i in 0..self.links.len() {
            let dv = self.bias_dv[i];
            ctx.add_twist(i, -dv);
        }
        self.velocity_iteration_no_bias(ctx);
        for i in 0..self.links.len() {
            let dv = self.bias_dv[i];
            ctx.add_twist(i, dv);
        }
    }

    /// One velocity iteration against the context's velocities as-is.
    pub fn velocity_iteration_no_bias<C: SolverContext>(&mut self, ctx: &mut C) {
        self.velocity_iteration(ctx, true);
    }

    /// One velocity iteration. `accumulate` folds the solved delta into
    /// the running impulse (warm-starting across iterations).
    pub fn velocity_iteration<C: SolverContext>(&mut self, ctx: &mut C, accumulate: bool) {
        if self.ldl.is_none() {
            debug_assert!(false, "velocity iteration before build_jacobians");
            return;
        }

        self.recalculate_errors(ctx);

        // b = bias + gamma * impulse + J v
        let mut x: Vec<Vector4<f64>> = (0..self.n_blocks)
            .map(|r| {
                Vector4::from_fn(|i, _| {
                    self.bias[r * 4 + i] + self.gamma[r * 4 + i] * self.impulse[r * 4 + i]
                })
            })
            .collect();
        for r in 0..self.n_blocks {
            for c in 0..self.n_body_blocks {
                if self.jacobian.occupied(r, c) {
                    x[r] += self.jacobian.j[r * self.n_body_blocks + c] * ctx.lane(c);
                }
            }
        }

        if let Some(ldl) = self.ldl.as_ref() {
            ldl.solve_in_place(&mut x);
        }

        Self::apply_negative_delta_impulse(ctx, &self.jacobian, &x);

        if accumulate {
            for r in 0..self.n_blocks {
                for i in 0..4 {
                    self.impulse[r * 4 + i] -= x[r][i];
                }
            }
        }
    }

    /// Apply `-raw WJT * dl` as a velocity delta to every touched link.
    pub fn apply_negative_delta_impulse<C: SolverContext>(
        ctx: &mut C,
        jacobian: &Jacobian,
        delta: &[Vector4<f64>],
    ) {
        let nb = jacobian.n_blocks;
        for link in 0..jacobian.n_body_blocks / 2 {
            for r in 0..nb {
                let ang = jacobian.occupied(r, 2 * link);
                let lin = jacobian.occupied(r, 2 * link + 1);
                if ang {
                    debug_assert!(delta[r].iter().all(|v| v.is_finite()));
                    let dv = jacobian.raw_wjt[(2 * link) * nb + r] * delta[r];
                    *ctx.lane_mut(2 * link) -= dv;
                }
                if lin {
                    let dv = jacobian.raw_wjt[(2 * link + 1) * nb + r] * delta[r];
                    *ctx.lane_mut(2 * link + 1) -= dv;
                }
            }
        }
    }

    /// Velocity change of link `b` if the given impulse were applied at
    /// its center of mass, accounting for the whole articulated chain.
    ///
    /// Projects the impulse into constraint space, solves on the already
    /// factored K and propagates back through the weighted transpose. Not
    /// part of the constraint loop itself; gameplay code uses it for
    /// effective-mass queries, and constraint blocks use it to couple
    /// trees.
    #[must_use]
    pub fn wrench_response<C: SolverContext>(&self, ctx: &C, b: usize, impulse: &Wrench) -> Twist {
        let Some(ldl) = self.ldl.as_ref() else {
            debug_assert!(false, "impulse response before build_jacobians");
            return Twist::zero();
        };
        let body = ctx.body(b);
        let dv = Twist::new(
            body.inv_inertia.mul_vec(&impulse.angular),
            body.inv_mass * impulse.linear,
        );
        let mut dv_ang = Vector4::new(dv.angular.x, dv.angular.y, dv.angular.z, 0.0);
        let mut dv_lin = Vector4::new(dv.linear.x, dv.linear.y, dv.linear.z, 0.0);

        let nb = self.n_blocks;
        let nbb = self.n_body_blocks;
        let mut x = vec![Vector4::zeros(); nb];
        for r in 0..nb {
            if self.jacobian.occupied(r, 2 * b) {
                x[r] += self.jacobian.j[r * nbb + 2 * b] * dv_ang;
            }
            if self.jacobian.occupied(r, 2 * b + 1) {
                x[r] += self.jacobian.j[r * nbb + 2 * b + 1] * dv_lin;
            }
        }

        ldl.solve_in_place(&mut x);

        for r in 0..nb {
            if self.jacobian.occupied(r, 2 * b) {
                dv_ang -= self.jacobian.wjt[(2 * b) * nb + r] * x[r];
            }
            if self.jacobian.occupied(r, 2 * b + 1) {
                dv_lin -= self.jacobian.wjt[(2 * b + 1) * nb + r] * x[r];
            }
        }

        Twist::new(dv_ang.xyz(), dv_lin.xyz())
    }

    /// Velocity change of a local anchor point on link `b` for a linear
    /// impulse applied there.
    #[must_use]
    pub fn point_response<C: SolverContext>(
        &self,
        ctx: &C,
        b: usize,
        anchor: &Vector3<f64>,
        impulse: &Vector3<f64>,
    ) -> Vector3<f64> {
        let offset = ctx.body(b).pose.transform_vector(anchor);
        // Impulse at the anchor, expressed at the center of mass.
        let at_com = Wrench::linear(*impulse).translated(&-offset);
        let dv = self.wrench_response(ctx, b, &at_com);
        dv.translated(&offset).linear
    }

    /// Effective 3x3 inverse mass at a local anchor point of link `b`:
    /// column i is the anchor's velocity response to a unit impulse along
    /// axis i.
    #[must_use]
    pub fn point_response_matrix<C: SolverContext>(
        &self,
        ctx: &C,
        b: usize,
        anchor: &Vector3<f64>,
    ) -> Matrix3<f64> {
        Matrix3::from_columns(&[
            self.point_response(ctx, b, anchor, &Vector3::x()),
            self.point_response(ctx, b, anchor, &Vector3::y()),
            self.point_response(ctx, b, anchor, &Vector3::z()),
        ])
    }

    /// Full 6x6 articulated inverse inertia of link `b`, reconstructed
    /// from the six canonical impulse responses. Every stage of the query
    /// is linear in the impulse, so no zero-impulse baseline is needed.
    #[must_use]
    pub fn articulated_inverse_inertia<C: SolverContext>(
        &self,
        ctx: &C,
        b: usize,
    ) -> ArticulatedInertia {
        let ax = self.wrench_response(ctx, b, &Wrench::angular(Vector3::x()));
        let ay = self.wrench_response(ctx, b, &Wrench::angular(Vector3::y()));
        let az = self.wrench_response(ctx, b, &Wrench::angular(Vector3::z()));
        let lx = self.wrench_response(ctx, b, &Wrench::linear(Vector3::x()));
        let ly = self.wrench_response(ctx, b, &Wrench::linear(Vector3::y()));
        let lz = self.wrench_response(ctx, b, &Wrench::linear(Vector3::z()));

        ArticulatedInertia::new(
            SymMat3 {
                m00: lx.linear.x,
                m10: ly.linear.x,
                m11: ly.linear.y,
                m20: lz.linear.x,
                m21: lz.linear.y,
                m22: lz.linear.z,
            },
            Matrix3::from_rows(&[
                ax.linear.transpose(),
                ay.linear.transpose(),
                az.linear.transpose(),
            ]),
            SymMat3 {
                m00: ax.angular.x,
                m10: ay.angular.x,
                m11: ay.angular.y,
                m20: az.angular.x,
                m21: az.angular.y,
                m22: az.angular.z,
            },
        )
    }

    /// Copy this solver's link velocities out of the world bodies into a
    /// scratch lane buffer.
    #[must_use]
    pub fn extract_velocities(&self, bodies: &[Body]) -> Vec<Vector4<f64>> {
        extract_lanes(bodies, &self.links)
    }

    /// Write a scratch lane buffer back to the world bodies; non-finite
    /// lanes are dropped with a warning.
    pub fn write_back_velocities(&self, bodies: &mut [Body], v: &[Vector4<f64>]) {
        crate::context::write_back_lanes(bodies, &self.links, v);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{ArticulationContext, LinearJoint};
    use armature_types::{MassProperties, Pose};
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    const H: f64 = 1.0 / 50.0;

    fn free_body_at(x: f64) -> Body {
        Body::new(
            MassProperties::sphere(1.0, 0.5),
            Pose::from_position(Point3::new(x, 0.0, 0.0)),
        )
    }

    /// One body pinned to the world origin by a rigid linear joint.
    fn pinned_solver() -> (Solver, Vec<Body>) {
        let bodies = vec![free_body_at(0.0)];
        let joint = Joint::Linear(LinearJoint::rigid(
            Some(0),
            None,
            Vector3::zeros(),
            Vector3::zeros(),
        ));
        let solver = Solver::new(vec![0], vec![joint], H).unwrap();
        (solver, bodies)
    }

    #[test]
    fn allocation_validates_links() {
        let joint = Joint::Linear(LinearJoint::rigid(
            Some(3),
            None,
            Vector3::zeros(),
            Vector3::zeros(),
        ));
        let err = Solver::new(vec![0], vec![joint], H).unwrap_err();
        assert!(matches!(err, ArmatureError::LinkOutOfRange { link: 3, .. }));

        assert!(matches!(
            Solver::new(vec![], vec![], H).unwrap_err(),
            ArmatureError::EmptyArticulation
        ));
    }

    #[test]
    fn equilibrium_iteration_is_idempotent() {
        let (mut solver, bodies) = pinned_solver();
        let links = [0usize];
        let mut v = extract_lanes(&bodies, &links);
        {
            let ctx = ArticulationContext::new(&bodies, &links, &mut v);
            solver.build_jacobians(&ctx);
        }
        let mut ctx = ArticulationContext::new(&bodies, &links, &mut v);
        solver.velocity_iteration_no_bias(&mut ctx);
        // Zero error, zero velocity: the pass must not produce any delta.
        assert_relative_eq!(ctx.twist(0).linear, Vector3::zeros(), epsilon = 1e-10);
        assert_relative_eq!(ctx.twist(0).angular, Vector3::zeros(), epsilon = 1e-10);
        assert!(solver.impulse.iter().all(|&i| i.abs() < 1e-10));
    }

    #[test]
    fn rigid_pin_kills_anchor_velocity() {
        let (mut solver, mut bodies) = pinned_solver();
        // Arbitrary external impulse before the solve.
        bodies[0].twist = Twist::new(
            Vector3::new(0.4, -0.2, 0.1),
            Vector3::new(3.0, -5.0, 2.0),
        );
        let links = [0usize];
        let mut v = extract_lanes(&bodies, &links);
        {
            let ctx = ArticulationContext::new(&bodies, &links, &mut v);
            solver.build_jacobians(&ctx);
        }
        let mut ctx = ArticulationContext::new(&bodies, &links, &mut v);
        solver.velocity_iteration_no_bias(&mut ctx);
        let anchor_vel = ctx.twist(0).linear; // anchor at the CoM
        assert!(anchor_vel.norm() < 1e-5, "anchor velocity {anchor_vel:?}");
    }

    #[test]
    fn internal_joint_conserves_momentum() {
        // Two free bodies joined at a coincident anchor, no world
        // constraint: an internal solve must not change the totals.
        let mut bodies = vec![free_body_at(0.0), free_body_at(1.0)];
        bodies[0].twist = Twist::new(Vector3::new(0.1, 0.0, 0.2), Vector3::new(1.0, 0.0, 0.0));
        bodies[1].twist = Twist::new(Vector3::new(0.0, -0.3, 0.0), Vector3::new(-1.0, 2.0, 0.0));

        let joint = Joint::Linear(LinearJoint::rigid(
            Some(1),
            Some(0),
            Vector3::new(-0.5, 0.0, 0.0),
            Vector3::new(0.5, 0.0, 0.0),
        ));
        let mut solver = Solver::new(vec![0, 1], vec![joint], H).unwrap();

        let momentum = |bodies: &[Body]| {
            let com = Point3::from(
                (bodies[0].pose.position.coords + bodies[1].pose.position.coords) / 2.0,
            );
            let linear: Vector3<f64> = bodies.iter().map(Body::linear_momentum).sum();
            let angular: Vector3<f64> =
                bodies.iter().map(|b| b.angular_momentum_about(&com)).sum();
            (linear, angular)
        };
        let (lin_before, ang_before) = momentum(&bodies);

        let links = [0usize, 1];
        let mut v = extract_lanes(&bodies, &links);
        {
            let ctx = ArticulationContext::new(&bodies, &links, &mut v);
            solver.build_jacobians(&ctx);
        }
        for _ in 0..3 {
            let mut ctx = ArticulationContext::new(&bodies, &links, &mut v);
            solver.velocity_iteration_no_bias(&mut ctx);
        }
        crate::context::write_back_lanes(&mut bodies, &links, &v);

        let (lin_after, ang_after) = momentum(&bodies);
        assert_relative_eq!(lin_after, lin_before, epsilon = 1e-8);
        assert_relative_eq!(ang_after, ang_before, epsilon = 1e-8);
    }

    #[test]
    fn assembled_k_matches_dense_product_for_two_link_chain() {
        // Two links, two joints: a world pin on link 0 and a link-link
        // pin, both soft so gamma lands on the diagonal.
        let mut bodies = vec![free_body_at(0.0), free_body_at(1.0)];
        bodies[1].twist = Twist::linear(Vector3::new(0.0, 1.0, 0.0));
        let mut pin = LinearJoint::rigid(Some(0), None, Vector3::zeros(), Vector3::zeros());
        pin.spring = Spring::new(500.0, 30.0);
        let mut chain = LinearJoint::rigid(
            Some(1),
            Some(0),
            Vector3::new(-0.5, 0.1, 0.0),
            Vector3::new(0.5, 0.1, 0.0),
        );
        chain.spring = Spring::new(200.0, 10.0);
        let mut solver =
            Solver::new(vec![0, 1], vec![Joint::Linear(pin), Joint::Linear(chain)], H).unwrap();

        let links = [0usize, 1];
        let mut v = extract_lanes(&bodies, &links);
        let ctx = ArticulationContext::new(&bodies, &links, &mut v);
        solver.build_jacobians(&ctx);

        // Dense reference K = J * WJT + diag(gamma), with the padded
        // trailing rows carrying an identity diagonal.
        let n = solver.n_blocks * 4;
        let mut dense_j = nalgebra::DMatrix::zeros(n, solver.n_body_blocks * 4);
        let mut dense_wjt = nalgebra::DMatrix::zeros(solver.n_body_blocks * 4, n);
        for r in 0..solver.n_blocks {
            for lane in 0..solver.n_body_blocks {
                if !solver.jacobian.occupied(r, lane) {
                    continue;
                }
                let jb = solver.jacobian.j[r * solver.n_body_blocks + lane];
                let wb = solver.jacobian.wjt[lane * solver.n_blocks + r];
                for a in 0..4 {
                    for b in 0..4 {
                        dense_j[(r * 4 + a, lane * 4 + b)] = jb[(a, b)];
                        dense_wjt[(lane * 4 + a, r * 4 + b)] = wb[(a, b)];
                    }
                }
            }
        }
        let mut expected = &dense_j * &dense_wjt;
        for i in 0..n {
            expected[(i, i)] += solver.gamma[i];
        }
        for i in solver.n_rows..n {
            expected[(i, i)] += 1.0;
        }

        // The factorization destroyed K, so rebuild it for the compare.
        let Some(ldl) = solver.ldl.as_mut() else {
            panic!("plan must exist after build_jacobians");
        };
        ldl.build_k(&solver.jacobian, solver.n_rows);
        ldl.add_gamma(&solver.gamma);
        let unpacked = ldl.unpack_dense();
        for r in 0..n {
            for c in 0..n {
                assert!(
                    (unpacked[(r, c)] - expected[(r, c)]).abs() < 1e-5,
                    "K[{r},{c}] = {} expected {}",
                    unpacked[(r, c)],
                    expected[(r, c)]
                );
            }
        }
    }

    #[test]
    fn point_response_matrix_of_free_body_is_inverse_mass() {
        // A body with no active constraints: response at the CoM is
        // 1/m on the diagonal.
        let bodies = vec![free_body_at(0.0)];
        let joint = Joint::Linear(LinearJoint {
            spring: Spring::free(),
            ..LinearJoint::rigid(Some(0), None, Vector3::zeros(), Vector3::zeros())
        });
        let mut solver = Solver::new(vec![0], vec![joint], H).unwrap();
        let links = [0usize];
        let mut v = extract_lanes(&bodies, &links);
        {
            let ctx = ArticulationContext::new(&bodies, &links, &mut v);
            solver.build_jacobians(&ctx);
        }
        let ctx = ArticulationContext::new(&bodies, &links, &mut v);
        let m = solver.point_response_matrix(&ctx, 0, &Vector3::zeros());
        assert_relative_eq!(m, Matrix3::identity(), epsilon = 1e-8);
    }

    #[test]
    fn articulated_inertia_of_pinned_body_is_stiffer() {
        let (mut solver, bodies) = pinned_solver();
        let links = [0usize];
        let mut v = extract_lanes(&bodies, &links);
        {
            let ctx = ArticulationContext::new(&bodies, &links, &mut v);
            solver.build_jacobians(&ctx);
        }
        let ctx = ArticulationContext::new(&bodies, &links, &mut v);
        let inv = solver.articulated_inverse_inertia(&ctx, 0);
        // The pin removes the linear response entirely.
        assert!(inv.m.m00.abs() < 1e-8);
        assert!(inv.m.m11.abs() < 1e-8);
        assert!(inv.m.m22.abs() < 1e-8);
        // Rotation about the CoM stays free (pin is at the CoM).
        assert_relative_eq!(inv.i.m00, bodies[0].inv_inertia.m00, epsilon = 1e-8);
    }
}
