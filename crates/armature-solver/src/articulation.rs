//! One articulated kinematic tree and its solver.
//!
//! An articulation is allocated once when a character or mechanism spawns
//! (topology fixed at construction), solved every fixed step, and dropped
//! when it despawns. Its solver's velocity mutations happen on a scratch
//! copy of the link velocities, written back atomically at the end of each
//! call - articulations with disjoint bodies are therefore freely
//! parallelizable.

use armature_types::{ArmatureError, ArticulatedInertia, Body, Twist};
use nalgebra::{Matrix3, Vector3, Vector4};

use crate::{ArticulationContext, Joint, Solver};

/// A fixed set of body links plus joints, owning one [`Solver`].
pub struct Articulation {
    /// The constraint solver bound to this articulation's topology.
    pub solver: Solver,
    destroyed: bool,
}

impl Articulation {
    /// Allocate an articulation over world body ids `links` with the given
    /// joints and tick length.
    pub fn new(links: Vec<usize>, joints: Vec<Joint>, h: f64) -> Result<Self, ArmatureError> {
        Ok(Self {
            solver: Solver::new(links, joints, h)?,
            destroyed: false,
        })
    }

    /// Whether this slot has been disposed (slots are reused).
    #[must_use]
    pub fn destroyed(&self) -> bool {
        self.destroyed
    }

    /// Mark the slot disposed. Buffers are freed when the slot is
    /// overwritten or the world drops.
    pub fn destroy(&mut self) {
        self.destroyed = true;
    }

    /// Phase 1 work: precompute the gravity bias, build the Jacobian and
    /// factor K.
    pub fn build_jacobians(&mut self, bodies: &[Body], gravity: &Vector3<f64>) {
        let mut v = self.solver.extract_velocities(bodies);
        let links: Vec<usize> = self.solver.links().to_vec();
        let ctx = ArticulationContext::new(bodies, &links, &mut v);
        self.solver
            .calculate_bias_delta_v(&ctx, Twist::linear(*gravity));
        self.solver.build_jacobians(&ctx);
    }

    /// One velocity-iteration pass over a scratch copy of the link
    /// velocities. Returns the scratch buffer for the caller to write
    /// back, so the parallel phase can defer all body mutation.
    #[must_use]
    pub fn iterate_scratch(&mut self, bodies: &[Body]) -> Vec<Vector4<f64>> {
        let mut v = self.solver.extract_velocities(bodies);
        let links: Vec<usize> = self.solver.links().to_vec();
        let mut ctx = ArticulationContext::new(bodies, &links, &mut v);
        self.solver.velocity_iteration_bias(&mut ctx);
        v
    }

    /// One velocity-iteration pass applied directly (extract, solve,
    /// write back).
    pub fn velocity_iteration(&mut self, bodies: &mut [Body]) {
        let v = self.iterate_scratch(bodies);
        self.solver.write_back_velocities(bodies, &v);
    }

    /// Apply an external impulse to link `b` (at its center of mass, or at
    /// a local anchor) and immediately re-run one velocity iteration so
    /// the articulation stays internally consistent.
    pub fn apply_impulse(
        &mut self,
        bodies: &mut [Body],
        b: usize,
        anchor: Option<&Vector3<f64>>,
        impulse: &Vector3<f64>,
        accumulate: bool,
    ) {
        use crate::SolverContext;
        let mut v = self.solver.extract_velocities(bodies);
        let links: Vec<usize> = self.solver.links().to_vec();
        let mut ctx = ArticulationContext::new(bodies, &links, &mut v);
        match anchor {
            Some(a) => ctx.apply_impulse_at_local_point(b, impulse, a),
            None => ctx.apply_impulse(b, &Vector3::zeros(), impulse),
        }
        self.solver.velocity_iteration(&mut ctx, accumulate);
        self.solver.write_back_velocities(bodies, &v);
    }

    /// Effective 3x3 inverse mass at a local anchor of link `b`. Requires
    /// a factored system (after [`Articulation::build_jacobians`]).
    #[must_use]
    pub fn impulse_response(
        &self,
        bodies: &[Body],
        b: usize,
        anchor: &Vector3<f64>,
    ) -> Matrix3<f64> {
        let mut v = self.solver.extract_velocities(bodies);
        let ctx = ArticulationContext::new(bodies, self.solver.links(), &mut v);
        self.solver.point_response_matrix(&ctx, b, anchor)
    }

    /// Full 6x6 articulated inverse inertia of link `b`.
    #[must_use]
    pub fn articulated_inverse_inertia(&self, bodies: &[Body], b: usize) -> ArticulatedInertia {
        let mut v = self.solver.extract_velocities(bodies);
        let ctx = ArticulationContext::new(bodies, self.solver.links(), &mut v);
        self.solver.articulated_inverse_inertia(&ctx, b)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{LinearJoint, Spring};
    use armature_types::{MassProperties, Pose};
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    const H: f64 = 1.0 / 50.0;

    fn pinned() -> (Articulation, Vec<Body>) {
        let bodies = vec![Body::new(
            MassProperties::sphere(2.0, 0.5),
            Pose::identity(),
        )];
        let joint = Joint::Linear(LinearJoint::rigid(
            Some(0),
            None,
            Vector3::zeros(),
            Vector3::zeros(),
        ));
        (Articulation::new(vec![0], vec![joint], H).unwrap(), bodies)
    }

    #[test]
    fn apply_impulse_keeps_pin_satisfied() {
        let (mut articulation, mut bodies) = pinned();
        articulation.build_jacobians(&bodies, &Vector3::zeros());
        articulation.apply_impulse(
            &mut bodies,
            0,
            None,
            &Vector3::new(10.0, -4.0, 2.0),
            true,
        );
        // The pin absorbs the impulse: the body's CoM cannot move.
        assert!(bodies[0].twist.linear.norm() < 1e-6);
    }

    #[test]
    fn gravity_bias_is_zero_on_first_tick() {
        let (mut articulation, mut bodies) = pinned();
        let gravity = Vector3::new(0.0, -9.81, 0.0);
        articulation.build_jacobians(&bodies, &gravity);
        // No factorization existed when the bias was computed, so no
        // motion is expected and the pin corrects the gravity velocity.
        bodies[0].twist.linear += gravity * H;
        articulation.velocity_iteration(&mut bodies);
        assert_relative_eq!(bodies[0].twist.linear, Vector3::zeros(), epsilon = 1e-9);
    }

    #[test]
    fn pinned_link_expects_no_gravity_motion_after_first_tick() {
        let (mut articulation, mut bodies) = pinned();
        let gravity = Vector3::new(0.0, -9.81, 0.0);
        articulation.build_jacobians(&bodies, &gravity);
        // Second tick: the bias is now filtered through the pin, which
        // absorbs gravity entirely, so the stale gravity velocity gets
        // corrected away by the iteration.
        articulation.build_jacobians(&bodies, &gravity);
        bodies[0].twist.linear += gravity * H;
        articulation.velocity_iteration(&mut bodies);
        assert!(bodies[0].twist.linear.norm() < 1e-8);
    }

    #[test]
    fn soft_pin_pulls_back_toward_anchor() {
        let mut bodies = vec![Body::new(
            MassProperties::sphere(1.0, 0.5),
            Pose::from_position(Point3::new(0.1, 0.0, 0.0)),
        )];
        let mut joint = LinearJoint::rigid(Some(0), None, Vector3::zeros(), Vector3::zeros());
        joint.spring = Spring::new(400.0, 40.0);
        let mut articulation =
            Articulation::new(vec![0], vec![Joint::Linear(joint)], H).unwrap();
        articulation.build_jacobians(&bodies, &Vector3::zeros());
        articulation.velocity_iteration(&mut bodies);
        // Displaced +X from its anchor, the spring must pull -X.
        assert!(bodies[0].twist.linear.x < -1e-4);
    }
}
