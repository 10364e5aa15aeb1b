//! The simulation context: body registry, articulation/block storage and
//! the tick schedule.

use armature_solver::{Articulation, ConstraintBlock, Joint};
use armature_types::{
    ArmatureError, ArticulatedInertia, Body, LinkRef, SolverConfig, Twist,
};
use nalgebra::{Matrix3, Vector3, Vector4};
use rayon::prelude::*;

use crate::damping;

/// Owns all bodies, articulations and constraint blocks of one
/// simulation, and runs the five-phase tick over them.
///
/// Bodies, articulations and blocks live in slot vectors: removal marks
/// the slot dead and a later registration reuses it, so ids handed to the
/// host stay stable.
pub struct World {
    bodies: Vec<Body>,
    articulations: Vec<Articulation>,
    blocks: Vec<ConstraintBlock>,
    gravity: Vector3<f64>,
    h: f64,
    time: f64,
    config: SolverConfig,
}

impl World {
    /// Create a world with the given fixed tick length and an expected
    /// body capacity.
    pub fn new(h: f64, capacity: usize) -> Result<Self, ArmatureError> {
        Self::with_config(h, capacity, SolverConfig::default())
    }

    /// Create a world with explicit solver tuning.
    pub fn with_config(
        h: f64,
        capacity: usize,
        config: SolverConfig,
    ) -> Result<Self, ArmatureError> {
        if !(h > 0.0 && h.is_finite()) {
            return Err(ArmatureError::InvalidTimestep(h));
        }
        config.validate()?;
        Ok(Self {
            bodies: Vec::with_capacity(capacity),
            articulations: Vec::new(),
            blocks: Vec::new(),
            gravity: Vector3::new(0.0, -9.81, 0.0),
            h,
            time: 0.0,
            config,
        })
    }

    /// Fixed tick length.
    #[must_use]
    pub fn timestep(&self) -> f64 {
        self.h
    }

    /// Accumulated simulation time.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Gravity vector.
    #[must_use]
    pub fn gravity(&self) -> Vector3<f64> {
        self.gravity
    }

    /// Set the gravity vector.
    pub fn set_gravity(&mut self, gravity: Vector3<f64>) {
        self.gravity = gravity;
    }

    /// Solver tuning.
    #[must_use]
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    // --- body registry ------------------------------------------------------

    /// Register a body, reusing a dead slot if one exists. Capacity grows
    /// by powers of two.
    pub fn register_body(&mut self, body: Body) -> usize {
        debug_assert!(body.alive);
        if let Some(id) = self.bodies.iter().position(|b| !b.alive) {
            self.bodies[id] = body;
            return id;
        }
        if self.bodies.len() == self.bodies.capacity() {
            let grown = (self.bodies.len() + 1).next_power_of_two();
            self.bodies.reserve(grown - self.bodies.len());
        }
        self.bodies.push(body);
        self.bodies.len() - 1
    }

    /// Mark a body slot dead. The slot is reused by a later registration.
    pub fn unregister_body(&mut self, id: usize) {
        debug_assert!(id < self.bodies.len());
        debug_assert!(
            self.bodies[id].link_ref.is_none(),
            "unregistering a body still owned by an articulation"
        );
        self.bodies[id].alive = false;
    }

    /// Number of body slots (alive or dead).
    #[must_use]
    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    /// Read a body.
    #[must_use]
    pub fn body(&self, id: usize) -> &Body {
        debug_assert!(id < self.bodies.len());
        &self.bodies[id]
    }

    /// Mutate a body (the host pushes fresh pose/velocity state here
    /// before each tick).
    pub fn body_mut(&mut self, id: usize) -> &mut Body {
        debug_assert!(id < self.bodies.len());
        &mut self.bodies[id]
    }

    /// All bodies, for read-mostly host sweeps.
    #[must_use]
    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    // --- articulations and blocks -------------------------------------------

    /// Allocate an articulation over the given body ids. Each body gets a
    /// back-reference identifying its owning link.
    pub fn add_articulation(
        &mut self,
        links: Vec<usize>,
        joints: Vec<Joint>,
    ) -> Result<usize, ArmatureError> {
        for &id in &links {
            if id >= self.bodies.len() || !self.bodies[id].alive {
                return Err(ArmatureError::DeadBody(id));
            }
        }
        let id = self
            .articulations
            .iter()
            .position(Articulation::destroyed)
            .unwrap_or(self.articulations.len());
        for (link, &body_id) in links.iter().enumerate() {
            self.bodies[body_id].link_ref = Some(LinkRef {
                articulation: id,
                link,
            });
        }
        let articulation = Articulation::new(links, joints, self.h)?;
        if id == self.articulations.len() {
            self.articulations.push(articulation);
        } else {
            self.articulations[id] = articulation;
        }
        Ok(id)
    }

    /// Dispose an articulation: clears its bodies' back-references and
    /// frees the slot for reuse.
    pub fn remove_articulation(&mut self, id: usize) {
        for &body_id in self.articulations[id].solver.links() {
            self.bodies[body_id].link_ref = None;
        }
        self.articulations[id].destroy();
    }

    /// Access an articulation (e.g. to retarget its joints each tick).
    #[must_use]
    pub fn articulation(&self, id: usize) -> &Articulation {
        &self.articulations[id]
    }

    /// Mutable articulation access.
    pub fn articulation_mut(&mut self, id: usize) -> &mut Articulation {
        &mut self.articulations[id]
    }

    /// Allocate a constraint block over the given body ids; bodies that
    /// belong to articulations are coupled through their articulated
    /// inertia.
    pub fn add_constraint_block(
        &mut self,
        links: Vec<usize>,
        joints: Vec<Joint>,
    ) -> Result<usize, ArmatureError> {
        for &id in &links {
            if id >= self.bodies.len() || !self.bodies[id].alive {
                return Err(ArmatureError::DeadBody(id));
            }
        }
        let block = ConstraintBlock::new(links, joints, &self.bodies, self.h)?;
        let id = self
            .blocks
            .iter()
            .position(ConstraintBlock::destroyed)
            .unwrap_or(self.blocks.len());
        if id == self.blocks.len() {
            self.blocks.push(block);
        } else {
            self.blocks[id] = block;
        }
        Ok(id)
    }

    /// Dispose a constraint block.
    pub fn remove_constraint_block(&mut self, id: usize) {
        self.blocks[id].destroy();
    }

    /// Access a constraint block.
    #[must_use]
    pub fn constraint_block(&self, id: usize) -> &ConstraintBlock {
        &self.blocks[id]
    }

    /// Mutable constraint block access.
    pub fn constraint_block_mut(&mut self, id: usize) -> &mut ConstraintBlock {
        &mut self.blocks[id]
    }

    // --- tick phases --------------------------------------------------------

    /// Refresh every live body's world-space inertia from its current
    /// orientation. Run after the host has pushed fresh poses.
    pub fn update_inertias(&mut self) {
        self.bodies.par_iter_mut().for_each(|body| {
            if body.alive {
                body.update_world_inertia();
            }
        });
    }

    /// Phase 1: per-articulation Jacobian build and factorization,
    /// parallel over articulations.
    pub fn build_articulation_jacobians(&mut self) {
        let bodies = &self.bodies;
        let gravity = self.gravity;
        self.articulations.par_iter_mut().for_each(|articulation| {
            if !articulation.destroyed() {
                articulation.build_jacobians(bodies, &gravity);
            }
        });
    }

    /// Phase 2: per-block Jacobian build, parallel over blocks. Needs
    /// phase 1's factorizations for the articulated-inertia refresh.
    pub fn build_block_jacobians(&mut self) {
        let bodies = &self.bodies;
        let articulations = &self.articulations;
        self.blocks.par_iter_mut().for_each(|block| {
            if !block.destroyed() {
                block.build_jacobians(articulations, bodies);
            }
        });
    }

    /// One round of phase 3: a parallel velocity-iteration pass over all
    /// articulations, then the constraint blocks. Blocks run after the
    /// articulations they reference and sequentially among themselves
    /// (they mutate the referenced articulations' state).
    pub fn velocity_iteration_round(&mut self) {
        let bodies = &self.bodies;
        let scratches: Vec<(usize, Vec<Vector4<f64>>)> = self
            .articulations
            .par_iter_mut()
            .enumerate()
            .filter(|(_, a)| !a.destroyed())
            .map(|(i, a)| (i, a.iterate_scratch(bodies)))
            .collect();
        for (i, v) in scratches {
            self.articulations[i]
                .solver
                .write_back_velocities(&mut self.bodies, &v);
        }

        for block in &mut self.blocks {
            if !block.destroyed() {
                block.velocity_iteration(&mut self.articulations, &mut self.bodies);
            }
        }
    }

    /// Phase 3: the configured number of velocity-iteration rounds.
    pub fn run_velocity_iterations(&mut self) {
        for _ in 0..self.config.iterations {
            self.velocity_iteration_round();
        }
    }

    /// Phase 4: friction/self-aligning damping per body, then the
    /// articulation-wide terminal velocity clamp.
    pub fn apply_damping(&mut self) {
        let config = self.config;
        let h = self.h;
        self.bodies.par_iter_mut().for_each(|body| {
            if body.alive {
                damping::friction_and_self_align(body, &config, h);
            }
        });

        for id in 0..self.articulations.len() {
            if !self.articulations[id].destroyed() {
                self.limit_articulation_velocity(id);
            }
        }
    }

    /// Clamp an articulation's links relative to the articulation's
    /// average velocity, so a falling character saturates as a whole
    /// instead of tearing apart link by link.
    fn limit_articulation_velocity(&mut self, id: usize) {
        let links = self.articulations[id].solver.links();
        let mut total = Vector3::zeros();
        let mut mass = 0.0;
        for &body_id in links {
            let body = &self.bodies[body_id];
            total += body.mass * body.twist.linear;
            mass += body.mass;
        }
        let avg = total / mass;
        if avg.y >= -self.config.terminal_fall_velocity
            && avg.norm() <= self.config.terminal_velocity
        {
            return;
        }
        let mut target = avg;
        target.y = target.y.max(-self.config.terminal_fall_velocity);
        target = damping::clamp_norm(target, self.config.terminal_velocity);
        let delta = target - avg;

        let links: Vec<usize> = links.to_vec();
        for body_id in links {
            let body = &mut self.bodies[body_id];
            body.twist.angular =
                damping::clamp_norm(body.twist.angular, body.angular_velocity_limit);
            body.twist.linear += delta;
            body.twist.linear = damping::clamp_norm(
                body.twist.linear - target,
                self.config.terminal_relative_velocity,
            ) + target;
        }
    }

    /// Phase 5 bookkeeping: sleep counters and time advance. The host
    /// reads back poses/velocities afterwards, consulting
    /// [`World::velocity_write_suppressed`].
    pub fn end_tick(&mut self) {
        let threshold = self.config.sleep_threshold * self.config.sleep_threshold_multiplier;
        for body in &mut self.bodies {
            if !body.alive {
                continue;
            }
            if body.normalized_kinetic_energy() < threshold {
                body.sleep_frames = body.sleep_frames.saturating_add(1);
            } else {
                body.sleep_frames = 0;
            }
        }
        self.time += self.h;
    }

    /// Whether write-back of this body's (small) velocity should be
    /// suppressed so the host's own sleep logic can engage.
    #[must_use]
    pub fn velocity_write_suppressed(&self, id: usize) -> bool {
        let body = &self.bodies[id];
        body.sleep_allowed && body.sleep_frames >= self.config.sleep_frames
    }

    /// Wake a body up.
    pub fn wake(&mut self, id: usize) {
        self.bodies[id].sleep_frames = 0;
    }

    /// Run all five phases in order.
    pub fn step(&mut self) {
        self.update_inertias();
        self.build_articulation_jacobians();
        self.build_block_jacobians();
        self.run_velocity_iterations();
        self.apply_damping();
        self.end_tick();
    }

    // --- host queries -------------------------------------------------------

    /// Apply an external impulse to an articulation link (optionally at a
    /// local anchor) and re-run one velocity iteration so the articulation
    /// stays internally consistent.
    pub fn apply_impulse(
        &mut self,
        articulation: usize,
        link: usize,
        anchor: Option<&Vector3<f64>>,
        impulse: &Vector3<f64>,
    ) {
        self.articulations[articulation].apply_impulse(
            &mut self.bodies,
            link,
            anchor,
            impulse,
            true,
        );
    }

    /// Effective 3x3 inverse mass at a local anchor of an articulation
    /// link.
    #[must_use]
    pub fn impulse_response(
        &self,
        articulation: usize,
        link: usize,
        anchor: &Vector3<f64>,
    ) -> Matrix3<f64> {
        self.articulations[articulation].impulse_response(&self.bodies, link, anchor)
    }

    /// Full 6x6 articulated inverse inertia of an articulation link.
    #[must_use]
    pub fn articulated_inverse_inertia(
        &self,
        articulation: usize,
        link: usize,
    ) -> ArticulatedInertia {
        self.articulations[articulation].articulated_inverse_inertia(&self.bodies, link)
    }

    /// Apply an impulse to a plain (non-articulated) body, optionally at
    /// a world-space point, waking it up. For articulation links use
    /// [`World::apply_impulse`] so the chain stays consistent.
    pub fn apply_body_impulse(
        &mut self,
        id: usize,
        impulse: &Vector3<f64>,
        at: Option<&nalgebra::Point3<f64>>,
    ) {
        let body = &mut self.bodies[id];
        debug_assert!(body.alive);
        let mut delta = Twist::new(Vector3::zeros(), body.inv_mass * impulse);
        if let Some(point) = at {
            let r = point - body.pose.position;
            delta.angular = body.inv_inertia.mul_vec(&r.cross(impulse));
        }
        let twist = body.twist + delta;
        if twist.is_finite() {
            body.twist = twist;
        } else {
            tracing::warn!(body = id, "skipping non-finite impulse");
        }
        body.sleep_frames = 0;
    }

    /// Apply a force over this tick: impulse = force * h.
    pub fn apply_body_force(
        &mut self,
        id: usize,
        force: &Vector3<f64>,
        at: Option<&nalgebra::Point3<f64>>,
    ) {
        let impulse = force * self.h;
        self.apply_body_impulse(id, &impulse, at);
    }

    /// Total linear momentum of all live bodies (diagnostics).
    #[must_use]
    pub fn total_linear_momentum(&self) -> Vector3<f64> {
        self.bodies
            .iter()
            .filter(|b| b.alive)
            .map(Body::linear_momentum)
            .sum()
    }

    /// Total angular momentum of all live bodies about the origin
    /// (diagnostics).
    #[must_use]
    pub fn total_angular_momentum(&self) -> Vector3<f64> {
        self.bodies
            .iter()
            .filter(|b| b.alive)
            .map(|b| b.angular_momentum_about(&nalgebra::Point3::origin()))
            .sum()
    }

    /// Apply this tick's gravity to every live dynamic body the way a
    /// minimal host integrator would: `v += g h`. Hosts with their own
    /// integration skip this.
    pub fn apply_gravity(&mut self) {
        let dv = self.gravity * self.h;
        for body in &mut self.bodies {
            if body.alive && body.inv_mass > 0.0 {
                body.twist.linear += dv;
            }
        }
    }

    /// Integrate every live body's pose from its velocity, for hosts
    /// without their own integrator (and for tests).
    pub fn integrate_poses(&mut self) {
        let h = self.h;
        for body in &mut self.bodies {
            if body.alive && !body.kinematic {
                body.pose = armature_types::integrate_pose(&body.pose, &body.twist, h);
            }
        }
    }

    /// Suppress velocity divergence: any live body with a non-finite
    /// twist is reset to rest and logged.
    pub fn quarantine_non_finite(&mut self) {
        for (id, body) in self.bodies.iter_mut().enumerate() {
            if body.alive && !body.twist.is_finite() {
                tracing::warn!(body = id, "resetting non-finite velocity");
                body.twist = Twist::zero();
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use armature_solver::{LinearJoint, Spring};
    use armature_types::{MassProperties, Pose};
    use nalgebra::Point3;

    const H: f64 = 1.0 / 50.0;

    fn sphere_at(x: f64) -> Body {
        Body::new(
            MassProperties::sphere(1.0, 0.5),
            Pose::from_position(Point3::new(x, 0.0, 0.0)),
        )
    }

    #[test]
    fn registry_reuses_dead_slots() {
        let mut world = World::new(H, 4).unwrap();
        let a = world.register_body(sphere_at(0.0));
        let b = world.register_body(sphere_at(1.0));
        world.unregister_body(a);
        let c = world.register_body(sphere_at(2.0));
        assert_eq!(c, a);
        assert_ne!(b, c);
    }

    #[test]
    fn articulation_over_dead_body_is_rejected() {
        let mut world = World::new(H, 4).unwrap();
        let a = world.register_body(sphere_at(0.0));
        world.unregister_body(a);
        let err = world.add_articulation(vec![a], vec![]).unwrap_err();
        assert!(matches!(err, ArmatureError::DeadBody(_)));
    }

    #[test]
    fn add_articulation_sets_link_refs() {
        let mut world = World::new(H, 4).unwrap();
        let a = world.register_body(sphere_at(0.0));
        let joint = Joint::Linear(LinearJoint::rigid(
            Some(0),
            None,
            Vector3::zeros(),
            Vector3::zeros(),
        ));
        let id = world.add_articulation(vec![a], vec![joint]).unwrap();
        assert_eq!(
            world.body(a).link_ref,
            Some(LinkRef {
                articulation: id,
                link: 0
            })
        );
        world.remove_articulation(id);
        assert_eq!(world.body(a).link_ref, None);
    }

    #[test]
    fn step_holds_a_pinned_body_against_gravity() {
        let mut world = World::with_config(H, 4, SolverConfig::default().undamped()).unwrap();
        let a = world.register_body(sphere_at(0.0));
        let mut joint = LinearJoint::rigid(Some(0), None, Vector3::zeros(), Vector3::zeros());
        joint.spring = Spring::new(1e5, 300.0);
        world
            .add_articulation(vec![a], vec![Joint::Linear(joint)])
            .unwrap();

        for _ in 0..100 {
            world.apply_gravity();
            world.step();
            world.integrate_poses();
        }
        let drift = world.body(a).pose.position.coords.norm();
        assert!(drift < 1e-3, "pinned body drifted {drift} m");
    }

    #[test]
    fn body_impulse_at_point_spins() {
        let mut world = World::new(H, 4).unwrap();
        let a = world.register_body(sphere_at(0.0));
        world.apply_body_impulse(a, &Vector3::y(), Some(&Point3::new(0.5, 0.0, 0.0)));
        assert!(world.body(a).twist.angular.z > 0.0);
        assert!(world.body(a).twist.linear.y > 0.0);
    }

    #[test]
    fn sleep_counter_rises_at_rest() {
        let mut world = World::new(H, 4).unwrap();
        let a = world.register_body(sphere_at(0.0));
        for _ in 0..60 {
            world.end_tick();
        }
        assert!(world.velocity_write_suppressed(a));
        world.wake(a);
        assert!(!world.velocity_write_suppressed(a));
    }
}
