//! Simulation context and tick schedule for the armature solver.
//!
//! [`World`] owns the body registry and every articulation and constraint
//! block, replacing hidden global state with one explicit value: construct
//! it at scene load (sized to an expected body capacity, growing on
//! demand), tear it down by dropping it.
//!
//! # Tick phases
//!
//! Each fixed step runs five strictly ordered phases. Within a phase,
//! work over independent articulations or bodies is data-parallel
//! (rayon); the phase boundary is the barrier:
//!
//! 1. [`World::build_articulation_jacobians`] - per-articulation Jacobian
//!    build and factorization, including the gravity-bias precomputation.
//! 2. [`World::build_block_jacobians`] - per-block build; depends on
//!    phase 1's factorizations for the articulated-inertia queries.
//! 3. [`World::run_velocity_iterations`] - N rounds, each one parallel
//!    pass over articulations followed by the constraint blocks (blocks
//!    alias articulations and run after them within the round).
//! 4. [`World::apply_damping`] - friction, self-aligning torque and
//!    terminal-velocity clamps.
//! 5. [`World::end_tick`] - sleep bookkeeping and time advance; the host
//!    then reads back poses and velocities.
//!
//! The phases are exposed separately so a host can interleave its own
//! work (e.g. contact resolution) between them; [`World::step`] runs them
//! all in order. Applying gravity and integrating positions from
//! velocities stay host responsibilities.

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn, clippy::suboptimal_flops)]

mod damping;
mod world;

pub use world::World;

// The full authoring surface, re-exported so hosts depend on one crate.
pub use armature_solver::{
    Angular3Joint, AngularJoint, Articulation, CgJoint, ConstraintBlock, FulcrumJoint, Joint,
    Linear3Joint, LinearJoint, PreserveAngularJoint, RotationTargetMode, Spring,
};
pub use armature_types::{
    integrate_pose, ArmatureError, ArticulatedInertia, Body, LinkRef, MassProperties, Pose,
    SolverConfig, SymMat3, Twist, Wrench,
};
