//! Block-sparse soft-constraint solver for articulated rigid bodies.
//!
//! Given a set of rigid-body links connected by typed joints, this crate
//! computes per-tick velocity corrections that satisfy all joint
//! constraints simultaneously. Constraints are soft: each joint row carries
//! a [`Spring`] whose stiffness/damping pair is converted every tick into a
//! constraint-force-mixing factor (gamma) and a bias velocity, following
//! Erin Catto's soft-constraint formulation. The coupled system
//!
//! ```text
//! K = J W J^T + diag(gamma)
//! ```
//!
//! is assembled into 4x4 blocks on a fill-in-aware sparsity plan and
//! factored in place by a block LDL decomposition ([`SparseLdl`]), so the
//! per-tick cost touches only structurally nonzero blocks.
//!
//! # Pipeline
//!
//! One [`Articulation`] owns one [`Solver`] bound to a fixed list of links
//! and joints. Every tick:
//!
//! 1. [`Solver::build_jacobians`] - joints fill the block Jacobian and
//!    their current errors, K is assembled and factored (the sparsity plan
//!    is built lazily on the first tick).
//! 2. [`Solver::velocity_iteration_bias`] (N rounds) - recompute errors,
//!    solve `K dl = bias + gamma l + J v`, apply `-W J^T dl` to the link
//!    velocities, accumulate the running impulse.
//!
//! [`ConstraintBlock`] couples links that belong to *other* articulations
//! by swapping each aliased link's rigid inverse inertia for its 6x6
//! articulated inverse inertia, obtained through the factored system of
//! the owning articulation ([`Solver::articulated_inverse_inertia`]).
//!
//! Collision, contacts and position integration belong to the host engine;
//! this crate reads body state and writes velocity deltas only.

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::many_single_char_names
)]

mod articulation;
mod block;
mod context;
mod jacobian;
mod joint;
mod solver;
mod sparse;
mod spring;

pub use articulation::Articulation;
pub use block::ConstraintBlock;
pub use context::{ArticulationContext, BlockContext, SolverContext};
pub use jacobian::Jacobian;
pub use joint::{
    Angular3Joint, AngularJoint, CgJoint, FulcrumJoint, Joint, Linear3Joint, LinearJoint,
    PreserveAngularJoint, RotationTargetMode,
};
pub use solver::Solver;
pub use sparse::SparseLdl;
pub use spring::Spring;
