//! Core types for the armature articulated-body solver.
//!
//! This crate provides the foundational data types shared by the solver and
//! world layers:
//!
//! - [`Pose`], [`Twist`], [`Wrench`] - spatial state and load vectors
//! - [`SymMat3`], [`ArticulatedInertia`] - packed symmetric and coupled
//!   6x6 inverse inertia
//! - [`Body`], [`MassProperties`] - rigid body records as seen by the solver
//! - [`SolverConfig`] - timestep-independent solver tuning
//! - [`ArmatureError`] - error enum for fallible setup operations
//!
//! # Design Philosophy
//!
//! These types are **pure data**. They carry no solver logic and no
//! integration; they are the common language between the constraint core
//! (`armature-solver`), the simulation context (`armature-world`) and any
//! host engine that owns collision and position integration.
//!
//! # Example
//!
//! ```
//! use armature_types::{Body, MassProperties, Pose, Twist};
//! use nalgebra::{Point3, Vector3};
//!
//! let props = MassProperties::sphere(2.0, 0.5);
//! let body = Body::new(props, Pose::from_position(Point3::new(0.0, 1.0, 0.0)));
//! assert!(body.inv_mass > 0.0);
//! assert_eq!(body.twist, Twist::zero());
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn, clippy::suboptimal_flops)]

mod body;
mod config;
mod error;
mod inertia;
mod spatial;

pub use body::{Body, LinkRef, MassProperties};
pub use config::SolverConfig;
pub use error::ArmatureError;
pub use inertia::{ArticulatedInertia, SymMat3};
pub use spatial::{integrate_pose, Pose, Twist, Wrench};

// Re-export math types for convenience.
pub use nalgebra::{Matrix3, Point3, UnitQuaternion, Vector3};

/// Result type for armature operations.
pub type Result<T> = std::result::Result<T, ArmatureError>;
