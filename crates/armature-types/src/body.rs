//! Rigid body records as seen by the constraint solver.
//!
//! Bodies are owned by the host engine; the solver borrows them for the
//! duration of one tick. The record keeps the mass/inertia pair and its
//! inverse side by side so hot loops never invert anything: the invariant
//! is that the inverse is zero exactly when the body is infinite-mass
//! (kinematic), and the exact reciprocal otherwise.

use nalgebra::{Point3, UnitQuaternion, Vector3};

use crate::{ArmatureError, Pose, SymMat3, Twist};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Back-reference from a body to the articulation link that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinkRef {
    /// Index of the owning articulation in the world.
    pub articulation: usize,
    /// Link index within that articulation.
    pub link: usize,
}

/// Mass, principal inertia and the orientation of the principal axes.
///
/// World-space inertia is re-derived from these every tick as the body
/// rotates; see [`Body::update_world_inertia`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MassProperties {
    /// Total mass in kg.
    pub mass: f64,
    /// Principal moments of inertia (kg m^2).
    pub principal_inertia: Vector3<f64>,
    /// Rotation from body frame to principal axes.
    pub inertia_rotation: UnitQuaternion<f64>,
}

impl MassProperties {
    /// Mass properties with explicit principal moments.
    #[must_use]
    pub fn new(mass: f64, principal_inertia: Vector3<f64>) -> Self {
        Self {
            mass,
            principal_inertia,
            inertia_rotation: UnitQuaternion::identity(),
        }
    }

    /// Uniform solid sphere: I = (2/5) m r^2.
    #[must_use]
    pub fn sphere(mass: f64, radius: f64) -> Self {
        let i = 0.4 * mass * radius * radius;
        Self::new(mass, Vector3::new(i, i, i))
    }

    /// Uniform solid box with the given half extents.
    #[must_use]
    pub fn box_shape(mass: f64, half_extents: Vector3<f64>) -> Self {
        let x2 = 4.0 * half_extents.x * half_extents.x;
        let y2 = 4.0 * half_extents.y * half_extents.y;
        let z2 = 4.0 * half_extents.z * half_extents.z;
        Self::new(
            mass,
            Vector3::new(
                mass * (y2 + z2) / 12.0,
                mass * (x2 + z2) / 12.0,
                mass * (x2 + y2) / 12.0,
            ),
        )
    }

    /// Set the principal axis orientation.
    #[must_use]
    pub fn with_inertia_rotation(mut self, rotation: UnitQuaternion<f64>) -> Self {
        self.inertia_rotation = rotation;
        self
    }

    /// Validate mass and inertia are physical.
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.mass > 0.0 && self.mass.is_finite()) {
            return Err(ArmatureError::invalid_mass("mass must be positive and finite"));
        }
        if self.principal_inertia.iter().any(|&i| !(i > 0.0 && i.is_finite())) {
            return Err(ArmatureError::invalid_mass(
                "principal inertia must be positive and finite",
            ));
        }
        Ok(())
    }
}

/// Rigid body state borrowed by the solver each tick.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Body {
    /// Pose of the center of mass.
    pub pose: Pose,
    /// Angular and linear velocity.
    pub twist: Twist,
    /// Mass (kg).
    pub mass: f64,
    /// Inverse mass; zero for kinematic bodies.
    pub inv_mass: f64,
    /// World-space inertia tensor.
    pub inertia: SymMat3,
    /// World-space inverse inertia; zero for kinematic bodies.
    pub inv_inertia: SymMat3,
    /// Principal moments, body frame.
    pub principal_inertia: Vector3<f64>,
    /// Principal axis orientation, body frame.
    pub inertia_rotation: UnitQuaternion<f64>,
    /// Kinematic bodies have infinite effective mass.
    pub kinematic: bool,
    /// Dead slots are skipped by every pass.
    pub alive: bool,
    /// Owning articulation link, if any.
    pub link_ref: Option<LinkRef>,
    /// Per-body angular velocity cap (rad/s).
    pub angular_velocity_limit: f64,
    /// Whether sleep assistance may suppress small velocities.
    pub sleep_allowed: bool,
    /// Consecutive frames below the sleep energy threshold.
    pub sleep_frames: u32,
}

impl Body {
    /// Create a dynamic body at rest.
    #[must_use]
    pub fn new(props: MassProperties, pose: Pose) -> Self {
        let mut body = Self {
            pose,
            twist: Twist::zero(),
            mass: props.mass,
            inv_mass: 1.0 / props.mass,
            inertia: SymMat3::identity(),
            inv_inertia: SymMat3::identity(),
            principal_inertia: props.principal_inertia,
            inertia_rotation: props.inertia_rotation,
            kinematic: false,
            alive: true,
            link_ref: None,
            angular_velocity_limit: 100.0,
            sleep_allowed: true,
            sleep_frames: 0,
        };
        body.update_world_inertia();
        body
    }

    /// Create a kinematic (infinite-mass) body: the solver reads its pose
    /// and velocity but never accelerates it.
    #[must_use]
    pub fn new_kinematic(props: MassProperties, pose: Pose) -> Self {
        let mut body = Self::new(props, pose);
        body.kinematic = true;
        body.inv_mass = 0.0;
        body.update_world_inertia();
        body
    }

    /// Re-derive the world-space inertia tensor and its inverse from the
    /// current orientation. Called once per tick before any solving.
    pub fn update_world_inertia(&mut self) {
        let world_rot = self.pose.rotation * self.inertia_rotation;
        self.inertia = SymMat3::from_principal(&self.principal_inertia, &world_rot);
        self.inv_inertia = if self.kinematic {
            SymMat3::zero()
        } else {
            self.inertia.try_inverse().unwrap_or_else(SymMat3::zero)
        };
    }

    /// Velocity of a world-space point rigidly attached to this body.
    #[must_use]
    pub fn velocity_at_world_point(&self, point: &Point3<f64>) -> Vector3<f64> {
        self.twist.translated(&(point - self.pose.position)).linear
    }

    /// Mass-normalized kinetic energy, the sleep metric.
    #[must_use]
    pub fn normalized_kinetic_energy(&self) -> f64 {
        let linear = 0.5 * self.mass * self.twist.linear.norm_squared();
        let w = self.twist.angular;
        let angular = 0.5
            * (self.inertia.m00 * w.x * w.x
                + self.inertia.m11 * w.y * w.y
                + self.inertia.m22 * w.z * w.z);
        (linear + angular) / self.mass
    }

    /// Linear momentum.
    #[must_use]
    pub fn linear_momentum(&self) -> Vector3<f64> {
        self.twist.linear * self.mass
    }

    /// Angular momentum about a world-space point.
    #[must_use]
    pub fn angular_momentum_about(&self, point: &Point3<f64>) -> Vector3<f64> {
        self.inertia.mul_vec(&self.twist.angular)
            + (self.pose.position - point).cross(&(self.twist.linear * self.mass))
    }
}
