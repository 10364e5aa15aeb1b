//! Spatial vectors and rigid transforms.
//!
//! Velocities and loads of a rigid body are six-dimensional: an angular and
//! a linear three-vector. [`Twist`] carries motion (angular velocity +
//! linear velocity), [`Wrench`] carries load (torque + force, or angular +
//! linear impulse). Both can be re-expressed about an offset point with
//! [`Twist::translated`] / [`Wrench::translated`].

use nalgebra::{Point3, UnitQuaternion, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Position and orientation of a rigid body, at its center of mass.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pose {
    /// Position in world coordinates.
    pub position: Point3<f64>,
    /// Orientation as a unit quaternion.
    pub rotation: UnitQuaternion<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    /// Identity pose: origin, no rotation.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            position: Point3::origin(),
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Pose from position only (identity rotation).
    #[must_use]
    pub fn from_position(position: Point3<f64>) -> Self {
        Self {
            position,
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Pose from position and rotation.
    #[must_use]
    pub const fn new(position: Point3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self { position, rotation }
    }

    /// Transform a local point to world coordinates.
    #[must_use]
    pub fn transform_point(&self, local: &Point3<f64>) -> Point3<f64> {
        self.position + self.rotation * local.coords
    }

    /// Transform a local direction to world coordinates (rotation only).
    #[must_use]
    pub fn transform_vector(&self, local: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * local
    }

    /// Transform a world point to local coordinates.
    #[must_use]
    pub fn inverse_transform_point(&self, world: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation.inverse() * (world - self.position))
    }

    /// Transform a world direction to local coordinates.
    #[must_use]
    pub fn inverse_transform_vector(&self, world: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.inverse() * world
    }

    /// Check for `NaN`/`Inf` components.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.position.coords.iter().all(|x| x.is_finite())
            && self.rotation.coords.iter().all(|x| x.is_finite())
    }
}

/// Advance a pose by a twist over one timestep.
///
/// Orientation uses the quaternion exponential of the angular velocity;
/// position is advanced linearly. This is the host's integrator contract:
/// the solver itself never moves positions, but hosts and tests share this
/// helper so both sides agree on what one tick of motion means.
#[must_use]
pub fn integrate_pose(pose: &Pose, twist: &Twist, h: f64) -> Pose {
    let scaled = twist.angular * h;
    let dq = UnitQuaternion::from_scaled_axis(scaled);
    Pose {
        position: pose.position + twist.linear * h,
        rotation: dq * pose.rotation,
    }
}

/// Angular and linear velocity of a rigid body.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Twist {
    /// Angular velocity (rad/s), world frame.
    pub angular: Vector3<f64>,
    /// Linear velocity (m/s), world frame.
    pub linear: Vector3<f64>,
}

impl Twist {
    /// Construct from angular and linear parts.
    #[must_use]
    pub const fn new(angular: Vector3<f64>, linear: Vector3<f64>) -> Self {
        Self { angular, linear }
    }

    /// Zero twist (at rest).
    #[must_use]
    pub fn zero() -> Self {
        Self {
            angular: Vector3::zeros(),
            linear: Vector3::zeros(),
        }
    }

    /// Twist with linear velocity only.
    #[must_use]
    pub fn linear(v: Vector3<f64>) -> Self {
        Self {
            angular: Vector3::zeros(),
            linear: v,
        }
    }

    /// Twist with angular velocity only.
    #[must_use]
    pub fn angular(omega: Vector3<f64>) -> Self {
        Self {
            angular: omega,
            linear: Vector3::zeros(),
        }
    }

    /// Velocity of the point displaced by `r` from the reference point:
    /// linear' = linear + angular x r.
    #[must_use]
    pub fn translated(&self, r: &Vector3<f64>) -> Self {
        Self {
            angular: self.angular,
            linear: self.linear + self.angular.cross(r),
        }
    }

    /// Check for `NaN`/`Inf` components.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.angular.iter().all(|x| x.is_finite()) && self.linear.iter().all(|x| x.is_finite())
    }
}

impl std::ops::Add for Twist {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            angular: self.angular + rhs.angular,
            linear: self.linear + rhs.linear,
        }
    }
}

impl std::ops::Sub for Twist {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            angular: self.angular - rhs.angular,
            linear: self.linear - rhs.linear,
        }
    }
}

impl std::ops::Neg for Twist {
    type Output = Self;
    fn neg(self) -> Self {
        Self {
            angular: -self.angular,
            linear: -self.linear,
        }
    }
}

impl std::ops::Mul<f64> for Twist {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        Self {
            angular: self.angular * rhs,
            linear: self.linear * rhs,
        }
    }
}

/// Torque and force (or angular and linear impulse) acting on a body.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Wrench {
    /// Torque (N m) or angular impulse.
    pub angular: Vector3<f64>,
    /// Force (N) or linear impulse.
    pub linear: Vector3<f64>,
}

impl Wrench {
    /// Construct from angular and linear parts.
    #[must_use]
    pub const fn new(angular: Vector3<f64>, linear: Vector3<f64>) -> Self {
        Self { angular, linear }
    }

    /// Zero wrench.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            angular: Vector3::zeros(),
            linear: Vector3::zeros(),
        }
    }

    /// Pure force, no torque.
    #[must_use]
    pub fn linear(f: Vector3<f64>) -> Self {
        Self {
            angular: Vector3::zeros(),
            linear: f,
        }
    }

    /// Pure torque, no force.
    #[must_use]
    pub fn angular(tau: Vector3<f64>) -> Self {
        Self {
            angular: tau,
            linear: Vector3::zeros(),
        }
    }

    /// Re-express the wrench about a point displaced by `r`:
    /// angular' = angular + linear x r.
    #[must_use]
    pub fn translated(&self, r: &Vector3<f64>) -> Self {
        Self {
            angular: self.angular + self.linear.cross(r),
            linear: self.linear,
        }
    }
}

impl std::ops::Add for Wrench {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            angular: self.angular + rhs.angular,
            linear: self.linear + rhs.linear,
        }
    }
}

impl std::ops::Sub for Wrench {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            angular: self.angular - rhs.angular,
            linear: self.linear - rhs.linear,
        }
    }
}

impl std::ops::Mul<f64> for Wrench {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        Self {
            angular: self.angular * rhs,
            linear: self.linear * rhs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pose_round_trip() {
        let pose = Pose::new(
            Point3::new(1.0, 2.0, 3.0),
            UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
        );
        let p = Point3::new(-0.5, 0.25, 4.0);
        let back = pose.inverse_transform_point(&pose.transform_point(&p));
        assert_relative_eq!(back.coords, p.coords, epsilon = 1e-12);
    }

    #[test]
    fn twist_translated_is_rigid_motion() {
        // Spinning about Z, velocity of a point 1m out along X is +Y.
        let twist = Twist::angular(Vector3::z());
        let v = twist.translated(&Vector3::x());
        assert_relative_eq!(v.linear, Vector3::y(), epsilon = 1e-12);
    }

    #[test]
    fn wrench_translated_adds_lever_torque() {
        // A force at an offset produces torque r x F about the new point.
        let f = Vector3::new(0.0, -9.81, 0.0);
        let w = Wrench::linear(f).translated(&-Vector3::x());
        assert_relative_eq!(w.angular, Vector3::x().cross(&f), epsilon = 1e-12);
    }

    #[test]
    fn integrate_pose_advances_position_linearly() {
        let pose = Pose::identity();
        let twist = Twist::linear(Vector3::new(1.0, 0.0, 0.0));
        let next = integrate_pose(&pose, &twist, 0.5);
        assert_relative_eq!(next.position.x, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn integrate_pose_rotates_about_angular_velocity() {
        let pose = Pose::identity();
        let twist = Twist::angular(Vector3::z() * std::f64::consts::FRAC_PI_2);
        let next = integrate_pose(&pose, &twist, 1.0);
        let world = next.transform_vector(&Vector3::x());
        assert_relative_eq!(world, Vector3::y(), epsilon = 1e-10);
    }
}
