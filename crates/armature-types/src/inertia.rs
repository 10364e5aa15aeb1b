//! Packed symmetric matrices and articulated inverse inertia.
//!
//! Inertia tensors and their inverses are symmetric, so they are stored
//! lower-triangular packed ([`SymMat3`], six scalars instead of nine). The
//! effective inverse inertia of a link inside an already-solved kinematic
//! tree is a full 6x6 symmetric operator with rotational, coupling and
//! translational blocks ([`ArticulatedInertia`]).

use nalgebra::{Matrix3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Symmetric 3x3 matrix, lower triangle packed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SymMat3 {
    /// Row 0: diagonal element.
    pub m00: f64,
    /// Row 1.
    pub m10: f64,
    /// Row 1: diagonal element.
    pub m11: f64,
    /// Row 2.
    pub m20: f64,
    /// Row 2.
    pub m21: f64,
    /// Row 2: diagonal element.
    pub m22: f64,
}

impl SymMat3 {
    /// All-zero matrix.
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// Identity matrix.
    #[must_use]
    pub fn identity() -> Self {
        Self::from_diagonal(&Vector3::new(1.0, 1.0, 1.0))
    }

    /// Diagonal matrix from a vector.
    #[must_use]
    pub fn from_diagonal(d: &Vector3<f64>) -> Self {
        Self {
            m00: d.x,
            m11: d.y,
            m22: d.z,
            ..Self::default()
        }
    }

    /// Pack the symmetric part of a dense matrix (lower triangle is read).
    #[must_use]
    pub fn from_matrix(m: &Matrix3<f64>) -> Self {
        Self {
            m00: m[(0, 0)],
            m10: m[(1, 0)],
            m11: m[(1, 1)],
            m20: m[(2, 0)],
            m21: m[(2, 1)],
            m22: m[(2, 2)],
        }
    }

    /// Unpack to a dense matrix.
    #[must_use]
    pub fn to_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.m00, self.m10, self.m20, //
            self.m10, self.m11, self.m21, //
            self.m20, self.m21, self.m22,
        )
    }

    /// Matrix-vector product.
    #[must_use]
    pub fn mul_vec(&self, v: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(
            self.m00 * v.x + self.m10 * v.y + self.m20 * v.z,
            self.m10 * v.x + self.m11 * v.y + self.m21 * v.z,
            self.m20 * v.x + self.m21 * v.y + self.m22 * v.z,
        )
    }

    /// Inverse, if the matrix is non-singular.
    #[must_use]
    pub fn try_inverse(&self) -> Option<Self> {
        self.to_matrix().try_inverse().map(|m| Self::from_matrix(&m))
    }

    /// World-space inertia from principal moments and a world tensor
    /// rotation: R diag(principal) R^T.
    #[must_use]
    pub fn from_principal(
        principal: &Vector3<f64>,
        rotation: &nalgebra::UnitQuaternion<f64>,
    ) -> Self {
        let r = rotation.to_rotation_matrix();
        let m = r.matrix() * Matrix3::from_diagonal(principal) * r.matrix().transpose();
        Self::from_matrix(&m)
    }

    /// Sum of diagonal elements.
    #[must_use]
    pub fn trace(&self) -> f64 {
        self.m00 + self.m11 + self.m22
    }
}

impl std::ops::Add for SymMat3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            m00: self.m00 + rhs.m00,
            m10: self.m10 + rhs.m10,
            m11: self.m11 + rhs.m11,
            m20: self.m20 + rhs.m20,
            m21: self.m21 + rhs.m21,
            m22: self.m22 + rhs.m22,
        }
    }
}

impl std::ops::Mul<f64> for SymMat3 {
    type Output = Self;
    fn mul(self, s: f64) -> Self {
        Self {
            m00: self.m00 * s,
            m10: self.m10 * s,
            m11: self.m11 * s,
            m20: self.m20 * s,
            m21: self.m21 * s,
            m22: self.m22 * s,
        }
    }
}

/// Effective 6x6 inverse inertia of a link as seen from outside its
/// kinematic tree.
///
/// Applying a wrench `(tau, f)` yields the twist
///
/// ```text
/// angular = I tau + H f
/// linear  = H^T tau + M f
/// ```
///
/// where `I` is the rotational block, `M` the translational block and `H`
/// the coupling block (row i of `H` is the linear response to a unit
/// angular impulse about axis i). For an isolated rigid body `H` is zero,
/// `M` is `1/m` on the diagonal and `I` is the inverse inertia tensor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ArticulatedInertia {
    /// Translational block (linear response to linear impulse).
    pub m: SymMat3,
    /// Coupling block.
    pub h: Matrix3<f64>,
    /// Rotational block (angular response to angular impulse).
    pub i: SymMat3,
}

impl ArticulatedInertia {
    /// Construct from the three blocks.
    #[must_use]
    pub const fn new(m: SymMat3, h: Matrix3<f64>, i: SymMat3) -> Self {
        Self { m, h, i }
    }

    /// Inverse inertia of an isolated rigid body: no coupling.
    #[must_use]
    pub fn from_rigid(inv_mass: f64, inv_inertia: &SymMat3) -> Self {
        Self {
            m: SymMat3::from_diagonal(&Vector3::new(inv_mass, inv_mass, inv_mass)),
            h: Matrix3::zeros(),
            i: *inv_inertia,
        }
    }

    /// Twist response to a wrench.
    #[must_use]
    pub fn apply(&self, tau: &Vector3<f64>, f: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
        let angular = self.i.mul_vec(tau) + self.h * f;
        let linear = self.h.transpose() * tau + self.m.mul_vec(f);
        (angular, linear)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn pack_unpack_round_trip() {
        let m = Matrix3::new(
            2.0, -1.0, 0.5, //
            -1.0, 3.0, 0.25, //
            0.5, 0.25, 4.0,
        );
        let packed = SymMat3::from_matrix(&m);
        assert_relative_eq!(packed.to_matrix(), m, epsilon = 1e-12);
    }

    #[test]
    fn mul_vec_matches_dense() {
        let m = Matrix3::new(
            2.0, -1.0, 0.5, //
            -1.0, 3.0, 0.25, //
            0.5, 0.25, 4.0,
        );
        let packed = SymMat3::from_matrix(&m);
        let v = Vector3::new(1.0, -2.0, 3.0);
        assert_relative_eq!(packed.mul_vec(&v), m * v, epsilon = 1e-12);
    }

    #[test]
    fn try_inverse_matches_dense() {
        let packed = SymMat3::from_diagonal(&Vector3::new(2.0, 4.0, 8.0));
        let inv = packed.try_inverse().unwrap();
        assert_relative_eq!(inv.m00, 0.5, epsilon = 1e-12);
        assert_relative_eq!(inv.m11, 0.25, epsilon = 1e-12);
        assert_relative_eq!(inv.m22, 0.125, epsilon = 1e-12);
    }

    #[test]
    fn principal_inertia_rotates_with_body() {
        let principal = Vector3::new(1.0, 2.0, 3.0);
        // 90 degrees about Z swaps the X and Y moments.
        let rot = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2);
        let world = SymMat3::from_principal(&principal, &rot);
        assert_relative_eq!(world.m00, 2.0, epsilon = 1e-10);
        assert_relative_eq!(world.m11, 1.0, epsilon = 1e-10);
        assert_relative_eq!(world.m22, 3.0, epsilon = 1e-10);
    }

    #[test]
    fn rigid_articulated_inertia_has_no_coupling() {
        let inv_i = SymMat3::from_diagonal(&Vector3::new(0.5, 0.5, 0.5));
        let ai = ArticulatedInertia::from_rigid(0.25, &inv_i);
        let (ang, lin) = ai.apply(&Vector3::x(), &Vector3::y());
        assert_relative_eq!(ang, Vector3::new(0.5, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(lin, Vector3::new(0.0, 0.25, 0.0), epsilon = 1e-12);
    }
}
