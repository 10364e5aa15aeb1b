//! Soft-constraint springs.
//!
//! Every constrained axis owns a `Spring`. Each tick the spring's
//! stiffness/damping pair is folded into the linear system as a
//! constraint-force-mixing factor (`gamma`, added to K's diagonal) and a
//! bias velocity (error correction plus any explicit target velocity):
//!
//! ```text
//! gamma = 1 / (h (kd + h kp))
//! bias  = h kp gamma err + vel_err
//! ```
//!
//! Two degenerate modes bypass that formula. `kp < 0` means fully rigid:
//! gamma and bias are exactly zero and the row becomes a hard velocity
//! constraint. Both gains under [`Spring::EPSILON`] means fully free: the
//! row is disabled with `gamma = 1, bias = 0`, which keeps K invertible
//! while the joint writes a zero Jacobian row.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Damping is blended on a gentler power curve than stiffness so a relaxed
/// spring can go underdamped instead of oscillating.
const DAMPER_LERP_POWER: f64 = 1.25;

/// Stiffness and damping of one constrained axis, with optional one-sided
/// force limits.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Spring {
    /// Proportional gain on positional error.
    pub kp: f64,
    /// Derivative gain on velocity error.
    pub kd: f64,
    /// Force limit on the negative side (0 = unlimited).
    pub min_force: f64,
    /// Force limit on the positive side (0 = unlimited).
    pub max_force: f64,
}

impl Spring {
    /// Gains below this are degenerate and would produce near-singular
    /// constraint rows.
    pub const EPSILON: f64 = 1e-4;

    /// A disabled spring: the axis is unconstrained.
    #[must_use]
    pub fn free() -> Self {
        Self::new(0.0, 0.0)
    }

    /// A fully rigid spring: the axis becomes a hard velocity constraint.
    #[must_use]
    pub fn stiff() -> Self {
        Self::new(-1.0, -1.0)
    }

    /// Spring with the given gains and no force limit.
    #[must_use]
    pub fn new(kp: f64, kd: f64) -> Self {
        Self {
            kp,
            kd,
            min_force: 0.0,
            max_force: 0.0,
        }
    }

    /// Spring with a symmetric force limit.
    #[must_use]
    pub fn with_limit(kp: f64, kd: f64, max_force: f64) -> Self {
        Self {
            kp,
            kd,
            min_force: max_force,
            max_force,
        }
    }

    /// Whether this spring disables its row.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.kp >= 0.0 && self.kd >= 0.0 && self.kp < Self::EPSILON && self.kd < Self::EPSILON
    }

    /// Blend two springs. Stiffness blends on a square law (spring rate is
    /// quadratic in perceived strength), damping on the gentler
    /// [`DAMPER_LERP_POWER`] curve, and a missing force limit on either
    /// side adopts the other side's limit.
    #[must_use]
    pub fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        let blend_limit = |la: f64, lb: f64| {
            if la == 0.0 {
                lb
            } else if lb == 0.0 {
                la
            } else {
                square_lerp(la, lb, t)
            }
        };
        Self {
            kp: square_lerp(a.kp, b.kp, t),
            kd: pow_lerp(a.kd, b.kd, t, DAMPER_LERP_POWER),
            min_force: blend_limit(a.min_force, b.min_force),
            max_force: blend_limit(a.max_force, b.max_force),
        }
    }

    /// Gamma (CFM) and bias for the current error state.
    ///
    /// If the spring force `kp err + kd vel_err` exceeds a configured
    /// limit, the gains are rescaled to softly clamp the force - but never
    /// below 1% of their configured value, which would make the row
    /// ill-conditioned.
    #[must_use]
    pub fn calculate(&self, err: f64, vel_err: f64, h: f64) -> (f64, f64) {
        let force = err * self.kp + vel_err * self.kd;
        let (gamma, beta) = if self.max_force != 0.0 && force > self.max_force {
            let scale = (soft_clamp(force, self.max_force) / force).max(0.01);
            beta_gamma(
                self.kp * scale,
                self.kd * scale.powf(DAMPER_LERP_POWER),
                h,
            )
        } else if self.min_force != 0.0 && force < -self.min_force {
            let scale = (soft_clamp(force, self.min_force) / force).max(0.01);
            beta_gamma(
                self.kp * scale,
                self.kd * scale.powf(DAMPER_LERP_POWER),
                h,
            )
        } else {
            beta_gamma(self.kp, self.kd, h)
        };
        (gamma, beta * err + vel_err)
    }
}

impl std::ops::Mul<f64> for Spring {
    type Output = Self;

    /// Scale a spring's strength. Stiffness and force limits scale on a
    /// square law, damping on the damper power curve.
    fn mul(self, weight: f64) -> Self {
        let w = weight.max(0.0);
        Self {
            kp: self.kp * w * w,
            kd: self.kd * w.powf(DAMPER_LERP_POWER),
            min_force: self.min_force * w * w,
            max_force: self.max_force * w * w,
        }
    }
}

fn beta_gamma(kp: f64, kd: f64, h: f64) -> (f64, f64) {
    if kp < 0.0 {
        // Rigid joint.
        (0.0, 0.0)
    } else if kp < Spring::EPSILON && kd < Spring::EPSILON {
        // Disabled joint: force K to identity, too-weak gains break the
        // inverse.
        (1.0, 0.0)
    } else {
        let g = h * (kd + h * kp);
        let gamma = if g >= Spring::EPSILON { 1.0 / g } else { 0.0 };
        (gamma, h * kp * gamma)
    }
}

fn square_lerp(a: f64, b: f64, t: f64) -> f64 {
    let blend = a.max(0.0).sqrt() * (1.0 - t) + b.max(0.0).sqrt() * t;
    blend * blend
}

fn pow_lerp(a: f64, b: f64, t: f64, p: f64) -> f64 {
    let blend = a.max(0.0).powf(1.0 / p) * (1.0 - t) + b.max(0.0).powf(1.0 / p) * t;
    blend.max(0.0).powf(p)
}

/// Clamp with a soft knee: the identity below `max`, asymptotic to
/// `2 max` as the value grows without bound.
fn soft_clamp(val: f64, max: f64) -> f64 {
    if (-max..=max).contains(&val) {
        return val;
    }
    let sign = val.signum();
    let p = sign * val / max;
    (2.0 - 0.5f64.powf(p - 1.0)) * max * sign
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const H: f64 = 1.0 / 50.0;

    #[test]
    fn rigid_spring_is_exactly_zero() {
        let (gamma, bias) = Spring::stiff().calculate(0.3, -1.0, H);
        assert_eq!(gamma, 0.0);
        assert_eq!(bias, -1.0); // vel_err passes through
    }

    #[test]
    fn rigid_spring_zero_velocity_error() {
        let (gamma, bias) = Spring::stiff().calculate(0.3, 0.0, H);
        assert_eq!(gamma, 0.0);
        assert_eq!(bias, 0.0);
    }

    #[test]
    fn free_spring_is_identity_row() {
        let (gamma, bias) = Spring::free().calculate(10.0, 10.0, H);
        assert_eq!(gamma, 1.0);
        assert_eq!(bias, 10.0); // only vel_err survives, beta is zero
    }

    #[test]
    fn gamma_is_finite_and_nonnegative_for_valid_gains() {
        for &kp in &[0.0, 1e-3, 1.0, 100.0, 1e6] {
            for &kd in &[0.0, 1e-3, 1.0, 100.0] {
                let (gamma, bias) = Spring::new(kp, kd).calculate(0.1, 0.2, H);
                assert!(gamma.is_finite() && gamma >= 0.0, "kp={kp} kd={kd}");
                assert!(bias.is_finite());
            }
        }
    }

    #[test]
    fn soft_spring_matches_catto_formula() {
        let spring = Spring::new(100.0, 10.0);
        let (gamma, bias) = spring.calculate(0.5, -0.1, H);
        let expected_gamma = 1.0 / (H * (10.0 + H * 100.0));
        let expected_bias = H * 100.0 * expected_gamma * 0.5 - 0.1;
        assert_relative_eq!(gamma, expected_gamma, epsilon = 1e-12);
        assert_relative_eq!(bias, expected_bias, epsilon = 1e-12);
    }

    #[test]
    fn force_limit_softens_but_never_kills_the_row() {
        let spring = Spring::with_limit(1000.0, 10.0, 1.0);
        // Huge error: force would be 1000x the limit.
        let (gamma, bias) = spring.calculate(1000.0, 0.0, H);
        assert!(gamma.is_finite() && gamma > 0.0);
        assert!(bias.is_finite());
        // The clamped row must be softer (larger gamma) than unclamped.
        let (unclamped_gamma, _) = Spring::new(1000.0, 10.0).calculate(1000.0, 0.0, H);
        assert!(gamma > unclamped_gamma);
    }

    #[test]
    fn soft_clamp_knee() {
        assert_relative_eq!(soft_clamp(0.5, 1.0), 0.5, epsilon = 1e-12);
        assert!(soft_clamp(10.0, 1.0) < 2.0);
        assert!(soft_clamp(10.0, 1.0) > 1.0);
        assert!(soft_clamp(-10.0, 1.0) > -2.0);
        assert!(soft_clamp(-10.0, 1.0) < -1.0);
    }

    #[test]
    fn lerp_endpoints() {
        let a = Spring::new(100.0, 10.0);
        let b = Spring::new(400.0, 20.0);
        let at_a = Spring::lerp(&a, &b, 0.0);
        let at_b = Spring::lerp(&a, &b, 1.0);
        assert_relative_eq!(at_a.kp, 100.0, epsilon = 1e-9);
        assert_relative_eq!(at_b.kp, 400.0, epsilon = 1e-9);
    }

    #[test]
    fn scaling_to_zero_disables() {
        let spring = Spring::new(100.0, 10.0) * 0.0;
        assert!(spring.is_free());
    }
}
