//! Solver tuning parameters.
//!
//! Iteration counts and the velocity/sleep safety rails are empirically
//! tuned values, not derived constants, so they live in a config struct
//! instead of being hard-coded. The defaults reproduce the tuning the
//! solver shipped with; raise `iterations` for stiffer topologies.

use crate::ArmatureError;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tunable solver parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SolverConfig {
    /// Velocity iteration rounds per tick.
    pub iterations: usize,
    /// Absolute linear speed cap (m/s).
    pub terminal_velocity: f64,
    /// Downward (-Y) speed cap (m/s).
    pub terminal_fall_velocity: f64,
    /// Per-link speed cap relative to the articulation average (m/s).
    pub terminal_relative_velocity: f64,
    /// Constant deceleration applied to angular velocity (rad/s^2).
    pub angular_friction_acceleration: f64,
    /// Constant deceleration applied to linear velocity (m/s^2).
    pub linear_friction_acceleration: f64,
    /// Strength of the self-aligning torque term (0 disables).
    pub self_aligning: f64,
    /// Mass-normalized kinetic energy below which a body counts as
    /// sleep-eligible.
    pub sleep_threshold: f64,
    /// Safety multiplier applied to `sleep_threshold`.
    pub sleep_threshold_multiplier: f64,
    /// Frames below threshold before small velocities stop being written
    /// back to the host.
    pub sleep_frames: u32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            iterations: 3,
            terminal_velocity: 40.0,
            terminal_fall_velocity: 20.0,
            terminal_relative_velocity: 10.0,
            angular_friction_acceleration: 0.05,
            linear_friction_acceleration: 0.05,
            self_aligning: 1.0,
            sleep_threshold: 0.005,
            sleep_threshold_multiplier: 1.02,
            sleep_frames: 50,
        }
    }
}

impl SolverConfig {
    /// Config with a specific iteration count.
    #[must_use]
    pub fn with_iterations(iterations: usize) -> Self {
        Self {
            iterations,
            ..Self::default()
        }
    }

    /// Disable friction, self-aligning damping and sleep assistance.
    /// Useful for conservation tests and offline analysis.
    #[must_use]
    pub fn undamped(mut self) -> Self {
        self.angular_friction_acceleration = 0.0;
        self.linear_friction_acceleration = 0.0;
        self.self_aligning = 0.0;
        self.sleep_threshold = 0.0;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.iterations == 0 {
            return Err(ArmatureError::invalid_config(
                "at least one velocity iteration is required",
            ));
        }
        for (name, v) in [
            ("terminal_velocity", self.terminal_velocity),
            ("terminal_fall_velocity", self.terminal_fall_velocity),
            ("terminal_relative_velocity", self.terminal_relative_velocity),
        ] {
            if !(v > 0.0 && v.is_finite()) {
                return Err(ArmatureError::invalid_config(format!(
                    "{name} must be positive and finite"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(SolverConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_iterations_rejected() {
        assert!(SolverConfig::with_iterations(0).validate().is_err());
    }
}
