//! Per-body damping and velocity safety rails (phase 4).
//!
//! A small constant friction lets bodies actually reach zero velocity and
//! sleep; the self-aligning torque term cancels the gyroscopic drift that
//! an explicit integrator pumps into spinning bodies. Terminal clamps are
//! stability safeguards, applied silently every tick.

use armature_types::{Body, SolverConfig};
use nalgebra::Vector3;

/// Cap a vector's norm.
pub(crate) fn clamp_norm(v: Vector3<f64>, max: f64) -> Vector3<f64> {
    let n = v.norm();
    if n > max {
        v * (max / n)
    } else {
        v
    }
}

/// Move a vector toward zero by at most `max_delta` in norm.
fn move_toward_zero(v: Vector3<f64>, max_delta: f64) -> Vector3<f64> {
    let n = v.norm();
    if n <= max_delta {
        Vector3::zeros()
    } else {
        v * ((n - max_delta) / n)
    }
}

/// Friction and self-aligning damping for one body. Free-standing bodies
/// (no owning articulation) also get their per-body velocity limits here;
/// articulation links are clamped articulation-wide instead.
pub(crate) fn friction_and_self_align(body: &mut Body, config: &SolverConfig, h: f64) {
    let moving_angular = body.twist.angular != Vector3::zeros();
    let moving_linear = body.twist.linear != Vector3::zeros();

    if moving_angular {
        body.twist.angular =
            move_toward_zero(body.twist.angular, config.angular_friction_acceleration * h);

        let w = clamp_norm(body.twist.angular, 10.0);
        let self_aligning_torque = w.cross(&body.inertia.mul_vec(&w));
        let acc = body.inv_inertia.mul_vec(&self_aligning_torque);
        body.twist.angular -= acc * config.self_aligning * h;
    }

    if moving_linear {
        body.twist.linear =
            move_toward_zero(body.twist.linear, config.linear_friction_acceleration * h);
    }

    if (moving_angular || moving_linear) && body.link_ref.is_none() {
        limit_body_velocity(body, config);
    }
}

/// Per-body angular cap plus the terminal fall / absolute speed clamps.
pub(crate) fn limit_body_velocity(body: &mut Body, config: &SolverConfig) {
    body.twist.angular = clamp_norm(body.twist.angular, body.angular_velocity_limit);

    let v = body.twist.linear;
    if v.y < -config.terminal_fall_velocity || v.norm() > config.terminal_velocity {
        let mut limited = v;
        limited.y = limited.y.max(-config.terminal_fall_velocity);
        body.twist.linear = clamp_norm(limited, config.terminal_velocity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armature_types::{MassProperties, Pose, Twist};
    use approx::assert_relative_eq;

    fn body() -> Body {
        Body::new(MassProperties::sphere(1.0, 0.5), Pose::identity())
    }

    #[test]
    fn friction_stops_slow_bodies() {
        let mut b = body();
        let config = SolverConfig::default();
        b.twist = Twist::linear(Vector3::new(1e-4, 0.0, 0.0));
        friction_and_self_align(&mut b, &config, 1.0 / 50.0);
        assert_eq!(b.twist.linear, Vector3::zeros());
    }

    #[test]
    fn terminal_fall_velocity_is_clamped() {
        let mut b = body();
        let config = SolverConfig::default();
        b.twist = Twist::linear(Vector3::new(0.0, -100.0, 0.0));
        friction_and_self_align(&mut b, &config, 1.0 / 50.0);
        assert_relative_eq!(
            b.twist.linear.y,
            -config.terminal_fall_velocity,
            epsilon = 1e-9
        );
    }

    #[test]
    fn fast_horizontal_velocity_is_clamped_to_terminal() {
        let mut b = body();
        let config = SolverConfig::default();
        b.twist = Twist::linear(Vector3::new(100.0, 0.0, 0.0));
        friction_and_self_align(&mut b, &config, 1.0 / 50.0);
        assert!(b.twist.linear.norm() <= config.terminal_velocity + 1e-9);
    }

    #[test]
    fn articulation_links_skip_per_body_limits() {
        let mut b = body();
        b.link_ref = Some(armature_types::LinkRef {
            articulation: 0,
            link: 0,
        });
        let config = SolverConfig::default();
        b.twist = Twist::linear(Vector3::new(100.0, 0.0, 0.0));
        friction_and_self_align(&mut b, &config, 1.0 / 50.0);
        assert!(b.twist.linear.norm() > config.terminal_velocity);
    }
}
