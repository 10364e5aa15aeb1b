//! Coupling two independent articulations through a constraint block, and
//! the impulse-response queries a host builds on.

use armature_world::{
    Body, Joint, LinearJoint, MassProperties, Pose, SolverConfig, Spring, World,
};
use approx::assert_relative_eq;
use nalgebra::{Point3, Vector3};

const H: f64 = 1.0 / 50.0;

fn sphere_at(x: f64, y: f64) -> Body {
    Body::new(
        MassProperties::sphere(1.0, 0.5),
        Pose::from_position(Point3::new(x, y, 0.0)),
    )
}

/// Two hanging 2-body chains, side by side, each pinned to a kinematic
/// anchor body; a constraint block ties their lowest links together.
fn build_coupled_world() -> (World, [usize; 4], usize) {
    let mut world = World::with_config(H, 8, SolverConfig::default().undamped()).unwrap();
    world.set_gravity(Vector3::zeros());

    let mut ids = [0usize; 4];
    for (chain, x) in [(0usize, 0.0), (1usize, 2.0)] {
        let anchor = world.register_body(Body::new_kinematic(
            MassProperties::sphere(1.0, 0.5),
            Pose::from_position(Point3::new(x, 0.0, 0.0)),
        ));
        let lower = world.register_body(sphere_at(x, -1.0));
        ids[chain * 2] = anchor;
        ids[chain * 2 + 1] = lower;

        let mut hang = LinearJoint::rigid(
            Some(1),
            Some(0),
            Vector3::new(0.0, 0.5, 0.0),
            Vector3::new(0.0, -0.5, 0.0),
        );
        hang.spring = Spring::new(1e4, 100.0);
        world
            .add_articulation(vec![anchor, lower], vec![Joint::Linear(hang)])
            .unwrap();
    }

    // The block spans the two lower links, which belong to different
    // articulations.
    let mut tie = LinearJoint::rigid(
        Some(1),
        Some(0),
        Vector3::new(-1.0, 0.0, 0.0),
        Vector3::new(1.0, 0.0, 0.0),
    );
    tie.spring = Spring::new(1e4, 100.0);
    let block = world
        .add_constraint_block(vec![ids[1], ids[3]], vec![Joint::Linear(tie)])
        .unwrap();
    (world, ids, block)
}

#[test]
fn block_couples_independent_trees() {
    let (mut world, ids, _) = build_coupled_world();
    // Pull the chains apart.
    world.body_mut(ids[1]).twist.linear = Vector3::new(-1.0, 0.0, 0.0);
    world.body_mut(ids[3]).twist.linear = Vector3::new(1.0, 0.0, 0.0);

    let separation_rate = |world: &World| {
        (world.body(ids[3]).twist.linear - world.body(ids[1]).twist.linear).x
    };
    assert_relative_eq!(separation_rate(&world), 2.0, epsilon = 1e-12);

    for _ in 0..5 {
        world.step();
        world.integrate_poses();
    }

    // The tie must have pulled the relative velocity down by an order of
    // magnitude; without the block the chains cannot interact at all.
    assert!(
        separation_rate(&world).abs() < 0.2,
        "chains still separating at {} m/s",
        separation_rate(&world)
    );
}

#[test]
fn impulse_response_reflects_the_pin() {
    let (mut world, _ids, _) = build_coupled_world();
    world.update_inertias();
    world.build_articulation_jacobians();

    // Link 1 of articulation 0 hangs from a kinematic anchor: vertical
    // response is strongly suppressed, horizontal response stays near the
    // free 1/m.
    let response = world.impulse_response(0, 1, &Vector3::zeros());
    assert!(response[(1, 1)] < 0.2, "vertical response {}", response[(1, 1)]);
    assert!(response[(0, 0)] > 0.5, "horizontal response {}", response[(0, 0)]);

    // The response operator at the center of mass is symmetric.
    for r in 0..3 {
        for c in 0..3 {
            assert_relative_eq!(response[(r, c)], response[(c, r)], epsilon = 1e-8);
        }
    }
}

#[test]
fn applied_impulse_respects_articulation() {
    let (mut world, ids, _) = build_coupled_world();
    world.update_inertias();
    world.build_articulation_jacobians();

    // Push the hanging link straight down; the hang joint resists, so the
    // resulting speed must be well under the free-body response of 1 m/s.
    world.apply_impulse(0, 1, None, &Vector3::new(0.0, -1.0, 0.0));
    let v = world.body(ids[1]).twist.linear;
    assert!(
        v.y.abs() < 0.5,
        "hang joint failed to absorb the impulse: {v:?}"
    );
}
