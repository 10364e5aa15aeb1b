//! Body access and velocity storage for one solve call.
//!
//! Solvers never mutate bodies directly. A [`SolverContext`] hands out
//! body state (pose, mass, inertia) and a velocity per link - and where
//! that velocity lives depends on the caller: articulation and block
//! solves copy their links' velocities into a scratch buffer, mutate the
//! copy freely and write it back atomically at the end of the call, which
//! is what lets two articulations with disjoint bodies run in parallel
//! without locks.
//!
//! Velocities are stored as two 4-wide lanes per link (angular at
//! `2 link`, linear at `2 link + 1`, fourth component zero) so they line
//! up with the Jacobian's body column blocks.

use armature_types::{ArticulatedInertia, Body, LinkRef, Twist};
use nalgebra::{Point3, Vector3, Vector4};

/// Body and velocity access during a solve, plus detection of links that
/// belong to an already-solved articulation (used by constraint blocks to
/// substitute articulated inverse inertia).
pub trait SolverContext {
    /// Number of links visible to this context.
    fn link_count(&self) -> usize;

    /// Body state of a link.
    fn body(&self, link: usize) -> &Body;

    /// One 4-wide velocity lane (angular lanes at even indices, linear at
    /// odd).
    fn lane(&self, lane: usize) -> Vector4<f64>;

    /// Mutable access to a velocity lane.
    fn lane_mut(&mut self, lane: usize) -> &mut Vector4<f64>;

    /// Whether this link aliases a link of another, already-solved
    /// articulation.
    fn is_articulated(&self, _link: usize) -> bool {
        false
    }

    /// Articulated inverse inertia for links where [`Self::is_articulated`]
    /// holds.
    fn articulated_inverse_inertia(&self, _link: usize) -> &ArticulatedInertia {
        unreachable!("link is not articulated")
    }

    // --- derived operations -------------------------------------------------

    /// Current twist of a link.
    fn twist(&self, link: usize) -> Twist {
        debug_assert!(link < self.link_count());
        Twist::new(
            self.lane(2 * link).xyz(),
            self.lane(2 * link + 1).xyz(),
        )
    }

    /// Set a link's twist. A non-finite twist is logged and dropped, the
    /// previous value stays.
    fn set_twist(&mut self, link: usize, twist: Twist) {
        if !twist.is_finite() {
            tracing::warn!(link, "skipping non-finite velocity write");
            return;
        }
        *self.lane_mut(2 * link) = Vector4::new(twist.angular.x, twist.angular.y, twist.angular.z, 0.0);
        *self.lane_mut(2 * link + 1) = Vector4::new(twist.linear.x, twist.linear.y, twist.linear.z, 0.0);
    }

    /// Add a twist delta to a link.
    fn add_twist(&mut self, link: usize, delta: Twist) {
        let v = self.twist(link) + delta;
        self.set_twist(link, v);
    }

    /// Transform a local anchor to world space; `None` anchors are already
    /// world-space.
    fn transform_point(&self, link: Option<usize>, anchor: &Vector3<f64>) -> Vector3<f64> {
        match link {
            Some(l) => self.body(l).pose.transform_point(&Point3::from(*anchor)).coords,
            None => *anchor,
        }
    }

    /// Rotate a local direction to world space.
    fn transform_direction(&self, link: Option<usize>, dir: &Vector3<f64>) -> Vector3<f64> {
        match link {
            Some(l) => self.body(l).pose.transform_vector(dir),
            None => *dir,
        }
    }

    /// Apply an impulse at the center of mass.
    fn apply_impulse(&mut self, link: usize, angular: &Vector3<f64>, linear: &Vector3<f64>) {
        let body = self.body(link);
        let delta = Twist::new(
            body.inv_inertia.mul_vec(angular),
            body.inv_mass * linear,
        );
        self.add_twist(link, delta);
    }

    /// Apply a linear impulse at a local anchor point.
    fn apply_impulse_at_local_point(
        &mut self,
        link: usize,
        impulse: &Vector3<f64>,
        anchor: &Vector3<f64>,
    ) {
        let r = self.body(link).pose.transform_vector(anchor);
        self.apply_impulse_at_offset(link, impulse, &r);
    }

    /// Apply a linear impulse at an offset from the center of mass.
    fn apply_impulse_at_offset(
        &mut self,
        link: usize,
        impulse: &Vector3<f64>,
        r: &Vector3<f64>,
    ) {
        let torque = r.cross(impulse);
        self.apply_impulse(link, &torque, impulse);
    }

    /// Mass-weighted center of mass of a link range.
    fn center_of_mass(&self, start: usize, count: usize) -> Vector3<f64> {
        let mut total = Vector3::zeros();
        let mut mass = 0.0;
        for l in start..start + count {
            let body = self.body(l);
            mass += body.mass;
            total += body.mass * body.pose.position.coords;
        }
        total / mass
    }
}

/// Copy the velocities of `links` into 4-wide scratch lanes.
pub(crate) fn extract_lanes(bodies: &[Body], links: &[usize]) -> Vec<Vector4<f64>> {
    let mut v = Vec::with_capacity(links.len() * 2);
    for &id in links {
        let twist = bodies[id].twist;
        v.push(Vector4::new(twist.angular.x, twist.angular.y, twist.angular.z, 0.0));
        v.push(Vector4::new(twist.linear.x, twist.linear.y, twist.linear.z, 0.0));
    }
    v
}

/// Write scratch lanes back to the bodies. Non-finite results are logged
/// and dropped so a diverging solve cannot poison the body state.
pub(crate) fn write_back_lanes(bodies: &mut [Body], links: &[usize], v: &[Vector4<f64>]) {
    for (i, &id) in links.iter().enumerate() {
        let twist = Twist::new(v[2 * i].xyz(), v[2 * i + 1].xyz());
        if !twist.is_finite() {
            tracing::warn!(body = id, "skipping non-finite velocity write-back");
            continue;
        }
        bodies[id].twist = twist;
    }
}

/// Context for an articulation solving its own links: scratch velocities,
/// plain rigid inertias.
pub struct ArticulationContext<'a> {
    bodies: &'a [Body],
    links: &'a [usize],
    v: &'a mut [Vector4<f64>],
}

impl<'a> ArticulationContext<'a> {
    /// Bind world bodies, the articulation's link list and a scratch
    /// velocity buffer (two lanes per link).
    pub fn new(bodies: &'a [Body], links: &'a [usize], v: &'a mut [Vector4<f64>]) -> Self {
        debug_assert_eq!(v.len(), links.len() * 2);
        Self { bodies, links, v }
    }
}

impl SolverContext for ArticulationContext<'_> {
    fn link_count(&self) -> usize {
        self.links.len()
    }

    fn body(&self, link: usize) -> &Body {
        debug_assert!(link < self.links.len());
        &self.bodies[self.links[link]]
    }

    fn lane(&self, lane: usize) -> Vector4<f64> {
        self.v[lane]
    }

    fn lane_mut(&mut self, lane: usize) -> &mut Vector4<f64> {
        &mut self.v[lane]
    }
}

/// Context for a constraint block: like [`ArticulationContext`], but links
/// that alias another articulation report their precomputed articulated
/// inverse inertia.
pub struct BlockContext<'a> {
    bodies: &'a [Body],
    links: &'a [usize],
    link_refs: &'a [Option<LinkRef>],
    inertias: &'a [ArticulatedInertia],
    v: &'a mut [Vector4<f64>],
}

impl<'a> BlockContext<'a> {
    /// Bind world bodies, the block's links, per-link articulation
    /// back-references and the refreshed articulated inertias.
    pub fn new(
        bodies: &'a [Body],
        links: &'a [usize],
        link_refs: &'a [Option<LinkRef>],
        inertias: &'a [ArticulatedInertia],
        v: &'a mut [Vector4<f64>],
    ) -> Self {
        debug_assert_eq!(v.len(), links.len() * 2);
        debug_assert_eq!(link_refs.len(), links.len());
        debug_assert_eq!(inertias.len(), links.len());
        Self {
            bodies,
            links,
            link_refs,
            inertias,
            v,
        }
    }
}

impl SolverContext for BlockContext<'_> {
    fn link_count(&self) -> usize {
        self.links.len()
    }

    fn body(&self, link: usize) -> &Body {
        debug_assert!(link < self.links.len());
        &self.bodies[self.links[link]]
    }

    fn lane(&self, lane: usize) -> Vector4<f64> {
        self.v[lane]
    }

    fn lane_mut(&mut self, lane: usize) -> &mut Vector4<f64> {
        &mut self.v[lane]
    }

    fn is_articulated(&self, link: usize) -> bool {
        self.link_refs[link].is_some()
    }

    fn articulated_inverse_inertia(&self, link: usize) -> &ArticulatedInertia {
        &self.inertias[link]
    }
}
