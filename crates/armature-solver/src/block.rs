//! Cross-articulation constraint blocks.
//!
//! A constraint block has the same shape as an articulation - links plus
//! joints plus one solver - but its links may alias bodies that belong to
//! *other* articulations. Before building its own Jacobian it refreshes
//! each aliased link's 6x6 articulated inverse inertia by querying the
//! owning articulation's factored system; the Jacobian weighting then uses
//! that coupled inertia instead of the raw rigid one, which is what lets
//! the block couple two independently-solved trees without re-deriving
//! their internal structure.
//!
//! Because a block touches live articulations, its velocity pass runs
//! after the articulation passes of the same round, and each block pass is
//! followed by one extra bias iteration on every distinct articulation it
//! references so those trees re-satisfy their internal constraints.

use armature_types::{ArmatureError, ArticulatedInertia, Body, LinkRef};

use crate::{Articulation, BlockContext, Joint, Solver};

/// A solver over links that may belong to other articulations.
pub struct ConstraintBlock {
    /// The constraint solver bound to this block's topology.
    pub solver: Solver,
    /// For each link, the articulation link it aliases (if any).
    link_refs: Vec<Option<LinkRef>>,
    /// Refreshed articulated inverse inertia per aliased link.
    inertias: Vec<ArticulatedInertia>,
    destroyed: bool,
}

impl ConstraintBlock {
    /// Allocate a block over world body ids `links`. Each body's
    /// articulation back-reference is captured here; bodies registered to
    /// an articulation after the block is created are not picked up.
    pub fn new(
        links: Vec<usize>,
        joints: Vec<Joint>,
        bodies: &[Body],
        h: f64,
    ) -> Result<Self, ArmatureError> {
        let link_refs: Vec<Option<LinkRef>> =
            links.iter().map(|&id| bodies[id].link_ref).collect();
        let solver = Solver::new(links, joints, h)?;
        let inertias = vec![ArticulatedInertia::default(); link_refs.len()];
        Ok(Self {
            solver,
            link_refs,
            inertias,
            destroyed: false,
        })
    }

    /// Whether this slot has been disposed.
    #[must_use]
    pub fn destroyed(&self) -> bool {
        self.destroyed
    }

    /// Mark the slot disposed.
    pub fn destroy(&mut self) {
        self.destroyed = true;
    }

    /// Re-query the articulated inverse inertia of every aliased link from
    /// its owning articulation's factored system. Depends on phase 1
    /// having factored those articulations this tick. Plain links keep
    /// their rigid inverse inertia.
    pub fn refresh_articulated_inertias(
        &mut self,
        articulations: &[Articulation],
        bodies: &[Body],
    ) {
        for (i, link_ref) in self.link_refs.iter().enumerate() {
            self.inertias[i] = match link_ref {
                Some(r) => {
                    articulations[r.articulation].articulated_inverse_inertia(bodies, r.link)
                }
                None => {
                    let body = &bodies[self.solver.links()[i]];
                    ArticulatedInertia::from_rigid(body.inv_mass, &body.inv_inertia)
                }
            };
        }
    }

    /// Phase 2 work: refresh aliased inertias, then build and factor this
    /// block's own system.
    pub fn build_jacobians(&mut self, articulations: &[Articulation], bodies: &[Body]) {
        self.refresh_articulated_inertias(articulations, bodies);
        let mut v = self.solver.extract_velocities(bodies);
        let links: Vec<usize> = self.solver.links().to_vec();
        let ctx = BlockContext::new(
            bodies,
            &links,
            &self.link_refs,
            &self.inertias,
            &mut v,
        );
        self.solver.build_jacobians(&ctx);
    }

    /// One velocity pass: the block's own no-bias iteration, then one bias
    /// iteration on each distinct referenced articulation so its internal
    /// constraints absorb the block's corrections.
    pub fn velocity_iteration(
        &mut self,
        articulations: &mut [Articulation],
        bodies: &mut [Body],
    ) {
        {
            let mut v = self.solver.extract_velocities(bodies);
            let links: Vec<usize> = self.solver.links().to_vec();
            let mut ctx = BlockContext::new(
                bodies,
                &links,
                &self.link_refs,
                &self.inertias,
                &mut v,
            );
            self.solver.velocity_iteration_no_bias(&mut ctx);
            self.solver.write_back_velocities(bodies, &v);
        }

        let mut visited: Vec<usize> = Vec::with_capacity(self.link_refs.len());
        for link_ref in self.link_refs.iter().flatten() {
            let id = link_ref.articulation;
            if visited.contains(&id) {
                continue;
            }
            visited.push(id);
            articulations[id].velocity_iteration(bodies);
        }
    }
}
