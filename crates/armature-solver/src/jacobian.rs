//! Block-sparse constraint Jacobian.
//!
//! The Jacobian has one scalar row per constrained axis and two 4-wide
//! column lanes per link (angular, then linear; the fourth component pads
//! to the block size). Storage is 4x4 dense blocks plus a boolean block
//! sparsity mask so downstream math never touches structurally zero
//! blocks.
//!
//! Three parallel arrays are kept:
//!
//! - `j` - the raw Jacobian, indexed `[row_block * body_blocks + lane]`
//! - `wjt` - J transposed and pre-scaled by each link's inverse
//!   mass/inertia, indexed `[lane * row_blocks + row_block]`
//! - `raw_wjt` - the same transpose scaled by the *rigid* inverse inertia
//!   only, used when applying impulses directly to bodies
//!
//! Joints write unscaled transpose entries into `wjt` via the row-write
//! primitives; [`Jacobian::calculate_wjt`] then derives `j` and both
//! scaled transposes in one pass. For links that alias another, already
//! solved articulation the scaling uses the link's 6x6 articulated inverse
//! inertia, which is what couples two independent kinematic trees without
//! re-deriving their internal structure.

use armature_types::SymMat3;
use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};

use crate::SolverContext;

/// Dense 4x4 blocks of J and its mass-weighted transposes, plus the block
/// sparsity mask.
#[derive(Debug)]
pub struct Jacobian {
    /// Constraint row blocks (rows / 4, rounded up).
    pub n_blocks: usize,
    /// Body column lanes (2 per link).
    pub n_body_blocks: usize,
    /// Block occupancy, `[row_block * n_body_blocks + lane]`.
    pub sparsity: Vec<bool>,
    /// Raw Jacobian blocks, `[row_block * n_body_blocks + lane]`.
    pub j: Vec<Matrix4<f64>>,
    /// Weighted transpose blocks, `[lane * n_blocks + row_block]`.
    pub wjt: Vec<Matrix4<f64>>,
    /// Transpose scaled by rigid inverse inertia only (no articulated
    /// coupling), same indexing as `wjt`.
    pub raw_wjt: Vec<Matrix4<f64>>,
}

impl Jacobian {
    /// Allocate zeroed storage for `n_blocks` row blocks and `n_body_blocks`
    /// column lanes.
    #[must_use]
    pub fn new(n_blocks: usize, n_body_blocks: usize) -> Self {
        let cells = n_blocks * n_body_blocks;
        Self {
            n_blocks,
            n_body_blocks,
            sparsity: vec![false; cells],
            j: vec![Matrix4::zeros(); cells],
            wjt: vec![Matrix4::zeros(); cells],
            raw_wjt: vec![Matrix4::zeros(); cells],
        }
    }

    /// Mark the blocks covered by `n_rows` scalar rows starting at `row`
    /// for one link's angular and/or linear lane.
    pub fn mark(&mut self, row: usize, n_rows: usize, link: usize, angular: bool, linear: bool) {
        debug_assert!(2 * link + 1 < self.n_body_blocks);
        let row_block = row / 4;
        self.mark_block(row_block, link, angular, linear);
        if row % 4 + n_rows > 4 {
            self.mark_block(row_block + 1, link, angular, linear);
        }
    }

    fn mark_block(&mut self, row_block: usize, link: usize, angular: bool, linear: bool) {
        debug_assert!(row_block < self.n_blocks);
        if angular {
            self.sparsity[row_block * self.n_body_blocks + 2 * link] = true;
        }
        if linear {
            self.sparsity[row_block * self.n_body_blocks + 2 * link + 1] = true;
        }
    }

    /// Whether a (row block, lane) cell is occupied.
    #[must_use]
    pub fn occupied(&self, row_block: usize, lane: usize) -> bool {
        self.sparsity[row_block * self.n_body_blocks + lane]
    }

    /// Write one scalar constraint row for one lane: the transpose column
    /// for row `row` becomes `j`.
    pub fn write_row(&mut self, row: usize, link: usize, off: usize, j: &Vector3<f64>) {
        self.set_transpose_column(row, 2 * link + off, j);
    }

    /// Write a diagonal 3x3 (only the diagonal is nonzero) starting at
    /// `row`.
    pub fn write_diagonal(&mut self, row: usize, link: usize, off: usize, d: &Vector3<f64>) {
        self.set_transpose_column(row, 2 * link + off, &Vector3::new(d.x, 0.0, 0.0));
        self.set_transpose_column(row + 1, 2 * link + off, &Vector3::new(0.0, d.y, 0.0));
        self.set_transpose_column(row + 2, 2 * link + off, &Vector3::new(0.0, 0.0, d.z));
    }

    /// Write a full 3x3 starting at `row`: row `i` of `m` becomes
    /// constraint row `row + i`.
    pub fn write_matrix(&mut self, row: usize, link: usize, off: usize, m: &Matrix3<f64>) {
        let lane = 2 * link + off;
        for i in 0..3 {
            let r = m.row(i);
            self.set_transpose_column(row + i, lane, &Vector3::new(r[0], r[1], r[2]));
        }
    }

    /// Store `j` as the transpose column for scalar row `row` of `lane`.
    /// Rows spill over into the next row block when they cross a block
    /// boundary.
    fn set_transpose_column(&mut self, row: usize, lane: usize, j: &Vector3<f64>) {
        let block = lane * self.n_blocks + row / 4;
        debug_assert!(block < self.wjt.len());
        self.wjt[block].set_column(row % 4, &Vector4::new(j.x, j.y, j.z, 0.0));
    }

    /// Derive `j`, `raw_wjt` and `wjt` from the transpose entries the
    /// joints just wrote.
    ///
    /// `wjt` holds the unscaled transpose after the fill phase; this pass
    /// transposes it into `j` and scales by each link's inverse
    /// mass/inertia. Links flagged as articulated by the context are
    /// scaled by their 6x6 articulated inverse inertia instead (coupling
    /// their angular and linear lanes), everything else by the rigid one.
    pub fn calculate_wjt<C: SolverContext>(&mut self, context: &C) {
        let nb = self.n_blocks;
        for r in 0..nb {
            for link in 0..self.n_body_blocks / 2 {
                let body = context.body(link);
                let inv_mass = body.inv_mass;
                let inv_inertia = body.inv_inertia;
                let ang = r * self.n_body_blocks + 2 * link;
                let lin = ang + 1;
                let ang_t = (2 * link) * nb + r;
                let lin_t = ang_t + nb;

                if self.sparsity[ang] {
                    self.j[ang] = self.wjt[ang_t].transpose();
                    self.raw_wjt[ang_t] = sym_to_mat4(&inv_inertia) * self.wjt[ang_t];
                }
                if self.sparsity[lin] {
                    self.j[lin] = self.wjt[lin_t].transpose();
                    self.raw_wjt[lin_t] = inv_mass * self.wjt[lin_t];
                }

                if context.is_articulated(link) {
                    let inv = context.articulated_inverse_inertia(link);
                    let h4 = mat3_to_mat4(&inv.h);
                    let jt_ang = self.wjt[ang_t];
                    let jt_lin = self.wjt[lin_t];
                    if self.sparsity[ang] {
                        self.wjt[ang_t] = sym_to_mat4(&inv.i) * jt_ang + h4 * jt_lin;
                    }
                    if self.sparsity[lin] {
                        self.wjt[lin_t] = h4.transpose() * jt_ang + sym_to_mat4(&inv.m) * jt_lin;
                    }
                } else {
                    if self.sparsity[ang] {
                        self.wjt[ang_t] = self.raw_wjt[ang_t];
                    }
                    if self.sparsity[lin] {
                        self.wjt[lin_t] = self.raw_wjt[lin_t];
                    }
                }
            }
        }
    }
}

/// Embed a packed symmetric 3x3 into the top-left of a zero 4x4.
pub(crate) fn sym_to_mat4(m: &SymMat3) -> Matrix4<f64> {
    let mut out = Matrix4::zeros();
    out[(0, 0)] = m.m00;
    out[(1, 0)] = m.m10;
    out[(0, 1)] = m.m10;
    out[(1, 1)] = m.m11;
    out[(2, 0)] = m.m20;
    out[(0, 2)] = m.m20;
    out[(2, 1)] = m.m21;
    out[(1, 2)] = m.m21;
    out[(2, 2)] = m.m22;
    out
}

/// Embed a 3x3 into the top-left of a zero 4x4.
pub(crate) fn mat3_to_mat4(m: &Matrix3<f64>) -> Matrix4<f64> {
    let mut out = Matrix4::zeros();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(m);
    out
}

/// The cross-product (skew) matrix of `v`: `skew(v) * w == v x w`.
pub(crate) fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use armature_types::{Body, MassProperties, Pose};
    use crate::ArticulationContext;
    use approx::assert_relative_eq;

    #[test]
    fn skew_matches_cross_product() {
        let a = Vector3::new(1.0, -2.0, 3.0);
        let b = Vector3::new(0.5, 4.0, -1.0);
        assert_relative_eq!(skew(&a) * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn mark_spills_across_block_boundary() {
        let mut jac = Jacobian::new(2, 2);
        // Three rows starting at row 2 touch blocks 0 and 1.
        jac.mark(2, 3, 0, true, false);
        assert!(jac.occupied(0, 0));
        assert!(jac.occupied(1, 0));
        assert!(!jac.occupied(0, 1));
    }

    #[test]
    fn write_matrix_lands_in_j_rows() {
        let mut jac = Jacobian::new(1, 2);
        jac.mark(0, 3, 0, true, false);
        let m = Matrix3::new(
            1.0, 2.0, 3.0, //
            4.0, 5.0, 6.0, //
            7.0, 8.0, 9.0,
        );
        jac.write_matrix(0, 0, 0, &m);

        let bodies = [Body::new(MassProperties::sphere(1.0, 1.0), Pose::identity())];
        let links = [0usize];
        let mut v = crate::context::extract_lanes(&bodies, &links);
        let ctx = ArticulationContext::new(&bodies, &links, &mut v);
        jac.calculate_wjt(&ctx);

        // Constraint row 1 of the angular lane must be row 1 of m.
        let block = jac.j[0];
        assert_relative_eq!(block[(1, 0)], 4.0, epsilon = 1e-12);
        assert_relative_eq!(block[(1, 1)], 5.0, epsilon = 1e-12);
        assert_relative_eq!(block[(1, 2)], 6.0, epsilon = 1e-12);
    }

    #[test]
    fn diagonal_write_crossing_blocks() {
        let mut jac = Jacobian::new(2, 2);
        jac.mark(3, 3, 0, false, true);
        jac.write_diagonal(3, 0, 1, &Vector3::new(1.0, 2.0, 3.0));

        let bodies = [Body::new(MassProperties::sphere(1.0, 1.0), Pose::identity())];
        let links = [0usize];
        let mut v = crate::context::extract_lanes(&bodies, &links);
        let ctx = ArticulationContext::new(&bodies, &links, &mut v);
        jac.calculate_wjt(&ctx);

        // Row 3 lives in block 0, rows 4 and 5 in block 1.
        assert_relative_eq!(jac.j[1][(3, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(jac.j[3][(0, 1)], 2.0, epsilon = 1e-12);
        assert_relative_eq!(jac.j[3][(1, 2)], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn wjt_is_mass_scaled_transpose() {
        let mut jac = Jacobian::new(1, 2);
        jac.mark(0, 3, 0, false, true);
        jac.write_diagonal(0, 0, 1, &Vector3::new(1.0, 1.0, 1.0));

        let bodies = [Body::new(MassProperties::sphere(4.0, 1.0), Pose::identity())];
        let links = [0usize];
        let mut v = crate::context::extract_lanes(&bodies, &links);
        let ctx = ArticulationContext::new(&bodies, &links, &mut v);
        jac.calculate_wjt(&ctx);

        // inv mass 0.25 scales the identity transpose.
        let wjt = jac.wjt[1]; // linear lane, row block 0
        assert_relative_eq!(wjt[(0, 0)], 0.25, epsilon = 1e-12);
        assert_relative_eq!(wjt[(1, 1)], 0.25, epsilon = 1e-12);
    }
}
