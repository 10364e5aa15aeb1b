//! Block-sparse LDL factorization on a precomputed fill-in plan.
//!
//! The constraint matrix `K = J W J^T + diag(gamma)` is symmetric positive
//! definite and block-sparse. Its sparsity depends only on which links each
//! joint touches, so the expensive structural analysis happens once per
//! topology ([`SparseLdl::build_plan`]) and every tick just re-executes the
//! stored plan:
//!
//! - which K blocks are structurally nonzero (including blocks that fill
//!   in during factorization),
//! - the `J x WJT` product list that assembles each nonzero block,
//! - the scatter indices for the in-place rank update of the
//!   factorization.
//!
//! K is stored packed by columns of the lower triangle: column `c` keeps
//! `heights[c]` consecutive blocks whose row indices are in `rows`.

use nalgebra::{DMatrix, Matrix4, Vector4};

use crate::Jacobian;

/// Sparsity plan and packed storage for the factored constraint matrix.
#[derive(Debug)]
pub struct SparseLdl {
    n_blocks: usize,
    /// Packed nonzero blocks of the lower triangle, column by column.
    k: Vec<Matrix4<f64>>,
    /// Row index of each packed block.
    rows: Vec<usize>,
    /// Number of packed blocks per column.
    heights: Vec<usize>,
    /// Flattened `(j_cell, wjt_cell)` products per packed block.
    plan_pairs: Vec<(usize, usize)>,
    /// End offset into `plan_pairs` for each packed block.
    plan_ends: Vec<usize>,
    /// Packed indices receiving rank updates, in factorization order.
    scatter: Vec<usize>,
}

impl SparseLdl {
    /// Build the fill-in-aware plan for a Jacobian's sparsity mask.
    ///
    /// For each column (in increasing order) every lower row is scanned: a
    /// cell is structurally nonzero if the two row blocks share any body
    /// lane, or if an earlier column's factorization step will fill it in.
    /// The plan is immutable for the life of the topology; only the block
    /// values are recomputed per tick.
    #[must_use]
    pub fn build_plan(jacobian: &Jacobian) -> Self {
        let n = jacobian.n_blocks;
        let nbb = jacobian.n_body_blocks;
        let sp = &jacobian.sparsity;

        // map[c * n + r] = packed index of cell (r, c), -1 if empty.
        let mut map = vec![-1isize; n * n];
        let mut rows = Vec::new();
        let mut heights = vec![0usize; n];
        let mut plan_pairs = Vec::new();
        let mut plan_ends = Vec::new();
        let mut scatter_cells = Vec::new();
        let mut n_k = 0usize;

        for c in 0..n {
            let mut height = 0;
            for r in c..n {
                let mut filled = map[c * n + r] >= 0;
                for k in 0..nbb {
                    if sp[r * nbb + k] && sp[c * nbb + k] {
                        filled = true;
                        plan_pairs.push((r * nbb + k, k * n + c));
                    }
                }
                if filled {
                    plan_ends.push(plan_pairs.len());
                    rows.push(r);
                    map[c * n + r] = n_k as isize;
                    n_k += 1;
                    height += 1;

                    // Every filled cell above this one in the column makes
                    // (r2, r) a fill-in target of the rank update.
                    for r2 in c + 1..=r {
                        if map[c * n + r2] >= 0 {
                            map[r2 * n + r] = 0;
                            scatter_cells.push(r2 * n + r);
                        }
                    }
                }
            }
            heights[c] = height;
        }

        // Cells were recorded by coordinate; resolve to packed indices now
        // that every column has assigned them.
        let scatter = scatter_cells
            .into_iter()
            .map(|cell| {
                debug_assert!(map[cell] >= 0);
                map[cell] as usize
            })
            .collect();

        Self {
            n_blocks: n,
            k: vec![Matrix4::zeros(); n_k],
            rows,
            heights,
            plan_pairs,
            plan_ends,
            scatter,
        }
    }

    /// Number of row/column blocks of the (unpacked) matrix.
    #[must_use]
    pub fn n_blocks(&self) -> usize {
        self.n_blocks
    }

    /// Assemble K's nonzero blocks by executing the multiplication plan.
    ///
    /// `used_rows` is the scalar constraint row count; trailing rows of
    /// the last block that hold no constraint get an identity diagonal so
    /// the padded matrix stays invertible.
    pub fn build_k(&mut self, jacobian: &Jacobian, used_rows: usize) {
        let mut start = 0;
        for (cell, &end) in self.plan_ends.iter().enumerate() {
            let mut acc = Matrix4::zeros();
            for &(jc, wc) in &self.plan_pairs[start..end] {
                acc += jacobian.j[jc] * jacobian.wjt[wc];
            }
            self.k[cell] = acc;
            start = end;
        }

        let pad = self.n_blocks * 4 - used_rows;
        if pad > 0 {
            let last = self.k.len() - 1;
            for d in 4 - pad..4 {
                self.k[last][(d, d)] = 1.0;
            }
        }
    }

    /// Add each row's CFM factor to K's diagonal. `gamma` is indexed by
    /// scalar row.
    pub fn add_gamma(&mut self, gamma: &[f64]) {
        debug_assert!(gamma.len() >= self.n_blocks * 4);
        let mut cell = 0;
        for c in 0..self.n_blocks {
            for d in 0..4 {
                self.k[cell][(d, d)] += gamma[c * 4 + d];
            }
            cell += self.heights[c];
        }
    }

    /// In-place block LDL decomposition.
    ///
    /// For each column: invert the pivot, scale the sub-diagonal blocks by
    /// the inverse pivot, rank-update every cell named by the scatter
    /// plan. Equivalent to a dense LDL^T restricted to the planned
    /// nonzero blocks.
    pub fn factor(&mut self) {
        let mut l_temp: Vec<Matrix4<f64>> = vec![Matrix4::zeros(); self.n_blocks.saturating_sub(1)];
        let mut scatter_idx = 0;
        let mut n0 = 0;
        for c in 0..self.n_blocks {
            let height = self.heights[c];
            let e_height = height - 1;
            let inv_pivot = safe_inverse(&self.k[n0]);

            for (i, lt) in l_temp.iter_mut().enumerate().take(e_height) {
                *lt = self.k[n0 + 1 + i] * inv_pivot;
            }

            for i in 0..e_height {
                for j in 0..=i {
                    let update = self.k[n0 + 1 + i] * l_temp[j].transpose();
                    let target = self.scatter[scatter_idx];
                    scatter_idx += 1;
                    self.k[target] -= update;
                }
            }

            for i in 0..e_height {
                self.k[n0 + 1 + i] = l_temp[i];
            }

            n0 += height;
        }
    }

    /// Solve `K y = x` in place using the factored blocks: forward
    /// substitution, diagonal solve, back substitution - all restricted to
    /// the planned sparsity.
    pub fn solve_in_place(&self, x: &mut [Vector4<f64>]) {
        debug_assert_eq!(x.len(), self.n_blocks);
        let n = self.n_blocks;

        // L^-1
        let mut k = 0;
        for c in 0..n.saturating_sub(1) {
            let height = self.heights[c];
            for i in 1..height {
                let r = self.rows[k + i];
                let delta = self.k[k + i] * x[c];
                x[r] -= delta;
            }
            k += height;
        }

        // D^-1
        let mut k = 0;
        for (c, item) in x.iter_mut().enumerate() {
            *item = safe_inverse(&self.k[k]) * *item;
            k += self.heights[c];
        }

        // L^-T
        if n >= 2 {
            let mut k = self.k.len() - self.heights[n - 1];
            for c in (0..n - 1).rev() {
                k -= self.heights[c];
                for i in 1..self.heights[c] {
                    let r = self.rows[k + i];
                    let delta = self.k[k + i].transpose() * x[r];
                    x[c] -= delta;
                }
            }
        }
    }

    /// Unpack the packed lower triangle into a dense scalar matrix
    /// (mirrored to the upper triangle). Test and debugging aid.
    #[must_use]
    pub fn unpack_dense(&self) -> DMatrix<f64> {
        let n = self.n_blocks * 4;
        let mut out = DMatrix::zeros(n, n);
        let mut k = 0;
        for c in 0..self.n_blocks {
            for i in 0..self.heights[c] {
                let r = self.rows[k + i];
                let block = &self.k[k + i];
                for br in 0..4 {
                    for bc in 0..4 {
                        out[(r * 4 + br, c * 4 + bc)] = block[(br, bc)];
                        out[(c * 4 + bc, r * 4 + br)] = block[(br, bc)];
                    }
                }
            }
            k += self.heights[c];
        }
        out
    }
}

/// Invert a pivot block, falling back to identity if it is numerically
/// singular. A structurally zero diagonal cannot occur (free rows carry
/// identity CFM and padded rows identity diagonal), so a failed inverse
/// indicates a degenerate setup worth flagging.
fn safe_inverse(m: &Matrix4<f64>) -> Matrix4<f64> {
    m.try_inverse().unwrap_or_else(|| {
        tracing::error!("singular pivot block, substituting identity");
        Matrix4::identity()
    })
}
