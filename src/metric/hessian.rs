use crate::{
    Error, Idx, Result,
    mesh::{Elem, Mesh},
    metric::Metric,
};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector, SMatrix};
use rayon::prelude::*;

/// Number of unknowns of the quadratic fit (gradient and hessian)
const fn n_unknowns(d: usize) -> usize {
    d + d * (d + 1) / 2
}

/// Neighbors of `i` and, if there are not enough of them, the neighbors of the neighbors
fn patch<const D: usize, E: Elem, M: Metric<D>>(mesh: &Mesh<D, E, M>, i: Idx) -> Vec<Idx> {
    let mut res = mesh.neighbors(i);
    if res.len() < n_unknowns(D) + 2 {
        let mut ring2 = res
            .iter()
            .flat_map(|&j| mesh.neighbors(j))
            .filter(|&j| j != i)
            .collect::<Vec<_>>();
        ring2.extend_from_slice(&res);
        ring2.sort_unstable();
        ring2.dedup();
        res = ring2;
    }
    res
}

/// Compute the hessian of `f` at vertex `i` using a quadratic least squares fit
/// over its patch
///
/// With $`\delta_j = x_j - x_i`$, the fit minimizes
/// ```math
/// \sum_j w_j^2 \left(f_i + g \cdot \delta_j + \frac{1}{2} \delta_j^T H \delta_j - f_j\right)^2
/// ```
/// with $`w_j = 1 / \|\delta_j\|`$
fn vertex_hessian<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &Mesh<D, E, M>,
    i: Idx,
    f: &[f64],
) -> Option<SMatrix<f64, D, D>> {
    let n = n_unknowns(D);
    let others = patch(mesh, i);
    if others.len() < n {
        return None;
    }

    let p0 = mesh.verts[i].vx;
    let f0 = f[i as usize];
    let mut a = DMatrix::<f64>::zeros(others.len(), n);
    let mut b = DVector::<f64>::zeros(others.len());
    for (irow, &j) in others.iter().enumerate() {
        let dp = mesh.verts[j].vx - p0;
        let w = 1.0 / dp.norm();
        let mut col = 0;
        for k in 0..D {
            a[(irow, col)] = w * dp[k];
            col += 1;
        }
        for k in 0..D {
            for l in k..D {
                a[(irow, col)] = if k == l {
                    0.5 * w * dp[k] * dp[k]
                } else {
                    w * dp[k] * dp[l]
                };
                col += 1;
            }
        }
        b[irow] = w * (f[j as usize] - f0);
    }

    let svd = a.svd(true, true);
    let s_max = svd.singular_values.max();
    let s_min = svd.singular_values.min();
    if s_min < 1e-10 * s_max {
        return None;
    }
    let sol = svd.solve(&b, 0.0).ok()?;

    let mut res = SMatrix::<f64, D, D>::zeros();
    let mut col = D;
    for k in 0..D {
        for l in k..D {
            res[(k, l)] = sol[col];
            res[(l, k)] = sol[col];
            col += 1;
        }
    }
    Some(res)
}

/// Compute the hessian of a scalar field `f` (indexed by vertex slot) at every vertex
/// slot. Where the fit fails, the average of the neighboring hessians is used
pub fn compute_hessians<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &Mesh<D, E, M>,
    f: &[f64],
) -> Result<Vec<SMatrix<f64, D, D>>> {
    if f.len() != mesh.n_vert_slots() {
        return Err(Error::from(&format!(
            "Invalid field size: {} vs. {} vertices",
            f.len(),
            mesh.n_vert_slots()
        )));
    }
    debug!("Compute the hessian using quadratic least squares");

    let ids = mesh.vert_ids().collect::<Vec<_>>();
    let hessians = ids
        .par_iter()
        .map(|&i| vertex_hessian(mesh, i, f))
        .collect::<Vec<_>>();

    let mut res = vec![None; mesh.n_vert_slots()];
    for (&i, h) in ids.iter().zip(hessians) {
        res[i as usize] = h;
    }

    let mut failed = ids
        .iter()
        .copied()
        .filter(|&i| res[i as usize].is_none())
        .collect::<Vec<_>>();
    if !failed.is_empty() {
        warn!(
            "Least squares failed for {} vertices, using the neighbors",
            failed.len()
        );
    }
    while !failed.is_empty() {
        let mut fixed = Vec::new();
        for &i in &failed {
            let hs = mesh
                .neighbors(i)
                .iter()
                .filter_map(|&j| res[j as usize])
                .collect::<Vec<_>>();
            if !hs.is_empty() {
                let h = hs.iter().fold(SMatrix::<f64, D, D>::zeros(), |a, b| a + b)
                    / hs.len() as f64;
                fixed.push((i, h));
            }
        }
        if fixed.is_empty() {
            return Err(Error::from("Unable to compute the hessian"));
        }
        for (i, h) in fixed {
            res[i as usize] = Some(h);
        }
        failed.retain(|&i| res[i as usize].is_none());
    }

    Ok(res
        .into_iter()
        .map(|h| h.unwrap_or_else(SMatrix::zeros))
        .collect())
}
