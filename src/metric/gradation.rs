use crate::{
    Idx,
    mesh::{Elem, Mesh, Point},
    metric::Metric,
    parallel::sync_halo_metrics,
};
use log::{debug, warn};
use rayon::prelude::*;

/// Compute the gradation on an edge, i.e. the ratio of the sizes at its endpoints
/// raised to the power of the inverse of its metric length
pub fn edge_gradation<const D: usize, M: Metric<D>>(m0: &M, m1: &M, e: &Point<D>) -> f64 {
    let l0 = m0.length(e);
    let l1 = m1.length(e);
    let a = l0 / l1;
    let l = if f64::abs(a - 1.0) < 1e-3 {
        l0
    } else {
        l0 * f64::ln(a) / (a - 1.0)
    };
    f64::max(a, 1.0 / a).powf(1. / l)
}

/// Neighbors of every owned vertex, by increasing global index
fn vertex_neighbors<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &Mesh<D, E, M>,
) -> Vec<(Idx, Vec<Idx>)> {
    mesh.vert_ids()
        .filter(|&i| mesh.is_owned(i))
        .map(|i| {
            let mut neighbors = mesh.neighbors(i);
            neighbors.sort_by_key(|&j| mesh.verts[j].gid);
            (i, neighbors)
        })
        .collect()
}

/// Maximum metric gradation over the edges of the mesh, and fraction of the edges
/// with a gradation larger than `target`. `metric` is indexed by vertex slot
pub fn gradation<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &Mesh<D, E, M>,
    metric: &[M],
    target: f64,
) -> (f64, f64) {
    let edges = mesh.lengths_iter().map(|(e, _)| e).collect::<Vec<_>>();
    if edges.is_empty() {
        return (1.0, 0.0);
    }
    let (count, max_gradation) = edges
        .par_iter()
        .map(|&[i0, i1]| {
            let e = mesh.verts[i1].vx - mesh.verts[i0].vx;
            edge_gradation(&metric[i0 as usize], &metric[i1 as usize], &e)
        })
        .fold(
            || (0_usize, 0.0_f64),
            |mut a, b| {
                if b > target {
                    a.0 += 1;
                }
                a.1 = a.1.max(b);
                a
            },
        )
        .reduce(|| (0_usize, 0.0), |a, b| (a.0 + b.0, a.1.max(b.1)));

    (max_gradation, count as f64 / edges.len() as f64)
}

/// Enforce a maximum gradation `beta` on a metric field (indexed by vertex slot)
/// Algorithm taken from "Size gradation control of anisotropic meshes", F. Alauzet, 2010
///
/// At each iteration, every owned vertex metric is intersected with the metrics of
/// its neighbors spanned along the edge, and the new metrics are copied to the other
/// ranks. Returns the number of vertices modified at the last iteration, over all
/// the ranks
pub fn apply_gradation<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &Mesh<D, E, M>,
    metric: &mut [M],
    beta: f64,
    max_iter: usize,
) -> usize {
    debug!("Apply metric gradation (beta = {beta}, max_iter = {max_iter})");

    let v2v = vertex_neighbors(mesh);

    let mut n = 0;
    for _ in 0..max_iter {
        let tmp = metric.to_vec();

        let updates = v2v
            .par_iter()
            .filter_map(|(i_vert, neighbors)| {
                let v0 = mesh.verts[*i_vert].vx;
                let mut m_new = tmp[*i_vert as usize];
                let mut fixed = false;
                for &i_neigh in neighbors {
                    let e = mesh.verts[i_neigh].vx - v0;
                    let m = &tmp[i_neigh as usize];
                    if edge_gradation(&m_new, m, &e) < 1.01 * beta {
                        continue;
                    }
                    fixed = true;
                    m_new = m_new.intersect(&m.span(&e, beta));
                }
                fixed.then_some((*i_vert, m_new))
            })
            .collect::<Vec<_>>();

        n = mesh.comm().all_reduce_sum(updates.len() as u64) as usize;
        for (i, m) in updates {
            metric[i as usize] = m;
        }
        sync_halo_metrics(mesh, metric);
        if n == 0 {
            break;
        }
    }

    if n > 0 {
        let (c_max, frac) = gradation(mesh, metric, beta);
        warn!(
            "gradation: target not achieved: max gradation: {c_max:.2}, {:.2e}% of edges have a gradation > {beta}",
            frac * 100.0
        );
    }

    n
}

#[cfg(test)]
mod tests {
    use super::{apply_gradation, edge_gradation, gradation};
    use crate::{
        Result, assert_delta,
        mesh::{Point, test_meshes::square_mesh},
        metric::{AnisoMetric2d, Metric},
    };

    #[test]
    fn test_edge_gradation() {
        let m = AnisoMetric2d::from_size(0.1);
        let e = Point::<2>::new(0.1, 0.0);
        assert_delta!(edge_gradation(&m, &m, &e), 1.0, 1e-12);

        let m1 = AnisoMetric2d::from_size(0.2);
        assert!(edge_gradation(&m, &m1, &e) > 1.5);
    }

    #[test]
    fn test_apply_gradation() -> Result<()> {
        let mesh = square_mesh(8)?;
        let mut metric = mesh
            .verts()
            .map(|p| {
                if p[0] < 0.1 && p[1] < 0.1 {
                    AnisoMetric2d::from_size(0.001)
                } else {
                    AnisoMetric2d::from_size(0.5)
                }
            })
            .collect::<Vec<_>>();

        let beta = 2.0;
        let (g, _) = gradation(&mesh, &metric, beta);
        assert!(g > 10.0);

        let n = apply_gradation(&mesh, &mut metric, beta, 100);
        assert_eq!(n, 0);
        let (g, frac) = gradation(&mesh, &metric, beta);
        assert!(g < 1.02 * beta);
        assert!(frac < 1e-12);

        // the metric can only be refined
        for m in &metric {
            assert!(m.sizes()[1] <= 0.5 + 1e-8);
        }

        Ok(())
    }
}
