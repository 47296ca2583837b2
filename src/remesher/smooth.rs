use super::cavity::{Cavity, FilledCavity, FilledCavityType};
use crate::{
    Idx, Result,
    mesh::{Elem, GElem, Mesh, Point},
    metric::Metric,
    parallel::{HaloEdit, exchange_edits},
    stats::{MeshStats, StepStats},
};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmoothingMethod {
    /// Move the vertices to the centroid of their neighbors, weighted by the edge
    /// lengths in the metric
    Laplacian,
    /// Laplacian smoothing with relaxation, only accepted if the quality of the
    /// vertex ball is increased
    SmartLaplacian,
    /// Maximize the minimum quality of the vertex ball
    OptimisationLinf,
}

#[derive(Clone, Debug)]
pub struct SmoothParams {
    pub method: SmoothingMethod,
    /// Number of passes
    pub n_iter: u32,
}

impl Default for SmoothParams {
    fn default() -> Self {
        Self {
            method: SmoothingMethod::OptimisationLinf,
            n_iter: 10,
        }
    }
}

/// Relaxation factors tried by the smart Laplacian
const RELAX: [f64; 3] = [1.0, 0.5, 0.25];
/// Max. number of step reductions in the line search
const MAX_LINE_SEARCH: u32 = 10;

/// Vertex ball used to evaluate new vertex locations
struct Ball<'a, const D: usize, E: Elem, M: Metric<D>> {
    cavity: &'a Cavity<D, E, M>,
    /// Local index of the vertex in the cavity
    i: Idx,
    /// Unit normal of the tagged faces if the displacement is constrained
    normal: Option<Point<D>>,
}

impl<const D: usize, E: Elem, M: Metric<D>> Ball<'_, D, E, M> {
    fn point(&self) -> Point<D> {
        self.cavity.points[self.i as usize]
    }

    fn metric(&self) -> M {
        self.cavity.metrics[self.i as usize]
    }

    /// Remove the normal component of a displacement
    fn project(&self, d: Point<D>) -> Point<D> {
        self.normal.map_or(d, |n| d - d.dot(&n) * n)
    }

    /// Metric at `p`, interpolated in the cavity element that contains it (or is
    /// closest to containing it)
    fn interpolate_metric(&self, p: &Point<D>) -> M {
        let mut best = None;
        let mut best_min = f64::NEG_INFINITY;
        for (k, e) in self.cavity.elems.iter().enumerate() {
            let bcoords = self.cavity.gelem(k).bcoords(p);
            let w = bcoords.as_ref().to_vec();
            let w_min = w.iter().copied().fold(f64::INFINITY, f64::min);
            if w_min > best_min {
                best_min = w_min;
                best = Some((*e, w));
            }
        }
        let Some((e, w)) = best else {
            return self.metric();
        };
        let w = w.iter().map(|x| x.max(0.0)).collect::<Vec<_>>();
        let sum = w.iter().sum::<f64>();
        M::interpolate(
            e.iter()
                .zip(w.iter())
                .map(|(&j, &x)| (x / sum, &self.cavity.metrics[j as usize])),
        )
    }

    /// Minimum quality of the ball if the vertex is moved to `p` (-1 if invalid)
    fn quality(&self, p: &Point<D>) -> (f64, M) {
        let m = self.interpolate_metric(p);
        let filled =
            FilledCavity::new(self.cavity, FilledCavityType::MovedVertex((self.i, *p, m)));
        (filled.min_quality(), m)
    }

    fn is_conservative(&self, p: &Point<D>, m: M) -> bool {
        FilledCavity::new(self.cavity, FilledCavityType::MovedVertex((self.i, *p, m)))
            .is_conservative()
    }

    /// Centroid of the neighbors weighted by the edge lengths
    fn laplacian(&self) -> Point<D> {
        let (p0, m0) = (self.point(), self.metric());
        let mut res = Point::<D>::zeros();
        let mut w = 0.0;
        for (j, (p, m)) in self
            .cavity
            .points
            .iter()
            .zip(self.cavity.metrics.iter())
            .enumerate()
        {
            if j as Idx == self.i {
                continue;
            }
            let l = M::edge_length(&p0, &m0, p, m);
            res += l * p;
            w += l;
        }
        if w > 0.0 { res / w } else { p0 }
    }

    /// Smallest distance to a neighbor
    fn min_distance(&self) -> f64 {
        let p0 = self.point();
        self.cavity
            .points
            .iter()
            .enumerate()
            .filter(|&(j, _)| j as Idx != self.i)
            .map(|(_, p)| (p - p0).norm())
            .fold(f64::INFINITY, f64::min)
    }

    fn try_laplacian(&self) -> Option<(Point<D>, M)> {
        let p0 = self.point();
        let p = p0 + self.project(self.laplacian() - p0);
        let (q, m) = self.quality(&p);
        (q > 0.0 && self.is_conservative(&p, m)).then_some((p, m))
    }

    /// Whether a location where the minimum ball quality is `q` can be kept by the
    /// smart Laplacian: the quality must not decrease
    fn accepts(&self, q: f64) -> bool {
        q >= self.cavity.q_min
    }

    fn try_smart_laplacian(&self) -> Option<(Point<D>, M)> {
        let p0 = self.point();
        let d = self.project(self.laplacian() - p0);
        if d.norm() <= 1e-8 * self.min_distance() {
            return None;
        }
        for w in RELAX {
            let p = p0 + w * d;
            let (q, m) = self.quality(&p);
            if self.accepts(q) && self.is_conservative(&p, m) {
                return Some((p, m));
            }
        }
        None
    }

    /// Steepest ascent of the minimum ball quality, with a finite difference gradient
    /// and a step halving line search
    fn try_optimisation(&self) -> Option<(Point<D>, M)> {
        let p0 = self.point();
        let (q0, _) = self.quality(&p0);
        if q0 <= 0.0 {
            return None;
        }
        let h = self.min_distance();
        if !h.is_finite() || h <= 0.0 {
            return None;
        }

        let eps = 1e-4 * h;
        let mut grad = Point::<D>::zeros();
        for k in 0..D {
            let mut p = p0;
            p[k] += eps;
            grad[k] = (self.quality(&p).0 - q0) / eps;
        }
        let grad = self.project(grad);
        let n = grad.norm();
        if n < 1e-12 {
            return None;
        }
        let dir = grad / n;

        let mut step = 0.25 * h;
        for _ in 0..MAX_LINE_SEARCH {
            let p = p0 + step * dir;
            let (q, m) = self.quality(&p);
            if q > q0 && self.is_conservative(&p, m) {
                return Some((p, m));
            }
            step *= 0.5;
        }
        None
    }
}

/// Unit normal of the tagged faces of a vertex cavity, the normals being oriented
/// consistently with the first one
fn tagged_normal<const D: usize, E: Elem, M: Metric<D>>(
    cavity: &Cavity<D, E, M>,
) -> Option<Point<D>> {
    let mut res: Option<Point<D>> = None;
    for (f, _) in &cavity.tagged_faces {
        let n = cavity.gface(f).scaled_normal();
        res = Some(match res {
            None => n,
            Some(r) if r.dot(&n) < 0.0 => r - n,
            Some(r) => r + n,
        });
    }
    res.map(|n| n.normalize())
}

impl<const D: usize, E: Elem, M: Metric<D>> Mesh<D, E, M> {
    /// Owned vertices that are not fixed (i.e. not on tagged faces with different
    /// tags), by increasing global index
    fn movable_vertices(&self) -> Vec<Idx> {
        let mut verts = self
            .verts
            .iter()
            .filter(|(_, v)| v.owner == self.rank())
            .map(|(i, v)| (v.gid, i))
            .collect::<Vec<_>>();
        verts.sort_unstable();
        verts
            .into_iter()
            .map(|(_, i)| i)
            .filter(|&i| self.vertex_tags(i).len() <= 1)
            .collect()
    }

    /// New location and metric of vertex `i`, with its local index in the vertex
    /// cavity built in `cavity`
    fn smoothed_vertex(
        &self,
        i: Idx,
        method: SmoothingMethod,
        cavity: &mut Cavity<D, E, M>,
    ) -> Option<(Idx, Point<D>, M)> {
        let on_surface = !self.vertex_tags(i).is_empty();
        cavity.init_from_vertex(self, i);
        let i_local = cavity.get_local_index(i)?;
        let normal = if on_surface {
            Some(tagged_normal(cavity)?)
        } else {
            None
        };
        let ball = Ball {
            cavity: &*cavity,
            i: i_local,
            normal,
        };

        let (p, m) = match method {
            SmoothingMethod::Laplacian => ball.try_laplacian(),
            SmoothingMethod::SmartLaplacian => ball.try_smart_laplacian(),
            SmoothingMethod::OptimisationLinf => ball.try_optimisation(),
        }?;
        Some((i_local, p, m))
    }

    /// One smoothing pass over the owned vertices whose ball is private to the rank
    fn smooth_iter(
        &mut self,
        method: SmoothingMethod,
        cavity: &mut Cavity<D, E, M>,
    ) -> (usize, usize) {
        let (mut n_moved, mut n_fails) = (0, 0);
        for i in self.movable_vertices() {
            if !self.is_private(self.vertex_elements(i)) {
                continue;
            }
            if let Some((_, p, m)) = self.smoothed_vertex(i, method, cavity) {
                trace!("Vertex {i} moved to {p:?}");
                self.move_vertex(i, p, m);
                n_moved += 1;
            } else {
                n_fails += 1;
            }
        }
        (n_moved, n_fails)
    }

    /// Moves of the owned vertices whose ball is shared with other ranks
    fn interface_moves(
        &self,
        method: SmoothingMethod,
        cavity: &mut Cavity<D, E, M>,
    ) -> (Vec<HaloEdit<D, E, M>>, usize) {
        let mut edits = Vec::new();
        let mut n_fails = 0;
        for i in self.movable_vertices() {
            if self.is_private(self.vertex_elements(i)) {
                continue;
            }
            let Some((i_local, p, m)) = self.smoothed_vertex(i, method, cavity) else {
                n_fails += 1;
                continue;
            };
            let filled = FilledCavity::new(
                &*cavity,
                FilledCavityType::MovedVertex((i_local, p, m)),
            );
            edits.push(filled.to_halo_edit(self, self.verts[i].gid));
        }
        (edits, n_fails)
    }

    /// Move the vertices to improve the element qualities, without modifying the mesh
    /// topology
    ///
    /// Vertices that belong to tagged faces with different tags are fixed, the other
    /// vertices on tagged faces only move in the plane of the faces and the move is
    /// rejected if the region volumes or the tagged face measures change. The metric
    /// at the new location is interpolated from the vertices of the element
    /// containing it. The vertices whose ball is private to a rank are moved first;
    /// the moves of the other ones are then exchanged, two neighbors never moving in
    /// the same pass. Returns the total number of moves over all the ranks
    pub fn smooth(&mut self, params: &SmoothParams) -> Result<usize> {
        debug!("Smooth vertices: {:?}", params.method);

        let mut cavity = Cavity::new();
        let mut n_total = 0;
        for n_iter in 0..params.n_iter {
            let (n_moved, mut n_fails) = self.smooth_iter(params.method, &mut cavity);
            let mut n_moved = self.comm().all_reduce_sum(n_moved as u64) as usize;
            if self.comm().size() > 1 {
                let (edits, f) = self.interface_moves(params.method, &mut cavity);
                n_moved += exchange_edits(self, &edits)?.0;
                n_fails += f;
            }
            let n_fails = self.comm().all_reduce_sum(n_fails as u64) as usize;
            debug!("Iteration {}: {n_moved} moved, {n_fails} fails", n_iter + 1);
            self.stats.push(StepStats::Smooth {
                n_moved,
                n_fails,
                stats: MeshStats::new(self),
            });
            n_total += n_moved;
            if n_moved == 0 {
                break;
            }
        }
        Ok(n_total)
    }
}
