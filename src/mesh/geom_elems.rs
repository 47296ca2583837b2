use super::topo_elems::{EDGE_EDGES, TET_EDGES, TET_FACES, TRI_EDGES, TRI_FACES};
use crate::{Idx, mesh::Point};
use nalgebra::{Matrix3, Matrix4, SMatrix, Vector3, Vector4};
use std::fmt::Debug;

const SQRT_3: f64 = 1.732_050_807_568_877_2;
const SQRT_6: f64 = std::f64::consts::SQRT_2 * SQRT_3;

/// Element given by the coordinates of its vertices
pub trait GElem<const D: usize>: Clone + Copy + Debug + Send + Sync {
    type Face: GElem<D>;
    /// Barycentric coordinates, one per vertex
    type BCoords: AsRef<[f64]> + Debug;
    /// Volume of the equilateral element with unit edges
    const IDEAL_VOL: f64;
    const N_EDGES: usize;

    fn from_verts<I: Iterator<Item = Point<D>>>(points: I) -> Self;
    /// Cone from `point` to `face`
    fn from_vert_and_face(point: &Point<D>, face: &Self::Face) -> Self;
    /// Signed volume when `D` is the element dimension (< 0 if inverted), unsigned
    /// measure otherwise
    fn vol(&self) -> f64;
    fn center(&self) -> Point<D>;
    fn vert(&self, i: Idx) -> Point<D>;
    /// Edge vectors, in the local edge order of the topological element
    fn edges(&self) -> impl Iterator<Item = Point<D>>;
    fn bcoords(&self, p: &Point<D>) -> Self::BCoords;
    /// Outward normal scaled by the measure (faces of `D`-dimensional elements only)
    fn scaled_normal(&self) -> Point<D>;
    fn gface(&self, i: Idx) -> Self::Face;
    /// Metric in which the element is equilateral with unit edges
    fn implied_metric_mat(&self) -> Option<SMatrix<f64, D, D>>;
}

/// Simplex with `NV` vertices in dimension `D`
#[derive(Clone, Copy, Debug)]
pub struct GSimplex<const D: usize, const NV: usize> {
    points: [Point<D>; NV],
}

pub type GTetrahedron<const D: usize> = GSimplex<D, 4>;
pub type GTriangle<const D: usize> = GSimplex<D, 3>;
pub type GEdge<const D: usize> = GSimplex<D, 2>;
pub type GVertex<const D: usize> = GSimplex<D, 1>;

impl<const D: usize, const NV: usize> GSimplex<D, NV> {
    fn collect<I: Iterator<Item = Point<D>>>(mut iter: I) -> Self {
        let points: [Point<D>; NV] = std::array::from_fn(|_| {
            iter.next()
                .unwrap_or_else(|| Point::<D>::from_element(f64::NAN))
        });
        debug_assert!(iter.next().is_none());
        debug_assert!(points.iter().all(|p| p.iter().all(|x| !x.is_nan())));
        Self { points }
    }

    fn cone<const K: usize>(point: &Point<D>, face: &GSimplex<D, K>) -> Self {
        debug_assert_eq!(K + 1, NV);
        let points = std::array::from_fn(|i| if i == 0 { *point } else { face.points[i - 1] });
        Self { points }
    }

    fn sub_simplex<const K: usize>(&self, ids: [usize; K]) -> GSimplex<D, K> {
        GSimplex {
            points: ids.map(|i| self.points[i]),
        }
    }

    fn edge_vec(&self, [i, j]: [usize; 2]) -> Point<D> {
        self.points[j] - self.points[i]
    }

    fn barycenter(&self) -> Point<D> {
        self.points.iter().sum::<Point<D>>() / NV as f64
    }

    /// $`(J J^T)^{-1}`$ where $`J = J_K J_{eq}`$ maps the unit equilateral simplex to
    /// this one, $`J_{eq}`$ mapping the reference simplex to the unit equilateral one.
    /// Only for `NV = D + 1`.
    fn implied_metric(&self, j_eq: impl Fn(usize, usize) -> f64) -> Option<SMatrix<f64, D, D>> {
        let j_k = SMatrix::<f64, D, D>::from_fn(|i, j| self.points[j + 1][i] - self.points[0][i]);
        let j = j_k * SMatrix::<f64, D, D>::from_fn(j_eq);
        let m = (j * j.transpose()).try_inverse()?;
        Some(0.5 * (m + m.transpose()))
    }
}

impl<const D: usize> GElem<D> for GTetrahedron<D> {
    type Face = GTriangle<D>;
    type BCoords = [f64; 4];
    const IDEAL_VOL: f64 = 1.0 / (6.0 * std::f64::consts::SQRT_2);
    const N_EDGES: usize = TET_EDGES.len();

    fn from_verts<I: Iterator<Item = Point<D>>>(points: I) -> Self {
        debug_assert_eq!(D, 3);
        Self::collect(points)
    }

    fn from_vert_and_face(point: &Point<D>, face: &Self::Face) -> Self {
        Self::cone(point, face)
    }

    fn vol(&self) -> f64 {
        let [e1, e2, e3] = [[0, 1], [0, 2], [0, 3]].map(|e| self.edge_vec(e));
        e1.cross(&e2).dot(&e3) / 6.0
    }

    fn center(&self) -> Point<D> {
        self.barycenter()
    }

    fn vert(&self, i: Idx) -> Point<D> {
        self.points[i as usize]
    }

    fn edges(&self) -> impl Iterator<Item = Point<D>> {
        TET_EDGES.into_iter().map(move |e| self.edge_vec(e))
    }

    fn bcoords(&self, p: &Point<D>) -> [f64; 4] {
        let a = Matrix4::from_fn(|i, j| if i == 0 { 1.0 } else { self.points[j][i - 1] });
        a.lu()
            .solve(&Vector4::new(1.0, p[0], p[1], p[2]))
            .map_or([0.25; 4], Into::into)
    }

    fn scaled_normal(&self) -> Point<D> {
        unreachable!("volume element");
    }

    fn gface(&self, i: Idx) -> GTriangle<D> {
        self.sub_simplex(TET_FACES[i as usize])
    }

    fn implied_metric_mat(&self) -> Option<SMatrix<f64, D, D>> {
        let j_eq = Matrix3::new(
            1.0,
            -1.0 / SQRT_3,
            -1.0 / SQRT_6,
            0.0,
            2.0 / SQRT_3,
            -1.0 / SQRT_6,
            0.0,
            0.0,
            3.0 / SQRT_6,
        );
        self.implied_metric(|i, j| j_eq[(i, j)])
    }
}

impl<const D: usize> GElem<D> for GTriangle<D> {
    type Face = GEdge<D>;
    type BCoords = [f64; 3];
    const IDEAL_VOL: f64 = SQRT_3 / 4.0;
    const N_EDGES: usize = TRI_EDGES.len();

    fn from_verts<I: Iterator<Item = Point<D>>>(points: I) -> Self {
        Self::collect(points)
    }

    fn from_vert_and_face(point: &Point<D>, face: &Self::Face) -> Self {
        Self::cone(point, face)
    }

    fn vol(&self) -> f64 {
        let (u, v) = (self.edge_vec([0, 1]), self.edge_vec([0, 2]));
        if D == 2 {
            0.5 * (u[0] * v[1] - u[1] * v[0])
        } else {
            0.5 * u.cross(&v).norm()
        }
    }

    fn center(&self) -> Point<D> {
        self.barycenter()
    }

    fn vert(&self, i: Idx) -> Point<D> {
        self.points[i as usize]
    }

    fn edges(&self) -> impl Iterator<Item = Point<D>> {
        TRI_EDGES.into_iter().map(move |e| self.edge_vec(e))
    }

    fn bcoords(&self, p: &Point<D>) -> [f64; 3] {
        if D == 2 {
            let a = Matrix3::from_fn(|i, j| if i == 0 { 1.0 } else { self.points[j][i - 1] });
            a.lu()
                .solve(&Vector3::new(1.0, p[0], p[1]))
                .map_or([1.0 / 3.0; 3], Into::into)
        } else {
            // projection on the plane of the triangle
            let (u, v) = (self.edge_vec([0, 1]), self.edge_vec([0, 2]));
            let w = p - self.points[0];
            let n = u.cross(&v);
            let n2 = n.norm_squared();
            let b1 = w.cross(&v).dot(&n) / n2;
            let b2 = u.cross(&w).dot(&n) / n2;
            [1.0 - b1 - b2, b1, b2]
        }
    }

    fn scaled_normal(&self) -> Point<D> {
        assert_eq!(D, 3, "scaled_normal of a 2d triangle");
        0.5 * self.edge_vec([0, 1]).cross(&self.edge_vec([0, 2]))
    }

    fn gface(&self, i: Idx) -> GEdge<D> {
        self.sub_simplex(TRI_FACES[i as usize])
    }

    fn implied_metric_mat(&self) -> Option<SMatrix<f64, D, D>> {
        let j_eq = [[1.0, -1.0 / SQRT_3], [0.0, 2.0 / SQRT_3]];
        self.implied_metric(|i, j| j_eq[i][j])
    }
}

impl<const D: usize> GElem<D> for GEdge<D> {
    type Face = GVertex<D>;
    type BCoords = [f64; 2];
    const IDEAL_VOL: f64 = 1.0;
    const N_EDGES: usize = EDGE_EDGES.len();

    fn from_verts<I: Iterator<Item = Point<D>>>(points: I) -> Self {
        Self::collect(points)
    }

    fn from_vert_and_face(point: &Point<D>, face: &Self::Face) -> Self {
        Self::cone(point, face)
    }

    fn vol(&self) -> f64 {
        self.edge_vec([0, 1]).norm()
    }

    fn center(&self) -> Point<D> {
        self.barycenter()
    }

    fn vert(&self, i: Idx) -> Point<D> {
        self.points[i as usize]
    }

    fn edges(&self) -> impl Iterator<Item = Point<D>> {
        std::iter::once(self.edge_vec([0, 1]))
    }

    fn bcoords(&self, p: &Point<D>) -> [f64; 2] {
        let e = self.edge_vec([0, 1]);
        let t = (p - self.points[0]).dot(&e) / e.norm_squared();
        [1.0 - t, t]
    }

    /// `e` rotated by -90 degrees
    fn scaled_normal(&self) -> Point<D> {
        assert_eq!(D, 2, "scaled_normal of a 3d edge");
        let e = self.edge_vec([0, 1]);
        let mut n = Point::<D>::zeros();
        n[0] = e[1];
        n[1] = -e[0];
        n
    }

    fn gface(&self, i: Idx) -> GVertex<D> {
        self.sub_simplex([1 - i as usize])
    }

    fn implied_metric_mat(&self) -> Option<SMatrix<f64, D, D>> {
        None
    }
}

impl<const D: usize> GElem<D> for GVertex<D> {
    type Face = Self;
    type BCoords = [f64; 1];
    const IDEAL_VOL: f64 = 1.0;
    const N_EDGES: usize = 0;

    fn from_verts<I: Iterator<Item = Point<D>>>(points: I) -> Self {
        Self::collect(points)
    }

    fn from_vert_and_face(point: &Point<D>, _face: &Self) -> Self {
        Self { points: [*point] }
    }

    fn vol(&self) -> f64 {
        1.0
    }

    fn center(&self) -> Point<D> {
        self.points[0]
    }

    fn vert(&self, i: Idx) -> Point<D> {
        self.points[i as usize]
    }

    fn edges(&self) -> impl Iterator<Item = Point<D>> {
        std::iter::empty()
    }

    fn bcoords(&self, _p: &Point<D>) -> [f64; 1] {
        [1.0]
    }

    fn scaled_normal(&self) -> Point<D> {
        unreachable!("vertex");
    }

    fn gface(&self, _i: Idx) -> Self {
        unreachable!("vertex");
    }

    fn implied_metric_mat(&self) -> Option<SMatrix<f64, D, D>> {
        None
    }
}
