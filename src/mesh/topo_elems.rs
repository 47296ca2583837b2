use super::geom_elems::{GEdge, GElem, GTetrahedron, GTriangle, GVertex};
use crate::Idx;
use core::hash::Hash;
use core::slice::Iter;
use rustc_hash::FxHashMap;
use std::array::IntoIter;
use std::fmt::Debug;
use std::ops::{Index, IndexMut};

/// Simplex connectivity: the ids of the vertices of an element, faces or edges
///
/// Faces are numbered after their opposite vertex and are oriented outwards.
pub trait Elem:
    Clone
    + Copy
    + Eq
    + PartialEq
    + Hash
    + IntoIterator<Item = Idx>
    + Index<usize, Output = Idx>
    + IndexMut<usize, Output = Idx>
    + Default
    + Debug
    + Send
    + Sync
{
    const N_VERTS: Idx;
    const N_FACES: Idx;
    const N_EDGES: Idx;
    /// Topological dimension
    const DIM: Idx;
    type Face: Elem;
    /// Geometric counterpart, once the vertex coordinates are known
    type Geom<const D: usize>: GElem<D>;

    fn iter(&self) -> Iter<'_, Idx>;
    fn from_slice(s: &[Idx]) -> Self;
    /// Take the first `N_VERTS` ids of `s`
    fn from_iter<I: Iterator<Item = Idx>>(s: I) -> Self;
    /// Sort the ids; the result is a key, not a valid oriented element
    fn sort(&mut self);
    /// Face opposite to the `i`-th vertex
    fn face(&self, i: Idx) -> Self::Face;
    fn edge(&self, i: Idx) -> [Idx; 2];

    /// Cone from vertex `i` to face `f`; positive when `i` is on the inner side of `f`
    fn from_vertex_and_face(i: Idx, f: &Self::Face) -> Self {
        Self::from_iter(std::iter::once(i).chain(f.iter().copied()))
    }

    fn contains_vertex(&self, i: Idx) -> bool {
        self.iter().any(|&j| j == i)
    }

    fn contains_edge(&self, [i0, i1]: [Idx; 2]) -> bool {
        self.contains_vertex(i0) && self.contains_vertex(i1)
    }

    #[must_use]
    fn sorted(&self) -> Self {
        let mut key = *self;
        key.sort();
        key
    }

    #[must_use]
    fn sorted_edge(&self, i: Idx) -> [Idx; 2] {
        let [a, b] = self.edge(i);
        if a < b { [a, b] } else { [b, a] }
    }
}

/// Local vertex ids of the faces (opposite to each vertex, oriented outwards) and of
/// the edges of the simplices. Shared with the geometric elements.
pub(super) const TET_FACES: [[usize; 3]; 4] = [[1, 2, 3], [2, 0, 3], [0, 1, 3], [0, 2, 1]];
pub(super) const TET_EDGES: [[usize; 2]; 6] = [[0, 1], [1, 2], [2, 0], [0, 3], [1, 3], [2, 3]];
pub(super) const TRI_FACES: [[usize; 2]; 3] = [[1, 2], [2, 0], [0, 1]];
pub(super) const TRI_EDGES: [[usize; 2]; 3] = [[0, 1], [1, 2], [2, 0]];
pub(super) const EDGE_FACES: [[usize; 1]; 2] = [[1], [0]];
pub(super) const EDGE_EDGES: [[usize; 2]; 1] = [[0, 1]];
const NO_FACES: [[usize; 1]; 0] = [];
const NO_EDGES: [[usize; 2]; 0] = [];

/// Implements `Elem` and the array-like traits for a simplex stored as `[Idx; N]`
macro_rules! simplex {
    (
        $(#[$attr:meta])*
        $name:ident[$n:literal], dim $dim:literal,
        face $face:ty, geom $geom:ident,
        faces $faces:ident,
        edges $edges:ident $(,)?
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Hash, Debug, Eq, PartialEq, Default)]
        pub struct $name([Idx; $n]);

        impl Elem for $name {
            const N_VERTS: Idx = $n;
            const N_FACES: Idx = $faces.len() as Idx;
            const N_EDGES: Idx = $edges.len() as Idx;
            const DIM: Idx = $dim;

            type Face = $face;
            type Geom<const D: usize> = $geom<D>;

            fn iter(&self) -> Iter<'_, Idx> {
                self.0.iter()
            }

            fn from_slice(s: &[Idx]) -> Self {
                let mut ids = [0; $n];
                ids.copy_from_slice(&s[..$n]);
                Self(ids)
            }

            fn from_iter<I: Iterator<Item = Idx>>(mut s: I) -> Self {
                let ids = std::array::from_fn(|_| s.next().unwrap_or(Idx::MAX));
                debug_assert!(!ids.contains(&Idx::MAX), "not enough vertices");
                Self(ids)
            }

            fn sort(&mut self) {
                self.0.sort_unstable();
            }

            #[inline]
            fn face(&self, i: Idx) -> Self::Face {
                <$face>::from_iter($faces[i as usize].iter().map(|&k| self.0[k]))
            }

            #[inline]
            fn edge(&self, i: Idx) -> [Idx; 2] {
                $edges[i as usize].map(|k| self.0[k])
            }
        }

        impl IntoIterator for $name {
            type Item = Idx;
            type IntoIter = IntoIter<Idx, $n>;

            fn into_iter(self) -> Self::IntoIter {
                self.0.into_iter()
            }
        }

        impl Index<usize> for $name {
            type Output = Idx;

            fn index(&self, index: usize) -> &Idx {
                &self.0[index]
            }
        }

        impl IndexMut<usize> for $name {
            fn index_mut(&mut self, index: usize) -> &mut Idx {
                &mut self.0[index]
            }
        }
    };
}

simplex!(
    Tetrahedron[4], dim 3,
    face Triangle, geom GTetrahedron,
    faces TET_FACES,
    edges TET_EDGES,
);

simplex!(
    Triangle[3], dim 2,
    face Edge, geom GTriangle,
    faces TRI_FACES,
    edges TRI_EDGES,
);

simplex!(
    Edge[2], dim 1,
    face Vertex, geom GEdge,
    faces EDGE_FACES,
    edges EDGE_EDGES,
);

simplex!(
    /// Has no faces nor edges
    Vertex[1], dim 0,
    face Vertex, geom GVertex,
    faces NO_FACES,
    edges NO_EDGES,
);

impl Tetrahedron {
    #[must_use]
    pub const fn new(i0: Idx, i1: Idx, i2: Idx, i3: Idx) -> Self {
        Self([i0, i1, i2, i3])
    }
}

impl Triangle {
    #[must_use]
    pub const fn new(i0: Idx, i1: Idx, i2: Idx) -> Self {
        Self([i0, i1, i2])
    }
}

impl Edge {
    #[must_use]
    pub const fn new(i0: Idx, i1: Idx) -> Self {
        Self([i0, i1])
    }
}

/// Group the faces of `elems` by their sorted connectivity; each entry lists the
/// `(element, local face)` pairs sharing that face. Interior faces appear twice,
/// boundary faces once.
#[must_use]
pub fn get_face_to_elem<E: Elem, I: Iterator<Item = (Idx, E)>>(
    elems: I,
) -> FxHashMap<E::Face, Vec<(Idx, Idx)>> {
    let mut res: FxHashMap<E::Face, Vec<(Idx, Idx)>> = FxHashMap::default();
    for (i_elem, e) in elems {
        for i_face in 0..E::N_FACES {
            res.entry(e.face(i_face).sorted())
                .or_default()
                .push((i_elem, i_face));
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::{Edge, Elem, Tetrahedron, Triangle, get_face_to_elem};

    #[test]
    fn test_counts() {
        assert_eq!(Tetrahedron::N_FACES, 4);
        assert_eq!(Tetrahedron::N_EDGES, 6);
        assert_eq!(Triangle::N_FACES, 3);
        assert_eq!(Triangle::N_EDGES, 3);
        assert_eq!(Edge::N_FACES, 2);
        assert_eq!(Edge::N_EDGES, 1);
    }

    #[test]
    fn test_square_faces() {
        let elems = [Triangle::new(0, 1, 2), Triangle::new(0, 2, 3)];
        let faces = get_face_to_elem(elems.iter().copied().zip(0..).map(|(e, i)| (i, e)));
        assert_eq!(faces.len(), 5);

        assert_eq!(faces[&Edge::new(0, 1)], vec![(0, 2)]);
        assert_eq!(faces[&Edge::new(0, 3)], vec![(1, 1)]);
        // the diagonal is shared
        let diag = &faces[&Edge::new(0, 2)];
        assert_eq!(diag.iter().map(|&(i, _)| i).collect::<Vec<_>>(), [0, 1]);
        assert!(faces.keys().all(|f| f[0] < f[1]));
    }

    #[test]
    fn test_faces_opposite() {
        let e = Tetrahedron::new(4, 5, 6, 7);
        for i in 0..4 {
            let f = e.face(i);
            assert!(!f.contains_vertex(e[i as usize]));
            assert_eq!(
                Tetrahedron::from_vertex_and_face(e[i as usize], &f).sorted(),
                e.sorted()
            );
        }

        let e = Triangle::new(4, 5, 6);
        for i in 0..3 {
            assert!(!e.face(i).contains_vertex(e[i as usize]));
        }
    }

    #[test]
    fn test_edges() {
        let e = Tetrahedron::new(9, 3, 7, 1);
        let mut edges = (0..Tetrahedron::N_EDGES)
            .map(|i| e.sorted_edge(i))
            .collect::<Vec<_>>();
        edges.sort_unstable();
        edges.dedup();
        assert_eq!(edges.len(), 6);
        assert!(edges.iter().all(|&[a, b]| a < b && e.contains_edge([b, a])));
    }
}
