mod arena;
mod geom_elems;
mod simplex_mesh;
mod topo_elems;

pub mod io;
pub mod test_meshes;

use nalgebra::SVector;

pub use geom_elems::{GEdge, GElem, GSimplex, GTetrahedron, GTriangle, GVertex};
pub use simplex_mesh::{ElemInfo, Mesh, Mesh2d, Mesh3d, VtxInfo};
pub(crate) use simplex_mesh::intersection;
pub use topo_elems::{Edge, Elem, Tetrahedron, Triangle, Vertex, get_face_to_elem};

pub type Point<const D: usize> = SVector<f64, D>;
