//! Owned adaptation context: a mesh, the target metric being built for it, and the
//! operations needed to go from flat arrays to an adapted mesh and back
//!
//! Independent sessions can be used at the same time, e.g. on different threads.
use crate::{
    Error, GlobalIdx, Idx, Result,
    adapt::{AdaptParams, AdaptReport, adapt},
    mesh::{Elem, Mesh, Mesh2d, Mesh3d, Tetrahedron, Triangle, io::vtk_element_dim},
    metric::{AnisoMetric2d, AnisoMetric3d, Metric, MetricField},
};
use log::debug;

/// A mesh and its (optional) target metric
#[derive(Debug)]
pub struct Context<const D: usize, E: Elem, M: Metric<D>> {
    mesh: Mesh<D, E, M>,
    field: Option<MetricField<D, M>>,
}

impl<const D: usize, E: Elem, M: Metric<D>> Context<D, E, M> {
    const fn new(mesh: Mesh<D, E, M>) -> Self {
        Self { mesh, field: None }
    }

    fn add_field(&mut self, psi: &[f64], target_error: f64, pnorm: i32) -> Result<()> {
        let mut field = self
            .field
            .take()
            .unwrap_or_else(|| MetricField::new(&self.mesh));
        field.add_field(&self.mesh, psi, target_error, pnorm)?;
        field.update_mesh(&mut self.mesh)?;
        self.field = Some(field);
        Ok(())
    }

    fn set_metric(&mut self, metric: &[f64]) -> Result<()> {
        let mut field = MetricField::new(&self.mesh);
        field.alloc_metric(metric)?;
        field.update_mesh(&mut self.mesh)?;
        self.field = Some(field);
        Ok(())
    }

    fn relax(&mut self, alpha: f64) -> Result<()> {
        let Some(field) = &self.field else {
            return Err(Error::from("No metric has been set"));
        };
        field.relax_mesh(&mut self.mesh, alpha)
    }

    fn adapt(&mut self, params: &AdaptParams) -> Result<AdaptReport> {
        let report = adapt(&mut self.mesh, params)?;
        // the vertices have been renumbered
        self.field = None;
        Ok(report)
    }

    /// Position of each vertex slot in the list of live vertices
    fn compact_index(&self) -> Vec<Idx> {
        let mut res = vec![Idx::MAX; self.mesh.n_vert_slots()];
        for (k, i) in self.mesh.vert_ids().enumerate() {
            res[i as usize] = k as Idx;
        }
        res
    }

    fn get_coords(&self) -> Vec<f64> {
        let mut res = Vec::with_capacity(D * self.mesh.n_verts());
        for p in self.mesh.verts() {
            res.extend(p.iter().copied());
        }
        res
    }

    fn get_elements(&self) -> Vec<Idx> {
        let idx = self.compact_index();
        let mut res = Vec::with_capacity(E::N_VERTS as usize * self.mesh.n_elems());
        for e in self.mesh.elems() {
            res.extend(e.iter().map(|&i| idx[i as usize]));
        }
        res
    }

    fn get_metric(&self) -> Vec<f64> {
        self.mesh
            .vert_ids()
            .filter_map(|i| self.mesh.get_metric(i))
            .flatten()
            .collect()
    }
}

/// Adaptation session for a 2d (triangle) or 3d (tetrahedron) mesh
#[derive(Debug)]
pub enum Session {
    TwoD(Context<2, Triangle, AnisoMetric2d>),
    ThreeD(Context<3, Tetrahedron, AnisoMetric3d>),
}

impl From<Mesh2d> for Session {
    fn from(mesh: Mesh2d) -> Self {
        Self::TwoD(Context::new(mesh))
    }
}

impl From<Mesh3d> for Session {
    fn from(mesh: Mesh3d) -> Self {
        Self::ThreeD(Context::new(mesh))
    }
}

impl Session {
    /// Create a 2d session from the vertex coordinates (x0, y0, x1, ...) and the
    /// triangles. The boundary faces are tagged automatically
    pub fn init_2d(coords: &[f64], elems: &[Idx]) -> Result<Self> {
        let etags = vec![1; elems.len() / 3];
        Ok(Mesh2d::from_slices(coords, elems, &etags, &[], &[])?.into())
    }

    /// Create a 3d session from the vertex coordinates (x0, y0, z0, x1, ...) and the
    /// tetrahedra. The boundary faces are tagged automatically
    pub fn init_3d(coords: &[f64], elems: &[Idx]) -> Result<Self> {
        let etags = vec![1; elems.len() / 4];
        Ok(Mesh3d::from_slices(coords, elems, &etags, &[], &[])?.into())
    }

    /// Create a session from a .vtu file; the dimension is given by the cells it
    /// contains
    pub fn init_from_vtu(file_name: &str) -> Result<Self> {
        match vtk_element_dim(file_name)? {
            2 => Ok(Mesh2d::from_vtk(file_name)?.into()),
            _ => Ok(Mesh3d::from_vtk(file_name)?.into()),
        }
    }

    #[must_use]
    pub const fn dim(&self) -> usize {
        match self {
            Self::TwoD(_) => 2,
            Self::ThreeD(_) => 3,
        }
    }

    /// Number of values per vertex in the metric buffers (3 in 2d, 6 in 3d)
    #[must_use]
    pub const fn metric_size(&self) -> usize {
        match self {
            Self::TwoD(_) => 3,
            Self::ThreeD(_) => 6,
        }
    }

    /// Add a metric computed from the scalar field `psi` (one value per vertex) so that
    /// its interpolation error is `target_error` in the `pnorm` norm (-1 for the
    /// absolute error). Successive fields are combined by metric intersection, and the
    /// result is stored on the mesh
    pub fn add_field(&mut self, psi: &[f64], target_error: f64, pnorm: i32) -> Result<()> {
        debug!("Session: add field");
        match self {
            Self::TwoD(c) => c.add_field(psi, target_error, pnorm),
            Self::ThreeD(c) => c.add_field(psi, target_error, pnorm),
        }
    }

    /// Set the target metric from a flat buffer with `metric_size()` values per vertex,
    /// (m00, m01, m11) in 2d and (m00, m01, m02, m11, m12, m22) in 3d, replacing any
    /// metric built by `add_field`
    pub fn set_metric(&mut self, metric: &[f64]) -> Result<()> {
        debug!("Session: set metric");
        match self {
            Self::TwoD(c) => c.set_metric(metric),
            Self::ThreeD(c) => c.set_metric(metric),
        }
    }

    /// Blend the target metric with the metric implied by the current mesh:
    /// `alpha = 0` keeps the mesh as is, `alpha = 1` uses the target metric
    pub fn relax(&mut self, alpha: f64) -> Result<()> {
        match self {
            Self::TwoD(c) => c.relax(alpha),
            Self::ThreeD(c) => c.relax(alpha),
        }
    }

    /// Adapt the mesh to its metric. The target metric is discarded, as the mesh
    /// vertices change; the adapted mesh keeps the interpolated metric
    pub fn adapt(&mut self, params: &AdaptParams) -> Result<AdaptReport> {
        match self {
            Self::TwoD(c) => c.adapt(params),
            Self::ThreeD(c) => c.adapt(params),
        }
    }

    /// Number of vertices and elements
    #[must_use]
    pub fn get_info(&self) -> (usize, usize) {
        match self {
            Self::TwoD(c) => (c.mesh.n_verts(), c.mesh.n_elems()),
            Self::ThreeD(c) => (c.mesh.n_verts(), c.mesh.n_elems()),
        }
    }

    /// Vertex coordinates, vertex by vertex
    #[must_use]
    pub fn get_coords(&self) -> Vec<f64> {
        match self {
            Self::TwoD(c) => c.get_coords(),
            Self::ThreeD(c) => c.get_coords(),
        }
    }

    /// Element connectivities, numbered consistently with `get_coords`
    #[must_use]
    pub fn get_elements(&self) -> Vec<Idx> {
        match self {
            Self::TwoD(c) => c.get_elements(),
            Self::ThreeD(c) => c.get_elements(),
        }
    }

    /// Number of vertices owned by each rank, and the contiguous global number of
    /// each local vertex
    #[must_use]
    pub fn get_lnn2gnn(&self) -> (Vec<usize>, Vec<GlobalIdx>) {
        match self {
            Self::TwoD(c) => c.mesh.get_global_node_numbering(),
            Self::ThreeD(c) => c.mesh.get_global_node_numbering(),
        }
    }

    /// Metric stored on the mesh, `metric_size()` values per vertex
    #[must_use]
    pub fn get_metric(&self) -> Vec<f64> {
        match self {
            Self::TwoD(c) => c.get_metric(),
            Self::ThreeD(c) => c.get_metric(),
        }
    }

    pub fn dump_vtu(&self, file_name: &str) -> Result<()> {
        match self {
            Self::TwoD(c) => c.mesh.write_vtk(file_name),
            Self::ThreeD(c) => c.mesh.write_vtk(file_name),
        }
    }

    #[must_use]
    pub const fn mesh_2d(&self) -> Option<&Mesh2d> {
        match self {
            Self::TwoD(c) => Some(&c.mesh),
            Self::ThreeD(_) => None,
        }
    }

    #[must_use]
    pub const fn mesh_3d(&self) -> Option<&Mesh3d> {
        match self {
            Self::TwoD(_) => None,
            Self::ThreeD(c) => Some(&c.mesh),
        }
    }
}
