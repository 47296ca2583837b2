use crate::{
    GlobalIdx, Idx, Result, Tag,
    mesh::{Elem, GElem, Mesh, Point, intersection},
    metric::Metric,
    parallel::{EditVertex, HaloEdit},
};
use core::fmt;
use log::trace;
use rustc_hash::FxHashMap;

/// Mesh entity a cavity is built around
#[derive(Debug, Clone, Copy)]
pub(super) enum Seed {
    Vertex(Idx),
    Edge([Idx; 2]),
    Face([Idx; 3]),
}

impl Seed {
    /// Check if all the vertices of the seed belong to `e`
    fn is_in<F: Elem>(&self, e: &F) -> bool {
        match self {
            Self::Vertex(i) => e.contains_vertex(*i),
            Self::Edge(edg) => e.contains_edge(*edg),
            Self::Face(f) => f.iter().all(|&i| e.contains_vertex(i)),
        }
    }
}

#[derive(Debug)]
pub(super) enum CavityCheckStatus {
    LongEdge(f64),
    ShortEdge(f64),
    Invalid,
    LowQuality(f64),
    /// Minimum quality of the new elements
    Ok(f64),
}

impl fmt::Display for CavityCheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LongEdge(l) => write!(f, "long edge ({l:.3})"),
            Self::ShortEdge(l) => write!(f, "short edge ({l:.3})"),
            Self::Invalid => write!(f, "invalid element"),
            Self::LowQuality(q) => write!(f, "low quality ({q:.3})"),
            Self::Ok(q) => write!(f, "ok (min quality {q:.3})"),
        }
    }
}

/// Local cavity built from a mesh entity (vertex, edge or face)
/// Vertices and elements are copied from the mesh and stored using a local numbering
#[derive(Debug)]
pub(super) struct Cavity<const D: usize, E: Elem, M: Metric<D>> {
    /// Conversion from local to global vertex indices
    pub(super) local2global: Vec<Idx>,
    pub(super) points: Vec<Point<D>>,
    pub(super) metrics: Vec<M>,
    /// Elements stored using the local vertex numbering
    pub(super) elems: Vec<E>,
    pub(super) etags: Vec<Tag>,
    pub(super) global_elem_ids: Vec<Idx>,
    /// Faces of the cavity elements that do not contain the seed, oriented outwards,
    /// with the tag of the element they come from
    pub(super) faces: Vec<(E::Face, Tag)>,
    /// Tagged faces that contain the seed
    pub(super) tagged_faces: Vec<(E::Face, Tag)>,
    /// Faces of the tagged faces that do not contain the seed
    pub(super) tagged_bdys: Vec<(<E::Face as Elem>::Face, Tag)>,
    pub(super) seed: Seed,
    /// Minimum element quality in the cavity
    pub(super) q_min: f64,
}

impl<const D: usize, E: Elem, M: Metric<D>> Cavity<D, E, M> {
    /// Create a new (empty) cavity
    pub const fn new() -> Self {
        Self {
            local2global: Vec::new(),
            points: Vec::new(),
            metrics: Vec::new(),
            elems: Vec::new(),
            etags: Vec::new(),
            global_elem_ids: Vec::new(),
            faces: Vec::new(),
            tagged_faces: Vec::new(),
            tagged_bdys: Vec::new(),
            seed: Seed::Vertex(0),
            q_min: f64::INFINITY,
        }
    }

    fn clear(&mut self) {
        self.local2global.clear();
        self.points.clear();
        self.metrics.clear();
        self.elems.clear();
        self.etags.clear();
        self.global_elem_ids.clear();
        self.faces.clear();
        self.tagged_faces.clear();
        self.tagged_bdys.clear();
        self.q_min = f64::INFINITY;
    }

    /// Get the local vertex index from a global vertex index
    pub fn get_local_index(&self, i: Idx) -> Option<Idx> {
        self.local2global
            .iter()
            .position(|&j| j == i)
            .map(|k| k as Idx)
    }

    fn local_index_or_insert(&mut self, mesh: &Mesh<D, E, M>, i: Idx) -> Idx {
        if let Some(k) = self.get_local_index(i) {
            return k;
        }
        let v = &mesh.verts[i];
        self.local2global.push(i);
        self.points.push(v.vx);
        self.metrics.push(v.m);
        (self.local2global.len() - 1) as Idx
    }

    pub fn init_from_vertex(&mut self, mesh: &Mesh<D, E, M>, i: Idx) {
        let elems = mesh.vertex_elements(i).to_vec();
        self.compute(mesh, &elems, Seed::Vertex(i));
    }

    pub fn init_from_edge(&mut self, mesh: &Mesh<D, E, M>, edg: [Idx; 2]) {
        let elems = mesh.edge_elements(edg);
        self.compute(mesh, &elems, Seed::Edge(edg));
    }

    pub fn init_from_face(&mut self, mesh: &Mesh<D, E, M>, f: [Idx; 3]) {
        let elems = intersection(
            &mesh.edge_elements([f[0], f[1]]),
            mesh.vertex_elements(f[2]),
        );
        self.compute(mesh, &elems, Seed::Face(f));
    }

    /// Build the local cavity from a list of elements
    fn compute(&mut self, mesh: &Mesh<D, E, M>, global_elems: &[Idx], seed: Seed) {
        self.clear();

        for &i_elem in global_elems {
            let e = mesh.elems[i_elem];
            let local = E::from_iter(e.el.iter().map(|&i| self.local_index_or_insert(mesh, i)));
            self.q_min = self.q_min.min(e.q);
            self.global_elem_ids.push(i_elem);
            self.elems.push(local);
            self.etags.push(e.tag);
        }

        // seed vertices are always part of the cavity elements
        let local = |i: Idx| self.get_local_index(i).unwrap_or(Idx::MAX);
        let seed = match seed {
            Seed::Vertex(i) => Seed::Vertex(local(i)),
            Seed::Edge([i0, i1]) => Seed::Edge([local(i0), local(i1)]),
            Seed::Face([i0, i1, i2]) => Seed::Face([local(i0), local(i1), local(i2)]),
        };
        self.seed = seed;

        self.compute_faces(mesh);
        trace!("Cavity built: {self}");
    }

    fn compute_faces(&mut self, mesh: &Mesh<D, E, M>) {
        for k in 0..self.elems.len() {
            let e = self.elems[k];
            let tag = self.etags[k];
            for i_face in 0..E::N_FACES {
                let face = e.face(i_face);
                if !self.seed.is_in(&face) {
                    self.faces.push((face, tag));
                    continue;
                }
                let Some(face_tag) = mesh.face_tag(&self.global_elem(&face)) else {
                    continue;
                };
                let sorted = face.sorted();
                if self.tagged_faces.iter().any(|(f, _)| f.sorted() == sorted) {
                    continue;
                }
                self.tagged_faces.push((face, face_tag));
                for i_bdy in 0..<E::Face as Elem>::N_FACES {
                    let b = face.face(i_bdy);
                    let b_sorted = b.sorted();
                    if !self.seed.is_in(&b)
                        && !self.tagged_bdys.iter().any(|(x, _)| x.sorted() == b_sorted)
                    {
                        self.tagged_bdys.push((b, face_tag));
                    }
                }
            }
        }
    }

    pub fn n_verts(&self) -> Idx {
        self.points.len() as Idx
    }

    /// Convert an element or a face from local to global vertex numbering
    pub fn global_elem<F: Elem>(&self, e: &F) -> F {
        F::from_iter(e.iter().map(|&i| self.local2global[i as usize]))
    }

    /// Get the i-th geometrical element
    pub fn gelem(&self, i: usize) -> E::Geom<D> {
        <E::Geom<D> as GElem<D>>::from_verts(self.elems[i].iter().map(|&j| self.points[j as usize]))
    }

    /// Check if all the cavity elements have the same tag
    pub fn has_single_region(&self) -> bool {
        self.etags.windows(2).all(|w| w[0] == w[1])
    }

    /// Tagged faces in global numbering
    pub fn global_tagged_faces(&self) -> impl Iterator<Item = (E::Face, Tag)> + '_ {
        self.tagged_faces
            .iter()
            .map(|(f, t)| (self.global_elem(f), *t))
    }

    /// Volume of the cavity elements for each region
    fn volumes(&self) -> FxHashMap<Tag, f64> {
        let mut res = FxHashMap::default();
        for (i, &t) in self.etags.iter().enumerate() {
            *res.entry(t).or_default() += self.gelem(i).vol();
        }
        res
    }

    /// Measure of the tagged faces containing the seed for each face tag
    fn tagged_measures(&self) -> FxHashMap<Tag, f64> {
        let mut res = FxHashMap::default();
        for (f, t) in &self.tagged_faces {
            *res.entry(*t).or_default() += self.gface(f).vol().abs();
        }
        res
    }

    /// Get the geometrical face
    pub fn gface(&self, f: &E::Face) -> <E::Geom<D> as GElem<D>>::Face {
        <<E::Geom<D> as GElem<D>>::Face as GElem<D>>::from_verts(
            f.iter().map(|&i| self.points[i as usize]),
        )
    }
}

impl<const D: usize, E: Elem, M: Metric<D>> fmt::Display for Cavity<D, E, M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "seed {:?}, vertices {:?}", self.seed, self.local2global)?;
        write!(f, ", elements {:?}", self.global_elem_ids)?;
        write!(f, ", {} faces", self.faces.len())?;
        write!(f, ", {} tagged faces", self.tagged_faces.len())
    }
}

/// Vertex used to fill a cavity
#[derive(Debug, Clone, Copy)]
pub(super) enum FilledCavityType<const D: usize, M: Metric<D>> {
    /// Existing cavity vertex (local index)
    ExistingVertex(Idx),
    /// Existing cavity vertex moved to a new location
    MovedVertex((Idx, Point<D>, M)),
    /// New vertex
    NewVertex((Point<D>, M)),
}

/// Cavity reconstructed from one of its vertices or from a new one
pub(super) struct FilledCavity<'a, const D: usize, E: Elem, M: Metric<D>> {
    pub cavity: &'a Cavity<D, E, M>,
    pub ftype: FilledCavityType<D, M>,
}

impl<'a, const D: usize, E: Elem, M: Metric<D>> FilledCavity<'a, D, E, M> {
    pub const fn new(cavity: &'a Cavity<D, E, M>, ftype: FilledCavityType<D, M>) -> Self {
        Self { cavity, ftype }
    }

    const fn vertex(&self) -> Option<Idx> {
        match self.ftype {
            FilledCavityType::ExistingVertex(i) | FilledCavityType::MovedVertex((i, _, _)) => {
                Some(i)
            }
            FilledCavityType::NewVertex(_) => None,
        }
    }

    /// Check if the reconstruction gives back the cavity
    pub fn is_same(&self) -> bool {
        if let FilledCavityType::ExistingVertex(i) = self.ftype {
            self.cavity.elems.iter().all(|e| e.contains_vertex(i))
        } else {
            false
        }
    }

    /// Faces of the cavity that are connected to the reconstruction vertex
    pub fn faces(&self) -> impl Iterator<Item = (E::Face, Tag)> + '_ {
        let i = self.vertex();
        self.cavity
            .faces
            .iter()
            .copied()
            .filter(move |(f, _)| i.is_none_or(|i| !f.contains_vertex(i)))
    }

    /// Faces of the tagged faces that are connected to the reconstruction vertex
    pub fn tagged_faces_boundary(
        &self,
    ) -> impl Iterator<Item = (<E::Face as Elem>::Face, Tag)> + '_ {
        let i = self.vertex();
        self.cavity
            .tagged_bdys
            .iter()
            .copied()
            .filter(move |(b, _)| i.is_none_or(|i| !b.contains_vertex(i)))
    }

    /// Location and metric of the reconstruction vertex
    fn point(&self) -> (Point<D>, M) {
        match self.ftype {
            FilledCavityType::ExistingVertex(i) => (
                self.cavity.points[i as usize],
                self.cavity.metrics[i as usize],
            ),
            FilledCavityType::MovedVertex((_, p, m)) | FilledCavityType::NewVertex((p, m)) => {
                (p, m)
            }
        }
    }

    /// Geometrical element built from the reconstruction vertex and a face
    fn gelem(&self, p0: &Point<D>, f: &E::Face) -> E::Geom<D> {
        <E::Geom<D> as GElem<D>>::from_vert_and_face(p0, &self.cavity.gface(f))
    }

    /// Check the lengths of the new edges and the quality of the new elements
    pub fn check(&self, l_min: f64, l_max: f64, q_min: f64) -> CavityCheckStatus {
        let (p0, m0) = self.point();
        let mut min_quality = 1.0_f64;
        for (f, _) in self.faces() {
            for &i in f.iter() {
                let l = M::edge_length(
                    &p0,
                    &m0,
                    &self.cavity.points[i as usize],
                    &self.cavity.metrics[i as usize],
                );
                if l < l_min {
                    return CavityCheckStatus::ShortEdge(l);
                }
                if l > l_max {
                    return CavityCheckStatus::LongEdge(l);
                }
            }

            let ge = self.gelem(&p0, &f);
            let metrics =
                std::iter::once(m0).chain(f.iter().map(|&i| self.cavity.metrics[i as usize]));
            let q = M::quality(&ge, metrics);
            if q < 0.0 {
                return CavityCheckStatus::Invalid;
            } else if q <= q_min {
                return CavityCheckStatus::LowQuality(q);
            }
            min_quality = min_quality.min(q);
        }
        CavityCheckStatus::Ok(min_quality)
    }

    /// Minimum quality of the new elements (-1 if one of them is invalid)
    pub fn min_quality(&self) -> f64 {
        match self.check(0.0, f64::MAX, f64::NEG_INFINITY) {
            CavityCheckStatus::Ok(q) => q,
            _ => -1.0,
        }
    }

    /// Check that the region volumes and the measures of the tagged faces are unchanged
    pub fn is_conservative(&self) -> bool {
        let (p0, _) = self.point();
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-10 * a.abs().max(b.abs()) + 1e-300;

        let mut volumes: FxHashMap<Tag, f64> = FxHashMap::default();
        for (f, t) in self.faces() {
            *volumes.entry(t).or_default() += self.gelem(&p0, &f).vol();
        }
        let old = self.cavity.volumes();
        if old
            .iter()
            .any(|(t, v)| volumes.get(t).is_none_or(|&x| !close(*v, x)))
        {
            trace!("cavity check failed: region volumes not conserved");
            return false;
        }

        let mut measures: FxHashMap<Tag, f64> = FxHashMap::default();
        for (b, t) in self.tagged_faces_boundary() {
            let gb = <<<E::Geom<D> as GElem<D>>::Face as GElem<D>>::Face as GElem<D>>::from_verts(
                b.iter().map(|&i| self.cavity.points[i as usize]),
            );
            let gf = <<E::Geom<D> as GElem<D>>::Face as GElem<D>>::from_vert_and_face(&p0, &gb);
            *measures.entry(t).or_default() += gf.vol().abs();
        }
        let old = self.cavity.tagged_measures();
        if old
            .iter()
            .any(|(t, v)| !close(*v, measures.get(t).copied().unwrap_or(0.0)))
        {
            trace!("cavity check failed: tagged face measures not conserved");
            return false;
        }
        true
    }

    /// Check that the new tagged faces do not already exist and that no face of the
    /// new elements is shared by more than two elements
    pub fn is_conforming(&self, mesh: &Mesh<D, E, M>) -> bool {
        let Some(i) = self.vertex() else {
            return true;
        };
        let ig = self.cavity.local2global[i as usize];

        for (b, _) in self.tagged_faces_boundary() {
            let f = E::Face::from_vertex_and_face(ig, &self.cavity.global_elem(&b));
            if mesh.face_tag(&f).is_some() {
                trace!("cavity check failed: tagged face already present");
                return false;
            }
        }

        let mut counts: FxHashMap<E::Face, usize> = FxHashMap::default();
        for (f, _) in self.faces() {
            let e = E::from_vertex_and_face(ig, &self.cavity.global_elem(&f));
            for i_face in 0..E::N_FACES {
                let face = e.face(i_face);
                if face.contains_vertex(ig) {
                    *counts.entry(face.sorted()).or_default() += 1;
                }
            }
        }
        for (face, n) in counts {
            let n_out = mesh
                .face_elements(&face)
                .iter()
                .filter(|k| !self.cavity.global_elem_ids.contains(*k))
                .count();
            if n + n_out > 2 {
                trace!("cavity check failed: non conforming face {face:?}");
                return false;
            }
        }
        true
    }
}

impl<const D: usize, E: Elem, M: Metric<D>> FilledCavity<'_, D, E, M> {
    /// Describe the reconstruction with global vertex indices, so that it can be
    /// applied by all the ranks holding part of the cavity. The vertices of the edit
    /// are the cavity vertices, in the same order. A moved vertex only changes the
    /// vertex data
    pub fn to_halo_edit(&self, mesh: &Mesh<D, E, M>, key: GlobalIdx) -> HaloEdit<D, E, M> {
        let cavity = self.cavity;
        let mut verts = cavity
            .local2global
            .iter()
            .map(|&i| {
                let v = &mesh.verts[i];
                EditVertex {
                    gid: v.gid,
                    owner: v.owner,
                    vx: v.vx,
                    m: v.m,
                }
            })
            .collect::<Vec<_>>();

        let mut edit = HaloEdit {
            key,
            verts: Vec::new(),
            old_elems: Vec::new(),
            new_elems: Vec::new(),
            old_faces: Vec::new(),
            new_faces: Vec::new(),
        };
        match self.ftype {
            FilledCavityType::MovedVertex((i, p, m)) => {
                verts[i as usize].vx = p;
                verts[i as usize].m = m;
            }
            FilledCavityType::ExistingVertex(i) => {
                edit.old_elems.clone_from(&cavity.elems);
                edit.new_elems = self
                    .faces()
                    .map(|(f, t)| (E::from_vertex_and_face(i, &f), t))
                    .collect();
                edit.old_faces = cavity.tagged_faces.iter().map(|(f, _)| *f).collect();
                edit.new_faces = self
                    .tagged_faces_boundary()
                    .map(|(b, t)| (E::Face::from_vertex_and_face(i, &b), t))
                    .collect();
            }
            FilledCavityType::NewVertex(_) => unreachable!("new vertices have no global index"),
        }
        edit.verts = verts;
        edit
    }
}

impl<const D: usize, E: Elem, M: Metric<D>> Mesh<D, E, M> {
    /// Replace the cavity elements by the filled cavity elements. `ip` is the global
    /// index of the reconstruction vertex, that must be present in the mesh
    pub(super) fn apply_filled_cavity(
        &mut self,
        filled: &FilledCavity<D, E, M>,
        ip: Idx,
    ) -> Result<()> {
        let cavity = filled.cavity;
        for &k in &cavity.global_elem_ids {
            self.remove_elem(k)?;
        }
        for (f, t) in filled.faces() {
            let f = cavity.global_elem(&f);
            self.insert_elem(E::from_vertex_and_face(ip, &f), t)?;
        }
        for (f, _) in cavity.global_tagged_faces() {
            self.remove_tagged_face(f)?;
        }
        for (b, t) in filled.tagged_faces_boundary() {
            let b = cavity.global_elem(&b);
            self.add_tagged_face(E::Face::from_vertex_and_face(ip, &b), t)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Cavity, CavityCheckStatus, FilledCavity, FilledCavityType, Seed};
    use crate::{
        Result, assert_delta,
        mesh::{Mesh2d, Point, test_meshes::test_mesh_2d},
        metric::AnisoMetric2d,
    };

    #[test]
    fn test_edge_cavity() -> Result<()> {
        let mesh = test_mesh_2d()?;
        let mut cavity = Cavity::new();
        cavity.init_from_edge(&mesh, [0, 2]);
        assert_eq!(cavity.n_verts(), 4);
        assert_eq!(cavity.elems.len(), 2);
        assert_eq!(cavity.faces.len(), 4);
        assert!(cavity.tagged_faces.is_empty());
        assert!(cavity.has_single_region());
        assert!(matches!(cavity.seed, Seed::Edge(_)));

        // diagonal swap
        let i1 = cavity.get_local_index(1).unwrap();
        let filled = FilledCavity::new(&cavity, FilledCavityType::ExistingVertex(i1));
        assert!(!filled.is_same());
        assert_eq!(filled.faces().count(), 2);
        assert!(filled.is_conservative());
        assert!(filled.is_conforming(&mesh));
        assert!(matches!(filled.check(0.0, f64::MAX, 0.0), CavityCheckStatus::Ok(_)));

        // new vertex at the center
        let filled = FilledCavity::new(
            &cavity,
            FilledCavityType::NewVertex((Point::<2>::new(0.5, 0.5), AnisoMetric2d::default())),
        );
        assert_eq!(filled.faces().count(), 4);
        assert!(filled.is_conservative());

        // new vertex outside of the cavity
        let filled = FilledCavity::new(
            &cavity,
            FilledCavityType::NewVertex((Point::<2>::new(1.5, 0.5), AnisoMetric2d::default())),
        );
        assert!(matches!(filled.check(0.0, f64::MAX, 0.0), CavityCheckStatus::Invalid));
        assert_delta!(filled.min_quality(), -1.0, 1e-12);

        Ok(())
    }

    #[test]
    fn test_check_status() -> Result<()> {
        let mesh = test_mesh_2d()?;
        let mut cavity = Cavity::new();
        cavity.init_from_edge(&mesh, [0, 2]);
        let filled = FilledCavity::new(
            &cavity,
            FilledCavityType::NewVertex((Point::<2>::new(0.5, 0.5), AnisoMetric2d::default())),
        );

        let status = filled.check(0.0, 0.0, 0.0);
        let CavityCheckStatus::LongEdge(l) = status else {
            panic!("unexpected status {status}");
        };
        assert!(l > 0.0);
        assert_eq!(status.to_string(), format!("long edge ({l:.3})"));

        let status = filled.check(f64::MAX, f64::MAX, 0.0);
        assert!(matches!(status, CavityCheckStatus::ShortEdge(_)));
        assert!(status.to_string().starts_with("short edge"));

        let status = filled.check(0.0, f64::MAX, 0.99);
        assert!(matches!(status, CavityCheckStatus::LowQuality(_)));

        let status = filled.check(0.0, f64::MAX, 0.0);
        let CavityCheckStatus::Ok(q) = status else {
            panic!("unexpected status {status}");
        };
        assert!(q > 0.0 && q < 0.99);
        assert!(status.to_string().starts_with("ok"));

        Ok(())
    }

    #[test]
    fn test_vertex_cavity() -> Result<()> {
        let mut mesh = test_mesh_2d()?;
        mesh.split_all_edges()?;
        let mut cavity = Cavity::new();
        // vertex on the boundary y = 0
        let i = mesh
            .vert_ids()
            .find(|&i| (mesh.verts[i].vx - Point::<2>::new(0.5, 0.0)).norm() < 1e-12)
            .unwrap();
        cavity.init_from_vertex(&mesh, i);
        assert_eq!(cavity.tagged_faces.len(), 2);
        assert_eq!(cavity.tagged_bdys.len(), 2);

        // moving along the boundary conserves the measures
        let m = mesh.verts[i].m;
        let i_local = cavity.get_local_index(i).unwrap();
        let filled = FilledCavity::new(
            &cavity,
            FilledCavityType::MovedVertex((i_local, Point::<2>::new(0.55, 0.0), m)),
        );
        assert!(filled.is_conservative());
        let filled = FilledCavity::new(
            &cavity,
            FilledCavityType::MovedVertex((i_local, Point::<2>::new(0.5, 0.05), m)),
        );
        assert!(!filled.is_conservative());

        Ok(())
    }

    impl Mesh2d {
        /// Split every edge of the mesh once
        fn split_all_edges(&mut self) -> Result<()> {
            let mut edges = self.edges.keys().copied().collect::<Vec<_>>();
            edges.sort_unstable();
            let mut cavity = Cavity::new();
            for edg in edges {
                cavity.init_from_edge(self, edg);
                let p = 0.5 * (self.verts[edg[0]].vx + self.verts[edg[1]].vx);
                let m = self.verts[edg[0]].m;
                let ip = self.insert_vertex(p, m, 0, self.n_vert_slots() as u64);
                let filled = FilledCavity::new(&cavity, FilledCavityType::NewVertex((p, m)));
                self.apply_filled_cavity(&filled, ip)?;
            }
            self.verify()
        }
    }
}
