use super::{
    GElem, Point,
    arena::Arena,
    topo_elems::{Elem, Tetrahedron, Triangle, get_face_to_elem},
};
use crate::{
    Error, GlobalIdx, Idx, Rank, Result, Tag, max_iter, min_iter,
    metric::{AnisoMetric2d, AnisoMetric3d, Metric},
    parallel::{Communicator, SerialComm},
    stats::{MeshStats, Stats, StepStats},
};
use log::{debug, warn};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use sorted_vec::SortedVec;
use std::cmp::{Ordering, min};
use std::sync::Arc;

/// Vertex data
#[derive(Clone, Debug)]
pub struct VtxInfo<const D: usize, M: Metric<D>> {
    /// Coordinates
    pub vx: Point<D>,
    /// Metric
    pub m: M,
    /// Elements containing the vertex
    pub els: SortedVec<Idx>,
    /// Rank owning the vertex
    pub owner: Rank,
    /// Global index
    pub gid: GlobalIdx,
}

/// Element data
#[derive(Clone, Copy, Debug)]
pub struct ElemInfo<E: Elem> {
    /// Element-to-vertex connectivity
    pub el: E,
    /// Region tag
    pub tag: Tag,
    /// Quality in the current metric
    pub q: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct EdgeInfo {
    /// Number of elements containing the edge
    pub count: u16,
    /// Length in the current metric
    pub length: f64,
}

/// Simplex mesh, storing the vertex metric together with the adjacency information
/// needed to perform local modifications
///
/// Vertices and elements live in slots that are only reclaimed by `defragment`.
/// The edge map and the tagged faces are updated each time an element is inserted
/// or removed.
#[derive(Clone, Debug)]
pub struct Mesh<const D: usize, E: Elem, M: Metric<D>> {
    pub(crate) verts: Arena<VtxInfo<D, M>>,
    pub(crate) elems: Arena<ElemInfo<E>>,
    pub(crate) edges: FxHashMap<[Idx; 2], EdgeInfo>,
    /// Tagged faces (sorted) at the boundary or between different regions
    pub(crate) tagged_faces: FxHashMap<E::Face, Tag>,
    comm: Arc<dyn Communicator>,
    pub(crate) stats: Vec<StepStats>,
}

pub type Mesh2d = Mesh<2, Triangle, AnisoMetric2d>;
pub type Mesh3d = Mesh<3, Tetrahedron, AnisoMetric3d>;

/// Intersect two sorted slices
pub(crate) fn intersection(a: &[Idx], b: &[Idx]) -> Vec<Idx> {
    let mut result = Vec::with_capacity(min(a.len(), b.len()));
    let mut i = 0;
    let mut j = 0;
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Equal => {
                result.push(a[i]);
                i += 1;
                j += 1;
            }
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
        }
    }
    result
}

impl<const D: usize, E: Elem, M: Metric<D>> Mesh<D, E, M> {
    fn empty(n_verts: usize, n_elems: usize, comm: Arc<dyn Communicator>) -> Self {
        Self {
            verts: Arena::with_capacity(n_verts),
            elems: Arena::with_capacity(n_elems),
            edges: FxHashMap::default(),
            tagged_faces: FxHashMap::default(),
            comm,
            stats: Vec::new(),
        }
    }

    fn check_connectivity(e: &E, n_verts: usize) -> Result<()> {
        for (k, &i) in e.iter().enumerate() {
            if i as usize >= n_verts {
                return Err(Error::from(&format!(
                    "Invalid vertex index {i} in {e:?} ({n_verts} vertices)"
                )));
            }
            if e.iter().skip(k + 1).any(|&j| j == i) {
                return Err(Error::from(&format!("Repeated vertex in {e:?}")));
            }
        }
        Ok(())
    }

    /// Create a mesh from its vertices, elements and tagged faces
    ///
    /// - negative elements are reoriented,
    /// - the boundary faces and the faces between elements with different tags that are
    ///   not tagged get a new tag,
    /// - the metric is initialized to the metric implied by the mesh.
    pub fn new(
        coords: Vec<Point<D>>,
        elems: Vec<E>,
        etags: Vec<Tag>,
        faces: Vec<E::Face>,
        ftags: Vec<Tag>,
    ) -> Result<Self> {
        if E::DIM as usize != D {
            return Err(Error::from(&format!(
                "Unsupported element dimension {} in {D}D",
                E::DIM
            )));
        }
        if coords.is_empty() {
            return Err(Error::from("The mesh has no vertex"));
        }
        if elems.is_empty() {
            return Err(Error::from("The mesh has no element"));
        }
        if etags.len() != elems.len() {
            return Err(Error::from("Invalid number of element tags"));
        }
        if ftags.len() != faces.len() {
            return Err(Error::from("Invalid number of face tags"));
        }

        debug!(
            "Create a {D}D mesh with {} vertices / {} elements",
            coords.len(),
            elems.len()
        );

        let n_verts = coords.len();
        let mut res = Self::empty(n_verts, elems.len(), Arc::new(SerialComm));
        for (i, vx) in coords.into_iter().enumerate() {
            res.insert_vertex(vx, M::default(), 0, i as GlobalIdx);
        }

        let mut n_reoriented = 0;
        for (mut e, t) in elems.into_iter().zip(etags) {
            Self::check_connectivity(&e, n_verts)?;
            let ge = res.gelem(&e);
            let h = ge.edges().map(|x| x.norm()).fold(0.0, f64::max);
            let vol = ge.vol();
            if vol.abs() <= 1e-12 * h.powi(E::DIM as i32) {
                return Err(Error::from(&format!("Zero volume element {e:?}")));
            }
            if vol < 0.0 {
                let tmp = e[0];
                e[0] = e[1];
                e[1] = tmp;
                n_reoriented += 1;
            }
            res.insert_elem(e, t)?;
        }
        if n_reoriented > 0 {
            warn!("{n_reoriented} elements have been reoriented");
        }

        for (f, t) in faces.into_iter().zip(ftags) {
            if f.iter().any(|&i| i as usize >= n_verts) {
                return Err(Error::from(&format!("Invalid face {f:?}")));
            }
            res.add_tagged_face(f, t)?;
        }

        if let Some((i, _)) = res.verts.iter().find(|(_, v)| v.els.is_empty()) {
            return Err(Error::from(&format!("Vertex {i} does not belong to any element")));
        }

        res.tag_faces()?;
        let m = res.implied_metric();
        res.set_metrics(&m)?;

        res.print_stats();
        res.stats.push(StepStats::Init(MeshStats::new(&res)));

        Ok(res)
    }

    /// Create a mesh from flat arrays (coordinates stored vertex by vertex)
    pub fn from_slices(
        coords: &[f64],
        elems: &[Idx],
        etags: &[Tag],
        faces: &[Idx],
        ftags: &[Tag],
    ) -> Result<Self> {
        let nv = E::N_VERTS as usize;
        let nf = <E::Face as Elem>::N_VERTS as usize;
        if coords.len() % D != 0 || elems.len() % nv != 0 || faces.len() % nf != 0 {
            return Err(Error::from("Invalid array sizes"));
        }
        let coords = coords
            .chunks(D)
            .map(Point::<D>::from_column_slice)
            .collect();
        let elems = elems.chunks(nv).map(E::from_slice).collect();
        let faces = faces.chunks(nf).map(E::Face::from_slice).collect();
        Self::new(coords, elems, etags.to_vec(), faces, ftags.to_vec())
    }

    /// Create a rank-local mesh. No face is tagged automatically, as the faces at the
    /// partition boundaries are not boundary faces
    pub(crate) fn from_parts(
        verts: Vec<(Point<D>, M, Rank, GlobalIdx)>,
        elems: Vec<(E, Tag)>,
        faces: Vec<(E::Face, Tag)>,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let mut res = Self::empty(verts.len(), elems.len(), comm);
        for (vx, m, owner, gid) in verts {
            res.insert_vertex(vx, m, owner, gid);
        }
        for (e, t) in elems {
            res.insert_elem(e, t)?;
        }
        for (f, t) in faces {
            res.add_tagged_face(f, t)?;
        }
        res.stats.push(StepStats::Init(MeshStats::new(&res)));
        Ok(res)
    }

    /// Tag the untagged boundary faces and the untagged faces between elements
    /// with different tags
    fn tag_faces(&mut self) -> Result<()> {
        let f2e = get_face_to_elem(self.elems.iter().map(|(i, e)| (i, e.el)));

        let mut bdy = Vec::new();
        let mut ifc = Vec::new();
        for (f, els) in &f2e {
            match els.len() {
                1 => {
                    if !self.tagged_faces.contains_key(f) {
                        bdy.push(*f);
                    }
                }
                2 => {
                    let t0 = self.elems[els[0].0].tag;
                    let t1 = self.elems[els[1].0].tag;
                    if t0 != t1 && !self.tagged_faces.contains_key(f) {
                        ifc.push(*f);
                    }
                }
                n => {
                    return Err(Error::from(&format!(
                        "Face {f:?} belongs to {n} elements"
                    )));
                }
            }
        }

        if let Some(f) = self.tagged_faces.keys().find(|f| !f2e.contains_key(f)) {
            return Err(Error::from(&format!(
                "Tagged face {f:?} is not a face of the mesh"
            )));
        }

        let mut next_tag = self.tagged_faces.values().copied().max().unwrap_or(0) + 1;
        if !bdy.is_empty() {
            warn!(
                "{} untagged boundary faces, using tag {next_tag}",
                bdy.len()
            );
            for f in bdy {
                self.add_tagged_face(f, next_tag)?;
            }
            next_tag += 1;
        }
        if !ifc.is_empty() {
            warn!(
                "{} untagged faces between different regions, using tag {next_tag}",
                ifc.len()
            );
            for f in ifc {
                self.add_tagged_face(f, next_tag)?;
            }
        }

        Ok(())
    }

    /// Get the communicator
    #[must_use]
    pub fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    /// Rank of the current partition
    #[must_use]
    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    /// Number of live vertices
    #[must_use]
    pub fn n_verts(&self) -> usize {
        self.verts.len()
    }

    /// Number of vertex slots (live or removed)
    #[must_use]
    pub fn n_vert_slots(&self) -> usize {
        self.verts.n_slots()
    }

    /// Number of live elements
    #[must_use]
    pub fn n_elems(&self) -> usize {
        self.elems.len()
    }

    #[must_use]
    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn n_tagged_faces(&self) -> usize {
        self.tagged_faces.len()
    }

    /// Get the coordinates of vertex `i`
    #[must_use]
    pub fn get_coords(&self, i: Idx) -> Option<Point<D>> {
        self.verts.get(i).map(|v| v.vx)
    }

    /// Get the connectivity and tag of element `i`
    #[must_use]
    pub fn get_element(&self, i: Idx) -> Option<(E, Tag)> {
        self.elems.get(i).map(|e| (e.el, e.tag))
    }

    /// Get the metric at vertex `i`
    #[must_use]
    pub fn get_metric(&self, i: Idx) -> Option<M> {
        self.verts.get(i).map(|v| v.m)
    }

    /// Get the vertex data
    #[must_use]
    pub fn vertex(&self, i: Idx) -> Option<&VtxInfo<D, M>> {
        self.verts.get(i)
    }

    /// Iterate over the live vertex indices
    pub fn vert_ids(&self) -> impl Iterator<Item = Idx> + '_ {
        self.verts.keys()
    }

    /// Iterate over the live vertex coordinates
    pub fn verts(&self) -> impl Iterator<Item = Point<D>> + '_ {
        self.verts.iter().map(|(_, v)| v.vx)
    }

    /// Iterate over the live element indices
    pub fn elem_ids(&self) -> impl Iterator<Item = Idx> + '_ {
        self.elems.keys()
    }

    /// Iterate over the live elements
    pub fn elems(&self) -> impl Iterator<Item = E> + '_ {
        self.elems.iter().map(|(_, e)| e.el)
    }

    /// Iterate over the live element tags
    pub fn etags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.elems.iter().map(|(_, e)| e.tag)
    }

    /// Iterate over the tagged faces
    pub fn faces(&self) -> impl Iterator<Item = (E::Face, Tag)> + '_ {
        self.tagged_faces.iter().map(|(f, t)| (*f, *t))
    }

    /// Metric at every vertex slot (the default metric is used for removed slots)
    #[must_use]
    pub fn metrics(&self) -> Vec<M> {
        let mut res = vec![M::default(); self.verts.n_slots()];
        for (i, v) in self.verts.iter() {
            res[i as usize] = v.m;
        }
        res
    }

    /// Elements containing vertex `i`
    #[must_use]
    pub fn vertex_elements(&self, i: Idx) -> &[Idx] {
        &self.verts[i].els
    }

    /// Elements containing an edge
    #[must_use]
    pub fn edge_elements(&self, edg: [Idx; 2]) -> Vec<Idx> {
        intersection(self.vertex_elements(edg[0]), self.vertex_elements(edg[1]))
    }

    /// Elements containing a face
    #[must_use]
    pub fn face_elements(&self, f: &E::Face) -> Vec<Idx> {
        let mut iter = f.iter();
        let Some(&i0) = iter.next() else {
            return Vec::new();
        };
        let mut res = self.vertex_elements(i0).to_vec();
        for &i in iter {
            res = intersection(&res, self.vertex_elements(i));
        }
        res
    }

    /// Vertices sharing an element with vertex `i`
    #[must_use]
    pub fn neighbors(&self, i: Idx) -> Vec<Idx> {
        let mut res = self
            .vertex_elements(i)
            .iter()
            .flat_map(|&k| self.elems[k].el)
            .filter(|&j| j != i)
            .collect::<Vec<_>>();
        res.sort_unstable();
        res.dedup();
        res
    }

    /// Tags of the tagged faces containing vertex `i`
    #[must_use]
    pub fn vertex_tags(&self, i: Idx) -> Vec<Tag> {
        let mut res = self
            .vertex_elements(i)
            .iter()
            .flat_map(|&k| {
                let e = self.elems[k].el;
                (0..E::N_FACES).map(move |i_face| e.face(i_face))
            })
            .filter(|f| f.contains_vertex(i))
            .filter_map(|f| self.face_tag(&f))
            .collect::<Vec<_>>();
        res.sort_unstable();
        res.dedup();
        res
    }

    /// Check if vertex `i` is owned by the current rank
    #[must_use]
    pub fn is_owned(&self, i: Idx) -> bool {
        self.verts[i].owner == self.comm.rank()
    }

    /// Check if all the vertices of a set of elements are owned by the current rank,
    /// i.e. if the elements are not present on any other rank
    #[must_use]
    pub fn is_private(&self, elems: &[Idx]) -> bool {
        elems
            .iter()
            .all(|&k| self.elems[k].el.iter().all(|&i| self.is_owned(i)))
    }

    /// Rank owning an element or a face, i.e. owning its vertex with the lowest global
    /// index
    #[must_use]
    pub fn elem_owner<F: Elem>(&self, e: &F) -> Rank {
        e.iter()
            .map(|&i| &self.verts[i])
            .min_by_key(|v| v.gid)
            .map_or(0, |v| v.owner)
    }

    /// Get the geometrical element
    #[must_use]
    pub fn gelem(&self, e: &E) -> E::Geom<D> {
        <E::Geom<D> as GElem<D>>::from_verts(e.iter().map(|&i| self.verts[i].vx))
    }

    /// Get the measure of a face
    #[must_use]
    pub fn face_measure(&self, f: &E::Face) -> f64 {
        <<E::Face as Elem>::Geom<D> as GElem<D>>::from_verts(f.iter().map(|&i| self.verts[i].vx))
            .vol()
    }

    /// Quality of an element in the current metric
    #[must_use]
    pub fn elem_quality(&self, e: &E) -> f64 {
        M::quality(&self.gelem(e), e.iter().map(|&i| self.verts[i].m))
    }

    /// Compute the length of an edge in the current metric. The vertices are taken
    /// by increasing global index so that the result does not depend on the rank
    #[must_use]
    pub fn compute_edge_length(&self, edg: [Idx; 2]) -> f64 {
        let mut v0 = &self.verts[edg[0]];
        let mut v1 = &self.verts[edg[1]];
        if v1.gid < v0.gid {
            std::mem::swap(&mut v0, &mut v1);
        }
        M::edge_length(&v0.vx, &v0.m, &v1.vx, &v1.m)
    }

    /// Cached length of an edge
    #[must_use]
    pub fn edge_length(&self, edg: [Idx; 2]) -> Option<f64> {
        let mut edg = edg;
        edg.sort_unstable();
        self.edges.get(&edg).map(|e| e.length)
    }

    /// Insert a new vertex, and get its index
    pub fn insert_vertex(&mut self, vx: Point<D>, m: M, owner: Rank, gid: GlobalIdx) -> Idx {
        self.verts.insert(VtxInfo {
            vx,
            m,
            els: SortedVec::default(),
            owner,
            gid,
        })
    }

    /// Remove a vertex that is not used by any element
    pub fn remove_vertex(&mut self, i: Idx) -> Result<()> {
        let Some(v) = self.verts.get(i) else {
            return Err(Error::from("Vertex not present"));
        };
        if !v.els.is_empty() {
            return Err(Error::from("Vertex used"));
        }
        self.verts.remove(i);
        Ok(())
    }

    /// Insert a new element; it must have a positive volume
    pub fn insert_elem(&mut self, el: E, tag: Tag) -> Result<Idx> {
        if el.iter().any(|&i| !self.verts.contains(i)) {
            return Err(Error::from(&format!("Element vertex not present: {el:?}")));
        }
        let vol = self.gelem(&el).vol();
        if vol <= 0.0 {
            return Err(Error::from(&format!(
                "Invalid element {el:?}: volume = {vol:.2e}"
            )));
        }
        let q = self.elem_quality(&el);
        let i_elem = self.elems.insert(ElemInfo { el, tag, q });

        for &i in el.iter() {
            self.verts[i].els.push(i_elem);
        }

        for i_edge in 0..E::N_EDGES {
            let edg = el.sorted_edge(i_edge);
            if let Some(e) = self.edges.get_mut(&edg) {
                e.count += 1;
            } else {
                let length = self.compute_edge_length(edg);
                self.edges.insert(edg, EdgeInfo { count: 1, length });
            }
        }
        Ok(i_elem)
    }

    /// Remove an element
    pub fn remove_elem(&mut self, i_elem: Idx) -> Result<()> {
        let Some(e) = self.elems.get(i_elem) else {
            return Err(Error::from("Element not present"));
        };
        let el = e.el;

        for &i in el.iter() {
            self.verts[i].els.remove_item(&i_elem);
        }

        for i_edge in 0..E::N_EDGES {
            let edg = el.sorted_edge(i_edge);
            let Some(e) = self.edges.get_mut(&edg) else {
                return Err(Error::from(&format!("Missing edge {edg:?}")));
            };
            if e.count == 1 {
                self.edges.remove(&edg);
            } else {
                e.count -= 1;
            }
        }
        self.elems.remove(i_elem);
        Ok(())
    }

    /// Get the tag of a face
    #[must_use]
    pub fn face_tag(&self, f: &E::Face) -> Option<Tag> {
        self.tagged_faces.get(&f.sorted()).copied()
    }

    pub fn add_tagged_face(&mut self, f: E::Face, tag: Tag) -> Result<()> {
        let f = f.sorted();
        if self.tagged_faces.contains_key(&f) {
            return Err(Error::from(&format!("Tagged face {f:?} already present")));
        }
        if f.iter().any(|&i| !self.verts.contains(i)) {
            return Err(Error::from("At least a vertex is not in the mesh"));
        }
        self.tagged_faces.insert(f, tag);
        Ok(())
    }

    pub fn remove_tagged_face(&mut self, f: E::Face) -> Result<()> {
        if self.tagged_faces.remove(&f.sorted()).is_none() {
            return Err(Error::from(&format!("Tagged face {f:?} not present")));
        }
        Ok(())
    }

    /// Move a vertex and update its metric, the quality of its elements and the
    /// length of its edges
    pub fn move_vertex(&mut self, i: Idx, vx: Point<D>, m: M) {
        {
            let v = &mut self.verts[i];
            v.vx = vx;
            v.m = m;
        }
        let els = self.verts[i].els.to_vec();
        for k in els {
            let q = self.elem_quality(&self.elems[k].el);
            self.elems[k].q = q;
        }
        for j in self.neighbors(i) {
            let mut edg = [i, j];
            edg.sort_unstable();
            let l = self.compute_edge_length(edg);
            if let Some(e) = self.edges.get_mut(&edg) {
                e.length = l;
            }
        }
    }

    /// Set the metric at every vertex slot and update the edge lengths and qualities
    pub fn set_metrics(&mut self, metrics: &[M]) -> Result<()> {
        if metrics.len() != self.verts.n_slots() {
            return Err(Error::from(&format!(
                "Invalid metric size: {} vs. {} vertices",
                metrics.len(),
                self.verts.n_slots()
            )));
        }
        for (i, v) in self.verts.iter_mut() {
            v.m = metrics[i as usize];
        }
        self.update_lengths_and_qualities();
        Ok(())
    }

    /// Recompute the cached edge lengths and element qualities
    pub fn update_lengths_and_qualities(&mut self) {
        let edges = self.edges.keys().copied().collect::<Vec<_>>();
        let lengths = edges
            .par_iter()
            .map(|&edg| self.compute_edge_length(edg))
            .collect::<Vec<_>>();
        for (edg, l) in edges.iter().zip(lengths) {
            if let Some(e) = self.edges.get_mut(edg) {
                e.length = l;
            }
        }

        let elems = self.elems.iter().map(|(i, e)| (i, e.el)).collect::<Vec<_>>();
        let qualities = elems
            .par_iter()
            .map(|(_, e)| self.elem_quality(e))
            .collect::<Vec<_>>();
        for ((i, _), q) in elems.iter().zip(qualities) {
            self.elems[*i].q = q;
        }
    }

    /// Compute the metric implied by the mesh at every vertex slot, as the average
    /// (in the log-Euclidean sense) of the implied metrics of the adjacent elements
    #[must_use]
    pub fn implied_metric(&self) -> Vec<M> {
        let mut elem_metrics = vec![None; self.elems.n_slots()];
        let elems = self.elems.iter().map(|(i, e)| (i, e.el)).collect::<Vec<_>>();
        let ms = elems
            .par_iter()
            .map(|(_, e)| {
                self.gelem(e)
                    .implied_metric_mat()
                    .map(|mat| M::from_sym_mat(&mat))
            })
            .collect::<Vec<_>>();
        for ((i, _), m) in elems.iter().zip(ms) {
            elem_metrics[*i as usize] = m;
        }

        let verts = self.verts.iter().map(|(i, v)| (i, &v.els)).collect::<Vec<_>>();
        let ms = verts
            .par_iter()
            .map(|(_, els)| {
                let metrics = els
                    .iter()
                    .filter_map(|&k| elem_metrics[k as usize].as_ref())
                    .collect::<Vec<_>>();
                if metrics.is_empty() {
                    M::default()
                } else {
                    let w = 1.0 / metrics.len() as f64;
                    M::interpolate(metrics.into_iter().map(|m| (w, m)))
                }
            })
            .collect::<Vec<_>>();

        let mut res = vec![M::default(); self.verts.n_slots()];
        for ((i, _), m) in verts.iter().zip(ms) {
            res[*i as usize] = m;
        }
        res
    }

    /// Iterate over the edges and their cached lengths
    pub fn lengths_iter(&self) -> impl Iterator<Item = ([Idx; 2], f64)> + '_ {
        self.edges.iter().map(|(k, e)| (*k, e.length))
    }

    /// Iterate over the element qualities
    pub fn qualities_iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.elems.iter().map(|(_, e)| e.q)
    }

    /// Maximum edge length in the current metric, over all the ranks
    #[must_use]
    pub fn maximal_edge_length(&self) -> f64 {
        let l = max_iter(self.edges.values().map(|e| e.length));
        self.comm.all_reduce_max(l)
    }

    /// Mean element quality
    #[must_use]
    pub fn qmean(&self) -> f64 {
        self.qualities_iter().sum::<f64>() / self.n_elems() as f64
    }

    /// Minimum element quality
    #[must_use]
    pub fn qmin(&self) -> f64 {
        min_iter(self.qualities_iter())
    }

    #[must_use]
    pub fn edge_length_stats(&self) -> Stats {
        Stats::new(
            self.lengths_iter().map(|(_, l)| l),
            &[f64::sqrt(0.5), f64::sqrt(2.0)],
        )
    }

    #[must_use]
    pub fn quality_stats(&self) -> Stats {
        Stats::new(self.qualities_iter(), &[0.4, 0.6, 0.8])
    }

    /// Print length and quality stats on the mesh / metric
    pub fn print_stats(&self) {
        debug!("Length: {}", self.edge_length_stats());
        debug!("Qualities: {}", self.quality_stats());
    }

    /// Record of the operator passes since the mesh creation
    #[must_use]
    pub fn stats(&self) -> &[StepStats] {
        &self.stats
    }

    /// Return the stats at each remeshing step as a json string
    pub fn stats_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.stats)?)
    }

    /// Sum of the measures of the tagged faces adjacent to region `a` and region `b`
    /// (`None` meaning any region). Each face is counted once, so that the interface
    /// between two regions is only measured once
    #[must_use]
    pub fn facet_measure(&self, a: Option<Tag>, b: Option<Tag>) -> f64 {
        let rank = self.comm.rank();
        let mut res = 0.0;
        for f in self.tagged_faces.keys() {
            let els = self.face_elements(f);
            if els.is_empty() {
                continue;
            }
            let owner = f
                .iter()
                .map(|&i| &self.verts[i])
                .min_by_key(|v| v.gid)
                .map_or(0, |v| v.owner);
            if owner != rank {
                continue;
            }
            let regions = els.iter().map(|&k| self.elems[k].tag).collect::<Vec<_>>();
            let ok = match (a, b) {
                (None, None) => true,
                (Some(t), None) | (None, Some(t)) => regions.contains(&t),
                (Some(t0), Some(t1)) => regions.contains(&t0) && regions.contains(&t1),
            };
            if ok {
                res += self.face_measure(f);
            }
        }
        self.comm.all_reduce_sum_f64(res)
    }

    /// Sum of the volumes of the elements in region `a` (`None` meaning any region)
    #[must_use]
    pub fn element_measure(&self, a: Option<Tag>) -> f64 {
        let rank = self.comm.rank();
        let res = self
            .elems
            .iter()
            .filter(|(_, e)| a.is_none_or(|t| t == e.tag))
            .filter(|(_, e)| self.elem_owner(&e.el) == rank)
            .map(|(_, e)| self.gelem(&e.el).vol())
            .sum::<f64>();
        self.comm.all_reduce_sum_f64(res)
    }

    /// Number of elements over all the ranks
    #[must_use]
    pub fn n_global_elems(&self) -> u64 {
        let rank = self.comm.rank();
        let n = self
            .elems
            .iter()
            .filter(|(_, e)| self.elem_owner(&e.el) == rank)
            .count();
        self.comm.all_reduce_sum(n as u64)
    }

    /// Compact the vertex and element storage. Returns the old to new vertex and
    /// element index maps (`None` for removed slots)
    pub fn defragment(&mut self) -> (Vec<Option<Idx>>, Vec<Option<Idx>>) {
        debug!(
            "Defragment: {} / {} vertex slots, {} / {} element slots used",
            self.verts.len(),
            self.verts.n_slots(),
            self.elems.len(),
            self.elems.n_slots()
        );
        let vmap = self.verts.compact();
        let emap = self.elems.compact();
        let new_vert = |i: Idx| vmap[i as usize].unwrap_or(Idx::MAX);

        for (_, e) in self.elems.iter_mut() {
            for k in 0..(E::N_VERTS as usize) {
                e.el[k] = new_vert(e.el[k]);
            }
        }
        for (_, v) in self.verts.iter_mut() {
            let els = v
                .els
                .iter()
                .filter_map(|&k| emap[k as usize])
                .collect::<Vec<_>>();
            v.els = SortedVec::from_unsorted(els);
        }

        self.edges = std::mem::take(&mut self.edges)
            .into_iter()
            .map(|([i, j], e)| {
                let mut edg = [new_vert(i), new_vert(j)];
                edg.sort_unstable();
                (edg, e)
            })
            .collect();
        self.tagged_faces = std::mem::take(&mut self.tagged_faces)
            .into_iter()
            .map(|(f, t)| (E::Face::from_iter(f.iter().map(|&i| new_vert(i))).sorted(), t))
            .collect();

        (vmap, emap)
    }

    /// Compact the vertex and element storage, when the old indices are not needed
    pub fn compact(&mut self) {
        self.defragment();
    }

    /// Get the number of vertices owned by each rank, and a contiguous global numbering of
    /// the local vertices (in slot order). Owned vertices are numbered by increasing
    /// global index, rank after rank
    #[must_use]
    pub fn get_global_node_numbering(&self) -> (Vec<usize>, Vec<GlobalIdx>) {
        let rank = self.comm.rank();
        let mut owned = self
            .verts
            .iter()
            .filter(|(_, v)| v.owner == rank)
            .map(|(_, v)| v.gid)
            .collect::<Vec<_>>();
        owned.sort_unstable();

        let counts = self
            .comm
            .all_gather_u64(&[owned.len() as u64])
            .iter()
            .map(|x| x[0] as usize)
            .collect::<Vec<_>>();
        let offset = counts[..rank].iter().sum::<usize>() as GlobalIdx;

        let pairs = owned
            .iter()
            .enumerate()
            .flat_map(|(k, &gid)| [gid, offset + k as GlobalIdx])
            .collect::<Vec<_>>();
        let numbering: FxHashMap<GlobalIdx, GlobalIdx> = self
            .comm
            .all_gather_u64(&pairs)
            .iter()
            .flat_map(|x| x.chunks(2).map(|p| (p[0], p[1])).collect::<Vec<_>>())
            .collect();

        let lnn2gnn = self
            .verts
            .iter()
            .map(|(_, v)| numbering.get(&v.gid).copied().unwrap_or(GlobalIdx::MAX))
            .collect();

        (counts, lnn2gnn)
    }

    fn check_elem(&self, i_elem: Idx, e: &ElemInfo<E>) -> Result<()> {
        for &i in e.el.iter() {
            let Some(v) = self.verts.get(i) else {
                return Err(Error::from(&format!(
                    "Element {i_elem}: vertex {i} not found"
                )));
            };
            if !v.els.contains(&i_elem) {
                return Err(Error::from(&format!(
                    "Invalid vertex to element (element {i_elem} missing for vertex {i})"
                )));
            }
        }
        let vol = self.gelem(&e.el).vol();
        if vol <= 0.0 {
            return Err(Error::from(&format!(
                "Element {i_elem} {:?}: negative volume {vol:.2e}",
                e.el
            )));
        }
        for i_edge in 0..E::N_EDGES {
            let edg = e.el.sorted_edge(i_edge);
            if !self.edges.contains_key(&edg) {
                return Err(Error::from(&format!("Missing edge {edg:?}")));
            }
        }
        Ok(())
    }

    fn check_faces(&self) -> Result<()> {
        let serial = self.comm.size() == 1;
        let f2e = get_face_to_elem(self.elems.iter().map(|(i, e)| (i, e.el)));
        for (f, els) in &f2e {
            let ftag = self.tagged_faces.get(f);
            match els.len() {
                1 => {
                    if serial && ftag.is_none() {
                        return Err(Error::from(&format!(
                            "Boundary face {f:?} is not tagged"
                        )));
                    }
                }
                2 => {
                    let t0 = self.elems[els[0].0].tag;
                    let t1 = self.elems[els[1].0].tag;
                    if t0 != t1 && ftag.is_none() {
                        return Err(Error::from(&format!(
                            "Face {f:?} between regions {t0} and {t1} is not tagged"
                        )));
                    }
                }
                n => {
                    return Err(Error::from(&format!(
                        "Face {f:?} belongs to {n} elements"
                    )));
                }
            }
        }
        for (f, t) in &self.tagged_faces {
            if !f2e.contains_key(f) {
                return Err(Error::from(&format!(
                    "Tagged face {f:?} (tag {t}) is not a face of the mesh"
                )));
            }
        }
        Ok(())
    }

    /// Check that the mesh is valid
    ///  - elements are positive and their vertices exist,
    ///  - vertex-to-element and element-to-vertex information are consistent,
    ///  - the edge map counts the elements around each edge,
    ///  - boundary faces and faces between regions are tagged, and tagged faces exist,
    ///  - metrics are valid and the global indices are unique,
    ///  - in parallel, every element contains an owned vertex
    pub fn verify(&self) -> Result<()> {
        debug!("Check the consistency of the mesh");

        let serial = self.comm.size() == 1;
        let mut counts: FxHashMap<[Idx; 2], u16> = FxHashMap::default();
        for (i_elem, e) in self.elems.iter() {
            self.check_elem(i_elem, e)?;
            if !serial && !e.el.iter().any(|&i| self.is_owned(i)) {
                return Err(Error::from(&format!(
                    "Element {i_elem} has no owned vertex"
                )));
            }
            for i_edge in 0..E::N_EDGES {
                *counts.entry(e.el.sorted_edge(i_edge)).or_default() += 1;
            }
        }

        if counts.len() != self.edges.len() {
            return Err(Error::from(&format!(
                "Invalid number of edges: {} vs. {}",
                self.edges.len(),
                counts.len()
            )));
        }
        for (edg, e) in &self.edges {
            if counts.get(edg).copied() != Some(e.count) {
                return Err(Error::from(&format!("Invalid element count for edge {edg:?}")));
            }
        }

        let mut gids = FxHashSet::default();
        for (i, v) in self.verts.iter() {
            if v.els.is_empty() {
                return Err(Error::from(&format!("Vertex {i} is not used")));
            }
            for &k in v.els.iter() {
                let Some(e) = self.elems.get(k) else {
                    return Err(Error::from(&format!(
                        "Invalid vertex to element (element {k} missing)"
                    )));
                };
                if !e.el.contains_vertex(i) {
                    return Err(Error::from(&format!(
                        "Element {k} does not contain vertex {i}"
                    )));
                }
            }
            v.m.check()?;
            if !gids.insert(v.gid) {
                return Err(Error::from(&format!("Duplicated global index {}", v.gid)));
            }
        }

        self.check_faces()?;

        Ok(())
    }
}

impl<M: Metric<2>> Mesh<2, Triangle, M> {
    /// Length of the tagged boundary between regions `a` and `b`
    #[must_use]
    pub fn calculate_perimeter(&self, a: Option<Tag>, b: Option<Tag>) -> f64 {
        self.facet_measure(a, b)
    }

    /// Area of region `a`
    #[must_use]
    pub fn calculate_area(&self, a: Option<Tag>) -> f64 {
        self.element_measure(a)
    }
}

impl<M: Metric<3>> Mesh<3, Tetrahedron, M> {
    /// Area of the tagged boundary between regions `a` and `b`
    #[must_use]
    pub fn calculate_area(&self, a: Option<Tag>, b: Option<Tag>) -> f64 {
        self.facet_measure(a, b)
    }

    /// Volume of region `a`
    #[must_use]
    pub fn calculate_volume(&self, a: Option<Tag>) -> f64 {
        self.element_measure(a)
    }
}
