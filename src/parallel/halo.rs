//! Edits of the elements shared by several ranks
//!
//! An edit replaces a set of elements (and tagged faces) by another one built on the
//! same vertices. It is described with global vertex indices so that every rank
//! holding part of it can apply it. All the ranks receive all the proposed edits,
//! reject the ones that would break the conformity of their part of the mesh and
//! accept the same set of non-overlapping edits.
use super::prune_halo;
use crate::{
    Error, GlobalIdx, Idx, Rank, Result, Tag,
    mesh::{Elem, Mesh, Point},
    metric::Metric,
};
use log::{debug, trace};
use rustc_hash::{FxHashMap, FxHashSet};

/// Vertex involved in an edit, with its data after the edit
#[derive(Clone, Copy, Debug)]
pub(crate) struct EditVertex<const D: usize, M: Metric<D>> {
    pub gid: GlobalIdx,
    pub owner: Rank,
    pub vx: Point<D>,
    pub m: M,
}

/// Elements and faces refer to positions in `verts`
#[derive(Clone, Debug)]
pub(crate) struct HaloEdit<const D: usize, E: Elem, M: Metric<D>> {
    /// Edits are accepted by increasing key
    pub key: GlobalIdx,
    pub verts: Vec<EditVertex<D, M>>,
    pub old_elems: Vec<E>,
    pub new_elems: Vec<(E, Tag)>,
    pub old_faces: Vec<E::Face>,
    pub new_faces: Vec<(E::Face, Tag)>,
}

fn encode_tag(t: Tag) -> u64 {
    i64::from(t) as u64
}

fn same_bits(a: &[f64], b: &[f64]) -> bool {
    a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}

/// Sequential reader of gathered data
struct Reader<'a> {
    data: &'a [u64],
}

impl Reader<'_> {
    fn next(&mut self) -> Result<u64> {
        let Some((&x, rest)) = self.data.split_first() else {
            return Err(Error::from("Truncated halo data"));
        };
        self.data = rest;
        Ok(x)
    }

    fn count(&mut self) -> Result<usize> {
        Ok(self.next()? as usize)
    }

    fn float(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.next()?))
    }

    fn tag(&mut self) -> Result<Tag> {
        let x = self.next()? as i64;
        let Ok(t) = Tag::try_from(x) else {
            return Err(Error::from(&format!("Invalid tag {x}")));
        };
        Ok(t)
    }

    /// Element whose vertices are positions in a list of `n_verts` vertices
    fn elem<F: Elem>(&mut self, n_verts: usize) -> Result<F> {
        let mut ids = Vec::with_capacity(F::N_VERTS as usize);
        for _ in 0..F::N_VERTS {
            let i = self.count()?;
            if i >= n_verts {
                return Err(Error::from(&format!("Invalid halo edit vertex {i}")));
            }
            ids.push(i as Idx);
        }
        Ok(F::from_slice(&ids))
    }
}

impl<const D: usize, E: Elem, M: Metric<D>> HaloEdit<D, E, M> {
    fn encode(&self, buf: &mut Vec<u64>) {
        buf.extend([
            self.key,
            self.verts.len() as u64,
            self.old_elems.len() as u64,
            self.new_elems.len() as u64,
            self.old_faces.len() as u64,
            self.new_faces.len() as u64,
        ]);
        for v in &self.verts {
            buf.push(v.gid);
            buf.push(v.owner as u64);
            buf.extend(v.vx.iter().map(|x| x.to_bits()));
            buf.extend(v.m.as_slice().iter().map(|x| x.to_bits()));
            buf.push(v.m.vol().to_bits());
        }
        for e in &self.old_elems {
            buf.extend(e.iter().map(|&i| u64::from(i)));
        }
        for (e, t) in &self.new_elems {
            buf.extend(e.iter().map(|&i| u64::from(i)));
            buf.push(encode_tag(*t));
        }
        for f in &self.old_faces {
            buf.extend(f.iter().map(|&i| u64::from(i)));
        }
        for (f, t) in &self.new_faces {
            buf.extend(f.iter().map(|&i| u64::from(i)));
            buf.push(encode_tag(*t));
        }
    }

    fn decode(reader: &mut Reader) -> Result<Self> {
        let key = reader.next()?;
        let n_verts = reader.count()?;
        let n_old_elems = reader.count()?;
        let n_new_elems = reader.count()?;
        let n_old_faces = reader.count()?;
        let n_new_faces = reader.count()?;

        let mut verts = Vec::with_capacity(n_verts);
        let mut m = vec![0.0; M::N];
        for _ in 0..n_verts {
            let gid = reader.next()?;
            let owner = reader.count()?;
            let mut vx = Point::<D>::zeros();
            for x in vx.iter_mut() {
                *x = reader.float()?;
            }
            for x in &mut m {
                *x = reader.float()?;
            }
            let vol = reader.float()?;
            verts.push(EditVertex {
                gid,
                owner,
                vx,
                m: M::from_raw(&m, vol),
            });
        }

        let mut res = Self {
            key,
            verts,
            old_elems: Vec::with_capacity(n_old_elems),
            new_elems: Vec::with_capacity(n_new_elems),
            old_faces: Vec::with_capacity(n_old_faces),
            new_faces: Vec::with_capacity(n_new_faces),
        };
        for _ in 0..n_old_elems {
            res.old_elems.push(reader.elem(n_verts)?);
        }
        for _ in 0..n_new_elems {
            let e = reader.elem(n_verts)?;
            res.new_elems.push((e, reader.tag()?));
        }
        for _ in 0..n_old_faces {
            res.old_faces.push(reader.elem(n_verts)?);
        }
        for _ in 0..n_new_faces {
            let f = reader.elem(n_verts)?;
            res.new_faces.push((f, reader.tag()?));
        }
        Ok(res)
    }

    /// Local version of an element or a face of the edit, if all its vertices are
    /// present
    fn local_elem<F: Elem>(&self, e: &F, gids: &FxHashMap<GlobalIdx, Idx>) -> Option<F> {
        let ids = e
            .iter()
            .map(|&i| gids.get(&self.verts[i as usize].gid).copied())
            .collect::<Option<Vec<_>>>()?;
        Some(F::from_slice(&ids))
    }

    /// Local indices of the elements removed by the edit that are present
    fn local_old_elems(&self, mesh: &Mesh<D, E, M>, gids: &FxHashMap<GlobalIdx, Idx>) -> Vec<Idx> {
        self.old_elems
            .iter()
            .filter_map(|e| self.local_elem(e, gids))
            .filter_map(|e| find_elem(mesh, &e))
            .collect()
    }

    /// Check, with the local part of the mesh, that no face would be shared by more
    /// than two elements and that no new tagged face already exists
    fn is_conforming(&self, mesh: &Mesh<D, E, M>, gids: &FxHashMap<GlobalIdx, Idx>) -> bool {
        for (f, _) in &self.new_faces {
            let Some(local) = self.local_elem(f, gids) else {
                continue;
            };
            let key = f.sorted();
            if mesh.face_tag(&local).is_some()
                && !self.old_faces.iter().any(|g| g.sorted() == key)
            {
                trace!("Edit {}: tagged face already present", self.key);
                return false;
            }
        }

        let old = self.local_old_elems(mesh, gids);
        let mut counts: FxHashMap<E::Face, usize> = FxHashMap::default();
        for (e, _) in &self.new_elems {
            for i_face in 0..E::N_FACES {
                *counts.entry(e.face(i_face).sorted()).or_default() += 1;
            }
        }
        counts.into_iter().all(|(f, n)| {
            self.local_elem(&f, gids).is_none_or(|f| {
                let n_out = mesh
                    .face_elements(&f)
                    .iter()
                    .filter(|k| !old.contains(k))
                    .count();
                let ok = n + n_out <= 2;
                if !ok {
                    trace!("Edit {}: non conforming face", self.key);
                }
                ok
            })
        })
    }

    /// Apply the part of the edit that concerns the local mesh. The new elements are
    /// only inserted if they contain an owned vertex, the missing vertices being
    /// created from the edit data
    fn apply(&self, mesh: &mut Mesh<D, E, M>, gids: &mut FxHashMap<GlobalIdx, Idx>) -> Result<()> {
        let rank = mesh.rank();

        for v in &self.verts {
            if let Some(&i) = gids.get(&v.gid) {
                let old = &mesh.verts[i];
                if !same_bits(old.vx.as_slice(), v.vx.as_slice())
                    || !same_bits(old.m.as_slice(), v.m.as_slice())
                {
                    mesh.move_vertex(i, v.vx, v.m);
                }
            }
        }

        for k in self.local_old_elems(mesh, gids) {
            mesh.remove_elem(k)?;
        }
        for f in &self.old_faces {
            let Some(f) = self.local_elem(f, gids) else {
                continue;
            };
            if mesh.face_tag(&f).is_some() {
                mesh.remove_tagged_face(f)?;
            }
        }

        for (e, t) in &self.new_elems {
            if !e.iter().any(|&j| self.verts[j as usize].owner == rank) {
                continue;
            }
            let mut ids = Vec::with_capacity(E::N_VERTS as usize);
            for &j in e.iter() {
                let v = &self.verts[j as usize];
                let i = *gids
                    .entry(v.gid)
                    .or_insert_with(|| mesh.insert_vertex(v.vx, v.m, v.owner, v.gid));
                ids.push(i);
            }
            mesh.insert_elem(E::from_slice(&ids), *t)?;
        }

        for (f, t) in &self.new_faces {
            let Some(f) = self.local_elem(f, gids) else {
                continue;
            };
            if mesh.face_tag(&f).is_none() {
                mesh.add_tagged_face(f, *t)?;
            }
        }
        Ok(())
    }
}

/// Find an element from its vertices, in any order
fn find_elem<const D: usize, E: Elem, M: Metric<D>>(mesh: &Mesh<D, E, M>, e: &E) -> Option<Idx> {
    let key = e.sorted();
    let first = *e.iter().next()?;
    mesh.vertex_elements(first)
        .iter()
        .copied()
        .find(|&k| mesh.elems[k].el.sorted() == key)
}

/// Local index of every vertex from its global index
fn local_ids<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &Mesh<D, E, M>,
) -> FxHashMap<GlobalIdx, Idx> {
    mesh.verts.iter().map(|(i, v)| (v.gid, i)).collect()
}

/// Gather the edits proposed by all the ranks, and apply on every rank the ones that
/// are accepted. An edit is rejected if any rank finds it non conforming; the other
/// ones are taken by increasing key (then by rank) and accepted if none of their
/// vertices belongs to an edit already accepted. The entities that are no longer
/// needed locally are then removed.
///
/// The accepted edits only depend on the set of proposals, not on the partition.
/// Returns their number, and the positions in `edits` of the local edits that were
/// rejected
pub(crate) fn exchange_edits<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &mut Mesh<D, E, M>,
    edits: &[HaloEdit<D, E, M>],
) -> Result<(usize, Vec<usize>)> {
    let mut buf = Vec::new();
    for edit in edits {
        edit.encode(&mut buf);
    }
    let rank = mesh.rank();
    let mut all = Vec::new();
    let mut first_local = 0;
    for (r, data) in mesh.comm().all_gather_u64(&buf).into_iter().enumerate() {
        if r == rank {
            first_local = all.len();
        }
        let mut reader = Reader { data: &data };
        while !reader.data.is_empty() {
            all.push(HaloEdit::<D, E, M>::decode(&mut reader)?);
        }
    }

    let mut gids = local_ids(mesh);
    let vetoes = all
        .iter()
        .enumerate()
        .filter(|(_, edit)| !edit.is_conforming(mesh, &gids))
        .map(|(k, _)| k as u64)
        .collect::<Vec<_>>();
    let vetoes = mesh
        .comm()
        .all_gather_u64(&vetoes)
        .into_iter()
        .flatten()
        .map(|k| k as usize)
        .collect::<FxHashSet<_>>();

    let mut order = (0..all.len())
        .filter(|k| !vetoes.contains(k))
        .collect::<Vec<_>>();
    order.sort_by_key(|&k| all[k].key);

    let mut locked = FxHashSet::default();
    let mut n_accepted = 0;
    for k in order {
        let edit = &all[k];
        if edit.verts.iter().any(|v| locked.contains(&v.gid)) {
            continue;
        }
        locked.extend(edit.verts.iter().map(|v| v.gid));
        edit.apply(mesh, &mut gids)?;
        n_accepted += 1;
    }

    prune_halo(mesh)?;
    debug!(
        "Rank {rank}: {n_accepted} / {} edits accepted, {} rejected",
        all.len(),
        vetoes.len()
    );

    let local = first_local..first_local + edits.len();
    let mut rejected = vetoes
        .into_iter()
        .filter(|k| local.contains(k))
        .map(|k| k - first_local)
        .collect::<Vec<_>>();
    rejected.sort_unstable();
    Ok((n_accepted, rejected))
}

/// Copy the metric of the owned vertices to the other ranks holding them.
/// `metric` is indexed by vertex slot
pub(crate) fn sync_halo_metrics<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &Mesh<D, E, M>,
    metric: &mut [M],
) {
    if mesh.comm().size() == 1 {
        return;
    }
    let mut shared = FxHashSet::default();
    for (_, e) in mesh.elems.iter() {
        if e.el.iter().any(|&i| !mesh.is_owned(i)) {
            shared.extend(e.el.iter().copied().filter(|&i| mesh.is_owned(i)));
        }
    }
    let mut buf = Vec::with_capacity(shared.len() * (M::N + 2));
    for i in shared {
        let m = &metric[i as usize];
        buf.push(mesh.verts[i].gid);
        buf.extend(m.as_slice().iter().map(|x| x.to_bits()));
        buf.push(m.vol().to_bits());
    }

    let gids = local_ids(mesh);
    let mut values = vec![0.0; M::N];
    for data in mesh.comm().all_gather_u64(&buf) {
        for chunk in data.chunks_exact(M::N + 2) {
            let Some(&i) = gids.get(&chunk[0]) else {
                continue;
            };
            if mesh.is_owned(i) {
                continue;
            }
            for (x, &y) in values.iter_mut().zip(&chunk[1..=M::N]) {
                *x = f64::from_bits(y);
            }
            metric[i as usize] = M::from_raw(&values, f64::from_bits(chunk[M::N + 1]));
        }
    }
}
