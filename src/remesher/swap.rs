use super::cavity::{Cavity, FilledCavity, FilledCavityType};
use crate::{
    GlobalIdx, Idx, Result,
    mesh::{Elem, Mesh},
    metric::Metric,
    parallel::{HaloEdit, exchange_edits, owning_rank_for},
    stats::{MeshStats, StepStats},
};
use log::{debug, trace, warn};

#[derive(Clone, Debug)]
pub struct SwapParams {
    /// Only the cavities with a minimum quality below `q` are modified
    pub q: f64,
    /// Max. number of sweeps
    pub max_iter: u32,
}

impl Default for SwapParams {
    fn default() -> Self {
        Self {
            q: 0.7,
            max_iter: 100,
        }
    }
}

impl<const D: usize, E: Elem, M: Metric<D>> Mesh<D, E, M> {
    /// Reconstructions of the cavity from one of its vertices not in `exclude`, by
    /// decreasing quality. The minimum quality of the new elements must be strictly
    /// larger than that of the cavity
    fn reconstructions(cavity: &Cavity<D, E, M>, exclude: &[Idx]) -> Vec<(Idx, f64)> {
        let mut candidates = (0..cavity.n_verts())
            .filter(|i| !exclude.contains(i))
            .filter_map(|i| {
                let filled = FilledCavity::new(cavity, FilledCavityType::ExistingVertex(i));
                if filled.is_same() {
                    return None;
                }
                let q = filled.min_quality();
                (q > cavity.q_min).then_some((i, q))
            })
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        candidates
    }

    /// Best valid reconstruction of a cavity private to the rank
    fn best_reconstruction(
        &self,
        cavity: &Cavity<D, E, M>,
        exclude: &[Idx],
    ) -> Option<(Idx, f64)> {
        Self::reconstructions(cavity, exclude)
            .into_iter()
            .find(|&(i, _)| {
                let filled = FilledCavity::new(cavity, FilledCavityType::ExistingVertex(i));
                filled.is_conforming(self) && filled.is_conservative()
            })
    }

    /// Best reconstruction of a cavity shared with other ranks; its conformity is
    /// checked by all of them when the edit is exchanged
    fn swap_edit(
        &self,
        cavity: &Cavity<D, E, M>,
        exclude: &[Idx],
        key: GlobalIdx,
    ) -> Option<HaloEdit<D, E, M>> {
        Self::reconstructions(cavity, exclude)
            .into_iter()
            .map(|(i, _)| FilledCavity::new(cavity, FilledCavityType::ExistingVertex(i)))
            .find(FilledCavity::is_conservative)
            .map(|filled| filled.to_halo_edit(self, key))
    }

    /// Check if a cavity can be modified by a swap
    fn is_swappable(cavity: &Cavity<D, E, M>, q: f64) -> bool {
        cavity.q_min < q && cavity.tagged_faces.is_empty() && cavity.has_single_region()
    }

    /// Replace the cavity elements by the elements built from vertex `i` (local)
    fn apply_swap(&mut self, cavity: &Cavity<D, E, M>, i: Idx) -> Result<()> {
        let filled = FilledCavity::new(cavity, FilledCavityType::ExistingVertex(i));
        self.apply_filled_cavity(&filled, cavity.local2global[i as usize])
    }

    /// Smallest global index of a set of vertices
    fn min_gid(&self, ids: &[Idx]) -> GlobalIdx {
        ids.iter()
            .map(|&i| self.verts[i].gid)
            .min()
            .unwrap_or(GlobalIdx::MAX)
    }

    /// Interior edges by increasing global indices
    fn sorted_edges(&self) -> Vec<[Idx; 2]> {
        let mut edges = self
            .edges
            .iter()
            .filter(|(_, e)| e.count > 1)
            .map(|(&edg, _)| {
                let mut key = [self.verts[edg[0]].gid, self.verts[edg[1]].gid];
                key.sort_unstable();
                (key, edg)
            })
            .collect::<Vec<_>>();
        edges.sort_unstable();
        edges.into_iter().map(|(_, edg)| edg).collect()
    }

    /// Untagged faces shared by two elements, by increasing global indices
    fn sorted_faces(&self) -> Vec<[Idx; 3]> {
        let mut faces = self
            .elems
            .iter()
            .flat_map(|(_, e)| (0..E::N_FACES).map(move |i| e.el.face(i).sorted()))
            .map(|f| {
                let mut key = f.iter().map(|&i| self.verts[i].gid).collect::<Vec<_>>();
                key.sort_unstable();
                (key, f)
            })
            .collect::<Vec<_>>();
        faces.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        faces.dedup_by(|a, b| a.0 == b.0);
        faces
            .into_iter()
            .filter(|(_, f)| self.face_tag(f).is_none() && self.face_elements(f).len() == 2)
            .map(|(_, f)| {
                let ids = f.iter().copied().collect::<Vec<_>>();
                [ids[0], ids[1], ids[2]]
            })
            .collect()
    }

    /// Edge swaps: the elements around an edge are replaced by elements built from
    /// one of the vertices of the edge shell. Only the shells private to the rank are
    /// considered
    fn swap_edges(
        &mut self,
        params: &SwapParams,
        cavity: &mut Cavity<D, E, M>,
    ) -> Result<(usize, usize)> {
        let (mut n_swaps, mut n_fails) = (0, 0);
        for edg in self.sorted_edges() {
            if !self.edges.contains_key(&edg) {
                continue;
            }
            cavity.init_from_edge(self, edg);
            if !Self::is_swappable(cavity, params.q) || !self.is_private(&cavity.global_elem_ids)
            {
                continue;
            }
            let exclude = edg.map(|i| cavity.get_local_index(i).unwrap_or(Idx::MAX));
            if let Some((i, q)) = self.best_reconstruction(cavity, &exclude) {
                trace!("Swap edge {edg:?}: q = {:.3} -> {q:.3}", cavity.q_min);
                self.apply_swap(cavity, i)?;
                n_swaps += 1;
            } else {
                n_fails += 1;
            }
        }
        Ok((n_swaps, n_fails))
    }

    /// Face flips (3d only): two tetrahedra sharing a face are replaced by the three
    /// tetrahedra around the edge joining their apexes. Only the faces private to the
    /// rank are considered
    fn swap_faces(
        &mut self,
        params: &SwapParams,
        cavity: &mut Cavity<D, E, M>,
    ) -> Result<(usize, usize)> {
        let (mut n_swaps, mut n_fails) = (0, 0);
        for face in self.sorted_faces() {
            cavity.init_from_face(self, face);
            if cavity.elems.len() != 2
                || !Self::is_swappable(cavity, params.q)
                || !self.is_private(&cavity.global_elem_ids)
            {
                continue;
            }
            let exclude = face.map(|i| cavity.get_local_index(i).unwrap_or(Idx::MAX));
            if let Some((i, q)) = self.best_reconstruction(cavity, &exclude) {
                trace!("Flip face {face:?}: q = {:.3} -> {q:.3}", cavity.q_min);
                self.apply_swap(cavity, i)?;
                n_swaps += 1;
            } else {
                n_fails += 1;
            }
        }
        Ok((n_swaps, n_fails))
    }

    /// Swaps of the shells shared with other ranks. Each of them is proposed by the
    /// owner of its vertex with the lowest global index, that holds the whole shell
    fn interface_swaps(
        &self,
        params: &SwapParams,
        cavity: &mut Cavity<D, E, M>,
    ) -> (Vec<HaloEdit<D, E, M>>, usize) {
        let rank = self.rank();
        let mut edits = Vec::new();
        let mut n_fails = 0;

        for edg in self.sorted_edges() {
            if owning_rank_for(self, edg) != rank {
                continue;
            }
            cavity.init_from_edge(self, edg);
            if !Self::is_swappable(cavity, params.q) || self.is_private(&cavity.global_elem_ids) {
                continue;
            }
            let exclude = edg.map(|i| cavity.get_local_index(i).unwrap_or(Idx::MAX));
            let Some(edit) = self.swap_edit(cavity, &exclude, self.min_gid(&edg)) else {
                n_fails += 1;
                continue;
            };
            edits.push(edit);
        }

        if E::DIM == 3 {
            for face in self.sorted_faces() {
                if self.elem_owner(&E::Face::from_slice(&face)) != rank {
                    continue;
                }
                cavity.init_from_face(self, face);
                if cavity.elems.len() != 2
                    || !Self::is_swappable(cavity, params.q)
                    || self.is_private(&cavity.global_elem_ids)
                {
                    continue;
                }
                let exclude = face.map(|i| cavity.get_local_index(i).unwrap_or(Idx::MAX));
                let Some(edit) = self.swap_edit(cavity, &exclude, self.min_gid(&face)) else {
                    n_fails += 1;
                    continue;
                };
                edits.push(edit);
            }
        }
        (edits, n_fails)
    }

    /// Improve the quality of the elements below `params.q` using edge swaps, and face
    /// flips in 3d
    ///
    /// A swap is only performed if the minimum quality of the modified elements is
    /// strictly increased, and the region volumes and tagged faces are unchanged.
    /// In each sweep, the shells private to a rank are swapped first, then the ones
    /// shared between ranks are exchanged and applied consistently.
    /// Sweeps are repeated until no swap is possible, so that calling `swap` again
    /// does not modify the mesh. Returns the total number of swaps over all the ranks
    pub fn swap(&mut self, params: &SwapParams) -> Result<usize> {
        debug!("Swap edges and faces: q < {:.2}", params.q);

        let mut cavity = Cavity::new();
        let mut n_total = 0;
        let mut converged = false;
        for n_iter in 0..params.max_iter {
            let (mut n_swaps, mut n_fails) = self.swap_edges(params, &mut cavity)?;
            if E::DIM == 3 {
                let (n, f) = self.swap_faces(params, &mut cavity)?;
                n_swaps += n;
                n_fails += f;
            }
            let mut n_swaps = self.comm().all_reduce_sum(n_swaps as u64) as usize;
            if self.comm().size() > 1 {
                let (edits, f) = self.interface_swaps(params, &mut cavity);
                let (n, rejected) = exchange_edits(self, &edits)?;
                n_swaps += n;
                n_fails += f + rejected.len();
            }
            let n_fails = self.comm().all_reduce_sum(n_fails as u64) as usize;
            debug!("Iteration {}: {n_swaps} swaps, {n_fails} fails", n_iter + 1);
            self.stats.push(StepStats::Swap {
                n_swaps,
                n_fails,
                stats: MeshStats::new(self),
            });
            n_total += n_swaps;
            if n_swaps == 0 {
                converged = true;
                break;
            }
        }
        if !converged {
            warn!("Swap: no convergence after {} iterations", params.max_iter);
        }

        Ok(n_total)
    }
}

#[cfg(test)]
mod tests {
    use super::SwapParams;
    use crate::{
        Result, assert_delta,
        mesh::{
            Edge, Mesh2d, Point, Triangle,
            test_meshes::{cube_mesh, owned_global_elems},
        },
        metric::{AnisoMetric2d, AnisoMetric3d},
        parallel::{Communicator, ThreadComm, partition_mesh},
    };
    use std::sync::Arc;

    fn kite_mesh() -> Result<Mesh2d> {
        let coords = vec![
            Point::<2>::new(-1.0, 0.0),
            Point::<2>::new(0.0, -0.3),
            Point::<2>::new(1.0, 0.0),
            Point::<2>::new(0.0, 0.3),
        ];
        let elems = vec![Triangle::new(0, 1, 2), Triangle::new(0, 2, 3)];
        let faces = vec![
            Edge::new(0, 1),
            Edge::new(1, 2),
            Edge::new(2, 3),
            Edge::new(3, 0),
        ];
        Mesh2d::new(coords, elems, vec![1, 1], faces, vec![1, 1, 1, 1])
    }

    #[test]
    fn test_swap_2d() -> Result<()> {
        let mut mesh = kite_mesh()?;
        mesh.set_metrics(&[AnisoMetric2d::from_size(1.0); 4])?;
        let q0 = mesh.qmin();

        let params = SwapParams {
            q: 0.9,
            ..Default::default()
        };
        assert_eq!(mesh.swap(&params)?, 1);
        mesh.verify()?;
        assert!(mesh.edge_length([1, 3]).is_some());
        assert!(mesh.edge_length([0, 2]).is_none());
        assert!(mesh.qmin() > q0);
        assert_delta!(mesh.calculate_area(None), 0.6, 1e-12);

        // nothing left to do
        assert_eq!(mesh.swap(&params)?, 0);
        assert!(mesh.edge_length([1, 3]).is_some());

        Ok(())
    }

    #[test]
    fn test_swap_parallel() -> Result<()> {
        let mut mesh = kite_mesh()?;
        mesh.set_metrics(&[AnisoMetric2d::from_size(1.0); 4])?;
        let params = SwapParams {
            q: 0.9,
            ..Default::default()
        };
        let mut serial = mesh.clone();
        serial.swap(&params)?;

        // the diagonal to swap is on the partition interface
        let parts = vec![0, 1];
        let world = ThreadComm::world(2);
        let res = std::thread::scope(|s| {
            let handles = world
                .into_iter()
                .map(|comm| {
                    let mesh = &mesh;
                    let parts = &parts;
                    let params = &params;
                    s.spawn(move || {
                        let comm: Arc<dyn Communicator> = Arc::new(comm);
                        let mut local = partition_mesh(mesh, parts, comm).unwrap();
                        let n = local.swap(params).unwrap();
                        local.verify().unwrap();
                        (n, local.calculate_area(None), owned_global_elems(&local))
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        for (n, area, _) in &res {
            assert_eq!(*n, 1);
            assert_delta!(*area, 0.6, 1e-12);
        }
        let mut elems = res.into_iter().flat_map(|r| r.2).collect::<Vec<_>>();
        elems.sort();
        assert_eq!(elems, owned_global_elems(&serial));
        Ok(())
    }

    #[test]
    fn test_swap_boundary() -> Result<()> {
        let mut mesh = kite_mesh()?;
        mesh.set_metrics(&[AnisoMetric2d::from_size(1.0); 4])?;
        // the diagonal is an interface between two regions
        mesh.remove_elem(1)?;
        mesh.insert_elem(Triangle::new(0, 2, 3), 2)?;
        mesh.add_tagged_face(Edge::new(0, 2), 5)?;
        mesh.verify()?;

        assert_eq!(mesh.swap(&SwapParams::default())?, 0);
        assert!(mesh.edge_length([0, 2]).is_some());
        Ok(())
    }

    #[test]
    fn test_swap_3d() -> Result<()> {
        let mut mesh = cube_mesh(2)?;
        let m = AnisoMetric3d::from_sizes(
            &Point::<3>::new(0.5, 0.0, 0.0),
            &Point::<3>::new(0.0, 0.5, 0.0),
            &Point::<3>::new(0.0, 0.0, 0.1),
        );
        mesh.set_metrics(&vec![m; mesh.n_vert_slots()])?;
        let q0 = mesh.qmin();

        let params = SwapParams {
            q: 0.95,
            ..Default::default()
        };
        mesh.swap(&params)?;
        mesh.verify()?;
        assert!(mesh.qmin() >= q0);
        assert_delta!(mesh.calculate_volume(None), 1.0, 1e-12);
        assert_delta!(mesh.calculate_area(None, None), 6.0, 1e-12);

        let n_elems = mesh.n_elems();
        assert_eq!(mesh.swap(&params)?, 0);
        assert_eq!(mesh.n_elems(), n_elems);
        Ok(())
    }
}
