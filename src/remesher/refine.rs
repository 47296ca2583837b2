use super::cavity::{Cavity, CavityCheckStatus, FilledCavity, FilledCavityType};
use crate::{
    GlobalIdx, Idx, Result,
    mesh::{Elem, Mesh, Point},
    metric::Metric,
    parallel::{assign_global_ids, owning_rank_for, prune_halo},
    stats::{MeshStats, StepStats},
};
use log::{debug, trace};
use std::cmp::Ordering;

#[derive(Clone, Debug)]
pub struct RefineParams {
    /// Length above which the edges are split
    pub l: f64,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            l: 2.0_f64.sqrt(),
        }
    }
}

impl<const D: usize, E: Elem, M: Metric<D>> Mesh<D, E, M> {
    /// Location and metric of the vertex used to split an edge. The point is placed
    /// where the metric lengths measured from both ends are equal, assuming a linear
    /// variation of the size along the edge
    fn split_point(&self, edg: [Idx; 2]) -> (Point<D>, M) {
        let (mut v0, mut v1) = (&self.verts[edg[0]], &self.verts[edg[1]]);
        if v1.gid < v0.gid {
            std::mem::swap(&mut v0, &mut v1);
        }
        let e = v1.vx - v0.vx;
        let l0 = v0.m.length(&e);
        let l1 = v1.m.length(&e);
        let w = 1.0 / (1.0 + f64::sqrt(l0 / l1));
        let p = v0.vx + w * e;
        let m = M::interpolate([(1.0 - w, &v0.m), (w, &v1.m)].into_iter());
        (p, m)
    }

    /// Edges longer than `l`, sorted by decreasing length and then by the global
    /// indices of their endpoints
    fn long_edges(&self, l: f64) -> Vec<([Idx; 2], [GlobalIdx; 2])> {
        let mut edges = self
            .lengths_iter()
            .filter(|&(_, length)| length > l)
            .map(|(edg, length)| {
                let mut key = [self.verts[edg[0]].gid, self.verts[edg[1]].gid];
                key.sort_unstable();
                (edg, key, length)
            })
            .collect::<Vec<_>>();
        edges.sort_by(|a, b| match b.2.partial_cmp(&a.2) {
            Some(Ordering::Equal) | None => a.1.cmp(&b.1),
            Some(o) => o,
        });
        edges.into_iter().map(|(edg, key, _)| (edg, key)).collect()
    }

    /// Split the edges longer than `params.l`, each edge being split at most once
    ///
    /// The edges are processed by decreasing length. An edge is split by inserting a
    /// vertex in its edge cavity; the tagged faces that contain the edge are split as
    /// well. All the ranks process their edges in the same order, the new vertices
    /// belong to the rank responsible for the edge and get the same global index
    /// everywhere. Returns the number of splits over all the ranks
    pub fn refine(&mut self, params: &RefineParams) -> Result<usize> {
        debug!("Refine edges: l > {:.2}", params.l);

        let max_gid = self
            .verts
            .iter()
            .map(|(_, v)| v.gid)
            .max()
            .unwrap_or(0);
        let max_gid = self
            .comm()
            .all_gather_u64(&[max_gid])
            .iter()
            .map(|x| x[0])
            .max()
            .unwrap_or(max_gid);

        let edges = self.long_edges(params.l);
        let mut cavity = Cavity::new();
        let mut new_verts = Vec::new();
        let mut n_fails = 0;
        for (edg, key) in edges {
            if !self.edges.contains_key(&edg) {
                trace!("Edge {edg:?} has been removed");
                continue;
            }
            cavity.init_from_edge(self, edg);
            let (p, m) = self.split_point(edg);
            let filled = FilledCavity::new(&cavity, FilledCavityType::NewVertex((p, m)));
            let status = filled.check(0.0, f64::MAX, 0.0);
            if !matches!(status, CavityCheckStatus::Ok(_)) {
                trace!("Cannot split edge {edg:?}: {status}");
                n_fails += 1;
                continue;
            }
            let owner = owning_rank_for(self, edg);
            let ip = self.insert_vertex(p, m, owner, GlobalIdx::MAX);
            self.apply_filled_cavity(&filled, ip)?;
            trace!("Edge {edg:?} split, new vertex {ip}");
            new_verts.push((ip, key));
        }

        assign_global_ids(self, &new_verts, max_gid)?;
        if !new_verts.is_empty() {
            // new edge lengths use the global indices
            self.update_lengths_and_qualities();
        }
        if self.comm().size() > 1 {
            prune_halo(self)?;
        }

        let rank = self.rank();
        let n_splits = new_verts
            .iter()
            .filter(|(i, _)| self.vertex(*i).is_some_and(|v| v.owner == rank))
            .count();
        let n_splits = self.comm().all_reduce_sum(n_splits as u64) as usize;
        let n_fails = self.comm().all_reduce_sum(n_fails) as usize;

        debug!("{n_splits} edges split, {n_fails} fails");
        self.stats.push(StepStats::Refine {
            n_splits,
            n_fails,
            stats: MeshStats::new(self),
        });

        Ok(n_splits)
    }
}

#[cfg(test)]
mod tests {
    use super::RefineParams;
    use crate::{
        Rank, Result, assert_delta,
        mesh::{
            GElem, Mesh2d, Point,
            test_meshes::{cube_mesh, owned_global_elems, square_mesh, test_mesh_2d},
        },
        metric::{AnisoMetric2d, AnisoMetric3d, Metric},
        parallel::{Communicator, ThreadComm, partition_mesh},
    };
    use std::sync::Arc;

    #[test]
    fn test_refine_2d() -> Result<()> {
        let mut mesh = test_mesh_2d()?;
        mesh.set_metrics(&vec![AnisoMetric2d::from_size(0.3); mesh.n_vert_slots()])?;

        let n = mesh.refine(&RefineParams::default())?;
        assert_eq!(n, 5);
        mesh.verify()?;
        assert_eq!(mesh.n_verts(), 9);
        assert_eq!(mesh.n_elems(), 8);
        assert_eq!(mesh.n_tagged_faces(), 8);
        assert_delta!(mesh.calculate_area(None), 1.0, 1e-12);
        assert_delta!(mesh.calculate_perimeter(None, None), 4.0, 1e-12);
        assert!(mesh.qualities_iter().all(|q| q > 0.0));

        // every edge is split at most once per call
        let n = mesh.refine(&RefineParams::default())?;
        assert_eq!(n, 16);
        mesh.verify()?;
        assert_eq!(mesh.n_elems(), 32);
        Ok(())
    }

    #[test]
    fn test_refine_split_point() -> Result<()> {
        let mut mesh = test_mesh_2d()?;
        let m0 = AnisoMetric2d::from_size(0.1);
        let m1 = AnisoMetric2d::from_size(0.4);
        let metrics = mesh
            .verts()
            .map(|p| if p[0] < 0.5 { m0 } else { m1 })
            .collect::<Vec<_>>();
        mesh.set_metrics(&metrics)?;

        let (p, m) = mesh.split_point([0, 1]);
        // with h(t) = 0.1 + 0.3 t, both halves have the same length if h(t) = 0.2
        assert_delta!(p[0], 1.0 / 3.0, 1e-12);
        assert_delta!(p[1], 0.0, 1e-12);
        let h = m.sizes()[0];
        assert!(h > 0.1 && h < 0.4);
        Ok(())
    }

    #[test]
    fn test_refine_3d() -> Result<()> {
        let mut mesh = cube_mesh(1)?;
        mesh.set_metrics(&vec![AnisoMetric3d::from_size(0.3); mesh.n_vert_slots()])?;
        let n_edges = mesh.n_edges();
        let n = mesh.refine(&RefineParams::default())?;
        assert_eq!(n, n_edges);
        mesh.verify()?;
        assert_delta!(mesh.calculate_volume(None), 1.0, 1e-12);
        assert_delta!(mesh.calculate_area(None, None), 6.0, 1e-12);
        assert!(mesh.qualities_iter().all(|q| q > 0.0));
        Ok(())
    }

    #[test]
    fn test_refine_parallel() -> Result<()> {
        let mut mesh = square_mesh(4)?;
        let metric = |p: &Point<2>| AnisoMetric2d::from_size(0.05 + 0.1 * p[0]);
        let metrics = mesh.verts().map(|p| metric(&p)).collect::<Vec<_>>();
        mesh.set_metrics(&metrics)?;

        let parts = mesh
            .elems()
            .map(|e| Rank::from(mesh.gelem(&e).center()[1] > 0.5))
            .collect::<Vec<_>>();

        let mut serial = mesh.clone();
        serial.refine(&RefineParams::default())?;
        serial.verify()?;
        let n_elems = serial.n_elems() as u64;
        let n_verts = serial.n_verts();

        let world = ThreadComm::world(2);
        std::thread::scope(|s| {
            let handles = world
                .into_iter()
                .map(|comm| {
                    let mesh = &mesh;
                    let parts = &parts;
                    s.spawn(move || {
                        let comm: Arc<dyn Communicator> = Arc::new(comm);
                        let mut local: Mesh2d = partition_mesh(mesh, parts, comm).unwrap();
                        local.refine(&RefineParams::default()).unwrap();
                        local.verify().unwrap();
                        let n_owned = local.vert_ids().filter(|&i| local.is_owned(i)).count();
                        (
                            local.n_global_elems(),
                            n_owned,
                            local.calculate_area(None),
                            owned_global_elems(&local),
                        )
                    })
                })
                .collect::<Vec<_>>();
            let res = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>();
            assert_eq!(res[0].1 + res[1].1, n_verts);
            for (n, _, area, _) in &res {
                assert_eq!(*n, n_elems);
                assert_delta!(*area, 1.0, 1e-12);
            }

            // same mesh as in serial
            let mut elems = res.into_iter().flat_map(|r| r.3).collect::<Vec<_>>();
            elems.sort();
            assert_eq!(elems, owned_global_elems(&serial));
        });
        Ok(())
    }
}
