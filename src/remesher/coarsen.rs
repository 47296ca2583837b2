use super::cavity::{Cavity, CavityCheckStatus, FilledCavity, FilledCavityType};
use crate::{
    GlobalIdx, Idx, Result,
    mesh::{Elem, Mesh},
    metric::Metric,
    parallel::{HaloEdit, exchange_edits},
    stats::{MeshStats, StepStats},
};
use log::{debug, trace};
use rustc_hash::FxHashSet;

#[derive(Clone, Debug)]
pub struct CoarsenParams {
    /// Length below which the edges are collapsed
    pub l_low: f64,
    /// Maximum length of the edges created by a collapse
    pub l_max: f64,
    /// Max. number of passes
    pub max_iter: u32,
    /// Allow the collapse of vertices that belong to tagged faces
    pub coarsen_surface: bool,
}

impl Default for CoarsenParams {
    fn default() -> Self {
        Self {
            l_low: 0.5_f64.sqrt(),
            l_max: 2.0_f64.sqrt(),
            max_iter: 20,
            coarsen_surface: true,
        }
    }
}

impl<const D: usize, E: Elem, M: Metric<D>> Mesh<D, E, M> {
    /// Check if vertex `i0` can be merged into `i1` without modifying the tagged
    /// boundaries: the tags of `i0` must be tags of `i1`, and for each of them the edge
    /// must belong to a face with this tag
    fn can_merge(&self, i0: Idx, i1: Idx) -> bool {
        let tags0 = self.vertex_tags(i0);
        if tags0.is_empty() {
            return true;
        }
        let tags1 = self.vertex_tags(i1);
        if !tags0.iter().all(|t| tags1.contains(t)) {
            return false;
        }
        let edge_tags = self
            .edge_elements([i0, i1])
            .into_iter()
            .flat_map(|k| {
                let e = self.elems[k].el;
                (0..E::N_FACES).map(move |i_face| e.face(i_face))
            })
            .filter(|f| f.contains_edge([i0, i1]))
            .filter_map(|f| self.face_tag(&f))
            .collect::<Vec<_>>();
        tags0.iter().all(|t| edge_tags.contains(t))
    }

    /// Collapse of vertex `i0` into `i1`, if the reconstruction of the ball of `i0`
    /// from `i1` is valid
    fn collapse_edit(
        &self,
        i0: Idx,
        i1: Idx,
        params: &CoarsenParams,
        cavity: &mut Cavity<D, E, M>,
    ) -> Option<HaloEdit<D, E, M>> {
        if !self.can_merge(i0, i1) {
            trace!("Cannot collapse {i0} into {i1}: incompatible tags");
            return None;
        }

        cavity.init_from_vertex(self, i0);
        let local_i1 = cavity.get_local_index(i1)?;
        let filled = FilledCavity::new(cavity, FilledCavityType::ExistingVertex(local_i1));

        let status = filled.check(0.0, params.l_max, 0.0);
        if !matches!(status, CavityCheckStatus::Ok(_)) {
            trace!("Cannot collapse {i0} into {i1}: {status}");
            return None;
        }
        if !filled.is_conservative() {
            return None;
        }
        Some(filled.to_halo_edit(self, self.verts[i0].gid))
    }

    /// One pass: every owned vertex with short edges proposes its best collapse, and
    /// the proposals are exchanged between the ranks. `rejected` holds the collapses
    /// found non conforming, that are not proposed again
    fn coarsen_iter(
        &mut self,
        params: &CoarsenParams,
        cavity: &mut Cavity<D, E, M>,
        rejected: &mut FxHashSet<[GlobalIdx; 2]>,
    ) -> Result<(usize, usize)> {
        let mut verts = self
            .verts
            .iter()
            .filter(|(_, v)| v.owner == self.rank())
            .map(|(i, v)| (v.gid, i))
            .collect::<Vec<_>>();
        verts.sort_unstable();

        let mut edits = Vec::new();
        let mut pairs = Vec::new();
        let mut n_fails = 0;
        for (gid0, i0) in verts {
            if !params.coarsen_surface && !self.vertex_tags(i0).is_empty() {
                continue;
            }

            let mut candidates = self
                .neighbors(i0)
                .into_iter()
                .filter_map(|i1| {
                    let gid1 = self.verts[i1].gid;
                    self.edge_length([i0, i1])
                        .filter(|&l| l < params.l_low && !rejected.contains(&[gid0, gid1]))
                        .map(|l| (l, gid1, i1))
                })
                .collect::<Vec<_>>();
            if candidates.is_empty() {
                continue;
            }
            candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            let edit = candidates.into_iter().find_map(|(_, gid1, i1)| {
                self.collapse_edit(i0, i1, params, cavity)
                    .map(|edit| (gid1, edit))
            });
            let Some((gid1, edit)) = edit else {
                n_fails += 1;
                continue;
            };
            edits.push(edit);
            pairs.push([gid0, gid1]);
        }

        let (n_collapses, vetoed) = exchange_edits(self, &edits)?;
        n_fails += vetoed.len();
        rejected.extend(vetoed.into_iter().map(|k| pairs[k]));
        Ok((n_collapses, n_fails))
    }

    /// Collapse the edges shorter than `params.l_low`
    ///
    /// At each pass, every vertex tries its short edges by increasing length and
    /// proposes to merge into the other end of the first edge for which
    /// - the tagged boundaries are unchanged,
    /// - no element is inverted and no edge longer than `params.l_max` is created,
    /// - the region volumes and the tagged face measures are unchanged.
    ///
    /// The vertices are owned by a single rank, that computes the proposal from the
    /// full ball. The proposals that do not create non conforming faces are then
    /// applied by increasing global index of the removed vertex, skipping the ones
    /// whose ball shares a vertex with a collapse already applied. The result does not
    /// depend on the partition.
    ///
    /// Passes are repeated until no collapse is possible or `params.max_iter` is
    /// reached. Returns the total number of collapses over all the ranks
    pub fn coarsen(&mut self, params: &CoarsenParams) -> Result<usize> {
        debug!(
            "Coarsen edges: l < {:.2}, max. new length {:.2}",
            params.l_low, params.l_max
        );

        let mut cavity = Cavity::new();
        let mut rejected = FxHashSet::default();
        let mut n_total = 0;
        for n_iter in 0..params.max_iter {
            let (n_collapses, n_fails) = self.coarsen_iter(params, &mut cavity, &mut rejected)?;
            let n_fails = self.comm().all_reduce_sum(n_fails as u64) as usize;
            debug!(
                "Iteration {}: {n_collapses} vertices collapsed, {n_fails} fails",
                n_iter + 1
            );
            self.stats.push(StepStats::Coarsen {
                n_collapses,
                n_fails,
                stats: MeshStats::new(self),
            });
            n_total += n_collapses;
            if n_collapses == 0 {
                break;
            }
        }

        Ok(n_total)
    }
}

#[cfg(test)]
mod tests {
    use super::CoarsenParams;
    use crate::{
        Rank, Result, assert_delta,
        mesh::{
            GElem, Point,
            test_meshes::{cube_mesh, disc_mesh, owned_global_elems, square_mesh},
        },
        metric::{AnisoMetric2d, AnisoMetric3d},
        parallel::{Communicator, ThreadComm, partition_mesh},
    };
    use std::sync::Arc;

    #[test]
    fn test_coarsen_2d() -> Result<()> {
        let mut mesh = square_mesh(10)?;
        mesh.set_metrics(&vec![AnisoMetric2d::from_size(0.5); mesh.n_vert_slots()])?;

        let params = CoarsenParams {
            l_max: 2.0,
            ..Default::default()
        };
        let n = mesh.coarsen(&params)?;
        assert!(n > 0);
        mesh.verify()?;
        assert_eq!(mesh.n_verts(), 121 - n);
        assert_delta!(mesh.calculate_area(None), 1.0, 1e-12);
        assert_delta!(mesh.calculate_perimeter(None, None), 4.0, 1e-12);
        for tag in 1..=4 {
            assert!(mesh.faces().any(|(_, t)| t == tag));
        }
        // the corners are kept
        for c in [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]] {
            assert!(
                mesh.verts()
                    .any(|p| (p[0] - c[0]).abs() < 1e-12 && (p[1] - c[1]).abs() < 1e-12)
            );
        }
        // no new edge is longer than l_max
        assert!(mesh.lengths_iter().all(|(_, l)| l < 2.0 + 1e-12));
        assert!(mesh.qualities_iter().all(|q| q > 0.0));

        Ok(())
    }

    #[test]
    fn test_coarsen_interior_only() -> Result<()> {
        let mut mesh = square_mesh(10)?;
        mesh.set_metrics(&vec![AnisoMetric2d::from_size(0.5); mesh.n_vert_slots()])?;
        let n_bdy = mesh
            .vert_ids()
            .filter(|&i| !mesh.vertex_tags(i).is_empty())
            .count();

        let params = CoarsenParams {
            l_max: 2.0,
            coarsen_surface: false,
            ..Default::default()
        };
        mesh.coarsen(&params)?;
        mesh.verify()?;
        let n = mesh
            .vert_ids()
            .filter(|&i| !mesh.vertex_tags(i).is_empty())
            .count();
        assert_eq!(n, n_bdy);
        Ok(())
    }

    #[test]
    fn test_coarsen_disc() -> Result<()> {
        let mut mesh = disc_mesh()?;
        mesh.set_metrics(&vec![AnisoMetric2d::from_size(2.0); mesh.n_vert_slots()])?;
        let area = mesh.calculate_area(Some(12));
        let perimeter = mesh.calculate_perimeter(Some(11), Some(12));
        let n_faces = mesh.n_tagged_faces();

        mesh.coarsen(&CoarsenParams::default())?;
        mesh.verify()?;
        assert!(mesh.n_verts() < 331);
        // curved tagged boundaries are not modified
        assert_eq!(mesh.n_tagged_faces(), n_faces);
        assert_delta!(mesh.calculate_area(Some(12)), area, 1e-10);
        assert_delta!(mesh.calculate_perimeter(Some(11), Some(12)), perimeter, 1e-10);
        Ok(())
    }

    #[test]
    fn test_coarsen_3d() -> Result<()> {
        let mut mesh = cube_mesh(4)?;
        mesh.set_metrics(&vec![AnisoMetric3d::from_size(0.6); mesh.n_vert_slots()])?;

        let params = CoarsenParams {
            l_max: 2.0,
            ..Default::default()
        };
        let n = mesh.coarsen(&params)?;
        assert!(n > 0);
        mesh.verify()?;
        assert_delta!(mesh.calculate_volume(None), 1.0, 1e-12);
        assert_delta!(mesh.calculate_area(None, None), 6.0, 1e-12);
        for tag in 1..=6 {
            assert!(mesh.faces().any(|(_, t)| t == tag));
        }
        Ok(())
    }

    #[test]
    fn test_coarsen_parallel() -> Result<()> {
        let mut mesh = square_mesh(16)?;
        mesh.set_metrics(&vec![AnisoMetric2d::from_size(0.5); mesh.n_vert_slots()])?;
        let parts = mesh
            .elems()
            .map(|e| Rank::from(mesh.gelem(&e).center()[0] > 0.5))
            .collect::<Vec<_>>();
        let params = CoarsenParams {
            l_max: 2.0,
            ..Default::default()
        };
        let near_interface = |p: &Point<2>| (p[0] - 0.5).abs() < 0.1;

        let mut serial = mesh.clone();
        let n = serial.coarsen(&params)?;
        serial.verify()?;
        let n_interface = serial.verts().filter(near_interface).count();
        assert!(n_interface < mesh.verts().filter(near_interface).count());

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
                        let n = local.coarsen(params).unwrap();
                        local.verify().unwrap();
                        let owned = local
                            .vert_ids()
                            .filter(|&i| local.is_owned(i))
                            .collect::<Vec<_>>();
                        let n_interface = owned
                            .iter()
                            .filter(|&&i| near_interface(&local.verts[i].vx))
                            .count();
                        (n, owned.len(), n_interface, owned_global_elems(&local))
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        for r in &res {
            assert_eq!(r.0, n);
        }
        assert_eq!(res.iter().map(|r| r.1).sum::<usize>(), serial.n_verts());
        assert_eq!(res.iter().map(|r| r.2).sum::<usize>(), n_interface);

        // same mesh as in serial
        let mut elems = res.into_iter().flat_map(|r| r.3).collect::<Vec<_>>();
        elems.sort();
        assert_eq!(elems, owned_global_elems(&serial));

        Ok(())
    }
}
