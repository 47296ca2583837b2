use super::Communicator;
use crate::{
    Error, GlobalIdx, Idx, Rank, Result,
    mesh::{Elem, Mesh},
    metric::Metric,
};
use log::debug;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Rank that is responsible for an edge: the owner of its endpoint with the lowest
/// global index
#[must_use]
pub fn owning_rank_for<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &Mesh<D, E, M>,
    edg: [Idx; 2],
) -> Rank {
    let v0 = &mesh.verts[edg[0]];
    let v1 = &mesh.verts[edg[1]];
    if v0.gid < v1.gid { v0.owner } else { v1.owner }
}

/// Build the part of a (serial) mesh that belongs to the current rank of `comm`
///
/// `parts` gives the rank of each element. A vertex is owned by the lowest rank of
/// its elements, and its global index is its index in `mesh`. The local mesh holds
/// all the elements that contain at least one owned vertex
pub fn partition_mesh<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &Mesh<D, E, M>,
    parts: &[Rank],
    comm: Arc<dyn Communicator>,
) -> Result<Mesh<D, E, M>> {
    if parts.len() != mesh.n_elems() {
        return Err(Error::from(&format!(
            "Invalid partition size {} ({} elements)",
            parts.len(),
            mesh.n_elems()
        )));
    }
    if let Some(p) = parts.iter().find(|&&p| p >= comm.size()) {
        return Err(Error::from(&format!("Invalid partition {p}")));
    }
    let rank = comm.rank();

    let mut owner = vec![Rank::MAX; mesh.n_vert_slots()];
    for (i_elem, &p) in mesh.elem_ids().zip(parts) {
        for &i in mesh.elems[i_elem].el.iter() {
            owner[i as usize] = owner[i as usize].min(p);
        }
    }

    let is_local = |e: &E| e.iter().any(|&i| owner[i as usize] == rank);
    let mut new_idx = vec![Idx::MAX; mesh.n_vert_slots()];
    let mut verts = Vec::new();
    let mut elems = Vec::new();
    for e in mesh.elems().filter(|e| is_local(e)) {
        for &i in e.iter() {
            if new_idx[i as usize] == Idx::MAX {
                new_idx[i as usize] = verts.len() as Idx;
                let v = &mesh.verts[i];
                verts.push((v.vx, v.m, owner[i as usize], GlobalIdx::from(i)));
            }
        }
    }
    for (e, t) in mesh.elems().zip(mesh.etags()).filter(|(e, _)| is_local(e)) {
        elems.push((E::from_iter(e.iter().map(|&i| new_idx[i as usize])), t));
    }

    // tagged faces that are faces of a local element
    let faces = mesh
        .faces()
        .filter(|(f, _)| {
            mesh.face_elements(f)
                .iter()
                .any(|&k| is_local(&mesh.elems[k].el))
        })
        .map(|(f, t)| (E::Face::from_iter(f.iter().map(|&i| new_idx[i as usize])), t))
        .collect::<Vec<_>>();

    debug!(
        "Rank {rank}: {} vertices, {} elements, {} tagged faces",
        verts.len(),
        elems.len(),
        faces.len()
    );

    Mesh::from_parts(verts, elems, faces, comm)
}

/// Assign the global indices of new vertices. `new_verts` contains the local index of
/// each new vertex and the global indices of the endpoints of the edge it was created
/// on; the same key gives the same global index on all the ranks
pub(crate) fn assign_global_ids<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &mut Mesh<D, E, M>,
    new_verts: &[(Idx, [GlobalIdx; 2])],
    max_gid: GlobalIdx,
) -> Result<()> {
    let rank = mesh.rank();
    let owned = new_verts
        .iter()
        .filter(|(i, _)| mesh.verts[*i].owner == rank)
        .flat_map(|(_, key)| *key)
        .collect::<Vec<_>>();

    let mut keys = mesh
        .comm()
        .all_gather_u64(&owned)
        .iter()
        .flat_map(|x| x.chunks(2).map(|k| [k[0], k[1]]).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    keys.sort_unstable();

    let gids: FxHashMap<[GlobalIdx; 2], GlobalIdx> = keys
        .into_iter()
        .enumerate()
        .map(|(k, key)| (key, max_gid + 1 + k as GlobalIdx))
        .collect();

    for (i, key) in new_verts {
        let Some(&gid) = gids.get(key) else {
            return Err(Error::from(&format!(
                "No global index for the vertex created on edge {key:?}"
            )));
        };
        mesh.verts[*i].gid = gid;
    }
    Ok(())
}

/// Remove the elements that do not contain any owned vertex, then the tagged faces
/// and the vertices that are no longer used. Returns the number of removed elements
pub(crate) fn prune_halo<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &mut Mesh<D, E, M>,
) -> Result<usize> {
    let rank = mesh.rank();
    let elems = mesh
        .elems
        .iter()
        .filter(|(_, e)| e.el.iter().all(|&i| mesh.verts[i].owner != rank))
        .map(|(k, _)| k)
        .collect::<Vec<_>>();
    for &k in &elems {
        mesh.remove_elem(k)?;
    }

    let faces = mesh
        .faces()
        .filter(|(f, _)| mesh.face_elements(f).is_empty())
        .map(|(f, _)| f)
        .collect::<Vec<_>>();
    let n_faces = faces.len();
    for f in faces {
        mesh.remove_tagged_face(f)?;
    }

    let verts = mesh
        .vert_ids()
        .filter(|&i| mesh.vertex_elements(i).is_empty())
        .collect::<Vec<_>>();
    let n_verts = verts.len();
    for i in verts {
        mesh.remove_vertex(i)?;
    }

    if elems.len() + n_faces + n_verts > 0 {
        debug!(
            "Rank {rank}: removed {} elements, {n_faces} tagged faces and {n_verts} vertices",
            elems.len()
        );
    }
    Ok(elems.len())
}

#[cfg(test)]
mod tests {
    use super::{owning_rank_for, partition_mesh};
    use crate::{
        Rank, Result,
        mesh::{GElem, Mesh2d, test_meshes::square_mesh},
        parallel::{Communicator, SerialComm, ThreadComm},
    };
    use std::sync::Arc;

    /// Split the unit square in two along x = 0.5
    fn parts(mesh: &Mesh2d) -> Vec<Rank> {
        mesh.elems()
            .map(|e| usize::from(mesh.gelem(&e).center()[0] > 0.5))
            .collect()
    }

    #[test]
    fn test_serial_partition() -> Result<()> {
        let mesh = square_mesh(4)?;
        let local = partition_mesh(&mesh, &vec![0; mesh.n_elems()], Arc::new(SerialComm))?;
        local.verify()?;
        assert_eq!(local.n_verts(), mesh.n_verts());
        assert_eq!(local.n_elems(), mesh.n_elems());
        assert_eq!(local.n_tagged_faces(), mesh.n_tagged_faces());
        assert!(partition_mesh(&mesh, &[0], Arc::new(SerialComm)).is_err());
        assert!(partition_mesh(&mesh, &vec![1; mesh.n_elems()], Arc::new(SerialComm)).is_err());
        Ok(())
    }

    #[test]
    fn test_partition_2() -> Result<()> {
        let mesh = square_mesh(4)?;
        let parts = parts(&mesh);

        let world = ThreadComm::world(2);
        std::thread::scope(|s| {
            let handles = world
                .into_iter()
                .map(|comm| {
                    let mesh = &mesh;
                    let parts = &parts;
                    s.spawn(move || -> (usize, usize, f64, bool) {
                        let comm: Arc<dyn Communicator> = Arc::new(comm);
                        let local = partition_mesh(mesh, parts, comm).unwrap();
                        local.verify().unwrap();
                        let n_owned = local.vert_ids().filter(|&i| local.is_owned(i)).count();
                        // the edges are owned consistently with their endpoints
                        let consistent = local.lengths_iter().all(|(edg, _)| {
                            let r = owning_rank_for(&local, edg);
                            edg.iter().any(|&i| local.verts[i].owner == r)
                        });
                        (
                            n_owned,
                            local.n_global_elems() as usize,
                            local.calculate_area(None),
                            consistent,
                        )
                    })
                })
                .collect::<Vec<_>>();
            let res = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>();
            assert_eq!(res[0].0 + res[1].0, 25);
            for (_, n_elems, area, consistent) in res {
                assert_eq!(n_elems, 32);
                assert!((area - 1.0).abs() < 1e-12);
                assert!(consistent);
            }
        });
        Ok(())
    }
}
