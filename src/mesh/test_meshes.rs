use super::{
    Edge, Elem, Point, Tetrahedron, Triangle,
    simplex_mesh::{Mesh, Mesh2d, Mesh3d},
    topo_elems::get_face_to_elem,
};
use crate::{GlobalIdx, Idx, Result, Tag, metric::Metric};
use std::f64::consts::PI;

/// Build a 2d mesh of the unit square with 2 triangles
pub fn test_mesh_2d() -> Result<Mesh2d> {
    let coords = vec![
        Point::<2>::new(0., 0.),
        Point::<2>::new(1., 0.),
        Point::<2>::new(1., 1.),
        Point::<2>::new(0., 1.),
    ];
    let elems = vec![Triangle::new(0, 1, 2), Triangle::new(0, 2, 3)];
    let etags = vec![1, 1];
    let faces = vec![
        Edge::new(0, 1),
        Edge::new(1, 2),
        Edge::new(2, 3),
        Edge::new(3, 0),
    ];
    let ftags = vec![1, 2, 3, 4];

    Mesh2d::new(coords, elems, etags, faces, ftags)
}

/// Build a 3d mesh of the unit cube with 5 tetrahedra
pub fn test_mesh_3d() -> Result<Mesh3d> {
    let coords = vec![
        Point::<3>::new(0., 0., 0.),
        Point::<3>::new(1., 0., 0.),
        Point::<3>::new(1., 1., 0.),
        Point::<3>::new(0., 1., 0.),
        Point::<3>::new(0., 0., 1.),
        Point::<3>::new(1., 0., 1.),
        Point::<3>::new(1., 1., 1.),
        Point::<3>::new(0., 1., 1.),
    ];
    let elems = vec![
        Tetrahedron::new(0, 1, 3, 4),
        Tetrahedron::new(2, 3, 1, 6),
        Tetrahedron::new(5, 4, 6, 1),
        Tetrahedron::new(7, 6, 4, 3),
        Tetrahedron::new(1, 3, 4, 6),
    ];
    let etags = vec![1; 5];
    let faces = vec![
        Triangle::new(0, 1, 3),
        Triangle::new(1, 2, 3),
        Triangle::new(4, 5, 6),
        Triangle::new(4, 6, 7),
        Triangle::new(0, 1, 4),
        Triangle::new(1, 4, 5),
        Triangle::new(2, 3, 6),
        Triangle::new(3, 6, 7),
        Triangle::new(0, 3, 4),
        Triangle::new(3, 4, 7),
        Triangle::new(1, 2, 6),
        Triangle::new(1, 5, 6),
    ];
    let ftags = vec![1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6];

    Mesh3d::new(coords, elems, etags, faces, ftags)
}

/// Tag of a boundary face of the unit square / cube, from the location of its center
/// (1: y = 0, 2: x = 1, 3: y = 1, 4: x = 0 in 2d and
/// 1: z = 0, 2: z = 1, 3: y = 0, 4: y = 1, 5: x = 0, 6: x = 1 in 3d)
fn box_face_tag<const D: usize>(c: &Point<D>) -> Tag {
    let eps = 1e-10;
    if D == 2 {
        if c[1] < eps {
            1
        } else if c[0] > 1.0 - eps {
            2
        } else if c[1] > 1.0 - eps {
            3
        } else {
            4
        }
    } else if c[2] < eps {
        1
    } else if c[2] > 1.0 - eps {
        2
    } else if c[1] < eps {
        3
    } else if c[1] > 1.0 - eps {
        4
    } else if c[0] < eps {
        5
    } else {
        6
    }
}

/// Boundary faces of a set of elements, tagged by `box_face_tag`
fn box_faces<const D: usize, E: Elem>(coords: &[Point<D>], elems: &[E]) -> (Vec<E::Face>, Vec<Tag>) {
    let f2e = get_face_to_elem(elems.iter().enumerate().map(|(i, e)| (i as Idx, *e)));
    let mut faces = f2e
        .into_iter()
        .filter(|(_, els)| els.len() == 1)
        .map(|(f, _)| f)
        .collect::<Vec<_>>();
    faces.sort_by_key(|f| f.iter().copied().collect::<Vec<_>>());
    let ftags = faces
        .iter()
        .map(|f| {
            let n = f.iter().count() as f64;
            let c = f.iter().map(|&i| coords[i as usize]).sum::<Point<D>>() / n;
            box_face_tag(&c)
        })
        .collect();
    (faces, ftags)
}

/// Uniform mesh of the unit square with `n` x `n` cells split into 2 triangles
pub fn square_mesh(n: Idx) -> Result<Mesh2d> {
    let h = 1.0 / f64::from(n);
    let idx = |i: Idx, j: Idx| i + (n + 1) * j;

    let mut coords = Vec::with_capacity(((n + 1) * (n + 1)) as usize);
    for j in 0..=n {
        for i in 0..=n {
            coords.push(Point::<2>::new(h * f64::from(i), h * f64::from(j)));
        }
    }

    let mut elems = Vec::with_capacity((2 * n * n) as usize);
    for j in 0..n {
        for i in 0..n {
            elems.push(Triangle::new(idx(i, j), idx(i + 1, j), idx(i + 1, j + 1)));
            elems.push(Triangle::new(idx(i, j), idx(i + 1, j + 1), idx(i, j + 1)));
        }
    }
    let etags = vec![1; elems.len()];
    let (faces, ftags) = box_faces(&coords, &elems);

    Mesh2d::new(coords, elems, etags, faces, ftags)
}

/// Uniform mesh of the unit cube with `n` x `n` x `n` cells split into 6 tetrahedra
/// along their main diagonal
pub fn cube_mesh(n: Idx) -> Result<Mesh3d> {
    let h = 1.0 / f64::from(n);
    let idx = |i: Idx, j: Idx, k: Idx| i + (n + 1) * (j + (n + 1) * k);

    let mut coords = Vec::with_capacity(((n + 1) * (n + 1) * (n + 1)) as usize);
    for k in 0..=n {
        for j in 0..=n {
            for i in 0..=n {
                coords.push(Point::<3>::new(
                    h * f64::from(i),
                    h * f64::from(j),
                    h * f64::from(k),
                ));
            }
        }
    }

    // axis permutations and their parity
    let perms = [
        ([0, 1, 2], true),
        ([1, 2, 0], true),
        ([2, 0, 1], true),
        ([0, 2, 1], false),
        ([2, 1, 0], false),
        ([1, 0, 2], false),
    ];

    let mut elems = Vec::with_capacity((6 * n * n * n) as usize);
    for k in 0..n {
        for j in 0..n {
            for i in 0..n {
                for (p, even) in &perms {
                    let mut ijk = [i, j, k];
                    let mut tet = [0; 4];
                    tet[0] = idx(ijk[0], ijk[1], ijk[2]);
                    for (l, &axis) in p.iter().enumerate() {
                        ijk[axis] += 1;
                        tet[l + 1] = idx(ijk[0], ijk[1], ijk[2]);
                    }
                    if !even {
                        tet.swap(0, 1);
                    }
                    elems.push(Tetrahedron::new(tet[0], tet[1], tet[2], tet[3]));
                }
            }
        }
    }
    let etags = vec![1; elems.len()];
    let (faces, ftags) = box_faces(&coords, &elems);

    Mesh3d::new(coords, elems, etags, faces, ftags)
}

/// Disc of radius 5 made of 10 rings, with an internal boundary at radius 3
///  - element tags: 12 inside the internal boundary and 11 outside,
///  - face tags: 1 on the outer boundary, 2 on the internal boundary
pub fn disc_mesh() -> Result<Mesh2d> {
    let n_rings: Idx = 10;
    let dr = 0.5;
    let i_interface: Idx = 6;

    let mut coords = vec![Point::<2>::new(0., 0.)];
    let mut rings: Vec<Vec<Idx>> = vec![vec![0]];
    for k in 1..=n_rings {
        let n = 6 * k;
        let r = dr * f64::from(k);
        let mut ring = Vec::with_capacity(n as usize);
        for b in 0..n {
            let theta = 2.0 * PI * f64::from(b) / f64::from(n);
            ring.push(coords.len() as Idx);
            coords.push(Point::<2>::new(r * theta.cos(), r * theta.sin()));
        }
        rings.push(ring);
    }

    let mut elems = Vec::new();
    let mut etags = Vec::new();
    for k in 1..=n_rings as usize {
        let inner = &rings[k - 1];
        let outer = &rings[k];
        let (n_in, n_out) = (inner.len(), outer.len());
        let tag = if k as Idx <= i_interface { 12 } else { 11 };
        if n_in == 1 {
            for b in 0..n_out {
                elems.push(Triangle::new(inner[0], outer[b], outer[(b + 1) % n_out]));
                etags.push(tag);
            }
            continue;
        }
        let angle = |i: usize, n: usize| i as f64 / n as f64;
        let (mut a, mut b) = (0, 0);
        while a < n_in || b < n_out {
            if b < n_out && (a == n_in || angle(b + 1, n_out) <= angle(a + 1, n_in)) {
                elems.push(Triangle::new(
                    inner[a % n_in],
                    outer[b],
                    outer[(b + 1) % n_out],
                ));
                b += 1;
            } else {
                elems.push(Triangle::new(
                    inner[a],
                    outer[b % n_out],
                    inner[(a + 1) % n_in],
                ));
                a += 1;
            }
            etags.push(tag);
        }
    }

    let mut faces = Vec::new();
    let mut ftags = Vec::new();
    for (k, tag) in [(n_rings as usize, 1), (i_interface as usize, 2)] {
        let ring = &rings[k];
        for b in 0..ring.len() {
            faces.push(Edge::new(ring[b], ring[(b + 1) % ring.len()]));
            ftags.push(tag);
        }
    }

    Mesh2d::new(coords, elems, etags, faces, ftags)
}

#[cfg(test)]
mod tests {
    use super::{cube_mesh, disc_mesh, square_mesh};
    use crate::{Result, assert_delta};

    #[test]
    fn test_square() -> Result<()> {
        let mesh = square_mesh(5)?;
        mesh.verify()?;
        assert_eq!(mesh.n_verts(), 36);
        assert_eq!(mesh.n_elems(), 50);
        assert_eq!(mesh.n_tagged_faces(), 20);
        assert_delta!(mesh.calculate_area(None), 1.0, 1e-12);
        assert_delta!(mesh.calculate_perimeter(Some(1), None), 4.0, 1e-12);
        for tag in 1..=4 {
            assert_eq!(mesh.faces().filter(|(_, t)| *t == tag).count(), 5);
        }
        Ok(())
    }

    #[test]
    fn test_cube() -> Result<()> {
        let mesh = cube_mesh(3)?;
        mesh.verify()?;
        assert_eq!(mesh.n_verts(), 64);
        assert_eq!(mesh.n_elems(), 162);
        assert_eq!(mesh.n_tagged_faces(), 108);
        assert_delta!(mesh.calculate_volume(None), 1.0, 1e-12);
        assert_delta!(mesh.calculate_area(None, None), 6.0, 1e-12);
        Ok(())
    }

    #[test]
    fn test_disc() -> Result<()> {
        let mesh = disc_mesh()?;
        mesh.verify()?;
        assert_eq!(mesh.n_verts(), 331);
        assert_eq!(mesh.n_tagged_faces(), 96);

        let n = 36.0;
        let perimeter = 2.0 * n * 3.0 * f64::sin(std::f64::consts::PI / n);
        let area = 0.5 * n * 9.0 * f64::sin(2.0 * std::f64::consts::PI / n);
        assert_delta!(mesh.calculate_perimeter(Some(11), Some(12)), perimeter, 1e-10);
        assert_delta!(mesh.calculate_area(Some(12)), area, 1e-10);
        assert!(mesh.calculate_perimeter(Some(11), Some(12)) > 0.95 * 6.0 * std::f64::consts::PI);
        assert!(mesh.calculate_area(Some(12)) > 0.95 * 9.0 * std::f64::consts::PI);
        Ok(())
    }
}

/// Elements owned by the current rank as sorted global vertex indices, with their tag.
/// Gathered over all the ranks, this describes the whole mesh independently of the
/// partition
#[must_use]
pub fn owned_global_elems<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &Mesh<D, E, M>,
) -> Vec<(Vec<GlobalIdx>, Tag)> {
    let rank = mesh.rank();
    let mut res = mesh
        .elems()
        .zip(mesh.etags())
        .filter(|(e, _)| mesh.elem_owner(e) == rank)
        .map(|(e, t)| {
            let mut ids = e.iter().map(|&i| mesh.verts[i].gid).collect::<Vec<_>>();
            ids.sort_unstable();
            (ids, t)
        })
        .collect::<Vec<_>>();
    res.sort();
    res
}
