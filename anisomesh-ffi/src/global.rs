//! Process-wide session, for codes that drive a single adaptation at a time
//!
//! Every function returns `false` if the session is not initialized (or, for the
//! `*_init` functions, if it is already initialized) or if the operation fails.
use crate::{
    adapt, add_field, copy_to, deinterleave, dump_vtu, get_lnn2gnn, interleave, new_session,
    set_metric, vtk_session,
};
use anisomesh::session::Session;
use log::warn;
use std::{ffi::c_char, sync::Mutex};

static SESSION: Mutex<Option<Session>> = Mutex::new(None);

fn init(session: impl FnOnce() -> Option<Session>) -> bool {
    let Ok(mut current) = SESSION.lock() else {
        return false;
    };
    if current.is_some() {
        warn!("anisomesh is already initialized, anisomesh_finalize must be called first");
        return false;
    }
    *current = session();
    current.is_some()
}

fn with_session(f: impl FnOnce(&mut Session) -> bool) -> bool {
    let Ok(mut current) = SESSION.lock() else {
        return false;
    };
    current.as_mut().map_or_else(
        || {
            warn!("anisomesh is not initialized");
            false
        },
        f,
    )
}

/// @brief Initialize the session with a triangle mesh
///
/// @param enlist The triangles, 3 vertex indices each
/// @param x, y The vertex coordinates
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_2d_init(
    num_nodes: u32,
    num_elements: u32,
    enlist: *const u32,
    x: *const f64,
    y: *const f64,
) -> bool {
    init(|| unsafe {
        let verts = interleave(num_nodes, &[x, y]);
        new_session(2, num_nodes, verts.as_ptr(), num_elements, enlist)
    })
}

/// @brief Initialize the session with a tetrahedron mesh
///
/// @param enlist The tetrahedra, 4 vertex indices each
/// @param x, y, z The vertex coordinates
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_3d_init(
    num_nodes: u32,
    num_elements: u32,
    enlist: *const u32,
    x: *const f64,
    y: *const f64,
    z: *const f64,
) -> bool {
    init(|| unsafe {
        let verts = interleave(num_nodes, &[x, y, z]);
        new_session(3, num_nodes, verts.as_ptr(), num_elements, enlist)
    })
}

/// @brief Initialize the session from a .vtu file
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_vtk_init(file_name: *const c_char) -> bool {
    init(|| unsafe { vtk_session(file_name) })
}

/// @brief Add a metric computed from a field such that its interpolation error is `error`
///
/// @param psi The field value at each vertex
/// @param pnorm The norm used to measure the error, -1 for the absolute error
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_add_field(psi: *const f64, error: f64, pnorm: i32) -> bool {
    with_session(|s| unsafe { add_field(s, psi, error, pnorm) })
}

/// @brief Set the metric, 3 values per vertex in 2d and 6 in 3d
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_set_metric(metric: *const f64) -> bool {
    with_session(|s| unsafe { set_metric(s, metric) })
}

/// @brief Adapt the mesh with the default parameters
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_adapt() -> bool {
    with_session(|s| unsafe { adapt(s, std::ptr::null()) })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_get_info(num_nodes: *mut u32, num_elements: *mut u32) -> bool {
    with_session(|s| unsafe {
        let (n_verts, n_elems) = s.get_info();
        *num_nodes = n_verts as u32;
        *num_elements = n_elems as u32;
        true
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_get_coords_2d(x: *mut f64, y: *mut f64) -> bool {
    with_session(|s| unsafe {
        if s.dim() != 2 {
            warn!("anisomesh_get_coords_2d called on a {}d mesh", s.dim());
            return false;
        }
        deinterleave(&s.get_coords(), &[x, y]);
        true
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_get_coords_3d(x: *mut f64, y: *mut f64, z: *mut f64) -> bool {
    with_session(|s| unsafe {
        if s.dim() != 3 {
            warn!("anisomesh_get_coords_3d called on a {}d mesh", s.dim());
            return false;
        }
        deinterleave(&s.get_coords(), &[x, y, z]);
        true
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_get_elements(elements: *mut u32) -> bool {
    with_session(|s| unsafe {
        copy_to(&s.get_elements(), elements);
        true
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_get_lnn2gnn(
    nodes_per_partition: *mut u32,
    lnn2gnn: *mut u64,
) -> bool {
    with_session(|s| unsafe {
        get_lnn2gnn(s, nodes_per_partition, lnn2gnn);
        true
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_get_metric(metric: *mut f64) -> bool {
    with_session(|s| unsafe {
        copy_to(&s.get_metric(), metric);
        true
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_dump_vtu(file_name: *const c_char) -> bool {
    with_session(|s| unsafe { dump_vtu(s, file_name) })
}

/// @brief Release the session, so that a new one can be initialized
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_finalize() -> bool {
    let Ok(mut current) = SESSION.lock() else {
        return false;
    };
    current.take().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_session() {
        let x = [0., 1., 1., 0.];
        let y = [0., 0., 1., 1.];
        let enlist = [0, 1, 2, 0, 2, 3];
        let metric = [25., 0., 25.].repeat(4);
        unsafe {
            assert!(!anisomesh_adapt());
            assert!(!anisomesh_finalize());

            assert!(anisomesh_2d_init(4, 2, enlist.as_ptr(), x.as_ptr(), y.as_ptr()));
            // only one session at a time
            assert!(!anisomesh_2d_init(4, 2, enlist.as_ptr(), x.as_ptr(), y.as_ptr()));

            let (mut n_verts, mut n_elems) = (0, 0);
            assert!(anisomesh_get_info(&raw mut n_verts, &raw mut n_elems));
            assert_eq!((n_verts, n_elems), (4, 2));

            assert!(anisomesh_set_metric(metric.as_ptr()));
            assert!(anisomesh_adapt());
            assert!(anisomesh_get_info(&raw mut n_verts, &raw mut n_elems));
            assert!(n_elems > 2);

            let n = n_verts as usize;
            let (mut xs, mut ys, mut zs) = (vec![0.0; n], vec![0.0; n], vec![0.0; n]);
            assert!(anisomesh_get_coords_2d(xs.as_mut_ptr(), ys.as_mut_ptr()));
            assert!(!anisomesh_get_coords_3d(
                xs.as_mut_ptr(),
                ys.as_mut_ptr(),
                zs.as_mut_ptr()
            ));
            assert!(
                xs.iter()
                    .zip(ys.iter())
                    .any(|(&x, &y)| (x - 1.0).abs() < 1e-12 && (y - 1.0).abs() < 1e-12)
            );

            let mut elements = vec![0; 3 * n_elems as usize];
            assert!(anisomesh_get_elements(elements.as_mut_ptr()));
            let mut metric = vec![0.0; 3 * n];
            assert!(anisomesh_get_metric(metric.as_mut_ptr()));
            assert!(metric.chunks(3).all(|m| m[0] > 0.0 && m[2] > 0.0));

            assert!(anisomesh_finalize());
            let z = [0., 0., 0., 1.];
            assert!(anisomesh_3d_init(
                4,
                1,
                [0, 1, 2, 3].as_ptr(),
                [0., 1., 0., 0.].as_ptr(),
                [0., 0., 1., 0.].as_ptr(),
                z.as_ptr()
            ));
            assert!(anisomesh_finalize());
        }
    }
}
