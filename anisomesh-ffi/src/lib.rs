#![allow(non_camel_case_types)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::doc_markdown)]
use anisomesh::{Idx, Result, adapt::AdaptParams, session::Session};
use log::warn;
use std::ffi::{CStr, c_char};

mod global;

/// An adaptation session (2d or 3d)
pub struct anisomesh_session_t {
    implem: Session,
}

fn log_error<T>(res: Result<T>) -> Option<T> {
    res.inspect_err(|e| warn!("{e:?}")).ok()
}

unsafe fn to_str<'a>(s: *const c_char) -> Option<&'a str> {
    unsafe { log_error(CStr::from_ptr(s).to_str().map_err(Into::into)) }
}

unsafe fn copy_to<T: Copy>(src: &[T], out: *mut T) {
    unsafe {
        std::slice::from_raw_parts_mut(out, src.len()).copy_from_slice(src);
    }
}

/// Interleave coordinates given as one array per component
unsafe fn interleave(num_verts: u32, components: &[*const f64]) -> Vec<f64> {
    unsafe {
        let n = num_verts as usize;
        let components = components
            .iter()
            .map(|&c| std::slice::from_raw_parts(c, n))
            .collect::<Vec<_>>();
        (0..n)
            .flat_map(|i| components.iter().map(move |c| c[i]))
            .collect()
    }
}

/// Copy interleaved coordinates to one array per component
unsafe fn deinterleave(coords: &[f64], components: &[*mut f64]) {
    unsafe {
        let dim = components.len();
        let n = coords.len() / dim;
        for (j, &c) in components.iter().enumerate() {
            let out = std::slice::from_raw_parts_mut(c, n);
            for (i, x) in out.iter_mut().enumerate() {
                *x = coords[dim * i + j];
            }
        }
    }
}

unsafe fn new_session(
    dim: usize,
    num_verts: u32,
    verts: *const f64,
    num_elems: u32,
    elems: *const Idx,
) -> Option<Session> {
    unsafe {
        let verts = std::slice::from_raw_parts(verts, dim * num_verts as usize);
        let elems = std::slice::from_raw_parts(elems, (dim + 1) * num_elems as usize);
        let session = if dim == 2 {
            Session::init_2d(verts, elems)
        } else {
            Session::init_3d(verts, elems)
        };
        log_error(session)
    }
}

unsafe fn vtk_session(file_name: *const c_char) -> Option<Session> {
    unsafe { to_str(file_name).and_then(|f| log_error(Session::init_from_vtu(f))) }
}

unsafe fn add_field(session: &mut Session, psi: *const f64, error: f64, pnorm: i32) -> bool {
    unsafe {
        let psi = std::slice::from_raw_parts(psi, session.get_info().0);
        log_error(session.add_field(psi, error, pnorm)).is_some()
    }
}

unsafe fn set_metric(session: &mut Session, metric: *const f64) -> bool {
    unsafe {
        let n = session.metric_size() * session.get_info().0;
        let metric = std::slice::from_raw_parts(metric, n);
        log_error(session.set_metric(metric)).is_some()
    }
}

/// Adapt with the parameters given as a json string, or the default ones if `params`
/// is null
unsafe fn adapt(session: &mut Session, params: *const c_char) -> bool {
    unsafe {
        let params = if params.is_null() {
            Some(AdaptParams::default())
        } else {
            to_str(params).and_then(|p| log_error(AdaptParams::from_json(p)))
        };
        params.is_some_and(|p| log_error(session.adapt(&p)).is_some())
    }
}

unsafe fn get_lnn2gnn(session: &Session, nodes_per_partition: *mut u32, lnn2gnn: *mut u64) {
    unsafe {
        let (counts, numbering) = session.get_lnn2gnn();
        let counts = counts.iter().map(|&n| n as u32).collect::<Vec<_>>();
        copy_to(&counts, nodes_per_partition);
        copy_to(&numbering, lnn2gnn);
    }
}

unsafe fn dump_vtu(session: &Session, file_name: *const c_char) -> bool {
    unsafe { to_str(file_name).is_some_and(|f| log_error(session.dump_vtu(f)).is_some()) }
}

/// @brief Create a 2d session from a triangle mesh
///
/// @param verts The vertex coordinates (x0, y0, x1, y1, ...)
/// @param elems The triangles, 3 vertex indices each
/// @return A new session, or NULL if the mesh is invalid
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_2d_new(
    num_verts: u32,
    verts: *const f64,
    num_elems: u32,
    elems: *const u32,
) -> *mut anisomesh_session_t {
    unsafe {
        new_session(2, num_verts, verts, num_elems, elems).map_or(std::ptr::null_mut(), |implem| {
            Box::into_raw(Box::new(anisomesh_session_t { implem }))
        })
    }
}

/// @brief Create a 3d session from a tetrahedron mesh
///
/// @param verts The vertex coordinates (x0, y0, z0, x1, ...)
/// @param elems The tetrahedra, 4 vertex indices each
/// @return A new session, or NULL if the mesh is invalid
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_3d_new(
    num_verts: u32,
    verts: *const f64,
    num_elems: u32,
    elems: *const u32,
) -> *mut anisomesh_session_t {
    unsafe {
        new_session(3, num_verts, verts, num_elems, elems).map_or(std::ptr::null_mut(), |implem| {
            Box::into_raw(Box::new(anisomesh_session_t { implem }))
        })
    }
}

/// @brief Create a session from a .vtu file containing triangles or tetrahedra
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_vtk_new(
    file_name: *const c_char,
) -> *mut anisomesh_session_t {
    unsafe {
        vtk_session(file_name).map_or(std::ptr::null_mut(), |implem| {
            Box::into_raw(Box::new(anisomesh_session_t { implem }))
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_delete(s: *mut anisomesh_session_t) {
    unsafe {
        let _ = Box::from_raw(s);
    }
}

/// @brief Add a metric computed from a field such that its interpolation error is `error`
///
/// @param psi The field value at each vertex
/// @param pnorm The norm used to measure the error, -1 for the absolute error
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_add_field(
    s: *mut anisomesh_session_t,
    psi: *const f64,
    error: f64,
    pnorm: i32,
) -> bool {
    unsafe { add_field(&mut (*s).implem, psi, error, pnorm) }
}

/// @brief Set the metric, 3 values per vertex in 2d (m00, m01, m11) and 6 in 3d
/// (m00, m01, m02, m11, m12, m22)
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_set_metric(
    s: *mut anisomesh_session_t,
    metric: *const f64,
) -> bool {
    unsafe { set_metric(&mut (*s).implem, metric) }
}

/// @brief Adapt the mesh to its metric
///
/// @param params The adaptation parameters as a json string, or NULL to use the defaults
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_adapt(
    s: *mut anisomesh_session_t,
    params: *const c_char,
) -> bool {
    unsafe { adapt(&mut (*s).implem, params) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_num_verts(s: *const anisomesh_session_t) -> u32 {
    unsafe { (*s).implem.get_info().0 as u32 }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_num_elems(s: *const anisomesh_session_t) -> u32 {
    unsafe { (*s).implem.get_info().1 as u32 }
}

/// @brief Copy the vertex coordinates (2 or 3 values per vertex) to `out`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_verts(s: *const anisomesh_session_t, out: *mut f64) {
    unsafe { copy_to(&(*s).implem.get_coords(), out) }
}

/// @brief Copy the elements (3 or 4 vertex indices per element) to `out`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_elems(s: *const anisomesh_session_t, out: *mut u32) {
    unsafe { copy_to(&(*s).implem.get_elements(), out) }
}

/// @brief Copy the metric (3 or 6 values per vertex) to `out`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_metric(s: *const anisomesh_session_t, out: *mut f64) {
    unsafe { copy_to(&(*s).implem.get_metric(), out) }
}

/// @brief Get the number of vertices owned by each partition and the global index of
/// each vertex
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_lnn2gnn(
    s: *const anisomesh_session_t,
    nodes_per_partition: *mut u32,
    lnn2gnn: *mut u64,
) {
    unsafe { get_lnn2gnn(&(*s).implem, nodes_per_partition, lnn2gnn) }
}

/// @brief Write the mesh and its metric to a .vtu file
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_session_dump_vtu(
    s: *const anisomesh_session_t,
    file_name: *const c_char,
) -> bool {
    unsafe { dump_vtu(&(*s).implem, file_name) }
}

/// @brief Enable Rust logger
///
/// See <https://docs.rs/env_logger/latest/env_logger/#enabling-logging> for details
#[unsafe(no_mangle)]
pub unsafe extern "C" fn anisomesh_init_log() {
    anisomesh::init_log("warn");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_session_2d() {
        let verts = [0., 0., 1., 0., 1., 1., 0., 1.];
        let elems = [0, 1, 2, 0, 2, 3];
        let metric = [100., 0., 100.].repeat(4);
        unsafe {
            let s = anisomesh_session_2d_new(4, verts.as_ptr(), 2, elems.as_ptr());
            assert!(!s.is_null());
            assert_eq!(anisomesh_session_num_verts(s), 4);
            assert_eq!(anisomesh_session_num_elems(s), 2);

            assert!(anisomesh_session_set_metric(s, metric.as_ptr()));
            assert!(anisomesh_session_adapt(s, std::ptr::null()));

            let n_verts = anisomesh_session_num_verts(s) as usize;
            let n_elems = anisomesh_session_num_elems(s) as usize;
            assert!(n_elems > 100);
            let mut coords = vec![0.0; 2 * n_verts];
            anisomesh_session_verts(s, coords.as_mut_ptr());
            assert!(coords.iter().all(|&x| (-1e-12..=1.0 + 1e-12).contains(&x)));
            let mut elems = vec![0; 3 * n_elems];
            anisomesh_session_elems(s, elems.as_mut_ptr());
            assert!(elems.iter().all(|&i| (i as usize) < n_verts));
            let mut counts = [0];
            let mut lnn2gnn = vec![0; n_verts];
            anisomesh_session_lnn2gnn(s, counts.as_mut_ptr(), lnn2gnn.as_mut_ptr());
            assert_eq!(counts[0] as usize, n_verts);

            anisomesh_session_delete(s);
        }
    }

    #[test]
    fn test_session_errors() {
        let verts = [0., 0., 1., 0., 2., 0.];
        unsafe {
            // zero area triangle
            let s = anisomesh_session_2d_new(3, verts.as_ptr(), 1, [0, 1, 2].as_ptr());
            assert!(s.is_null());

            let verts = [0., 0., 1., 0., 0., 1.];
            let s = anisomesh_session_2d_new(3, verts.as_ptr(), 1, [0, 1, 2].as_ptr());
            assert!(!s.is_null());
            let params = CString::new(r#"{"alpha": 2.0}"#).unwrap();
            assert!(!anisomesh_session_adapt(s, params.as_ptr()));
            let params = CString::new(r#"{"max_iter": 2}"#).unwrap();
            assert!(anisomesh_session_adapt(s, params.as_ptr()));
            anisomesh_session_delete(s);

            let fname = CString::new("/nonexistent/mesh.vtu").unwrap();
            assert!(anisomesh_session_vtk_new(fname.as_ptr()).is_null());
        }
    }
}
