//! Local mesh modification operators
//!
//! All the operators work on cavities, i.e. sets of elements around a vertex, an
//! edge or a face, that are reconstructed from a single vertex. A reconstruction is
//! only applied if it gives valid elements and does not modify the region volumes
//! and the tagged faces.
mod cavity;
mod coarsen;
mod refine;
mod smooth;
mod swap;

pub use coarsen::CoarsenParams;
pub use refine::RefineParams;
pub use smooth::{SmoothParams, SmoothingMethod};
pub use swap::SwapParams;
