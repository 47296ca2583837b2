//! Anisotropic metric-based adaptation of simplex meshes in 2D and 3D
use core::fmt;
use env_logger::Env;

pub mod adapt;
pub mod mesh;
pub mod metric;
pub mod parallel;
pub mod remesher;
pub mod session;
pub mod stats;

/// Local index of vertices and elements
pub type Idx = u32;
/// Rank of a partition
pub type Rank = usize;
/// Global index of a vertex, shared by all the partitions
pub type GlobalIdx = u64;

#[cfg(all(feature = "32bit-tags", feature = "64bit-tags"))]
compile_error!("features `32bit-tags` and `64bit-tags` are mutually exclusive");
#[cfg(feature = "64bit-tags")]
/// Tag used for elements and faces
pub type Tag = i64;
#[cfg(feature = "32bit-tags")]
/// Tag used for elements and faces
pub type Tag = i32;
#[cfg(not(any(feature = "32bit-tags", feature = "64bit-tags")))]
/// Tag used for elements and faces
pub type Tag = i16;

/// Result
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Error
#[derive(Debug)]
pub struct Error(String);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Set the error message
    #[must_use]
    pub fn from(msg: &str) -> Box<Self> {
        Box::new(Self(msg.into()))
    }
}

/// Bounds on the metric eigenvalues
pub const S_MIN: f64 = 1e-8;
pub const S_MAX: f64 = 1e10;
/// Maximum ratio between the metric eigenvalues
pub const S_RATIO_MAX: f64 = 1e6;

/// Initialize the logger, with `level` used unless `RUST_LOG` is set
pub fn init_log(level: &str) {
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

pub fn min_iter<I: Iterator<Item = f64>>(iter: I) -> f64 {
    iter.fold(f64::INFINITY, f64::min)
}

pub fn max_iter<I: Iterator<Item = f64>>(iter: I) -> f64 {
    iter.fold(f64::NEG_INFINITY, f64::max)
}

/// Assert that two floating point values are closer than a tolerance
#[macro_export]
macro_rules! assert_delta {
    ($x:expr, $y:expr, $d:expr) => {
        assert!(
            ($x - $y).abs() < $d,
            "({:.3e} - {:.3e}).abs() = {:.3e}",
            $x,
            $y,
            ($x - $y).abs()
        )
    };
}
