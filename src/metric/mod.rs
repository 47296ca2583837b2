mod aniso;
mod field;
mod gradation;
mod hessian;
mod reduction;

use crate::{Result, mesh::GElem, mesh::Point};
pub use aniso::{AnisoMetric2d, AnisoMetric3d, SymMetric};
pub use field::MetricField;
pub use gradation::edge_gradation;
use nalgebra::SMatrix;
use std::fmt::{Debug, Display};

/// Max. metric gradation enforced when a metric is stored on a mesh
pub const DEFAULT_GRADATION: f64 = 1.5;

/// Riemannian metric attached to a mesh vertex. Lengths, volumes and element qualities
/// are all measured through it.
pub trait Metric<const D: usize>:
    Debug + Clone + Copy + IntoIterator<Item = f64> + Default + Display + Send + Sync
{
    /// Number of stored scalars
    const N: usize;

    /// From the upper part of the matrix, row by row. The absolute value of the matrix is
    /// taken and its eigenvalues are bounded.
    fn from_slice(m: &[f64]) -> Self;
    fn as_slice(&self) -> &[f64];
    /// Rebuild a metric from the values of `as_slice` and `vol`, as is
    fn from_raw(m: &[f64], vol: f64) -> Self;
    /// Whether `m` (same layout as `from_slice`) is symmetric positive definite
    fn is_spd(m: &[f64]) -> bool;
    fn from_sym_mat(mat: &SMatrix<f64, D, D>) -> Self;
    /// Error if the eigenvalues or the anisotropy ratio are out of bounds
    fn check(&self) -> Result<()>;
    fn length_sqr(&self, e: &Point<D>) -> f64;
    fn length(&self, e: &Point<D>) -> f64;
    /// Volume of the unit ball, up to a constant
    fn vol(&self) -> f64;
    fn interpolate<'a, I: Iterator<Item = (f64, &'a Self)>>(weights_and_metrics: I) -> Self
    where
        Self: 'a;
    /// Sizes along the principal directions, smallest first
    fn sizes(&self) -> [f64; D];
    fn scale(&mut self, s: f64);
    /// Largest metric whose unit ball is included in the unit balls of `self` and `other`
    #[must_use]
    fn intersect(&self, other: &Self) -> Self;
    /// Metric at a distance `e`, such that sizes grow at most by a factor `beta` per unit
    /// length
    #[must_use]
    fn span(&self, e: &Point<D>, beta: f64) -> Self;

    /// Length of `[p0, p1]`, the sizes varying geometrically from the ones of `m0` to the
    /// ones of `m1`. With $`l_i = \sqrt{e^T \mathcal M_i e}`$ this gives
    /// ```math
    /// l = \frac{l_0 - l_1}{\ln(l_0 / l_1)}
    /// ```
    fn edge_length(p0: &Point<D>, m0: &Self, p1: &Point<D>, m1: &Self) -> f64 {
        let e = p1 - p0;
        let (l0, l1) = (m0.length(&e), m1.length(&e));
        let r = l0 / l1;
        if (r - 1.0).abs() < 0.01 {
            0.5 * (l0 + l1)
        } else {
            (l0 - l1) / r.ln()
        }
    }

    /// Metric with the smallest volume, the first one on ties
    fn min_metric(metrics: impl IntoIterator<Item = Self>) -> Self {
        metrics
            .into_iter()
            .min_by(|a, b| a.vol().total_cmp(&b.vol()))
            .unwrap_or_default()
    }

    /// Quality of element $`K`$, measured with the smallest of its vertex metrics
    /// ```math
    /// q(K) = \frac{|K|_{\mathcal M}}{|K^*|} \left(\frac{n_e}{\sum_e l_{\mathcal M}(e)^2}\right)^{D/2}
    /// ```
    /// where $`|K^*|`$ is the volume of the unit equilateral element and $`n_e`$ the number
    /// of edges, so that $`q = 1`$ for unit equilateral elements. Returns -1 if $`K`$ is
    /// not positive.
    fn quality<G: GElem<D>>(ge: &G, metrics: impl IntoIterator<Item = Self>) -> f64 {
        let vol = ge.vol();
        if vol <= 0.0 {
            return -1.0;
        }
        let m = Self::min_metric(metrics);
        let vol_m = vol / m.vol();
        let mean_l2 = ge.edges().map(|e| m.length_sqr(&e)).sum::<f64>() / G::N_EDGES as f64;
        vol_m / G::IDEAL_VOL / mean_l2.powf(0.5 * D as f64)
    }
}
