use super::{Metric, reduction::simultaneous_reduction};
use crate::{Error, Result, S_MAX, S_MIN, S_RATIO_MAX, mesh::Point};
use nalgebra::{Const, DefaultAllocator, DimSub, SMatrix, SVector, ToTypenum, U1, allocator::Allocator};
use std::{array::IntoIter, fmt, ops::Index};

/// Anisotropic metric: a symmetric positive definite `D x D` matrix stored as its
/// `N = D (D + 1) / 2` upper coefficients, row by row, along with its volume
/// $`1 / \sqrt{\det \mathcal M}`$
#[derive(Clone, Copy, Debug)]
pub struct SymMetric<const D: usize, const N: usize> {
    m: [f64; N],
    vol: f64,
}

/// Stored as $`(m_{00}, m_{01}, m_{11})`$
pub type AnisoMetric2d = SymMetric<2, 3>;

/// Stored as $`(m_{00}, m_{01}, m_{02}, m_{11}, m_{12}, m_{22})`$
pub type AnisoMetric3d = SymMetric<3, 6>;

/// Position of entry `(i, j)` in the packed upper storage of a `d x d` matrix
const fn packed(d: usize, i: usize, j: usize) -> usize {
    let (i, j) = if i <= j { (i, j) } else { (j, i) };
    i * d - i * i.saturating_sub(1) / 2 + j - i
}

impl<const D: usize, const N: usize> SymMetric<D, N> {
    fn from_mat_and_vol(mat: &SMatrix<f64, D, D>, vol: f64) -> Self {
        let mut m = [0.0; N];
        for i in 0..D {
            for j in i..D {
                m[packed(D, i, j)] = mat[(i, j)];
            }
        }
        Self { m, vol }
    }

    fn mat_from_packed(m: &[f64]) -> SMatrix<f64, D, D> {
        SMatrix::from_fn(|i, j| m[packed(D, i, j)])
    }

    fn zero_mat() -> SMatrix<f64, D, D> {
        SMatrix::zeros()
    }

    #[must_use]
    pub fn as_mat(&self) -> SMatrix<f64, D, D> {
        SMatrix::from_fn(|i, j| self.m[packed(D, i, j)])
    }

    /// Clamp the eigenvalues to `[S_MIN, S_MAX]` and the ratio between the largest and
    /// the smallest to `S_RATIO_MAX`
    pub fn bound_eigenvalues(eigs: &mut SVector<f64, D>) {
        let s_max = eigs.iter().fold(S_MIN, |a, &s| a.max(s.min(S_MAX)));
        let s_min = S_MIN.max(s_max / S_RATIO_MAX);
        eigs.iter_mut().for_each(|s| *s = s.clamp(s_min, s_max));
    }

    /// $`Q \Lambda Q^T`$ with bounded eigenvalues
    fn from_eigen(q: &SMatrix<f64, D, D>, mut eigs: SVector<f64, D>) -> Self {
        Self::bound_eigenvalues(&mut eigs);
        let vol = 1.0 / eigs.iter().product::<f64>().sqrt();
        Self::from_mat_and_vol(&(q * SMatrix::from_diagonal(&eigs) * q.transpose()), vol)
    }

    #[must_use]
    pub fn from_diagonal(s: &[f64; D]) -> Self {
        let vol = 1.0 / s.iter().product::<f64>().sqrt();
        Self::from_mat_and_vol(&SMatrix::from_diagonal(&SVector::from(*s)), vol)
    }

    /// Isotropic metric for size `h`
    #[must_use]
    pub fn from_size(h: f64) -> Self {
        Self::from_diagonal(&[h.powi(-2); D])
    }

    /// Metric whose unit ball is the ellipsoid with (orthogonal) half axes `axes`
    #[must_use]
    pub fn from_axes(axes: &[Point<D>; D]) -> Self {
        let q = SMatrix::<f64, D, D>::from_fn(|i, j| axes[j][i] / axes[j].norm());
        debug_assert!((0..D).all(|i| {
            ((i + 1)..D).all(|j| q.column(i).dot(&q.column(j)).abs() < 1e-10)
        }));
        let eigs = SVector::<f64, D>::from_fn(|i, _| axes[i].norm_squared().recip());
        Self::from_eigen(&q, eigs)
    }

    fn is_diagonal(&self, tol: f64) -> bool {
        let (mut diag, mut off_diag) = (0.0, 0.0);
        for i in 0..D {
            diag += self.m[packed(D, i, i)].abs();
            for j in (i + 1)..D {
                off_diag += self.m[packed(D, i, j)].abs();
            }
        }
        off_diag < 1e10 * f64::MIN_POSITIVE || off_diag < tol * diag
    }

    fn is_near_zero(&self, tol: f64) -> bool {
        self.m.iter().map(|x| x.abs()).sum::<f64>() < tol
    }
}

impl<const D: usize, const N: usize> SymMetric<D, N>
where
    Const<D>: ToTypenum + DimSub<U1>,
    DefaultAllocator: Allocator<<Const<D> as DimSub<U1>>::Output>,
{
    /// $`|M|`$, with bounded eigenvalues
    #[must_use]
    pub fn from_mat(mat: SMatrix<f64, D, D>) -> Self {
        let eig = mat.symmetric_eigen();
        Self::from_eigen(&eig.eigenvectors, eig.eigenvalues.abs())
    }
}

impl AnisoMetric2d {
    /// Metric with characteristic sizes `|s0|` and `|s1|` along the orthogonal
    /// directions `s0` and `s1`
    #[must_use]
    pub fn from_sizes(s0: &Point<2>, s1: &Point<2>) -> Self {
        Self::from_axes(&[*s0, *s1])
    }
}

impl AnisoMetric3d {
    #[must_use]
    pub fn from_sizes(s0: &Point<3>, s1: &Point<3>, s2: &Point<3>) -> Self {
        Self::from_axes(&[*s0, *s1, *s2])
    }
}

impl<const D: usize, const N: usize> Default for SymMetric<D, N> {
    fn default() -> Self {
        Self::from_diagonal(&[S_MIN; D])
    }
}

impl<const D: usize, const N: usize> Metric<D> for SymMetric<D, N>
where
    Const<D>: ToTypenum + DimSub<U1>,
    DefaultAllocator: Allocator<<Const<D> as DimSub<U1>>::Output>,
{
    const N: usize = N;

    fn from_slice(m: &[f64]) -> Self {
        Self::from_mat(Self::mat_from_packed(m))
    }

    fn as_slice(&self) -> &[f64] {
        &self.m
    }

    fn from_raw(m: &[f64], vol: f64) -> Self {
        let mut res = Self { m: [0.0; N], vol };
        res.m.copy_from_slice(&m[..N]);
        res
    }

    fn is_spd(m: &[f64]) -> bool {
        m.iter().all(|x| x.is_finite())
            && Self::mat_from_packed(m)
                .symmetric_eigenvalues()
                .iter()
                .all(|&s| s > 0.0)
    }

    fn from_sym_mat(mat: &SMatrix<f64, D, D>) -> Self {
        Self::from_mat(*mat)
    }

    fn length_sqr(&self, e: &Point<D>) -> f64 {
        let mut res = 0.0;
        for i in 0..D {
            res += self.m[packed(D, i, i)] * e[i] * e[i];
            for j in (i + 1)..D {
                res += 2.0 * self.m[packed(D, i, j)] * e[i] * e[j];
            }
        }
        res
    }

    fn length(&self, e: &Point<D>) -> f64 {
        self.length_sqr(e).sqrt()
    }

    fn vol(&self) -> f64 {
        self.vol
    }

    fn check(&self) -> Result<()> {
        const EPS: f64 = 1e-8;
        if !self.m.iter().all(|x| x.is_finite()) {
            return Err(Error::from("non finite metric"));
        }
        let eigs = self.as_mat().symmetric_eigenvalues();
        let s_min = eigs.min();
        let s_max = eigs.max();
        if s_min < (1.0 - EPS) * S_MIN {
            return Err(Error::from(&format!("eigenvalue {s_min:.2e} below {S_MIN:.0e}")));
        }
        if s_max > (1.0 + EPS) * S_MAX {
            return Err(Error::from(&format!("eigenvalue {s_max:.2e} above {S_MAX:.0e}")));
        }
        if s_max > (1.0 + EPS) * S_RATIO_MAX * s_min {
            return Err(Error::from(&format!(
                "anisotropy ratio {:.2e} above {S_RATIO_MAX:.0e}",
                s_max / s_min
            )));
        }
        Ok(())
    }

    /// Log-Euclidean interpolation
    /// ```math
    /// \mathcal M = \exp\left(\sum_i w_i \ln \mathcal M_i\right)
    /// ```
    fn interpolate<'a, I: Iterator<Item = (f64, &'a Self)>>(weights_and_metrics: I) -> Self
    where
        Self: 'a,
    {
        let mut log_sum = Self::zero_mat();
        for (w, m) in weights_and_metrics {
            let eig = m.as_mat().symmetric_eigen();
            let logs = eig.eigenvalues.map(|s| w * s.max(S_MIN).ln());
            log_sum += eig.eigenvectors * SMatrix::from_diagonal(&logs) * eig.eigenvectors.transpose();
        }
        let eig = log_sum.symmetric_eigen();
        Self::from_eigen(&eig.eigenvectors, eig.eigenvalues.map(f64::exp))
    }

    fn sizes(&self) -> [f64; D] {
        let eigs = self.as_mat().symmetric_eigenvalues();
        let mut res: [f64; D] = std::array::from_fn(|i| eigs[i].max(S_MIN).sqrt().recip());
        res.sort_by(f64::total_cmp);
        res
    }

    fn scale(&mut self, s: f64) {
        self.m.iter_mut().for_each(|x| *x *= s);
        self.vol /= s.powf(0.5 * D as f64);
    }

    /// Diagonal metrics are intersected entry by entry, the other ones by simultaneous
    /// reduction
    fn intersect(&self, other: &Self) -> Self {
        if self.is_near_zero(1e-16) {
            return *other;
        }
        if other.is_near_zero(1e-16) {
            return *self;
        }
        if self.is_diagonal(1e-8) && other.is_diagonal(1e-8) {
            let diag = std::array::from_fn(|i| {
                let k = packed(D, i, i);
                self.m[k].max(other.m[k])
            });
            return Self::from_diagonal(&diag);
        }
        let (mat, det) = simultaneous_reduction(self.as_mat(), other.as_mat());
        Self::from_mat_and_vol(&mat, 1.0 / det.sqrt())
    }

    /// Physical space gradation: the size along each principal direction grows by
    /// $`1 + h^{-1} |e| \ln \beta`$
    fn span(&self, e: &Point<D>, beta: f64) -> Self {
        let growth = e.norm() * beta.ln();
        let eig = self.as_mat().symmetric_eigen();
        let eigs = eig.eigenvalues.map(|s| s / (1.0 + s.sqrt() * growth).powi(2));
        Self::from_eigen(&eig.eigenvectors, eigs)
    }
}

impl<const D: usize, const N: usize> fmt::Display for SymMetric<D, N>
where
    Const<D>: ToTypenum + DimSub<U1>,
    DefaultAllocator: Allocator<<Const<D> as DimSub<U1>>::Output>,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "m = {:?}, vol = {:.3e}", self.m, self.vol)?;
        let eig = self.as_mat().symmetric_eigen();
        for (i, s) in eig.eigenvalues.iter().enumerate() {
            let dir = eig.eigenvectors.column(i).iter().copied().collect::<Vec<_>>();
            writeln!(f, "  h = {:.3e} along {dir:?}", s.sqrt().recip())?;
        }
        Ok(())
    }
}

impl<const D: usize, const N: usize> IntoIterator for SymMetric<D, N> {
    type Item = f64;
    type IntoIter = IntoIter<f64, N>;

    fn into_iter(self) -> Self::IntoIter {
        self.m.into_iter()
    }
}

impl<const D: usize, const N: usize> Index<usize> for SymMetric<D, N> {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.m[index]
    }
}

#[cfg(test)]
mod tests {
    use super::{AnisoMetric2d, AnisoMetric3d, Metric, packed};
    use crate::{Result, S_MIN, S_RATIO_MAX, assert_delta, mesh::Point};
    use nalgebra::SMatrix;

    #[test]
    fn test_packed_layout() {
        let upper_2d = [(0, 0), (0, 1), (1, 1)];
        for (k, (i, j)) in upper_2d.into_iter().enumerate() {
            assert_eq!(packed(2, i, j), k);
        }
        let upper_3d = [(0, 0), (0, 1), (0, 2), (1, 1), (1, 2), (2, 2)];
        for (k, (i, j)) in upper_3d.into_iter().enumerate() {
            assert_eq!(packed(3, i, j), k);
            assert_eq!(packed(3, j, i), k);
        }

        let values = [3., 1., 0.5, 4., 0.2, 5.];
        let m = AnisoMetric3d::from_slice(&values);
        for (&x, y) in m.as_slice().iter().zip(values) {
            assert_delta!(x, y, 1e-12);
        }
        assert_delta!(m.as_mat()[(2, 1)], 0.2, 1e-12);
    }

    #[test]
    fn test_aniso_2d() -> Result<()> {
        let m = AnisoMetric2d::from_sizes(&Point::<2>::new(1.0, 0.), &Point::<2>::new(0., 0.1));
        m.check()?;
        assert_delta!(m.vol(), 0.1, 1e-12);

        for (e, l) in [((1.0, 0.0), 1.0), ((0.0, 1.0), 10.0), ((1.0, 1.0), 101_f64.sqrt())] {
            assert_delta!(m.length(&Point::<2>::new(e.0, e.1)), l, 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_aniso_3d() -> Result<()> {
        let m = AnisoMetric3d::from_sizes(
            &Point::<3>::new(1.0, 0., 0.),
            &Point::<3>::new(0., 0.1, 0.),
            &Point::<3>::new(0., 0., 0.01),
        );
        m.check()?;
        assert_delta!(m.vol(), 0.001, 1e-12);
        assert_delta!(m.length(&Point::<3>::new(0.0, 0.0, 1.0)), 100.0, 1e-12);
        assert_delta!(m.length(&Point::<3>::new(1.0, 1.0, 1.0)), 10101_f64.sqrt(), 1e-12);

        let s = m.sizes();
        assert_delta!(s[0], 0.01, 1e-12);
        assert_delta!(s[1], 0.1, 1e-12);
        assert_delta!(s[2], 1.0, 1e-12);
        Ok(())
    }

    #[test]
    fn test_from_slice_takes_abs() -> Result<()> {
        // eigenvalues 3 and -1
        let m = AnisoMetric2d::from_slice(&[1., 2., 1.]);
        m.check()?;
        assert_delta!(m.vol(), 1.0 / 3_f64.sqrt(), 1e-12);
        assert!(!AnisoMetric2d::is_spd(&[1., 2., 1.]));
        assert!(!AnisoMetric2d::is_spd(&[1., f64::NAN, 1.]));
        assert!(AnisoMetric2d::is_spd(&[2., 1., 2.]));

        let m = AnisoMetric3d::from_slice(&[1., 2., 3., 3., 4., 6.]);
        m.check()?;
        assert_delta!(m.vol(), 1.0, 1e-12);
        Ok(())
    }

    #[test]
    fn test_bounds() -> Result<()> {
        let m = AnisoMetric2d::from_slice(&[1.0, 0.0, 10.0 * S_RATIO_MAX]);
        m.check()?;
        assert_delta!(m[0], 10.0, 1e-12);

        let m = AnisoMetric3d::from_slice(&[1.0, 0.0, 0.0, 2.0, 0.0, 10.0 * S_RATIO_MAX]);
        m.check()?;
        assert_delta!(m[0], 10.0, 1e-12);
        assert_delta!(m[3], 10.0, 1e-12);

        let m = AnisoMetric2d::from_diagonal(&[0.1 * S_MIN, 1.0]);
        assert!(m.check().is_err());
        let m = AnisoMetric2d::from_diagonal(&[1.0, 10.0 * S_RATIO_MAX]);
        assert!(m.check().is_err());
        Ok(())
    }

    #[test]
    fn test_scale() {
        let mut m = AnisoMetric3d::from_size(0.1);
        m.scale(4.0);
        assert_delta!(m.sizes()[0], 0.05, 1e-12);
        assert_delta!(m.vol(), 0.05f64.powi(3), 1e-12);
    }

    #[test]
    fn test_interpolate_iso() {
        let m0 = AnisoMetric2d::from_size(0.1);
        let m1 = AnisoMetric2d::from_size(0.4);
        let m = AnisoMetric2d::interpolate([(0.5, &m0), (0.5, &m1)].into_iter());
        // geometric mean of the sizes
        for s in m.sizes() {
            assert_delta!(s, 0.2, 1e-12);
        }
        assert_delta!(m.vol(), 0.04, 1e-12);
    }

    #[test]
    fn test_intersect() {
        let eps = 1e-8;
        for _ in 0..100 {
            let (r0, r1) = (SMatrix::<f64, 2, 2>::new_random(), SMatrix::<f64, 2, 2>::new_random());
            let m0 = AnisoMetric2d::from_mat(r0.transpose() * r0);
            let m1 = AnisoMetric2d::from_mat(r1.transpose() * r1);
            let m = m0.intersect(&m1);
            for _ in 0..100 {
                let v = Point::<2>::new_random().normalize();
                assert!(m.length(&v) > (1.0 - eps) * m0.length(&v).max(m1.length(&v)));
            }

            let (r0, r1) = (SMatrix::<f64, 3, 3>::new_random(), SMatrix::<f64, 3, 3>::new_random());
            let m0 = AnisoMetric3d::from_mat(r0.transpose() * r0);
            let m1 = AnisoMetric3d::from_mat(r1.transpose() * r1);
            let m = m0.intersect(&m1);
            for _ in 0..100 {
                let v = Point::<3>::new_random().normalize();
                assert!(m.length(&v) > (1.0 - eps) * m0.length(&v).max(m1.length(&v)));
            }
        }
    }

    #[test]
    fn test_intersect_diagonal() {
        let m0 = AnisoMetric3d::from_diagonal(&[1.0, 4.0, 2.0]);
        let m1 = AnisoMetric3d::from_diagonal(&[3.0, 1.0, 2.0]);
        let m = m0.intersect(&m1);
        for (&x, y) in m.as_slice().iter().zip([3.0, 0.0, 0.0, 4.0, 0.0, 2.0]) {
            assert_delta!(x, y, 1e-12);
        }
        assert_delta!(m.vol(), 1.0 / 24_f64.sqrt(), 1e-12);
    }

    #[test]
    fn test_span() {
        let m = AnisoMetric2d::from_sizes(&Point::<2>::new(1.0, 0.), &Point::<2>::new(0., 0.1));
        for (e, beta, h) in [
            ((1.0, 0.0), 1.2, 1.18),
            ((1.0, 0.0), 2.0, 1.69),
            ((0.0, 0.1), 1.2, 1.18),
            ((0.0, 0.2), 2.0, 1.19),
        ] {
            let e = Point::<2>::new(e.0, e.1);
            assert!((1. / m.span(&e, beta).length(&e) - h).abs() < 0.01);
        }

        let m = AnisoMetric3d::from_sizes(
            &Point::<3>::new(1.0, 0.0, 0.0),
            &Point::<3>::new(0.0, 0.1, 0.0),
            &Point::<3>::new(0.0, 0.0, 0.01),
        );
        let e = Point::<3>::new(0.0, 0.0, 0.01);
        assert!((1. / m.span(&e, 1.2).length(&e) - 1.18).abs() < 0.01);
        let e = Point::<3>::new(0.0, 0.2, 0.0);
        assert!((1. / m.span(&e, 1.2).length(&e) - 0.68).abs() < 0.01);
    }
}
