use nalgebra::allocator::Allocator;
use nalgebra::{Const, DefaultAllocator, SMatrix};

/// Compute the simultaneous reduction of two metric tensors
///
/// With the Cholesky factorization $`\mathcal M_0 = L L^T`$, let
/// $`C = L^{-1} \mathcal M_1 L^{-T} = Q \Lambda Q^T`$. The columns of $`L^{-T} Q`$ are the
/// generalized eigenvectors of $`(\mathcal M_1, \mathcal M_0)`$ and both metrics are
/// diagonal in this basis, with diagonals $`1`$ and $`\Lambda`$. The intersection is then
/// ```math
/// \mathcal M_0 \cap \mathcal M_1 = L Q \max(1, \Lambda) Q^T L^T
/// ```
///
/// The determinant of the intersection is also returned
pub fn simultaneous_reduction<const D: usize>(
    mat_a: SMatrix<f64, D, D>,
    mat_b: SMatrix<f64, D, D>,
) -> (SMatrix<f64, D, D>, f64)
where
    Const<D>: nalgebra::ToTypenum + nalgebra::DimSub<nalgebra::U1>,
    DefaultAllocator: Allocator<<Const<D> as nalgebra::DimSub<nalgebra::U1>>::Output>,
{
    let Some(chol) = mat_a.cholesky() else {
        return (mat_b, mat_b.symmetric_eigenvalues().product());
    };
    let l = chol.l();
    let Some(l_inv) = l.try_inverse() else {
        return (mat_b, mat_b.symmetric_eigenvalues().product());
    };

    let c = l_inv * mat_b * l_inv.transpose();
    let c = 0.5 * (c + c.transpose());
    let mut eig = c.symmetric_eigen();
    eig.eigenvalues.iter_mut().for_each(|s| *s = s.max(1.0));
    // det(L L^T) from the Cholesky factor
    let det_a = l.diagonal().product().powi(2);
    let det = det_a * eig.eigenvalues.product();

    let res = l * eig.recompose() * l.transpose();
    (0.5 * (res + res.transpose()), det)
}
