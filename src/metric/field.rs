use super::{DEFAULT_GRADATION, Metric, gradation::apply_gradation, hessian::compute_hessians};
use crate::{
    Error, Idx, Result,
    mesh::{Elem, Mesh},
};
use log::{debug, warn};

/// Target metric attached to the vertices of a mesh, before it is stored on the mesh
///
/// The field is indexed by vertex slot, so it is invalidated as soon as the mesh
/// vertices change (it must then be rebuilt with `MetricField::new`).
#[derive(Clone, Debug)]
pub struct MetricField<const D: usize, M: Metric<D>> {
    metric: Vec<Option<M>>,
    /// Max. gradation applied by `update_mesh`
    gradation: f64,
}

impl<const D: usize, M: Metric<D>> MetricField<D, M> {
    /// Create a field for `mesh`, with the metric undefined at every vertex
    #[must_use]
    pub fn new<E: Elem>(mesh: &Mesh<D, E, M>) -> Self {
        Self {
            metric: vec![None; mesh.n_vert_slots()],
            gradation: DEFAULT_GRADATION,
        }
    }

    #[must_use]
    pub const fn gradation(&self) -> f64 {
        self.gradation
    }

    /// Set the max. gradation applied when the metric is stored on the mesh
    pub fn set_gradation(&mut self, beta: f64) -> Result<()> {
        if beta.is_nan() || beta <= 1.0 {
            return Err(Error::from(&format!("Invalid gradation: {beta}")));
        }
        self.gradation = beta;
        Ok(())
    }

    /// Number of vertex slots
    #[must_use]
    pub fn len(&self) -> usize {
        self.metric.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metric.is_empty()
    }

    /// Get the metric at vertex `i`, if defined
    #[must_use]
    pub fn metric(&self, i: Idx) -> Option<&M> {
        self.metric.get(i as usize).and_then(Option::as_ref)
    }

    /// Set the metric at vertex `i`
    pub fn set_metric(&mut self, i: Idx, m: M) -> Result<()> {
        let Some(v) = self.metric.get_mut(i as usize) else {
            return Err(Error::from(&format!("Invalid vertex index {i}")));
        };
        *v = Some(m);
        Ok(())
    }

    /// Set the metric at vertex `i` from its upper part, stored row by row.
    /// Non SPD values are reported and made valid
    pub fn set_metric_from_slice(&mut self, i: Idx, m: &[f64]) -> Result<()> {
        if m.len() != M::N {
            return Err(Error::from(&format!(
                "Invalid metric size {} (expected {})",
                m.len(),
                M::N
            )));
        }
        if !M::is_spd(m) {
            warn!("Metric at vertex {i} is not SPD: {m:?}");
        }
        self.set_metric(i, M::from_slice(m))
    }

    /// Set the metric at every vertex slot from a flat buffer.
    /// Non SPD values are reported and made valid
    pub fn alloc_metric(&mut self, buffer: &[f64]) -> Result<()> {
        if buffer.len() != M::N * self.metric.len() {
            return Err(Error::from(&format!(
                "Invalid metric buffer size {} (expected {})",
                buffer.len(),
                M::N * self.metric.len()
            )));
        }

        let mut n_invalid = 0;
        for (m, v) in buffer.chunks(M::N).zip(self.metric.iter_mut()) {
            if !M::is_spd(m) {
                n_invalid += 1;
            }
            *v = Some(M::from_slice(m));
        }
        if n_invalid > 0 {
            warn!("{n_invalid} metrics are not SPD, their eigenvalues have been clamped");
        }
        Ok(())
    }

    /// Get the metric at every vertex slot as a flat buffer
    pub fn get_metric(&self) -> Result<Vec<f64>> {
        let mut res = Vec::with_capacity(M::N * self.metric.len());
        for (i, m) in self.metric.iter().enumerate() {
            let Some(m) = m else {
                return Err(Error::from(&format!("Undefined metric at vertex {i}")));
            };
            res.extend_from_slice(m.as_slice());
        }
        Ok(res)
    }

    /// Add a metric computed from the hessian of a scalar field `psi` such that the
    /// interpolation error is `target_error`
    ///  - if `pnorm == -1`, $`\mathcal M = |H| / \epsilon`$,
    ///  - if `pnorm >= 1`, $`\mathcal M = \det(|H|)^{-1/(2p+d)} |H| / \epsilon`$.
    ///
    /// If a metric is already defined, the intersection is used
    pub fn add_field<E: Elem>(
        &mut self,
        mesh: &Mesh<D, E, M>,
        psi: &[f64],
        target_error: f64,
        pnorm: i32,
    ) -> Result<()> {
        self.check_size(mesh)?;
        if target_error <= 0.0 {
            return Err(Error::from("The target error must be > 0"));
        }
        if pnorm != -1 && pnorm < 1 {
            return Err(Error::from(&format!("Invalid p-norm {pnorm}")));
        }
        debug!("Add a metric field (error = {target_error:.2e}, pnorm = {pnorm})");

        let hessians = compute_hessians(mesh, psi)?;
        for i in mesh.vert_ids() {
            let h = hessians[i as usize];
            let m = if pnorm == -1 {
                M::from_sym_mat(&(h / target_error))
            } else {
                // det(|H|) = 1 / vol(|H|)^2
                let vol = M::from_sym_mat(&h).vol();
                let det = 1.0 / (vol * vol);
                let s = det.powf(-1.0 / f64::from(2 * pnorm + D as i32)) / target_error;
                M::from_sym_mat(&(h * s))
            };
            let slot = &mut self.metric[i as usize];
            *slot = Some(slot.map_or(m, |other| other.intersect(&m)));
        }

        Ok(())
    }

    /// Limit the metric variation along the mesh edges to `beta`
    pub fn apply_gradation<E: Elem>(&mut self, mesh: &Mesh<D, E, M>, beta: f64) -> Result<usize> {
        if beta.is_nan() || beta <= 1.0 {
            return Err(Error::from("The gradation must be > 1"));
        }
        let mut metric = self.defined(mesh)?;
        let n = apply_gradation(mesh, &mut metric, beta, 10);
        for i in mesh.vert_ids() {
            self.metric[i as usize] = Some(metric[i as usize]);
        }
        Ok(n)
    }

    /// Store the metric on the mesh, after limiting its gradation to `self.gradation()`;
    /// the cached edge lengths and element qualities are updated
    pub fn update_mesh<E: Elem>(&mut self, mesh: &mut Mesh<D, E, M>) -> Result<()> {
        self.apply_gradation(mesh, self.gradation)?;
        let metric = self.defined(mesh)?;
        mesh.set_metrics(&metric)?;
        mesh.print_stats();
        Ok(())
    }

    /// Store on the mesh a blend of the metric implied by the mesh and the target
    /// metric: $`\mathcal M = \mathcal M_{mesh}^{1 - \alpha} \mathcal M_{target}^\alpha`$
    /// in the log-Euclidean sense. `alpha = 1` uses the target metric only
    pub fn relax_mesh<E: Elem>(&self, mesh: &mut Mesh<D, E, M>, alpha: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::from(&format!("Invalid relaxation factor {alpha}")));
        }
        let target = self.defined(mesh)?;
        let implied = mesh.implied_metric();
        let metric = target
            .iter()
            .zip(implied.iter())
            .map(|(m_t, m_i)| M::interpolate([(1.0 - alpha, m_i), (alpha, m_t)].into_iter()))
            .collect::<Vec<_>>();
        mesh.set_metrics(&metric)
    }

    fn check_size<E: Elem>(&self, mesh: &Mesh<D, E, M>) -> Result<()> {
        if self.metric.len() != mesh.n_vert_slots() {
            return Err(Error::from(&format!(
                "The metric field has {} vertices but the mesh has {}",
                self.metric.len(),
                mesh.n_vert_slots()
            )));
        }
        Ok(())
    }

    /// Get the metric at every vertex slot, failing if it is not defined at a
    /// live vertex
    fn defined<E: Elem>(&self, mesh: &Mesh<D, E, M>) -> Result<Vec<M>> {
        self.check_size(mesh)?;
        let mut res = vec![M::default(); self.metric.len()];
        for i in mesh.vert_ids() {
            let Some(m) = self.metric[i as usize] else {
                return Err(Error::from(&format!("Undefined metric at vertex {i}")));
            };
            res[i as usize] = m;
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::MetricField;
    use crate::{
        Result, assert_delta,
        mesh::{
            Point,
            test_meshes::{square_mesh, test_mesh_2d},
        },
        metric::{AnisoMetric2d, DEFAULT_GRADATION, Metric, gradation::gradation},
    };

    #[test]
    fn test_set_get() -> Result<()> {
        let mut mesh = test_mesh_2d()?;
        let mut field = MetricField::new(&mesh);
        assert_eq!(field.len(), 4);
        assert!(field.get_metric().is_err());
        assert!(field.update_mesh(&mut mesh).is_err());

        field.alloc_metric(&[1.0, 0.0, 4.0].repeat(4))?;
        assert!(field.alloc_metric(&[1.0, 0.0, 4.0]).is_err());
        let buf = field.get_metric()?;
        assert_eq!(buf.len(), 12);
        assert_delta!(buf[2], 4.0, 1e-12);

        // non SPD: clamped
        field.set_metric_from_slice(1, &[-1.0, 0.0, 1.0])?;
        field.metric(1).unwrap().check()?;
        assert!(field.set_metric_from_slice(1, &[1.0, 0.0]).is_err());

        // vertex 1 differs too much from its neighbors for the default gradation
        assert!(field.set_gradation(1.0).is_err());
        field.set_gradation(10.0)?;
        field.update_mesh(&mut mesh)?;
        let m = mesh.get_metric(0).unwrap();
        assert_delta!(m.sizes()[0], 0.5, 1e-12);
        assert_delta!(m.sizes()[1], 1.0, 1e-12);

        Ok(())
    }

    #[test]
    fn test_add_field() -> Result<()> {
        let mesh = square_mesh(8)?;
        let psi = mesh
            .verts()
            .map(|p| 2.0 * p[0] * p[0] + 8.0 * p[1] * p[1])
            .collect::<Vec<_>>();

        let mut field = MetricField::new(&mesh);
        field.add_field(&mesh, &psi, 0.01, -1)?;
        for i in mesh.vert_ids() {
            let s = field.metric(i).unwrap().sizes();
            // |H| = diag(4, 16)
            assert_delta!(s[0], 1.0 / f64::sqrt(1600.0), 1e-6);
            assert_delta!(s[1], 1.0 / f64::sqrt(400.0), 1e-6);
        }

        // a second field with a larger error does not change the metric
        field.add_field(&mesh, &psi, 0.1, -1)?;
        for i in mesh.vert_ids() {
            let s = field.metric(i).unwrap().sizes();
            assert_delta!(s[0], 1.0 / f64::sqrt(1600.0), 1e-6);
        }

        let mut field = MetricField::new(&mesh);
        field.add_field(&mesh, &psi, 0.01, 2)?;
        let s = field.metric(0).unwrap().sizes();
        // det(|H|)^(-1/6) = 64^(-1/6) = 0.5
        assert_delta!(s[0], 1.0 / f64::sqrt(800.0), 1e-6);
        assert_delta!(s[1], 1.0 / f64::sqrt(200.0), 1e-6);

        assert!(field.add_field(&mesh, &psi, 0.01, 0).is_err());
        assert!(field.add_field(&mesh, &psi[1..], 0.01, 2).is_err());

        Ok(())
    }

    #[test]
    fn test_update_mesh_gradation() -> Result<()> {
        let mut mesh = square_mesh(8)?;
        let mut field = MetricField::new(&mesh);
        for i in mesh.vert_ids().collect::<Vec<_>>() {
            let p = mesh.get_coords(i).unwrap();
            let h = if p[0] < 0.1 && p[1] < 0.1 { 0.001 } else { 0.5 };
            field.set_metric(i, AnisoMetric2d::from_size(h))?;
        }
        let i0 = mesh
            .vert_ids()
            .find(|&i| mesh.get_coords(i).unwrap().norm() < 1e-12)
            .unwrap();
        let p1 = Point::<2>::new(0.125, 0.0);
        let i1 = mesh
            .vert_ids()
            .find(|&i| (mesh.get_coords(i).unwrap() - p1).norm() < 1e-12)
            .unwrap();

        assert_delta!(field.gradation(), DEFAULT_GRADATION, 1e-12);
        let before = mesh
            .vert_ids()
            .map(|i| *field.metric(i).unwrap())
            .collect::<Vec<_>>();
        let (g0, _) = gradation(&mesh, &before, DEFAULT_GRADATION);
        assert!(g0 > 10.0);

        field.update_mesh(&mut mesh)?;
        let after = mesh
            .vert_ids()
            .map(|i| mesh.get_metric(i).unwrap())
            .collect::<Vec<_>>();
        let (g1, _) = gradation(&mesh, &after, DEFAULT_GRADATION);
        assert!(g1 < 2.0 * DEFAULT_GRADATION);

        // the small size at the corner is kept, its neighbor is refined
        let h0 = before[i0 as usize].sizes()[1];
        assert_delta!(mesh.get_metric(i0).unwrap().sizes()[1], h0, 1e-8);
        assert!(mesh.get_metric(i1).unwrap().sizes()[1] < 0.1);

        Ok(())
    }

    #[test]
    fn test_relax() -> Result<()> {
        let mut mesh = square_mesh(4)?;
        let mut field = MetricField::new(&mesh);
        for i in mesh.vert_ids().collect::<Vec<_>>() {
            field.set_metric(i, AnisoMetric2d::from_size(0.01))?;
        }
        let l0 = mesh.maximal_edge_length();
        field.relax_mesh(&mut mesh, 0.5)?;
        let l1 = mesh.maximal_edge_length();
        field.relax_mesh(&mut mesh, 1.0)?;
        let l2 = mesh.maximal_edge_length();
        assert!(l0 < l1);
        assert!(l1 < l2);
        assert_delta!(l2, f64::sqrt(2.0) * 0.25 / 0.01, 1e-8);
        Ok(())
    }
}
