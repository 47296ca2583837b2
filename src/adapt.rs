//! Metric-based adaptation loop
//!
//! Each iteration targets the edges longer than
//! `L_ref = max(alpha * L_max, L_up)`, so that the longest edges are split first and
//! the target length is reached progressively. The iterations stop once
//! `L_max - L_up < tol`, then the mesh is compacted and smoothed.
use crate::{
    Error, Result,
    mesh::{Elem, Mesh},
    metric::{DEFAULT_GRADATION, Metric, MetricField},
    remesher::{CoarsenParams, RefineParams, SmoothParams, SmoothingMethod, SwapParams},
    stats::MeshStats,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Order of the operators in an adaptation iteration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorOrder {
    /// Coarsen, swap then refine (default in 2d)
    CoarsenSwapRefine,
    /// A first coarsening pass, then refine, coarsen and swap at each iteration
    /// (default in 3d)
    RefineCoarsenSwap,
}

impl OperatorOrder {
    const fn default_for<E: Elem>() -> Self {
        if E::DIM == 2 {
            Self::CoarsenSwapRefine
        } else {
            Self::RefineCoarsenSwap
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptParams {
    /// Max. number of iterations
    pub max_iter: u32,
    /// Target upper bound for the edge lengths; the lower bound is `l_up / 2`
    pub l_up: f64,
    /// Reduction of the maximum length targeted at each iteration
    pub alpha: f64,
    /// The adaptation stops when `L_max - l_up < tol`
    pub tol: f64,
    /// Quality below which swaps are attempted (0.7 in 2d and 0.95 in 3d if not set)
    pub swap_quality: Option<f64>,
    /// Operator order (depends on the dimension if not set)
    pub order: Option<OperatorOrder>,
    pub smoothing: SmoothingMethod,
    /// Number of smoothing passes after the last iteration
    pub smooth_iter: u32,
    /// Allow the collapse of edges on tagged faces
    pub coarsen_surface: bool,
    /// Max. metric gradation, enforced before the adaptation
    pub gradation: f64,
}

impl Default for AdaptParams {
    fn default() -> Self {
        Self {
            max_iter: 10,
            l_up: 2.0_f64.sqrt(),
            alpha: 0.5_f64.sqrt(),
            tol: 0.01,
            swap_quality: None,
            order: None,
            smoothing: SmoothingMethod::OptimisationLinf,
            smooth_iter: 10,
            coarsen_surface: true,
            gradation: DEFAULT_GRADATION,
        }
    }
}

impl AdaptParams {
    /// Read the parameters from a json string; missing values use the defaults
    pub fn from_json(s: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(s)?;
        params.check()?;
        Ok(params)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    #[must_use]
    pub fn l_low(&self) -> f64 {
        0.5 * self.l_up
    }

    fn check(&self) -> Result<()> {
        if self.l_up <= 0.0 {
            return Err(Error::from(&format!("Invalid l_up: {}", self.l_up)));
        }
        if self.alpha <= 0.0 || self.alpha > 1.0 {
            return Err(Error::from(&format!("Invalid alpha: {}", self.alpha)));
        }
        if let Some(q) = self.swap_quality.filter(|q| !(0.0..=1.0).contains(q)) {
            return Err(Error::from(&format!("Invalid swap quality: {q}")));
        }
        if self.gradation.is_nan() || self.gradation <= 1.0 {
            return Err(Error::from(&format!("Invalid gradation: {}", self.gradation)));
        }
        Ok(())
    }
}

/// Decide when the adaptation loop stops, given the iteration number (starting at 1)
/// and the maximum edge length over all the ranks
pub trait StopCriterion {
    fn stop(&self, n_iter: u32, l_max: f64) -> bool;
}

impl<F: Fn(u32, f64) -> bool> StopCriterion for F {
    fn stop(&self, n_iter: u32, l_max: f64) -> bool {
        self(n_iter, l_max)
    }
}

/// Stop when the maximum edge length is close enough to its target
#[derive(Clone, Copy, Debug)]
pub struct MaxLengthCriterion {
    pub l_up: f64,
    pub tol: f64,
}

impl StopCriterion for MaxLengthCriterion {
    fn stop(&self, _n_iter: u32, l_max: f64) -> bool {
        l_max - self.l_up < self.tol
    }
}

/// Summary of an adaptation
#[derive(Clone, Debug, Serialize)]
pub struct AdaptReport {
    /// Number of iterations performed
    pub n_iter: u32,
    /// Whether the stopping criterion was met before `max_iter`
    pub converged: bool,
    /// Max. edge length at the end of the iterations (before smoothing)
    pub l_max: f64,
    pub n_splits: usize,
    pub n_collapses: usize,
    pub n_swaps: usize,
    pub n_moved: usize,
    /// Local mesh stats at the end of the adaptation
    pub stats: MeshStats,
}

/// Adapt `mesh` to its metric, stopping when `L_max - l_up < tol`
pub fn adapt<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &mut Mesh<D, E, M>,
    params: &AdaptParams,
) -> Result<AdaptReport> {
    let stop = MaxLengthCriterion {
        l_up: params.l_up,
        tol: params.tol,
    };
    adapt_with_criterion(mesh, params, &stop)
}

/// Adapt `mesh` to its metric with a custom stopping criterion
pub fn adapt_with_criterion<const D: usize, E: Elem, M: Metric<D>>(
    mesh: &mut Mesh<D, E, M>,
    params: &AdaptParams,
    stop: &dyn StopCriterion,
) -> Result<AdaptReport> {
    params.check()?;
    let now = Instant::now();
    info!(
        "Adapt a {D}D mesh: {} vertices, {} elements",
        mesh.n_verts(),
        mesh.n_elems()
    );

    let mut field = MetricField::new(mesh);
    for i in mesh.vert_ids() {
        if let Some(m) = mesh.get_metric(i) {
            field.set_metric(i, m)?;
        }
    }
    field.set_gradation(params.gradation)?;
    field.update_mesh(mesh)?;

    let order = params.order.unwrap_or_else(OperatorOrder::default_for::<E>);
    let q_swap = params
        .swap_quality
        .unwrap_or(if E::DIM == 2 { 0.7 } else { 0.95 });
    let l_low = params.l_low();
    let coarsen = |l_max: f64| CoarsenParams {
        l_low,
        l_max,
        coarsen_surface: params.coarsen_surface,
        ..CoarsenParams::default()
    };
    let swap = SwapParams {
        q: q_swap,
        ..SwapParams::default()
    };

    let mut n_splits = 0;
    let mut n_collapses = 0;
    let mut n_swaps = 0;

    if order == OperatorOrder::RefineCoarsenSwap {
        n_collapses += mesh.coarsen(&coarsen(params.l_up))?;
    }

    let mut l_max = mesh.maximal_edge_length();
    let mut n_iter = 0;
    let mut converged = false;
    while n_iter < params.max_iter {
        n_iter += 1;
        let l_ref = f64::max(params.alpha * l_max, params.l_up);
        debug!("Iteration {n_iter}: L_max = {l_max:.3}, L_ref = {l_ref:.3}");
        let refine = RefineParams { l: l_ref };
        match order {
            OperatorOrder::CoarsenSwapRefine => {
                n_collapses += mesh.coarsen(&coarsen(l_ref))?;
                n_swaps += mesh.swap(&swap)?;
                n_splits += mesh.refine(&refine)?;
            }
            OperatorOrder::RefineCoarsenSwap => {
                n_splits += mesh.refine(&refine)?;
                n_collapses += mesh.coarsen(&coarsen(l_ref))?;
                n_swaps += mesh.swap(&swap)?;
            }
        }

        l_max = mesh.maximal_edge_length();
        info!(
            "Iteration {n_iter}: L_max = {l_max:.3}, {} vertices, {} elements",
            mesh.n_verts(),
            mesh.n_elems()
        );
        if stop.stop(n_iter, l_max) {
            converged = true;
            break;
        }
    }

    mesh.compact();

    let n_moved = if params.smooth_iter > 0 {
        mesh.smooth(&SmoothParams {
            method: params.smoothing,
            n_iter: params.smooth_iter,
        })?
    } else {
        0
    };

    mesh.print_stats();
    info!(
        "Adaptation done in {:.2}s ({n_iter} iterations, converged: {converged})",
        now.elapsed().as_secs_f32()
    );

    Ok(AdaptReport {
        n_iter,
        converged,
        l_max,
        n_splits,
        n_collapses,
        n_swaps,
        n_moved,
        stats: MeshStats::new(mesh),
    })
}

#[cfg(test)]
mod tests {
    use super::{AdaptParams, OperatorOrder, adapt, adapt_with_criterion};
    use crate::{
        Rank, Result, assert_delta,
        mesh::{
            GElem, Mesh2d, Point,
            test_meshes::{cube_mesh, disc_mesh, square_mesh},
        },
        metric::{AnisoMetric2d, AnisoMetric3d},
        parallel::{Communicator, ThreadComm, partition_mesh},
        remesher::SmoothingMethod,
    };
    use std::sync::Arc;

    #[test]
    fn test_params_json() -> Result<()> {
        let params = AdaptParams::from_json(r#"{"max_iter": 5, "order": "RefineCoarsenSwap"}"#)?;
        assert_eq!(params.max_iter, 5);
        assert_eq!(params.order, Some(OperatorOrder::RefineCoarsenSwap));
        assert_delta!(params.l_up, 2.0_f64.sqrt(), 1e-12);
        assert_eq!(params.smoothing, SmoothingMethod::OptimisationLinf);

        let params2 = AdaptParams::from_json(&params.to_json()?)?;
        assert_eq!(params2.max_iter, 5);

        assert!(AdaptParams::from_json(r#"{"l_up": -1.0}"#).is_err());
        assert!(AdaptParams::from_json(r#"{"gradation": 0.5}"#).is_err());
        assert!(AdaptParams::from_json("{max_iter}").is_err());
        Ok(())
    }

    #[test]
    fn test_adapt_uniform_2d() -> Result<()> {
        let mut mesh = square_mesh(4)?;
        mesh.set_metrics(&vec![AnisoMetric2d::from_size(0.1); mesh.n_vert_slots()])?;

        let params = AdaptParams::default();
        let report = adapt(&mut mesh, &params)?;
        mesh.verify()?;

        assert!(report.converged);
        assert!(report.l_max < params.l_up + params.tol);
        assert!(report.n_splits > 0);
        assert!(mesh.qmean() >= 0.3);
        assert!(mesh.qmin() > 0.0);
        assert_delta!(mesh.calculate_area(None), 1.0, 1e-10);
        assert_delta!(mesh.calculate_perimeter(None, None), 4.0, 1e-10);

        // the mesh is compact after the adaptation
        assert_eq!(mesh.n_vert_slots(), mesh.n_verts());

        let steps: serde_json::Value = serde_json::from_str(&mesh.stats_json()?)?;
        let steps = steps.as_array().unwrap();
        assert!(steps[0].get("Init").is_some());
        for step in ["Refine", "Coarsen", "Swap", "Smooth"] {
            assert!(steps.iter().any(|s| s.get(step).is_some()));
        }
        Ok(())
    }

    #[test]
    fn test_adapt_aniso_2d() -> Result<()> {
        let mut mesh = square_mesh(4)?;
        let m = AnisoMetric2d::from_sizes(
            &Point::<2>::new(0.2, 0.0),
            &Point::<2>::new(0.0, 0.05),
        );
        mesh.set_metrics(&vec![m; mesh.n_vert_slots()])?;

        let report = adapt(&mut mesh, &AdaptParams::default())?;
        mesh.verify()?;
        assert!(report.converged);
        assert!(mesh.qmean() >= 0.3);
        assert_delta!(mesh.calculate_area(None), 1.0, 1e-10);
        Ok(())
    }

    #[test]
    fn test_adapt_cube() -> Result<()> {
        let mut mesh = cube_mesh(2)?;
        mesh.set_metrics(&vec![AnisoMetric3d::from_size(0.25); mesh.n_vert_slots()])?;

        let params = AdaptParams {
            smooth_iter: 2,
            ..AdaptParams::default()
        };
        let report = adapt(&mut mesh, &params)?;
        mesh.verify()?;
        assert!(report.n_splits > 0);
        assert!(report.converged || report.n_iter == params.max_iter);
        if report.converged {
            assert!(report.l_max - params.l_up < params.tol);
        }
        assert!(mesh.qmin() > 0.0);
        assert!(mesh.qmean() >= 0.3);
        assert_eq!(mesh.n_vert_slots(), mesh.n_verts());
        assert_delta!(mesh.calculate_volume(None), 1.0, 1e-10);
        assert_delta!(mesh.calculate_area(None, None), 6.0, 1e-10);
        for tag in 1..=6 {
            assert!(mesh.faces().any(|(_, t)| t == tag));
        }
        Ok(())
    }

    #[test]
    fn test_adapt_disc() -> Result<()> {
        let mut mesh = disc_mesh()?;
        mesh.set_metrics(&vec![AnisoMetric2d::from_size(0.3); mesh.n_vert_slots()])?;
        let inner = mesh.calculate_area(Some(12));
        let outer = mesh.calculate_area(Some(11));
        let interface = mesh.calculate_perimeter(Some(11), Some(12));

        adapt(&mut mesh, &AdaptParams::default())?;
        mesh.verify()?;

        let pi = std::f64::consts::PI;
        assert_delta!(mesh.calculate_area(Some(12)), inner, 1e-8);
        assert_delta!(mesh.calculate_area(Some(11)), outer, 1e-8);
        assert_delta!(mesh.calculate_perimeter(Some(11), Some(12)), interface, 1e-8);
        assert!((mesh.calculate_area(Some(12)) - 9.0 * pi).abs() < 0.05 * 9.0 * pi);
        assert!((mesh.calculate_area(Some(11)) - 16.0 * pi).abs() < 0.05 * 16.0 * pi);
        let perimeter = mesh.calculate_perimeter(Some(11), Some(12));
        assert!((perimeter - 6.0 * pi).abs() < 0.05 * 6.0 * pi);
        Ok(())
    }

    #[test]
    fn test_stop_criterion() -> Result<()> {
        let mut mesh = square_mesh(4)?;
        mesh.set_metrics(&vec![AnisoMetric2d::from_size(0.05); mesh.n_vert_slots()])?;

        let params = AdaptParams {
            smooth_iter: 0,
            ..AdaptParams::default()
        };
        let stop = |n_iter: u32, _l_max: f64| n_iter == 2;
        let report = adapt_with_criterion(&mut mesh, &params, &stop)?;
        mesh.verify()?;
        assert_eq!(report.n_iter, 2);
        assert!(report.converged);
        assert_eq!(report.n_moved, 0);
        Ok(())
    }

    #[test]
    fn test_adapt_parallel() -> Result<()> {
        let mut mesh = square_mesh(4)?;
        mesh.set_metrics(&vec![AnisoMetric2d::from_size(0.1); mesh.n_vert_slots()])?;
        let parts = mesh
            .elems()
            .map(|e| Rank::from(mesh.gelem(&e).center()[0] > 0.5))
            .collect::<Vec<_>>();

        let mut serial = mesh.clone();
        adapt(&mut serial, &AdaptParams::default())?;
        let n_verts = serial.n_verts() as f64;

        let world = ThreadComm::world(2);
        std::thread::scope(|s| {
            let handles = world
                .into_iter()
                .map(|comm| {
                    let mesh = &mesh;
                    let parts = &parts;
                    s.spawn(move || {
                        let comm: Arc<dyn Communicator> = Arc::new(comm);
                        let mut local: Mesh2d = partition_mesh(mesh, parts, comm).unwrap();
                        let report = adapt(&mut local, &AdaptParams::default()).unwrap();
                        local.verify().unwrap();
                        let n_owned = local.vert_ids().filter(|&i| local.is_owned(i)).count();
                        (
                            report.n_iter,
                            report.l_max,
                            local.calculate_area(None),
                            n_owned,
                        )
                    })
                })
                .collect::<Vec<_>>();
            let res = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>();
            assert_eq!(res[0].0, res[1].0);
            // the interface vertices are adapted as well
            let n = (res[0].3 + res[1].3) as f64;
            assert!((n - n_verts).abs() < 0.15 * n_verts);
            for (_, l_max, area, _) in res {
                assert!(l_max < 2.0_f64.sqrt() + 0.01);
                assert_delta!(area, 1.0, 1e-10);
            }
        });
        Ok(())
    }
}
