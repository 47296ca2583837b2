use crate::{
    mesh::{Elem, Mesh},
    metric::Metric,
};
use core::fmt;
use serde::Serialize;

/// Histogram, bounds and mean of a set of values (edge lengths or element qualities)
#[derive(Serialize, Debug, Clone)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Histogram bins, the first and last are `min` and `max`
    pub bins: Vec<f64>,
    /// Fraction of the values in each bin
    pub vals: Vec<f64>,
}

impl Stats {
    /// Compute the stats, using `values` as the inner bin bounds. Empty bins are merged
    /// with the next one
    pub fn new<I: Iterator<Item = f64>>(f: I, values: &[f64]) -> Self {
        let n = values.len();
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut count = 0_u32;
        let mut mean = 0.0;
        let mut vals = vec![0.0; n + 1];

        for val in f {
            min = min.min(val);
            max = max.max(val);
            mean += val;
            count += 1;
            let i_bin = values.iter().position(|&b| val < b).unwrap_or(n);
            vals[i_bin] += 1.0;
        }

        if count == 0 {
            return Self {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                bins: Vec::new(),
                vals: Vec::new(),
            };
        }

        let mut bins = Vec::with_capacity(n + 2);
        bins.push(min);
        bins.extend_from_slice(values);
        bins.push(max);

        while let Some(i) = vals.iter().position(|&v| v < 0.5) {
            vals.remove(i);
            bins.remove(i + 1);
        }
        let n = bins.len();
        bins[0] = min;
        bins[n - 1] = max;

        vals.iter_mut().for_each(|v| *v /= f64::from(count));
        mean /= f64::from(count);

        Self {
            min,
            max,
            mean,
            bins,
            vals,
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mean = {:.2}", self.mean)?;
        for (i, v) in self.vals.iter().enumerate() {
            write!(
                f,
                ", {:.2} < {:.1}% < {:.2}",
                self.bins[i],
                100.0 * v,
                self.bins[i + 1]
            )?;
        }
        Ok(())
    }
}

/// Size of the mesh, edge length and quality statistics
#[derive(Serialize, Debug, Clone)]
pub struct MeshStats {
    pub n_verts: usize,
    pub n_elems: usize,
    pub n_edges: usize,
    pub lengths: Stats,
    pub qualities: Stats,
}

impl MeshStats {
    pub fn new<const D: usize, E: Elem, M: Metric<D>>(mesh: &Mesh<D, E, M>) -> Self {
        Self {
            n_verts: mesh.n_verts(),
            n_elems: mesh.n_elems(),
            n_edges: mesh.n_edges(),
            lengths: mesh.edge_length_stats(),
            qualities: mesh.quality_stats(),
        }
    }
}

/// Record of one pass of an operator
#[derive(Serialize, Debug, Clone)]
pub enum StepStats {
    Init(MeshStats),
    Refine {
        n_splits: usize,
        n_fails: usize,
        stats: MeshStats,
    },
    Coarsen {
        n_collapses: usize,
        n_fails: usize,
        stats: MeshStats,
    },
    Swap {
        n_swaps: usize,
        n_fails: usize,
        stats: MeshStats,
    },
    Smooth {
        n_moved: usize,
        n_fails: usize,
        stats: MeshStats,
    },
}

#[cfg(test)]
mod tests {
    use super::Stats;
    use crate::assert_delta;

    #[test]
    fn test_stats() {
        let vals = [0.1, 0.5, 0.7, 0.9, 0.95, 1.0];
        let s = Stats::new(vals.iter().copied(), &[0.4, 0.6, 0.8]);
        assert_delta!(s.min, 0.1, 1e-12);
        assert_delta!(s.max, 1.0, 1e-12);
        assert_delta!(s.mean, 4.15 / 6.0, 1e-12);
        assert_eq!(s.vals.len(), 4);
        assert_delta!(s.vals[3], 0.5, 1e-12);
        assert_eq!(s.bins.len(), 5);
    }

    #[test]
    fn test_stats_merge_empty() {
        let vals = [0.1, 0.9];
        let s = Stats::new(vals.iter().copied(), &[0.4, 0.6, 0.8]);
        assert_eq!(s.vals.len(), 2);
        assert_delta!(s.vals[0], 0.5, 1e-12);
        assert_delta!(s.bins[1], 0.4, 1e-12);
        let txt = format!("{s}");
        assert!(txt.starts_with("mean = 0.50"));
    }
}
