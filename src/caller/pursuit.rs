use itertools::izip;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, ArrayView1};

use super::config::CallerConfig;
use super::lstsq::{solve_least_squares, solve_weighted_least_squares};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The best remaining gene's weighted dot-product score fell below
    /// `dp_thresh` (or no candidate genes remained).
    BelowThreshold,
    /// The assignment set reached `max_genes`.
    MaxGenes,
}

/// One pixel's sparse gene decomposition. `genes` holds dictionary indices
/// in assignment order, each appearing at most once; `coefficients` are the
/// final refit values for the full set.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelAssignment {
    pub genes: Vec<usize>,
    pub coefficients: Vec<f32>,
    pub stop: StopReason,
}

impl PixelAssignment {
    fn from_workspace(ws: &PursuitWorkspace, stop: StopReason) -> PixelAssignment {
        PixelAssignment {
            genes: ws.selected.clone(),
            coefficients: ws.coefficients.clone(),
            stop,
        }
    }
}

/// Round/channel down-weighting applied between pursuit iterations, so
/// rounds and channels already explained by assigned genes contribute less
/// to subsequent selection scores. Swappable so other formulations can be
/// substituted without touching the solver loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Weighting {
    /// ε² ≡ 1: plain dot products and plain residuals.
    Uniform,
    /// Error-variance weighting: σ²_rc = β² + α·Σ_g (c_g·B_g,rc)², with
    /// ε²_rc the reciprocal variances normalized to mean one. `alpha`
    /// controls strength, `beta` sharpness; alpha = 0 degenerates to
    /// Uniform for any beta.
    ErrorVariance { alpha: f32, beta: f32 },
}

impl Weighting {
    pub fn from_config(config: &CallerConfig) -> Weighting {
        if config.alpha == 0.0 {
            Weighting::Uniform
        } else {
            Weighting::ErrorVariance {
                alpha: config.alpha,
                beta: config.beta,
            }
        }
    }

    /// Fill `out` with ε² for the given assignment state.
    pub fn epsilon_squared(
        &self,
        codes: &Array2<f32>,
        genes: &[usize],
        coefficients: &[f32],
        out: &mut [f32],
    ) {
        match *self {
            Weighting::Uniform => {
                out.fill(1.0);
            }
            Weighting::ErrorVariance { alpha, beta } => {
                let n_rc = out.len();
                let mut inv_total = 0.0f32;
                for (i, out_i) in out.iter_mut().enumerate() {
                    let mut explained = 0.0f32;
                    for (&g, &c) in genes.iter().zip(coefficients.iter()) {
                        explained += (c * codes[[g, i]]).powi(2);
                    }
                    let inv_sigma_squared = (beta * beta + alpha * explained).recip();
                    *out_i = inv_sigma_squared;
                    inv_total += inv_sigma_squared;
                }
                // normalize so the mean weight is one
                let scale = n_rc as f32 / inv_total;
                for out_i in out.iter_mut() {
                    *out_i *= scale;
                }
            }
        }
    }
}

/// Reusable per-thread buffers so batched solves don't allocate per pixel.
pub struct PursuitWorkspace {
    residual: Vec<f32>,
    epsilon_squared: Vec<f32>,
    selected: Vec<usize>,
    coefficients: Vec<f32>,
}

impl PursuitWorkspace {
    pub fn new() -> PursuitWorkspace {
        PursuitWorkspace {
            residual: Vec::new(),
            epsilon_squared: Vec::new(),
            selected: Vec::new(),
            coefficients: Vec::new(),
        }
    }
}

impl Default for PursuitWorkspace {
    fn default() -> Self {
        PursuitWorkspace::new()
    }
}

/// Greedy pursuit with orthogonal refitting, run independently per pixel.
///
/// Each iteration scores every unassigned dictionary entry against the
/// weighted residual, assigns the best scorer, then re-solves the
/// coefficients of the whole assigned set against the original vector so
/// earlier coefficients never go stale. Background codes are scored and
/// assigned like any other entry.
pub struct PursuitSolver {
    codes: Array2<f32>, // (n_codes, rounds*channels)
    max_genes: usize,
    dp_thresh: f32,
    weighting: Weighting,
    weight_coef_fit: bool,
}

impl PursuitSolver {
    pub fn new(codes: Array2<f32>, config: &CallerConfig) -> PursuitSolver {
        PursuitSolver {
            codes,
            max_genes: config.max_genes,
            dp_thresh: config.dp_thresh,
            weighting: Weighting::from_config(config),
            weight_coef_fit: config.weight_coef_fit,
        }
    }

    pub fn n_codes(&self) -> usize {
        self.codes.nrows()
    }

    pub fn codes(&self) -> &Array2<f32> {
        &self.codes
    }

    pub fn solve(&self, pixel: ArrayView1<f32>, ws: &mut PursuitWorkspace) -> PixelAssignment {
        let n_rc = self.codes.ncols();
        assert_eq!(pixel.len(), n_rc);

        ws.selected.clear();
        ws.coefficients.clear();
        ws.residual.clear();
        ws.residual.extend(pixel.iter());
        ws.epsilon_squared.clear();
        ws.epsilon_squared.resize(n_rc, 1.0);

        loop {
            // Best |weighted dot product| among unassigned genes. Ties keep
            // the lowest gene index, so results are deterministic.
            let mut best: Option<(usize, f32)> = None;
            for g in 0..self.codes.nrows() {
                if ws.selected.contains(&g) {
                    continue;
                }
                let mut score = 0.0f32;
                for (&w, &r, &b) in izip!(
                    ws.epsilon_squared.iter(),
                    ws.residual.iter(),
                    self.codes.row(g).iter()
                ) {
                    score += w * r * b;
                }
                if best.map_or(true, |(_, s)| score.abs() > s.abs()) {
                    best = Some((g, score));
                }
            }

            match best {
                Some((g, score)) if score.abs() >= self.dp_thresh => {
                    ws.selected.push(g);
                    self.refit(pixel, ws);
                }
                // Below threshold, or every dictionary entry assigned:
                // whatever is in S is the final answer (possibly nothing).
                _ => return PixelAssignment::from_workspace(ws, StopReason::BelowThreshold),
            }

            if ws.selected.len() >= self.max_genes {
                return PixelAssignment::from_workspace(ws, StopReason::MaxGenes);
            }
        }
    }

    // Re-solve all assigned coefficients against the original pixel vector
    // (not the residual), then refresh the residual and ε² for the next
    // selection round.
    fn refit(&self, pixel: ArrayView1<f32>, ws: &mut PursuitWorkspace) {
        let n_rc = pixel.len();
        let n_selected = ws.selected.len();

        let design = DMatrix::from_fn(n_rc, n_selected, |i, j| self.codes[[ws.selected[j], i]]);
        let rhs = DVector::from_fn(n_rc, |i, _| pixel[i]);

        let solution = if self.weight_coef_fit {
            solve_weighted_least_squares(&design, &rhs, &ws.epsilon_squared)
        } else {
            solve_least_squares(&design, &rhs)
        };
        ws.coefficients.clear();
        ws.coefficients.extend_from_slice(&solution.coefficients);

        for i in 0..n_rc {
            let mut reconstruction = 0.0f32;
            for (&g, &c) in ws.selected.iter().zip(ws.coefficients.iter()) {
                reconstruction += c * self.codes[[g, i]];
            }
            ws.residual[i] = pixel[i] - reconstruction;
        }

        self.weighting.epsilon_squared(
            &self.codes,
            &ws.selected,
            &ws.coefficients,
            &mut ws.epsilon_squared,
        );
    }
}
