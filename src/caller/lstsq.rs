use log::debug;
use nalgebra::{DMatrix, DVector};

// Singular values below this are treated as zero in the fallback solve.
const SVD_EPS: f32 = 1e-6;

pub struct LstsqSolution {
    pub coefficients: Vec<f32>,
    pub used_fallback: bool,
}

/// Solve min ‖b − A x‖₂ for a small dense system.
///
/// The normal equations with a Cholesky factorization cover the
/// well-conditioned case. A numerically singular system (collinear codes,
/// an all-zero weighted design) falls back to the SVD minimum-norm
/// solution instead of failing: per-pixel degeneracy is contained to the
/// pixel, never surfaced as an error.
pub fn solve_least_squares(design: &DMatrix<f32>, rhs: &DVector<f32>) -> LstsqSolution {
    let ata = design.transpose() * design;
    let atb = design.transpose() * rhs;

    if let Some(chol) = ata.cholesky() {
        return LstsqSolution {
            coefficients: chol.solve(&atb).iter().copied().collect(),
            used_fallback: false,
        };
    }

    debug!("rank-deficient least-squares system, using minimum-norm solution");
    let svd = design.clone().svd(true, true);
    let coefficients = match svd.solve(rhs, SVD_EPS) {
        Ok(x) => x.iter().copied().collect(),
        // A defective SVD on finite input does not occur; this arm keeps
        // non-finite garbage from propagating.
        Err(_) => vec![0.0; design.ncols()],
    };

    LstsqSolution {
        coefficients,
        used_fallback: true,
    }
}

/// Weighted variant: minimize ‖W^{1/2}(b − A x)‖₂ with per-row weights w
/// (the ε² weights; W = diag(w)). Rows are scaled by sqrt(w) and the plain
/// solver does the rest.
pub fn solve_weighted_least_squares(
    design: &DMatrix<f32>,
    rhs: &DVector<f32>,
    weights: &[f32],
) -> LstsqSolution {
    assert_eq!(design.nrows(), weights.len());

    let mut scaled_design = design.clone();
    let mut scaled_rhs = rhs.clone();
    for (i, &w) in weights.iter().enumerate() {
        let s = w.max(0.0).sqrt();
        for j in 0..scaled_design.ncols() {
            scaled_design[(i, j)] *= s;
        }
        scaled_rhs[i] *= s;
    }

    solve_least_squares(&scaled_design, &scaled_rhs)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Residual of a least-squares solution is orthogonal to the columns of
    // the design matrix; holds for the minimum-norm solution too.
    fn assert_normal_equations(design: &DMatrix<f32>, rhs: &DVector<f32>, x: &[f32]) {
        let x = DVector::from_row_slice(x);
        let residual = rhs - design * x;
        let gram = design.transpose() * residual;
        for v in gram.iter() {
            assert!(v.abs() < 1e-4, "normal equations violated: {}", v);
        }
    }

    #[test]
    fn test_exact_solution() {
        let design = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        let rhs = DVector::from_row_slice(&[2.0, 3.0, 0.0]);

        let sol = solve_least_squares(&design, &rhs);
        assert!(!sol.used_fallback);
        assert!((sol.coefficients[0] - 2.0).abs() < 1e-6);
        assert!((sol.coefficients[1] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_overdetermined_solution() {
        let design = DMatrix::from_row_slice(4, 2, &[1.0, 1.0, 1.0, 2.0, 1.0, 3.0, 1.0, 4.0]);
        let rhs = DVector::from_row_slice(&[6.0, 5.0, 7.0, 10.0]);

        let sol = solve_least_squares(&design, &rhs);
        assert!(!sol.used_fallback);
        assert_normal_equations(&design, &rhs, &sol.coefficients);
    }

    #[test]
    fn test_singular_system_falls_back() {
        // duplicated column: infinitely many solutions
        let design = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let rhs = DVector::from_row_slice(&[2.0, 4.0, 6.0]);

        let sol = solve_least_squares(&design, &rhs);
        assert!(sol.used_fallback);
        assert_normal_equations(&design, &rhs, &sol.coefficients);
        // minimum-norm splits the coefficient evenly across the duplicates
        assert!((sol.coefficients[0] - sol.coefficients[1]).abs() < 1e-4);
    }

    #[test]
    fn test_all_zero_design_falls_back_to_zeros() {
        let design = DMatrix::zeros(3, 2);
        let rhs = DVector::from_row_slice(&[1.0, 1.0, 1.0]);

        let sol = solve_least_squares(&design, &rhs);
        assert!(sol.used_fallback);
        for c in &sol.coefficients {
            assert_eq!(*c, 0.0);
        }
    }

    #[test]
    fn test_weighted_matches_direct_scaled_solve() {
        let design = DMatrix::from_row_slice(4, 2, &[1.0, 0.5, 0.2, 1.0, 1.0, 1.0, 0.3, 0.1]);
        let rhs = DVector::from_row_slice(&[1.0, 2.0, 3.0, 0.5]);
        let weights = [0.5, 2.0, 1.0, 0.25];

        let sol = solve_weighted_least_squares(&design, &rhs, &weights);

        let mut scaled_design = design.clone();
        let mut scaled_rhs = rhs.clone();
        for (i, &w) in weights.iter().enumerate() {
            let s = w.sqrt();
            scaled_design[(i, 0)] *= s;
            scaled_design[(i, 1)] *= s;
            scaled_rhs[i] *= s;
        }
        assert_normal_equations(&scaled_design, &scaled_rhs, &sol.coefficients);
    }

    #[test]
    fn test_uniform_weights_match_plain() {
        let design = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 0.0, 1.0]);
        let rhs = DVector::from_row_slice(&[1.0, 2.0, 1.5]);

        let plain = solve_least_squares(&design, &rhs);
        let weighted = solve_weighted_least_squares(&design, &rhs, &[1.0, 1.0, 1.0]);
        for (a, b) in plain.coefficients.iter().zip(weighted.coefficients.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
