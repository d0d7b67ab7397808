use indicatif::ProgressBar;
use log::debug;
use ndarray::{Array2, Array3, ArrayView1};
use rayon::prelude::*;
use std::cell::RefCell;
use thread_local::ThreadLocal;

use super::config::CallerConfig;
use super::pursuit::{PixelAssignment, PursuitSolver, PursuitWorkspace};
use super::tiles::TileColours;

// The gate threshold is estimated from a strided subset of at most this
// many pixels rather than the full tile.
const GATE_SAMPLE_TARGET: usize = 100_000;

/// Dense per-gene coefficient fields over one tile. Zero everywhere the
/// pixel was gated out or the gene unassigned.
pub struct CoefficientVolumes {
    pub tile: u32,
    pub shape: [usize; 3],
    pub volumes: Vec<Array3<f32>>,
}

/// Execution strategy for the per-pixel solves within a chunk. Backends
/// must be numerically equivalent: the same pixels, dictionary, and
/// configuration produce the same assignments on any backend. Backend
/// choice is a performance knob, never a correctness one.
pub trait SolveBackend: Sync {
    fn name(&self) -> &'static str;

    /// Solve the given pixel rows of `colours`, in order.
    fn solve_batch(
        &self,
        solver: &PursuitSolver,
        colours: &Array2<f32>,
        pixels: &[usize],
    ) -> Vec<PixelAssignment>;
}

pub struct SerialBackend;

impl SolveBackend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn solve_batch(
        &self,
        solver: &PursuitSolver,
        colours: &Array2<f32>,
        pixels: &[usize],
    ) -> Vec<PixelAssignment> {
        let mut ws = PursuitWorkspace::new();
        pixels
            .iter()
            .map(|&p| solver.solve(colours.row(p), &mut ws))
            .collect()
    }
}

pub struct RayonBackend {
    workspace: ThreadLocal<RefCell<PursuitWorkspace>>,
}

impl RayonBackend {
    pub fn new() -> RayonBackend {
        RayonBackend {
            workspace: ThreadLocal::new(),
        }
    }
}

impl Default for RayonBackend {
    fn default() -> Self {
        RayonBackend::new()
    }
}

impl SolveBackend for RayonBackend {
    fn name(&self) -> &'static str {
        "rayon"
    }

    fn solve_batch(
        &self,
        solver: &PursuitSolver,
        colours: &Array2<f32>,
        pixels: &[usize],
    ) -> Vec<PixelAssignment> {
        // indexed parallel map: result order matches `pixels` regardless of
        // thread scheduling
        pixels
            .par_iter()
            .map(|&p| {
                let mut ws = self
                    .workspace
                    .get_or(|| RefCell::new(PursuitWorkspace::new()))
                    .borrow_mut();
                solver.solve(colours.row(p), &mut ws)
            })
            .collect()
    }
}

/// Scalar summary used by the intensity gate: the median across rounds of
/// the per-round maximum absolute channel intensity.
pub fn pixel_max_intensity(vector: ArrayView1<f32>, rounds: usize, channels: usize) -> f32 {
    let mut round_maxima: Vec<f32> = (0..rounds)
        .map(|r| {
            (0..channels)
                .map(|c| vector[r * channels + c].abs())
                .fold(0.0f32, f32::max)
        })
        .collect();
    round_maxima.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let n = round_maxima.len();
    if n % 2 == 1 {
        round_maxima[n / 2]
    } else {
        0.5 * (round_maxima[n / 2 - 1] + round_maxima[n / 2])
    }
}

fn percentile_of(values: &mut [f32], percentile: f32) -> f32 {
    assert!(!values.is_empty());
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let rank = percentile as f64 / 100.0 * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = (rank - lo as f64) as f32;
    values[lo] + frac * (values[hi] - values[lo])
}

/// Threshold for the pixel selection gate: the `pixel_max_percentile`-th
/// percentile of `pixel_max_intensity` over a deterministic strided subset
/// of the tile. Pixels at or below it are never solved.
///
/// This gate is purely a cost policy: it caps how many pixels reach the
/// solver and can suppress genuinely dim true spots. Tune with
/// `pixel_max_percentile`.
pub fn gate_threshold(colours: &Array2<f32>, rounds: usize, channels: usize, percentile: f32) -> f32 {
    let n = colours.nrows();
    let stride = (n / GATE_SAMPLE_TARGET).max(1);
    let mut sample: Vec<f32> = (0..n)
        .step_by(stride)
        .map(|p| pixel_max_intensity(colours.row(p), rounds, channels))
        .collect();
    percentile_of(&mut sample, percentile)
}

/// Run the solver over one tile and assemble per-gene coefficient volumes.
///
/// The tile is swept in `subset_size_xy` × `subset_size_xy` xy chunks (all
/// z at once) to bound peak memory. Chunking never changes results: every
/// pixel's solve is independent of its neighbours.
pub fn build_coefficient_volumes(
    tile: &TileColours,
    solver: &PursuitSolver,
    config: &CallerConfig,
    backend: &dyn SolveBackend,
    progress: Option<&ProgressBar>,
) -> CoefficientVolumes {
    let [ny, nx, nz] = tile.shape;
    let threshold = gate_threshold(
        &tile.data,
        tile.rounds,
        tile.channels,
        config.pixel_max_percentile,
    );
    debug!(
        "tile {}: intensity gate threshold {:.5} ({} backend)",
        tile.tile,
        threshold,
        backend.name()
    );

    let mut volumes = vec![Array3::zeros((ny, nx, nz)); solver.n_codes()];
    let mut n_solved = 0usize;

    for y0 in (0..ny).step_by(config.subset_size_xy) {
        let y1 = (y0 + config.subset_size_xy).min(ny);
        for x0 in (0..nx).step_by(config.subset_size_xy) {
            let x1 = (x0 + config.subset_size_xy).min(nx);

            // gated-in pixel indices for this chunk, raster order
            let mut pixels = Vec::new();
            for y in y0..y1 {
                for x in x0..x1 {
                    for z in 0..nz {
                        let p = (y * nx + x) * nz + z;
                        if pixel_max_intensity(tile.data.row(p), tile.rounds, tile.channels)
                            > threshold
                        {
                            pixels.push(p);
                        }
                    }
                }
            }
            n_solved += pixels.len();

            let results = backend.solve_batch(solver, &tile.data, &pixels);
            for (&p, assignment) in pixels.iter().zip(results.iter()) {
                let z = p % nz;
                let x = (p / nz) % nx;
                let y = p / (nz * nx);
                for (&g, &c) in assignment.genes.iter().zip(assignment.coefficients.iter()) {
                    volumes[g][[y, x, z]] = c;
                }
            }

            if let Some(pb) = progress {
                pb.inc(((y1 - y0) * (x1 - x0) * nz) as u64);
            }
        }
    }

    debug!(
        "tile {}: solved {} of {} pixels",
        tile.tile,
        n_solved,
        ny * nx * nz
    );

    CoefficientVolumes {
        tile: tile.tile,
        shape: tile.shape,
        volumes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    // two orthogonal codes over 2 rounds x 2 channels
    fn test_solver(max_genes: usize) -> PursuitSolver {
        let mut codes = Array2::zeros((2, 4));
        codes[[0, 0]] = 1.0;
        codes[[1, 1]] = 1.0;
        let config = CallerConfig {
            max_genes,
            dp_thresh: 0.2,
            alpha: 0.0,
            weight_coef_fit: false,
            ..CallerConfig::default()
        };
        PursuitSolver::new(codes, &config)
    }

    fn test_tile() -> TileColours {
        // 2x2x1 tile; pixel (0,0) is gene 0 at full strength, pixel (1,1)
        // is gene 1 at half strength, the rest are dark
        let mut data = Array2::zeros((4, 4));
        data[[0, 0]] = 1.0;
        data[[3, 1]] = 0.6;
        TileColours {
            tile: 0,
            shape: [2, 2, 1],
            rounds: 2,
            channels: 2,
            data,
        }
    }

    fn test_config(subset_size_xy: usize) -> CallerConfig {
        CallerConfig {
            subset_size_xy,
            pixel_max_percentile: 50.0,
            max_genes: 2,
            dp_thresh: 0.2,
            alpha: 0.0,
            weight_coef_fit: false,
            ..CallerConfig::default()
        }
    }

    #[test]
    fn test_pixel_max_intensity_median_of_round_maxima() {
        // 3 rounds x 2 channels
        let v = Array1::from_vec(vec![0.1, -0.9, 0.2, 0.3, 0.0, 0.5]);
        // round maxima: 0.9, 0.3, 0.5 -> median 0.5
        assert!((pixel_max_intensity(v.view(), 3, 2) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_percentile_edges() {
        let mut values = vec![3.0, 1.0, 2.0, 4.0];
        assert_eq!(percentile_of(&mut values, 0.0), 1.0);
        assert_eq!(percentile_of(&mut values, 100.0), 4.0);
        assert!((percentile_of(&mut values, 50.0) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_gate_and_assembly() {
        let tile = test_tile();
        let solver = test_solver(2);
        let config = test_config(128);

        let result =
            build_coefficient_volumes(&tile, &solver, &config, &SerialBackend, None);

        assert_eq!(result.volumes.len(), 2);
        assert!((result.volumes[0][[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((result.volumes[1][[1, 1, 0]] - 0.6).abs() < 1e-6);
        // dark pixels were never solved
        assert_eq!(result.volumes[0][[0, 1, 0]], 0.0);
        assert_eq!(result.volumes[1][[1, 0, 0]], 0.0);
    }

    #[test]
    fn test_chunking_does_not_change_results() {
        let tile = test_tile();
        let solver = test_solver(2);

        let whole =
            build_coefficient_volumes(&tile, &solver, &test_config(128), &SerialBackend, None);
        let chunked =
            build_coefficient_volumes(&tile, &solver, &test_config(1), &SerialBackend, None);

        for (a, b) in whole.volumes.iter().zip(chunked.volumes.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_backend_equivalence() {
        let tile = test_tile();
        let solver = test_solver(2);
        let config = test_config(128);

        let serial =
            build_coefficient_volumes(&tile, &solver, &config, &SerialBackend, None);
        let parallel =
            build_coefficient_volumes(&tile, &solver, &config, &RayonBackend::new(), None);

        for (a, b) in serial.volumes.iter().zip(parallel.volumes.iter()) {
            assert_eq!(a, b);
        }
    }
}
