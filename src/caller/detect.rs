use ndarray::Array3;

use super::config::CallerConfig;
use super::shape::SpotShape;

/// A surviving coefficient maximum with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub position: [usize; 3],
    pub coefficient: f32,
    pub score: f32,
}

/// Find coefficient maxima at or above `threshold`, suppressing any
/// candidate with a strictly larger value inside the suppression cylinder
/// (xy distance ≤ radius_xy and |Δz| ≤ radius_z). Equal-valued competitors
/// keep only the raster-earliest voxel, so of two touching maxima at most
/// one survives and the outcome is deterministic.
pub fn detect_spots(
    volume: &Array3<f32>,
    threshold: f32,
    radius_xy: usize,
    radius_z: usize,
) -> Vec<([usize; 3], f32)> {
    let (ny, nx, nz) = volume.dim();
    let (ryx, rz) = (radius_xy as i64, radius_z as i64);
    let ryx_squared = ryx * ryx;
    let mut spots = Vec::new();

    for y in 0..ny {
        for x in 0..nx {
            'voxel: for z in 0..nz {
                let v = volume[[y, x, z]];
                if v < threshold {
                    continue;
                }
                let index = (y * nx + x) * nz + z;

                for dy in -ryx..=ryx {
                    for dx in -ryx..=ryx {
                        if dy * dy + dx * dx > ryx_squared {
                            continue;
                        }
                        for dz in -rz..=rz {
                            if dy == 0 && dx == 0 && dz == 0 {
                                continue;
                            }
                            let (yy, xx, zz) = (y as i64 + dy, x as i64 + dx, z as i64 + dz);
                            if yy < 0
                                || yy >= ny as i64
                                || xx < 0
                                || xx >= nx as i64
                                || zz < 0
                                || zz >= nz as i64
                            {
                                continue;
                            }
                            let (yy, xx, zz) = (yy as usize, xx as usize, zz as usize);
                            let w = volume[[yy, xx, zz]];
                            if w > v {
                                continue 'voxel;
                            }
                            // tie-break: discard the later-indexed voxel
                            if w == v && (yy * nx + xx) * nz + zz < index {
                                continue 'voxel;
                            }
                        }
                    }
                }

                spots.push(([y, x, z], v));
            }
        }
    }
    spots
}

/// Score one candidate against the calibrated shape: positive coefficients
/// in the window are squashed by c/(c + high_coef_bias) (larger bias
/// flattens the emphasis on big coefficients), non-positive map to zero,
/// and the signed shape weights average them into [0, 1]. Window positions
/// outside the volume and zero-weight shape positions contribute nothing.
pub fn score_spot(
    volume: &Array3<f32>,
    position: [usize; 3],
    shape: &SpotShape,
    high_coef_bias: f32,
) -> f32 {
    let (ny, nx, nz) = volume.dim();
    let [sy, sx, sz] = shape.dims();
    let [ry, rx, rz] = shape.radii();
    let [y, x, z] = position;

    let mut weighted_sum = 0.0f32;
    let mut weight_total = 0.0f32;

    for wy in 0..sy {
        for wx in 0..sx {
            for wz in 0..sz {
                let weight = shape.signs[[wy, wx, wz]];
                if weight == 0 {
                    continue;
                }
                let yy = y as i64 + wy as i64 - ry as i64;
                let xx = x as i64 + wx as i64 - rx as i64;
                let zz = z as i64 + wz as i64 - rz as i64;
                if yy < 0 || yy >= ny as i64 || xx < 0 || xx >= nx as i64 || zz < 0 || zz >= nz as i64
                {
                    continue;
                }

                let c = volume[[yy as usize, xx as usize, zz as usize]];
                let transformed = if c > 0.0 { c / (c + high_coef_bias) } else { 0.0 };
                weighted_sum += weight as f32 * transformed;
                weight_total += 1.0;
            }
        }
    }

    if weight_total == 0.0 {
        0.0
    } else {
        (weighted_sum / weight_total).clamp(0.0, 1.0)
    }
}

/// Detect, score, and filter one gene's coefficient volume.
pub fn detect_and_score_gene(
    volume: &Array3<f32>,
    shape: &SpotShape,
    config: &CallerConfig,
) -> Vec<Candidate> {
    detect_spots(
        volume,
        config.coefficient_threshold,
        config.radius_xy,
        config.radius_z,
    )
    .into_iter()
    .map(|(position, coefficient)| Candidate {
        position,
        coefficient,
        score: score_spot(volume, position, shape, config.high_coef_bias),
    })
    .filter(|candidate| candidate.score >= config.score_threshold)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume_with(values: &[([usize; 3], f32)], dims: (usize, usize, usize)) -> Array3<f32> {
        let mut volume = Array3::zeros(dims);
        for &(pos, v) in values {
            volume[pos] = v;
        }
        volume
    }

    #[test]
    fn test_dominated_peak_is_suppressed() {
        // a peak of 5 and a nearby peak of 3 within radius_xy: only the
        // larger survives
        let volume = volume_with(&[([5, 5, 0], 5.0), ([5, 7, 0], 3.0)], (12, 12, 1));
        let spots = detect_spots(&volume, 1.0, 3, 1);
        assert_eq!(spots, vec![([5, 5, 0], 5.0)]);
    }

    #[test]
    fn test_distant_peaks_both_survive() {
        let volume = volume_with(&[([2, 2, 0], 5.0), ([2, 9, 0], 3.0)], (12, 12, 1));
        let mut spots = detect_spots(&volume, 1.0, 3, 1);
        spots.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(spots.len(), 2);
    }

    #[test]
    fn test_tied_peaks_keep_raster_earliest() {
        let volume = volume_with(&[([4, 4, 0], 2.0), ([4, 6, 0], 2.0)], (12, 12, 1));
        let spots = detect_spots(&volume, 1.0, 3, 1);
        assert_eq!(spots, vec![([4, 4, 0], 2.0)]);
    }

    #[test]
    fn test_z_axis_suppression() {
        let volume = volume_with(&[([4, 4, 1], 2.0), ([4, 4, 2], 3.0)], (8, 8, 5));
        let spots = detect_spots(&volume, 1.0, 2, 1);
        assert_eq!(spots, vec![([4, 4, 2], 3.0)]);

        // beyond radius_z they are independent maxima
        let volume = volume_with(&[([4, 4, 0], 2.0), ([4, 4, 4], 3.0)], (8, 8, 5));
        let spots = detect_spots(&volume, 1.0, 2, 1);
        assert_eq!(spots.len(), 2);
    }

    #[test]
    fn test_sub_threshold_voxels_ignored() {
        let volume = volume_with(&[([3, 3, 0], 0.5)], (8, 8, 1));
        assert!(detect_spots(&volume, 1.0, 2, 1).is_empty());
    }

    fn center_shape() -> SpotShape {
        let mut signs = Array3::zeros((3, 3, 1));
        signs[[1, 1, 0]] = 1i8;
        signs[[0, 1, 0]] = 1;
        signs[[2, 1, 0]] = 1;
        SpotShape { signs }
    }

    #[test]
    fn test_score_weighted_mean_of_transformed_coefficients() {
        let volume = volume_with(
            &[([4, 4, 0], 1.0), ([3, 4, 0], 0.5), ([5, 4, 0], 0.5)],
            (8, 8, 1),
        );
        let score = score_spot(&volume, [4, 4, 0], &center_shape(), 0.4);

        let expected = (1.0 / 1.4 + 2.0 * (0.5 / 0.9)) / 3.0;
        assert!((score - expected).abs() < 1e-6);
    }

    #[test]
    fn test_negative_coefficients_score_zero_contribution() {
        let volume = volume_with(&[([4, 4, 0], 1.0), ([3, 4, 0], -2.0)], (8, 8, 1));
        let score = score_spot(&volume, [4, 4, 0], &center_shape(), 0.4);
        // only the centre contributes; the negative lobe maps to zero
        assert!((score - (1.0 / 1.4) / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_negative_shape_weight_penalizes_positive_coefficient() {
        let mut shape = center_shape();
        shape.signs[[0, 1, 0]] = -1;

        let aligned = volume_with(&[([4, 4, 0], 1.0)], (8, 8, 1));
        let misaligned = volume_with(&[([4, 4, 0], 1.0), ([3, 4, 0], 1.0)], (8, 8, 1));

        let aligned_score = score_spot(&aligned, [4, 4, 0], &shape, 0.4);
        let misaligned_score = score_spot(&misaligned, [4, 4, 0], &shape, 0.4);
        assert!(misaligned_score < aligned_score);
    }

    #[test]
    fn test_score_clamped_to_unit_interval() {
        let mut signs = Array3::zeros((1, 1, 1));
        signs[[0, 0, 0]] = -1i8;
        let shape = SpotShape { signs };

        let volume = volume_with(&[([2, 2, 0], 5.0)], (4, 4, 1));
        assert_eq!(score_spot(&volume, [2, 2, 0], &shape, 0.4), 0.0);
    }

    #[test]
    fn test_higher_bias_flattens_scores() {
        let volume = volume_with(&[([4, 4, 0], 2.0)], (8, 8, 1));
        let mut signs = Array3::zeros((1, 1, 1));
        signs[[0, 0, 0]] = 1i8;
        let shape = SpotShape { signs };

        let sharp = score_spot(&volume, [4, 4, 0], &shape, 0.1);
        let flat = score_spot(&volume, [4, 4, 0], &shape, 2.0);
        assert!(flat < sharp);
    }

    #[test]
    fn test_edge_window_normalized_over_in_bounds_weights() {
        // candidate at the volume corner: only in-bounds shape positions
        // participate in the mean
        let volume = volume_with(&[([0, 0, 0], 1.0), ([1, 0, 0], 1.0)], (8, 8, 1));
        let score = score_spot(&volume, [0, 0, 0], &center_shape(), 0.4);
        let expected = (2.0 * (1.0 / 1.4)) / 2.0;
        assert!((score - expected).abs() < 1e-6);
    }

    #[test]
    fn test_detect_and_score_filters_low_scores() {
        let config = CallerConfig {
            coefficient_threshold: 0.2,
            radius_xy: 2,
            radius_z: 1,
            high_coef_bias: 0.4,
            score_threshold: 0.5,
            ..CallerConfig::default()
        };
        // a lone weak peak scores (0.3/0.7)/3 ≈ 0.14 under the cross shape
        let volume = volume_with(&[([4, 4, 0], 0.3)], (8, 8, 1));
        assert!(detect_and_score_gene(&volume, &center_shape(), &config).is_empty());

        // a strong peak with matching lobes passes
        let volume = volume_with(
            &[([4, 4, 0], 4.0), ([3, 4, 0], 2.0), ([5, 4, 0], 2.0)],
            (8, 8, 1),
        );
        let candidates = detect_and_score_gene(&volume, &center_shape(), &config);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].position, [4, 4, 0]);
        assert_eq!(candidates[0].coefficient, 4.0);
        assert!(candidates[0].score > 0.5);
    }
}
