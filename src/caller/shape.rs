use log::info;
use ndarray::Array3;

use super::config::CallerConfig;
use super::error::CallError;
use super::volume::CoefficientVolumes;

/// Below this many isolated spots the mean sign is too noisy to threshold;
/// calibration fails explicitly rather than producing a degenerate shape.
pub const MIN_CALIBRATION_SPOTS: usize = 10;

/// Expected sign pattern of a true spot's coefficient neighbourhood:
/// a small odd-dimensioned (y, x, z) template with values in {-1, 0, +1}.
/// Computed once per run, read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotShape {
    pub signs: Array3<i8>,
}

impl SpotShape {
    pub fn dims(&self) -> [usize; 3] {
        let (dy, dx, dz) = self.signs.dim();
        [dy, dx, dz]
    }

    /// Half-extents; dims are odd so the template centres on a voxel.
    pub fn radii(&self) -> [usize; 3] {
        let [dy, dx, dz] = self.dims();
        [dy / 2, dx / 2, dz / 2]
    }
}

fn sign_of(value: f32) -> f32 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

// Voxels strictly greater than all 26 neighbours and above the threshold.
// Plateaus are not maxima here: a calibration spot must dominate its
// neighbourhood outright.
fn local_maxima(volume: &Array3<f32>, threshold: f32) -> Vec<[usize; 3]> {
    let (ny, nx, nz) = volume.dim();
    let mut maxima = Vec::new();

    for y in 0..ny {
        for x in 0..nx {
            'voxel: for z in 0..nz {
                let v = volume[[y, x, z]];
                if v <= threshold {
                    continue;
                }
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        for dz in -1i64..=1 {
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
                            if volume[[yy as usize, xx as usize, zz as usize]] >= v {
                                continue 'voxel;
                            }
                        }
                    }
                }
                maxima.push([y, x, z]);
            }
        }
    }
    maxima
}

// A maximum is isolated when no other maximum of the same gene sits within
// the isolation cylinder (xy distance and z distance both inside their
// thresholds).
fn is_isolated(maxima: &[[usize; 3]], i: usize, isolation_yx: f32, isolation_z: f32) -> bool {
    let [y, x, z] = maxima[i];
    for (j, &[oy, ox, oz]) in maxima.iter().enumerate() {
        if j == i {
            continue;
        }
        let dyx = ((y as f32 - oy as f32).powi(2) + (x as f32 - ox as f32).powi(2)).sqrt();
        let dz = (z as f32 - oz as f32).abs();
        if dyx <= isolation_yx && dz <= isolation_z {
            return false;
        }
    }
    true
}

/// Learn the spot sign template from well-isolated coefficient maxima on
/// one reference tile. Runs exactly once per job; every later tile consumes
/// the result read-only.
///
/// Windows are extracted per gene from that gene's own coefficient volume,
/// zero-padded at tile edges, and their signs averaged position-wise over
/// every collected spot. Mean magnitudes below `shape_sign_thresh` are
/// zeroed, the rest round to the dominant sign.
pub fn calibrate_spot_shape(
    volumes: &CoefficientVolumes,
    ordinary_genes: &[usize],
    config: &CallerConfig,
) -> Result<SpotShape, CallError> {
    let [sy, sx, sz] = config.spot_shape_size;
    let (ry, rx, rz) = (sy as i64 / 2, sx as i64 / 2, sz as i64 / 2);
    let (ny, nx, nz) = {
        let [a, b, c] = volumes.shape;
        (a as i64, b as i64, c as i64)
    };

    let mut sign_sum = Array3::<f32>::zeros((sy, sx, sz));
    let mut n_spots = 0usize;

    'genes: for &g in ordinary_genes {
        let volume = &volumes.volumes[g];
        let maxima = local_maxima(volume, config.shape_coefficient_threshold);

        for i in 0..maxima.len() {
            if !is_isolated(
                &maxima,
                i,
                config.shape_isolation_distance_yx,
                config.shape_isolation_distance_z,
            ) {
                continue;
            }

            let [y, x, z] = maxima[i];
            for wy in 0..sy {
                for wx in 0..sx {
                    for wz in 0..sz {
                        let yy = y as i64 + wy as i64 - ry;
                        let xx = x as i64 + wx as i64 - rx;
                        let zz = z as i64 + wz as i64 - rz;
                        // out of bounds pads with zero: contributes a zero
                        // sign to the mean like the rest of the window
                        if yy < 0 || yy >= ny || xx < 0 || xx >= nx || zz < 0 || zz >= nz {
                            continue;
                        }
                        sign_sum[[wy, wx, wz]] +=
                            sign_of(volume[[yy as usize, xx as usize, zz as usize]]);
                    }
                }
            }

            n_spots += 1;
            if n_spots >= config.spot_shape_max_spots {
                break 'genes;
            }
        }
    }

    if n_spots < MIN_CALIBRATION_SPOTS {
        return Err(CallError::InsufficientCalibrationData {
            found: n_spots,
            needed: MIN_CALIBRATION_SPOTS,
        });
    }

    info!(
        "spot shape calibrated from {} isolated spots on tile {}",
        n_spots, volumes.tile
    );

    let signs = sign_sum.mapv(|s| {
        let mean = s / n_spots as f32;
        if mean.abs() < config.shape_sign_thresh {
            0i8
        } else if mean > 0.0 {
            1
        } else {
            -1
        }
    });

    Ok(SpotShape { signs })
}
