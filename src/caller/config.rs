use serde::{Deserialize, Serialize};

use super::error::CallError;

// Caller parameters. Serialized into the run manifest so that resumed runs
// can tell whether existing tile records were produced under the same
// settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerConfig {
    // pursuit
    pub weight_coef_fit: bool,
    pub max_genes: usize,
    pub dp_thresh: f32,
    pub alpha: f32,
    pub beta: f32,

    // coefficient volume builder
    pub subset_size_xy: usize,
    pub pixel_max_percentile: f32,

    // spot detection
    pub coefficient_threshold: f32,
    pub radius_xy: usize,
    pub radius_z: usize,

    // spot shape calibration
    pub spot_shape_size: [usize; 3],
    pub spot_shape_max_spots: usize,
    pub shape_isolation_distance_yx: f32,
    pub shape_isolation_distance_z: f32,
    pub shape_coefficient_threshold: f32,
    pub shape_sign_thresh: f32,
    pub shape_reference_tile: Option<u32>,

    // spot scoring
    pub high_coef_bias: f32,
    pub score_threshold: f32,
}

impl Default for CallerConfig {
    fn default() -> CallerConfig {
        CallerConfig {
            weight_coef_fit: true,
            max_genes: 5,
            dp_thresh: 0.225,
            alpha: 120.0,
            beta: 1.0,
            subset_size_xy: 128,
            pixel_max_percentile: 90.0,
            coefficient_threshold: 0.2,
            radius_xy: 3,
            radius_z: 2,
            spot_shape_size: [9, 9, 5],
            spot_shape_max_spots: 5000,
            shape_isolation_distance_yx: 10.0,
            shape_isolation_distance_z: 2.0,
            shape_coefficient_threshold: 0.25,
            shape_sign_thresh: 0.15,
            shape_reference_tile: None,
            high_coef_bias: 0.4,
            score_threshold: 0.15,
        }
    }
}

impl CallerConfig {
    // Validate once at startup. Anything rejected here is a fatal
    // configuration error, not something to retry.
    pub fn validate(&self) -> Result<(), CallError> {
        if self.max_genes < 1 {
            return Err(CallError::Config(format!(
                "max_genes must be at least 1, got {}",
                self.max_genes
            )));
        }
        if !(self.dp_thresh > 0.0) {
            return Err(CallError::Config(format!(
                "dp_thresh must be positive, got {}",
                self.dp_thresh
            )));
        }
        if !(self.alpha >= 0.0) {
            return Err(CallError::Config(format!(
                "alpha must be non-negative, got {}",
                self.alpha
            )));
        }
        if !(self.beta > 0.0) {
            return Err(CallError::Config(format!(
                "beta must be positive, got {}",
                self.beta
            )));
        }
        if self.subset_size_xy < 1 {
            return Err(CallError::Config("subset_size_xy must be at least 1".into()));
        }
        if !(0.0..=100.0).contains(&self.pixel_max_percentile) {
            return Err(CallError::Config(format!(
                "pixel_max_percentile must be in [0, 100], got {}",
                self.pixel_max_percentile
            )));
        }
        if !(self.coefficient_threshold > 0.0) {
            return Err(CallError::Config(format!(
                "coefficient_threshold must be positive, got {}",
                self.coefficient_threshold
            )));
        }
        if self.radius_xy < 1 || self.radius_z < 1 {
            return Err(CallError::Config(format!(
                "suppression radii must be at least 1, got radius_xy={}, radius_z={}",
                self.radius_xy, self.radius_z
            )));
        }
        for (i, &dim) in self.spot_shape_size.iter().enumerate() {
            if dim == 0 || dim % 2 == 0 {
                return Err(CallError::Config(format!(
                    "spot_shape_size dimensions must be odd, got {} in axis {}",
                    dim, i
                )));
            }
        }
        if self.spot_shape_max_spots < 1 {
            return Err(CallError::Config(
                "spot_shape_max_spots must be at least 1".into(),
            ));
        }
        if !(self.shape_isolation_distance_yx > 0.0) || !(self.shape_isolation_distance_z > 0.0) {
            return Err(CallError::Config(format!(
                "shape isolation distances must be positive, got yx={}, z={}",
                self.shape_isolation_distance_yx, self.shape_isolation_distance_z
            )));
        }
        if !(self.shape_coefficient_threshold > 0.0) {
            return Err(CallError::Config(format!(
                "shape_coefficient_threshold must be positive, got {}",
                self.shape_coefficient_threshold
            )));
        }
        if !(self.shape_sign_thresh > 0.0 && self.shape_sign_thresh <= 1.0) {
            return Err(CallError::Config(format!(
                "shape_sign_thresh must be in (0, 1], got {}",
                self.shape_sign_thresh
            )));
        }
        if !(self.high_coef_bias >= 0.0) {
            return Err(CallError::Config(format!(
                "high_coef_bias must be non-negative, got {}",
                self.high_coef_bias
            )));
        }
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(CallError::Config(format!(
                "score_threshold must be in [0, 1], got {}",
                self.score_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CallerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_max_genes() {
        let config = CallerConfig {
            max_genes: 0,
            ..CallerConfig::default()
        };
        assert!(matches!(config.validate(), Err(CallError::Config(_))));
    }

    #[test]
    fn test_rejects_out_of_range_percentile() {
        let config = CallerConfig {
            pixel_max_percentile: 100.5,
            ..CallerConfig::default()
        };
        assert!(matches!(config.validate(), Err(CallError::Config(_))));

        let config = CallerConfig {
            pixel_max_percentile: -1.0,
            ..CallerConfig::default()
        };
        assert!(matches!(config.validate(), Err(CallError::Config(_))));
    }

    #[test]
    fn test_rejects_even_spot_shape() {
        let config = CallerConfig {
            spot_shape_size: [9, 8, 5],
            ..CallerConfig::default()
        };
        assert!(matches!(config.validate(), Err(CallError::Config(_))));
    }

    #[test]
    fn test_rejects_nan_thresholds() {
        let config = CallerConfig {
            dp_thresh: f32::NAN,
            ..CallerConfig::default()
        };
        assert!(matches!(config.validate(), Err(CallError::Config(_))));
    }
}
