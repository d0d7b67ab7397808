use thiserror::Error;

/// Errors produced by the gene calling pipeline.
///
/// Per-pixel numerical degeneracy is deliberately absent: a rank-deficient
/// refit falls back to a minimum-norm solution and never fails the pixel.
#[derive(Error, Debug)]
pub enum CallError {
    /// Rejected configuration. Fatal at startup, never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Spot shape calibration could not find enough isolated spots.
    /// Surfaced explicitly so the caller can abort or substitute a shape
    /// from a previous run; an all-zero shape would silently zero every
    /// spot score.
    #[error("spot shape calibration found {found} isolated spots, need at least {needed}")]
    InsufficientCalibrationData { found: usize, needed: usize },

    /// A stored tile record failed integrity validation on resume.
    /// Fatal: requires operator intervention, never auto-resumed.
    #[error("checkpoint record {path} failed validation: {reason}")]
    CheckpointCorruption { path: String, reason: String },

    /// Malformed or inconsistent codebook input.
    #[error("codebook: {0}")]
    Codebook(String),

    /// Malformed or inconsistent tile stack input. Aborts the affected
    /// tile's processing and leaves the checkpoint unchanged.
    #[error("tile stack: {0}")]
    TileStack(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
