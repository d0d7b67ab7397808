pub mod checkpoint;
pub mod codebook;
pub mod config;
pub mod detect;
pub mod error;
mod lstsq;
pub mod pursuit;
pub mod shape;
pub mod tiles;
pub mod volume;

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

use checkpoint::{CheckpointStore, RunManifest, ShapeRecord, TileRecord, TileStage};
use codebook::Codebook;
use config::CallerConfig;
use detect::detect_and_score_gene;
use error::CallError;
use pursuit::PursuitSolver;
use shape::{calibrate_spot_shape, SpotShape};
use tiles::TileStack;
use volume::{build_coefficient_volumes, SolveBackend};

/// One accepted gene call. Position is tile-local raster coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    pub tile: u32,
    pub gene: u32,
    pub y: u32,
    pub x: u32,
    pub z: u32,
    pub coefficient: f32,
    pub score: f32,
}

pub struct PipelineSummary {
    pub spots: Vec<Spot>,
    pub n_tiles: usize,
    pub n_tiles_skipped: usize,
}

fn tile_progress_bar(tile: u32, n_pixels: u64) -> ProgressBar {
    let pb = ProgressBar::new(n_pixels);
    pb.set_style(
        ProgressStyle::with_template(
            "{msg} [{bar:40}] {pos}/{len} pixels ({elapsed})",
        )
        .unwrap(),
    );
    pb.set_message(format!("tile {}", tile));
    pb
}

/// Run gene calling over every tile in the stack, resuming from whatever
/// the checkpoint store already holds.
///
/// Tiles are processed sequentially: the spot shape must be calibrated from
/// the reference tile's coefficients before any tile can be scored, and the
/// per-tile volumes dominate memory. The reference tile is always processed
/// first; every other tile follows in ascending order. Interrupting the run
/// loses at most the in-flight tile.
pub fn run_pipeline(
    stack: &TileStack,
    codebook: &Codebook,
    config: &CallerConfig,
    checkpoint_dir: &Path,
    backend: &dyn SolveBackend,
    shape_override: Option<SpotShape>,
) -> Result<PipelineSummary, CallError> {
    config.validate()?;
    if stack.manifest.rounds != codebook.rounds || stack.manifest.channels != codebook.channels {
        return Err(CallError::Config(format!(
            "tile stack has {} rounds x {} channels but the codebook has {} x {}",
            stack.manifest.rounds, stack.manifest.channels, codebook.rounds, codebook.channels
        )));
    }

    let mut tile_order = stack.manifest.tiles.clone();
    tile_order.sort();
    tile_order.dedup();

    let reference_tile = config.shape_reference_tile.unwrap_or(tile_order[0]);
    if !tile_order.contains(&reference_tile) {
        return Err(CallError::Config(format!(
            "shape_reference_tile {} is not in the tile stack",
            reference_tile
        )));
    }
    // the reference tile goes first so its coefficients can calibrate the
    // shape every other tile is scored with
    tile_order.sort_by_key(|&t| (t != reference_tile, t));

    let solver = PursuitSolver::new(codebook.code_matrix(), config);
    let ordinary_genes = codebook.ordinary_indices();
    let store = CheckpointStore::open(checkpoint_dir)?;

    let manifest = RunManifest {
        format_version: checkpoint::FORMAT_VERSION,
        codebook_fingerprint: codebook.fingerprint(),
        n_codes: codebook.len(),
        config: config.clone(),
    };
    let resumable = match store.read_manifest()? {
        Some(previous) if previous == manifest => true,
        Some(_) => {
            warn!(
                "checkpoints in {} were written under a different configuration or codebook; \
                 recomputing all tiles",
                checkpoint_dir.display()
            );
            false
        }
        None => false,
    };
    store.write_manifest(&manifest)?;

    let mut spot_shape = shape_override;
    if spot_shape.is_none() && resumable {
        spot_shape = store.read_shape()?.map(|record| record.to_shape());
        if spot_shape.is_some() {
            info!("resuming with the previously calibrated spot shape");
        }
    }

    let completed: HashSet<u32> = if resumable {
        store.completed_tiles(&tile_order)?.into_iter().collect()
    } else {
        HashSet::new()
    };

    let [ny, nx, nz] = stack.manifest.tile_shape;
    let n_tile_pixels = (ny * nx * nz) as u64;
    let mut n_tiles_skipped = 0usize;

    for &tile in &tile_order {
        if completed.contains(&tile) && spot_shape.is_some() {
            info!("tile {}: found checkpointed results, skipping", tile);
            n_tiles_skipped += 1;
            continue;
        }

        let t0 = Instant::now();
        let colours = stack.load_tile(tile)?;

        let pb = tile_progress_bar(tile, n_tile_pixels);
        let volumes = build_coefficient_volumes(&colours, &solver, config, backend, Some(&pb));
        pb.finish_and_clear();

        if spot_shape.is_none() {
            let shape = calibrate_spot_shape(&volumes, &ordinary_genes, config)?;
            store.write_shape(&ShapeRecord::from_shape(&shape))?;
            spot_shape = Some(shape);
        }
        let shape = spot_shape.as_ref().unwrap();

        let mut spots = Vec::new();
        for &g in &ordinary_genes {
            for candidate in detect_and_score_gene(&volumes.volumes[g], shape, config) {
                spots.push(Spot {
                    tile,
                    gene: g as u32,
                    y: candidate.position[0] as u32,
                    x: candidate.position[1] as u32,
                    z: candidate.position[2] as u32,
                    coefficient: candidate.coefficient,
                    score: candidate.score,
                });
            }
        }
        if spots.is_empty() {
            warn!("tile {}: no spots passed scoring", tile);
        }

        let record = TileRecord::new(&volumes, spots, TileStage::Scored);
        store.write_tile(&record)?;
        info!(
            "tile {}: {} spots in {:?}",
            tile,
            record.spots.len(),
            t0.elapsed()
        );
    }

    // aggregate the final spot set from the records, in ascending tile order
    let mut aggregate_order = tile_order.clone();
    aggregate_order.sort();
    let mut spots = Vec::new();
    for &tile in &aggregate_order {
        let record = store
            .read_tile(tile)?
            .ok_or_else(|| CallError::CheckpointCorruption {
                path: checkpoint_dir.display().to_string(),
                reason: format!("record for processed tile {} disappeared", tile),
            })?;
        spots.extend(record.spots);
    }

    Ok(PipelineSummary {
        spots,
        n_tiles: tile_order.len(),
        n_tiles_skipped,
    })
}
