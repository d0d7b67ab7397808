use crc::Crc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use super::config::CallerConfig;
use super::error::CallError;
use super::shape::SpotShape;
use super::volume::CoefficientVolumes;
use super::Spot;

// Record header: magic, format version, payload length, payload CRC-32.
// Anything that fails these checks is corruption, full stop.
const MAGIC: &[u8; 8] = b"PXCKPT01";
pub const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 8 + 4;
const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_CKSUM);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileStage {
    /// Coefficient volumes persisted, spots not yet scored. Not treated as
    /// complete on resume.
    Coefficients,
    /// Fully processed: volumes and scored spots.
    Scored,
}

/// One nonzero coefficient, `index` being the raster position
/// `(y*nx + x)*nz + z` within the tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientEntry {
    pub gene: u32,
    pub index: u64,
    pub value: f32,
}

/// The checkpoint unit: everything one completed tile produced. Written
/// atomically; visible either in full or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRecord {
    pub tile: u32,
    pub stage: TileStage,
    pub tile_shape: [usize; 3],
    pub coefficients: Vec<CoefficientEntry>,
    pub spots: Vec<Spot>,
}

impl TileRecord {
    pub fn new(volumes: &CoefficientVolumes, spots: Vec<Spot>, stage: TileStage) -> TileRecord {
        let mut coefficients = Vec::new();
        for (g, volume) in volumes.volumes.iter().enumerate() {
            let (_, nx, nz) = volume.dim();
            for ((y, x, z), &value) in volume.indexed_iter() {
                if value != 0.0 {
                    coefficients.push(CoefficientEntry {
                        gene: g as u32,
                        index: ((y * nx + x) * nz + z) as u64,
                        value,
                    });
                }
            }
        }
        TileRecord {
            tile: volumes.tile,
            stage,
            tile_shape: volumes.shape,
            coefficients,
            spots,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRecord {
    pub dims: [usize; 3],
    pub signs: Vec<i8>,
}

impl ShapeRecord {
    pub fn from_shape(shape: &SpotShape) -> ShapeRecord {
        ShapeRecord {
            dims: shape.dims(),
            signs: shape.signs.iter().copied().collect(),
        }
    }

    pub fn to_shape(&self) -> SpotShape {
        let [dy, dx, dz] = self.dims;
        let signs = ndarray::Array3::from_shape_vec((dy, dx, dz), self.signs.clone())
            .expect("shape record dims inconsistent with sign count");
        SpotShape { signs }
    }
}

/// Everything that must match for old tile records to stay valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub format_version: u32,
    pub codebook_fingerprint: u64,
    pub n_codes: usize,
    pub config: CallerConfig,
}

/// Single-writer, per-run checkpoint directory. Tile records and the spot
/// shape are length- and CRC-guarded bincode; the run manifest is
/// human-readable json.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn open(dir: &Path) -> Result<CheckpointStore, CallError> {
        fs::create_dir_all(dir)?;
        Ok(CheckpointStore {
            dir: dir.to_path_buf(),
        })
    }

    fn tile_path(&self, tile: u32) -> PathBuf {
        self.dir.join(format!("tile_{:04}.ckpt", tile))
    }

    fn shape_path(&self) -> PathBuf {
        self.dir.join("spot_shape.ckpt")
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join("run_manifest.json")
    }

    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<(), CallError> {
        let path = self.manifest_path();
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, manifest)
            .map_err(|e| CallError::Io(std::io::Error::new(ErrorKind::Other, e)))?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn read_manifest(&self) -> Result<Option<RunManifest>, CallError> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path)?;
        let manifest = serde_json::from_reader(file).map_err(|e| CallError::CheckpointCorruption {
            path: path.display().to_string(),
            reason: format!("unparseable manifest: {}", e),
        })?;
        Ok(Some(manifest))
    }

    pub fn write_tile(&self, record: &TileRecord) -> Result<(), CallError> {
        write_record(&self.tile_path(record.tile), record)
    }

    pub fn read_tile(&self, tile: u32) -> Result<Option<TileRecord>, CallError> {
        let path = self.tile_path(tile);
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    pub fn write_shape(&self, record: &ShapeRecord) -> Result<(), CallError> {
        write_record(&self.shape_path(), record)
    }

    pub fn read_shape(&self) -> Result<Option<ShapeRecord>, CallError> {
        let path = self.shape_path();
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    /// Tiles with a fully validated `Scored` record. Any invalid record is
    /// fatal here: resuming over unverified state is never allowed.
    pub fn completed_tiles(&self, tiles: &[u32]) -> Result<Vec<u32>, CallError> {
        let mut completed = Vec::new();
        for &tile in tiles {
            if let Some(record) = self.read_tile(tile)? {
                if record.stage == TileStage::Scored {
                    completed.push(tile);
                }
            }
        }
        Ok(completed)
    }
}

/// Read a spot shape record from an arbitrary path, validated like any
/// other checkpoint record. Lets a run substitute a shape calibrated by a
/// previous run when its own data cannot support calibration.
pub fn read_shape_record(path: &Path) -> Result<ShapeRecord, CallError> {
    read_record(path)
}

fn write_record<T: Serialize>(path: &Path, value: &T) -> Result<(), CallError> {
    let payload = bincode::serialize(value)
        .map_err(|e| CallError::Io(std::io::Error::new(ErrorKind::Other, e)))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&CRC32.checksum(&payload).to_le_bytes());
    bytes.extend_from_slice(&payload);

    // full write to a sibling, then an atomic rename: a crash mid-write
    // never leaves a record that looks complete
    let tmp = path.with_extension("ckpt.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T, CallError> {
    let corruption = |reason: String| CallError::CheckpointCorruption {
        path: path.display().to_string(),
        reason,
    };

    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    if bytes.len() < HEADER_LEN {
        return Err(corruption(format!("truncated header: {} bytes", bytes.len())));
    }
    if &bytes[0..8] != MAGIC {
        return Err(corruption("bad magic".into()));
    }
    let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(corruption(format!("unsupported format version {}", version)));
    }
    let payload_len = u64::from_le_bytes(bytes[12..20].try_into().unwrap()) as usize;
    let stored_crc = u32::from_le_bytes(bytes[20..24].try_into().unwrap());

    let payload = &bytes[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(corruption(format!(
            "payload length {} does not match header {}",
            payload.len(),
            payload_len
        )));
    }
    if CRC32.checksum(payload) != stored_crc {
        return Err(corruption("crc mismatch".into()));
    }

    bincode::deserialize(payload).map_err(|e| corruption(format!("undecodable payload: {}", e)))
}
