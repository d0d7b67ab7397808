use byteorder::{LittleEndian, ReadBytesExt};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::error::CallError;

/// Tile stack layout produced by the filtering/registration stage: a
/// `manifest.json` plus one raw little-endian f32 file per tile, raster
/// ordered (y, x, z) with a round-major rounds×channels vector per pixel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackManifest {
    pub tiles: Vec<u32>,
    pub tile_shape: [usize; 3],
    pub rounds: usize,
    pub channels: usize,
}

/// One tile's normalized pixel intensity vectors, (n_pixels, rounds*channels).
/// Row `p` is the pixel at raster index `p = (y*nx + x)*nz + z`.
pub struct TileColours {
    pub tile: u32,
    pub shape: [usize; 3],
    pub rounds: usize,
    pub channels: usize,
    pub data: Array2<f32>,
}

pub struct TileStack {
    dir: PathBuf,
    pub manifest: StackManifest,
}

impl TileStack {
    pub fn open(dir: &Path) -> Result<TileStack, CallError> {
        let manifest_path = dir.join("manifest.json");
        let file = File::open(&manifest_path).map_err(|e| {
            CallError::TileStack(format!("opening {}: {}", manifest_path.display(), e))
        })?;
        let manifest: StackManifest = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| CallError::TileStack(format!("parsing manifest: {}", e)))?;

        if manifest.tiles.is_empty() {
            return Err(CallError::TileStack("manifest lists no tiles".into()));
        }
        if manifest.tile_shape.iter().any(|&d| d == 0)
            || manifest.rounds == 0
            || manifest.channels == 0
        {
            return Err(CallError::TileStack(format!(
                "degenerate dimensions: shape {:?}, {} rounds, {} channels",
                manifest.tile_shape, manifest.rounds, manifest.channels
            )));
        }

        Ok(TileStack {
            dir: dir.to_path_buf(),
            manifest,
        })
    }

    pub fn tile_path(&self, tile: u32) -> PathBuf {
        self.dir.join(format!("tile_{:04}.f32", tile))
    }

    pub fn load_tile(&self, tile: u32) -> Result<TileColours, CallError> {
        let [ny, nx, nz] = self.manifest.tile_shape;
        let n_rc = self.manifest.rounds * self.manifest.channels;
        let n_values = ny * nx * nz * n_rc;

        let path = self.tile_path(tile);
        let file = File::open(&path)
            .map_err(|e| CallError::TileStack(format!("opening {}: {}", path.display(), e)))?;
        let n_bytes = file
            .metadata()
            .map_err(|e| CallError::TileStack(format!("stat {}: {}", path.display(), e)))?
            .len();
        if n_bytes != (n_values * 4) as u64 {
            return Err(CallError::TileStack(format!(
                "{}: expected {} bytes for a {}x{}x{} tile with {} rounds/channels, found {}",
                path.display(),
                n_values * 4,
                ny,
                nx,
                nz,
                n_rc,
                n_bytes
            )));
        }

        let mut values = vec![0.0f32; n_values];
        BufReader::new(file)
            .read_f32_into::<LittleEndian>(&mut values)
            .map_err(|e| CallError::TileStack(format!("reading {}: {}", path.display(), e)))?;

        let data = Array2::from_shape_vec((ny * nx * nz, n_rc), values)
            .expect("tile buffer shape mismatch");

        Ok(TileColours {
            tile,
            shape: self.manifest.tile_shape,
            rounds: self.manifest.rounds,
            channels: self.manifest.channels,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    pub fn write_stack(
        dir: &Path,
        manifest: &StackManifest,
        tile_values: &[(u32, Vec<f32>)],
    ) {
        std::fs::create_dir_all(dir).unwrap();
        let mut file = File::create(dir.join("manifest.json")).unwrap();
        file.write_all(serde_json::to_string(manifest).unwrap().as_bytes())
            .unwrap();
        for (tile, values) in tile_values {
            let mut file = File::create(dir.join(format!("tile_{:04}.f32", tile))).unwrap();
            for &v in values {
                file.write_f32::<LittleEndian>(v).unwrap();
            }
        }
    }

    #[test]
    fn test_roundtrip_tile() {
        let dir = std::env::temp_dir().join(format!("pixelcall_stack_{}", std::process::id()));
        let manifest = StackManifest {
            tiles: vec![3],
            tile_shape: [2, 2, 1],
            rounds: 1,
            channels: 2,
        };
        let values: Vec<f32> = (0..8).map(|i| i as f32 * 0.5).collect();
        write_stack(&dir, &manifest, &[(3, values.clone())]);

        let stack = TileStack::open(&dir).unwrap();
        let colours = stack.load_tile(3).unwrap();
        assert_eq!(colours.shape, [2, 2, 1]);
        assert_eq!(colours.data.nrows(), 4);
        assert_eq!(colours.data[[0, 0]], 0.0);
        assert_eq!(colours.data[[3, 1]], 3.5);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_size_mismatch_is_an_error() {
        let dir =
            std::env::temp_dir().join(format!("pixelcall_stack_bad_{}", std::process::id()));
        let manifest = StackManifest {
            tiles: vec![0],
            tile_shape: [2, 2, 1],
            rounds: 1,
            channels: 2,
        };
        // one value short
        write_stack(&dir, &manifest, &[(0, vec![0.0; 7])]);

        let stack = TileStack::open(&dir).unwrap();
        assert!(matches!(
            stack.load_tile(0),
            Err(CallError::TileStack(_))
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
