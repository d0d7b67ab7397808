use csv;
use flate2::read::GzDecoder;
use ndarray::{Array1, Array2};
use std::fs::File;
use std::io::Read;

use super::error::CallError;

// Unit-norm tolerance for codes supplied by the reference calling stage.
const NORM_TOLERANCE: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    Ordinary,
    Background,
}

// One gene's expected per-round/per-channel signature, unit L2-normalized.
// Background codes are ordinary dictionary entries everywhere in the solver;
// the kind tag exists only for downstream reporting.
#[derive(Debug, Clone)]
pub struct GeneCode {
    pub name: String,
    pub kind: CodeKind,
    pub code: Array1<f32>,
}

pub struct Codebook {
    pub rounds: usize,
    pub channels: usize,
    codes: Vec<GeneCode>,
}

fn find_column(headers: &csv::StringRecord, column: &str) -> Result<usize, CallError> {
    headers
        .iter()
        .position(|x| x == column)
        .ok_or_else(|| CallError::Codebook(format!("column '{}' not found", column)))
}

impl Codebook {
    /// Assemble a codebook from codes already in memory.
    pub fn from_parts(rounds: usize, channels: usize, codes: Vec<GeneCode>) -> Codebook {
        Codebook {
            rounds,
            channels,
            codes,
        }
    }

    /// Read gene codes from a csv (or gzipped csv) with a `gene` column and
    /// one `r<i>c<j>` column per round/channel pair, in round-major order.
    pub fn from_csv(path: &str, rounds: usize, channels: usize) -> Result<Codebook, CallError> {
        let file = File::open(path)?;
        if path.ends_with(".gz") {
            Codebook::from_reader(csv::Reader::from_reader(GzDecoder::new(file)), rounds, channels)
        } else {
            Codebook::from_reader(csv::Reader::from_reader(file), rounds, channels)
        }
    }

    fn from_reader<T>(
        mut rdr: csv::Reader<T>,
        rounds: usize,
        channels: usize,
    ) -> Result<Codebook, CallError>
    where
        T: Read,
    {
        let headers = rdr
            .headers()
            .map_err(|e| CallError::Codebook(format!("reading header: {}", e)))?
            .clone();
        let gene_col = find_column(&headers, "gene")?;

        let mut value_cols = Vec::with_capacity(rounds * channels);
        for r in 0..rounds {
            for c in 0..channels {
                value_cols.push(find_column(&headers, &format!("r{}c{}", r, c))?);
            }
        }

        let mut codes = Vec::new();
        for result in rdr.records() {
            let row = result.map_err(|e| CallError::Codebook(format!("reading row: {}", e)))?;
            let name = row[gene_col].to_string();

            let mut code = Array1::zeros(rounds * channels);
            for (i, &col) in value_cols.iter().enumerate() {
                code[i] = row[col].parse::<f32>().map_err(|e| {
                    CallError::Codebook(format!("gene {}: bad value '{}': {}", name, &row[col], e))
                })?;
            }

            let norm = code.dot(&code).sqrt();
            if (norm - 1.0).abs() > NORM_TOLERANCE {
                return Err(CallError::Codebook(format!(
                    "gene {} code has norm {:.4}, expected unit norm",
                    name, norm
                )));
            }

            codes.push(GeneCode {
                name,
                kind: CodeKind::Ordinary,
                code,
            });
        }

        if codes.is_empty() {
            return Err(CallError::Codebook("no gene codes found".into()));
        }

        Ok(Codebook {
            rounds,
            channels,
            codes,
        })
    }

    /// Append one synthetic background code per channel: uniform brightness
    /// in that channel across every round, L2-normalized like gene codes.
    pub fn append_background_codes(&mut self) {
        let value = 1.0 / (self.rounds as f32).sqrt();
        for c in 0..self.channels {
            let mut code = Array1::zeros(self.rounds * self.channels);
            for r in 0..self.rounds {
                code[r * self.channels + c] = value;
            }
            self.codes.push(GeneCode {
                name: format!("background_c{}", c),
                kind: CodeKind::Background,
                code,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn codes(&self) -> &[GeneCode] {
        &self.codes
    }

    pub fn names(&self) -> Vec<String> {
        self.codes.iter().map(|gc| gc.name.clone()).collect()
    }

    pub fn ordinary_indices(&self) -> Vec<usize> {
        self.codes
            .iter()
            .enumerate()
            .filter(|(_, gc)| gc.kind == CodeKind::Ordinary)
            .map(|(g, _)| g)
            .collect()
    }

    /// Dense (n_codes, rounds*channels) dictionary matrix for the solver.
    pub fn code_matrix(&self) -> Array2<f32> {
        let n_rc = self.rounds * self.channels;
        let mut matrix = Array2::zeros((self.codes.len(), n_rc));
        for (g, gc) in self.codes.iter().enumerate() {
            matrix.row_mut(g).assign(&gc.code);
        }
        matrix
    }

    /// Order-insensitive to nothing: any change to names, kinds, or code
    /// values produces a different fingerprint. Used to invalidate
    /// checkpoints when the dictionary changes between runs.
    pub fn fingerprint(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        self.rounds.hash(&mut hasher);
        self.channels.hash(&mut hasher);
        for gc in &self.codes {
            gc.name.hash(&mut hasher);
            (gc.kind == CodeKind::Background).hash(&mut hasher);
            for &x in gc.code.iter() {
                x.to_bits().hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}
