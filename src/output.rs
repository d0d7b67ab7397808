use arrow::array::{ArrayRef, Float32Array, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use flate2::write::GzEncoder;
use flate2::Compression;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression as ParquetCompression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::sync::Arc;

use crate::caller::Spot;

pub enum OutputFormat {
    Csv,
    CsvGz,
    Parquet,
}

pub fn determine_format(filename: &str, fmtstr: &Option<String>) -> OutputFormat {
    if let Some(fmtstr) = fmtstr {
        if fmtstr == "csv.gz" {
            return OutputFormat::CsvGz;
        } else if fmtstr == "csv" {
            return OutputFormat::Csv;
        } else if fmtstr == "parquet" {
            return OutputFormat::Parquet;
        } else {
            panic!("Unknown file format: {}", fmtstr);
        }
    }

    if filename.ends_with(".csv.gz") {
        return OutputFormat::CsvGz;
    } else if filename.ends_with(".csv") {
        return OutputFormat::Csv;
    } else if filename.ends_with(".parquet") {
        return OutputFormat::Parquet;
    } else {
        panic!("Unknown file format for: {}", filename);
    }
}

fn write_table(filename: &str, fmtstr: &Option<String>, batch: &RecordBatch) {
    let fmt = determine_format(filename, fmtstr);
    let file = File::create(filename).unwrap();

    match fmt {
        OutputFormat::Csv => {
            if write_table_csv(file, batch).is_err() {
                panic!("Error writing csv file: {}", filename);
            }
        }
        OutputFormat::CsvGz => {
            let encoder = GzEncoder::new(file, Compression::default());
            if write_table_csv(encoder, batch).is_err() {
                panic!("Error writing csv.gz file: {}", filename);
            }
        }
        OutputFormat::Parquet => {
            if write_table_parquet(file, batch).is_err() {
                panic!("Error writing parquet file: {}", filename);
            }
        }
    }
}

fn write_table_csv<W>(output: W, batch: &RecordBatch) -> Result<(), arrow::error::ArrowError>
where
    W: std::io::Write,
{
    let mut writer = arrow::csv::WriterBuilder::new()
        .with_header(true)
        .build(output);
    writer.write(batch)
}

fn write_table_parquet(output: File, batch: &RecordBatch) -> parquet::errors::Result<()> {
    let props = WriterProperties::builder()
        .set_compression(ParquetCompression::ZSTD(ZstdLevel::default()))
        .build();
    let mut writer = ArrowWriter::try_new(output, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

/// Write the final spot table: one row per accepted gene call with its
/// tile, gene name, tile-local position, coefficient, and score.
pub fn write_spots(filename: &str, fmtstr: &Option<String>, spots: &[Spot], gene_names: &[String]) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("tile", DataType::UInt32, false),
        Field::new("gene", DataType::Utf8, false),
        Field::new("y", DataType::UInt32, false),
        Field::new("x", DataType::UInt32, false),
        Field::new("z", DataType::UInt32, false),
        Field::new("coefficient", DataType::Float32, false),
        Field::new("score", DataType::Float32, false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(UInt32Array::from_iter_values(spots.iter().map(|s| s.tile))),
        Arc::new(StringArray::from_iter_values(
            spots.iter().map(|s| gene_names[s.gene as usize].as_str()),
        )),
        Arc::new(UInt32Array::from_iter_values(spots.iter().map(|s| s.y))),
        Arc::new(UInt32Array::from_iter_values(spots.iter().map(|s| s.x))),
        Arc::new(UInt32Array::from_iter_values(spots.iter().map(|s| s.z))),
        Arc::new(Float32Array::from_iter_values(
            spots.iter().map(|s| s.coefficient),
        )),
        Arc::new(Float32Array::from_iter_values(spots.iter().map(|s| s.score))),
    ];

    let batch = RecordBatch::try_new(schema, columns).unwrap();
    write_table(filename, fmtstr, &batch);
}
