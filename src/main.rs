use clap::Parser;
use std::path::Path;
use std::process;

mod caller;
mod output;

use caller::checkpoint::read_shape_record;
use caller::codebook::Codebook;
use caller::config::CallerConfig;
use caller::error::CallError;
use caller::tiles::TileStack;
use caller::volume::{RayonBackend, SerialBackend, SolveBackend};
use caller::run_pipeline;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Tile stack directory from the filtering/registration stage:
    /// a manifest.json plus one raw f32 file per tile
    tile_stack: String,

    /// Gene codebook csv with a `gene` column and one r<i>c<j> column per
    /// round/channel pair
    codebook: String,

    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: String,

    #[arg(long, default_value = "spots.csv.gz")]
    output_spots: String,

    #[arg(long, default_value = None)]
    output_spots_fmt: Option<String>,

    /// Reuse a spot_shape.ckpt calibrated by a previous run instead of
    /// calibrating from this run's reference tile
    #[arg(long, default_value = None)]
    spot_shape_path: Option<String>,

    /// Number of solver threads (0 means one per core)
    #[arg(short = 't', long, default_value_t = 0)]
    nthreads: usize,

    /// Solve pixels serially instead of on the thread pool
    #[arg(long, default_value_t = false)]
    serial: bool,

    /// Fit coefficients by plain rather than ε²-weighted least squares
    #[arg(long, default_value_t = false)]
    unweighted_coef_fit: bool,

    #[arg(long, default_value_t = 5)]
    max_genes: usize,

    #[arg(long, default_value_t = 0.225)]
    dp_thresh: f32,

    #[arg(long, default_value_t = 120.0)]
    alpha: f32,

    #[arg(long, default_value_t = 1.0)]
    beta: f32,

    #[arg(long, default_value_t = 128)]
    subset_size_xy: usize,

    /// Only pixels whose max intensity exceeds this percentile of the
    /// tile's distribution are solved; lower it to recover dimmer spots at
    /// higher compute cost
    #[arg(long, default_value_t = 90.0)]
    pixel_max_percentile: f32,

    #[arg(long, default_value_t = 0.2)]
    coefficient_threshold: f32,

    #[arg(long, default_value_t = 3)]
    radius_xy: usize,

    #[arg(long, default_value_t = 2)]
    radius_z: usize,

    #[arg(long, num_args = 3, default_values_t = [9, 9, 5])]
    spot_shape_size: Vec<usize>,

    #[arg(long, default_value_t = 5000)]
    spot_shape_max_spots: usize,

    #[arg(long, default_value_t = 10.0)]
    shape_isolation_distance_yx: f32,

    #[arg(long, default_value_t = 2.0)]
    shape_isolation_distance_z: f32,

    #[arg(long, default_value_t = 0.25)]
    shape_coefficient_threshold: f32,

    #[arg(long, default_value_t = 0.15)]
    shape_sign_thresh: f32,

    /// Calibrate the spot shape from this tile instead of the first one
    #[arg(long)]
    shape_reference_tile: Option<u32>,

    #[arg(long, default_value_t = 0.4)]
    high_coef_bias: f32,

    #[arg(long, default_value_t = 0.15)]
    score_threshold: f32,
}

fn unwrap_or_exit<T>(result: Result<T, CallError>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Error: {}", err);
            process::exit(1);
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.nthreads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.nthreads)
            .build_global()
            .unwrap();
    }

    let config = CallerConfig {
        weight_coef_fit: !args.unweighted_coef_fit,
        max_genes: args.max_genes,
        dp_thresh: args.dp_thresh,
        alpha: args.alpha,
        beta: args.beta,
        subset_size_xy: args.subset_size_xy,
        pixel_max_percentile: args.pixel_max_percentile,
        coefficient_threshold: args.coefficient_threshold,
        radius_xy: args.radius_xy,
        radius_z: args.radius_z,
        spot_shape_size: [
            args.spot_shape_size[0],
            args.spot_shape_size[1],
            args.spot_shape_size[2],
        ],
        spot_shape_max_spots: args.spot_shape_max_spots,
        shape_isolation_distance_yx: args.shape_isolation_distance_yx,
        shape_isolation_distance_z: args.shape_isolation_distance_z,
        shape_coefficient_threshold: args.shape_coefficient_threshold,
        shape_sign_thresh: args.shape_sign_thresh,
        shape_reference_tile: args.shape_reference_tile,
        high_coef_bias: args.high_coef_bias,
        score_threshold: args.score_threshold,
    };
    unwrap_or_exit(config.validate());

    let stack = unwrap_or_exit(TileStack::open(Path::new(&args.tile_stack)));
    let [ny, nx, nz] = stack.manifest.tile_shape;
    println!(
        "Read tile stack: {} tiles of {}x{}x{} pixels, {} rounds x {} channels",
        stack.manifest.tiles.len(),
        ny,
        nx,
        nz,
        stack.manifest.rounds,
        stack.manifest.channels
    );

    let mut codebook = unwrap_or_exit(Codebook::from_csv(
        &args.codebook,
        stack.manifest.rounds,
        stack.manifest.channels,
    ));
    let n_genes = codebook.len();
    codebook.append_background_codes();
    println!(
        "Read {} gene codes plus {} background codes",
        n_genes,
        codebook.len() - n_genes
    );

    let shape_override = args.spot_shape_path.as_ref().map(|path| {
        let record = unwrap_or_exit(read_shape_record(Path::new(path)));
        println!("Loaded spot shape from {}", path);
        record.to_shape()
    });

    let serial_backend = SerialBackend;
    let rayon_backend = RayonBackend::new();
    let backend: &dyn SolveBackend = if args.serial {
        &serial_backend
    } else {
        &rayon_backend
    };

    let summary = unwrap_or_exit(run_pipeline(
        &stack,
        &codebook,
        &config,
        Path::new(&args.checkpoint_dir),
        backend,
        shape_override,
    ));

    output::write_spots(
        &args.output_spots,
        &args.output_spots_fmt,
        &summary.spots,
        &codebook.names(),
    );

    println!(
        "Called {} spots across {} tiles ({} tiles resumed from checkpoints)",
        summary.spots.len(),
        summary.n_tiles,
        summary.n_tiles_skipped
    );
}
