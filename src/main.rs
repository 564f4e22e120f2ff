use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use kmeans_mesh::{
    generate_points, run_clustering, run_reference, DataLoader, DataMatrix, MeshConfig, MeshError,
    MeshRun, NumericMode, Result as MeshResult,
};

#[derive(Parser, Debug)]
#[command(name = "kmeans-mesh")]
#[command(about = "K-means over a mesh of compute units with scratch-bounded kernels", long_about = None)]
struct Args {
    /// Number of clusters
    #[arg(short = 'c', long, default_value_t = 5)]
    clusters: usize,

    /// Number of points to generate when not using --input
    #[arg(short = 'p', long, default_value_t = 1024)]
    points: usize,

    /// Number of features per point when generating
    #[arg(short = 'f', long, default_value_t = 2)]
    features: usize,

    /// Number of compute units to partition the dataset over
    #[arg(short = 'u', long, default_value_t = 8)]
    units: usize,

    /// Concurrent lanes inside each unit
    #[arg(short = 'l', long, default_value_t = 8)]
    lanes: usize,

    /// Maximum number of iterations
    #[arg(short = 'i', long, default_value_t = 20)]
    iterations: usize,

    /// Convergence threshold on the centroid shift
    #[arg(long, default_value_t = 1e-2)]
    threshold: f64,

    /// Numeric mode (real or quantized)
    #[arg(long, value_parser = parse_numeric_mode, default_value = "real")]
    mode: NumericMode,

    /// Byte budget of each lane's scratch buffer
    #[arg(long, default_value_t = 4096)]
    scratch_bytes: usize,

    /// RNG seed for data generation and centroid seeding
    #[arg(long, default_value_t = 42u64)]
    seed: u64,

    /// Input dataset (CSV or Parquet)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Explicitly specify the input file format (default: auto-detect from extension)
    #[arg(long, value_enum)]
    format: Option<InputFormat>,

    /// Output file for centroids and stats (JSON)
    #[arg(short, long, default_value = "mesh_result.json")]
    output: PathBuf,

    /// Save the bare run summary JSON alongside the report
    #[arg(long)]
    save_run: Option<PathBuf>,

    /// Run the host reference oracle on the same seeds and compare
    #[arg(long, default_value_t = false)]
    verify: bool,

    /// Override Rayon global thread pool size
    #[arg(long)]
    threads: Option<usize>,

    /// Verbosity: set RUST_LOG style level (info, debug, warn)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum InputFormat {
    Csv,
    Parquet,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = init_logging(&args.log_level) {
        eprintln!("failed to initialise logging: {err}");
    }

    if let Err(err) = run(args) {
        error!(error = %err, "mesh clustering run failed");
        process::exit(1);
    }
}

fn init_logging(level: &str) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(match level {
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|err| err.to_string())
}

fn run(args: Args) -> MeshResult<()> {
    if let Some(threads) = args.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|err| {
                MeshError::InvalidConfig(format!("failed to configure rayon threadpool: {err}"))
            })?;
        info!(threads, "configured rayon global thread pool");
    }

    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let data = load_data(
        args.input.as_deref(),
        args.format,
        args.points,
        args.features,
        &mut rng,
    )?;

    let config = MeshConfig {
        n_points: data.nrows(),
        n_features: data.ncols(),
        n_clusters: args.clusters,
        n_units: args.units,
        n_lanes_per_unit: args.lanes,
        convergence_threshold: args.threshold,
        max_iterations: args.iterations,
        numeric_mode: args.mode,
        scratch_capacity_bytes: args.scratch_bytes,
    };
    config.validate()?;

    info!(
        clusters = config.n_clusters,
        points = config.n_points,
        features = config.n_features,
        units = config.n_units,
        lanes = config.n_lanes_per_unit,
        mode = %config.numeric_mode,
        scratch_bytes = config.scratch_capacity_bytes,
        seed = args.seed,
        "starting mesh clustering"
    );

    if data.nrows() < config.n_clusters {
        return Err(MeshError::InvalidConfig(format!(
            "dataset has {} points but {} clusters were requested",
            data.nrows(),
            config.n_clusters
        )));
    }
    let chosen = sample(&mut rng, data.nrows(), config.n_clusters).into_vec();
    let seed = |cluster: usize| data.row(chosen[cluster]).to_vec();

    let start = Instant::now();
    let run: MeshRun = run_clustering(&config, &data, seed)?;
    let elapsed = start.elapsed();
    info!(
        iterations = run.iterations,
        shift = run.shift,
        converged = run.converged,
        took_seconds = elapsed.as_secs_f64(),
        "mesh clustering finished"
    );
    info!(?run.cluster_sizes, "cluster population counts");

    let reference = if args.verify {
        let reference = run_reference(&config, &data, seed)?;
        let centroids_match = reference.centroids == run.centroids;
        info!(
            reference_iterations = reference.iterations,
            reference_shift = reference.shift,
            centroids_match,
            "host reference oracle complete"
        );
        Some(reference)
    } else {
        None
    };

    write_result(&args, &config, &run, reference.as_ref(), elapsed.as_secs_f64())?;

    if let Some(path) = args.save_run.as_ref() {
        run.save(path)?;
        info!(path = ?path, "saved run summary");
    }

    Ok(())
}

fn load_data(
    input: Option<&Path>,
    format: Option<InputFormat>,
    points: usize,
    features: usize,
    rng: &mut ChaCha8Rng,
) -> MeshResult<DataMatrix> {
    if let Some(path) = input {
        let format_to_use =
            format.unwrap_or_else(|| infer_format(path).unwrap_or(InputFormat::Csv));
        info!(path = ?path, ?format_to_use, "loading input data");
        match format_to_use {
            InputFormat::Csv => DataLoader::load_csv(path),
            InputFormat::Parquet => DataLoader::load_parquet(path),
        }
    } else {
        if let Some(requested) = format {
            info!(
                ?requested,
                "ignoring --format because synthetic data will be generated"
            );
        }
        info!(points, features, "generating synthetic uniform data");
        Ok(generate_points(points, features, rng))
    }
}

fn infer_format(path: &Path) -> Option<InputFormat> {
    path.extension().and_then(|ext| ext.to_str()).map(|ext| {
        match ext.to_ascii_lowercase().as_str() {
            "parquet" | "pq" => InputFormat::Parquet,
            "csv" => InputFormat::Csv,
            _ => InputFormat::Csv,
        }
    })
}

fn write_result(
    args: &Args,
    config: &MeshConfig,
    run: &MeshRun,
    reference: Option<&MeshRun>,
    elapsed_secs: f64,
) -> MeshResult<()> {
    let dump = json!({
        "config": config,
        "iterations": run.iterations,
        "shift": run.shift,
        "converged": run.converged,
        "cluster_sizes": run.cluster_sizes,
        "centroids": run.centroids,
        "timings_ms": run.timings,
        "seed": args.seed,
        "elapsed_seconds": elapsed_secs,
        "data_source": if let Some(path) = args.input.as_ref() {
            let fmt = args
                .format
                .or_else(|| infer_format(path))
                .unwrap_or(InputFormat::Csv);
            json!({
                "type": "file",
                "path": path.display().to_string(),
                "format": format!("{fmt:?}").to_lowercase(),
            })
        } else {
            json!({
                "type": "synthetic",
                "points": args.points,
                "features": args.features,
            })
        },
        "reference": reference.map(|reference| {
            json!({
                "iterations": reference.iterations,
                "shift": reference.shift,
                "centroids": reference.centroids,
                "centroids_match": reference.centroids == run.centroids,
            })
        }),
    });

    std::fs::write(&args.output, serde_json::to_string_pretty(&dump)?)?;
    info!(path = ?args.output, "wrote clustering report");
    Ok(())
}

fn parse_numeric_mode(raw: &str) -> Result<NumericMode, String> {
    NumericMode::from_str(raw).map_err(|err| err.to_string())
}
