//! Bundle Adjustment Binary
//!
//! Loads a BAL (Bundle Adjustment in the Large) file, optionally normalizes
//! and perturbs it, then refines it with the Schur-complement
//! Levenberg-Marquardt solver.
//!
//! # Usage
//! ```bash
//! cargo run --release --bin bundle_adjustment -- path/to/problem.txt
//!
//! # Quaternion cameras, normalized scene, result written back as BAL and PLY:
//! cargo run --release --bin bundle_adjustment -- problem.txt \
//!     --quaternion --normalize -o refined.txt --final-ply refined.ply
//! ```

use apex_ba::core::loss_functions::RobustLoss;
use apex_ba::core::problem::BundleAdjustmentProblem;
use apex_ba::init_logger_with_level;
use apex_ba::io::{BalDataset, BalLoader, BalWriter, PlyWriter};
use apex_ba::linalg::DampingMode;
use apex_ba::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig};
use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::error::Error;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{Level, info, warn};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LossArg {
    Trivial,
    Huber,
    Cauchy,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DampingArg {
    Marquardt,
    Identity,
}

/// Bundle adjustment optimization for BAL datasets
#[derive(Parser)]
#[command(name = "bundle_adjustment")]
#[command(about = "Bundle adjustment optimization for BAL datasets")]
struct Args {
    /// BAL file path
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Maximum number of accepted Levenberg-Marquardt steps
    #[arg(short = 'i', long, default_value_t = 40)]
    max_iterations: usize,

    /// Robust loss applied to each observation
    #[arg(long, value_enum, default_value_t = LossArg::Huber)]
    loss: LossArg,

    /// Scale of the robust loss, in pixels
    #[arg(long, default_value_t = 1.0)]
    loss_scale: f64,

    /// Store camera rotations as unit quaternions (10-parameter cameras)
    #[arg(long)]
    quaternion: bool,

    /// Use central differences instead of analytic Jacobians
    #[arg(long)]
    numeric_jacobian: bool,

    #[arg(long, value_enum, default_value_t = DampingArg::Marquardt)]
    damping: DampingArg,

    /// Initial damping, the heuristic of the damping mode when omitted
    #[arg(long)]
    initial_lambda: Option<f64>,

    /// Center and rescale the scene before solving
    #[arg(long)]
    normalize: bool,

    /// Standard deviation of the noise added to points
    #[arg(long, default_value_t = 0.0)]
    point_sigma: f64,

    /// Standard deviation of the noise added to camera rotations (radians)
    #[arg(long, default_value_t = 0.0)]
    rotation_sigma: f64,

    /// Standard deviation of the noise added to camera translations
    #[arg(long, default_value_t = 0.0)]
    translation_sigma: f64,

    /// Seed for the perturbation noise
    #[arg(long, default_value_t = 38401)]
    seed: u64,

    /// Size of a dedicated worker pool
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Stop after this many seconds
    #[arg(long)]
    timeout_secs: Option<f64>,

    /// Write the refined dataset as a BAL file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Write camera centers and points before optimization as PLY
    #[arg(long)]
    initial_ply: Option<PathBuf>,

    /// Write camera centers and points after optimization as PLY
    #[arg(long)]
    final_ply: Option<PathBuf>,

    /// Verbose output (every solver state transition)
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn robust_loss(&self) -> RobustLoss {
        match self.loss {
            LossArg::Trivial => RobustLoss::None,
            LossArg::Huber => RobustLoss::Huber {
                delta: self.loss_scale,
            },
            LossArg::Cauchy => RobustLoss::Cauchy {
                scale: self.loss_scale,
            },
        }
    }

    fn solver_config(&self) -> LevenbergMarquardtConfig {
        let damping_mode = match self.damping {
            DampingArg::Marquardt => DampingMode::Marquardt,
            DampingArg::Identity => DampingMode::Identity,
        };
        let mut config = LevenbergMarquardtConfig::new()
            .with_max_iterations(self.max_iterations)
            .with_robust_loss(self.robust_loss())
            .with_quaternion_rotation(self.quaternion)
            .with_analytic_jacobian(!self.numeric_jacobian)
            .with_damping_mode(damping_mode);
        if let Some(lambda) = self.initial_lambda {
            config = config.with_initial_lambda(lambda);
        }
        if let Some(threads) = self.threads {
            config = config.with_num_threads(threads);
        }
        if let Some(secs) = self.timeout_secs {
            config = config.with_timeout(Duration::from_secs_f64(secs));
        }
        config
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    init_logger_with_level(if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    });

    info!("APEX-BA BUNDLE ADJUSTMENT");

    if !args.file.exists() {
        return Err(format!("File not found: {}", args.file.display()).into());
    }

    info!("Loading BAL dataset: {}", args.file.display());
    let start_load = Instant::now();
    let mut dataset = BalLoader::load(&args.file)?;
    info!("Dataset statistics:");
    info!("  Cameras: {}", dataset.cameras.len());
    info!("  Points: {}", dataset.points.len());
    info!("  Observations: {}", dataset.observations.len());
    info!("  Load time: {:?}", start_load.elapsed());

    prepare_dataset(&args, &mut dataset)?;

    if let Some(path) = &args.initial_ply {
        PlyWriter::write(path, &dataset)?;
    }

    let config = args.solver_config();
    info!(
        "Solver: {} cameras, {} loss, {} damping, {} Jacobians",
        if args.quaternion {
            "quaternion"
        } else {
            "angle-axis"
        },
        config.robust_loss,
        config.damping_mode,
        if args.numeric_jacobian {
            "numeric"
        } else {
            "analytic"
        }
    );

    let mut problem =
        BundleAdjustmentProblem::from_dataset(&dataset, config.rotation_parameterization())?;
    let solver = LevenbergMarquardt::with_config(config);
    let result = solver.minimize(&mut problem)?;

    info!("Status: {}", result.status);
    info!("\n{}", result.summary);
    let num_observations = problem.num_observations().max(1) as f64;
    info!(
        "Final RMSE: {:.6} px",
        (2.0 * result.summary.final_cost / num_observations).sqrt()
    );
    if !result.degenerate_observations.is_empty() {
        warn!(
            "{} observations were behind their camera at the final state",
            result.degenerate_observations.len()
        );
    }

    problem.write_back(&mut dataset)?;
    if let Some(path) = &args.output {
        BalWriter::write(path, &dataset)?;
    }
    if let Some(path) = &args.final_ply {
        PlyWriter::write(path, &dataset)?;
    }

    Ok(())
}

fn prepare_dataset(args: &Args, dataset: &mut BalDataset) -> Result<(), Box<dyn Error>> {
    if args.normalize {
        dataset.normalize()?;
    }
    if args.point_sigma > 0.0 || args.rotation_sigma > 0.0 || args.translation_sigma > 0.0 {
        info!(
            "Perturbing dataset (seed {}): rotation {}, translation {}, point {}",
            args.seed, args.rotation_sigma, args.translation_sigma, args.point_sigma
        );
        let mut rng = StdRng::seed_from_u64(args.seed);
        dataset.perturb(
            args.rotation_sigma,
            args.translation_sigma,
            args.point_sigma,
            &mut rng,
        )?;
    }
    Ok(())
}
