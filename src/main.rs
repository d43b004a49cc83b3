use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod datatypes;
mod decimation;
mod error;
mod filter;
mod mesh_io;
mod mesher;
mod pipeline;
mod post_processor;
mod shapes;
mod solver;

use config::{DatasetConfig, ShapeKind};
use error::{Result, StrainsetError};

#[derive(Parser)]
#[command(about = "Inherent strain dataset generator")]
struct Cli {
    /// Json configuration; defaults are used for missing keys
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "Logs.log")]
    log_file: PathBuf,

    /// Seed of the shape generator
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the dataset splits end to end
    Generate {
        /// Only build these splits
        #[arg(long = "phase")]
        phases: Vec<String>,
        #[arg(long, default_value = "cubes_process")]
        process_root: PathBuf,
        #[arg(long, default_value = "cubes")]
        final_root: PathBuf,
    },
    /// Generate random surfaces into a folder
    Shapes {
        #[arg(short, long)]
        path: PathBuf,
        #[arg(short = 'n', long)]
        count: usize,
        /// cube or polygon
        #[arg(long)]
        shape: Option<String>,
    },
    /// Remove surfaces whose edge count differs from the target
    Filter {
        #[arg(short, long)]
        path: PathBuf,
        #[arg(short, long)]
        edges: Option<usize>,
    },
    /// Tetrahedralize every .stl of a folder with gmsh
    Mesh {
        #[arg(short = 'p', long = "path-stl")]
        path_stl: PathBuf,
    },
    /// Solve one .msh and write the pvd collections
    Simulate {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Convert a displacement .vtu into the sample files
    Export {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Re-orient exported surfaces and drop the ones with a wrong edge count
    Correct {
        #[arg(short, long)]
        path: PathBuf,
    },
}

fn init_logging(log_file: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|err| StrainsetError::io(log_file, err))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .init();
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => DatasetConfig::default(),
    };
    let seed = cli.seed.or(config.seed);
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    match cli.command {
        Command::Generate {
            phases,
            process_root,
            final_root,
        } => {
            let selected: Vec<config::Phase> = config
                .phases
                .iter()
                .filter(|p| phases.is_empty() || phases.contains(&p.name))
                .cloned()
                .collect();
            if selected.is_empty() {
                return Err(StrainsetError::Input(format!(
                    "No configured phase matches {phases:?}"
                )));
            }
            let summaries = pipeline::run_phases(
                &config,
                &selected,
                &process_root,
                &final_root,
                Some(&cli.log_file),
                &mut rng,
            )?;
            for (phase, summary) in summaries {
                info!("{phase}: {summary:?}");
            }
        }
        Command::Shapes { path, count, shape } => {
            if let Some(shape) = shape {
                config.generator.shape = ShapeKind::parse(&shape)?;
            }
            shapes::generate(&path, count, &config.generator, &mut rng)?;
        }
        Command::Filter { path, edges } => {
            let edges = edges.unwrap_or(config.generator.edges_target);
            filter::remove_not_exact(&path, edges)?;
        }
        Command::Mesh { path_stl } => {
            mesher::count_stl_files(&path_stl)?;
            let summary = mesher::run_batch(&path_stl, &config.mesher, &config.batch)?;
            info!("{summary:?}");
        }
        Command::Simulate { input, output } => {
            std::fs::create_dir_all(&output).map_err(|err| StrainsetError::io(&output, err))?;
            let outputs = pipeline::simulate(&input, &output, &config.simulation)?;
            info!("displacement written to {}", outputs.displacement.display());
        }
        Command::Export { input, output } => {
            std::fs::create_dir_all(&output).map_err(|err| StrainsetError::io(&output, err))?;
            let name = post_processor::export_sample(&input, &output)?;
            info!("exported sample {name} to {}", output.display());
        }
        Command::Correct { path } => {
            post_processor::extraction_correction(&path, config.generator.edges_target)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(&cli.log_file) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
