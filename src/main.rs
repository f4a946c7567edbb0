use clap::{Args, Parser, Subcommand};
use effusion::model::{load_model, load_moments};
use effusion::{SeedMode, Simulation, SimulationError};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Fallback desorption budget when neither the model nor the command line
/// sets one; an unlimited budget would never terminate headless.
const DEFAULT_DESORPTION_LIMIT: u64 = 1_000_000;

/// Lock acquisition timeout of one merge attempt.
const MERGE_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Parser)]
#[command(name = "effusion", about = "Monte Carlo molecular flow simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a simulation on a geometry model file
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Geometry model description (JSON)
    geometry: PathBuf,

    /// Number of worker threads
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Base seed; worker k is seeded with seed XOR k
    #[arg(long, conflicts_with = "fixed_seed")]
    seed: Option<u64>,

    /// Deterministic seeding (42424242 + worker id)
    #[arg(long)]
    fixed_seed: bool,

    /// Bounce events per dispatch, between two reductions
    #[arg(long, default_value_t = 100_000)]
    steps: usize,

    /// Total desorption budget, split across workers
    #[arg(long)]
    desorption_limit: Option<u64>,

    /// Observation moments override (JSON array of {time, window})
    #[arg(long)]
    moments: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let exit_code = match cli.command {
        Command::Run(args) => run(args),
    };
    std::process::exit(exit_code);
}

fn run(args: RunArgs) -> i32 {
    let mut model = match load_model(&args.geometry) {
        Ok(model) => model,
        Err(err) => {
            error!("{}", err);
            return 1;
        }
    };
    if let Some(path) = &args.moments {
        match load_moments(path) {
            Ok(moments) => model.td.moments = moments,
            Err(err) => {
                error!("{}", err);
                return 1;
            }
        }
    }
    if let Some(limit) = args.desorption_limit {
        model.otf.desorption_limit = limit;
    }
    if model.otf.desorption_limit == 0 {
        warn!(
            "no desorption limit set, defaulting to {}",
            DEFAULT_DESORPTION_LIMIT
        );
        model.otf.desorption_limit = DEFAULT_DESORPTION_LIMIT;
    }

    let mut simulation = match Simulation::new(model) {
        Ok(simulation) => simulation,
        Err(err) => {
            error!("{}", err);
            return 1;
        }
    };

    let seed_mode = if args.fixed_seed {
        SeedMode::Fixed
    } else if let Some(seed) = args.seed {
        SeedMode::Base(seed)
    } else {
        SeedMode::Random
    };
    simulation.set_n_particles(args.threads.max(1), seed_mode);
    simulation.load_simulation();

    let cancel = AtomicBool::new(false);
    match simulation.run(args.steps, &cancel, MERGE_TIMEOUT) {
        Ok(summary) => {
            let state = simulation.global_state.state.lock();
            let hits = &state.global_hits;
            info!("run complete: {} desorbed", summary.total_desorbed);
            println!("desorbed        {}", hits.global_hits.nb_desorbed);
            println!("mc hits         {}", hits.global_hits.nb_mc_hit);
            println!("hit equiv       {:.3}", hits.global_hits.nb_hit_equiv);
            println!("absorbed equiv  {:.3}", hits.global_hits.nb_abs_equiv);
            println!("leaks           {}", hits.nb_leak_total);
            println!("distance [cm]   {:.3}", hits.dist_traveled_total);
            0
        }
        Err(SimulationError::ReductionTimeout) => {
            error!("reduction mutex timed out, aborting");
            3
        }
        Err(err) => {
            error!("{}", err);
            2
        }
    }
}
