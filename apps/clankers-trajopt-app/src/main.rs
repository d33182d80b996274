//! Clankers trajectory optimization CLI.
//!
//! Provides two modes of operation:
//! - `solve`: Optimize every initial condition of a TOML problem file,
//!   optionally as a robust game against a bounded disturbance
//! - `info`: Print crate versions and default settings

mod problem;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use clankers_trajopt::{
    CancelFlag, DisturbedCost, GameReport, OptimizationReport, TrajOptConfig, TrajOptError,
    optimize_conditions, solve_games,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use problem::{Problem, ProblemError};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// KL-constrained trajectory optimization for linear-Gaussian systems.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimize every initial condition of a problem file.
    Solve {
        /// Path to the problem TOML.
        #[arg(short, long)]
        problem: PathBuf,

        /// Solve the disturbance game; needs `[optimizer.game]` and
        /// `system.disturbance`.
        #[arg(long)]
        robust: bool,
    },

    /// Print crate information.
    Info,
}

// ---------------------------------------------------------------------------
// Mode implementations
// ---------------------------------------------------------------------------

fn run_solve(path: &Path, robust: bool) -> Result<(), ProblemError> {
    let problem = Problem::from_file(path)?;
    let cost = problem.cost()?;
    let conditions = problem.conditions()?;
    info!(
        path = %path.display(),
        conditions = conditions.len(),
        robust,
        "Loaded problem"
    );

    let cancel = CancelFlag::new();
    if robust {
        let dynamics = problem.disturbed_dynamics()?;
        let disturbance_dim = dynamics.disturbance_dim();
        let cost = DisturbedCost::new(cost, disturbance_dim);
        let reports = solve_games(&problem.optimizer, &dynamics, &cost, &conditions, &cancel)?;
        for (i, report) in reports.into_iter().enumerate() {
            print_game(i, report);
        }
    } else {
        let dynamics = problem.dynamics()?;
        let reports =
            optimize_conditions(&problem.optimizer, &dynamics, &cost, &conditions, &cancel)?;
        for (i, report) in reports.into_iter().enumerate() {
            print_standard(i, report);
        }
    }
    Ok(())
}

fn print_standard(index: usize, report: Result<OptimizationReport, TrajOptError>) {
    match report {
        Ok(report) => {
            println!(
                "condition {}: status={:?}, iterations={}, cost={:.6}, eta={:.3e}",
                index + 1,
                report.status,
                report.iterations,
                report.final_cost(),
                report.eta
            );
            let controller = report.trajectory.controller();
            if controller.horizon() > 0 {
                println!("  K[0] = {:?}", controller.step(0).gain.as_slice());
            }
        }
        Err(e) => error!(condition = index + 1, error = %e, "Optimization failed"),
    }
}

fn print_game(index: usize, report: Result<GameReport, TrajOptError>) {
    match report {
        Ok(report) => {
            let payoff = report.turns.last().map_or(f64::NAN, |turn| turn.payoff);
            println!(
                "condition {}: status={:?}, cycles={}, turns={}, payoff={:.6}",
                index + 1,
                report.status,
                report.cycles,
                report.turns.len(),
                payoff
            );
            let protagonist = report.protagonist();
            if protagonist.horizon() > 0 {
                println!("  K[0] = {:?}", protagonist.step(0).gain.as_slice());
            }
        }
        Err(e) => error!(condition = index + 1, error = %e, "Game failed"),
    }
}

fn run_info() {
    let defaults = TrajOptConfig::default();
    println!("clankers-trajopt v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("defaults:");
    println!("  horizon          {}", defaults.problem.horizon);
    println!("  base_kl_step     {}", defaults.trust_region.base_kl_step);
    println!("  max_iterations   {}", defaults.convergence.max_iterations);
    println!("  min_eta          {:e}", defaults.step_size.min_eta);
    println!("  max_eta          {:e}", defaults.step_size.max_eta);
    println!();
    println!("edition: 2024");
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Solve { problem, robust }) => match run_solve(&problem, robust) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "Solve failed");
                ExitCode::FAILURE
            }
        },
        Some(Commands::Info) | None => {
            run_info();
            ExitCode::SUCCESS
        }
    }
}
