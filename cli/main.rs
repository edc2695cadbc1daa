#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process;

use phylodiff::config::AnalysisConfig;
use phylodiff::gradient::check_gradient;
use phylodiff::maximize::{LaplaceApproximation, LaplaceSummary, MaximizationResult, MaximizerWrtParameter};

#[derive(Parser)]
#[command(
    name = "phylodiff",
    about = "Gradients and maximization of CTMC substitution-model likelihoods on trees",
    long_about = "Computes analytic log-likelihood gradients for substitution-model, branch-rate \
                 and node-height parameters, checks them against finite differences, and \
                 maximizes the likelihood with BFGS."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare the analytic gradient with central finite differences
    #[command(about = "Check the configured gradient numerically")]
    Check {
        /// Analysis configuration (TOML)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Largest acceptable relative (or absolute) error
        #[arg(long, default_value = "1e-4")]
        tolerance: f64,
    },

    /// Maximize the likelihood over the configured parameter
    #[command(about = "Maximize the likelihood (outputs: result TOML)")]
    Maximize {
        /// Analysis configuration (TOML)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Also report a Laplace approximation at the optimum
        #[arg(long)]
        laplace: bool,

        /// Write the result here instead of standard output
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct MaximizeOutput {
    result: MaximizationResult,
    laplace: Option<LaplaceSummary>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Check { config, tolerance }) => run_check(config, tolerance),
        Some(Commands::Maximize {
            config,
            laplace,
            output,
        }) => run_maximize(config, laplace, output),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_check(config_path: PathBuf, tolerance: f64) -> Result<(), Box<dyn Error>> {
    let config = AnalysisConfig::load(&config_path)?;
    let mut provider = config.provider()?;
    let report = check_gradient(&mut provider)?;
    println!("{report}");
    if !report.passes(tolerance) {
        return Err(format!(
            "analytic gradient differs from finite differences (relative error {:.3e} > {tolerance:.1e})",
            report.max_relative_error
        )
        .into());
    }
    Ok(())
}

fn run_maximize(
    config_path: PathBuf,
    laplace: bool,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let config = AnalysisConfig::load(&config_path)?;
    let provider = config.provider()?;
    let (mut provider, result) = MaximizerWrtParameter::new(config.maximizer).maximize(provider)?;
    let laplace = if laplace {
        Some(LaplaceApproximation::new(config.laplace).approximate(&mut provider)?)
    } else {
        None
    };

    let text = toml::to_string_pretty(&MaximizeOutput { result, laplace })?;
    match output {
        Some(path) => {
            fs::write(&path, text)?;
            eprintln!("Wrote {}", path.display());
        }
        None => print!("{text}"),
    }
    Ok(())
}
