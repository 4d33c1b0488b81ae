//! waveorder command-line interface.
//!
//! Run simulate-and-reconstruct jobs from TOML configuration files:
//! ```sh
//! waveorder-cli run job.toml
//! waveorder-cli validate job.toml
//! waveorder-cli channels --chi 0.25
//! ```

mod config;
mod runner;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use waveorder_core::jones::{calibration_matrix, AnalyzerSetting};

#[derive(Parser)]
#[command(name = "waveorder-cli")]
#[command(about = "waveorder: polarization and phase microscopy simulation and reconstruction")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a Siemens-star specimen and reconstruct it.
    Run {
        /// Path to the job configuration file.
        config: PathBuf,
        /// Output directory (overrides config file setting).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file and build the simulator without running.
    Validate {
        /// Path to the job configuration file.
        config: PathBuf,
    },
    /// Print the five analyzer states and the calibration matrix.
    Channels {
        /// Swing angle in radians.
        #[arg(long, default_value_t = 0.25)]
        chi: f64,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, output } => {
            println!("waveorder");
            println!("=========");
            let job = config::load_config(&config)?;
            println!("Configuration: {}", config.display());

            let result = runner::run_job(&job)?;
            let summary = &result.summary;
            println!("Retardance RMS error: {:.3e}", summary.retardance_rms_error);
            if let Some(err) = summary.slow_axis_rms_error {
                println!("Slow-axis RMS error:  {:.3e} rad", err);
            }
            if let Some(err) = summary.phase_rms_error {
                println!("Phase RMS error:      {:.3e} rad", err);
            }

            let out_dir = output.unwrap_or_else(|| PathBuf::from(&job.output.directory));
            runner::write_outputs(&result, &job, &out_dir)?;

            println!("Run complete in {:.2} s.", summary.elapsed_seconds);
            Ok(())
        }
        Commands::Validate { config } => {
            let job = config::load_config(&config)?;
            let backend = runner::create_backend(&job.compute)?;
            let sim = waveorder_core::simulator::ForwardSimulator::new(job.microscope, backend)?;
            println!("Configuration is valid: {}", config.display());
            println!(
                "  {} defocus plane(s), {} pattern(s), {} plane(s) total",
                sim.n_defocus(),
                sim.n_patterns(),
                sim.n_planes()
            );
            Ok(())
        }
        Commands::Channels { chi } => {
            println!("Analyzer states for chi = {chi} rad:");
            println!();
            for (k, state) in AnalyzerSetting::five_state(chi).iter().enumerate() {
                println!("  I{k}: alpha = {:.6}, beta = {:.6}", state.alpha, state.beta);
            }
            println!();
            println!("Calibration matrix (rows: channels, columns: S0..S3):");
            for row in calibration_matrix(chi) {
                println!(
                    "  [{:>9.6}, {:>9.6}, {:>9.6}, {:>9.6}]",
                    row[0], row[1], row[2], row[3]
                );
            }
            Ok(())
        }
    }
}
