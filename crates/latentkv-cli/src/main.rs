use std::path::PathBuf;

use clap::Parser;
use latentkv_cli::{simulate, SimulationOptions};
use tracing_subscriber::EnvFilter;

/// latentkv: context-cache memoization for tree-search inference
#[derive(Parser)]
#[command(name = "latentkv")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run a simulated tree search and print cache statistics as JSON.
    Simulate {
        /// Parallel environments.
        #[arg(short, long)]
        envs: Option<usize>,

        /// Simulations per search step.
        #[arg(long)]
        simulations: Option<usize>,

        /// Episodes to play.
        #[arg(long, default_value_t = 2)]
        episodes: usize,

        /// Steps per episode.
        #[arg(long, default_value_t = 5)]
        steps: usize,

        /// Context window limit in positions.
        #[arg(long)]
        context_length: Option<usize>,

        /// Random seed for observations and search choices.
        #[arg(short, long, default_value_t = 42)]
        seed: u64,

        /// Use rotary instead of absolute positions.
        #[arg(long)]
        rotary: bool,

        /// JSON cache config; flags override its fields.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            envs,
            simulations,
            episodes,
            steps,
            context_length,
            seed,
            rotary,
            config,
        } => {
            let opts = SimulationOptions {
                envs,
                simulations,
                context_length,
                episodes,
                steps,
                seed,
                rotary,
                config,
            };
            match simulate(&opts) {
                Ok(report) => match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("error: {e}");
                        std::process::exit(1);
                    }
                },
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
