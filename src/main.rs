use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use quiche::cli::commands;

#[derive(Parser)]
#[command(
    name = "quiche",
    about = "Quiche: fixture resolution and parallel scheduling for test suites",
    version
)]
struct Cli {
    /// Log scheduling decisions (same as RUST_LOG=debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the fixtures of a catalogue by scope
    Fixtures {
        /// Catalogue file (.yaml or .json)
        file: PathBuf,

        /// Output JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Validate a catalogue without running it
    Check {
        /// Catalogue file (.yaml or .json)
        file: PathBuf,
    },

    /// Show the task graph of a catalogue, dependencies first
    Plan {
        /// Catalogue file (.yaml or .json)
        file: PathBuf,

        /// Output JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Execute a catalogue's scripted tests
    Run {
        /// Catalogue file (.yaml or .json)
        file: PathBuf,

        /// Number of worker threads
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Abort the remaining tests after the first failure
        #[arg(long)]
        stop_on_failure: bool,

        /// Run disabled tests too
        #[arg(long)]
        force_disabled: bool,

        /// Output the result as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn finish(result: Result<String, String>) {
    match result {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Some(Commands::Fixtures { file, json }) => finish(commands::run_fixtures(&file, json)),
        Some(Commands::Check { file }) => {
            finish(commands::run_check(&file).map(|ok| format!("{ok}\n")));
        }
        Some(Commands::Plan { file, json }) => finish(commands::run_plan(&file, json)),
        Some(Commands::Run {
            file,
            jobs,
            stop_on_failure,
            force_disabled,
            json,
        }) => {
            let options = commands::RunOptions {
                file,
                jobs,
                stop_on_failure,
                force_disabled,
                json,
            };
            match commands::run_run(&options) {
                Ok(output) => {
                    print!("{}", output.text);
                    if !output.success {
                        std::process::exit(1);
                    }
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            // No subcommand: print help and exit
            Cli::parse_from(["quiche", "--help"]);
        }
    }
}
