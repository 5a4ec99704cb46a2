//! Compile broker driver
//!
//! Runs synthetic compile workloads against stub back-ends and checks
//! configuration and directive files.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser)]
#[command(name = "cbroker")]
#[command(about = "JIT compilation broker driver", long_about = None)]
#[command(version)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic multi-threaded compile workload and print statistics
    Simulate {
        /// Broker configuration (TOML); built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Directive file (JSON) pushed before the run
        #[arg(short, long)]
        directives: Option<PathBuf>,
        /// Distinct methods in the workload
        #[arg(short, long, default_value_t = 200)]
        methods: usize,
        /// Application threads issuing requests
        #[arg(short, long, default_value_t = 4)]
        threads: usize,
        /// Requests per application thread
        #[arg(short, long, default_value_t = 500)]
        requests: usize,
        /// Share of requests that block, 0.0 to 1.0
        #[arg(long, default_value_t = 0.05)]
        blocking_ratio: f64,
        /// Simulated compile time of the cheapest tier, in microseconds
        #[arg(long, default_value_t = 200)]
        compile_us: u64,
        /// Decompile part of the code inside a record window and replay it
        #[arg(long)]
        restore_cycle: bool,
        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration, or validate a file
    Config {
        /// Configuration file (TOML)
        path: Option<PathBuf>,
        /// Only validate
        #[arg(long)]
        check: bool,
    },

    /// Parse a directive file and show what applies to a method
    Directives {
        /// Directive file (JSON)
        file: PathBuf,
        /// Method to look up, as `Class::method`
        #[arg(short, long)]
        method: Option<String>,
        /// Compiler whose directive is shown (c1, c2, external)
        #[arg(long, default_value = "c2")]
        compiler: String,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Simulate {
            config,
            directives,
            methods,
            threads,
            requests,
            blocking_ratio,
            compile_us,
            restore_cycle,
            seed,
            json,
        } => commands::simulate::execute(commands::simulate::SimulateOptions {
            config,
            directives,
            methods,
            threads,
            requests,
            blocking_ratio,
            compile_us,
            restore_cycle,
            seed,
            json,
        }),

        Commands::Config { path, check } => commands::config::execute(path.as_deref(), check),

        Commands::Directives {
            file,
            method,
            compiler,
        } => commands::directives::execute(&file, method.as_deref(), &compiler),
    }
}
