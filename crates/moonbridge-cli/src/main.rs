//! Moonbridge CLI
//!
//! Runs Lua scripts on the Moonbridge engine, either from a file or inline.
//! Scripts can await host promises; a `sleep(ms)` host function is provided.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod output;

use commands::EngineArgs;

#[derive(Parser)]
#[command(name = "moonbridge")]
#[command(about = "Run Lua scripts with host async bridging", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Lua file
    Run {
        /// Script path
        file: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Evaluate an inline chunk
    Eval {
        /// Lua source
        code: String,
        #[command(flatten)]
        engine: EngineArgs,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "moonbridge=debug,moonbridge_engine=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run { file, engine } => commands::run::execute(file, engine).await,
        Commands::Eval { code, engine } => commands::eval::execute(code, engine).await,
    };

    if let Err(e) = result {
        output::print_error(&e);
        std::process::exit(1);
    }
}
