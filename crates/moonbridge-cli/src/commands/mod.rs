//! Subcommands and the engine flags they share.

pub mod eval;
pub mod run;

use anyhow::Context;
use clap::Args;
use moonbridge_engine::{Engine, EngineOptions, Function, MultiValue, Promise, RunOptions, Value};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Flags controlling the engine and how the chunk runs
#[derive(Args, Debug, Clone, Default)]
pub struct EngineArgs {
    /// Run in a single protected call (promises cannot be awaited)
    #[arg(long)]
    pub sync: bool,

    /// Abort the run after this many milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout: Option<u64>,

    /// Allocation ceiling in bytes (enables allocation tracing)
    #[arg(long, value_name = "BYTES")]
    pub max_memory: Option<usize>,

    /// Do not open the standard libraries
    #[arg(long)]
    pub no_stdlib: bool,

    /// Provide the `null` and `new` globals
    #[arg(long)]
    pub inject_objects: bool,

    /// Expose host objects as opaque userdata instead of proxies
    #[arg(long)]
    pub no_proxy: bool,

    /// TOML file with engine options
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Contents of a `--config` file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    #[serde(flatten)]
    engine: EngineOptions,
    /// Run timeout in milliseconds
    timeout_ms: Option<u64>,
}

impl ConfigFile {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("Cannot read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }
}

impl EngineArgs {
    /// Options from the config file, overridden by flags.
    pub fn resolve(&self) -> anyhow::Result<(EngineOptions, RunOptions)> {
        let config = match &self.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        let mut options = config.engine;
        if self.no_stdlib {
            options.open_standard_libs = false;
        }
        if self.inject_objects {
            options.inject_objects = true;
        }
        if self.no_proxy {
            options.enable_proxy = false;
        }
        if self.max_memory.is_some() {
            options.memory_max = self.max_memory;
        }
        let run = RunOptions {
            timeout: self.timeout.or(config.timeout_ms).map(Duration::from_millis),
        };
        Ok((options, run))
    }
}

/// Engine with the CLI's host functions installed.
pub fn build_engine(options: EngineOptions) -> anyhow::Result<Engine> {
    let engine = Engine::with_options(options)?;
    engine.global().set("sleep", sleep_function())?;
    Ok(engine)
}

/// `sleep(ms)`: promise resolving to `ms` after the delay.
fn sleep_function() -> Function {
    Function::wrap(|args: MultiValue| {
        let ms = args.value(0).as_integer().unwrap_or(0).max(0);
        Ok(Value::Promise(Promise::from_future(async move {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            Ok(Value::Integer(ms))
        })))
    })
}

/// Where a chunk comes from
pub enum Chunk {
    File(PathBuf),
    Inline(String),
}

/// Build an engine, run `chunk` and print its result.
pub async fn run_chunk(chunk: Chunk, args: &EngineArgs) -> anyhow::Result<()> {
    let (options, run) = args.resolve()?;
    tracing::debug!(?options, timeout = ?run.timeout, sync = args.sync, "starting engine");
    let engine = build_engine(options)?;

    let result = match (&chunk, args.sync) {
        (Chunk::File(path), true) => engine.do_file_sync_with(path, run),
        (Chunk::File(path), false) => engine.do_file_with(path, run).await,
        (Chunk::Inline(code), true) => engine.do_string_sync_with(code, run),
        (Chunk::Inline(code), false) => engine.do_string_with(code, run).await,
    };
    let value = match (result, &chunk) {
        (Ok(value), _) => value,
        (Err(e), Chunk::File(path)) => return Err(e).with_context(|| format!("{} failed", path.display())),
        (Err(e), Chunk::Inline(_)) => return Err(e.into()),
    };

    crate::output::print_value(&value, args.json)?;
    engine.close();
    Ok(())
}
