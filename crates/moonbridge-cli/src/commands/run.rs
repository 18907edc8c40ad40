//! `moonbridge run`: execute a Lua file.

use std::path::PathBuf;

use super::{run_chunk, Chunk, EngineArgs};

pub async fn execute(file: PathBuf, args: EngineArgs) -> anyhow::Result<()> {
    if !file.exists() {
        anyhow::bail!("File not found: {}", file.display());
    }
    run_chunk(Chunk::File(file), &args).await
}
