//! `moonbridge eval`: evaluate an inline chunk.

use super::{run_chunk, Chunk, EngineArgs};

pub async fn execute(code: String, args: EngineArgs) -> anyhow::Result<()> {
    run_chunk(Chunk::Inline(code), &args).await
}
