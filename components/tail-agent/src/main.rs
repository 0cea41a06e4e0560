use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Main entrypoint simply delegates control to CLI layer.
    // Tracing is installed by `run` once the configuration is known.
    tail_agent::cli::cli::run().await
}
