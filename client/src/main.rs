use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod cli;
mod flows;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG manda; si no está, logs informativos del CLI y del motor
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("client=info,tuplestream=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli::run().await
}
