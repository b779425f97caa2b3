use clap::Parser;
use convoy_core::addr::parse_listen_addr;
use convoy_server::ServerConfig;
use tracing_subscriber::EnvFilter;

/// Offshore server: accepts ship links and performs the real origin I/O.
#[derive(Parser)]
#[command(name = "convoy-server", about = "Offshore proxy server", version)]
struct Cli {
    /// Link listen address, `[HOST]:PORT`
    #[arg(long, default_value = ":9090")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let listen = parse_listen_addr(&cli.listen)?;
    convoy_server::run(ServerConfig { listen }).await?;
    Ok(())
}
