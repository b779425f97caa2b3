use clap::Parser;
use convoy_client::ClientConfig;
use convoy_core::addr::parse_listen_addr;
use tracing_subscriber::EnvFilter;

/// Ship-side proxy: accepts ordinary HTTP/1.1 proxy traffic from browsers
/// and funnels every job through a single TCP link to the offshore server.
#[derive(Parser)]
#[command(
    name = "convoy-client",
    about = "Ship proxy client (sequential over a single TCP link)",
    version
)]
struct Cli {
    /// Browser-facing listen address, `[HOST]:PORT`
    #[arg(long, default_value = ":8080")]
    listen: String,

    /// Offshore server `HOST:PORT`
    #[arg(long, default_value = "127.0.0.1:9090")]
    server: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let listen = parse_listen_addr(&cli.listen)?;
    convoy_client::run(ClientConfig {
        listen,
        server: cli.server,
    })
    .await?;
    Ok(())
}
