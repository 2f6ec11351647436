use clap::Parser;
use peer_sim::PeerState;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "peer-sim", version, about = "Simulated sandboxed peer for relay agents")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "PEER_SIM_LISTEN", default_value = "0.0.0.0:7070")]
    listen: SocketAddr,

    /// Bearer token proxies must present. Open when omitted.
    #[arg(long, env = "PEER_SIM_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peer_sim=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let listener = match TcpListener::bind(cli.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", cli.listen, e);
            std::process::exit(1);
        }
    };
    info!("Peer simulator listening on {}", cli.listen);

    if let Err(e) = peer_sim::run(listener, PeerState::new(), cli.auth_token).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
