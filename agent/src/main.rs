use clap::Parser;
use relay_agent::config::{AgentConfig, ConfigArgs};
use relay_agent::logging::{init_logging, LogFormat};
use relay_agent::{AgentError, ChannelState, HttpExecutor, RelayAgent, WsConnector};
use std::time::Duration;
use tracing::{error, info};

/// How long shutdown waits for the channel to close cleanly.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "relay-agent",
    version,
    about = "Performs HTTP requests on behalf of a sandboxed peer"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", env = "RELAY_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    if let Err(e) = run(cli.config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: ConfigArgs) -> Result<(), AgentError> {
    let config = AgentConfig::from_args(args)?;

    // tokio-tungstenite builds its rustls config from the process default.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Gateway: {}", config.channel.gateway_url);
    info!("Identity: {}", config.channel.identity);

    let agent = RelayAgent::new(
        WsConnector::new(config.channel),
        HttpExecutor::new()?,
        config.relay,
    );
    let state = agent.state();

    let relay = agent.run();
    tokio::pin!(relay);

    tokio::select! {
        _ = &mut relay => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            state.close_session().await;

            let mut states = state.subscribe();
            let closed = async {
                tokio::select! {
                    _ = &mut relay => {}
                    _ = states.wait_for(|s| *s != ChannelState::Connected) => {}
                }
            };
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, closed).await;
            info!("Final status: {:?}", state.status().await);
        }
    }
    Ok(())
}
