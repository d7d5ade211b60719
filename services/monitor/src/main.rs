// monitor: Live transport-network monitor entry point.
//
// Ingests passenger-count events from the upstream feed and serves
// quiet-route requests to downstream clients over WSS + STOMP.

use monitor::monitor::TransitMonitor;
use monitor::{MonitorConfig, config};
use stomp_session::{WssClientTransport, WssServerTransport};
use tracing::info;

fn build_client_transport(config: &MonitorConfig) -> WssClientTransport {
    let url = format!(
        "wss://{}:{}/network-events",
        config.server_url, config.server_port
    );
    WssClientTransport::new(url, Some(config.ca_cert_path.clone()))
}

fn build_server_transport(config: &MonitorConfig) -> WssServerTransport {
    let bind_addr = format!("{}:{}", config.quiet_route_ip, config.quiet_route_port);
    WssServerTransport::new(
        bind_addr,
        config.quiet_route_cert_path.clone(),
        config.quiet_route_key_path.clone(),
    )
}

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "monitor starting");

    let config = match config::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("FATAL: failed to load config: {error}");
            std::process::exit(-1);
        }
    };

    let monitor = match TransitMonitor::configure(
        &config,
        build_client_transport(&config),
        build_server_transport(&config),
    )
    .await
    {
        Ok(monitor) => monitor,
        Err(error) => {
            eprintln!("FATAL: failed to configure the monitor: {error}");
            std::process::exit(-1);
        }
    };

    match config.run_duration {
        Some(duration) => monitor.run_for(duration).await,
        None => monitor.run().await,
    }

    if monitor.last_error().is_ok() {
        std::process::exit(0);
    }
    std::process::exit(-2);
}
