use cgigate::cli::Cli;
use cgigate::config::{Config, GatewayConfig};
use cgigate::error::GatewayError;
use cgigate::gateway::Gateway;
use cgigate::server::GatewayServer;
use cgigate::{tls, PKG_NAME, VERSION};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cgigate=info".parse().expect("valid log directive")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => {
            let config = Config::load(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => Config::default(),
    };
    cli.apply(&mut config);

    if config.gateway.dir.is_none() {
        config.gateway.dir = Some(std::env::current_dir()?.display().to_string());
    }

    config.validate()?;

    let mut gateway_config = config.gateway.build(std::env::consts::OS)?;
    if config.server.quiet {
        gateway_config = gateway_config.with_error_log(Arc::new(|_: &GatewayError| {}));
    }

    print_startup_banner(&config, &gateway_config);

    let tls_acceptor = tls::acceptor(&config.server)?;

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = Arc::new(Gateway::new(gateway_config));
    let mut server = GatewayServer::new(bind_addr, gateway, shutdown_rx);
    if let Some(acceptor) = tls_acceptor {
        server = server.with_tls(acceptor);
    }

    let mut server_handle = tokio::spawn(async move { server.run().await });

    // Wait for shutdown signal (Ctrl+C or SIGTERM), or the server failing on its own
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            result = &mut server_handle => {
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        error!(error = %e, "Gateway server error");
                        Err(e)
                    }
                    Err(e) => Err(e.into()),
                };
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down...");
            }
            result = &mut server_handle => {
                return match result {
                    Ok(result) => result,
                    Err(e) => Err(e.into()),
                };
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // The server task ends once open connections have drained
    let grace = Duration::from_secs(config.server.shutdown_timeout_secs);
    match tokio::time::timeout(grace, server_handle).await {
        Ok(Ok(Err(e))) => error!(error = %e, "Gateway server error during shutdown"),
        Ok(_) => {}
        Err(_) => warn!(grace_secs = grace.as_secs(), "Shutdown timeout elapsed, dropping open connections"),
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config, gateway: &GatewayConfig) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        tls = config.server.tls_enabled(),
        quiet = config.server.quiet,
        "Server configuration"
    );
    info!(
        executable = %gateway.executable.display(),
        args = ?gateway.args,
        dir = ?gateway.dir,
        root = %gateway.root(),
        mode = gateway.output_mode.as_str(),
        timeout_secs = gateway.timeout.map(|t| t.as_secs()),
        "Gateway configuration"
    );
    info!(
        inherit_env = ?gateway.inherit_env,
        extra_env = gateway.extra_env.len(),
        default_headers = gateway.default_headers.len(),
        "Subprocess environment"
    );
}
