use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use tianji::gateway::{self, Gateway, GatewayOptions, SHUTDOWN_DRAIN};
use tianji::{ProxyConfig, TianjiError};

const DEFAULT_PORT: u16 = 4000;

/// OpenAI-compatible LLM gateway.
#[derive(Debug, Parser)]
#[command(name = "tianji-gateway", version)]
struct Cli {
    /// Proxy config (YAML).
    #[arg(long)]
    config: PathBuf,
    /// Listen address. Defaults to `0.0.0.0:<general_settings.port or 4000>`.
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Extra JSON-configured providers.
    #[arg(long)]
    providers_json: Option<PathBuf>,
    /// Policy file, re-read every 30 s; replaces the config's inline policies.
    #[arg(long)]
    policies: Option<PathBuf>,
    #[arg(long)]
    json_logs: bool,
    /// Export spans over OTLP/HTTP.
    #[arg(long)]
    otel: bool,
    #[arg(long, requires = "otel")]
    otel_endpoint: Option<String>,
}

#[cfg(feature = "otel")]
type TelemetryGuard = Option<gateway::otel::OtelGuard>;
#[cfg(not(feature = "otel"))]
type TelemetryGuard = ();

fn init_telemetry(cli: &Cli) -> Result<TelemetryGuard, Box<dyn std::error::Error>> {
    #[cfg(feature = "otel")]
    {
        if cli.otel {
            let guard = gateway::otel::init_tracing("tianji-gateway", cli.otel_endpoint.as_deref(), cli.json_logs)?;
            return Ok(Some(guard));
        }
        gateway::init_logging(cli.json_logs)?;
        Ok(None)
    }
    #[cfg(not(feature = "otel"))]
    {
        if cli.otel {
            return Err("--otel requires the `otel` feature".into());
        }
        gateway::init_logging(cli.json_logs)
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                    _ = sigint.recv() => tracing::info!("received SIGINT"),
                }
            }
            _ => {
                tracing::warn!("failed to install signal handlers; falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received ctrl-c");
    }
}

async fn run(cli: Cli) -> Result<(), TianjiError> {
    let config = ProxyConfig::load(&cli.config)?;
    let listen = cli.listen.unwrap_or_else(|| {
        SocketAddr::from((
            [0, 0, 0, 0],
            config.general_settings.port.unwrap_or(DEFAULT_PORT),
        ))
    });
    let options = GatewayOptions {
        providers_json: cli.providers_json,
        policies_path: cli.policies,
        ..GatewayOptions::default()
    };
    let gateway = Arc::new(Gateway::from_config(config, options).await?);

    let tasks = CancellationToken::new();
    let handles = gateway.spawn_background_tasks(&tasks);

    let app = gateway::router(Arc::clone(&gateway));
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(%listen, "tianji-gateway listening");

    let stop = CancellationToken::new();
    let server_stop = stop.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_stop.cancelled().await })
            .await
    });

    let served = tokio::select! {
        _ = shutdown_signal() => {
            stop.cancel();
            match tokio::time::timeout(SHUTDOWN_DRAIN, &mut server).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!("in-flight requests did not drain in time");
                    server.abort();
                    Ok(Ok(()))
                }
            }
        }
        joined = &mut server => joined,
    };

    gateway::join_background_tasks(&tasks, handles).await;
    match served {
        Ok(result) => result?,
        Err(err) => tracing::error!("server task failed: {err}"),
    }
    tracing::info!("tianji-gateway stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = match init_telemetry(&cli) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("tianji-gateway: failed to initialize logging: {err}");
            return ExitCode::FAILURE;
        }
    };
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("tianji-gateway: {err}");
            ExitCode::FAILURE
        }
    }
}
