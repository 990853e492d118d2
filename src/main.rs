// src/main.rs
use anyhow::{Context, Result};
use hyper::{Body, Request, Response, Server as HttpServer, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use tcp_drain::{
    config::{self, Config, MetricsConfig},
    metrics::MetricsRegistry,
    server::ServerBuilder,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tcp_drain=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            config::load_config(&path).await?
        }
        None => {
            info!("No configuration file given, using defaults");
            Config::default()
        }
    };

    let mut builder = ServerBuilder::from_config(&config.server);

    if config.metrics.enabled {
        let registry = MetricsRegistry::new()?;
        builder = builder.with_metrics(registry.collector());
        start_metrics_server(registry, &config.metrics).await?;
    }

    let server = builder.start().await?;
    info!("Draining connections on {}", server.local_addr());

    if let Err(e) = shutdown_signal().await {
        error!("Shutdown signal handling failed, shutting down now: {:#}", e);
    }

    let report = server.shutdown().await?;
    info!(
        "Stopped after {} connections ({} completions)",
        report.accepted, report.signals
    );

    Ok(())
}

async fn start_metrics_server(registry: MetricsRegistry, config: &MetricsConfig) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let registry = Arc::new(registry);
    let service_path = Arc::new(config.path.clone());

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let path = path.clone();

                async move { Ok::<_, Infallible>(metrics_response(&req, &registry, &path)) }
            }))
        }
    });

    let server = HttpServer::try_bind(&addr)
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?
        .serve(make_service);

    info!("Metrics server listening on http://{}{}", addr, config.path);

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

fn metrics_response(req: &Request<Body>, registry: &MetricsRegistry, path: &str) -> Response<Body> {
    if req.uri().path() != path {
        let mut response = Response::new(Body::from("Not Found"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    match registry.gather() {
        Ok(metrics) => {
            let mut response = Response::new(Body::from(metrics));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            let mut response = Response::new(Body::from("metrics unavailable"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

// Graceful shutdown handler
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<_, anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        res = ctrl_c => res?,
        res = terminate => res?,
    }

    info!("Shutdown signal received");
    Ok(())
}
