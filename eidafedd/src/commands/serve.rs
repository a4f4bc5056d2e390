//! `eidafedd serve`: the federator server.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use clap_blocks::catalog_dsn::CatalogDsnConfig;
use clap_blocks::federator::FederatorServerConfig;
use clap_blocks::run_config::RunConfig;
use federator::arena::ArenaSet;
use federator::server::HttpDelegate;
use routing_catalog::interface::Catalog;
use routing_catalog::postgres::{connect_catalog_store, PostgresCatalog};

use super::error::{Error, Result};

/// Interval of the background arena purge.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, clap::Parser)]
pub struct Config {
    #[clap(flatten)]
    pub run_config: RunConfig,

    #[clap(flatten)]
    pub catalog_dsn: CatalogDsnConfig,

    #[clap(flatten)]
    pub federator: FederatorServerConfig,
}

pub async fn command(config: Config) -> Result<()> {
    let pool = connect_catalog_store("eidafedd-serve", &config.catalog_dsn.dsn).await?;
    let catalog: Arc<dyn Catalog> = Arc::new(PostgresCatalog::new(pool));
    catalog.setup().await?;

    let engine_config = config.federator.to_config();
    let arenas = Arc::new(
        ArenaSet::create(
            engine_config.spool_dir.clone(),
            engine_config.quota_bytes,
            engine_config.purge_age,
        )
        .await?,
    );
    let swept = arenas.sweep_orphans().await?;
    if swept > 0 {
        info!(swept, "removed orphaned spool arenas from a previous run");
    }

    let shutdown = CancellationToken::new();
    let purge = {
        let arenas = Arc::clone(&arenas);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { arenas.run_purge(PURGE_INTERVAL, shutdown).await })
    };

    let delegate = Arc::new(HttpDelegate::new(catalog, arenas, engine_config));

    let make_svc = make_service_fn(move |_conn| {
        let delegate = Arc::clone(&delegate);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let delegate = Arc::clone(&delegate);
                async move {
                    let response: Response<Body> = match delegate.route(req).await {
                        Ok(response) => response,
                        Err(e) => e.into_response(),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let server = hyper::Server::try_bind(&config.run_config.bind_address)
        .map_err(|e| Error::Config(format!("cannot bind {}: {e}", config.run_config.bind_address)))?
        .serve(make_svc);
    info!(bind = %config.run_config.bind_address, "federator listening");

    let drain = shutdown.clone();
    let graceful = server.with_graceful_shutdown(async move { drain.cancelled().await });

    tokio::pin!(graceful);
    let result = tokio::select! {
        result = &mut graceful => result,
        _ = shutdown_signal() => {
            info!(
                deadline = ?config.run_config.shutdown_deadline,
                "shutdown signal received, draining in-flight jobs"
            );
            shutdown.cancel();
            match tokio::time::timeout(config.run_config.shutdown_deadline, graceful).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("drain deadline exceeded, shutting down hard");
                    Ok(())
                }
            }
        }
    };

    purge.abort();
    result.map_err(Error::from)
}

/// Wait for SIGINT or SIGTERM.
pub(crate) async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
