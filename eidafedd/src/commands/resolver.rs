//! `eidafedd resolver`: the routing resolver server.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use clap_blocks::catalog_dsn::CatalogDsnConfig;
use clap_blocks::run_config::RunConfig;
use resolver::HttpDelegate;
use routing_catalog::interface::Catalog;
use routing_catalog::postgres::{connect_catalog_store, PostgresCatalog};

use super::error::{Error, Result};
use super::serve::shutdown_signal;

#[derive(Debug, clap::Parser)]
pub struct Config {
    #[clap(flatten)]
    pub run_config: RunConfig,

    #[clap(flatten)]
    pub catalog_dsn: CatalogDsnConfig,
}

pub async fn command(config: Config) -> Result<()> {
    let pool = connect_catalog_store("eidafedd-resolver", &config.catalog_dsn.dsn).await?;
    let catalog: Arc<dyn Catalog> = Arc::new(PostgresCatalog::new(pool));
    catalog.setup().await?;

    let delegate = Arc::new(HttpDelegate::new(catalog));

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
    info!(bind = %config.run_config.bind_address, "resolver listening");

    let shutdown = CancellationToken::new();
    let drain = shutdown.clone();
    let graceful = server.with_graceful_shutdown(async move { drain.cancelled().await });

    tokio::pin!(graceful);
    let result = tokio::select! {
        result = &mut graceful => result,
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining");
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

    result.map_err(Error::from)
}
