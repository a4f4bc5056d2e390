//! `eidafedd harvest`: refresh the routing catalog from the upstream
//! data centers.

use std::sync::Arc;

use tracing::{info, warn};

use clap_blocks::harvester::HarvesterCliConfig;
use harvester::{CenterOutcome, Harvester};
use routing_catalog::interface::Catalog;
use routing_catalog::postgres::{connect_catalog_store, PostgresCatalog};

use super::error::{Error, Result};

#[derive(Debug, clap::Parser)]
pub struct Config {
    /// Connection string of the routing catalog database.
    #[clap(value_name = "CATALOG_DSN", action)]
    pub catalog_dsn: String,

    #[clap(flatten)]
    pub harvester: HarvesterCliConfig,
}

pub async fn command(config: Config) -> Result<()> {
    let pool = connect_catalog_store("eidafedd-harvest", &config.catalog_dsn).await?;
    let catalog: Arc<dyn Catalog> = Arc::new(PostgresCatalog::new(pool));
    catalog.setup().await?;

    // Register configured sources before harvesting, so a fresh catalog
    // can be bootstrapped in one invocation.
    for source in &config.harvester.routing_sources {
        catalog
            .create_or_get_data_center(&source.name, &source.url)
            .await?;
    }

    let harvester = Harvester::new(Arc::clone(&catalog), config.harvester.to_config());
    let outcomes = harvester.harvest_all().await?;

    let mut attempted = 0;
    let mut failed = 0;
    for (center, outcome) in &outcomes {
        match outcome {
            CenterOutcome::Harvested { rows } => {
                attempted += 1;
                info!(center = %center, rows, "harvested");
            }
            CenterOutcome::Filtered => {}
            CenterOutcome::Failed { reason } => {
                attempted += 1;
                failed += 1;
                warn!(center = %center, reason = %reason, "harvest failed");
            }
        }
    }

    if attempted == 0 {
        return Err(Error::Config(
            "no data center to harvest; register sources with --routing-config".to_string(),
        ));
    }
    if failed == attempted {
        return Err(Error::AllCentersFailed { attempted });
    }

    Ok(())
}
