//! Harvests the routing catalog from upstream authoritative sources.
//!
//! For every registered data center the harvester fetches the
//! `eidaws-routing` configuration document, enumerates the concrete
//! channels behind each routed stream pattern via `fdsnws-station`
//! level=channel, normalizes the result into routing facts and swaps them
//! into the catalog as one atomic batch. Data centers are independent: a
//! failure harvesting one center leaves its previous state intact and
//! does not stop the others.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use backoff::{Backoff, BackoffConfig};
use chrono::Utc;
use snafu::{ResultExt, Snafu};
use stream_types::{Service, TimeWindow};
use tracing::{info, warn};

use routing_catalog::interface::{Catalog, ChannelEpochRow, DataCenter, HarvestRow, StalePolicy};

pub mod xml;

use xml::RoutedPattern;

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("fetching {} failed: {}", url, source))]
    Fetch { url: String, source: reqwest::Error },

    #[snafu(display("{} answered HTTP {}", url, status))]
    UpstreamStatus { url: String, status: u16 },

    #[snafu(display("retries for {} exhausted: {}", url, message))]
    RetriesExhausted { url: String, message: String },

    #[snafu(display("routing configuration of {} is invalid: {}", center, source))]
    RoutingConfig {
        center: String,
        source: xml::XmlError,
    },

    #[snafu(display("StationXML from {} is invalid: {}", url, source))]
    StationXml { url: String, source: xml::XmlError },

    #[snafu(display("batch validation for {} failed: {}", center, reason))]
    Validation { center: String, reason: String },

    #[snafu(display("catalog error: {}", source))]
    CatalogError {
        source: routing_catalog::interface::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Harvester tunables.
#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    /// How rows absent from a fresh batch are treated.
    pub stale_policy: StalePolicy,
    /// Retry schedule applied per upstream fetch.
    pub backoff: BackoffConfig,
    /// Timeout of a single upstream fetch.
    pub request_timeout: Duration,
    /// Restrict harvesting to the named centers; empty harvests all.
    pub center_filter: Vec<String>,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            stale_policy: StalePolicy::EndDate,
            backoff: BackoffConfig {
                deadline: Some(Duration::from_secs(600)),
                ..Default::default()
            },
            request_timeout: Duration::from_secs(120),
            center_filter: Vec::new(),
        }
    }
}

/// Per-center harvest outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CenterOutcome {
    /// The batch was swapped in; carries the number of routing facts.
    Harvested { rows: usize },
    /// The center was skipped by the configured filter.
    Filtered,
    /// The center failed; its previous rows are untouched.
    Failed { reason: String },
}

/// Drives harvesting across all registered data centers.
#[derive(Debug)]
pub struct Harvester {
    catalog: Arc<dyn Catalog>,
    client: reqwest::Client,
    config: HarvesterConfig,
}

impl Harvester {
    pub fn new(catalog: Arc<dyn Catalog>, config: HarvesterConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("default reqwest client configuration is valid");
        Self {
            catalog,
            client,
            config,
        }
    }

    /// Harvest every registered data center, isolating failures per
    /// center. Returns one outcome per center, keyed by name.
    pub async fn harvest_all(&self) -> Result<BTreeMap<String, CenterOutcome>> {
        let centers = self.catalog.data_centers().await.context(CatalogSnafu)?;

        let mut outcomes = BTreeMap::new();
        for center in centers {
            let outcome = if !self.config.center_filter.is_empty()
                && !self.config.center_filter.contains(&center.name)
            {
                CenterOutcome::Filtered
            } else {
                match self.harvest_center(&center).await {
                    Ok(rows) => CenterOutcome::Harvested { rows },
                    Err(e) => {
                        warn!(center = %center.name, error = %e, "harvest failed, previous state kept");
                        CenterOutcome::Failed {
                            reason: e.to_string(),
                        }
                    }
                }
            };
            outcomes.insert(center.name, outcome);
        }
        Ok(outcomes)
    }

    /// Harvest one data center and swap the batch into the catalog.
    pub async fn harvest_center(&self, center: &DataCenter) -> Result<usize> {
        let document = self.fetch(&center.routing_url).await?;
        let patterns = xml::parse_routing_config(&document).context(RoutingConfigSnafu {
            center: center.name.clone(),
        })?;

        // Channels are enumerated once per distinct station endpoint and
        // pattern; every service route then matches against them.
        let mut channels: Vec<ChannelEpochRow> = Vec::new();
        let mut fetched: BTreeSet<(String, String)> = BTreeSet::new();
        for pattern in patterns.iter().filter(|p| p.service == Service::Station) {
            let query_url = station_query_url(pattern);
            if !fetched.insert((pattern.url.clone(), pattern.stream.id())) {
                continue;
            }
            let body = self.fetch(&query_url).await?;
            channels.extend(
                xml::parse_station_xml(&body).context(StationXmlSnafu {
                    url: query_url.clone(),
                })?,
            );
        }

        let rows = build_rows(&patterns, &channels);
        validate_batch(&center.name, &rows)?;

        let summary = self
            .catalog
            .replace_batch(center.id, rows.clone(), self.config.stale_policy, Utc::now())
            .await
            .context(CatalogSnafu)?;

        info!(
            center = %center.name,
            upserted = summary.upserted,
            stale_closed = summary.stale_closed,
            stale_removed = summary.stale_removed,
            "harvest batch applied"
        );
        Ok(rows.len())
    }

    /// Fetch one URL with the configured retry schedule. Client errors
    /// (4xx) are not retried; everything else is, bounded by the backoff
    /// deadline.
    async fn fetch(&self, url: &str) -> Result<String> {
        // The retried closure folds the non-retriable outcome into its Ok
        // channel so the backoff only ever sees transient errors.
        let result: Result<Result<String, Error>, backoff::BackoffError<Error>> =
            Backoff::new(&self.config.backoff)
                .retry_all_errors(&format!("fetch {url}"), || async move {
                    match self.fetch_once(url).await {
                        Ok(body) => Ok(Ok(body)),
                        Err(e @ Error::UpstreamStatus { status, .. }) if status < 500 => {
                            Ok(Err(e))
                        }
                        Err(e) => Err(e),
                    }
                })
                .await;

        match result {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(permanent)) => Err(permanent),
            Err(backoff::BackoffError::DeadlineExceeded { source, .. }) => {
                Err(Error::RetriesExhausted {
                    url: url.to_string(),
                    message: source.to_string(),
                })
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await.context(FetchSnafu { url })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().await.context(FetchSnafu { url })
    }
}

/// The `fdsnws-station` query enumerating the channels behind a routed
/// pattern.
fn station_query_url(pattern: &RoutedPattern) -> String {
    format!(
        "{}?net={}&sta={}&loc={}&cha={}&level=channel&format=xml",
        pattern.url,
        pattern.stream.network,
        pattern.stream.station,
        pattern.stream.location_token(),
        pattern.stream.channel,
    )
}

/// Cross every harvested channel epoch with every service route whose
/// pattern matches it and whose validity overlaps the channel epoch.
fn build_rows(patterns: &[RoutedPattern], channels: &[ChannelEpochRow]) -> Vec<HarvestRow> {
    let mut rows = Vec::new();
    for channel in channels {
        let stream = channel.stream();
        for pattern in patterns {
            if !pattern.stream.matches(&stream) {
                continue;
            }
            let route_window = TimeWindow::new(pattern.start, pattern.end);
            if route_window.intersect(&channel.window()).is_none() {
                continue;
            }
            rows.push(HarvestRow {
                channel: channel.clone(),
                service: pattern.service,
                endpoint_url: pattern.url.clone(),
                route_start: pattern.start.unwrap_or(channel.starttime),
                route_end: pattern.end,
                is_primary: pattern.is_primary,
            });
        }
    }
    rows
}

/// Structural validation of a batch before it reaches the store: epoch
/// ends must lie after their starts and `(service, url, net, sta, loc,
/// cha, start)` must be unique.
fn validate_batch(center: &str, rows: &[HarvestRow]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for row in rows {
        if let Some(end) = row.channel.endtime {
            if end <= row.channel.starttime {
                return Err(Error::Validation {
                    center: center.to_string(),
                    reason: format!(
                        "channel epoch {} ends at {} before it starts",
                        row.channel.stream().id(),
                        end
                    ),
                });
            }
        }
        let key = (
            row.service,
            row.endpoint_url.clone(),
            row.channel.stream().id(),
            row.channel.starttime,
        );
        if !seen.insert(key) {
            return Err(Error::Validation {
                center: center.to_string(),
                reason: format!(
                    "duplicate routing fact for {} starting {}",
                    row.channel.stream().id(),
                    row.channel.starttime
                ),
            });
        }
    }
    Ok(())
}
