//! CLI config for the harvester driver.

use std::time::Duration;

use ::harvester::HarvesterConfig;
use routing_catalog::interface::StalePolicy;

use crate::run_config::parse_duration;

/// One `NAME,URL` routing-configuration source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingSource {
    pub name: String,
    pub url: String,
}

impl std::str::FromStr for RoutingSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, url) = s
            .split_once(',')
            .ok_or_else(|| format!("expected NAME,URL, found {s:?}"))?;
        if name.is_empty() || url.is_empty() {
            return Err(format!("expected NAME,URL, found {s:?}"));
        }
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
        })
    }
}

fn parse_stale_policy(input: &str) -> Result<StalePolicy, String> {
    match input {
        "end-date" => Ok(StalePolicy::EndDate),
        "remove" => Ok(StalePolicy::Remove),
        other => Err(format!(
            "invalid stale policy {other:?}, expected end-date or remove"
        )),
    }
}

/// CLI config for harvesting the routing catalog.
#[derive(Debug, Clone, clap::Parser)]
pub struct HarvesterCliConfig {
    /// Routing-configuration sources to register before harvesting, as
    /// "NAME,URL" pairs.
    #[clap(
        long = "routing-config",
        env = "EIDAFEDD_ROUTING_CONFIG",
        num_args = 1..,
        value_delimiter = ' ',
        action
    )]
    pub routing_sources: Vec<RoutingSource>,

    /// Restrict harvesting to the named data centers.
    #[clap(long = "center", action)]
    pub centers: Vec<String>,

    /// How rows absent from a fresh batch are treated: "end-date" or
    /// "remove".
    #[clap(
        long = "stale-policy",
        env = "EIDAFEDD_STALE_POLICY",
        default_value = "end-date",
        value_parser = parse_stale_policy
    )]
    pub stale_policy: StalePolicy,

    /// Total retry deadline per upstream fetch, in seconds.
    #[clap(
        long = "retry-deadline-seconds",
        env = "EIDAFEDD_RETRY_DEADLINE_SECONDS",
        default_value = "600",
        value_parser = parse_duration
    )]
    pub retry_deadline: Duration,

    /// Initial backoff between fetch retries, in milliseconds.
    #[clap(
        long = "backoff-base-millis",
        env = "EIDAFEDD_HARVEST_BACKOFF_BASE_MILLIS",
        default_value = "1000",
        action
    )]
    pub backoff_base_millis: u64,

    /// Timeout of a single upstream fetch, in seconds.
    #[clap(
        long = "fetch-timeout-seconds",
        env = "EIDAFEDD_FETCH_TIMEOUT_SECONDS",
        default_value = "120",
        value_parser = parse_duration
    )]
    pub fetch_timeout: Duration,
}

impl HarvesterCliConfig {
    /// Collapse the flags into the harvester configuration value.
    pub fn to_config(&self) -> HarvesterConfig {
        HarvesterConfig {
            stale_policy: self.stale_policy,
            backoff: backoff::BackoffConfig {
                init_backoff: Duration::from_millis(self.backoff_base_millis),
                deadline: Some(self.retry_deadline),
                ..Default::default()
            },
            request_timeout: self.fetch_timeout,
            center_filter: self.centers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn routing_source_parses() {
        let source: RoutingSource = "eth,http://eth.example/routing.xml".parse().unwrap();
        assert_eq!(source.name, "eth");
        assert_eq!(source.url, "http://eth.example/routing.xml");

        assert!("missing-comma".parse::<RoutingSource>().is_err());
        assert!(",http://eth.example".parse::<RoutingSource>().is_err());
    }

    #[test]
    fn defaults_parse() {
        let config = HarvesterCliConfig::parse_from(["harvest"]);
        let harvest = config.to_config();
        assert_eq!(harvest.stale_policy, StalePolicy::EndDate);
        assert_eq!(
            harvest.backoff.deadline,
            Some(Duration::from_secs(600))
        );
        assert!(harvest.center_filter.is_empty());
    }

    #[test]
    fn stale_policy_rejects_unknown_tokens() {
        assert!(parse_stale_policy("purge").is_err());
        assert_eq!(parse_stale_policy("remove").unwrap(), StalePolicy::Remove);
    }
}
