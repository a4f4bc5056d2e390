//! CLI config for the federator server.

use std::path::PathBuf;
use std::time::Duration;

use ::federator::{FailurePolicy, FederatorConfig};

use crate::run_config::parse_duration;

/// CLI config for the federating request engine.
#[derive(Debug, Clone, clap::Parser)]
pub struct FederatorServerConfig {
    /// Directory holding the per-job spool arenas.
    #[clap(
        long = "spool-dir",
        env = "EIDAFEDD_SPOOL_DIR",
        default_value = "/tmp/eidafedd",
        action
    )]
    pub spool_dir: PathBuf,

    /// Global bound on in-flight upstream sub-requests.
    #[clap(
        long = "max-in-flight",
        env = "EIDAFEDD_MAX_IN_FLIGHT",
        default_value = "20",
        action
    )]
    pub max_in_flight: usize,

    /// Per-endpoint bound on in-flight upstream sub-requests.
    #[clap(
        long = "max-per-endpoint",
        env = "EIDAFEDD_MAX_PER_ENDPOINT",
        default_value = "5",
        action
    )]
    pub max_per_endpoint: usize,

    /// Whole-job deadline in seconds.
    #[clap(
        long = "job-deadline-seconds",
        env = "EIDAFEDD_JOB_DEADLINE_SECONDS",
        default_value = "600",
        value_parser = parse_duration
    )]
    pub job_deadline: Duration,

    /// Deadline of a single upstream request in seconds; also bounds
    /// chunk-to-chunk progress while a body streams.
    #[clap(
        long = "request-timeout-seconds",
        env = "EIDAFEDD_REQUEST_TIMEOUT_SECONDS",
        default_value = "120",
        value_parser = parse_duration
    )]
    pub request_timeout: Duration,

    /// Attempts per sub-request, the first try included.
    #[clap(
        long = "max-attempts",
        env = "EIDAFEDD_MAX_ATTEMPTS",
        default_value = "3",
        action
    )]
    pub max_attempts: u32,

    /// Initial backoff between sub-request retries, in milliseconds.
    #[clap(
        long = "backoff-base-millis",
        env = "EIDAFEDD_BACKOFF_BASE_MILLIS",
        default_value = "500",
        action
    )]
    pub backoff_base_millis: u64,

    /// Failure policy: "best-effort" or "all-or-nothing".
    #[clap(
        long = "failure-policy",
        env = "EIDAFEDD_FAILURE_POLICY",
        default_value = "best-effort",
        action
    )]
    pub failure_policy: FailurePolicy,

    /// Epoch count above which an endpoint batch is sent as POST.
    #[clap(
        long = "post-threshold",
        env = "EIDAFEDD_POST_THRESHOLD",
        default_value = "10",
        action
    )]
    pub post_threshold: usize,

    /// Ceiling on an encoded upstream POST body, in bytes.
    #[clap(
        long = "max-body-bytes",
        env = "EIDAFEDD_MAX_BODY_BYTES",
        default_value = "102400",
        action
    )]
    pub max_body_bytes: usize,

    /// Ceiling on epochs per upstream sub-request.
    #[clap(
        long = "max-epochs-per-request",
        env = "EIDAFEDD_MAX_EPOCHS_PER_REQUEST",
        default_value = "500",
        action
    )]
    pub max_epochs_per_request: usize,

    /// Simultaneous client requests admitted by the HTTP surface.
    #[clap(
        long = "max-http-requests",
        env = "EIDAFEDD_MAX_HTTP_REQUESTS",
        default_value = "200",
        action
    )]
    pub http_request_limit: usize,

    /// Soft bound on total spooled bytes; spool writes beyond it wait.
    #[clap(
        long = "quota-bytes",
        env = "EIDAFEDD_QUOTA_BYTES",
        default_value = "4294967296",
        action
    )]
    pub quota_bytes: u64,

    /// Spool arenas older than this many seconds are purged.
    #[clap(
        long = "purge-age-seconds",
        env = "EIDAFEDD_PURGE_AGE_SECONDS",
        default_value = "3600",
        value_parser = parse_duration
    )]
    pub purge_age: Duration,

    /// Cache-Control header emitted on federated responses; an empty
    /// value omits the header.
    #[clap(
        long = "cache-control",
        env = "EIDAFEDD_CACHE_CONTROL",
        default_value = "no-store",
        action
    )]
    pub cache_control: String,
}

impl FederatorServerConfig {
    /// Collapse the flags into the engine configuration value.
    pub fn to_config(&self) -> FederatorConfig {
        FederatorConfig {
            spool_dir: self.spool_dir.clone(),
            max_in_flight: self.max_in_flight,
            max_per_endpoint: self.max_per_endpoint,
            job_deadline: self.job_deadline,
            request_timeout: self.request_timeout,
            max_attempts: self.max_attempts,
            backoff: backoff::BackoffConfig {
                init_backoff: Duration::from_millis(self.backoff_base_millis),
                ..Default::default()
            },
            failure_policy: self.failure_policy,
            post_threshold: self.post_threshold,
            max_body_bytes: self.max_body_bytes,
            max_epochs_per_request: self.max_epochs_per_request,
            http_request_limit: self.http_request_limit,
            quota_bytes: self.quota_bytes,
            purge_age: self.purge_age,
            cache_control: if self.cache_control.is_empty() {
                None
            } else {
                Some(self.cache_control.clone())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_parse() {
        let config = FederatorServerConfig::parse_from(["federator"]);
        let engine = config.to_config();
        assert_eq!(engine.max_in_flight, 20);
        assert_eq!(engine.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(engine.cache_control.as_deref(), Some("no-store"));
        assert_eq!(engine.job_deadline, Duration::from_secs(600));
    }

    #[test]
    fn empty_cache_control_omits_the_header() {
        let config =
            FederatorServerConfig::parse_from(["federator", "--cache-control", ""]);
        assert_eq!(config.to_config().cache_control, None);
    }

    #[test]
    fn failure_policy_parses() {
        let config = FederatorServerConfig::parse_from([
            "federator",
            "--failure-policy",
            "all-or-nothing",
        ]);
        assert_eq!(
            config.to_config().failure_policy,
            FailurePolicy::AllOrNothing
        );
    }
}
