//! The federating request engine.
//!
//! A single client query is decomposed into per-endpoint sub-requests,
//! dispatched concurrently under global and per-endpoint bounds, spooled
//! to a per-job temp-file arena, and merged back into one
//! protocol-correct response that is streamed to the client.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::path::PathBuf;
use std::time::Duration;

use backoff::BackoffConfig;

pub mod arena;
pub mod decompose;
pub mod dispatch;
pub mod merge;
pub mod server;

/// How a job treats sub-request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Fold failures into a 200 carrying the successful parts only.
    #[default]
    BestEffort,
    /// The first terminal failure cancels the rest and fails the job.
    AllOrNothing,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best-effort" => Ok(Self::BestEffort),
            "all-or-nothing" => Ok(Self::AllOrNothing),
            other => Err(format!(
                "invalid failure policy {other:?}, expected best-effort or all-or-nothing"
            )),
        }
    }
}

/// Federator configuration, passed explicitly into the constructors; the
/// workers receive it via their job context.
#[derive(Debug, Clone)]
pub struct FederatorConfig {
    /// Root directory holding the per-job spool arenas.
    pub spool_dir: PathBuf,

    /// Global bound on in-flight sub-requests.
    pub max_in_flight: usize,

    /// Per-endpoint bound on in-flight sub-requests.
    pub max_per_endpoint: usize,

    /// Whole-job deadline.
    pub job_deadline: Duration,

    /// Deadline of a single sub-request attempt, also bounding
    /// chunk-to-chunk progress while a body streams.
    pub request_timeout: Duration,

    /// Attempts per sub-request (first try included).
    pub max_attempts: u32,

    /// Backoff between retries of one sub-request.
    pub backoff: BackoffConfig,

    pub failure_policy: FailurePolicy,

    /// Epoch count above which an endpoint batch is sent as POST.
    pub post_threshold: usize,

    /// Ceiling on an encoded POST body.
    pub max_body_bytes: usize,

    /// Ceiling on epochs per sub-request.
    pub max_epochs_per_request: usize,

    /// Simultaneous client requests the HTTP surface admits.
    pub http_request_limit: usize,

    /// Soft bound on total spooled bytes; spool writes beyond it wait.
    pub quota_bytes: u64,

    /// Arenas older than this are purged by the background sweep.
    pub purge_age: Duration,

    /// `Cache-Control` emitted on federated responses; `None` omits the
    /// header entirely.
    pub cache_control: Option<String>,
}

impl Default for FederatorConfig {
    fn default() -> Self {
        Self {
            spool_dir: std::env::temp_dir().join("eidafedd"),
            max_in_flight: 20,
            max_per_endpoint: 5,
            job_deadline: Duration::from_secs(600),
            request_timeout: Duration::from_secs(120),
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            failure_policy: FailurePolicy::BestEffort,
            post_threshold: 10,
            max_body_bytes: 100 * 1024,
            max_epochs_per_request: 500,
            http_request_limit: 200,
            quota_bytes: 4 * 1024 * 1024 * 1024,
            purge_age: Duration::from_secs(3600),
            cache_control: Some("no-store".to_string()),
        }
    }
}
