//! Concurrent dispatch of sub-requests with bounded parallelism,
//! per-request deadlines, retries and spooling.
//!
//! A fixed global bound and a per-endpoint bound limit in-flight
//! sub-requests; admission beyond them queues FIFO on the semaphores.
//! Response bodies stream chunk-wise to a spool file in the job's arena,
//! never accumulating in memory. Cancellation is cooperative: workers
//! observe it between I/O boundaries, and a cancelled sub-request leaves
//! no spool file behind.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use backoff::Backoff;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::arena::SpoolArena;
use crate::decompose::{SubRequest, SubRequestMethod};
use crate::{FailurePolicy, FederatorConfig};

/// Terminal and intermediate states of a sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubRequestState {
    Pending,
    InFlight,
    Ok,
    ClientError,
    ServerError,
    Timeout,
    Cancelled,
}

impl SubRequestState {
    /// Short token used in diagnostic headers.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Ok => "ok",
            Self::ClientError => "4xx",
            Self::ServerError => "5xx",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// The terminal record of one sub-request.
#[derive(Debug)]
pub struct SubRequestOutcome {
    pub request: SubRequest,
    pub state: SubRequestState,
    pub status: Option<u16>,
    pub attempts: u32,
    /// Spool file holding the body; present only in the `Ok` state.
    pub spool: Option<PathBuf>,
    pub bytes: u64,
    pub error: Option<String>,
}

impl SubRequestOutcome {
    pub fn is_ok(&self) -> bool {
        self.state == SubRequestState::Ok
    }
}

/// What a single attempt produced.
enum AttemptError {
    Client(u16),
    Server { status: Option<u16>, message: String },
    Timeout,
    Cancelled,
}

#[derive(Debug)]
struct Inner {
    client: reqwest::Client,
    global: Semaphore,
    per_endpoint: parking_lot::Mutex<HashMap<String, Arc<Semaphore>>>,
    config: FederatorConfig,
}

impl Inner {
    fn endpoint_semaphore(&self, url: &str) -> Arc<Semaphore> {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| url.to_string());
        Arc::clone(
            self.per_endpoint
                .lock()
                .entry(host)
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_per_endpoint))),
        )
    }
}

/// Issues the sub-requests of jobs under the configured bounds.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(config: FederatorConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .expect("default reqwest client configuration is valid");
        Self {
            inner: Arc::new(Inner {
                client,
                global: Semaphore::new(config.max_in_flight),
                per_endpoint: parking_lot::Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Run one job: dispatch all `requests`, spool their bodies into
    /// `arena`, and return one outcome per request (input order).
    ///
    /// `cancel` is honored promptly at every I/O boundary. Under
    /// [`FailurePolicy::AllOrNothing`] the first terminal failure fires
    /// `cancel` itself, tearing down the job's remaining sub-requests.
    pub async fn run(
        &self,
        arena: Arc<SpoolArena>,
        requests: Vec<SubRequest>,
        cancel: CancellationToken,
        policy: FailurePolicy,
    ) -> Vec<SubRequestOutcome> {
        let deadline = Instant::now() + self.inner.config.job_deadline;

        let mut join_set = JoinSet::new();
        for (seq, request) in requests.into_iter().enumerate() {
            let inner = Arc::clone(&self.inner);
            let arena = Arc::clone(&arena);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let outcome = worker(inner, arena, seq, request, &cancel, deadline).await;
                if !outcome.is_ok() && policy == FailurePolicy::AllOrNothing {
                    warn!(
                        url = %outcome.request.url,
                        state = outcome.state.token(),
                        "sub-request failed, cancelling job (all-or-nothing)"
                    );
                    cancel.cancel();
                }
                (seq, outcome)
            });
        }

        let mut outcomes: Vec<(usize, SubRequestOutcome)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(entry) => outcomes.push(entry),
                Err(e) => warn!(error = %e, "sub-request worker panicked"),
            }
        }
        outcomes.sort_by_key(|(seq, _)| *seq);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

async fn worker(
    inner: Arc<Inner>,
    arena: Arc<SpoolArena>,
    seq: usize,
    request: SubRequest,
    cancel: &CancellationToken,
    deadline: Instant,
) -> SubRequestOutcome {
    let spool_path = arena.spool_path(seq);
    let mut attempts = 0;
    let mut backoff = Backoff::new(&inner.config.backoff);
    let mut last_error: Option<String> = None;
    let mut status: Option<u16> = None;

    let state = loop {
        if cancel.is_cancelled() {
            break SubRequestState::Cancelled;
        }

        // Admission: the global bound first, then the endpoint bound.
        // Waiters queue FIFO on the semaphores.
        let _global = tokio::select! {
            _ = cancel.cancelled() => break SubRequestState::Cancelled,
            permit = inner.global.acquire() => permit.expect("dispatcher semaphore is never closed"),
        };
        let endpoint_sem = inner.endpoint_semaphore(&request.url);
        let _endpoint = tokio::select! {
            _ = cancel.cancelled() => break SubRequestState::Cancelled,
            permit = endpoint_sem.acquire() => permit.expect("dispatcher semaphore is never closed"),
        };

        attempts += 1;
        match attempt(&inner, &arena, &spool_path, &request, cancel, deadline).await {
            Ok((got_status, bytes)) => {
                debug!(url = %request.url, status = got_status, bytes, "sub-request spooled");
                return SubRequestOutcome {
                    request,
                    state: SubRequestState::Ok,
                    status: Some(got_status),
                    attempts,
                    spool: Some(spool_path),
                    bytes,
                    error: None,
                };
            }
            Err(AttemptError::Client(got_status)) => {
                status = Some(got_status);
                last_error = Some(format!("upstream answered HTTP {got_status}"));
                break SubRequestState::ClientError;
            }
            Err(AttemptError::Timeout) => {
                last_error = Some("deadline elapsed".to_string());
                break SubRequestState::Timeout;
            }
            Err(AttemptError::Cancelled) => break SubRequestState::Cancelled,
            Err(AttemptError::Server { status: got_status, message }) => {
                status = got_status;
                last_error = Some(message);
                if attempts >= inner.config.max_attempts {
                    break SubRequestState::ServerError;
                }
                // release the permits while backing off, then re-enter
                // the admission queue
                drop(_endpoint);
                drop(_global);
                let pause = backoff.next();
                debug!(url = %request.url, attempts, backoff = ?pause, "retrying sub-request");
                tokio::select! {
                    _ = cancel.cancelled() => break SubRequestState::Cancelled,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    };

    SubRequestOutcome {
        request,
        state,
        status,
        attempts,
        spool: None,
        bytes: 0,
        error: last_error,
    }
}

/// Issue the request once and spool the body. Any early return removes
/// the partial spool file and gives back its quota reservation.
async fn attempt(
    inner: &Inner,
    arena: &SpoolArena,
    spool_path: &PathBuf,
    request: &SubRequest,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<(u16, u64), AttemptError> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or(AttemptError::Timeout)?;
    let header_timeout = remaining.min(inner.config.request_timeout);

    let builder = match request.method {
        SubRequestMethod::Get => inner.client.get(&request.url).query(&request.query),
        SubRequestMethod::Post => inner
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(request.body.clone().unwrap_or_default()),
    };

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
        sent = tokio::time::timeout(header_timeout, builder.send()) => match sent {
            Err(_) => return Err(AttemptError::Timeout),
            Ok(Err(e)) => {
                return Err(AttemptError::Server {
                    status: None,
                    message: format!("transport error: {e}"),
                })
            }
            Ok(Ok(response)) => response,
        },
    };

    let status = response.status();
    if status.as_u16() == 204 {
        // an empty-success part: zero bytes, still merged as OK
        tokio::fs::File::create(spool_path)
            .await
            .map_err(disk_error)?;
        return Ok((204, 0));
    }
    if status.is_client_error() {
        return Err(AttemptError::Client(status.as_u16()));
    }
    if !status.is_success() {
        return Err(AttemptError::Server {
            status: Some(status.as_u16()),
            message: format!("upstream answered HTTP {status}"),
        });
    }

    let mut file = tokio::fs::File::create(spool_path)
        .await
        .map_err(disk_error)?;
    let mut stream = response.bytes_stream();
    let mut total: u64 = 0;

    let failed = |arena: &SpoolArena, total: u64, e: AttemptError| {
        // best effort: the arena sweep covers anything left behind
        let _ = std::fs::remove_file(spool_path);
        arena.release(total);
        e
    };

    loop {
        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(remaining) => remaining,
            None => return Err(failed(arena, total, AttemptError::Timeout)),
        };
        let chunk_timeout = remaining.min(inner.config.request_timeout);

        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(failed(arena, total, AttemptError::Cancelled)),
            next = tokio::time::timeout(chunk_timeout, stream.next()) => match next {
                Err(_) => return Err(failed(arena, total, AttemptError::Timeout)),
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return Err(failed(
                        arena,
                        total,
                        AttemptError::Server {
                            status: Some(status.as_u16()),
                            message: format!("body stream failed: {e}"),
                        },
                    ))
                }
                Ok(Some(Ok(chunk))) => chunk,
            },
        };

        // quota backpressure is a cancellation point too
        tokio::select! {
            _ = cancel.cancelled() => return Err(failed(arena, total, AttemptError::Cancelled)),
            _ = arena.reserve(chunk.len() as u64) => {}
        }
        total += chunk.len() as u64;

        if let Err(e) = file.write_all(&chunk).await {
            return Err(failed(arena, total, disk_error(e)));
        }
    }

    if let Err(e) = file.flush().await {
        return Err(failed(arena, total, disk_error(e)));
    }

    Ok((status.as_u16(), total))
}

fn disk_error(e: std::io::Error) -> AttemptError {
    AttemptError::Server {
        status: None,
        message: format!("spool write failed: {e}"),
    }
}
