//! HTTP request handling for the federator endpoints.
//!
//! Paths mirror FDSN: `/fdsnws/station/1/query`,
//! `/fdsnws/dataselect/1/query` and `/eidaws/wfcatalog/1/query`, each
//! accepting GET and POST. The handler decodes the request, resolves
//! routes against the catalog, dispatches the sub-requests and answers
//! with the streamed merge of the successful parts.

use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore, TryAcquireError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use fdsnws_protocol::{parse_get, parse_post, FdsnRequest, Level, ParseError};
use routing_catalog::interface::{Access, Catalog, ResolveLevel, ResolveOptions};
use stream_types::Service;

use crate::arena::ArenaSet;
use crate::decompose::decompose;
use crate::dispatch::{Dispatcher, SubRequestOutcome, SubRequestState};
use crate::merge::{merge, MergeKind, OkPart};
use crate::{FailurePolicy, FederatorConfig};

/// Upper bound on a client POST body.
const MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// Identification header attached to every federated response.
pub const VERSION_HEADER: &str = "x-federator-version";

/// Per-endpoint error accounting on best-effort responses.
pub const ERRORS_HEADER: &str = "x-federator-errors";

/// Errors returned by the federator HTTP request handler.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested path has no registered handler.
    #[error("not found")]
    NoHandler,

    /// The request failed validation.
    #[error(transparent)]
    InvalidRequest(#[from] ParseError),

    /// The client sent a request body that exceeds the configured maximum.
    #[error("max request size ({0} bytes) exceeded")]
    RequestSizeExceeded(usize),

    /// The client disconnected while the request body was read.
    #[error("client disconnected")]
    ClientHangup(hyper::Error),

    /// Nothing matches the request; carries the `nodata` status to emit.
    #[error("no data matches the request")]
    NoData { nodata: u16 },

    /// The job failed upstream; the body lists the offending endpoints.
    #[error("upstream failure: {detail}")]
    UpstreamFailure { detail: String },

    /// The job deadline elapsed.
    #[error("job deadline exceeded")]
    JobTimeout,

    /// The service is servicing the maximum permitted number of
    /// simultaneous requests.
    #[error("this service is overloaded, please try again later")]
    RequestLimit,

    /// The catalog could not be queried.
    #[error("catalog error: {0}")]
    Catalog(#[from] routing_catalog::interface::Error),

    /// Spool storage failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convert the error into the [`StatusCode`] returned to the client.
    pub fn as_status_code(&self) -> StatusCode {
        match self {
            Self::NoHandler => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::RequestSizeExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ClientHangup(_) => StatusCode::BAD_REQUEST,
            Self::NoData { nodata: 404 } => StatusCode::NOT_FOUND,
            Self::NoData { .. } => StatusCode::NO_CONTENT,
            Self::UpstreamFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::JobTimeout => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestLimit => StatusCode::SERVICE_UNAVAILABLE,
            Self::Catalog(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the error as an FDSN-style structured plain-text body.
    /// No-data responses stay empty per the FDSN convention.
    pub fn into_response(self) -> Response<Body> {
        let status = self.as_status_code();
        let body = if matches!(self, Self::NoData { .. }) {
            Body::empty()
        } else {
            Body::from(format!(
                "Error {}: {}\n\nRequest handled by EIDA federator version {}\n",
                status.as_u16(),
                self,
                env!("CARGO_PKG_VERSION"),
            ))
        };
        let mut response = Response::new(body);
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(VERSION_HEADER, version_header_value());
        response
    }
}

fn version_header_value() -> HeaderValue {
    HeaderValue::from_static(env!("CARGO_PKG_VERSION"))
}

/// This type services requests to the federator HTTP endpoint.
#[derive(Debug)]
pub struct HttpDelegate {
    catalog: Arc<dyn Catalog>,
    dispatcher: Dispatcher,
    arenas: Arc<ArenaSet>,
    config: FederatorConfig,

    // Bounds the number of simultaneously serviced client requests so a
    // flood sheds load instead of exhausting spool space and sockets.
    request_sem: Semaphore,
}

impl HttpDelegate {
    pub fn new(catalog: Arc<dyn Catalog>, arenas: Arc<ArenaSet>, config: FederatorConfig) -> Self {
        Self {
            catalog,
            dispatcher: Dispatcher::new(config.clone()),
            arenas,
            request_sem: Semaphore::new(config.http_request_limit),
            config,
        }
    }

    /// Routes `req` to the appropriate handler, if any.
    pub async fn route(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let _permit = match self.request_sem.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                error!("simultaneous request limit exceeded - dropping request");
                return Err(Error::RequestLimit);
            }
            Err(e) => panic!("request limiter error: {e}"),
        };

        let path = req.uri().path().to_string();
        let service = match path.as_str() {
            "/fdsnws/station/1/query" => Service::Station,
            "/fdsnws/dataselect/1/query" => Service::Dataselect,
            "/eidaws/wfcatalog/1/query" => Service::Wfcatalog,
            "/fdsnws/station/1/version"
            | "/fdsnws/dataselect/1/version"
            | "/eidaws/wfcatalog/1/version" => {
                return Ok(version_response());
            }
            _ => return Err(Error::NoHandler),
        };

        let (request, original_post) = match *req.method() {
            Method::GET => {
                let query = req.uri().query().unwrap_or("").to_string();
                (parse_get(service, &query)?, false)
            }
            Method::POST => {
                let body = self.read_body(req).await?;
                let body = String::from_utf8_lossy(&body).into_owned();
                (parse_post(service, &body)?, true)
            }
            _ => return Err(Error::NoHandler),
        };

        self.handle_query(service, request, original_post).await
    }

    async fn handle_query(
        &self,
        service: Service,
        request: FdsnRequest,
        original_post: bool,
    ) -> Result<Response<Body>, Error> {
        let nodata = request.nodata();

        // Station routes shrink with the requested level; data requests
        // always resolve at channel granularity.
        let level = match service {
            Service::Station => match request.options.level() {
                Level::Network => ResolveLevel::Network,
                Level::Station => ResolveLevel::Station,
                Level::Channel => ResolveLevel::Channel,
                Level::Response => ResolveLevel::Response,
            },
            _ => ResolveLevel::Channel,
        };
        let resolve_options = ResolveOptions {
            level,
            access: Access::Any,
            include_alternates: false,
        };

        let routes = self
            .catalog
            .resolve(&request.stream_epochs, service, request.window, &resolve_options)
            .await?;
        if routes.is_empty() {
            return Err(Error::NoData { nodata });
        }

        let sub_requests = decompose(
            &routes,
            service,
            &request.options,
            original_post,
            chrono::Utc::now(),
            &self.config,
        );
        debug!(
            service = %service,
            routes = routes.len(),
            sub_requests = sub_requests.len(),
            "dispatching federated job"
        );

        let arena = Arc::new(self.arenas.new_arena().await?);
        let cancel = CancellationToken::new();
        // tearing down this future (client disconnect) cancels the job
        let _cancel_guard = cancel.clone().drop_guard();

        let outcomes = self
            .dispatcher
            .run(
                Arc::clone(&arena),
                sub_requests,
                cancel.clone(),
                self.config.failure_policy,
            )
            .await;

        let failures: Vec<&SubRequestOutcome> =
            outcomes.iter().filter(|o| !o.is_ok()).collect();

        if self.config.failure_policy == FailurePolicy::AllOrNothing && !failures.is_empty() {
            if failures
                .iter()
                .any(|f| f.state == SubRequestState::Timeout)
            {
                return Err(Error::JobTimeout);
            }
            return Err(Error::UpstreamFailure {
                detail: error_accounting(&failures),
            });
        }

        let ok_parts: Vec<OkPart> = outcomes
            .iter()
            .filter(|o| o.is_ok())
            .map(|o| OkPart {
                path: o.spool.clone().expect("ok outcomes carry a spool file"),
                bytes: o.bytes,
                sort_key: o.request.sort_key(),
            })
            .collect();

        if ok_parts.is_empty() {
            // best-effort, and not a single sub-request succeeded
            if failures.iter().all(|f| f.state == SubRequestState::Timeout) {
                return Err(Error::JobTimeout);
            }
            return Err(Error::UpstreamFailure {
                detail: error_accounting(&failures),
            });
        }
        if ok_parts.iter().all(|p| p.bytes == 0) {
            // every upstream answered with an empty part
            return Err(Error::NoData { nodata });
        }

        let kind = MergeKind::for_request(service, &request.options);
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            // the arena lives exactly as long as the merge; dropping it
            // afterwards removes the spool directory
            let _arena = arena;
            if let Err(e) = merge(kind, ok_parts, &tx).await {
                // the response has started: truncate the body and let the
                // connection close without a trailer
                warn!(error = %e, "merge failed mid-response");
                let _ = tx
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        e.to_string(),
                    )))
                    .await;
            }
        });

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, kind.content_type())
            .header(VERSION_HEADER, version_header_value());
        if let Some(cache_control) = &self.config.cache_control {
            builder = builder.header(CACHE_CONTROL, cache_control.as_str());
        }
        if !failures.is_empty() {
            builder = builder.header(ERRORS_HEADER, error_accounting(&failures));
        }

        Ok(builder
            .body(Body::wrap_stream(ReceiverStream::new(rx)))
            .expect("static response headers are valid"))
    }

    /// Read the client's POST body, applying the size limit.
    async fn read_body(&self, req: Request<Body>) -> Result<bytes::Bytes, Error> {
        let mut payload = req.into_body();
        let mut body = BytesMut::new();
        while let Some(chunk) = payload.next().await {
            let chunk = chunk.map_err(Error::ClientHangup)?;
            if body.len() + chunk.len() > MAX_REQUEST_BYTES {
                return Err(Error::RequestSizeExceeded(MAX_REQUEST_BYTES));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

fn version_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(VERSION_HEADER, version_header_value())
        .body(Body::from(concat!(env!("CARGO_PKG_VERSION"), "\n")))
        .expect("static response headers are valid")
}

/// `host=state` accounting used in the diagnostics header and the
/// all-or-nothing error body.
fn error_accounting(failures: &[&SubRequestOutcome]) -> String {
    let mut entries: Vec<String> = failures
        .iter()
        .map(|f| {
            let host = url::Url::parse(&f.request.url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
                .unwrap_or_else(|| f.request.url.clone());
            format!("{host}={}", f.state.token())
        })
        .collect();
    entries.sort();
    entries.dedup();
    entries.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use routing_catalog::interface::{ChannelEpochRow, HarvestRow, RestrictedStatus, StalePolicy};
    use routing_catalog::mem::MemCatalog;
    use std::time::Duration;
    use stream_types::TimeWindow;

    fn ts(s: &str) -> chrono::DateTime<chrono::Utc> {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
            .unwrap()
            .and_utc()
    }

    async fn seeded_catalog(rows: Vec<HarvestRow>) -> Arc<MemCatalog> {
        let catalog = Arc::new(MemCatalog::new());
        let dc = catalog
            .create_or_get_data_center("test", "http://test.example/routing.xml")
            .await
            .unwrap();
        catalog
            .replace_batch(dc.id, rows, StalePolicy::Remove, ts("2020-01-01T00:00:00"))
            .await
            .unwrap();
        catalog
    }

    fn fact(net: &str, sta: &str, url: &str, service: Service) -> HarvestRow {
        HarvestRow {
            channel: ChannelEpochRow {
                network: net.to_string(),
                station: sta.to_string(),
                location: String::new(),
                channel: "HHZ".to_string(),
                starttime: ts("2019-01-01T00:00:00"),
                endtime: None,
                restricted_status: RestrictedStatus::Open,
            },
            service,
            endpoint_url: url.to_string(),
            route_start: ts("2019-01-01T00:00:00"),
            route_end: None,
            is_primary: true,
        }
    }

    async fn delegate(
        catalog: Arc<MemCatalog>,
        config: FederatorConfig,
    ) -> (tempfile::TempDir, HttpDelegate) {
        let tmp = tempfile::tempdir().unwrap();
        let arenas = Arc::new(
            ArenaSet::create(tmp.path().join("spool"), u64::MAX, Duration::from_secs(3600))
                .await
                .unwrap(),
        );
        let delegate = HttpDelegate::new(catalog as Arc<dyn Catalog>, arenas, config);
        (tmp, delegate)
    }

    fn quick_config() -> FederatorConfig {
        FederatorConfig {
            job_deadline: Duration::from_secs(5),
            request_timeout: Duration::from_secs(2),
            max_attempts: 2,
            backoff: backoff::BackoffConfig {
                init_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                base: 2.0,
                deadline: None,
            },
            ..Default::default()
        }
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let catalog = seeded_catalog(vec![]).await;
        let (_tmp, delegate) = delegate(catalog, quick_config()).await;
        let request = Request::builder()
            .method(Method::GET)
            .uri("http://localhost/fdsnws/bogus/1/query")
            .body(Body::empty())
            .unwrap();
        assert_matches!(delegate.route(request).await, Err(Error::NoHandler));
    }

    #[tokio::test]
    async fn version_endpoint_answers() {
        let catalog = seeded_catalog(vec![]).await;
        let (_tmp, delegate) = delegate(catalog, quick_config()).await;
        let request = Request::builder()
            .method(Method::GET)
            .uri("http://localhost/fdsnws/dataselect/1/version")
            .body(Body::empty())
            .unwrap();
        let response = delegate.route(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains(env!("CARGO_PKG_VERSION")));
    }

    #[tokio::test]
    async fn malformed_query_is_a_client_error() {
        let catalog = seeded_catalog(vec![]).await;
        let (_tmp, delegate) = delegate(catalog, quick_config()).await;
        let request = Request::builder()
            .method(Method::GET)
            .uri("http://localhost/fdsnws/dataselect/1/query?bogus=1")
            .body(Body::empty())
            .unwrap();
        let err = delegate.route(request).await.unwrap_err();
        assert_eq!(err.as_status_code(), StatusCode::BAD_REQUEST);
        assert_matches!(err, Error::InvalidRequest(_));
    }

    #[tokio::test]
    async fn unroutable_request_yields_no_data() {
        let catalog = seeded_catalog(vec![]).await;
        let (_tmp, delegate) = delegate(catalog, quick_config()).await;
        let request = Request::builder()
            .method(Method::GET)
            .uri("http://localhost/fdsnws/dataselect/1/query?net=XX&sta=YY")
            .body(Body::empty())
            .unwrap();
        let got = delegate.route(request).await;
        assert_matches!(got, Err(Error::NoData { nodata: 204 }));
    }

    #[tokio::test]
    async fn single_upstream_get_round_trip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body("MINISEEDBYTES")
            .create_async()
            .await;

        let catalog = seeded_catalog(vec![fact(
            "CH",
            "AAA",
            &format!("{}/fdsnws/dataselect/1/query", server.url()),
            Service::Dataselect,
        )])
        .await;
        let (_tmp, delegate) = delegate(catalog, quick_config()).await;

        let request = Request::builder()
            .method(Method::GET)
            .uri(
                "http://localhost/fdsnws/dataselect/1/query?net=CH&sta=AAA&cha=HHZ\
                 &start=2020-01-01T00:00:00&end=2020-01-02T00:00:00",
            )
            .body(Body::empty())
            .unwrap();
        let response = delegate.route(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/vnd.fdsn.mseed"
        );
        assert!(response.headers().get(VERSION_HEADER).is_some());
        assert_eq!(
            response.headers().get(CACHE_CONTROL).unwrap(),
            "no-store"
        );
        assert_eq!(body_string(response).await, "MINISEEDBYTES");
    }

    #[tokio::test]
    async fn multi_endpoint_post_concatenates_bodies() {
        let mut eth = mockito::Server::new_async().await;
        eth.mock("POST", mockito::Matcher::Any)
            .with_status(200)
            .with_body("ETHDATA")
            .create_async()
            .await;
        let mut bgr = mockito::Server::new_async().await;
        bgr.mock("POST", mockito::Matcher::Any)
            .with_status(200)
            .with_body("BGRDATA")
            .create_async()
            .await;

        let catalog = seeded_catalog(vec![
            fact(
                "CH",
                "AAA",
                &format!("{}/fdsnws/dataselect/1/query", eth.url()),
                Service::Dataselect,
            ),
            fact(
                "GR",
                "BFO",
                &format!("{}/fdsnws/dataselect/1/query", bgr.url()),
                Service::Dataselect,
            ),
        ])
        .await;
        let (_tmp, delegate) = delegate(catalog, quick_config()).await;

        let request = Request::builder()
            .method(Method::POST)
            .uri("http://localhost/fdsnws/dataselect/1/query")
            .body(Body::from(
                "CH AAA -- HHZ 2020-01-01T00:00:00 2020-01-01T01:00:00\n\
                 GR BFO -- HHZ 2020-01-01T00:00:00 2020-01-01T01:00:00\n",
            ))
            .unwrap();
        let response = delegate.route(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // stream order is lexicographic on the SEED id: CH before GR
        assert_eq!(body_string(response).await, "ETHDATABGRDATA");
    }

    #[tokio::test]
    async fn best_effort_folds_failures_into_headers() {
        let mut good = mockito::Server::new_async().await;
        good.mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body("GOODDATA")
            .create_async()
            .await;
        let mut bad = mockito::Server::new_async().await;
        bad.mock("GET", mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let catalog = seeded_catalog(vec![
            fact(
                "CH",
                "AAA",
                &format!("{}/fdsnws/dataselect/1/query", good.url()),
                Service::Dataselect,
            ),
            fact(
                "GR",
                "BFO",
                &format!("{}/fdsnws/dataselect/1/query", bad.url()),
                Service::Dataselect,
            ),
        ])
        .await;
        let (_tmp, delegate) = delegate(catalog, quick_config()).await;

        let request = Request::builder()
            .method(Method::GET)
            .uri(
                "http://localhost/fdsnws/dataselect/1/query?net=*&cha=HHZ\
                 &start=2020-01-01T00:00:00&end=2020-01-02T00:00:00",
            )
            .body(Body::empty())
            .unwrap();
        let response = delegate.route(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let errors = response.headers().get(ERRORS_HEADER).unwrap();
        assert!(errors.to_str().unwrap().contains("=5xx"));
        assert_eq!(body_string(response).await, "GOODDATA");
    }

    #[tokio::test]
    async fn all_or_nothing_fails_the_job() {
        let mut bad = mockito::Server::new_async().await;
        bad.mock("GET", mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let catalog = seeded_catalog(vec![fact(
            "CH",
            "AAA",
            &format!("{}/fdsnws/dataselect/1/query", bad.url()),
            Service::Dataselect,
        )])
        .await;
        let config = FederatorConfig {
            failure_policy: FailurePolicy::AllOrNothing,
            ..quick_config()
        };
        let (_tmp, delegate) = delegate(catalog, config).await;

        let request = Request::builder()
            .method(Method::GET)
            .uri(
                "http://localhost/fdsnws/dataselect/1/query?net=CH\
                 &start=2020-01-01T00:00:00&end=2020-01-02T00:00:00",
            )
            .body(Body::empty())
            .unwrap();
        let err = delegate.route(request).await.unwrap_err();
        assert_eq!(err.as_status_code(), StatusCode::BAD_GATEWAY);
        assert_matches!(err, Error::UpstreamFailure { .. });
    }

    #[tokio::test]
    async fn all_upstreams_empty_yield_no_data() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Any)
            .with_status(204)
            .create_async()
            .await;

        let catalog = seeded_catalog(vec![fact(
            "CH",
            "AAA",
            &format!("{}/fdsnws/dataselect/1/query", server.url()),
            Service::Dataselect,
        )])
        .await;
        let (_tmp, delegate) = delegate(catalog, quick_config()).await;

        let request = Request::builder()
            .method(Method::GET)
            .uri(
                "http://localhost/fdsnws/dataselect/1/query?net=CH\
                 &start=2020-01-01T00:00:00&end=2020-01-02T00:00:00",
            )
            .body(Body::empty())
            .unwrap();
        assert_matches!(
            delegate.route(request).await,
            Err(Error::NoData { nodata: 204 })
        );
    }

    #[tokio::test]
    async fn arena_is_empty_after_the_response_body_finishes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body("DATA")
            .create_async()
            .await;

        let catalog = seeded_catalog(vec![fact(
            "CH",
            "AAA",
            &format!("{}/fdsnws/dataselect/1/query", server.url()),
            Service::Dataselect,
        )])
        .await;
        let (tmp, delegate) = delegate(catalog, quick_config()).await;

        let request = Request::builder()
            .method(Method::GET)
            .uri(
                "http://localhost/fdsnws/dataselect/1/query?net=CH\
                 &start=2020-01-01T00:00:00&end=2020-01-02T00:00:00",
            )
            .body(Body::empty())
            .unwrap();
        let response = delegate.route(request).await.unwrap();
        assert_eq!(body_string(response).await, "DATA");

        // the merge task drops the arena once the body is exhausted
        tokio::time::sleep(Duration::from_millis(100)).await;
        let spool_root = tmp.path().join("spool");
        let remaining = std::fs::read_dir(&spool_root).unwrap().count();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            Error::NoData { nodata: 204 }.as_status_code(),
            StatusCode::NO_CONTENT
        );
        assert_eq!(
            Error::NoData { nodata: 404 }.as_status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(Error::JobTimeout.as_status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            Error::RequestLimit.as_status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::UpstreamFailure {
                detail: "eth=5xx".to_string()
            }
            .as_status_code(),
            StatusCode::BAD_GATEWAY
        );
    }
}
