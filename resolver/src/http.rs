//! HTTP request handling for `/eidaws/routing/1/query`.
//!
//! Input is the same selector vocabulary as the federator plus `service`
//! and `format`; output is the resolved endpoint groups in the requested
//! format. A query matching nothing answers with the `nodata` status and
//! an empty body.

use std::str::FromStr;
use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Method, Request, Response, StatusCode};
use thiserror::Error;
use tracing::debug;

use fdsnws_protocol::{parse_selector_post, parse_selector_query, ParseError};
use routing_catalog::interface::{Access, Catalog, ResolveLevel, ResolveOptions};
use stream_types::{Service, StreamEpoch, TimeWindow};

use crate::format::OutputFormat;

/// Upper bound on a client POST body.
const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Errors returned by the resolver HTTP request handler.
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

    /// No routes match; carries the `nodata` status to emit.
    #[error("no routes match the request")]
    NoData { nodata: u16 },

    /// The catalog could not be queried.
    #[error("catalog error: {0}")]
    Catalog(#[from] routing_catalog::interface::Error),
}

impl Error {
    pub fn as_status_code(&self) -> StatusCode {
        match self {
            Self::NoHandler => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::RequestSizeExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ClientHangup(_) => StatusCode::BAD_REQUEST,
            Self::NoData { nodata: 404 } => StatusCode::NOT_FOUND,
            Self::NoData { .. } => StatusCode::NO_CONTENT,
            Self::Catalog(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> Response<Body> {
        let status = self.as_status_code();
        let body = if matches!(self, Self::NoData { .. }) {
            Body::empty()
        } else {
            Body::from(format!("Error {}: {}\n", status.as_u16(), self))
        };
        let mut response = Response::new(body);
        *response.status_mut() = status;
        response
    }
}

/// The resolver-specific parameters riding next to the selectors.
#[derive(Debug)]
struct ResolverParams {
    service: Service,
    format: OutputFormat,
    options: ResolveOptions,
    nodata: u16,
}

impl Default for ResolverParams {
    fn default() -> Self {
        Self {
            service: Service::Dataselect,
            format: OutputFormat::default(),
            options: ResolveOptions::default(),
            nodata: 204,
        }
    }
}

impl ResolverParams {
    fn set(&mut self, key: &str, value: &str) -> Result<(), ParseError> {
        let invalid = |reason: &str| ParseError::InvalidValue {
            name: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        match key {
            "service" => {
                self.service = Service::from_str(value)
                    .map_err(|_| invalid("expected station, dataselect or wfcatalog"))?;
            }
            "format" => {
                self.format = OutputFormat::parse(value)
                    .ok_or_else(|| invalid("expected post, get or json"))?;
            }
            "level" => {
                self.options.level = match value {
                    "network" => ResolveLevel::Network,
                    "station" => ResolveLevel::Station,
                    "channel" => ResolveLevel::Channel,
                    "response" => ResolveLevel::Response,
                    _ => return Err(invalid("expected network, station, channel or response")),
                };
            }
            "access" => {
                self.options.access = match value {
                    "any" => Access::Any,
                    "open" => Access::Open,
                    "closed" => Access::Closed,
                    _ => return Err(invalid("expected any, open or closed")),
                };
            }
            "alternative" => {
                self.options.include_alternates = match value {
                    "true" => true,
                    "false" => false,
                    _ => return Err(invalid("expected true or false")),
                };
            }
            "nodata" => {
                self.nodata = match value {
                    "204" => 204,
                    "404" => 404,
                    _ => return Err(invalid("expected 204 or 404")),
                };
            }
            _ => {
                return Err(ParseError::UnknownParameter {
                    name: key.to_string(),
                })
            }
        }
        Ok(())
    }
}

/// This type services requests to the resolver HTTP endpoint.
#[derive(Debug)]
pub struct HttpDelegate {
    catalog: Arc<dyn Catalog>,
}

impl HttpDelegate {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    /// Routes `req` to the appropriate handler, if any.
    pub async fn route(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        match (req.method().clone(), req.uri().path()) {
            (Method::GET, "/eidaws/routing/1/query") => {
                let query = req.uri().query().unwrap_or("").to_string();
                let (selectors, window, leftover) = parse_selector_query(&query)?;
                let mut params = ResolverParams::default();
                for (key, value) in &leftover {
                    params.set(key, value)?;
                }
                self.resolve(selectors, window, params).await
            }
            (Method::POST, "/eidaws/routing/1/query") => {
                let body = self.read_body(req).await?;
                let body = String::from_utf8_lossy(&body).into_owned();
                let (selectors, headers) = parse_selector_post(&body)?;
                let mut params = ResolverParams::default();
                for (line, key, value) in &headers {
                    params.set(key, value).map_err(|e| ParseError::PostLine {
                        line: *line,
                        reason: e.to_string(),
                    })?;
                }
                self.resolve(selectors, TimeWindow::all(), params).await
            }
            (Method::GET, "/eidaws/routing/1/version") => Ok(Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(Body::from(concat!(env!("CARGO_PKG_VERSION"), "\n")))
                .expect("static response headers are valid")),
            _ => Err(Error::NoHandler),
        }
    }

    async fn resolve(
        &self,
        selectors: Vec<StreamEpoch>,
        window: TimeWindow,
        params: ResolverParams,
    ) -> Result<Response<Body>, Error> {
        let routes = self
            .catalog
            .resolve(&selectors, params.service, window, &params.options)
            .await?;
        debug!(
            service = %params.service,
            selectors = selectors.len(),
            routes = routes.len(),
            "resolved routing query"
        );

        if routes.is_empty() {
            return Err(Error::NoData {
                nodata: params.nodata,
            });
        }

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, params.format.content_type())
            .body(Body::from(params.format.render(&routes)))
            .expect("static response headers are valid"))
    }

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

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{DateTime, NaiveDateTime, Utc};
    use routing_catalog::interface::{
        ChannelEpochRow, HarvestRow, RestrictedStatus, StalePolicy,
    };
    use routing_catalog::mem::MemCatalog;

    fn ts(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
            .unwrap()
            .and_utc()
    }

    async fn seeded_delegate() -> HttpDelegate {
        let catalog = Arc::new(MemCatalog::new());
        let dc = catalog
            .create_or_get_data_center("eth", "http://eth.example/routing.xml")
            .await
            .unwrap();
        catalog
            .replace_batch(
                dc.id,
                vec![HarvestRow {
                    channel: ChannelEpochRow {
                        network: "CH".to_string(),
                        station: "HASLI".to_string(),
                        location: String::new(),
                        channel: "HHZ".to_string(),
                        starttime: ts("2019-01-01T00:00:00"),
                        endtime: None,
                        restricted_status: RestrictedStatus::Open,
                    },
                    service: Service::Dataselect,
                    endpoint_url: "http://eth.example/fdsnws/dataselect/1/query".to_string(),
                    route_start: ts("2019-01-01T00:00:00"),
                    route_end: None,
                    is_primary: true,
                }],
                StalePolicy::Remove,
                ts("2020-01-01T00:00:00"),
            )
            .await
            .unwrap();
        HttpDelegate::new(catalog as Arc<dyn Catalog>)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn get_resolves_to_post_blocks() {
        let delegate = seeded_delegate().await;
        let response = delegate
            .route(get(
                "http://localhost/eidaws/routing/1/query?net=CH&sta=HASLI\
                 &start=2020-01-01T00:00:00&end=2020-01-02T00:00:00&service=dataselect",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.starts_with("http://eth.example/fdsnws/dataselect/1/query\n"));
        assert!(body.contains("CH HASLI -- HHZ 2020-01-01T00:00:00 2020-01-02T00:00:00"));
    }

    #[tokio::test]
    async fn post_body_resolves() {
        let delegate = seeded_delegate().await;
        let request = Request::builder()
            .method(Method::POST)
            .uri("http://localhost/eidaws/routing/1/query")
            .body(Body::from(
                "service=dataselect\nformat=json\n\
                 CH HASLI -- HHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n",
            ))
            .unwrap();
        let response = delegate.route(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = body_string(response).await;
        assert!(body.contains("\"sta\":\"HASLI\""));
    }

    #[tokio::test]
    async fn no_match_yields_no_content() {
        let delegate = seeded_delegate().await;
        let got = delegate
            .route(get("http://localhost/eidaws/routing/1/query?net=XX&sta=YY"))
            .await;
        assert_matches!(got, Err(Error::NoData { nodata: 204 }));
        assert_eq!(
            Error::NoData { nodata: 204 }.as_status_code(),
            StatusCode::NO_CONTENT
        );
    }

    #[tokio::test]
    async fn unknown_parameter_is_rejected() {
        let delegate = seeded_delegate().await;
        let got = delegate
            .route(get("http://localhost/eidaws/routing/1/query?net=CH&bogus=1"))
            .await;
        assert_matches!(
            got,
            Err(Error::InvalidRequest(ParseError::UnknownParameter { .. }))
        );
    }

    #[tokio::test]
    async fn invalid_service_is_rejected() {
        let delegate = seeded_delegate().await;
        let got = delegate
            .route(get(
                "http://localhost/eidaws/routing/1/query?net=CH&service=event",
            ))
            .await;
        assert_matches!(
            got,
            Err(Error::InvalidRequest(ParseError::InvalidValue { .. }))
        );
    }

    #[tokio::test]
    async fn wildcard_selector_with_narrow_window() {
        let delegate = seeded_delegate().await;
        let response = delegate
            .route(get(
                "http://localhost/eidaws/routing/1/query?net=*\
                 &start=2020-01-01T00:00:00&end=2020-01-01T06:00:00&format=get",
            ))
            .await
            .unwrap();
        let body = body_string(response).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("end=2020-01-01T06%3A00%3A00"));
    }
}
