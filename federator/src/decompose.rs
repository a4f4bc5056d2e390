//! Translate a resolve result into per-endpoint sub-requests.
//!
//! POST is chosen whenever the client's original request was POST or an
//! endpoint's epoch list exceeds the configured threshold; POST batches
//! are split so the encoded body stays below the configured ceilings.

use fdsnws_protocol::{post_line, Options};
use stream_types::{time, Route, Service, StreamEpoch};

use crate::FederatorConfig;

/// HTTP method of a sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubRequestMethod {
    Get,
    Post,
}

/// One upstream request of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRequest {
    pub url: String,
    pub service: Service,
    pub method: SubRequestMethod,
    /// Query parameters (GET only).
    pub query: Vec<(String, String)>,
    /// Line-block body (POST only).
    pub body: Option<String>,
    /// The concrete epochs carried, for merge ordering and diagnostics.
    pub epochs: Vec<StreamEpoch>,
}

impl SubRequest {
    /// Merge ordering key: SEED id and start of the first carried epoch.
    pub fn sort_key(&self) -> (String, chrono::DateTime<chrono::Utc>) {
        self.epochs
            .first()
            .map(|e| (e.stream.id(), e.starttime))
            .unwrap_or_else(|| (String::new(), chrono::DateTime::<chrono::Utc>::MIN_UTC))
    }
}

/// Decompose resolved routes into sub-request descriptors.
///
/// Upstream FDSN requests require a concrete end time, so open-ended
/// epochs are closed at `default_end`, the instant the job was admitted.
pub fn decompose(
    routes: &[Route],
    service: Service,
    options: &Options,
    original_post: bool,
    default_end: chrono::DateTime<chrono::Utc>,
    config: &FederatorConfig,
) -> Vec<SubRequest> {
    let mut requests = Vec::new();
    for route in routes {
        if route.epochs.is_empty() {
            continue;
        }
        let route = Route {
            url: route.url.clone(),
            epochs: route
                .epochs
                .iter()
                .map(|epoch| StreamEpoch {
                    stream: epoch.stream.clone(),
                    starttime: epoch.starttime,
                    endtime: Some(epoch.endtime.unwrap_or(default_end)),
                })
                .collect(),
        };
        if original_post || route.epochs.len() > config.post_threshold {
            requests.extend(post_requests(&route, service, options, config));
        } else {
            requests.extend(get_requests(&route, service, options));
        }
    }
    requests
}

/// One GET per concrete epoch, selector fields replaced by the epoch and
/// the remaining options propagated verbatim.
fn get_requests(route: &Route, service: Service, options: &Options) -> Vec<SubRequest> {
    route
        .epochs
        .iter()
        .map(|epoch| {
            let mut query = vec![
                ("net".to_string(), epoch.stream.network.clone()),
                ("sta".to_string(), epoch.stream.station.clone()),
                ("loc".to_string(), epoch.stream.location_token().to_string()),
                ("cha".to_string(), epoch.stream.channel.clone()),
                ("start".to_string(), time::format_fdsn(&epoch.starttime)),
            ];
            if let Some(end) = epoch.endtime {
                query.push(("end".to_string(), time::format_fdsn(&end)));
            }
            query.extend(
                options
                    .iter_upstream()
                    .map(|(k, v)| (k.to_string(), v.to_string())),
            );
            SubRequest {
                url: route.url.clone(),
                service,
                method: SubRequestMethod::Get,
                query,
                body: None,
                epochs: vec![epoch.clone()],
            }
        })
        .collect()
}

/// POST batches for one endpoint, chunked below the body-byte and epoch
/// ceilings.
fn post_requests(
    route: &Route,
    service: Service,
    options: &Options,
    config: &FederatorConfig,
) -> Vec<SubRequest> {
    let header: String = options
        .iter_upstream()
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect();

    let mut requests = Vec::new();
    let mut body = header.clone();
    let mut epochs: Vec<StreamEpoch> = Vec::new();

    for epoch in &route.epochs {
        let line = format!("{}\n", post_line(epoch));
        let over_bytes = !epochs.is_empty() && body.len() + line.len() > config.max_body_bytes;
        let over_count = epochs.len() >= config.max_epochs_per_request;
        if over_bytes || over_count {
            requests.push(finish_post(route, service, &mut body, &mut epochs, &header));
        }
        body.push_str(&line);
        epochs.push(epoch.clone());
    }
    if !epochs.is_empty() {
        requests.push(finish_post(route, service, &mut body, &mut epochs, &header));
    }
    requests
}

fn finish_post(
    route: &Route,
    service: Service,
    body: &mut String,
    epochs: &mut Vec<StreamEpoch>,
    header: &str,
) -> SubRequest {
    SubRequest {
        url: route.url.clone(),
        service,
        method: SubRequestMethod::Post,
        query: Vec::new(),
        body: Some(std::mem::replace(body, header.to_string())),
        epochs: std::mem::take(epochs),
    }
}
