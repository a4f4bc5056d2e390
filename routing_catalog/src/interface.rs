//! Traits and data types for the routing catalog API.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Snafu;
use stream_types::{Route, Service, Stream, StreamEpoch, TimeWindow};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("unhandled sqlx error: {}", source))]
    SqlxError { source: sqlx::Error },

    #[snafu(display("foreign key violation: {}", source))]
    ForeignKeyViolation { source: sqlx::Error },

    #[snafu(display("data center {} not found", id))]
    DataCenterNotFound { id: i64 },

    #[snafu(display("database setup error: {}", source))]
    Setup { source: sqlx::Error },

    #[snafu(display("cannot start a transaction: {}", source))]
    StartTransaction { source: sqlx::Error },

    #[snafu(display("transaction failed to commit: {}", source))]
    FailedToCommit { source: sqlx::Error },

    #[snafu(display("unknown restricted status in store: {}", value))]
    UnknownRestrictedStatus { value: String },
}

/// A specialized `Error` for catalog errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A harvested data center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCenter {
    pub id: i64,
    /// Short operator-facing identifier, e.g. `eth`.
    pub name: String,
    /// URL of the center's routing configuration document.
    pub routing_url: String,
}

/// FDSN restricted status of a channel epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestrictedStatus {
    #[default]
    Open,
    Closed,
    Partial,
}

impl RestrictedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Partial => "partial",
        }
    }
}

impl Display for RestrictedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestrictedStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "partial" => Ok(Self::Partial),
            other => Err(Error::UnknownRestrictedStatus {
                value: other.to_string(),
            }),
        }
    }
}

/// Access filter applied to `dataselect` resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    Any,
    Open,
    Closed,
}

/// What happens to rows of a data center that a fresh harvest batch no
/// longer contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalePolicy {
    /// Close their validity at the harvest timestamp.
    EndDate,
    /// Delete them.
    Remove,
}

/// Level reduction applied to resolved epochs, mirroring the
/// `fdsnws-station` `level` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveLevel {
    Network,
    Station,
    #[default]
    Channel,
    Response,
}

/// Options shaping a resolve query.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    pub level: ResolveLevel,
    pub access: Access,
    /// Also return non-primary (alternate) endpoints.
    pub include_alternates: bool,
}

/// One channel epoch as harvested from `fdsnws-station`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEpochRow {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub starttime: DateTime<Utc>,
    pub endtime: Option<DateTime<Utc>>,
    pub restricted_status: RestrictedStatus,
}

impl ChannelEpochRow {
    pub fn stream(&self) -> Stream {
        Stream::new(
            &self.network,
            &self.station,
            &self.location,
            &self.channel,
        )
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(Some(self.starttime), self.endtime)
    }
}

/// One routing fact of a harvest batch: a channel epoch, the endpoint
/// serving it, and the route validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestRow {
    pub channel: ChannelEpochRow,
    pub service: Service,
    pub endpoint_url: String,
    pub route_start: DateTime<Utc>,
    pub route_end: Option<DateTime<Utc>>,
    pub is_primary: bool,
}

/// Counters returned by [`Catalog::replace_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub upserted: usize,
    pub stale_closed: usize,
    pub stale_removed: usize,
}

/// Methods for working with the routing catalog.
///
/// The two compound operations carry the catalog's public contract:
/// [`Catalog::resolve`] never returns an epoch lying wholly outside the
/// requested window, and [`Catalog::replace_batch`] is atomic per data
/// center: readers observe either none or all rows of a batch.
#[async_trait]
pub trait Catalog: Send + Sync + Debug + Display {
    /// Set up the backing store (create schema, apply migrations).
    async fn setup(&self) -> Result<()>;

    /// Register a data center, or fetch the existing registration.
    async fn create_or_get_data_center(&self, name: &str, routing_url: &str)
        -> Result<DataCenter>;

    /// All registered data centers.
    async fn data_centers(&self) -> Result<Vec<DataCenter>>;

    /// Atomically swap in one harvest batch for `data_center_id`.
    ///
    /// Rows previously associated with the center but absent from `rows`
    /// are end-dated at `harvested_at` or removed, per `policy`.
    async fn replace_batch(
        &self,
        data_center_id: i64,
        rows: Vec<HarvestRow>,
        policy: StalePolicy,
        harvested_at: DateTime<Utc>,
    ) -> Result<BatchSummary>;

    /// Expand `selectors` against the known channels, filter by `service`,
    /// intersect with `window`, and group by endpoint URL.
    ///
    /// Endpoints are ordered by URL; epochs within a group by
    /// `(net, sta, loc, cha, start)`.
    async fn resolve(
        &self,
        selectors: &[StreamEpoch],
        service: Service,
        window: TimeWindow,
        options: &ResolveOptions,
    ) -> Result<Vec<Route>>;
}

/// One joined row feeding route assembly: a concrete channel epoch, the
/// validity window of its routing fact, and the endpoint URL.
#[derive(Debug, Clone)]
pub(crate) struct RouteCandidate {
    pub stream: Stream,
    pub channel_window: TimeWindow,
    pub route_window: TimeWindow,
    pub url: String,
}

/// Assemble the resolve result from joined candidates.
///
/// The authoritative epoch is the intersection of the channel epoch, the
/// route validity window and the request window; empty intersections
/// contribute nothing. Level reduction collapses codes to `*` below the
/// requested level; epochs of one stream are coalesced.
pub(crate) fn assemble_routes(
    candidates: Vec<RouteCandidate>,
    request_window: &TimeWindow,
    level: ResolveLevel,
) -> Vec<Route> {
    let mut grouped: BTreeMap<String, BTreeMap<Stream, Vec<(DateTime<Utc>, Option<DateTime<Utc>>)>>> =
        BTreeMap::new();

    for candidate in candidates {
        let effective = match candidate
            .channel_window
            .intersect(&candidate.route_window)
            .and_then(|w| w.intersect(request_window))
        {
            Some(w) => w,
            None => continue,
        };

        let stream = reduce_level(candidate.stream, level);
        grouped
            .entry(candidate.url)
            .or_default()
            .entry(stream)
            .or_default()
            .push((
                effective
                    .start()
                    .expect("channel epochs always carry a start"),
                effective.end(),
            ));
    }

    grouped
        .into_iter()
        .map(|(url, streams)| {
            let epochs = streams
                .into_iter()
                .flat_map(|(stream, intervals)| coalesce(stream, intervals))
                .collect();
            Route::new(url, epochs)
        })
        .collect()
}

fn reduce_level(stream: Stream, level: ResolveLevel) -> Stream {
    match level {
        ResolveLevel::Network => Stream::new(&stream.network, "*", "*", "*"),
        ResolveLevel::Station => Stream::new(&stream.network, &stream.station, "*", "*"),
        ResolveLevel::Channel | ResolveLevel::Response => stream,
    }
}

/// Merge overlapping or adjacent intervals of one stream into maximal
/// epochs. An absent end is open-ended and swallows everything after its
/// start.
fn coalesce(
    stream: Stream,
    mut intervals: Vec<(DateTime<Utc>, Option<DateTime<Utc>>)>,
) -> Vec<StreamEpoch> {
    intervals.sort_by_key(|(start, end)| (*start, end.unwrap_or(DateTime::<Utc>::MAX_UTC)));

    let mut merged: Vec<(DateTime<Utc>, Option<DateTime<Utc>>)> = Vec::new();
    for (start, end) in intervals {
        match merged.last_mut() {
            Some((_, last_end)) if last_end.map_or(true, |e| start <= e) => {
                *last_end = match (*last_end, end) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                };
            }
            _ => merged.push((start, end)),
        }
    }

    merged
        .into_iter()
        .map(|(start, end)| StreamEpoch::new(stream.clone(), start, end))
        .collect()
}
