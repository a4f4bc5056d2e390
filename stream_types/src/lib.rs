//! Data types shared between the routing catalog, the harvester and the
//! federating request engine: SEED stream identifiers, stream epochs with
//! half-open time windows, service identifiers and resolved routes.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod pattern;
pub mod time;

pub use time::TimeWindow;

/// Location code carried on the wire for an empty location.
pub const EMPTY_LOCATION_TOKEN: &str = "--";

/// The FDSN wildcard matching any number of characters.
pub const WILDCARD_MULTI: char = '*';

/// The FDSN wildcard matching exactly one character.
pub const WILDCARD_SINGLE: char = '?';

/// Web services the catalog routes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Station,
    Dataselect,
    Wfcatalog,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Station => "station",
            Self::Dataselect => "dataselect",
            Self::Wfcatalog => "wfcatalog",
        }
    }

    /// The request path the service is mounted on, relative to a data
    /// center's base URL.
    pub fn query_path(&self) -> &'static str {
        match self {
            Self::Station => "/fdsnws/station/1/query",
            Self::Dataselect => "/fdsnws/dataselect/1/query",
            Self::Wfcatalog => "/eidaws/wfcatalog/1/query",
        }
    }
}

impl Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a [`Service`] from a string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown service: {0}")]
pub struct UnknownService(pub String);

impl FromStr for Service {
    type Err = UnknownService;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "station" => Ok(Self::Station),
            "dataselect" => Ok(Self::Dataselect),
            "wfcatalog" => Ok(Self::Wfcatalog),
            other => Err(UnknownService(other.to_string())),
        }
    }
}

/// A SEED stream identifier.
///
/// The four code fields may contain the FDSN wildcards `*` and `?` while a
/// request is unresolved; resolved streams are concrete. The empty location
/// code is a legal value distinct from the on-wire token `--`, which decodes
/// to the empty string at the parser boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stream {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl Stream {
    pub fn new(
        network: impl Into<String>,
        station: impl Into<String>,
        location: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            station: station.into(),
            location: location.into(),
            channel: channel.into(),
        }
    }

    /// A stream matching everything.
    pub fn wildcard() -> Self {
        Self::new("*", "*", "*", "*")
    }

    /// Dotted SEED identifier, e.g. `CH.HASLI..HHZ`.
    pub fn id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }

    /// True if any code field carries an FDSN wildcard.
    pub fn has_wildcard(&self) -> bool {
        [&self.network, &self.station, &self.location, &self.channel]
            .iter()
            .any(|code| code.contains(WILDCARD_MULTI) || code.contains(WILDCARD_SINGLE))
    }

    /// True if `other`'s concrete codes match this stream's (possibly
    /// wildcarded) codes.
    pub fn matches(&self, other: &Self) -> bool {
        pattern::matches(&self.network, &other.network)
            && pattern::matches(&self.station, &other.station)
            && pattern::matches(&self.location, &other.location)
            && pattern::matches(&self.channel, &other.channel)
    }

    /// The location code as carried on the wire: `--` for empty.
    pub fn location_token(&self) -> &str {
        if self.location.is_empty() {
            EMPTY_LOCATION_TOKEN
        } else {
            &self.location
        }
    }
}

impl Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.network,
            self.station,
            self.location_token(),
            self.channel
        )
    }
}

/// A [`Stream`] paired with a half-open validity window `[start, end)`.
///
/// An absent end time means the epoch is open-ended (the instrument is
/// still operating); it sorts after any concrete end time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamEpoch {
    pub stream: Stream,
    pub starttime: DateTime<Utc>,
    pub endtime: Option<DateTime<Utc>>,
}

impl StreamEpoch {
    pub fn new(stream: Stream, starttime: DateTime<Utc>, endtime: Option<DateTime<Utc>>) -> Self {
        Self {
            stream,
            starttime,
            endtime,
        }
    }

    /// The epoch as a [`TimeWindow`].
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(Some(self.starttime), self.endtime)
    }

    /// Intersect the epoch with `window`, returning `None` when the
    /// intersection is empty.
    pub fn intersect(&self, window: &TimeWindow) -> Option<Self> {
        let clipped = self.window().intersect(window)?;
        Some(Self {
            stream: self.stream.clone(),
            starttime: clipped.start().expect("epoch start is always bounded"),
            endtime: clipped.end(),
        })
    }

    /// Sort key: `(net, sta, loc, cha, start, end)` with an open end
    /// ordered last.
    fn sort_key(&self) -> (&Stream, DateTime<Utc>, DateTime<Utc>) {
        (
            &self.stream,
            self.starttime,
            self.endtime.unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }
}

impl PartialOrd for StreamEpoch {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamEpoch {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl Display for StreamEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.stream, time::format_fdsn(&self.starttime))?;
        match self.endtime {
            Some(end) => write!(f, " {}", time::format_fdsn(&end)),
            None => Ok(()),
        }
    }
}

/// A group of concrete stream epochs served by one endpoint URL, the unit
/// of a resolve result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub url: String,
    pub epochs: Vec<StreamEpoch>,
}

impl Route {
    pub fn new(url: impl Into<String>, mut epochs: Vec<StreamEpoch>) -> Self {
        epochs.sort();
        Self {
            url: url.into(),
            epochs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn ts(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
            .unwrap()
            .and_utc()
    }

    #[test]
    fn stream_id_and_wire_location() {
        let s = Stream::new("CH", "HASLI", "", "HHZ");
        assert_eq!(s.id(), "CH.HASLI..HHZ");
        assert_eq!(s.location_token(), "--");
        assert_eq!(s.to_string(), "CH HASLI -- HHZ");

        let s = Stream::new("CH", "HASLI", "00", "HHZ");
        assert_eq!(s.location_token(), "00");
    }

    #[test]
    fn empty_location_is_distinct_from_token() {
        let blank = Stream::new("CH", "HASLI", "", "HHZ");
        let dashes = Stream::new("CH", "HASLI", "--", "HHZ");
        assert_ne!(blank, dashes);
        assert_eq!(blank.location_token(), dashes.location);
    }

    #[test]
    fn wildcard_detection() {
        assert!(Stream::new("CH", "*", "", "HHZ").has_wildcard());
        assert!(Stream::new("CH", "HASLI", "", "HH?").has_wildcard());
        assert!(!Stream::new("CH", "HASLI", "", "HHZ").has_wildcard());
    }

    #[test]
    fn stream_matching() {
        let pattern = Stream::new("CH", "*", "*", "HH?");
        assert!(pattern.matches(&Stream::new("CH", "HASLI", "", "HHZ")));
        assert!(pattern.matches(&Stream::new("CH", "DAVOX", "00", "HHN")));
        assert!(!pattern.matches(&Stream::new("GR", "BFO", "", "HHZ")));
        assert!(!pattern.matches(&Stream::new("CH", "HASLI", "", "BHZ")));
    }

    #[test]
    fn epoch_ordering_open_end_sorts_last() {
        let stream = Stream::new("CH", "HASLI", "", "HHZ");
        let closed = StreamEpoch::new(
            stream.clone(),
            ts("2020-01-01T00:00:00"),
            Some(ts("2020-06-01T00:00:00")),
        );
        let open = StreamEpoch::new(stream, ts("2020-01-01T00:00:00"), None);
        assert!(closed < open);
    }

    #[test]
    fn epoch_intersection_clips_to_window() {
        let epoch = StreamEpoch::new(
            Stream::new("CH", "HASLI", "", "HHZ"),
            ts("2020-01-01T00:00:00"),
            None,
        );
        let window = TimeWindow::new(
            Some(ts("2020-03-01T00:00:00")),
            Some(ts("2020-04-01T00:00:00")),
        );
        let clipped = epoch.intersect(&window).unwrap();
        assert_eq!(clipped.starttime, ts("2020-03-01T00:00:00"));
        assert_eq!(clipped.endtime, Some(ts("2020-04-01T00:00:00")));

        let disjoint = TimeWindow::new(
            Some(ts("2019-01-01T00:00:00")),
            Some(ts("2019-06-01T00:00:00")),
        );
        assert!(epoch.intersect(&disjoint).is_none());
    }

    #[test]
    fn route_sorts_epochs() {
        let a = StreamEpoch::new(
            Stream::new("GR", "BFO", "", "HHZ"),
            ts("2020-01-01T00:00:00"),
            None,
        );
        let b = StreamEpoch::new(
            Stream::new("CH", "HASLI", "", "HHZ"),
            ts("2020-01-01T00:00:00"),
            None,
        );
        let route = Route::new("http://eth.example/fdsnws/station/1/query", vec![a, b]);
        assert_eq!(route.epochs[0].stream.network, "CH");
        assert_eq!(route.epochs[1].stream.network, "GR");
    }
}
