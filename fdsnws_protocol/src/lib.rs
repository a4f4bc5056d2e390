//! Parser for FDSN web-service requests.
//!
//! Two input shapes are accepted: a GET query string with `net`, `sta`,
//! `loc`, `cha`, `start`, `end` plus service-specific options, and a POST
//! body whose non-parameter lines each name one stream epoch
//! (`NET STA LOC CHA START [END]`). Both decode into a canonical
//! [`FdsnRequest`]: a list of stream-epoch selectors plus a validated
//! option map.
//!
//! Validation is fail-fast: unknown parameter names and malformed values
//! are rejected at the boundary instead of being forwarded upstream.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::collections::BTreeMap;
use std::fmt::Write as _;

use stream_types::time::{self, TimeParseError, TimeWindow};
use stream_types::{Service, Stream, StreamEpoch, EMPTY_LOCATION_TOKEN};

pub mod options;

pub use options::{Level, Options};

/// Error raised while decoding a request. All variants map to a client
/// error on the HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("invalid value for parameter {name}: {value} ({reason})")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("invalid time: {source}")]
    Time {
        #[from]
        source: TimeParseError,
    },

    #[error("starttime must strictly precede endtime ({start} >= {end})")]
    InvalidInterval { start: String, end: String },

    #[error("line {line}: {reason}")]
    PostLine { line: usize, reason: String },

    #[error("request carries no stream-epoch selector")]
    NoSelectors,
}

/// A decoded FDSN request: selector list plus validated options.
#[derive(Debug, Clone)]
pub struct FdsnRequest {
    pub service: Service,
    pub stream_epochs: Vec<StreamEpoch>,
    pub window: TimeWindow,
    pub options: Options,
}

impl FdsnRequest {
    /// The status code to respond with when nothing matches (the FDSN
    /// `nodata` parameter, 204 by default).
    pub fn nodata(&self) -> u16 {
        self.options.nodata()
    }

    /// Serialize back into the POST line-block grammar: one `key=value`
    /// line per option followed by one selector line per stream epoch.
    pub fn to_post_body(&self) -> String {
        let mut body = String::new();
        for (key, value) in self.options.iter() {
            writeln!(body, "{key}={value}").expect("writing to a String cannot fail");
        }
        for epoch in &self.stream_epochs {
            writeln!(body, "{}", post_line(epoch)).expect("writing to a String cannot fail");
        }
        body
    }
}

/// Serialize one stream epoch as an FDSN POST selector line.
///
/// An empty location code is carried as `--`; an open end time is carried
/// as `*` so the line always has six tokens.
pub fn post_line(epoch: &StreamEpoch) -> String {
    let end = match epoch.endtime {
        Some(end) => time::format_fdsn(&end),
        None => "*".to_string(),
    };
    format!(
        "{} {} {} {} {} {}",
        epoch.stream.network,
        epoch.stream.station,
        epoch.stream.location_token(),
        epoch.stream.channel,
        time::format_fdsn(&epoch.starttime),
        end
    )
}

/// Selector parameter names and their aliases.
const SELECTOR_PARAMS: &[(&str, &str)] = &[
    ("net", "network"),
    ("sta", "station"),
    ("loc", "location"),
    ("cha", "channel"),
];

/// Decode the selector vocabulary of a GET query string: `net`, `sta`,
/// `loc`, `cha` (with their long aliases and comma lists) plus `start`
/// and `end`. Parameters outside the vocabulary are handed back for the
/// caller to validate against its own schema.
pub fn parse_selector_query(
    query: &str,
) -> Result<(Vec<StreamEpoch>, TimeWindow, Vec<(String, String)>), ParseError> {
    let mut selectors: BTreeMap<&'static str, String> = BTreeMap::new();
    let mut start = None;
    let mut end = None;
    let mut leftover = Vec::new();

    for (raw_key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let key = raw_key.to_ascii_lowercase();
        let value = value.trim().to_string();

        if let Some(&(short, _)) = SELECTOR_PARAMS
            .iter()
            .find(|(short, long)| key == *short || key == *long)
        {
            set_once(&mut selectors, short, &key, value)?;
        } else if key == "start" || key == "starttime" {
            start = Some(time::parse_fdsn(&value)?);
        } else if key == "end" || key == "endtime" {
            end = Some(time::parse_fdsn(&value)?);
        } else {
            leftover.push((key, value));
        }
    }

    let window = validated_window(start, end)?;
    let stream_epochs = expand_selector_lists(&selectors)
        .into_iter()
        .map(|stream| StreamEpoch {
            stream,
            starttime: window
                .start()
                .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC),
            endtime: window.end(),
        })
        .collect();

    Ok((stream_epochs, window, leftover))
}

/// Decode a GET query string for `service`.
pub fn parse_get(service: Service, query: &str) -> Result<FdsnRequest, ParseError> {
    let (stream_epochs, window, leftover) = parse_selector_query(query)?;

    let mut options = Options::new(service);
    for (key, value) in &leftover {
        options.set(key, value)?;
    }

    Ok(FdsnRequest {
        service,
        stream_epochs,
        window,
        options,
    })
}

/// Decode the line-block grammar of a POST body: `key=value` header
/// lines are handed back with their line numbers, every other non-empty
/// line is a stream-epoch selector row. A body without any selector row
/// is rejected.
pub fn parse_selector_post(
    body: &str,
) -> Result<(Vec<StreamEpoch>, Vec<(usize, String, String)>), ParseError> {
    let mut headers = Vec::new();
    let mut stream_epochs = Vec::new();

    for (index, raw_line) in body.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            // a '=' inside a selector row is not legal FDSN grammar, so
            // this branch is unambiguous
            headers.push((
                index + 1,
                key.trim().to_ascii_lowercase(),
                value.trim().to_string(),
            ));
            continue;
        }

        stream_epochs.push(parse_post_row(line).map_err(|reason| ParseError::PostLine {
            line: index + 1,
            reason,
        })?);
    }

    if stream_epochs.is_empty() {
        return Err(ParseError::NoSelectors);
    }

    Ok((stream_epochs, headers))
}

/// Decode a POST body for `service`.
pub fn parse_post(service: Service, body: &str) -> Result<FdsnRequest, ParseError> {
    let (stream_epochs, headers) = parse_selector_post(body)?;

    let mut options = Options::new(service);
    for (line, key, value) in &headers {
        options.set(key, value).map_err(|e| ParseError::PostLine {
            line: *line,
            reason: e.to_string(),
        })?;
    }

    Ok(FdsnRequest {
        service,
        stream_epochs,
        window: TimeWindow::all(),
        options,
    })
}

fn parse_post_row(line: &str) -> Result<StreamEpoch, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if !(5..=6).contains(&tokens.len()) {
        return Err(format!(
            "expected `NET STA LOC CHA START [END]`, found {} token(s)",
            tokens.len()
        ));
    }

    let starttime = time::parse_fdsn(tokens[4]).map_err(|e| e.to_string())?;
    let endtime = match tokens.get(5) {
        None | Some(&"*") => None,
        Some(token) => Some(time::parse_fdsn(token).map_err(|e| e.to_string())?),
    };
    if let Some(end) = endtime {
        if starttime >= end {
            return Err(format!(
                "starttime must strictly precede endtime ({} >= {})",
                tokens[4], tokens[5]
            ));
        }
    }

    Ok(StreamEpoch {
        stream: Stream {
            network: normalize_code(tokens[0]),
            station: normalize_code(tokens[1]),
            location: normalize_location(tokens[2]),
            channel: normalize_code(tokens[3]),
        },
        starttime,
        endtime,
    })
}

/// Upper-case a SEED code, preserving wildcards.
fn normalize_code(token: &str) -> String {
    token.to_ascii_uppercase()
}

/// Decode a location token: the on-wire `--` means the empty location.
fn normalize_location(token: &str) -> String {
    if token == EMPTY_LOCATION_TOKEN {
        String::new()
    } else {
        token.to_ascii_uppercase()
    }
}

fn set_once(
    selectors: &mut BTreeMap<&'static str, String>,
    short: &'static str,
    key: &str,
    value: String,
) -> Result<(), ParseError> {
    if selectors.insert(short, value).is_some() {
        return Err(ParseError::InvalidValue {
            name: key.to_string(),
            value: String::new(),
            reason: "parameter given more than once".to_string(),
        });
    }
    Ok(())
}

fn validated_window(
    start: Option<chrono::DateTime<chrono::Utc>>,
    end: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<TimeWindow, ParseError> {
    if let (Some(s), Some(e)) = (start, end) {
        if s >= e {
            return Err(ParseError::InvalidInterval {
                start: time::format_fdsn(&s),
                end: time::format_fdsn(&e),
            });
        }
    }
    Ok(TimeWindow::new(start, end))
}

/// Expand comma-separated selector lists into the cartesian product of
/// concrete [`Stream`] patterns. Absent fields default to `*`.
fn expand_selector_lists(selectors: &BTreeMap<&'static str, String>) -> Vec<Stream> {
    let split = |key: &str, location: bool| -> Vec<String> {
        match selectors.get(key) {
            None => vec!["*".to_string()],
            Some(raw) => raw
                .split(',')
                .map(|item| {
                    let item = item.trim();
                    if location {
                        normalize_location(item)
                    } else {
                        normalize_code(item)
                    }
                })
                .collect(),
        }
    };

    let mut streams = Vec::new();
    for net in split("net", false) {
        for sta in split("sta", false) {
            for loc in split("loc", true) {
                for cha in split("cha", false) {
                    streams.push(Stream::new(&net, &sta, &loc, &cha));
                }
            }
        }
    }
    streams
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn get_simple_station_query() {
        let req = parse_get(
            Service::Station,
            "net=CH&sta=AAA&start=2020-01-01T00:00:00&end=2020-01-02T00:00:00&level=channel",
        )
        .unwrap();
        assert_eq!(req.stream_epochs.len(), 1);
        let epoch = &req.stream_epochs[0];
        assert_eq!(epoch.stream, Stream::new("CH", "AAA", "*", "*"));
        assert_eq!(req.options.level(), Level::Channel);
        assert!(req.window.end().is_some());
    }

    #[test]
    fn get_folds_parameter_case_and_code_case() {
        let req = parse_get(Service::Dataselect, "NET=ch&STA=aaa&CHA=hhz").unwrap();
        assert_eq!(
            req.stream_epochs[0].stream,
            Stream::new("CH", "AAA", "*", "HHZ")
        );
    }

    #[test]
    fn get_expands_comma_lists() {
        let req = parse_get(Service::Dataselect, "net=CH,GR&cha=HHZ").unwrap();
        assert_eq!(req.stream_epochs.len(), 2);
        assert_eq!(req.stream_epochs[0].stream.network, "CH");
        assert_eq!(req.stream_epochs[1].stream.network, "GR");
    }

    #[test]
    fn get_rejects_unknown_parameter() {
        assert_matches!(
            parse_get(Service::Dataselect, "net=CH&bogus=1"),
            Err(ParseError::UnknownParameter { name }) if name == "bogus"
        );
    }

    #[test]
    fn get_rejects_inverted_interval() {
        assert_matches!(
            parse_get(
                Service::Dataselect,
                "net=CH&start=2020-01-02T00:00:00&end=2020-01-01T00:00:00",
            ),
            Err(ParseError::InvalidInterval { .. })
        );
        assert_matches!(
            parse_get(
                Service::Dataselect,
                "net=CH&start=2020-01-01T00:00:00&end=2020-01-01T00:00:00",
            ),
            Err(ParseError::InvalidInterval { .. })
        );
    }

    #[test]
    fn post_rows_and_header_lines() {
        let body = "quality=M\n\
                    CH AAA -- HHZ 2020-01-01T00:00:00 2020-01-01T01:00:00\n\
                    GR BFO 00 HHZ 2020-01-01T00:00:00 2020-01-01T01:00:00\n";
        let req = parse_post(Service::Dataselect, body).unwrap();
        assert_eq!(req.stream_epochs.len(), 2);
        assert_eq!(req.stream_epochs[0].stream.location, "");
        assert_eq!(req.stream_epochs[1].stream.location, "00");
        assert_eq!(req.options.get("quality"), Some("M"));
    }

    #[test]
    fn post_open_ended_row() {
        let body = "CH AAA -- HHZ 2020-01-01T00:00:00\n";
        let req = parse_post(Service::Dataselect, body).unwrap();
        assert_eq!(req.stream_epochs[0].endtime, None);
    }

    #[test]
    fn post_error_carries_line_number() {
        let body = "CH AAA -- HHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n\
                    CH AAA -- HHZ\n";
        assert_matches!(
            parse_post(Service::Dataselect, body),
            Err(ParseError::PostLine { line: 2, .. })
        );
    }

    #[test]
    fn post_without_selector_rows_is_rejected() {
        assert_matches!(
            parse_post(Service::Dataselect, "quality=M\n"),
            Err(ParseError::NoSelectors)
        );
        assert_matches!(
            parse_post(Service::Dataselect, ""),
            Err(ParseError::NoSelectors)
        );
    }

    #[test]
    fn post_round_trip_is_semantically_stable() {
        let body = "quality=M\n\
                    GR BFO -- HHZ 2020-01-01T00:00:00 2020-01-01T01:00:00\n\
                    CH AAA -- HHZ 2020-01-01T00:00:00 2020-01-01T01:00:00\n";
        let req = parse_post(Service::Dataselect, body).unwrap();
        let reparsed = parse_post(Service::Dataselect, &req.to_post_body()).unwrap();

        let mut lhs = req.stream_epochs.clone();
        let mut rhs = reparsed.stream_epochs.clone();
        lhs.sort();
        rhs.sort();
        assert_eq!(lhs, rhs);
        assert_eq!(req.options.get("quality"), reparsed.options.get("quality"));
    }

    #[test]
    fn nodata_parameter() {
        let req = parse_get(Service::Station, "net=CH&nodata=404").unwrap();
        assert_eq!(req.nodata(), 404);
        assert_matches!(
            parse_get(Service::Station, "net=CH&nodata=500"),
            Err(ParseError::InvalidValue { .. })
        );
    }
}
