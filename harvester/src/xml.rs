//! Parsers for the two upstream XML documents the harvester consumes: the
//! `eidaws-routing` configuration and `fdsnws-station` level=channel
//! StationXML.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use snafu::Snafu;
use stream_types::time;
use stream_types::{Service, Stream};

use routing_catalog::interface::{ChannelEpochRow, RestrictedStatus};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum XmlError {
    #[snafu(display("malformed XML: {}", source))]
    Malformed { source: quick_xml::Error },

    #[snafu(display("attribute {} is not valid UTF-8", name))]
    BadAttribute { name: String },

    #[snafu(display("invalid datetime in attribute {}: {}", name, value))]
    BadDatetime { name: String, value: String },

    #[snafu(display("element <{}> misses required attribute {}", element, name))]
    MissingAttribute { element: String, name: String },
}

pub type Result<T, E = XmlError> = std::result::Result<T, E>;

/// One `<route>` child of the routing configuration: a stream pattern
/// routed to one service endpoint for a validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedPattern {
    pub stream: Stream,
    pub service: Service,
    pub url: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub is_primary: bool,
}

fn attribute(start: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    let attr = start
        .try_get_attribute(name)
        .map_err(|source| XmlError::Malformed { source })?;
    match attr {
        None => Ok(None),
        Some(attr) => {
            let value = attr.unescape_value().map_err(|source| XmlError::Malformed { source })?;
            Ok(Some(value.into_owned()))
        }
    }
}

fn required_attribute(start: &BytesStart<'_>, element: &str, name: &str) -> Result<String> {
    attribute(start, name)?.ok_or_else(|| XmlError::MissingAttribute {
        element: element.to_string(),
        name: name.to_string(),
    })
}

fn datetime_attribute(start: &BytesStart<'_>, name: &str) -> Result<Option<DateTime<Utc>>> {
    match attribute(start, name)? {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => time::parse_fdsn(&value)
            .map(Some)
            .map_err(|_| XmlError::BadDatetime {
                name: name.to_string(),
                value,
            }),
    }
}

/// Normalize a code attribute: upper case, `--` decoded to the empty
/// location, absent attribute treated as the match-all wildcard.
fn code_attribute(start: &BytesStart<'_>, name: &str) -> Result<String> {
    Ok(match attribute(start, name)? {
        None => "*".to_string(),
        Some(value) if value == stream_types::EMPTY_LOCATION_TOKEN => String::new(),
        Some(value) => value.to_ascii_uppercase(),
    })
}

/// Parse an `eidaws-routing` configuration document.
///
/// Unknown service elements below a `<route>` are skipped; `priority="1"`
/// (or an absent priority) marks the primary endpoint.
pub fn parse_routing_config(document: &str) -> Result<Vec<RoutedPattern>> {
    let mut reader = Reader::from_str(document);
    reader.trim_text(true);

    let mut patterns = Vec::new();
    let mut current_stream: Option<Stream> = None;

    loop {
        let event = reader.read_event().map_err(|source| XmlError::Malformed { source })?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                match e.local_name().as_ref() {
                    b"route" => {
                        current_stream = Some(Stream::new(
                            code_attribute(e, "networkCode")?,
                            code_attribute(e, "stationCode")?,
                            code_attribute(e, "locationCode")?,
                            code_attribute(e, "streamCode")?,
                        ));
                    }
                    name @ (b"station" | b"dataselect" | b"wfcatalog") => {
                        let stream = match &current_stream {
                            Some(stream) => stream.clone(),
                            // a service element outside a <route> scope
                            None => continue,
                        };
                        let service = match name {
                            b"station" => Service::Station,
                            b"dataselect" => Service::Dataselect,
                            _ => Service::Wfcatalog,
                        };
                        let url = required_attribute(e, &service.to_string(), "address")?;
                        let priority = attribute(e, "priority")?
                            .map(|p| p.trim().to_string())
                            .unwrap_or_else(|| "1".to_string());
                        patterns.push(RoutedPattern {
                            stream,
                            service,
                            url,
                            start: datetime_attribute(e, "start")?,
                            end: datetime_attribute(e, "end")?,
                            is_primary: priority == "1",
                        });
                    }
                    _ => {}
                }
            }
            Event::End(ref e) if e.local_name().as_ref() == b"route" => {
                current_stream = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(patterns)
}

/// Parse a `fdsnws-station` level=channel StationXML document into
/// channel epoch rows.
///
/// `restrictedStatus` is inherited from the enclosing network when a
/// channel does not carry its own.
pub fn parse_station_xml(document: &str) -> Result<Vec<ChannelEpochRow>> {
    let mut reader = Reader::from_str(document);
    reader.trim_text(true);

    let mut rows = Vec::new();
    let mut network: Option<(String, RestrictedStatus)> = None;
    let mut station: Option<String> = None;

    loop {
        let event = reader.read_event().map_err(|source| XmlError::Malformed { source })?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => match e.local_name().as_ref() {
                b"Network" => {
                    let code = required_attribute(e, "Network", "code")?.to_ascii_uppercase();
                    let restricted = restricted_attribute(e)?.unwrap_or_default();
                    network = Some((code, restricted));
                }
                b"Station" => {
                    station =
                        Some(required_attribute(e, "Station", "code")?.to_ascii_uppercase());
                }
                b"Channel" => {
                    let (net, net_restricted) = match &network {
                        Some(n) => n.clone(),
                        None => continue,
                    };
                    let sta = match &station {
                        Some(s) => s.clone(),
                        None => continue,
                    };
                    let start = datetime_attribute(e, "startDate")?.ok_or_else(|| {
                        XmlError::MissingAttribute {
                            element: "Channel".to_string(),
                            name: "startDate".to_string(),
                        }
                    })?;
                    rows.push(ChannelEpochRow {
                        network: net,
                        station: sta,
                        location: attribute(e, "locationCode")?
                            .filter(|l| l != stream_types::EMPTY_LOCATION_TOKEN)
                            .map(|l| l.to_ascii_uppercase())
                            .unwrap_or_default(),
                        channel: required_attribute(e, "Channel", "code")?
                            .to_ascii_uppercase(),
                        starttime: start,
                        endtime: datetime_attribute(e, "endDate")?,
                        restricted_status: restricted_attribute(e)?.unwrap_or(net_restricted),
                    });
                }
                _ => {}
            },
            Event::End(ref e) => match e.local_name().as_ref() {
                b"Network" => network = None,
                b"Station" => station = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(rows)
}

fn restricted_attribute(start: &BytesStart<'_>) -> Result<Option<RestrictedStatus>> {
    Ok(attribute(start, "restrictedStatus")?.and_then(|value| value.parse().ok()))
}
