//! Per-service request options.
//!
//! Each service carries an enumerated option schema; names outside the
//! schema and values outside an option's domain fail at parse time rather
//! than propagating to upstream data centers.

use std::collections::BTreeMap;

use stream_types::Service;

use crate::ParseError;

/// The `fdsnws-station` `level` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Level {
    Network,
    #[default]
    Station,
    Channel,
    Response,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Station => "station",
            Self::Channel => "channel",
            Self::Response => "response",
        }
    }
}

/// How an option's value is validated.
#[derive(Debug, Clone, Copy)]
enum Domain {
    /// One of an enumerated set of tokens.
    OneOf(&'static [&'static str]),
    /// `true` or `false`.
    Bool,
    /// A finite floating point number.
    Float,
    /// The FDSN `nodata` domain: 204 or 404.
    NoData,
}

impl Domain {
    fn check(&self, value: &str) -> Result<(), String> {
        match self {
            Self::OneOf(allowed) => {
                if allowed.contains(&value) {
                    Ok(())
                } else {
                    Err(format!("expected one of {}", allowed.join(", ")))
                }
            }
            Self::Bool => match value {
                "true" | "false" => Ok(()),
                _ => Err("expected true or false".to_string()),
            },
            Self::Float => value
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(|_| ())
                .ok_or_else(|| "expected a finite number".to_string()),
            Self::NoData => match value {
                "204" | "404" => Ok(()),
                _ => Err("expected 204 or 404".to_string()),
            },
        }
    }
}

const LEVELS: &[&str] = &["network", "station", "channel", "response"];
const QUALITIES: &[&str] = &["D", "R", "Q", "M", "B"];

/// The option schema of one service: `(name, domain)` pairs.
fn schema(service: Service) -> &'static [(&'static str, Domain)] {
    match service {
        Service::Dataselect => &[
            ("format", Domain::OneOf(&["miniseed"])),
            ("quality", Domain::OneOf(QUALITIES)),
            ("minimumlength", Domain::Float),
            ("longestonly", Domain::Bool),
            ("nodata", Domain::NoData),
        ],
        Service::Station => &[
            ("format", Domain::OneOf(&["xml", "text"])),
            ("level", Domain::OneOf(LEVELS)),
            ("includerestricted", Domain::Bool),
            ("minlatitude", Domain::Float),
            ("maxlatitude", Domain::Float),
            ("minlongitude", Domain::Float),
            ("maxlongitude", Domain::Float),
            ("nodata", Domain::NoData),
        ],
        Service::Wfcatalog => &[
            ("format", Domain::OneOf(&["json"])),
            ("csegments", Domain::Bool),
            ("granularity", Domain::OneOf(&["day"])),
            ("include", Domain::OneOf(&["default", "sample", "header", "all"])),
            ("longestonly", Domain::Bool),
            ("minimumlength", Domain::Float),
            ("nodata", Domain::NoData),
        ],
    }
}

/// A validated option map for one service.
///
/// Only names present in the service schema are accepted; iteration order
/// is deterministic (sorted by name).
#[derive(Debug, Clone)]
pub struct Options {
    service: Service,
    values: BTreeMap<&'static str, String>,
}

impl Options {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            values: BTreeMap::new(),
        }
    }

    /// Validate and store one option.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), ParseError> {
        let (canonical, domain) = schema(self.service)
            .iter()
            .find(|(known, _)| *known == name)
            .ok_or_else(|| ParseError::UnknownParameter {
                name: name.to_string(),
            })?;
        domain.check(value).map_err(|reason| ParseError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
            reason,
        })?;
        self.values.insert(canonical, value.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn service(&self) -> Service {
        self.service
    }

    /// Iterate `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.values.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// The same pairs minus options that never travel upstream
    /// (currently `nodata`, which only shapes the federated response).
    pub fn iter_upstream(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.iter().filter(|(name, _)| *name != "nodata")
    }

    /// The effective `level`, defaulting per the `fdsnws-station` spec.
    pub fn level(&self) -> Level {
        match self.get("level") {
            Some("network") => Level::Network,
            Some("channel") => Level::Channel,
            Some("response") => Level::Response,
            _ => Level::Station,
        }
    }

    /// The effective no-content status code.
    pub fn nodata(&self) -> u16 {
        match self.get("nodata") {
            Some("404") => 404,
            _ => 204,
        }
    }

    /// The effective response format token for the service.
    pub fn format(&self) -> &str {
        self.get("format").unwrap_or(match self.service {
            Service::Dataselect => "miniseed",
            Service::Station => "xml",
            Service::Wfcatalog => "json",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn unknown_name_rejected() {
        let mut opts = Options::new(Service::Dataselect);
        assert_matches!(
            opts.set("level", "channel"),
            Err(ParseError::UnknownParameter { .. })
        );
    }

    #[test]
    fn value_domains_enforced() {
        let mut opts = Options::new(Service::Station);
        assert_matches!(
            opts.set("level", "bogus"),
            Err(ParseError::InvalidValue { .. })
        );
        opts.set("level", "channel").unwrap();
        assert_eq!(opts.level(), Level::Channel);

        assert_matches!(
            opts.set("includerestricted", "yes"),
            Err(ParseError::InvalidValue { .. })
        );
        opts.set("includerestricted", "false").unwrap();
    }

    #[test]
    fn upstream_iteration_skips_nodata() {
        let mut opts = Options::new(Service::Dataselect);
        opts.set("nodata", "404").unwrap();
        opts.set("quality", "M").unwrap();
        let upstream: Vec<_> = opts.iter_upstream().collect();
        assert_eq!(upstream, vec![("quality", "M")]);
    }

    #[test]
    fn defaults() {
        let opts = Options::new(Service::Station);
        assert_eq!(opts.level(), Level::Station);
        assert_eq!(opts.nodata(), 204);
        assert_eq!(opts.format(), "xml");
    }
}
