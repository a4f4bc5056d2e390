//! Output formats of the routing resolver: `post`, `get` and `json`.

use serde::Serialize;
use stream_types::time::{self, far_future};
use stream_types::{Route, StreamEpoch};

/// The `format` parameter domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Post,
    Get,
    Json,
}

impl OutputFormat {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "post" => Some(Self::Post),
            "get" => Some(Self::Get),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Post | Self::Get => "text/plain; charset=utf-8",
            Self::Json => "application/json",
        }
    }

    /// Render `routes` in this format.
    pub fn render(&self, routes: &[Route]) -> String {
        match self {
            Self::Post => render_post(routes),
            Self::Get => render_get(routes),
            Self::Json => render_json(routes),
        }
    }
}

fn epoch_line(epoch: &StreamEpoch) -> String {
    format!(
        "{} {} {} {} {} {}",
        epoch.stream.network,
        epoch.stream.station,
        epoch.stream.location_token(),
        epoch.stream.channel,
        time::format_fdsn(&epoch.starttime),
        time::format_fdsn(&epoch.endtime.unwrap_or_else(far_future)),
    )
}

/// Blocks of lines, the first being the endpoint URL, one epoch per
/// following line, blank line between endpoints.
fn render_post(routes: &[Route]) -> String {
    let mut out = String::new();
    for route in routes {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&route.url);
        out.push('\n');
        for epoch in &route.epochs {
            out.push_str(&epoch_line(epoch));
            out.push('\n');
        }
    }
    out
}

/// One URL per epoch with query parameters encoding that epoch.
fn render_get(routes: &[Route]) -> String {
    let mut out = String::new();
    for route in routes {
        for epoch in &route.epochs {
            out.push_str(&route.url);
            out.push('?');
            let mut query = url::form_urlencoded::Serializer::new(String::new());
            query
                .append_pair("net", &epoch.stream.network)
                .append_pair("sta", &epoch.stream.station)
                .append_pair("loc", epoch.stream.location_token())
                .append_pair("cha", &epoch.stream.channel)
                .append_pair("start", &time::format_fdsn(&epoch.starttime))
                .append_pair(
                    "end",
                    &time::format_fdsn(&epoch.endtime.unwrap_or_else(far_future)),
                );
            out.push_str(&query.finish());
            out.push('\n');
        }
    }
    out
}

#[derive(Debug, Serialize)]
struct JsonStream<'a> {
    net: &'a str,
    sta: &'a str,
    loc: &'a str,
    cha: &'a str,
    start: String,
    end: String,
}

#[derive(Debug, Serialize)]
struct JsonRoute<'a> {
    url: &'a str,
    streams: Vec<JsonStream<'a>>,
}

/// Structured list of `{url, streams: [...]}`.
fn render_json(routes: &[Route]) -> String {
    let rendered: Vec<JsonRoute<'_>> = routes
        .iter()
        .map(|route| JsonRoute {
            url: &route.url,
            streams: route
                .epochs
                .iter()
                .map(|epoch| JsonStream {
                    net: &epoch.stream.network,
                    sta: &epoch.stream.station,
                    loc: epoch.stream.location_token(),
                    cha: &epoch.stream.channel,
                    start: time::format_fdsn(&epoch.starttime),
                    end: time::format_fdsn(&epoch.endtime.unwrap_or_else(far_future)),
                })
                .collect(),
        })
        .collect();
    serde_json::to_string(&rendered).expect("route serialization cannot fail")
}
