//! Stream the spooled parts of a job into one protocol-correct response
//! body.
//!
//! The merger never materializes the merged body: parts are read in
//! chunks and forwarded through a bounded channel that the HTTP layer
//! wraps into the response body stream.

pub mod station_xml;

use std::io::SeekFrom;
use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use fdsnws_protocol::Options;
use stream_types::Service;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;

const CHUNK_SIZE: usize = 64 * 1024;

/// How a federated response body is assembled from its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Self-framed records; raw byte concatenation in stream order.
    MiniSeed,
    /// One combined `FDSNStationXML` document.
    StationXml,
    /// Header row from the first non-empty part, body rows from all.
    Text,
    /// One top-level JSON array.
    JsonArray,
}

impl MergeKind {
    /// The merge strategy implied by the requested service and options.
    pub fn for_request(service: Service, options: &Options) -> Self {
        match service {
            Service::Dataselect => Self::MiniSeed,
            Service::Wfcatalog => Self::JsonArray,
            Service::Station => {
                if options.format() == "text" {
                    Self::Text
                } else {
                    Self::StationXml
                }
            }
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::MiniSeed => "application/vnd.fdsn.mseed",
            Self::StationXml => "application/xml",
            Self::Text => "text/plain; charset=utf-8",
            Self::JsonArray => "application/json",
        }
    }
}

/// One successfully spooled part, ready to merge.
#[derive(Debug)]
pub struct OkPart {
    pub path: PathBuf,
    pub bytes: u64,
    /// Stream order: SEED id and start time of the part's first epoch.
    pub sort_key: (String, DateTime<Utc>),
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("spool I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("StationXML merge failed: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("client disconnected")]
    ClientDisconnected,
}

pub type Result<T, E = MergeError> = std::result::Result<T, E>;

/// The channel half the merger writes the body into.
pub type BodySender = mpsc::Sender<std::result::Result<Bytes, std::io::Error>>;

/// Merge `parts` into `tx` according to `kind`. Parts are brought into
/// stream order first; the dispatcher's completion order carries no
/// meaning.
pub async fn merge(kind: MergeKind, mut parts: Vec<OkPart>, tx: &BodySender) -> Result<()> {
    parts.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));

    match kind {
        MergeKind::MiniSeed => merge_concat(&parts, tx).await,
        MergeKind::Text => merge_text(&parts, tx).await,
        MergeKind::JsonArray => merge_json(&parts, tx).await,
        MergeKind::StationXml => station_xml::merge(&parts, tx).await,
    }
}

pub(crate) async fn send(tx: &BodySender, bytes: Bytes) -> Result<()> {
    tx.send(Ok(bytes))
        .await
        .map_err(|_| MergeError::ClientDisconnected)
}

/// Stream the byte range `[start, end)` of `path` into `tx`.
pub(crate) async fn send_range(path: &PathBuf, start: u64, end: u64, tx: &BodySender) -> Result<()> {
    if end <= start {
        return Ok(());
    }
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut remaining = end - start;
    let mut buf = vec![0_u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let got = file.read(&mut buf[..want]).await?;
        if got == 0 {
            return Err(MergeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "spool file truncated while merging",
            )));
        }
        send(tx, Bytes::copy_from_slice(&buf[..got])).await?;
        remaining -= got as u64;
    }
    Ok(())
}

/// Raw concatenation: correct for miniSEED, whose records are self-framed
/// and independent. The merger must not re-order within a part.
async fn merge_concat(parts: &[OkPart], tx: &BodySender) -> Result<()> {
    for part in parts.iter().filter(|p| p.bytes > 0) {
        send_range(&part.path, 0, part.bytes, tx).await?;
    }
    Ok(())
}

/// Keep the header row of the first non-empty part; append only body rows
/// of the others.
async fn merge_text(parts: &[OkPart], tx: &BodySender) -> Result<()> {
    let mut emitted_any = false;
    for part in parts.iter().filter(|p| p.bytes > 0) {
        if !emitted_any {
            send_range(&part.path, 0, part.bytes, tx).await?;
            emitted_any = true;
            continue;
        }

        let file = tokio::fs::File::open(&part.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut buffered = String::new();
        while let Some(line) = lines.next_line().await? {
            if line.starts_with('#') {
                continue;
            }
            buffered.push_str(&line);
            buffered.push('\n');
            if buffered.len() >= CHUNK_SIZE {
                send(tx, Bytes::from(std::mem::take(&mut buffered))).await?;
            }
        }
        if !buffered.is_empty() {
            send(tx, Bytes::from(buffered)).await?;
        }
    }
    Ok(())
}

/// Merge JSON-array parts into one array: each part's brackets are
/// stripped and the entries joined with commas.
async fn merge_json(parts: &[OkPart], tx: &BodySender) -> Result<()> {
    send(tx, Bytes::from_static(b"[")).await?;

    let mut emitted_any = false;
    for part in parts.iter().filter(|p| p.bytes > 0) {
        let Some((start, end)) = json_entry_span(&part.path, part.bytes).await? else {
            continue;
        };
        if emitted_any {
            send(tx, Bytes::from_static(b",")).await?;
        }
        send_range(&part.path, start, end, tx).await?;
        emitted_any = true;
    }

    send(tx, Bytes::from_static(b"]")).await?;
    Ok(())
}

/// Locate the entry bytes between a part's outer brackets; `None` when
/// the part holds an empty array.
async fn json_entry_span(path: &PathBuf, size: u64) -> Result<Option<(u64, u64)>> {
    const PROBE: usize = 4096;

    let mut file = tokio::fs::File::open(path).await?;

    let mut head = vec![0_u8; PROBE.min(size as usize)];
    file.read_exact(&mut head).await?;
    let open = match head.iter().position(|b| *b == b'[') {
        Some(open) => open as u64,
        None => return Ok(None),
    };

    let tail_len = PROBE.min(size as usize);
    file.seek(SeekFrom::Start(size - tail_len as u64)).await?;
    let mut tail = vec![0_u8; tail_len];
    file.read_exact(&mut tail).await?;
    let close = match tail.iter().rposition(|b| *b == b']') {
        Some(close) => size - tail_len as u64 + close as u64,
        None => return Ok(None),
    };

    if close <= open + 1 {
        return Ok(None);
    }

    // an all-whitespace interior is an empty array
    if close - open <= PROBE as u64 {
        file.seek(SeekFrom::Start(open + 1)).await?;
        let mut interior = vec![0_u8; (close - open - 1) as usize];
        file.read_exact(&mut interior).await?;
        if interior.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }
    }

    Ok(Some((open + 1, close)))
}

/// The combined document header emitted before the first merged network.
pub(crate) fn station_xml_header(created: DateTime<Utc>) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <FDSNStationXML xmlns=\"http://www.fdsn.org/xml/station/1\" schemaVersion=\"1.0\">\
         <Source>EIDA</Source>\
         <Created>{}</Created>",
        created.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

pub(crate) const STATION_XML_FOOTER: &str = "</FDSNStationXML>";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_stream::StreamExt;

    fn ts(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
            .unwrap()
            .and_utc()
    }

    async fn part(dir: &tempfile::TempDir, name: &str, content: &str, key: &str) -> OkPart {
        let path = dir.path().join(name);
        tokio::fs::write(&path, content).await.unwrap();
        OkPart {
            path,
            bytes: content.len() as u64,
            sort_key: (key.to_string(), ts("2020-01-01T00:00:00")),
        }
    }

    async fn run_merge(kind: MergeKind, parts: Vec<OkPart>) -> String {
        let (tx, rx) = mpsc::channel(8);
        let merger = tokio::spawn(async move { merge(kind, parts, &tx).await });
        let collected: Vec<_> = ReceiverStream::new(rx).collect().await;
        merger.await.unwrap().unwrap();
        collected
            .into_iter()
            .map(|chunk| String::from_utf8(chunk.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn miniseed_concatenates_in_stream_order() {
        let dir = tempfile::tempdir().unwrap();
        // handed over out of order: completion order carries no meaning
        let parts = vec![
            part(&dir, "b", "SECOND", "GR.BFO..HHZ").await,
            part(&dir, "a", "FIRST", "CH.AAA..HHZ").await,
        ];
        let merged = run_merge(MergeKind::MiniSeed, parts).await;
        assert_eq!(merged, "FIRSTSECOND");
    }

    #[tokio::test]
    async fn miniseed_skips_empty_parts() {
        let dir = tempfile::tempdir().unwrap();
        let parts = vec![
            part(&dir, "a", "", "CH.AAA..HHZ").await,
            part(&dir, "b", "DATA", "GR.BFO..HHZ").await,
        ];
        let merged = run_merge(MergeKind::MiniSeed, parts).await;
        assert_eq!(merged, "DATA");
    }

    #[tokio::test]
    async fn text_keeps_one_header_row() {
        let dir = tempfile::tempdir().unwrap();
        let parts = vec![
            part(
                &dir,
                "a",
                "#Network|Station\nCH|AAA\n",
                "CH.AAA..HHZ",
            )
            .await,
            part(
                &dir,
                "b",
                "#Network|Station\nGR|BFO\n",
                "GR.BFO..HHZ",
            )
            .await,
        ];
        let merged = run_merge(MergeKind::Text, parts).await;
        assert_eq!(merged, "#Network|Station\nCH|AAA\nGR|BFO\n");
    }

    #[tokio::test]
    async fn json_parts_merge_into_one_array() {
        let dir = tempfile::tempdir().unwrap();
        let parts = vec![
            part(&dir, "a", r#"[{"s":"AAA"},{"s":"BBB"}]"#, "CH.AAA..HHZ").await,
            part(&dir, "b", "[{\"s\":\"BFO\"}]\n", "GR.BFO..HHZ").await,
        ];
        let merged = run_merge(MergeKind::JsonArray, parts).await;
        assert_eq!(merged, r#"[{"s":"AAA"},{"s":"BBB"},{"s":"BFO"}]"#);
    }

    #[tokio::test]
    async fn json_empty_parts_contribute_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let parts = vec![
            part(&dir, "a", "[]", "CH.AAA..HHZ").await,
            part(&dir, "b", "[ ]\n", "CH.BBB..HHZ").await,
            part(&dir, "c", "[{\"s\":\"BFO\"}]", "GR.BFO..HHZ").await,
        ];
        let merged = run_merge(MergeKind::JsonArray, parts).await;
        assert_eq!(merged, r#"[{"s":"BFO"}]"#);
    }

    #[tokio::test]
    async fn merge_kind_selection() {
        let station_opts = Options::new(Service::Station);
        assert_eq!(
            MergeKind::for_request(Service::Station, &station_opts),
            MergeKind::StationXml
        );

        let mut text_opts = Options::new(Service::Station);
        text_opts.set("format", "text").unwrap();
        assert_eq!(
            MergeKind::for_request(Service::Station, &text_opts),
            MergeKind::Text
        );

        assert_eq!(
            MergeKind::for_request(Service::Dataselect, &Options::new(Service::Dataselect)),
            MergeKind::MiniSeed
        );
        assert_eq!(
            MergeKind::for_request(Service::Wfcatalog, &Options::new(Service::Wfcatalog)),
            MergeKind::JsonArray
        );
    }
}
