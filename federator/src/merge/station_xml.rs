//! Structural merge of StationXML parts.
//!
//! Each spooled part is a complete `FDSNStationXML` document from one
//! endpoint. The merger indexes the byte spans of `Network`, `Station`
//! and `Channel` elements in a first pass, then emits one combined
//! document: networks with the same `(code, startDate)` are merged,
//! stations below them likewise, and the `Channel` children of matching
//! stations are unioned by `(code, startDate)` with first-wins for an
//! identical key. Only element spans live in memory; the document bytes
//! stream straight from the spool files.

use std::collections::BTreeSet;
use std::path::PathBuf;

use bytes::Bytes;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{send, send_range, station_xml_header, BodySender, MergeError, OkPart, Result,
            STATION_XML_FOOTER};

type ElementKey = (String, String);

#[derive(Debug, Clone)]
struct ChannelIndex {
    key: ElementKey,
    start: u64,
    end: u64,
}

#[derive(Debug, Clone)]
struct StationIndex {
    key: ElementKey,
    /// First byte of the open-tag region (leading whitespace included).
    start: u64,
    /// First byte of the close-tag region; equals `end` when
    /// self-closing.
    close_start: u64,
    /// Byte past the element.
    end: u64,
    self_closing: bool,
    channels: Vec<ChannelIndex>,
}

#[derive(Debug, Clone)]
struct NetworkIndex {
    key: ElementKey,
    start: u64,
    /// Byte past the open tag.
    content_start: u64,
    close_start: u64,
    end: u64,
    self_closing: bool,
    stations: Vec<StationIndex>,
}

fn attr(start: &BytesStart<'_>, name: &str) -> Result<String> {
    let attribute = start
        .try_get_attribute(name)
        .map_err(MergeError::Xml)?;
    Ok(attribute
        .map(|a| a.unescape_value().map(|v| v.into_owned()))
        .transpose()?
        .unwrap_or_default())
}

fn element_key(start: &BytesStart<'_>) -> Result<ElementKey> {
    Ok((attr(start, "code")?, attr(start, "startDate")?))
}

/// Index the `Network`/`Station`/`Channel` spans of one part.
fn index_part(path: &PathBuf) -> Result<Vec<NetworkIndex>> {
    let file = std::fs::File::open(path)?;
    let mut reader = Reader::from_reader(std::io::BufReader::new(file));
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut networks: Vec<NetworkIndex> = Vec::new();
    let mut current: Option<NetworkIndex> = None;
    let mut open_station: Option<StationIndex> = None;
    let mut open_channel: Option<(ElementKey, u64)> = None;

    loop {
        let pos_before = reader.buffer_position() as u64;
        let event = reader.read_event_into(&mut buf)?;
        let pos_after = reader.buffer_position() as u64;

        match event {
            Event::Start(ref e) if e.local_name().as_ref() == b"Network" => {
                current = Some(NetworkIndex {
                    key: element_key(e)?,
                    start: pos_before,
                    content_start: pos_after,
                    close_start: pos_after,
                    end: pos_after,
                    self_closing: false,
                    stations: Vec::new(),
                });
            }
            Event::Empty(ref e) if e.local_name().as_ref() == b"Network" => {
                networks.push(NetworkIndex {
                    key: element_key(e)?,
                    start: pos_before,
                    content_start: pos_after,
                    close_start: pos_after,
                    end: pos_after,
                    self_closing: true,
                    stations: Vec::new(),
                });
            }
            Event::End(ref e) if e.local_name().as_ref() == b"Network" => {
                if let Some(mut network) = current.take() {
                    network.close_start = pos_before;
                    network.end = pos_after;
                    networks.push(network);
                }
            }
            Event::Start(ref e) if e.local_name().as_ref() == b"Station" => {
                if current.is_some() {
                    open_station = Some(StationIndex {
                        key: element_key(e)?,
                        start: pos_before,
                        close_start: pos_after,
                        end: pos_after,
                        self_closing: false,
                        channels: Vec::new(),
                    });
                }
            }
            Event::Empty(ref e) if e.local_name().as_ref() == b"Station" => {
                if let Some(network) = current.as_mut() {
                    network.stations.push(StationIndex {
                        key: element_key(e)?,
                        start: pos_before,
                        close_start: pos_after,
                        end: pos_after,
                        self_closing: true,
                        channels: Vec::new(),
                    });
                }
            }
            Event::End(ref e) if e.local_name().as_ref() == b"Station" => {
                if let (Some(network), Some(mut station)) =
                    (current.as_mut(), open_station.take())
                {
                    station.close_start = pos_before;
                    station.end = pos_after;
                    network.stations.push(station);
                }
            }
            Event::Start(ref e) if e.local_name().as_ref() == b"Channel" => {
                if open_station.is_some() {
                    open_channel = Some((element_key(e)?, pos_before));
                }
            }
            Event::Empty(ref e) if e.local_name().as_ref() == b"Channel" => {
                if let Some(station) = open_station.as_mut() {
                    station.channels.push(ChannelIndex {
                        key: element_key(e)?,
                        start: pos_before,
                        end: pos_after,
                    });
                }
            }
            Event::End(ref e) if e.local_name().as_ref() == b"Channel" => {
                if let (Some(station), Some((key, start))) =
                    (open_station.as_mut(), open_channel.take())
                {
                    station.channels.push(ChannelIndex {
                        key,
                        start,
                        end: pos_after,
                    });
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(networks)
}

/// Merge StationXML parts into one combined document.
pub(crate) async fn merge(parts: &[OkPart], tx: &BodySender) -> Result<()> {
    // index off the async runtime; only spans are retained
    let mut indexed: Vec<(PathBuf, Vec<NetworkIndex>)> = Vec::new();
    for part in parts.iter().filter(|p| p.bytes > 0) {
        let path = part.path.clone();
        let entry = tokio::task::spawn_blocking(move || {
            let networks = index_part(&path)?;
            Ok::<_, MergeError>((path, networks))
        })
        .await
        .map_err(|e| MergeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        indexed.push(entry);
    }

    send(tx, Bytes::from(station_xml_header(chrono::Utc::now()))).await?;

    // first-seen network order across parts
    let mut order: Vec<ElementKey> = Vec::new();
    for (_, networks) in &indexed {
        for network in networks {
            if !order.contains(&network.key) {
                order.push(network.key.clone());
            }
        }
    }

    for key in &order {
        let occurrences: Vec<(&PathBuf, &NetworkIndex)> = indexed
            .iter()
            .flat_map(|(path, networks)| {
                networks
                    .iter()
                    .filter(|n| n.key == *key)
                    .map(move |n| (path, n))
            })
            .collect();
        merge_network(&occurrences, tx).await?;
    }

    send(tx, Bytes::from_static(STATION_XML_FOOTER.as_bytes())).await?;
    Ok(())
}

/// Emit one merged `Network` element from its occurrences across parts.
async fn merge_network(
    occurrences: &[(&PathBuf, &NetworkIndex)],
    tx: &BodySender,
) -> Result<()> {
    let (first_path, first) = occurrences[0];

    // a network present in a single part passes through byte-exact
    if occurrences.len() == 1 {
        return send_range(first_path, first.start, first.end, tx).await;
    }

    // stations of the same key across parts merge into one element;
    // first-seen order, keyed occurrences gathered up front
    let mut station_order: Vec<ElementKey> = Vec::new();
    let mut station_occurrences: Vec<(ElementKey, Vec<(&PathBuf, &StationIndex)>)> = Vec::new();
    for &(path, network) in occurrences {
        for station in &network.stations {
            match station_occurrences
                .iter_mut()
                .find(|(key, _)| *key == station.key)
            {
                Some((_, occs)) => occs.push((path, station)),
                None => {
                    station_order.push(station.key.clone());
                    station_occurrences.push((station.key.clone(), vec![(path, station)]));
                }
            }
        }
    }
    let occurrences_of = |key: &ElementKey| -> &[(&PathBuf, &StationIndex)] {
        &station_occurrences
            .iter()
            .find(|(k, _)| k == key)
            .expect("every ordered station key was gathered")
            .1
    };

    if first.self_closing {
        // re-open the element so the stations fit inside
        let open = read_range(first_path, first.start, first.end).await?;
        let reopened = match open.rfind("/>") {
            Some(idx) => format!("{}>", &open[..idx]),
            None => open,
        };
        send(tx, Bytes::from(reopened)).await?;
    } else {
        send_range(first_path, first.start, first.content_start, tx).await?;
    }

    // the first occurrence's content in document order: non-station
    // children pass through, each station span is replaced by its merged
    // element
    let mut emitted: BTreeSet<ElementKey> = BTreeSet::new();
    if !first.self_closing {
        let mut cursor = first.content_start;
        for station in &first.stations {
            send_range(first_path, cursor, station.start, tx).await?;
            merge_station(occurrences_of(&station.key), tx).await?;
            emitted.insert(station.key.clone());
            cursor = station.end;
        }
        send_range(first_path, cursor, first.close_start, tx).await?;
    }

    // stations the other parts contribute beyond the first occurrence
    for key in &station_order {
        if emitted.insert(key.clone()) {
            merge_station(occurrences_of(key), tx).await?;
        }
    }

    send(tx, Bytes::from_static(b"</Network>")).await?;
    Ok(())
}

/// Emit one merged `Station` element: the first occurrence's content,
/// plus the `Channel` children of the other occurrences unioned by
/// `(code, startDate)`.
async fn merge_station(
    occurrences: &[(&PathBuf, &StationIndex)],
    tx: &BodySender,
) -> Result<()> {
    let (first_path, first) = occurrences[0];

    if occurrences.len() == 1 {
        return send_range(first_path, first.start, first.end, tx).await;
    }

    let mut seen: BTreeSet<ElementKey> = first.channels.iter().map(|c| c.key.clone()).collect();

    if first.self_closing {
        let open = read_range(first_path, first.start, first.end).await?;
        let reopened = match open.rfind("/>") {
            Some(idx) => format!("{}>", &open[..idx]),
            None => open,
        };
        send(tx, Bytes::from(reopened)).await?;
    } else {
        send_range(first_path, first.start, first.close_start, tx).await?;
    }

    for &(path, station) in occurrences.iter().skip(1) {
        for channel in &station.channels {
            if seen.insert(channel.key.clone()) {
                send_range(path, channel.start, channel.end, tx).await?;
            }
        }
    }

    send(tx, Bytes::from_static(b"</Station>")).await?;
    Ok(())
}

async fn read_range(path: &PathBuf, start: u64, end: u64) -> Result<String> {
    use std::io::SeekFrom;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0_u8; (end - start) as usize];
    file.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| {
        MergeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}
