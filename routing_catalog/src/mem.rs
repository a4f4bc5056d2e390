//! An in-memory implementation of the routing catalog, used by tests and
//! for exercising the request engine without a database.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use stream_types::{Route, Service, StreamEpoch, TimeWindow};

use crate::interface::{
    assemble_routes, BatchSummary, Catalog, DataCenter, Error, HarvestRow, ResolveOptions, Result,
    RouteCandidate, StalePolicy, Access,
};

#[derive(Debug, Clone)]
struct StoredRow {
    data_center_id: i64,
    row: HarvestRow,
}

#[derive(Debug, Default)]
struct MemState {
    data_centers: Vec<DataCenter>,
    rows: Vec<StoredRow>,
    next_id: i64,
}

/// In-memory catalog. A single mutex guards the state; readers take a
/// snapshot of the matching rows, so a concurrent `replace_batch` is
/// observed either entirely or not at all.
#[derive(Debug, Default)]
pub struct MemCatalog {
    state: Arc<Mutex<MemState>>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Display for MemCatalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Mem")
    }
}

/// The batch identity of a routing fact: service, endpoint and channel
/// epoch key. Rows sharing the key are the "same" fact across harvests.
fn fact_key(row: &HarvestRow) -> (Service, &str, &str, &str, &str, &str, DateTime<Utc>) {
    (
        row.service,
        row.endpoint_url.as_str(),
        row.channel.network.as_str(),
        row.channel.station.as_str(),
        row.channel.location.as_str(),
        row.channel.channel.as_str(),
        row.channel.starttime,
    )
}

#[async_trait]
impl Catalog for MemCatalog {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn create_or_get_data_center(
        &self,
        name: &str,
        routing_url: &str,
    ) -> Result<DataCenter> {
        let mut state = self.state.lock();
        if let Some(existing) = state.data_centers.iter().find(|dc| dc.name == name) {
            return Ok(existing.clone());
        }
        state.next_id += 1;
        let dc = DataCenter {
            id: state.next_id,
            name: name.to_string(),
            routing_url: routing_url.to_string(),
        };
        state.data_centers.push(dc.clone());
        Ok(dc)
    }

    async fn data_centers(&self) -> Result<Vec<DataCenter>> {
        Ok(self.state.lock().data_centers.clone())
    }

    async fn replace_batch(
        &self,
        data_center_id: i64,
        rows: Vec<HarvestRow>,
        policy: StalePolicy,
        harvested_at: DateTime<Utc>,
    ) -> Result<BatchSummary> {
        let mut state = self.state.lock();
        if !state.data_centers.iter().any(|dc| dc.id == data_center_id) {
            return Err(Error::DataCenterNotFound {
                id: data_center_id,
            });
        }

        let mut summary = BatchSummary {
            upserted: rows.len(),
            ..Default::default()
        };

        // Stale handling first: rows of this center not re-present in the
        // batch are closed or dropped.
        let fresh_keys: Vec<_> = rows.iter().map(fact_key).map(owned_key).collect();
        match policy {
            StalePolicy::Remove => {
                let before = state.rows.len();
                state.rows.retain(|stored| {
                    stored.data_center_id != data_center_id
                        || fresh_keys.contains(&owned_key(fact_key(&stored.row)))
                });
                summary.stale_removed = before - state.rows.len();
            }
            StalePolicy::EndDate => {
                for stored in state
                    .rows
                    .iter_mut()
                    .filter(|s| s.data_center_id == data_center_id)
                {
                    if fresh_keys.contains(&owned_key(fact_key(&stored.row))) {
                        continue;
                    }
                    let open_past_harvest =
                        |end: Option<DateTime<Utc>>| end.map_or(true, |e| e > harvested_at);
                    if open_past_harvest(stored.row.route_end) {
                        stored.row.route_end = Some(harvested_at);
                        summary.stale_closed += 1;
                    }
                    if open_past_harvest(stored.row.channel.endtime) {
                        stored.row.channel.endtime = Some(harvested_at);
                    }
                }
            }
        }

        // Upsert the fresh rows.
        for row in rows {
            let key = owned_key(fact_key(&row));
            match state.rows.iter_mut().find(|stored| {
                stored.data_center_id == data_center_id
                    && owned_key(fact_key(&stored.row)) == key
            }) {
                Some(stored) => stored.row = row,
                None => state.rows.push(StoredRow {
                    data_center_id,
                    row,
                }),
            }
        }

        Ok(summary)
    }

    async fn resolve(
        &self,
        selectors: &[StreamEpoch],
        service: Service,
        window: TimeWindow,
        options: &ResolveOptions,
    ) -> Result<Vec<Route>> {
        // Snapshot the matching facts under the lock; assembly happens
        // outside it. Each matching (fact, selector) pair yields one
        // candidate whose route window is pre-clipped to the selector.
        let candidates: Vec<RouteCandidate> = {
            let state = self.state.lock();
            state
                .rows
                .iter()
                .filter(|stored| stored.row.service == service)
                .filter(|stored| options.include_alternates || stored.row.is_primary)
                // the access filter constrains data requests only;
                // station/wfcatalog metadata resolves ignore it
                .filter(|stored| {
                    service != Service::Dataselect
                        || match options.access {
                            Access::Any => true,
                            Access::Open => {
                                stored.row.channel.restricted_status
                                    == crate::interface::RestrictedStatus::Open
                            }
                            Access::Closed => {
                                stored.row.channel.restricted_status
                                    == crate::interface::RestrictedStatus::Closed
                            }
                        }
                })
                .flat_map(|stored| {
                    let stream = stored.row.channel.stream();
                    let channel_window = stored.row.channel.window();
                    let route_window =
                        TimeWindow::new(Some(stored.row.route_start), stored.row.route_end);
                    selectors
                        .iter()
                        .filter(move |selector| selector.stream.matches(&stream))
                        .filter_map(move |selector| {
                            let clipped = route_window.intersect(&selector.window())?;
                            Some(RouteCandidate {
                                stream: stored.row.channel.stream(),
                                channel_window,
                                route_window: clipped,
                                url: stored.row.endpoint_url.clone(),
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        Ok(assemble_routes(candidates, &window, options.level))
    }
}

fn owned_key(
    key: (Service, &str, &str, &str, &str, &str, DateTime<Utc>),
) -> (Service, String, String, String, String, String, DateTime<Utc>) {
    (
        key.0,
        key.1.to_string(),
        key.2.to_string(),
        key.3.to_string(),
        key.4.to_string(),
        key.5.to_string(),
        key.6,
    )
}
