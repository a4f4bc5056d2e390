//! A Postgres backed implementation of the routing catalog.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::ResultExt;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use stream_types::{pattern, Route, Service, StreamEpoch, TimeWindow};
use tracing::info;

use crate::interface::{
    assemble_routes, Access, BatchSummary, Catalog, DataCenter, Error, HarvestRow, ResolveOptions,
    Result, RouteCandidate, StalePolicy,
};

const MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);
const IDLE_TIMEOUT: Duration = Duration::from_secs(500);

/// Connect to the catalog store.
pub async fn connect_catalog_store(
    app_name: &'static str,
    dsn: &str,
) -> Result<Pool<Postgres>, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .idle_timeout(IDLE_TIMEOUT)
        .test_before_acquire(true)
        .connect(dsn)
        .await?;

    info!(application_name = %app_name, "connected to catalog store");

    Ok(pool)
}

/// Postgres catalog.
#[derive(Debug)]
pub struct PostgresCatalog {
    pool: Pool<Postgres>,
}

impl PostgresCatalog {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

impl Display for PostgresCatalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Postgres")
    }
}

/// Schema DDL, applied by [`Catalog::setup`]. Indexed for the two dominant
/// access patterns: `(service, codes, time)` lookups through the joined
/// route, and per-endpoint invalidation by the harvester.
const SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS data_center (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    routing_url TEXT NOT NULL
);
    "#,
    r#"
CREATE TABLE IF NOT EXISTS network (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    code TEXT NOT NULL UNIQUE
);
    "#,
    r#"
CREATE TABLE IF NOT EXISTS station (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    network_id BIGINT NOT NULL REFERENCES network (id),
    code TEXT NOT NULL,
    UNIQUE (network_id, code)
);
    "#,
    r#"
CREATE TABLE IF NOT EXISTS channel_epoch (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    data_center_id BIGINT NOT NULL REFERENCES data_center (id),
    station_id BIGINT NOT NULL REFERENCES station (id),
    code TEXT NOT NULL,
    location_code TEXT NOT NULL,
    starttime TIMESTAMPTZ NOT NULL,
    endtime TIMESTAMPTZ,
    restricted_status TEXT NOT NULL DEFAULT 'open',
    lastseen TIMESTAMPTZ NOT NULL,
    UNIQUE (data_center_id, station_id, code, location_code, starttime)
);
    "#,
    r#"
CREATE INDEX IF NOT EXISTS channel_epoch_code_idx
    ON channel_epoch (code, location_code, starttime);
    "#,
    r#"
CREATE TABLE IF NOT EXISTS endpoint (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    data_center_id BIGINT NOT NULL REFERENCES data_center (id),
    service TEXT NOT NULL,
    url TEXT NOT NULL,
    UNIQUE (data_center_id, service, url)
);
    "#,
    r#"
CREATE TABLE IF NOT EXISTS route (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    channel_epoch_id BIGINT NOT NULL REFERENCES channel_epoch (id) ON DELETE CASCADE,
    endpoint_id BIGINT NOT NULL REFERENCES endpoint (id) ON DELETE CASCADE,
    starttime TIMESTAMPTZ NOT NULL,
    endtime TIMESTAMPTZ,
    is_primary BOOLEAN NOT NULL DEFAULT TRUE,
    lastseen TIMESTAMPTZ NOT NULL,
    UNIQUE (channel_epoch_id, endpoint_id, starttime)
);
    "#,
    r#"
CREATE INDEX IF NOT EXISTS route_endpoint_idx ON route (endpoint_id);
    "#,
];

#[derive(Debug, sqlx::FromRow)]
struct DataCenterRow {
    id: i64,
    name: String,
    routing_url: String,
}

impl From<DataCenterRow> for DataCenter {
    fn from(row: DataCenterRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            routing_url: row.routing_url,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CandidateRow {
    network: String,
    station: String,
    location_code: String,
    channel: String,
    cha_start: DateTime<Utc>,
    cha_end: Option<DateTime<Utc>>,
    route_start: DateTime<Utc>,
    route_end: Option<DateTime<Utc>>,
    url: String,
}

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn setup(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context(crate::interface::SetupSnafu)?;
        }
        Ok(())
    }

    async fn create_or_get_data_center(
        &self,
        name: &str,
        routing_url: &str,
    ) -> Result<DataCenter> {
        let rec = sqlx::query_as::<_, DataCenterRow>(
            r#"
INSERT INTO data_center ( name, routing_url )
VALUES ( $1, $2 )
ON CONFLICT ( name )
DO UPDATE SET routing_url = EXCLUDED.routing_url
RETURNING *;
        "#,
        )
        .bind(name) // $1
        .bind(routing_url) // $2
        .fetch_one(&self.pool)
        .await
        .context(crate::interface::SqlxSnafu)?;

        Ok(rec.into())
    }

    async fn data_centers(&self) -> Result<Vec<DataCenter>> {
        let recs = sqlx::query_as::<_, DataCenterRow>(
            r#"SELECT * FROM data_center ORDER BY name;"#,
        )
        .fetch_all(&self.pool)
        .await
        .context(crate::interface::SqlxSnafu)?;

        Ok(recs.into_iter().map(Into::into).collect())
    }

    async fn replace_batch(
        &self,
        data_center_id: i64,
        rows: Vec<HarvestRow>,
        policy: StalePolicy,
        harvested_at: DateTime<Utc>,
    ) -> Result<BatchSummary> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context(crate::interface::StartTransactionSnafu)?;

        let exists: Option<i64> =
            sqlx::query_scalar(r#"SELECT id FROM data_center WHERE id = $1;"#)
                .bind(data_center_id)
                .fetch_optional(&mut *tx)
                .await
                .context(crate::interface::SqlxSnafu)?;
        if exists.is_none() {
            return Err(Error::DataCenterNotFound {
                id: data_center_id,
            });
        }

        let mut summary = BatchSummary {
            upserted: rows.len(),
            ..Default::default()
        };

        // Per-batch id caches keep the upsert chatter down.
        let mut network_ids: HashMap<String, i64> = HashMap::new();
        let mut station_ids: HashMap<(i64, String), i64> = HashMap::new();
        let mut endpoint_ids: HashMap<(Service, String), i64> = HashMap::new();

        for row in &rows {
            let network_id = match network_ids.get(&row.channel.network) {
                Some(id) => *id,
                None => {
                    let id: i64 = sqlx::query_scalar(
                        r#"
INSERT INTO network ( code ) VALUES ( $1 )
ON CONFLICT ( code ) DO UPDATE SET code = network.code
RETURNING id;
                        "#,
                    )
                    .bind(&row.channel.network)
                    .fetch_one(&mut *tx)
                    .await
                    .context(crate::interface::SqlxSnafu)?;
                    network_ids.insert(row.channel.network.clone(), id);
                    id
                }
            };

            let station_key = (network_id, row.channel.station.clone());
            let station_id = match station_ids.get(&station_key) {
                Some(id) => *id,
                None => {
                    let id: i64 = sqlx::query_scalar(
                        r#"
INSERT INTO station ( network_id, code ) VALUES ( $1, $2 )
ON CONFLICT ( network_id, code ) DO UPDATE SET code = station.code
RETURNING id;
                        "#,
                    )
                    .bind(network_id)
                    .bind(&row.channel.station)
                    .fetch_one(&mut *tx)
                    .await
                    .context(crate::interface::SqlxSnafu)?;
                    station_ids.insert(station_key, id);
                    id
                }
            };

            let channel_epoch_id: i64 = sqlx::query_scalar(
                r#"
INSERT INTO channel_epoch
    ( data_center_id, station_id, code, location_code, starttime, endtime,
      restricted_status, lastseen )
VALUES ( $1, $2, $3, $4, $5, $6, $7, $8 )
ON CONFLICT ( data_center_id, station_id, code, location_code, starttime )
DO UPDATE SET endtime = EXCLUDED.endtime,
              restricted_status = EXCLUDED.restricted_status,
              lastseen = EXCLUDED.lastseen
RETURNING id;
                "#,
            )
            .bind(data_center_id) // $1
            .bind(station_id) // $2
            .bind(&row.channel.channel) // $3
            .bind(&row.channel.location) // $4
            .bind(row.channel.starttime) // $5
            .bind(row.channel.endtime) // $6
            .bind(row.channel.restricted_status.as_str()) // $7
            .bind(harvested_at) // $8
            .fetch_one(&mut *tx)
            .await
            .context(crate::interface::SqlxSnafu)?;

            let endpoint_key = (row.service, row.endpoint_url.clone());
            let endpoint_id = match endpoint_ids.get(&endpoint_key) {
                Some(id) => *id,
                None => {
                    let id: i64 = sqlx::query_scalar(
                        r#"
INSERT INTO endpoint ( data_center_id, service, url ) VALUES ( $1, $2, $3 )
ON CONFLICT ( data_center_id, service, url ) DO UPDATE SET url = endpoint.url
RETURNING id;
                        "#,
                    )
                    .bind(data_center_id)
                    .bind(row.service.as_str())
                    .bind(&row.endpoint_url)
                    .fetch_one(&mut *tx)
                    .await
                    .context(crate::interface::SqlxSnafu)?;
                    endpoint_ids.insert(endpoint_key, id);
                    id
                }
            };

            sqlx::query(
                r#"
INSERT INTO route
    ( channel_epoch_id, endpoint_id, starttime, endtime, is_primary, lastseen )
VALUES ( $1, $2, $3, $4, $5, $6 )
ON CONFLICT ( channel_epoch_id, endpoint_id, starttime )
DO UPDATE SET endtime = EXCLUDED.endtime,
              is_primary = EXCLUDED.is_primary,
              lastseen = EXCLUDED.lastseen;
                "#,
            )
            .bind(channel_epoch_id) // $1
            .bind(endpoint_id) // $2
            .bind(row.route_start) // $3
            .bind(row.route_end) // $4
            .bind(row.is_primary) // $5
            .bind(harvested_at) // $6
            .execute(&mut *tx)
            .await
            .context(crate::interface::SqlxSnafu)?;
        }

        // Rows of this center not touched by the batch are stale.
        match policy {
            StalePolicy::Remove => {
                let removed = sqlx::query(
                    r#"
DELETE FROM channel_epoch
WHERE data_center_id = $1 AND lastseen < $2;
                    "#,
                )
                .bind(data_center_id)
                .bind(harvested_at)
                .execute(&mut *tx)
                .await
                .context(crate::interface::SqlxSnafu)?;
                summary.stale_removed = removed.rows_affected() as usize;
            }
            StalePolicy::EndDate => {
                let closed = sqlx::query(
                    r#"
UPDATE route SET endtime = $2
WHERE lastseen < $2
  AND ( endtime IS NULL OR endtime > $2 )
  AND endpoint_id IN ( SELECT id FROM endpoint WHERE data_center_id = $1 );
                    "#,
                )
                .bind(data_center_id)
                .bind(harvested_at)
                .execute(&mut *tx)
                .await
                .context(crate::interface::SqlxSnafu)?;
                summary.stale_closed = closed.rows_affected() as usize;

                sqlx::query(
                    r#"
UPDATE channel_epoch SET endtime = $2
WHERE data_center_id = $1
  AND lastseen < $2
  AND ( endtime IS NULL OR endtime > $2 );
                    "#,
                )
                .bind(data_center_id)
                .bind(harvested_at)
                .execute(&mut *tx)
                .await
                .context(crate::interface::SqlxSnafu)?;
            }
        }

        tx.commit()
            .await
            .context(crate::interface::FailedToCommitSnafu)?;

        Ok(summary)
    }

    async fn resolve(
        &self,
        selectors: &[StreamEpoch],
        service: Service,
        window: TimeWindow,
        options: &ResolveOptions,
    ) -> Result<Vec<Route>> {
        let mut candidates = Vec::new();

        for selector in selectors {
            let effective = match selector.window().intersect(&window) {
                Some(w) => w,
                None => continue,
            };

            // the access filter constrains data requests only;
            // station/wfcatalog metadata resolves ignore it
            let access = if service == Service::Dataselect {
                match options.access {
                    Access::Any => "any",
                    Access::Open => "open",
                    Access::Closed => "closed",
                }
            } else {
                "any"
            };

            // An unbounded request start is carried as the chrono minimum
            // in-process; it must not reach the timestamptz domain.
            let start_bound = effective
                .start()
                .filter(|start| *start > DateTime::<Utc>::MIN_UTC);

            let rows = sqlx::query_as::<_, CandidateRow>(
                r#"
SELECT n.code AS network,
       s.code AS station,
       ce.location_code,
       ce.code AS channel,
       ce.starttime AS cha_start,
       ce.endtime AS cha_end,
       r.starttime AS route_start,
       r.endtime AS route_end,
       e.url
FROM channel_epoch ce
    INNER JOIN station s ON ce.station_id = s.id
    INNER JOIN network n ON s.network_id = n.id
    INNER JOIN route r ON r.channel_epoch_id = ce.id
    INNER JOIN endpoint e ON r.endpoint_id = e.id
WHERE e.service = $1
  AND n.code LIKE $2 ESCAPE '/'
  AND s.code LIKE $3 ESCAPE '/'
  AND ce.location_code LIKE $4 ESCAPE '/'
  AND ce.code LIKE $5 ESCAPE '/'
  AND ( $6::TIMESTAMPTZ IS NULL OR ce.endtime IS NULL OR ce.endtime > $6 )
  AND ( $7::TIMESTAMPTZ IS NULL OR ce.starttime < $7 )
  AND ( r.is_primary OR $8 )
  AND ( $9 = 'any' OR ce.restricted_status = $9 );
                "#,
            )
            .bind(service.as_str()) // $1
            .bind(pattern::to_sql_like(&selector.stream.network)) // $2
            .bind(pattern::to_sql_like(&selector.stream.station)) // $3
            .bind(pattern::to_sql_like(&selector.stream.location)) // $4
            .bind(pattern::to_sql_like(&selector.stream.channel)) // $5
            .bind(start_bound) // $6
            .bind(effective.end()) // $7
            .bind(options.include_alternates) // $8
            .bind(access) // $9
            .fetch_all(&self.pool)
            .await
            .context(crate::interface::SqlxSnafu)?;

            for row in rows {
                let route_window = match TimeWindow::new(Some(row.route_start), row.route_end)
                    .intersect(&effective)
                {
                    Some(clipped) => clipped,
                    // the routing fact lies wholly outside the request window
                    None => continue,
                };
                candidates.push(RouteCandidate {
                    stream: stream_types::Stream::new(
                        &row.network,
                        &row.station,
                        &row.location_code,
                        &row.channel,
                    ),
                    channel_window: TimeWindow::new(Some(row.cha_start), row.cha_end),
                    route_window,
                    url: row.url,
                });
            }
        }

        Ok(assemble_routes(candidates, &TimeWindow::all(), options.level))
    }
}
