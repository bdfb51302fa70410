//! Postgres-backed `ListingStore`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listsync_core::{
    decide_upsert, ChangeId, ChangeKind, ChangeRecord, ChangeStatus, Item, ItemFields, ItemId,
    ItemStatus, LogEntry, LogTrail, NewSourceLink, ParseStatus, PendingCreate, RunId, RunRecord,
    RunStatus, SourceLink, SourceLinkId, TaskName, UpsertAction, UrlDiff,
};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

use crate::{ListingStore, QueuedChanges, RetiredSource, RunFilter, StoreError};

const SOURCE_COLUMNS: &str = "id, url, category, owner, parse_status, created_at, updated_at, \
     last_processed_at, last_recheck_at";

const ITEM_COLUMNS: &str = "id, source_link_id, url, brand, model, fuel_type, transmission, \
     price, year, mileage, color, location, attributes, description, image_folder, remote_id, \
     status, is_published, created_at, updated_at";

const RUN_COLUMNS: &str =
    "id, task_name, status, started_at, finished_at, message, details, logs";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StoreError::from)
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("migrations applied");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(StoreError::from)
            .context("opening transaction")
    }
}

fn change_table(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::ToCreate => "changes_to_create",
        ChangeKind::ToDelete => "changes_to_delete",
    }
}

fn decode<T: std::str::FromStr>(raw: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|err| StoreError::Decode(err.to_string()))
}

fn source_from_row(row: &PgRow) -> Result<SourceLink, StoreError> {
    let parse_status: String = row.try_get("parse_status")?;
    Ok(SourceLink {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        category: row.try_get("category")?,
        owner: row.try_get("owner")?,
        parse_status: decode::<ParseStatus>(&parse_status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_processed_at: row.try_get("last_processed_at")?,
        last_recheck_at: row.try_get("last_recheck_at")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<Item, StoreError> {
    let status: String = row.try_get("status")?;
    let Json(attributes): Json<BTreeMap<String, String>> = row.try_get("attributes")?;
    Ok(Item {
        id: row.try_get("id")?,
        source_link_id: row.try_get("source_link_id")?,
        url: row.try_get("url")?,
        fields: ItemFields {
            brand: row.try_get("brand")?,
            model: row.try_get("model")?,
            fuel_type: row.try_get("fuel_type")?,
            transmission: row.try_get("transmission")?,
            price: row.try_get("price")?,
            year: row.try_get("year")?,
            mileage: row.try_get("mileage")?,
            color: row.try_get("color")?,
            location: row.try_get("location")?,
            attributes,
            description: row.try_get("description")?,
            image_folder: row.try_get("image_folder")?,
        },
        remote_id: row.try_get("remote_id")?,
        status: decode::<ItemStatus>(&status)?,
        is_published: row.try_get("is_published")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn change_from_row(row: &PgRow, kind: ChangeKind) -> Result<ChangeRecord, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ChangeRecord {
        id: row.try_get("id")?,
        kind,
        source_link_id: row.try_get("source_link_id")?,
        item_url: row.try_get("item_url")?,
        status: decode::<ChangeStatus>(&status)?,
    })
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    let task_name: String = row.try_get("task_name")?;
    let status: String = row.try_get("status")?;
    let Json(details): Json<Map<String, Value>> = row.try_get("details")?;
    let Json(logs): Json<LogTrail> = row.try_get("logs")?;
    Ok(RunRecord {
        id: row.try_get("id")?,
        task_name: decode::<TaskName>(&task_name)?,
        status: decode::<RunStatus>(&status)?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        message: row.try_get("message")?,
        details,
        logs,
    })
}

/// Inserts one PROCESS ToDelete entry unless the URL already has one.
async fn insert_deletion_entry(
    tx: &mut Transaction<'static, Postgres>,
    source: SourceLinkId,
    url: &str,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO changes_to_delete (source_link_id, item_url)
        VALUES ($1, $2)
        ON CONFLICT (item_url) DO NOTHING
        "#,
    )
    .bind(source)
    .bind(url)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn queue_urls(
    tx: &mut Transaction<'static, Postgres>,
    kind: ChangeKind,
    source: SourceLinkId,
    urls: &[String],
) -> Result<usize, StoreError> {
    if urls.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        r#"
        INSERT INTO {table} (source_link_id, item_url)
        SELECT $1, u.url
          FROM UNNEST($2::text[]) WITH ORDINALITY AS u(url, ord)
         ORDER BY u.ord
        ON CONFLICT (item_url) DO NOTHING
        "#,
        table = change_table(kind)
    );
    let result = sqlx::query(&sql)
        .bind(source)
        .bind(urls)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() as usize)
}

#[async_trait]
impl ListingStore for PgStore {
    async fn register_source(&self, new: &NewSourceLink) -> Result<SourceLink> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO source_links (url, category, owner)
            VALUES ($1, $2, $3)
            ON CONFLICT (url) DO UPDATE
               SET category = COALESCE(EXCLUDED.category, source_links.category),
                   owner = COALESCE(EXCLUDED.owner, source_links.owner),
                   updated_at = NOW()
            RETURNING {SOURCE_COLUMNS}
            "#
        ))
        .bind(&new.url)
        .bind(&new.category)
        .bind(&new.owner)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("upserting source link")?;
        Ok(source_from_row(&row)?)
    }

    async fn get_source(&self, id: SourceLinkId) -> Result<Option<SourceLink>> {
        let row = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM source_links WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("loading source link")?;
        Ok(row.as_ref().map(source_from_row).transpose()?)
    }

    async fn list_sources(&self, parse_status: Option<ParseStatus>) -> Result<Vec<SourceLink>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SOURCE_COLUMNS}
              FROM source_links
             WHERE ($1::text IS NULL OR parse_status = $1)
             ORDER BY id
            "#
        ))
        .bind(parse_status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("listing source links")?;
        Ok(rows.iter().map(source_from_row).collect::<Result<_, _>>()?)
    }

    async fn stale_sources(&self, older_than: DateTime<Utc>) -> Result<Vec<SourceLink>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SOURCE_COLUMNS}
              FROM source_links
             WHERE last_processed_at IS NULL OR last_processed_at < $1
             ORDER BY id
            "#
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("listing stale source links")?;
        Ok(rows.iter().map(source_from_row).collect::<Result<_, _>>()?)
    }

    async fn mark_source_parsed(
        &self,
        id: SourceLinkId,
        at: DateTime<Utc>,
        recheck: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE source_links
               SET parse_status = 'parsed',
                   last_processed_at = $2,
                   last_recheck_at = CASE WHEN $3 THEN $2 ELSE last_recheck_at END,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(recheck)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("marking source link parsed")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("source link {id}")).into());
        }
        Ok(())
    }

    async fn retire_source(&self, id: SourceLinkId) -> Result<RetiredSource> {
        let mut tx = self.begin().await?;

        let detached = sqlx::query(
            r#"
            UPDATE items
               SET status = 'deleted', is_published = FALSE, source_link_id = NULL,
                   updated_at = NOW()
             WHERE source_link_id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)
        .context("detaching items")?;

        let mut dropped = 0;
        for kind in ChangeKind::ALL {
            let sql = format!("DELETE FROM {} WHERE source_link_id = $1", change_table(*kind));
            let result = sqlx::query(&sql)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)
                .context("dropping change entries")?;
            dropped += result.rows_affected();
        }

        let removed = sqlx::query("DELETE FROM source_links WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)
            .context("deleting source link")?;
        if removed.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("source link {id}")).into());
        }

        tx.commit().await.map_err(StoreError::from)?;
        Ok(RetiredSource {
            detached_items: detached.rows_affected() as usize,
            dropped_changes: dropped as usize,
        })
    }

    async fn item_urls_for_source(&self, id: SourceLinkId) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT url FROM items WHERE source_link_id = $1 ORDER BY id")
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)
            .context("loading item urls")?;
        let urls = rows
            .iter()
            .map(|row| row.try_get::<String, _>("url"))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)?;
        Ok(urls)
    }

    async fn items_for_source(&self, id: SourceLinkId) -> Result<Vec<Item>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE source_link_id = $1 ORDER BY id"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("loading items for source")?;
        Ok(rows.iter().map(item_from_row).collect::<Result<_, _>>()?)
    }

    async fn get_item_by_url(&self, url: &str) -> Result<Option<Item>> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE url = $1"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)
            .context("loading item")?;
        Ok(row.as_ref().map(item_from_row).transpose()?)
    }

    async fn upsert_item(
        &self,
        source: SourceLinkId,
        url: &str,
        fields: &ItemFields,
        explicit: Option<ItemStatus>,
    ) -> Result<UpsertAction> {
        let mut tx = self.begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT status FROM items WHERE url = $1 FOR UPDATE")
                .bind(url)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::from)
                .context("locking item")?;
        let existing = existing
            .as_deref()
            .map(decode::<ItemStatus>)
            .transpose()?;

        let action = decide_upsert(existing, explicit);
        let outcome = match action {
            UpsertAction::Insert(status) => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO items (
                        source_link_id, url, brand, model, fuel_type, transmission, price, year,
                        mileage, color, location, attributes, description, image_folder,
                        status, is_published
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                    ON CONFLICT (url) DO NOTHING
                    "#,
                )
                .bind(source)
                .bind(url)
                .bind(&fields.brand)
                .bind(&fields.model)
                .bind(&fields.fuel_type)
                .bind(&fields.transmission)
                .bind(fields.price)
                .bind(fields.year)
                .bind(fields.mileage)
                .bind(&fields.color)
                .bind(&fields.location)
                .bind(Json(&fields.attributes))
                .bind(&fields.description)
                .bind(&fields.image_folder)
                .bind(status.as_str())
                .bind(status == ItemStatus::Active)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)
                .context("inserting item")?;
                // A concurrent writer created the row between the lock and the insert.
                if result.rows_affected() == 0 {
                    UpsertAction::Skip {
                        queue_deletion: false,
                    }
                } else {
                    action
                }
            }
            UpsertAction::Overwrite(status) => {
                sqlx::query(
                    r#"
                    UPDATE items
                       SET source_link_id = $1, brand = $3, model = $4, fuel_type = $5,
                           transmission = $6, price = $7, year = $8, mileage = $9, color = $10,
                           location = $11, attributes = $12, description = $13,
                           image_folder = $14, status = $15, is_published = $16,
                           updated_at = NOW()
                     WHERE url = $2
                    "#,
                )
                .bind(source)
                .bind(url)
                .bind(&fields.brand)
                .bind(&fields.model)
                .bind(&fields.fuel_type)
                .bind(&fields.transmission)
                .bind(fields.price)
                .bind(fields.year)
                .bind(fields.mileage)
                .bind(&fields.color)
                .bind(&fields.location)
                .bind(Json(&fields.attributes))
                .bind(&fields.description)
                .bind(&fields.image_folder)
                .bind(status.as_str())
                .bind(status == ItemStatus::Active)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)
                .context("overwriting item")?;
                action
            }
            UpsertAction::Skip { queue_deletion } => {
                if queue_deletion {
                    insert_deletion_entry(&mut tx, source, url)
                        .await
                        .context("queueing deletion for terminal item")?;
                }
                action
            }
        };

        tx.commit().await.map_err(StoreError::from)?;
        Ok(outcome)
    }

    async fn mark_failed_and_queue_deletion(&self, source: SourceLinkId, url: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO items (source_link_id, url, status, is_published)
            VALUES ($1, $2, 'failed', FALSE)
            ON CONFLICT (url) DO UPDATE
               SET status = 'failed', is_published = FALSE, updated_at = NOW()
            "#,
        )
        .bind(source)
        .bind(url)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)
        .context("forcing item to failed")?;

        insert_deletion_entry(&mut tx, source, url)
            .await
            .context("queueing deletion for failed item")?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    async fn claim_created_items(&self) -> Result<Vec<Item>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE items
               SET status = 'process', updated_at = NOW()
             WHERE status = 'created'
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("claiming created items")?;
        let mut items = rows.iter().map(item_from_row).collect::<Result<Vec<_>, _>>()?;
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    async fn set_item_status(&self, id: ItemId, status: ItemStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE items
               SET status = $2, is_published = $3, updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(status == ItemStatus::Active)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("updating item status")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("item {id}")).into());
        }
        Ok(())
    }

    async fn set_remote_id(&self, id: ItemId, remote_id: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE items SET remote_id = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(remote_id)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from)
                .context("storing remote id")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("item {id}")).into());
        }
        Ok(())
    }

    async fn item_status_counts(&self) -> Result<Vec<(ItemStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM items GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)
            .context("counting items")?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status").map_err(StoreError::from)?;
            let n: i64 = row.try_get("n").map_err(StoreError::from)?;
            counts.push((decode::<ItemStatus>(&status)?, n));
        }
        counts.sort_by_key(|(status, _)| ItemStatus::ALL.iter().position(|s| s == status));
        Ok(counts)
    }

    async fn replace_pending_changes(
        &self,
        source: SourceLinkId,
        diff: &UrlDiff,
    ) -> Result<QueuedChanges> {
        let mut tx = self.begin().await?;
        for kind in ChangeKind::ALL {
            let sql = format!(
                "DELETE FROM {} WHERE source_link_id = $1 AND status = 'process'",
                change_table(*kind)
            );
            sqlx::query(&sql)
                .bind(source)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)
                .context("clearing pending change entries")?;
        }

        let to_delete = queue_urls(&mut tx, ChangeKind::ToDelete, source, &diff.to_delete)
            .await
            .context("queueing deletions")?;
        let to_create = queue_urls(&mut tx, ChangeKind::ToCreate, source, &diff.to_create)
            .await
            .context("queueing creations")?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(QueuedChanges {
            to_delete,
            to_create,
        })
    }

    async fn pending_creates(&self, source: Option<SourceLinkId>) -> Result<Vec<PendingCreate>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.source_link_id, c.item_url, c.status, s.url AS source_url
              FROM changes_to_create c
              JOIN source_links s ON s.id = c.source_link_id
             WHERE c.status = 'process'
               AND ($1::bigint IS NULL OR c.source_link_id = $1)
             ORDER BY c.id
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("loading pending creates")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(PendingCreate {
                record: change_from_row(row, ChangeKind::ToCreate)?,
                source_url: row.try_get("source_url").map_err(StoreError::from)?,
            });
        }
        Ok(out)
    }

    async fn pending_deletes(&self) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_link_id, item_url, status
              FROM changes_to_delete
             WHERE status = 'process'
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("loading pending deletes")?;
        Ok(rows
            .iter()
            .map(|row| change_from_row(row, ChangeKind::ToDelete))
            .collect::<Result<_, _>>()?)
    }

    async fn complete_change(&self, kind: ChangeKind, id: ChangeId) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = 'completed', updated_at = NOW() WHERE id = $1",
            change_table(kind)
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)
            .context("completing change entry")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("{kind} entry {id}")).into());
        }
        Ok(())
    }

    async fn complete_deletion(&self, change_id: ChangeId, item_id: ItemId) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            UPDATE items
               SET status = 'deleted', is_published = FALSE, updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(item_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)
        .context("marking item deleted")?;
        sqlx::query(
            "UPDATE changes_to_delete SET status = 'completed', updated_at = NOW() WHERE id = $1",
        )
        .bind(change_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)
        .context("completing deletion entry")?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    async fn changes_for_source(
        &self,
        source: SourceLinkId,
        kind: ChangeKind,
    ) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT id, source_link_id, item_url, status FROM {} WHERE source_link_id = $1 ORDER BY id",
            change_table(kind)
        );
        let rows = sqlx::query(&sql)
            .bind(source)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)
            .context("loading change entries")?;
        Ok(rows
            .iter()
            .map(|row| change_from_row(row, kind))
            .collect::<Result<_, _>>()?)
    }

    async fn start_run(&self, task: TaskName, details: Map<String, Value>) -> Result<RunId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO run_records (task_name, details) VALUES ($1, $2) RETURNING id",
        )
        .bind(task.as_str())
        .bind(Json(details))
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("starting run record")?;
        Ok(id)
    }

    async fn append_run_log(&self, run: RunId, entry: LogEntry, cap: usize) -> Result<()> {
        let mut tx = self.begin().await?;
        let Json(mut logs): Json<LogTrail> =
            sqlx::query_scalar("SELECT logs FROM run_records WHERE id = $1 FOR UPDATE")
                .bind(run)
                .fetch_one(&mut *tx)
                .await
                .map_err(StoreError::from)
                .with_context(|| format!("locking run record {run}"))?;
        logs.push(entry, cap);
        sqlx::query("UPDATE run_records SET logs = $2 WHERE id = $1")
            .bind(run)
            .bind(Json(&logs))
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)
            .context("appending run log")?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run: RunId,
        status: RunStatus,
        message: Option<&str>,
        details: Map<String, Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE run_records
               SET status = $2, finished_at = NOW(), message = $3,
                   details = details || $4::jsonb
             WHERE id = $1
            "#,
        )
        .bind(run)
        .bind(status.as_str())
        .bind(message)
        .bind(Json(details))
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("finishing run record")?;
        Ok(())
    }

    async fn get_run(&self, run: RunId) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM run_records WHERE id = $1"))
            .bind(run)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)
            .context("loading run record")?;
        Ok(row.as_ref().map(run_from_row).transpose()?)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let limit = (filter.limit > 0).then_some(filter.limit as i64);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS}
              FROM run_records
             WHERE ($1::text IS NULL OR task_name = $1)
               AND ($2::text IS NULL OR status = $2)
             ORDER BY started_at DESC, id DESC
             LIMIT $3
            "#
        ))
        .bind(filter.task.map(|t| t.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)
        .context("listing run records")?;
        Ok(rows.iter().map(run_from_row).collect::<Result<_, _>>()?)
    }
}
