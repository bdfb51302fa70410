use anyhow::{Context, Result};
use listsync_core::{Item, ItemStatus, TaskName};
use listsync_market::resolve_city_id;
use serde::Serialize;
use tracing::Instrument;
use serde_json::Map;

use crate::ledger::{RunOutcome, RunScope, TaskReport};
use crate::Engine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncCreatedReport {
    pub processed: usize,
    pub total: usize,
}

impl TaskReport for SyncCreatedReport {
    fn summary(&self) -> String {
        if self.total == 0 {
            return "no CREATED items".to_string();
        }
        format!("published {}/{} items", self.processed, self.total)
    }
}

impl Engine {
    /// Claims every CREATED item and publishes it on the marketplace.
    pub async fn sync_created(&self) -> Result<RunOutcome<SyncCreatedReport>> {
        let scope = self.ledger.start(TaskName::SyncCreated, Map::new()).await?;
        let result = self.sync_created_in(&scope)
            .instrument(scope.span().clone())
            .await;
        scope.finish(result).await
    }

    async fn sync_created_in(&self, scope: &RunScope) -> Result<SyncCreatedReport> {
        let claimed = self
            .store
            .claim_created_items()
            .await
            .context("claiming created items")?;
        let mut report = SyncCreatedReport {
            processed: 0,
            total: claimed.len(),
        };

        for item in &claimed {
            scope
                .info(&format!(
                    "publishing item {} ({} {})",
                    item.id,
                    item.fields.brand,
                    item.fields.model.as_deref().unwrap_or("-")
                ))
                .await;
            match self.publish_item(scope, item).await {
                Ok(remote_id) => {
                    report.processed += 1;
                    scope
                        .info(&format!("item {} is live as {remote_id}", item.id))
                        .await;
                }
                Err(err) => {
                    scope
                        .error(&format!("publishing item {} failed: {err:#}", item.id))
                        .await;
                    if let Err(err) = self.store.set_item_status(item.id, ItemStatus::Failed).await {
                        scope
                            .error(&format!("marking item {} failed: {err:#}", item.id))
                            .await;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Creates the remote listing, uploads photos in order and marks the
    /// item ACTIVE. Returns the remote id.
    async fn publish_item(&self, scope: &RunScope, item: &Item) -> Result<i64> {
        let category = match item.source_link_id {
            Some(id) => self
                .store
                .get_source(id)
                .await
                .with_context(|| format!("loading source link {id}"))?
                .and_then(|source| source.category),
            None => None,
        };
        let mut payload = self
            .taxonomy
            .build_payload(&item.fields, category.as_deref())?;
        payload.city = Some(
            resolve_city_id(
                self.market.as_ref(),
                item.fields.location.as_deref(),
                self.settings.default_city_id,
            )
            .await,
        );

        let remote_id = self
            .market
            .create_listing(&payload)
            .await
            .context("creating remote listing")?;
        self.store
            .set_remote_id(item.id, remote_id)
            .await
            .with_context(|| format!("storing remote id {remote_id}"))?;

        if let Some(folder) = &item.fields.image_folder {
            let paths = self.images.list_images(folder).await?;
            for path in &paths {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading image {}", path.display()))?;
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "image.jpg".to_string());
                self.market
                    .upload_image(remote_id, &file_name, bytes)
                    .await
                    .with_context(|| format!("uploading {file_name}"))?;
            }
            scope
                .debug(&format!("uploaded {} images to {remote_id}", paths.len()))
                .await;
        }

        self.store
            .set_item_status(item.id, ItemStatus::Active)
            .await
            .context("marking item active")?;
        Ok(remote_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use listsync_core::{ItemStatus, NewSourceLink};
    use listsync_storage::ListingStore;

    use crate::fakes::{harness, truck};

    #[tokio::test]
    async fn created_items_are_published_and_activated() {
        let h = harness();
        let source = h.engine.register_source("https://src.example", Some("3-5 тон"), None).await.unwrap();
        let mut detail = truck("Mercedes-Benz", "Sprinter", 12_300);
        detail.image_urls = vec!["https://cdn.example/a.jpg".into(), "https://cdn.example/b.jpg".into()];
        h.collector.set_image("https://cdn.example/a.jpg", b"first");
        h.collector.set_image("https://cdn.example/b.jpg", b"second");
        h.collector.set_detail("u/1", detail);
        h.collector.set_listing("https://src.example", &["u/1"]);
        h.market.add_city("Київ", 7);
        h.engine.reconcile_source(source.id).await.unwrap();
        h.engine.drain_create(None).await.unwrap();

        let outcome = h.engine.sync_created().await.unwrap();
        assert_eq!(
            outcome.report().unwrap(),
            &crate::SyncCreatedReport { processed: 1, total: 1 }
        );

        let item = h.store.get_item_by_url("u/1").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Active);
        assert!(item.is_published);
        assert_eq!(item.remote_id, Some(1000));

        let created = h.market.created.lock().unwrap().clone();
        assert_eq!(created[0].brand, Some(1055));
        assert_eq!(created[0].model, Some(145));
        assert_eq!(created[0].city, Some(7));
        let uploads = h.market.uploads.lock().unwrap().clone();
        let bodies: Vec<&[u8]> = uploads.iter().map(|(_, _, b)| b.as_slice()).collect();
        assert_eq!(bodies, vec![&b"first"[..], &b"second"[..]]);
        assert!(uploads.iter().all(|(id, _, _)| *id == 1000));
    }

    #[tokio::test]
    async fn unmapped_fields_still_publish_with_default_city() {
        let h = harness();
        let source = h.engine.register_source("https://src.example", None, None).await.unwrap();
        let mut fields = truck("Zil", "Bychok", 5_000).fields;
        fields.color = Some("Фуксія".into());
        fields.location = Some("Атлантида".into());
        h.store.upsert_item(source.id, "u/odd", &fields, None).await.unwrap();

        let outcome = h.engine.sync_created().await.unwrap();
        assert_eq!(outcome.report().unwrap().processed, 1);
        let created = h.market.created.lock().unwrap().clone();
        assert_eq!(created[0].brand, None);
        assert_eq!(created[0].model, None);
        assert_eq!(created[0].color, None);
        assert_eq!(created[0].city, Some(1));
    }

    #[tokio::test]
    async fn marketplace_failure_marks_item_failed() {
        let h = harness();
        let source = h.engine.register_source("https://src.example", None, None).await.unwrap();
        h.store
            .upsert_item(source.id, "u/1", &truck("Mercedes-Benz", "Vito", 1).fields, None)
            .await
            .unwrap();
        h.market.fail_create.store(true, Ordering::SeqCst);

        let outcome = h.engine.sync_created().await.unwrap();
        assert_eq!(outcome.report().unwrap().processed, 0);
        let item = h.store.get_item_by_url("u/1").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.remote_id, None);

        let again = h.engine.sync_created().await.unwrap();
        assert_eq!(again.report().unwrap().total, 0);
    }

    #[tokio::test]
    async fn unknown_category_fails_the_item_not_the_run() {
        let h = harness();
        let source = h
            .store
            .register_source(&NewSourceLink {
                url: "https://src.example/legacy".into(),
                category: Some("boats".into()),
                owner: None,
            })
            .await
            .unwrap();
        h.store
            .upsert_item(source.id, "u/boat", &truck("Mercedes-Benz", "Vito", 1).fields, None)
            .await
            .unwrap();

        let outcome = h.engine.sync_created().await.unwrap();
        assert!(outcome.is_completed());
        let item = h.store.get_item_by_url("u/boat").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert!(h.market.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_failure_marks_item_failed_after_create() {
        let h = harness();
        let source = h.engine.register_source("https://src.example", None, None).await.unwrap();
        let mut fields = truck("Mercedes-Benz", "Vito", 1).fields;
        let folder = listsync_storage::ImageStore::new_folder();
        h.images.store_image(&folder, 0, "jpg", b"img").await.unwrap();
        fields.image_folder = Some(folder);
        h.store.upsert_item(source.id, "u/1", &fields, None).await.unwrap();
        h.market.fail_upload.store(true, Ordering::SeqCst);

        h.engine.sync_created().await.unwrap();
        let item = h.store.get_item_by_url("u/1").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.remote_id, Some(1000));
    }
}
