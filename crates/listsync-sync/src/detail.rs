use anyhow::{Context, Result};
use listsync_core::{SourceLinkId, UpsertAction};
use listsync_storage::ImageStore;

use crate::ledger::RunScope;
use crate::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailOutcome {
    Stored(UpsertAction),
    /// The item was routed to FAILED with a queued deletion.
    Failed,
}

impl Engine {
    /// Fetches one item page and stores it. Parse problems never raise: they
    /// end in FAILED plus a ToDelete entry. Only a failure to record that
    /// FAILED state is returned as an error.
    pub async fn fetch_detail(
        &self,
        scope: &RunScope,
        source: SourceLinkId,
        item_url: &str,
    ) -> Result<DetailOutcome> {
        let detail = match self.collector.fetch_item_detail(item_url).await {
            Ok(detail) => detail,
            Err(err) => {
                scope
                    .warn(&format!("detail fetch failed for {item_url}: {err}"))
                    .await;
                return self.route_to_failed(source, item_url).await;
            }
        };

        let missing = detail.fields.missing_mandatory();
        if !missing.is_empty() {
            scope
                .warn(&format!(
                    "{item_url} is missing mandatory fields: {}",
                    missing.join(", ")
                ))
                .await;
            return self.route_to_failed(source, item_url).await;
        }

        let existing = match self.store.get_item_by_url(item_url).await {
            Ok(existing) => existing,
            Err(err) => {
                scope
                    .error(&format!("loading stored item {item_url} failed: {err:#}"))
                    .await;
                return self.route_to_failed(source, item_url).await;
            }
        };

        let mut fields = detail.fields;
        match &existing {
            Some(item) if item.status.is_terminal() => {
                scope
                    .debug(&format!("{item_url} is {}, keeping stored record", item.status))
                    .await;
            }
            _ => {
                let folder = existing
                    .as_ref()
                    .and_then(|item| item.fields.image_folder.clone())
                    .unwrap_or_else(ImageStore::new_folder);
                fields.image_folder = self
                    .download_images(scope, &folder, &detail.image_urls)
                    .await;
            }
        }

        match self.store.upsert_item(source, item_url, &fields, None).await {
            Ok(action) => {
                scope.info(&format!("{item_url}: {action:?}")).await;
                Ok(DetailOutcome::Stored(action))
            }
            Err(err) => {
                scope
                    .error(&format!("storing {item_url} failed: {err:#}"))
                    .await;
                self.route_to_failed(source, item_url).await
            }
        }
    }

    async fn route_to_failed(&self, source: SourceLinkId, item_url: &str) -> Result<DetailOutcome> {
        self.store
            .mark_failed_and_queue_deletion(source, item_url)
            .await
            .with_context(|| format!("recording failed item {item_url}"))?;
        Ok(DetailOutcome::Failed)
    }

    /// Stores the photos in listing order. Returns the folder when at least
    /// one photo was stored; individual failures are logged and skipped.
    async fn download_images(
        &self,
        scope: &RunScope,
        folder: &str,
        image_urls: &[String],
    ) -> Option<String> {
        let mut stored = 0usize;
        for (position, url) in image_urls.iter().enumerate() {
            let bytes = match self.collector.fetch_image(url).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    scope.warn(&format!("image {url} skipped: {err}")).await;
                    continue;
                }
            };
            match self
                .images
                .store_image(folder, position, image_extension(url), &bytes)
                .await
            {
                Ok(_) => stored += 1,
                Err(err) => {
                    scope.warn(&format!("image {url} not saved: {err:#}")).await;
                }
            }
        }
        (stored > 0).then(|| folder.to_string())
    }
}

/// File extension from an image URL path, `jpg` when there is none.
pub(crate) fn image_extension(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((_, ext))
            if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext
        }
        _ => "jpg",
    }
}
