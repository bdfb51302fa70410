use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use listsync_adapters::{CollectError, CrawlCollector, ItemDetail};
use listsync_core::ItemFields;
use listsync_market::{DeleteOutcome, ListingPayload, MarketError, MarketplaceApi, Taxonomy};
use listsync_storage::{ImageStore, MemoryStore};
use tempfile::TempDir;

use crate::{Engine, EngineSettings};

#[derive(Default)]
pub struct FakeCollector {
    listings: Mutex<HashMap<String, Result<Vec<String>, String>>>,
    details: Mutex<HashMap<String, Result<ItemDetail, String>>>,
    images: Mutex<HashMap<String, Vec<u8>>>,
    page_limited: Mutex<HashSet<String>>,
    pub detail_calls: Mutex<Vec<String>>,
}

impl FakeCollector {
    pub fn set_listing(&self, source_url: &str, urls: &[&str]) {
        self.listings.lock().unwrap().insert(
            source_url.to_string(),
            Ok(urls.iter().map(|u| u.to_string()).collect()),
        );
    }

    pub fn fail_listing(&self, source_url: &str, message: &str) {
        self.listings
            .lock()
            .unwrap()
            .insert(source_url.to_string(), Err(message.to_string()));
    }

    /// Crawling `source_url` warns about running out of pages.
    pub fn hit_page_limit(&self, source_url: &str) {
        self.page_limited.lock().unwrap().insert(source_url.to_string());
    }

    pub fn set_detail(&self, item_url: &str, detail: ItemDetail) {
        self.details
            .lock()
            .unwrap()
            .insert(item_url.to_string(), Ok(detail));
    }

    pub fn fail_detail(&self, item_url: &str, message: &str) {
        self.details
            .lock()
            .unwrap()
            .insert(item_url.to_string(), Err(message.to_string()));
    }

    pub fn set_image(&self, image_url: &str, bytes: &[u8]) {
        self.images
            .lock()
            .unwrap()
            .insert(image_url.to_string(), bytes.to_vec());
    }
}

#[async_trait]
impl CrawlCollector for FakeCollector {
    async fn collect_item_urls(&self, source_url: &str) -> Result<Vec<String>, CollectError> {
        if self.page_limited.lock().unwrap().contains(source_url) {
            tracing::warn!("page limit reached");
        }
        match self.listings.lock().unwrap().get(source_url) {
            Some(Ok(urls)) => Ok(urls.clone()),
            Some(Err(message)) => Err(CollectError::Message(message.clone())),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_item_detail(&self, item_url: &str) -> Result<ItemDetail, CollectError> {
        self.detail_calls.lock().unwrap().push(item_url.to_string());
        match self.details.lock().unwrap().get(item_url) {
            Some(Ok(detail)) => Ok(detail.clone()),
            Some(Err(message)) => Err(CollectError::Message(message.clone())),
            None => Err(CollectError::Message(format!("no page at {item_url}"))),
        }
    }

    async fn fetch_image(&self, image_url: &str) -> Result<Vec<u8>, CollectError> {
        self.images
            .lock()
            .unwrap()
            .get(image_url)
            .cloned()
            .ok_or_else(|| CollectError::Message(format!("no image at {image_url}")))
    }
}

#[derive(Default)]
pub struct FakeMarket {
    next_id: AtomicI64,
    pub created: Mutex<Vec<ListingPayload>>,
    pub uploads: Mutex<Vec<(i64, String, Vec<u8>)>>,
    pub deleted: Mutex<Vec<i64>>,
    pub fail_create: AtomicBool,
    pub fail_upload: AtomicBool,
    gone: Mutex<HashSet<i64>>,
    broken: Mutex<HashSet<i64>>,
    cities: Mutex<HashMap<String, i64>>,
}

impl FakeMarket {
    /// Deleting `id` answers 404.
    pub fn mark_gone(&self, id: i64) {
        self.gone.lock().unwrap().insert(id);
    }

    /// Deleting `id` answers 500.
    pub fn mark_broken(&self, id: i64) {
        self.broken.lock().unwrap().insert(id);
    }

    pub fn add_city(&self, name: &str, id: i64) {
        self.cities.lock().unwrap().insert(name.to_string(), id);
    }

    fn status_error(endpoint: &str, status: u16) -> MarketError {
        MarketError::Status {
            status,
            endpoint: endpoint.to_string(),
            body: String::new(),
        }
    }
}

#[async_trait]
impl MarketplaceApi for FakeMarket {
    async fn create_listing(&self, payload: &ListingPayload) -> Result<i64, MarketError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Self::status_error("listings/create", 502));
        }
        self.created.lock().unwrap().push(payload.clone());
        Ok(1000 + self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn upload_image(
        &self,
        listing_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), MarketError> {
        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(Self::status_error("listings/images", 500));
        }
        self.uploads
            .lock()
            .unwrap()
            .push((listing_id, file_name.to_string(), bytes));
        Ok(())
    }

    async fn delete_listing(&self, listing_id: i64) -> Result<DeleteOutcome, MarketError> {
        if self.broken.lock().unwrap().contains(&listing_id) {
            return Err(Self::status_error("listings/delete", 500));
        }
        self.deleted.lock().unwrap().push(listing_id);
        if self.gone.lock().unwrap().contains(&listing_id) {
            return Ok(DeleteOutcome::AlreadyGone);
        }
        Ok(DeleteOutcome::Deleted)
    }

    async fn find_city(&self, name: &str) -> Result<Option<i64>, MarketError> {
        Ok(self.cities.lock().unwrap().get(name).copied())
    }
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub collector: Arc<FakeCollector>,
    pub market: Arc<FakeMarket>,
    pub images: ImageStore,
    _dir: TempDir,
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let collector = Arc::new(FakeCollector::default());
    let market = Arc::new(FakeMarket::default());
    let images = ImageStore::new(dir.path());
    let engine = Engine::new(
        store.clone(),
        collector.clone(),
        market.clone(),
        Arc::new(Taxonomy::builtin().unwrap()),
        images.clone(),
        EngineSettings::default().without_delays(),
    );
    Harness {
        engine,
        store,
        collector,
        market,
        images,
        _dir: dir,
    }
}

/// A parseable truck listing.
pub fn truck(brand: &str, model: &str, price: i64) -> ItemDetail {
    let mut fields = ItemFields {
        brand: brand.to_string(),
        model: Some(model.to_string()),
        fuel_type: Some("Дизель".to_string()),
        transmission: Some("Ручна / Механіка".to_string()),
        price: Some(price),
        year: Some(2015),
        mileage: Some(310),
        color: Some("Білий".to_string()),
        location: Some("Київ".to_string()),
        description: "Вантажівка в робочому стані".to_string(),
        ..Default::default()
    };
    fields
        .attributes
        .insert("descEngineEngine".to_string(), "2.3 л (150 к.с.) • Дизель".to_string());
    ItemDetail {
        fields,
        image_urls: Vec::new(),
    }
}
