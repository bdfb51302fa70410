//! Crawl collector contract and the HTML collector for the source site.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use listsync_core::{parse_digits, ItemFields};
use listsync_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "listsync-adapters";

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19[5-9]\d|20\d{2})\b").expect("year regex is valid"));
static PHOTO_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)[a-z]+\.(webp|jpg)$").expect("photo size regex is valid")
});

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid url {url:?}: {message}")]
    Url { url: String, message: String },
    #[error("{0}")]
    Message(String),
}

/// Scraped listing: descriptive fields plus photo URLs in page order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemDetail {
    pub fields: ItemFields,
    pub image_urls: Vec<String>,
}

#[async_trait]
pub trait CrawlCollector: Send + Sync {
    /// Ordered, de-duplicated item URLs of every page under `source_url`.
    /// An empty list is a valid answer.
    async fn collect_item_urls(&self, source_url: &str) -> Result<Vec<String>, CollectError>;

    async fn fetch_item_detail(&self, item_url: &str) -> Result<ItemDetail, CollectError>;

    async fn fetch_image(&self, image_url: &str) -> Result<Vec<u8>, CollectError>;
}

#[derive(Debug, Clone)]
pub struct HtmlCollectorConfig {
    pub card_selector: String,
    /// Only hrefs containing this marker are item pages.
    pub item_path_marker: String,
    pub page_param: String,
    pub first_page: u32,
    pub max_pages: u32,
    pub price_selector: String,
    pub title_selector: String,
    pub mileage_selector: String,
    pub description_selector: String,
    pub location_selector: String,
    pub attribute_selector: String,
    pub engine_attribute: String,
    pub transmission_attribute: String,
    pub color_attribute: String,
    pub image_selector: String,
    pub image_url_marker: Option<String>,
}

impl Default for HtmlCollectorConfig {
    fn default() -> Self {
        Self {
            card_selector: "a.product-card".to_string(),
            item_path_marker: "/auto_".to_string(),
            page_param: "page".to_string(),
            first_page: 0,
            max_pages: 100,
            price_selector: "#sidePrice strong".to_string(),
            title_selector: "#sideTitleTitle span".to_string(),
            mileage_selector: "#basicInfoTableMainInfo0 span".to_string(),
            description_selector: "#col > div:nth-of-type(6) > div > span".to_string(),
            location_selector: "#basicInfoTableMainInfoGeo span".to_string(),
            attribute_selector: "#descList div[id]".to_string(),
            engine_attribute: "descEngineEngine".to_string(),
            transmission_attribute: "descTransmission".to_string(),
            color_attribute: "descColor".to_string(),
            image_selector: r#"li[style*="width:100%"] picture img, li[style*="width:100%"] picture source"#
                .to_string(),
            image_url_marker: Some("/photosnew/auto/photo/".to_string()),
        }
    }
}

pub struct HtmlCollector {
    http: Arc<HttpFetcher>,
    config: HtmlCollectorConfig,
}

impl HtmlCollector {
    pub fn new(http: Arc<HttpFetcher>, config: HtmlCollectorConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &HtmlCollectorConfig {
        &self.config
    }

    /// Item links of one search results page, resolved against `page_url`.
    pub fn parse_listing_page(&self, page_url: &str, html: &str) -> Result<Vec<String>, CollectError> {
        let base = parse_url(page_url)?;
        let document = Html::parse_document(html);
        let sel = selector(&self.config.card_selector)?;

        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for card in document.select(&sel) {
            let Some(href) = card.value().attr("href") else {
                continue;
            };
            let Ok(resolved) = base.join(href.trim()) else {
                continue;
            };
            let resolved = resolved.to_string();
            if resolved.contains(&self.config.item_path_marker) && seen.insert(resolved.clone()) {
                links.push(resolved);
            }
        }
        Ok(links)
    }

    pub fn parse_detail_page(&self, page_url: &str, html: &str) -> Result<ItemDetail, CollectError> {
        let base = parse_url(page_url)?;
        let document = Html::parse_document(html);
        let cfg = &self.config;

        let title = select_first_text(&document, &cfg.title_selector)?.unwrap_or_default();
        let (brand, model, year) = split_title(&title);

        let attributes = select_attributes(&document, &cfg.attribute_selector)?;
        let engine = attributes.get(&cfg.engine_attribute);
        let fuel_type = engine
            .and_then(|e| e.split('•').nth(1))
            .and_then(|segment| text_or_none(segment.to_string()));

        let fields = ItemFields {
            brand,
            model,
            fuel_type,
            transmission: attributes.get(&cfg.transmission_attribute).cloned(),
            price: select_first_text(&document, &cfg.price_selector)?
                .as_deref()
                .and_then(parse_digits),
            year,
            mileage: select_first_text(&document, &cfg.mileage_selector)?
                .as_deref()
                .and_then(parse_digits),
            color: attributes.get(&cfg.color_attribute).cloned(),
            location: select_first_text(&document, &cfg.location_selector)?,
            description: select_first_text(&document, &cfg.description_selector)?
                .unwrap_or_default(),
            attributes,
            image_folder: None,
        };

        let image_urls = self.extract_image_urls(&document, &base)?;
        Ok(ItemDetail { fields, image_urls })
    }

    fn extract_image_urls(&self, document: &Html, base: &Url) -> Result<Vec<String>, CollectError> {
        let sel = selector(&self.config.image_selector)?;
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for node in document.select(&sel) {
            let Some(raw) = image_source(&node) else {
                continue;
            };
            let Ok(resolved) = base.join(&raw) else {
                continue;
            };
            let resolved = resolved.to_string();
            if let Some(marker) = &self.config.image_url_marker {
                if !resolved.contains(marker.as_str()) {
                    continue;
                }
            }
            let full_size = PHOTO_SIZE_RE.replace(&resolved, "${1}hd.jpg").into_owned();
            if seen.insert(full_size.clone()) {
                urls.push(full_size);
            }
        }
        Ok(urls)
    }
}

#[async_trait]
impl CrawlCollector for HtmlCollector {
    async fn collect_item_urls(&self, source_url: &str) -> Result<Vec<String>, CollectError> {
        let mut seen = HashSet::new();
        let mut all = Vec::new();
        let last_page = self.config.first_page.saturating_add(self.config.max_pages);

        for page in self.config.first_page..last_page {
            let page_url = update_page_in_url(source_url, &self.config.page_param, page)?;
            let response = self.http.fetch_bytes(&page_url).await?;
            let links = self.parse_listing_page(&response.final_url, &response.text())?;
            if links.is_empty() {
                info!(source_url, page, total = all.len(), "no items on page, stopping");
                return Ok(all);
            }
            debug!(source_url, page, found = links.len(), "collected listing page");
            for link in links {
                if seen.insert(link.clone()) {
                    all.push(link);
                }
            }
        }

        warn!(source_url, max_pages = self.config.max_pages, "page limit reached");
        Ok(all)
    }

    async fn fetch_item_detail(&self, item_url: &str) -> Result<ItemDetail, CollectError> {
        let response = self.http.fetch_bytes(item_url).await?;
        self.parse_detail_page(&response.final_url, &response.text())
    }

    async fn fetch_image(&self, image_url: &str) -> Result<Vec<u8>, CollectError> {
        Ok(self.http.fetch_bytes(image_url).await?.body)
    }
}

/// Sets (or adds) the page number query parameter, keeping the others in order.
pub fn update_page_in_url(url: &str, param: &str, page: u32) -> Result<String, CollectError> {
    let mut parsed = parse_url(url)?;
    let mut replaced = false;
    let mut pairs: Vec<(String, String)> = Vec::new();
    for (key, value) in parsed.query_pairs() {
        if key == param {
            if !replaced {
                pairs.push((key.into_owned(), page.to_string()));
                replaced = true;
            }
        } else {
            pairs.push((key.into_owned(), value.into_owned()));
        }
    }
    if !replaced {
        pairs.push((param.to_string(), page.to_string()));
    }
    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    Ok(parsed.to_string())
}

/// Brand is the first title word, model the second; year is the first
/// plausible four-digit year anywhere in the title.
pub fn split_title(title: &str) -> (String, Option<String>, Option<i32>) {
    let year = YEAR_RE
        .find(title)
        .and_then(|m| m.as_str().parse::<i32>().ok());
    let mut words = title.split_whitespace();
    let brand = words.next().unwrap_or_default().to_string();
    let model = words
        .next()
        .filter(|w| !YEAR_RE.is_match(w))
        .map(str::to_string);
    (brand, model, year)
}

fn parse_url(url: &str) -> Result<Url, CollectError> {
    Url::parse(url).map_err(|e| CollectError::Url {
        url: url.to_string(),
        message: e.to_string(),
    })
}

fn selector(css: &str) -> Result<Selector, CollectError> {
    Selector::parse(css).map_err(|e| CollectError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, CollectError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

/// `id -> text` of each attribute block's first `span`.
fn select_attributes(document: &Html, css: &str) -> Result<BTreeMap<String, String>, CollectError> {
    let sel = selector(css)?;
    let span = selector("span")?;
    let mut out = BTreeMap::new();
    for block in document.select(&sel) {
        let Some(id) = block.value().attr("id") else {
            continue;
        };
        let text = block
            .select(&span)
            .next()
            .and_then(|s| text_or_none(s.text().collect::<String>()));
        if let Some(text) = text {
            out.entry(id.to_string()).or_insert(text);
        }
    }
    Ok(out)
}

fn image_source(node: &ElementRef<'_>) -> Option<String> {
    let element = node.value();
    let raw = element
        .attr("src")
        .or_else(|| element.attr("data-src"))
        .or_else(|| element.attr("srcset"))?;
    let first = raw.split(',').next()?.split_whitespace().next()?;
    (!first.is_empty()).then(|| first.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use listsync_storage::HttpClientConfig;

    fn collector() -> HtmlCollector {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        HtmlCollector::new(Arc::new(http), HtmlCollectorConfig::default())
    }

    const LISTING: &str = r#"
        <html><body><div id="items">
          <a class="product-card" href="/uk/auto_man_tgl_1.html">MAN</a>
          <a class="product-card" href="https://auto.example.com/uk/auto_daf_lf_2.html">DAF</a>
          <a class="product-card" href="/uk/auto_man_tgl_1.html">dup</a>
          <a class="product-card" href="/uk/news/article.html">news</a>
          <a class="other" href="/uk/auto_iveco_3.html">not a card</a>
        </div></body></html>
    "#;

    const DETAIL: &str = r#"
        <html><body>
          <div id="sideTitleTitle"><span> MAN  TGL 8.180   2012 </span></div>
          <div id="sidePrice"><strong>18 500 $</strong></div>
          <div id="basicInfoTableMainInfo0"><span>450 тис. км</span></div>
          <div id="basicInfoTableMainInfoGeo"><span>Київ</span></div>
          <div id="col">
            <div>1</div><div>2</div><div>3</div><div>4</div><div>5</div>
            <div><div><span>Гарний стан, один власник</span></div></div>
          </div>
          <div id="descList">
            <div id="descEngineEngine"><span>4.6 л (180 к.с. / 132 кВт) • Дизель</span></div>
            <div id="descTransmission"><span>Ручна / Механіка</span></div>
            <div id="descColor"><span>Білий</span></div>
            <div id="descEmpty"><span>  </span></div>
          </div>
          <ul>
            <li style="width:100%"><picture>
              <source srcset="https://cdn.example.com/photosnew/auto/photo/man__111f.webp 1x, https://cdn.example.com/x2.webp 2x">
              <img src="https://cdn.example.com/photosnew/auto/photo/man__111f.jpg">
            </picture></li>
            <li style="width:100%"><picture>
              <img src="https://cdn.example.com/photosnew/auto/photo/man__222s.jpg">
            </picture></li>
            <li style="width:100%"><picture><img src="https://cdn.example.com/banner.png"></picture></li>
          </ul>
        </body></html>
    "#;

    #[test]
    fn listing_page_keeps_item_cards_in_order() {
        let links = collector()
            .parse_listing_page("https://auto.example.com/uk/search/?page=0", LISTING)
            .unwrap();
        assert_eq!(
            links,
            vec![
                "https://auto.example.com/uk/auto_man_tgl_1.html",
                "https://auto.example.com/uk/auto_daf_lf_2.html",
            ]
        );
    }

    #[test]
    fn empty_listing_page_yields_no_links() {
        let links = collector()
            .parse_listing_page("https://auto.example.com/uk/search/", "<html></html>")
            .unwrap();
        assert!(links.is_empty());
    }

    #[test]
    fn detail_page_maps_to_item_fields() {
        let detail = collector()
            .parse_detail_page("https://auto.example.com/uk/auto_man_tgl_1.html", DETAIL)
            .unwrap();
        let fields = &detail.fields;
        assert_eq!(fields.brand, "MAN");
        assert_eq!(fields.model.as_deref(), Some("TGL"));
        assert_eq!(fields.year, Some(2012));
        assert_eq!(fields.price, Some(18_500));
        assert_eq!(fields.mileage, Some(450));
        assert_eq!(fields.location.as_deref(), Some("Київ"));
        assert_eq!(fields.description, "Гарний стан, один власник");
        assert_eq!(fields.fuel_type.as_deref(), Some("Дизель"));
        assert_eq!(fields.transmission.as_deref(), Some("Ручна / Механіка"));
        assert_eq!(fields.color.as_deref(), Some("Білий"));
        assert!(!fields.attributes.contains_key("descEmpty"));
        assert!(fields.missing_mandatory().is_empty());
    }

    #[test]
    fn detail_images_are_full_size_and_ordered() {
        let detail = collector()
            .parse_detail_page("https://auto.example.com/uk/auto_man_tgl_1.html", DETAIL)
            .unwrap();
        assert_eq!(
            detail.image_urls,
            vec![
                "https://cdn.example.com/photosnew/auto/photo/man__111hd.jpg",
                "https://cdn.example.com/photosnew/auto/photo/man__222hd.jpg",
            ]
        );
    }

    #[test]
    fn detail_without_title_is_incomplete_not_an_error() {
        let detail = collector()
            .parse_detail_page("https://auto.example.com/x", "<html><body></body></html>")
            .unwrap();
        assert_eq!(detail.fields.missing_mandatory(), vec!["brand", "price", "year"]);
    }

    #[test]
    fn page_param_is_replaced_in_place_or_appended() {
        let url = update_page_in_url("https://a.example.com/s/?owner=7&page=0&limit=20", "page", 3)
            .unwrap();
        assert_eq!(url, "https://a.example.com/s/?owner=7&page=3&limit=20");

        let url = update_page_in_url("https://a.example.com/s/?owner=7", "page", 1).unwrap();
        assert_eq!(url, "https://a.example.com/s/?owner=7&page=1");
    }

    #[test]
    fn title_split_handles_missing_model() {
        assert_eq!(
            split_title("Volvo FH 2016"),
            ("Volvo".to_string(), Some("FH".to_string()), Some(2016))
        );
        assert_eq!(split_title("Isuzu 2008"), ("Isuzu".to_string(), None, Some(2008)));
        assert_eq!(split_title(""), (String::new(), None, None));
    }

    #[test]
    fn invalid_selector_is_reported() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let config = HtmlCollectorConfig {
            card_selector: "a[".to_string(),
            ..Default::default()
        };
        let err = HtmlCollector::new(Arc::new(http), config)
            .parse_listing_page("https://a.example.com/", LISTING)
            .unwrap_err();
        assert!(matches!(err, CollectError::Selector { .. }));
    }
}
