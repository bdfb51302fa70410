//! Marketplace side of the engine: the category taxonomy that turns scraped
//! fields into remote codes, and the typed HTTP client for the remote API.

mod client;
mod taxonomy;

pub use client::{
    DeleteOutcome, MarketClient, MarketClientConfig, MarketError, MarketplaceApi,
};
pub use taxonomy::{
    lookup, normalize, parse_engine, AttributeKeys, BrandEntry, CategoryTables, EngineSpec,
    ListingPayload, ModelSlot, ModelSlotOverride, NamedCode, Taxonomy, TaxonomyError,
};

use tracing::warn;

pub const CRATE_NAME: &str = "listsync-market";

/// Geo id for an item location. The remote API rejects a null city, so any
/// lookup miss or failure falls back to `default_city_id`.
pub async fn resolve_city_id(
    api: &dyn MarketplaceApi,
    location: Option<&str>,
    default_city_id: i64,
) -> i64 {
    let Some(name) = location.map(str::trim).filter(|name| !name.is_empty()) else {
        return default_city_id;
    };
    match api.find_city(name).await {
        Ok(Some(id)) => id,
        Ok(None) => {
            warn!(location = name, default_city_id, "no geo match for location");
            default_city_id
        }
        Err(err) => {
            warn!(location = name, default_city_id, error = %err, "geo lookup failed");
            default_city_id
        }
    }
}
