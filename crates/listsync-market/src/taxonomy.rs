//! Category taxonomy tables and the mapping of scraped fields to
//! marketplace codes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use listsync_core::{parse_decimal, parse_digits, ItemFields};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BUILTIN_TAXONOMY: &str = include_str!("../taxonomy/default.yaml");
const SUPPORTED_VERSION: u32 = 1;

static HORSEPOWER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\(\s*(\d+)\s*(?:к\.?\s*с|л\.?\s*с|hp)").expect("horsepower regex is valid")
});
static PAREN_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\s*(\d+)").expect("paren number regex is valid"));

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("unknown category {0:?}")]
    UnknownCategory(String),
    #[error("reading taxonomy {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing taxonomy: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid taxonomy: {0}")]
    Invalid(String),
}

/// Which payload slot carries the model code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSlot {
    #[default]
    Model,
    F8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedCode {
    pub id: i64,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrandEntry {
    pub id: i64,
    pub names: Vec<String>,
    #[serde(default)]
    pub models: Vec<NamedCode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSlotOverride {
    pub brand: i64,
    pub slot: ModelSlot,
}

/// Keys of the scraped attribute map consulted by the mapper.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttributeKeys {
    pub engine: Option<String>,
    pub transmission: Option<String>,
    pub color: Option<String>,
    pub drive: Option<String>,
    pub body: Option<String>,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryTables {
    #[serde(default)]
    pub attribute_keys: AttributeKeys,
    #[serde(default)]
    pub default_condition: Option<i64>,
    #[serde(default)]
    pub model_slots: Vec<ModelSlotOverride>,
    pub brands: Vec<BrandEntry>,
    #[serde(default)]
    pub body_types: Vec<NamedCode>,
    #[serde(default)]
    pub fuel_types: Vec<NamedCode>,
    #[serde(default)]
    pub transmission_types: Vec<NamedCode>,
    #[serde(default)]
    pub color_types: Vec<NamedCode>,
    #[serde(default)]
    pub drive_types: Vec<NamedCode>,
    #[serde(default)]
    pub condition_types: Vec<NamedCode>,
}

/// Taxonomy tables keyed by source category tag.
#[derive(Debug, Clone, Deserialize)]
pub struct Taxonomy {
    pub version: u32,
    pub default_category: String,
    pub categories: BTreeMap<String, CategoryTables>,
}

/// Listing body sent to the marketplace. Unmapped values serialize as `null`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ListingPayload {
    pub brand: Option<i64>,
    pub model: Option<i64>,
    pub price: Option<i64>,
    pub city: Option<i64>,
    pub description: String,
    pub year: Option<i32>,
    #[serde(rename = "f1")]
    pub body_type: Option<i64>,
    #[serde(rename = "f3")]
    pub fuel: Option<i64>,
    #[serde(rename = "f4")]
    pub power_hp: Option<i64>,
    #[serde(rename = "f5")]
    pub condition: Option<i64>,
    #[serde(rename = "f7")]
    pub year_slot: Option<i32>,
    #[serde(rename = "f8")]
    pub model_slot: Option<i64>,
    #[serde(rename = "f9")]
    pub displacement_l: Option<f64>,
    #[serde(rename = "f10")]
    pub mileage_thousand_km: Option<i64>,
    #[serde(rename = "f12")]
    pub transmission: Option<i64>,
    #[serde(rename = "f13")]
    pub color: Option<i64>,
    #[serde(rename = "f14")]
    pub drive: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineSpec {
    pub displacement_l: Option<f64>,
    pub power_hp: Option<i64>,
    pub fuel: Option<String>,
}

impl Taxonomy {
    /// The table set shipped with the binary.
    pub fn builtin() -> Result<Self, TaxonomyError> {
        Self::from_yaml_str(BUILTIN_TAXONOMY)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, TaxonomyError> {
        let taxonomy: Taxonomy = serde_yaml::from_str(yaml)?;
        taxonomy.validate()?;
        Ok(taxonomy)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TaxonomyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    fn validate(&self) -> Result<(), TaxonomyError> {
        if self.version != SUPPORTED_VERSION {
            return Err(TaxonomyError::Invalid(format!(
                "version {} is not supported (expected {SUPPORTED_VERSION})",
                self.version
            )));
        }
        if !self.categories.contains_key(&self.default_category) {
            return Err(TaxonomyError::Invalid(format!(
                "default category {:?} has no tables",
                self.default_category
            )));
        }
        Ok(())
    }

    pub fn category_names(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    /// A missing or blank tag selects the default category; an unknown tag is an error.
    pub fn resolve(&self, category: Option<&str>) -> Result<&CategoryTables, TaxonomyError> {
        let tag = category.map(str::trim).filter(|t| !t.is_empty());
        let key = tag.unwrap_or(self.default_category.as_str());
        self.categories
            .get(key)
            .ok_or_else(|| TaxonomyError::UnknownCategory(key.to_string()))
    }

    pub fn build_payload(
        &self,
        fields: &ItemFields,
        category: Option<&str>,
    ) -> Result<ListingPayload, TaxonomyError> {
        Ok(self.resolve(category)?.build_payload(fields))
    }
}

impl CategoryTables {
    pub fn brand_id(&self, text: &str) -> Option<i64> {
        let idx = best_match(self.brands.iter().map(|b| b.names.as_slice()), text)?;
        Some(self.brands[idx].id)
    }

    pub fn model_id(&self, brand_id: i64, text: &str) -> Option<i64> {
        let brand = self.brands.iter().find(|b| b.id == brand_id)?;
        lookup(&brand.models, text)
    }

    pub fn model_slot(&self, brand_id: i64) -> ModelSlot {
        self.model_slots
            .iter()
            .find(|o| o.brand == brand_id)
            .map(|o| o.slot)
            .unwrap_or_default()
    }

    pub fn build_payload(&self, fields: &ItemFields) -> ListingPayload {
        let keys = &self.attribute_keys;
        let attr = |key: &Option<String>| attribute(fields, key.as_deref());

        let engine = attr(&keys.engine).map(parse_engine).unwrap_or_default();

        let brand = self.brand_id(&fields.brand);
        let model_code = brand.and_then(|b| {
            fields
                .model
                .as_deref()
                .and_then(|m| self.model_id(b, m))
        });
        let (model, model_slot) = match brand.map(|b| self.model_slot(b)) {
            Some(ModelSlot::F8) => (None, model_code),
            _ => (model_code, None),
        };

        let fuel_text = fields.fuel_type.as_deref().or(engine.fuel.as_deref());
        let transmission_text = fields.transmission.as_deref().or(attr(&keys.transmission));
        let color_text = fields.color.as_deref().or(attr(&keys.color));

        ListingPayload {
            brand,
            model,
            price: fields.price,
            city: None,
            description: fields.description.clone(),
            year: fields.year,
            body_type: attr(&keys.body).and_then(|t| lookup(&self.body_types, t)),
            fuel: fuel_text.and_then(|t| lookup(&self.fuel_types, t)),
            power_hp: engine.power_hp,
            condition: attr(&keys.condition)
                .and_then(|t| lookup(&self.condition_types, t))
                .or(self.default_condition),
            year_slot: fields.year,
            model_slot,
            displacement_l: engine.displacement_l,
            mileage_thousand_km: fields.mileage,
            transmission: transmission_text.and_then(|t| lookup(&self.transmission_types, t)),
            color: color_text.and_then(|t| lookup(&self.color_types, t)),
            drive: attr(&keys.drive).and_then(|t| lookup(&self.drive_types, t)),
        }
    }
}

fn attribute<'a>(fields: &'a ItemFields, key: Option<&str>) -> Option<&'a str> {
    fields.attributes.get(key?).map(String::as_str)
}

/// Splits `"2.3 л (150 к.с. / 110 кВт) • Дизель"` into its numeric parts.
pub fn parse_engine(descriptor: &str) -> EngineSpec {
    let mut segments = descriptor.split('•').map(str::trim);
    let first = segments.next().unwrap_or_default();
    let volume_part = first.split('(').next().unwrap_or_default();

    let power_hp = HORSEPOWER_RE
        .captures(descriptor)
        .or_else(|| PAREN_NUMBER_RE.captures(descriptor))
        .and_then(|c| c.get(1))
        .and_then(|m| parse_digits(m.as_str()));

    EngineSpec {
        displacement_l: parse_decimal(volume_part),
        power_hp,
        fuel: segments.find(|s| !s.is_empty()).map(str::to_string),
    }
}

/// Lowercased with whitespace runs collapsed.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn lookup(table: &[NamedCode], text: &str) -> Option<i64> {
    let idx = best_match(table.iter().map(|e| e.names.as_slice()), text)?;
    Some(table[idx].id)
}

/// Index of the entry whose synonyms best match `text`: an exact match
/// first, then the longest synonym contained in the text, then the first
/// synonym that contains the text.
fn best_match<'a>(entries: impl Iterator<Item = &'a [String]>, text: &str) -> Option<usize> {
    let needle = normalize(text);
    if needle.is_empty() {
        return None;
    }

    let normalized: Vec<Vec<String>> = entries
        .map(|names| names.iter().map(|n| normalize(n)).collect())
        .collect();

    if let Some(idx) = normalized
        .iter()
        .position(|names| names.iter().any(|n| *n == needle))
    {
        return Some(idx);
    }

    let mut best: Option<(usize, usize)> = None;
    for (idx, names) in normalized.iter().enumerate() {
        for name in names {
            if name.is_empty() || !needle.contains(name.as_str()) {
                continue;
            }
            let len = name.chars().count();
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((idx, len));
            }
        }
    }
    if let Some((idx, _)) = best {
        return Some(idx);
    }

    if needle.chars().count() < 2 {
        return None;
    }
    normalized
        .iter()
        .position(|names| names.iter().any(|n| n.contains(needle.as_str())))
}
