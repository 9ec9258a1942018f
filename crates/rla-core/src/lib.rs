//! Core domain model for RLA: listings, child records, and ingestion drafts.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rla-core";

/// Which ingestion channel produced a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePlatform {
    Portal,
    Social,
    Manual,
}

impl SourcePlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePlatform::Portal => "portal",
            SourcePlatform::Social => "social",
            SourcePlatform::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "portal" => Some(SourcePlatform::Portal),
            "social" => Some(SourcePlatform::Social),
            "manual" => Some(SourcePlatform::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingType {
    Rent,
    Sale,
}

impl ListingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingType::Rent => "rent",
            ListingType::Sale => "sale",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rent" => Some(ListingType::Rent),
            "sale" => Some(ListingType::Sale),
            _ => None,
        }
    }
}

/// Resolution state of a listing in the duplicate-detection workflow.
///
/// A freshly ingested listing has no status (`None` at the listing level);
/// scoring or an operator decision moves it into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateStatus {
    Unique,
    Review,
    Master,
    Duplicate,
}

impl DuplicateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateStatus::Unique => "unique",
            DuplicateStatus::Review => "review",
            DuplicateStatus::Master => "master",
            DuplicateStatus::Duplicate => "duplicate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unique" => Some(DuplicateStatus::Unique),
            "review" => Some(DuplicateStatus::Review),
            "master" => Some(DuplicateStatus::Master),
            "duplicate" => Some(DuplicateStatus::Duplicate),
            _ => None,
        }
    }
}

/// One ingested property record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub source_platform: SourcePlatform,
    pub source_id: Option<String>,
    pub source_url: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: String,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<f64>,
    pub area_sqm: Option<f64>,
    pub listing_type: ListingType,
    pub property_type: Option<String>,
    pub available_from: Option<NaiveDate>,
    pub is_active: bool,
    pub location_text: Option<String>,
    pub phone_normalized: Option<String>,
    pub duplicate_status: Option<DuplicateStatus>,
    pub duplicate_score: Option<i32>,
    /// Weak self-reference; non-null iff `duplicate_status` is `Duplicate`.
    pub master_listing_id: Option<Uuid>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn is_confirmed_duplicate(&self) -> bool {
        self.duplicate_status == Some(DuplicateStatus::Duplicate)
    }
}

/// Structured address, 1:1 with a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingLocation {
    pub listing_id: Uuid,
    pub address: Option<String>,
    pub city: Option<String>,
    pub neighborhood: Option<String>,
    pub formatted_address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingImage {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub image_url: String,
    pub image_order: i32,
    pub is_primary: bool,
}

/// Wide boolean amenity row, 1:1 with a listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingAmenities {
    pub elevator: bool,
    pub parking: bool,
    pub balcony: bool,
    pub safe_room: bool,
    pub air_conditioning: bool,
    pub furnished: bool,
    pub storage: bool,
    pub garden: bool,
    pub solar_heater: bool,
}

impl ListingAmenities {
    /// Fold a draft's amenity names into flags. Unknown names are ignored.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut amenities = Self::default();
        for name in names {
            match name.as_ref().trim().to_ascii_lowercase().as_str() {
                "elevator" | "lift" => amenities.elevator = true,
                "parking" => amenities.parking = true,
                "balcony" => amenities.balcony = true,
                "safe room" | "shelter" => amenities.safe_room = true,
                "ac" | "air conditioning" => amenities.air_conditioning = true,
                "furnished" => amenities.furnished = true,
                "storage" => amenities.storage = true,
                "garden" => amenities.garden = true,
                "solar heater" | "solar water heater" => amenities.solar_heater = true,
                _ => {}
            }
        }
        amenities
    }
}

/// Append-only price history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub price: f64,
    pub change_amount: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftImage {
    pub image_url: String,
    #[serde(default)]
    pub is_primary: bool,
}

/// Normalized handoff record produced by the out-of-process ingestion
/// pipelines (portal scraper, social-post parser, document extraction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub source_platform: SourcePlatform,
    pub source_id: Option<String>,
    pub source_url: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<f64>,
    pub area_sqm: Option<f64>,
    pub listing_type: ListingType,
    pub property_type: Option<String>,
    pub available_from: Option<NaiveDate>,
    pub location_text: Option<String>,
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub images: Vec<DraftImage>,
    #[serde(default)]
    pub amenities: Vec<String>,
}

impl ListingDraft {
    /// City is the first comma-segment of the free-text location.
    pub fn city(&self) -> Option<String> {
        self.location_text.as_deref().and_then(city_from_location)
    }

    pub fn phone_normalized(&self) -> Option<String> {
        self.contact_phone
            .as_deref()
            .map(normalize_phone)
            .filter(|phone| !phone.is_empty())
    }
}

/// First comma-segment of a free-text location, trimmed. Empty segments
/// yield `None`.
pub fn city_from_location(location_text: &str) -> Option<String> {
    let city = location_text.split(',').next()?.trim();
    if city.is_empty() {
        None
    } else {
        Some(city.to_string())
    }
}

/// Normalize a contact phone for equality checks: digits only, country code
/// 972 and leading zero stripped. A 9-digit result is the canonical local
/// form; anything else is kept as the bare digit string.
pub fn normalize_phone(phone: &str) -> String {
    let mut digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();

    if let Some(rest) = digits.strip_prefix("972") {
        digits = rest.to_string();
    }
    if digits.len() == 10 {
        if let Some(rest) = digits.strip_prefix('0') {
            digits = rest.to_string();
        }
    }

    digits
}

pub fn phones_match(a: &str, b: &str) -> bool {
    normalize_phone(a) == normalize_phone(b)
}

/// Strip query string and fragment so portal URLs compare by path.
pub fn normalize_source_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    without_query.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_normalization_equates_common_forms() {
        assert_eq!(normalize_phone("+972-50-123-4567"), "501234567");
        assert_eq!(normalize_phone("0501234567"), "501234567");
        assert_eq!(normalize_phone("050-1234567"), "501234567");
        assert!(phones_match("+972 50 123 4567", "0501234567"));
    }

    #[test]
    fn phone_normalization_keeps_unrecognized_digit_strings() {
        assert_eq!(normalize_phone("12345"), "12345");
        assert!(!phones_match("12345", "54321"));
    }

    #[test]
    fn city_is_first_comma_segment() {
        assert_eq!(city_from_location("Modiin, Center"), Some("Modiin".into()));
        assert_eq!(city_from_location("  Tel Aviv  "), Some("Tel Aviv".into()));
        assert_eq!(city_from_location(",Neighborhood"), None);
        assert_eq!(city_from_location(""), None);
    }

    #[test]
    fn source_url_normalization_strips_query_and_fragment() {
        assert_eq!(
            normalize_source_url("https://portal.example/item/go77ks4g?opened-from=feed#top"),
            "https://portal.example/item/go77ks4g"
        );
        assert_eq!(
            normalize_source_url("https://portal.example/item/abc/"),
            "https://portal.example/item/abc"
        );
    }

    #[test]
    fn duplicate_status_round_trips_through_strings() {
        for status in [
            DuplicateStatus::Unique,
            DuplicateStatus::Review,
            DuplicateStatus::Master,
            DuplicateStatus::Duplicate,
        ] {
            assert_eq!(DuplicateStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DuplicateStatus::parse("merged"), None);
    }

    #[test]
    fn amenity_names_fold_into_flags() {
        let amenities = ListingAmenities::from_names(["Elevator", "parking", "Solar Heater", "sauna"]);
        assert!(amenities.elevator);
        assert!(amenities.parking);
        assert!(amenities.solar_heater);
        assert!(!amenities.garden);
    }
}
