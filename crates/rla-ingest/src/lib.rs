//! Ingestion persistence paths. The scraping and parsing pipelines run
//! out-of-process and hand this crate normalized [`ListingDraft`]s; here they
//! become stored listings, with the portal path upserting by source identity
//! and the social path running the deduplication gate first.

use std::sync::Arc;

use chrono::Utc;
use rla_core::{
    normalize_source_url, DraftImage, Listing, ListingAmenities, ListingDraft, ListingImage,
    ListingLocation, PriceRecord,
};
use rla_dedup::{DedupEngine, DedupError};
use rla_storage::{ListingStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rla-ingest";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid draft: {0}")]
    Validation(String),
    #[error(transparent)]
    Dedup(#[from] DedupError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to one incoming draft. Skips are never silent; they carry
/// the collided listing and the gate's reason for operator visibility.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Created {
        listing: Listing,
    },
    Updated {
        listing: Listing,
        price_changed: bool,
    },
    Skipped {
        matched_listing_id: Uuid,
        reason: String,
    },
}

pub struct IngestPipeline {
    store: Arc<dyn ListingStore>,
    engine: DedupEngine,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        let engine = DedupEngine::new(Arc::clone(&store));
        Self { store, engine }
    }

    pub fn engine(&self) -> &DedupEngine {
        &self.engine
    }

    /// Portal drafts carry a stable source identity, so re-ingesting a known
    /// listing refreshes `last_seen_at` and the price (appending a price
    /// history row on change) instead of inserting a second copy.
    pub async fn ingest_portal(&self, draft: &ListingDraft) -> Result<IngestOutcome, IngestError> {
        validate_draft(draft)?;

        let existing = match &draft.source_id {
            Some(source_id) => {
                self.store
                    .find_by_source(draft.source_platform, source_id)
                    .await?
            }
            None => None,
        };
        let existing = match existing {
            Some(listing) => Some(listing),
            None => match &draft.source_url {
                Some(url) => {
                    self.store
                        .find_by_source_url(&normalize_source_url(url))
                        .await?
                }
                None => None,
            },
        };

        if let Some(known) = existing {
            let now = Utc::now();
            let old_price = self.store.touch_seen(known.id, draft.price, now).await?;
            let price_changed = old_price.is_some();
            if let (Some(old), Some(new)) = (old_price, draft.price) {
                self.store
                    .append_price_record(PriceRecord {
                        id: Uuid::new_v4(),
                        listing_id: known.id,
                        price: new,
                        change_amount: Some(new - old),
                        recorded_at: now,
                    })
                    .await?;
            }
            let listing = self
                .store
                .get(known.id)
                .await?
                .ok_or(StoreError::NotFound(known.id))?;
            info!(listing_id = %known.id, price_changed, "portal draft refreshed known listing");
            return Ok(IngestOutcome::Updated {
                listing,
                price_changed,
            });
        }

        let listing = self.insert_draft(draft).await?;
        info!(listing_id = %listing.id, "portal draft created listing");
        Ok(IngestOutcome::Created { listing })
    }

    /// Social drafts have no reliable source identity; the deduplication gate
    /// decides whether they are persisted at all.
    pub async fn ingest_social(&self, draft: &ListingDraft) -> Result<IngestOutcome, IngestError> {
        validate_draft(draft)?;

        let decision = self.engine.check_ingestion_duplicate(draft).await?;
        if decision.is_duplicate {
            let matched_listing_id = decision
                .matched_listing_id
                .expect("gate skip always names the matched listing");
            let reason = decision.reason.unwrap_or_default();
            info!(matched = %matched_listing_id, "social draft skipped by gate");
            return Ok(IngestOutcome::Skipped {
                matched_listing_id,
                reason,
            });
        }

        let listing = self.insert_draft(draft).await?;
        info!(listing_id = %listing.id, "social draft created listing");
        Ok(IngestOutcome::Created { listing })
    }

    async fn insert_draft(&self, draft: &ListingDraft) -> Result<Listing, IngestError> {
        let now = Utc::now();
        let id = Uuid::new_v4();

        let listing = Listing {
            id,
            source_platform: draft.source_platform,
            source_id: draft.source_id.clone(),
            source_url: draft.source_url.as_deref().map(normalize_source_url),
            title: draft.title.clone(),
            description: draft.description.clone(),
            price: draft.price,
            currency: draft.currency.clone().unwrap_or_else(|| "ILS".to_string()),
            bedrooms: draft.bedrooms,
            bathrooms: draft.bathrooms,
            area_sqm: draft.area_sqm,
            listing_type: draft.listing_type,
            property_type: draft.property_type.clone(),
            available_from: draft.available_from,
            is_active: true,
            location_text: draft.location_text.clone(),
            phone_normalized: draft.phone_normalized(),
            duplicate_status: None,
            duplicate_score: None,
            master_listing_id: None,
            first_seen_at: now,
            last_seen_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let location = draft.location_text.as_deref().map(|text| {
            let mut segments = text.split(',').map(str::trim);
            let city = segments.next().filter(|s| !s.is_empty()).map(String::from);
            let neighborhood = segments.next().filter(|s| !s.is_empty()).map(String::from);
            ListingLocation {
                listing_id: id,
                address: Some(text.to_string()),
                city,
                neighborhood,
                formatted_address: None,
                latitude: None,
                longitude: None,
            }
        });

        let images = draft
            .images
            .iter()
            .enumerate()
            .map(|(index, DraftImage { image_url, is_primary })| ListingImage {
                id: Uuid::new_v4(),
                listing_id: id,
                image_url: image_url.clone(),
                image_order: index as i32,
                is_primary: *is_primary || index == 0,
            })
            .collect();

        let amenities = if draft.amenities.is_empty() {
            None
        } else {
            Some(ListingAmenities::from_names(&draft.amenities))
        };

        self.store
            .insert_full(listing.clone(), location, images, amenities)
            .await?;
        Ok(listing)
    }
}

fn validate_draft(draft: &ListingDraft) -> Result<(), IngestError> {
    if draft.title.trim().is_empty() {
        return Err(IngestError::Validation("title must not be empty".into()));
    }
    if let Some(price) = draft.price {
        if !price.is_finite() || price < 0.0 {
            return Err(IngestError::Validation(format!(
                "price must be a non-negative number, got {price}"
            )));
        }
    }
    if let Some(bedrooms) = draft.bedrooms {
        if bedrooms < 0 {
            return Err(IngestError::Validation(format!(
                "bedroom count must be non-negative, got {bedrooms}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rla_core::{ListingType, SourcePlatform};
    use rla_storage::MemoryListingStore;

    fn portal_draft(source_id: &str, price: f64) -> ListingDraft {
        ListingDraft {
            source_platform: SourcePlatform::Portal,
            source_id: Some(source_id.to_string()),
            source_url: Some(format!("https://portal.example/item/{source_id}?from=feed")),
            title: "3 room apartment in Modiin".into(),
            description: Some("renovated, close to everything".into()),
            price: Some(price),
            currency: Some("ILS".into()),
            bedrooms: Some(3),
            bathrooms: Some(1.5),
            area_sqm: Some(85.0),
            listing_type: ListingType::Rent,
            property_type: Some("apartment".into()),
            available_from: None,
            location_text: Some("Modiin, Center".into()),
            contact_phone: None,
            images: vec![
                DraftImage {
                    image_url: "https://img.example/1.jpg".into(),
                    is_primary: false,
                },
                DraftImage {
                    image_url: "https://img.example/2.jpg".into(),
                    is_primary: false,
                },
            ],
            amenities: vec!["elevator".into(), "parking".into()],
        }
    }

    fn social_draft(price: f64, phone: Option<&str>) -> ListingDraft {
        ListingDraft {
            source_platform: SourcePlatform::Social,
            source_id: None,
            source_url: None,
            title: "apartment for rent".into(),
            description: None,
            price: Some(price),
            currency: None,
            bedrooms: Some(2),
            bathrooms: None,
            area_sqm: None,
            listing_type: ListingType::Rent,
            property_type: None,
            available_from: None,
            location_text: Some("Modiin, Center".into()),
            contact_phone: phone.map(String::from),
            images: vec![],
            amenities: vec![],
        }
    }

    fn pipeline() -> (IngestPipeline, Arc<MemoryListingStore>) {
        let store = Arc::new(MemoryListingStore::new());
        let ingest = IngestPipeline::new(store.clone());
        (ingest, store)
    }

    #[tokio::test]
    async fn portal_insert_persists_children() {
        let (ingest, store) = pipeline();

        let outcome = ingest.ingest_portal(&portal_draft("go77ks4g", 5200.0)).await.unwrap();
        let IngestOutcome::Created { listing } = outcome else {
            panic!("expected Created");
        };
        assert_eq!(
            listing.source_url.as_deref(),
            Some("https://portal.example/item/go77ks4g")
        );

        let locations = store.locations_for(&[listing.id]).await.unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].city.as_deref(), Some("Modiin"));
        assert_eq!(locations[0].neighborhood.as_deref(), Some("Center"));

        let images = store.images_for(&[listing.id]).await.unwrap();
        assert_eq!(images.len(), 2);
        assert!(images[0].is_primary);
        assert!(!images[1].is_primary);
        assert_eq!(images[1].image_order, 1);
    }

    #[tokio::test]
    async fn portal_reingest_updates_seen_and_tracks_price_change() {
        let (ingest, store) = pipeline();

        let first = ingest.ingest_portal(&portal_draft("abc123", 5000.0)).await.unwrap();
        let IngestOutcome::Created { listing } = first else {
            panic!("expected Created");
        };

        // Same price: refreshed, no history row.
        let second = ingest.ingest_portal(&portal_draft("abc123", 5000.0)).await.unwrap();
        assert!(matches!(
            second,
            IngestOutcome::Updated { price_changed: false, .. }
        ));
        assert!(store.price_history_for(listing.id).await.unwrap().is_empty());

        // Price moved: one appended history row with the delta.
        let third = ingest.ingest_portal(&portal_draft("abc123", 5400.0)).await.unwrap();
        let IngestOutcome::Updated { listing: updated, price_changed } = third else {
            panic!("expected Updated");
        };
        assert!(price_changed);
        assert_eq!(updated.price, Some(5400.0));

        let history = store.price_history_for(listing.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].price, 5400.0);
        assert_eq!(history[0].change_amount, Some(400.0));
        assert_eq!(store.listing_count().await, 1);
    }

    #[tokio::test]
    async fn social_gate_skip_names_matched_listing() {
        let (ingest, _) = pipeline();

        let first = ingest
            .ingest_social(&social_draft(5000.0, Some("0501234567")))
            .await
            .unwrap();
        let IngestOutcome::Created { listing } = first else {
            panic!("expected Created");
        };

        let second = ingest
            .ingest_social(&social_draft(5000.0, Some("+972-50-123-4567")))
            .await
            .unwrap();
        let IngestOutcome::Skipped { matched_listing_id, reason } = second else {
            panic!("expected Skipped");
        };
        assert_eq!(matched_listing_id, listing.id);
        assert!(!reason.is_empty());
    }

    #[tokio::test]
    async fn social_insert_normalizes_phone() {
        let (ingest, _) = pipeline();
        let outcome = ingest
            .ingest_social(&social_draft(6100.0, Some("+972 50 765 4321")))
            .await
            .unwrap();
        let IngestOutcome::Created { listing } = outcome else {
            panic!("expected Created");
        };
        assert_eq!(listing.phone_normalized.as_deref(), Some("507654321"));
    }

    #[tokio::test]
    async fn drafts_are_validated_before_any_write() {
        let (ingest, store) = pipeline();
        let mut draft = social_draft(5000.0, None);
        draft.title = "   ".into();
        assert!(matches!(
            ingest.ingest_social(&draft).await.unwrap_err(),
            IngestError::Validation(_)
        ));

        let mut draft = social_draft(-1.0, None);
        draft.title = "ok".into();
        assert!(matches!(
            ingest.ingest_social(&draft).await.unwrap_err(),
            IngestError::Validation(_)
        ));
        assert_eq!(store.listing_count().await, 0);
    }
}
