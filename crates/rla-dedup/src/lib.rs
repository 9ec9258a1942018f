//! Duplicate detection and resolution engine: similarity scoring, candidate
//! discovery, the duplicate-status state machine, merge orchestration, and
//! the ingestion deduplication gate.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use rla_core::{DuplicateStatus, Listing, ListingDraft, ListingImage};
use rla_storage::{CandidateFilter, GateProbe, ListingStore, MergedFields, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rla-dedup";

/// Scores at or below this are noise and never surface as candidates.
pub const INTEREST_THRESHOLD: i32 = 20;
/// Candidates returned to the caller, most-similar first.
pub const CANDIDATE_LIMIT: usize = 10;
/// Pre-filter pool size scored per lookup.
pub const CANDIDATE_POOL_LIMIT: usize = 100;
/// Price pre-filter band: ±15%.
pub const PRICE_BAND: f64 = 0.15;
/// Floor-area pre-filter band: ±20%.
pub const AREA_BAND: f64 = 0.20;
/// Confidence sentinel for an operator resolve decision; manual confirmation
/// outranks any heuristic score.
pub const MANUAL_RESOLVE_SCORE: i32 = 90;
/// Confidence sentinel for listings folded in by an explicit merge.
pub const MANUAL_MERGE_SCORE: i32 = 100;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("listing {0} not found")]
    NotFound(Uuid),
    #[error("{0}")]
    Partial(PartialFailureReport),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which merge sub-operations succeeded and which failed. Successful writes
/// are not rolled back; the merge can be retried because every step checks
/// current state rather than assuming a pristine starting point.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartialFailureReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedStep>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedStep {
    pub step: String,
    pub error: String,
}

impl PartialFailureReport {
    fn record(&mut self, step: String, result: Result<(), StoreError>) {
        match result {
            Ok(()) => self.succeeded.push(step),
            Err(err) => self.failed.push(FailedStep {
                step,
                error: err.to_string(),
            }),
        }
    }
}

impl fmt::Display for PartialFailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} merge steps failed: ",
            self.failed.len(),
            self.failed.len() + self.succeeded.len()
        )?;
        let mut first = true;
        for failure in &self.failed {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{} ({})", failure.step, failure.error)?;
            first = false;
        }
        Ok(())
    }
}

/// Operator decision for one listing under review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveDecision {
    Unique,
    Duplicate,
    Review,
}

impl ResolveDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveDecision::Unique => "unique",
            ResolveDecision::Duplicate => "duplicate",
            ResolveDecision::Review => "review",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unique" => Some(ResolveDecision::Unique),
            "duplicate" => Some(ResolveDecision::Duplicate),
            "review" => Some(ResolveDecision::Review),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Similarity scorer
// ---------------------------------------------------------------------------

/// Term weights of the additive heuristic. The defaults sum to 100.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub location: f64,
    pub price: f64,
    pub area: f64,
    pub bedrooms: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            location: 30.0,
            price: 30.0,
            area: 20.0,
            bedrooms: 20.0,
        }
    }
}

/// Per-dimension contribution of one comparison; the review tooling shows
/// these next to the total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub location: f64,
    pub price: f64,
    pub area: f64,
    pub bedrooms: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> i32 {
        (self.location + self.price + self.area + self.bedrooms).round() as i32
    }
}

fn location_tokens(text: &str) -> Vec<String> {
    text.split_whitespace().map(|t| t.to_lowercase()).collect()
}

/// Heuristic similarity in [0, 100]. Deterministic for a given pair in
/// either role order; an ordinal ranking signal, not a calibrated
/// probability.
pub fn score(a: &Listing, b: &Listing) -> i32 {
    score_breakdown(a, b, &ScoreWeights::default()).total()
}

pub fn score_breakdown(a: &Listing, b: &Listing, weights: &ScoreWeights) -> ScoreBreakdown {
    let mut breakdown = ScoreBreakdown::default();

    if let (Some(loc_a), Some(loc_b)) = (a.location_text.as_deref(), b.location_text.as_deref()) {
        let tokens_a = location_tokens(loc_a);
        let tokens_b = location_tokens(loc_b);
        let longest = tokens_a.len().max(tokens_b.len());
        if longest > 0 {
            let common = tokens_a.iter().filter(|t| tokens_b.contains(t)).count();
            breakdown.location = (common as f64 / longest as f64) * weights.location;
        }
    }

    if let (Some(price_a), Some(price_b)) = (a.price, b.price) {
        if price_a > 0.0 {
            let diff = (price_a - price_b).abs();
            breakdown.price = (weights.price - (diff / price_a) * 100.0).max(0.0);
        }
    }

    if let (Some(area_a), Some(area_b)) = (a.area_sqm, b.area_sqm) {
        if area_a > 0.0 {
            let diff = (area_a - area_b).abs();
            breakdown.area = (weights.area - (diff / area_a) * 100.0).max(0.0);
        }
    }

    if let (Some(bed_a), Some(bed_b)) = (a.bedrooms, b.bedrooms) {
        if bed_a == bed_b {
            breakdown.bedrooms = weights.bedrooms;
        }
    }

    breakdown
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateMatch {
    pub listing: Listing,
    pub score: i32,
    pub breakdown: ScoreBreakdown,
}

// ---------------------------------------------------------------------------
// Merge policy
// ---------------------------------------------------------------------------

/// Chooses the surviving field values when N listings collapse into one.
/// Swappable without touching merge orchestration.
pub trait MergePolicy: Send + Sync {
    fn merged_fields(&self, keep: &Listing, merged: &[&Listing]) -> MergedFields;
}

/// Default policy: longer non-null description wins, earliest non-null
/// first-seen wins, higher price wins.
#[derive(Debug, Default)]
pub struct BetterValueWins;

impl MergePolicy for BetterValueWins {
    fn merged_fields(&self, keep: &Listing, merged: &[&Listing]) -> MergedFields {
        let mut description = keep.description.clone();
        let mut first_seen_at = keep.first_seen_at;
        let mut price = keep.price;

        for other in merged {
            if let Some(candidate) = &other.description {
                let longer = description
                    .as_ref()
                    .map_or(true, |current| candidate.len() > current.len());
                if longer {
                    description = Some(candidate.clone());
                }
            }
            if other.first_seen_at < first_seen_at {
                first_seen_at = other.first_seen_at;
            }
            if let Some(candidate) = other.price {
                if price.map_or(true, |current| candidate > current) {
                    price = Some(candidate);
                }
            }
        }

        MergedFields {
            description,
            first_seen_at,
            price,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MergeOutcome {
    pub master_id: Uuid,
    pub merged_count: usize,
}

// ---------------------------------------------------------------------------
// Ingestion gate
// ---------------------------------------------------------------------------

/// Outcome of the pre-insert duplicate check. A skip always names the
/// listing it collided with; the caller surfaces it to the operator.
#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub is_duplicate: bool,
    pub matched_listing_id: Option<Uuid>,
    pub reason: Option<String>,
}

impl GateDecision {
    fn pass() -> Self {
        Self {
            is_duplicate: false,
            matched_listing_id: None,
            reason: None,
        }
    }

    fn skip(matched: Uuid, reason: String) -> Self {
        Self {
            is_duplicate: true,
            matched_listing_id: Some(matched),
            reason: Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct DedupEngine {
    store: Arc<dyn ListingStore>,
    weights: ScoreWeights,
    policy: Box<dyn MergePolicy>,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self {
            store,
            weights: ScoreWeights::default(),
            policy: Box::new(BetterValueWins),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn MergePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    /// Plausible duplicates of one listing, most-similar first, capped at
    /// [`CANDIDATE_LIMIT`]. Read-only and idempotent.
    ///
    /// With neither price nor bedrooms known the pre-filter cannot narrow
    /// the pool, so it degrades to a recency-capped sweep scored on location
    /// alone; an empty result is expected there, not an error.
    pub async fn find_candidates(
        &self,
        listing_id: Uuid,
    ) -> Result<Vec<CandidateMatch>, DedupError> {
        let listing = self
            .store
            .get(listing_id)
            .await?
            .ok_or(DedupError::NotFound(listing_id))?;

        let filter = CandidateFilter {
            exclude_id: listing_id,
            bedrooms: listing.bedrooms,
            price_range: listing
                .price
                .map(|p| (p * (1.0 - PRICE_BAND), p * (1.0 + PRICE_BAND))),
            area_range: listing
                .area_sqm
                .map(|a| (a * (1.0 - AREA_BAND), a * (1.0 + AREA_BAND))),
            limit: CANDIDATE_POOL_LIMIT,
        };

        let pool = self.store.candidate_pool(&filter).await?;
        let mut matches: Vec<CandidateMatch> = pool
            .into_iter()
            .map(|candidate| {
                let breakdown = score_breakdown(&listing, &candidate, &self.weights);
                CandidateMatch {
                    score: breakdown.total(),
                    breakdown,
                    listing: candidate,
                }
            })
            .filter(|m| m.score > INTEREST_THRESHOLD)
            .collect();

        // Stable sort keeps the pool's recency order for equal scores.
        matches.sort_by(|a, b| b.score.cmp(&a.score));
        matches.truncate(CANDIDATE_LIMIT);
        Ok(matches)
    }

    /// Operator-driven terminal decision for one listing. Validation happens
    /// before any write; re-running with the same arguments is idempotent.
    pub async fn resolve(
        &self,
        listing_id: Uuid,
        decision: ResolveDecision,
        master_listing_id: Option<Uuid>,
    ) -> Result<Listing, DedupError> {
        let current = self
            .store
            .get(listing_id)
            .await?
            .ok_or(DedupError::NotFound(listing_id))?;

        let updated = match decision {
            ResolveDecision::Unique => {
                self.store
                    .set_duplicate_marks(listing_id, Some(DuplicateStatus::Unique), None, None)
                    .await?
            }
            ResolveDecision::Review => {
                self.store
                    .set_duplicate_marks(
                        listing_id,
                        Some(DuplicateStatus::Review),
                        current.duplicate_score,
                        current.master_listing_id,
                    )
                    .await?
            }
            ResolveDecision::Duplicate => {
                let master_id = master_listing_id.ok_or_else(|| {
                    DedupError::Validation(
                        "decision 'duplicate' requires master_listing_id".to_string(),
                    )
                })?;
                if master_id == listing_id {
                    return Err(DedupError::Validation(
                        "a listing cannot be its own master".to_string(),
                    ));
                }
                let master = self
                    .store
                    .get(master_id)
                    .await?
                    .ok_or(DedupError::NotFound(master_id))?;
                let updated = self
                    .store
                    .set_duplicate_marks(
                        listing_id,
                        Some(DuplicateStatus::Duplicate),
                        Some(MANUAL_RESOLVE_SCORE),
                        Some(master_id),
                    )
                    .await?;
                // Promote the referenced master whatever its prior state;
                // at-least-once and safe to repeat.
                if master.duplicate_status != Some(DuplicateStatus::Master) {
                    self.store
                        .set_duplicate_marks(master_id, Some(DuplicateStatus::Master), None, None)
                        .await?;
                }
                updated
            }
        };

        info!(
            listing_id = %listing_id,
            decision = decision.as_str(),
            "resolved duplicate status"
        );
        Ok(updated)
    }

    /// Collapse `merge_ids` into `keep_id`. Everything is validated and
    /// loaded before the first write; after that, sub-operation failures are
    /// collected into a [`PartialFailureReport`] instead of rolling back.
    pub async fn merge(
        &self,
        keep_id: Uuid,
        merge_ids: &[Uuid],
    ) -> Result<MergeOutcome, DedupError> {
        let mut merge_ids: Vec<Uuid> = merge_ids
            .iter()
            .copied()
            .filter(|id| *id != keep_id)
            .collect();
        merge_ids.sort();
        merge_ids.dedup();
        if merge_ids.is_empty() {
            return Err(DedupError::Validation(
                "merge requires at least one listing besides the one kept".to_string(),
            ));
        }

        let mut all_ids = merge_ids.clone();
        all_ids.push(keep_id);
        let loaded = self.store.get_many(&all_ids).await?;
        let by_id: HashMap<Uuid, &Listing> = loaded.iter().map(|l| (l.id, l)).collect();
        for id in &all_ids {
            if !by_id.contains_key(id) {
                return Err(DedupError::NotFound(*id));
            }
        }
        let keep = by_id[&keep_id];
        let merged: Vec<&Listing> = merge_ids.iter().map(|id| by_id[id]).collect();

        let fields = self.policy.merged_fields(keep, &merged);

        let mut report = PartialFailureReport::default();

        // Parent statuses go out as one concurrent batch; there is no
        // multi-table atomicity here and the report reflects that.
        let master_step = async {
            self.store.apply_merged_fields(keep_id, &fields).await?;
            self.store
                .set_duplicate_marks(keep_id, Some(DuplicateStatus::Master), None, None)
                .await
                .map(|_| ())
        };
        let duplicate_steps = merge_ids.iter().map(|id| {
            let store = Arc::clone(&self.store);
            async move {
                store
                    .set_duplicate_marks(
                        *id,
                        Some(DuplicateStatus::Duplicate),
                        Some(MANUAL_MERGE_SCORE),
                        Some(keep_id),
                    )
                    .await
                    .map(|_| ())
            }
        });

        let (master_result, duplicate_results) =
            futures::join!(master_step, join_all(duplicate_steps));
        report.record(format!("master:{keep_id}"), master_result);
        for (id, result) in merge_ids.iter().zip(duplicate_results) {
            report.record(format!("duplicate:{id}"), result);
        }

        report.record(
            "images".to_string(),
            self.reparent_images(keep_id, &all_ids).await,
        );

        if report.failed.is_empty() {
            info!(
                master_id = %keep_id,
                merged_count = merge_ids.len(),
                "merge complete"
            );
            Ok(MergeOutcome {
                master_id: keep_id,
                merged_count: merge_ids.len(),
            })
        } else {
            Err(DedupError::Partial(report))
        }
    }

    /// Move every image from the merged set onto the keep listing,
    /// deduplicated by URL, ordering continued after the keep listing's own
    /// images. The keep listing's primary flag is never touched.
    async fn reparent_images(&self, keep_id: Uuid, all_ids: &[Uuid]) -> Result<(), StoreError> {
        let images = self.store.images_for(all_ids).await?;
        let (keep_images, other_images): (Vec<_>, Vec<_>) =
            images.into_iter().partition(|img| img.listing_id == keep_id);

        let mut seen_urls: Vec<String> =
            keep_images.iter().map(|img| img.image_url.clone()).collect();
        let mut next_order = keep_images
            .iter()
            .map(|img| img.image_order)
            .max()
            .map_or(0, |max| max + 1);

        let mut transfers = Vec::new();
        for image in other_images {
            if seen_urls.contains(&image.image_url) {
                continue;
            }
            seen_urls.push(image.image_url.clone());
            transfers.push(ListingImage {
                id: Uuid::new_v4(),
                listing_id: keep_id,
                image_url: image.image_url,
                image_order: next_order,
                is_primary: false,
            });
            next_order += 1;
        }

        self.store.insert_images(transfers).await
    }

    /// Pre-insert duplicate check for drafts arriving through the
    /// manually-parsed social path. Read-only.
    pub async fn check_ingestion_duplicate(
        &self,
        draft: &ListingDraft,
    ) -> Result<GateDecision, DedupError> {
        // Without a price there is nothing to exact-match against.
        let Some(price) = draft.price else {
            return Ok(GateDecision::pass());
        };

        let phone = draft.phone_normalized();
        if let Some(phone) = &phone {
            let matches = self
                .store
                .gate_matches(&GateProbe {
                    price,
                    bedrooms: draft.bedrooms,
                    source_platform: draft.source_platform,
                    phone_normalized: Some(phone.clone()),
                })
                .await?;
            if let Some(hit) = matches.first() {
                let decision = GateDecision::skip(
                    hit.id,
                    format!(
                        "active {} listing {} has the same price, bedrooms and contact phone",
                        hit.source_platform.as_str(),
                        hit.id
                    ),
                );
                info!(matched = %hit.id, "ingestion gate: phone match");
                return Ok(decision);
            }
        }

        let Some(city) = draft.city() else {
            return Ok(GateDecision::pass());
        };
        let matches = self
            .store
            .gate_matches(&GateProbe {
                price,
                bedrooms: draft.bedrooms,
                source_platform: draft.source_platform,
                phone_normalized: None,
            })
            .await?;
        if matches.is_empty() {
            return Ok(GateDecision::pass());
        }

        let ids: Vec<Uuid> = matches.iter().map(|l| l.id).collect();
        let cities: HashMap<Uuid, String> = self
            .store
            .locations_for(&ids)
            .await?
            .into_iter()
            .filter_map(|loc| loc.city.map(|city| (loc.listing_id, city)))
            .collect();

        for hit in &matches {
            if let Some(stored_city) = cities.get(&hit.id) {
                if stored_city.eq_ignore_ascii_case(&city) {
                    let decision = GateDecision::skip(
                        hit.id,
                        format!(
                            "active {} listing {} has the same price, bedrooms and city {}",
                            hit.source_platform.as_str(),
                            hit.id,
                            stored_city
                        ),
                    );
                    info!(matched = %hit.id, "ingestion gate: city match");
                    return Ok(decision);
                }
            }
        }

        Ok(GateDecision::pass())
    }

    /// All listings confirmed as duplicates, newest decision first.
    pub async fn confirmed_duplicates(&self) -> Result<Vec<Listing>, DedupError> {
        Ok(self.store.confirmed_duplicates().await?)
    }

    /// Hard-delete every confirmed duplicate and its child rows. Masters are
    /// never touched, so no dangling `master_listing_id` can point at a
    /// removed master through this path.
    pub async fn purge_confirmed_duplicates(&self) -> Result<u64, DedupError> {
        let duplicates = self.store.confirmed_duplicates().await?;
        let ids: Vec<Uuid> = duplicates.iter().map(|l| l.id).collect();
        let deleted = self.store.purge_listings(&ids).await?;
        info!(deleted, "purged confirmed duplicates");
        Ok(deleted)
    }
}
