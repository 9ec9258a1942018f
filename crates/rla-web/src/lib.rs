//! Axum JSON surface for the duplicate engine. Handlers stay thin: parse the
//! request, call one engine operation, translate the result.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rla_core::ListingDraft;
use rla_dedup::{DedupEngine, DedupError, ResolveDecision};
use rla_ingest::{IngestError, IngestPipeline};
use rla_storage::{ListingStore, PgListingStore};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rla-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DedupEngine>,
    pub ingest: Arc<IngestPipeline>,
}

impl AppState {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self {
            engine: Arc::new(DedupEngine::new(Arc::clone(&store))),
            ingest: Arc::new(IngestPipeline::new(store)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    decision: String,
    master_listing_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct MergeBody {
    keep_id: Uuid,
    merge_ids: Vec<Uuid>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/listings/{id}/candidates", get(candidates_handler))
        .route("/listings/{id}/resolve", post(resolve_handler))
        .route("/listings/merge", post(merge_handler))
        .route("/ingest/check", post(ingest_check_handler))
        .route("/ingest/portal", post(ingest_portal_handler))
        .route("/ingest/social", post(ingest_social_handler))
        .route(
            "/duplicates",
            get(duplicates_handler).delete(purge_duplicates_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("RLA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let store = PgListingStore::connect_from_env().await?;
    let state = AppState::new(Arc::new(store));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving duplicate engine API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn candidates_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.engine.find_candidates(id).await {
        Ok(candidates) => Json(json!({ "candidates": candidates })).into_response(),
        Err(err) => dedup_error_response(err),
    }
}

async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<ResolveBody>,
) -> Response {
    let Some(decision) = ResolveDecision::parse(&body.decision) else {
        return validation_response(format!("invalid decision {:?}", body.decision));
    };
    match state.engine.resolve(id, decision, body.master_listing_id).await {
        Ok(listing) => Json(json!({ "listing": listing })).into_response(),
        Err(err) => dedup_error_response(err),
    }
}

async fn merge_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MergeBody>,
) -> Response {
    match state.engine.merge(body.keep_id, &body.merge_ids).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => dedup_error_response(err),
    }
}

async fn ingest_check_handler(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<ListingDraft>,
) -> Response {
    match state.engine.check_ingestion_duplicate(&draft).await {
        Ok(decision) => Json(decision).into_response(),
        Err(err) => dedup_error_response(err),
    }
}

async fn ingest_portal_handler(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<ListingDraft>,
) -> Response {
    match state.ingest.ingest_portal(&draft).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => ingest_error_response(err),
    }
}

async fn ingest_social_handler(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<ListingDraft>,
) -> Response {
    match state.ingest.ingest_social(&draft).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => ingest_error_response(err),
    }
}

async fn duplicates_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.confirmed_duplicates().await {
        Ok(duplicates) => Json(json!({
            "count": duplicates.len(),
            "duplicates": duplicates,
        }))
        .into_response(),
        Err(err) => dedup_error_response(err),
    }
}

async fn purge_duplicates_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.purge_confirmed_duplicates().await {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(err) => dedup_error_response(err),
    }
}

fn validation_response(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message })),
    )
        .into_response()
}

fn dedup_error_response(err: DedupError) -> Response {
    match err {
        DedupError::Validation(message) => validation_response(message),
        DedupError::NotFound(id) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("listing {id} not found") })),
        )
            .into_response(),
        DedupError::Partial(report) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": report.to_string(),
                "report": report,
            })),
        )
            .into_response(),
        DedupError::Store(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

fn ingest_error_response(err: IngestError) -> Response {
    match err {
        IngestError::Validation(message) => validation_response(message),
        IngestError::Dedup(err) => dedup_error_response(err),
        IngestError::Store(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use rla_core::{DuplicateStatus, Listing, ListingType, SourcePlatform};
    use rla_storage::MemoryListingStore;
    use tower::ServiceExt;

    fn listing(price: f64, bedrooms: i32, location: &str) -> Listing {
        let now = Utc::now();
        Listing {
            id: Uuid::new_v4(),
            source_platform: SourcePlatform::Social,
            source_id: None,
            source_url: None,
            title: "apartment".into(),
            description: None,
            price: Some(price),
            currency: "ILS".into(),
            bedrooms: Some(bedrooms),
            bathrooms: None,
            area_sqm: None,
            listing_type: ListingType::Rent,
            property_type: None,
            available_from: None,
            is_active: true,
            location_text: Some(location.to_string()),
            phone_normalized: None,
            duplicate_status: None,
            duplicate_score: None,
            master_listing_id: None,
            first_seen_at: now,
            last_seen_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    async fn app_with(listings: Vec<Listing>) -> Router {
        let store = Arc::new(MemoryListingStore::new());
        for l in listings {
            store.insert_full(l, None, vec![], None).await.unwrap();
        }
        app(AppState::new(store))
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn candidates_handler_returns_scored_matches() {
        let a = listing(5000.0, 3, "Tel Aviv, Florentin");
        let b = listing(5100.0, 3, "Tel Aviv, Florentin");
        let app = app_with(vec![a.clone(), b.clone()]).await;

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/listings/{}/candidates", a.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let candidates = body["candidates"].as_array().unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0]["score"].as_i64().unwrap() >= 70);
    }

    #[tokio::test]
    async fn candidates_handler_404s_on_unknown_listing() {
        let app = app_with(vec![]).await;
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/listings/{}/candidates", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn resolve_handler_rejects_unknown_decision() {
        let a = listing(5000.0, 3, "Modiin");
        let app = app_with(vec![a.clone()]).await;

        let resp = app
            .oneshot(json_request(
                "POST",
                &format!("/listings/{}/resolve", a.id),
                json!({ "decision": "merge" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn resolve_handler_marks_duplicate_and_promotes_master() {
        let a = listing(5000.0, 3, "Modiin");
        let master = listing(5050.0, 3, "Modiin");
        let app = app_with(vec![a.clone(), master.clone()]).await;

        let resp = app
            .oneshot(json_request(
                "POST",
                &format!("/listings/{}/resolve", a.id),
                json!({ "decision": "duplicate", "master_listing_id": master.id }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["listing"]["duplicate_status"], "duplicate");
        assert_eq!(
            body["listing"]["master_listing_id"],
            json!(master.id.to_string())
        );
    }

    #[tokio::test]
    async fn merge_handler_reports_outcome() {
        let keep = listing(5000.0, 3, "Modiin");
        let other = listing(5100.0, 3, "Modiin");
        let app = app_with(vec![keep.clone(), other.clone()]).await;

        let resp = app
            .oneshot(json_request(
                "POST",
                "/listings/merge",
                json!({ "keep_id": keep.id, "merge_ids": [other.id] }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["master_id"], json!(keep.id.to_string()));
        assert_eq!(body["merged_count"], 1);
    }

    #[tokio::test]
    async fn merge_handler_404s_on_missing_ids() {
        let keep = listing(5000.0, 3, "Modiin");
        let app = app_with(vec![keep.clone()]).await;

        let resp = app
            .oneshot(json_request(
                "POST",
                "/listings/merge",
                json!({ "keep_id": keep.id, "merge_ids": [Uuid::new_v4()] }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ingest_check_handler_flags_duplicates() {
        let mut existing = listing(5000.0, 2, "Modiin, Center");
        existing.phone_normalized = Some("501234567".into());
        let app = app_with(vec![existing.clone()]).await;

        let draft = json!({
            "source_platform": "social",
            "title": "apartment",
            "listing_type": "rent",
            "price": 5000.0,
            "bedrooms": 2,
            "location_text": "Modiin",
            "contact_phone": "0501234567",
        });
        let resp = app
            .oneshot(json_request("POST", "/ingest/check", draft))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["is_duplicate"], true);
        assert_eq!(
            body["matched_listing_id"],
            json!(existing.id.to_string())
        );
    }

    #[tokio::test]
    async fn duplicates_listing_and_purge_round_trip() {
        let mut dup = listing(5000.0, 3, "Modiin");
        dup.duplicate_status = Some(DuplicateStatus::Duplicate);
        dup.master_listing_id = Some(Uuid::new_v4());
        let app = app_with(vec![dup]).await;

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/duplicates").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["count"], 1);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/duplicates")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["deleted"], 1);
    }
}
