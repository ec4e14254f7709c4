use super::{ApiError, ApiResult, AppState};
use crate::db::models::event_models::{DetectionEvent, EventFilter, Pagination, SortField};
use crate::services::settings::RetentionSettings;
use crate::store::QualityListing;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

const DEFAULT_LIMIT: u32 = 100;

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/api/events", get(list_events))
        .route("/api/events/enhanced", get(search_events))
        .route("/api/events/high-quality", get(high_quality_events))
        .route("/api/events/low-quality", get(low_quality_events))
        .route("/api/events/:id/full-image", get(event_full_image))
        .route(
            "/api/quality-threshold",
            get(get_quality_threshold).post(set_quality_threshold),
        )
        .route(
            "/api/settings/retention",
            get(get_retention).put(set_retention),
        )
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<DetectionEvent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
    pub matched: Option<String>,
    pub camera_id: Option<String>,
}

/// `1`, `true` and `True` select matched events; `0` and `false` unmatched
fn parse_matched(raw: Option<&str>) -> ApiResult<Option<bool>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) if matches!(v.to_ascii_lowercase().as_str(), "1" | "true") => Ok(Some(true)),
        Some(v) if matches!(v.to_ascii_lowercase().as_str(), "0" | "false") => Ok(Some(false)),
        Some(v) => Err(ApiError::bad_request(format!("Invalid matched: {}", v))),
    }
}

async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<EventsResponse>> {
    let matched = parse_matched(params.matched.as_deref())?;
    let events = state
        .store
        .list(
            params.limit.unwrap_or(DEFAULT_LIMIT),
            matched,
            params.camera_id.filter(|id| !id.is_empty()),
        )
        .await?;
    Ok(Json(EventsResponse { events }))
}

/// Query of `/api/events/enhanced`; list parameters may repeat
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub limit: Option<u32>,
    pub page: Option<u32>,
    #[serde(default, rename = "camera_id")]
    pub camera_ids: Vec<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub last_hours: Option<f64>,
    #[serde(default)]
    pub matched_only: bool,
    pub confidence_min: Option<f32>,
    pub confidence_max: Option<f32>,
    pub person_name: Option<String>,
    pub min_quality: Option<f32>,
    #[serde(default)]
    pub exclude_low_quality: bool,
    pub min_face_size: Option<i64>,
    pub age_min: Option<i64>,
    pub age_max: Option<i64>,
    pub gender: Option<String>,
    #[serde(default, rename = "alert_level")]
    pub alert_levels: Vec<String>,
    #[serde(default, rename = "event_type")]
    pub event_types: Vec<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub events: Vec<DetectionEvent>,
    pub pagination: Pagination,
    pub filters_applied: EventFilter,
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS` read as UTC
fn parse_date(name: &str, raw: &str) -> ApiResult<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc).timestamp_millis());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc().timestamp_millis())
        .map_err(|_| ApiError::bad_request(format!("Invalid {}: {}", name, raw)))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Translate query parameters into an event filter; `now` anchors `last_hours`
pub fn build_filter(params: SearchParams, now: DateTime<Utc>) -> ApiResult<EventFilter> {
    let mut start_ts = params
        .start_date
        .as_deref()
        .map(|raw| parse_date("start_date", raw))
        .transpose()?;
    let end_ts = params
        .end_date
        .as_deref()
        .map(|raw| parse_date("end_date", raw))
        .transpose()?;

    if let Some(hours) = params.last_hours {
        if !hours.is_finite() || hours <= 0.0 {
            return Err(ApiError::bad_request(format!("Invalid last_hours: {}", hours)));
        }
        let since = now.timestamp_millis() - (hours * 3_600_000.0) as i64;
        start_ts = Some(start_ts.map_or(since, |start| start.max(since)));
    }

    let sort_by = match params.sort_by.as_deref() {
        None | Some("") => SortField::default(),
        Some(raw) => SortField::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("Invalid sort_by: {}", raw)))?,
    };
    let descending = match params.sort_order.as_deref().map(str::to_ascii_lowercase) {
        None => true,
        Some(order) if order == "desc" => true,
        Some(order) if order == "asc" => false,
        Some(order) => {
            return Err(ApiError::bad_request(format!("Invalid sort_order: {}", order)))
        }
    };

    Ok(EventFilter {
        camera_ids: params
            .camera_ids
            .into_iter()
            .filter(|id| !id.is_empty())
            .collect(),
        start_ts,
        end_ts,
        matched: params.matched_only.then_some(true),
        confidence_min: params.confidence_min,
        confidence_max: params.confidence_max,
        quality_min: params.min_quality,
        quality_below: None,
        exclude_low_quality: params.exclude_low_quality,
        min_face_size: params.min_face_size,
        person_name: non_empty(params.person_name),
        age_min: params.age_min,
        age_max: params.age_max,
        gender: non_empty(params.gender),
        alert_levels: params.alert_levels,
        event_types: params.event_types,
        sort_by,
        descending,
    })
}

async fn search_events(
    State(state): State<AppState>,
    axum_extra::extract::Query(params): axum_extra::extract::Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    let page = params.page.unwrap_or(1);
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    let filter = build_filter(params, Utc::now())?;

    let result = state.store.query(&filter, page, limit).await?;
    Ok(Json(SearchResponse {
        events: result.events,
        pagination: result.pagination,
        filters_applied: filter,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct QualityParams {
    pub limit: Option<u32>,
    pub threshold: Option<f32>,
    pub matched: Option<String>,
    pub camera_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QualityEventsResponse {
    pub events: Vec<DetectionEvent>,
    pub threshold: f32,
}

async fn quality_events(
    state: &AppState,
    high: bool,
    params: QualityParams,
) -> ApiResult<Json<QualityEventsResponse>> {
    if let Some(threshold) = params.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ApiError::bad_request(format!(
                "threshold must be between 0 and 1, got {}",
                threshold
            )));
        }
    }

    let listing = QualityListing {
        threshold: params.threshold,
        matched: parse_matched(params.matched.as_deref())?,
        camera_id: params.camera_id.filter(|id| !id.is_empty()),
        limit: params.limit.unwrap_or(DEFAULT_LIMIT),
    };
    let (events, threshold) = state.store.by_quality(high, listing).await?;
    Ok(Json(QualityEventsResponse { events, threshold }))
}

async fn high_quality_events(
    State(state): State<AppState>,
    Query(params): Query<QualityParams>,
) -> ApiResult<Json<QualityEventsResponse>> {
    quality_events(&state, true, params).await
}

async fn low_quality_events(
    State(state): State<AppState>,
    Query(params): Query<QualityParams>,
) -> ApiResult<Json<QualityEventsResponse>> {
    quality_events(&state, false, params).await
}

async fn event_full_image(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let jpeg = state.store.full_image(id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        jpeg,
    )
        .into_response())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThresholdRequest {
    pub threshold: f32,
}

#[derive(Debug, Serialize)]
pub struct ThresholdResponse {
    pub threshold: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

async fn get_quality_threshold(State(state): State<AppState>) -> Json<ThresholdResponse> {
    Json(ThresholdResponse {
        threshold: state.settings.quality_threshold(),
        success: None,
    })
}

async fn set_quality_threshold(
    State(state): State<AppState>,
    Json(request): Json<ThresholdRequest>,
) -> ApiResult<Json<ThresholdResponse>> {
    let threshold = state.settings.set_quality_threshold(request.threshold).await?;
    Ok(Json(ThresholdResponse {
        threshold,
        success: Some(true),
    }))
}

async fn get_retention(State(state): State<AppState>) -> Json<RetentionSettings> {
    Json(state.settings.retention())
}

async fn set_retention(
    State(state): State<AppState>,
    Json(retention): Json<RetentionSettings>,
) -> ApiResult<Json<RetentionSettings>> {
    let retention = state.settings.set_retention(retention).await?;
    info!("Retention changed through the API");
    Ok(Json(retention))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::rest::testing::{body_bytes, test_app};
    use crate::recognition::{BBox, FaceCandidate, QualityReport, Verdict};
    use crate::store::FaceObservation;
    use axum::http::StatusCode;
    use chrono::TimeZone;
    use image::RgbImage;
    use std::sync::Arc;

    fn observation(camera_id: &str, ts: i64, quality: f32, matched: bool) -> FaceObservation {
        FaceObservation {
            camera_id: camera_id.to_string(),
            ts,
            frame_number: None,
            candidate: FaceCandidate {
                bbox: BBox::new(40, 40, 140, 160),
                det_score: 0.9,
                embedding: vec![1.0, 0.0],
                quality: QualityReport {
                    score: quality,
                    ..QualityReport::default()
                },
                age: None,
                gender: None,
            },
            verdict: Verdict {
                matched,
                person_id: matched.then_some(1),
                person_name: matched.then(|| "Alice".to_string()),
                similarity: if matched { 0.8 } else { 0.3 },
            },
            processing_time_ms: 5.0,
        }
    }

    async fn record(app: &AppState, camera_id: &str, ts: i64, quality: f32, matched: bool) -> i64 {
        app.store
            .record(
                Arc::new(RgbImage::new(320, 240)),
                observation(camera_id, ts, quality, matched),
            )
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn high_quality_uses_the_requested_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        for (i, quality) in [0.3, 0.5, 0.8].into_iter().enumerate() {
            record(&app.state, "cam-1", 1_000 + i as i64, quality, false).await;
        }

        let params = QualityParams {
            threshold: Some(0.6),
            ..QualityParams::default()
        };
        let Json(high) = high_quality_events(State(app.state.clone()), Query(params))
            .await
            .unwrap();
        assert_eq!(high.threshold, 0.6);
        assert_eq!(high.events.len(), 1);
        assert!((high.events[0].quality_score - 0.8).abs() < 1e-6);

        let params = QualityParams {
            threshold: Some(0.6),
            ..QualityParams::default()
        };
        let Json(low) = low_quality_events(State(app.state.clone()), Query(params))
            .await
            .unwrap();
        assert_eq!(low.events.len(), 2);

        let params = QualityParams {
            threshold: Some(1.5),
            ..QualityParams::default()
        };
        let err = high_quality_events(State(app.state.clone()), Query(params))
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn simple_list_filters_by_match_and_camera() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        record(&app.state, "cam-1", 1_000, 0.7, true).await;
        record(&app.state, "cam-1", 2_000, 0.7, false).await;
        record(&app.state, "cam-2", 3_000, 0.7, true).await;

        let params = ListParams {
            matched: Some("True".to_string()),
            camera_id: Some("cam-1".to_string()),
            ..ListParams::default()
        };
        let Json(list) = list_events(State(app.state.clone()), Query(params))
            .await
            .unwrap();
        assert_eq!(list.events.len(), 1);
        assert_eq!(list.events[0].ts, 1_000);

        let Json(all) = list_events(State(app.state.clone()), Query(ListParams::default()))
            .await
            .unwrap();
        assert_eq!(all.events.len(), 3);
        assert_eq!(all.events[0].ts, 3_000);
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn enhanced_search_pages_and_reports_filters() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        for ts in 1..=5 {
            record(&app.state, "cam-1", ts * 1_000, 0.2 * ts as f32, ts % 2 == 0).await;
        }

        let params = SearchParams {
            limit: Some(2),
            page: Some(1),
            sort_by: Some("quality_score".to_string()),
            sort_order: Some("asc".to_string()),
            ..SearchParams::default()
        };
        let Json(page) = search_events(
            State(app.state.clone()),
            axum_extra::extract::Query(params),
        )
        .await
        .unwrap();
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].ts, 1_000);
        assert_eq!(page.pagination.total_count, 5);
        assert!(page.pagination.has_next);
        assert_eq!(page.filters_applied.sort_by, SortField::QualityScore);

        let params = SearchParams {
            matched_only: true,
            ..SearchParams::default()
        };
        let Json(matched) = search_events(
            State(app.state.clone()),
            axum_extra::extract::Query(params),
        )
        .await
        .unwrap();
        assert_eq!(matched.events.len(), 2);
        assert!(matched.events.iter().all(|e| e.matched));
        app.state.jobs.shutdown().await;
    }

    #[test]
    fn filter_rejects_unknown_sort_and_dates() {
        let now = Utc::now();
        let params = SearchParams {
            sort_by: Some("ts; DROP TABLE events".to_string()),
            ..SearchParams::default()
        };
        assert_eq!(build_filter(params, now).unwrap_err().status, 400);

        let params = SearchParams {
            start_date: Some("yesterday".to_string()),
            ..SearchParams::default()
        };
        assert_eq!(build_filter(params, now).unwrap_err().status, 400);

        let params = SearchParams {
            sort_order: Some("sideways".to_string()),
            ..SearchParams::default()
        };
        assert_eq!(build_filter(params, now).unwrap_err().status, 400);
    }

    #[test]
    fn last_hours_tightens_the_start_bound() {
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();

        let params = SearchParams {
            start_date: Some("2024-05-01T00:00:00".to_string()),
            end_date: Some("2024-05-02T11:00:00Z".to_string()),
            last_hours: Some(2.0),
            ..SearchParams::default()
        };
        let filter = build_filter(params, now).unwrap();
        let two_hours_ago = Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap();
        assert_eq!(filter.start_ts, Some(two_hours_ago.timestamp_millis()));
        assert_eq!(
            filter.end_ts,
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 11, 0, 0).unwrap().timestamp_millis())
        );
        assert!(filter.descending);

        let params = SearchParams {
            start_date: Some("2024-05-02T11:30:00+00:00".to_string()),
            last_hours: Some(2.0),
            ..SearchParams::default()
        };
        let filter = build_filter(params, now).unwrap();
        assert_eq!(
            filter.start_ts,
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 11, 30, 0).unwrap().timestamp_millis())
        );
    }

    #[tokio::test]
    async fn full_image_is_a_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let id = record(&app.state, "cam-1", 1_000, 0.7, true).await;

        let response = event_full_image(State(app.state.clone()), Path(id))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        let bytes = body_bytes(response).await;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

        let err = event_full_image(State(app.state.clone()), Path(id + 100))
            .await
            .unwrap_err();
        assert_eq!(err.status, 404);
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;

        let Json(set) = set_quality_threshold(
            State(app.state.clone()),
            Json(ThresholdRequest { threshold: 0.55 }),
        )
        .await
        .unwrap();
        assert_eq!(set.success, Some(true));
        let Json(current) = get_quality_threshold(State(app.state.clone())).await;
        assert_eq!(current.threshold, 0.55);

        let err = set_quality_threshold(
            State(app.state.clone()),
            Json(ThresholdRequest { threshold: -0.1 }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, 400);

        let retention = RetentionSettings {
            matched_event_hours: 48,
            unmatched_event_hours: 6,
            matched_full_frame_hours: 0,
            unmatched_full_frame_hours: 1,
        };
        set_retention(State(app.state.clone()), Json(retention))
            .await
            .unwrap();
        let Json(stored) = get_retention(State(app.state.clone())).await;
        assert_eq!(stored, retention);
        app.state.jobs.shutdown().await;
    }
}
