use axum::{
    extract::{Path, Query, State},
    http::{
        header::{self, HeaderMap},
        StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::engine::AdServer;
use crate::models::{Ad, AdFormat, Creative, RequestContext};

/// Upper bound on ads served in one request.
const MAX_ADS_PER_REQUEST: usize = 10;

pub struct AppState {
    pub server: Arc<AdServer>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Deserialize)]
pub struct ServeQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Page route the placement renders on.
    pub page: Option<String>,
    /// Comma separated page category ids.
    pub category_id: Option<String>,
    /// Count an impression for every served ad. Disable when the page reports
    /// impressions itself.
    #[serde(default = "default_track")]
    pub track: bool,
}

fn default_limit() -> usize {
    1
}

fn default_track() -> bool {
    true
}

#[derive(Deserialize)]
pub struct ConversionRequest {
    #[serde(default)]
    pub value: f64,
}

#[derive(Serialize)]
pub struct ServedAd {
    pub id: i64,
    pub name: String,
    pub format: AdFormat,
    pub creative: Creative,
    pub click_url: String,
    pub open_in_new_tab: bool,
}

impl From<&Ad> for ServedAd {
    fn from(ad: &Ad) -> Self {
        ServedAd {
            id: ad.id,
            name: ad.name.clone(),
            format: ad.format,
            creative: ad.creative.clone(),
            click_url: format!("/ads/click/{}", ad.id),
            open_in_new_tab: ad.open_in_new_tab,
        }
    }
}

#[derive(Serialize)]
pub struct ServeResponse {
    pub placement: String,
    pub ads: Vec<ServedAd>,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Comma separated ids; anything that does not parse is skipped.
fn parse_ids(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

/// Build the selection context from headers set by the edge (geo, device,
/// visitor identity, segment membership).
fn request_context(headers: &HeaderMap) -> RequestContext {
    let mut ctx = RequestContext::new(Utc::now());
    ctx.country_code = header_value(headers, "x-country-code");
    ctx.device_type = header_value(headers, "x-device-type");
    ctx.user_id = header_value(headers, "x-user-id");
    ctx.session_id = header_value(headers, "x-session-id");
    ctx.segment_ids = header_value(headers, "x-segment-ids")
        .map(|raw| parse_ids(&raw).into_iter().collect::<HashSet<i64>>());
    ctx
}

pub async fn health_check() -> impl IntoResponse {
    #[derive(Serialize)]
    struct HealthResponse {
        status: String,
    }

    Json(HealthResponse {
        status: "OK".to_string(),
    })
}

/// Pick ads for a placement. 204 when there is nothing to show.
pub async fn serve_ads(
    State(state): State<Arc<AppState>>,
    Path(placement): Path<String>,
    Query(query): Query<ServeQuery>,
    headers: HeaderMap,
) -> Response {
    let mut ctx = request_context(&headers);
    ctx.page_route = query.page.filter(|page| !page.is_empty());
    ctx.page_category_ids = query
        .category_id
        .as_deref()
        .map(parse_ids)
        .unwrap_or_default();

    let limit = query.limit.clamp(1, MAX_ADS_PER_REQUEST);
    let ads = state.server.select_ads(&placement, limit, &ctx).await;
    if ads.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }

    if query.track {
        for ad in &ads {
            state.server.track_impression(ad.id, ctx.clone());
        }
    }

    Json(ServeResponse {
        placement,
        ads: ads.iter().map(|ad| ServedAd::from(ad.as_ref())).collect(),
    })
    .into_response()
}

/// Count an impression reported by the page. Always accepted; unknown ads
/// are dropped by the recorder.
pub async fn record_impression(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.server.track_impression(id, request_context(&headers));
    (StatusCode::ACCEPTED, Json(SuccessResponse { success: true }))
}

/// Count a click and send the visitor to the landing page.
pub async fn click_ad(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    match state.server.record_click(id, &request_context(&headers)).await {
        Some(redirect) => {
            let location = redirect.url.unwrap_or_else(|| "/".to_string());
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Ad not found".to_string(),
            }),
        )
            .into_response(),
    }
}

pub async fn record_conversion(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: Option<Json<ConversionRequest>>,
) -> Response {
    let value = payload.map(|Json(body)| body.value).unwrap_or(0.0);

    if state
        .server
        .record_conversion(id, value, &request_context(&headers))
        .await
    {
        Json(SuccessResponse { success: true }).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Ad not found".to_string(),
            }),
        )
            .into_response()
    }
}
