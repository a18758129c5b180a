//! REST surface over the orchestrator.

use std::time::Instant;

use axum::{
    Json, Router,
    extract::{FromRequestParts, MatchedPath, Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header::RETRY_AFTER, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};
use ulid::Ulid;

use crate::engine::{validate_window, EngineError};
use crate::model::{Booking, Room, RoomFilter, RoomStatus, Timestamp};
use crate::observability;
use crate::orchestrator::Orchestrator;

/// Header the upstream auth gateway stamps with the caller's user id.
pub const REQUESTER_HEADER: &str = "x-requester-id";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or malformed x-requester-id header")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Invalid(&'static str),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    /// On `/rooms/{id}` paths the room is the resource itself, so a missing
    /// one is a 404 rather than a bad reference in a body.
    fn room_path(e: EngineError) -> Self {
        match e {
            EngineError::RoomNotFound(id) => ApiError::NotFound(format!("room not found: {id}")),
            other => ApiError::Engine(other),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Engine(e) => match e {
                EngineError::InvalidInterval { .. }
                | EngineError::LimitExceeded(_)
                | EngineError::RoomNotFound(_)
                | EngineError::RoomInactive(_) => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::BookingNotFound(_) => StatusCode::NOT_FOUND,
                EngineError::Conflict(_)
                | EngineError::AlreadyCancelled(_)
                | EngineError::DuplicateId(_)
                | EngineError::RoomAlreadyExists(_)
                | EngineError::RoomHasBookings(_) => StatusCode::CONFLICT,
                EngineError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::Storage(_) | EngineError::Aborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        let mut body = json!({ "error": self.to_string() });
        if let ApiError::Engine(EngineError::Conflict(ids)) = &self {
            body["conflicting_booking_ids"] = json!(ids);
        }
        let mut response = (status, Json(body)).into_response();
        if let ApiError::Engine(EngineError::Busy(_)) = self {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// The authenticated caller, as vouched for by the gateway.
#[derive(Debug, Clone, Copy)]
pub struct Requester(pub Ulid);

impl<S: Send + Sync> FromRequestParts<S> for Requester {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(REQUESTER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<Ulid>().ok())
            .map(Requester)
            .ok_or(ApiError::Unauthorized)
    }
}

// ── Bodies ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateBooking {
    pub room_id: Ulid,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleBooking {
    #[serde(default)]
    pub room_id: Option<Ulid>,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub room_id: Ulid,
    pub start: Timestamp,
    pub end: Timestamp,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Availability {
    pub room_id: Ulid,
    pub start: Timestamp,
    pub end: Timestamp,
    pub available: bool,
    pub conflicting_booking_ids: Vec<Ulid>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

/// `GET /rooms` search. `equipment` is comma separated; every item must be
/// present.
#[derive(Debug, Default, Deserialize)]
pub struct RoomQuery {
    pub capacity: Option<u32>,
    pub location: Option<String>,
    pub equipment: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
}

impl From<RoomQuery> for RoomFilter {
    fn from(q: RoomQuery) -> Self {
        RoomFilter {
            min_capacity: q.capacity,
            location: q.location.filter(|l| !l.trim().is_empty()),
            equipment: q
                .equipment
                .iter()
                .flat_map(|list| list.split(','))
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect(),
            include_inactive: q.include_inactive,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RoomInput {
    pub name: String,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub equipment: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl RoomInput {
    fn into_room(self, id: Ulid) -> Room {
        Room {
            id,
            name: self.name,
            capacity: self.capacity,
            location: self.location,
            equipment: self.equipment,
            active: self.active,
        }
    }
}

// ── Router ───────────────────────────────────────────────────

pub fn router(orch: Orchestrator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bookings", get(all_bookings).post(create_booking))
        .route("/bookings/me", get(my_bookings))
        .route("/bookings/user/{user_id}", get(user_bookings))
        .route("/bookings/availability", get(check_availability))
        .route(
            "/bookings/{id}",
            get(get_booking).put(reschedule_booking).delete(cancel_booking),
        )
        .route("/rooms", get(list_rooms).post(create_room))
        .route("/rooms/{id}", get(get_room).put(update_room).delete(delete_room))
        .route("/rooms/{id}/status", get(room_status))
        .route("/rooms/{id}/bookings", get(room_bookings))
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(orch)
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let started = Instant::now();
    let response = next.run(req).await;

    metrics::histogram!(observability::HTTP_REQUEST_DURATION_SECONDS, "route" => route.clone())
        .record(started.elapsed().as_secs_f64());
    metrics::counter!(
        observability::HTTP_REQUESTS_TOTAL,
        "route" => route,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "roombook" }))
}

// ── Booking handlers ─────────────────────────────────────────

async fn create_booking(
    State(orch): State<Orchestrator>,
    Requester(requester): Requester,
    Json(body): Json<CreateBooking>,
) -> ApiResult<(StatusCode, Json<Booking>)> {
    let booking = orch
        .create_booking(body.room_id, requester, body.start_time, body.end_time)
        .await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// Role checks for the listings live in the gateway.
async fn all_bookings(State(orch): State<Orchestrator>, Requester(_): Requester) -> Json<Vec<Booking>> {
    Json(orch.engine().all_bookings())
}

async fn my_bookings(
    State(orch): State<Orchestrator>,
    Requester(requester): Requester,
) -> Json<Vec<Booking>> {
    Json(orch.engine().requester_bookings(requester))
}

async fn user_bookings(
    State(orch): State<Orchestrator>,
    Requester(_): Requester,
    Path(user_id): Path<Ulid>,
) -> Json<Vec<Booking>> {
    Json(orch.engine().requester_bookings(user_id))
}

async fn get_booking(State(orch): State<Orchestrator>, Path(id): Path<Ulid>) -> ApiResult<Json<Booking>> {
    Ok(Json(orch.engine().get_booking(id)?))
}

async fn reschedule_booking(
    State(orch): State<Orchestrator>,
    Requester(_): Requester,
    Path(id): Path<Ulid>,
    Json(body): Json<RescheduleBooking>,
) -> ApiResult<Json<Booking>> {
    let booking = orch
        .reschedule_booking(id, body.room_id, body.start_time, body.end_time)
        .await?;
    Ok(Json(booking))
}

async fn cancel_booking(
    State(orch): State<Orchestrator>,
    Requester(actor): Requester,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Booking>> {
    Ok(Json(orch.cancel_booking(id, actor).await?))
}

async fn check_availability(
    State(orch): State<Orchestrator>,
    Query(q): Query<AvailabilityQuery>,
) -> ApiResult<Json<Availability>> {
    let check = orch.check_availability(q.room_id, q.start, q.end).await?;
    Ok(Json(Availability {
        room_id: q.room_id,
        start: q.start,
        end: q.end,
        available: !check.is_conflict(),
        conflicting_booking_ids: check.conflicting_ids().to_vec(),
    }))
}

// ── Room handlers ────────────────────────────────────────────

async fn room_status(
    State(orch): State<Orchestrator>,
    Path(id): Path<Ulid>,
    Query(q): Query<StatusQuery>,
) -> ApiResult<Json<RoomStatus>> {
    let status = orch
        .get_status(id, q.force_refresh)
        .await
        .map_err(ApiError::room_path)?;
    Ok(Json(status))
}

async fn room_bookings(
    State(orch): State<Orchestrator>,
    Path(id): Path<Ulid>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<Json<Vec<Booking>>> {
    let window = match (q.start, q.end) {
        (Some(start), Some(end)) => Some(validate_window(start, end)?),
        (None, None) => None,
        _ => return Err(ApiError::Invalid("start and end must be given together")),
    };
    let bookings = orch
        .engine()
        .room_bookings(id, window)
        .await
        .map_err(ApiError::room_path)?;
    Ok(Json(bookings))
}

async fn list_rooms(
    State(orch): State<Orchestrator>,
    Query(q): Query<RoomQuery>,
) -> ApiResult<Json<Vec<Room>>> {
    Ok(Json(orch.engine().list_rooms(&RoomFilter::from(q)).await?))
}

async fn get_room(State(orch): State<Orchestrator>, Path(id): Path<Ulid>) -> ApiResult<Json<Room>> {
    let room = orch.engine().get_room(id).await.map_err(ApiError::room_path)?;
    Ok(Json(room))
}

async fn create_room(
    State(orch): State<Orchestrator>,
    Requester(_): Requester,
    Json(body): Json<RoomInput>,
) -> ApiResult<(StatusCode, Json<Room>)> {
    let room = orch.create_room(body.into_room(Ulid::new())).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

async fn update_room(
    State(orch): State<Orchestrator>,
    Requester(_): Requester,
    Path(id): Path<Ulid>,
    Json(body): Json<RoomInput>,
) -> ApiResult<Json<Room>> {
    let room = orch
        .update_room(body.into_room(id))
        .await
        .map_err(ApiError::room_path)?;
    Ok(Json(room))
}

async fn delete_room(
    State(orch): State<Orchestrator>,
    Requester(_): Requester,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Room>> {
    let room = orch.delete_room(id).await.map_err(|e| {
        if let EngineError::RoomHasBookings(_) = e {
            warn!(room_id = %id, "refusing to delete room with confirmed bookings");
        }
        ApiError::room_path(e)
    })?;
    Ok(Json(room))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_status() {
        let id = Ulid::new();
        let cases = [
            (EngineError::RoomNotFound(id), StatusCode::UNPROCESSABLE_ENTITY),
            (EngineError::RoomInactive(id), StatusCode::UNPROCESSABLE_ENTITY),
            (EngineError::BookingNotFound(id), StatusCode::NOT_FOUND),
            (EngineError::Conflict(vec![id]), StatusCode::CONFLICT),
            (EngineError::AlreadyCancelled(id), StatusCode::CONFLICT),
            (EngineError::RoomHasBookings(id), StatusCode::CONFLICT),
            (EngineError::Busy(id), StatusCode::SERVICE_UNAVAILABLE),
            (EngineError::Storage("disk full".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, want) in cases {
            assert_eq!(ApiError::from(err).status(), want);
        }
    }

    #[test]
    fn missing_room_on_room_path_is_404() {
        let err = ApiError::room_path(EngineError::RoomNotFound(Ulid::new()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let err = ApiError::room_path(EngineError::RoomHasBookings(Ulid::new()));
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn room_query_splits_equipment() {
        let filter = RoomFilter::from(RoomQuery {
            capacity: Some(6),
            location: Some("  ".into()),
            equipment: Some("projector, whiteboard,,".into()),
            include_inactive: false,
        });
        assert_eq!(filter.min_capacity, Some(6));
        assert_eq!(filter.location, None);
        assert_eq!(filter.equipment, ["projector", "whiteboard"]);
    }

    #[test]
    fn busy_sets_retry_after() {
        let response = ApiError::from(EngineError::Busy(Ulid::new())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "1");
    }
}
