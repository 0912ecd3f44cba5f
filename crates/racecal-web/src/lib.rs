//! Axum JSON API over the racecal services, one route family per race type.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use racecal_core::{
    CalendarData, HeldDayData, HorseRaceConditionData, PlaceEntity, RaceData, RaceEntity, RaceEntityParts,
    RacePlayerData, RaceSearchFilter, RaceType, ValidationError,
};
use racecal_sync::{ServiceError, Services};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "racecal-web";

const BODY_MODES: &str = "request body must contain either {startDate, finishDate} or {raceList}";

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

type SharedState = State<Arc<AppState>>;

pub fn app(state: AppState) -> Router {
    let per_race_type = Router::new()
        .route("/calendar", get(calendar_handler).post(reconcile_handler))
        .route("/race", get(race_search_handler).post(race_update_handler))
        .route("/place", get(place_search_handler).post(place_refresh_handler));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api/races/{race_type}", per_race_type)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(port: u16, services: Services) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "racecal api listening");
    axum::serve(listener, app(AppState::new(services)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (error, message) = match self {
            ApiError::BadRequest(message) => ("bad_request", message),
            ApiError::Validation(err) | ApiError::Service(ServiceError::Validation(err)) => {
                ("validation_failed", err.to_string())
            }
            ApiError::Service(err) => return server_error(err),
        };
        (StatusCode::BAD_REQUEST, Json(ErrorBody { error, message })).into_response()
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}")).into_response()
}

fn race_type_from_path(segment: &str) -> Result<RaceType, ApiError> {
    RaceType::from_str(segment).map_err(|err| ApiError::BadRequest(err.to_string()))
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp (its date in the given offset).
fn parse_date(field: &str, value: &str) -> Result<NaiveDate, ApiError> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| DateTime::parse_from_rfc3339(value).map(|dt| dt.date_naive()))
        .map_err(|_| ApiError::BadRequest(format!("{field} must be YYYY-MM-DD or RFC 3339, got {value:?}")))
}

fn date_range(start: Option<&str>, finish: Option<&str>) -> Result<(NaiveDate, NaiveDate), ApiError> {
    let start = parse_date("startDate", start.ok_or_else(|| missing("startDate"))?)?;
    let finish = parse_date("finishDate", finish.ok_or_else(|| missing("finishDate"))?)?;
    if finish < start {
        return Err(ApiError::BadRequest(format!(
            "finishDate {finish} is before startDate {start}"
        )));
    }
    Ok((start, finish))
}

fn missing(field: &str) -> ApiError {
    ApiError::BadRequest(format!("{field} is required"))
}

/// Query string with repeatable keys.
struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    fn first(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn all(&self, key: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn date_range(&self) -> Result<(NaiveDate, NaiveDate), ApiError> {
        date_range(self.first("startDate"), self.first("finishDate"))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangeBody {
    start_date: Option<String>,
    finish_date: Option<String>,
}

impl RangeBody {
    fn date_range(&self) -> Result<(NaiveDate, NaiveDate), ApiError> {
        date_range(self.start_date.as_deref(), self.finish_date.as_deref())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RaceUpdateBody {
    start_date: Option<String>,
    finish_date: Option<String>,
    race_list: Option<Vec<RaceInput>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RaceInput {
    id: Option<String>,
    race_data: RaceDataInput,
    held_day_data: Option<HeldDayInput>,
    condition_data: Option<ConditionInput>,
    stage: Option<String>,
    #[serde(default)]
    race_player_data_list: Vec<RacePlayerInput>,
    update_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RaceDataInput {
    race_type: Option<RaceType>,
    name: String,
    date_time: NaiveDateTime,
    location: String,
    grade: String,
    number: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeldDayInput {
    held_times: u32,
    held_day_times: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConditionInput {
    surface_type: String,
    distance: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RacePlayerInput {
    position_number: u32,
    player_number: u32,
}

impl RaceInput {
    fn into_entity(self, race_type: RaceType) -> Result<RaceEntity, ApiError> {
        let data = self.race_data;
        if let Some(declared) = data.race_type {
            if declared != race_type {
                return Err(ApiError::BadRequest(format!(
                    "race {} has raceType {declared}, path is {race_type}",
                    data.name
                )));
            }
        }
        let race_data = RaceData::new(
            race_type,
            &data.name,
            data.date_time,
            &data.location,
            &data.grade,
            data.number,
        )?;
        let held_day_data = self
            .held_day_data
            .map(|h| HeldDayData::new(h.held_times, h.held_day_times))
            .transpose()?;
        let condition_data = self
            .condition_data
            .map(|c| HorseRaceConditionData::new(race_type, &c.surface_type, c.distance))
            .transpose()?;
        let race_player_data_list = self
            .race_player_data_list
            .into_iter()
            .map(|p| RacePlayerData::new(race_type, p.position_number, p.player_number))
            .collect::<Result<Vec<_>, _>>()?;
        let parts = RaceEntityParts {
            held_day_data,
            condition_data,
            stage: self.stage,
            race_player_data_list,
        };
        let update_date = self.update_date.unwrap_or_else(Utc::now);
        let entity = match self.id {
            Some(id) => RaceEntity::with_id(&id, race_data, parts, update_date)?,
            None => RaceEntity::new(race_data, parts, update_date)?,
        };
        Ok(entity)
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn calendar_handler(
    State(state): SharedState,
    Path(race_type): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<CalendarData>>, ApiError> {
    let race_type = race_type_from_path(&race_type)?;
    let (start, finish) = QueryParams(params).date_range()?;
    Ok(Json(state.services.calendar_events(race_type, start, finish).await))
}

async fn reconcile_handler(
    State(state): SharedState,
    Path(race_type): Path<String>,
    body: Result<Json<RangeBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let race_type = race_type_from_path(&race_type)?;
    let (start, finish) = json_body(body)?.date_range()?;
    state.services.reconcile_calendar(race_type, start, finish).await?;
    Ok(StatusCode::OK)
}

async fn race_search_handler(
    State(state): SharedState,
    Path(race_type): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<RaceEntity>>, ApiError> {
    let race_type = race_type_from_path(&race_type)?;
    let params = QueryParams(params);
    let (start, finish) = params.date_range()?;
    let filter = RaceSearchFilter {
        grades: params.all("grade"),
        locations: params.all("location"),
        stages: params.all("stage"),
    };
    Ok(Json(
        state
            .services
            .search_races(race_type, start, finish, &filter)
            .await,
    ))
}

async fn race_update_handler(
    State(state): SharedState,
    Path(race_type): Path<String>,
    body: Result<Json<RaceUpdateBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let race_type = race_type_from_path(&race_type)?;
    let body = json_body(body)?;
    let has_range = body.start_date.is_some() || body.finish_date.is_some();
    match (has_range, body.race_list) {
        (true, None) => {
            let (start, finish) = date_range(body.start_date.as_deref(), body.finish_date.as_deref())?;
            state.services.refresh_races(race_type, start, finish).await?;
        }
        (false, Some(race_list)) => {
            let races = race_list
                .into_iter()
                .map(|input| input.into_entity(race_type))
                .collect::<Result<Vec<_>, _>>()?;
            state.services.upsert_races(&races).await?;
        }
        _ => return Err(ApiError::BadRequest(BODY_MODES.to_string())),
    }
    Ok(StatusCode::OK)
}

async fn place_search_handler(
    State(state): SharedState,
    Path(race_type): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<PlaceEntity>>, ApiError> {
    let race_type = race_type_from_path(&race_type)?;
    let (start, finish) = QueryParams(params).date_range()?;
    Ok(Json(state.services.search_places(race_type, start, finish).await))
}

async fn place_refresh_handler(
    State(state): SharedState,
    Path(race_type): Path<String>,
    body: Result<Json<RangeBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let race_type = race_type_from_path(&race_type)?;
    let (start, finish) = json_body(body)?.date_range()?;
    state.services.refresh_places(race_type, start, finish).await?;
    Ok(StatusCode::OK)
}
