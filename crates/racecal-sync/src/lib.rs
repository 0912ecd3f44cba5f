//! Service contracts, calendar reconciliation and scheduling for racecal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use futures::future::join_all;
use racecal_adapters::{load_source_registry, AdapterError};
use racecal_core::{
    diff_calendar, display_grades, filter_race_entity_list, CalendarData, PlaceEntity,
    PlayerData, RaceEntity, RaceSearchFilter, RaceType, ValidationError,
};
use racecal_storage::{HttpClientConfig, HttpFetcher, RaceStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod calendar;
pub mod services;

pub use calendar::{InMemoryCalendarService, JsonFileCalendarService};
pub use services::{StoredPlaceDataService, StoredRaceDataService, WebSource, YamlPlayerDataService};

pub const CRATE_NAME: &str = "racecal-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub calendar_file: PathBuf,
    pub players_file: PathBuf,
    pub sources_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub sync_window_days: i64,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("RACECAL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            calendar_file: std::env::var("RACECAL_CALENDAR_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/calendar.json")),
            players_file: std::env::var("RACECAL_PLAYERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./players.yaml")),
            sources_file: std::env::var("RACECAL_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            user_agent: std::env::var("RACECAL_USER_AGENT")
                .unwrap_or_else(|_| "racecal-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("RACECAL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("RACECAL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("RACECAL_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            sync_window_days: std::env::var("RACECAL_SYNC_WINDOW_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            web_port: std::env::var("RACECAL_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            workspace_root: PathBuf::from("."),
        }
    }
}

/// Where a data service reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLocation {
    Storage,
    Web,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no enabled source configured for {0}")]
    NoSource(RaceType),
    #[error("calendar file {}: {source}", .path.display())]
    CalendarIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("calendar file {}: {source}", .path.display())]
    CalendarJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("players file {}: {source}", .path.display())]
    PlayersIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("players file {}: {source}", .path.display())]
    PlayersYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Events of `race_type` starting within `[start, finish]`; read failures yield an empty list.
    async fn get_events(&self, race_type: RaceType, start: NaiveDate, finish: NaiveDate) -> Vec<CalendarData>;

    async fn upsert_events(&self, races: &[RaceEntity]) -> Result<(), ServiceError>;

    async fn delete_events(&self, events: &[CalendarData]) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait RaceDataService: Send + Sync {
    /// Fetch failures are logged and yield an empty list.
    async fn fetch_race_entity_list(
        &self,
        race_type: RaceType,
        start: NaiveDate,
        finish: NaiveDate,
        location: DataLocation,
        place_list: Option<&[PlaceEntity]>,
    ) -> Vec<RaceEntity>;

    async fn update_race_entity_list(&self, races: &[RaceEntity]) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait PlaceDataService: Send + Sync {
    async fn fetch_place_entity_list(
        &self,
        race_type: RaceType,
        start: NaiveDate,
        finish: NaiveDate,
        location: DataLocation,
    ) -> Vec<PlaceEntity>;

    async fn update_place_entity_list(&self, places: &[PlaceEntity]) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait PlayerDataService: Send + Sync {
    async fn fetch_player_data_list(&self, race_type: RaceType) -> Vec<PlayerData>;
}

/// Result of reconciling one race type's calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub race_type: RaceType,
    pub fetched: usize,
    pub published: usize,
    pub deleted: usize,
    pub upserted: usize,
    pub error: Option<String>,
}

impl ReconcileSummary {
    fn failed(race_type: RaceType, err: &ServiceError) -> Self {
        Self {
            race_type,
            fetched: 0,
            published: 0,
            deleted: 0,
            upserted: 0,
            error: Some(err.to_string()),
        }
    }
}

/// Service locator assembled once at startup and shared by the web layer, CLI and scheduler.
#[derive(Clone)]
pub struct Services {
    pub calendar: Arc<dyn CalendarService>,
    pub race_data: Arc<dyn RaceDataService>,
    pub place_data: Arc<dyn PlaceDataService>,
    pub player_data: Arc<dyn PlayerDataService>,
}

impl Services {
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = load_source_registry(&config.sources_file).await?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let web = Arc::new(WebSource::new(registry, config.workspace_root.clone(), http));
        let store = RaceStore::new(config.data_dir.clone());
        info!(
            data_dir = %config.data_dir.display(),
            calendar_file = %config.calendar_file.display(),
            "services assembled"
        );
        Ok(Self {
            calendar: Arc::new(JsonFileCalendarService::new(config.calendar_file.clone())),
            race_data: Arc::new(StoredRaceDataService::new(store.clone(), web.clone())),
            place_data: Arc::new(StoredPlaceDataService::new(store, web)),
            player_data: Arc::new(YamlPlayerDataService::new(config.players_file.clone())),
        })
    }

    pub async fn calendar_events(&self, race_type: RaceType, start: NaiveDate, finish: NaiveDate) -> Vec<CalendarData> {
        self.calendar.get_events(race_type, start, finish).await
    }

    /// Publishes the stored races that pass the priority filter and removes stale events.
    ///
    /// Delete runs before upsert with nothing tying them together; a failure in between
    /// is repaired by the next full-range run.
    pub async fn reconcile_calendar(
        &self,
        race_type: RaceType,
        start: NaiveDate,
        finish: NaiveDate,
    ) -> Result<ReconcileSummary, ServiceError> {
        let races = self
            .race_data
            .fetch_race_entity_list(race_type, start, finish, DataLocation::Storage, None)
            .await;
        let fetched = races.len();
        let players = self.player_data.fetch_player_data_list(race_type).await;
        let filtered = filter_race_entity_list(races, &players, &display_grades(race_type));
        let events = self.calendar.get_events(race_type, start, finish).await;

        let diff = diff_calendar(&filtered, &events);
        self.calendar.delete_events(&diff.to_delete).await?;
        self.calendar.upsert_events(&diff.to_upsert).await?;

        let summary = ReconcileSummary {
            race_type,
            fetched,
            published: filtered.len(),
            deleted: diff.to_delete.len(),
            upserted: diff.to_upsert.len(),
            error: None,
        };
        info!(
            %race_type,
            fetched = summary.fetched,
            published = summary.published,
            deleted = summary.deleted,
            upserted = summary.upserted,
            "calendar reconciled"
        );
        Ok(summary)
    }

    /// Reconciles every race type concurrently. A failing race type is logged and reported in its summary.
    pub async fn reconcile_all(&self, start: NaiveDate, finish: NaiveDate) -> Vec<ReconcileSummary> {
        let run_id = Uuid::new_v4();
        let runs = RaceType::ALL.into_iter().map(|race_type| async move {
            match self.reconcile_calendar(race_type, start, finish).await {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(%race_type, error = %err, "calendar reconcile failed");
                    ReconcileSummary::failed(race_type, &err)
                }
            }
        });
        join_all(runs)
            .instrument(info_span!("reconcile_all", %run_id, %start, %finish))
            .await
    }

    pub async fn search_races(
        &self,
        race_type: RaceType,
        start: NaiveDate,
        finish: NaiveDate,
        filter: &RaceSearchFilter,
    ) -> Vec<RaceEntity> {
        self.race_data
            .fetch_race_entity_list(race_type, start, finish, DataLocation::Storage, None)
            .await
            .into_iter()
            .filter(|race| filter.matches(race))
            .collect()
    }

    /// Scrapes races at the stored meetings and upserts them. With no stored meetings the
    /// whole schedule is taken.
    pub async fn refresh_races(
        &self,
        race_type: RaceType,
        start: NaiveDate,
        finish: NaiveDate,
    ) -> Result<usize, ServiceError> {
        let places = self
            .place_data
            .fetch_place_entity_list(race_type, start, finish, DataLocation::Storage)
            .await;
        let place_list = (!places.is_empty()).then_some(places.as_slice());
        let races = self
            .race_data
            .fetch_race_entity_list(race_type, start, finish, DataLocation::Web, place_list)
            .await;
        self.race_data.update_race_entity_list(&races).await?;
        info!(%race_type, count = races.len(), "races refreshed");
        Ok(races.len())
    }

    pub async fn upsert_races(&self, races: &[RaceEntity]) -> Result<usize, ServiceError> {
        self.race_data.update_race_entity_list(races).await?;
        Ok(races.len())
    }

    pub async fn search_places(&self, race_type: RaceType, start: NaiveDate, finish: NaiveDate) -> Vec<PlaceEntity> {
        self.place_data
            .fetch_place_entity_list(race_type, start, finish, DataLocation::Storage)
            .await
    }

    pub async fn refresh_places(
        &self,
        race_type: RaceType,
        start: NaiveDate,
        finish: NaiveDate,
    ) -> Result<usize, ServiceError> {
        let places = self
            .place_data
            .fetch_place_entity_list(race_type, start, finish, DataLocation::Web)
            .await;
        self.place_data.update_place_entity_list(&places).await?;
        info!(%race_type, count = places.len(), "places refreshed");
        Ok(places.len())
    }
}

/// `[today, today + days]`.
pub fn sync_window(today: NaiveDate, days: i64) -> (NaiveDate, NaiveDate) {
    let finish = today
        .checked_add_signed(chrono::Duration::days(days.max(0)))
        .unwrap_or(today);
    (today, finish)
}

pub async fn maybe_build_scheduler(config: &SyncConfig, services: Services) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let window_days = config.sync_window_days;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let services = services.clone();
        Box::pin(async move {
            let (start, finish) = sync_window(Local::now().date_naive(), window_days);
            let summaries = services.reconcile_all(start, finish).await;
            let failed = summaries.iter().filter(|s| s.error.is_some()).count();
            info!(%start, %finish, race_types = summaries.len(), failed, "scheduled reconcile finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
