//! Flat-file race/place storage + HTTP fetch utilities for racecal.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use racecal_core::{
    HeldDayData, HorseRaceConditionData, PlaceData, PlaceEntity, RaceData, RaceEntity,
    RaceEntityParts, RacePlayerData, RaceType, ValidationError, ValidationResult,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "racecal-storage";

pub const RACE_LIST_FILE: &str = "race_list.csv";
pub const RACE_PLAYER_LIST_FILE: &str = "race_player_list.csv";
pub const PLACE_LIST_FILE: &str = "place_list.csv";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error at {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        StoreError::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RaceRow {
    id: String,
    race_type: RaceType,
    name: String,
    date_time: NaiveDateTime,
    location: String,
    grade: String,
    number: u32,
    stage: Option<String>,
    held_times: Option<u32>,
    held_day_times: Option<u32>,
    surface_type: Option<String>,
    distance: Option<u32>,
    update_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RacePlayerRow {
    id: String,
    race_id: String,
    race_type: RaceType,
    position_number: u32,
    player_number: u32,
    update_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PlaceRow {
    id: String,
    race_type: RaceType,
    date_time: NaiveDateTime,
    location: String,
    grade: Option<String>,
    held_times: Option<u32>,
    held_day_times: Option<u32>,
    update_date: DateTime<Utc>,
}

impl RaceRow {
    fn from_entity(entity: &RaceEntity) -> Self {
        let race = entity.race_data();
        Self {
            id: entity.id().to_string(),
            race_type: entity.race_type(),
            name: race.name().to_string(),
            date_time: race.date_time(),
            location: race.location().to_string(),
            grade: race.grade().to_string(),
            number: race.number(),
            stage: entity.stage().map(ToString::to_string),
            held_times: entity.held_day_data().map(HeldDayData::held_times),
            held_day_times: entity.held_day_data().map(HeldDayData::held_day_times),
            surface_type: entity
                .condition_data()
                .map(|c| c.surface_type().to_string()),
            distance: entity.condition_data().map(HorseRaceConditionData::distance),
            update_date: entity.update_date(),
        }
    }

    fn into_entity(self, players: Vec<RacePlayerData>) -> ValidationResult<RaceEntity> {
        let race_data = RaceData::new(
            self.race_type,
            &self.name,
            self.date_time,
            &self.location,
            &self.grade,
            self.number,
        )?;
        let held_day_data = match (self.held_times, self.held_day_times) {
            (Some(times), Some(day_times)) => Some(HeldDayData::new(times, day_times)?),
            _ => None,
        };
        let condition_data = match (self.surface_type.as_deref(), self.distance) {
            (Some(surface), Some(distance)) => {
                Some(HorseRaceConditionData::new(self.race_type, surface, distance)?)
            }
            _ => None,
        };
        RaceEntity::with_id(
            &self.id,
            race_data,
            RaceEntityParts {
                held_day_data,
                condition_data,
                stage: self.stage.filter(|s| !s.is_empty()),
                race_player_data_list: players,
            },
            self.update_date,
        )
    }
}

impl RacePlayerRow {
    fn from_entity(entity: &RaceEntity) -> ValidationResult<Vec<Self>> {
        entity
            .race_player_data_list()
            .iter()
            .map(|player| {
                Ok(Self {
                    id: entity.race_player_id(player)?,
                    race_id: entity.id().to_string(),
                    race_type: player.race_type(),
                    position_number: player.position_number(),
                    player_number: player.player_number(),
                    update_date: entity.update_date(),
                })
            })
            .collect()
    }
}

impl PlaceRow {
    fn from_entity(entity: &PlaceEntity) -> Self {
        Self {
            id: entity.id().to_string(),
            race_type: entity.race_type(),
            date_time: entity.place_data().date_time(),
            location: entity.place_data().location().to_string(),
            grade: entity.grade().map(ToString::to_string),
            held_times: entity.held_day_data().map(HeldDayData::held_times),
            held_day_times: entity.held_day_data().map(HeldDayData::held_day_times),
            update_date: entity.update_date(),
        }
    }

    fn into_entity(self) -> ValidationResult<PlaceEntity> {
        let place_data = PlaceData::new(self.race_type, self.date_time, &self.location)?;
        let held_day_data = match (self.held_times, self.held_day_times) {
            (Some(times), Some(day_times)) => Some(HeldDayData::new(times, day_times)?),
            _ => None,
        };
        let entity = PlaceEntity::new(
            place_data,
            held_day_data,
            self.grade.as_deref().filter(|g| !g.is_empty()),
            self.update_date,
        )?;
        if entity.id() != self.id {
            return Err(ValidationError::field(
                self.race_type,
                "id",
                &self.id,
                format!("does not match place data (expected {})", entity.id()),
            ));
        }
        Ok(entity)
    }
}

fn in_range(date_time: NaiveDateTime, start: NaiveDate, finish: NaiveDate) -> bool {
    let day = date_time.date();
    start <= day && day <= finish
}

/// CSV-backed race and place store, one directory per race type.
///
/// Writes merge by id and go through a temp file + rename.
#[derive(Debug, Clone)]
pub struct RaceStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl RaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn list_path(&self, race_type: RaceType, file_name: &str) -> PathBuf {
        self.root.join(race_type.slug()).join(file_name)
    }

    /// Races of `race_type` whose day falls within `[start, finish]`, ordered by start time.
    pub async fn load_races(
        &self,
        race_type: RaceType,
        start: NaiveDate,
        finish: NaiveDate,
    ) -> Result<Vec<RaceEntity>, StoreError> {
        let race_rows: Vec<RaceRow> = self
            .read_rows(&self.list_path(race_type, RACE_LIST_FILE))
            .await?;
        let player_rows: Vec<RacePlayerRow> = self
            .read_rows(&self.list_path(race_type, RACE_PLAYER_LIST_FILE))
            .await?;

        let mut players_by_race: HashMap<String, Vec<RacePlayerData>> = HashMap::new();
        for row in player_rows {
            match RacePlayerData::new(row.race_type, row.position_number, row.player_number) {
                Ok(player) => players_by_race.entry(row.race_id).or_default().push(player),
                Err(err) => warn!(id = %row.id, error = %err, "skipping invalid race player row"),
            }
        }

        let mut out = Vec::new();
        for row in race_rows {
            if row.race_type != race_type || !in_range(row.date_time, start, finish) {
                continue;
            }
            let id = row.id.clone();
            let players = players_by_race.remove(&id).unwrap_or_default();
            match row.into_entity(players) {
                Ok(entity) => out.push(entity),
                Err(err) => warn!(%id, error = %err, "skipping invalid race row"),
            }
        }
        out.sort_by(|a, b| {
            (a.race_data().date_time(), a.id()).cmp(&(b.race_data().date_time(), b.id()))
        });
        debug!(%race_type, count = out.len(), "loaded races");
        Ok(out)
    }

    /// Upserts races by id. Each race's player rows are replaced wholesale.
    pub async fn upsert_races(&self, entities: &[RaceEntity]) -> Result<usize, StoreError> {
        let _write = self.write_lock.lock().await;
        let mut by_type: BTreeMap<RaceType, Vec<&RaceEntity>> = BTreeMap::new();
        for entity in entities {
            by_type.entry(entity.race_type()).or_default().push(entity);
        }

        for (race_type, group) in by_type {
            let race_path = self.list_path(race_type, RACE_LIST_FILE);
            let player_path = self.list_path(race_type, RACE_PLAYER_LIST_FILE);

            let mut races: BTreeMap<String, RaceRow> = self
                .read_rows::<RaceRow>(&race_path)
                .await?
                .into_iter()
                .map(|row| (row.id.clone(), row))
                .collect();
            let mut players: BTreeMap<String, RacePlayerRow> = self
                .read_rows::<RacePlayerRow>(&player_path)
                .await?
                .into_iter()
                .map(|row| (row.id.clone(), row))
                .collect();

            for entity in &group {
                races.insert(entity.id().to_string(), RaceRow::from_entity(entity));
                players.retain(|_, row| row.race_id != entity.id());
                for row in RacePlayerRow::from_entity(entity)? {
                    players.insert(row.id.clone(), row);
                }
            }

            self.write_rows(&race_path, races.values()).await?;
            self.write_rows(&player_path, players.values()).await?;
            debug!(%race_type, count = group.len(), "upserted races");
        }
        Ok(entities.len())
    }

    pub async fn load_places(
        &self,
        race_type: RaceType,
        start: NaiveDate,
        finish: NaiveDate,
    ) -> Result<Vec<PlaceEntity>, StoreError> {
        let rows: Vec<PlaceRow> = self
            .read_rows(&self.list_path(race_type, PLACE_LIST_FILE))
            .await?;
        let mut out = Vec::new();
        for row in rows {
            if row.race_type != race_type || !in_range(row.date_time, start, finish) {
                continue;
            }
            let id = row.id.clone();
            match row.into_entity() {
                Ok(entity) => out.push(entity),
                Err(err) => warn!(%id, error = %err, "skipping invalid place row"),
            }
        }
        out.sort_by(|a, b| {
            (a.place_data().date_time(), a.id()).cmp(&(b.place_data().date_time(), b.id()))
        });
        debug!(%race_type, count = out.len(), "loaded places");
        Ok(out)
    }

    pub async fn upsert_places(&self, entities: &[PlaceEntity]) -> Result<usize, StoreError> {
        let _write = self.write_lock.lock().await;
        let mut by_type: BTreeMap<RaceType, Vec<&PlaceEntity>> = BTreeMap::new();
        for entity in entities {
            by_type.entry(entity.race_type()).or_default().push(entity);
        }

        for (race_type, group) in by_type {
            let path = self.list_path(race_type, PLACE_LIST_FILE);
            let mut places: BTreeMap<String, PlaceRow> = self
                .read_rows::<PlaceRow>(&path)
                .await?
                .into_iter()
                .map(|row| (row.id.clone(), row))
                .collect();
            for entity in &group {
                places.insert(entity.id().to_string(), PlaceRow::from_entity(entity));
            }
            self.write_rows(&path, places.values()).await?;
            debug!(%race_type, count = group.len(), "upserted places");
        }
        Ok(entities.len())
    }

    /// Reads every decodable row; a missing file is an empty list.
    async fn read_rows<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(path, err)),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(bytes.as_slice());
        let mut rows = Vec::new();
        for (index, record) in reader.deserialize::<T>().enumerate() {
            match record {
                Ok(row) => rows.push(row),
                Err(err) => warn!(
                    path = %path.display(),
                    line = index + 2,
                    error = %err,
                    "skipping undecodable row"
                ),
            }
        }
        Ok(rows)
    }

    async fn write_rows<'a, T, I>(&self, path: &Path, rows: I) -> Result<(), StoreError>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows {
            writer.serialize(row).map_err(|e| StoreError::csv(path, e))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| StoreError::io(path, e.into_error()))?;
        write_atomic(path, &bytes).await
    }
}

/// Writes `bytes` to a temp file beside `path`, then renames it into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::io(parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrency: 4,
        }
    }
}

/// Single-attempt page fetcher. Failures surface to the caller, which degrades them.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        })
    }

    pub async fn fetch_text(&self, race_type: RaceType, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.text().await?;
            debug!(bytes = body.len(), "fetched page");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(info_span!("http_fetch", %race_type, url))
        .await
    }
}
