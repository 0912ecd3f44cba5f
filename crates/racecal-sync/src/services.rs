//! Storage/web backed race, place and player data services.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use racecal_adapters::{adapter_for_source, derive_places, fetch_schedule, SourceRegistry};
use racecal_core::{PlaceEntity, PlayerData, RaceEntity, RaceType};
use racecal_storage::{HttpFetcher, RaceStore};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{DataLocation, PlaceDataService, PlayerDataService, RaceDataService, ServiceError};

/// Web side of the data services: the source registry plus the shared fetcher.
#[derive(Debug)]
pub struct WebSource {
    registry: SourceRegistry,
    workspace_root: PathBuf,
    http: HttpFetcher,
}

impl WebSource {
    pub fn new(registry: SourceRegistry, workspace_root: impl Into<PathBuf>, http: HttpFetcher) -> Self {
        Self {
            registry,
            workspace_root: workspace_root.into(),
            http,
        }
    }

    pub async fn fetch_races(
        &self,
        race_type: RaceType,
        start: NaiveDate,
        finish: NaiveDate,
    ) -> Result<Vec<RaceEntity>, ServiceError> {
        let source = self
            .registry
            .source_for(race_type)
            .ok_or(ServiceError::NoSource(race_type))?;
        let adapter = adapter_for_source(source, &self.workspace_root)?;
        let schedule = fetch_schedule(adapter.as_ref(), &self.http, start, finish).await?;
        if schedule.rejected > 0 {
            warn!(%race_type, rejected = schedule.rejected, "schedule rows rejected");
        }
        Ok(schedule.races)
    }
}

pub struct StoredRaceDataService {
    store: RaceStore,
    web: Arc<WebSource>,
}

impl StoredRaceDataService {
    pub fn new(store: RaceStore, web: Arc<WebSource>) -> Self {
        Self { store, web }
    }
}

#[async_trait]
impl RaceDataService for StoredRaceDataService {
    async fn fetch_race_entity_list(
        &self,
        race_type: RaceType,
        start: NaiveDate,
        finish: NaiveDate,
        location: DataLocation,
        place_list: Option<&[PlaceEntity]>,
    ) -> Vec<RaceEntity> {
        let result = match location {
            DataLocation::Storage => self
                .store
                .load_races(race_type, start, finish)
                .await
                .map_err(ServiceError::from),
            DataLocation::Web => self
                .web
                .fetch_races(race_type, start, finish)
                .await
                .map(|races| restrict_to_places(races, place_list)),
        };
        match result {
            Ok(races) => {
                info!(%race_type, ?location, count = races.len(), "fetched races");
                races
            }
            Err(err) => {
                warn!(%race_type, ?location, error = %err, "race fetch failed; returning empty list");
                Vec::new()
            }
        }
    }

    async fn update_race_entity_list(&self, races: &[RaceEntity]) -> Result<(), ServiceError> {
        let count = self.store.upsert_races(races).await?;
        info!(count, "stored races");
        Ok(())
    }
}

/// Keeps races held at one of the given meetings. `None` means no restriction.
fn restrict_to_places(races: Vec<RaceEntity>, place_list: Option<&[PlaceEntity]>) -> Vec<RaceEntity> {
    let Some(places) = place_list else {
        return races;
    };
    let meetings: HashSet<(NaiveDate, &str)> = places
        .iter()
        .map(|p| (p.place_data().date_time().date(), p.place_data().location()))
        .collect();
    races
        .into_iter()
        .filter(|race| {
            let data = race.race_data();
            meetings.contains(&(data.date_time().date(), data.location()))
        })
        .collect()
}

pub struct StoredPlaceDataService {
    store: RaceStore,
    web: Arc<WebSource>,
}

impl StoredPlaceDataService {
    pub fn new(store: RaceStore, web: Arc<WebSource>) -> Self {
        Self { store, web }
    }
}

#[async_trait]
impl PlaceDataService for StoredPlaceDataService {
    async fn fetch_place_entity_list(
        &self,
        race_type: RaceType,
        start: NaiveDate,
        finish: NaiveDate,
        location: DataLocation,
    ) -> Vec<PlaceEntity> {
        let result = match location {
            DataLocation::Storage => self
                .store
                .load_places(race_type, start, finish)
                .await
                .map_err(ServiceError::from),
            DataLocation::Web => self
                .web
                .fetch_races(race_type, start, finish)
                .await
                .map(|races| derive_places(&races, Utc::now())),
        };
        match result {
            Ok(places) => {
                info!(%race_type, ?location, count = places.len(), "fetched places");
                places
            }
            Err(err) => {
                warn!(%race_type, ?location, error = %err, "place fetch failed; returning empty list");
                Vec::new()
            }
        }
    }

    async fn update_place_entity_list(&self, places: &[PlaceEntity]) -> Result<(), ServiceError> {
        let count = self.store.upsert_places(places).await?;
        info!(count, "stored places");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PlayersFile {
    #[serde(default)]
    players: Vec<PlayerData>,
}

/// Reads the player priority list from a YAML file on every call.
#[derive(Debug, Clone)]
pub struct YamlPlayerDataService {
    path: PathBuf,
}

impl YamlPlayerDataService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<PlayerData>, ServiceError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ServiceError::PlayersIo {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let file: PlayersFile = serde_yaml::from_str(&text).map_err(|source| ServiceError::PlayersYaml {
            path: self.path.clone(),
            source,
        })?;
        Ok(file.players)
    }
}

#[async_trait]
impl PlayerDataService for YamlPlayerDataService {
    async fn fetch_player_data_list(&self, race_type: RaceType) -> Vec<PlayerData> {
        match self.load().await {
            Ok(players) => players
                .into_iter()
                .filter(|p| p.race_type == race_type)
                .collect(),
            Err(err) => {
                warn!(%race_type, error = %err, "player data load failed; returning empty list");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{day, keirin_race};
    use racecal_adapters::{SourceConfig, SourceMode};
    use racecal_storage::HttpClientConfig;
    use tempfile::tempdir;

    fn fixture_web(root: &std::path::Path) -> Arc<WebSource> {
        let registry = SourceRegistry {
            sources: vec![SourceConfig {
                race_type: RaceType::Keirin,
                enabled: true,
                mode: SourceMode::Fixture,
                listing_url: None,
                fixture_path: Some(PathBuf::from("schedule.html")),
                notes: None,
            }],
        };
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        Arc::new(WebSource::new(registry, root, http))
    }

    const PAGE: &str = r#"<table class="race-schedule">
      <tr data-date="2024-05-03" data-time="16:30" data-course="平塚" data-number="11" data-grade="GⅠ">
        <td class="race-name">日本選手権競輪</td><td class="stage">Ｓ級準決勝</td></tr>
      <tr data-date="2024-05-04" data-time="16:30" data-course="小倉" data-number="12" data-grade="FⅠ">
        <td class="race-name">小倉FⅠ</td><td class="stage">Ｓ級決勝</td></tr>
    </table>"#;

    #[tokio::test]
    async fn web_races_are_restricted_to_known_places() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("schedule.html"), PAGE).expect("fixture");
        let web = fixture_web(dir.path());
        let store = RaceStore::new(dir.path().join("data"));
        let races = StoredRaceDataService::new(store.clone(), web.clone());
        let places = StoredPlaceDataService::new(store, web);

        let all = races
            .fetch_race_entity_list(RaceType::Keirin, day(1), day(31), DataLocation::Web, None)
            .await;
        assert_eq!(all.len(), 2);

        let web_places = places
            .fetch_place_entity_list(RaceType::Keirin, day(1), day(31), DataLocation::Web)
            .await;
        assert_eq!(web_places.len(), 2);
        let hiratsuka: Vec<_> = web_places
            .into_iter()
            .filter(|p| p.place_data().location() == "平塚")
            .collect();
        let restricted = races
            .fetch_race_entity_list(
                RaceType::Keirin,
                day(1),
                day(31),
                DataLocation::Web,
                Some(&hiratsuka),
            )
            .await;
        assert_eq!(restricted.len(), 1);
        assert_eq!(restricted[0].race_data().location(), "平塚");
    }

    #[tokio::test]
    async fn unconfigured_source_degrades_to_empty() {
        let dir = tempdir().expect("tempdir");
        let web = fixture_web(dir.path());
        let races = StoredRaceDataService::new(RaceStore::new(dir.path()), web);
        // keirin fixture file missing, boatrace has no source at all
        for race_type in [RaceType::Keirin, RaceType::Boatrace] {
            let list = races
                .fetch_race_entity_list(race_type, day(1), day(31), DataLocation::Web, None)
                .await;
            assert!(list.is_empty());
        }
    }

    #[tokio::test]
    async fn storage_round_trip_through_service() {
        let dir = tempdir().expect("tempdir");
        let races = StoredRaceDataService::new(RaceStore::new(dir.path()), fixture_web(dir.path()));
        let race = keirin_race(12, 5);
        races.update_race_entity_list(&[race.clone()]).await.expect("update");
        let stored = races
            .fetch_race_entity_list(RaceType::Keirin, day(5), day(5), DataLocation::Storage, None)
            .await;
        assert_eq!(stored, vec![race]);
    }

    #[tokio::test]
    async fn players_yaml_is_filtered_by_race_type() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("players.yaml");
        std::fs::write(
            &path,
            "players:\n  - raceType: KEIRIN\n    playerNumber: 15000\n    priority: 6\n  - raceType: BOATRACE\n    playerNumber: 4320\n    priority: 6\n",
        )
        .expect("write");
        let service = YamlPlayerDataService::new(&path);
        let keirin = service.fetch_player_data_list(RaceType::Keirin).await;
        assert_eq!(
            keirin,
            vec![PlayerData {
                race_type: RaceType::Keirin,
                player_number: 15000,
                priority: 6,
            }]
        );
        let missing = YamlPlayerDataService::new(dir.path().join("nope.yaml"));
        assert!(missing.fetch_player_data_list(RaceType::Keirin).await.is_empty());
    }
}
