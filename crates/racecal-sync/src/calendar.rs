//! Calendar backends.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use racecal_core::{CalendarData, RaceEntity, RaceType};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{CalendarService, ServiceError};

fn in_window(event: &CalendarData, race_type: RaceType, start: NaiveDate, finish: NaiveDate) -> bool {
    let day = event.start.date();
    event.race_type == race_type && start <= day && day <= finish
}

fn sorted(mut events: Vec<CalendarData>) -> Vec<CalendarData> {
    events.sort_by(|a, b| (a.start, &a.id).cmp(&(b.start, &b.id)));
    events
}

/// Mutex-guarded event map keyed by id.
#[derive(Debug, Default)]
pub struct InMemoryCalendarService {
    events: Mutex<BTreeMap<String, CalendarData>>,
}

impl InMemoryCalendarService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: impl IntoIterator<Item = CalendarData>) -> Self {
        Self {
            events: Mutex::new(events.into_iter().map(|e| (e.id.clone(), e)).collect()),
        }
    }

    pub async fn snapshot(&self) -> Vec<CalendarData> {
        self.events.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl CalendarService for InMemoryCalendarService {
    async fn get_events(&self, race_type: RaceType, start: NaiveDate, finish: NaiveDate) -> Vec<CalendarData> {
        let events = self.events.lock().await;
        sorted(
            events
                .values()
                .filter(|e| in_window(e, race_type, start, finish))
                .cloned()
                .collect(),
        )
    }

    async fn upsert_events(&self, races: &[RaceEntity]) -> Result<(), ServiceError> {
        let mut events = self.events.lock().await;
        for race in races {
            events.insert(race.id().to_string(), CalendarData::from_race_entity(race));
        }
        Ok(())
    }

    async fn delete_events(&self, events_to_delete: &[CalendarData]) -> Result<(), ServiceError> {
        let mut events = self.events.lock().await;
        for event in events_to_delete {
            events.remove(&event.id);
        }
        Ok(())
    }
}

/// All race types' events in one JSON array file.
#[derive(Debug)]
pub struct JsonFileCalendarService {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileCalendarService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, CalendarData>, ServiceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(ServiceError::CalendarIo {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let events: Vec<CalendarData> =
            serde_json::from_slice(&bytes).map_err(|source| ServiceError::CalendarJson {
                path: self.path.clone(),
                source,
            })?;
        Ok(events.into_iter().map(|e| (e.id.clone(), e)).collect())
    }

    async fn write_all(&self, events: &BTreeMap<String, CalendarData>) -> Result<(), ServiceError> {
        let list: Vec<&CalendarData> = events.values().collect();
        let bytes = serde_json::to_vec_pretty(&list).map_err(|source| ServiceError::CalendarJson {
            path: self.path.clone(),
            source,
        })?;
        racecal_storage::write_atomic(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), count = list.len(), "wrote calendar file");
        Ok(())
    }
}

#[async_trait]
impl CalendarService for JsonFileCalendarService {
    async fn get_events(&self, race_type: RaceType, start: NaiveDate, finish: NaiveDate) -> Vec<CalendarData> {
        let _guard = self.lock.lock().await;
        match self.read_all().await {
            Ok(events) => sorted(
                events
                    .into_values()
                    .filter(|e| in_window(e, race_type, start, finish))
                    .collect(),
            ),
            Err(err) => {
                warn!(%race_type, error = %err, "calendar read failed; treating as empty");
                Vec::new()
            }
        }
    }

    async fn upsert_events(&self, races: &[RaceEntity]) -> Result<(), ServiceError> {
        if races.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut events = self.read_all().await?;
        for race in races {
            events.insert(race.id().to_string(), CalendarData::from_race_entity(race));
        }
        self.write_all(&events).await
    }

    async fn delete_events(&self, events_to_delete: &[CalendarData]) -> Result<(), ServiceError> {
        if events_to_delete.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut events = self.read_all().await?;
        for event in events_to_delete {
            events.remove(&event.id);
        }
        self.write_all(&events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{day, keirin_race};
    use tempfile::tempdir;

    #[tokio::test]
    async fn json_calendar_persists_upserts_and_deletes() {
        let dir = tempdir().expect("tempdir");
        let calendar = JsonFileCalendarService::new(dir.path().join("cal").join("calendar.json"));
        assert!(calendar
            .get_events(RaceType::Keirin, day(1), day(31))
            .await
            .is_empty());

        let a = keirin_race(11, 3);
        let b = keirin_race(12, 5);
        calendar.upsert_events(&[a.clone(), b.clone()]).await.expect("upsert");
        let events = calendar.get_events(RaceType::Keirin, day(1), day(31)).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, a.id());

        calendar
            .delete_events(&[CalendarData::from_race_entity(&a)])
            .await
            .expect("delete");
        let reopened = JsonFileCalendarService::new(calendar.path());
        let events = reopened.get_events(RaceType::Keirin, day(1), day(31)).await;
        assert_eq!(events, vec![CalendarData::from_race_entity(&b)]);
        assert!(reopened
            .get_events(RaceType::Boatrace, day(1), day(31))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn corrupt_calendar_file_reads_as_empty_but_rejects_writes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("calendar.json");
        std::fs::write(&path, b"{not json").expect("write");
        let calendar = JsonFileCalendarService::new(&path);
        assert!(calendar
            .get_events(RaceType::Keirin, day(1), day(31))
            .await
            .is_empty());
        let err = calendar
            .upsert_events(&[keirin_race(12, 5)])
            .await
            .expect_err("corrupt file");
        assert!(matches!(err, ServiceError::CalendarJson { .. }));
    }
}
