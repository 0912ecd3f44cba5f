//! Source adapter contracts + fixture-first schedule adapters.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use racecal_core::{
    stage_from_website_label, HeldDayData, HorseRaceConditionData, PlaceData, PlaceEntity,
    RaceData, RaceEntity, RaceEntityParts, RacePlayerData, RaceType, ValidationError,
};
use racecal_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "racecal-adapters";

/// Rows of a schedule page. Header rows carry no `data-date` and are ignored.
pub const SCHEDULE_ROW_SELECTOR: &str = "table.race-schedule tr[data-date]";

/// Longest window, in days, that an http source expands into per-day requests.
pub const MAX_HTTP_WINDOW_DAYS: i64 = 92;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Fixture,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub race_type: RaceType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub mode: SourceMode,
    /// `{date}` expands to `YYYYMMDD`, one page per day.
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    pub fn source_for(&self, race_type: RaceType) -> Option<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.enabled && s.race_type == race_type)
    }
}

pub async fn load_source_registry(path: impl AsRef<Path>) -> anyhow::Result<SourceRegistry> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingTarget {
    Fixture(PathBuf),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub location: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSchedule {
    pub races: Vec<RaceEntity>,
    pub rejected: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("reading fixture {}: {source}", .path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} source in http mode has no listing_url")]
    MissingListingUrl(RaceType),
    #[error("{race_type} http window of {days} days exceeds {max} days")]
    WindowTooLarge { race_type: RaceType, days: i64, max: i64 },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn race_type(&self) -> RaceType;

    fn listing_targets(&self, start: NaiveDate, finish: NaiveDate) -> Result<Vec<ListingTarget>, AdapterError>;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        targets: &[ListingTarget],
    ) -> Result<Vec<FetchedPage>, AdapterError>;

    fn parse_listing(&self, page: &FetchedPage) -> Result<ParsedSchedule, AdapterError>;
}

/// Reads `table.race-schedule` pages, from a fixture file or over HTTP.
#[derive(Debug, Clone)]
pub struct HtmlScheduleAdapter {
    race_type: RaceType,
    mode: SourceMode,
    listing_url: Option<String>,
    fixture_path: PathBuf,
}

impl HtmlScheduleAdapter {
    pub fn fixture(race_type: RaceType, fixture_path: impl Into<PathBuf>) -> Self {
        Self {
            race_type,
            mode: SourceMode::Fixture,
            listing_url: None,
            fixture_path: fixture_path.into(),
        }
    }

    pub fn http(race_type: RaceType, listing_url: impl Into<String>) -> Self {
        Self {
            race_type,
            mode: SourceMode::Http,
            listing_url: Some(listing_url.into()),
            fixture_path: PathBuf::new(),
        }
    }
}

pub fn default_fixture_path(workspace_root: &Path, race_type: RaceType) -> PathBuf {
    workspace_root
        .join("fixtures")
        .join(race_type.slug())
        .join("schedule.html")
}

pub fn adapter_for_source(
    source: &SourceConfig,
    workspace_root: &Path,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match source.mode {
        SourceMode::Fixture => {
            let path = match &source.fixture_path {
                Some(p) if p.is_absolute() => p.clone(),
                Some(p) => workspace_root.join(p),
                None => default_fixture_path(workspace_root, source.race_type),
            };
            Ok(Box::new(HtmlScheduleAdapter::fixture(source.race_type, path)))
        }
        SourceMode::Http => {
            let url = source
                .listing_url
                .clone()
                .ok_or(AdapterError::MissingListingUrl(source.race_type))?;
            Ok(Box::new(HtmlScheduleAdapter::http(source.race_type, url)))
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlScheduleAdapter {
    fn race_type(&self) -> RaceType {
        self.race_type
    }

    fn listing_targets(&self, start: NaiveDate, finish: NaiveDate) -> Result<Vec<ListingTarget>, AdapterError> {
        match (self.mode, &self.listing_url) {
            (SourceMode::Http, Some(template)) => {
                let days = (finish - start).num_days() + 1;
                if days > MAX_HTTP_WINDOW_DAYS {
                    return Err(AdapterError::WindowTooLarge {
                        race_type: self.race_type,
                        days,
                        max: MAX_HTTP_WINDOW_DAYS,
                    });
                }
                Ok(start
                    .iter_days()
                    .take_while(|day| *day <= finish)
                    .map(|day| ListingTarget::Url(expand_listing_url(template, day)))
                    .collect())
            }
            _ => Ok(vec![ListingTarget::Fixture(self.fixture_path.clone())]),
        }
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        targets: &[ListingTarget],
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let mut pages = Vec::with_capacity(targets.len());
        for target in targets {
            let page = match target {
                ListingTarget::Fixture(path) => {
                    let body = tokio::fs::read_to_string(path)
                        .await
                        .map_err(|source| AdapterError::Fixture {
                            path: path.clone(),
                            source,
                        })?;
                    FetchedPage {
                        location: path.display().to_string(),
                        body,
                        fetched_at: Utc::now(),
                    }
                }
                ListingTarget::Url(url) => {
                    let resp = http.fetch_text(self.race_type, url).await?;
                    FetchedPage {
                        location: resp.final_url,
                        body: resp.body,
                        fetched_at: Utc::now(),
                    }
                }
            };
            pages.push(page);
        }
        Ok(pages)
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<ParsedSchedule, AdapterError> {
        let parsed = parse_schedule_html(self.race_type, &page.body, page.fetched_at)?;
        debug!(
            race_type = %self.race_type,
            page = %page.location,
            races = parsed.races.len(),
            rejected = parsed.rejected,
            "parsed schedule page"
        );
        Ok(parsed)
    }
}

pub fn expand_listing_url(template: &str, day: NaiveDate) -> String {
    template.replace("{date}", &day.format("%Y%m%d").to_string())
}

/// Fetches every listing page and keeps the races whose day is within `[start, finish]`.
pub async fn fetch_schedule(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    start: NaiveDate,
    finish: NaiveDate,
) -> Result<ParsedSchedule, AdapterError> {
    let targets = adapter.listing_targets(start, finish)?;
    let pages = adapter.fetch_listing(http, &targets).await?;
    let mut out = ParsedSchedule::default();
    for page in &pages {
        let parsed = adapter.parse_listing(page)?;
        out.rejected += parsed.rejected;
        out.races.extend(parsed.races.into_iter().filter(|race| {
            let day = race.race_data().date_time().date();
            start <= day && day <= finish
        }));
    }
    Ok(out)
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn cell_text(row: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    row.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn opt_attr<'a>(row: &ElementRef<'a>, name: &str) -> Option<&'a str> {
    row.value()
        .attr(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn req_attr<'a>(row: &ElementRef<'a>, name: &str) -> Result<&'a str, AdapterError> {
    opt_attr(row, name).ok_or_else(|| AdapterError::Message(format!("missing {name}")))
}

fn parse_attr<T: std::str::FromStr>(row: &ElementRef<'_>, name: &str) -> Result<Option<T>, AdapterError> {
    opt_attr(row, name)
        .map(|raw| {
            raw.trim_end_matches(['R', 'm'])
                .parse::<T>()
                .map_err(|_| AdapterError::Message(format!("unparseable {name} {raw:?}")))
        })
        .transpose()
}

struct RowSelectors {
    name: Selector,
    stage: Selector,
}

/// Parses every schedule row. Rows that fail to parse or validate are counted in `rejected`.
pub fn parse_schedule_html(
    race_type: RaceType,
    html: &str,
    update_date: DateTime<Utc>,
) -> Result<ParsedSchedule, AdapterError> {
    let document = Html::parse_document(html);
    let rows = selector(SCHEDULE_ROW_SELECTOR)?;
    let cells = RowSelectors {
        name: selector("td.race-name")?,
        stage: selector("td.stage")?,
    };

    let mut out = ParsedSchedule::default();
    for (index, row) in document.select(&rows).enumerate() {
        match parse_row(race_type, &row, &cells, update_date) {
            Ok(race) => out.races.push(race),
            Err(err) => {
                warn!(%race_type, row = index, error = %err, "skipping schedule row");
                out.rejected += 1;
            }
        }
    }
    Ok(out)
}

fn parse_row(
    race_type: RaceType,
    row: &ElementRef<'_>,
    cells: &RowSelectors,
    update_date: DateTime<Utc>,
) -> Result<RaceEntity, AdapterError> {
    let date = NaiveDate::parse_from_str(req_attr(row, "data-date")?, "%Y-%m-%d")
        .map_err(|e| AdapterError::Message(format!("bad data-date: {e}")))?;
    let time = NaiveTime::parse_from_str(req_attr(row, "data-time")?, "%H:%M")
        .map_err(|e| AdapterError::Message(format!("bad data-time: {e}")))?;
    let number = parse_attr::<u32>(row, "data-number")?
        .ok_or_else(|| AdapterError::Message("missing data-number".into()))?;
    let name = cell_text(row, &cells.name)
        .or_else(|| opt_attr(row, "data-name").map(ToString::to_string))
        .unwrap_or_default();

    let race_data = RaceData::new(
        race_type,
        &name,
        date.and_time(time),
        req_attr(row, "data-course")?,
        req_attr(row, "data-grade")?,
        number,
    )?;

    let mut parts = RaceEntityParts::default();
    if race_type == RaceType::Jra {
        let held_times = parse_attr::<u32>(row, "data-held-times")?.unwrap_or(0);
        let held_day_times = parse_attr::<u32>(row, "data-held-day-times")?.unwrap_or(0);
        parts.held_day_data = Some(HeldDayData::new(held_times, held_day_times)?);
    }
    if race_type.is_horse_racing() {
        let surface = req_attr(row, "data-surface")?;
        let distance = parse_attr::<u32>(row, "data-distance")?.unwrap_or(0);
        parts.condition_data = Some(HorseRaceConditionData::new(race_type, surface, distance)?);
    } else {
        let label = cell_text(row, &cells.stage)
            .or_else(|| opt_attr(row, "data-stage").map(ToString::to_string))
            .unwrap_or_default();
        parts.stage = Some(stage_from_website_label(race_type, &label)?);
        parts.race_player_data_list = parse_players(race_type, opt_attr(row, "data-players"))?;
    }

    Ok(RaceEntity::new(race_data, parts, update_date)?)
}

/// `"1:4001,2:4002"` -> position/player pairs.
fn parse_players(race_type: RaceType, raw: Option<&str>) -> Result<Vec<RacePlayerData>, AdapterError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let (position, player) = entry
                .split_once(':')
                .ok_or_else(|| AdapterError::Message(format!("bad player entry {entry:?}")))?;
            let position = position
                .trim()
                .parse::<u32>()
                .map_err(|_| AdapterError::Message(format!("bad position in {entry:?}")))?;
            let player = player
                .trim()
                .parse::<u32>()
                .map_err(|_| AdapterError::Message(format!("bad player number in {entry:?}")))?;
            Ok(RacePlayerData::new(race_type, position, player)?)
        })
        .collect()
}

/// One place per (race type, day, course) seen in `races`.
///
/// JRA places take the held-day data of their first race; mechanical racing places
/// take the highest grade (by table order) raced at the meeting.
pub fn derive_places(races: &[RaceEntity], update_date: DateTime<Utc>) -> Vec<PlaceEntity> {
    let mut meetings: BTreeMap<(RaceType, NaiveDate, String), Vec<&RaceEntity>> = BTreeMap::new();
    for race in races {
        let data = race.race_data();
        meetings
            .entry((race.race_type(), data.date_time().date(), data.location().to_string()))
            .or_default()
            .push(race);
    }

    let mut out = Vec::with_capacity(meetings.len());
    for ((race_type, day, location), group) in meetings {
        let held_day_data = group.iter().find_map(|r| r.held_day_data().copied());
        let grade = if race_type.is_mechanical_racing() {
            let grades = race_type.table().grades;
            group
                .iter()
                .map(|r| r.race_data().grade())
                .min_by_key(|g| grades.iter().position(|known| known == g).unwrap_or(usize::MAX))
        } else {
            None
        };
        let place = PlaceData::new(race_type, day.and_time(NaiveTime::MIN), &location)
            .and_then(|data| PlaceEntity::new(data, held_day_data, grade, update_date));
        match place {
            Ok(place) => out.push(place),
            Err(err) => warn!(%race_type, %day, %location, error = %err, "skipping derived place"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fetched() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).single().expect("ts")
    }

    const KEIRIN_PAGE: &str = r#"
<html><body>
<table class="race-schedule">
  <tr><th>R</th><th>レース</th><th>種別</th></tr>
  <tr data-date="2024-05-05" data-time="16:30" data-course="平塚" data-number="12R" data-grade="GⅠ"
      data-players="1:14001,2:15000,3:14222">
    <td class="race-name">日本選手権競輪</td><td class="stage">Ｓ級決勝</td>
  </tr>
  <tr data-date="2024-05-05" data-time="15:50" data-course="平塚" data-number="11" data-grade="GⅠ">
    <td class="race-name">日本選手権競輪</td><td class="stage"> S級 特選 </td>
  </tr>
  <tr data-date="2024-05-04" data-time="10:00" data-course="平塚" data-number="1" data-grade="GⅠ">
    <td class="race-name">日本選手権競輪</td><td class="stage">決勝</td>
  </tr>
  <tr data-date="2024-05-04" data-course="平塚" data-number="2" data-grade="GⅠ">
    <td class="race-name">日本選手権競輪</td><td class="stage">Ｓ級一予</td>
  </tr>
</table>
</body></html>"#;

    #[test]
    fn parses_rows_and_maps_stage_labels() {
        let parsed = parse_schedule_html(RaceType::Keirin, KEIRIN_PAGE, fetched()).expect("parse");
        assert_eq!(parsed.races.len(), 2);
        // unknown "決勝" label and the row without data-time
        assert_eq!(parsed.rejected, 2);

        let final_race = &parsed.races[0];
        assert_eq!(final_race.id(), "keirin202405053512");
        assert_eq!(final_race.stage(), Some("S級決勝"));
        assert_eq!(final_race.race_player_data_list().len(), 3);
        assert_eq!(final_race.update_date(), fetched());
        assert_eq!(parsed.races[1].stage(), Some("S級特選"));
    }

    #[test]
    fn horse_rows_need_condition_data() {
        let page = r#"<table class="race-schedule">
          <tr data-date="2024-06-02" data-time="15:40" data-course="東京" data-number="11" data-grade="GⅠ"
              data-surface="芝" data-distance="2400m" data-held-times="3" data-held-day-times="2">
            <td class="race-name">東京優駿</td></tr>
          <tr data-date="2024-06-02" data-time="15:00" data-course="東京" data-number="10" data-grade="GⅠ"
              data-held-times="3" data-held-day-times="2">
            <td class="race-name">欠損</td></tr>
        </table>"#;
        let parsed = parse_schedule_html(RaceType::Jra, page, fetched()).expect("parse");
        assert_eq!(parsed.races.len(), 1);
        assert_eq!(parsed.rejected, 1);
        let race = &parsed.races[0];
        assert_eq!(race.condition_data().map(|c| c.distance()), Some(2400));
        assert_eq!(race.held_day_data().map(|h| h.held_day_times()), Some(2));
    }

    #[test]
    fn derived_places_take_top_grade_and_held_days() {
        let parsed = parse_schedule_html(RaceType::Keirin, KEIRIN_PAGE, fetched()).expect("parse");
        let places = derive_places(&parsed.races, fetched());
        assert_eq!(places.len(), 1);
        assert_eq!(places[0].id(), "keirin2024050535");
        assert_eq!(places[0].grade(), Some("GⅠ"));
        assert!(places[0].held_day_data().is_none());
    }

    #[test]
    fn http_targets_expand_one_url_per_day() {
        let adapter = HtmlScheduleAdapter::http(RaceType::Boatrace, "https://example.test/schedule/{date}");
        let start = NaiveDate::from_ymd_opt(2024, 2, 28).expect("date");
        let finish = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");
        assert_eq!(
            adapter.listing_targets(start, finish).expect("targets"),
            vec![
                ListingTarget::Url("https://example.test/schedule/20240228".into()),
                ListingTarget::Url("https://example.test/schedule/20240229".into()),
                ListingTarget::Url("https://example.test/schedule/20240301".into()),
            ]
        );
        let fixture = HtmlScheduleAdapter::fixture(RaceType::Boatrace, "fixtures/boatrace/schedule.html");
        assert_eq!(fixture.listing_targets(start, finish).expect("targets").len(), 1);
    }

    #[test]
    fn http_targets_refuse_oversized_windows() {
        let adapter = HtmlScheduleAdapter::http(RaceType::Boatrace, "https://example.test/schedule/{date}");
        let start = NaiveDate::from_ymd_opt(1950, 1, 1).expect("date");
        let finish = NaiveDate::from_ymd_opt(2100, 12, 31).expect("date");
        let err = adapter.listing_targets(start, finish).expect_err("too large");
        assert!(matches!(
            err,
            AdapterError::WindowTooLarge {
                race_type: RaceType::Boatrace,
                max: MAX_HTTP_WINDOW_DAYS,
                ..
            }
        ));

        let quarter_end = start + chrono::Duration::days(MAX_HTTP_WINDOW_DAYS - 1);
        let targets = adapter.listing_targets(start, quarter_end).expect("targets");
        assert_eq!(targets.len(), MAX_HTTP_WINDOW_DAYS as usize);
        assert!(adapter
            .listing_targets(start, quarter_end + chrono::Duration::days(1))
            .is_err());

        let fixture = HtmlScheduleAdapter::fixture(RaceType::Boatrace, "fixtures/boatrace/schedule.html");
        assert_eq!(fixture.listing_targets(start, finish).expect("targets").len(), 1);
    }

    #[test]
    fn registry_yaml_parses_modes_and_defaults() {
        let yaml = r#"
sources:
  - race_type: KEIRIN
    mode: fixture
  - race_type: BOATRACE
    mode: http
    listing_url: "https://example.test/{date}"
  - race_type: JRA
    enabled: false
    mode: fixture
"#;
        let registry: SourceRegistry = serde_yaml::from_str(yaml).expect("yaml");
        assert_eq!(registry.sources.len(), 3);
        assert_eq!(
            registry.source_for(RaceType::Boatrace).map(|s| s.mode),
            Some(SourceMode::Http)
        );
        assert!(registry.source_for(RaceType::Jra).is_none());

        let root = Path::new("/srv/racecal");
        let keirin = registry.source_for(RaceType::Keirin).expect("keirin");
        assert!(adapter_for_source(keirin, root).is_ok());
        let broken = SourceConfig {
            listing_url: None,
            ..registry.sources[1].clone()
        };
        assert!(matches!(
            adapter_for_source(&broken, root),
            Err(AdapterError::MissingListingUrl(RaceType::Boatrace))
        ));
    }
}
