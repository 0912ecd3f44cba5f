//! Core domain model for racecal: race types, classification tables,
//! validated race records, composite ids, priority filtering and calendar diffing.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod tables;

pub use tables::{table, ClassificationTable, CourseRecord, GradeStagePriority, StageLabel};

pub const CRATE_NAME: &str = "racecal-core";

/// Combined race + player priority a race needs to be published.
pub const PRIORITY_THRESHOLD: i32 = 6;

/// Length of a calendar event created for a race.
pub const CALENDAR_EVENT_MINUTES: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RaceType {
    Jra,
    Nar,
    Overseas,
    Keirin,
    Autorace,
    Boatrace,
}

impl RaceType {
    pub const ALL: [RaceType; 6] = [
        RaceType::Jra,
        RaceType::Nar,
        RaceType::Overseas,
        RaceType::Keirin,
        RaceType::Autorace,
        RaceType::Boatrace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RaceType::Jra => "JRA",
            RaceType::Nar => "NAR",
            RaceType::Overseas => "OVERSEAS",
            RaceType::Keirin => "KEIRIN",
            RaceType::Autorace => "AUTORACE",
            RaceType::Boatrace => "BOATRACE",
        }
    }

    /// Lower-case form used in ids, storage paths and URL segments.
    pub fn slug(&self) -> &'static str {
        match self {
            RaceType::Jra => "jra",
            RaceType::Nar => "nar",
            RaceType::Overseas => "overseas",
            RaceType::Keirin => "keirin",
            RaceType::Autorace => "autorace",
            RaceType::Boatrace => "boatrace",
        }
    }

    pub fn is_horse_racing(&self) -> bool {
        matches!(self, RaceType::Jra | RaceType::Nar | RaceType::Overseas)
    }

    pub fn is_mechanical_racing(&self) -> bool {
        !self.is_horse_racing()
    }

    /// Valid entry positions; `None` for race types without player data.
    pub fn position_number_range(&self) -> Option<RangeInclusive<u32>> {
        match self {
            RaceType::Autorace => Some(1..=8),
            RaceType::Boatrace => Some(1..=6),
            RaceType::Keirin => Some(1..=9),
            RaceType::Jra | RaceType::Nar | RaceType::Overseas => None,
        }
    }

    pub fn table(&self) -> &'static ClassificationTable {
        tables::table(*self)
    }
}

impl fmt::Display for RaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown race type {0:?}")]
pub struct UnknownRaceType(pub String);

impl FromStr for RaceType {
    type Err = UnknownRaceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RaceType::ALL
            .into_iter()
            .find(|rt| rt.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownRaceType(s.to_string()))
    }
}

/// One rejected field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{race_type}] invalid {field} {value:?}: {reason}")]
pub struct FieldError {
    pub race_type: RaceType,
    pub field: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Field(FieldError),
    #[error("{}", join_field_errors(.0))]
    Aggregate(Vec<FieldError>),
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    pub fn field(
        race_type: RaceType,
        field: &'static str,
        value: impl fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        ValidationError::Field(FieldError {
            race_type,
            field,
            value: value.to_string(),
            reason: reason.into(),
        })
    }

    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ValidationError::Field(e) => std::slice::from_ref(e),
            ValidationError::Aggregate(errors) => errors,
        }
    }

    fn from_field_errors(mut errors: Vec<FieldError>) -> Self {
        if errors.len() == 1 {
            ValidationError::Field(errors.remove(0))
        } else {
            ValidationError::Aggregate(errors)
        }
    }
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Runs every field validator of a factory and aggregates failures.
#[derive(Debug, Default)]
struct Checks {
    errors: Vec<FieldError>,
}

impl Checks {
    fn check<T>(&mut self, result: ValidationResult<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.extend(e.field_errors().iter().cloned());
                None
            }
        }
    }

    fn finish(self) -> ValidationResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::from_field_errors(self.errors))
        }
    }
}

/// Collapses the `Option`s produced by [`Checks::check`] once `finish` has succeeded.
fn all_checked<T>(value: Option<T>, race_type: RaceType, field: &'static str) -> ValidationResult<T> {
    value.ok_or_else(|| ValidationError::field(race_type, field, "", "missing after validation"))
}

// Field validators

pub fn validate_race_name(race_type: RaceType, name: &str) -> ValidationResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::field(race_type, "name", name, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

pub fn validate_grade(race_type: RaceType, grade: &str) -> ValidationResult<String> {
    if race_type.table().has_grade(grade) {
        Ok(grade.to_string())
    } else {
        Err(ValidationError::field(
            race_type,
            "grade",
            grade,
            format!("not a {race_type} grade"),
        ))
    }
}

pub fn validate_stage(race_type: RaceType, stage: &str) -> ValidationResult<String> {
    if race_type.table().has_stage(stage) {
        Ok(stage.to_string())
    } else {
        Err(ValidationError::field(
            race_type,
            "stage",
            stage,
            format!("not a {race_type} stage"),
        ))
    }
}

pub fn validate_course(race_type: RaceType, course: &str) -> ValidationResult<String> {
    match race_type.table().course(course) {
        Some(record) => Ok(record.name.to_string()),
        None => Err(ValidationError::field(
            race_type,
            "location",
            course,
            format!("not a {race_type} course"),
        )),
    }
}

pub fn course_code(race_type: RaceType, course: &str) -> ValidationResult<&'static str> {
    race_type
        .table()
        .course(course)
        .map(|c| c.code)
        .ok_or_else(|| {
            ValidationError::field(race_type, "location", course, format!("no {race_type} course code"))
        })
}

pub fn validate_race_number(race_type: RaceType, number: u32) -> ValidationResult<u32> {
    if (1..=12).contains(&number) {
        Ok(number)
    } else {
        Err(ValidationError::field(race_type, "number", number, "must be within 1..=12"))
    }
}

pub fn validate_position_number(race_type: RaceType, position: u32) -> ValidationResult<u32> {
    match race_type.position_number_range() {
        Some(range) if range.contains(&position) => Ok(position),
        Some(range) => Err(ValidationError::field(
            race_type,
            "positionNumber",
            position,
            format!("must be within {}..={}", range.start(), range.end()),
        )),
        None => Err(ValidationError::field(
            race_type,
            "positionNumber",
            position,
            "race type does not carry player data",
        )),
    }
}

pub fn validate_player_number(race_type: RaceType, player_number: u32) -> ValidationResult<u32> {
    if player_number >= 1 {
        Ok(player_number)
    } else {
        Err(ValidationError::field(race_type, "playerNumber", player_number, "must be positive"))
    }
}

pub fn validate_date_time(race_type: RaceType, date_time: NaiveDateTime) -> ValidationResult<NaiveDateTime> {
    if (1950..=2100).contains(&date_time.year()) {
        Ok(date_time)
    } else {
        Err(ValidationError::field(race_type, "dateTime", date_time, "year must be within 1950..=2100"))
    }
}

pub fn validate_surface_type(race_type: RaceType, surface: &str) -> ValidationResult<String> {
    if race_type.table().has_surface(surface) {
        Ok(surface.to_string())
    } else {
        Err(ValidationError::field(
            race_type,
            "surfaceType",
            surface,
            format!("not a {race_type} surface"),
        ))
    }
}

pub fn validate_distance(race_type: RaceType, distance: u32) -> ValidationResult<u32> {
    if (100..=5000).contains(&distance) {
        Ok(distance)
    } else {
        Err(ValidationError::field(race_type, "distance", distance, "must be within 100..=5000"))
    }
}

/// Canonical stage for a raw scraped label.
pub fn stage_from_website_label(race_type: RaceType, label: &str) -> ValidationResult<String> {
    race_type
        .table()
        .stage_from_website_label(label)
        .map(ToString::to_string)
        .ok_or_else(|| {
            ValidationError::field(race_type, "stage", label, format!("unknown {race_type} stage label"))
        })
}

/// Default grade list used when publishing to a calendar.
pub fn display_grades(race_type: RaceType) -> Vec<&'static str> {
    race_type.table().display_grades()
}

// Ids

pub fn generate_place_id(race_type: RaceType, date: NaiveDate, location: &str) -> ValidationResult<String> {
    let code = course_code(race_type, location)?;
    Ok(format!("{}{}{}", race_type.slug(), date.format("%Y%m%d"), code))
}

pub fn generate_race_id(
    race_type: RaceType,
    date: NaiveDate,
    location: &str,
    number: u32,
) -> ValidationResult<String> {
    let place_id = generate_place_id(race_type, date, location)?;
    Ok(format!("{place_id}{number:02}"))
}

pub fn generate_race_player_id(
    race_type: RaceType,
    date: NaiveDate,
    location: &str,
    number: u32,
    position_number: u32,
) -> ValidationResult<String> {
    let race_id = generate_race_id(race_type, date, location, number)?;
    Ok(format!("{race_id}{position_number:02}"))
}

/// Checks the shape of a supplied id: race type prefix followed by a real YYYYMMDD date.
pub fn validate_race_id(race_type: RaceType, id: &str) -> ValidationResult<String> {
    let Some(rest) = id.strip_prefix(race_type.slug()) else {
        return Err(ValidationError::field(
            race_type,
            "id",
            id,
            format!("must start with {:?}", race_type.slug()),
        ));
    };
    let date_part = rest.get(..8).unwrap_or_default();
    if NaiveDate::parse_from_str(date_part, "%Y%m%d").is_err() {
        return Err(ValidationError::field(race_type, "id", id, "missing YYYYMMDD date"));
    }
    Ok(id.to_string())
}

// Records

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceData {
    race_type: RaceType,
    name: String,
    date_time: NaiveDateTime,
    location: String,
    grade: String,
    number: u32,
}

/// Field overrides for [`RaceData::copy`].
#[derive(Debug, Clone, Default)]
pub struct RaceDataPatch {
    pub race_type: Option<RaceType>,
    pub name: Option<String>,
    pub date_time: Option<NaiveDateTime>,
    pub location: Option<String>,
    pub grade: Option<String>,
    pub number: Option<u32>,
}

impl RaceData {
    pub fn new(
        race_type: RaceType,
        name: &str,
        date_time: NaiveDateTime,
        location: &str,
        grade: &str,
        number: u32,
    ) -> ValidationResult<Self> {
        let mut checks = Checks::default();
        let name = checks.check(validate_race_name(race_type, name));
        let date_time = checks.check(validate_date_time(race_type, date_time));
        let location = checks.check(validate_course(race_type, location));
        let grade = checks.check(validate_grade(race_type, grade));
        let number = checks.check(validate_race_number(race_type, number));
        checks.finish()?;
        Ok(Self {
            race_type,
            name: all_checked(name, race_type, "name")?,
            date_time: all_checked(date_time, race_type, "dateTime")?,
            location: all_checked(location, race_type, "location")?,
            grade: all_checked(grade, race_type, "grade")?,
            number: all_checked(number, race_type, "number")?,
        })
    }

    /// New validated instance with `patch` applied over this one.
    pub fn copy(&self, patch: RaceDataPatch) -> ValidationResult<Self> {
        Self::new(
            patch.race_type.unwrap_or(self.race_type),
            patch.name.as_deref().unwrap_or(&self.name),
            patch.date_time.unwrap_or(self.date_time),
            patch.location.as_deref().unwrap_or(&self.location),
            patch.grade.as_deref().unwrap_or(&self.grade),
            patch.number.unwrap_or(self.number),
        )
    }

    pub fn race_type(&self) -> RaceType {
        self.race_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn date_time(&self) -> NaiveDateTime {
        self.date_time
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn grade(&self) -> &str {
        &self.grade
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn race_id(&self) -> ValidationResult<String> {
        generate_race_id(self.race_type, self.date_time.date(), &self.location, self.number)
    }
}

/// JRA meeting counters: "第N回" and "N日目".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeldDayData {
    held_times: u32,
    held_day_times: u32,
}

impl HeldDayData {
    pub fn new(held_times: u32, held_day_times: u32) -> ValidationResult<Self> {
        let mut checks = Checks::default();
        if held_times == 0 {
            checks.check::<()>(Err(ValidationError::field(
                RaceType::Jra,
                "heldTimes",
                held_times,
                "must be positive",
            )));
        }
        if !(1..=12).contains(&held_day_times) {
            checks.check::<()>(Err(ValidationError::field(
                RaceType::Jra,
                "heldDayTimes",
                held_day_times,
                "must be within 1..=12",
            )));
        }
        checks.finish()?;
        Ok(Self {
            held_times,
            held_day_times,
        })
    }

    pub fn held_times(&self) -> u32 {
        self.held_times
    }

    pub fn held_day_times(&self) -> u32 {
        self.held_day_times
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HorseRaceConditionData {
    surface_type: String,
    distance: u32,
}

impl HorseRaceConditionData {
    pub fn new(race_type: RaceType, surface_type: &str, distance: u32) -> ValidationResult<Self> {
        let mut checks = Checks::default();
        let surface_type = checks.check(validate_surface_type(race_type, surface_type));
        let distance = checks.check(validate_distance(race_type, distance));
        checks.finish()?;
        Ok(Self {
            surface_type: all_checked(surface_type, race_type, "surfaceType")?,
            distance: all_checked(distance, race_type, "distance")?,
        })
    }

    pub fn surface_type(&self) -> &str {
        &self.surface_type
    }

    pub fn distance(&self) -> u32 {
        self.distance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RacePlayerData {
    race_type: RaceType,
    position_number: u32,
    player_number: u32,
}

impl RacePlayerData {
    pub fn new(race_type: RaceType, position_number: u32, player_number: u32) -> ValidationResult<Self> {
        let mut checks = Checks::default();
        let position_number = checks.check(validate_position_number(race_type, position_number));
        let player_number = checks.check(validate_player_number(race_type, player_number));
        checks.finish()?;
        Ok(Self {
            race_type,
            position_number: all_checked(position_number, race_type, "positionNumber")?,
            player_number: all_checked(player_number, race_type, "playerNumber")?,
        })
    }

    pub fn race_type(&self) -> RaceType {
        self.race_type
    }

    pub fn position_number(&self) -> u32 {
        self.position_number
    }

    pub fn player_number(&self) -> u32 {
        self.player_number
    }
}

/// Optional parts of a [`RaceEntity`]; which ones must be present depends on the race type.
#[derive(Debug, Clone, Default)]
pub struct RaceEntityParts {
    pub held_day_data: Option<HeldDayData>,
    pub condition_data: Option<HorseRaceConditionData>,
    pub stage: Option<String>,
    pub race_player_data_list: Vec<RacePlayerData>,
}

/// Field overrides for [`RaceEntity::copy`]. `Some(None)` clears an optional part.
#[derive(Debug, Clone, Default)]
pub struct RaceEntityPatch {
    pub race_data: Option<RaceData>,
    pub held_day_data: Option<Option<HeldDayData>>,
    pub condition_data: Option<Option<HorseRaceConditionData>>,
    pub stage: Option<Option<String>>,
    pub race_player_data_list: Option<Vec<RacePlayerData>>,
    pub update_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceEntity {
    id: String,
    race_data: RaceData,
    held_day_data: Option<HeldDayData>,
    condition_data: Option<HorseRaceConditionData>,
    stage: Option<String>,
    race_player_data_list: Vec<RacePlayerData>,
    update_date: DateTime<Utc>,
}

impl RaceEntity {
    /// Builds an entity and generates its id from `race_data`.
    pub fn new(race_data: RaceData, parts: RaceEntityParts, update_date: DateTime<Utc>) -> ValidationResult<Self> {
        let race_type = race_data.race_type();
        let mut checks = Checks::default();
        let id = checks.check(race_data.race_id());
        checks.check(check_held_day_presence(race_type, parts.held_day_data.is_some()));
        checks.check(check_condition_presence(race_type, parts.condition_data.is_some()));
        let stage = match (&parts.stage, race_type.is_mechanical_racing()) {
            (Some(stage), true) => checks.check(validate_stage(race_type, stage)).map(Some),
            (None, false) => Some(None),
            (Some(stage), false) => checks.check::<Option<String>>(Err(ValidationError::field(
                race_type,
                "stage",
                stage,
                "only mechanical racing carries a stage",
            ))),
            (None, true) => checks.check::<Option<String>>(Err(ValidationError::field(
                race_type,
                "stage",
                "",
                "required for mechanical racing",
            ))),
        };
        checks.check(check_players(race_type, &parts.race_player_data_list));
        checks.finish()?;
        Ok(Self {
            id: all_checked(id, race_type, "id")?,
            race_data,
            held_day_data: parts.held_day_data,
            condition_data: parts.condition_data,
            stage: all_checked(stage, race_type, "stage")?,
            race_player_data_list: parts.race_player_data_list,
            update_date,
        })
    }

    /// Rebuilds an entity from a stored or posted record whose id must match the generated one.
    pub fn with_id(
        id: &str,
        race_data: RaceData,
        parts: RaceEntityParts,
        update_date: DateTime<Utc>,
    ) -> ValidationResult<Self> {
        let race_type = race_data.race_type();
        validate_race_id(race_type, id)?;
        let entity = Self::new(race_data, parts, update_date)?;
        if entity.id != id {
            return Err(ValidationError::field(
                race_type,
                "id",
                id,
                format!("does not match race data (expected {})", entity.id),
            ));
        }
        Ok(entity)
    }

    pub fn copy(&self, patch: RaceEntityPatch) -> ValidationResult<Self> {
        Self::new(
            patch.race_data.unwrap_or_else(|| self.race_data.clone()),
            RaceEntityParts {
                held_day_data: patch.held_day_data.unwrap_or(self.held_day_data),
                condition_data: patch
                    .condition_data
                    .unwrap_or_else(|| self.condition_data.clone()),
                stage: patch.stage.unwrap_or_else(|| self.stage.clone()),
                race_player_data_list: patch
                    .race_player_data_list
                    .unwrap_or_else(|| self.race_player_data_list.clone()),
            },
            patch.update_date.unwrap_or(self.update_date),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn race_type(&self) -> RaceType {
        self.race_data.race_type()
    }

    pub fn race_data(&self) -> &RaceData {
        &self.race_data
    }

    pub fn held_day_data(&self) -> Option<&HeldDayData> {
        self.held_day_data.as_ref()
    }

    pub fn condition_data(&self) -> Option<&HorseRaceConditionData> {
        self.condition_data.as_ref()
    }

    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    pub fn race_player_data_list(&self) -> &[RacePlayerData] {
        &self.race_player_data_list
    }

    pub fn update_date(&self) -> DateTime<Utc> {
        self.update_date
    }

    pub fn race_player_id(&self, player: &RacePlayerData) -> ValidationResult<String> {
        generate_race_player_id(
            self.race_type(),
            self.race_data.date_time().date(),
            self.race_data.location(),
            self.race_data.number(),
            player.position_number(),
        )
    }
}

fn check_held_day_presence(race_type: RaceType, present: bool) -> ValidationResult<()> {
    match (race_type == RaceType::Jra, present) {
        (true, true) | (false, false) => Ok(()),
        (true, false) => Err(ValidationError::field(race_type, "heldDayData", "", "required for JRA")),
        (false, true) => Err(ValidationError::field(
            race_type,
            "heldDayData",
            "",
            "only JRA carries held-day data",
        )),
    }
}

fn check_condition_presence(race_type: RaceType, present: bool) -> ValidationResult<()> {
    match (race_type.is_horse_racing(), present) {
        (true, true) | (false, false) => Ok(()),
        (true, false) => Err(ValidationError::field(
            race_type,
            "conditionData",
            "",
            "required for horse racing",
        )),
        (false, true) => Err(ValidationError::field(
            race_type,
            "conditionData",
            "",
            "only horse racing carries surface and distance",
        )),
    }
}

fn check_players(race_type: RaceType, players: &[RacePlayerData]) -> ValidationResult<()> {
    let mut seen = HashSet::new();
    for player in players {
        if player.race_type() != race_type {
            return Err(ValidationError::field(
                race_type,
                "racePlayerDataList",
                player.race_type(),
                "player race type differs from race",
            ));
        }
        if !seen.insert(player.position_number()) {
            return Err(ValidationError::field(
                race_type,
                "racePlayerDataList",
                player.position_number(),
                "duplicate position number",
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceData {
    race_type: RaceType,
    date_time: NaiveDateTime,
    location: String,
}

impl PlaceData {
    pub fn new(race_type: RaceType, date_time: NaiveDateTime, location: &str) -> ValidationResult<Self> {
        let mut checks = Checks::default();
        let date_time = checks.check(validate_date_time(race_type, date_time));
        let location = checks.check(validate_course(race_type, location));
        checks.finish()?;
        Ok(Self {
            race_type,
            date_time: all_checked(date_time, race_type, "dateTime")?,
            location: all_checked(location, race_type, "location")?,
        })
    }

    pub fn race_type(&self) -> RaceType {
        self.race_type
    }

    pub fn date_time(&self) -> NaiveDateTime {
        self.date_time
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn place_id(&self) -> ValidationResult<String> {
        generate_place_id(self.race_type, self.date_time.date(), &self.location)
    }
}

/// A race meeting: venue and day, plus the meeting-level grade for mechanical racing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceEntity {
    id: String,
    place_data: PlaceData,
    held_day_data: Option<HeldDayData>,
    grade: Option<String>,
    update_date: DateTime<Utc>,
}

impl PlaceEntity {
    pub fn new(
        place_data: PlaceData,
        held_day_data: Option<HeldDayData>,
        grade: Option<&str>,
        update_date: DateTime<Utc>,
    ) -> ValidationResult<Self> {
        let race_type = place_data.race_type();
        let mut checks = Checks::default();
        let id = checks.check(place_data.place_id());
        checks.check(check_held_day_presence(race_type, held_day_data.is_some()));
        let grade = match (grade, race_type.is_mechanical_racing()) {
            (Some(g), true) => checks.check(validate_grade(race_type, g)).map(Some),
            (None, false) => Some(None),
            (Some(g), false) => checks.check::<Option<String>>(Err(ValidationError::field(
                race_type,
                "grade",
                g,
                "horse racing places carry no grade",
            ))),
            (None, true) => checks.check::<Option<String>>(Err(ValidationError::field(
                race_type,
                "grade",
                "",
                "required for mechanical racing places",
            ))),
        };
        checks.finish()?;
        Ok(Self {
            id: all_checked(id, race_type, "id")?,
            place_data,
            held_day_data,
            grade: all_checked(grade, race_type, "grade")?,
            update_date,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn race_type(&self) -> RaceType {
        self.place_data.race_type()
    }

    pub fn place_data(&self) -> &PlaceData {
        &self.place_data
    }

    pub fn held_day_data(&self) -> Option<&HeldDayData> {
        self.held_day_data.as_ref()
    }

    pub fn grade(&self) -> Option<&str> {
        self.grade.as_deref()
    }

    pub fn update_date(&self) -> DateTime<Utc> {
        self.update_date
    }
}

/// A calendar event as the calendar service holds it. `id` joins it to a [`RaceEntity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarData {
    pub id: String,
    pub race_type: RaceType,
    pub title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub location: String,
    pub description: String,
}

impl CalendarData {
    pub fn from_race_entity(entity: &RaceEntity) -> Self {
        let race = entity.race_data();
        let title = match entity.stage() {
            Some(stage) => format!("{} {}", race.name(), stage),
            None => race.name().to_string(),
        };
        let mut lines = vec![format!("{} {}R", race.location(), race.number())];
        match entity.stage() {
            Some(stage) => lines.push(format!("{} {}", race.grade(), stage)),
            None => lines.push(race.grade().to_string()),
        }
        if let Some(condition) = entity.condition_data() {
            lines.push(format!("{}{}m", condition.surface_type(), condition.distance()));
        }
        if let Some(held) = entity.held_day_data() {
            lines.push(format!("第{}回 {}日目", held.held_times(), held.held_day_times()));
        }
        lines.push(format!(
            "更新日時: {}",
            entity.update_date().format("%Y/%m/%d %H:%M:%S")
        ));
        Self {
            id: entity.id().to_string(),
            race_type: entity.race_type(),
            title,
            start: race.date_time(),
            end: race.date_time() + Duration::minutes(CALENDAR_EVENT_MINUTES),
            location: race.location().to_string(),
            description: lines.join("\n"),
        }
    }
}

/// Priority of one player, as supplied by the player data service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerData {
    pub race_type: RaceType,
    pub player_number: u32,
    pub priority: i32,
}

// Priority filter

pub fn race_priority(race_type: RaceType, grade: &str, stage: Option<&str>, display_grade_list: &[&str]) -> i32 {
    race_type.table().priority(grade, stage, display_grade_list)
}

fn entity_race_priority(entity: &RaceEntity, display_grade_list: &[&str]) -> i32 {
    race_priority(
        entity.race_type(),
        entity.race_data().grade(),
        entity.stage(),
        display_grade_list,
    )
}

pub fn max_player_priority(entity: &RaceEntity, player_data_list: &[PlayerData]) -> i32 {
    max_player_priority_with(entity, &player_priority_lookup(player_data_list))
}

/// A player listed more than once keeps their highest priority.
fn player_priority_lookup(player_data_list: &[PlayerData]) -> HashMap<(RaceType, u32), i32> {
    let mut lookup = HashMap::new();
    for p in player_data_list {
        lookup
            .entry((p.race_type, p.player_number))
            .and_modify(|priority: &mut i32| *priority = (*priority).max(p.priority))
            .or_insert(p.priority);
    }
    lookup
}

fn max_player_priority_with(entity: &RaceEntity, lookup: &HashMap<(RaceType, u32), i32>) -> i32 {
    entity
        .race_player_data_list()
        .iter()
        .map(|p| {
            lookup
                .get(&(p.race_type(), p.player_number()))
                .copied()
                .unwrap_or(0)
        })
        .max()
        .unwrap_or(0)
}

/// Keeps races whose race priority plus best player priority reaches [`PRIORITY_THRESHOLD`].
/// Input order is preserved.
pub fn filter_race_entity_list(
    race_entity_list: Vec<RaceEntity>,
    player_data_list: &[PlayerData],
    display_grade_list: &[&str],
) -> Vec<RaceEntity> {
    let lookup = player_priority_lookup(player_data_list);
    race_entity_list
        .into_iter()
        .filter(|entity| {
            entity_race_priority(entity, display_grade_list) + max_player_priority_with(entity, &lookup)
                >= PRIORITY_THRESHOLD
        })
        .collect()
}

// Calendar diff

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalendarDiff {
    pub to_delete: Vec<CalendarData>,
    pub to_upsert: Vec<RaceEntity>,
}

/// Events with no matching race are deleted; every filtered race is upserted.
pub fn diff_calendar(filtered_race_entity_list: &[RaceEntity], calendar_data_list: &[CalendarData]) -> CalendarDiff {
    let race_ids: HashSet<&str> = filtered_race_entity_list.iter().map(RaceEntity::id).collect();
    let to_delete: Vec<CalendarData> = calendar_data_list
        .iter()
        .filter(|event| !race_ids.contains(event.id.as_str()))
        .cloned()
        .collect();
    // No filtered race id is ever in `to_delete`, so this filter never excludes anything.
    let delete_ids: HashSet<&str> = to_delete.iter().map(|e| e.id.as_str()).collect();
    let to_upsert = filtered_race_entity_list
        .iter()
        .filter(|entity| !delete_ids.contains(entity.id()))
        .cloned()
        .collect();
    CalendarDiff { to_delete, to_upsert }
}

/// Query-side filter over races: an empty set means "no restriction".
#[derive(Debug, Clone, Default)]
pub struct RaceSearchFilter {
    pub grades: Vec<String>,
    pub locations: Vec<String>,
    pub stages: Vec<String>,
}

impl RaceSearchFilter {
    pub fn matches(&self, entity: &RaceEntity) -> bool {
        let race = entity.race_data();
        (self.grades.is_empty() || self.grades.iter().any(|g| g == race.grade()))
            && (self.locations.is_empty() || self.locations.iter().any(|l| l == race.location()))
            && (self.stages.is_empty()
                || entity
                    .stage()
                    .is_some_and(|stage| self.stages.iter().any(|s| s == stage)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn updated() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single().unwrap()
    }

    fn jra_race(grade: &str, number: u32) -> RaceEntity {
        let data = RaceData::new(RaceType::Jra, "日本ダービー", at(2024, 5, 26, 15, 40), "東京", grade, number).unwrap();
        RaceEntity::new(
            data,
            RaceEntityParts {
                held_day_data: Some(HeldDayData::new(2, 12).unwrap()),
                condition_data: Some(HorseRaceConditionData::new(RaceType::Jra, "芝", 2400).unwrap()),
                ..Default::default()
            },
            updated(),
        )
        .unwrap()
    }

    fn keirin_race(grade: &str, stage: &str, players: &[(u32, u32)]) -> RaceEntity {
        let data = RaceData::new(RaceType::Keirin, "日本選手権競輪", at(2024, 5, 5, 16, 30), "平塚", grade, 12).unwrap();
        let players = players
            .iter()
            .map(|(pos, num)| RacePlayerData::new(RaceType::Keirin, *pos, *num).unwrap())
            .collect();
        RaceEntity::new(
            data,
            RaceEntityParts {
                stage: Some(stage.to_string()),
                race_player_data_list: players,
                ..Default::default()
            },
            updated(),
        )
        .unwrap()
    }

    fn event(id: &str) -> CalendarData {
        CalendarData {
            id: id.to_string(),
            race_type: RaceType::Jra,
            title: "t".into(),
            start: at(2024, 6, 1, 10, 0),
            end: at(2024, 6, 1, 10, 10),
            location: "東京".into(),
            description: String::new(),
        }
    }

    #[test]
    fn every_table_grade_validates_to_itself() {
        for race_type in RaceType::ALL {
            for grade in race_type.table().grades {
                assert_eq!(validate_grade(race_type, grade).unwrap(), *grade);
            }
        }
    }

    #[test]
    fn unknown_grade_error_names_race_type() {
        let err = validate_grade(RaceType::Boatrace, "GP").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("BOATRACE"), "{msg}");
        assert!(msg.contains("grade"), "{msg}");
        assert!(validate_grade(RaceType::Keirin, "GP").is_ok());
    }

    #[test]
    fn race_type_parses_case_insensitively() {
        assert_eq!("jra".parse::<RaceType>().unwrap(), RaceType::Jra);
        assert_eq!("AutoRace".parse::<RaceType>().unwrap(), RaceType::Autorace);
        assert!("horse".parse::<RaceType>().is_err());
        assert_eq!(serde_json::to_string(&RaceType::Keirin).unwrap(), "\"KEIRIN\"");
    }

    #[test]
    fn race_data_factory_aggregates_field_errors() {
        let err = RaceData::new(RaceType::Jra, "  ", at(2024, 1, 1, 10, 0), "大井", "SG", 13).unwrap_err();
        let fields: Vec<_> = err.field_errors().iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["name", "location", "grade", "number"]);
        assert!(err.to_string().contains("; "));
    }

    #[test]
    fn copy_without_overrides_is_identity() {
        let race = jra_race("GⅠ", 11);
        assert_eq!(race.race_data().copy(RaceDataPatch::default()).unwrap(), *race.race_data());
        assert_eq!(race.copy(RaceEntityPatch::default()).unwrap(), race);
    }

    #[test]
    fn copy_with_invalid_field_fails() {
        let race = jra_race("GⅠ", 11);
        let bad_number = race.race_data().copy(RaceDataPatch {
            number: Some(0),
            ..Default::default()
        });
        assert!(bad_number.is_err());
        let bad_grade = race.race_data().copy(RaceDataPatch {
            grade: Some("S級".into()),
            ..Default::default()
        });
        assert!(bad_grade.is_err());
        let bad_stage = race.copy(RaceEntityPatch {
            stage: Some(Some("優勝戦".into())),
            ..Default::default()
        });
        assert!(bad_stage.is_err());
    }

    #[test]
    fn copy_regenerates_id_from_new_race_data() {
        let race = jra_race("GⅠ", 11);
        let moved = race
            .copy(RaceEntityPatch {
                race_data: Some(
                    race.race_data()
                        .copy(RaceDataPatch {
                            number: Some(10),
                            ..Default::default()
                        })
                        .unwrap(),
                ),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(moved.id(), "jra202405260510");
        assert_eq!(race.id(), "jra202405260511");
    }

    #[test]
    fn race_entity_enforces_race_type_specific_parts() {
        let jra = RaceData::new(RaceType::Jra, "皐月賞", at(2024, 4, 14, 15, 40), "中山", "GⅠ", 11).unwrap();
        let missing_held_day = RaceEntity::new(
            jra.clone(),
            RaceEntityParts {
                condition_data: Some(HorseRaceConditionData::new(RaceType::Jra, "芝", 2000).unwrap()),
                ..Default::default()
            },
            updated(),
        );
        assert!(missing_held_day.is_err());

        let boat = RaceData::new(RaceType::Boatrace, "グランプリ", at(2024, 12, 22, 16, 30), "住之江", "SG", 12).unwrap();
        let no_stage = RaceEntity::new(boat.clone(), RaceEntityParts::default(), updated());
        assert!(no_stage.is_err());
        let with_condition = RaceEntity::new(
            boat,
            RaceEntityParts {
                stage: Some("優勝戦".into()),
                condition_data: Some(HorseRaceConditionData::new(RaceType::Jra, "芝", 2000).unwrap()),
                ..Default::default()
            },
            updated(),
        );
        assert!(with_condition.is_err());

        let staged_jra = RaceEntity::new(
            jra,
            RaceEntityParts {
                held_day_data: Some(HeldDayData::new(3, 8).unwrap()),
                condition_data: Some(HorseRaceConditionData::new(RaceType::Jra, "芝", 2000).unwrap()),
                stage: Some("S級決勝".into()),
                ..Default::default()
            },
            updated(),
        )
        .unwrap_err();
        assert!(staged_jra.field_errors().iter().any(|e| e.field == "stage"));

        let nar = RaceData::new(RaceType::Nar, "東京大賞典", at(2024, 12, 29, 15, 40), "大井", "GⅠ", 11).unwrap();
        let nar_held_day = RaceEntity::new(
            nar,
            RaceEntityParts {
                held_day_data: Some(HeldDayData::new(1, 1).unwrap()),
                condition_data: Some(HorseRaceConditionData::new(RaceType::Nar, "ダート", 2000).unwrap()),
                ..Default::default()
            },
            updated(),
        )
        .unwrap_err();
        assert!(nar_held_day.field_errors().iter().any(|e| e.field == "heldDayData"));

        let keirin = RaceData::new(RaceType::Keirin, "競輪祭", at(2024, 11, 24, 16, 30), "小倉", "GⅠ", 11).unwrap();
        let keirin_held_day = RaceEntity::new(
            keirin,
            RaceEntityParts {
                held_day_data: Some(HeldDayData::new(1, 1).unwrap()),
                stage: Some("S級決勝".into()),
                ..Default::default()
            },
            updated(),
        )
        .unwrap_err();
        assert_eq!(keirin_held_day.field_errors().len(), 1);
        assert_eq!(keirin_held_day.field_errors()[0].field, "heldDayData");
    }

    #[test]
    fn position_number_ranges_depend_on_race_type() {
        assert!(RacePlayerData::new(RaceType::Autorace, 8, 1001).is_ok());
        assert!(RacePlayerData::new(RaceType::Autorace, 9, 1001).is_err());
        assert!(RacePlayerData::new(RaceType::Boatrace, 6, 4444).is_ok());
        assert!(RacePlayerData::new(RaceType::Boatrace, 7, 4444).is_err());
        assert!(RacePlayerData::new(RaceType::Keirin, 9, 15000).is_ok());
        assert!(RacePlayerData::new(RaceType::Keirin, 0, 15000).is_err());
        assert!(RacePlayerData::new(RaceType::Jra, 1, 1).is_err());
    }

    #[test]
    fn duplicate_positions_are_rejected() {
        let data = RaceData::new(RaceType::Keirin, "競輪祭", at(2024, 11, 24, 16, 30), "小倉", "GⅠ", 11).unwrap();
        let result = RaceEntity::new(
            data,
            RaceEntityParts {
                stage: Some("S級決勝".into()),
                race_player_data_list: vec![
                    RacePlayerData::new(RaceType::Keirin, 1, 100).unwrap(),
                    RacePlayerData::new(RaceType::Keirin, 1, 200).unwrap(),
                ],
                ..Default::default()
            },
            updated(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn ids_are_deterministic_and_zero_padded() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let a = generate_race_id(RaceType::Autorace, date, "川口", 1).unwrap();
        let b = generate_race_id(RaceType::Autorace, date, "川口", 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "autorace202402010201");
        assert_eq!(
            generate_race_player_id(RaceType::Autorace, date, "川口", 1, 8).unwrap(),
            "autorace20240201020108"
        );
        assert_eq!(generate_place_id(RaceType::Keirin, date, "平塚").unwrap(), "keirin2024020135");
        assert!(generate_race_id(RaceType::Autorace, date, "東京", 1).is_err());
    }

    #[test]
    fn with_id_rejects_mismatched_ids() {
        let race = jra_race("GⅠ", 11);
        let parts = || RaceEntityParts {
            held_day_data: race.held_day_data().copied(),
            condition_data: race.condition_data().cloned(),
            ..Default::default()
        };
        assert!(RaceEntity::with_id(race.id(), race.race_data().clone(), parts(), updated()).is_ok());
        assert!(RaceEntity::with_id("jra202405260599", race.race_data().clone(), parts(), updated()).is_err());
        assert!(RaceEntity::with_id("nar202405260511", race.race_data().clone(), parts(), updated()).is_err());
    }

    #[test]
    fn filter_threshold_applies_to_the_sum() {
        let grades = display_grades(RaceType::Jra);
        // GⅢ = 6, J.GⅢ = 5
        let kept = filter_race_entity_list(vec![jra_race("GⅢ", 11)], &[], &grades);
        assert_eq!(kept.len(), 1);
        let dropped = filter_race_entity_list(vec![jra_race("J.GⅢ", 11)], &[], &grades);
        assert!(dropped.is_empty());

        // FⅠ S級予選 has no priority record, so a priority-6 player alone carries it.
        let race = keirin_race("FⅠ", "S級予選", &[(1, 14000), (2, 15000)]);
        assert_eq!(
            race_priority(RaceType::Keirin, "FⅠ", Some("S級予選"), &display_grades(RaceType::Keirin)),
            0
        );
        let players = [PlayerData {
            race_type: RaceType::Keirin,
            player_number: 15000,
            priority: 6,
        }];
        assert_eq!(max_player_priority(&race, &players), 6);
        let kept = filter_race_entity_list(vec![race], &players, &display_grades(RaceType::Keirin));
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn filter_ignores_players_of_other_race_types_and_non_display_grades() {
        let race = keirin_race("GⅠ", "S級決勝", &[(1, 14000)]);
        let players = [PlayerData {
            race_type: RaceType::Boatrace,
            player_number: 14000,
            priority: 9,
        }];
        assert_eq!(max_player_priority(&race, &players), 0);
        assert!(filter_race_entity_list(vec![race.clone()], &players, &["GⅡ"]).is_empty());
        assert_eq!(filter_race_entity_list(vec![race], &players, &["GⅠ"]).len(), 1);
    }

    #[test]
    fn duplicate_player_entries_keep_highest_priority() {
        let race = keirin_race("FⅠ", "S級予選", &[(1, 15000)]);
        let entry = |priority| PlayerData {
            race_type: RaceType::Keirin,
            player_number: 15000,
            priority,
        };
        let players = [entry(6), entry(1)];
        assert_eq!(max_player_priority(&race, &players), 6);
        let reversed = [entry(1), entry(6)];
        assert_eq!(max_player_priority(&race, &reversed), 6);
        let kept = filter_race_entity_list(vec![race], &players, &display_grades(RaceType::Keirin));
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn diff_deletes_stale_events_and_upserts_every_race() {
        let races: Vec<RaceEntity> = (1..=5).map(|n| jra_race("GⅠ", n)).collect();
        let mut calendar: Vec<CalendarData> = races.iter().map(CalendarData::from_race_entity).collect();
        for n in 6..=8 {
            calendar.push(event(&format!("jra2024052605{n:02}")));
        }

        let diff = diff_calendar(&races, &calendar);
        let deleted: Vec<_> = diff.to_delete.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(deleted, vec!["jra202405260506", "jra202405260507", "jra202405260508"]);
        assert_eq!(diff.to_upsert, races);
    }

    #[test]
    fn calendar_event_spans_ten_minutes_and_carries_stage_in_title() {
        let race = keirin_race("GⅠ", "S級決勝", &[]);
        let event = CalendarData::from_race_entity(&race);
        assert_eq!(event.id, race.id());
        assert_eq!(event.title, "日本選手権競輪 S級決勝");
        assert_eq!(event.end - event.start, Duration::minutes(10));
        assert!(event.description.contains("GⅠ S級決勝"));
    }

    #[test]
    fn search_filter_treats_empty_sets_as_unrestricted() {
        let race = jra_race("GⅠ", 11);
        assert!(RaceSearchFilter::default().matches(&race));
        let filter = RaceSearchFilter {
            grades: vec!["GⅠ".into()],
            locations: vec!["東京".into()],
            stages: vec![],
        };
        assert!(filter.matches(&race));
        let filter = RaceSearchFilter {
            locations: vec!["中山".into()],
            ..Default::default()
        };
        assert!(!filter.matches(&race));
        let filter = RaceSearchFilter {
            stages: vec!["S級決勝".into()],
            ..Default::default()
        };
        assert!(!filter.matches(&race));
    }
}
