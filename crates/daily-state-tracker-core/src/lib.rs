//! Record schema, normalization, and export formats for the daily state tracker.
//!
//! Every value that reaches storage passes through [`normalize_record`] or
//! [`normalize_payload`]; both accept arbitrary JSON and never fail.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use time::{Date, OffsetDateTime, UtcOffset};

mod export;

pub use export::{
    build_csv, export_backup_json, parse_backup_json, CSV_EXPORT_FILE_NAME,
    JSON_BACKUP_FILE_NAME,
};

pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_STORAGE_KEY: &str = "daily_state_tracker";
pub const MEMO_FIELD: &str = "memo";
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(400);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TrackerError {
    #[error("import error: {0}")]
    Import(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RatingField {
    PreSleepCalmness,
    SleepRecovery,
    WakeUpState,
    ExerciseQuality,
    DeepWork,
    TaskClosure,
    StressManageability,
    SocialInteraction,
    Presence,
    DeepExperience,
}

impl RatingField {
    /// Rating fields in their fixed column order.
    pub const ALL: [Self; 10] = [
        Self::PreSleepCalmness,
        Self::SleepRecovery,
        Self::WakeUpState,
        Self::ExerciseQuality,
        Self::DeepWork,
        Self::TaskClosure,
        Self::StressManageability,
        Self::SocialInteraction,
        Self::Presence,
        Self::DeepExperience,
    ];

    pub const COUNT: usize = Self::ALL.len();

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreSleepCalmness => "pre_sleep_calmness",
            Self::SleepRecovery => "sleep_recovery",
            Self::WakeUpState => "wake_up_state",
            Self::ExerciseQuality => "exercise_quality",
            Self::DeepWork => "deep_work",
            Self::TaskClosure => "task_closure",
            Self::StressManageability => "stress_manageability",
            Self::SocialInteraction => "social_interaction",
            Self::Presence => "presence",
            Self::DeepExperience => "deep_experience",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pre_sleep_calmness" => Some(Self::PreSleepCalmness),
            "sleep_recovery" => Some(Self::SleepRecovery),
            "wake_up_state" => Some(Self::WakeUpState),
            "exercise_quality" => Some(Self::ExerciseQuality),
            "deep_work" => Some(Self::DeepWork),
            "task_closure" => Some(Self::TaskClosure),
            "stress_manageability" => Some(Self::StressManageability),
            "social_interaction" => Some(Self::SocialInteraction),
            "presence" => Some(Self::Presence),
            "deep_experience" => Some(Self::DeepExperience),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::PreSleepCalmness => "Pre-sleep calmness",
            Self::SleepRecovery => "Sleep recovery",
            Self::WakeUpState => "Wake-up state",
            Self::ExerciseQuality => "Exercise quality",
            Self::DeepWork => "Deep work",
            Self::TaskClosure => "Task closure",
            Self::StressManageability => "Stress manageability",
            Self::SocialInteraction => "Social interaction",
            Self::Presence => "Presence",
            Self::DeepExperience => "Deep experience",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl Display for RatingField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All record field names in persisted order: the ratings, then `memo`.
pub fn record_field_names() -> impl Iterator<Item = &'static str> {
    RatingField::ALL
        .into_iter()
        .map(RatingField::as_str)
        .chain(std::iter::once(MEMO_FIELD))
}

/// A star rating in `1..=5`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Rating(u8);

impl Rating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    #[must_use]
    pub fn new(value: i64) -> Option<Self> {
        if (i64::from(Self::MIN)..=i64::from(Self::MAX)).contains(&value) {
            u8::try_from(value).ok().map(Self)
        } else {
            None
        }
    }

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

impl Display for Rating {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ratings and memo for one calendar date.
///
/// A `Record` can only hold in-range ratings, so any value of this type
/// already satisfies the persisted shape.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Record {
    ratings: [Option<Rating>; RatingField::COUNT],
    memo: String,
}

impl Record {
    #[must_use]
    pub fn rating(&self, field: RatingField) -> Option<Rating> {
        self.ratings[field.index()]
    }

    pub fn set_rating(&mut self, field: RatingField, rating: Option<Rating>) {
        self.ratings[field.index()] = rating;
    }

    #[must_use]
    pub fn memo(&self) -> &str {
        &self.memo
    }

    pub fn set_memo(&mut self, memo: impl Into<String>) {
        self.memo = memo.into();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ratings.iter().all(Option::is_none) && self.memo.is_empty()
    }

    /// Persisted object form. Empty ratings are written as `""`.
    #[must_use]
    pub fn to_json_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for field in RatingField::ALL {
            let value = match self.rating(field) {
                Some(rating) => Value::from(rating.get()),
                None => Value::String(String::new()),
            };
            map.insert(field.as_str().to_string(), value);
        }
        map.insert(MEMO_FIELD.to_string(), Value::String(self.memo.clone()));
        map
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.to_json_map())
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(normalize_record(&value))
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StoragePayload {
    pub schema_version: u32,
    pub records: BTreeMap<String, Record>,
}

impl StoragePayload {
    #[must_use]
    pub fn empty() -> Self {
        Self::empty_with_version(SCHEMA_VERSION)
    }

    #[must_use]
    pub fn empty_with_version(schema_version: u32) -> Self {
        Self {
            schema_version,
            records: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let records = self
            .records
            .iter()
            .map(|(date, record)| (date.clone(), record.to_value()))
            .collect::<Map<String, Value>>();

        let mut map = Map::new();
        map.insert(
            "schema_version".to_string(),
            Value::from(self.schema_version),
        );
        map.insert("records".to_string(), Value::Object(records));
        Value::Object(map)
    }
}

impl Default for StoragePayload {
    fn default() -> Self {
        Self::empty()
    }
}

impl Serialize for StoragePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StoragePayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(normalize_payload(&value))
    }
}

#[must_use]
pub fn build_empty_record() -> Record {
    Record::default()
}

/// Coerces arbitrary JSON into a fully populated [`Record`].
///
/// Ratings survive only as integers (or integer-prefixed strings) in
/// `1..=5`; memo survives only as a string. Unknown keys are dropped.
#[must_use]
pub fn normalize_record(input: &Value) -> Record {
    let mut record = build_empty_record();
    let Some(object) = input.as_object() else {
        return record;
    };

    for field in RatingField::ALL {
        record.set_rating(field, object.get(field.as_str()).and_then(coerce_rating));
    }

    if let Some(Value::String(memo)) = object.get(MEMO_FIELD) {
        record.memo.clone_from(memo);
    }

    record
}

#[must_use]
pub fn normalize_payload(input: &Value) -> StoragePayload {
    normalize_payload_with_version(input, SCHEMA_VERSION)
}

/// Same as [`normalize_payload`] but stamps `schema_version` explicitly.
///
/// The stored version is never inspected; it is always overwritten.
#[must_use]
pub fn normalize_payload_with_version(input: &Value, schema_version: u32) -> StoragePayload {
    let mut payload = StoragePayload::empty_with_version(schema_version);
    let Some(records) = input
        .as_object()
        .and_then(|object| object.get("records"))
        .and_then(Value::as_object)
    else {
        return payload;
    };

    for (date, raw) in records {
        payload.records.insert(date.clone(), normalize_record(raw));
    }

    payload
}

/// Shallow-merges `partial` over `existing` and renormalizes the result.
#[must_use]
pub fn merge_partial(existing: &Record, partial: &Map<String, Value>) -> Record {
    let mut merged = existing.to_json_map();
    for (key, value) in partial {
        merged.insert(key.clone(), value.clone());
    }
    normalize_record(&Value::Object(merged))
}

fn coerce_rating(value: &Value) -> Option<Rating> {
    match value {
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                return Rating::new(integer);
            }
            let float = number.as_f64()?;
            if float.fract() != 0.0 || !(1.0..=5.0).contains(&float) {
                return None;
            }
            #[allow(clippy::cast_possible_truncation)]
            Rating::new(float as i64)
        }
        Value::String(text) => parse_integer_prefix(text).and_then(Rating::new),
        _ => None,
    }
}

/// Parses a leading base-10 integer, ignoring leading whitespace and any
/// trailing text (`" 4 stars"` is 4). Returns `None` when no digit leads.
fn parse_integer_prefix(text: &str) -> Option<i64> {
    let trimmed = text.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let mut value: i64 = 0;
    let mut seen_digit = false;
    for byte in digits.bytes() {
        if !byte.is_ascii_digit() {
            break;
        }
        seen_digit = true;
        value = value
            .saturating_mul(10)
            .saturating_add(i64::from(byte - b'0'));
    }

    if !seen_digit {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Formats a date as its record key, `YYYY-MM-DD`.
#[must_use]
pub fn date_key(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Parses a `YYYY-MM-DD` record key.
///
/// # Errors
/// Returns [`TrackerError::Validation`] when the text is not a calendar date
/// in that format.
pub fn parse_date_key(value: &str) -> Result<Date, TrackerError> {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    Date::parse(value, &format)
        .map_err(|err| TrackerError::Validation(format!("invalid date key {value:?}: {err}")))
}

/// The calendar day before `date`.
///
/// # Errors
/// Returns [`TrackerError::Validation`] for the first representable date.
pub fn previous_day(date: Date) -> Result<Date, TrackerError> {
    date.previous_day().ok_or_else(|| {
        TrackerError::Validation(format!("no calendar day before {}", date_key(date)))
    })
}

/// Source of "today" for the writable record.
pub trait Clock: Send + Sync {
    fn today(&self) -> Date;
}

/// Local calendar date, using the UTC offset captured at construction.
#[derive(Debug, Clone, Copy)]
pub struct LocalClock {
    offset: UtcOffset,
}

impl LocalClock {
    /// Captures the local UTC offset, falling back to UTC when the platform
    /// cannot report it. Call before spawning threads.
    #[must_use]
    pub fn detect() -> Self {
        let offset = match UtcOffset::current_local_offset() {
            Ok(offset) => offset,
            Err(err) => {
                tracing::warn!(error = %err, "local UTC offset unavailable; using UTC dates");
                UtcOffset::UTC
            }
        };
        Self { offset }
    }

    #[must_use]
    pub fn with_offset(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Clock for LocalClock {
    fn today(&self) -> Date {
        OffsetDateTime::now_utc().to_offset(self.offset).date()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FixedClock(pub Date);

impl Clock for FixedClock {
    fn today(&self) -> Date {
        self.0
    }
}

/// Coalesces rapid partial edits into one write after a quiet period.
#[derive(Debug, Clone)]
pub struct EditDebouncer {
    quiet_period: Duration,
    pending: Option<Map<String, Value>>,
    last_push: Option<Instant>,
}

impl EditDebouncer {
    #[must_use]
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            pending: None,
            last_push: None,
        }
    }

    /// Merges `partial` into the pending batch and restarts the quiet period.
    pub fn push(&mut self, partial: Map<String, Value>, now: Instant) {
        let pending = self.pending.get_or_insert_with(Map::new);
        for (key, value) in partial {
            pending.insert(key, value);
        }
        self.last_push = Some(now);
    }

    /// Returns the pending batch once the quiet period has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<Map<String, Value>> {
        let last_push = self.last_push?;
        if now.saturating_duration_since(last_push) < self.quiet_period {
            return None;
        }
        self.flush()
    }

    /// Time left before [`EditDebouncer::poll`] would release the batch.
    #[must_use]
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        self.last_push.map(|last_push| {
            self.quiet_period
                .saturating_sub(now.saturating_duration_since(last_push))
        })
    }

    pub fn flush(&mut self) -> Option<Map<String, Value>> {
        self.last_push = None;
        self.pending.take()
    }
}

impl Default for EditDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_PERIOD)
    }
}
