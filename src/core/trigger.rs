//! Trigger normalization and next-occurrence calculation.
//!
//! Schedules arrive in three heterogeneous forms — cron (string or
//! per-field struct), fixed interval (seconds, duration string, or a
//! `{weeks,days,hours,minutes,seconds}` struct), and one-shot ISO-8601
//! dates. [`RawTrigger::normalize`] folds all of them into the canonical
//! [`TriggerSpec`], rejecting invalid or ambiguous input up front so that
//! nothing fails at fire time.

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised during trigger normalization.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// Invalid cron expression or cron field.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval specification.
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// Invalid date specification.
    #[error("invalid date: {0}")]
    InvalidDate(String),

    /// Unknown IANA timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// More than one trigger kind was supplied.
    #[error("conflicting trigger: supplied {0}, expected exactly one of cron/interval/date")]
    ConflictingTrigger(String),

    /// No trigger kind was supplied.
    #[error("missing trigger: expected one of cron/interval/date")]
    MissingTrigger,
}

/// The trigger model a [`TriggerSpec`] was normalized from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Cron,
    Interval,
    Date,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Cron => write!(f, "cron"),
            TriggerKind::Interval => write!(f, "interval"),
            TriggerKind::Date => write!(f, "date"),
        }
    }
}

/// Cron field patterns, one per position, plus an optional timezone.
///
/// Fields hold validated pattern strings (`"*"`, `"*/5"`, `"0"`,
/// `"1-5"`, `"0,30"`). The `second` field defaults to `"0"` when the
/// input was a standard 5-field expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronFields {
    pub second: String,
    pub minute: String,
    pub hour: String,
    pub day: String,
    pub month: String,
    pub day_of_week: String,
    /// IANA timezone the expression is evaluated in (UTC when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl CronFields {
    /// Assemble the six fields into a single expression string.
    fn expression(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.second, self.minute, self.hour, self.day, self.month, self.day_of_week
        )
    }

    fn parse_schedule(&self) -> Result<CronSchedule, TriggerError> {
        CronSchedule::from_str(&self.expression())
            .map_err(|e| TriggerError::InvalidCron(e.to_string()))
    }

    fn parse_timezone(&self) -> Result<Tz, TriggerError> {
        match self.timezone.as_deref() {
            None => Ok(chrono_tz::UTC),
            Some(tz) => tz
                .parse::<Tz>()
                .map_err(|_| TriggerError::InvalidTimezone(tz.to_string())),
        }
    }
}

/// Canonical, backend-independent schedule definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TriggerSpec {
    /// Recurring cron schedule.
    Cron { fields: CronFields },
    /// Fixed recurring interval.
    Interval {
        #[serde(with = "serde_duration")]
        every: Duration,
    },
    /// One-shot absolute UTC instant.
    Date { at: DateTime<Utc> },
}

impl TriggerSpec {
    /// The trigger model this spec was normalized from.
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerSpec::Cron { .. } => TriggerKind::Cron,
            TriggerSpec::Interval { .. } => TriggerKind::Interval,
            TriggerSpec::Date { .. } => TriggerKind::Date,
        }
    }

    /// Stable textual form used for identity hashing.
    ///
    /// Two triggers with the same canonical form fire identically, so
    /// derived schedule ids collide exactly when the caller re-registers
    /// an unchanged schedule.
    pub fn canonical(&self) -> String {
        match self {
            TriggerSpec::Cron { fields } => match fields.timezone.as_deref() {
                Some(tz) => format!("cron:{}@{}", fields.expression(), tz),
                None => format!("cron:{}", fields.expression()),
            },
            TriggerSpec::Interval { every } => format!("interval:{}s", every.as_secs()),
            TriggerSpec::Date { at } => format!("date:{}", at.to_rfc3339()),
        }
    }

    /// Next fire instant strictly after `after`, or `None` when the
    /// trigger has no further occurrences (a date already in the past).
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TriggerError> {
        match self {
            TriggerSpec::Cron { fields } => {
                let schedule = fields.parse_schedule()?;
                let tz = fields.parse_timezone()?;
                let local = after.with_timezone(&tz);
                Ok(schedule
                    .after(&local)
                    .next()
                    .map(|dt| dt.with_timezone(&Utc)))
            }
            TriggerSpec::Interval { every } => {
                let step = chrono::Duration::from_std(*every)
                    .map_err(|e| TriggerError::InvalidInterval(e.to_string()))?;
                Ok(Some(after + step))
            }
            TriggerSpec::Date { at } => {
                if *at > after {
                    Ok(Some(*at))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

/// Cron trigger input: a 5- or 6-field expression string, or explicit
/// per-field patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CronInput {
    Expression(String),
    Fields {
        #[serde(default)]
        second: Option<String>,
        #[serde(default)]
        minute: Option<String>,
        #[serde(default)]
        hour: Option<String>,
        #[serde(default)]
        day: Option<String>,
        #[serde(default)]
        month: Option<String>,
        #[serde(default)]
        day_of_week: Option<String>,
    },
}

/// Interval trigger input: whole seconds, a compact duration string
/// (`"1h30m"`), or a parts struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntervalInput {
    Seconds(u64),
    Text(String),
    Parts {
        #[serde(default)]
        weeks: u64,
        #[serde(default)]
        days: u64,
        #[serde(default)]
        hours: u64,
        #[serde(default)]
        minutes: u64,
        #[serde(default)]
        seconds: u64,
    },
}

/// A trigger declaration as it arrives from configuration or the CLI.
///
/// Exactly one of the three fields must be present; `timezone` only
/// applies to cron triggers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<CronInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<IntervalInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl RawTrigger {
    /// Build a raw trigger from a cron expression string.
    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            cron: Some(CronInput::Expression(expression.into())),
            ..Default::default()
        }
    }

    /// Build a raw trigger from whole interval seconds.
    pub fn interval_secs(seconds: u64) -> Self {
        Self {
            interval: Some(IntervalInput::Seconds(seconds)),
            ..Default::default()
        }
    }

    /// Build a raw trigger from a compact duration string.
    pub fn interval_str(text: impl Into<String>) -> Self {
        Self {
            interval: Some(IntervalInput::Text(text.into())),
            ..Default::default()
        }
    }

    /// Build a raw trigger from an ISO-8601 date string.
    pub fn date(date: impl Into<String>) -> Self {
        Self {
            date: Some(date.into()),
            ..Default::default()
        }
    }

    /// Check whether any trigger field is present.
    pub fn is_empty(&self) -> bool {
        self.cron.is_none() && self.interval.is_none() && self.date.is_none()
    }

    /// Normalize into the canonical [`TriggerSpec`].
    pub fn normalize(&self) -> Result<TriggerSpec, TriggerError> {
        let supplied: Vec<&str> = [
            self.cron.as_ref().map(|_| "cron"),
            self.interval.as_ref().map(|_| "interval"),
            self.date.as_ref().map(|_| "date"),
        ]
        .into_iter()
        .flatten()
        .collect();

        match supplied.len() {
            0 => return Err(TriggerError::MissingTrigger),
            1 => {}
            _ => return Err(TriggerError::ConflictingTrigger(supplied.join("+"))),
        }

        if let Some(cron) = &self.cron {
            return normalize_cron(cron, self.timezone.as_deref()).map(|fields| {
                TriggerSpec::Cron { fields }
            });
        }

        if let Some(interval) = &self.interval {
            let every = normalize_interval(interval)?;
            return Ok(TriggerSpec::Interval { every });
        }

        // Checked above: exactly one field is present.
        let date = self.date.as_deref().ok_or(TriggerError::MissingTrigger)?;
        Ok(TriggerSpec::Date {
            at: parse_utc_date(date)?,
        })
    }
}

/// Validate a single cron field pattern.
///
/// Accepts digits, wildcard, list, range, and step characters. Named
/// values (`MON`, `JAN`) are rejected; patterns are numeric only.
fn validate_cron_field(field: &str, position: &str) -> Result<(), TriggerError> {
    if field.is_empty() {
        return Err(TriggerError::InvalidCron(format!(
            "empty {} field",
            position
        )));
    }
    for c in field.chars() {
        if !(c.is_ascii_digit() || matches!(c, '*' | ',' | '-' | '/')) {
            return Err(TriggerError::InvalidCron(format!(
                "invalid token {:?} in {} field",
                field, position
            )));
        }
    }
    Ok(())
}

const CRON_POSITIONS: [&str; 6] = ["second", "minute", "hour", "day", "month", "day_of_week"];

fn normalize_cron(input: &CronInput, timezone: Option<&str>) -> Result<CronFields, TriggerError> {
    let parts: Vec<String> = match input {
        CronInput::Expression(expr) => {
            let fields: Vec<&str> = expr.split_whitespace().collect();
            match fields.len() {
                // Standard 5-field cron: prepend a zero seconds field.
                5 => std::iter::once("0")
                    .chain(fields)
                    .map(str::to_string)
                    .collect(),
                6 => fields.iter().map(|s| s.to_string()).collect(),
                n => {
                    return Err(TriggerError::InvalidCron(format!(
                        "expected 5 or 6 fields, got {}",
                        n
                    )));
                }
            }
        }
        CronInput::Fields {
            second,
            minute,
            hour,
            day,
            month,
            day_of_week,
        } => vec![
            second.clone().unwrap_or_else(|| "0".into()),
            minute.clone().unwrap_or_else(|| "*".into()),
            hour.clone().unwrap_or_else(|| "*".into()),
            day.clone().unwrap_or_else(|| "*".into()),
            month.clone().unwrap_or_else(|| "*".into()),
            day_of_week.clone().unwrap_or_else(|| "*".into()),
        ],
    };

    for (field, position) in parts.iter().zip(CRON_POSITIONS) {
        validate_cron_field(field, position)?;
    }

    let fields = CronFields {
        second: parts[0].clone(),
        minute: parts[1].clone(),
        hour: parts[2].clone(),
        day: parts[3].clone(),
        month: parts[4].clone(),
        day_of_week: parts[5].clone(),
        timezone: timezone.map(str::to_string),
    };

    // Authoritative parse: field-level checks above catch the obvious,
    // the cron crate enforces ranges and step syntax.
    fields.parse_schedule()?;
    fields.parse_timezone()?;

    Ok(fields)
}

fn normalize_interval(input: &IntervalInput) -> Result<Duration, TriggerError> {
    let total_secs = match input {
        IntervalInput::Seconds(s) => *s,
        IntervalInput::Text(text) => parse_duration_secs(text)?,
        IntervalInput::Parts {
            weeks,
            days,
            hours,
            minutes,
            seconds,
        } => weeks * 604_800 + days * 86_400 + hours * 3_600 + minutes * 60 + seconds,
    };

    if total_secs == 0 {
        return Err(TriggerError::InvalidInterval(
            "interval must be greater than zero seconds".into(),
        ));
    }

    Ok(Duration::from_secs(total_secs))
}

/// Parse a compact duration string like `"1h30m"`, `"2d"`, or `"45s"`.
///
/// Recognizes a sequence of `<integer><unit>` tokens with units
/// `w`/`d`/`h`/`m`/`s` (case-insensitive), summed.
pub fn parse_duration_secs(s: &str) -> Result<u64, TriggerError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(TriggerError::InvalidInterval("empty duration".into()));
    }

    let mut total: u64 = 0;
    let mut current = String::new();

    for c in trimmed.chars() {
        if c.is_ascii_digit() {
            current.push(c);
            continue;
        }

        let value: u64 = current
            .parse()
            .map_err(|_| TriggerError::InvalidInterval(s.to_string()))?;
        current.clear();

        let unit_secs = match c.to_ascii_lowercase() {
            'w' => 604_800,
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => return Err(TriggerError::InvalidInterval(s.to_string())),
        };
        total += value * unit_secs;
    }

    // Trailing digits without a unit ("90" or "1h30") are malformed.
    if !current.is_empty() {
        return Err(TriggerError::InvalidInterval(s.to_string()));
    }

    Ok(total)
}

/// Parse an ISO-8601 date string into a UTC instant.
///
/// The offset is mandatory; a timestamp that parses as a naive local
/// datetime is rejected rather than guessed at.
fn parse_utc_date(s: &str) -> Result<DateTime<Utc>, TriggerError> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => Ok(dt.with_timezone(&Utc)),
        Err(e) => {
            let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"));
            if naive.is_ok() {
                Err(TriggerError::InvalidDate(format!(
                    "{}: missing UTC offset",
                    s
                )))
            } else {
                Err(TriggerError::InvalidDate(format!("{}: {}", s, e)))
            }
        }
    }
}

/// Serde helper: durations persisted as whole seconds.
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
