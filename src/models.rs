use std::collections::HashMap;

use chrono::{FixedOffset, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize, Serializer};

use crate::text::{clean_list, clean_text};

/// A field that heterogeneous sources emit either as a scalar or as a list
/// (JSON-LD `performer`, `image`, ...). Deserializes from both shapes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

/// A calendar date, or the raw text of a date range whose bounds could not be
/// parsed into individual days.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DateValue {
    Day(NaiveDate),
    Raw(String),
}

impl DateValue {
    /// Every calendar date recoverable from this value. Raw strings are
    /// scanned token by token for ISO `yyyy-mm-dd` prefixes.
    pub fn days(&self) -> Vec<NaiveDate> {
        match self {
            DateValue::Day(day) => vec![*day],
            DateValue::Raw(raw) => raw
                .split_whitespace()
                .filter_map(|token| {
                    let prefix = token.get(..10)?;
                    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
                })
                .collect(),
        }
    }
}

impl std::fmt::Display for DateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateValue::Day(day) => write!(f, "{}", day.format("%Y-%m-%d")),
            DateValue::Raw(raw) => f.write_str(raw),
        }
    }
}

impl Serialize for DateValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A time of day, optionally qualified with a fixed UTC offset. The offset is
/// attached by the standardizer against the event's own date so DST-observing
/// zones serialize unambiguously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTime {
    pub time: NaiveTime,
    pub offset: Option<FixedOffset>,
}

impl EventTime {
    pub fn naive(time: NaiveTime) -> Self {
        Self { time, offset: None }
    }

    pub fn with_offset(time: NaiveTime, offset: FixedOffset) -> Self {
        Self {
            time,
            offset: Some(offset),
        }
    }
}

impl std::fmt::Display for EventTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{}{}", self.time.format("%H:%M:%S"), offset),
            None => write!(f, "{}", self.time.format("%H:%M:%S")),
        }
    }
}

impl Serialize for EventTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Canonical event listing. Constructed once by an adapter via [`EventDraft`],
/// mutated only by the standardizer, keyed by `url`.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dates: Option<Vec<DateValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub times: Option<Vec<EventTime>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venue: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    pub url: String,
    #[serde(skip)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    /// First calendar date recoverable from the date field, used as the
    /// reference date for DST-correct offset computation.
    pub fn first_date(&self) -> Option<NaiveDate> {
        self.dates
            .as_ref()?
            .iter()
            .flat_map(|value| value.days())
            .next()
    }
}

/// Unvalidated event candidate as produced by an adapter. `build` performs
/// the cleaning pass: every textual field is normalized, scalars coerced to
/// lists, duplicates dropped, empties become absent. Only a missing `url`
/// rejects the candidate.
#[derive(Debug, Default)]
pub struct EventDraft {
    pub title: Vec<String>,
    pub performers: Vec<String>,
    pub ticket_names: Vec<String>,
    pub dates: Vec<DateValue>,
    pub times: Vec<EventTime>,
    pub venue: Vec<String>,
    pub location: Vec<String>,
    pub images: Vec<String>,
    pub url: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl EventDraft {
    pub fn build(self) -> Option<Event> {
        let url = clean_text(self.url.as_deref()?)?;

        let mut dates = Vec::new();
        let mut seen_dates = std::collections::HashSet::new();
        for value in self.dates {
            let value = match value {
                DateValue::Raw(raw) => match clean_text(&raw) {
                    Some(cleaned) => DateValue::Raw(cleaned),
                    None => continue,
                },
                day => day,
            };
            if seen_dates.insert(value.clone()) {
                dates.push(value);
            }
        }

        let mut times = Vec::new();
        for time in self.times {
            if !times.contains(&time) {
                times.push(time);
            }
        }

        Some(Event {
            title: non_empty(clean_list(&self.title)),
            performers: non_empty(clean_list(&self.performers)),
            ticket_names: non_empty(clean_list(&self.ticket_names)),
            dates: non_empty(dates),
            times: non_empty(times),
            venue: non_empty(clean_list(&self.venue)),
            location: non_empty(clean_list(&self.location)),
            images: non_empty(clean_list(&self.images)),
            url,
            metadata: self.metadata,
        })
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}
