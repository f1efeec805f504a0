//! Typed cell values.
//!
//! A cell holds exactly one of a closed set of kinds. Renderers and sorters
//! branch on [`CellValue`] with an exhaustive `match`.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::TableError;

/// Declared semantic type of a column.
///
/// Chooses the cell editor and the sort comparator. It is independent of
/// the runtime kind of the column's default value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Hint {
    String,
    Number,
    Boolean,
    Date,
    Vote,
}

impl Hint {
    pub const ALL: [Hint; 5] = [Hint::String, Hint::Number, Hint::Boolean, Hint::Date, Hint::Vote];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hint::String => "string",
            Hint::Number => "number",
            Hint::Boolean => "boolean",
            Hint::Date => "date",
            Hint::Vote => "vote",
        }
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Hint {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hint::ALL
            .into_iter()
            .find(|hint| hint.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TableError::Decode(format!("unknown column hint: {s}")))
    }
}

/// Largest magnitude accepted for a date, in epoch milliseconds (±100M days).
pub const MAX_DATE_MILLIS: i64 = 8_640_000_000_000_000;

fn is_valid_millis(ms: i64) -> bool {
    (-MAX_DATE_MILLIS..=MAX_DATE_MILLIS).contains(&ms)
        && chrono::DateTime::<Utc>::from_timestamp_millis(ms).is_some()
}

/// A point in time stored as epoch milliseconds.
///
/// Setters reject invalid instants silently and report whether the value
/// changed, so that half-typed input never clobbers a good date. Decoding
/// rejects out-of-range values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct DateTime {
    raw: i64,
}

impl DateTime {
    pub fn from_millis(ms: i64) -> Option<Self> {
        is_valid_millis(ms).then_some(Self { raw: ms })
    }

    /// Fractional milliseconds are truncated; NaN and infinities are rejected.
    pub fn from_millis_f64(ms: f64) -> Option<Self> {
        if !ms.is_finite() || ms.abs() > MAX_DATE_MILLIS as f64 {
            return None;
        }
        Self::from_millis(ms.trunc() as i64)
    }

    /// Parse RFC 3339 (`2024-05-01T12:00:00Z`) or a plain `YYYY-MM-DD` date (midnight UTC).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
            return Self::from_millis(dt.timestamp_millis());
        }
        let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
        let midnight = date.and_hms_opt(0, 0, 0)?;
        Self::from_millis(midnight.and_utc().timestamp_millis())
    }

    pub fn now() -> Self {
        Self {
            raw: Utc::now().timestamp_millis(),
        }
    }

    pub fn millis(&self) -> i64 {
        self.raw
    }

    pub fn set_millis(&mut self, ms: i64) -> bool {
        match Self::from_millis(ms) {
            Some(valid) => {
                *self = valid;
                true
            }
            None => {
                log::trace!("Rejected invalid date value {ms}");
                false
            }
        }
    }

    pub fn set_millis_f64(&mut self, ms: f64) -> bool {
        match Self::from_millis_f64(ms) {
            Some(valid) => {
                *self = valid;
                true
            }
            None => {
                log::trace!("Rejected invalid date value {ms}");
                false
            }
        }
    }

    pub fn set_from_str(&mut self, s: &str) -> bool {
        match Self::parse(s) {
            Some(valid) => {
                *self = valid;
                true
            }
            None => {
                log::trace!("Rejected invalid date input {s:?}");
                false
            }
        }
    }

    pub fn to_chrono(&self) -> Option<chrono::DateTime<Utc>> {
        chrono::DateTime::<Utc>::from_timestamp_millis(self.raw)
    }
}

impl TryFrom<i64> for DateTime {
    type Error = TableError;

    fn try_from(ms: i64) -> Result<Self, Self::Error> {
        Self::from_millis(ms).ok_or_else(|| TableError::Decode(format!("date out of range: {ms}")))
    }
}

impl From<DateTime> for i64 {
    fn from(date: DateTime) -> Self {
        date.raw
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_chrono() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            None => write!(f, "{}", self.raw),
        }
    }
}

/// Set of users that voted on a cell. The marker carries no data.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    votes: BTreeSet<String>,
}

impl Vote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the vote was not already present.
    pub fn add_vote(&mut self, user_id: &str) -> bool {
        if self.votes.contains(user_id) {
            return false;
        }
        self.votes.insert(user_id.to_string())
    }

    /// Returns `true` if a vote was removed.
    pub fn remove_vote(&mut self, user_id: &str) -> bool {
        self.votes.remove(user_id)
    }

    /// Returns whether the user has voted after the toggle.
    pub fn toggle_vote(&mut self, user_id: &str) -> bool {
        if self.remove_vote(user_id) {
            false
        } else {
            self.add_vote(user_id)
        }
    }

    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    pub fn has_voted(&self, user_id: &str) -> bool {
        self.votes.contains(user_id)
    }

    pub fn voters(&self) -> impl Iterator<Item = &str> {
        self.votes.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Vote {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            votes: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// The value held by a cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Date(DateTime),
    Vote(Vote),
}

impl CellValue {
    pub fn kind(&self) -> Hint {
        match self {
            CellValue::String(_) => Hint::String,
            CellValue::Number(_) => Hint::Number,
            CellValue::Boolean(_) => Hint::Boolean,
            CellValue::Date(_) => Hint::Date,
            CellValue::Vote(_) => Hint::Vote,
        }
    }

    /// The default value a column of the given kind starts with, if any.
    ///
    /// Date and vote columns have no meaningful empty value.
    pub fn default_for(hint: Hint) -> Option<CellValue> {
        match hint {
            Hint::String => Some(CellValue::String(String::new())),
            Hint::Number => Some(CellValue::Number(0.0)),
            Hint::Boolean => Some(CellValue::Boolean(false)),
            Hint::Date | Hint::Vote => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime> {
        match self {
            CellValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_vote(&self) -> Option<&Vote> {
        match self {
            CellValue::Vote(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::String(s) => f.write_str(s),
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            CellValue::Number(n) => write!(f, "{n}"),
            CellValue::Boolean(b) => write!(f, "{b}"),
            CellValue::Date(d) => write!(f, "{d}"),
            CellValue::Vote(v) => write!(f, "{}", v.vote_count()),
        }
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::String(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::String(value.to_string())
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<i32> for CellValue {
    fn from(value: i32) -> Self {
        CellValue::Number(value.into())
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Boolean(value)
    }
}

impl From<DateTime> for CellValue {
    fn from(value: DateTime) -> Self {
        CellValue::Date(value)
    }
}

impl From<Vote> for CellValue {
    fn from(value: Vote) -> Self {
        CellValue::Vote(value)
    }
}

/// Primitive value stored in an open property map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropValue {
    String(String),
    Number(f64),
    Boolean(bool),
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::String(value.to_string())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::String(value)
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Number(value)
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Boolean(value)
    }
}

/// Open string-keyed map of primitive values (e.g. a boolean column's label).
pub type Props = BTreeMap<String, PropValue>;

/// A stored cell: its value plus optional properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub value: CellValue,
    pub props: Props,
}

impl Cell {
    pub fn new(value: impl Into<CellValue>) -> Self {
        Self {
            value: value.into(),
            props: Props::new(),
        }
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }
}
