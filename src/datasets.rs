//! Loading interaction logs from CSV tables.
//!
//! The table needs a header row and at least a user, an item and a time
//! column; other columns are ignored. Timestamps may be unix seconds,
//! `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` or RFC 3339.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::data::{Interaction, InteractionLog};
use crate::DataError;

/// Names of the columns holding users, items and timestamps.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Columns {
    /// User id column.
    pub user: String,
    /// Item id column.
    pub item: String,
    /// Timestamp column.
    pub time: String,
}

impl Default for Columns {
    fn default() -> Self {
        Columns {
            user: "user_id".to_owned(),
            item: "item_id".to_owned(),
            time: "timestamp".to_owned(),
        }
    }
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        return DateTime::from_timestamp(seconds, 0).map(|x| x.naive_utc());
    }

    if let Ok(timestamp) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(timestamp);
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }

    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|x| x.naive_utc())
}

/// Read an interaction log from any CSV source.
pub fn read_csv<R: Read>(reader: R, columns: &Columns) -> Result<InteractionLog<String, String>, DataError> {
    let mut reader = csv::Reader::from_reader(reader);

    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|header| header.trim() == name)
            .ok_or_else(|| DataError::MissingColumn(name.to_owned()))
    };

    let user_column = column(&columns.user)?;
    let item_column = column(&columns.item)?;
    let time_column = column(&columns.time)?;

    let mut interactions = Vec::new();

    for (row, record) in reader.records().enumerate() {
        let record = record?;

        let field = |index: usize, name: &str| {
            record
                .get(index)
                .ok_or_else(|| DataError::MissingColumn(name.to_owned()))
        };

        let user = field(user_column, &columns.user)?;
        let item = field(item_column, &columns.item)?;
        let time = field(time_column, &columns.time)?;

        let timestamp = parse_timestamp(time).ok_or_else(|| DataError::InvalidTimestamp {
            row,
            value: time.to_owned(),
        })?;

        interactions.push(Interaction::new(user.to_owned(), item.to_owned(), timestamp));
    }

    debug!(rows = interactions.len(), "read interaction table");

    Ok(InteractionLog::new(interactions))
}

/// Load an interaction log from a CSV file, sorted chronologically.
pub fn load_csv<P: AsRef<Path>>(path: P, columns: &Columns) -> Result<InteractionLog<String, String>, DataError> {
    let file = File::open(path)?;

    read_csv(file, columns)
}
