use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use itertools::Itertools;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sha1::{Digest, Sha1};

/// One typed column value pulled off an upstream row.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Bytes(Vec<u8>),
    Json(JsonValue),
}

impl Cell {
    /// Wire form: datetimes and dates become ISO-8601 strings, decimals
    /// numbers, byte strings base64.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Cell::Null => JsonValue::Null,
            Cell::Bool(b) => JsonValue::Bool(*b),
            Cell::Int(n) => JsonValue::from(*n),
            Cell::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Cell::Decimal(d) => d
                .to_f64()
                .and_then(serde_json::Number::from_f64)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(d.to_string())),
            Cell::Text(s) => JsonValue::String(s.clone()),
            Cell::Timestamp(dt) => {
                JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }
            Cell::TimestampTz(dt) => JsonValue::String(dt.to_rfc3339()),
            Cell::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
            Cell::Bytes(b) => JsonValue::String(BASE64.encode(b)),
            Cell::Json(v) => v.clone(),
        }
    }

    /// Deterministic text hashed by the checksum strategy. Stability across
    /// runs is the only requirement; this form never reaches the bus.
    pub fn digest_text(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Bool(b) => b.to_string(),
            Cell::Int(n) => n.to_string(),
            Cell::Float(f) => f.to_string(),
            Cell::Decimal(d) => d.to_string(),
            Cell::Text(s) => s.clone(),
            Cell::Timestamp(dt) => dt.to_string(),
            Cell::TimestampTz(dt) => dt.to_string(),
            Cell::Date(d) => d.to_string(),
            Cell::Bytes(b) => BASE64.encode(b),
            Cell::Json(v) => v.to_string(),
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Cell::Timestamp(dt) => Some(*dt),
            Cell::TimestampTz(dt) => Some(dt.naive_utc()),
            Cell::Date(d) => d.and_hms_opt(0, 0, 0),
            _ => None,
        }
    }

    /// Whether a side lookup should bother with this value: nulls, zeroes
    /// and empty strings read as "no foreign key here".
    pub fn is_present(&self) -> bool {
        match self {
            Cell::Null => false,
            Cell::Bool(b) => *b,
            Cell::Int(n) => *n != 0,
            Cell::Float(f) => *f != 0.0,
            Cell::Text(s) => !s.is_empty(),
            Cell::Json(JsonValue::Null) => false,
            _ => true,
        }
    }
}

/// A row in upstream column order, with the optional `_additionals`
/// sub-document attached by a side fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    cells: Vec<(String, Cell)>,
    additionals: Option<JsonValue>,
}

impl Record {
    pub fn new(cells: Vec<(String, Cell)>) -> Record {
        Record {
            cells,
            additionals: None,
        }
    }

    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, cell)| cell)
    }

    pub fn set_additionals(&mut self, additionals: JsonValue) {
        self.additionals = Some(additionals);
    }

    /// SHA-1 over the `:`-joined column values in column order, hex encoded.
    pub fn digest(&self) -> String {
        let joined = self.cells.iter().map(|(_, cell)| cell.digest_text()).join(":");
        hex::encode(Sha1::digest(joined.as_bytes()))
    }

    /// Stringified primary key for the checksum map; datetimes and dates
    /// collapse to integer Unix seconds.
    pub fn normalized_pk(&self, column: &str) -> Option<String> {
        let cell = self.get(column)?;
        Some(match cell.as_datetime() {
            Some(dt) => dt.and_utc().timestamp().to_string(),
            None => cell.digest_text(),
        })
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = serde_json::Map::with_capacity(self.cells.len() + 1);
        for (name, cell) in &self.cells {
            map.insert(name.clone(), cell.to_json());
        }
        if let Some(additionals) = &self.additionals {
            map.insert("_additionals".to_owned(), additionals.clone());
        }
        JsonValue::Object(map)
    }
}
