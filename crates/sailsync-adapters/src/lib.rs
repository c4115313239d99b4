//! Supplier payload parsing: one Traveltek cruise file in, one validated
//! [`SourceRecord`] out.
//!
//! Two corruption shapes seen in the feed are repaired here. Whole documents
//! persisted as `{"0": "{", "1": "\"", ...}` are rebuilt by concatenating the
//! characters in index order and parsed again. Numeric fields holding
//! placeholder strings such as `"N/A"` are coerced to null. Anything still
//! unreadable is a [`ParseError`] and the caller skips the file.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use sailsync_core::{CabinClass, CabinPrices, PricingGrid, RateCell, ShipContent, SourceRecord};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "sailsync-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// Rebuild char-indexed documents. When off, the shape is still detected
    /// and reported as corrupt.
    pub repair_char_indexed: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            repair_char_indexed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Repair {
    CharIndexed { chars: usize },
    SentinelNumber { field: String, raw: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPayload {
    pub record: SourceRecord,
    pub repairs: Vec<Repair>,
}

impl ParsedPayload {
    pub fn repaired(&self) -> bool {
        !self.repairs.is_empty()
    }

    pub fn char_indexed(&self) -> bool {
        self.repairs
            .iter()
            .any(|repair| matches!(repair, Repair::CharIndexed { .. }))
    }
}

/// A payload that stays unreadable after repair. Every variant is permanent
/// for the bytes it was raised on; retrying the same file cannot help.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{file}: invalid JSON: {reason}")]
    InvalidJson { file: String, reason: String },
    #[error("{file}: char-indexed payload and repair is disabled")]
    CharIndexed { file: String },
    #[error("{file}: document is not a JSON object")]
    NotAnObject { file: String },
    #[error("{file}: missing required field `{field}`")]
    MissingField { file: String, field: &'static str },
    #[error("{file}: field `{field}` has unusable value {value}")]
    InvalidField {
        file: String,
        field: &'static str,
        value: String,
    },
}

impl ParseError {
    pub fn file(&self) -> &str {
        match self {
            ParseError::InvalidJson { file, .. }
            | ParseError::CharIndexed { file }
            | ParseError::NotAnObject { file }
            | ParseError::MissingField { file, .. }
            | ParseError::InvalidField { file, .. } => file,
        }
    }
}

/// True when `value` is an object whose keys are exactly `"0".."n-1"` and
/// whose values are single characters.
pub fn is_char_indexed(value: &JsonValue) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    if map.is_empty() {
        return false;
    }
    let mut seen = vec![false; map.len()];
    for (key, val) in map {
        if !key.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        let Ok(index) = key.parse::<usize>() else {
            return false;
        };
        if index >= seen.len() || seen[index] {
            return false;
        }
        seen[index] = true;
        match val.as_str() {
            Some(text) if text.chars().count() == 1 => {}
            _ => return false,
        }
    }
    true
}

/// Rebuilds the original text of a char-indexed document, or `None` when the
/// value does not have that shape.
pub fn repair_char_indexed(value: &JsonValue) -> Option<String> {
    if !is_char_indexed(value) {
        return None;
    }
    let mut chars = value
        .as_object()?
        .iter()
        .filter_map(|(key, val)| Some((key.parse::<usize>().ok()?, val.as_str()?)))
        .collect::<Vec<_>>();
    // Map keys iterate in string order ("10" before "2").
    chars.sort_unstable_by_key(|(index, _)| *index);
    Some(chars.into_iter().map(|(_, ch)| ch).collect())
}

pub fn parse_payload(
    bytes: &[u8],
    file: &str,
    options: ParseOptions,
) -> Result<ParsedPayload, ParseError> {
    let mut repairs = Vec::new();
    let mut doc: JsonValue =
        serde_json::from_slice(bytes).map_err(|err| ParseError::InvalidJson {
            file: file.to_string(),
            reason: err.to_string(),
        })?;

    if let Some(text) = repair_char_indexed(&doc) {
        if !options.repair_char_indexed {
            return Err(ParseError::CharIndexed {
                file: file.to_string(),
            });
        }
        let chars = text.chars().count();
        doc = serde_json::from_str(&text).map_err(|err| ParseError::InvalidJson {
            file: file.to_string(),
            reason: format!("after char-index repair: {err}"),
        })?;
        debug!(file, chars, "rebuilt char-indexed payload");
        repairs.push(Repair::CharIndexed { chars });
    }

    if !doc.is_object() {
        return Err(ParseError::NotAnObject {
            file: file.to_string(),
        });
    }

    let mut extractor = Extractor {
        file,
        repairs: &mut repairs,
    };
    let record = extractor.record(&doc)?;
    Ok(ParsedPayload { record, repairs })
}

/// Reads and parses one payload file from disk.
pub fn read_payload_file(path: impl AsRef<Path>, options: ParseOptions) -> Result<ParsedPayload> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let name = path.display().to_string();
    parse_payload(&bytes, &name, options).with_context(|| format!("parsing {}", path.display()))
}

pub fn cabin_class_for(cabin_type: &str) -> Option<CabinClass> {
    match cabin_type.trim().to_ascii_lowercase().as_str() {
        "inside" | "interior" => Some(CabinClass::Interior),
        "outside" | "oceanview" | "ocean view" => Some(CabinClass::Oceanview),
        "balcony" | "veranda" | "verandah" => Some(CabinClass::Balcony),
        "suite" => Some(CabinClass::Suite),
        _ => None,
    }
}

enum Numeric {
    Value(f64),
    Missing,
    Sentinel(String),
}

fn numeric(value: Option<&JsonValue>) -> Numeric {
    match value {
        None | Some(JsonValue::Null) => Numeric::Missing,
        Some(JsonValue::Number(n)) => n.as_f64().map_or(Numeric::Missing, Numeric::Value),
        Some(JsonValue::String(text)) => match text.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Numeric::Value(v),
            _ => Numeric::Sentinel(text.clone()),
        },
        // cheapest* fields sometimes arrive as {"price": ...}
        Some(JsonValue::Object(map)) if map.contains_key("price") => numeric(map.get("price")),
        Some(other) => Numeric::Sentinel(other.to_string()),
    }
}

fn as_whole(value: f64) -> Option<i32> {
    let in_range = value >= f64::from(i32::MIN) && value <= f64::from(i32::MAX);
    (value.fract() == 0.0 && in_range).then_some(value as i32)
}

fn json_text(value: Option<&JsonValue>) -> Option<String> {
    let text = match value? {
        JsonValue::String(text) => text.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn json_i32(value: Option<&JsonValue>) -> Option<i32> {
    match numeric(value) {
        Numeric::Value(v) => as_whole(v),
        _ => None,
    }
}

fn parse_timestamp(value: Option<&JsonValue>) -> Option<DateTime<Utc>> {
    match value? {
        JsonValue::Number(n) => Utc.timestamp_opt(n.as_i64()?, 0).single(),
        JsonValue::String(text) => {
            let text = text.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            Utc.timestamp_opt(text.parse().ok()?, 0).single()
        }
        _ => None,
    }
}

struct Extractor<'a> {
    file: &'a str,
    repairs: &'a mut Vec<Repair>,
}

impl Extractor<'_> {
    fn record(&mut self, doc: &JsonValue) -> Result<SourceRecord, ParseError> {
        let supplier_item_id = json_text(doc.get("codetocruiseid")).ok_or_else(|| {
            ParseError::MissingField {
                file: self.file.to_string(),
                field: "codetocruiseid",
            }
        })?;
        let supplier_line_id = self.required_i32(doc, "lineid")?;
        let ship_id = self.required_i32(doc, "shipid")?;
        let sailing_date = self.sailing_date(doc)?;
        let voyage_code = json_text(doc.get("voyagecode")).unwrap_or_default();

        let nights = self.lenient_f64("nights", doc.get("nights")).and_then(as_whole);
        let pricing = self.pricing_grid(doc.get("prices"));

        let mut prices = CabinPrices::default();
        for (class, key) in [
            (CabinClass::Interior, "cheapestinside"),
            (CabinClass::Oceanview, "cheapestoutside"),
            (CabinClass::Balcony, "cheapestbalcony"),
            (CabinClass::Suite, "cheapestsuite"),
        ] {
            let price = self.lenient_f64(key, doc.get(key)).filter(|p| *p > 0.0);
            prices.set(class, price.or_else(|| cheapest_in_grid(&pricing, class)));
        }
        let cheapest_price = self
            .lenient_f64("cheapestprice", doc.get("cheapestprice"))
            .filter(|p| *p > 0.0)
            .or_else(|| prices.cheapest());

        let ship = doc
            .get("shipcontent")
            .filter(|content| content.is_object())
            .map(|content| ShipContent {
                ship_id: json_i32(content.get("id")).unwrap_or(ship_id),
                name: json_text(content.get("name")),
                content: content.clone(),
            });

        Ok(SourceRecord {
            supplier_item_id,
            supplier_line_id,
            ship_id,
            sailing_date,
            voyage_code,
            name: json_text(doc.get("name")),
            nights,
            prices,
            cheapest_price,
            pricing,
            ship,
            last_cached: parse_timestamp(doc.get("lastcached")),
            file_path: self.file.to_string(),
        })
    }

    fn required_i32(&self, doc: &JsonValue, field: &'static str) -> Result<i32, ParseError> {
        match numeric(doc.get(field)) {
            Numeric::Value(v) => as_whole(v).ok_or_else(|| ParseError::InvalidField {
                file: self.file.to_string(),
                field,
                value: v.to_string(),
            }),
            Numeric::Missing => Err(ParseError::MissingField {
                file: self.file.to_string(),
                field,
            }),
            Numeric::Sentinel(raw) => Err(ParseError::InvalidField {
                file: self.file.to_string(),
                field,
                value: raw,
            }),
        }
    }

    fn sailing_date(&self, doc: &JsonValue) -> Result<NaiveDate, ParseError> {
        let (field, raw) = ["saildate", "startdate"]
            .into_iter()
            .find_map(|field| json_text(doc.get(field)).map(|raw| (field, raw)))
            .ok_or_else(|| ParseError::MissingField {
                file: self.file.to_string(),
                field: "saildate",
            })?;
        let day = raw.get(..10).unwrap_or(raw.as_str());
        NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|_| ParseError::InvalidField {
            file: self.file.to_string(),
            field,
            value: raw.clone(),
        })
    }

    fn lenient_f64(&mut self, field: &str, value: Option<&JsonValue>) -> Option<f64> {
        match numeric(value) {
            Numeric::Value(v) => Some(v),
            Numeric::Missing => None,
            Numeric::Sentinel(raw) => {
                self.repairs.push(Repair::SentinelNumber {
                    field: field.to_string(),
                    raw,
                });
                None
            }
        }
    }

    fn pricing_grid(&mut self, value: Option<&JsonValue>) -> PricingGrid {
        let mut grid = PricingGrid::new();
        let Some(rates) = value.and_then(JsonValue::as_object) else {
            return grid;
        };
        for (rate_code, cabins) in rates {
            let Some(cabins) = cabins.as_object() else {
                continue;
            };
            let mut row = BTreeMap::new();
            for (cabin_code, cell) in cabins {
                let Some(cell) = cell.as_object() else {
                    debug!(file = self.file, rate = %rate_code, cabin = %cabin_code, "skipping non-object rate cell");
                    continue;
                };
                let path = format!("prices.{rate_code}.{cabin_code}");
                let price = self
                    .lenient_f64(&format!("{path}.price"), cell.get("price"))
                    .filter(|p| *p > 0.0);
                let taxes = self.lenient_f64(&format!("{path}.taxes"), cell.get("taxes"));
                let fees = self.lenient_f64(
                    &format!("{path}.fees"),
                    cell.get("fees").or_else(|| cell.get("ncf")),
                );
                let available = match cell.get("available") {
                    Some(JsonValue::Bool(flag)) => *flag && price.is_some(),
                    _ => price.is_some(),
                };
                row.insert(
                    cabin_code.clone(),
                    RateCell {
                        price,
                        taxes,
                        fees,
                        cabin_type: json_text(cell.get("cabintype"))
                            .map(|kind| kind.to_ascii_lowercase()),
                        available,
                    },
                );
            }
            if !row.is_empty() {
                grid.insert(rate_code.clone(), row);
            }
        }
        grid
    }
}

fn cheapest_in_grid(grid: &PricingGrid, class: CabinClass) -> Option<f64> {
    grid.values()
        .flat_map(|cabins| cabins.values())
        .filter(|cell| cell.available)
        .filter(|cell| cell.cabin_type.as_deref().and_then(cabin_class_for) == Some(class))
        .filter_map(|cell| cell.price)
        .fold(None, |acc: Option<f64>, price| match acc {
            Some(current) if current <= price => Some(current),
            _ => Some(price),
        })
}
