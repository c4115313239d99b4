//! Inbound trigger normalization: supplier line ids to canonical scopes and
//! raw webhook bodies to [`Trigger`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sailsync_core::{EventKind, LineId, TriggerSource};
use sailsync_storage::FeedPath;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

const BUILTIN_LINES: &str = include_str!("../../../config/lines.yaml");

#[derive(Debug, Clone, Deserialize)]
struct LinesFile {
    lines: Vec<LineEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineEntry {
    pub supplier_line_id: i32,
    pub canonical_line_id: LineId,
    #[serde(default)]
    pub name: Option<String>,
}

/// Static supplier-to-canonical line lookup.
#[derive(Debug, Clone, Default)]
pub struct LineMapping {
    by_supplier: BTreeMap<i32, LineEntry>,
}

impl LineMapping {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_LINES).context("parsing built-in line mapping")
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let parsed: LinesFile = serde_yaml::from_str(text)?;
        Ok(Self::from_entries(parsed.lines))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = LineEntry>) -> Self {
        Self {
            by_supplier: entries
                .into_iter()
                .map(|entry| (entry.supplier_line_id, entry))
                .collect(),
        }
    }

    /// The override file when one is configured, the built-in table otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading line mapping {}", path.display()))?;
                Self::from_yaml(&text)
                    .with_context(|| format!("parsing line mapping {}", path.display()))
            }
            None => Self::builtin(),
        }
    }

    pub fn canonical(&self, supplier_line_id: i32) -> Option<LineId> {
        self.by_supplier
            .get(&supplier_line_id)
            .map(|entry| entry.canonical_line_id)
    }

    /// Every supplier line published under one canonical scope.
    pub fn suppliers_for(&self, scope_id: LineId) -> Vec<i32> {
        self.by_supplier
            .values()
            .filter(|entry| entry.canonical_line_id == scope_id)
            .map(|entry| entry.supplier_line_id)
            .collect()
    }

    /// Canonical scopes with the supplier line that represents each.
    pub fn scopes(&self) -> Vec<(LineId, i32)> {
        let mut seen = BTreeSet::new();
        self.by_supplier
            .values()
            .filter(|entry| seen.insert(entry.canonical_line_id))
            .map(|entry| (entry.canonical_line_id, entry.supplier_line_id))
            .collect()
    }

    pub fn name(&self, supplier_line_id: i32) -> Option<&str> {
        self.by_supplier
            .get(&supplier_line_id)
            .and_then(|entry| entry.name.as_deref())
    }

    pub fn len(&self) -> usize {
        self.by_supplier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_supplier.is_empty()
    }
}

/// A normalized request to sync one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub scope_id: LineId,
    pub supplier_line_id: i32,
    pub kind: EventKind,
    pub item_paths: Vec<String>,
    pub source: TriggerSource,
    /// Skip the recently-completed window. Never skips an active lock.
    pub force: bool,
    pub received_at: DateTime<Utc>,
}

impl Trigger {
    pub fn line_update(
        mapping: &LineMapping,
        supplier_line_id: i32,
        source: TriggerSource,
        force: bool,
        received_at: DateTime<Utc>,
    ) -> Result<Self, IntakeError> {
        let scope_id = mapping
            .canonical(supplier_line_id)
            .ok_or(IntakeError::UnmappedLine(supplier_line_id))?;
        Ok(Self {
            scope_id,
            supplier_line_id,
            kind: EventKind::LineUpdate,
            item_paths: Vec::new(),
            source,
            force,
            received_at,
        })
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum IntakeError {
    #[error("webhook body is not valid JSON: {0}")]
    Malformed(String),
    #[error("webhook body has no event name")]
    MissingEvent,
    #[error("unsupported webhook event `{0}`")]
    UnknownEvent(String),
    #[error("webhook has no usable line id")]
    MissingLine,
    #[error("supplier line {0} is not mapped to a cruise line")]
    UnmappedLine(i32),
}

const LINE_EVENTS: &[&str] = &["cruiseline_pricing_updated"];
const ITEM_EVENTS: &[&str] = &["cruises_pricing_updated", "cruises_live_pricing_updated"];

fn as_line_id(value: &JsonValue) -> Option<i32> {
    match value {
        JsonValue::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Turns a raw webhook body into a trigger.
///
/// Item-level events keep only paths that match the feed layout and belong to
/// the announced line; when none survive, the event widens to a line update.
pub fn normalize_webhook(
    mapping: &LineMapping,
    body: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Trigger, IntakeError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|err| IntakeError::Malformed(err.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| IntakeError::Malformed("expected a JSON object".to_string()))?;

    let event = object
        .get("event")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(IntakeError::MissingEvent)?;

    let supplier_line_id = ["lineid", "line_id"]
        .iter()
        .find_map(|key| object.get(*key).and_then(as_line_id))
        .ok_or(IntakeError::MissingLine)?;

    let mut trigger = Trigger::line_update(
        mapping,
        supplier_line_id,
        TriggerSource::Webhook,
        false,
        received_at,
    )?;

    if LINE_EVENTS.contains(&event) {
        return Ok(trigger);
    }
    if !ITEM_EVENTS.contains(&event) {
        return Err(IntakeError::UnknownEvent(event.to_string()));
    }

    let paths: BTreeSet<String> = object
        .get("paths")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
        .filter_map(JsonValue::as_str)
        .filter_map(FeedPath::parse)
        .filter(|path| path.supplier_line_id == supplier_line_id)
        .map(|path| path.to_path())
        .collect();
    if !paths.is_empty() {
        trigger.kind = EventKind::ItemUpdate;
        trigger.item_paths = paths.into_iter().collect();
    }
    Ok(trigger)
}
