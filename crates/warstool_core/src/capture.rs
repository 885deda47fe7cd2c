use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{MatchIdentity, MatchRecord, Outcome, Winner};
use crate::query::HistoryQuery;
use crate::session::DEFAULT_BASE_URL;

/// Param value meaning "not constrained by this field".
pub const UNCONSTRAINED: &str = "(all)";

const STORED_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to serialize capture for {}: {source}", .path.display())]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse capture {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Query parameterization stored next to the matches. Values are strings on
/// the wire; legacy files may carry numbers or nulls, which are read as
/// their string form (null becomes empty).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaptureParams {
    #[serde(default, deserialize_with = "lenient_string")]
    pub user: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub opponent: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub month: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub gtype: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub opponent_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub init_pos_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub limit: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Empty and `(all)` values carry no information.
pub(crate) fn meaningful(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == UNCONSTRAINED {
        None
    } else {
        Some(trimmed)
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    })
}

/// One crawl's or one merge's worth of matches plus the parameters that
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CaptureUnit {
    pub params: CaptureParams,
    pub matches: Vec<MatchRecord>,
}

impl CaptureUnit {
    pub fn from_crawl(query: &HistoryQuery, matches: Vec<MatchRecord>) -> Self {
        Self {
            params: query.capture_params(),
            matches,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CaptureDocument {
    #[serde(default)]
    params: CaptureParams,
    #[serde(default, alias = "replays")]
    matches: Vec<StoredMatch>,
}

#[derive(Debug, Deserialize)]
struct StoredMatch {
    url: Option<String>,
    game_id: Option<String>,
    sente: Option<StoredPlayer>,
    gote: Option<StoredPlayer>,
    datetime: Option<String>,
    #[serde(default)]
    badges: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StoredPlayer {
    name: Option<String>,
    class: Option<String>,
    result: Option<String>,
}

impl StoredMatch {
    /// Missing fields are recovered from `game_id`; entries without a
    /// grammatical id cannot be keyed and are dropped.
    fn into_record(self) -> Option<MatchRecord> {
        let game_id = self.game_id?;
        let identity = MatchIdentity::parse(game_id.trim())?;
        let sente = self.sente.unwrap_or_default();
        let gote = self.gote.unwrap_or_default();

        let winner = sente
            .result
            .as_deref()
            .and_then(Outcome::parse)
            .map(Winner::from_first_outcome)
            .or_else(|| {
                gote.result
                    .as_deref()
                    .and_then(Outcome::parse)
                    .map(Winner::from_second_outcome)
            })
            .unwrap_or(Winner::Neither);

        let played_at = self
            .datetime
            .as_deref()
            .and_then(|value| NaiveDateTime::parse_from_str(value.trim(), STORED_DATETIME_FORMAT).ok())
            .or(identity.played_at);
        let url = self
            .url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| format!("{DEFAULT_BASE_URL}/games/{}", identity.id));

        let mut record = MatchRecord::new(identity, url, winner)
            .with_ranks(non_blank(sente.class), non_blank(gote.class))
            .with_tags(self.badges);
        if let Some(name) = non_blank(sente.name) {
            record.first.name = name;
        }
        if let Some(name) = non_blank(gote.name) {
            record.second.name = name;
        }
        record.played_at = played_at;
        Some(record)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Serialize to a temporary sibling, then rename over `path`.
pub fn write_capture(path: &Path, unit: &CaptureUnit) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| PersistenceError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut rendered =
        serde_json::to_string_pretty(unit).map_err(|source| PersistenceError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
    rendered.push('\n');

    let staging = staging_path(path);
    fs::write(&staging, rendered).map_err(|source| PersistenceError::Write {
        path: staging.clone(),
        source,
    })?;
    fs::rename(&staging, path).map_err(|source| PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), matches = unit.matches.len(), "wrote capture");
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub fn read_capture(path: &Path) -> Result<CaptureUnit, PersistenceError> {
    let content = fs::read_to_string(path).map_err(|source| PersistenceError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_capture(&content).map_err(|source| PersistenceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse_capture(content: &str) -> Result<CaptureUnit, serde_json::Error> {
    let document: CaptureDocument = serde_json::from_str(content)?;
    let mut matches = Vec::with_capacity(document.matches.len());
    for stored in document.matches {
        let game_id = stored.game_id.clone().unwrap_or_default();
        match stored.into_record() {
            Some(record) => matches.push(record),
            None => warn!(game_id = %game_id, "skipping stored match without a valid identity"),
        }
    }
    Ok(CaptureUnit {
        params: document.params,
        matches,
    })
}

/// `game_replays_<gtype>_<month>_<user>[_<opponent>].json`
pub fn default_capture_filename(query: &HistoryQuery) -> String {
    let mut stem = format!(
        "game_replays_{}_{}_{}",
        query.game_type.label(),
        query.month,
        query.account
    );
    if let Some(opponent) = query.opponent_filter() {
        stem.push('_');
        stem.push_str(opponent);
    }
    format!("{}.json", sanitize_file_stem(&stem))
}

fn sanitize_file_stem(stem: &str) -> String {
    stem.chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CaptureSummary {
    pub path: PathBuf,
    pub account: String,
    pub month: String,
    pub opponent: String,
    pub match_count: usize,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureListing {
    pub captures: Vec<CaptureSummary>,
    pub warnings: Vec<String>,
}

/// Summaries of every `*.json` capture in `dir`, newest first. Files that
/// fail to parse become warnings.
pub fn list_captures(dir: &Path) -> anyhow::Result<CaptureListing> {
    let mut listing = CaptureListing::default();
    if !dir.exists() {
        listing
            .warnings
            .push(format!("{} does not exist", dir.display()));
        return Ok(listing);
    }

    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let modified = entry.metadata().and_then(|meta| meta.modified()).ok();
        match read_capture(&path) {
            Ok(unit) => listing.captures.push(CaptureSummary {
                account: unit.params.user.clone(),
                month: unit.params.month.clone(),
                opponent: unit.params.opponent.clone(),
                match_count: unit.matches.len(),
                modified,
                path,
            }),
            Err(error) => listing.warnings.push(error.to_string()),
        }
    }

    listing.captures.sort_by(|left, right| {
        right
            .modified
            .cmp(&left.modified)
            .then_with(|| left.path.cmp(&right.path))
    });
    Ok(listing)
}
