use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// `<first>-<second>-<YYYYMMDD>_<HHMMSS>`, anchored at both ends.
static IDENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^-/]+)-([^-/]+)-(\d{8})_(\d{6})$").expect("valid match identity regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Win,
    Lose,
    Draw,
}

impl Outcome {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "win" => Some(Self::Win),
            "lose" => Some(Self::Lose),
            "draw" => Some(Self::Draw),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Win => "win",
            Self::Lose => "lose",
            Self::Draw => "draw",
        }
    }
}

/// Which side won. Outcome pairs are always derived from this, so the two
/// sides of a record can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Winner {
    First,
    Second,
    Neither,
}

impl Winner {
    pub fn outcomes(self) -> (Outcome, Outcome) {
        match self {
            Self::First => (Outcome::Win, Outcome::Lose),
            Self::Second => (Outcome::Lose, Outcome::Win),
            Self::Neither => (Outcome::Draw, Outcome::Draw),
        }
    }

    /// Recover the winner from a first-mover outcome.
    pub fn from_first_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Win => Self::First,
            Outcome::Lose => Self::Second,
            Outcome::Draw => Self::Neither,
        }
    }

    /// Recover the winner from a second-mover outcome.
    pub fn from_second_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Win => Self::Second,
            Outcome::Lose => Self::First,
            Outcome::Draw => Self::Neither,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerOutcome {
    pub name: String,
    #[serde(rename = "class")]
    pub rank: Option<String>,
    #[serde(rename = "result")]
    pub outcome: Outcome,
}

/// Parsed form of a match identity string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchIdentity {
    pub id: String,
    pub first: String,
    pub second: String,
    pub played_at: Option<NaiveDateTime>,
}

impl MatchIdentity {
    /// Returns `None` when `id` does not follow the identity grammar. A
    /// grammatical id whose digits are not a real calendar instant still
    /// parses, with `played_at` left empty.
    pub fn parse(id: &str) -> Option<Self> {
        let captures = IDENTITY_RE.captures(id)?;
        let played_at = parse_identity_timestamp(&captures[3], &captures[4]);
        Some(Self {
            id: id.to_string(),
            first: captures[1].to_string(),
            second: captures[2].to_string(),
            played_at,
        })
    }
}

fn parse_identity_timestamp(date: &str, time: &str) -> Option<NaiveDateTime> {
    let date = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
    let time = NaiveTime::parse_from_str(time, "%H%M%S").ok()?;
    // chrono accepts second 60 as a leap second; match ids never carry one.
    if time.nanosecond() >= 1_000_000_000 {
        return None;
    }
    Some(NaiveDateTime::new(date, time))
}

/// One completed match. Field names on the wire are fixed by existing
/// capture files consumed by the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchRecord {
    pub url: String,
    #[serde(rename = "game_id")]
    pub match_id: String,
    #[serde(rename = "sente")]
    pub first: PlayerOutcome,
    #[serde(rename = "gote")]
    pub second: PlayerOutcome,
    #[serde(rename = "datetime")]
    pub played_at: Option<NaiveDateTime>,
    #[serde(rename = "badges")]
    pub tags: Vec<String>,
}

impl MatchRecord {
    pub fn new(identity: MatchIdentity, url: impl Into<String>, winner: Winner) -> Self {
        let (first_outcome, second_outcome) = winner.outcomes();
        Self {
            url: url.into(),
            match_id: identity.id,
            first: PlayerOutcome {
                name: identity.first,
                rank: None,
                outcome: first_outcome,
            },
            second: PlayerOutcome {
                name: identity.second,
                rank: None,
                outcome: second_outcome,
            },
            played_at: identity.played_at,
            tags: Vec::new(),
        }
    }

    pub fn with_ranks(mut self, first: Option<String>, second: Option<String>) -> Self {
        self.first.rank = first;
        self.second.rank = second;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self.push_tag(tag);
        }
        self
    }

    /// Appends a tag unless it is blank or already present.
    pub fn push_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        let tag = tag.trim();
        if tag.is_empty() || self.tags.iter().any(|existing| existing == tag) {
            return;
        }
        self.tags.push(tag.to_string());
    }

    /// Case-insensitive substring match against either participant.
    pub fn involves(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.first.name.to_lowercase().contains(&needle)
            || self.second.name.to_lowercase().contains(&needle)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{MatchIdentity, MatchRecord, Outcome, Winner};

    #[test]
    fn identity_parses_participants_and_timestamp() {
        let identity = MatchIdentity::parse("a-b-20240115_093000").expect("valid identity");
        assert_eq!(identity.first, "a");
        assert_eq!(identity.second, "b");
        let expected = NaiveDate::from_ymd_opt(2024, 1, 15)
            .and_then(|date| date.and_hms_opt(9, 30, 0))
            .expect("fixture datetime");
        assert_eq!(identity.played_at, Some(expected));
    }

    #[test]
    fn identity_keeps_underscored_names() {
        let identity =
            MatchIdentity::parse("ohakado-guranola_oisi-20251028_220236").expect("valid identity");
        assert_eq!(identity.first, "ohakado");
        assert_eq!(identity.second, "guranola_oisi");
    }

    #[test]
    fn identity_rejects_ids_without_timestamp_suffix() {
        for id in [
            "a-b",
            "a-b-20240115",
            "a-b-2024011_093000",
            "a-b-20240115_09300",
            "a-b-c-20240115_093000",
            "-b-20240115_093000",
            "history",
            "a-b-20240115_093000x",
        ] {
            assert!(MatchIdentity::parse(id).is_none(), "{id} should be rejected");
        }
    }

    #[test]
    fn impossible_calendar_values_keep_identity_but_drop_timestamp() {
        let identity = MatchIdentity::parse("a-b-20241340_250000").expect("grammatical id");
        assert_eq!(identity.id, "a-b-20241340_250000");
        assert!(identity.played_at.is_none());
    }

    #[test]
    fn leap_second_is_not_a_timestamp() {
        let identity = MatchIdentity::parse("a-b-20240101_235960").expect("grammatical id");
        assert!(identity.played_at.is_none());

        let last = MatchIdentity::parse("a-b-20240101_235959").expect("grammatical id");
        assert_eq!(
            last.played_at.map(|at| at.to_string()),
            Some("2024-01-01 23:59:59".to_string())
        );
    }

    #[test]
    fn winner_outcomes_are_consistent_opposites() {
        for winner in [Winner::First, Winner::Second, Winner::Neither] {
            let (first, second) = winner.outcomes();
            assert_eq!(first == Outcome::Win, second == Outcome::Lose);
            assert_eq!(first == Outcome::Draw, second == Outcome::Draw);
            assert!(!(first == Outcome::Win && second == Outcome::Win));
            assert_eq!(Winner::from_first_outcome(first), winner);
            assert_eq!(Winner::from_second_outcome(second), winner);
        }
    }

    #[test]
    fn push_tag_dedupes_in_insertion_order() {
        let identity = MatchIdentity::parse("a-b-20240115_093000").expect("valid identity");
        let record = MatchRecord::new(identity, "https://example.test/games/a-b-20240115_093000", Winner::First)
            .with_tags(["棒銀", "  ", "居飛車", "棒銀"]);
        assert_eq!(record.tags, vec!["棒銀".to_string(), "居飛車".to_string()]);
    }

    #[test]
    fn involves_matches_either_side_case_insensitively() {
        let identity = MatchIdentity::parse("Alice-Bob_99-20240115_093000").expect("valid identity");
        let record = MatchRecord::new(identity, "u", Winner::Neither);
        assert!(record.involves("bob"));
        assert!(record.involves("ALI"));
        assert!(!record.involves("carol"));
    }

    #[test]
    fn record_serializes_with_capture_field_names() {
        let identity = MatchIdentity::parse("a-b-20240115_093000").expect("valid identity");
        let record = MatchRecord::new(identity, "https://example.test/games/a-b-20240115_093000", Winner::Second)
            .with_ranks(Some("三段".to_string()), None)
            .with_tags(["右四間飛車"]);
        let value = serde_json::to_value(&record).expect("serialize record");
        assert_eq!(value["game_id"], "a-b-20240115_093000");
        assert_eq!(value["sente"]["name"], "a");
        assert_eq!(value["sente"]["class"], "三段");
        assert_eq!(value["sente"]["result"], "lose");
        assert_eq!(value["gote"]["class"], serde_json::Value::Null);
        assert_eq!(value["gote"]["result"], "win");
        assert_eq!(value["datetime"], "2024-01-15T09:30:00");
        assert_eq!(value["badges"][0], "右四間飛車");
    }
}
