use anyhow::{Result, bail};
use chrono::{Local, NaiveDate};

use crate::capture::{CaptureParams, UNCONSTRAINED};

/// Time control. The ten-minute game is the server default and is requested
/// by omitting `gtype` entirely.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GameType {
    #[default]
    TenMinutes,
    ThreeMinutes,
    TenSeconds,
    Other(String),
}

impl GameType {
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("10min") {
            return Ok(Self::TenMinutes);
        }
        if trimmed.eq_ignore_ascii_case("sb") {
            return Ok(Self::ThreeMinutes);
        }
        if trimmed.eq_ignore_ascii_case("s1") {
            return Ok(Self::TenSeconds);
        }
        if trimmed.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Ok(Self::Other(trimmed.to_ascii_lowercase()));
        }
        bail!("unsupported game type: {value} (expected 10min|sb|s1 or a server gtype code)")
    }

    /// Value of the `gtype` request parameter, if any.
    pub fn server_code(&self) -> Option<&str> {
        match self {
            Self::TenMinutes => None,
            Self::ThreeMinutes => Some("sb"),
            Self::TenSeconds => Some("s1"),
            Self::Other(code) => Some(code),
        }
    }

    /// Label used in capture params and file names.
    pub fn label(&self) -> &str {
        self.server_code().unwrap_or("10min")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpponentType {
    #[default]
    Normal,
    Friend,
    Coach,
    ClosedEvent,
    Learning,
}

impl OpponentType {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "friend" => Ok(Self::Friend),
            "coach" => Ok(Self::Coach),
            "closed_event" => Ok(Self::ClosedEvent),
            "learning" => Ok(Self::Learning),
            _ => bail!(
                "unsupported opponent type: {value} (expected normal|friend|coach|closed_event|learning)"
            ),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Friend => "friend",
            Self::Coach => "coach",
            Self::ClosedEvent => "closed_event",
            Self::Learning => "learning",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitPosType {
    #[default]
    Normal,
    Sprint,
}

impl InitPosType {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "sprint" => Ok(Self::Sprint),
            _ => bail!("unsupported board setup: {value} (expected normal|sprint)"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Sprint => "sprint",
        }
    }
}

/// Every filter the history endpoint understands, minus the page number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub account: String,
    pub opponent: Option<String>,
    pub month: String,
    pub game_type: GameType,
    pub opponent_type: OpponentType,
    pub init_pos_type: InitPosType,
    pub page_limit: Option<u32>,
}

impl HistoryQuery {
    /// Unfiltered query for the current local month.
    pub fn for_account(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            opponent: None,
            month: current_month(),
            game_type: GameType::default(),
            opponent_type: OpponentType::default(),
            init_pos_type: InitPosType::default(),
            page_limit: None,
        }
    }

    pub fn with_opponent(mut self, opponent: Option<&str>) -> Self {
        self.opponent = normalize_opponent(opponent);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.account.trim().is_empty() {
            bail!("history query requires an account id");
        }
        validate_month(&self.month)?;
        if self.page_limit == Some(0) {
            bail!("page limit must be at least 1");
        }
        Ok(())
    }

    pub fn opponent_filter(&self) -> Option<&str> {
        self.opponent.as_deref()
    }

    /// Request parameters for one page of the history listing.
    pub fn server_params(&self, page: u32) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("animal", "false".to_string()),
            ("init_pos_type", self.init_pos_type.as_str().to_string()),
            ("is_latest", "false".to_string()),
            ("locale", "ja".to_string()),
            ("month", self.month.clone()),
            ("opponent_type", self.opponent_type.as_str().to_string()),
            ("user_id", self.account.clone()),
            ("page", page.to_string()),
        ];
        if let Some(code) = self.game_type.server_code() {
            params.push(("gtype", code.to_string()));
        }
        params
    }

    /// The parameterization recorded alongside a crawl's matches.
    pub fn capture_params(&self) -> CaptureParams {
        CaptureParams {
            user: self.account.clone(),
            opponent: self
                .opponent
                .clone()
                .unwrap_or_else(|| UNCONSTRAINED.to_string()),
            month: self.month.clone(),
            gtype: self.game_type.label().to_string(),
            opponent_type: self.opponent_type.as_str().to_string(),
            init_pos_type: self.init_pos_type.as_str().to_string(),
            limit: self
                .page_limit
                .map(|limit| limit.to_string())
                .unwrap_or_else(|| UNCONSTRAINED.to_string()),
            extra: Default::default(),
        }
    }
}

pub fn normalize_opponent(opponent: Option<&str>) -> Option<String> {
    opponent
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

pub fn current_month() -> String {
    Local::now().format("%Y-%m").to_string()
}

pub fn validate_month(month: &str) -> Result<()> {
    let well_formed = month.len() == 7
        && month.as_bytes()[4] == b'-'
        && NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").is_ok();
    if !well_formed {
        bail!("invalid month: {month} (expected YYYY-MM)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{GameType, HistoryQuery, InitPosType, OpponentType, validate_month};

    fn query() -> HistoryQuery {
        HistoryQuery {
            month: "2025-12".to_string(),
            ..HistoryQuery::for_account("ohakado")
        }
    }

    #[test]
    fn default_game_type_omits_gtype_parameter() {
        let params = query().server_params(3);
        assert!(params.iter().all(|(key, _)| *key != "gtype"));
        assert!(params.contains(&("page", "3".to_string())));
        assert!(params.contains(&("user_id", "ohakado".to_string())));
        assert!(params.contains(&("month", "2025-12".to_string())));
        assert!(params.contains(&("animal", "false".to_string())));
    }

    #[test]
    fn explicit_game_type_adds_gtype_parameter() {
        let query = HistoryQuery {
            game_type: GameType::parse("s1").expect("parse gtype"),
            opponent_type: OpponentType::parse("closed_event").expect("parse opponent type"),
            init_pos_type: InitPosType::parse("sprint").expect("parse init pos"),
            ..query()
        };
        let params = query.server_params(1);
        assert!(params.contains(&("gtype", "s1".to_string())));
        assert!(params.contains(&("opponent_type", "closed_event".to_string())));
        assert!(params.contains(&("init_pos_type", "sprint".to_string())));
    }

    #[test]
    fn blank_opponent_means_no_filter() {
        let query = query().with_opponent(Some("   "));
        assert_eq!(query.opponent_filter(), None);
        assert_eq!(query.capture_params().opponent, "(all)");

        let query = query.with_opponent(Some(" Walk_Wikipedia "));
        assert_eq!(query.opponent_filter(), Some("Walk_Wikipedia"));
    }

    #[test]
    fn capture_params_render_labels_and_sentinels() {
        let params = HistoryQuery {
            page_limit: Some(5),
            game_type: GameType::ThreeMinutes,
            ..query()
        }
        .capture_params();
        assert_eq!(params.user, "ohakado");
        assert_eq!(params.gtype, "sb");
        assert_eq!(params.limit, "5");
        assert_eq!(query().capture_params().gtype, "10min");
        assert_eq!(query().capture_params().limit, "(all)");
    }

    #[test]
    fn validate_rejects_bad_months_and_zero_limit() {
        assert!(validate_month("2025-12").is_ok());
        assert!(validate_month("2025-13").is_err());
        assert!(validate_month("2025-1").is_err());
        assert!(validate_month("202512").is_err());
        let zero = HistoryQuery {
            page_limit: Some(0),
            ..query()
        };
        assert!(zero.validate().is_err());
        assert!(query().validate().is_ok());
    }

    #[test]
    fn game_type_rejects_garbage() {
        assert_eq!(GameType::parse("").expect("default"), GameType::TenMinutes);
        assert_eq!(GameType::parse("sf").expect("other"), GameType::Other("sf".to_string()));
        assert!(GameType::parse("s 1").is_err());
    }
}
