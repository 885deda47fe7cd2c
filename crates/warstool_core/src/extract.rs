//! Structural extraction of match records from a history page.
//!
//! Only links whose last path segment follows the match identity grammar
//! count as matches; everything else on the page (pagination, navigation,
//! profile links) is ignored. Field recovery around a link is best effort:
//! a record is always produced for a valid link, with draw outcomes, no
//! ranks and no tags when the surrounding markup cannot be found.

use std::collections::HashMap;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tracing::debug;

use crate::model::{MatchIdentity, MatchRecord, Winner};

const GAMES_SEGMENT: &str = "/games/";
const PARTICIPANTS_CLASS: &str = "game_players";

static LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid link selector"));
static IMAGE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("img[src]").expect("valid image selector"));
static PLAYER_NAMES_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".player_names").expect("valid player names selector"));
static FIRST_RANK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".player_dan_text_left").expect("valid first rank selector"));
static SECOND_RANK_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(".player_dan_text_right").expect("valid second rank selector")
});
static TAGS_CONTAINER_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".game_badges").expect("valid badges selector"));
static TAG_LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.badge_text").expect("valid badge link selector"));

/// Result of extracting one page.
///
/// `page_had_any_matches` counts every structurally valid match link before
/// the opponent filter runs, so a page whose matches were all filtered out
/// still reports that data exists.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PageExtraction {
    pub matches: Vec<MatchRecord>,
    pub page_had_any_matches: bool,
    pub valid_candidates: usize,
    pub filtered_out: usize,
}

/// Decides the winner from the markup around one match.
pub trait OutcomeDetector {
    fn detect(&self, container: ElementRef<'_>) -> Winner;
}

/// Reads the result off the win/lose indicator image asset names.
#[derive(Debug, Clone)]
pub struct ImageMarkerDetector {
    pub first_won_marker: String,
    pub first_lost_marker: String,
}

impl Default for ImageMarkerDetector {
    fn default() -> Self {
        Self {
            first_won_marker: "sente_win".to_string(),
            first_lost_marker: "sente_lose".to_string(),
        }
    }
}

impl OutcomeDetector for ImageMarkerDetector {
    fn detect(&self, container: ElementRef<'_>) -> Winner {
        for image in container.select(&IMAGE_SELECTOR) {
            let src = image.value().attr("src").unwrap_or_default();
            if src.contains(&self.first_won_marker) {
                return Winner::First;
            }
            if src.contains(&self.first_lost_marker) {
                return Winner::Second;
            }
        }
        Winner::Neither
    }
}

#[derive(Debug, Clone)]
pub struct RecordExtractor<D = ImageMarkerDetector> {
    base_url: String,
    detector: D,
}

impl RecordExtractor<ImageMarkerDetector> {
    pub fn new(base_url: &str) -> Self {
        Self::with_detector(base_url, ImageMarkerDetector::default())
    }
}

struct Candidate {
    identity: MatchIdentity,
    url: String,
}

impl<D: OutcomeDetector> RecordExtractor<D> {
    pub fn with_detector(base_url: &str, detector: D) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            detector,
        }
    }

    pub fn extract(
        &self,
        raw: &str,
        account: &str,
        opponent_filter: Option<&str>,
    ) -> PageExtraction {
        let document = Html::parse_document(raw);
        let opponent_filter = opponent_filter
            .map(str::trim)
            .filter(|filter| !filter.is_empty());

        // One slot per match id. A later link replaces an earlier one only
        // when the earlier one had no participants container.
        let mut slots: Vec<(MatchRecord, bool)> = Vec::new();
        let mut slot_by_id: HashMap<String, usize> = HashMap::new();
        for link in document.select(&LINK_SELECTOR) {
            let Some(candidate) = self.candidate(link) else {
                continue;
            };
            let (record, located) = self.build_record(link, candidate);
            match slot_by_id.get(&record.match_id) {
                Some(&slot) => {
                    if located && !slots[slot].1 {
                        slots[slot] = (record, located);
                    }
                }
                None => {
                    slot_by_id.insert(record.match_id.clone(), slots.len());
                    slots.push((record, located));
                }
            }
        }

        let mut extraction = PageExtraction {
            valid_candidates: slots.len(),
            ..PageExtraction::default()
        };
        for (record, _) in slots {
            if let Some(filter) = opponent_filter
                && !record.involves(filter)
            {
                extraction.filtered_out += 1;
                continue;
            }
            if !account.is_empty()
                && record.first.name != account
                && record.second.name != account
            {
                debug!(match_id = %record.match_id, account, "match does not involve the crawled account");
            }
            extraction.matches.push(record);
        }

        extraction.page_had_any_matches = extraction.valid_candidates > 0;
        extraction
    }

    fn candidate(&self, link: ElementRef<'_>) -> Option<Candidate> {
        let href = link.value().attr("href")?.trim();
        if !href.contains(GAMES_SEGMENT) || href.contains("history") || href.contains("page=") {
            return None;
        }

        let origin = if href.starts_with(GAMES_SEGMENT) {
            self.base_url.as_str()
        } else if href.starts_with("https://") || href.starts_with("http://") {
            href.rsplit_once(GAMES_SEGMENT)?.0
        } else {
            return None;
        };

        let (_, tail) = href.rsplit_once(GAMES_SEGMENT)?;
        let id = tail.split(['?', '#']).next().unwrap_or_default();
        let Some(identity) = MatchIdentity::parse(id) else {
            debug!(href, "skipping link outside the match identity grammar");
            return None;
        };
        Some(Candidate {
            url: format!("{origin}{GAMES_SEGMENT}{}", identity.id),
            identity,
        })
    }

    /// The flag reports whether a participants container was found.
    fn build_record(&self, link: ElementRef<'_>, candidate: Candidate) -> (MatchRecord, bool) {
        let Some(container) = participants_container(link) else {
            debug!(match_id = %candidate.identity.id, "no participants container; using defaults");
            let record = MatchRecord::new(candidate.identity, candidate.url, Winner::Neither);
            return (record, false);
        };

        let winner = self.detector.detect(container);
        let (first_rank, second_rank) = rank_labels(container);
        let record = MatchRecord::new(candidate.identity, candidate.url, winner)
            .with_ranks(first_rank, second_rank)
            .with_tags(tag_labels(container));
        (record, true)
    }
}

fn participants_container(link: ElementRef<'_>) -> Option<ElementRef<'_>> {
    link.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|element| element.value().classes().any(|class| class == PARTICIPANTS_CLASS))
}

/// Labels inside the names block win over stray labels elsewhere in the
/// container.
fn rank_labels(container: ElementRef<'_>) -> (Option<String>, Option<String>) {
    let names = container.select(&PLAYER_NAMES_SELECTOR).next();
    let lookup = |selector: &Selector| {
        names
            .and_then(|names| first_text(names, selector))
            .or_else(|| first_text(container, selector))
    };
    (lookup(&FIRST_RANK_SELECTOR), lookup(&SECOND_RANK_SELECTOR))
}

fn tag_labels(container: ElementRef<'_>) -> Vec<String> {
    let Some(parent) = container.parent().and_then(ElementRef::wrap) else {
        return Vec::new();
    };
    let Some(tags) = parent.select(&TAGS_CONTAINER_SELECTOR).next() else {
        return Vec::new();
    };
    tags.select(&TAG_LINK_SELECTOR)
        .map(element_text)
        .map(|text| {
            text.trim_start_matches(['#', '＃'])
                .trim()
                .to_string()
        })
        .filter(|text| !text.is_empty())
        .collect()
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .map(element_text)
        .filter(|text| !text.is_empty())
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
