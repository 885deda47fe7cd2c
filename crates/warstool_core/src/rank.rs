use std::cmp::Ordering;
use std::fmt;

const MAX_DAN: u8 = 9;
const MAX_KYU: u8 = 99;

/// Skill grade with a total strength order: unrecognized grades are the
/// weakest, then kyu grades (higher number is weaker), then dan grades.
/// Computed on demand from the stored rank string, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rank {
    Unknown,
    Kyu(u8),
    Dan(u8),
}

impl Rank {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Self::Unknown;
        }

        if let Some(prefix) = trimmed.strip_suffix('級') {
            return parse_grade_number(prefix)
                .filter(|n| *n > 0)
                .map(|n| Self::Kyu(n.min(MAX_KYU)))
                .unwrap_or(Self::Unknown);
        }
        if let Some(prefix) = trimmed.strip_suffix('段') {
            let number = if prefix == "初" {
                Some(1)
            } else {
                parse_grade_number(prefix)
            };
            return number
                .filter(|n| *n > 0)
                .map(|n| Self::Dan(n.min(MAX_DAN)))
                .unwrap_or(Self::Unknown);
        }

        let lowered = trimmed.to_ascii_lowercase();
        let Some(number) = leading_number(&lowered).filter(|n| *n > 0) else {
            return Self::Unknown;
        };
        if lowered.contains("kyu") {
            Self::Kyu(number.min(MAX_KYU))
        } else if lowered.contains("dan") {
            Self::Dan(number.min(MAX_DAN))
        } else {
            Self::Unknown
        }
    }

    pub fn from_optional(value: Option<&str>) -> Self {
        value.map(Self::parse).unwrap_or(Self::Unknown)
    }

    /// Monotonic strength score; larger is stronger.
    pub fn sort_key(self) -> i32 {
        match self {
            Self::Unknown => i32::MIN,
            Self::Kyu(n) => -i32::from(n),
            Self::Dan(n) => i32::from(n),
        }
    }
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Kyu(n) => write!(f, "{n} kyu"),
            Self::Dan(n) => write!(f, "{n} dan"),
        }
    }
}

fn parse_grade_number(text: &str) -> Option<u8> {
    let text = text.trim();
    if let Some(number) = kanji_number(text) {
        return Some(number);
    }
    let digits: String = text
        .chars()
        .map(|ch| match ch {
            '０'..='９' => char::from_u32(u32::from(ch) - u32::from('０') + u32::from('0')).unwrap_or(ch),
            other => other,
        })
        .collect();
    digits.parse::<u32>().ok().map(saturate)
}

fn kanji_number(text: &str) -> Option<u8> {
    let number = match text {
        "一" => 1,
        "二" => 2,
        "三" => 3,
        "四" => 4,
        "五" => 5,
        "六" => 6,
        "七" => 7,
        "八" => 8,
        "九" => 9,
        "十" => 10,
        _ => return None,
    };
    Some(number)
}

fn leading_number(text: &str) -> Option<u8> {
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse::<u32>().ok().map(saturate)
}

fn saturate(value: u32) -> u8 {
    u8::try_from(value).unwrap_or(u8::MAX)
}
