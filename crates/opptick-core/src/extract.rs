//! Deadline extraction from free text.
//!
//! Regex patterns cover the fixed formats (ISO dates, month names, numeric
//! dates) and a small set of relative phrases. Every match becomes a
//! [`DeadlineCandidate`] with a confidence score; the caller decides which
//! one to propose.

use std::ops::Range;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc, Weekday};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

// ── Confidence levels ───────────────────────────────────────────────────

const CONF_ISO: f32 = 0.95;
const CONF_MONTH_WITH_YEAR: f32 = 0.9;
const CONF_MONTH_NO_YEAR: f32 = 0.75;
const CONF_NUMERIC: f32 = 0.7;
const CONF_NUMERIC_AMBIGUOUS: f32 = 0.35;
const CONF_RELATIVE: f32 = 0.8;
const PENALTY_NO_YEAR: f32 = 0.1;
const KEYWORD_BOOST: f32 = 0.05;

/// How far before a match (bytes) a deadline keyword still counts.
const KEYWORD_WINDOW: usize = 40;

// ── Regex patterns ──────────────────────────────────────────────────────

const MONTHS: &str = r"jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sept?(?:ember)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?";

static RE_ISO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{4})[-/](\d{1,2})[-/](\d{1,2})(?:[T ](\d{1,2}):(\d{2}))?\b").unwrap()
});

static RE_MONTH_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b({MONTHS})\.?\s+(\d{{1,2}})(?:st|nd|rd|th)?\b(?:,?\s*(\d{{4}})\b)?"
    ))
    .unwrap()
});

static RE_DAY_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?({MONTHS})\b\.?(?:,?\s*(\d{{4}})\b)?"
    ))
    .unwrap()
});

static RE_NUMERIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})([/.-])(\d{1,2})(?:([/.-])(\d{4}|\d{2}))?\b").unwrap()
});

static RE_IN_N: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bin\s+(\d{1,3}|an?|one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve)\s+(day|week|month|year)s?\b",
    )
    .unwrap()
});

static RE_NEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bnext\s+(week|month|monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b",
    )
    .unwrap()
});

static RE_DAY_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(today|tomorrow)\b").unwrap());

static RE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:deadline|due|apply\s+by|closes?|until|by|before|ends?)\b").unwrap()
});

// ── Types ───────────────────────────────────────────────────────────────

/// A possible deadline found in text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlineCandidate {
    pub at: DateTime<Utc>,
    /// 0.0–1.0.
    pub confidence: f32,
    /// Byte range of the match in the input.
    pub span: Range<usize>,
    pub matched: String,
}

/// Proposes deadlines from free text.
pub trait DeadlineExtractor: Send + Sync {
    /// Candidates ordered by confidence descending, then position. Never
    /// fails; no match yields an empty vec.
    fn extract(&self, text: &str, now: DateTime<Utc>) -> Vec<DeadlineCandidate>;
}

/// Regex-based extractor for explicit and simple relative dates.
#[derive(Debug, Clone, Default)]
pub struct PatternExtractor;

impl PatternExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl DeadlineExtractor for PatternExtractor {
    fn extract(&self, text: &str, now: DateTime<Utc>) -> Vec<DeadlineCandidate> {
        let mut found: Vec<DeadlineCandidate> = Vec::new();
        let mut taken: Vec<Range<usize>> = Vec::new();

        // Most specific forms first; later patterns skip spans already claimed.
        let passes: [(&Regex, fn(&Captures<'_>, DateTime<Utc>) -> Vec<(DateTime<Utc>, f32)>); 7] = [
            (&*RE_ISO, iso_dates),
            (&*RE_MONTH_FIRST, month_first_dates),
            (&*RE_DAY_FIRST, day_first_dates),
            (&*RE_NUMERIC, numeric_dates),
            (&*RE_IN_N, in_n_units),
            (&*RE_NEXT, next_unit),
            (&*RE_DAY_WORD, day_word),
        ];

        for (re, resolve) in passes {
            for caps in re.captures_iter(text) {
                let Some(m) = caps.get(0) else { continue };
                let span = m.range();
                if taken.iter().any(|t| overlaps(t, &span)) {
                    continue;
                }
                let resolved = resolve(&caps, now);
                if resolved.is_empty() {
                    continue;
                }
                taken.push(span.clone());
                let boost = if has_keyword_before(text, span.start) {
                    KEYWORD_BOOST
                } else {
                    0.0
                };
                for (at, confidence) in resolved {
                    found.push(DeadlineCandidate {
                        at,
                        confidence: (confidence + boost).clamp(0.0, 1.0),
                        span: span.clone(),
                        matched: m.as_str().to_string(),
                    });
                }
            }
        }

        rank(found)
    }
}

/// Dedupe by instant keeping the best score, then order by confidence
/// descending and position ascending.
fn rank(mut found: Vec<DeadlineCandidate>) -> Vec<DeadlineCandidate> {
    found.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(a.span.start.cmp(&b.span.start))
    });
    let mut out: Vec<DeadlineCandidate> = Vec::with_capacity(found.len());
    for candidate in found {
        if !out.iter().any(|c| c.at == candidate.at) {
            out.push(candidate);
        }
    }
    out
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

fn has_keyword_before(text: &str, start: usize) -> bool {
    let mut from = start.saturating_sub(KEYWORD_WINDOW);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    RE_KEYWORD.is_match(&text[from..start])
}

/// Date-only deadlines resolve to the last minute of the day.
pub fn end_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(23, 59, 0).map(|dt| dt.and_utc())
}

fn num(caps: &Captures<'_>, idx: usize) -> Option<u32> {
    caps.get(idx).and_then(|m| m.as_str().parse().ok())
}

fn month_index(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect::<String>().to_lowercase();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Next occurrence of `month`/`day` on or after today.
fn next_occurrence(month: u32, day: u32, now: DateTime<Utc>) -> Option<NaiveDate> {
    let today = now.date_naive();
    (0..=4).find_map(|offset| {
        NaiveDate::from_ymd_opt(today.year() + offset, month, day).filter(|d| *d >= today)
    })
}

// ── Resolvers ───────────────────────────────────────────────────────────

fn iso_dates(caps: &Captures<'_>, _now: DateTime<Utc>) -> Vec<(DateTime<Utc>, f32)> {
    let (Some(year), Some(month), Some(day)) = (num(caps, 1), num(caps, 2), num(caps, 3)) else {
        return Vec::new();
    };
    let Some(date) = NaiveDate::from_ymd_opt(year as i32, month, day) else {
        return Vec::new();
    };
    let at = match (num(caps, 4), num(caps, 5)) {
        (Some(h), Some(m)) => date.and_hms_opt(h, m, 0).map(|dt| dt.and_utc()),
        _ => end_of_day(date),
    };
    at.map(|at| vec![(at, CONF_ISO)]).unwrap_or_default()
}

fn month_name_date(
    month_name: &str,
    day: Option<u32>,
    year: Option<u32>,
    now: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, f32)> {
    let (Some(month), Some(day)) = (month_index(month_name), day) else {
        return Vec::new();
    };
    let (date, confidence) = match year {
        Some(y) => (
            NaiveDate::from_ymd_opt(y as i32, month, day),
            CONF_MONTH_WITH_YEAR,
        ),
        None => (next_occurrence(month, day, now), CONF_MONTH_NO_YEAR),
    };
    date.and_then(end_of_day)
        .map(|at| vec![(at, confidence)])
        .unwrap_or_default()
}

fn month_first_dates(caps: &Captures<'_>, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, f32)> {
    let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    month_name_date(name, num(caps, 2), num(caps, 3), now)
}

fn day_first_dates(caps: &Captures<'_>, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, f32)> {
    let name = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    month_name_date(name, num(caps, 1), num(caps, 3), now)
}

fn numeric_dates(caps: &Captures<'_>, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, f32)> {
    let (Some(first), Some(second)) = (num(caps, 1), num(caps, 3)) else {
        return Vec::new();
    };
    let sep = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    let year = match (caps.get(4), caps.get(5)) {
        (Some(sep2), Some(y)) => {
            if sep2.as_str() != sep {
                return Vec::new();
            }
            let y: i32 = y.as_str().parse().unwrap_or(0);
            Some(if y < 100 { 2000 + y } else { y })
        }
        // Without a year only `DD/MM` is a date; `1.5` and `3-4` are not.
        _ if sep != "/" => return Vec::new(),
        _ => None,
    };

    let resolve = |day: u32, month: u32| -> Option<DateTime<Utc>> {
        let date = match year {
            Some(y) => NaiveDate::from_ymd_opt(y, month, day),
            None => next_occurrence(month, day, now),
        };
        date.and_then(end_of_day)
    };

    let day_first = resolve(first, second);
    let month_first = resolve(second, first);
    let penalty = if year.is_none() { PENALTY_NO_YEAR } else { 0.0 };

    match (day_first, month_first) {
        (Some(a), Some(b)) if a != b => vec![
            (a, CONF_NUMERIC_AMBIGUOUS - penalty),
            (b, CONF_NUMERIC_AMBIGUOUS - penalty),
        ],
        (Some(a), _) => vec![(a, CONF_NUMERIC - penalty)],
        (None, Some(b)) => vec![(b, CONF_NUMERIC - penalty)],
        (None, None) => Vec::new(),
    }
}

fn word_number(word: &str) -> Option<u32> {
    let n = match word.to_lowercase().as_str() {
        "a" | "an" | "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        digits => return digits.parse().ok(),
    };
    Some(n)
}

fn in_n_units(caps: &Captures<'_>, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, f32)> {
    let Some(n) = caps.get(1).and_then(|m| word_number(m.as_str())) else {
        return Vec::new();
    };
    let unit = caps
        .get(2)
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default();
    let at = match unit.as_str() {
        "day" => now.checked_add_signed(Duration::days(i64::from(n))),
        "week" => now.checked_add_signed(Duration::weeks(i64::from(n))),
        "month" => now.checked_add_months(Months::new(n)),
        "year" => n
            .checked_mul(12)
            .and_then(|m| now.checked_add_months(Months::new(m))),
        _ => None,
    };
    at.map(|at| vec![(at, CONF_RELATIVE)]).unwrap_or_default()
}

fn next_unit(caps: &Captures<'_>, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, f32)> {
    let unit = caps
        .get(1)
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default();
    let at = match unit.as_str() {
        "week" => now.checked_add_signed(Duration::days(7)),
        "month" => now.checked_add_months(Months::new(1)),
        day => day
            .parse::<Weekday>()
            .ok()
            .and_then(|target| next_weekday(now.date_naive(), target))
            .and_then(end_of_day),
    };
    at.map(|at| vec![(at, CONF_RELATIVE)]).unwrap_or_default()
}

/// First `target` strictly after `today`.
fn next_weekday(today: NaiveDate, target: Weekday) -> Option<NaiveDate> {
    let ahead = (7 + target.num_days_from_monday() - today.weekday().num_days_from_monday()) % 7;
    let ahead = if ahead == 0 { 7 } else { ahead };
    today.checked_add_signed(Duration::days(i64::from(ahead)))
}

fn day_word(caps: &Captures<'_>, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, f32)> {
    let word = caps
        .get(1)
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default();
    let today = now.date_naive();
    let date = match word.as_str() {
        "today" => Some(today),
        "tomorrow" => today.succ_opt(),
        _ => None,
    };
    date.and_then(end_of_day)
        .map(|at| vec![(at, CONF_RELATIVE)])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        // A Saturday.
        Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
    }

    fn eod(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 23, 59, 0).unwrap()
    }

    fn extract(text: &str) -> Vec<DeadlineCandidate> {
        PatternExtractor::new().extract(text, now())
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn iso_date_resolves_to_end_of_day() {
        let c = extract("Portal opens 2026-03-15");
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].at, eod(2026, 3, 15));
        assert!(approx(c[0].confidence, 0.95));
        assert_eq!(c[0].matched, "2026-03-15");
        assert_eq!(&"Portal opens 2026-03-15"[c[0].span.clone()], "2026-03-15");
    }

    #[test]
    fn iso_with_time_and_slashes() {
        let c = extract("Submit 2026/03/15 17:30 sharp");
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].at, Utc.with_ymd_and_hms(2026, 3, 15, 17, 30, 0).unwrap());
    }

    #[test]
    fn keyword_boosts_confidence() {
        let c = extract("Deadline: 2026-03-15");
        assert!(approx(c[0].confidence, 1.0));
        let c = extract("Apply by March 15, 2026");
        assert!(approx(c[0].confidence, 0.95));
    }

    #[test]
    fn month_name_forms() {
        for text in [
            "Feb 20, 2026",
            "February 20th 2026",
            "20 February 2026",
            "the 20th of Feb 2026",
        ] {
            let c = extract(text);
            assert_eq!(c.len(), 1, "{text}");
            assert_eq!(c[0].at, eod(2026, 2, 20), "{text}");
            assert!(approx(c[0].confidence, 0.9), "{text}");
        }
    }

    #[test]
    fn month_without_year_is_next_occurrence() {
        let c = extract("closing on the 20th of Feb");
        assert_eq!(c[0].at, eod(2026, 2, 20));

        // Already past this year: rolls over.
        let c = extract("Jan 5");
        assert_eq!(c[0].at, eod(2027, 1, 5));
        assert!(approx(c[0].confidence, 0.75));
    }

    #[test]
    fn numeric_unambiguous_date() {
        let c = extract("Event on 25/12/2026");
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].at, eod(2026, 12, 25));
        assert!(approx(c[0].confidence, 0.7));

        let c = extract("Event on 12/25/2026");
        assert_eq!(c[0].at, eod(2026, 12, 25));
    }

    #[test]
    fn numeric_ambiguous_returns_both_readings() {
        let c = extract("03/04/2026");
        assert_eq!(c.len(), 2);
        assert!(c.iter().all(|c| approx(c.confidence, 0.35)));
        let dates: Vec<_> = c.iter().map(|c| c.at).collect();
        assert!(dates.contains(&eod(2026, 4, 3)));
        assert!(dates.contains(&eod(2026, 3, 4)));
    }

    #[test]
    fn numeric_equal_fields_is_unambiguous() {
        let c = extract("05.05.2026");
        assert_eq!(c.len(), 1);
        assert!(approx(c[0].confidence, 0.7));
    }

    #[test]
    fn numeric_without_year_is_penalized() {
        let c = extract("25/12");
        assert_eq!(c[0].at, eod(2026, 12, 25));
        assert!(approx(c[0].confidence, 0.6));
    }

    #[test]
    fn decimals_are_not_dates() {
        assert!(extract("GPA above 3.5 required").is_empty());
    }

    #[test]
    fn relative_in_n_units() {
        let c = extract("closes in 3 days");
        assert_eq!(c[0].at, now() + Duration::days(3));
        assert!(approx(c[0].confidence, 0.85));

        let c = extract("in two weeks");
        assert_eq!(c[0].at, now() + Duration::weeks(2));
        assert!(approx(c[0].confidence, 0.8));

        let c = extract("in a month");
        assert_eq!(c[0].at, Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap());
    }

    #[test]
    fn relative_next_and_day_words() {
        let c = extract("next week");
        assert_eq!(c[0].at, now() + Duration::days(7));

        let c = extract("next month");
        assert_eq!(c[0].at, Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap());

        let c = extract("tomorrow");
        assert_eq!(c[0].at, eod(2026, 1, 11));

        let c = extract("today");
        assert_eq!(c[0].at, eod(2026, 1, 10));

        // now() is a Saturday.
        let c = extract("next friday");
        assert_eq!(c[0].at, eod(2026, 1, 16));
        let c = extract("next saturday");
        assert_eq!(c[0].at, eod(2026, 1, 17));
    }

    #[test]
    fn no_date_yields_empty() {
        assert!(extract("Great opportunity, apply soon!").is_empty());
        assert!(extract("").is_empty());
    }

    #[test]
    fn invalid_calendar_dates_are_skipped() {
        assert!(extract("2026-02-30").is_empty());
        assert!(extract("Feb 30, 2026").is_empty());
    }

    #[test]
    fn past_dates_are_returned() {
        let c = extract("2020-01-01");
        assert_eq!(c.len(), 1);
        assert!(c[0].at < now());
    }

    #[test]
    fn dedupes_same_instant_keeping_best() {
        let c = extract("2026-03-15 (March 15, 2026)");
        assert_eq!(c.len(), 1);
        assert!(approx(c[0].confidence, 0.95));
        assert_eq!(c[0].matched, "2026-03-15");
    }

    #[test]
    fn ordered_by_confidence_then_position() {
        let c = extract("kickoff in 3 days, final submission 2026-03-15");
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].at, eod(2026, 3, 15));
        assert_eq!(c[1].at, now() + Duration::days(3));
    }

    #[test]
    fn iso_is_not_reread_as_numeric() {
        let c = extract("2026-03-01");
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn non_ascii_text_does_not_panic() {
        let text = "🎓 Стипендия — срок подачи: 2026-03-15 ✨";
        let c = extract(text);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].at, eod(2026, 3, 15));
        assert!(approx(c[0].confidence, 0.95));
    }
}
