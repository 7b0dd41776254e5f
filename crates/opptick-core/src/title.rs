//! Title suggestion for intake: organization name, short summary, and a
//! proposed title built from both.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::MAX_TITLE_LENGTH;

const SUMMARY_MAX_CHARS: usize = 150;
const ORG_MIN_CHARS: usize = 3;
const ORG_MAX_CHARS: usize = 50;
const FIRST_LINE_CHARS: usize = 60;
const SUGGESTED_TITLE_MAX_CHARS: usize = 80;
const FALLBACK_TITLE: &str = "Opportunity";

static RE_LABELED_ORG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:company|organi[sz]ation|organizer|host)\s*:\s*(.+?)\s*$").unwrap()
});

static RE_PREPOSITION_ORG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\b(?:at|from|by)|@)\s+([A-Z][\w&]*(?:[ \t]+(?:&[ \t]+)?[A-Z][\w&]*)*)").unwrap()
});

static RE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)https?://\S+|www\.\S+").unwrap());

static RE_SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?]\s+").unwrap());

static RE_FIRST_LINE_NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\d{4}|\b(?:deadline|due|apply|application)\b").unwrap()
});

/// Words that look like names after "by" but are dates.
const CALENDAR_WORDS: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec", "mon",
    "tue", "wed", "thu", "fri", "sat", "sun", "today", "tomorrow", "next", "end",
];

/// Everything intake proposes about an inbound text besides its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleSuggestion {
    pub organization: Option<String>,
    pub summary: String,
    pub title: String,
}

pub fn suggest(text: &str) -> TitleSuggestion {
    let organization = extract_organization(text);
    let summary = summarize(text, SUMMARY_MAX_CHARS);
    let title = suggest_title(text, organization.as_deref(), &summary);
    TitleSuggestion {
        organization,
        summary,
        title,
    }
}

fn plausible_org(candidate: &str) -> Option<String> {
    let candidate = collapse_whitespace(candidate);
    let len = candidate.chars().count();
    if !(ORG_MIN_CHARS..ORG_MAX_CHARS).contains(&len) {
        return None;
    }
    let first = candidate
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    if CALENDAR_WORDS.iter().any(|w| first.starts_with(w)) {
        return None;
    }
    Some(candidate)
}

/// Organization named by a `Company:` style line, an `at/from/by <Name>`
/// phrase, or a short capitalized first line.
pub fn extract_organization(text: &str) -> Option<String> {
    if let Some(org) = RE_LABELED_ORG
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .find_map(|m| plausible_org(m.as_str()))
    {
        return Some(org);
    }

    if let Some(org) = RE_PREPOSITION_ORG
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .find_map(|m| plausible_org(m.as_str()))
    {
        return Some(org);
    }

    let first_line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let starts_upper = first_line.chars().next().is_some_and(char::is_uppercase);
    if starts_upper
        && first_line.chars().count() < ORG_MAX_CHARS
        && !RE_FIRST_LINE_NOISE.is_match(first_line)
    {
        return plausible_org(first_line);
    }
    None
}

/// First sentences of `text` (URLs removed) that fit in `max_chars`.
pub fn summarize(text: &str, max_chars: usize) -> String {
    let cleaned = collapse_whitespace(&RE_URL.replace_all(text, ""));
    if cleaned.is_empty() {
        return String::new();
    }

    let mut summary = String::new();
    for sentence in RE_SENTENCE_END.split(&cleaned) {
        let sentence = sentence.trim_end_matches(['.', '!', '?']);
        if sentence.is_empty() {
            continue;
        }
        if summary.chars().count() + sentence.chars().count() + 2 > max_chars {
            break;
        }
        summary.push_str(sentence);
        summary.push_str(". ");
    }

    let summary = if summary.is_empty() {
        cleaned
    } else {
        summary.trim_end().to_string()
    };
    truncate_chars(&summary, max_chars)
}

fn suggest_title(text: &str, organization: Option<&str>, summary: &str) -> String {
    let raw = match organization {
        Some(org) if !summary.is_empty() => {
            let words: Vec<&str> = summary.split_whitespace().take(5).collect();
            format!("{org} - {}", words.join(" "))
        }
        Some(org) => org.to_string(),
        None => text
            .lines()
            .map(|l| l.trim_start_matches(|c: char| !c.is_alphanumeric()).trim())
            .find(|l| !l.is_empty())
            .map(|l| l.chars().take(FIRST_LINE_CHARS).collect::<String>())
            .unwrap_or_default(),
    };

    let title = truncate_chars(&collapse_whitespace(&raw), SUGGESTED_TITLE_MAX_CHARS);
    if title.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        title
    }
}

/// Clean a user-typed title: collapse whitespace and cap the length.
pub fn normalize_title(input: &str) -> String {
    collapse_whitespace(input)
        .chars()
        .take(MAX_TITLE_LENGTH)
        .collect::<String>()
        .trim_end()
        .to_string()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut to `max` chars, ending in `...` when something was dropped.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept.trim_end())
}
