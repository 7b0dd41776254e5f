//! Keyword category guess for intake.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::Category;

/// Guesses the category of an opportunity from its text.
pub trait Classifier: Send + Sync {
    /// Total: unknown text classifies as [`Category::Other`].
    fn classify(&self, text: &str) -> Category;
}

/// Checked in order; the first table with a whole-word hit wins.
const KEYWORDS: &[(Category, &[&str])] = &[
    (
        Category::Scholarship,
        &[
            "scholarship",
            "scholarships",
            "fellowship",
            "fellowships",
            "grant",
            "grants",
            "bursary",
            "stipend",
            "tuition",
            "financial aid",
        ],
    ),
    (
        Category::Internship,
        &[
            "internship",
            "internships",
            "intern",
            "interns",
            "co-op",
            "placement",
            "trainee",
            "apprenticeship",
        ],
    ),
    (
        Category::Event,
        &[
            "event",
            "events",
            "hackathon",
            "conference",
            "workshop",
            "webinar",
            "summit",
            "meetup",
            "competition",
            "bootcamp",
            "seminar",
        ],
    ),
    (
        Category::Job,
        &[
            "job",
            "jobs",
            "hiring",
            "position",
            "vacancy",
            "full-time",
            "part-time",
            "career",
            "careers",
            "role",
            "opening",
            "graduate program",
        ],
    ),
];

static TABLES: LazyLock<Vec<(Category, Regex)>> = LazyLock::new(|| {
    KEYWORDS
        .iter()
        .map(|(category, words)| {
            let alternation = words
                .iter()
                .map(|w| regex::escape(w).replace(' ', r"\s+"))
                .collect::<Vec<_>>()
                .join("|");
            let re = Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).unwrap();
            (*category, re)
        })
        .collect()
});

/// Fixed keyword table classifier.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Category {
        TABLES
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(category, _)| *category)
            .unwrap_or(Category::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> Category {
        KeywordClassifier::new().classify(text)
    }

    #[test]
    fn classifies_each_category() {
        assert_eq!(classify("Merit Scholarship for 2026"), Category::Scholarship);
        assert_eq!(classify("Summer INTERNSHIP at Acme"), Category::Internship);
        assert_eq!(classify("Join our hackathon this weekend"), Category::Event);
        assert_eq!(classify("We're hiring backend engineers"), Category::Job);
    }

    #[test]
    fn unknown_text_is_other() {
        assert_eq!(classify("Check this out"), Category::Other);
        assert_eq!(classify(""), Category::Other);
    }

    #[test]
    fn matches_whole_words_only() {
        // "internal" must not match "intern", "jobseeker" must not match "job".
        assert_eq!(classify("internal memo"), Category::Other);
        assert_eq!(classify("jobseeker forum"), Category::Other);
    }

    #[test]
    fn scholarship_wins_over_later_tables() {
        assert_eq!(
            classify("Internship with a scholarship stipend"),
            Category::Scholarship
        );
        assert_eq!(classify("Internship info event"), Category::Internship);
    }

    #[test]
    fn multi_word_keywords() {
        assert_eq!(classify("Need financial   aid?"), Category::Scholarship);
        assert_eq!(classify("graduate program intake"), Category::Job);
    }
}
