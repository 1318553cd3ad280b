//! Cheap, keyword-based insights about invoices, receipts and bills.
//!
//! This is deliberately simple pattern matching over the recognized text. It
//! is good enough to sort a pile of scanned paperwork, and nothing more.

use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;

use crate::prelude::*;

/// Keywords for each document type, in tie-breaking order.
const TYPE_KEYWORDS: &[(DocumentType, &[&str])] = &[
    (
        DocumentType::Invoice,
        &["invoice", "bill", "inv no", "invoice no", "invoice #"],
    ),
    (
        DocumentType::Receipt,
        &["receipt", "payment received", "paid"],
    ),
    (DocumentType::Bill, &["bill", "statement", "amount due"]),
];

/// Currency markers, checked in this order.
const CURRENCY_MARKERS: &[(&str, &str)] = &[
    ("$", "USD"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("¥", "JPY"),
    ("₹", "INR"),
    ("Rs", "INR"),
    ("PKR", "PKR"),
];

/// Lines containing these words are not vendor names.
const VENDOR_NOISE_WORDS: &[&str] = &["invoice", "receipt", "bill", "tax", "date"];

const VENDOR_SEARCH_LINES: usize = 5;
const VENDOR_MAX_CHARS: usize = 100;
const LONG_TEXT_WORDS: usize = 20;

static AMOUNT_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(?:total|amount|sum|pay|due)[\s:]*[$€£¥₹Rs]*\s*(\d+[,.]?\d*\.?\d+)",
        r"[$€£¥₹]\s*(\d+[,.]?\d*\.?\d+)",
        r"(?i)(?:Rs\.?|PKR)\s*(\d+[,.]?\d*\.?\d+)",
    ]
    .into_iter()
    .map(|re| Regex::new(re).expect("invalid amount regex"))
    .collect()
});

static ANY_NUMBER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d").expect("invalid number regex"));

/// What kind of paperwork does this look like?
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Invoice,
    Receipt,
    Bill,
    Unknown,
}

/// Heuristic facts about a document's text.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Insights {
    pub document_type: DocumentType,

    /// The largest amount which looks like a total.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<f64>,

    /// ISO 4217 code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,

    /// How much we trust the above, from 0 to 1.
    pub score: f32,
}

impl Insights {
    /// Analyze `text`.
    pub fn extract(text: &str) -> Self {
        if text.trim().is_empty() {
            return Self {
                document_type: DocumentType::Unknown,
                total_amount: None,
                currency: None,
                vendor: None,
                score: 0.0,
            };
        }
        let lower = text.to_lowercase();
        Self {
            document_type: classify(&lower),
            total_amount: total_amount(text),
            currency: currency(text),
            vendor: vendor(text),
            score: score(text, &lower),
        }
    }
}

fn classify(lower: &str) -> DocumentType {
    let mut best = (DocumentType::Unknown, 0);
    for (doc_type, keywords) in TYPE_KEYWORDS {
        let hits = keywords.iter().filter(|kw| lower.contains(*kw)).count();
        if hits > best.1 {
            best = (*doc_type, hits);
        }
    }
    best.0
}

fn total_amount(text: &str) -> Option<f64> {
    AMOUNT_REGEXES
        .iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|caps| caps.get(1)?.as_str().replace(',', "").parse::<f64>().ok())
        .fold(None, |best: Option<f64>, amount| {
            Some(best.map_or(amount, |b| b.max(amount)))
        })
}

fn currency(text: &str) -> Option<String> {
    CURRENCY_MARKERS
        .iter()
        .find(|(marker, _)| text.contains(marker))
        .map(|(_, code)| (*code).to_owned())
}

fn vendor(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(VENDOR_SEARCH_LINES)
        .find(|line| {
            let lower = line.to_lowercase();
            line.chars().count() > 3 && !VENDOR_NOISE_WORDS.iter().any(|w| lower.contains(w))
        })
        .map(|line| line.chars().take(VENDOR_MAX_CHARS).collect())
}

fn score(text: &str, lower: &str) -> f32 {
    let mut score = 0.0f32;
    if ANY_NUMBER_REGEX.is_match(text) {
        score += 0.4;
    }
    if TYPE_KEYWORDS
        .iter()
        .flat_map(|(_, keywords)| keywords.iter())
        .any(|kw| lower.contains(kw))
    {
        score += 0.3;
    }
    if text.split_whitespace().count() > LONG_TEXT_WORDS {
        score += 0.3;
    }
    score.min(1.0)
}
