//! Contact details and service interests mentioned in visitor messages

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap();

    // Optional country code, then 3-3-4 grouping with single separators.
    static ref PHONE_REGEX: Regex = Regex::new(
        r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{3}\)|\d{3})[\s.-]?\d{3}[\s.-]?\d{4}\b"
    )
    .unwrap();

    static ref SERVICE_PATTERNS: Vec<(&'static str, Regex)> = vec![
        (
            "web-development",
            Regex::new(r"(?i)\b(website|web\s*(site|design|development|app))\b").unwrap(),
        ),
        ("seo", Regex::new(r"(?i)\b(seo|search engine)\b").unwrap()),
        (
            "ecommerce",
            Regex::new(r"(?i)\b(e-?commerce|online store|shopify)\b").unwrap(),
        ),
        (
            "mobile-app",
            Regex::new(r"(?i)\b(mobile app|ios app|android app)\b").unwrap(),
        ),
        ("branding", Regex::new(r"(?i)\b(branding|logo|brand identity)\b").unwrap()),
        (
            "marketing",
            Regex::new(r"(?i)\b(marketing|advertising|social media)\b").unwrap(),
        ),
    ];
}

const MIN_PHONE_DIGITS: usize = 10;
const MAX_PHONE_DIGITS: usize = 15;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectedSignals {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub service_tags: Vec<&'static str>,
}

impl DetectedSignals {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none() && self.service_tags.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SignalExtractor;

impl SignalExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, text: &str) -> DetectedSignals {
        DetectedSignals {
            email: self.find_email(text),
            phone: self.find_phone(text),
            service_tags: self.find_service_tags(text),
        }
    }

    pub fn find_email(&self, text: &str) -> Option<String> {
        EMAIL_REGEX
            .find(text)
            .map(|m| m.as_str().trim_end_matches('.').to_lowercase())
    }

    /// First plausible phone number, normalized to digits with an optional
    /// leading `+`. Digit runs that continue a longer token (dates, order or
    /// tracking numbers) are skipped.
    pub fn find_phone(&self, text: &str) -> Option<String> {
        PHONE_REGEX.find_iter(text).find_map(|m| {
            if continues_token(text, m.start()) {
                return None;
            }
            let raw = m.as_str();
            let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
            if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
                return None;
            }
            if raw.starts_with('+') {
                Some(format!("+{}", digits))
            } else {
                Some(digits)
            }
        })
    }

    pub fn find_service_tags(&self, text: &str) -> Vec<&'static str> {
        SERVICE_PATTERNS
            .iter()
            .filter(|(_, pattern)| pattern.is_match(text))
            .map(|(tag, _)| *tag)
            .collect()
    }
}

fn continues_token(text: &str, start: usize) -> bool {
    text[..start]
        .chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '/' | '#'))
}
