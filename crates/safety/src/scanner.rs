//! Pre-flight keyword scanner.
//!
//! Keywords are compiled once into word sequences. A single-word keyword
//! matches a whole word, case-insensitively. A phrase matches when each of
//! its words appears in order, each within `max_gap` characters of the
//! previous one; words of 4+ characters also accept close misspellings
//! (Jaro-Winkler similarity at or above `fuzzy_threshold`).

use dialoguard_config::{KeywordEntry, SafetyConfig};
use dialoguard_protocol::DangerLevel;
use serde::Serialize;

use crate::verdict::{SafetyVerdict, VerdictSource};

/// Words shorter than this are compared exactly.
const FUZZY_MIN_CHARS: usize = 4;

/// A compiled keyword.
#[derive(Debug, Clone)]
struct Keyword {
    phrase: String,
    words: Vec<String>,
    level: DangerLevel,
    category: Option<String>,
}

/// One keyword hit in a scanned text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordMatch {
    pub phrase: String,
    pub level: DangerLevel,
    pub category: Option<String>,
    /// Byte range of the matched span in the scanned text
    pub start: usize,
    pub end: usize,
}

/// A word of the scanned text with its byte span.
#[derive(Debug)]
struct Token {
    text: String,
    start: usize,
    end: usize,
}

/// Split into lowercase alphanumeric words, keeping byte offsets.
fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current: Option<(usize, String)> = None;

    for (idx, ch) in text.char_indices() {
        if ch.is_alphanumeric() {
            match &mut current {
                Some((_, word)) => word.extend(ch.to_lowercase()),
                None => current = Some((idx, ch.to_lowercase().collect())),
            }
        } else if let Some((start, word)) = current.take() {
            tokens.push(Token { text: word, start, end: idx });
        }
    }
    if let Some((start, word)) = current {
        tokens.push(Token {
            text: word,
            start,
            end: text.len(),
        });
    }
    tokens
}

#[derive(Debug, Clone)]
pub struct KeywordScanner {
    keywords: Vec<Keyword>,
    max_gap: usize,
    fuzzy_threshold: f64,
}

impl KeywordScanner {
    pub fn new(entries: &[KeywordEntry], max_gap: usize, fuzzy_threshold: f64) -> Self {
        let keywords = entries
            .iter()
            .filter_map(|entry| {
                let words: Vec<String> = tokenize(entry.phrase()).into_iter().map(|t| t.text).collect();
                if words.is_empty() {
                    return None;
                }
                let level = entry
                    .level()
                    .and_then(|l| l.parse().ok())
                    .unwrap_or(DangerLevel::Emergency);
                Some(Keyword {
                    phrase: entry.phrase().to_string(),
                    words,
                    level,
                    category: entry.category().map(String::from),
                })
            })
            .collect();

        Self {
            keywords,
            max_gap,
            fuzzy_threshold,
        }
    }

    pub fn from_config(config: &SafetyConfig) -> Self {
        Self::new(&config.keywords, config.phrase_max_gap, config.fuzzy_threshold)
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// The configured phrases, in configuration order.
    pub fn phrases(&self) -> Vec<&str> {
        self.keywords.iter().map(|k| k.phrase.as_str()).collect()
    }

    /// Every keyword found in `text` (first occurrence each).
    pub fn scan(&self, text: &str) -> Vec<KeywordMatch> {
        let tokens = tokenize(text);
        self.keywords
            .iter()
            .filter_map(|keyword| {
                self.find(keyword, &tokens).map(|(start, end)| KeywordMatch {
                    phrase: keyword.phrase.clone(),
                    level: keyword.level,
                    category: keyword.category.clone(),
                    start,
                    end,
                })
            })
            .collect()
    }

    /// Scan and summarise as a pre-flight verdict.
    pub fn verdict(&self, text: &str) -> (SafetyVerdict, Vec<KeywordMatch>) {
        let matches = self.scan(text);
        let mut verdict = SafetyVerdict::safe(VerdictSource::Preflight);

        for m in &matches {
            verdict.is_safe = false;
            verdict.danger_level = verdict.danger_level.max(m.level);
            verdict
                .detected_concerns
                .insert(m.category.clone().unwrap_or_else(|| format!("keyword:{}", m.phrase)));
        }
        verdict.requires_intervention = verdict.danger_level.blocks();

        (verdict, matches)
    }

    fn find(&self, keyword: &Keyword, tokens: &[Token]) -> Option<(usize, usize)> {
        if keyword.words.len() == 1 {
            return tokens
                .iter()
                .find(|t| t.text == keyword.words[0])
                .map(|t| (t.start, t.end));
        }

        tokens.iter().enumerate().find_map(|(i, token)| {
            if !self.word_matches(&keyword.words[0], &token.text) {
                return None;
            }
            self.follow(&keyword.words[1..], tokens, i)
                .map(|end| (token.start, end))
        })
    }

    /// Match the remaining phrase words after token `prev`; returns the end
    /// offset of the last matched word.
    fn follow(&self, remaining: &[String], tokens: &[Token], prev: usize) -> Option<usize> {
        let Some((word, rest)) = remaining.split_first() else {
            return Some(tokens[prev].end);
        };
        let prev_end = tokens[prev].end;

        tokens[prev + 1..]
            .iter()
            .enumerate()
            .take_while(|(_, t)| t.start - prev_end <= self.max_gap)
            .filter(|(_, t)| self.word_matches(word, &t.text))
            .find_map(|(offset, _)| self.follow(rest, tokens, prev + 1 + offset))
    }

    fn word_matches(&self, expected: &str, actual: &str) -> bool {
        if expected == actual {
            return true;
        }
        expected.chars().count() >= FUZZY_MIN_CHARS
            && actual.chars().count() >= FUZZY_MIN_CHARS
            && strsim::jaro_winkler(expected, actual) >= self.fuzzy_threshold
    }
}

/// Cut `text` to at most `max_chars` characters, on a char boundary.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
