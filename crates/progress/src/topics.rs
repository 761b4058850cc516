//! Topic extraction from a configuration document.
//!
//! Three strategies are tried in order and the first one that yields at
//! least one topic wins:
//!
//! 1. Inline markers, either `[TOPIC: Name | kw1, kw2]` or
//!    `[TOPIC:id="x" name="Name" keywords="kw1,kw2"]`.
//! 2. A `TRACKABLE_TOPICS` section (markdown, HTML or plain heading) with
//!    `name:` / `keywords:` / optional `id:` lines.
//! 3. A generic fallback on `Topic: Name` lines.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\[TOPIC:([^\]]*)\]").unwrap());

static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z_]+)\s*=\s*"([^"]*)""#).unwrap());

static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

static SECTION_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(#{1,6}\s|<h[1-6][\s>]|END_TRACKABLE_TOPICS)").unwrap());

static KEY_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(id|name|title|keywords)\s*:\s*(.*)$").unwrap());

/// `Topic: X`, `Topic 2: X` or `Topic - X`. A dash only counts with space
/// on both sides, so prose like "Topic-based approach" is not a topic.
static FALLBACK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*(?:[-*]\s*)?topic\s*\d*(?:\s*:|\s+-\s)\s*(.+?)\s*$").unwrap());

const SECTION_HEADING: &str = "TRACKABLE_TOPICS";

/// Title words shorter than this are not used as fallback keywords.
const FALLBACK_KEYWORD_MIN_CHARS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Which strategy produced the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStrategy {
    InlineMarkers,
    TrackableSection,
    GenericFallback,
}

/// The topics of one configuration document. Immutable once parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicCatalog {
    topics: Vec<Topic>,
    strategy: Option<ParseStrategy>,
}

/// A topic before id assignment.
struct RawTopic {
    id: Option<String>,
    title: String,
    keywords: Vec<String>,
}

impl TopicCatalog {
    pub fn parse(document: &str) -> Self {
        let attempts: [(ParseStrategy, fn(&str) -> Vec<RawTopic>); 3] = [
            (ParseStrategy::InlineMarkers, parse_markers),
            (ParseStrategy::TrackableSection, parse_section),
            (ParseStrategy::GenericFallback, parse_fallback),
        ];

        for (strategy, parse) in attempts {
            let raw = parse(document);
            if !raw.is_empty() {
                let topics = assign_ids(raw);
                tracing::debug!(strategy = ?strategy, count = topics.len(), "Parsed trackable topics");
                return Self {
                    topics,
                    strategy: Some(strategy),
                };
            }
        }

        Self::default()
    }

    pub fn from_topics(topics: Vec<Topic>) -> Self {
        Self {
            topics,
            strategy: None,
        }
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn strategy(&self) -> Option<ParseStrategy> {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Topic> {
        self.topics.iter().find(|t| t.id == id)
    }

    /// Look a topic up by id, then by case-insensitive title.
    pub fn resolve(&self, id_or_title: &str) -> Option<&Topic> {
        let needle = id_or_title.trim();
        self.get(needle).or_else(|| {
            self.topics
                .iter()
                .find(|t| t.title.eq_ignore_ascii_case(needle) || t.id == slugify(needle))
        })
    }
}

/// Lowercase ASCII slug: runs of non-alphanumerics become one `_`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_sep = false;
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if slug.is_empty() { "topic".into() } else { slug }
}

fn split_keywords(list: &str) -> Vec<String> {
    list.split([',', ';'])
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

fn assign_ids(raw: Vec<RawTopic>) -> Vec<Topic> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|r| !r.title.trim().is_empty())
        .map(|r| {
            let base = r
                .id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| slugify(&r.title));
            let mut id = base.clone();
            let mut n = 2;
            while !seen.insert(id.clone()) {
                id = format!("{base}_{n}");
                n += 1;
            }
            Topic {
                id,
                title: r.title.trim().to_string(),
                keywords: r.keywords,
            }
        })
        .collect()
}

fn parse_markers(document: &str) -> Vec<RawTopic> {
    MARKER_RE
        .captures_iter(document)
        .filter_map(|caps| {
            let inner = caps.get(1)?.as_str().trim();
            if inner.contains("=\"") {
                let mut id = None;
                let mut title = String::new();
                let mut keywords = Vec::new();
                for attr in ATTR_RE.captures_iter(inner) {
                    let value = attr[2].trim();
                    match attr[1].to_ascii_lowercase().as_str() {
                        "id" => id = Some(value.to_string()),
                        "name" | "title" => title = value.to_string(),
                        "keywords" => keywords = split_keywords(value),
                        _ => {}
                    }
                }
                Some(RawTopic { id, title, keywords })
            } else {
                let (title, keywords) = match inner.split_once('|') {
                    Some((t, k)) => (t, split_keywords(k)),
                    None => (inner, Vec::new()),
                };
                Some(RawTopic {
                    id: None,
                    title: title.trim().to_string(),
                    keywords,
                })
            }
        })
        .collect()
}

fn parse_section(document: &str) -> Vec<RawTopic> {
    // ASCII uppercasing keeps byte offsets intact
    let Some(heading) = document.to_ascii_uppercase().find(SECTION_HEADING) else {
        return Vec::new();
    };
    let body = &document[heading + SECTION_HEADING.len()..];

    let mut topics = Vec::new();
    let mut current: Option<RawTopic> = None;

    for line in body.lines() {
        if SECTION_END_RE.is_match(line) {
            break;
        }

        // Tags become line breaks so `<li>name: X</li><li>keywords: y</li>` splits
        let text = HTML_TAG_RE.replace_all(line, "\n");
        for piece in text.lines() {
            let piece = piece
                .trim()
                .trim_start_matches(['-', '*', '•'])
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
                .trim();
            let Some(caps) = KEY_VALUE_RE.captures(piece) else {
                continue;
            };
            let value = caps[2].trim().to_string();
            match caps[1].to_ascii_lowercase().as_str() {
                "name" | "title" => match current.as_mut() {
                    // `id:` came first
                    Some(topic) if topic.title.is_empty() => topic.title = value,
                    _ => {
                        topics.extend(current.take());
                        current = Some(RawTopic {
                            id: None,
                            title: value,
                            keywords: Vec::new(),
                        });
                    }
                },
                "keywords" => {
                    if let Some(topic) = current.as_mut() {
                        topic.keywords = split_keywords(&value);
                    }
                }
                "id" => match current.as_mut() {
                    Some(topic) if topic.id.is_none() => topic.id = Some(value),
                    _ => {
                        topics.extend(current.take());
                        current = Some(RawTopic {
                            id: Some(value),
                            title: String::new(),
                            keywords: Vec::new(),
                        });
                    }
                },
                _ => {}
            }
        }
    }

    topics.extend(current);
    topics
}

fn parse_fallback(document: &str) -> Vec<RawTopic> {
    FALLBACK_RE
        .captures_iter(document)
        .map(|caps| {
            let title = caps[1].trim().to_string();
            let keywords = title
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| w.chars().count() >= FALLBACK_KEYWORD_MIN_CHARS)
                .map(|w| w.to_lowercase())
                .collect();
            RawTopic {
                id: None,
                title,
                keywords,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_markers() {
        let doc = "Intro.\n[TOPIC: Sleep Quality | sleep, rest, Night]\nMore text [TOPIC: Work stress | job, deadlines]";
        let catalog = TopicCatalog::parse(doc);
        assert_eq!(catalog.strategy(), Some(ParseStrategy::InlineMarkers));
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.topics()[0].id, "sleep_quality");
        assert_eq!(catalog.topics()[0].title, "Sleep Quality");
        assert_eq!(catalog.topics()[0].keywords, vec!["sleep", "rest", "night"]);
    }

    #[test]
    fn attribute_markers() {
        let doc = r#"[TOPIC:id="t1" name="Family" keywords="parents, siblings"] and [topic: name="Hobbies"]"#;
        let catalog = TopicCatalog::parse(doc);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("t1").unwrap().title, "Family");
        assert_eq!(catalog.get("t1").unwrap().keywords, vec!["parents", "siblings"]);
        assert_eq!(catalog.topics()[1].id, "hobbies");
    }

    #[test]
    fn markdown_section() {
        let doc = "\
# Instructions
Be kind.

## TRACKABLE_TOPICS
- id: t1
  name: Sleep
  keywords: rest, night
- name: Diet
  keywords: food, meals

## Other
name: Ignored
";
        let catalog = TopicCatalog::parse(doc);
        assert_eq!(catalog.strategy(), Some(ParseStrategy::TrackableSection));
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.topics()[0].id, "t1");
        assert_eq!(catalog.topics()[0].title, "Sleep");
        assert_eq!(catalog.topics()[1].id, "diet");
        assert_eq!(catalog.topics()[1].keywords, vec!["food", "meals"]);
    }

    #[test]
    fn html_section() {
        let doc = "<h2>TRACKABLE_TOPICS</h2><ul>\n<li>name: Exercise</li><li>keywords: gym, running</li>\n<li>name: Social life</li>\n</ul>\n<h2>Notes</h2>\n<li>name: Hidden</li>";
        let catalog = TopicCatalog::parse(doc);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.topics()[0].keywords, vec!["gym", "running"]);
        assert_eq!(catalog.topics()[1].id, "social_life");
    }

    #[test]
    fn plain_heading_section() {
        let doc = "TRACKABLE_TOPICS:\nname: Mood\nkeywords: feelings\nEND_TRACKABLE_TOPICS\nname: Not a topic";
        let catalog = TopicCatalog::parse(doc);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.topics()[0].title, "Mood");
    }

    #[test]
    fn markers_win_over_section() {
        let doc = "[TOPIC: Alpha | a]\nTRACKABLE_TOPICS\nname: Beta";
        let catalog = TopicCatalog::parse(doc);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.topics()[0].title, "Alpha");
    }

    #[test]
    fn hyphenated_prose_is_not_a_topic() {
        let doc = "Topic-based approach works well here.\nTopic - Sleep habits";
        let catalog = TopicCatalog::parse(doc);
        assert_eq!(catalog.strategy(), Some(ParseStrategy::GenericFallback));
        let titles: Vec<&str> = catalog.topics().iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["Sleep habits"]);

        assert!(TopicCatalog::parse("Topic-based approach only.").is_empty());
    }

    #[test]
    fn generic_fallback() {
        let doc = "Please cover:\nTopic 1: Daily Routine\n- topic: Coping strategies at work\nNothing else.";
        let catalog = TopicCatalog::parse(doc);
        assert_eq!(catalog.strategy(), Some(ParseStrategy::GenericFallback));
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.topics()[0].keywords, vec!["daily", "routine"]);
        assert_eq!(catalog.topics()[1].keywords, vec!["coping", "strategies", "work"]);
    }

    #[test]
    fn duplicate_ids_are_suffixed() {
        let doc = "[TOPIC: Sleep | a] [TOPIC: sleep | b] [TOPIC: SLEEP]";
        let ids: Vec<String> = TopicCatalog::parse(doc).topics().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec!["sleep", "sleep_2", "sleep_3"]);
    }

    #[test]
    fn no_topics_yields_empty_catalog() {
        let catalog = TopicCatalog::parse("Just be helpful.");
        assert!(catalog.is_empty());
        assert_eq!(catalog.strategy(), None);
    }

    #[test]
    fn resolve_by_title_or_slug() {
        let catalog = TopicCatalog::parse("[TOPIC: Work Stress | job]");
        assert_eq!(catalog.resolve("work_stress").unwrap().title, "Work Stress");
        assert_eq!(catalog.resolve("work stress").unwrap().id, "work_stress");
        assert!(catalog.resolve("holidays").is_none());
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("  Sleep -- & Rest!! "), "sleep_rest");
        assert_eq!(slugify("???"), "topic");
    }
}
