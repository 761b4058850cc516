//! Language-keyed confirmation prompts and answer detection.
//!
//! Supported languages: en, de, fr, es, nl, it. Anything else falls back
//! to English. Region suffixes (`de-AT`, `pt_BR`) are ignored.

use crate::topics::TopicCatalog;

struct Phrases {
    code: &'static str,
    /// `{topic}` is replaced with the topic title
    question: &'static str,
    yes: &'static [&'static str],
    no: &'static [&'static str],
}

const ENGLISH: Phrases = Phrases {
    code: "en",
    question: "Do you feel we have covered \"{topic}\" well enough to move on? Please answer yes or no.",
    yes: &["yes", "yeah", "yep", "sure", "ok", "okay", "correct", "definitely", "absolutely"],
    no: &["no", "not", "nope", "don't", "dont", "haven't", "havent"],
};

const LANGUAGES: &[Phrases] = &[
    ENGLISH,
    Phrases {
        code: "de",
        question: "Haben wir das Thema \"{topic}\" ausreichend besprochen, um weiterzumachen? Bitte antworte mit Ja oder Nein.",
        yes: &["ja", "jawohl", "genau", "klar", "stimmt", "sicher", "okay"],
        no: &["nein", "nicht", "noch", "kein", "keine"],
    },
    Phrases {
        code: "fr",
        question: "Avons-nous suffisamment abordé le sujet « {topic} » pour continuer ? Merci de répondre par oui ou non.",
        yes: &["oui", "ouais", "exactement", "certainement", "bien", "daccord"],
        no: &["non", "pas", "jamais"],
    },
    Phrases {
        code: "es",
        question: "¿Sientes que hemos tratado \"{topic}\" lo suficiente para continuar? Responde sí o no, por favor.",
        yes: &["sí", "si", "claro", "vale", "correcto", "exacto"],
        no: &["no", "nunca", "todavía", "todavia"],
    },
    Phrases {
        code: "nl",
        question: "Hebben we \"{topic}\" voldoende besproken om verder te gaan? Antwoord alsjeblieft met ja of nee.",
        yes: &["ja", "jazeker", "zeker", "klopt", "prima", "oke"],
        no: &["nee", "niet", "nog", "geen"],
    },
    Phrases {
        code: "it",
        question: "Ti sembra che abbiamo trattato \"{topic}\" abbastanza per andare avanti? Rispondi sì o no, per favore.",
        yes: &["sì", "si", "certo", "esatto", "giusto"],
        no: &["no", "non", "ancora", "mai"],
    },
];

/// Normalise a language tag to its primary subtag, lowercased.
pub fn normalize_language(language: &str) -> String {
    language
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn phrases_for(language: &str) -> &'static Phrases {
    let code = normalize_language(language);
    LANGUAGES.iter().find(|p| p.code == code).unwrap_or(&ENGLISH)
}

/// Whether `language` has its own prompts (otherwise English is used).
pub fn is_supported_language(language: &str) -> bool {
    let code = normalize_language(language);
    LANGUAGES.iter().any(|p| p.code == code)
}

/// The confirmation question for `topic_title` in `language`.
pub fn confirmation_prompt(language: &str, topic_title: &str) -> String {
    phrases_for(language).question.replace("{topic}", topic_title)
}

/// Whether `answer` reads as a "yes" in `language`.
///
/// English answers are accepted in every language. Any negation word wins
/// over an affirmative one, so "yes, but not yet" is not a confirmation.
pub fn is_affirmative(answer: &str, language: &str) -> bool {
    let phrases = phrases_for(language);
    let words: Vec<String> = answer
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();

    let contains = |list: &[&str]| words.iter().any(|w| list.contains(&w.as_str()));

    if contains(phrases.no) || contains(ENGLISH.no) {
        return false;
    }
    contains(phrases.yes) || contains(ENGLISH.yes)
}

/// Instruction layer text describing the trackable topics.
pub fn progress_addendum(catalog: &TopicCatalog, language: &str) -> String {
    let mut text = String::from(
        "PROGRESS TRACKING\n\
         The conversation should cover the following topics:\n",
    );
    for topic in catalog.topics() {
        text.push_str(&format!("- {} (id: {})", topic.title, topic.id));
        if !topic.keywords.is_empty() {
            text.push_str(&format!(" [keywords: {}]", topic.keywords.join(", ")));
        }
        text.push('\n');
    }
    text.push_str(&format!(
        "\nWhen you believe a topic has been discussed sufficiently, ask the user to confirm it, \
         in the conversation language, using this wording:\n\"{}\"\n\
         While waiting for that answer set `progress.current_topic` to the topic id. \
         Never report a topic as covered yourself; coverage only counts once the user confirms.",
        confirmation_prompt(language, "<topic title>")
    ));
    text
}
