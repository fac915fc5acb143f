//! Rule-based auto-extraction of entities, topics, type, salience, and
//! status hints from raw content, with an optional LLM fallback.
//!
//! Extraction is best-effort by contract: it never fails the write. The
//! LLM path is bounded by a per-call timeout and degrades to the
//! rule-based result on any failure.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::llm::{CompleteOptions, LlmProvider};
use crate::memory::types::{MemoryStatus, MemoryType};

/// Candidate record derived from raw content.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// (normalized, display) entity name pairs, insertion order irrelevant.
    pub entities: Vec<(String, String)>,
    pub topics: Vec<String>,
    pub memory_type: MemoryType,
    pub salience: f64,
    pub status: MemoryStatus,
    /// Set when extraction degraded to a best-effort result.
    pub needs_review: bool,
}

/// Markers that indicate an open commitment. Deadline statements are
/// declarative facts about a date, not commitments, and stay out.
const COMMITMENT_MARKERS: &[&str] = &[
    "promised",
    "committed",
    "commitment",
    "will ",
    "need to",
    "needs to",
    "must ",
    "todo",
    "by friday",
    "by monday",
];

/// Markers that indicate a completed commitment.
const FULFILLMENT_MARKERS: &[&str] = &[
    "done",
    "completed",
    "finished",
    "shipped",
    "delivered",
    "fulfilled",
    "resolved",
];

/// Copula and role patterns that promote content to semantic.
const DECLARATIVE_MARKERS: &[&str] = &[
    " is ",
    " are ",
    " was ",
    " means ",
    " works at ",
    " moved to ",
    " leads ",
    " prefers ",
    " owns ",
    " uses ",
];

/// Imperative / recipe patterns that promote content to procedural.
const PROCEDURAL_MARKERS: &[&str] = &[
    "how to",
    "step 1",
    "first,",
    "then run",
    "run ",
    "install ",
    "configure ",
    "to deploy",
    "always ",
    "never ",
];

/// Keyword → topic tag rules. Open set; callers may supply more.
const TOPIC_RULES: &[(&str, &str)] = &[
    ("deadline", "deadline"),
    ("due ", "deadline"),
    ("decided", "decision"),
    ("decision", "decision"),
    ("release", "release"),
    ("deploy", "release"),
    ("ship", "release"),
    ("meeting", "meeting"),
    ("standup", "meeting"),
    ("bug", "issue"),
    ("fix", "issue"),
    ("incident", "issue"),
    ("hire", "hiring"),
    ("hiring", "hiring"),
    ("interview", "hiring"),
    ("budget", "finance"),
    ("invoice", "finance"),
    ("framework", "tooling"),
    ("migration", "tooling"),
];

/// Words never treated as entities even when capitalized (sentence starts,
/// pronouns, calendar terms).
const ENTITY_STOPWORDS: &[&str] = &[
    "the", "a", "an", "i", "we", "they", "he", "she", "it", "this", "that", "these", "those",
    "my", "our", "their", "his", "her", "its", "monday", "tuesday", "wednesday", "thursday",
    "friday", "saturday", "sunday", "january", "february", "march", "april", "may", "june",
    "july", "august", "september", "october", "november", "december", "today", "tomorrow",
    "yesterday", "what", "when", "where", "who", "why", "how", "if", "but", "and", "or",
];

/// Run the full rule-based extraction pipeline over raw content.
///
/// `dictionary` carries configured tool/project tokens that are recognized
/// as entities regardless of capitalization.
pub fn extract(content: &str, dictionary: &[String]) -> Extraction {
    let lower = content.to_lowercase();

    let entities = extract_entities(content, dictionary);
    let topics = extract_topics(&lower);
    let memory_type = classify_type(&lower);
    let status = classify_status(&lower);
    let salience = baseline_salience(&lower, status);

    Extraction {
        entities,
        topics,
        memory_type,
        salience,
        status,
        needs_review: false,
    }
}

/// Extract proper nouns and known tokens.
///
/// Recognizes capitalization runs ("Corp A", "Bamboo HR"), quoted and
/// backticked identifiers, and dictionary tokens. Returns (normalized,
/// display) pairs; normalization trims, folds case and common diacritics.
fn extract_entities(content: &str, dictionary: &[String]) -> Vec<(String, String)> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut out: Vec<(String, String)> = Vec::new();

    let mut push = |display: &str| {
        let display = display.trim().trim_matches(|c: char| !c.is_alphanumeric());
        if display.is_empty() {
            return;
        }
        let norm = normalize_entity(display);
        if norm.len() < 2 || ENTITY_STOPWORDS.contains(&norm.as_str()) {
            return;
        }
        if seen.insert(norm.clone()) {
            out.push((norm, display.to_string()));
        }
    };

    // Quoted and backticked identifiers
    for delim in ['"', '`'] {
        let mut parts = content.split(delim);
        parts.next(); // text before the first delimiter
        while let (Some(inner), rest) = (parts.next(), parts.next()) {
            if inner.len() <= 64 && !inner.contains('\n') {
                push(inner);
            }
            if rest.is_none() {
                break;
            }
        }
    }

    // Capitalization runs: consecutive words starting uppercase, joined.
    let tokens: Vec<&str> = content.split_whitespace().collect();
    let mut run: Vec<&str> = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let word = token.trim_matches(|c: char| !c.is_alphanumeric());
        let is_cap = word
            .chars()
            .next()
            .map(|c| c.is_uppercase() || c.is_numeric())
            .unwrap_or(false);
        let sentence_start = i == 0
            || tokens[i - 1].ends_with(['.', '!', '?']);

        if is_cap && !(sentence_start && run.is_empty() && is_common_word(word)) {
            run.push(word);
        } else {
            if !run.is_empty() {
                push(&run.join(" "));
                run.clear();
            }
        }
        // A token ending a sentence also ends its run
        if token.ends_with(['.', '!', '?']) && !run.is_empty() {
            push(&run.join(" "));
            run.clear();
        }
    }
    if !run.is_empty() {
        push(&run.join(" "));
    }

    // Configured dictionary tokens, matched case-insensitively
    let lower = content.to_lowercase();
    for token in dictionary {
        if lower.contains(&token.to_lowercase()) {
            push(token);
        }
    }

    out
}

/// Sentence-initial capitalized words are only entities when they reappear
/// capitalized elsewhere or look like identifiers; everyday words are not.
fn is_common_word(word: &str) -> bool {
    let lower = word.to_lowercase();
    ENTITY_STOPWORDS.contains(&lower.as_str())
}

/// Normalize an entity name: trim, fold case, fold common diacritics.
pub fn normalize_entity(name: &str) -> String {
    name.trim()
        .chars()
        .map(fold_diacritic)
        .collect::<String>()
        .to_lowercase()
}

/// Fold common Latin diacritics to their base letter.
fn fold_diacritic(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' | 'Á' | 'À' | 'Â' | 'Ä' | 'Ã' | 'Å' => 'a',
        'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' => 'o',
        'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'u',
        'ñ' | 'Ñ' => 'n',
        'ç' | 'Ç' => 'c',
        other => other,
    }
}

/// Derive topic tags by keyword rule.
fn extract_topics(lower: &str) -> Vec<String> {
    let mut topics: BTreeSet<String> = BTreeSet::new();
    for (keyword, topic) in TOPIC_RULES {
        if lower.contains(keyword) {
            topics.insert((*topic).to_string());
        }
    }
    topics.into_iter().collect()
}

/// Default episodic; promote to semantic on declarative templates and to
/// procedural on imperative/recipe content. Procedural wins over semantic
/// when both match (recipes often contain copulas).
fn classify_type(lower: &str) -> MemoryType {
    if PROCEDURAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return MemoryType::Procedural;
    }
    if DECLARATIVE_MARKERS.iter().any(|m| lower.contains(m)) {
        return MemoryType::Semantic;
    }
    MemoryType::Episodic
}

/// Pending when commitment markers appear without fulfillment markers;
/// fulfilled on explicit completion markers; else active.
fn classify_status(lower: &str) -> MemoryStatus {
    let committed = COMMITMENT_MARKERS.iter().any(|m| lower.contains(m));
    let fulfilled = FULFILLMENT_MARKERS.iter().any(|m| lower.contains(m));
    match (committed, fulfilled) {
        (true, false) => MemoryStatus::Pending,
        (_, true) => MemoryStatus::Fulfilled,
        _ => MemoryStatus::Active,
    }
}

/// Baseline 0.5, raised by commitment markers. The known-person boost is
/// applied by the caller, which can see the vault's entity table.
fn baseline_salience(lower: &str, status: MemoryStatus) -> f64 {
    let mut salience: f64 = 0.5;
    if ["promised", "committed", "decision", "decided"]
        .iter()
        .any(|m| lower.contains(m))
    {
        salience += 0.2;
    }
    if status == MemoryStatus::Pending {
        salience += 0.05;
    }
    salience.clamp(0.0, 1.0)
}

/// Shape of the JSON the LLM fallback is asked to produce.
#[derive(Debug, Deserialize)]
struct LlmExtraction {
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    memory_type: Option<String>,
    #[serde(default)]
    salience: Option<f64>,
}

/// Attempt LLM-assisted extraction for ambiguous content, merging its
/// output into the rule-based result. Bounded by `timeout_ms`; any failure
/// returns the rule-based extraction marked `needs_review`.
pub fn extract_with_llm(
    content: &str,
    dictionary: &[String],
    llm: &dyn LlmProvider,
    timeout_ms: u64,
) -> Extraction {
    let mut base = extract(content, dictionary);

    let prompt = format!(
        "Extract structured metadata from this observation. Respond with a single \
         JSON object with keys: entities (array of proper-noun strings), topics \
         (array of lowercase tags), memory_type (one of episodic, semantic, \
         procedural), salience (0.0-1.0 importance).\n\nObservation:\n{content}"
    );
    let opts = CompleteOptions {
        max_tokens: Some(256),
        json_mode: true,
        timeout_ms: Some(timeout_ms),
    };

    match llm.complete(&prompt, &opts) {
        Ok(raw) => match serde_json::from_str::<LlmExtraction>(raw.trim()) {
            Ok(parsed) => {
                for name in parsed.entities {
                    let norm = normalize_entity(&name);
                    if norm.len() >= 2 && !base.entities.iter().any(|(n, _)| *n == norm) {
                        base.entities.push((norm, name));
                    }
                }
                for topic in parsed.topics {
                    let topic = topic.trim().to_lowercase();
                    if !topic.is_empty() && !base.topics.contains(&topic) {
                        base.topics.push(topic);
                    }
                }
                if let Some(t) = parsed.memory_type.and_then(|t| t.parse().ok()) {
                    base.memory_type = t;
                }
                if let Some(s) = parsed.salience {
                    if (0.0..=1.0).contains(&s) {
                        base.salience = base.salience.max(s);
                    }
                }
                base
            }
            Err(e) => {
                tracing::debug!(error = %e, "LLM extraction returned unparsable JSON");
                base.needs_review = true;
                base
            }
        },
        Err(e) => {
            tracing::debug!(error = %e, "LLM extraction failed, using rule-based result");
            base.needs_review = true;
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_capitalization_runs() {
        let e = extract("Alex works at Corp A in Berlin", &[]);
        let names: Vec<&str> = e.entities.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"alex"));
        assert!(names.contains(&"corp a"));
        assert!(names.contains(&"berlin"));
    }

    #[test]
    fn extracts_quoted_identifiers() {
        let e = extract("The \"atlas-deploy\" job failed again", &[]);
        assert!(e.entities.iter().any(|(n, _)| n == "atlas-deploy"));
    }

    #[test]
    fn dictionary_tokens_match_case_insensitively() {
        let e = extract("we migrated everything to bamboohr yesterday", &["BambooHR".into()]);
        let hit = e.entities.iter().find(|(n, _)| n == "bamboohr").unwrap();
        assert_eq!(hit.1, "BambooHR");
    }

    #[test]
    fn normalization_folds_case_and_diacritics() {
        assert_eq!(normalize_entity("  Zoë Müller "), "zoe muller");
        assert_eq!(normalize_entity("PRIYA"), "priya");
    }

    #[test]
    fn sentence_initial_stopwords_are_not_entities() {
        let e = extract("The deadline moved. This is fine.", &[]);
        assert!(!e.entities.iter().any(|(n, _)| n == "the" || n == "this"));
    }

    #[test]
    fn declarative_content_is_semantic() {
        let e = extract("Priya leads ML work on Atlas", &[]);
        assert_eq!(e.memory_type, MemoryType::Semantic);
    }

    #[test]
    fn recipe_content_is_procedural() {
        let e = extract("How to deploy: first, run the migration, then run the smoke tests", &[]);
        assert_eq!(e.memory_type, MemoryType::Procedural);
    }

    #[test]
    fn plain_events_stay_episodic() {
        let e = extract("Met with the design team about the new landing page", &[]);
        assert_eq!(e.memory_type, MemoryType::Episodic);
    }

    #[test]
    fn commitment_without_fulfillment_is_pending() {
        let e = extract("Promised to send the report by Friday", &[]);
        assert_eq!(e.status, MemoryStatus::Pending);
        assert!(e.salience > 0.5);
    }

    #[test]
    fn explicit_completion_is_fulfilled() {
        let e = extract("The report is done and delivered", &[]);
        assert_eq!(e.status, MemoryStatus::Fulfilled);
    }

    #[test]
    fn neutral_content_is_active_with_baseline_salience() {
        let e = extract("Lunch was pasta", &[]);
        assert_eq!(e.status, MemoryStatus::Active);
        assert!((e.salience - 0.5).abs() < 1e-9);
    }

    #[test]
    fn topics_derived_from_keywords() {
        let e = extract("We decided to move the release deadline", &[]);
        assert!(e.topics.contains(&"decision".to_string()));
        assert!(e.topics.contains(&"release".to_string()));
        assert!(e.topics.contains(&"deadline".to_string()));
    }

    #[test]
    fn salience_is_clamped() {
        let e = extract("promised committed decision decided deadline", &[]);
        assert!(e.salience <= 1.0);
    }

    struct FailingLlm;
    impl LlmProvider for FailingLlm {
        fn complete(&self, _: &str, _: &CompleteOptions) -> crate::error::Result<String> {
            Err(crate::error::EngramError::TimedOut("llm".into()))
        }
    }

    struct JsonLlm(&'static str);
    impl LlmProvider for JsonLlm {
        fn complete(&self, _: &str, _: &CompleteOptions) -> crate::error::Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn llm_failure_degrades_to_rule_based() {
        let e = extract_with_llm("Priya leads ML work on Atlas", &[], &FailingLlm, 100);
        assert!(e.needs_review);
        assert_eq!(e.memory_type, MemoryType::Semantic);
        assert!(e.entities.iter().any(|(n, _)| n == "priya"));
    }

    #[test]
    fn llm_output_merges_into_rule_based() {
        let e = extract_with_llm(
            "something vague happened",
            &[],
            &JsonLlm(r#"{"entities":["Atlas"],"topics":["release"],"memory_type":"semantic","salience":0.7}"#),
            100,
        );
        assert!(!e.needs_review);
        assert!(e.entities.iter().any(|(n, _)| n == "atlas"));
        assert!(e.topics.contains(&"release".to_string()));
        assert_eq!(e.memory_type, MemoryType::Semantic);
        assert!((e.salience - 0.7).abs() < 1e-9);
    }

    #[test]
    fn llm_garbage_marks_needs_review() {
        let e = extract_with_llm("something vague", &[], &JsonLlm("not json at all"), 100);
        assert!(e.needs_review);
    }
}
