use std::collections::HashSet;

use ranking::{content_vocabulary, vocabulary_overlap};
use schema::{CheckId, Claim, tokenize};

use crate::{Check, Violation};

const UNFALSIFIABLE_MARKERS: &[&str] = &[
    "always",
    "never",
    "every time",
    "guaranteed",
    "100%",
    "certainly",
    "without exception",
];

const HEDGING_MARKERS: &[&str] = &[
    "looks",
    "feels",
    "seems",
    "might",
    "probably",
    "maybe",
    "perhaps",
    "possibly",
    "kind of",
    "sort of",
    "i think",
    "could be",
];

const EXCLUSIVE_DIRECTIVES: &[(&str, &str)] = &[("buy", "sell"), ("long", "short")];

const ALTERNATIVE_MARKERS: &[&str] = &["or", "either", "otherwise", "unless"];

/// Phrases that say the same thing when one sits in the condition and the
/// other in the action.
const PARAPHRASE_PAIRS: &[(&str, &str)] = &[
    ("goes up", "rises"),
    ("goes up", "moves higher"),
    ("goes down", "falls"),
    ("goes down", "moves lower"),
    ("breaks above", "breaks out"),
    ("breaks below", "breaks down"),
    ("bullish", "bias is long"),
    ("bearish", "bias is short"),
    ("trend continues", "continuation"),
];

const TAUTOLOGY_OVERLAP_LIMIT: f64 = 0.7;

const OPPOSING_TERMS: &[(&str, &str)] = &[
    ("bullish", "bearish"),
    ("long", "short"),
    ("buy", "sell"),
    ("support", "resistance"),
];

const CONFLICT_MIN_SHARED_WORDS: usize = 3;

/// Lowercased text plus its tokens, so markers can match on word boundaries.
struct Scanned {
    lowered: String,
    tokens: Vec<String>,
}

impl Scanned {
    fn new(text: &str) -> Self {
        Self {
            lowered: text.to_lowercase(),
            tokens: tokenize(text),
        }
    }

    /// Word-only markers match whole token runs ("never" does not match
    /// "nevertheless"); markers with symbols match as raw substrings.
    fn contains(&self, marker: &str) -> bool {
        if !marker.chars().all(|ch| ch.is_alphanumeric() || ch == ' ') {
            return self.lowered.contains(marker);
        }
        let wanted: Vec<&str> = marker.split_whitespace().collect();
        if wanted.is_empty() || wanted.len() > self.tokens.len() {
            return false;
        }
        self.tokens
            .windows(wanted.len())
            .any(|window| window.iter().zip(&wanted).all(|(have, want)| have.as_str() == *want))
    }

    fn has_token(&self, token: &str) -> bool {
        self.tokens.iter().any(|have| have == token)
    }
}

fn first_marker<'a>(markers: &[&'a str], texts: &[&Scanned]) -> Option<&'a str> {
    markers
        .iter()
        .copied()
        .find(|marker| texts.iter().any(|text| text.contains(marker)))
}

// ---- 1. provenance ----

pub struct ProvenanceCheck;

impl Check for ProvenanceCheck {
    fn id(&self) -> CheckId {
        CheckId::Provenance
    }

    fn evaluate(&self, claim: &Claim) -> Option<Violation> {
        match (claim.has_timestamp(), claim.has_source()) {
            (false, false) => Some(Violation::new(
                "Missing provenance: no timestamp or source attribution",
                "Every claim must trace to a located point in its source",
            )),
            (false, true) => Some(Violation::new(
                "Missing timestamp: source exists but no temporal reference",
                "A cited source needs a timestamp into it",
            )),
            _ => None,
        }
    }
}

// ---- 2. falsifiability ----

pub struct FalsifiabilityCheck;

impl Check for FalsifiabilityCheck {
    fn id(&self) -> CheckId {
        CheckId::Falsifiability
    }

    fn evaluate(&self, claim: &Claim) -> Option<Violation> {
        let condition = Scanned::new(&claim.condition);
        let action = Scanned::new(&claim.action);
        let marker = first_marker(UNFALSIFIABLE_MARKERS, &[&condition, &action])?;
        Some(Violation::new(
            format!("Unfalsifiable claim: contains absolute marker '{marker}'"),
            "Claims with absolute quantifiers cannot be empirically tested",
        ))
    }
}

// ---- 3. logical consistency ----

pub struct LogicalConsistencyCheck;

impl Check for LogicalConsistencyCheck {
    fn id(&self) -> CheckId {
        CheckId::LogicalConsistency
    }

    fn evaluate(&self, claim: &Claim) -> Option<Violation> {
        if claim.condition.trim().is_empty() || claim.action.trim().is_empty() {
            return Some(Violation::new(
                "Incomplete claim: empty condition or action",
                "An if-then claim requires both a condition and an action",
            ));
        }
        let action = Scanned::new(&claim.action);
        let offers_alternative = ALTERNATIVE_MARKERS
            .iter()
            .any(|marker| action.has_token(marker));
        if offers_alternative {
            return None;
        }
        EXCLUSIVE_DIRECTIVES
            .iter()
            .find(|(left, right)| action.has_token(left) && action.has_token(right))
            .map(|(left, right)| {
                Violation::new(
                    format!(
                        "Logical contradiction: action contains both '{left}' and '{right}' without an alternative"
                    ),
                    "Mutually exclusive directives in a single claim",
                )
            })
    }
}

// ---- 4. tautology ----

pub struct TautologyCheck;

impl Check for TautologyCheck {
    fn id(&self) -> CheckId {
        CheckId::Tautology
    }

    fn evaluate(&self, claim: &Claim) -> Option<Violation> {
        let condition = Scanned::new(&claim.condition);
        let action = Scanned::new(&claim.action);
        for (left, right) in PARAPHRASE_PAIRS {
            let restated = (condition.contains(left) && action.contains(right))
                || (condition.contains(right) && action.contains(left));
            if restated {
                return Some(Violation::new(
                    format!("Circular claim: '{left}' and '{right}' restate each other"),
                    "The action must add information beyond the condition",
                ));
            }
        }
        let overlap = vocabulary_overlap(&claim.condition, &claim.action);
        if overlap > TAUTOLOGY_OVERLAP_LIMIT {
            return Some(Violation::new(
                format!(
                    "Circular claim: condition and action share {:.0}% of their vocabulary",
                    overlap * 100.0
                ),
                "The action must add information beyond the condition",
            ));
        }
        None
    }
}

// ---- 5. ambiguity ----

pub struct AmbiguityCheck;

impl Check for AmbiguityCheck {
    fn id(&self) -> CheckId {
        CheckId::Ambiguity
    }

    fn evaluate(&self, claim: &Claim) -> Option<Violation> {
        let condition = Scanned::new(&claim.condition);
        let action = Scanned::new(&claim.action);
        let marker = first_marker(HEDGING_MARKERS, &[&condition, &action])?;
        Some(Violation::new(
            format!("Ambiguous claim: contains subjective marker '{marker}'"),
            "Subjective language leaves no objective test",
        ))
    }
}

// ---- 6. corpus conflict ----

/// Compares the condition against the canonical summary the auditor was
/// built with. An empty canon never conflicts.
pub struct CorpusConflictCheck {
    canon_lines: Vec<(String, HashSet<String>)>,
}

impl CorpusConflictCheck {
    pub fn new(canon: &str) -> Self {
        let canon_lines = canon
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| (line.to_string(), content_vocabulary(line)))
            .collect();
        Self { canon_lines }
    }
}

impl Check for CorpusConflictCheck {
    fn id(&self) -> CheckId {
        CheckId::CorpusConflict
    }

    fn evaluate(&self, claim: &Claim) -> Option<Violation> {
        if self.canon_lines.is_empty() {
            return None;
        }
        let condition = content_vocabulary(&claim.condition);
        for (left, right) in OPPOSING_TERMS {
            for (term, opposite) in [(left, right), (right, left)] {
                if !condition.contains(*term) {
                    continue;
                }
                let conflicting = self.canon_lines.iter().find(|(_, words)| {
                    words.contains(*opposite)
                        && condition.intersection(words).count() >= CONFLICT_MIN_SHARED_WORDS
                });
                if let Some((line, _)) = conflicting {
                    let excerpt: String = line.chars().take(80).collect();
                    return Some(Violation::new(
                        format!(
                            "Conflicts with canon: condition uses '{term}' but the canon uses '{opposite}' in a similar context"
                        ),
                        format!("canon line: '{excerpt}'"),
                    ));
                }
            }
        }
        None
    }
}
