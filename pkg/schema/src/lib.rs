use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub type Metadata = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Core domain enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "REJECT")]
    Reject,
    #[serde(rename = "NO_FALSIFICATION_FOUND")]
    NoFalsificationFound,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Reject => "REJECT",
            Verdict::NoFalsificationFound => "NO_FALSIFICATION_FOUND",
        }
    }
}

/// Identifies one stage of the falsification chain. Ordering follows chain
/// position so per-check tallies iterate in the same order the checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckId {
    Provenance,
    Falsifiability,
    LogicalConsistency,
    Tautology,
    Ambiguity,
    CorpusConflict,
}

impl CheckId {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckId::Provenance => "provenance",
            CheckId::Falsifiability => "falsifiability",
            CheckId::LogicalConsistency => "logical_consistency",
            CheckId::Tautology => "tautology",
            CheckId::Ambiguity => "ambiguity",
            CheckId::CorpusConflict => "corpus_conflict",
        }
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateStatus {
    Ok,
    BelowTarget,
    CriticalLow,
    RubberStamp,
}

impl RateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateStatus::Ok => "OK",
            RateStatus::BelowTarget => "BELOW_TARGET",
            RateStatus::CriticalLow => "CRITICAL_LOW",
            RateStatus::RubberStamp => "RUBBER_STAMP",
        }
    }
}

/// The fixed five-drawer taxonomy claims are filed under before clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    HtfBias,
    MarketStructure,
    PremiumDiscount,
    EntryModel,
    Confirmation,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::HtfBias,
        Category::MarketStructure,
        Category::PremiumDiscount,
        Category::EntryModel,
        Category::Confirmation,
    ];

    /// Where untagged or unrecognized claims land.
    pub const DEFAULT: Category = Category::HtfBias;

    pub fn number(&self) -> u8 {
        match self {
            Category::HtfBias => 1,
            Category::MarketStructure => 2,
            Category::PremiumDiscount => 3,
            Category::EntryModel => 4,
            Category::Confirmation => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Category::HtfBias => "HTF_BIAS",
            Category::MarketStructure => "MARKET_STRUCTURE",
            Category::PremiumDiscount => "PREMIUM_DISCOUNT",
            Category::EntryModel => "ENTRY_MODEL",
            Category::Confirmation => "CONFIRMATION",
        }
    }

    /// Accepts a drawer number ("4") or a name in any case, with `-`, `_`,
    /// `/` or spaces as separators ("entry model", "premium/discount").
    pub fn from_tag(tag: &str) -> Option<Category> {
        let normalized: String = tag
            .trim()
            .chars()
            .map(|ch| match ch {
                '-' | ' ' | '/' => '_',
                _ => ch.to_ascii_uppercase(),
            })
            .collect();
        if normalized.is_empty() {
            return None;
        }
        Category::ALL.into_iter().find(|category| {
            normalized == category.name() || normalized == category.number().to_string()
        })
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Core domain types
// ---------------------------------------------------------------------------

/// A candidate "if condition then action" statement supplied by an extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub condition: String,
    pub action: String,
    /// Offset into the source material, e.g. `14:32`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_tag: Option<String>,
}

impl Claim {
    pub fn new(claim_id: &str, condition: &str, action: &str) -> Self {
        Self {
            claim_id: claim_id.to_string(),
            condition: condition.to_string(),
            action: action.to_string(),
            provenance_timestamp: None,
            provenance_source: None,
            category_tag: None,
        }
    }

    pub fn with_provenance(mut self, timestamp: &str, source: &str) -> Self {
        self.provenance_timestamp = Some(timestamp.to_string());
        self.provenance_source = Some(source.to_string());
        self
    }

    pub fn with_category(mut self, tag: &str) -> Self {
        self.category_tag = Some(tag.to_string());
        self
    }

    pub fn has_timestamp(&self) -> bool {
        non_blank(self.provenance_timestamp.as_deref())
    }

    pub fn has_source(&self) -> bool {
        non_blank(self.provenance_source.as_deref())
    }

    /// Condition and action joined, the text unit similarity is measured on.
    pub fn text(&self) -> String {
        format!("{} {}", self.condition, self.action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditVerdict {
    pub verdict: Verdict,
    pub reason: String,
    pub citation: String,
    pub attempts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_check: Option<CheckId>,
}

impl AuditVerdict {
    pub fn is_reject(&self) -> bool {
        self.verdict == Verdict::Reject
    }

    /// Survivors are "not yet falsified", never "verified".
    pub fn needs_human_review(&self) -> bool {
        self.verdict == Verdict::NoFalsificationFound
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAuditSummary {
    pub total: usize,
    pub rejected: usize,
    pub passed: usize,
    pub rejection_rate: f64,
    pub rate_status: RateStatus,
    pub rejections_by_check: BTreeMap<CheckId, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub category: Category,
    pub member_ids: Vec<String>,
    pub topic: String,
    pub description: String,
    pub key_patterns: Vec<String>,
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

/// Base ledger event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    #[serde(rename = "type")]
    pub bead_type: String,
    pub content: String,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Ledger entry recording one claim rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegativeRecord {
    pub id: String,
    pub reason: String,
    pub source_claim_id: String,
    pub source_batch_id: String,
    pub category: Category,
    pub rejected_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NegativeRecord {
    /// The rejected claim's text, when the rejecting writer recorded it.
    pub fn pattern(&self) -> Option<String> {
        let condition = self.metadata.get("condition").and_then(|v| v.as_str());
        let action = self.metadata.get("action").and_then(|v| v.as_str());
        match (condition, action) {
            (None, None) => None,
            (condition, action) => Some(
                format!("{} {}", condition.unwrap_or(""), action.unwrap_or(""))
                    .trim()
                    .to_string(),
            ),
        }
    }
}

/// An accepted claim as persisted, together with the verdict it earned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub claim: Claim,
    pub verdict: AuditVerdict,
    pub batch_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerRecord {
    Event(Bead),
    Negative(NegativeRecord),
    Claim(ClaimRecord),
}

impl LedgerRecord {
    pub fn id(&self) -> &str {
        match self {
            LedgerRecord::Event(bead) => &bead.id,
            LedgerRecord::Negative(negative) => &negative.id,
            LedgerRecord::Claim(record) => &record.claim.claim_id,
        }
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        match self {
            LedgerRecord::Event(bead) => bead.timestamp,
            LedgerRecord::Negative(negative) => negative.timestamp,
            LedgerRecord::Claim(record) => record.recorded_at,
        }
    }

    pub fn as_negative(&self) -> Option<&NegativeRecord> {
        match self {
            LedgerRecord::Negative(negative) => Some(negative),
            _ => None,
        }
    }

    pub fn as_claim(&self) -> Option<&ClaimRecord> {
        match self {
            LedgerRecord::Claim(record) => Some(record),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}

/// Structural checks on an upstream claim. Empty condition/action text is
/// deliberately not an error here; the auditor rejects it as a verdict.
pub fn validate_claim(claim: &Claim) -> Result<(), ValidationError> {
    if claim.claim_id.trim().is_empty() {
        return Err(ValidationError::MissingField("claim_id"));
    }
    if claim.claim_id.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidValue("claim_id"));
    }
    if let Some(tag) = &claim.category_tag
        && tag.trim().is_empty()
    {
        return Err(ValidationError::MissingField("category_tag"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Token utilities
// ---------------------------------------------------------------------------

/// Function words ignored by topic labelling and overlap checks.
pub const STOPWORDS: &[&str] = &[
    "if", "the", "a", "an", "and", "or", "to", "of", "in", "at", "is", "then",
];

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Lowercase a token and drop everything that is not a word character.
pub fn normalize_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Split text on word boundaries into lowercase tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .map(normalize_token)
        .filter(|t| !t.is_empty())
        .collect()
}

fn non_blank(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Model client port
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub role: String,
    pub system_prompt: String,
    pub user_content: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model client unavailable: {0}")]
    Unavailable(String),
    #[error("model call failed: {0}")]
    Transport(String),
    #[error("model response malformed: {0}")]
    MalformedResponse(String),
}

/// Outbound seam to whatever routes prompts to a hosted model.
pub trait ModelClient: Send + Sync {
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError>;
}

/// Strip a surrounding markdown code fence (```json ... ```) if present.
pub fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after_open = &trimmed[start + 3..];
    let body_start = after_open.find('\n').map(|idx| idx + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}
