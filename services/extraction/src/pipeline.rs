use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use audit::{Auditor, AuditorConfig, BatchAudit};
use ranking::is_similarity_threshold;
use schema::{Category, Claim, Metadata, NegativeRecord, ValidationError, validate_claim};
use serde::Serialize;
use store::{CANON_FILE_NAME, Ledger, LedgerStorage, NewNegative, StoreError};
use thiserror::Error;

use crate::{
    DEFAULT_FEEDBACK_WINDOW, ExtractionError, ExtractionRequest, Extractor, ExtractorKind,
    FeedbackInjector, SourceDocument,
};

const DEFAULT_COMPACTION_THRESHOLD: usize = 25;
const DEFAULT_AVOID_SIMILARITY: f64 = 0.85;
const EXTRACTION_BEAD_TYPE: &str = "EXTRACTION";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("failed to read canonical summary {path}: {source}")]
    Canon {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{key} expects {expected}, got '{value}'")]
    InvalidValue {
        key: String,
        expected: &'static str,
        value: String,
    },
    #[error("{0} must be > 0")]
    NotPositive(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub feedback_window: usize,
    pub compaction_threshold: usize,
    /// Similarity at which a candidate counts as a rejected pattern and is
    /// skipped by the extractor.
    pub avoid_similarity: f64,
    /// Canonical summary the corpus-conflict check reads; absent means an
    /// empty canon.
    pub canon_path: Option<PathBuf>,
    pub auditor: AuditorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feedback_window: DEFAULT_FEEDBACK_WINDOW,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            avoid_similarity: DEFAULT_AVOID_SIMILARITY,
            canon_path: None,
            auditor: AuditorConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Resolves `CURATOR_*` settings through `env_lookup`, falling back to
    /// defaults for anything unset.
    pub fn from_env<F>(env_lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = parse_env::<usize, _>(&env_lookup, "CURATOR_FEEDBACK_WINDOW", "an integer")? {
            config.feedback_window = value;
        }
        if let Some(value) =
            parse_env::<usize, _>(&env_lookup, "CURATOR_COMPACTION_THRESHOLD", "an integer")?
        {
            if value == 0 {
                return Err(ConfigError::NotPositive("CURATOR_COMPACTION_THRESHOLD"));
            }
            config.compaction_threshold = value;
        }
        if let Some(value) =
            parse_env::<f64, _>(&env_lookup, "CURATOR_SIMILARITY_THRESHOLD", "a number in [0, 1]")?
        {
            if !is_similarity_threshold(value) {
                return Err(ConfigError::InvalidValue {
                    key: "CURATOR_SIMILARITY_THRESHOLD".to_string(),
                    expected: "a number in [0, 1]",
                    value: value.to_string(),
                });
            }
            config.avoid_similarity = value;
        }
        if let Some(value) =
            parse_env::<usize, _>(&env_lookup, "CURATOR_HEALTH_MIN_BATCH", "an integer")?
        {
            config.auditor.min_health_batch = value;
        }
        if let Some(root) = env_lookup("CURATOR_ROOT")
            && !root.trim().is_empty()
        {
            config.canon_path = Some(Path::new(root.trim()).join(CANON_FILE_NAME));
        }
        Ok(config)
    }
}

fn parse_env<T, F>(env_lookup: &F, key: &str, expected: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = env_lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            expected,
            value: raw,
        })
}

/// A claim turned away before audit because it failed structural validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedInput {
    pub claim_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutcome {
    pub batch_id: String,
    pub avoided: usize,
    pub audit: BatchAudit,
    pub invalid: Vec<RejectedInput>,
    pub negatives: Vec<NegativeRecord>,
    pub compaction_due: bool,
}

/// Extraction → audit → ledger for one batch at a time.
pub struct Pipeline<S: LedgerStorage> {
    ledger: Ledger<S>,
    extractor: Box<dyn Extractor>,
    injector: FeedbackInjector,
    config: PipelineConfig,
}

impl<S: LedgerStorage> Pipeline<S> {
    /// Builds the extractor for `kind` once, tuned by `config.avoid_similarity`.
    pub fn new(
        ledger: Ledger<S>,
        kind: ExtractorKind,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let extractor = kind.build(config.avoid_similarity)?;
        Ok(Self {
            ledger,
            extractor,
            injector: FeedbackInjector::new(config.feedback_window),
            config,
        })
    }

    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Dispatches the configured extractor with the current avoidance list,
    /// then audits and records what it proposed.
    pub fn process(
        &mut self,
        batch_id: &str,
        source: SourceDocument,
    ) -> Result<PipelineOutcome, PipelineError> {
        let avoid = self.injector.avoidance_list(&self.ledger)?;
        let avoided = avoid.len();
        let request = ExtractionRequest {
            batch_id: batch_id.to_string(),
            source,
            avoid,
        };
        let claims = self.extractor.extract(&request)?;
        let extractor_name = self.extractor.name();
        let mut outcome = self.record_batch(batch_id, claims, extractor_name)?;
        outcome.avoided = avoided;
        Ok(outcome)
    }

    /// Audits and records claims proposed by an external extractor.
    pub fn process_claims(
        &mut self,
        batch_id: &str,
        claims: Vec<Claim>,
    ) -> Result<PipelineOutcome, PipelineError> {
        self.record_batch(batch_id, claims, "upstream")
    }

    /// Valid claims are stored as `<batch_id>/<claim_id>`, since extractors
    /// number their claims from `S-001` in every batch.
    fn record_batch(
        &mut self,
        batch_id: &str,
        claims: Vec<Claim>,
        source: &str,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut valid = Vec::with_capacity(claims.len());
        let mut invalid = Vec::new();
        for claim in claims {
            match validate_claim(&claim) {
                Ok(()) => valid.push(qualify_claim_id(batch_id, claim)),
                Err(err) => {
                    tracing::warn!(claim_id = %claim.claim_id, error = %err, "dropping invalid claim");
                    invalid.push(rejected_input(&claim, &err));
                }
            }
        }

        let canon = self.load_canon()?;
        let auditor = Auditor::with_config(&canon, self.config.auditor.clone());
        let audit = auditor.audit_batch(&valid);

        let mut negatives = Vec::with_capacity(audit.rejected.len());
        for rejected in &audit.rejected {
            let claim = &rejected.claim;
            let mut metadata = Metadata::new();
            metadata.insert("condition".into(), claim.condition.clone().into());
            metadata.insert("action".into(), claim.action.clone().into());
            metadata.insert("citation".into(), rejected.verdict.citation.clone().into());
            metadata.insert("attempts".into(), rejected.verdict.attempts.into());
            if let Some(check) = rejected.verdict.failing_check {
                metadata.insert("check".into(), check.as_str().into());
            }
            negatives.push(self.ledger.append_negative(NewNegative {
                reason: rejected.verdict.reason.clone(),
                source_claim_id: claim.claim_id.clone(),
                source_batch_id: batch_id.to_string(),
                category: claim_category(claim),
                rejected_by: auditor.config().name.clone(),
                metadata,
            })?);
        }
        for accepted in &audit.accepted {
            self.ledger
                .append_claim(accepted.claim.clone(), accepted.verdict.clone(), batch_id)?;
        }

        let mut metadata = Metadata::new();
        metadata.insert("batch_id".into(), batch_id.into());
        metadata.insert("total".into(), audit.summary.total.into());
        metadata.insert("passed".into(), audit.summary.passed.into());
        metadata.insert("rejected".into(), audit.summary.rejected.into());
        metadata.insert("invalid".into(), invalid.len().into());
        metadata.insert("rate_status".into(), audit.summary.rate_status.as_str().into());
        self.ledger.append(
            EXTRACTION_BEAD_TYPE,
            &format!(
                "batch {batch_id}: {} audited, {} passed, {} rejected",
                audit.summary.total, audit.summary.passed, audit.summary.rejected
            ),
            source,
            metadata,
        )?;

        let compaction_due = self.ledger.needs_compaction(self.config.compaction_threshold)?;
        tracing::info!(
            batch_id,
            passed = audit.summary.passed,
            rejected = audit.summary.rejected,
            compaction_due,
            "batch recorded"
        );
        Ok(PipelineOutcome {
            batch_id: batch_id.to_string(),
            avoided: 0,
            audit,
            invalid,
            negatives,
            compaction_due,
        })
    }

    fn load_canon(&self) -> Result<String, PipelineError> {
        let Some(path) = &self.config.canon_path else {
            return Ok(String::new());
        };
        match fs::read_to_string(path) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(PipelineError::Canon {
                path: path.clone(),
                source,
            }),
        }
    }
}

fn qualify_claim_id(batch_id: &str, mut claim: Claim) -> Claim {
    let prefix = format!("{batch_id}/");
    if !claim.claim_id.starts_with(&prefix) {
        claim.claim_id = format!("{prefix}{}", claim.claim_id);
    }
    claim
}

fn claim_category(claim: &Claim) -> Category {
    claim
        .category_tag
        .as_deref()
        .and_then(Category::from_tag)
        .unwrap_or(Category::DEFAULT)
}

fn rejected_input(claim: &Claim, err: &ValidationError) -> RejectedInput {
    RejectedInput {
        claim_id: claim.claim_id.clone(),
        error: err.to_string(),
    }
}
