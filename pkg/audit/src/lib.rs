mod checks;

use std::collections::BTreeMap;

use schema::{AuditVerdict, BatchAuditSummary, CheckId, Claim, RateStatus, Verdict};
use serde::Serialize;

pub use checks::{
    AmbiguityCheck, CorpusConflictCheck, FalsifiabilityCheck, LogicalConsistencyCheck,
    ProvenanceCheck, TautologyCheck,
};

/// Structured rejection payload produced by a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub reason: String,
    pub citation: String,
}

impl Violation {
    pub fn new(reason: impl Into<String>, citation: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            citation: citation.into(),
        }
    }
}

/// One stage of the falsification chain. Checks never fail; they either find
/// a violation or they don't.
pub trait Check: Send + Sync {
    fn id(&self) -> CheckId;
    fn evaluate(&self, claim: &Claim) -> Option<Violation>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditorConfig {
    /// Actor name recorded on negative records.
    pub name: String,
    /// Batches smaller than this always report `RateStatus::Ok`.
    pub min_health_batch: usize,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            name: "auditor".to_string(),
            min_health_batch: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditedClaim {
    pub claim: Claim,
    pub verdict: AuditVerdict,
}

/// The triple handed downstream for each batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchAudit {
    pub summary: BatchAuditSummary,
    pub accepted: Vec<AuditedClaim>,
    pub rejected: Vec<AuditedClaim>,
}

pub struct Auditor {
    checks: Vec<Box<dyn Check>>,
    config: AuditorConfig,
}

impl Auditor {
    /// The standard six-stage chain, conflict-checked against `canon`.
    pub fn new(canon: &str) -> Self {
        Self::with_config(canon, AuditorConfig::default())
    }

    pub fn with_config(canon: &str, config: AuditorConfig) -> Self {
        Self::with_checks(standard_chain(canon), config)
    }

    pub fn with_checks(checks: Vec<Box<dyn Check>>, config: AuditorConfig) -> Self {
        Self { checks, config }
    }

    pub fn config(&self) -> &AuditorConfig {
        &self.config
    }

    pub fn chain(&self) -> Vec<CheckId> {
        self.checks.iter().map(|check| check.id()).collect()
    }

    pub fn audit(&self, claim: &Claim) -> AuditVerdict {
        let chain_len = self.checks.len();
        for (position, check) in self.checks.iter().enumerate() {
            let Some(violation) = check.evaluate(claim) else {
                continue;
            };
            let check_id = check.id();
            tracing::info!(
                claim_id = %claim.claim_id,
                check = %check_id,
                reason = %violation.reason,
                "claim rejected"
            );
            return AuditVerdict {
                verdict: Verdict::Reject,
                reason: violation.reason,
                citation: violation.citation,
                attempts: (position + 1).min(chain_len),
                failing_check: Some(check_id),
            };
        }
        AuditVerdict {
            verdict: Verdict::NoFalsificationFound,
            reason: format!(
                "No falsification found after {chain_len} checks. Flagging for human review."
            ),
            citation: "All automated checks passed; manual review recommended".to_string(),
            attempts: chain_len,
            failing_check: None,
        }
    }

    /// Audits each claim independently and scores the batch.
    pub fn audit_batch(&self, claims: &[Claim]) -> BatchAudit {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut rejections_by_check: BTreeMap<CheckId, usize> = BTreeMap::new();
        for claim in claims {
            let verdict = self.audit(claim);
            if let Some(check) = verdict.failing_check
                && verdict.is_reject()
            {
                *rejections_by_check.entry(check).or_insert(0) += 1;
            }
            let audited = AuditedClaim {
                claim: claim.clone(),
                verdict,
            };
            if audited.verdict.is_reject() {
                rejected.push(audited);
            } else {
                accepted.push(audited);
            }
        }

        let total = claims.len();
        let rejection_rate = if total == 0 {
            0.0
        } else {
            rejected.len() as f64 / total as f64
        };
        let rate_status = rate_status(total, rejected.len(), self.config.min_health_batch);
        if rate_status != RateStatus::Ok {
            tracing::warn!(
                total,
                rejected = rejected.len(),
                rejection_rate,
                status = rate_status.as_str(),
                "audit batch health degraded"
            );
        }

        BatchAudit {
            summary: BatchAuditSummary {
                total,
                rejected: rejected.len(),
                passed: accepted.len(),
                rejection_rate,
                rate_status,
                rejections_by_check,
            },
            accepted,
            rejected,
        }
    }
}

pub fn standard_chain(canon: &str) -> Vec<Box<dyn Check>> {
    vec![
        Box::new(ProvenanceCheck),
        Box::new(FalsifiabilityCheck),
        Box::new(LogicalConsistencyCheck),
        Box::new(TautologyCheck),
        Box::new(AmbiguityCheck),
        Box::new(CorpusConflictCheck::new(canon)),
    ]
}

/// Health of a batch's rejection rate. Batches below `min_batch` are too
/// small to judge and report `Ok`.
pub fn rate_status(total: usize, rejected: usize, min_batch: usize) -> RateStatus {
    if total == 0 || total < min_batch {
        return RateStatus::Ok;
    }
    let rate = rejected as f64 / total as f64;
    if rejected == 0 {
        RateStatus::RubberStamp
    } else if rate < 0.05 {
        RateStatus::CriticalLow
    } else if rate < 0.10 {
        RateStatus::BelowTarget
    } else {
        RateStatus::Ok
    }
}
