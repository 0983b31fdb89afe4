use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use ranking::{cosine_similarity, term_frequencies};
use schema::{Category, ClaimRecord, Cluster};
use serde::Serialize;
use store::{CANON_FILE_NAME, Ledger, LedgerStorage, StoreError, most_recent};

pub mod cluster;
mod document;
mod summarizer;

pub use document::{
    CanonicalSummaryDocument, ClusterSection, LAST_UPDATED_PREFIX, RedundantPair, write_atomic,
};
pub use summarizer::{
    ClusterSummary, DeadlineSummarizer, ModelSummarizer, Summarizer, SummarizerError,
    SummaryRequest, TemplateSummarizer, describe_cluster,
};

use cluster::{categorize, greedy_cluster, redundant_pairs, topic_label};

#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to write canonical summary {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionConfig {
    /// Active-partition record count at which compaction becomes due.
    pub compaction_threshold: usize,
    pub similarity_threshold: f64,
    /// Partitions at least this many days old are archived after a run.
    pub archive_after_days: u32,
    pub summary_negative_window: usize,
    pub summarizer_timeout: Duration,
    pub summary_path: PathBuf,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 25,
            similarity_threshold: 0.85,
            archive_after_days: 1,
            summary_negative_window: 20,
            summarizer_timeout: Duration::from_secs(10),
            summary_path: PathBuf::from(CANON_FILE_NAME),
        }
    }
}

impl CompactionConfig {
    pub fn for_root(root: &Path) -> Self {
        Self {
            summary_path: root.join(CANON_FILE_NAME),
            ..Self::default()
        }
    }
}

/// Outcome of the read-only analysis steps.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPlan {
    pub sections: Vec<ClusterSection>,
    pub redundant: Vec<RedundantPair>,
}

impl CompactionPlan {
    pub fn clusters_by_category(&self) -> BTreeMap<Category, usize> {
        let mut out: BTreeMap<Category, usize> =
            Category::ALL.into_iter().map(|category| (category, 0)).collect();
        for section in &self.sections {
            *out.entry(section.cluster.category).or_default() += 1;
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompactionReport {
    pub compacted: bool,
    pub total_claims: usize,
    pub total_negatives: usize,
    pub clusters_by_category: BTreeMap<Category, usize>,
    pub redundant_pairs: usize,
    pub archived: Vec<String>,
    pub archive_failures: Vec<String>,
    pub summary_path: Option<PathBuf>,
}

impl CompactionReport {
    fn not_compacted(total_claims: usize, total_negatives: usize) -> Self {
        Self {
            compacted: false,
            total_claims,
            total_negatives,
            clusters_by_category: BTreeMap::new(),
            redundant_pairs: 0,
            archived: Vec::new(),
            archive_failures: Vec::new(),
            summary_path: None,
        }
    }
}

pub struct CompactionEngine {
    config: CompactionConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl CompactionEngine {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            summarizer: Arc::new(TemplateSummarizer),
        }
    }

    /// Use an external summarizer for cluster descriptions, bounded by the
    /// configured timeout.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Arc::new(DeadlineSummarizer::new(
            summarizer,
            self.config.summarizer_timeout,
        ));
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Categorize, cluster, flag redundancy and describe. Touches no storage.
    pub fn plan(&self, claims: &[ClaimRecord]) -> CompactionPlan {
        let threshold = self.config.similarity_threshold;
        let vectors: Vec<HashMap<String, u64>> = claims
            .iter()
            .map(|record| term_frequencies(&record.claim.text()))
            .collect();
        let similarity = |a: usize, b: usize| cosine_similarity(&vectors[a], &vectors[b]);

        let mut sections = Vec::new();
        for (category, members) in categorize(claims) {
            let groups = greedy_cluster(members.len(), threshold, |a, b| {
                similarity(members[a], members[b])
            });
            for group in groups {
                let records: Vec<&ClaimRecord> =
                    group.iter().map(|&idx| &claims[members[idx]]).collect();
                sections.push(self.describe(category, &records));
            }
        }

        let redundant = redundant_pairs(claims.len(), threshold, similarity)
            .into_iter()
            .map(|(a, b, sim)| RedundantPair {
                first_id: claims[a].claim.claim_id.clone(),
                second_id: claims[b].claim.claim_id.clone(),
                similarity: sim,
            })
            .collect();

        CompactionPlan {
            sections,
            redundant,
        }
    }

    fn describe(&self, category: Category, records: &[&ClaimRecord]) -> ClusterSection {
        let conditions: Vec<String> = records
            .iter()
            .map(|record| record.claim.condition.clone())
            .collect();
        let actions: Vec<String> = records
            .iter()
            .map(|record| record.claim.action.clone())
            .collect();
        let topic = topic_label(conditions.iter().map(String::as_str));
        let summary = describe_cluster(
            self.summarizer.as_ref(),
            &SummaryRequest {
                category,
                topic: topic.clone(),
                conditions,
                actions,
                member_count: records.len(),
            },
        );
        ClusterSection {
            cluster: Cluster {
                category,
                member_ids: records
                    .iter()
                    .map(|record| record.claim.claim_id.clone())
                    .collect(),
                topic,
                description: summary.description,
                key_patterns: summary.key_patterns,
            },
            statements: records.iter().map(|record| record.claim.text()).collect(),
        }
    }

    /// Run compaction when the ledger needs it or `force` is set. The summary
    /// is rebuilt from the whole ledger history, archived partitions included.
    /// With no claims nothing is written and the prior summary is kept.
    pub fn compact<S: LedgerStorage>(
        &self,
        ledger: &mut Ledger<S>,
        force: bool,
    ) -> Result<CompactionReport, CompactionError> {
        if !force && !ledger.needs_compaction(self.config.compaction_threshold)? {
            tracing::debug!(
                threshold = self.config.compaction_threshold,
                "compaction not due"
            );
            return Ok(CompactionReport::not_compacted(0, 0));
        }

        let history = ledger.load_history()?;
        let total_claims = history.claims.len();
        let total_negatives = history.negatives.len();
        if total_claims == 0 {
            tracing::info!(
                records = history.record_count,
                negatives = total_negatives,
                "no claims recorded; canonical summary left untouched"
            );
            return Ok(CompactionReport::not_compacted(0, total_negatives));
        }

        let plan = self.plan(&history.claims);
        let clusters_by_category = plan.clusters_by_category();
        let redundant_count = plan.redundant.len();
        let document = CanonicalSummaryDocument {
            clusters: plan.sections,
            redundant: plan.redundant,
            negatives: most_recent(history.negatives, self.config.summary_negative_window),
            total_negatives,
            generated_at: ledger.now(),
        };
        let path = self.config.summary_path.clone();
        write_atomic(&path, &document.render())
            .map_err(|source| CompactionError::Write {
                path: path.clone(),
                source,
            })?;

        let outcome = ledger.archive_older_than(self.config.archive_after_days)?;
        tracing::info!(
            claims = total_claims,
            negatives = total_negatives,
            clusters = document.clusters.len(),
            redundant = redundant_count,
            archived = outcome.archived.len(),
            archive_failures = outcome.failed.len(),
            path = %path.display(),
            "compaction finished"
        );

        Ok(CompactionReport {
            compacted: true,
            total_claims,
            total_negatives,
            clusters_by_category,
            redundant_pairs: redundant_count,
            archived: outcome.archived,
            archive_failures: outcome
                .failed
                .into_iter()
                .map(|(partition, err)| format!("{partition}: {err}"))
                .collect(),
            summary_path: Some(path),
        })
    }
}
