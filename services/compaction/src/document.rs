use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use schema::{Category, Cluster, NegativeRecord};
use serde::Serialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

const INDEX_ID_LIMIT: usize = 5;
const ENTRY_ID_LIMIT: usize = 10;
const STATEMENT_LIMIT: usize = 10;
const REDUNDANT_LIMIT: usize = 20;

pub const LAST_UPDATED_PREFIX: &str = "*Last updated: ";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedundantPair {
    pub first_id: String,
    pub second_id: String,
    pub similarity: f64,
}

/// A cluster plus the `IF ... THEN ...` text of its members, aligned with
/// `cluster.member_ids`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSection {
    pub cluster: Cluster,
    pub statements: Vec<String>,
}

/// The canonical summary regenerated from scratch on every compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalSummaryDocument {
    /// Grouped by category, in category order then creation order.
    pub clusters: Vec<ClusterSection>,
    pub redundant: Vec<RedundantPair>,
    /// Most recent negatives, oldest first.
    pub negatives: Vec<NegativeRecord>,
    pub total_negatives: usize,
    pub generated_at: OffsetDateTime,
}

impl CanonicalSummaryDocument {
    pub fn total_entries(&self) -> usize {
        self.clusters
            .iter()
            .map(|section| section.cluster.member_ids.len())
            .sum()
    }

    pub fn render(&self) -> String {
        let mut lines: Vec<String> = [
            "# CANON: Canonical Summary",
            "# Regenerated by compaction; do not edit by hand.",
            "",
            "---",
            "",
            "## INDEX",
            "",
        ]
        .map(String::from)
        .to_vec();

        for ClusterSection { cluster, .. } in &self.clusters {
            lines.push(format!(
                "- **{}** | CLUSTER: {} | Entries: {}",
                cluster.category,
                cluster.topic,
                truncated_ids(&cluster.member_ids, INDEX_ID_LIMIT)
            ));
        }
        if self.clusters.is_empty() {
            lines.push("*No entries yet.*".into());
        }
        lines.extend(["", "---", "", "## CLUSTERS", ""].map(String::from));

        for category in Category::ALL {
            lines.push(format!("### Drawer {}: {}", category.number(), category));
            lines.push(String::new());
            let mut any = false;
            for section in self
                .clusters
                .iter()
                .filter(|section| section.cluster.category == category)
            {
                any = true;
                render_section(section, &mut lines);
            }
            if !any {
                lines.push("*No signatures yet.*".into());
                lines.push(String::new());
            }
        }

        if !self.redundant.is_empty() {
            lines.extend(["---", "", "## REDUNDANT SIGNATURES (Flagged)", ""].map(String::from));
            for pair in self.redundant.iter().take(REDUNDANT_LIMIT) {
                lines.push(format!(
                    "- **{}** <-> **{}** (sim: {:.2})",
                    pair.first_id, pair.second_id, pair.similarity
                ));
                lines.push(format!("  - REDUNDANT: see {}", pair.first_id));
            }
            lines.push(String::new());
        }

        lines.extend(["---", "", "## NEGATIVE PATTERNS", ""].map(String::from));
        if self.negatives.is_empty() {
            lines.push("*No negative patterns yet.*".into());
        }
        for negative in &self.negatives {
            lines.push(format!(
                "- **{}** | {} | Source: {} ({})",
                negative.id, negative.reason, negative.source_batch_id, negative.source_claim_id
            ));
        }
        lines.push(String::new());

        let generated_at = self
            .generated_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.generated_at.to_string());
        lines.extend([
            "---".to_string(),
            String::new(),
            format!("{LAST_UPDATED_PREFIX}{generated_at}*"),
            format!(
                "*Entries: {} | Clusters: {} | Negatives: {}*",
                self.total_entries(),
                self.clusters.len(),
                self.total_negatives
            ),
            String::new(),
        ]);
        lines.join("\n")
    }
}

fn render_section(section: &ClusterSection, lines: &mut Vec<String>) {
    let cluster = &section.cluster;
    lines.push(format!(
        "#### CLUSTER: {} | Entries: {}",
        cluster.topic,
        cluster.member_ids.len()
    ));
    lines.push(String::new());
    lines.push(format!("**Summary:** {}", cluster.description));
    lines.push(String::new());
    lines.push(format!(
        "**Entry IDs:** {}",
        truncated_ids(&cluster.member_ids, ENTRY_ID_LIMIT)
    ));
    lines.push(String::new());
    if !cluster.key_patterns.is_empty() {
        lines.push(format!("**Key Patterns:** {}", cluster.key_patterns.join(", ")));
        lines.push(String::new());
    }
    let statements: Vec<String> = cluster
        .member_ids
        .iter()
        .zip(&section.statements)
        .take(STATEMENT_LIMIT)
        .map(|(id, statement)| format!("- {id}: {statement}"))
        .collect();
    if !statements.is_empty() {
        lines.extend(statements);
        lines.push(String::new());
    }
}

fn truncated_ids(ids: &[String], limit: usize) -> String {
    let shown = ids.iter().take(limit).cloned().collect::<Vec<_>>().join(", ");
    if ids.len() > limit {
        format!("{shown}...")
    } else {
        shown
    }
}

/// Replace `path` with `contents` through a synced temp file and a rename.
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = temp_path(path);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn section(category: Category, ids: &[&str], topic: &str, statements: &[&str]) -> ClusterSection {
        ClusterSection {
            cluster: Cluster {
                category,
                member_ids: ids.iter().map(|id| id.to_string()).collect(),
                topic: topic.into(),
                description: format!("Cluster of {} signatures in {}", ids.len(), category),
                key_patterns: vec![topic.into()],
            },
            statements: statements.iter().map(|text| text.to_string()).collect(),
        }
    }

    fn document() -> CanonicalSummaryDocument {
        let ids: Vec<String> = (1..=12).map(|n| format!("S-{n:03}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        CanonicalSummaryDocument {
            clusters: vec![
                section(Category::HtfBias, &id_refs, "WEEKLY_BIAS", &[]),
                section(
                    Category::EntryModel,
                    &["S-020"],
                    "SWEEPS_LOWS",
                    &["IF price sweeps lows THEN look for longs"],
                ),
            ],
            redundant: vec![RedundantPair {
                first_id: "S-001".into(),
                second_id: "S-002".into(),
                similarity: 0.8249,
            }],
            negatives: Vec::new(),
            total_negatives: 0,
            generated_at: datetime!(2026-10-14 10:00 UTC),
        }
    }

    #[test]
    fn renders_index_clusters_and_footer() {
        let rendered = document().render();
        assert!(rendered.contains(
            "- **HTF_BIAS** | CLUSTER: WEEKLY_BIAS | Entries: S-001, S-002, S-003, S-004, S-005..."
        ));
        assert!(rendered.contains("### Drawer 2: MARKET_STRUCTURE\n\n*No signatures yet.*"));
        assert!(rendered.contains("#### CLUSTER: SWEEPS_LOWS | Entries: 1"));
        assert!(rendered.contains("**Entry IDs:** S-001, S-002, S-003, S-004, S-005, S-006, S-007, S-008, S-009, S-010..."));
        assert!(rendered.contains("- S-020: IF price sweeps lows THEN look for longs"));
        assert!(rendered.contains("- **S-001** <-> **S-002** (sim: 0.82)"));
        assert!(rendered.contains("*No negative patterns yet.*"));
        assert!(rendered.contains("*Last updated: 2026-10-14T10:00:00Z*"));
        assert!(rendered.contains("*Entries: 13 | Clusters: 2 | Negatives: 0*"));
    }

    #[test]
    fn redundancy_section_is_omitted_when_empty() {
        let mut doc = document();
        doc.redundant.clear();
        assert!(!doc.render().contains("REDUNDANT SIGNATURES"));
    }

    #[test]
    fn atomic_write_creates_parent_and_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("CANON.md");
        write_atomic(&path, "first").unwrap();
        write_atomic(&path, "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!temp_path(&path).exists());
    }
}
