use ranking::similarity;
use schema::NegativeRecord;
use serde::Serialize;
use store::{Ledger, LedgerStorage, StoreError};

pub const DEFAULT_FEEDBACK_WINDOW: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvoidanceEntry {
    pub id: String,
    pub reason: String,
    /// Text of the rejected claim, when the negative record carried it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl From<&NegativeRecord> for AvoidanceEntry {
    fn from(record: &NegativeRecord) -> Self {
        Self {
            id: record.id.clone(),
            reason: record.reason.clone(),
            pattern: record.pattern(),
        }
    }
}

/// Recently falsified patterns attached to an extraction request. Advisory:
/// extractors use it to steer away from repeats, nothing enforces it.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AvoidanceList {
    pub entries: Vec<AvoidanceEntry>,
}

impl AvoidanceList {
    pub fn from_negatives(negatives: &[NegativeRecord]) -> Self {
        Self {
            entries: negatives.iter().map(AvoidanceEntry::from).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `- id: reason` per entry, or `None yet.` for an empty list.
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return "None yet.".to_string();
        }
        self.entries
            .iter()
            .map(|entry| format!("- {}: {}", entry.id, entry.reason))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The first entry the candidate repeats: either its text is at least
    /// `threshold` similar to a rejected pattern, or it quotes a rejection
    /// reason outright.
    pub fn matching(
        &self,
        condition: &str,
        action: &str,
        threshold: f64,
    ) -> Option<&AvoidanceEntry> {
        let candidate = format!("{condition} {action}");
        let condition_lower = condition.to_lowercase();
        let action_lower = action.to_lowercase();
        self.entries.iter().find(|entry| {
            if let Some(pattern) = &entry.pattern
                && similarity(pattern, &candidate) >= threshold
            {
                return true;
            }
            let reason = entry.reason.trim().to_lowercase();
            !reason.is_empty()
                && (condition_lower.contains(&reason) || action_lower.contains(&reason))
        })
    }
}

/// Reads the most recent negative records into an avoidance list before
/// each dispatch. Records are not consumed; they resurface until newer
/// rejections push them out of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackInjector {
    window: usize,
}

impl Default for FeedbackInjector {
    fn default() -> Self {
        Self::new(DEFAULT_FEEDBACK_WINDOW)
    }
}

impl FeedbackInjector {
    pub fn new(window: usize) -> Self {
        Self { window }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn avoidance_list<S: LedgerStorage>(
        &self,
        ledger: &Ledger<S>,
    ) -> Result<AvoidanceList, StoreError> {
        let negatives = ledger.read_negatives(self.window)?;
        if !negatives.is_empty() {
            tracing::debug!(count = negatives.len(), "attaching avoidance list");
        }
        Ok(AvoidanceList::from_negatives(&negatives))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{Category, Metadata};
    use std::sync::Arc;
    use store::{FixedClock, MemoryLedgerStorage, NewNegative};
    use time::macros::datetime;

    fn rejection(claim_id: &str, reason: &str, condition: &str, action: &str) -> NewNegative {
        let mut metadata = Metadata::new();
        metadata.insert("condition".into(), condition.into());
        metadata.insert("action".into(), action.into());
        NewNegative {
            reason: reason.into(),
            source_claim_id: claim_id.into(),
            source_batch_id: "batch-1".into(),
            category: Category::DEFAULT,
            rejected_by: "auditor".into(),
            metadata,
        }
    }

    #[test]
    fn empty_ledger_renders_placeholder() {
        let ledger = Ledger::new(
            MemoryLedgerStorage::new(),
            Arc::new(FixedClock::new(datetime!(2026-10-14 09:00 UTC))),
        );
        let list = FeedbackInjector::default().avoidance_list(&ledger).unwrap();
        assert!(list.is_empty());
        assert_eq!(list.render(), "None yet.");
    }

    #[test]
    fn window_keeps_most_recent_and_resurfaces_without_consuming() {
        let mut ledger = Ledger::new(
            MemoryLedgerStorage::new(),
            Arc::new(FixedClock::new(datetime!(2026-10-14 09:00 UTC))),
        );
        for idx in 0..12 {
            ledger
                .append_negative(rejection(&format!("S-{idx:03}"), "bad", "IF x", "THEN y"))
                .unwrap();
        }
        let injector = FeedbackInjector::new(10);
        let first = injector.avoidance_list(&ledger).unwrap();
        let second = injector.avoidance_list(&ledger).unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first, second);

        let rendered = first.render();
        assert_eq!(rendered.lines().count(), 10);
        assert!(rendered.lines().all(|line| line.starts_with("- N-") && line.ends_with(": bad")));
    }

    #[test]
    fn matching_uses_pattern_similarity_and_reason_text() {
        let list = AvoidanceList {
            entries: vec![
                AvoidanceEntry {
                    id: "N-1".into(),
                    reason: "Unfalsifiable claim".into(),
                    pattern: Some("IF price always reverses THEN enter".into()),
                },
                AvoidanceEntry {
                    id: "N-2".into(),
                    reason: "midnight open".into(),
                    pattern: None,
                },
            ],
        };
        let hit = list
            .matching("IF price always reverses", "THEN enter", 0.85)
            .unwrap();
        assert_eq!(hit.id, "N-1");
        let hit = list
            .matching("IF price trades above the Midnight Open", "THEN favor longs", 0.85)
            .unwrap();
        assert_eq!(hit.id, "N-2");
        assert!(list.matching("IF equal highs form", "THEN target them", 0.85).is_none());
    }
}
