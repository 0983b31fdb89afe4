mod file;
mod memory;

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use schema::{
    AuditVerdict, Bead, Category, Claim, ClaimRecord, LedgerRecord, Metadata, NegativeRecord,
};
use thiserror::Error;
use time::{Date, Duration, OffsetDateTime, UtcOffset, macros::format_description};
use uuid::Uuid;

pub use file::FileLedgerStorage;
pub use memory::MemoryLedgerStorage;

/// Canonical summary document, kept beside the ledger directories.
pub const CANON_FILE_NAME: &str = "CANON.md";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("partition {partition} line {line}: {message}")]
    Parse {
        partition: String,
        line: usize,
        message: String,
    },
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid partition key: {0}")]
    InvalidPartition(String),
    #[error("archive conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Partition keys
// ---------------------------------------------------------------------------

/// One ledger partition per calendar day (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(Date);

impl PartitionKey {
    pub fn from_date(date: Date) -> Self {
        Self(date)
    }

    pub fn for_instant(instant: OffsetDateTime) -> Self {
        Self(instant.to_offset(UtcOffset::UTC).date())
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        Date::parse(raw, format_description!("[year]-[month]-[day]"))
            .map(Self)
            .map_err(|_| StoreError::InvalidPartition(raw.to_string()))
    }

    pub fn date(&self) -> Date {
        self.0
    }

    /// Whole days between this partition and `later`; negative when `later`
    /// is earlier.
    pub fn days_until(&self, later: PartitionKey) -> i64 {
        (later.0 - self.0).whole_days()
    }

}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}",
            self.0.year(),
            u8::from(self.0.month()),
            self.0.day()
        )
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Settable clock for tests and replay tooling.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<OffsetDateTime>,
}

impl FixedClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage port
// ---------------------------------------------------------------------------

/// A partition relocated into the archive area, with the records it held.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedPartition {
    pub location: String,
    pub partition: PartitionKey,
    pub records: Vec<LedgerRecord>,
}

/// Where ledger records physically live. Implementations must make each
/// `append` atomic with respect to other appends to the same partition and
/// each `archive_partition` all-or-nothing.
pub trait LedgerStorage {
    fn append(&mut self, partition: PartitionKey, record: &LedgerRecord)
    -> Result<(), StoreError>;

    /// Records in append order; empty when the partition does not exist.
    fn read_partition(&self, partition: PartitionKey) -> Result<Vec<LedgerRecord>, StoreError>;

    fn count_partition(&self, partition: PartitionKey) -> Result<usize, StoreError> {
        Ok(self.read_partition(partition)?.len())
    }

    /// Resident (non-archived) partitions, oldest first.
    fn partitions(&self) -> Result<Vec<PartitionKey>, StoreError>;

    /// Move a partition wholesale into the archive area. Returns the archive
    /// location. On error the partition must remain resident and intact.
    fn archive_partition(
        &mut self,
        partition: PartitionKey,
        archived_at: OffsetDateTime,
    ) -> Result<String, StoreError>;

    fn read_archive(&self) -> Result<Vec<ArchivedPartition>, StoreError>;
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Fields of a rejection supplied by the writer; the ledger assigns id and
/// timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNegative {
    pub reason: String,
    pub source_claim_id: String,
    pub source_batch_id: String,
    pub category: Category,
    pub rejected_by: String,
    pub metadata: Metadata,
}

/// Claims and negatives read out of the ledger, oldest partition first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LedgerContents {
    /// Resident partitions that were read.
    pub partitions: Vec<PartitionKey>,
    /// Archived partitions that were read.
    pub archived: Vec<PartitionKey>,
    pub claims: Vec<ClaimRecord>,
    pub negatives: Vec<NegativeRecord>,
    pub record_count: usize,
}

impl LedgerContents {
    fn absorb(&mut self, records: Vec<LedgerRecord>) {
        for record in records {
            self.record_count += 1;
            match record {
                LedgerRecord::Claim(claim) => self.claims.push(claim),
                LedgerRecord::Negative(negative) => self.negatives.push(negative),
                LedgerRecord::Event(_) => {}
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArchiveOutcome {
    pub archived: Vec<String>,
    pub failed: Vec<(PartitionKey, String)>,
}

pub struct Ledger<S: LedgerStorage> {
    storage: S,
    clock: Arc<dyn Clock>,
}

impl<S: LedgerStorage> Ledger<S> {
    pub fn new(storage: S, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn active_partition(&self) -> PartitionKey {
        PartitionKey::for_instant(self.clock.now())
    }

    pub fn append(
        &mut self,
        bead_type: &str,
        content: &str,
        source: &str,
        metadata: Metadata,
    ) -> Result<Bead, StoreError> {
        let timestamp = self.clock.now();
        let bead = Bead {
            id: format!("B-{}", Uuid::new_v4().simple()),
            bead_type: bead_type.to_string(),
            content: content.to_string(),
            source: source.to_string(),
            timestamp,
            metadata,
        };
        self.storage.append(
            PartitionKey::for_instant(timestamp),
            &LedgerRecord::Event(bead.clone()),
        )?;
        Ok(bead)
    }

    pub fn append_negative(&mut self, negative: NewNegative) -> Result<NegativeRecord, StoreError> {
        let timestamp = self.clock.now();
        let record = NegativeRecord {
            id: format!("N-{}", Uuid::new_v4().simple()),
            reason: negative.reason,
            source_claim_id: negative.source_claim_id,
            source_batch_id: negative.source_batch_id,
            category: negative.category,
            rejected_by: negative.rejected_by,
            timestamp,
            metadata: negative.metadata,
        };
        self.storage.append(
            PartitionKey::for_instant(timestamp),
            &LedgerRecord::Negative(record.clone()),
        )?;
        tracing::debug!(id = %record.id, claim_id = %record.source_claim_id, "negative record appended");
        Ok(record)
    }

    pub fn append_claim(
        &mut self,
        claim: Claim,
        verdict: AuditVerdict,
        batch_id: &str,
    ) -> Result<ClaimRecord, StoreError> {
        let recorded_at = self.clock.now();
        let record = ClaimRecord {
            claim,
            verdict,
            batch_id: batch_id.to_string(),
            recorded_at,
        };
        self.storage.append(
            PartitionKey::for_instant(recorded_at),
            &LedgerRecord::Claim(record.clone()),
        )?;
        Ok(record)
    }

    /// Records of the active partition in append order, capped to the most
    /// recent `limit` when given.
    pub fn read(&self, limit: Option<usize>) -> Result<Vec<LedgerRecord>, StoreError> {
        let records = self.storage.read_partition(self.active_partition())?;
        Ok(match limit {
            Some(limit) => most_recent(records, limit),
            None => records,
        })
    }

    /// The most recent `limit` negative records across resident partitions.
    pub fn read_negatives(&self, limit: usize) -> Result<Vec<NegativeRecord>, StoreError> {
        let mut negatives = Vec::new();
        for partition in self.storage.partitions()? {
            negatives.extend(
                self.storage
                    .read_partition(partition)?
                    .into_iter()
                    .filter_map(|record| match record {
                        LedgerRecord::Negative(negative) => Some(negative),
                        _ => None,
                    }),
            );
        }
        Ok(most_recent(negatives, limit))
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.storage.count_partition(self.active_partition())
    }

    pub fn needs_compaction(&self, threshold: usize) -> Result<bool, StoreError> {
        Ok(self.count()? >= threshold)
    }

    pub fn load_resident(&self) -> Result<LedgerContents, StoreError> {
        let mut resident = LedgerContents {
            partitions: self.storage.partitions()?,
            ..LedgerContents::default()
        };
        for partition in resident.partitions.clone() {
            resident.absorb(self.storage.read_partition(partition)?);
        }
        Ok(resident)
    }

    /// Every record ever appended: archived partitions by day, then the
    /// resident ones. Archival relocates records but never drops them from
    /// this view.
    pub fn load_history(&self) -> Result<LedgerContents, StoreError> {
        let mut archive = self.storage.read_archive()?;
        archive.sort_by_key(|archived| archived.partition);
        let mut history = LedgerContents::default();
        for archived in archive {
            history.archived.push(archived.partition);
            history.absorb(archived.records);
        }
        let resident = self.load_resident()?;
        history.partitions = resident.partitions;
        history.record_count += resident.record_count;
        history.claims.extend(resident.claims);
        history.negatives.extend(resident.negatives);
        Ok(history)
    }

    /// Archive every resident partition at least `retention_days` old. A
    /// partition that fails to move stays resident and is reported, so the
    /// next run retries it.
    pub fn archive_older_than(&mut self, retention_days: u32) -> Result<ArchiveOutcome, StoreError> {
        let now = self.clock.now();
        let today = PartitionKey::for_instant(now);
        let mut outcome = ArchiveOutcome::default();
        for partition in self.storage.partitions()? {
            if partition.days_until(today) < i64::from(retention_days) {
                continue;
            }
            match self.storage.archive_partition(partition, now) {
                Ok(location) => {
                    tracing::info!(%partition, %location, "archived ledger partition");
                    outcome.archived.push(location);
                }
                Err(err) => {
                    tracing::warn!(%partition, error = %err, "partition archival failed; will retry");
                    outcome.failed.push((partition, err.to_string()));
                }
            }
        }
        Ok(outcome)
    }
}

/// Keep the last `limit` items, preserving order.
pub fn most_recent<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    if items.len() > limit {
        items.drain(..items.len() - limit);
    }
    items
}

/// `YYYYMMDD-HHMMSS` stamp used in archive names.
pub(crate) fn archive_stamp(at: OffsetDateTime) -> String {
    let at = at.to_offset(UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::Verdict;
    use time::macros::datetime;

    fn ledger_at(now: OffsetDateTime) -> (Ledger<MemoryLedgerStorage>, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(now));
        (
            Ledger::new(MemoryLedgerStorage::new(), clock.clone()),
            clock,
        )
    }

    fn negative(claim_id: &str, reason: &str) -> NewNegative {
        NewNegative {
            reason: reason.into(),
            source_claim_id: claim_id.into(),
            source_batch_id: "batch-1".into(),
            category: Category::DEFAULT,
            rejected_by: "auditor".into(),
            metadata: Metadata::new(),
        }
    }

    fn pass_verdict() -> AuditVerdict {
        AuditVerdict {
            verdict: Verdict::NoFalsificationFound,
            reason: "none".into(),
            citation: "none".into(),
            attempts: 6,
            failing_check: None,
        }
    }

    #[test]
    fn read_on_missing_partition_is_empty() {
        let (ledger, _) = ledger_at(datetime!(2026-10-14 09:00 UTC));
        assert!(ledger.read(None).unwrap().is_empty());
        assert_eq!(ledger.count().unwrap(), 0);
    }

    #[test]
    fn append_returns_written_bead_and_reads_in_order() {
        let (mut ledger, _) = ledger_at(datetime!(2026-10-14 09:00 UTC));
        let first = ledger
            .append("HEARTBEAT", "tick_1", "loop", Metadata::new())
            .unwrap();
        let second = ledger
            .append("HEARTBEAT", "tick_2", "loop", Metadata::new())
            .unwrap();
        assert_ne!(first.id, second.id);
        assert!(first.id.starts_with("B-"));

        let records = ledger.read(None).unwrap();
        let ids: Vec<&str> = records.iter().map(LedgerRecord::id).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);

        let recent = ledger.read(Some(1)).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id(), second.id);
    }

    #[test]
    fn negative_ids_are_unique_and_reference_claims() {
        let (mut ledger, _) = ledger_at(datetime!(2026-10-14 09:00 UTC));
        let mut ids = std::collections::HashSet::new();
        for idx in 0..20 {
            let claim_id = format!("S-{idx:03}");
            let record = ledger.append_negative(negative(&claim_id, "bad")).unwrap();
            assert_eq!(record.source_claim_id, claim_id);
            assert!(ids.insert(record.id));
        }
    }

    #[test]
    fn read_negatives_returns_most_recent_window() {
        let (mut ledger, _) = ledger_at(datetime!(2026-10-14 09:00 UTC));
        for idx in 0..15 {
            ledger
                .append_negative(negative(&format!("S-{idx:03}"), "bad"))
                .unwrap();
            ledger
                .append("EXTRACTION", "noise", "loop", Metadata::new())
                .unwrap();
        }
        let window = ledger.read_negatives(10).unwrap();
        assert_eq!(window.len(), 10);
        assert_eq!(window[0].source_claim_id, "S-005");
        assert_eq!(window[9].source_claim_id, "S-014");
    }

    #[test]
    fn needs_compaction_at_threshold() {
        let (mut ledger, _) = ledger_at(datetime!(2026-10-14 09:00 UTC));
        for _ in 0..3 {
            ledger.append("HEARTBEAT", "t", "loop", Metadata::new()).unwrap();
        }
        assert!(!ledger.needs_compaction(4).unwrap());
        ledger.append("HEARTBEAT", "t", "loop", Metadata::new()).unwrap();
        assert!(ledger.needs_compaction(4).unwrap());
    }

    #[test]
    fn appends_land_in_the_partition_of_their_day() {
        let (mut ledger, clock) = ledger_at(datetime!(2026-10-13 23:59 UTC));
        ledger.append("HEARTBEAT", "late", "loop", Metadata::new()).unwrap();
        clock.advance(Duration::minutes(2));
        ledger.append("HEARTBEAT", "early", "loop", Metadata::new()).unwrap();

        assert_eq!(ledger.count().unwrap(), 1);
        let partitions = ledger.storage().partitions().unwrap();
        assert_eq!(
            partitions.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["2026-10-13", "2026-10-14"]
        );
    }

    #[test]
    fn load_resident_splits_claims_and_negatives() {
        let (mut ledger, clock) = ledger_at(datetime!(2026-10-13 12:00 UTC));
        ledger
            .append_claim(Claim::new("S-001", "IF a", "THEN b"), pass_verdict(), "batch-1")
            .unwrap();
        clock.advance(Duration::days(1));
        ledger.append_negative(negative("S-002", "bad")).unwrap();
        ledger.append("HEARTBEAT", "t", "loop", Metadata::new()).unwrap();

        let resident = ledger.load_resident().unwrap();
        assert_eq!(resident.partitions.len(), 2);
        assert_eq!(resident.claims.len(), 1);
        assert_eq!(resident.negatives.len(), 1);
        assert_eq!(resident.record_count, 3);
    }

    #[test]
    fn history_includes_archived_claims_and_negatives() {
        let (mut ledger, clock) = ledger_at(datetime!(2026-10-12 12:00 UTC));
        ledger
            .append_claim(Claim::new("S-001", "IF a", "THEN b"), pass_verdict(), "batch-1")
            .unwrap();
        ledger.append_negative(negative("S-002", "bad")).unwrap();
        clock.set(datetime!(2026-10-14 08:00 UTC));
        ledger
            .append_claim(Claim::new("S-003", "IF c", "THEN d"), pass_verdict(), "batch-2")
            .unwrap();
        ledger.archive_older_than(1).unwrap();

        let resident = ledger.load_resident().unwrap();
        assert_eq!(resident.claims.len(), 1);
        assert!(resident.negatives.is_empty());

        let history = ledger.load_history().unwrap();
        let ids: Vec<&str> = history
            .claims
            .iter()
            .map(|record| record.claim.claim_id.as_str())
            .collect();
        assert_eq!(ids, vec!["S-001", "S-003"]);
        assert_eq!(history.negatives.len(), 1);
        assert_eq!(history.archived.len(), 1);
        assert_eq!(history.partitions.len(), 1);
        assert_eq!(history.record_count, 3);
    }

    #[test]
    fn most_recent_keeps_order_of_the_tail() {
        assert_eq!(most_recent(vec![1, 2, 3, 4, 5], 2), vec![4, 5]);
        assert_eq!(most_recent(vec![1, 2], 5), vec![1, 2]);
        assert!(most_recent(vec![1, 2], 0).is_empty());
    }

    #[test]
    fn archive_keeps_current_day_and_moves_older_partitions() {
        let (mut ledger, clock) = ledger_at(datetime!(2026-10-12 12:00 UTC));
        ledger.append("HEARTBEAT", "old", "loop", Metadata::new()).unwrap();
        clock.set(datetime!(2026-10-14 08:00 UTC));
        ledger.append("HEARTBEAT", "new", "loop", Metadata::new()).unwrap();

        let outcome = ledger.archive_older_than(1).unwrap();
        assert_eq!(outcome.archived.len(), 1);
        assert!(outcome.failed.is_empty());
        assert_eq!(
            ledger.storage().partitions().unwrap(),
            vec![PartitionKey::for_instant(clock.now())]
        );
        let archive = ledger.storage().read_archive().unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].records.len(), 1);
    }

    #[test]
    fn failed_archival_leaves_partition_resident() {
        let clock = Arc::new(FixedClock::new(datetime!(2026-10-12 12:00 UTC)));
        let mut storage = MemoryLedgerStorage::new();
        storage.fail_archive_of(PartitionKey::for_instant(clock.now()));
        let mut ledger = Ledger::new(storage, clock.clone());
        ledger.append("HEARTBEAT", "old", "loop", Metadata::new()).unwrap();
        clock.set(datetime!(2026-10-14 08:00 UTC));

        let outcome = ledger.archive_older_than(1).unwrap();
        assert!(outcome.archived.is_empty());
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(ledger.storage().partitions().unwrap().len(), 1);
        assert_eq!(ledger.load_resident().unwrap().record_count, 1);
    }

    #[test]
    fn partition_key_parses_and_formats() {
        let key = PartitionKey::parse("2026-03-07").unwrap();
        assert_eq!(key.to_string(), "2026-03-07");
        assert!(matches!(
            PartitionKey::parse("20260307"),
            Err(StoreError::InvalidPartition(_))
        ));
    }

    #[test]
    fn archive_stamp_is_compact_utc() {
        assert_eq!(
            archive_stamp(datetime!(2026-10-14 08:03:09 +2)),
            "20261014-060309"
        );
    }
}
