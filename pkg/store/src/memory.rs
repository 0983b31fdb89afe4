use std::collections::{BTreeMap, HashSet};

use schema::LedgerRecord;
use time::OffsetDateTime;

use crate::{ArchivedPartition, LedgerStorage, PartitionKey, StoreError, archive_stamp};

/// In-process ledger storage for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedgerStorage {
    partitions: BTreeMap<PartitionKey, Vec<LedgerRecord>>,
    archive: Vec<ArchivedPartition>,
    failing_archives: HashSet<PartitionKey>,
}

impl MemoryLedgerStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every archive attempt of `partition` fail.
    pub fn fail_archive_of(&mut self, partition: PartitionKey) {
        self.failing_archives.insert(partition);
    }
}

impl LedgerStorage for MemoryLedgerStorage {
    fn append(
        &mut self,
        partition: PartitionKey,
        record: &LedgerRecord,
    ) -> Result<(), StoreError> {
        self.partitions
            .entry(partition)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn read_partition(&self, partition: PartitionKey) -> Result<Vec<LedgerRecord>, StoreError> {
        Ok(self.partitions.get(&partition).cloned().unwrap_or_default())
    }

    fn count_partition(&self, partition: PartitionKey) -> Result<usize, StoreError> {
        Ok(self.partitions.get(&partition).map_or(0, Vec::len))
    }

    fn partitions(&self) -> Result<Vec<PartitionKey>, StoreError> {
        Ok(self.partitions.keys().copied().collect())
    }

    fn archive_partition(
        &mut self,
        partition: PartitionKey,
        archived_at: OffsetDateTime,
    ) -> Result<String, StoreError> {
        if self.failing_archives.contains(&partition) {
            return Err(StoreError::Unavailable(format!(
                "archive of {partition} rejected"
            )));
        }
        let Some(records) = self.partitions.remove(&partition) else {
            return Err(StoreError::InvalidPartition(partition.to_string()));
        };
        let location = format!("memory://archive/{partition}_{}", archive_stamp(archived_at));
        self.archive.push(ArchivedPartition {
            location: location.clone(),
            partition,
            records,
        });
        Ok(location)
    }

    fn read_archive(&self) -> Result<Vec<ArchivedPartition>, StoreError> {
        Ok(self.archive.clone())
    }
}
