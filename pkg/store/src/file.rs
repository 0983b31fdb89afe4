use std::{
    fs::{File, OpenOptions, create_dir_all, read_dir, rename},
    io::{BufRead, BufReader, ErrorKind, Write},
    path::{Path, PathBuf},
};

use schema::LedgerRecord;
use time::OffsetDateTime;

use crate::{
    ArchivedPartition, CANON_FILE_NAME, LedgerStorage, PartitionKey, StoreError, archive_stamp,
};

const BEADS_DIR_NAME: &str = "beads";
const ARCHIVE_DIR_NAME: &str = "archive";
const PARTITION_PREFIX: &str = "beads-";
const ARCHIVE_PREFIX: &str = "archive_beads-";
const PARTITION_SUFFIX: &str = ".jsonl";

/// JSON Lines ledger on the local filesystem:
/// `<root>/beads/beads-YYYY-MM-DD.jsonl` for resident partitions and
/// `<root>/archive/archive_beads-YYYY-MM-DD_<stamp>.jsonl` once retired.
#[derive(Debug, Clone)]
pub struct FileLedgerStorage {
    root: PathBuf,
    sync_on_append: bool,
}

impl FileLedgerStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            sync_on_append: true,
        }
    }

    /// Skip the per-record `sync_data`; appends stay atomic but may be lost
    /// on power failure.
    pub fn without_sync(mut self) -> Self {
        self.sync_on_append = false;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn beads_dir(&self) -> PathBuf {
        self.root.join(BEADS_DIR_NAME)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR_NAME)
    }

    pub fn canon_path(&self) -> PathBuf {
        self.root.join(CANON_FILE_NAME)
    }

    pub fn partition_path(&self, partition: PartitionKey) -> PathBuf {
        self.beads_dir()
            .join(format!("{PARTITION_PREFIX}{partition}{PARTITION_SUFFIX}"))
    }
}

impl LedgerStorage for FileLedgerStorage {
    fn append(
        &mut self,
        partition: PartitionKey,
        record: &LedgerRecord,
    ) -> Result<(), StoreError> {
        create_dir_all(self.beads_dir())?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.partition_path(partition))?;
        // Single write on an O_APPEND handle keeps each record contiguous.
        file.write_all(line.as_bytes())?;
        if self.sync_on_append {
            file.sync_data()?;
        }
        Ok(())
    }

    fn read_partition(&self, partition: PartitionKey) -> Result<Vec<LedgerRecord>, StoreError> {
        let path = self.partition_path(partition);
        match File::open(&path) {
            Ok(file) => read_records(file, &partition.to_string()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn count_partition(&self, partition: PartitionKey) -> Result<usize, StoreError> {
        let path = self.partition_path(partition);
        match File::open(&path) {
            Ok(file) => count_non_empty_lines(file),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn partitions(&self) -> Result<Vec<PartitionKey>, StoreError> {
        let dir = self.beads_dir();
        let entries = match read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
                continue;
            };
            let Some(raw) = name
                .strip_prefix(PARTITION_PREFIX)
                .and_then(|rest| rest.strip_suffix(PARTITION_SUFFIX))
            else {
                continue;
            };
            match PartitionKey::parse(raw) {
                Ok(key) => out.push(key),
                Err(_) => tracing::debug!(file = name, "ignoring non-partition file"),
            }
        }
        out.sort();
        Ok(out)
    }

    fn archive_partition(
        &mut self,
        partition: PartitionKey,
        archived_at: OffsetDateTime,
    ) -> Result<String, StoreError> {
        let source = self.partition_path(partition);
        if !source.exists() {
            return Err(StoreError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("partition file {} is missing", source.display()),
            )));
        }
        create_dir_all(self.archive_dir())?;
        let target = self.archive_dir().join(format!(
            "{ARCHIVE_PREFIX}{partition}_{}{PARTITION_SUFFIX}",
            archive_stamp(archived_at)
        ));
        if target.exists() {
            return Err(StoreError::Conflict(format!(
                "archive target {} already exists",
                target.display()
            )));
        }
        // rename is atomic within one filesystem: the partition is either
        // still resident or fully relocated.
        rename(&source, &target)?;
        Ok(target.display().to_string())
    }

    fn read_archive(&self) -> Result<Vec<ArchivedPartition>, StoreError> {
        let dir = self.archive_dir();
        let entries = match read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
                continue;
            };
            let Some(raw) = name
                .strip_prefix(ARCHIVE_PREFIX)
                .and_then(|rest| rest.split('_').next())
            else {
                continue;
            };
            let partition = PartitionKey::parse(raw)?;
            let records = read_records(File::open(&path)?, name)?;
            out.push(ArchivedPartition {
                location: path.display().to_string(),
                partition,
                records,
            });
        }
        out.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(out)
    }
}

fn read_records(file: File, partition: &str) -> Result<Vec<LedgerRecord>, StoreError> {
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|err| StoreError::Parse {
            partition: partition.to_string(),
            line: idx + 1,
            message: err.to_string(),
        })?;
        out.push(record);
    }
    Ok(out)
}

fn count_non_empty_lines(file: File) -> Result<usize, StoreError> {
    let reader = BufReader::new(file);
    let mut count = 0usize;
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}
