//! N-way merge across SSTable cursors.
//!
//! A table's files are immutable snapshots layered over time; the logically
//! current state of a partition is spread across every SSTable that touched
//! it. [`TableSet`] discovers the files and their shared partitioner;
//! [`MergeIterator`] walks all of them as one ordered stream:
//!
//! ```text
//! SSTable cursors:  [k1, k4, ...]   [k1, k2, ...]   [k3, ...]
//!                       │               │              │
//!                       └── smallest (token, key) ─────┘
//!                                   │
//!                       union columns across matches,
//!                       freshest timestamp per column,
//!                       tombstones applied
//!                                   │
//!                            RowSink callbacks
//! ```
//!
//! Cursors are sorted by their first partition and only *activated* (data
//! file opened) once the merge position reaches them; a cursor whose stream
//! ends is closed immediately. Dead rows — deleted and never overwritten —
//! are counted and skipped rather than emitted.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::FileSource;
use crate::error::Result;
use crate::{errdata, errinput};
use crate::partitioner::Partitioner;
use crate::schema::TableSchema;
use crate::sstable::{
    keyspace_and_table, read_table_metadata, version_from_filename, ColumnExtra, SsTable,
    TableConfig, STATISTICS_SUFFIX, STILL_ACTIVE,
};

const DATA_SUFFIX: &str = "-Data.db";

/// Receives the merged row stream. Callbacks arrive in order: `new_row`,
/// then one `new_column`/`new_column_with_ttl` per live column in
/// lexicographic name order.
pub trait RowSink {
    fn new_row(&mut self, key: &[u8]);
    fn new_column(&mut self, name: &[u8], value: &[u8], ts: i64);
    fn new_column_with_ttl(
        &mut self,
        name: &[u8],
        value: &[u8],
        ts: i64,
        ttl: u32,
        expiration_secs: u32,
    );
}

/// The set of SSTables found under the input directories, all belonging to
/// one (keyspace, table) and sharing one partitioner.
pub struct TableSet {
    configs: Vec<Arc<TableConfig>>,
    partitioner: Partitioner,
    total_file_size: u64,
    num_files: usize,
    keyspace: String,
    table_name: String,
}

impl TableSet {
    /// Scans the given directories for `-Data.db` files and reads each
    /// table's `-Statistics.db` metadata. Fails on unreadable directories,
    /// unrecognizable filenames, or disagreeing keyspace/table/partitioner.
    pub fn open(dirs: &[PathBuf], verify_checksums: bool) -> Result<Self> {
        let mut set = TableSet {
            configs: Vec::new(),
            partitioner: Partitioner::default_for_missing_metadata(),
            total_file_size: 0,
            num_files: 0,
            keyspace: String::new(),
            table_name: String::new(),
        };
        let mut partitioner = None;

        for dir in dirs {
            let dir = fs::canonicalize(dir)
                .map_err(|err| crate::Error::InvalidInput(format!("cannot resolve directory {}: {err}", dir.display())))?;

            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else { continue };
                if !name.ends_with(DATA_SUFFIX) {
                    continue;
                }
                let metadata = entry.metadata()?;
                if !metadata.is_file() {
                    continue;
                }

                set.total_file_size += metadata.len();
                set.num_files += 1;

                let Some(version) = version_from_filename(name) else {
                    return errdata!("no version number found in table file name {name}");
                };

                let Some((keyspace, table_name)) = keyspace_and_table(version, name, &dir) else {
                    return errdata!("cannot extract keyspace and table from {name}");
                };
                if set.keyspace.is_empty() && set.table_name.is_empty() {
                    set.keyspace = keyspace;
                    set.table_name = table_name;
                } else if set.keyspace != keyspace || set.table_name != table_name {
                    return errinput!(
                        "incompatible keyspace and table for {name}: {},{} != {keyspace},{table_name}",
                        set.keyspace,
                        set.table_name
                    );
                }

                let prefix = dir.join(&name[..name.len() - DATA_SUFFIX.len()]);
                let mut config = TableConfig {
                    path: prefix.to_string_lossy().into_owned(),
                    version,
                    schema: TableSchema::default(),
                    verify_checksums,
                };

                let stats_path = PathBuf::from(config.component(STATISTICS_SUFFIX));
                if let Ok(mut stats) = FileSource::open(&stats_path) {
                    if let Some(this_partitioner) =
                        read_table_metadata(&mut stats, version, &mut config.schema)
                    {
                        match partitioner {
                            None => partitioner = Some(this_partitioner),
                            Some(existing) if existing != this_partitioner => {
                                return errinput!("tables do not use the same partitioner, cannot merge");
                            }
                            _ => {}
                        }
                    }
                }

                set.configs.push(Arc::new(config));
            }
        }

        if set.num_files == 0 {
            return errinput!("no db files found in cassandra files directory");
        }
        set.partitioner = partitioner.unwrap_or_else(Partitioner::default_for_missing_metadata);
        Ok(set)
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn num_files(&self) -> usize {
        self.num_files
    }

    pub fn total_file_size(&self) -> u64 {
        self.total_file_size
    }

    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }

    /// A merge over the full key range.
    pub fn iter(&self) -> MergeIterator {
        let mut tables = Vec::new();
        for config in &self.configs {
            let mut table = SsTable::new(config.clone());
            match table.init(&self.partitioner) {
                Ok(()) => tables.push(table),
                Err(err) => warn!("skipping table {}: {err}", config.path),
            }
        }
        MergeIterator::new(self.partitioner, tables)
    }

    /// A merge starting at the first partition at or after `first_key`.
    pub fn iter_from(&self, first_key: &[u8]) -> MergeIterator {
        let first_token = self.partitioner.assign_token(first_key);
        let mut tables = Vec::new();
        for config in &self.configs {
            let mut table = SsTable::new(config.clone());
            match table.init_at_key(&self.partitioner, &first_token, first_key) {
                Ok(true) => tables.push(table),
                Ok(false) => debug!("table {} ends before the requested key", config.path),
                Err(err) => warn!("skipping table {}: {err}", config.path),
            }
        }
        MergeIterator::new(self.partitioner, tables)
    }
}

pub struct MergeIterator {
    partitioner: Partitioner,
    tables: Vec<SsTable>,
    /// Index of the next not-yet-activated cursor in sorted order.
    next_table: usize,
    /// Cursors whose partition range covers the current merge position.
    active: BTreeSet<usize>,
    read_records: u64,
    skipped_records: u64,
}

impl MergeIterator {
    fn new(partitioner: Partitioner, mut tables: Vec<SsTable>) -> Self {
        tables.sort_by(|a, b| {
            partitioner.compare(a.next_token(), a.next_key(), b.next_token(), b.next_key())
        });
        Self {
            partitioner,
            tables,
            next_table: 0,
            active: BTreeSet::new(),
            read_records: 0,
            skipped_records: 0,
        }
    }

    /// Rows read from the merge so far, live or not. Doubles as the ordinal
    /// of the next row.
    pub fn records_read(&self) -> u64 {
        self.read_records
    }

    /// Rows read but suppressed because a deletion outlived every column.
    pub fn records_skipped(&self) -> u64 {
        self.skipped_records
    }

    /// Produces the next live row into `sink`. Returns false once the
    /// stream is exhausted.
    pub fn next(&mut self, sink: &mut dyn RowSink) -> bool {
        loop {
            if self.active.is_empty() {
                if self.next_table >= self.tables.len() {
                    return false;
                }
                let index = self.next_table;
                self.next_table += 1;
                self.activate(index);
                continue;
            }
            if self.next_record(sink) {
                return true;
            }
        }
    }

    /// The key the merge would visit next, without consuming it. This may
    /// be a dead row that `next` would skip.
    pub fn get_next_key(&mut self) -> Option<Vec<u8>> {
        if self.active.is_empty() && self.next_table >= self.tables.len() {
            return None;
        }
        let matches = self.find_first_row_matches();
        let first = *matches.first()?;
        Some(self.tables[first].next_key().to_vec())
    }

    fn activate(&mut self, index: usize) -> bool {
        match self.tables[index].open() {
            Ok(()) => {
                if !self.tables[index].read_row(&self.partitioner) {
                    self.active.insert(index);
                    true
                } else {
                    // Empty table; nothing to merge.
                    self.tables[index].close();
                    false
                }
            }
            Err(err) => {
                warn!("cannot activate table: {err}");
                false
            }
        }
    }

    fn deactivate(&mut self, index: usize) {
        self.tables[index].close();
        self.active.remove(&index);
    }

    /// Records `index` into `matches` if its current partition sorts at or
    /// before the current minimum. Returns false if it sorts after.
    fn match_table(&self, matches: &mut Vec<usize>, index: usize) -> bool {
        let table = &self.tables[index];
        let comparison = match matches.first() {
            None => std::cmp::Ordering::Less,
            Some(&first) => {
                let smallest = &self.tables[first];
                self.partitioner.compare(
                    table.next_token(),
                    table.next_key(),
                    smallest.next_token(),
                    smallest.next_key(),
                )
            }
        };
        match comparison {
            std::cmp::Ordering::Less => {
                matches.clear();
                matches.push(index);
                true
            }
            std::cmp::Ordering::Equal => {
                matches.push(index);
                true
            }
            std::cmp::Ordering::Greater => false,
        }
    }

    /// The set of cursors positioned at the smallest (token, key), lazily
    /// activating any unopened cursor whose range starts there.
    fn find_first_row_matches(&mut self) -> Vec<usize> {
        let mut matches = Vec::new();
        for index in self.active.iter().copied().collect::<Vec<_>>() {
            self.match_table(&mut matches, index);
        }

        // Pull in any unopened tables that start at the same position.
        while self.next_table < self.tables.len() {
            if !self.match_table(&mut matches, self.next_table) {
                break;
            }
            let index = self.next_table;
            self.next_table += 1;
            if !self.activate(index) {
                matches.retain(|&m| m != index);
            }
        }
        matches
    }

    /// Cursors among `matches` whose current column has the smallest name.
    fn find_first_column_matches(&self, matches: &[usize]) -> Vec<usize> {
        let mut matched = Vec::new();
        let mut min_name: Option<&[u8]> = None;
        for &index in matches {
            let name = self.tables[index].next_column().name.as_slice();
            match min_name {
                None => {
                    min_name = Some(name);
                    matched.push(index);
                }
                Some(current) => match name.cmp(current) {
                    std::cmp::Ordering::Less => {
                        min_name = Some(name);
                        matched.clear();
                        matched.push(index);
                    }
                    std::cmp::Ordering::Equal => matched.push(index),
                    std::cmp::Ordering::Greater => {}
                },
            }
        }
        matched
    }

    /// The cursor holding the freshest version of the current column. Ties
    /// go to the earliest cursor in scan order.
    fn choose_latest_match(&self, matched_columns: &[usize]) -> usize {
        let mut latest = matched_columns[0];
        let mut latest_ts = self.tables[latest].next_column().ts;
        for &index in &matched_columns[1..] {
            let ts = self.tables[index].next_column().ts;
            if ts > latest_ts {
                latest_ts = ts;
                latest = index;
            }
        }
        latest
    }

    /// Folds the range tombstones under the current column position into
    /// `tombstones` and refreshes `min_time`, the newest deletion covering
    /// this position. Tombstones whose range ended before `name` drop out.
    fn update_tombstones(
        &self,
        tombstones: &mut BTreeMap<Vec<u8>, i64>,
        min_time: &mut i64,
        matches: &[usize],
        marked_for_deletion: i64,
        name: &[u8],
    ) {
        for &index in matches {
            let column = self.tables[index].next_column();
            if !column.range_tombstone {
                continue;
            }
            let ts = column.ts;
            let entry = tombstones.entry(column.data.clone()).or_insert(ts);
            if *entry < ts {
                *entry = ts;
            }
            if *min_time == STILL_ACTIVE || *min_time < ts {
                *min_time = ts;
            }
        }

        // Drop tombstones we have moved past, then rebuild the covering
        // timestamp from what remains.
        let kept = tombstones.split_off(name);
        let erased_any = !tombstones.is_empty();
        *tombstones = kept;
        if erased_any {
            *min_time = marked_for_deletion;
            for &ts in tombstones.values() {
                if *min_time == STILL_ACTIVE || *min_time < ts {
                    *min_time = ts;
                }
            }
        }
    }

    /// Assembles the next whole row. Returns false for a dead row (deleted
    /// and no surviving columns); the caller loops.
    fn next_record(&mut self, sink: &mut dyn RowSink) -> bool {
        let mut matches = self.find_first_row_matches();
        if matches.is_empty() {
            return false;
        }

        sink.new_row(self.tables[matches[0]].next_key());

        let mut marked_for_deletion = STILL_ACTIVE;
        for &index in &matches {
            let this_deletion = self.tables[index].marked_for_deletion();
            if this_deletion != STILL_ACTIVE
                && (marked_for_deletion == STILL_ACTIVE || marked_for_deletion < this_deletion)
            {
                marked_for_deletion = this_deletion;
            }
        }

        let mut has_columns = false;
        let mut tombstones: BTreeMap<Vec<u8>, i64> = BTreeMap::new();
        let mut min_time = marked_for_deletion;

        loop {
            let matched_columns = self.find_first_column_matches(&matches);
            if matched_columns.is_empty() {
                break;
            }

            let name = self.tables[matched_columns[0]].next_column().name.clone();
            self.update_tombstones(&mut tombstones, &mut min_time, &matches, marked_for_deletion, &name);

            let latest = self.choose_latest_match(&matched_columns);
            let column = self.tables[latest].next_column().clone();

            // Empty names belong to range tombstones and clustering rows;
            // everything else survives only if nothing newer deleted it.
            if !name.is_empty()
                && !column.deleted
                && (min_time == STILL_ACTIVE || column.ts > min_time)
            {
                let mut value = Vec::new();
                self.tables[latest].read_column_data(&mut value);
                match column.extra {
                    ColumnExtra::Expiration { ttl, expiration } if column.expiring => {
                        sink.new_column_with_ttl(&name, &value, column.ts, ttl, expiration);
                    }
                    _ => sink.new_column(&name, &value, column.ts),
                }
                has_columns = true;
            }

            // Advance every cursor that was sitting on this column.
            for &index in &matched_columns {
                if !self.tables[index].read_column() {
                    matches.retain(|&m| m != index);
                    if self.tables[index].read_row(&self.partitioner) {
                        self.deactivate(index);
                    }
                }
            }
        }

        self.read_records += 1;

        // A deleted row that nothing overwrote is not worth emitting.
        if marked_for_deletion != STILL_ACTIVE && !has_columns {
            self.skipped_records += 1;
            return false;
        }
        true
    }
}
