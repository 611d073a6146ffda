//! Concurrent writer pool draining the merge into a key-value store.
//!
//! N workers (one per client event loop) pull rows from a shared iterator
//! and issue asynchronous create-only upserts through a [`RecordStore`].
//! Each worker bounds its in-flight requests, recycles row buffers through a
//! spare pool, and parks rows that failed transiently on a retry queue.
//!
//! # Lifecycle
//!
//! ```text
//!   iterator ──▶ worker ──▶ store.upsert(..) ──▶ completion event
//!                  ▲                                   │
//!                  │   Ok / exists / permanent: recycle row, pull next
//!                  │   transient: queue for resend ────┤
//!                  │                                   ▼
//!                  └──── coordinator kick ◀─── STALLED (0 in flight)
//! ```
//!
//! A worker is RUNNING while it has requests in flight, STALLED when
//! everything in flight drained but transient failures are waiting for
//! resend, and FINISHED once the iterator is exhausted (or shutdown was
//! requested) with nothing in flight. The coordinator waits on a condition
//! variable, pauses briefly, and kicks stalled workers back to life; the
//! export ends when every worker reports FINISHED.
//!
//! Rows carry the `ordinal` the iterator stamped on them. On an incomplete
//! export the smallest ordinal still parked in a retry queue names the first
//! unsent key, which the summary turns into a resume hint.

use std::fmt::Display;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::config::ExportConfig;
use crate::error::Result;
use crate::merge::{MergeIterator, RowSink};
use crate::util::display_key;

/// Expiry value meaning "this row never expires".
const ETERNAL_EXPIRY: u32 = u32::MAX;

/// How long stalled workers rest before the coordinator re-kicks them.
const STALL_PAUSE: Duration = Duration::from_millis(150);

/// Completion code of an upsert, as reported by the store client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertStatus {
    Ok,
    /// The record already exists. Not an error: create-only semantics make
    /// retries and resumes idempotent.
    RecordExists,
    /// The record is locked by another transaction, so it must exist.
    RecordBusy,
    Timeout,
    AsyncQueueFull,
    Connection,
    NoMoreConnections,
    AsyncConnection,
    Cluster,
    /// Any other server-side failure, by code.
    ServerError(i32),
}

impl UpsertStatus {
    fn counts_as_existing(self) -> bool {
        matches!(self, UpsertStatus::RecordExists | UpsertStatus::RecordBusy)
    }

    fn is_transient(self) -> bool {
        matches!(
            self,
            UpsertStatus::Timeout
                | UpsertStatus::AsyncQueueFull
                | UpsertStatus::Connection
                | UpsertStatus::NoMoreConnections
                | UpsertStatus::AsyncConnection
                | UpsertStatus::Cluster
        )
    }
}

/// Record TTL attached to an upsert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordTtl {
    Seconds(u32),
    NeverExpire,
    /// Let the target namespace's default TTL apply.
    NamespaceDefault,
}

/// One in-flight upsert: the row doubles as the completion token and comes
/// back to its worker through [`Upsert::finish`].
pub struct Upsert {
    ttl: RecordTtl,
    row: Option<Box<ExportRow>>,
    events: Sender<WorkerEvent>,
}

impl Upsert {
    pub fn key(&self) -> &[u8] {
        self.row.as_ref().map_or(&[], |row| &row.key)
    }

    pub fn bins(&self) -> &[(Vec<u8>, Vec<u8>)] {
        self.row.as_ref().map_or(&[], |row| &row.columns)
    }

    pub fn ttl(&self) -> RecordTtl {
        self.ttl
    }

    /// Reports the upsert's outcome. Must be called exactly once, from any
    /// thread; dropping an unfinished upsert counts as a connection failure
    /// so the row is retried rather than lost.
    pub fn finish(mut self, status: UpsertStatus) {
        if let Some(row) = self.row.take() {
            let _ = self.events.send(WorkerEvent::Completed { row, status });
        }
    }
}

impl Drop for Upsert {
    fn drop(&mut self) {
        if let Some(row) = self.row.take() {
            let _ = self.events.send(WorkerEvent::Completed {
                row,
                status: UpsertStatus::Connection,
            });
        }
    }
}

/// The target store's async client. Implementations serialize what they
/// need from the request during the call and signal the outcome later via
/// [`Upsert::finish`]. Upserts are create-only-if-absent.
pub trait RecordStore: Send + Sync {
    fn upsert(&self, namespace: &str, set_name: &str, request: Upsert);
}

/// Source of merged rows for the pool. The merge iterator is the production
/// implementation.
pub trait RowSource: Send {
    /// Rows pulled so far; doubles as the ordinal of the next row.
    fn records_read(&self) -> u64;
    /// Rows read but skipped as dead by the source itself.
    fn records_skipped(&self) -> u64;
    fn next_row(&mut self, sink: &mut dyn RowSink) -> bool;
    fn next_key(&mut self) -> Option<Vec<u8>>;
}

impl RowSource for MergeIterator {
    fn records_read(&self) -> u64 {
        MergeIterator::records_read(self)
    }

    fn records_skipped(&self) -> u64 {
        MergeIterator::records_skipped(self)
    }

    fn next_row(&mut self, sink: &mut dyn RowSink) -> bool {
        self.next(sink)
    }

    fn next_key(&mut self) -> Option<Vec<u8>> {
        self.get_next_key()
    }
}

/// A row buffer cycling between its worker's spare pool, the iterator (as
/// sink), and the store client (as completion token).
pub(crate) struct ExportRow {
    pub key: Vec<u8>,
    pub columns: Vec<(Vec<u8>, Vec<u8>)>,
    /// Absolute expiration in epoch seconds; [`ETERNAL_EXPIRY`] means the
    /// record should not expire.
    expiry: u32,
    ordinal: u64,
    use_nearest_expiry: bool,
}

impl ExportRow {
    fn new(use_nearest_expiry: bool) -> Self {
        let mut row = Self {
            key: Vec::new(),
            columns: Vec::new(),
            expiry: 0,
            ordinal: 0,
            use_nearest_expiry,
        };
        row.reset();
        row
    }

    fn reset(&mut self) {
        self.key.clear();
        self.columns.clear();
        self.expiry = if self.use_nearest_expiry { u32::MAX } else { 0 };
    }
}

impl RowSink for ExportRow {
    fn new_row(&mut self, key: &[u8]) {
        self.key.clear();
        self.key.extend_from_slice(key);
    }

    fn new_column(&mut self, name: &[u8], value: &[u8], _ts: i64) {
        // A column with no TTL pins the whole record to eternal, unless the
        // nearest-expiry policy only ever shrinks the deadline.
        if !self.use_nearest_expiry {
            self.expiry = ETERNAL_EXPIRY;
        }
        self.columns.push((name.to_vec(), value.to_vec()));
    }

    fn new_column_with_ttl(
        &mut self,
        name: &[u8],
        value: &[u8],
        _ts: i64,
        _ttl: u32,
        expiration_secs: u32,
    ) {
        if (expiration_secs < self.expiry) == self.use_nearest_expiry {
            self.expiry = expiration_secs;
        }
        self.columns.push((name.to_vec(), value.to_vec()));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerStatus {
    Running,
    Stalled,
    Finished,
}

pub(crate) enum WorkerEvent {
    Completed { row: Box<ExportRow>, status: UpsertStatus },
    Kick,
}

struct PoolShared {
    statuses: Mutex<Vec<WorkerStatus>>,
    check_status: Condvar,
}

struct Worker<'a, S: RowSource> {
    index: usize,
    namespace: &'a str,
    set_name: &'a str,
    iterator: &'a Mutex<S>,
    store: &'a dyn RecordStore,
    shared: &'a PoolShared,
    config: &'a ExportConfig,
    events_rx: Receiver<WorkerEvent>,
    events_tx: Sender<WorkerEvent>,
    requests_in_flight: usize,
    failed_requests: Vec<Box<ExportRow>>,
    spare_requests: Vec<Box<ExportRow>>,
    existing_entries: u64,
    failed_entries: u64,
    expired_entries: u64,
}

/// Per-worker counters and the oldest unsent row, reported at exit.
struct WorkerReport {
    existing_entries: u64,
    failed_entries: u64,
    expired_entries: u64,
    first_unsent: Option<(u64, Vec<u8>)>,
}

impl<S: RowSource> Worker<'_, S> {
    fn run(mut self) -> WorkerReport {
        self.fill_pipeline();
        loop {
            if self.requests_in_flight == 0 {
                match self.status() {
                    WorkerStatus::Finished => break,
                    // Stalled (or freshly started): wait for a kick or a
                    // late completion.
                    _ => {}
                }
            }
            match self.events_rx.recv() {
                Ok(WorkerEvent::Completed { row, status }) => {
                    if self.handle_completion(row, status) {
                        self.fill_pipeline();
                    }
                }
                Ok(WorkerEvent::Kick) => self.fill_pipeline(),
                Err(_) => break,
            }
        }

        let first_unsent = self
            .failed_requests
            .iter()
            .min_by_key(|row| row.ordinal)
            .map(|row| (row.ordinal, row.key.clone()));
        WorkerReport {
            existing_entries: self.existing_entries,
            failed_entries: self.failed_entries,
            expired_entries: self.expired_entries,
            first_unsent,
        }
    }

    fn status(&self) -> WorkerStatus {
        self.shared.statuses.lock().unwrap_or_else(|e| e.into_inner())[self.index]
    }

    fn set_status(&self, status: WorkerStatus) {
        let mut statuses = self.shared.statuses.lock().unwrap_or_else(|e| e.into_inner());
        statuses[self.index] = status;
    }

    /// With requests in flight the status stays RUNNING; only an idle
    /// worker may report STALLED or FINISHED, waking the coordinator.
    fn set_status_if_idle(&self, status: WorkerStatus) {
        if self.requests_in_flight == 0 {
            let mut statuses = self.shared.statuses.lock().unwrap_or_else(|e| e.into_inner());
            statuses[self.index] = status;
            self.shared.check_status.notify_all();
        }
    }

    /// Issues upserts until the in-flight bound is reached or the stream
    /// ends. This stands in for the client's pipeline-ready callback.
    fn fill_pipeline(&mut self) {
        while self.requests_in_flight < self.config.max_in_flight.max(1) {
            if !self.write_next() {
                break;
            }
        }
    }

    /// Sends one row: a queued retry if there is one, otherwise the next
    /// row from the iterator. Returns false when there is nothing left to
    /// send (finished, stalled, or shut down).
    fn write_next(&mut self) -> bool {
        loop {
            if self.config.shutdown.terminated() {
                self.set_status_if_idle(WorkerStatus::Finished);
                return false;
            }

            let row = match self.next_row_to_send() {
                Some(row) => row,
                None => {
                    self.set_status_if_idle(WorkerStatus::Finished);
                    return false;
                }
            };

            self.set_status(WorkerStatus::Running);

            let ttl = match self.record_ttl(&row) {
                Some(ttl) => ttl,
                None => {
                    // Already past its expiration; not worth sending.
                    self.expired_entries += 1;
                    self.return_row_to_pool(row);
                    continue;
                }
            };

            let request = Upsert { ttl, row: Some(row), events: self.events_tx.clone() };
            self.store.upsert(self.namespace, self.set_name, request);
            return true;
        }
    }

    /// A queued retry, or a fresh row pulled from the shared iterator.
    /// None when the iterator is exhausted.
    fn next_row_to_send(&mut self) -> Option<Box<ExportRow>> {
        if let Some(row) = self.failed_requests.pop() {
            self.requests_in_flight += 1;
            return Some(row);
        }

        self.requests_in_flight += 1;
        let mut row = self
            .spare_requests
            .pop()
            .unwrap_or_else(|| Box::new(ExportRow::new(self.config.use_nearest_expiry)));

        let no_more_records = {
            let mut iterator = self.iterator.lock().unwrap_or_else(|e| e.into_inner());
            row.ordinal = iterator.records_read();
            !iterator.next_row(row.as_mut())
        };

        if no_more_records {
            self.return_row_to_pool(row);
            return None;
        }
        Some(row)
    }

    /// The TTL for this row, or None if the row is already expired.
    fn record_ttl(&self, row: &ExportRow) -> Option<RecordTtl> {
        if row.expiry == ETERNAL_EXPIRY {
            return Some(if self.config.prohibit_eternal_records {
                RecordTtl::NamespaceDefault
            } else {
                RecordTtl::NeverExpire
            });
        }

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        if u64::from(row.expiry) >= now + u64::from(self.config.minimum_ttl) {
            Some(RecordTtl::Seconds((u64::from(row.expiry) - now) as u32))
        } else {
            None
        }
    }

    /// Processes one completion. Returns true when the pipeline should be
    /// refilled; transient failures instead park the worker until another
    /// completion or a coordinator kick arrives.
    fn handle_completion(&mut self, row: Box<ExportRow>, status: UpsertStatus) -> bool {
        match status {
            UpsertStatus::Ok => {
                self.return_row_to_pool(row);
                true
            }
            status if status.counts_as_existing() => {
                self.existing_entries += 1;
                self.return_row_to_pool(row);
                true
            }
            status if status.is_transient() => {
                warn!("upsert returned {status:?} (retrying)");
                self.queue_row_for_resend(row);
                false
            }
            status => {
                self.failed_entries += 1;
                warn!("upsert returned {status:?} (key \"{}\" failed)", display_key(&row.key));
                self.return_row_to_pool(row);
                true
            }
        }
    }

    fn return_row_to_pool(&mut self, mut row: Box<ExportRow>) {
        self.requests_in_flight -= 1;
        row.reset();
        self.spare_requests.push(row);
    }

    fn queue_row_for_resend(&mut self, row: Box<ExportRow>) {
        self.requests_in_flight -= 1;
        self.failed_requests.push(row);
        // This worker may not be expecting any more callbacks; ask the
        // coordinator to wake it up soon instead of blocking here.
        self.set_status_if_idle(WorkerStatus::Stalled);
    }
}

/// Final tallies of an export run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportSummary {
    /// Rows the merge produced, live or not.
    pub records_read: u64,
    /// Rows the merge suppressed as deleted.
    pub records_skipped: u64,
    /// Rows dropped because their TTL had already lapsed.
    pub expired_entries: u64,
    /// Rows the store already had.
    pub existing_entries: u64,
    /// Rows that failed permanently.
    pub failed_entries: u64,
    /// Key to resume from if the export did not complete.
    pub resume_key: Option<Vec<u8>>,
}

impl ExportSummary {
    pub fn exported(&self) -> u64 {
        self.records_read - self.existing_entries - self.failed_entries - self.expired_entries
    }

    pub fn is_complete(&self) -> bool {
        self.resume_key.is_none()
    }
}

impl Display for ExportSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(
            f,
            "Exported {} records, failed to write {} records, skipped {} deleted/expired records, \
             skipped {} records that were already present.",
            self.exported(),
            self.failed_entries,
            self.records_skipped + self.expired_entries,
            self.existing_entries
        )?;
        match &self.resume_key {
            Some(key) if crate::util::is_printable(key) => {
                write!(f, "Export incomplete. Next time you may resume by adding: -s {}", display_key(key))
            }
            Some(key) => {
                write!(f, "Export incomplete. Next time you may resume by adding: -S {}", hex::encode(key))
            }
            None => write!(f, "Export complete"),
        }
    }
}

/// Runs the full writer pool over `iterator`, blocking until every worker
/// finishes. `namespace` and `set_name` are the resolved target names.
pub fn run_export<S: RowSource>(
    iterator: S,
    store: &dyn RecordStore,
    config: &ExportConfig,
    namespace: &str,
    set_name: &str,
) -> Result<ExportSummary> {
    let worker_count = config.event_loops.max(1);
    let iterator = Mutex::new(iterator);
    // Workers start as RUNNING: each sorts out its real status the moment
    // its thread begins issuing (or fails to issue) upserts.
    let shared = PoolShared {
        statuses: Mutex::new(vec![WorkerStatus::Running; worker_count]),
        check_status: Condvar::new(),
    };

    let reports = thread::scope(|scope| {
        let mut kick_senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (events_tx, events_rx) = channel();
            kick_senders.push(events_tx.clone());
            let worker = Worker {
                index,
                namespace,
                set_name,
                iterator: &iterator,
                store,
                shared: &shared,
                config,
                events_rx,
                events_tx,
                requests_in_flight: 0,
                failed_requests: Vec::new(),
                spare_requests: Vec::new(),
                existing_entries: 0,
                failed_entries: 0,
                expired_entries: 0,
            };
            handles.push(scope.spawn(move || worker.run()));
        }

        wait_for_workers(&shared, &kick_senders);

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(WorkerReport {
                existing_entries: 0,
                failed_entries: 0,
                expired_entries: 0,
                first_unsent: None,
            }))
            .collect::<Vec<_>>()
    });

    let mut summary = ExportSummary {
        records_read: 0,
        records_skipped: 0,
        expired_entries: 0,
        existing_entries: 0,
        failed_entries: 0,
        resume_key: None,
    };
    let mut first_unsent: Option<(u64, Vec<u8>)> = None;
    for report in reports {
        summary.existing_entries += report.existing_entries;
        summary.failed_entries += report.failed_entries;
        summary.expired_entries += report.expired_entries;
        if let Some((ordinal, key)) = report.first_unsent {
            if first_unsent.as_ref().is_none_or(|(best, _)| ordinal < *best) {
                first_unsent = Some((ordinal, key));
            }
        }
    }

    let mut iterator = iterator.into_inner()?;
    summary.records_read = iterator.records_read();
    summary.records_skipped = iterator.records_skipped();
    summary.resume_key = first_unsent.map(|(_, key)| key).or_else(|| iterator.next_key());
    Ok(summary)
}

/// Waits for every worker to finish, re-kicking stalled ones after a short
/// pause so their retry queues drain.
fn wait_for_workers(shared: &PoolShared, kick_senders: &[Sender<WorkerEvent>]) {
    loop {
        let stalled: Vec<usize> = {
            let mut statuses = shared.statuses.lock().unwrap_or_else(|e| e.into_inner());
            while statuses.iter().all(|&status| status == WorkerStatus::Running) {
                statuses = shared
                    .check_status
                    .wait(statuses)
                    .unwrap_or_else(|e| e.into_inner());
            }
            if statuses.iter().all(|&status| status == WorkerStatus::Finished) {
                return;
            }
            statuses
                .iter()
                .enumerate()
                .filter(|(_, &status)| status == WorkerStatus::Stalled)
                .map(|(index, _)| index)
                .collect()
        };

        thread::sleep(STALL_PAUSE);
        for index in stalled {
            let _ = kick_senders[index].send(WorkerEvent::Kick);
        }
    }
}
