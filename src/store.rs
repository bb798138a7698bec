//! Persistent per-unit log storage.
//!
//! Every unit gets an append-only `<log_dir>/<unit>.jsonl` file holding one
//! [`LogEvent`] per line, plus an in-memory [`LogBuffer`] of its most recent events.
//!
//! - Appends are serialized by the unit's writer mutex, which owns the file. The
//!   record is written and synced there; only then is the reader lock taken, briefly,
//!   to publish the commit and notify live subscribers. Subscribers of one unit
//!   therefore see strictly increasing, gap-free sequences.
//! - Readers never hold the lock while reading. They open the file under the read
//!   lock and only read up to the length committed by the last complete append, so
//!   they can't observe a torn record.
//! - [`LogFile`] is a read-only view for other processes: it never truncates and
//!   skips a torn tail instead.
//! - When a file grows past its size threshold the oldest complete events are evicted
//!   by atomically rewriting the file.
//! - If the disk fails, the unit is flagged degraded: appends keep flowing to memory
//!   and live subscribers, and history is served from the in-memory buffer.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use regex::{Regex, RegexBuilder};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::ansi::DecodedLine;
use crate::config::validate_name;
use crate::error::StoreError;
use crate::output::{LogBuffer, LogEvent, StreamKind};

const LIVE_CAPACITY: usize = 1024;
const REFILL_BATCH: u64 = 1024;

/// Storage limits shared by every unit.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub dir: PathBuf,
    /// Size a unit's file may reach before eviction kicks in.
    pub max_bytes: u64,
    /// Events kept in memory per unit.
    pub max_lines: usize,
}

/// The set of unit logs under one directory.
pub struct LogStore {
    settings: StoreSettings,
    units: RwLock<HashMap<String, Arc<UnitLog>>>,
}

impl LogStore {
    /// Opens the store, creating the log directory if needed.
    pub fn open(settings: StoreSettings) -> Result<Self, StoreError> {
        fs::create_dir_all(&settings.dir).map_err(|source| StoreError::Directory {
            path: settings.dir.clone(),
            source,
        })?;
        Ok(Self {
            settings,
            units: RwLock::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.settings.dir
    }

    /// Returns the log for `unit`, recovering it from disk on first use.
    ///
    /// Fails for names that are not a single safe path component.
    pub fn unit(&self, unit: &str) -> Result<Arc<UnitLog>, StoreError> {
        if let Some(log) = self.units.read().get(unit) {
            return Ok(log.clone());
        }
        check_name(unit)?;
        let mut units = self.units.write();
        let log = units
            .entry(unit.to_string())
            .or_insert_with(|| {
                Arc::new(UnitLog::open(
                    unit,
                    log_path(&self.settings.dir, unit),
                    self.settings.max_bytes,
                    self.settings.max_lines,
                ))
            })
            .clone();
        Ok(log)
    }

    /// Drops the in-memory state for `unit`. Its file is kept.
    pub fn forget(&self, unit: &str) {
        self.units.write().remove(unit);
    }

    pub fn append(
        &self,
        unit: &str,
        stream: StreamKind,
        line: DecodedLine,
    ) -> Result<LogEvent, StoreError> {
        Ok(self.unit(unit)?.append(stream, line))
    }

    pub fn tail(&self, unit: &str, from_seq: u64) -> Result<LogTail, StoreError> {
        Ok(UnitLog::tail(&self.unit(unit)?, from_seq))
    }

    pub fn history(&self, unit: &str, range: Range<u64>) -> Result<Vec<LogEvent>, StoreError> {
        Ok(self.unit(unit)?.history(range))
    }

    pub fn search(
        &self,
        unit: &str,
        query: SearchQuery,
        mode: SearchMode,
    ) -> Result<SearchResults, StoreError> {
        Ok(UnitLog::search(&self.unit(unit)?, query, mode))
    }
}

fn check_name(unit: &str) -> Result<(), StoreError> {
    validate_name(unit).map_err(|reason| StoreError::InvalidName {
        unit: unit.to_string(),
        reason,
    })
}

fn log_path(dir: &Path, unit: &str) -> PathBuf {
    dir.join(format!("{}.jsonl", unit))
}

// Owned by whoever is appending. Holds the file so disk I/O never happens under
// the reader lock.
#[derive(Debug)]
struct Writer {
    file: Option<File>,
    next_seq: u64,
}

// What readers see: only ever describes fully written records.
#[derive(Debug)]
struct Inner {
    next_seq: u64,
    first_seq: u64,
    committed: u64,
    count: usize,
    ring: LogBuffer,
    degraded: Option<String>,
}

/// Log storage for a single unit.
#[derive(Debug)]
pub struct UnitLog {
    name: String,
    path: PathBuf,
    max_bytes: u64,
    writer: Mutex<Writer>,
    inner: RwLock<Inner>,
    live: broadcast::Sender<LogEvent>,
}

struct Recovered {
    last_seq: u64,
    first_seq: Option<u64>,
    committed: u64,
    count: usize,
}

impl UnitLog {
    fn open(name: &str, path: PathBuf, max_bytes: u64, max_lines: usize) -> Self {
        let (live, _rx) = broadcast::channel(LIVE_CAPACITY);
        let mut inner = Inner {
            next_seq: 1,
            first_seq: 1,
            committed: 0,
            count: 0,
            ring: LogBuffer::new(max_lines),
            degraded: None,
        };
        let mut file = None;
        let opened = recover(&path, &mut inner.ring).and_then(|recovered| {
            let file = OpenOptions::new().append(true).create(true).open(&path)?;
            Ok((recovered, file))
        });
        match opened {
            Ok((recovered, opened)) => {
                inner.next_seq = recovered.last_seq + 1;
                inner.first_seq = recovered.first_seq.unwrap_or(inner.next_seq);
                inner.committed = recovered.committed;
                inner.count = recovered.count;
                file = Some(opened);
                debug!(unit = name, events = recovered.count, "log history recovered");
            }
            Err(err) => {
                warn!(unit = name, error = %err, "log history unavailable; keeping logs in memory");
                inner.degraded = Some(err.to_string());
            }
        }
        Self {
            name: name.to_string(),
            path,
            max_bytes,
            writer: Mutex::new(Writer {
                file,
                next_seq: inner.next_seq,
            }),
            inner: RwLock::new(inner),
            live,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records one decoded line, assigning it the next sequence number.
    ///
    /// The event is durable on disk before this returns unless the log is degraded.
    /// Appends are serialized by the writer lock; readers only wait for the
    /// in-memory commit.
    pub fn append(&self, stream: StreamKind, line: DecodedLine) -> LogEvent {
        let mut writer = self.writer.lock();
        let event = LogEvent {
            unit: self.name.clone(),
            seq: writer.next_seq,
            timestamp: Utc::now(),
            stream,
            segments: line.segments,
            raw_len: line.raw_len,
        };
        writer.next_seq += 1;

        let mut written = None;
        if let Some(file) = writer.file.as_mut() {
            match write_record(file, &event) {
                Ok(len) => written = Some(len),
                Err(err) => {
                    writer.file = None;
                    self.degrade(&err);
                }
            }
        }

        let over_limit = {
            let mut inner = self.inner.write();
            inner.next_seq = event.seq + 1;
            if let Some(len) = written {
                inner.committed += len;
                inner.count += 1;
            }
            inner.ring.push(event.clone());
            let _ = self.live.send(event.clone());
            written.is_some() && inner.committed > self.max_bytes
        };
        if over_limit {
            if let Err(err) = self.compact(&mut writer) {
                writer.file = None;
                self.degrade(&err);
            }
        }
        event
    }

    fn degrade(&self, err: &io::Error) {
        warn!(unit = %self.name, error = %err, "log write failed; history degraded");
        self.inner.write().degraded = Some(err.to_string());
    }

    // Rewrites the file without its oldest events until it is back under three
    // quarters of the limit. Readers keep using the old file until the swap is
    // published.
    fn compact(&self, writer: &mut Writer) -> io::Result<()> {
        let committed = self.inner.read().committed;
        let low_water = self.max_bytes / 4 * 3;
        let mut data = Vec::with_capacity(committed as usize);
        File::open(&self.path)?.take(committed).read_to_end(&mut data)?;

        let mut start = 0usize;
        let mut remaining = data.len() as u64;
        let mut evicted = 0usize;
        while remaining > low_water && start < data.len() {
            let end = match data[start..].iter().position(|&b| b == b'\n') {
                Some(pos) => start + pos + 1,
                None => data.len(),
            };
            remaining -= (end - start) as u64;
            start = end;
            evicted += 1;
        }
        let kept = &data[start..];
        let first_seq = kept
            .split(|&b| b == b'\n')
            .find_map(|line| serde_json::from_slice::<LogEvent>(line).ok())
            .map(|event| event.seq)
            .unwrap_or(writer.next_seq);

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(kept)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        writer.file = Some(OpenOptions::new().append(true).open(&self.path)?);

        let mut inner = self.inner.write();
        inner.committed = kept.len() as u64;
        inner.count = inner.count.saturating_sub(evicted);
        inner.first_seq = first_seq;
        debug!(unit = %self.name, evicted, kept = inner.committed, "log file compacted");
        Ok(())
    }

    /// Sequence number the next appended event will get.
    pub fn next_seq(&self) -> u64 {
        self.inner.read().next_seq
    }

    /// Oldest sequence number still retrievable.
    pub fn first_seq(&self) -> u64 {
        let inner = self.inner.read();
        if inner.degraded.is_some() {
            inner.ring.first_seq().unwrap_or(inner.next_seq)
        } else {
            inner.first_seq
        }
    }

    /// Why on-disk history is unavailable, if it is.
    pub fn degraded(&self) -> Option<String> {
        self.inner.read().degraded.clone()
    }

    /// Number of retrievable events.
    pub fn line_count(&self) -> usize {
        let inner = self.inner.read();
        if inner.degraded.is_some() {
            inner.ring.len()
        } else {
            inner.count
        }
    }

    /// Events with sequence numbers in `range`, in order.
    pub fn history(&self, range: Range<u64>) -> Vec<LogEvent> {
        {
            let inner = self.inner.read();
            let served_by_ring = inner.degraded.is_some()
                || inner
                    .ring
                    .first_seq()
                    .map(|first| range.start >= first)
                    .unwrap_or(false);
            if served_by_ring {
                return inner.ring.range(range.start, range.end);
            }
        }
        self.iter(range, None).collect()
    }

    /// Up to `size` events ending just before sequence `end`, for paging backwards.
    pub fn history_chunk(&self, end: u64, size: u64) -> Vec<LogEvent> {
        self.history(end.saturating_sub(size)..end)
    }

    /// The last `count` events.
    pub fn latest(&self, count: u64) -> Vec<LogEvent> {
        let end = self.next_seq();
        self.history_chunk(end, count)
    }

    /// Lazily iterates stored events in `range` matching `query`.
    pub fn iter(&self, range: Range<u64>, query: Option<SearchQuery>) -> HistoryIter {
        let inner = self.inner.read();
        let source = if inner.degraded.is_some() {
            HistorySource::Memory(inner.ring.iter().cloned().collect::<Vec<_>>().into_iter())
        } else {
            match File::open(&self.path) {
                Ok(file) => {
                    HistorySource::File(BufReader::new(file.take(inner.committed)).split(b'\n'))
                }
                Err(err) => {
                    debug!(unit = %self.name, error = %err, "history read fell back to memory");
                    HistorySource::Memory(
                        inner.ring.iter().cloned().collect::<Vec<_>>().into_iter(),
                    )
                }
            }
        };
        HistoryIter {
            source,
            range,
            query,
        }
    }

    /// Follows the log starting at `from_seq`: stored events first, then live ones.
    pub fn tail(self: &Arc<Self>, from_seq: u64) -> LogTail {
        let (rx, head) = {
            let inner = self.inner.read();
            (self.live.subscribe(), inner.next_seq)
        };
        LogTail {
            log: self.clone(),
            next: from_seq.max(1),
            head,
            backlog: VecDeque::new(),
            rx,
            query: None,
        }
    }

    pub fn search(self: &Arc<Self>, query: SearchQuery, mode: SearchMode) -> SearchResults {
        match mode {
            SearchMode::History => SearchResults::History(self.iter(0..u64::MAX, Some(query))),
            SearchMode::Live => {
                let mut tail = self.tail(self.next_seq());
                tail.query = Some(query);
                SearchResults::Live(tail)
            }
        }
    }

    /// Discards stored history. Sequence numbers keep counting from where they were.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock();
        let truncated = match &writer.file {
            Some(file) => file.set_len(0),
            None => Ok(()),
        };
        let mut inner = self.inner.write();
        inner.ring.clear();
        inner.first_seq = inner.next_seq;
        inner.count = 0;
        inner.committed = 0;
        if let Err(source) = truncated {
            warn!(unit = %self.name, error = %source, "log truncate failed; history degraded");
            writer.file = None;
            inner.degraded = Some(source.to_string());
            return Err(StoreError::Io {
                unit: self.name.clone(),
                source,
            });
        }
        Ok(())
    }
}

fn write_record(file: &mut File, event: &LogEvent) -> io::Result<u64> {
    let mut record = serde_json::to_vec(event).map_err(io::Error::from)?;
    record.push(b'\n');
    file.write_all(&record)?;
    file.sync_data()?;
    Ok(record.len() as u64)
}

// Scans an existing log, refilling the ring and truncating a torn trailing record.
fn recover(path: &Path, ring: &mut LogBuffer) -> io::Result<Recovered> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(Recovered {
                last_seq: 0,
                first_seq: None,
                committed: 0,
                count: 0,
            })
        }
        Err(err) => return Err(err),
    };
    let total = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut offset = 0u64;
    let mut good_end = 0u64;
    let mut last_seq = 0u64;
    let mut first_seq = None;
    let mut count = 0usize;
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 || line.last() != Some(&b'\n') {
            break;
        }
        offset += n as u64;
        good_end = offset;
        if let Ok(event) = serde_json::from_slice::<LogEvent>(&line) {
            last_seq = last_seq.max(event.seq);
            first_seq.get_or_insert(event.seq);
            count += 1;
            ring.push(event);
        }
    }
    if good_end < total {
        warn!(path = %path.display(), dropped = total - good_end, "discarding torn log record");
        OpenOptions::new().write(true).open(path)?.set_len(good_end)?;
    }
    Ok(Recovered {
        last_seq,
        first_seq,
        committed: good_end,
        count,
    })
}

/// A unit's log file opened for inspection.
///
/// Opening it never recovers or truncates the file, so it can be used while
/// another process is appending. A torn trailing record is skipped, not cut off.
pub struct LogFile {
    unit: String,
    path: PathBuf,
}

impl LogFile {
    pub fn open(dir: &Path, unit: &str) -> Result<Self, StoreError> {
        check_name(unit)?;
        Ok(Self {
            unit: unit.to_string(),
            path: log_path(dir, unit),
        })
    }

    /// Stored events in `range` matching `query`, read from the file as it is now.
    pub fn iter(
        &self,
        range: Range<u64>,
        query: Option<SearchQuery>,
    ) -> Result<HistoryIter, StoreError> {
        let source = match File::open(&self.path) {
            Ok(file) => {
                let len = file.metadata().map_err(|source| self.io(source))?.len();
                HistorySource::File(BufReader::new(file.take(len)).split(b'\n'))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                HistorySource::Memory(Vec::new().into_iter())
            }
            Err(source) => return Err(self.io(source)),
        };
        Ok(HistoryIter {
            source,
            range,
            query,
        })
    }

    /// The last `count` stored events.
    pub fn latest(&self, count: usize) -> Result<Vec<LogEvent>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut last = VecDeque::with_capacity(count);
        for event in self.iter(0..u64::MAX, None)? {
            if last.len() == count {
                last.pop_front();
            }
            last.push_back(event);
        }
        Ok(last.into())
    }

    /// Truncates the file. The owning process keeps numbering from where it was.
    pub fn clear(&self) -> Result<(), StoreError> {
        match OpenOptions::new().write(true).open(&self.path) {
            Ok(file) => file.set_len(0).map_err(|source| self.io(source)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io(source)),
        }
    }

    /// Polls for events with sequence numbers above `after`.
    pub fn follow(&self, after: u64) -> LogFollower {
        LogFollower {
            path: self.path.clone(),
            offset: 0,
            first_seq: None,
            last_seq: after,
        }
    }

    fn io(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            unit: self.unit.clone(),
            source,
        }
    }
}

/// Reads records another process appends to a log file.
///
/// Compaction and `clear` rewrite the file from the start; that is detected by the
/// file shrinking or its first record changing, and the file is rescanned,
/// skipping events already returned.
pub struct LogFollower {
    path: PathBuf,
    offset: u64,
    first_seq: Option<u64>,
    last_seq: u64,
}

impl LogFollower {
    /// Complete events written since the previous poll, in order.
    pub fn poll(&mut self) -> io::Result<Vec<LogEvent>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.offset = 0;
                self.first_seq = None;
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line)?;
        let first_seq = complete_record(&line).map(|event| event.seq);
        if len < self.offset || (self.first_seq.is_some() && first_seq != self.first_seq) {
            self.offset = 0;
        }
        self.first_seq = first_seq;

        reader.seek(SeekFrom::Start(self.offset))?;
        let mut events = Vec::new();
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            if n == 0 || line.last() != Some(&b'\n') {
                break;
            }
            self.offset += n as u64;
            if let Some(event) = complete_record(&line) {
                if event.seq > self.last_seq {
                    self.last_seq = event.seq;
                    events.push(event);
                }
            }
        }
        Ok(events)
    }
}

fn complete_record(line: &[u8]) -> Option<LogEvent> {
    if line.last() != Some(&b'\n') {
        return None;
    }
    serde_json::from_slice(line).ok()
}

/// What to match log text against.
#[derive(Debug, Clone)]
pub enum SearchQuery {
    /// Case-insensitive substring.
    Substring(String),
    /// Regular expression over the decoded text.
    Pattern(Regex),
}

impl SearchQuery {
    pub fn substring(query: &str) -> Self {
        SearchQuery::Substring(query.to_lowercase())
    }

    pub fn pattern(pattern: &str) -> Result<Self, StoreError> {
        Ok(SearchQuery::Pattern(RegexBuilder::new(pattern).build()?))
    }

    pub fn matches(&self, event: &LogEvent) -> bool {
        let text = event.text();
        match self {
            SearchQuery::Substring(needle) => text.to_lowercase().contains(needle),
            SearchQuery::Pattern(regex) => regex.is_match(&text),
        }
    }
}

/// Whether a search scans stored history or filters new events as they arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Live,
    History,
}

pub enum SearchResults {
    History(HistoryIter),
    Live(LogTail),
}

enum HistorySource {
    File(io::Split<BufReader<io::Take<File>>>),
    Memory(std::vec::IntoIter<LogEvent>),
}

/// Lazy, ordered iterator over stored events.
pub struct HistoryIter {
    source: HistorySource,
    range: Range<u64>,
    query: Option<SearchQuery>,
}

impl Iterator for HistoryIter {
    type Item = LogEvent;

    fn next(&mut self) -> Option<LogEvent> {
        loop {
            let event = match &mut self.source {
                HistorySource::File(lines) => match lines.next()? {
                    Ok(bytes) => match serde_json::from_slice::<LogEvent>(&bytes) {
                        Ok(event) => event,
                        Err(_) => continue,
                    },
                    Err(_) => return None,
                },
                HistorySource::Memory(events) => events.next()?,
            };
            if event.seq >= self.range.end {
                return None;
            }
            if event.seq < self.range.start {
                continue;
            }
            if let Some(query) = &self.query {
                if !query.matches(&event) {
                    continue;
                }
            }
            return Some(event);
        }
    }
}

/// Live follower of one unit's log.
///
/// Yields every retained event from its starting sequence onwards, in order and
/// without gaps, then waits for new ones. Falling behind the live channel is
/// recovered by re-reading the missed range from storage.
pub struct LogTail {
    log: Arc<UnitLog>,
    next: u64,
    head: u64,
    backlog: VecDeque<LogEvent>,
    rx: broadcast::Receiver<LogEvent>,
    query: Option<SearchQuery>,
}

impl LogTail {
    /// Sequence number of the next event this tail will consider.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Waits for the next event. Returns `None` once the log is dropped.
    pub async fn next(&mut self) -> Option<LogEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.seq < self.next {
                    continue;
                }
                self.next = event.seq + 1;
                if self.accepts(&event) {
                    return Some(event);
                }
                continue;
            }
            if self.next < self.head {
                self.refill();
                continue;
            }
            match self.rx.recv().await {
                Ok(event) => {
                    if event.seq < self.next {
                        continue;
                    }
                    if event.seq > self.next {
                        self.head = event.seq;
                        self.refill();
                        self.backlog.push_back(event);
                        continue;
                    }
                    self.next = event.seq + 1;
                    if self.accepts(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(unit = %self.log.name, missed, "live tail lagged; catching up from storage");
                    self.head = self.log.next_seq();
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn accepts(&self, event: &LogEvent) -> bool {
        self.query.as_ref().map(|q| q.matches(event)).unwrap_or(true)
    }

    fn refill(&mut self) {
        let start = self.next.max(self.log.first_seq());
        if start >= self.head {
            self.next = self.head;
            return;
        }
        let end = self.head.min(start + REFILL_BATCH);
        let batch = self.log.history(start..end);
        if batch.is_empty() {
            self.next = end;
        } else {
            self.backlog.extend(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::output::Segment;

    fn line(text: &str) -> DecodedLine {
        DecodedLine {
            segments: vec![Segment::plain(text)],
            raw_len: text.len() + 1,
        }
    }

    fn store(dir: &Path, max_bytes: u64, max_lines: usize) -> LogStore {
        LogStore::open(StoreSettings {
            dir: dir.to_path_buf(),
            max_bytes,
            max_lines,
        })
        .unwrap()
    }

    fn seqs(events: &[LogEvent]) -> Vec<u64> {
        events.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn sequences_start_at_one_and_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store(dir.path(), u64::MAX, 100);
            assert_eq!(store.append("bot", StreamKind::Stdout, line("a")).unwrap().seq, 1);
            assert_eq!(store.append("bot", StreamKind::Stderr, line("b")).unwrap().seq, 2);
        }
        let store = store(dir.path(), u64::MAX, 100);
        assert_eq!(store.append("bot", StreamKind::Stdout, line("c")).unwrap().seq, 3);
        let history = store.history("bot", 0..u64::MAX).unwrap();
        assert_eq!(seqs(&history), vec![1, 2, 3]);
        assert_eq!(history[1].stream, StreamKind::Stderr);
        assert_eq!(store.unit("bot").unwrap().line_count(), 3);
    }

    #[test]
    fn torn_trailing_record_is_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store(dir.path(), u64::MAX, 100);
            store.append("bot", StreamKind::Stdout, line("whole")).unwrap();
        }
        let path = dir.path().join("bot.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"unit\":\"bot\",\"seq\":2,\"ti").unwrap();
        drop(file);

        let store = store(dir.path(), u64::MAX, 100);
        assert_eq!(store.append("bot", StreamKind::Stdout, line("next")).unwrap().seq, 2);
        let texts: Vec<String> = store
            .history("bot", 0..u64::MAX)
            .unwrap()
            .iter()
            .map(|e| e.text())
            .collect();
        assert_eq!(texts, vec!["whole", "next"]);
    }

    #[test]
    fn oversized_log_evicts_oldest_events_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 2048, 4);
        for i in 0..100 {
            store.append("bot", StreamKind::Stdout, line(&format!("line {i:03}"))).unwrap();
        }
        let size = fs::metadata(dir.path().join("bot.jsonl")).unwrap().len();
        assert!(size <= 2048);
        let log = store.unit("bot").unwrap();
        let history = log.iter(0..u64::MAX, None).collect::<Vec<_>>();
        assert!(!history.is_empty());
        assert_eq!(history.last().unwrap().seq, 100);
        assert_eq!(history[0].seq, log.first_seq());
        let expected: Vec<u64> = (log.first_seq()..=100).collect();
        assert_eq!(seqs(&history), expected);
        assert_eq!(log.line_count(), history.len());
    }

    #[test]
    fn history_pages_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), u64::MAX, 3);
        for i in 0..10 {
            store.append("bot", StreamKind::Stdout, line(&i.to_string())).unwrap();
        }
        let log = store.unit("bot").unwrap();
        assert_eq!(seqs(&log.history_chunk(11, 3)), vec![8, 9, 10]);
        assert_eq!(seqs(&log.history_chunk(8, 3)), vec![5, 6, 7]);
        assert_eq!(seqs(&log.history_chunk(2, 5)), vec![1]);
        assert_eq!(seqs(&log.latest(2)), vec![9, 10]);
    }

    #[test]
    fn search_history_by_substring_and_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), u64::MAX, 100);
        store.append("bot", StreamKind::Stdout, line("connected to server")).unwrap();
        store.append("bot", StreamKind::Stderr, line("ERROR: timeout")).unwrap();
        store.append("bot", StreamKind::Stdout, line("retry 3")).unwrap();

        let SearchResults::History(found) =
            store.search("bot", SearchQuery::substring("error"), SearchMode::History).unwrap()
        else {
            panic!("expected history results");
        };
        assert_eq!(seqs(&found.collect::<Vec<_>>()), vec![2]);

        let query = SearchQuery::pattern(r"retry \d+").unwrap();
        let SearchResults::History(found) =
            store.search("bot", query, SearchMode::History).unwrap()
        else {
            panic!("expected history results");
        };
        assert_eq!(seqs(&found.collect::<Vec<_>>()), vec![3]);

        assert!(SearchQuery::pattern("(").is_err());
    }

    #[test]
    fn clear_keeps_sequence_counting() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), u64::MAX, 100);
        store.append("bot", StreamKind::Stdout, line("old")).unwrap();
        let log = store.unit("bot").unwrap();
        log.clear().unwrap();
        assert_eq!(log.line_count(), 0);
        assert!(log.history(0..u64::MAX).is_empty());
        assert_eq!(log.append(StreamKind::Stdout, line("new")).seq, 2);
        assert_eq!(seqs(&log.history(0..u64::MAX)), vec![2]);
    }

    #[tokio::test]
    async fn tail_replays_history_then_follows_live() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(dir.path(), u64::MAX, 100));
        store.append("bot", StreamKind::Stdout, line("one")).unwrap();
        store.append("bot", StreamKind::Stdout, line("two")).unwrap();
        let mut tail = store.tail("bot", 1).unwrap();

        let writer = store.clone();
        let producer = tokio::spawn(async move {
            for i in 0..50 {
                writer.append("bot", StreamKind::Stdout, line(&format!("live {i}"))).unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut seen = Vec::new();
        while seen.len() < 52 {
            let event = tail.next().await.unwrap();
            seen.push(event.seq);
        }
        producer.await.unwrap();
        let expected: Vec<u64> = (1..=52).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn lagging_tail_catches_up_without_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), u64::MAX, 10);
        let mut tail = store.tail("bot", 1).unwrap();
        for i in 0..(LIVE_CAPACITY + 200) {
            store.append("bot", StreamKind::Stdout, line(&i.to_string())).unwrap();
        }
        for expected in 1..=(LIVE_CAPACITY as u64 + 200) {
            assert_eq!(tail.next().await.unwrap().seq, expected);
        }
    }

    #[tokio::test]
    async fn live_search_filters_new_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), u64::MAX, 100);
        store.append("bot", StreamKind::Stdout, line("error before subscribing")).unwrap();
        let SearchResults::Live(mut tail) =
            store.search("bot", SearchQuery::substring("ERROR"), SearchMode::Live).unwrap()
        else {
            panic!("expected live results");
        };
        store.append("bot", StreamKind::Stdout, line("fine")).unwrap();
        store.append("bot", StreamKind::Stderr, line("Error: boom")).unwrap();
        let hit = tail.next().await.unwrap();
        assert_eq!(hit.seq, 3);
        assert_eq!(hit.text(), "Error: boom");
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_directory_degrades_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), u64::MAX, 100);
        // A directory where the log file should be makes every open fail.
        fs::create_dir(dir.path().join("bot.jsonl")).unwrap();
        let log = store.unit("bot").unwrap();
        assert!(log.degraded().is_some());
        log.append(StreamKind::Stdout, line("kept in memory"));
        assert_eq!(log.line_count(), 1);
        assert_eq!(log.history(0..u64::MAX)[0].text(), "kept in memory");
    }

    #[test]
    fn unsafe_unit_names_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let store = store(&logs, u64::MAX, 10);
        let err = store.unit("../escaped").unwrap_err();
        assert!(matches!(err, StoreError::InvalidName { .. }));
        assert!(store.append("..", StreamKind::Stdout, line("x")).is_err());
        assert!(!dir.path().join("escaped.jsonl").exists());
        assert!(LogFile::open(&logs, "a/b").is_err());
    }

    #[test]
    fn readers_do_not_wait_for_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), u64::MAX, 10);
        let log = store.unit("bot").unwrap();
        log.append(StreamKind::Stdout, line("one"));

        let _appending = log.writer.lock();
        assert_eq!(log.next_seq(), 2);
        assert_eq!(log.first_seq(), 1);
        assert!(log.degraded().is_none());
        assert_eq!(log.line_count(), 1);
        assert_eq!(seqs(&log.history(0..u64::MAX)), vec![1]);
        assert_eq!(log.iter(0..u64::MAX, None).count(), 1);
    }

    #[test]
    fn log_file_reads_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store(dir.path(), u64::MAX, 10);
            for text in ["a", "b", "c"] {
                store.append("bot", StreamKind::Stdout, line(text)).unwrap();
            }
        }
        let path = dir.path().join("bot.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"unit\":\"bot\",\"seq\":4").unwrap();
        drop(file);
        let before = fs::metadata(&path).unwrap().len();

        let view = LogFile::open(dir.path(), "bot").unwrap();
        let all = view.iter(0..u64::MAX, None).unwrap().collect::<Vec<_>>();
        assert_eq!(seqs(&all), vec![1, 2, 3]);
        assert_eq!(seqs(&view.latest(2).unwrap()), vec![2, 3]);
        let hits = view
            .iter(0..u64::MAX, Some(SearchQuery::substring("B")))
            .unwrap()
            .collect::<Vec<_>>();
        assert_eq!(seqs(&hits), vec![2]);
        assert_eq!(fs::metadata(&path).unwrap().len(), before);

        let missing = LogFile::open(dir.path(), "nobody").unwrap();
        assert_eq!(missing.iter(0..u64::MAX, None).unwrap().count(), 0);
    }

    #[test]
    fn follower_sees_appends_from_the_owning_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), u64::MAX, 10);
        let log = store.unit("bot").unwrap();
        log.append(StreamKind::Stdout, line("old"));

        let view = LogFile::open(dir.path(), "bot").unwrap();
        let mut follower = view.follow(1);
        assert!(follower.poll().unwrap().is_empty());
        log.append(StreamKind::Stdout, line("new 1"));
        log.append(StreamKind::Stderr, line("new 2"));
        assert_eq!(seqs(&follower.poll().unwrap()), vec![2, 3]);
        assert!(follower.poll().unwrap().is_empty());

        log.clear().unwrap();
        log.append(StreamKind::Stdout, line("after clear"));
        let events = follower.poll().unwrap();
        assert_eq!(seqs(&events), vec![4]);
        assert_eq!(events[0].text(), "after clear");
    }

    #[test]
    fn follower_survives_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 2048, 4);
        let log = store.unit("bot").unwrap();
        let view = LogFile::open(dir.path(), "bot").unwrap();
        let mut follower = view.follow(0);

        let mut seen = Vec::new();
        for i in 0..100 {
            log.append(StreamKind::Stdout, line(&format!("line {i:03}")));
            if i % 7 == 0 {
                seen.extend(seqs(&follower.poll().unwrap()));
            }
        }
        seen.extend(seqs(&follower.poll().unwrap()));
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(seen.last(), Some(&100));
    }
}
