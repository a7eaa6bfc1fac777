//! Capture reader: replays one or more capture files as a single stream in
//! timestamp order, sleeping between records to reproduce the original
//! timing.
//!
//! Each matched file gets a cursor with a small read-ahead heap. Every pull
//! tops the heaps up to `read_depth`, then emits the smallest head across all
//! cursors. Equal timestamps go to the earlier file, then the earlier record
//! within that file.

use crate::config::FileInputConfig;
use crate::error::{Error, Result};
use crate::plugin::{Close, RecordSource};
use crate::protocol::{FrameReader, Header, Kind, Message};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use flate2::read::MultiGzDecoder;
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Counters describing what has been read so far. In dry-run mode
/// `expected_duration` is how long a real replay would have taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: u64,
    pub requests: u64,
    pub responses: u64,
    pub replayed_responses: u64,
    pub malformed: u64,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    pub expected_duration: Duration,
    pub loops: u64,
}

impl ReplayStats {
    fn observe(&mut self, header: Option<&Header>, timestamp: i64) {
        self.records += 1;
        match header.and_then(|h| h.kind) {
            Some(Kind::Request) => self.requests += 1,
            Some(Kind::Response) => self.responses += 1,
            Some(Kind::ReplayedResponse) => self.replayed_responses += 1,
            None => {}
        }
        if header.is_none() {
            self.malformed += 1;
        }
        self.first_timestamp.get_or_insert(timestamp);
        self.last_timestamp = Some(timestamp);
    }
}

struct Pending {
    timestamp: i64,
    seq: u64,
    header: Option<Header>,
    msg: Message,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.timestamp, self.seq).cmp(&(other.timestamp, other.seq))
    }
}

struct FileCursor {
    path: PathBuf,
    frames: FrameReader<Box<dyn Read + Send>>,
    queue: BinaryHeap<Reverse<Pending>>,
    seq: u64,
    last_timestamp: i64,
    exhausted: bool,
}

impl FileCursor {
    fn open(path: PathBuf) -> Result<Self> {
        let frames = FrameReader::new(open_capture(&path)?);
        Ok(Self { path, frames, queue: BinaryHeap::new(), seq: 0, last_timestamp: 0, exhausted: false })
    }

    fn reset(&mut self) -> Result<()> {
        self.frames = FrameReader::new(open_capture(&self.path)?);
        self.queue.clear();
        self.seq = 0;
        self.last_timestamp = 0;
        self.exhausted = false;
        Ok(())
    }

    /// Decode records until the read-ahead heap holds `depth` entries.
    fn fill(&mut self, depth: usize) {
        while !self.exhausted && self.queue.len() < depth {
            match self.frames.next_frame() {
                Ok(Some(frame)) => {
                    let msg = Message::from_frame(&frame);
                    let header = Header::parse(&msg.meta);
                    // malformed or unparsable headers keep the file's last timestamp
                    let timestamp = header.as_ref().and_then(|h| h.timestamp).unwrap_or(self.last_timestamp);
                    self.last_timestamp = timestamp;
                    self.queue.push(Reverse(Pending { timestamp, seq: self.seq, header, msg }));
                    self.seq += 1;
                }
                Ok(None) => self.exhausted = true,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "corrupted capture data, truncating file");
                    self.exhausted = true;
                }
            }
        }
    }

    fn peek_timestamp(&self) -> Option<i64> {
        self.queue.peek().map(|Reverse(p)| p.timestamp)
    }
}

fn open_capture(path: &Path) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path).map_err(|source| Error::Open { path: path.to_path_buf(), source })?;
    if is_gzip(path) {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

pub(crate) fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

struct ReaderState {
    cursors: Vec<FileCursor>,
    last_timestamp: Option<i64>,
    emitted_this_pass: u64,
}

pub struct FileInput {
    pattern: String,
    config: FileInputConfig,
    state: Mutex<ReaderState>,
    stats: Mutex<ReplayStats>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl FileInput {
    /// Resolve `pattern` once and open every matching file.
    pub fn new(pattern: &str, config: FileInputConfig) -> Result<Self> {
        let paths = resolve_pattern(pattern)?;
        let cursors = paths.into_iter().map(FileCursor::open).collect::<Result<Vec<_>>>()?;
        debug!(pattern, files = cursors.len(), "opened capture files");
        let (stop_tx, stop_rx) = bounded(0);
        Ok(Self {
            pattern: pattern.to_string(),
            config,
            state: Mutex::new(ReaderState { cursors, last_timestamp: None, emitted_this_pass: 0 }),
            stats: Mutex::new(ReplayStats::default()),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        })
    }

    /// Files being replayed, in resolution order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.state.lock().cursors.iter().map(|c| c.path.clone()).collect()
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats.lock().clone()
    }

    fn stopped(&self) -> bool {
        matches!(self.stop_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for the gap between the previous record and this one.
    fn pace(&self, st: &mut ReaderState, timestamp: i64) -> Result<()> {
        let Some(prev) = st.last_timestamp.replace(timestamp) else { return Ok(()) };
        let mut wait = Duration::from_nanos(timestamp.saturating_sub(prev).max(0) as u64);
        if !self.config.max_wait.is_zero() && wait > self.config.max_wait {
            wait = self.config.max_wait;
        }
        self.stats.lock().expected_duration += wait;
        if self.config.dry_run || wait.is_zero() {
            return Ok(());
        }
        match self.stop_rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(Error::Stopped),
        }
    }

    fn finish(&self) -> Error {
        let stats = self.stats();
        if self.config.dry_run {
            info!(
                pattern = %self.pattern,
                records = stats.records,
                requests = stats.requests,
                responses = stats.responses,
                expected = ?stats.expected_duration,
                "dry run finished"
            );
        } else {
            debug!(pattern = %self.pattern, records = stats.records, "capture files exhausted");
        }
        Error::EndOfStream
    }
}

impl RecordSource for FileInput {
    fn pull(&self) -> Result<Message> {
        if self.stopped() {
            return Err(Error::Stopped);
        }
        let depth = self.config.read_depth.max(1);
        let mut st = self.state.lock();
        loop {
            for c in st.cursors.iter_mut() {
                c.fill(depth);
            }
            let mut next: Option<(usize, i64)> = None;
            for (i, c) in st.cursors.iter().enumerate() {
                if let Some(ts) = c.peek_timestamp() {
                    if next.is_none_or(|(_, best)| ts < best) {
                        next = Some((i, ts));
                    }
                }
            }
            let Some((i, _)) = next else {
                if !self.config.loop_input {
                    return Err(self.finish());
                }
                if st.emitted_this_pass == 0 {
                    warn!(pattern = %self.pattern, "nothing to replay, not looping over empty capture files");
                    return Err(self.finish());
                }
                for c in st.cursors.iter_mut() {
                    c.reset()?;
                }
                st.emitted_this_pass = 0;
                self.stats.lock().loops += 1;
                continue;
            };
            let Some(Reverse(rec)) = st.cursors[i].queue.pop() else { continue };
            self.pace(&mut st, rec.timestamp)?;
            st.emitted_this_pass += 1;
            self.stats.lock().observe(rec.header.as_ref(), rec.timestamp);
            return Ok(rec.msg);
        }
    }

    fn name(&self) -> String {
        format!("file input {}", self.pattern)
    }
}

impl Close for FileInput {
    fn close(&self) {
        self.stop_tx.lock().take();
    }
}

/// Expand a glob into the files it matches, in natural order.
pub fn resolve_pattern(pattern: &str) -> Result<Vec<PathBuf>> {
    let entries = glob::glob(pattern)
        .map_err(|e| Error::Pattern { pattern: pattern.to_string(), message: e.to_string() })?;
    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok(p) if p.is_file() => paths.push(p),
            Ok(_) => {}
            Err(e) => {
                let path = e.path().to_path_buf();
                return Err(Error::Open { path, source: e.into() });
            }
        }
    }
    if paths.is_empty() {
        return Err(Error::NoMatches(pattern.to_string()));
    }
    paths.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
    Ok(paths)
}

/// Compare strings treating runs of digits as numbers, so `x_2` < `x_10`.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let da = a.iter().take_while(|c| c.is_ascii_digit()).count();
                let db = b.iter().take_while(|c| c.is_ascii_digit()).count();
                let na = trim_zeros(&a[..da]);
                let nb = trim_zeros(&b[..db]);
                let ord = na.len().cmp(&nb.len()).then_with(|| na.cmp(nb)).then_with(|| da.cmp(&db));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[da..];
                b = &b[db..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let start = digits.iter().position(|&d| d != b'0').unwrap_or(digits.len());
    &digits[start..]
}
