//! Capture writer.
//!
//! Records are queued to a dedicated writer thread which owns the file
//! handle, so each record lands on disk as one contiguous unit. Output is
//! split into shards named `<stem>_<n><ext>` (`requests.gor` becomes
//! `requests_0.gor`, `requests_1.gor`, ...), which a reader can recover with
//! the glob `requests_*`. A `.gz` suffix enables gzip.

use crate::config::FileOutputConfig;
use crate::error::{Error, Result};
use crate::input_file::is_gzip;
use crate::plugin::{Close, RecordSink};
use crate::protocol::{Message, PAYLOAD_SEPARATOR};
use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

const WRITE_BUFFER: usize = 1 << 20; // 1 MiB

/// What the writer has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Every shard opened by this writer, in order.
    pub shards: Vec<PathBuf>,
    pub bytes_written: u64,
    pub records_written: u64,
    pub records_dropped: u64,
}

enum Out {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Out {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Out::Plain(w) => w as &mut dyn Write,
            Out::Gzip(w) => w,
        }
    }

    fn finish(self) -> io::Result<()> {
        let mut inner = match self {
            Out::Plain(w) => w,
            Out::Gzip(w) => w.finish()?,
        };
        inner.flush()?;
        inner.get_ref().sync_data()
    }
}

struct ShardWriter {
    base: PathBuf,
    index: usize,
    out: Option<Out>,
    shard_bytes: u64,
    config: FileOutputConfig,
}

impl ShardWriter {
    fn open(base: PathBuf, config: FileOutputConfig) -> Result<Self> {
        let index = if config.append {
            last_shard_index(&base).unwrap_or(0)
        } else {
            remove_later_shards(&base)?;
            0
        };
        let mut w = Self { base, index, out: None, shard_bytes: 0, config };
        w.open_shard()?;
        Ok(w)
    }

    fn path(&self) -> PathBuf {
        shard_path(&self.base, self.index)
    }

    fn open_shard(&mut self) -> Result<()> {
        let path = self.path();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.config.append)
            .truncate(!self.config.append)
            .open(&path)
            .map_err(|source| Error::Open { path: path.clone(), source })?;
        self.shard_bytes = if self.config.append { file.metadata().map(|m| m.len()).unwrap_or(0) } else { 0 };
        let buf = BufWriter::with_capacity(WRITE_BUFFER, file);
        self.out = Some(if is_gzip(&path) { Out::Gzip(GzEncoder::new(buf, Compression::default())) } else { Out::Plain(buf) });
        debug!(path = %path.display(), "opened capture shard");
        Ok(())
    }

    fn rotate(&mut self) -> Result<PathBuf> {
        if let Some(out) = self.out.take() {
            out.finish()?;
        }
        self.index += 1;
        self.open_shard()?;
        Ok(self.path())
    }

    /// Append one record, rotating first if it would overflow the shard.
    /// Returns the new shard's path when the write rotated.
    fn write(&mut self, msg: &Message) -> Result<Option<PathBuf>> {
        let len = msg.encoded_len() as u64;
        let mut rotated = None;
        if self.shard_bytes > 0 && self.shard_bytes + len > self.config.size_limit {
            rotated = Some(self.rotate()?);
        }
        let Some(out) = self.out.as_mut() else { return Err(Error::SinkClosed) };
        let w = out.writer();
        w.write_all(&msg.meta)?;
        w.write_all(&msg.data)?;
        w.write_all(PAYLOAD_SEPARATOR)?;
        self.shard_bytes += len;
        Ok(rotated)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.out.as_mut() {
            Some(out) => out.writer().flush(),
            None => Ok(()),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        match self.out.take() {
            Some(out) => out.finish(),
            None => Ok(()),
        }
    }
}

/// State shared between `push` callers and the writer thread.
#[derive(Default)]
struct Shared {
    stats: WriterStats,
    /// Bytes accepted for writing, checked against the cumulative cap.
    accepted_bytes: u64,
    cap_reported: bool,
    /// First write failure; once set every later push fails with it.
    failure: Option<io::Error>,
}

impl Shared {
    fn fail(&mut self, err: &Error) {
        if self.failure.is_some() {
            return;
        }
        let kind = match err {
            Error::Io(e) | Error::Open { source: e, .. } => e.kind(),
            _ => io::ErrorKind::Other,
        };
        self.failure = Some(io::Error::new(kind, err.to_string()));
    }
}

pub struct FileOutput {
    base: PathBuf,
    max_size: u64,
    tx: RwLock<Option<Sender<Message>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Mutex<Shared>>,
}

impl FileOutput {
    /// Open the first shard for `path` and start the writer thread.
    ///
    /// `%Y %m %d %H %M %S` in the path are replaced with the current UTC time.
    /// Without `append`, shards left by an earlier capture under the same
    /// name are removed.
    pub fn new(path: impl AsRef<Path>, config: FileOutputConfig) -> Result<Self> {
        let base = expand_placeholders(path.as_ref(), OffsetDateTime::now_utc());
        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| Error::Open { path: parent.to_path_buf(), source })?;
            }
        }
        let flush_interval = config.flush_interval;
        let max_size = config.max_size;
        let (tx, rx) = bounded::<Message>(config.queue_limit.max(1));
        let writer = ShardWriter::open(base.clone(), config)?;
        let shared = Arc::new(Mutex::new(Shared {
            stats: WriterStats { shards: vec![writer.path()], ..Default::default() },
            ..Default::default()
        }));
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("file-output".into())
            .spawn(move || writer_thread(writer, rx, flush_interval, thread_shared))?;
        Ok(Self { base, max_size, tx: RwLock::new(Some(tx)), handle: Mutex::new(Some(handle)), shared })
    }

    pub fn stats(&self) -> WriterStats {
        self.shared.lock().stats.clone()
    }
}

fn writer_thread(mut w: ShardWriter, rx: Receiver<Message>, flush_interval: std::time::Duration, shared: Arc<Mutex<Shared>>) {
    let ticker = if flush_interval.is_zero() { never() } else { tick(flush_interval) };
    let mut failed = false;
    loop {
        select! {
            recv(rx) -> msg => {
                let Ok(msg) = msg else { break };
                if failed {
                    shared.lock().stats.records_dropped += 1;
                } else {
                    let res = w.write(&msg).and_then(|rotated| {
                        if flush_interval.is_zero() {
                            w.flush()?;
                        }
                        Ok(rotated)
                    });
                    let mut s = shared.lock();
                    match res {
                        Ok(rotated) => {
                            if let Some(path) = rotated {
                                info!(path = %path.display(), "rotated capture file");
                                s.stats.shards.push(path);
                            }
                            s.stats.bytes_written += msg.encoded_len() as u64;
                            s.stats.records_written += 1;
                        }
                        Err(e) => {
                            error!(base = %w.base.display(), error = %e, "capture write failed, rejecting further records");
                            s.stats.records_dropped += 1;
                            s.fail(&e);
                            failed = true;
                        }
                    }
                }
            }
            recv(ticker) -> _ => {
                if !failed {
                    if let Err(e) = w.flush() {
                        error!(base = %w.base.display(), error = %e, "periodic flush failed");
                        shared.lock().fail(&Error::Io(e));
                        failed = true;
                    }
                }
            }
        }
    }
    if let Err(e) = w.finish() {
        error!(base = %w.base.display(), error = %e, "failed to finalize capture file");
    }
}

impl RecordSink for FileOutput {
    /// Queue one record for the writer thread.
    ///
    /// Returns `Ok(0)` once the cumulative size cap is reached, and the
    /// writer's I/O error once a write or rotation has failed.
    fn push(&self, msg: &Message) -> Result<usize> {
        let guard = self.tx.read();
        let Some(tx) = guard.as_ref() else { return Err(Error::SinkClosed) };
        let len = msg.encoded_len();
        {
            let mut s = self.shared.lock();
            if let Some(e) = &s.failure {
                return Err(Error::Io(io::Error::new(e.kind(), e.to_string())));
            }
            if s.accepted_bytes >= self.max_size {
                if !s.cap_reported {
                    warn!(base = %self.base.display(), max_size = self.max_size, "output size cap reached, dropping records");
                    s.cap_reported = true;
                }
                s.stats.records_dropped += 1;
                return Ok(0);
            }
            s.accepted_bytes += len as u64;
        }
        tx.send(msg.clone()).map_err(|_| Error::SinkClosed)?;
        Ok(len)
    }

    fn name(&self) -> String {
        format!("file output {}", self.base.display())
    }
}

impl Close for FileOutput {
    /// Drain queued records, flush, and close the active shard.
    fn close(&self) {
        self.tx.write().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!(base = %self.base.display(), "file output thread panicked");
            }
        }
    }
}

impl Drop for FileOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Name of shard `index` for `base`: the index goes before the first `.` of
/// the file name.
pub fn shard_path(base: &Path, index: usize) -> PathBuf {
    let (stem, ext) = split_name(base);
    base.with_file_name(format!("{stem}_{index}{ext}"))
}

fn split_name(base: &Path) -> (String, String) {
    let name = base.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    match name.char_indices().skip(1).find(|&(_, c)| c == '.') {
        Some((i, _)) => (name[..i].to_string(), name[i..].to_string()),
        None => (name, String::new()),
    }
}

/// Shards of `base` already on disk, with their indexes.
fn existing_shards(base: &Path) -> Vec<(usize, PathBuf)> {
    let (stem, ext) = split_name(base);
    let prefix = format!("{stem}_");
    let dir = match base.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Ok(entries) = fs::read_dir(dir) else { return Vec::new() };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            let middle = name.strip_prefix(&prefix)?.strip_suffix(ext.as_str())?;
            if middle.is_empty() || !middle.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Some((middle.parse().ok()?, e.path()))
        })
        .collect()
}

/// Highest shard index already on disk for `base`.
fn last_shard_index(base: &Path) -> Option<usize> {
    existing_shards(base).into_iter().map(|(index, _)| index).max()
}

/// Delete shards 1.. of an earlier capture so a glob over the shard names
/// only finds the new one. Shard 0 is truncated when reopened.
fn remove_later_shards(base: &Path) -> Result<()> {
    for (index, path) in existing_shards(base) {
        if index > 0 {
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "removed shard of earlier capture");
        }
    }
    Ok(())
}

fn expand_placeholders(path: &Path, now: OffsetDateTime) -> PathBuf {
    let s = path.to_string_lossy();
    if !s.contains('%') {
        return path.to_path_buf();
    }
    let s = s
        .replace("%Y", &format!("{:04}", now.year()))
        .replace("%m", &format!("{:02}", u8::from(now.month())))
        .replace("%d", &format!("{:02}", now.day()))
        .replace("%H", &format!("{:02}", now.hour()))
        .replace("%M", &format!("{:02}", now.minute()))
        .replace("%S", &format!("{:02}", now.second()));
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_file::FileInput;
    use crate::config::FileInputConfig;
    use crate::plugin::RecordSource;
    use crate::protocol::{encode_header, Kind};
    use std::time::Duration;

    fn record(ts: i64, body: &[u8]) -> Message {
        Message::new(encode_header(Kind::Request, b"0123456789abcdef01234567", ts, -1), body.to_vec())
    }

    #[test]
    fn shard_names() {
        assert_eq!(shard_path(Path::new("/tmp/requests.gor"), 0), PathBuf::from("/tmp/requests_0.gor"));
        assert_eq!(shard_path(Path::new("/tmp/requests.gor.gz"), 3), PathBuf::from("/tmp/requests_3.gor.gz"));
        assert_eq!(shard_path(Path::new("out"), 1), PathBuf::from("out_1"));
    }

    #[test]
    fn placeholders_use_utc_time() {
        let now = time::macros::datetime!(2024-03-05 07:08:09 UTC);
        assert_eq!(expand_placeholders(Path::new("/c/%Y-%m-%d_%H%M%S.gor"), now), PathBuf::from("/c/2024-03-05_070809.gor"));
        assert_eq!(expand_placeholders(Path::new("/c/plain.gor"), now), PathBuf::from("/c/plain.gor"));
    }

    #[test]
    fn writes_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let out = FileOutput::new(dir.path().join("cap.gor"), FileOutputConfig::default()).unwrap();
        for ts in 1..=3 {
            out.push(&record(ts, format!("body{ts}").as_bytes())).unwrap();
        }
        out.close();
        assert!(matches!(out.push(&record(4, b"late")), Err(Error::SinkClosed)));
        let stats = out.stats();
        assert_eq!(stats.records_written, 3);
        assert_eq!(stats.shards, vec![dir.path().join("cap_0.gor")]);

        let pattern = dir.path().join("cap_*").to_string_lossy().into_owned();
        let input = FileInput::new(&pattern, FileInputConfig::default()).unwrap();
        for ts in 1..=3 {
            assert_eq!(input.pull().unwrap().data, format!("body{ts}").into_bytes());
        }
        assert!(matches!(input.pull(), Err(Error::EndOfStream)));
    }

    #[test]
    fn rotates_when_shard_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileOutputConfig { size_limit: 200, ..Default::default() };
        let out = FileOutput::new(dir.path().join("rot.gor"), config).unwrap();
        for ts in 0..10 {
            out.push(&record(ts, &[b'x'; 40])).unwrap();
        }
        out.close();
        let stats = out.stats();
        assert!(stats.shards.len() >= 4, "{stats:?}");
        for shard in &stats.shards {
            assert!(fs::metadata(shard).unwrap().len() <= 200);
        }
    }

    #[test]
    fn drops_records_past_total_cap() {
        let dir = tempfile::tempdir().unwrap();
        let one = record(0, b"payload").encoded_len() as u64;
        let config = FileOutputConfig { max_size: one * 2, ..Default::default() };
        let out = FileOutput::new(dir.path().join("cap.gor"), config).unwrap();
        let accepted: Vec<usize> = (0..5).map(|ts| out.push(&record(ts, b"payload")).unwrap()).collect();
        assert_eq!(accepted, vec![one as usize, one as usize, 0, 0, 0]);
        out.close();
        let stats = out.stats();
        assert_eq!(stats.records_written, 2);
        assert_eq!(stats.records_dropped, 3);
        assert_eq!(fs::metadata(&stats.shards[0]).unwrap().len(), one * 2);
    }

    #[test]
    fn failed_rotation_fails_later_pushes() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        let config = FileOutputConfig { size_limit: 100, ..Default::default() };
        let out = FileOutput::new(sub.join("c.gor"), config).unwrap();
        fs::remove_dir_all(&sub).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut failure = None;
        while failure.is_none() && std::time::Instant::now() < deadline {
            match out.push(&record(1, &[b'x'; 40])) {
                Ok(n) => {
                    assert!(n > 0);
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => failure = Some(e),
            }
        }
        assert!(matches!(failure, Some(Error::Io(_))), "{failure:?}");
        assert!(matches!(out.push(&record(2, b"again")), Err(Error::Io(_))));
        out.close();
        let stats = out.stats();
        assert_eq!(stats.records_written, 1);
        assert!(stats.records_dropped >= 1);
    }

    #[test]
    fn truncate_removes_shards_of_earlier_capture() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileOutputConfig { size_limit: 100, ..Default::default() };
        let first = FileOutput::new(dir.path().join("cap.gor"), config.clone()).unwrap();
        for ts in 0..6 {
            first.push(&record(ts, &[b'x'; 40])).unwrap();
        }
        first.close();
        assert_eq!(first.stats().shards.len(), 6);

        let second = FileOutput::new(dir.path().join("cap.gor"), config).unwrap();
        second.push(&record(99, b"fresh")).unwrap();
        second.close();

        let pattern = dir.path().join("cap_*").to_string_lossy().into_owned();
        let input = FileInput::new(&pattern, FileInputConfig::default()).unwrap();
        assert_eq!(input.paths(), vec![dir.path().join("cap_0.gor")]);
        assert_eq!(input.pull().unwrap().data, b"fresh");
        assert!(matches!(input.pull(), Err(Error::EndOfStream)));
    }

    #[test]
    fn periodic_flush_makes_data_visible() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileOutputConfig { flush_interval: Duration::from_millis(20), ..Default::default() };
        let out = FileOutput::new(dir.path().join("live.gor"), config).unwrap();
        out.push(&record(1, b"hello")).unwrap();
        let shard = dir.path().join("live_0.gor");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while fs::metadata(&shard).unwrap().len() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(fs::metadata(&shard).unwrap().len() > 0);
        out.close();
    }

    #[test]
    fn append_resumes_last_shard() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileOutputConfig { append: true, size_limit: 150, ..Default::default() };
        let out = FileOutput::new(dir.path().join("app.gor"), config.clone()).unwrap();
        for ts in 0..4 {
            out.push(&record(ts, &[b'y'; 40])).unwrap();
        }
        out.close();
        let first = out.stats().shards;
        assert!(first.len() >= 2);

        let again = FileOutput::new(dir.path().join("app.gor"), config).unwrap();
        assert_eq!(again.stats().shards, vec![first.last().unwrap().clone()]);
        again.push(&record(10, b"z")).unwrap();
        again.close();

        let pattern = dir.path().join("app_*").to_string_lossy().into_owned();
        let input = FileInput::new(&pattern, FileInputConfig::default()).unwrap();
        let mut n = 0;
        while input.pull().is_ok() {
            n += 1;
        }
        assert_eq!(n, 5);
    }

    #[test]
    fn gzip_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let out = FileOutput::new(dir.path().join("z.gor.gz"), FileOutputConfig::default()).unwrap();
        for ts in 0..100 {
            out.push(&record(ts, b"compressible compressible compressible")).unwrap();
        }
        out.close();
        let shard = dir.path().join("z_0.gor.gz");
        let raw = fs::read(&shard).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);

        let input = FileInput::new(&shard.to_string_lossy(), FileInputConfig::default()).unwrap();
        let mut n = 0;
        while input.pull().is_ok() {
            n += 1;
        }
        assert_eq!(n, 100);
    }
}
