//! Fan-out supervisor: one worker thread per source, every record copied to
//! every sink in registration order.

use crate::error::{Error, Result};
use crate::plugin::{RecordSink, RecordSource};
use crate::plugins::Plugins;
use crate::protocol::{decode_meta, MIN_META_FIELDS};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

#[derive(Default)]
pub struct Emitter {
    plugins: Option<Plugins>,
    workers: Vec<JoinHandle<()>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch one worker per source. Sources and sinks are fixed from here on.
    pub fn start(&mut self, plugins: Plugins) -> Result<()> {
        let sinks: Arc<[Arc<dyn RecordSink>]> = plugins.sinks.clone().into();
        for (i, src) in plugins.sources.iter().enumerate() {
            let src = Arc::clone(src);
            let sinks = Arc::clone(&sinks);
            let handle = thread::Builder::new().name(format!("emitter-{i}")).spawn(move || {
                match copy_multi(src.as_ref(), &sinks) {
                    Ok(n) => debug!(source = %src.name(), records = n, "source finished"),
                    Err(e) => error!(source = %src.name(), error = %e, "error during copy"),
                }
            })?;
            self.workers.push(handle);
        }
        self.plugins = Some(plugins);
        Ok(())
    }

    /// True once every worker has exited on its own.
    pub fn finished(&self) -> bool {
        self.workers.iter().all(|w| w.is_finished())
    }

    /// Close every closable plugin, then wait for all workers to exit.
    /// Calling it again is a no-op.
    pub fn close(&mut self) {
        let Some(plugins) = self.plugins.take() else { return };
        for c in &plugins.closers {
            c.close();
        }
        for w in self.workers.drain(..) {
            if w.join().is_err() {
                warn!("emitter worker panicked");
            }
        }
    }
}

impl Drop for Emitter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Copy records from one source to every sink until the source ends.
///
/// Returns the number of records delivered. Malformed records are logged and
/// skipped; `SinkClosed` from a sink is ignored; any other sink error aborts.
pub fn copy_multi(src: &dyn RecordSource, sinks: &[Arc<dyn RecordSink>]) -> Result<u64> {
    let mut delivered = 0u64;
    loop {
        let msg = match src.pull() {
            Ok(msg) => msg,
            Err(e) if e.is_terminal() => return Ok(delivered),
            Err(e) => return Err(e),
        };
        if msg.data.is_empty() {
            continue;
        }
        if decode_meta(&msg.meta).len() < MIN_META_FIELDS {
            warn!(
                source = %src.name(),
                meta = %String::from_utf8_lossy(&msg.meta).trim_end(),
                "found malformed record"
            );
            continue;
        }
        for dst in sinks {
            match dst.push(&msg) {
                Ok(_) | Err(Error::SinkClosed) => {}
                Err(e) => return Err(e),
            }
        }
        delivered += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Close;
    use crate::protocol::{encode_header, Kind, Message};
    use crate::testing::{TestInput, TestOutput};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_for(count: &AtomicUsize, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn fans_out_to_every_sink() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut plugins = Plugins::new();
        let input = plugins.add_closable_source(TestInput::new());
        for _ in 0..2 {
            let c = Arc::clone(&count);
            plugins.add_sink(TestOutput::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let mut emitter = Emitter::new();
        emitter.start(plugins).unwrap();
        for _ in 0..100 {
            input.emit_get();
        }
        wait_for(&count, 200);
        emitter.close();
        assert_eq!(count.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn malformed_records_are_skipped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut plugins = Plugins::new();
        let input = plugins.add_closable_source(TestInput::with_raw_frames());
        let s = Arc::clone(&seen);
        plugins.add_sink(TestOutput::new(move |m: &Message| s.lock().push(m.data.clone())));
        let mut emitter = Emitter::new();
        emitter.start(plugins).unwrap();

        input.emit_bytes(b"1 only-two\nbad".to_vec());
        let mut good = encode_header(Kind::Request, b"abc", 1, 0);
        good.extend_from_slice(b"good");
        input.emit_bytes(good);

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        emitter.close();
        assert_eq!(*seen.lock(), vec![b"good".to_vec()]);
    }

    struct Broken;
    impl RecordSink for Broken {
        fn push(&self, _: &Message) -> Result<usize> {
            Err(Error::Io(std::io::Error::other("disk on fire")))
        }
    }

    struct Closed;
    impl RecordSink for Closed {
        fn push(&self, _: &Message) -> Result<usize> {
            Err(Error::SinkClosed)
        }
    }

    #[test]
    fn closed_sink_is_ignored_other_errors_abort() {
        let input = TestInput::new();
        input.emit_get();
        input.emit_get();
        input.close();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let counting: Arc<dyn RecordSink> = Arc::new(TestOutput::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let sinks = vec![Arc::new(Closed) as Arc<dyn RecordSink>, counting.clone()];
        assert_eq!(copy_multi(&input, &sinks).unwrap(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let input = TestInput::new();
        input.emit_get();
        let sinks = vec![Arc::new(Broken) as Arc<dyn RecordSink>, counting];
        assert!(matches!(copy_multi(&input, &sinks), Err(Error::Io(_))));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_is_idempotent_and_unblocks_sources() {
        let mut plugins = Plugins::new();
        plugins.add_closable_source(TestInput::new());
        plugins.add_sink(TestOutput::new(|_| {}));
        let mut emitter = Emitter::new();
        emitter.start(plugins).unwrap();
        assert!(!emitter.finished());
        let started = Instant::now();
        emitter.close();
        emitter.close();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(emitter.finished());
    }
}
