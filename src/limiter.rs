//! Count and rate caps layered over any source or sink.
//!
//! [`Limiter<T>`] is a source when `T` is a source and a sink when `T` is a
//! sink. Reads and writes are counted separately, each behind its own lock.

use crate::config::Limit;
use crate::error::{Error, Result};
use crate::plugin::{Close, RecordSink, RecordSource};
use crate::protocol::Message;
use parking_lot::Mutex;
use std::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct Counter {
    limit: Limit,
    count: u64,
    window_start: Instant,
}

impl Counter {
    fn new(limit: Limit) -> Self {
        Self { limit, count: 0, window_start: Instant::now() }
    }

    /// Reserve one slot; `false` when the cap is hit.
    fn acquire(&mut self) -> bool {
        match self.limit {
            Limit::Count(max) => {
                if self.count >= max {
                    return false;
                }
            }
            Limit::Rate { max, window } => {
                let now = Instant::now();
                if now.duration_since(self.window_start) >= window {
                    self.window_start = now;
                    self.count = 0;
                }
                if self.count >= max {
                    return false;
                }
            }
        }
        self.count += 1;
        true
    }

    /// Give back a slot reserved for an operation that failed.
    fn release(&mut self) {
        self.count = self.count.saturating_sub(1);
    }
}

pub struct Limiter<T> {
    inner: T,
    reads: Mutex<Counter>,
    writes: Mutex<Counter>,
}

impl<T> Limiter<T> {
    pub fn new(inner: T, limit: Limit) -> Self {
        Self { inner, reads: Mutex::new(Counter::new(limit)), writes: Mutex::new(Counter::new(limit)) }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: RecordSource> RecordSource for Limiter<T> {
    fn pull(&self) -> Result<Message> {
        let limit = self.reads.lock().limit;
        match limit {
            Limit::Count(_) => {
                if !self.reads.lock().acquire() {
                    return Err(Error::EndOfStream);
                }
                let res = self.inner.pull();
                if res.is_err() {
                    self.reads.lock().release();
                }
                res
            }
            Limit::Rate { .. } => {
                let msg = self.inner.pull()?;
                if msg.data.is_empty() || self.reads.lock().acquire() {
                    Ok(msg)
                } else {
                    trace!("rate limit reached, dropping record");
                    Ok(Message::default())
                }
            }
        }
    }

    fn name(&self) -> String {
        format!("{}|limited", self.inner.name())
    }
}

impl<T: RecordSink> RecordSink for Limiter<T> {
    fn push(&self, msg: &Message) -> Result<usize> {
        if !self.writes.lock().acquire() {
            return Ok(0);
        }
        self.inner.push(msg)
    }

    fn name(&self) -> String {
        format!("{}|limited", self.inner.name())
    }
}

impl<T: Close> Close for Limiter<T> {
    fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestInput, TestOutput};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn count_limit_ends_stream_after_exactly_n() {
        let input = TestInput::new();
        for _ in 0..10 {
            input.emit_get();
        }
        let limited = Limiter::new(input, Limit::Count(3));
        for _ in 0..3 {
            assert!(!limited.pull().unwrap().data.is_empty());
        }
        assert!(matches!(limited.pull(), Err(Error::EndOfStream)));
        assert!(matches!(limited.pull(), Err(Error::EndOfStream)));
    }

    #[test]
    fn failed_pull_does_not_consume_quota() {
        let input = TestInput::new();
        input.close();
        let limited = Limiter::new(input, Limit::Count(1));
        assert!(matches!(limited.pull(), Err(Error::Stopped)));
        limited.inner().emit_get();
        assert!(limited.pull().is_ok());
        assert!(matches!(limited.pull(), Err(Error::EndOfStream)));
    }

    #[test]
    fn count_limit_drops_writes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let out = Limiter::new(TestOutput::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }), Limit::Count(2));
        let msg = Message::new(b"1 a 1\n".to_vec(), b"x".to_vec());
        for _ in 0..5 {
            out.push(&msg).unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rate_limit_resets_per_window() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let out = Limiter::new(TestOutput::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }), Limit::Rate { max: 2, window: Duration::from_millis(50) });
        let msg = Message::new(b"1 a 1\n".to_vec(), b"x".to_vec());
        for _ in 0..5 {
            out.push(&msg).unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        std::thread::sleep(Duration::from_millis(60));
        for _ in 0..5 {
            out.push(&msg).unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn rate_limited_reads_come_back_empty() {
        let input = TestInput::new();
        for _ in 0..4 {
            input.emit_get();
        }
        let limited = Limiter::new(input, Limit::Rate { max: 1, window: Duration::from_secs(60) });
        assert!(!limited.pull().unwrap().data.is_empty());
        assert!(limited.pull().unwrap().data.is_empty());
        assert!(limited.pull().unwrap().data.is_empty());
    }

    #[test]
    fn directions_are_counted_separately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        struct Duplex<F>(TestInput, TestOutput<F>);
        impl<F: Fn(&Message) + Send + Sync> RecordSource for Duplex<F> {
            fn pull(&self) -> Result<Message> {
                self.0.pull()
            }
        }
        impl<F: Fn(&Message) + Send + Sync> RecordSink for Duplex<F> {
            fn push(&self, msg: &Message) -> Result<usize> {
                self.1.push(msg)
            }
        }
        let d = Duplex(TestInput::new(), TestOutput::new(move |_: &Message| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        d.0.emit_get();
        d.0.emit_get();
        let limited = Limiter::new(d, Limit::Count(1));
        let msg = limited.pull().unwrap();
        assert_eq!(limited.push(&msg).unwrap(), msg.meta.len() + msg.data.len());
        assert_eq!(limited.push(&msg).unwrap(), 0);
        assert!(matches!(limited.pull(), Err(Error::EndOfStream)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
