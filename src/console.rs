//! Debugging sinks: print every record, or drop everything.

use crate::error::Result;
use crate::plugin::{Close, RecordSink};
use crate::protocol::{Message, PAYLOAD_SEPARATOR};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Writes records to stdout in capture-file framing.
pub struct StdoutOutput {
    out: Mutex<io::Stdout>,
}

impl StdoutOutput {
    pub fn new() -> Self {
        Self { out: Mutex::new(io::stdout()) }
    }
}

impl Default for StdoutOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordSink for StdoutOutput {
    fn push(&self, msg: &Message) -> Result<usize> {
        let mut out = self.out.lock();
        out.write_all(&msg.meta)?;
        out.write_all(&msg.data)?;
        out.write_all(PAYLOAD_SEPARATOR)?;
        Ok(msg.encoded_len())
    }
}

impl Close for StdoutOutput {
    fn close(&self) {
        let _ = self.out.lock().flush();
    }
}

/// Accepts and discards every record, counting them.
#[derive(Default)]
pub struct NullOutput {
    records: AtomicU64,
}

impl NullOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }
}

impl RecordSink for NullOutput {
    fn push(&self, msg: &Message) -> Result<usize> {
        self.records.fetch_add(1, Ordering::Relaxed);
        Ok(msg.meta.len() + msg.data.len())
    }
}
