//! In-memory source and sink for exercising pipelines without files.

use crate::error::{Error, Result};
use crate::plugin::{Close, RecordSink, RecordSource};
use crate::protocol::{encode_header, new_id, Kind, Message};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source fed on demand by the test.
pub struct TestInput {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    raw_frames: bool,
}

impl TestInput {
    /// Emitted bytes become the payload of a fresh request record.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        Self { tx, rx, stop_tx: Mutex::new(Some(stop_tx)), stop_rx, raw_frames: false }
    }

    /// Emitted bytes are whole frames (header line plus payload).
    pub fn with_raw_frames() -> Self {
        Self { raw_frames: true, ..Self::new() }
    }

    pub fn emit_bytes(&self, data: Vec<u8>) {
        let _ = self.tx.send(data);
    }

    pub fn emit_get(&self) {
        self.emit_bytes(b"GET / HTTP/1.1\r\n\r\n".to_vec());
    }

    pub fn emit_post(&self) {
        self.emit_bytes(b"POST /pub/WWW/ HTTP/1.1\r\nContent-Length: 7\r\nHost: www.w3.org\r\n\r\na=1&b=2".to_vec());
    }

    /// POST whose body is `size` bytes of filler.
    pub fn emit_sized_post(&self, size: usize) {
        let mut req = format!("POST / HTTP/1.1\r\nHost: www.w3.org\r\nContent-Length: {size}\r\n\r\n").into_bytes();
        req.extend((0..size).map(|i| b'a' + (i % 26) as u8));
        self.emit_bytes(req);
    }

    fn to_message(&self, buf: Vec<u8>) -> Message {
        if self.raw_frames {
            return Message::from_frame(&buf);
        }
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64;
        Message::new(encode_header(Kind::Request, &new_id(), now, -1), buf)
    }
}

impl Default for TestInput {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordSource for TestInput {
    fn pull(&self) -> Result<Message> {
        // queued data wins over a pending stop
        if let Ok(buf) = self.rx.try_recv() {
            return Ok(self.to_message(buf));
        }
        select! {
            recv(self.rx) -> buf => match buf {
                Ok(buf) => Ok(self.to_message(buf)),
                Err(_) => Err(Error::Stopped),
            },
            recv(self.stop_rx) -> _ => Err(Error::Stopped),
        }
    }
}

impl Close for TestInput {
    fn close(&self) {
        self.stop_tx.lock().take();
    }
}

/// Sink invoking a callback for every record.
pub struct TestOutput<F> {
    callback: F,
}

impl<F: Fn(&Message) + Send + Sync> TestOutput<F> {
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F: Fn(&Message) + Send + Sync> RecordSink for TestOutput<F> {
    fn push(&self, msg: &Message) -> Result<usize> {
        (self.callback)(msg);
        Ok(msg.meta.len() + msg.data.len())
    }
}
