//! Capability traits implemented by every source and sink.
//!
//! A concrete adapter implements whichever of [`RecordSource`],
//! [`RecordSink`] and [`Close`] it supports. All methods take `&self`: an
//! adapter shared between emitter workers serializes its own state.

use crate::error::Result;
use crate::protocol::Message;

/// Something records can be pulled from.
pub trait RecordSource: Send + Sync {
    /// Block until the next record is available.
    ///
    /// Returns [`crate::Error::EndOfStream`] when exhausted and
    /// [`crate::Error::Stopped`] when closed mid-read. An empty message is
    /// allowed and is skipped by the emitter.
    fn pull(&self) -> Result<Message>;

    fn name(&self) -> String {
        std::any::type_name::<Self>().rsplit("::").next().unwrap_or("source").to_string()
    }
}

/// Something records can be pushed to.
pub trait RecordSink: Send + Sync {
    /// Write one record, returning the number of bytes accepted.
    ///
    /// Returns [`crate::Error::SinkClosed`] once the sink has been closed.
    fn push(&self, msg: &Message) -> Result<usize>;

    fn name(&self) -> String {
        std::any::type_name::<Self>().rsplit("::").next().unwrap_or("sink").to_string()
    }
}

/// Releases resources and interrupts blocked calls. Must be idempotent.
pub trait Close: Send + Sync {
    fn close(&self);
}
