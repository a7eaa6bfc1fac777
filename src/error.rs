//! Error type shared by every source, sink and pipeline component.
//!
//! `EndOfStream`, `Stopped` and `SinkClosed` are expected outcomes rather
//! than failures; the emitter treats them specially. Everything else is
//! fatal to whichever worker hit it.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The source has no more records.
    #[error("end of stream")]
    EndOfStream,

    /// The source or sink was closed while an operation was in progress.
    #[error("reading stopped")]
    Stopped,

    /// Write attempted on a sink that has already been closed.
    #[error("sink closed")]
    SinkClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A capture file could not be opened while constructing a reader or writer.
    #[error("failed to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid file pattern {pattern:?}: {message}")]
    Pattern { pattern: String, message: String },

    #[error("no files match {0:?}")]
    NoMatches(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True for the outcomes a worker should exit on without reporting.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::EndOfStream | Error::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_outcomes() {
        assert!(Error::EndOfStream.is_terminal());
        assert!(Error::Stopped.is_terminal());
        assert!(!Error::SinkClosed.is_terminal());
        assert!(!Error::Config("x".into()).is_terminal());
    }

    #[test]
    fn open_error_names_path() {
        let err = Error::Open {
            path: PathBuf::from("/nope/requests.gor"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        let msg = err.to_string();
        assert!(msg.contains("requests.gor"));
        assert!(msg.contains("missing"));
    }
}
