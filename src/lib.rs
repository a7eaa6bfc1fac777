//! Traffic capture and replay engine.
//!
//! Captured request/response traffic is stored as framed records in capture
//! files and replayed later, in original order and with original timing:
//!
//! - `protocol`: record header encoding and stream framing
//! - `input_file`: ordered multi-file capture reader with replay pacing
//! - `output_file`: capture writer with shard rotation, size caps and gzip
//! - `limiter`: count / rate caps wrapping any source or sink
//! - `emitter`: moves records from every source to every sink
//! - `plugins` / `config`: explicit configuration and construction
//!
//! The binaries in this repository (`src/main.rs` and `src/bin/inspect.rs`)
//! wire these together from command line flags.
pub mod config;
pub mod console;
pub mod emitter;
pub mod error;
pub mod input_file;
pub mod limiter;
pub mod logging;
pub mod output_file;
pub mod plugin;
pub mod plugins;
pub mod protocol;
pub mod testing;

pub use error::{Error, Result};
pub use plugin::{Close, RecordSink, RecordSource};
pub use protocol::Message;
