//! On-stream record format.
//!
//! Every record is a single ASCII header line followed by the raw payload and
//! then [`PAYLOAD_SEPARATOR`]:
//!
//! ```text
//! <kind> <id> <timestamp> <latency>\n<payload>\n🐵🙈🙉\n
//! ```
//!
//! `kind` is `1` (request), `2` (response) or `3` (replayed response). For a
//! request `timestamp` is the capture time in nanoseconds; for responses it is
//! the measured round trip. The separator is not escaped: a payload that
//! happens to contain it will be split in two by [`split_frame`].

use std::io::{self, Read};

/// Token terminating every encoded record.
pub const PAYLOAD_SEPARATOR: &[u8] = "\n🐵🙈🙉\n".as_bytes();

/// Number of hex characters in a record id (96 bits).
pub const ID_LEN: usize = 24;

/// Minimum number of header fields for a well-formed record.
pub const MIN_META_FIELDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Request = b'1',
    Response = b'2',
    ReplayedResponse = b'3',
}

impl Kind {
    pub fn from_byte(b: u8) -> Option<Kind> {
        match b {
            b'1' => Some(Kind::Request),
            b'2' => Some(Kind::Response),
            b'3' => Some(Kind::ReplayedResponse),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A record as exchanged between sources and sinks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Header line including the trailing `\n`.
    pub meta: Vec<u8>,
    /// Opaque payload.
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(meta: Vec<u8>, data: Vec<u8>) -> Self {
        Self { meta, data }
    }

    /// Build a message from one framed token (header line + payload).
    pub fn from_frame(frame: &[u8]) -> Self {
        let (meta, body) = split_meta_body(frame);
        Self { meta: meta.unwrap_or_default().to_vec(), data: body.to_vec() }
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.data.is_empty()
    }

    /// Length of the encoded form, separator included.
    pub fn encoded_len(&self) -> usize {
        self.meta.len() + self.data.len() + PAYLOAD_SEPARATOR.len()
    }
}

/// Generate a fresh random record id.
pub fn new_id() -> Vec<u8> {
    let raw: [u8; ID_LEN / 2] = rand::random();
    raw.iter().map(|b| format!("{b:02x}")).collect::<String>().into_bytes()
}

/// Encode a record header line.
///
/// ```
/// use traffic_replay::protocol::{encode_header, Kind};
/// let h = encode_header(Kind::Response, b"f45590522cd1838b4a0d5c5a", 13923489726487326, 1231);
/// assert_eq!(h, b"2 f45590522cd1838b4a0d5c5a 13923489726487326 1231\n");
/// ```
pub fn encode_header(kind: Kind, id: &[u8], timestamp: i64, latency: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(id.len() + 48);
    out.push(kind.as_byte());
    out.push(b' ');
    out.extend_from_slice(id);
    out.extend_from_slice(format!(" {timestamp} {latency}\n").as_bytes());
    out
}

/// Locate the next record in `data`.
///
/// Returns the number of bytes consumed (separator included) and the record
/// bytes without the separator. `(0, None)` means more input is needed; at
/// end of stream any trailing bytes are returned as a final record.
pub fn split_frame(data: &[u8], at_eof: bool) -> (usize, Option<&[u8]>) {
    if at_eof && data.is_empty() {
        return (0, None);
    }
    if let Some(i) = find(data, PAYLOAD_SEPARATOR) {
        return (i + PAYLOAD_SEPARATOR.len(), Some(&data[..i]));
    }
    if at_eof {
        return (data.len(), Some(data));
    }
    (0, None)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Header fields of an encoded record, empty if there is no header line.
pub fn decode_meta(payload: &[u8]) -> Vec<&[u8]> {
    match payload.iter().position(|&b| b == b'\n') {
        Some(end) => payload[..end].split(|&b| b == b' ').collect(),
        None => Vec::new(),
    }
}

/// Payload portion following the header line.
pub fn decode_body(payload: &[u8]) -> &[u8] {
    match payload.iter().position(|&b| b == b'\n') {
        Some(end) => &payload[end + 1..],
        None => payload,
    }
}

/// Split a framed record into its header line (with `\n`) and payload.
pub fn split_meta_body(payload: &[u8]) -> (Option<&[u8]>, &[u8]) {
    match payload.iter().position(|&b| b == b'\n') {
        Some(i) if i > 0 => (Some(&payload[..=i]), &payload[i + 1..]),
        _ => (None, payload),
    }
}

/// Record id, empty when the header has fewer than two fields.
pub fn extract_id(payload: &[u8]) -> &[u8] {
    decode_meta(payload).get(1).copied().unwrap_or_default()
}

pub fn is_request(payload: &[u8]) -> bool {
    payload.first() == Some(&Kind::Request.as_byte())
}

/// Request or response captured at the origin, as opposed to a replayed response.
pub fn is_origin(payload: &[u8]) -> bool {
    matches!(payload.first().copied().and_then(Kind::from_byte), Some(Kind::Request | Kind::Response))
}

/// Parsed view of a header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub kind: Option<Kind>,
    pub id: Vec<u8>,
    pub timestamp: Option<i64>,
    pub latency: Option<i64>,
}

impl Header {
    /// Parse a header line. Returns `None` for malformed headers (fewer than
    /// [`MIN_META_FIELDS`] fields).
    pub fn parse(meta: &[u8]) -> Option<Header> {
        let fields = decode_meta(meta);
        if fields.len() < MIN_META_FIELDS {
            return None;
        }
        let first = fields[0];
        Some(Header {
            kind: if first.len() == 1 { Kind::from_byte(first[0]) } else { None },
            id: fields[1].to_vec(),
            timestamp: parse_i64(fields[2]),
            latency: fields.get(3).and_then(|f| parse_i64(f)),
        })
    }
}

fn parse_i64(field: &[u8]) -> Option<i64> {
    std::str::from_utf8(field).ok()?.trim().parse().ok()
}

/// Incremental framer: pulls bytes from `R` and yields one record at a time.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    eof: bool,
}

const READ_CHUNK: usize = 64 * 1024;

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, buf: Vec::with_capacity(READ_CHUNK), start: 0, eof: false }
    }

    /// Next framed record, or `None` once the stream is exhausted.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            let (consumed, token) = split_frame(&self.buf[self.start..], self.eof);
            if let Some(token) = token {
                let frame = token.to_vec();
                self.start += consumed;
                return Ok(Some(frame));
            }
            if self.eof {
                return Ok(None);
            }
            self.fill()?;
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        // compact consumed bytes before growing
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        let len = self.buf.len();
        self.buf.resize(len + READ_CHUNK, 0);
        let n = loop {
            match self.inner.read(&mut self.buf[len..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(len);
                    return Err(e);
                }
            }
        };
        self.buf.truncate(len + n);
        if n == 0 {
            self.eof = true;
        }
        Ok(())
    }
}
