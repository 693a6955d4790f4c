use std::fmt;
use std::io::Read;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use memchr::memmem;
use tracing::{debug, warn};

use crate::types::{Endpoint, Packet, Transport};

static BOUNDARY: LazyLock<memmem::Finder<'static>> =
    LazyLock::new(|| memmem::Finder::new(b"\x0B\n"));
static AT: LazyLock<memmem::Finder<'static>> = LazyLock::new(|| memmem::Finder::new(b" at "));

#[derive(Debug)]
pub enum TraceError {
    InvalidHeader(String),
    Io(std::io::Error),
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::InvalidHeader(msg) => write!(f, "invalid frame header: {msg}"),
            TraceError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TraceError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TraceError {
    fn from(e: std::io::Error) -> Self {
        TraceError::Io(e)
    }
}

/// Replays a FreeSWITCH mod_sofia trace dump as a stream of [`Packet`]s.
///
/// Frame format:
/// `(recv|sent) <N> bytes (from|to) <transport>/<address> at <timestamp>:\n`
/// followed by the payload and a `\x0B\n` boundary. The dump only records
/// the remote address; the unrecorded local side is rendered as `local`.
pub struct TraceReader {
    data: Vec<u8>,
    pos: usize,
    started: bool,
}

impl TraceReader {
    pub fn new<R: Read>(mut reader: R) -> Result<TraceReader, TraceError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(TraceReader {
            data,
            pos: 0,
            started: false,
        })
    }

    /// Strip inter-frame newline padding.
    fn skip_padding(&mut self) {
        while self.pos < self.data.len() {
            match self.data[self.pos] {
                b'\n' => self.pos += 1,
                b'\r' if self.data.get(self.pos + 1) == Some(&b'\n') => self.pos += 2,
                _ => break,
            }
        }
    }

    /// Position of the first valid frame header (for truncated dump starts).
    fn seek_first_header(&mut self) -> bool {
        if is_frame_header(&self.data[self.pos..]) {
            return true;
        }
        let mut search = self.pos;
        while let Some(p) = BOUNDARY.find(&self.data[search..]) {
            let after = search + p + 2;
            if after < self.data.len() && is_frame_header(&self.data[after..]) {
                warn!(skipped_bytes = after - self.pos, "skipped partial first frame");
                self.pos = after;
                return true;
            }
            search = after;
        }
        false
    }

    /// Find where this frame's content ends: at the declared byte count when
    /// a boundary sits there, else at the next boundary that is followed by
    /// a valid header, else at EOF.
    fn content_end(&self, content_start: usize, byte_count: usize) -> (usize, usize) {
        let data = &self.data;
        let expected = content_start + byte_count;
        if data.get(expected) == Some(&0x0B)
            && (expected + 1 >= data.len() || data[expected + 1] == b'\n')
        {
            return (expected, (expected + 2).min(data.len()));
        }

        let mut search = content_start;
        while let Some(p) = BOUNDARY.find(&data[search..]) {
            let abs = search + p;
            let after = abs + 2;
            if after >= data.len() || is_frame_header(&data[after..]) {
                return (abs, after);
            }
            // \x0B\n inside the payload, not a boundary
            search = after;
        }

        let end = if data.last() == Some(&0x0B) {
            data.len() - 1
        } else {
            data.len()
        };
        (end, data.len())
    }
}

impl Iterator for TraceReader {
    type Item = Result<Packet, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.skip_padding();
            if self.pos >= self.data.len() {
                return None;
            }

            if !self.started {
                if !self.seek_first_header() {
                    debug!("no valid frame header found in input");
                    return None;
                }
                self.started = true;
            }

            // Dump rotation writes a restart marker line; consume it.
            if self.data[self.pos..].starts_with(b"dump started at ") {
                let skip = memchr::memchr(b'\n', &self.data[self.pos..])
                    .map(|p| p + 1)
                    .unwrap_or(self.data.len() - self.pos);
                debug!(skipped_bytes = skip, "skipped dump restart marker");
                self.pos += skip;
                continue;
            }

            match parse_frame_header(&self.data[self.pos..]) {
                Ok(header) => {
                    let content_start = self.pos + header.len;
                    if content_start > self.data.len() {
                        return None;
                    }
                    let (content_end, next_pos) =
                        self.content_end(content_start, header.byte_count);
                    let payload = self.data[content_start..content_end].to_vec();
                    if payload.len() != header.byte_count {
                        debug!(
                            expected = header.byte_count,
                            actual = payload.len(),
                            "frame content size mismatch"
                        );
                    }
                    self.pos = next_pos;

                    let local = Endpoint::new("local", 0);
                    let (src, dst) = if header.recv {
                        (header.addr, local)
                    } else {
                        (local, header.addr)
                    };
                    return Some(Ok(Packet {
                        src,
                        dst,
                        transport: header.transport,
                        ts: header.ts,
                        payload,
                    }));
                }
                Err(e) => {
                    // Recover at the next boundary (or line) and surface the error.
                    self.pos = BOUNDARY
                        .find(&self.data[self.pos..])
                        .map(|p| self.pos + p + 2)
                        .or_else(|| {
                            memchr::memchr(b'\n', &self.data[self.pos..]).map(|p| self.pos + p + 1)
                        })
                        .unwrap_or(self.data.len());
                    return Some(Err(e));
                }
            }
        }
    }
}

struct FrameHeader {
    recv: bool,
    byte_count: usize,
    transport: Transport,
    addr: Endpoint,
    ts: DateTime<Utc>,
    /// Header length including the trailing newline.
    len: usize,
}

fn parse_frame_header(data: &[u8]) -> Result<FrameHeader, TraceError> {
    let newline = memchr::memchr(b'\n', data)
        .ok_or_else(|| TraceError::InvalidHeader("no newline in header".into()))?;
    let line = data[..newline].strip_suffix(b"\r").unwrap_or(&data[..newline]);
    let line = line
        .strip_suffix(b":")
        .ok_or_else(|| TraceError::InvalidHeader("header does not end with ':'".into()))?;

    let (recv, rest) = if let Some(rest) = line.strip_prefix(b"recv ") {
        (true, rest)
    } else if let Some(rest) = line.strip_prefix(b"sent ") {
        (false, rest)
    } else {
        return Err(TraceError::InvalidHeader("expected 'recv' or 'sent'".into()));
    };

    let space = memchr::memchr(b' ', rest)
        .ok_or_else(|| TraceError::InvalidHeader("no space after byte count".into()))?;
    let byte_count: usize = std::str::from_utf8(&rest[..space])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TraceError::InvalidHeader("invalid byte count".into()))?;
    let rest = &rest[space + 1..];

    let marker: &[u8] = if recv { b"bytes from " } else { b"bytes to " };
    let rest = rest
        .strip_prefix(marker)
        .ok_or_else(|| TraceError::InvalidHeader("expected 'bytes from/to'".into()))?;

    let (transport, rest) = if let Some(rest) = rest.strip_prefix(b"tcp/") {
        (Transport::Tcp, rest)
    } else if let Some(rest) = rest.strip_prefix(b"udp/") {
        (Transport::Udp, rest)
    } else if let Some(rest) = rest.strip_prefix(b"tls/") {
        (Transport::Tls, rest)
    } else if let Some(rest) = rest.strip_prefix(b"wss/") {
        (Transport::Wss, rest)
    } else {
        return Err(TraceError::InvalidHeader("unknown transport".into()));
    };

    let at = AT
        .find(rest)
        .ok_or_else(|| TraceError::InvalidHeader("no ' at ' in header".into()))?;
    let addr = parse_endpoint(&String::from_utf8_lossy(&rest[..at]));
    let ts_str = String::from_utf8_lossy(&rest[at + 4..]);
    let ts = parse_timestamp(ts_str.trim())
        .ok_or_else(|| TraceError::InvalidHeader("invalid timestamp".into()))?;

    Ok(FrameHeader {
        recv,
        byte_count,
        transport,
        addr,
        ts,
        len: newline + 1,
    })
}

/// Quick check that a buffer starts with a plausible frame header; used to
/// validate `\x0B\n` boundaries against payload bytes that contain them.
fn is_frame_header(data: &[u8]) -> bool {
    if data.len() < 20 {
        return false;
    }
    if !data.starts_with(b"recv ") && !data.starts_with(b"sent ") {
        return false;
    }
    let rest = &data[5..];
    let Some(space) = memchr::memchr(b' ', rest) else {
        return false;
    };
    if space == 0 || space > 10 || !rest[..space].iter().all(|b| b.is_ascii_digit()) {
        return false;
    }
    rest[space..].starts_with(b" bytes ")
}

/// `host:port`, `[v6]:port`, or a bare host.
fn parse_endpoint(s: &str) -> Endpoint {
    if let Some(rest) = s.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once(']') {
            let port = port
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(0);
            return Endpoint::new(host, port);
        }
    }
    match s.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => Endpoint::new(host, port),
            Err(_) => Endpoint::new(s, 0),
        },
        None => Endpoint::new(s, 0),
    }
}

/// `HH:MM:SS.usec`, with an optional `YYYY-MM-DD` date. Time-only stamps get
/// the epoch date so ordering within one dump stays intact.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    let time = NaiveTime::parse_from_str(s, "%H:%M:%S%.f").ok()?;
    Some(NaiveDate::from_ymd_opt(1970, 1, 1)?.and_time(time).and_utc())
}
