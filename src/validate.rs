use std::sync::LazyLock;

use memchr::memmem;

use crate::types::{SipMethod, Transport};

static CRLF: LazyLock<memmem::Finder<'static>> = LazyLock::new(|| memmem::Finder::new(b"\r\n"));
static CRLFCRLF: LazyLock<memmem::Finder<'static>> =
    LazyLock::new(|| memmem::Finder::new(b"\r\n\r\n"));

/// Classification of a raw packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Start line is not a SIP request or response.
    NotSip,
    /// Stream payload that does not yet carry the declared body.
    Partial,
    /// Exactly one SIP message.
    Complete,
    /// More than one message; `consumed` is the byte length of the first.
    /// The caller re-validates the remainder.
    Multiple { consumed: usize },
}

pub fn classify(payload: &[u8], transport: Transport) -> PayloadKind {
    let Some(line_end) = CRLF.find(payload) else {
        return PayloadKind::NotSip;
    };
    if !start_line_ok(&payload[..line_end]) {
        return PayloadKind::NotSip;
    }

    if transport.is_datagram() {
        return PayloadKind::Complete;
    }

    // Stream transports must declare their body length so message boundaries
    // can be recovered from the byte stream.
    let Some(header_end) = CRLFCRLF.find(payload) else {
        return PayloadKind::Partial;
    };
    let Some(content_length) = content_length(&payload[..header_end + 2]) else {
        return PayloadKind::Partial;
    };

    let body_start = header_end + 4;
    let available = payload.len() - body_start;
    if available < content_length {
        PayloadKind::Partial
    } else if available == content_length {
        PayloadKind::Complete
    } else {
        PayloadKind::Multiple {
            consumed: body_start + content_length,
        }
    }
}

/// `<METHOD> <uri> SIP/2.0` with a known method token, or `SIP/2.0 <code> ...`.
fn start_line_ok(line: &[u8]) -> bool {
    if let Some(rest) = line.strip_prefix(b"SIP/2.0 ") {
        let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
        return digits == 3 && (rest.len() == 3 || rest[3] == b' ');
    }

    let Some(first_space) = memchr::memchr(b' ', line) else {
        return false;
    };
    let method = match std::str::from_utf8(&line[..first_space]) {
        Ok(m) => m,
        Err(_) => return false,
    };
    if SipMethod::from_str(method).is_none() {
        return false;
    }
    let rest = &line[first_space + 1..];
    let Some(last_space) = memchr::memrchr(b' ', rest) else {
        return false;
    };
    last_space > 0 && &rest[last_space + 1..] == b"SIP/2.0"
}

/// Scan header lines for `Content-Length` (or compact `l`).
fn content_length(headers: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while pos < headers.len() {
        let line_end = CRLF
            .find(&headers[pos..])
            .map(|p| pos + p)
            .unwrap_or(headers.len());
        let line = &headers[pos..line_end];
        if let Some(value) = header_value(line, b"content-length").or_else(|| header_value(line, b"l"))
        {
            let digits = std::str::from_utf8(value).ok()?;
            return digits.trim().parse().ok();
        }
        pos = line_end + 2;
    }
    None
}

fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if line.len() <= name.len() || !line[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    let mut rest = &line[name.len()..];
    while let [b' ' | b'\t', tail @ ..] = rest {
        rest = tail;
    }
    match rest {
        [b':', value @ ..] => Some(value),
        _ => None,
    }
}
