use std::sync::OnceLock;

use chrono::{DateTime, Utc};

use crate::parse::{self, HeaderPatterns, Headers};
use crate::types::{Endpoint, Transport};

/// One captured SIP message, owned by exactly one call. The raw payload is
/// stored as received; structured fields are filled on first access and the
/// parse result is cached, so parsing is idempotent and cheap to repeat.
#[derive(Debug)]
pub struct Message {
    src: Endpoint,
    dst: Endpoint,
    transport: Transport,
    ts: DateTime<Utc>,
    payload: Vec<u8>,
    parsed: OnceLock<Option<Headers>>,
}

impl Message {
    pub fn new(
        src: Endpoint,
        dst: Endpoint,
        transport: Transport,
        ts: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Message {
        Message {
            src,
            dst,
            transport,
            ts,
            payload,
            parsed: OnceLock::new(),
        }
    }

    /// Seed the parse cache with headers the caller already extracted, so
    /// admission-time parsing is not repeated on first attribute access.
    pub(crate) fn with_headers(mut self, headers: Headers) -> Message {
        self.parsed = OnceLock::from(Some(headers));
        self
    }

    pub fn src(&self) -> &Endpoint {
        &self.src
    }

    pub fn dst(&self) -> &Endpoint {
        &self.dst
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Structured fields, parsed on first access. `None` when the payload
    /// turned out not to be parseable SIP.
    pub fn headers(&self, patterns: &HeaderPatterns) -> Option<&Headers> {
        self.parsed
            .get_or_init(|| parse::parse(patterns, &self.payload))
            .as_ref()
    }

    /// Message body as declared by the header terminator; empty when absent.
    pub fn body(&self, patterns: &HeaderPatterns) -> &[u8] {
        match self.headers(patterns) {
            Some(headers) => &self.payload[headers.body_start..],
            None => &[],
        }
    }

    /// ngrep-style one-line summary:
    /// `Timestamp Src -> Dst Method/Code CSeq Call-ID`.
    pub fn header_line(&self, patterns: &HeaderPatterns) -> String {
        let ts = self.ts.format("%H:%M:%S%.6f");
        match self.headers(patterns) {
            Some(headers) => {
                let cseq = headers.cseq.map(|n| n.to_string()).unwrap_or_default();
                format!(
                    "{} {} -> {} {} {} {}",
                    ts,
                    self.src,
                    self.dst,
                    headers.kind.summary(),
                    cseq,
                    headers.callid,
                )
            }
            None => format!("{} {} -> {} <unparsed>", ts, self.src, self.dst),
        }
    }
}
