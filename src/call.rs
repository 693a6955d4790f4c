use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Duration, Utc};

use crate::media::{MediaDesc, RtpStream};
use crate::message::Message;
use crate::parse::{uri_of, HeaderPatterns, Headers};
use crate::types::{MsgKind, SipMethod};

/// Dialog state derived from the observed message flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Setup,
    InCall,
    Completed,
    Cancelled,
    Rejected,
    Busy,
}

impl CallState {
    /// Terminal calls no longer expect signaling or media.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallState::Setup | CallState::InCall)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Setup => f.write_str("CALL SETUP"),
            CallState::InCall => f.write_str("IN CALL"),
            CallState::Completed => f.write_str("COMPLETED"),
            CallState::Cancelled => f.write_str("CANCELLED"),
            CallState::Rejected => f.write_str("REJECTED"),
            CallState::Busy => f.write_str("BUSY"),
        }
    }
}

/// Memoized filter verdict. Only `Unknown` triggers re-evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Unknown,
    Pass,
    Reject,
}

impl Verdict {
    fn from_u8(v: u8) -> Verdict {
        match v {
            1 => Verdict::Pass,
            2 => Verdict::Reject,
            _ => Verdict::Unknown,
        }
    }
}

/// Per-call and per-message derived fields, the closed set of keys accepted
/// by [`Call::attribute`]. Filtering, sorting and rendering all go through
/// this accessor, so a new field only needs a variant and a match arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attr {
    CallId,
    XCallId,
    From,
    To,
    Src,
    Dst,
    Method,
    CSeq,
    Date,
    Time,
    SipFrom,
    SipTo,
    MsgCount,
    RtpCount,
    State,
    ConvDur,
    TotalDur,
    Reason,
    Warning,
    Transport,
}

impl Attr {
    pub const ALL: [Attr; 20] = [
        Attr::CallId,
        Attr::XCallId,
        Attr::From,
        Attr::To,
        Attr::Src,
        Attr::Dst,
        Attr::Method,
        Attr::CSeq,
        Attr::Date,
        Attr::Time,
        Attr::SipFrom,
        Attr::SipTo,
        Attr::MsgCount,
        Attr::RtpCount,
        Attr::State,
        Attr::ConvDur,
        Attr::TotalDur,
        Attr::Reason,
        Attr::Warning,
        Attr::Transport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Attr::CallId => "callid",
            Attr::XCallId => "xcallid",
            Attr::From => "from",
            Attr::To => "to",
            Attr::Src => "src",
            Attr::Dst => "dst",
            Attr::Method => "method",
            Attr::CSeq => "cseq",
            Attr::Date => "date",
            Attr::Time => "time",
            Attr::SipFrom => "sipfrom",
            Attr::SipTo => "sipto",
            Attr::MsgCount => "msgcnt",
            Attr::RtpCount => "rtpcnt",
            Attr::State => "state",
            Attr::ConvDur => "convdur",
            Attr::TotalDur => "totaldur",
            Attr::Reason => "reason",
            Attr::Warning => "warning",
            Attr::Transport => "transport",
        }
    }

    pub fn from_str(s: &str) -> Option<Attr> {
        Attr::ALL.iter().copied().find(|a| a.as_str() == s)
    }

    /// Attributes whose rendered value is a number, compared numerically
    /// when sorting.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Attr::CSeq | Attr::MsgCount | Attr::RtpCount | Attr::Warning
        )
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One SIP dialog: every message sharing a Call-ID, plus the RTP streams its
/// SDP bodies announced. Owned by the registry; all mutation happens under
/// the registry write lock.
#[derive(Debug)]
pub struct Call {
    index: u64,
    callid: String,
    xcallid: Option<String>,
    msgs: Vec<Message>,
    streams: Vec<RtpStream>,
    state: CallState,
    locked: bool,
    verdict: AtomicU8,
}

impl Call {
    pub(crate) fn new(index: u64, callid: String) -> Call {
        Call {
            index,
            callid,
            xcallid: None,
            msgs: Vec::new(),
            streams: Vec::new(),
            state: CallState::Setup,
            locked: false,
            verdict: AtomicU8::new(0),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn callid(&self) -> &str {
        &self.callid
    }

    /// The X-Call-ID value linking this dialog to a related one. Resolution
    /// is by registry lookup, so the link survives the other call being
    /// created later or evicted earlier.
    pub fn xcallid(&self) -> Option<&str> {
        self.xcallid.as_deref()
    }

    pub fn msgs(&self) -> &[Message] {
        &self.msgs
    }

    pub fn streams(&self) -> &[RtpStream] {
        &self.streams
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub(crate) fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn verdict(&self) -> Verdict {
        Verdict::from_u8(self.verdict.load(Ordering::Relaxed))
    }

    /// Cache the result of a filter evaluation. Interior mutability so that
    /// readers holding the shared registry lock can memoize.
    pub(crate) fn cache_verdict(&self, pass: bool) {
        self.verdict
            .store(if pass { 1 } else { 2 }, Ordering::Relaxed);
    }

    pub(crate) fn reset_verdict(&self) {
        self.verdict.store(0, Ordering::Relaxed);
    }

    /// Append a message in arrival order and advance the dialog state.
    /// Returns the message's position within the call.
    pub(crate) fn append(&mut self, msg: Message, patterns: &HeaderPatterns) -> usize {
        if let Some(headers) = msg.headers(patterns) {
            if self.xcallid.is_none() {
                self.xcallid = headers.xcallid.clone();
            }
            self.state = advance(self.state, headers);
        }
        self.msgs.push(msg);
        self.reset_verdict();
        self.msgs.len() - 1
    }

    /// Attach media descriptors announced from `src` at `ts`, coalescing
    /// duplicates (same endpoints and format set) into an updated `last_seen`.
    pub(crate) fn add_media(
        &mut self,
        descs: Vec<MediaDesc>,
        src: &crate::types::Endpoint,
        ts: DateTime<Utc>,
    ) {
        for desc in descs {
            let dst = crate::types::Endpoint::new(desc.addr, desc.port);
            let src = crate::types::Endpoint::new(src.host.clone(), 0);
            match self
                .streams
                .iter_mut()
                .find(|s| s.src == src && s.dst == dst && s.formats == desc.formats)
            {
                Some(existing) => existing.last_seen = ts,
                None => self.streams.push(RtpStream {
                    src,
                    dst,
                    media: desc.media,
                    formats: desc.formats,
                    first_seen: ts,
                    last_seen: ts,
                    packets: 0,
                }),
            }
        }
    }

    /// Match an observed RTP packet to a negotiated stream. The destination
    /// must be the advertised media endpoint; the source must come from the
    /// announcing host (its port is unknown until the first packet).
    pub(crate) fn stream_for_rtp(
        &mut self,
        src: &crate::types::Endpoint,
        dst: &crate::types::Endpoint,
    ) -> Option<&mut RtpStream> {
        self.streams.iter_mut().find(|s| {
            &s.dst == dst
                && s.src.host == src.host
                && (s.src.port == 0 || s.src.port == src.port)
        })
    }

    fn first_headers<'a>(&'a self, patterns: &HeaderPatterns) -> Option<&'a Headers> {
        self.msgs.first().and_then(|m| m.headers(patterns))
    }

    /// Render any known attribute to a string; unset fields render empty.
    pub fn attribute(&self, attr: Attr, patterns: &HeaderPatterns) -> String {
        match attr {
            Attr::CallId => self.callid.clone(),
            Attr::XCallId => self.xcallid.clone().unwrap_or_default(),
            Attr::From => self
                .first_headers(patterns)
                .and_then(|h| h.from.as_deref())
                .map(|v| uri_of(v).to_owned())
                .unwrap_or_default(),
            Attr::To => self
                .first_headers(patterns)
                .and_then(|h| h.to.as_deref())
                .map(|v| uri_of(v).to_owned())
                .unwrap_or_default(),
            Attr::SipFrom => self
                .first_headers(patterns)
                .and_then(|h| h.from.clone())
                .unwrap_or_default(),
            Attr::SipTo => self
                .first_headers(patterns)
                .and_then(|h| h.to.clone())
                .unwrap_or_default(),
            Attr::Src => self
                .msgs
                .first()
                .map(|m| m.src().to_string())
                .unwrap_or_default(),
            Attr::Dst => self
                .msgs
                .first()
                .map(|m| m.dst().to_string())
                .unwrap_or_default(),
            Attr::Method => self
                .first_headers(patterns)
                .map(|h| h.kind.summary().into_owned())
                .unwrap_or_default(),
            Attr::CSeq => self
                .first_headers(patterns)
                .and_then(|h| h.cseq)
                .map(|n| n.to_string())
                .unwrap_or_default(),
            Attr::Date => self
                .msgs
                .first()
                .map(|m| m.ts().format("%Y/%m/%d").to_string())
                .unwrap_or_default(),
            Attr::Time => self
                .msgs
                .first()
                .map(|m| m.ts().format("%H:%M:%S%.6f").to_string())
                .unwrap_or_default(),
            Attr::MsgCount => self.msgs.len().to_string(),
            Attr::RtpCount => self.streams.len().to_string(),
            Attr::State => self.state.to_string(),
            Attr::ConvDur => self.conversation_duration(patterns),
            Attr::TotalDur => self.total_duration(),
            Attr::Reason => self
                .msgs
                .iter()
                .rev()
                .filter_map(|m| m.headers(patterns))
                .find_map(|h| h.reason.clone())
                .unwrap_or_default(),
            Attr::Warning => self
                .msgs
                .iter()
                .filter_map(|m| m.headers(patterns))
                .find_map(|h| h.warning)
                .map(|w| w.to_string())
                .unwrap_or_default(),
            Attr::Transport => self
                .msgs
                .first()
                .map(|m| m.transport().to_string())
                .unwrap_or_default(),
        }
    }

    /// The one-line call list rendering, also the match target of
    /// line-oriented filters.
    pub fn line(&self, patterns: &HeaderPatterns) -> String {
        [
            Attr::Date,
            Attr::Time,
            Attr::Src,
            Attr::Dst,
            Attr::CallId,
            Attr::Method,
            Attr::MsgCount,
            Attr::State,
        ]
        .map(|attr| self.attribute(attr, patterns))
        .join(" ")
    }

    /// Time between the 2xx answering the INVITE and the BYE that ended the
    /// conversation; empty while either end is missing.
    fn conversation_duration(&self, patterns: &HeaderPatterns) -> String {
        let answered = self.msgs.iter().find_map(|m| {
            let h = m.headers(patterns)?;
            match &h.kind {
                MsgKind::Response { code, .. }
                    if (200..300).contains(code) && h.cseq_method == Some(SipMethod::Invite) =>
                {
                    Some(m.ts())
                }
                _ => None,
            }
        });
        let ended = self.msgs.iter().find_map(|m| {
            let h = m.headers(patterns)?;
            match h.kind {
                MsgKind::Request {
                    method: SipMethod::Bye,
                    ..
                } => Some(m.ts()),
                _ => None,
            }
        });
        match (answered, ended) {
            (Some(start), Some(end)) => fmt_duration(end - start),
            _ => String::new(),
        }
    }

    fn total_duration(&self) -> String {
        match (self.msgs.first(), self.msgs.last()) {
            (Some(first), Some(last)) => fmt_duration(last.ts() - first.ts()),
            _ => String::new(),
        }
    }
}

fn fmt_duration(d: Duration) -> String {
    let secs = d.num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Dialog state transitions driven by one more observed message.
fn advance(state: CallState, headers: &Headers) -> CallState {
    match &headers.kind {
        MsgKind::Request {
            method: SipMethod::Cancel,
            ..
        } => CallState::Cancelled,
        MsgKind::Response { code, .. } => {
            let code = *code;
            match headers.cseq_method {
                Some(SipMethod::Invite) if state == CallState::Setup => {
                    if (200..300).contains(&code) {
                        CallState::InCall
                    } else if code == 486 || code == 600 {
                        CallState::Busy
                    } else if code >= 400 && code != 401 && code != 407 {
                        CallState::Rejected
                    } else {
                        state
                    }
                }
                Some(SipMethod::Bye) if (200..300).contains(&code) => CallState::Completed,
                _ => state,
            }
        }
        _ => state,
    }
}
