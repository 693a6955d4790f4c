use std::sync::LazyLock;

use memchr::memmem;
use regex::bytes::Regex;

use crate::types::{MsgKind, SipMethod};

static CRLFCRLF: LazyLock<memmem::Finder<'static>> =
    LazyLock::new(|| memmem::Finder::new(b"\r\n\r\n"));

/// Line-oriented header patterns, compiled once at registry init.
/// All header-name matching is case-insensitive and accepts the RFC 3261
/// compact forms where one exists.
#[derive(Debug)]
pub struct HeaderPatterns {
    request: Regex,
    status: Regex,
    callid: Regex,
    xcallid: Regex,
    cseq: Regex,
    from: Regex,
    to: Regex,
    reason: Regex,
    warning: Regex,
}

impl HeaderPatterns {
    pub fn compile() -> Result<HeaderPatterns, regex::Error> {
        Ok(HeaderPatterns {
            request: Regex::new(r"\A([A-Za-z]+)[ \t]+([^ \t\r\n]+)[ \t]+SIP/2\.0")?,
            status: Regex::new(r"\ASIP/2\.0[ \t]+(\d{3})[ \t]*([^\r\n]*)")?,
            callid: Regex::new(r"(?mi)^(?:Call-ID|i)[ \t]*:[ \t]*([^\r\n]+)")?,
            xcallid: Regex::new(r"(?mi)^(?:X-Call-ID|X-CID)[ \t]*:[ \t]*([^\r\n]+)")?,
            cseq: Regex::new(r"(?mi)^CSeq[ \t]*:[ \t]*(\d+)[ \t]+([A-Za-z]+)")?,
            from: Regex::new(r"(?mi)^(?:From|f)[ \t]*:[ \t]*([^\r\n]+)")?,
            to: Regex::new(r"(?mi)^(?:To|t)[ \t]*:[ \t]*([^\r\n]+)")?,
            reason: Regex::new(r"(?mi)^Reason[ \t]*:[ \t]*([^\r\n]+)")?,
            warning: Regex::new(r"(?mi)^Warning[ \t]*:[ \t]*(\d+)")?,
        })
    }

    fn capture(&self, re: &Regex, payload: &[u8]) -> Option<String> {
        re.captures(payload)
            .and_then(|c| c.get(1))
            .map(|m| String::from_utf8_lossy(m.as_bytes()).trim_end().to_owned())
    }
}

/// Structured fields of one SIP message. Absent headers stay unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    pub kind: MsgKind,
    pub callid: String,
    pub xcallid: Option<String>,
    pub cseq: Option<u32>,
    pub cseq_method: Option<SipMethod>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub to_tag: bool,
    pub reason: Option<String>,
    pub warning: Option<u16>,
    /// Offset of the body within the raw payload; `payload.len()` if none.
    pub body_start: usize,
}

/// Cheap Call-ID extraction used before any full parse.
pub fn callid(patterns: &HeaderPatterns, payload: &[u8]) -> Option<String> {
    patterns
        .capture(&patterns.callid, payload)
        .filter(|id| !id.is_empty())
}

/// Full parse of one message. Returns `None` when the start line is not SIP;
/// every other field is optional. Pure with respect to the registry.
pub fn parse(patterns: &HeaderPatterns, payload: &[u8]) -> Option<Headers> {
    let kind = parse_start_line(patterns, payload)?;

    let callid = callid(patterns, payload).unwrap_or_default();
    let xcallid = patterns.capture(&patterns.xcallid, payload);

    let (cseq, cseq_method) = match patterns.cseq.captures(payload) {
        Some(caps) => {
            let number = std::str::from_utf8(&caps[1]).ok().and_then(|s| s.parse().ok());
            let method = std::str::from_utf8(&caps[2])
                .ok()
                .and_then(SipMethod::from_str);
            (number, method)
        }
        None => (None, None),
    };

    let from = patterns.capture(&patterns.from, payload);
    let to = patterns.capture(&patterns.to, payload);
    let to_tag = to.as_deref().is_some_and(|t| t.contains(";tag="));

    let reason = patterns
        .capture(&patterns.reason, payload)
        .map(|value| reason_text(&value));
    let warning = patterns
        .capture(&patterns.warning, payload)
        .and_then(|w| w.parse().ok());

    let body_start = CRLFCRLF
        .find(payload)
        .map(|p| p + 4)
        .unwrap_or(payload.len());

    Some(Headers {
        kind,
        callid,
        xcallid,
        cseq,
        cseq_method,
        from,
        to,
        to_tag,
        reason,
        warning,
        body_start,
    })
}

fn parse_start_line(patterns: &HeaderPatterns, payload: &[u8]) -> Option<MsgKind> {
    if let Some(caps) = patterns.status.captures(payload) {
        let code = std::str::from_utf8(&caps[1]).ok()?.parse().ok()?;
        let reason = String::from_utf8_lossy(&caps[2]).trim_end().to_owned();
        return Some(MsgKind::Response { code, reason });
    }
    let caps = patterns.request.captures(payload)?;
    let method = SipMethod::from_str(std::str::from_utf8(&caps[1]).ok()?)?;
    let uri = String::from_utf8_lossy(&caps[2]).into_owned();
    Some(MsgKind::Request { method, uri })
}

/// RFC 3326 `Reason: SIP;cause=486;text="Busy Here"` carries the interesting
/// part in the quoted text parameter; fall back to the whole value.
fn reason_text(value: &str) -> String {
    if let Some(idx) = value.find("text=\"") {
        let rest = &value[idx + 6..];
        if let Some(end) = rest.find('"') {
            return rest[..end].to_owned();
        }
    }
    value.to_owned()
}

/// Strip display name, angle brackets and parameters from a From/To value,
/// leaving the bare URI.
pub fn uri_of(header_value: &str) -> &str {
    if let Some(open) = header_value.find('<') {
        let rest = &header_value[open + 1..];
        match rest.find('>') {
            Some(close) => &rest[..close],
            None => rest,
        }
    } else {
        match header_value.find(';') {
            Some(semi) => header_value[..semi].trim(),
            None => header_value.trim(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> HeaderPatterns {
        HeaderPatterns::compile().unwrap()
    }

    const INVITE: &[u8] = b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
        From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
        To: Bob <sip:bob@biloxi.com>\r\n\
        Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
        X-Call-ID: upstream-leg@b2bua\r\n\
        CSeq: 314159 INVITE\r\n\
        Content-Length: 0\r\n\
        \r\n";

    #[test]
    fn parse_request() {
        let headers = parse(&patterns(), INVITE).unwrap();
        assert_eq!(
            headers.kind,
            MsgKind::Request {
                method: SipMethod::Invite,
                uri: "sip:bob@biloxi.com".into()
            }
        );
        assert_eq!(headers.callid, "a84b4c76e66710@pc33.atlanta.com");
        assert_eq!(headers.xcallid.as_deref(), Some("upstream-leg@b2bua"));
        assert_eq!(headers.cseq, Some(314159));
        assert_eq!(headers.cseq_method, Some(SipMethod::Invite));
        assert_eq!(
            headers.from.as_deref(),
            Some("Alice <sip:alice@atlanta.com>;tag=1928301774")
        );
        assert!(!headers.to_tag);
        assert_eq!(headers.body_start, INVITE.len());
    }

    #[test]
    fn parse_response_with_to_tag() {
        let payload = b"SIP/2.0 486 Busy Here\r\n\
            To: Bob <sip:bob@biloxi.com>;tag=a6c85cf\r\n\
            Call-ID: x\r\n\
            CSeq: 1 INVITE\r\n\
            Reason: SIP;cause=486;text=\"Busy Here\"\r\n\
            Warning: 399 biloxi.com \"Out of coverage\"\r\n\
            \r\n";
        let headers = parse(&patterns(), payload).unwrap();
        assert_eq!(
            headers.kind,
            MsgKind::Response {
                code: 486,
                reason: "Busy Here".into()
            }
        );
        assert!(headers.to_tag);
        assert_eq!(headers.reason.as_deref(), Some("Busy Here"));
        assert_eq!(headers.warning, Some(399));
        assert_eq!(headers.cseq_method, Some(SipMethod::Invite));
    }

    #[test]
    fn cheap_callid() {
        assert_eq!(
            callid(&patterns(), INVITE).as_deref(),
            Some("a84b4c76e66710@pc33.atlanta.com")
        );
        assert_eq!(callid(&patterns(), b"not sip at all\r\n\r\n"), None);
    }

    #[test]
    fn compact_headers() {
        let payload = b"BYE sip:host SIP/2.0\r\n\
            i: compact@host\r\n\
            f: <sip:a@h>;tag=1\r\n\
            t: <sip:b@h>;tag=2\r\n\
            \r\n";
        let headers = parse(&patterns(), payload).unwrap();
        assert_eq!(headers.callid, "compact@host");
        assert_eq!(headers.from.as_deref(), Some("<sip:a@h>;tag=1"));
        assert!(headers.to_tag);
    }

    #[test]
    fn identity_header_not_mistaken_for_callid() {
        let payload = b"OPTIONS sip:host SIP/2.0\r\n\
            Identity: bogus\r\n\
            Call-ID: real@host\r\n\
            \r\n";
        assert_eq!(callid(&patterns(), payload).as_deref(), Some("real@host"));
    }

    #[test]
    fn garbage_start_line_rejected() {
        assert!(parse(&patterns(), b"hello world\r\n\r\n").is_none());
    }

    #[test]
    fn body_offset() {
        let payload = b"INVITE sip:h SIP/2.0\r\nCall-ID: b\r\nContent-Length: 4\r\n\r\nv=0\n";
        let headers = parse(&patterns(), payload).unwrap();
        assert_eq!(&payload[headers.body_start..], b"v=0\n");
    }

    #[test]
    fn absent_fields_stay_unset() {
        let payload = b"ACK sip:h SIP/2.0\r\nCall-ID: a\r\n\r\n";
        let headers = parse(&patterns(), payload).unwrap();
        assert_eq!(headers.from, None);
        assert_eq!(headers.to, None);
        assert_eq!(headers.cseq, None);
        assert_eq!(headers.reason, None);
        assert_eq!(headers.warning, None);
        assert_eq!(headers.xcallid, None);
    }

    #[test]
    fn reason_without_text_param() {
        let payload = b"BYE sip:h SIP/2.0\r\nCall-ID: a\r\nReason: Q.850;cause=16\r\n\r\n";
        let headers = parse(&patterns(), payload).unwrap();
        assert_eq!(headers.reason.as_deref(), Some("Q.850;cause=16"));
    }

    #[test]
    fn uri_extraction() {
        assert_eq!(
            uri_of("Alice <sip:alice@atlanta.com>;tag=19"),
            "sip:alice@atlanta.com"
        );
        assert_eq!(uri_of("sip:bob@biloxi.com;tag=7"), "sip:bob@biloxi.com");
        assert_eq!(uri_of("sip:bob@biloxi.com"), "sip:bob@biloxi.com");
    }
}
