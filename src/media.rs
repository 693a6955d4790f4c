use chrono::{DateTime, Utc};

use crate::types::Endpoint;

/// One `m=` block extracted from an SDP body, with its effective connection
/// address (media-level `c=` overrides the session-level one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDesc {
    pub addr: String,
    pub port: u16,
    pub media: String,
    pub formats: Vec<String>,
}

/// An RTP stream negotiated by a call. `dst` is the endpoint the SDP sender
/// advertised for receiving media; `src` is the signaling source it was
/// announced from (media port unknown until packets arrive).
#[derive(Debug, Clone)]
pub struct RtpStream {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub media: String,
    pub formats: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub packets: u64,
}

impl RtpStream {
    pub fn record_packet(&mut self, ts: DateTime<Utc>) {
        self.packets += 1;
        self.last_seen = ts;
    }
}

/// Scan a message body for SDP media descriptions. Non-SDP bodies yield
/// nothing; unknown lines are skipped.
pub fn scan_sdp(body: &[u8]) -> Vec<MediaDesc> {
    let text = String::from_utf8_lossy(body);
    let mut session_addr = String::new();
    let mut descs: Vec<MediaDesc> = Vec::new();
    let mut in_media = false;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("c=") {
            match (connection_addr(value), in_media) {
                (Some(addr), true) => {
                    if let Some(desc) = descs.last_mut() {
                        desc.addr = addr;
                    }
                }
                (Some(addr), false) => session_addr = addr,
                (None, _) => {}
            }
        } else if let Some(value) = line.strip_prefix("m=") {
            in_media = true;
            if let Some(desc) = media_desc(value, &session_addr) {
                descs.push(desc);
            }
        }
    }

    descs.retain(|d| !d.addr.is_empty() && d.port != 0);
    descs
}

/// `c=IN IP4 10.0.0.1` (or IP6).
fn connection_addr(value: &str) -> Option<String> {
    let mut fields = value.split_whitespace();
    if fields.next() != Some("IN") {
        return None;
    }
    let addrtype = fields.next()?;
    if addrtype != "IP4" && addrtype != "IP6" {
        return None;
    }
    fields.next().map(|a| a.to_owned())
}

/// `m=audio 49170 RTP/AVP 0 8 97`.
fn media_desc(value: &str, session_addr: &str) -> Option<MediaDesc> {
    let mut fields = value.split_whitespace();
    let media = fields.next()?.to_owned();
    let port = fields.next()?.parse().ok()?;
    let _proto = fields.next()?;
    let formats: Vec<String> = fields.map(|f| f.to_owned()).collect();
    Some(MediaDesc {
        addr: session_addr.to_owned(),
        port,
        media,
        formats,
    })
}
