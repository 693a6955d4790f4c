use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard};
use regex::bytes::Regex;
use tracing::{debug, trace, warn};

use crate::call::{Attr, Call, Verdict};
use crate::filter::{Filter, FilterField, FilterSet, FilterSpec, InvalidPattern};
use crate::media;
use crate::message::Message;
use crate::parse::{self, HeaderPatterns};
use crate::types::{Endpoint, Packet, SipMethod, Transport};
use crate::validate::{self, PayloadKind};

/// Capture policy: how many calls to keep and what to do when full.
#[derive(Debug, Clone)]
pub struct CaptureOpts {
    pub limit: u32,
    pub rotate: bool,
    pub rtp: bool,
    /// Raw packet trace destination; written by the capture frontend, the
    /// registry only carries it.
    pub outfile: Option<String>,
}

impl Default for CaptureOpts {
    fn default() -> Self {
        CaptureOpts {
            limit: 200,
            rotate: false,
            rtp: true,
            outfile: None,
        }
    }
}

/// Admission policy for new calls. Packets for already-tracked calls are
/// always appended.
#[derive(Debug, Clone, Default)]
pub struct MatchOpts {
    /// Only admit dialogs that open with an INVITE.
    pub invite: bool,
    /// Only admit dialogs captured from their start (no To-tag yet).
    pub complete: bool,
    /// Payload must match (or not match, with `minvert`) this expression.
    pub mexpr: Option<String>,
    pub minvert: bool,
    /// Match `mexpr` ignoring case.
    pub micase: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub by: Attr,
    pub asc: bool,
}

impl Default for SortSpec {
    fn default() -> Self {
        SortSpec {
            by: Attr::Date,
            asc: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub total: usize,
    pub displayed: usize,
}

/// Position of an accepted message: its call plus the offset within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgRef {
    pub callid: String,
    pub msg: usize,
}

struct Inner {
    calls: HashMap<String, Call>,
    /// Creation order; every tracked call appears exactly once.
    order: Vec<String>,
    /// Calls whose dialog has not reached a terminal state.
    active: Vec<String>,
    last_index: u64,
    filters: FilterSet,
    sort: SortSpec,
}

/// The call store. One producer feeds [`Registry::check_packet`]; any number
/// of consumers take read views concurrently. All mutation happens under a
/// single registry-wide write lock; parsing and regex matching run against
/// borrowed messages without it.
pub struct Registry {
    patterns: HeaderPatterns,
    capture: CaptureOpts,
    matching: MatchOpts,
    mexpr: Option<Regex>,
    inner: RwLock<Inner>,
    changed: AtomicBool,
    dropped: AtomicU64,
}

impl Registry {
    /// Compiles the header pattern set and the admission match expression.
    /// Nothing is committed unless every pattern compiles.
    pub fn new(
        capture: CaptureOpts,
        matching: MatchOpts,
        sort: SortSpec,
    ) -> Result<Registry, InvalidPattern> {
        let patterns = HeaderPatterns::compile()?;
        let mexpr = matching
            .mexpr
            .as_deref()
            .map(|expr| {
                if matching.micase {
                    Regex::new(&format!("(?i){expr}"))
                } else {
                    Regex::new(expr)
                }
            })
            .transpose()?;
        Ok(Registry {
            patterns,
            capture,
            matching,
            mexpr,
            inner: RwLock::new(Inner {
                calls: HashMap::new(),
                order: Vec::new(),
                active: Vec::new(),
                last_index: 0,
                filters: FilterSet::default(),
                sort,
            }),
            changed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn with_defaults() -> Result<Registry, InvalidPattern> {
        Registry::new(
            CaptureOpts::default(),
            MatchOpts::default(),
            SortSpec::default(),
        )
    }

    pub fn patterns(&self) -> &HeaderPatterns {
        &self.patterns
    }

    /// Ingest one assembled packet. Stream payloads may carry several SIP
    /// messages; each is validated and admitted on its own. Returns the
    /// position of the first accepted message, `None` if everything was
    /// dropped.
    pub fn check_packet(&self, packet: Packet) -> Option<MsgRef> {
        let Packet {
            src,
            dst,
            transport,
            ts,
            payload,
        } = packet;

        let mut first = None;
        let mut offset = 0;
        while offset < payload.len() {
            let chunk = &payload[offset..];
            let consumed = match validate::classify(chunk, transport) {
                PayloadKind::NotSip => {
                    self.bump_drop("payload is not SIP");
                    break;
                }
                PayloadKind::Partial => {
                    self.bump_drop("incomplete stream payload");
                    break;
                }
                PayloadKind::Complete => chunk.len(),
                PayloadKind::Multiple { consumed } => consumed,
            };
            let accepted =
                self.admit_message(&src, &dst, transport, ts, chunk[..consumed].to_vec());
            if first.is_none() {
                first = accepted;
            }
            offset += consumed;
        }
        first
    }

    fn admit_message(
        &self,
        src: &Endpoint,
        dst: &Endpoint,
        transport: Transport,
        ts: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Option<MsgRef> {
        let Some(callid) = parse::callid(&self.patterns, &payload) else {
            self.bump_drop("message without Call-ID");
            return None;
        };

        // Parse and scan outside the lock; the result is cached on the
        // message and reused by the append below.
        let msg = Message::new(src.clone(), dst.clone(), transport, ts, payload);
        let (parsed, is_invite, to_tag) = match msg.headers(&self.patterns) {
            Some(h) => (true, h.kind.method() == Some(SipMethod::Invite), h.to_tag),
            None => (false, false, false),
        };
        let descs = if self.capture.rtp {
            media::scan_sdp(msg.body(&self.patterns))
        } else {
            Vec::new()
        };

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if let Some(call) = inner.calls.get_mut(&callid) {
            let idx = call.append(msg, &self.patterns);
            if !descs.is_empty() {
                call.add_media(descs, src, ts);
            }
            if call.state().is_terminal() {
                inner.active.retain(|id| id != &callid);
            }
            self.changed.store(true, Ordering::Release);
            trace!(callid = %callid, msg = idx, "message appended");
            return Some(MsgRef { callid, msg: idx });
        }

        // New call: apply the admission policy.
        if !parsed {
            self.bump_drop("unparseable SIP message");
            return None;
        }
        if self.matching.invite && !is_invite {
            self.bump_drop("dialog does not start with INVITE");
            return None;
        }
        if self.matching.complete && to_tag {
            self.bump_drop("dialog already established before capture");
            return None;
        }
        if let Some(re) = &self.mexpr {
            if re.is_match(msg.payload()) == self.matching.minvert {
                self.bump_drop("match expression excluded payload");
                return None;
            }
        }

        while inner.order.len() >= self.capture.limit as usize {
            if !self.capture.rotate {
                self.bump_drop("capture limit reached");
                return None;
            }
            match evict_oldest(inner) {
                Some(evicted) => {
                    warn!(callid = %evicted, "rotated out oldest call");
                    self.changed.store(true, Ordering::Release);
                }
                None => {
                    // Every tracked call is locked.
                    self.bump_drop("capture limit reached, all calls locked");
                    return None;
                }
            }
        }

        inner.last_index += 1;
        let index = inner.last_index;
        let mut call = Call::new(index, callid.clone());
        let idx = call.append(msg, &self.patterns);
        if !descs.is_empty() {
            call.add_media(descs, src, ts);
        }
        if !call.state().is_terminal() {
            inner.active.push(callid.clone());
        }
        inner.order.push(callid.clone());
        inner.calls.insert(callid.clone(), call);
        self.changed.store(true, Ordering::Release);
        debug!(callid = %callid, index, "new call");
        Some(MsgRef { callid, msg: idx })
    }

    /// Record an RTP packet flowing from `src` to a negotiated media
    /// endpoint. Both endpoints select the owning stream, so calls whose
    /// media shares a relay destination stay apart. Returns false when no
    /// tracked stream matches.
    pub fn record_rtp(&self, src: &Endpoint, dst: &Endpoint, ts: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write();
        for call in inner.calls.values_mut() {
            if let Some(stream) = call.stream_for_rtp(src, dst) {
                if stream.src.port == 0 {
                    stream.src.port = src.port;
                }
                stream.record_packet(ts);
                return true;
            }
        }
        false
    }

    /// Read view over all tracked calls, in the current sort order.
    pub fn calls(&self) -> CallsView<'_> {
        CallsView {
            guard: self.inner.read(),
            patterns: &self.patterns,
            active: false,
        }
    }

    /// Read view restricted to calls still expecting signaling or media.
    pub fn active_calls(&self) -> CallsView<'_> {
        CallsView {
            guard: self.inner.read(),
            patterns: &self.patterns,
            active: true,
        }
    }

    pub fn stats(&self) -> Stats {
        let inner = self.inner.read();
        let displayed = inner
            .order
            .iter()
            .filter_map(|id| inner.calls.get(id))
            .filter(|call| self.passes(&inner, call))
            .count();
        Stats {
            total: inner.order.len(),
            displayed,
        }
    }

    /// Whether the call set changed since the last poll; clears atomically.
    pub fn has_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    /// Packets dropped so far: not-SIP payloads, parse failures, admission
    /// refusals and capacity drops.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Replace (or clear, with `None`) the filter on one field. On a bad
    /// pattern the existing filter state is preserved. Every cached verdict
    /// is invalidated.
    pub fn set_filter(
        &self,
        field: FilterField,
        spec: Option<FilterSpec>,
    ) -> Result<(), InvalidPattern> {
        let filter = spec.map(|s| Filter::compile(field, s)).transpose()?;
        let mut inner = self.inner.write();
        inner.filters.set(field, filter);
        for call in inner.calls.values() {
            call.reset_verdict();
        }
        Ok(())
    }

    pub fn set_sort(&self, sort: SortSpec) {
        self.inner.write().sort = sort;
    }

    pub fn sort_spec(&self) -> SortSpec {
        self.inner.read().sort
    }

    /// Exempt a call from rotation (or re-include it).
    pub fn set_locked(&self, callid: &str, locked: bool) -> bool {
        let mut inner = self.inner.write();
        match inner.calls.get_mut(callid) {
            Some(call) => {
                call.set_locked(locked);
                true
            }
            None => false,
        }
    }

    /// Destroy every tracked call.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        if !inner.order.is_empty() {
            self.changed.store(true, Ordering::Release);
        }
        inner.calls.clear();
        inner.order.clear();
        inner.active.clear();
    }

    /// Destroy the calls that do not pass the current filters.
    pub fn clear_filtered(&self) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let rejected: Vec<String> = inner
            .order
            .iter()
            .filter_map(|id| inner.calls.get(id))
            .filter(|call| !self.passes(inner, call))
            .map(|call| call.callid().to_owned())
            .collect();
        if rejected.is_empty() {
            return;
        }
        for id in &rejected {
            inner.calls.remove(id);
        }
        inner.order.retain(|id| inner.calls.contains_key(id));
        inner.active.retain(|id| inner.calls.contains_key(id));
        debug!(removed = rejected.len(), "cleared filtered-out calls");
        self.changed.store(true, Ordering::Release);
    }

    fn passes(&self, inner: &Inner, call: &Call) -> bool {
        match call.verdict() {
            Verdict::Pass => true,
            Verdict::Reject => false,
            Verdict::Unknown => {
                let pass = inner.filters.matches(call, &self.patterns);
                call.cache_verdict(pass);
                pass
            }
        }
    }

    fn bump_drop(&self, reason: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        trace!(reason, "packet dropped");
    }
}

/// Remove the oldest non-locked call from every index.
fn evict_oldest(inner: &mut Inner) -> Option<String> {
    let pos = inner
        .order
        .iter()
        .position(|id| inner.calls.get(id).map_or(true, |c| !c.locked()))?;
    let id = inner.order.remove(pos);
    inner.calls.remove(&id);
    inner.active.retain(|a| a != &id);
    Some(id)
}

/// A consistent snapshot of the call set, held under the shared registry
/// lock for the lifetime of the view.
pub struct CallsView<'a> {
    guard: RwLockReadGuard<'a, Inner>,
    patterns: &'a HeaderPatterns,
    active: bool,
}

impl CallsView<'_> {
    fn ids(&self) -> &[String] {
        if self.active {
            &self.guard.active
        } else {
            &self.guard.order
        }
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids().is_empty()
    }

    /// Calls in the current sort order; ties keep creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Call> {
        let mut calls: Vec<&Call> = self
            .ids()
            .iter()
            .filter_map(|id| self.guard.calls.get(id))
            .collect();
        sort_calls(&mut calls, self.guard.sort, self.patterns);
        calls.into_iter()
    }

    pub fn by_callid(&self, callid: &str) -> Option<&Call> {
        self.guard.calls.get(callid)
    }

    pub fn by_index(&self, index: u64) -> Option<&Call> {
        self.guard.calls.values().find(|c| c.index() == index)
    }

    /// Resolve a call's X-Call-ID link against the registry.
    pub fn linked_call(&self, call: &Call) -> Option<&Call> {
        self.by_callid(call.xcallid()?)
    }

    pub fn patterns(&self) -> &HeaderPatterns {
        self.patterns
    }
}

fn sort_calls(calls: &mut [&Call], sort: SortSpec, patterns: &HeaderPatterns) {
    calls.sort_by(|a, b| {
        let ka = a.attribute(sort.by, patterns);
        let kb = b.attribute(sort.by, patterns);
        let primary = if sort.by.is_numeric() {
            let na: u64 = ka.parse().unwrap_or(0);
            let nb: u64 = kb.parse().unwrap_or(0);
            na.cmp(&nb)
        } else {
            ka.cmp(&kb)
        };
        // Only the sort key reverses; equal keys always keep creation order.
        let primary = if sort.asc { primary } else { primary.reverse() };
        primary.then_with(|| a.index().cmp(&b.index()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn packet(secs: u32, payload: &[u8]) -> Packet {
        Packet {
            src: Endpoint::new("10.0.0.1", 5060),
            dst: Endpoint::new("10.0.0.2", 5060),
            transport: Transport::Udp,
            ts: Utc.with_ymd_and_hms(2026, 2, 12, 10, 0, secs).unwrap(),
            payload: payload.to_vec(),
        }
    }

    fn invite(callid: &str) -> Vec<u8> {
        format!(
            "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
             From: <sip:alice@atlanta.com>;tag=1\r\n\
             To: <sip:bob@biloxi.com>\r\n\
             Call-ID: {callid}\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Length: 0\r\n\
             \r\n"
        )
        .into_bytes()
    }

    fn registry() -> Registry {
        Registry::with_defaults().unwrap()
    }

    #[test]
    fn by_callid_unique_and_in_order() {
        let reg = registry();
        for (i, id) in ["c1", "c2", "c3"].iter().enumerate() {
            reg.check_packet(packet(i as u32, &invite(id)));
        }
        let view = reg.calls();
        assert_eq!(view.len(), 3);
        for id in ["c1", "c2", "c3"] {
            assert_eq!(view.by_callid(id).unwrap().callid(), id);
        }
        let indices: Vec<u64> = view.iter().map(|c| c.index()).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(view.by_index(2).unwrap().callid(), "c2");
        assert!(view.by_index(99).is_none());
    }

    #[test]
    fn rotation_evicts_oldest() {
        let reg = Registry::new(
            CaptureOpts {
                limit: 2,
                rotate: true,
                ..CaptureOpts::default()
            },
            MatchOpts::default(),
            SortSpec::default(),
        )
        .unwrap();
        for (i, id) in ["c1", "c2", "c3"].iter().enumerate() {
            reg.check_packet(packet(i as u32, &invite(id)));
        }
        let view = reg.calls();
        assert_eq!(view.len(), 2);
        assert!(view.by_callid("c1").is_none());
        let ids: Vec<&str> = view.iter().map(|c| c.callid()).collect();
        assert_eq!(ids, vec!["c2", "c3"]);
    }

    #[test]
    fn rotation_skips_locked_calls() {
        let reg = Registry::new(
            CaptureOpts {
                limit: 2,
                rotate: true,
                ..CaptureOpts::default()
            },
            MatchOpts::default(),
            SortSpec::default(),
        )
        .unwrap();
        reg.check_packet(packet(0, &invite("keep")));
        reg.check_packet(packet(1, &invite("old")));
        assert!(reg.set_locked("keep", true));
        reg.check_packet(packet(2, &invite("new")));

        let view = reg.calls();
        let ids: Vec<&str> = view.iter().map(|c| c.callid()).collect();
        assert_eq!(ids, vec!["keep", "new"]);
    }

    #[test]
    fn limit_without_rotation_drops_new() {
        let reg = Registry::new(
            CaptureOpts {
                limit: 2,
                rotate: false,
                ..CaptureOpts::default()
            },
            MatchOpts::default(),
            SortSpec::default(),
        )
        .unwrap();
        for (i, id) in ["c1", "c2", "c3"].iter().enumerate() {
            reg.check_packet(packet(i as u32, &invite(id)));
        }
        let view = reg.calls();
        let ids: Vec<&str> = view.iter().map(|c| c.callid()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        drop(view);
        assert_eq!(reg.drop_count(), 1);
    }

    #[test]
    fn indices_never_reused_after_rotation() {
        let reg = Registry::new(
            CaptureOpts {
                limit: 1,
                rotate: true,
                ..CaptureOpts::default()
            },
            MatchOpts::default(),
            SortSpec::default(),
        )
        .unwrap();
        reg.check_packet(packet(0, &invite("a")));
        reg.check_packet(packet(1, &invite("b")));
        reg.check_packet(packet(2, &invite("c")));
        let view = reg.calls();
        assert_eq!(view.by_callid("c").unwrap().index(), 3);
    }

    #[test]
    fn changed_flag_set_and_cleared() {
        let reg = registry();
        assert!(!reg.has_changed());
        reg.check_packet(packet(0, &invite("c1")));
        assert!(reg.has_changed());
        assert!(!reg.has_changed());
        // Append to an existing call also raises it.
        reg.check_packet(packet(1, b"SIP/2.0 100 Trying\r\nCall-ID: c1\r\nCSeq: 1 INVITE\r\n\r\n"));
        assert!(reg.has_changed());
    }

    #[test]
    fn dropped_packets_do_not_raise_changed() {
        let reg = registry();
        reg.check_packet(packet(0, b"\x80\x00 rtp-ish bytes"));
        reg.check_packet(packet(1, b"OPTIONS sip:h SIP/2.0\r\n\r\n")); // no Call-ID
        assert!(!reg.has_changed());
        assert_eq!(reg.drop_count(), 2);
    }

    #[test]
    fn tcp_payload_with_two_messages() {
        let reg = registry();
        let mut payload =
            b"OPTIONS sip:h SIP/2.0\r\nCall-ID: t1\r\nContent-Length: 0\r\n\r\n".to_vec();
        payload.extend_from_slice(
            b"OPTIONS sip:h SIP/2.0\r\nCall-ID: t2\r\nContent-Length: 0\r\n\r\n",
        );
        let mut pkt = packet(0, &payload);
        pkt.transport = Transport::Tcp;
        let first = reg.check_packet(pkt).unwrap();
        assert_eq!(first.callid, "t1");
        assert_eq!(reg.calls().len(), 2);
    }

    #[test]
    fn active_calls_shrink_on_terminal_state() {
        let reg = registry();
        reg.check_packet(packet(0, &invite("c1")));
        reg.check_packet(packet(1, &invite("c2")));
        assert_eq!(reg.active_calls().len(), 2);

        reg.check_packet(packet(
            2,
            b"SIP/2.0 200 OK\r\nCall-ID: c1\r\nCSeq: 1 INVITE\r\n\r\n",
        ));
        reg.check_packet(packet(
            3,
            b"BYE sip:b SIP/2.0\r\nCall-ID: c1\r\nCSeq: 2 BYE\r\n\r\n",
        ));
        reg.check_packet(packet(
            4,
            b"SIP/2.0 200 OK\r\nCall-ID: c1\r\nCSeq: 2 BYE\r\n\r\n",
        ));

        let active = reg.active_calls();
        let ids: Vec<&str> = active.iter().map(|c| c.callid()).collect();
        assert_eq!(ids, vec!["c2"]);
        drop(active);
        assert_eq!(reg.calls().len(), 2);
    }

    #[test]
    fn stats_reflect_filters() {
        let reg = registry();
        reg.check_packet(packet(0, &invite("c1")));
        reg.check_packet(packet(1, &invite("c2")));
        assert_eq!(reg.stats(), Stats { total: 2, displayed: 2 });

        reg.set_filter(
            FilterField::CallListLine,
            Some(FilterSpec {
                expr: "c1".into(),
                ignore_case: false,
                invert: false,
            }),
        )
        .unwrap();
        assert_eq!(reg.stats(), Stats { total: 2, displayed: 1 });
    }

    #[test]
    fn bad_filter_preserves_previous_state() {
        let reg = registry();
        reg.check_packet(packet(0, &invite("c1")));
        reg.set_filter(
            FilterField::From,
            Some(FilterSpec {
                expr: "alice".into(),
                ignore_case: false,
                invert: false,
            }),
        )
        .unwrap();
        assert!(reg
            .set_filter(
                FilterField::From,
                Some(FilterSpec {
                    expr: "(".into(),
                    ignore_case: false,
                    invert: false,
                }),
            )
            .is_err());
        // The earlier filter still applies.
        assert_eq!(reg.stats().displayed, 1);
        reg.check_packet(packet(
            1,
            b"INVITE sip:h SIP/2.0\r\nFrom: <sip:carol@h>\r\nTo: <sip:d@h>\r\nCall-ID: c2\r\nCSeq: 1 INVITE\r\n\r\n",
        ));
        assert_eq!(reg.stats(), Stats { total: 2, displayed: 1 });
    }

    #[test]
    fn invalid_mexpr_fails_init() {
        let result = Registry::new(
            CaptureOpts::default(),
            MatchOpts {
                mexpr: Some("(".into()),
                ..MatchOpts::default()
            },
            SortSpec::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn mexpr_admission() {
        let reg = Registry::new(
            CaptureOpts::default(),
            MatchOpts {
                mexpr: Some("atlanta".into()),
                ..MatchOpts::default()
            },
            SortSpec::default(),
        )
        .unwrap();
        assert!(reg.check_packet(packet(0, &invite("c1"))).is_some());
        assert!(reg
            .check_packet(packet(
                1,
                b"INVITE sip:h SIP/2.0\r\nFrom: <sip:x@elsewhere>\r\nCall-ID: c2\r\nCSeq: 1 INVITE\r\n\r\n",
            ))
            .is_none());
        assert_eq!(reg.calls().len(), 1);
    }

    #[test]
    fn mexpr_invert() {
        let reg = Registry::new(
            CaptureOpts::default(),
            MatchOpts {
                mexpr: Some("atlanta".into()),
                minvert: true,
                ..MatchOpts::default()
            },
            SortSpec::default(),
        )
        .unwrap();
        assert!(reg.check_packet(packet(0, &invite("c1"))).is_none());
    }

    #[test]
    fn clear_and_clear_filtered() {
        let reg = registry();
        reg.check_packet(packet(0, &invite("c1")));
        reg.check_packet(packet(
            1,
            b"INVITE sip:h SIP/2.0\r\nFrom: <sip:carol@h>\r\nCall-ID: c2\r\nCSeq: 1 INVITE\r\n\r\n",
        ));
        reg.set_filter(
            FilterField::From,
            Some(FilterSpec {
                expr: "alice".into(),
                ignore_case: false,
                invert: false,
            }),
        )
        .unwrap();
        let _ = reg.has_changed();

        reg.clear_filtered();
        assert!(reg.has_changed());
        let ids: Vec<String> = reg.calls().iter().map(|c| c.callid().to_owned()).collect();
        assert_eq!(ids, vec!["c1"]);

        reg.clear();
        assert!(reg.calls().is_empty());
        assert!(reg.active_calls().is_empty());
        assert!(reg.has_changed());
    }

    #[test]
    fn sort_by_method_descending() {
        let reg = registry();
        reg.check_packet(packet(0, &invite("ci")));
        reg.check_packet(packet(
            1,
            b"OPTIONS sip:h SIP/2.0\r\nCall-ID: co\r\nCSeq: 1 OPTIONS\r\n\r\n",
        ));
        reg.set_sort(SortSpec {
            by: Attr::Method,
            asc: true,
        });
        let ids: Vec<String> = reg.calls().iter().map(|c| c.callid().to_owned()).collect();
        assert_eq!(ids, vec!["ci", "co"]); // INVITE < OPTIONS

        reg.set_sort(SortSpec {
            by: Attr::Method,
            asc: false,
        });
        let ids: Vec<String> = reg.calls().iter().map(|c| c.callid().to_owned()).collect();
        assert_eq!(ids, vec!["co", "ci"]);
    }

    #[test]
    fn descending_sort_keeps_creation_order_on_ties() {
        let reg = registry();
        reg.check_packet(packet(0, &invite("t1")));
        reg.check_packet(packet(1, &invite("t2")));
        reg.set_sort(SortSpec {
            by: Attr::Method,
            asc: false,
        });
        // Both calls render METHOD as INVITE; the tie still resolves in
        // creation order even though the sort is descending.
        let ids: Vec<String> = reg.calls().iter().map(|c| c.callid().to_owned()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[test]
    fn sort_numeric_by_msgcnt() {
        let reg = registry();
        reg.check_packet(packet(0, &invite("big")));
        for i in 1..=10 {
            reg.check_packet(packet(
                i,
                b"SIP/2.0 180 Ringing\r\nCall-ID: big\r\nCSeq: 1 INVITE\r\n\r\n",
            ));
        }
        reg.check_packet(packet(11, &invite("small")));
        reg.set_sort(SortSpec {
            by: Attr::MsgCount,
            asc: false,
        });
        let ids: Vec<String> = reg.calls().iter().map(|c| c.callid().to_owned()).collect();
        assert_eq!(ids, vec!["big", "small"]);
    }

    fn invite_with_sdp(callid: &str, media_addr: &str) -> Vec<u8> {
        let sdp = format!("v=0\r\nc=IN IP4 {media_addr}\r\nm=audio 4000 RTP/AVP 0\r\n");
        let mut bytes = format!(
            "INVITE sip:h SIP/2.0\r\nCall-ID: {callid}\r\nCSeq: 1 INVITE\r\n\
             Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n",
            sdp.len()
        )
        .into_bytes();
        bytes.extend_from_slice(sdp.as_bytes());
        bytes
    }

    #[test]
    fn record_rtp_updates_stream() {
        let reg = registry();
        reg.check_packet(packet(0, &invite_with_sdp("m1", "10.0.0.1")));

        let media_src = Endpoint::new("10.0.0.1", 32000);
        let media_dst = Endpoint::new("10.0.0.1", 4000);
        let ts = Utc.with_ymd_and_hms(2026, 2, 12, 10, 0, 5).unwrap();
        assert!(reg.record_rtp(&media_src, &media_dst, ts));
        // Unknown destination or foreign source host never match.
        assert!(!reg.record_rtp(&media_src, &Endpoint::new("10.9.9.9", 4000), ts));
        assert!(!reg.record_rtp(&Endpoint::new("10.9.9.9", 32000), &media_dst, ts));

        let view = reg.calls();
        let call = view.by_callid("m1").unwrap();
        assert_eq!(call.streams().len(), 1);
        assert_eq!(call.streams()[0].packets, 1);
        assert_eq!(call.streams()[0].last_seen, ts);
        // The first packet pins the previously unknown source port.
        assert_eq!(call.streams()[0].src, media_src);
    }

    #[test]
    fn record_rtp_separates_calls_sharing_a_relay() {
        let reg = registry();
        // Two dialogs advertise the same media relay as their destination.
        reg.check_packet(packet(0, &invite_with_sdp("m1", "198.51.100.5")));
        let mut second = packet(1, &invite_with_sdp("m2", "198.51.100.5"));
        second.src = Endpoint::new("10.0.0.7", 5060);
        reg.check_packet(second);

        let relay = Endpoint::new("198.51.100.5", 4000);
        let ts = Utc.with_ymd_and_hms(2026, 2, 12, 10, 0, 5).unwrap();
        assert!(reg.record_rtp(&Endpoint::new("10.0.0.7", 31000), &relay, ts));

        let view = reg.calls();
        assert_eq!(view.by_callid("m2").unwrap().streams()[0].packets, 1);
        assert_eq!(view.by_callid("m1").unwrap().streams()[0].packets, 0);
    }

    #[test]
    fn rtp_disabled_skips_media() {
        let reg = Registry::new(
            CaptureOpts {
                rtp: false,
                ..CaptureOpts::default()
            },
            MatchOpts::default(),
            SortSpec::default(),
        )
        .unwrap();
        let sdp = b"c=IN IP4 10.0.0.1\r\nm=audio 4000 RTP/AVP 0\r\n";
        let payload = format!(
            "INVITE sip:h SIP/2.0\r\nCall-ID: m1\r\nCSeq: 1 INVITE\r\nContent-Length: {}\r\n\r\n",
            sdp.len()
        );
        let mut bytes = payload.into_bytes();
        bytes.extend_from_slice(sdp);
        reg.check_packet(packet(0, &bytes));
        assert!(reg.calls().by_callid("m1").unwrap().streams().is_empty());
    }

    #[test]
    fn message_arrival_order_is_kept() {
        let reg = registry();
        reg.check_packet(packet(5, &invite("o1")));
        // An earlier-stamped packet arriving later still appends at the end.
        reg.check_packet(packet(
            2,
            b"SIP/2.0 100 Trying\r\nCall-ID: o1\r\nCSeq: 1 INVITE\r\n\r\n",
        ));
        let view = reg.calls();
        let call = view.by_callid("o1").unwrap();
        assert_eq!(call.msgs().len(), 2);
        let kinds: Vec<u16> = call
            .msgs()
            .iter()
            .map(|m| m.headers(view.patterns()).unwrap().kind.code())
            .collect();
        assert_eq!(kinds, vec![SipMethod::Invite.code(), 100]);
    }
}
