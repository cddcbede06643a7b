//! Pure functions over a decoded DNS message. Nothing here does I/O; everything takes an
//! already-parsed [`Message`] and returns owned data so callers aren't tied to its lifetime.

use std::collections::HashSet;

use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, Name, Record, RecordType};

use crate::query::{Bailiwick, Query};

/// `validate` failed: the response's question section doesn't match what we asked, and an
/// error rcode wasn't present to explain why. Per spec, this never aborts a traversal; the
/// caller folds it into [`crate::response::Outcome::OtherError`].
#[derive(Debug, thiserror::Error)]
#[error("response question section does not match query for {0}")]
pub struct ValidationError(pub String);

/// Succeeds iff the rcode is not NoError, or the message carries exactly one question whose
/// `(qname, qclass, qtype)` matches `expected`, case-insensitively on the name.
pub fn validate(msg: &Message, expected: &Query) -> Result<(), ValidationError> {
    if msg.response_code() != hickory_proto::op::ResponseCode::NoError {
        return Ok(());
    }
    let questions = msg.queries();
    if questions.len() != 1 {
        return Err(ValidationError(format!(
            "{} question(s), expected 1",
            questions.len()
        )));
    }
    let q = &questions[0];
    if !q.name().eq_case_insensitive(&expected.qname)
        || q.query_class() != expected.qclass
        || q.query_type() != expected.qtype
    {
        return Err(ValidationError(format!(
            "question {} {} {} does not match {} {} {}",
            q.name(),
            q.query_class(),
            q.query_type(),
            expected.qname,
            expected.qclass,
            expected.qtype
        )));
    }
    Ok(())
}

/// Answer-section RRs matching `(name, class, type)`. `RecordType::ANY` matches every type.
pub fn answers(msg: &Message, qname: &Name, qtype: RecordType, qclass: DNSClass) -> Vec<Record> {
    filter_section(msg.answers(), qname, qtype, qclass)
}

/// Additional-section RRs matching `(name, class, type)`, used to pull glue for NS targets.
pub fn additional(msg: &Message, qname: &Name, qtype: RecordType, qclass: DNSClass) -> Vec<Record> {
    filter_section(msg.additionals(), qname, qtype, qclass)
}

fn filter_section(
    section: &[Record],
    qname: &Name,
    qtype: RecordType,
    qclass: DNSClass,
) -> Vec<Record> {
    section
        .iter()
        .filter(|r| r.name().eq_case_insensitive(qname))
        .filter(|r| r.dns_class() == qclass)
        .filter(|r| qtype == RecordType::ANY || r.record_type() == qtype)
        .cloned()
        .collect()
}

/// The authority section split into NS, SOA, and everything else.
pub fn authority_partition(msg: &Message) -> (Vec<Record>, Vec<Record>, Vec<Record>) {
    let mut ns = Vec::new();
    let mut soa = Vec::new();
    let mut other = Vec::new();
    for r in msg.name_servers() {
        match r.record_type() {
            RecordType::NS => ns.push(r.clone()),
            RecordType::SOA => soa.push(r.clone()),
            _ => other.push(r.clone()),
        }
    }
    (ns, soa, other)
}

/// Outcome of chasing a CNAME chain starting at `qname`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CnameChase {
    /// An RR of the target qtype was found for `.0`, or no CNAME was present for it: chasing
    /// stops here and `.0` is the name to report as the (possibly rewritten) answer owner.
    Final(Name),
    /// The chain left the bailiwick at `.0`; the target name is returned but not chased
    /// further (the next hop would need a separate, out-of-bailiwick referral/answer).
    LeftBailiwick(Name),
    /// A previously visited name reappeared: a CNAME loop.
    Loop,
}

/// Repeatedly rewrites `qname` along CNAME RRs in the answer section until an RR of `qtype`
/// appears for the current name, no CNAME covers the current name, the current name leaves
/// `bailiwick`, or a name repeats (loop). The visited-set is local to this call, so calling
/// this twice on the same message is idempotent: the second call starts fresh from the same
/// `qname` and walks the identical chain to the identical fixed point.
pub fn follow_cnames(msg: &Message, qname: &Name, qtype: RecordType, bailiwick: &Bailiwick) -> CnameChase {
    let mut current = qname.clone();
    let mut visited = HashSet::new();
    loop {
        if !visited.insert(current.clone()) {
            return CnameChase::Loop;
        }
        if !bailiwick.contains(&current) {
            return CnameChase::LeftBailiwick(current);
        }
        if !answers(msg, &current, qtype, DNSClass::IN).is_empty() {
            return CnameChase::Final(current);
        }
        let cnames = answers(msg, &current, RecordType::CNAME, DNSClass::IN);
        let Some(target) = cnames.first().and_then(|r| r.data()).and_then(|d| d.as_cname()) else {
            return CnameChase::Final(current);
        };
        current = target.0.clone();
    }
}

/// True iff the authority section has at least one SOA, or has no NS at all — the
/// conventional NOERROR-with-no-answer "NODATA" signal.
pub fn is_nodata(msg: &Message) -> bool {
    let (ns, soa, _) = authority_partition(msg);
    !soa.is_empty() || ns.is_empty()
}

/// RRs from answer+authority+additional partitioned by whether they're in-bailiwick. Only
/// `good` is safe to cache; `bad` is discarded (a delegating server injecting records it has
/// no authority over is cache poisoning, not data); `other` is non-RR-ish chaff like OPT.
pub struct Cacheable {
    pub good: Vec<Record>,
    pub bad: Vec<Record>,
    pub other: Vec<Record>,
}

pub fn cacheable(msg: &Message, bailiwick: &Bailiwick) -> Cacheable {
    let mut good = Vec::new();
    let mut bad = Vec::new();
    let mut other = Vec::new();
    let all = msg.answers().iter().chain(msg.name_servers()).chain(msg.additionals());
    for r in all {
        match r.record_type() {
            RecordType::OPT => other.push(r.clone()),
            _ => {
                if bailiwick.contains(r.name()) {
                    good.push(r.clone());
                } else {
                    bad.push(r.clone());
                }
            }
        }
    }
    Cacheable { good, bad, other }
}

/// Message-level warnings: never failures, always surfaced alongside the classified outcome.
pub fn header_warnings(msg: &Message, recursion_desired: bool) -> Vec<String> {
    let mut warnings = Vec::new();
    let header = msg.header();
    if header.recursion_available() != recursion_desired {
        warnings.push(format!(
            "recursion-available bit {} (desired {})",
            header.recursion_available(),
            recursion_desired
        ));
    }
    if header.truncated() {
        warnings.push("truncated (TC bit set)".to_string());
    }
    warnings
}
