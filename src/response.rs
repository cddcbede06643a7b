//! A single send/receive attempt against one server IP, classified into an [`Outcome`].

use std::net::IpAddr;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use tracing::{instrument, warn};

use crate::backend::Backend;
use crate::error::QueryError;
use crate::message::{self, CnameChase};
use crate::query::{Bailiwick, Query};

/// The classified shape of one server's answer to one query, per spec §3/§4.2.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Outcome {
    Answer,
    NoData,
    NxDomain,
    Referral,
    ReferralLame,
    CnameLoop,
    Timeout,
    FormErr,
    ServFail,
    OtherError,
}

impl Outcome {
    /// Whether this outcome yields children during referral expansion. Kept as a single
    /// exhaustive match so a new variant is a compile error until every consumer accounts
    /// for it (per the Design Notes' "dispatch by outcome" guidance).
    pub fn expands(self) -> bool {
        matches!(self, Outcome::Referral | Outcome::Answer)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Answer => "ANSWER",
            Outcome::NoData => "NODATA",
            Outcome::NxDomain => "NXDOMAIN",
            Outcome::Referral => "REFERRAL",
            Outcome::ReferralLame => "REFERRAL_LAME",
            Outcome::CnameLoop => "CNAME_LOOP",
            Outcome::Timeout => "TIMEOUT",
            Outcome::FormErr => "FORMERR",
            Outcome::ServFail => "SERVFAIL",
            Outcome::OtherError => "OTHER_ERROR",
        };
        write!(f, "{s}")
    }
}

/// One server IP's classified response, plus enough of the decoded message for the caller
/// (referral expansion) to extract NS/glue/CNAME data without re-parsing.
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    pub server_ip: IpAddr,
    pub query: Query,
    pub bailiwick: Bailiwick,
    pub outcome: Outcome,
    pub message: Option<Message>,
    /// The name the CNAME chain settled on, when the outcome is `Answer` and chasing moved
    /// off the original qname.
    pub final_name: Option<hickory_proto::rr::Name>,
    pub warnings: Vec<String>,
    pub rtt: Duration,
}

/// Sends `query` to `server_ip`, retrying transport failures up to `retries` times (each
/// attempt bounded by `attempt_timeout`), then classifies the result per spec §4.2's ordered
/// rules. Never returns an `Err`: every failure mode becomes a terminal [`Outcome`] so one
/// bad server can't abort a traversal.
#[instrument(skip(backend), fields(%server_ip, %query))]
#[allow(clippy::too_many_arguments)]
pub async fn query_and_classify(
    backend: &dyn Backend,
    server_ip: IpAddr,
    query: &Query,
    bailiwick: &Bailiwick,
    always_tcp: bool,
    allow_tcp: bool,
    udp_size: u16,
    retries: u32,
    attempt_timeout: Duration,
) -> DecodedResponse {
    let started = Instant::now();
    let mut last_err: Option<QueryError> = None;
    let mut message: Option<Message> = None;
    let mut effective_tcp = always_tcp;

    for _attempt in 0..=retries {
        match backend.query(server_ip, query, effective_tcp, udp_size, attempt_timeout).await {
            Ok(msg) => {
                if msg.header().truncated() && !effective_tcp && allow_tcp {
                    // Escalate to TCP on truncation, consuming one more attempt.
                    effective_tcp = true;
                    match backend.query(server_ip, query, true, udp_size, attempt_timeout).await {
                        Ok(tcp_msg) => {
                            message = Some(tcp_msg);
                        }
                        Err(e) => last_err = Some(e),
                    }
                } else {
                    message = Some(msg);
                }
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }

    let rtt = started.elapsed();

    let Some(msg) = message else {
        let outcome = match last_err {
            Some(QueryError::Malformed(_)) => Outcome::FormErr,
            Some(QueryError::Timeout(_)) | None => Outcome::Timeout,
            Some(QueryError::Transport(_)) => Outcome::OtherError,
        };
        return DecodedResponse {
            server_ip,
            query: query.clone(),
            bailiwick: bailiwick.clone(),
            outcome,
            message: None,
            final_name: None,
            warnings: vec![],
            rtt,
        };
    };

    classify(server_ip, query, bailiwick, msg, rtt)
}

fn classify(
    server_ip: IpAddr,
    query: &Query,
    bailiwick: &Bailiwick,
    msg: Message,
    rtt: Duration,
) -> DecodedResponse {
    let mut warnings = message::header_warnings(&msg, false);

    let base = |outcome: Outcome, final_name: Option<hickory_proto::rr::Name>, warnings: Vec<String>| {
        DecodedResponse {
            server_ip,
            query: query.clone(),
            bailiwick: bailiwick.clone(),
            outcome,
            message: Some(msg.clone()),
            final_name,
            warnings,
            rtt,
        }
    };

    if msg.response_code() == ResponseCode::ServFail {
        return base(Outcome::ServFail, None, warnings);
    }
    if msg.response_code() == ResponseCode::NXDomain {
        return base(Outcome::NxDomain, None, warnings);
    }
    if let Err(e) = message::validate(&msg, query) {
        warnings.push(e.to_string());
        return base(Outcome::OtherError, None, warnings);
    }

    match message::follow_cnames(&msg, &query.qname, query.qtype, bailiwick) {
        CnameChase::Loop => return base(Outcome::CnameLoop, None, warnings),
        CnameChase::Final(name) => {
            if !message::answers(&msg, &name, query.qtype, query.qclass).is_empty() {
                return base(Outcome::Answer, Some(name), warnings);
            }
            // no CNAME, no matching answer for this name: fall through to NS/NODATA checks
        }
        CnameChase::LeftBailiwick(name) => {
            // Answer section had a CNAME pointing out of bailiwick; this is still an
            // "answer" in the sense that it terminates the branch and yields a CNAME
            // restart for the caller to chase from scratch at the new name.
            return base(Outcome::Answer, Some(name), warnings);
        }
    }

    let (ns, _soa, _other) = message::authority_partition(&msg);
    if !ns.is_empty() {
        let mut any_in = false;
        let mut any_out = false;
        for rr in &ns {
            if bailiwick.contains(rr.name()) {
                any_in = true;
            } else {
                any_out = true;
            }
        }
        if any_in {
            let outcome = if any_out { Outcome::ReferralLame } else { Outcome::Referral };
            if any_out {
                warn!(%query, "referral contains out-of-bailiwick NS target(s)");
                warnings.push("referral contains out-of-bailiwick NS target(s)".to_string());
            }
            return base(outcome, None, warnings);
        } else {
            // every NS target is lame
            warnings.push("every NS target in referral lies outside bailiwick".to_string());
            return base(Outcome::OtherError, None, warnings);
        }
    }

    if message::is_nodata(&msg) {
        return base(Outcome::NoData, None, warnings);
    }

    base(Outcome::OtherError, None, warnings)
}

/// The qtype to use for a CNAME-restart sub-query: `ANY`-qtype queries never restart since
/// `ANY` matches everything already.
pub fn restarts(query: &Query, final_name: &hickory_proto::rr::Name) -> bool {
    query.qtype != RecordType::CNAME && !final_name.eq_case_insensitive(&query.qname)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::{a, answer, cname, ns, refer};
    use anyhow::Result;
    use hickory_proto::op::Header;
    use hickory_proto::rr::{rdata, RData, Record};

    #[tokio::test]
    async fn test_classify_answer() -> Result<()> {
        let backend = FakeBackend::new();
        backend.add(
            "192.0.2.1",
            "example.com.",
            RecordType::A,
            answer!(a!("example.com.", "192.0.2.10")),
        );
        let query = Query::new("example.com.".parse()?, RecordType::A);
        let bw = Bailiwick::root();
        let resp = query_and_classify(
            &backend,
            "192.0.2.1".parse()?,
            &query,
            &bw,
            false,
            true,
            1232,
            2,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(resp.outcome, Outcome::Answer);
        Ok(())
    }

    #[tokio::test]
    async fn test_classify_timeout() -> Result<()> {
        let backend = FakeBackend::new();
        let query = Query::new("example.com.".parse()?, RecordType::A);
        let bw = Bailiwick::root();
        let resp = query_and_classify(
            &backend,
            "192.0.2.1".parse()?,
            &query,
            &bw,
            false,
            true,
            1232,
            0,
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(resp.outcome, Outcome::Timeout);
        Ok(())
    }

    #[tokio::test]
    async fn test_classify_referral() -> Result<()> {
        let backend = FakeBackend::new();
        backend.add(
            "192.0.2.1",
            "example.com.",
            RecordType::A,
            refer!(ns!("example.com.", "ns.example.com."), a!("ns.example.com.", "192.0.2.2")),
        );
        let query = Query::new("example.com.".parse()?, RecordType::A);
        let bw = Bailiwick::root();
        let resp = query_and_classify(
            &backend,
            "192.0.2.1".parse()?,
            &query,
            &bw,
            false,
            true,
            1232,
            2,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(resp.outcome, Outcome::Referral);
        Ok(())
    }

    #[tokio::test]
    async fn test_classify_referral_lame() -> Result<()> {
        let backend = FakeBackend::new();
        backend.add(
            "192.0.2.1",
            "example.com.",
            RecordType::A,
            refer!(ns!("example.com.", "ns.evil.net.")),
        );
        let query = Query::new("example.com.".parse()?, RecordType::A);
        let bw = Bailiwick::new("com.".parse()?);
        let resp = query_and_classify(
            &backend,
            "192.0.2.1".parse()?,
            &query,
            &bw,
            false,
            true,
            1232,
            2,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(resp.outcome, Outcome::ReferralLame);
        Ok(())
    }

    #[tokio::test]
    async fn test_classify_cname_loop() -> Result<()> {
        let backend = FakeBackend::new();
        let mut msg = Message::new();
        msg.insert_answers(vec![
            cname!("a.example.com.", "b.example.com."),
            cname!("b.example.com.", "a.example.com."),
        ]);
        backend.add("192.0.2.1", "a.example.com.", RecordType::A, msg);
        let query = Query::new("a.example.com.".parse()?, RecordType::A);
        let bw = Bailiwick::new("example.com.".parse()?);
        let resp = query_and_classify(
            &backend,
            "192.0.2.1".parse()?,
            &query,
            &bw,
            false,
            true,
            1232,
            2,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(resp.outcome, Outcome::CnameLoop);
        Ok(())
    }

    #[tokio::test]
    async fn test_classify_nodata() -> Result<()> {
        let backend = FakeBackend::new();
        backend.add("192.0.2.1", "example.com.", RecordType::MX, Message::new());
        let query = Query::new("example.com.".parse()?, RecordType::MX);
        let bw = Bailiwick::root();
        let resp = query_and_classify(
            &backend,
            "192.0.2.1".parse()?,
            &query,
            &bw,
            false,
            true,
            1232,
            2,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(resp.outcome, Outcome::NoData);
        Ok(())
    }

    #[tokio::test]
    async fn test_classify_nxdomain() -> Result<()> {
        let backend = FakeBackend::new();
        let mut msg = Message::new();
        msg.set_response_code(ResponseCode::NXDomain);
        backend.add("192.0.2.1", "nope.example.com.", RecordType::A, msg);
        let query = Query::new("nope.example.com.".parse()?, RecordType::A);
        let bw = Bailiwick::root();
        let resp = query_and_classify(
            &backend,
            "192.0.2.1".parse()?,
            &query,
            &bw,
            false,
            true,
            1232,
            2,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(resp.outcome, Outcome::NxDomain);
        Ok(())
    }
}
