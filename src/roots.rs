//! Root server discovery (spec §4.5's `get_a_root`/`find_all_roots`).
//!
//! The distilled spec says to "query the local resolver for `. NS`" but doesn't say how to
//! find the local resolver or what to do if that fails — every recursive-resolver-adjacent
//! tool in this corpus ships a literal root hints table for exactly this bootstrapping
//! problem, so that's the fallback used here.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use hickory_proto::rr::{Name, RecordType};
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::query::Query;

/// The IANA root hints, IPv4 only. (IPv6 root addresses are omitted; `--root-aaaa`
/// resolution for discovered names still happens live, this table just seeds bootstrapping.)
const ROOT_HINTS: &[(&str, Ipv4Addr)] = &[
    ("a.root-servers.net.", Ipv4Addr::new(198, 41, 0, 4)),
    ("b.root-servers.net.", Ipv4Addr::new(170, 247, 170, 2)),
    ("c.root-servers.net.", Ipv4Addr::new(192, 33, 4, 12)),
    ("d.root-servers.net.", Ipv4Addr::new(199, 7, 91, 13)),
    ("e.root-servers.net.", Ipv4Addr::new(192, 203, 230, 10)),
    ("f.root-servers.net.", Ipv4Addr::new(192, 5, 5, 241)),
    ("g.root-servers.net.", Ipv4Addr::new(192, 112, 36, 4)),
    ("h.root-servers.net.", Ipv4Addr::new(198, 97, 190, 53)),
    ("i.root-servers.net.", Ipv4Addr::new(192, 36, 148, 17)),
    ("j.root-servers.net.", Ipv4Addr::new(192, 58, 128, 30)),
    ("k.root-servers.net.", Ipv4Addr::new(193, 0, 14, 129)),
    ("l.root-servers.net.", Ipv4Addr::new(199, 7, 83, 42)),
    ("m.root-servers.net.", Ipv4Addr::new(202, 12, 27, 33)),
];

/// One root server: its name and the IPs to query it on.
#[derive(Debug, Clone)]
pub struct RootServer {
    pub name: Name,
    pub ips: Vec<IpAddr>,
}

fn builtin_roots() -> Vec<RootServer> {
    ROOT_HINTS
        .iter()
        .map(|(name, ip)| RootServer { name: name.parse().unwrap(), ips: vec![IpAddr::V4(*ip)] })
        .collect()
}

/// Reads the first `nameserver` line from `/etc/resolv.conf`, if present and parseable.
#[cfg(unix)]
fn local_resolver() -> Option<IpAddr> {
    let contents = std::fs::read_to_string("/etc/resolv.conf").ok()?;
    contents.lines().find_map(|line| {
        let line = line.trim();
        let rest = line.strip_prefix("nameserver")?;
        rest.trim().parse().ok()
    })
}

#[cfg(not(unix))]
fn local_resolver() -> Option<IpAddr> {
    None
}

/// Picks one root server at random, either from a live `. NS` lookup against the local
/// resolver or, failing that, from the built-in hints table.
pub async fn get_a_root(
    backend: &dyn Backend,
    root_aaaa: bool,
    timeout: Duration,
) -> RootServer {
    match discover_via_local_resolver(backend, root_aaaa, timeout).await {
        Ok(mut roots) if !roots.is_empty() => {
            roots.shuffle(&mut rand::thread_rng());
            roots.into_iter().next().unwrap()
        }
        Ok(_) | Err(_) => {
            let mut roots = builtin_roots();
            roots.shuffle(&mut rand::thread_rng());
            roots.into_iter().next().expect("builtin root hints table is non-empty")
        }
    }
}

/// All root servers, for `--all-root-servers`: the live `. NS` set if available, otherwise
/// the full built-in hints table.
pub async fn find_all_roots(
    backend: &dyn Backend,
    root_aaaa: bool,
    timeout: Duration,
) -> Vec<RootServer> {
    match discover_via_local_resolver(backend, root_aaaa, timeout).await {
        Ok(roots) if !roots.is_empty() => roots,
        _ => builtin_roots(),
    }
}

async fn discover_via_local_resolver(
    backend: &dyn Backend,
    root_aaaa: bool,
    timeout: Duration,
) -> Result<Vec<RootServer>, crate::error::QueryError> {
    let Some(local) = local_resolver() else {
        debug!("no local resolver found in /etc/resolv.conf, using root hints");
        return Ok(vec![]);
    };
    let ns_query = Query::new(Name::root(), RecordType::NS);
    let ns_msg = backend.query(local, &ns_query, false, 1232, timeout).await?;
    let mut roots = Vec::new();
    for rr in ns_msg.answers() {
        let Some(ns_name) = rr.data().and_then(|d| d.as_ns()) else { continue };
        let name = ns_name.0.clone();
        let mut ips = Vec::new();
        if let Ok(a_msg) = backend
            .query(local, &Query::new(name.clone(), RecordType::A), false, 1232, timeout)
            .await
        {
            for rr in a_msg.answers() {
                if let Some(addr) = rr.data().and_then(|d| d.as_a()) {
                    ips.push(IpAddr::V4(addr.0));
                }
            }
        }
        if root_aaaa {
            if let Ok(aaaa_msg) = backend
                .query(local, &Query::new(name.clone(), RecordType::AAAA), false, 1232, timeout)
                .await
            {
                for rr in aaaa_msg.answers() {
                    if let Some(addr) = rr.data().and_then(|d| d.as_aaaa()) {
                        ips.push(IpAddr::V6(addr.0));
                    }
                }
            }
        }
        if ips.is_empty() {
            warn!(%name, "root NS target resolved to no addresses, skipping");
            continue;
        }
        roots.push(RootServer { name, ips });
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_roots_nonempty_and_parse() {
        let roots = builtin_roots();
        assert_eq!(roots.len(), 13);
        for r in &roots {
            assert_eq!(r.ips.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_get_a_root_falls_back_to_builtin_without_local_resolver() {
        use crate::backend::fake::FakeBackend;
        let backend = FakeBackend::new();
        let root = get_a_root(&backend, false, Duration::from_millis(50)).await;
        assert!(root.name.to_string().ends_with("root-servers.net."));
    }
}
