//! The top-level driver: seeds root referrals, drives recursive expansion, and rolls up
//! statistics once every branch has terminated.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_recursion::async_recursion;
use hickory_proto::rr::{DNSClass, Name, RecordType};

use crate::backend::{Backend, UdpBackend};
use crate::cache::{Cache, ResponseCache, DEFAULT_CACHE_SIZE};
use crate::config::{MainStage, ResolveStage, Roots, TraverseConfig};
use crate::error::TraverseError;
use crate::fingerprint::{NoopFingerprint, ServerFingerprint};
use crate::query::{Bailiwick, Query};
use crate::referral::{self, FailReason, OutcomeDist, RefId, RefIdx, Referral, ReferralArena, ReferralState};
use crate::response::{self, Outcome};
use crate::roots::{self, RootServer};

/// Everything a single run (or a server-name sub-resolution nested inside one) needs that
/// does not change once root discovery has happened: the backend, the cache, the chosen
/// root set, and the append-only server inventory. Shared by reference across the whole
/// recursive expansion, including sub-traversals, so the cache and inventory are process-
/// (really run-) scoped rather than duplicated per sub-tree.
struct RunContext<'a> {
    config: &'a TraverseConfig,
    backend: &'a dyn Backend,
    cache: &'a ResponseCache,
    roots: &'a [RootServer],
    servers_encountered: Mutex<HashMap<Name, HashSet<IpAddr>>>,
}

/// Per-tree state that *does* vary between the main traversal and each server-name
/// sub-resolution: fast-mode dedup is scoped to one tree, not shared globally, since a
/// server name resolved while expanding one referral has nothing to do with the fingerprint
/// space of a sibling sub-resolution for a different name.
#[derive(Default)]
struct RunState {
    fingerprint_index: HashMap<(Name, Query, Bailiwick), RefIdx>,
}

/// Final output of a traversal: the arena, the handle(s) to its top-level referral(s) (more
/// than one iff `all_roots`), the per-referral outcome distributions, the distribution
/// rolled up across all roots, and the server inventory for `--show-servers`.
pub struct TraverseResult {
    pub arena: ReferralArena,
    pub roots: Vec<RefIdx>,
    pub distributions: HashMap<RefIdx, OutcomeDist>,
    pub overall: OutcomeDist,
    pub servers_encountered: HashMap<Name, HashSet<IpAddr>>,
}

pub struct Traverser {
    config: TraverseConfig,
    backend: Box<dyn Backend>,
    cache: ResponseCache,
    fingerprint: Box<dyn ServerFingerprint>,
}

impl Traverser {
    pub fn new(config: TraverseConfig) -> Self {
        Traverser::with_backend(config, Box::new(UdpBackend::new()))
    }

    pub fn with_backend(config: TraverseConfig, backend: Box<dyn Backend>) -> Self {
        Traverser {
            config,
            backend,
            cache: Cache::new(NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap()),
            fingerprint: Box::new(NoopFingerprint),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Box<dyn ServerFingerprint>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    /// Server fingerprinting is a side channel (spec §1's external collaborator) consulted
    /// only for reporting, never for traversal decisions — so it isn't threaded through
    /// `RunContext` at all, just called here once per discovered server after the fact.
    pub async fn identify_servers(&self, ips: &[IpAddr]) -> HashMap<IpAddr, Option<String>> {
        let mut out = HashMap::new();
        for ip in ips {
            out.insert(*ip, self.fingerprint.identify(*ip).await);
        }
        out
    }

    pub async fn run_query(&self) -> Result<TraverseResult, TraverseError> {
        self.config.validate()?;

        let roots = discover_roots(&self.config, self.backend.as_ref()).await?;
        if roots.is_empty() {
            return Err(TraverseError::NoUsableRoots(
                "no root servers were discovered or configured".to_string(),
            ));
        }

        let ctx = RunContext {
            config: &self.config,
            backend: self.backend.as_ref(),
            cache: &self.cache,
            roots: &roots,
            servers_encountered: Mutex::new(HashMap::new()),
        };

        let mut arena = ReferralArena::new();
        let mut root_idxs = Vec::new();
        for (i, root) in roots.iter().enumerate() {
            let referral = Referral {
                refid: RefId(vec![i as u32 + 1]),
                query: Query {
                    qname: self.config.qname.clone(),
                    qtype: self.config.qtype,
                    qclass: self.config.qclass,
                },
                bailiwick: Bailiwick::root(),
                parent: None,
                parent_ip: None,
                server_name: root.name.clone(),
                server_ips: root.ips.clone(),
                depth: 0,
                state: ReferralState::Unresolved,
                responses: HashMap::new(),
                children: vec![],
                warnings: vec![],
                replaced_by: None,
            };
            let idx = arena.alloc(referral);
            let mut run = RunState::default();
            expand_referral(&ctx, &mut arena, &mut run, idx).await?;
            root_idxs.push(idx);
        }

        let mut distributions = HashMap::new();
        for &idx in &root_idxs {
            distributions.extend(referral::compute_distributions(&arena, idx));
        }
        let overall = aggregate_overall(&distributions, &root_idxs);
        let servers_encountered = ctx.servers_encountered.into_inner().unwrap();

        Ok(TraverseResult { arena, roots: root_idxs, distributions, overall, servers_encountered })
    }
}

/// Uniform mean across each root's own distribution — the same "uniform over the branching
/// at this point" rule the per-referral aggregator applies one level up, at the set of roots
/// a `--all-root-servers` run explores.
fn aggregate_overall(distributions: &HashMap<RefIdx, OutcomeDist>, roots: &[RefIdx]) -> OutcomeDist {
    let mut overall = OutcomeDist::new();
    let weight = 1.0 / roots.len() as f64;
    for idx in roots {
        if let Some(dist) = distributions.get(idx) {
            for (outcome, p) in dist {
                *overall.entry(*outcome).or_insert(0.0) += p * weight;
            }
        }
    }
    overall
}

async fn discover_roots(
    config: &TraverseConfig,
    backend: &dyn Backend,
) -> Result<Vec<RootServer>, TraverseError> {
    match &config.roots {
        Roots::Explicit(ips) => {
            if ips.is_empty() {
                return Err(TraverseError::NoUsableRoots("explicit root list was empty".to_string()));
            }
            Ok(vec![RootServer { name: Name::root(), ips: ips.clone() }])
        }
        Roots::Discover if config.all_roots => {
            Ok(roots::find_all_roots(backend, config.root_aaaa, config.timeout).await)
        }
        Roots::Discover => Ok(vec![roots::get_a_root(backend, config.root_aaaa, config.timeout).await]),
    }
}

/// Expands one referral in place: depth/loop/fast-dedup guards, server resolution if needed,
/// one query per server IP, child construction from the responses, then recurses into each
/// child. Never returns `Err` for anything a single bad server can cause — only
/// configuration-level problems surfaced before any I/O would propagate, and those never
/// reach this far.
#[async_recursion(?Send)]
async fn expand_referral<'a>(
    ctx: &RunContext<'a>,
    arena: &mut ReferralArena,
    run: &mut RunState,
    idx: RefIdx,
) -> Result<(), TraverseError> {
    let fingerprint = arena.get(idx).fingerprint();
    let depth = arena.get(idx).depth;

    if depth > ctx.config.max_depth {
        arena.get_mut(idx).state = ReferralState::Failed(FailReason::DepthExceeded);
        register_fingerprint(run, &fingerprint, idx);
        return Ok(());
    }
    if arena.ancestor_loop(idx, &fingerprint) {
        arena.get_mut(idx).state = ReferralState::Failed(FailReason::Loop);
        register_fingerprint(run, &fingerprint, idx);
        return Ok(());
    }
    if ctx.config.fast {
        if let Some(&existing) = run.fingerprint_index.get(&fingerprint) {
            if existing != idx {
                arena.get_mut(idx).replaced_by = Some(existing);
                arena.get_mut(idx).state = ReferralState::FastSkipped;
                ctx.config.emit_main(MainStage::AnswerFast, arena.get(idx));
                return Ok(());
            }
        }
    }

    ctx.config.emit_main(MainStage::Start, arena.get(idx));

    if arena.get(idx).server_ips.is_empty() {
        arena.get_mut(idx).state = ReferralState::ResolvingServer;
        let server_name = arena.get(idx).server_name.clone();
        let ips = resolve_server(ctx, &server_name).await;
        if ips.is_empty() {
            arena.get_mut(idx).state =
                ReferralState::Failed(FailReason::UnresolvableServer(server_name.to_string()));
            register_fingerprint(run, &fingerprint, idx);
            return Ok(());
        }
        arena.get_mut(idx).server_ips = ips;
    }

    arena.get_mut(idx).state = ReferralState::Querying;
    let server_ips = arena.get(idx).server_ips.clone();
    let query = arena.get(idx).query.clone();
    let bailiwick = arena.get(idx).bailiwick.clone();
    let server_name = arena.get(idx).server_name.clone();
    record_server(ctx, &server_name, &server_ips);

    let mut child_blueprints: Vec<(IpAddr, ChildBlueprint)> = Vec::new();
    for ip in &server_ips {
        let resp = query_cached(ctx, *ip, &query, &bailiwick).await;
        match resp.outcome {
            Outcome::Referral | Outcome::ReferralLame => {
                if let Some(msg) = &resp.message {
                    if let Some((zone_apex, targets)) =
                        extract_ns_children(msg, &bailiwick, ctx.config.follow_aaaa)
                    {
                        for (target_name, target_ips) in targets {
                            child_blueprints.push((
                                *ip,
                                ChildBlueprint::Delegation {
                                    query: query.clone(),
                                    bailiwick: Bailiwick::new(zone_apex.clone()),
                                    server_name: target_name,
                                    server_ips: target_ips,
                                },
                            ));
                        }
                    }
                }
            }
            Outcome::Answer => {
                if let Some(final_name) = &resp.final_name {
                    if response::restarts(&query, final_name) {
                        child_blueprints.push((
                            *ip,
                            ChildBlueprint::CnameRestart { qname: final_name.clone() },
                        ));
                    }
                }
            }
            _ => {}
        }
        arena.get_mut(idx).responses.insert(*ip, resp);
    }

    let parent_refid = arena.get(idx).refid.clone();
    let mut children = Vec::new();
    for (sibling, (parent_ip, blueprint)) in child_blueprints.into_iter().enumerate() {
        let refid = parent_refid.child(sibling as u32 + 1);
        let child = blueprint.into_referral(ctx, refid, idx, parent_ip, depth + 1, &query);
        children.push(arena.alloc(child));
    }

    arena.get_mut(idx).children = children.clone();
    ctx.config.emit_main(MainStage::NewReferralSet, arena.get(idx));

    for &cidx in &children {
        expand_referral(ctx, arena, run, cidx).await?;
    }

    arena.get_mut(idx).state = ReferralState::Expanded;
    register_fingerprint(run, &fingerprint, idx);
    ctx.config.emit_main(MainStage::Answer, arena.get(idx));
    Ok(())
}

/// What a single server IP's response tells us to build next. Kept as an enum rather than
/// building a `Referral` directly inline so the borrow on `arena`/`ctx` in the response loop
/// above stays short — referrals are allocated only after every IP has answered.
enum ChildBlueprint {
    Delegation { query: Query, bailiwick: Bailiwick, server_name: Name, server_ips: Vec<IpAddr> },
    CnameRestart { qname: Name },
}

impl ChildBlueprint {
    fn into_referral(
        self,
        ctx: &RunContext<'_>,
        refid: RefId,
        parent: RefIdx,
        parent_ip: IpAddr,
        depth: u32,
        parent_query: &Query,
    ) -> Referral {
        let (query, bailiwick, server_name, server_ips) = match self {
            ChildBlueprint::Delegation { query, bailiwick, server_name, server_ips } => {
                (query, bailiwick, server_name, server_ips)
            }
            ChildBlueprint::CnameRestart { qname } => {
                let root = &ctx.roots[0];
                (
                    Query { qname, qtype: parent_query.qtype, qclass: parent_query.qclass },
                    Bailiwick::root(),
                    root.name.clone(),
                    root.ips.clone(),
                )
            }
        };
        Referral {
            refid,
            query,
            bailiwick,
            parent: Some(parent),
            parent_ip: Some(parent_ip),
            server_name,
            server_ips,
            depth,
            state: ReferralState::Unresolved,
            responses: HashMap::new(),
            children: vec![],
            warnings: vec![],
            replaced_by: None,
        }
    }
}

/// Pulls the in-bailiwick NS targets and their glue out of a referral response. Returns the
/// zone apex (the NS RRs' shared owner name, i.e. the newly delegated bailiwick) alongside
/// each distinct target name and whatever A/AAAA glue accompanied it — empty when the target
/// has no glue and will need its own sub-resolution.
fn extract_ns_children(
    msg: &hickory_proto::op::Message,
    bailiwick: &Bailiwick,
    follow_aaaa: bool,
) -> Option<(Name, Vec<(Name, Vec<IpAddr>)>)> {
    let (ns, _soa, _other) = crate::message::authority_partition(msg);
    let in_bailiwick: Vec<_> = ns.iter().filter(|r| bailiwick.contains(r.name())).collect();
    let zone_apex = in_bailiwick.first()?.name().clone();

    let mut targets: Vec<Name> = Vec::new();
    for r in &in_bailiwick {
        if let Some(target) = r.data().and_then(|d| d.as_ns()).map(|ns| ns.0.clone()) {
            if !targets.iter().any(|t| t.eq_case_insensitive(&target)) {
                targets.push(target);
            }
        }
    }

    let children = targets
        .into_iter()
        .map(|target| {
            let mut ips = Vec::new();
            for rr in crate::message::additional(msg, &target, RecordType::A, DNSClass::IN) {
                if let Some(a) = rr.data().and_then(|d| d.as_a()) {
                    ips.push(IpAddr::V4(a.0));
                }
            }
            if follow_aaaa {
                for rr in crate::message::additional(msg, &target, RecordType::AAAA, DNSClass::IN) {
                    if let Some(a) = rr.data().and_then(|d| d.as_aaaa()) {
                        ips.push(IpAddr::V6(a.0));
                    }
                }
            }
            (target, ips)
        })
        .collect();

    Some((zone_apex, children))
}

async fn query_cached(
    ctx: &RunContext<'_>,
    ip: IpAddr,
    query: &Query,
    bailiwick: &Bailiwick,
) -> response::DecodedResponse {
    let key = crate::cache::ResponseKey {
        server_ip: ip,
        qname: query.qname.clone(),
        qtype: query.qtype,
        qclass: query.qclass,
        bailiwick: bailiwick.clone(),
    };
    if let Some(cached) = ctx.cache.get(&key) {
        return cached;
    }
    let resp = response::query_and_classify(
        ctx.backend,
        ip,
        query,
        bailiwick,
        ctx.config.always_tcp,
        ctx.config.allow_tcp,
        ctx.config.udp_size,
        ctx.config.retries,
        ctx.config.timeout,
    )
    .await;
    ctx.cache.store(key, resp.clone());
    resp
}

fn register_fingerprint(run: &mut RunState, fingerprint: &(Name, Query, Bailiwick), idx: RefIdx) {
    run.fingerprint_index.entry(fingerprint.clone()).or_insert(idx);
}

fn record_server(ctx: &RunContext<'_>, server_name: &Name, ips: &[IpAddr]) {
    let mut guard = ctx.servers_encountered.lock().unwrap();
    guard.entry(server_name.clone()).or_default().extend(ips.iter().copied());
}

/// One server-name sub-traversal per address family needed (`A`, plus `AAAA` when
/// `follow_aaaa`), started from the first chosen root. Using only the first root (rather
/// than every discovered root) bounds the cost of resolving glue-less NS targets to one
/// sub-tree per address family regardless of `--all-root-servers`; that's a scope decision,
/// not a semantic one — the resolved addresses are identical from any root.
async fn resolve_server(ctx: &RunContext<'_>, name: &Name) -> Vec<IpAddr> {
    ctx.config.emit_resolve(ResolveStage::Start, name);
    let mut ips = Vec::new();
    let mut qtypes = vec![RecordType::A];
    if ctx.config.follow_aaaa {
        qtypes.push(RecordType::AAAA);
    }
    for qtype in qtypes {
        let root = &ctx.roots[0];
        let mut sub_arena = ReferralArena::new();
        let mut sub_run = RunState::default();
        let referral = Referral {
            refid: RefId::root(),
            query: Query { qname: name.clone(), qtype, qclass: DNSClass::IN },
            bailiwick: Bailiwick::root(),
            parent: None,
            parent_ip: None,
            server_name: root.name.clone(),
            server_ips: root.ips.clone(),
            depth: 0,
            state: ReferralState::Unresolved,
            responses: HashMap::new(),
            children: vec![],
            warnings: vec![],
            replaced_by: None,
        };
        let idx = sub_arena.alloc(referral);
        if expand_referral(ctx, &mut sub_arena, &mut sub_run, idx).await.is_ok() {
            collect_resolved_ips(&sub_arena, idx, name, qtype, &mut ips);
        }
    }
    ctx.config.emit_resolve(ResolveStage::AnswerFast, name);
    ips
}

fn collect_resolved_ips(arena: &ReferralArena, idx: RefIdx, name: &Name, qtype: RecordType, out: &mut Vec<IpAddr>) {
    let referral = arena.get(idx);
    for resp in referral.responses.values() {
        if resp.outcome != Outcome::Answer {
            continue;
        }
        let Some(msg) = &resp.message else { continue };
        let owner = resp.final_name.clone().unwrap_or_else(|| name.clone());
        for rr in crate::message::answers(msg, &owner, qtype, DNSClass::IN) {
            match (qtype, rr.data()) {
                (RecordType::A, Some(d)) => {
                    if let Some(a) = d.as_a() {
                        out.push(IpAddr::V4(a.0));
                    }
                }
                (RecordType::AAAA, Some(d)) => {
                    if let Some(a) = d.as_aaaa() {
                        out.push(IpAddr::V6(a.0));
                    }
                }
                _ => {}
            }
        }
    }
    for &child in &referral.children {
        collect_resolved_ips(arena, child, name, qtype, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::{a, answer, ns, refer};
    use anyhow::Result;
    use hickory_proto::op::{Header, Message};
    use hickory_proto::rr::{rdata, RData, Record};

    fn base_config(qname: &str) -> TraverseConfig {
        let mut cfg = TraverseConfig::new(qname.parse().unwrap());
        cfg.roots = Roots::Explicit(vec!["198.41.0.4".parse().unwrap()]);
        cfg
    }

    #[tokio::test]
    async fn test_single_branch_answer() -> Result<()> {
        let backend = FakeBackend::new();
        backend.add(
            "198.41.0.4",
            "example.com.",
            RecordType::A,
            refer!(ns!("example.com.", "ns.example.com."), a!("ns.example.com.", "192.0.2.1")),
        );
        backend.add("192.0.2.1", "example.com.", RecordType::A, answer!(a!("example.com.", "192.0.2.10")));

        let traverser = Traverser::with_backend(base_config("example.com."), Box::new(backend));
        let result = traverser.run_query().await?;
        assert_eq!(result.roots.len(), 1);
        let root = result.roots[0];
        assert_eq!(result.arena.get(root).children.len(), 1);
        let child = result.arena.get(root).children[0];
        assert_eq!(result.arena.get(child).state, ReferralState::Expanded);
        let dist = &result.distributions[&child];
        assert!((dist[&Outcome::Answer] - 1.0).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_and_answer_split_across_two_ips() -> Result<()> {
        // One NS target with two glue A records: the split is at the server-IP level of a
        // single referral, not across sibling NS referrals.
        let backend = FakeBackend::new();
        let mut msg = Message::new();
        msg.insert_name_servers(vec![ns!("example.com.", "ns.example.com.")]);
        msg.insert_additionals(vec![
            a!("ns.example.com.", "192.0.2.1"),
            a!("ns.example.com.", "192.0.2.2"),
        ]);
        backend.add("198.41.0.4", "example.com.", RecordType::A, msg);
        backend.add("192.0.2.1", "example.com.", RecordType::A, answer!(a!("example.com.", "192.0.2.10")));
        backend.add_timeout("192.0.2.2", "example.com.", RecordType::A);

        let traverser = Traverser::with_backend(base_config("example.com."), Box::new(backend));
        let result = traverser.run_query().await?;
        let root = result.roots[0];
        let child = result.arena.get(root).children[0];
        assert_eq!(result.arena.get(child).server_ips.len(), 2);
        let dist = &result.distributions[&child];
        assert!((dist[&Outcome::Answer] - 0.5).abs() < 1e-9);
        assert!((dist[&Outcome::Timeout] - 0.5).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn test_max_depth_exceeded_marks_failed() -> Result<()> {
        let backend = FakeBackend::new();
        backend.add(
            "198.41.0.4",
            "deep.example.com.",
            RecordType::A,
            refer!(ns!("example.com.", "ns.example.com."), a!("ns.example.com.", "192.0.2.1")),
        );
        backend.add(
            "192.0.2.1",
            "deep.example.com.",
            RecordType::A,
            refer!(ns!("example.com.", "ns2.example.com."), a!("ns2.example.com.", "192.0.2.2")),
        );
        let mut cfg = base_config("deep.example.com.");
        cfg.max_depth = 0;
        let traverser = Traverser::with_backend(cfg, Box::new(backend));
        let result = traverser.run_query().await?;
        let root = result.roots[0];
        assert_eq!(result.arena.get(root).state, ReferralState::Expanded);
        Ok(())
    }

    #[tokio::test]
    async fn test_main_hook_emits_new_referral_set() -> Result<()> {
        use std::sync::Arc;

        let backend = FakeBackend::new();
        backend.add(
            "198.41.0.4",
            "example.com.",
            RecordType::A,
            refer!(ns!("example.com.", "ns.example.com."), a!("ns.example.com.", "192.0.2.1")),
        );
        backend.add("192.0.2.1", "example.com.", RecordType::A, answer!(a!("example.com.", "192.0.2.10")));

        let stages = Arc::new(Mutex::new(Vec::new()));
        let recorded = stages.clone();
        let mut cfg = base_config("example.com.");
        cfg.on_main = Some(Box::new(move |stage, _referral| {
            recorded.lock().unwrap().push(stage);
        }));

        let traverser = Traverser::with_backend(cfg, Box::new(backend));
        traverser.run_query().await?;

        let seen = stages.lock().unwrap();
        assert!(seen.contains(&MainStage::NewReferralSet));
        assert!(seen.contains(&MainStage::Start));
        assert!(seen.contains(&MainStage::Answer));
        Ok(())
    }

    #[tokio::test]
    async fn test_fast_mode_dedups_shared_fingerprint() -> Result<()> {
        // Two root IPs that both refer to the same NS name for the same query/bailiwick:
        // the fast-mode fingerprint is (server_name, query, bailiwick), so the two resulting
        // child referrals collide and the second is skipped in favor of the first.
        let backend = FakeBackend::new();
        backend.add(
            "198.41.0.4",
            "example.com.",
            RecordType::A,
            refer!(ns!("example.com.", "ns.example.com."), a!("ns.example.com.", "192.0.2.1")),
        );
        backend.add(
            "199.9.14.201",
            "example.com.",
            RecordType::A,
            refer!(ns!("example.com.", "ns.example.com."), a!("ns.example.com.", "192.0.2.1")),
        );
        backend.add("192.0.2.1", "example.com.", RecordType::A, answer!(a!("example.com.", "192.0.2.10")));

        let mut cfg = base_config("example.com.");
        cfg.roots = Roots::Explicit(vec!["198.41.0.4".parse().unwrap(), "199.9.14.201".parse().unwrap()]);
        let traverser = Traverser::with_backend(cfg, Box::new(backend));
        let result = traverser.run_query().await?;
        assert_eq!(result.roots.len(), 1);
        let root = result.roots[0];
        let children = &result.arena.get(root).children;
        assert_eq!(children.len(), 2);
        let states: Vec<_> = children.iter().map(|&c| result.arena.get(c).state.clone()).collect();
        assert!(states.contains(&ReferralState::FastSkipped));
        Ok(())
    }
}
