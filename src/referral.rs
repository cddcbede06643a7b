//! One node in the traversal tree, and the arena that owns the whole tree.
//!
//! The tree is strict parent→children ownership; `replaced_by` is a reference relation
//! only (fast-mode dedup), never an ownership edge. Referrals are indexed by position in a
//! flat `Vec` rather than linked via `Rc<RefCell<_>>`, which keeps the whole structure
//! acyclic and lets statistics be computed by a plain post-order walk over indices.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use hickory_proto::rr::Name;

use crate::query::{Bailiwick, Query};
use crate::response::{DecodedResponse, Outcome};

/// A handle into a [`ReferralArena`]. Cheap to copy, meaningless outside its arena.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct RefIdx(pub usize);

/// Hierarchical dotted identifier naming a referral's position in the tree, e.g. `1.2.3`.
/// Stored as the path of child-indices (1-based, matching the dotted rendering) rather than
/// as a pre-formatted string, since every display of it wants the dotted form but nothing
/// needs to parse it back.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct RefId(pub Vec<u32>);

impl RefId {
    pub fn root() -> Self {
        RefId(vec![1])
    }

    pub fn child(&self, sibling_index: u32) -> Self {
        let mut path = self.0.clone();
        path.push(sibling_index);
        RefId(path)
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Why a referral terminated without expanding, beyond the ordinary per-response outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    DepthExceeded,
    Loop,
    UnresolvableServer(String),
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::DepthExceeded => write!(f, "depth_exceeded"),
            FailReason::Loop => write!(f, "loop"),
            FailReason::UnresolvableServer(s) => write!(f, "unresolvable_server({s})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferralState {
    Unresolved,
    ResolvingServer,
    Querying,
    Expanded,
    Answered,
    FastSkipped,
    Failed(FailReason),
}

impl ReferralState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReferralState::Expanded
                | ReferralState::Answered
                | ReferralState::FastSkipped
                | ReferralState::Failed(_)
        )
    }
}

/// One node: the query being resolved at this point in the tree, the zone cut it's being
/// asked under, which server (name + resolved IPs) is being queried, and what came back.
#[derive(Debug, Clone)]
pub struct Referral {
    pub refid: RefId,
    pub query: Query,
    pub bailiwick: Bailiwick,
    pub parent: Option<RefIdx>,
    pub parent_ip: Option<IpAddr>,
    pub server_name: Name,
    pub server_ips: Vec<IpAddr>,
    pub depth: u32,
    pub state: ReferralState,
    pub responses: HashMap<IpAddr, DecodedResponse>,
    pub children: Vec<RefIdx>,
    pub warnings: Vec<String>,
    pub replaced_by: Option<RefIdx>,
}

impl Referral {
    /// The fingerprint fast-mode dedup keys on: two referrals with the same fingerprint
    /// would explore an identical sub-tree.
    pub fn fingerprint(&self) -> (Name, Query, Bailiwick) {
        (self.server_name.clone(), self.query.clone(), self.bailiwick.clone())
    }
}

/// Owns every `Referral` ever allocated during a run. Indices are stable for the arena's
/// lifetime; nothing is ever removed.
#[derive(Debug, Default)]
pub struct ReferralArena {
    nodes: Vec<Referral>,
}

impl ReferralArena {
    pub fn new() -> Self {
        ReferralArena { nodes: Vec::new() }
    }

    pub fn alloc(&mut self, referral: Referral) -> RefIdx {
        self.nodes.push(referral);
        RefIdx(self.nodes.len() - 1)
    }

    pub fn get(&self, idx: RefIdx) -> &Referral {
        &self.nodes[idx.0]
    }

    pub fn get_mut(&mut self, idx: RefIdx) -> &mut Referral {
        &mut self.nodes[idx.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Walks from `idx` up to the root, yielding `idx` itself first.
    pub fn ancestors(&self, idx: RefIdx) -> impl Iterator<Item = RefIdx> + '_ {
        std::iter::successors(Some(idx), move |&i| self.get(i).parent)
    }

    /// True iff some strict ancestor of `idx` shares `fingerprint` with it — a circular
    /// delegation, per spec's loop guard.
    pub fn ancestor_loop(&self, idx: RefIdx, fingerprint: &(Name, Query, Bailiwick)) -> bool {
        self.ancestors(idx).skip(1).any(|a| &self.get(a).fingerprint() == fingerprint)
    }
}

/// Probability mass over classified outcomes, uniform over the branching at each referral.
pub type OutcomeDist = HashMap<Outcome, f64>;

fn merge_weighted(into: &mut OutcomeDist, other: &OutcomeDist, weight: f64) {
    for (outcome, p) in other {
        *into.entry(*outcome).or_insert(0.0) += p * weight;
    }
}

/// Computes the outcome distribution for every referral reachable from `root`, via
/// post-order traversal, per spec §4.4's statistics rule:
///
/// - A referral with no expanded children distributes its per-IP responses' outcomes
///   uniformly (a response with no child referral contributes its own outcome with weight
///   `1/|server_ips|`; a response that produced children instead has its child's
///   distribution substituted at that same weight).
/// - A `FastSkipped` referral copies its replacement's distribution verbatim.
/// - A referral with zero server IPs (unresolvable, depth-exceeded, loop) is entirely its
///   own terminal outcome.
pub fn compute_distributions(arena: &ReferralArena, root: RefIdx) -> HashMap<RefIdx, OutcomeDist> {
    let mut memo = HashMap::new();
    compute_one(arena, root, &mut memo);
    memo
}

fn compute_one(
    arena: &ReferralArena,
    idx: RefIdx,
    memo: &mut HashMap<RefIdx, OutcomeDist>,
) -> OutcomeDist {
    if let Some(dist) = memo.get(&idx) {
        return dist.clone();
    }
    let referral = arena.get(idx);

    let dist = if let Some(replacement) = referral.replaced_by {
        compute_one(arena, replacement, memo)
    } else if let ReferralState::Failed(reason) = &referral.state {
        let mut d = OutcomeDist::new();
        d.insert(synthetic_outcome(reason), 1.0);
        d
    } else if referral.server_ips.is_empty() {
        let mut d = OutcomeDist::new();
        d.insert(Outcome::OtherError, 1.0);
        d
    } else {
        // Map each child back to the server IP whose response produced it, falling back to
        // the response's own outcome for IPs with no child.
        let n = referral.server_ips.len() as f64;
        let mut d = OutcomeDist::new();
        for ip in &referral.server_ips {
            let weight = 1.0 / n;
            let child_idxs: Vec<RefIdx> = referral
                .children
                .iter()
                .copied()
                .filter(|c| arena.get(*c).parent_ip == Some(*ip))
                .collect();
            if !child_idxs.is_empty() {
                let per_child = weight / child_idxs.len() as f64;
                for child_idx in child_idxs {
                    let child_dist = compute_one(arena, child_idx, memo);
                    merge_weighted(&mut d, &child_dist, per_child);
                }
            } else if let Some(resp) = referral.responses.get(ip) {
                *d.entry(resp.outcome).or_insert(0.0) += weight;
            } else {
                // no response recorded at all (e.g. server resolution never completed)
                *d.entry(Outcome::OtherError).or_insert(0.0) += weight;
            }
        }
        d
    };

    memo.insert(idx, dist.clone());
    dist
}

/// `FailReason` has no matching `Outcome` variant (by design — these are referral-level,
/// not per-response classifications) so the aggregator needs a mapping to fold them into
/// the same probability space for reporting. `OtherError` is the closest per-response
/// analogue for all three.
fn synthetic_outcome(_reason: &FailReason) -> Outcome {
    Outcome::OtherError
}
