use hickory_proto::error::ProtoError;
use thiserror::Error;

/// Tier-3 errors: the only ones that propagate out of [`crate::traverser::run_query`]
/// and cause a nonzero exit. Everything else is folded into an [`crate::response::Outcome`]
/// or a terminal [`crate::referral::ReferralState::Failed`] and the traversal continues.
#[derive(Error, Debug)]
pub enum TraverseError {
    #[error("no usable root servers: {0}")]
    NoUsableRoots(String),

    #[error("unknown record type: {0}")]
    UnknownRecordType(String),

    #[error("no domain name given")]
    MissingDomain,

    #[error("--always-tcp requires --allow-tcp (or implies it); refusing silent contradiction")]
    ConfigContradiction,

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtoError),
}

/// Per-response transport/protocol failures, caught at the query boundary and turned
/// into an [`crate::response::Outcome`] rather than propagated. Kept distinct from
/// [`TraverseError`] so the type system documents which errors can end a whole run
/// versus which ones only end a single branch.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("timed out after {0} attempts")]
    Timeout(u32),

    #[error("malformed response: {0}")]
    Malformed(#[from] ProtoError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}
