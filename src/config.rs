//! Traverser inputs (spec §4.5) and the two progress-hook types.

use std::net::IpAddr;
use std::time::Duration;

use hickory_proto::rr::{DNSClass, Name, RecordType};

use crate::error::TraverseError;
use crate::referral::Referral;

/// Where to get the initial root server set from.
#[derive(Debug, Clone)]
pub enum Roots {
    /// Use these IPs directly as a single, unnamed root server.
    Explicit(Vec<IpAddr>),
    /// Query the local resolver for `. NS`, then resolve targets (built-in root hints as a
    /// fallback when the local resolver is unusable).
    Discover,
}

/// Lifecycle points at which the `main` progress hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainStage {
    Start,
    NewReferralSet,
    Answer,
    AnswerFast,
}

/// Lifecycle points at which the `resolve` progress hook fires (server-name sub-traversals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStage {
    Start,
    AnswerFast,
}

pub type MainHook = Box<dyn Fn(MainStage, &Referral) + Send + Sync>;
pub type ResolveHook = Box<dyn Fn(ResolveStage, &Name) + Send + Sync>;

/// All Traverser inputs, per spec §4.5.
pub struct TraverseConfig {
    pub qname: Name,
    pub qtype: RecordType,
    pub qclass: DNSClass,
    pub roots: Roots,
    pub all_roots: bool,
    pub follow_aaaa: bool,
    pub root_aaaa: bool,
    pub always_tcp: bool,
    pub allow_tcp: bool,
    pub udp_size: u16,
    pub max_depth: u32,
    pub retries: u32,
    pub timeout: Duration,
    pub fast: bool,
    pub on_main: Option<MainHook>,
    pub on_resolve: Option<ResolveHook>,
}

impl TraverseConfig {
    pub fn new(qname: Name) -> Self {
        TraverseConfig {
            qname,
            qtype: RecordType::A,
            qclass: DNSClass::IN,
            roots: Roots::Discover,
            all_roots: false,
            follow_aaaa: false,
            root_aaaa: false,
            always_tcp: false,
            allow_tcp: true,
            udp_size: 1232,
            max_depth: 20,
            retries: 2,
            timeout: Duration::from_secs(2),
            fast: true,
            on_main: None,
            on_resolve: None,
        }
    }

    /// `always_tcp ⇒ allow_tcp` must hold; a caller asking for forced TCP while also
    /// forbidding TCP is a contradiction we refuse to silently paper over (spec §9).
    pub fn validate(&self) -> Result<(), TraverseError> {
        if self.always_tcp && !self.allow_tcp {
            return Err(TraverseError::ConfigContradiction);
        }
        Ok(())
    }

    pub(crate) fn emit_main(&self, stage: MainStage, referral: &Referral) {
        if let Some(cb) = &self.on_main {
            cb(stage, referral);
        }
    }

    pub(crate) fn emit_resolve(&self, stage: ResolveStage, name: &Name) {
        if let Some(cb) = &self.on_resolve {
            cb(stage, name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() -> anyhow::Result<()> {
        let cfg = TraverseConfig::new("example.com.".parse()?);
        assert_eq!(cfg.qtype, RecordType::A);
        assert_eq!(cfg.max_depth, 20);
        assert_eq!(cfg.retries, 2);
        assert!(cfg.fast);
        assert!(cfg.validate().is_ok());
        Ok(())
    }

    #[test]
    fn test_always_tcp_without_allow_tcp_is_contradiction() -> anyhow::Result<()> {
        let mut cfg = TraverseConfig::new("example.com.".parse()?);
        cfg.always_tcp = true;
        cfg.allow_tcp = false;
        assert!(matches!(cfg.validate(), Err(TraverseError::ConfigContradiction)));
        Ok(())
    }

    #[test]
    fn test_always_tcp_implies_allow_tcp_is_fine() -> anyhow::Result<()> {
        let mut cfg = TraverseConfig::new("example.com.".parse()?);
        cfg.always_tcp = true;
        cfg.allow_tcp = true;
        assert!(cfg.validate().is_ok());
        Ok(())
    }

    #[test]
    fn test_udp_size_512_disables_edns0_is_a_config_value_not_special_cased() -> anyhow::Result<()> {
        // udp_size is plumbed straight through to the backend; 512 carries no special
        // meaning in TraverseConfig itself, only in backend::make_query.
        let mut cfg = TraverseConfig::new("example.com.".parse()?);
        cfg.udp_size = 512;
        assert_eq!(cfg.udp_size, 512);
        Ok(())
    }
}
