//! The query/bailiwick data model shared by every other module.

use std::fmt;

use hickory_proto::rr::{DNSClass, Name, RecordType};

/// An immutable `(qname, qtype, qclass)` triple. Name comparisons elsewhere are always
/// case-insensitive ASCII, handled by [`hickory_proto::rr::Name`] itself.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Query {
    pub qname: Name,
    pub qtype: RecordType,
    pub qclass: DNSClass,
}

impl Query {
    pub fn new(qname: Name, qtype: RecordType) -> Self {
        Query { qname, qtype, qclass: DNSClass::IN }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.qname, self.qclass, self.qtype)
    }
}

/// The zone cut under which a referral is valid. A record with owner name `N` is
/// in-bailiwick iff `N == apex` or `N` ends in `.apex`, case-insensitively.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Bailiwick {
    apex: Name,
}

impl Bailiwick {
    pub fn new(apex: Name) -> Self {
        Bailiwick { apex }
    }

    pub fn root() -> Self {
        Bailiwick { apex: Name::root() }
    }

    pub fn apex(&self) -> &Name {
        &self.apex
    }

    /// True iff `name` lies at or below this bailiwick's apex.
    pub fn contains(&self, name: &Name) -> bool {
        self.apex.zone_of(name)
    }
}

impl fmt::Display for Bailiwick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.apex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bailiwick_contains() -> anyhow::Result<()> {
        let bw = Bailiwick::new("example.com.".parse()?);
        assert!(bw.contains(&"example.com.".parse()?));
        assert!(bw.contains(&"www.example.com.".parse()?));
        assert!(!bw.contains(&"example.net.".parse()?));
        assert!(!bw.contains(&"com.".parse()?));
        Ok(())
    }

    #[test]
    fn test_bailiwick_case_insensitive() -> anyhow::Result<()> {
        let bw = Bailiwick::new("Example.COM.".parse()?);
        assert!(bw.contains(&"www.example.com.".parse()?));
        Ok(())
    }
}
