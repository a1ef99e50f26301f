//! XMPP addressing (RFC 6122).
//!
//! A JID is the triple `node@domain/resource` where only the domain is
//! required. Parsing normalizes each part (Nodeprep / Nameprep /
//! Resourceprep), so equality and hashing work component-wise on the
//! normalized form.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Maximum byte length of each JID part after stringprep (RFC 6122).
pub const MAX_PART_LEN: usize = 1023;

/// JID parsing and normalization errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    /// The domain part is empty or missing
    #[error("domain is required")]
    DomainMissing,

    /// The node part is present but empty (`@domain`)
    #[error("node part is empty")]
    NodeEmpty,

    /// The resource part is present but empty (`jid/`)
    #[error("resource part is empty")]
    ResourceEmpty,

    /// A part exceeds 1023 bytes after stringprep
    #[error("{part} exceeds {MAX_PART_LEN} bytes")]
    PartTooLong {
        /// Which part overflowed
        part: &'static str,
    },

    /// A part contains characters the relevant stringprep profile forbids
    #[error("{part} contains forbidden characters")]
    ForbiddenCharacters {
        /// Which part failed stringprep
        part: &'static str,
    },
}

/// A normalized Jabber identifier.
///
/// A *bare* JID omits the resource; a *full* JID carries one. Instances are
/// always normalized: constructing one via [`Jid::parse`] or [`Jid::new`]
/// runs the appropriate stringprep profile on each part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Build a JID from parts, normalizing each.
    pub fn new(
        node: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, JidError> {
        let node = match node {
            Some("") => return Err(JidError::NodeEmpty),
            Some(n) => Some(prep_node(n)?),
            None => None,
        };
        let resource = match resource {
            Some("") => return Err(JidError::ResourceEmpty),
            Some(r) => Some(prep_resource(r)?),
            None => None,
        };
        let domain = prep_domain(domain)?;

        Ok(Self {
            node,
            domain,
            resource,
        })
    }

    /// Parse a JID from its textual form `node@domain/resource`.
    ///
    /// The resource separator is the first `/`; everything after it belongs
    /// to the resource, including further slashes.
    pub fn parse(s: &str) -> Result<Self, JidError> {
        let (head, resource) = match s.find('/') {
            Some(idx) => (&s[..idx], Some(&s[idx + 1..])),
            None => (s, None),
        };
        let (node, domain) = match head.find('@') {
            Some(idx) => (Some(&head[..idx]), &head[idx + 1..]),
            None => (None, head),
        };
        Self::new(node, domain, resource)
    }

    /// The optional node (local) part.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The optional resource part.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// True when no resource is attached.
    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// True when a resource is attached.
    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// Strip the resource, yielding the bare JID.
    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Attach a resource, yielding the full JID.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, JidError> {
        if resource.is_empty() {
            return Err(JidError::ResourceEmpty);
        }
        Ok(Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: Some(prep_resource(resource)?),
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::parse(s)
    }
}

fn prep_node(node: &str) -> Result<String, JidError> {
    let prepped = stringprep::nodeprep(node)
        .map_err(|_| JidError::ForbiddenCharacters { part: "node" })?;
    check_len(&prepped, "node")?;
    Ok(prepped.into_owned())
}

fn prep_resource(resource: &str) -> Result<String, JidError> {
    let prepped = stringprep::resourceprep(resource)
        .map_err(|_| JidError::ForbiddenCharacters { part: "resource" })?;
    check_len(&prepped, "resource")?;
    Ok(prepped.into_owned())
}

fn prep_domain(domain: &str) -> Result<String, JidError> {
    // A trailing dot is a DNS artifact, not part of the identifier.
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    if domain.is_empty() {
        return Err(JidError::DomainMissing);
    }
    let prepped = stringprep::nameprep(domain)
        .map_err(|_| JidError::ForbiddenCharacters { part: "domain" })?;
    check_len(&prepped, "domain")?;
    Ok(prepped.into_owned())
}

fn check_len(part: &str, name: &'static str) -> Result<(), JidError> {
    if part.is_empty() {
        return match name {
            "node" => Err(JidError::NodeEmpty),
            "resource" => Err(JidError::ResourceEmpty),
            _ => Err(JidError::DomainMissing),
        };
    }
    if part.len() > MAX_PART_LEN {
        return Err(JidError::PartTooLong { part: name });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_jid() {
        let jid = Jid::parse("user1@skein.im/tablet").unwrap();
        assert_eq!(jid.node(), Some("user1"));
        assert_eq!(jid.domain(), "skein.im");
        assert_eq!(jid.resource(), Some("tablet"));
        assert!(jid.is_full());
    }

    #[test]
    fn parse_bare_jid() {
        let jid = Jid::parse("user1@skein.im").unwrap();
        assert!(jid.is_bare());
        assert_eq!(jid.resource(), None);
    }

    #[test]
    fn parse_domain_only() {
        let jid = Jid::parse("skein.im").unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.domain(), "skein.im");
    }

    #[test]
    fn resource_may_contain_slashes() {
        let jid = Jid::parse("user@host/res/with/slash").unwrap();
        assert_eq!(jid.resource(), Some("res/with/slash"));
    }

    #[test]
    fn empty_parts_rejected() {
        assert_eq!(Jid::parse("@skein.im"), Err(JidError::NodeEmpty));
        assert_eq!(
            Jid::parse("user@skein.im/"),
            Err(JidError::ResourceEmpty)
        );
        assert_eq!(Jid::parse(""), Err(JidError::DomainMissing));
        assert_eq!(Jid::parse("user@"), Err(JidError::DomainMissing));
    }

    #[test]
    fn domain_is_case_normalized() {
        let a = Jid::parse("user@SKEIN.IM").unwrap();
        let b = Jid::parse("user@skein.im").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.domain(), "skein.im");
    }

    #[test]
    fn node_is_case_normalized() {
        let a = Jid::parse("User1@skein.im").unwrap();
        let b = Jid::parse("user1@skein.im").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn resource_preserves_case() {
        let jid = Jid::parse("user@skein.im/Tablet").unwrap();
        assert_eq!(jid.resource(), Some("Tablet"));
    }

    #[test]
    fn trailing_dot_stripped() {
        let jid = Jid::parse("user@skein.im.").unwrap();
        assert_eq!(jid.domain(), "skein.im");
    }

    #[test]
    fn part_length_limit_enforced() {
        let long = "a".repeat(MAX_PART_LEN + 1);
        assert_eq!(
            Jid::parse(&format!("{}@skein.im", long)),
            Err(JidError::PartTooLong { part: "node" })
        );
        assert_eq!(
            Jid::parse(&format!("user@skein.im/{}", long)),
            Err(JidError::PartTooLong { part: "resource" })
        );
    }

    #[test]
    fn display_round_trips() {
        for input in [
            "skein.im",
            "user1@skein.im",
            "user1@skein.im/tablet",
        ] {
            let jid = Jid::parse(input).unwrap();
            let reparsed = Jid::parse(&jid.to_string()).unwrap();
            assert_eq!(jid, reparsed);
        }
    }

    #[test]
    fn bare_and_full_conversions() {
        let full = Jid::parse("user1@skein.im/tablet").unwrap();
        let bare = full.to_bare();
        assert!(bare.is_bare());
        assert_eq!(bare.to_string(), "user1@skein.im");

        let refull = bare.with_resource("phone").unwrap();
        assert_eq!(refull.to_string(), "user1@skein.im/phone");
    }

    #[test]
    fn forbidden_node_characters_rejected() {
        assert!(matches!(
            Jid::parse("us er@skein.im"),
            Err(JidError::ForbiddenCharacters { part: "node" })
        ));
    }
}
