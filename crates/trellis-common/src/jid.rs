//! Network addresses (`node@domain/resource`).
//!
//! Node and domain parts are lowercased on construction so equality and hashing
//! operate on the normalized form. The resource part is case-sensitive.

use std::fmt;
use std::str::FromStr;

/// Maximum byte length of any single address part.
const MAX_PART_LEN: usize = 1023;

/// Characters that may never appear in the node part.
const NODE_FORBIDDEN: &[char] = &['"', '&', '\'', '/', ':', '<', '>', '@'];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JidError {
    #[error("address has an empty domain")]
    EmptyDomain,
    #[error("address part is empty")]
    EmptyPart,
    #[error("address part exceeds {MAX_PART_LEN} bytes")]
    TooLong,
    #[error("invalid character in {0} part")]
    InvalidChar(&'static str),
}

/// An immutable, normalized network identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Parse an address string, normalizing node and domain.
    pub fn parse(input: &str) -> Result<Self, JidError> {
        let input = input.trim();
        let (rest, resource) = match input.split_once('/') {
            Some((rest, resource)) => (rest, Some(resource)),
            None => (input, None),
        };
        let (node, domain) = match rest.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, rest),
        };
        Self::from_parts(node, domain, resource)
    }

    /// Build an address from its parts, validating each.
    pub fn from_parts(
        node: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, JidError> {
        let domain = normalize_domain(domain)?;
        let node = node.map(normalize_node).transpose()?;
        let resource = resource.map(validate_resource).transpose()?;
        Ok(Self { node, domain, resource })
    }

    /// A domain-only address.
    pub fn domain_only(domain: &str) -> Result<Self, JidError> {
        Self::from_parts(None, domain, None)
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The address without its resource.
    pub fn bare(&self) -> Jid {
        Jid { node: self.node.clone(), domain: self.domain.clone(), resource: None }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// True when the address names a server rather than an account.
    pub fn is_domain(&self) -> bool {
        self.node.is_none() && self.resource.is_none()
    }

    /// Copy of this address bound to `resource`.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, JidError> {
        Ok(Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: Some(validate_resource(resource)?),
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{node}@")?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
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

fn normalize_domain(domain: &str) -> Result<String, JidError> {
    let domain = domain.trim_end_matches('.');
    if domain.is_empty() {
        return Err(JidError::EmptyDomain);
    }
    if domain.len() > MAX_PART_LEN {
        return Err(JidError::TooLong);
    }
    let valid = domain
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '.' || c == '[' || c == ']' || c == ':');
    if !valid {
        return Err(JidError::InvalidChar("domain"));
    }
    Ok(domain.to_lowercase())
}

fn normalize_node(node: &str) -> Result<String, JidError> {
    if node.is_empty() {
        return Err(JidError::EmptyPart);
    }
    if node.len() > MAX_PART_LEN {
        return Err(JidError::TooLong);
    }
    if node.chars().any(|c| c.is_whitespace() || c.is_control() || NODE_FORBIDDEN.contains(&c)) {
        return Err(JidError::InvalidChar("node"));
    }
    Ok(node.to_lowercase())
}

fn validate_resource(resource: &str) -> Result<String, JidError> {
    if resource.is_empty() {
        return Err(JidError::EmptyPart);
    }
    if resource.len() > MAX_PART_LEN {
        return Err(JidError::TooLong);
    }
    if resource.chars().any(|c| c.is_control()) {
        return Err(JidError::InvalidChar("resource"));
    }
    Ok(resource.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_address() {
        let jid = Jid::parse("Alice@Wonderland.LIT/Tea Party").unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain(), "wonderland.lit");
        assert_eq!(jid.resource(), Some("Tea Party"));
        assert_eq!(jid.to_string(), "alice@wonderland.lit/Tea Party");
    }

    #[test]
    fn bare_and_domain_forms() {
        let jid = Jid::parse("alice@wonderland.lit/tea").unwrap();
        assert_eq!(jid.bare().to_string(), "alice@wonderland.lit");
        assert!(jid.bare().is_bare());
        assert!(!jid.is_domain());
        assert!(Jid::parse("wonderland.lit").unwrap().is_domain());
    }

    #[test]
    fn equality_uses_normalized_form() {
        assert_eq!(
            Jid::parse("ALICE@WONDERLAND.lit").unwrap(),
            Jid::parse("alice@wonderland.LIT").unwrap()
        );
        assert_ne!(
            Jid::parse("alice@wonderland.lit/Tea").unwrap(),
            Jid::parse("alice@wonderland.lit/tea").unwrap()
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert_eq!(Jid::parse("alice@"), Err(JidError::EmptyDomain));
        assert_eq!(Jid::parse("@wonderland.lit"), Err(JidError::EmptyPart));
        assert_eq!(Jid::parse("alice@wonderland.lit/"), Err(JidError::EmptyPart));
        assert!(Jid::parse("al ice@wonderland.lit").is_err());
        assert!(Jid::parse("alice@wonder land.lit").is_err());
    }

    #[test]
    fn resource_may_contain_separators() {
        let jid = Jid::parse("alice@wonderland.lit/a/b@c").unwrap();
        assert_eq!(jid.resource(), Some("a/b@c"));
    }
}
