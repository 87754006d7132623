// Address keys
//
// Two disjoint syntaxes identify bus endpoints: external KNX group addresses
// (`main/middle/sub`) and internal communication objects (`IKO:<scope>:<port>`).
// The `BLOCK:<instance>:<port>` shorthand is accepted on bind input only and
// is materialised to an IKO before anything is stored.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

/// A three-level KNX group address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupAddress {
    pub main: u8,
    pub middle: u8,
    pub sub: u8,
}

impl GroupAddress {
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self> {
        if main > 31 || middle > 7 {
            return Err(Error::InvalidAddress(format!("{main}/{middle}/{sub}")));
        }
        Ok(Self { main, middle, sub })
    }

    /// 16-bit bus encoding: 5 bits main, 3 bits middle, 8 bits sub.
    pub fn raw(&self) -> u16 {
        ((self.main as u16) << 11) | ((self.middle as u16) << 8) | self.sub as u16
    }

    pub fn from_raw(raw: u16) -> Self {
        Self {
            main: ((raw >> 11) & 0x1f) as u8,
            middle: ((raw >> 8) & 0x07) as u8,
            sub: (raw & 0xff) as u8,
        }
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main, self.middle, self.sub)
    }
}

impl FromStr for GroupAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let (a, b, c) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c), None) => (a, b, c),
            _ => return Err(Error::InvalidAddress(s.to_string())),
        };
        let parse = |p: &str| -> Result<u16> {
            p.trim()
                .parse::<u16>()
                .map_err(|_| Error::InvalidAddress(s.to_string()))
        };
        let (main, middle, sub) = (parse(a)?, parse(b)?, parse(c)?);
        if main > 31 || middle > 7 || sub > 255 {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        GroupAddress::new(main as u8, middle as u8, sub as u8)
    }
}

/// Canonical key of a bus address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AddressKey {
    /// External KNX group address.
    Group(GroupAddress),
    /// Internal communication object, never leaves the process.
    Internal { scope: String, port: String },
}

impl AddressKey {
    pub fn internal(scope: impl Into<String>, port: impl Into<String>) -> Self {
        AddressKey::Internal {
            scope: scope.into(),
            port: port.into(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, AddressKey::Internal { .. })
    }

    pub fn group(&self) -> Option<GroupAddress> {
        match self {
            AddressKey::Group(ga) => Some(*ga),
            AddressKey::Internal { .. } => None,
        }
    }

    /// Case-insensitive map key. Keys are unique up to ASCII case.
    pub fn canonical(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }

    pub fn parse(s: &str) -> Result<AddressKey> {
        let t = s.trim();
        if let Some(rest) = strip_prefix_ci(t, "IKO:") {
            let (scope, port) = rest
                .split_once(':')
                .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
            if scope.is_empty() || port.is_empty() || !valid_scope(scope) || !valid_scope(port) {
                return Err(Error::InvalidAddress(s.to_string()));
            }
            return Ok(AddressKey::internal(scope, port));
        }
        t.parse::<GroupAddress>().map(AddressKey::Group)
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKey::Group(ga) => write!(f, "{ga}"),
            AddressKey::Internal { scope, port } => write!(f, "IKO:{scope}:{port}"),
        }
    }
}

impl TryFrom<String> for AddressKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        AddressKey::parse(&s)
    }
}

impl From<AddressKey> for String {
    fn from(k: AddressKey) -> String {
        k.to_string()
    }
}

impl FromStr for AddressKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AddressKey::parse(s)
    }
}

/// `BLOCK:<instance>:<port>` bind-time shorthand for "the output port of that
/// block". Never stored as an address key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPortRef {
    pub instance: String,
    pub port: String,
}

/// What a bind request may name as its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSpec {
    Key(AddressKey),
    Block(BlockPortRef),
}

impl AddressSpec {
    pub fn parse(s: &str) -> Result<AddressSpec> {
        let t = s.trim();
        if let Some(rest) = strip_prefix_ci(t, "BLOCK:") {
            let (instance, port) = rest
                .split_once(':')
                .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
            if instance.is_empty() || port.is_empty() {
                return Err(Error::InvalidAddress(s.to_string()));
            }
            return Ok(AddressSpec::Block(BlockPortRef {
                instance: instance.to_string(),
                port: port.to_string(),
            }));
        }
        AddressKey::parse(t).map(AddressSpec::Key)
    }
}

fn valid_scope(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '#' | '-'))
}

/// Replace characters an IKO scope may not carry.
pub fn sanitize_scope(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '#' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_address_parse() {
        let ga: GroupAddress = "1/2/3".parse().unwrap();
        assert_eq!((ga.main, ga.middle, ga.sub), (1, 2, 3));
        assert_eq!(ga.to_string(), "1/2/3");
        assert!("32/0/0".parse::<GroupAddress>().is_err());
        assert!("0/8/0".parse::<GroupAddress>().is_err());
        assert!("0/0/256".parse::<GroupAddress>().is_err());
        assert!("1/2".parse::<GroupAddress>().is_err());
    }

    #[test]
    fn test_group_address_raw_roundtrip() {
        let ga = GroupAddress::new(31, 7, 255).unwrap();
        assert_eq!(GroupAddress::from_raw(ga.raw()), ga);
        let ga = GroupAddress::new(1, 0, 7).unwrap();
        assert_eq!(ga.raw(), 0x0807);
    }

    #[test]
    fn test_address_key_parse() {
        assert_eq!(
            AddressKey::parse("IKO:n1:A1").unwrap(),
            AddressKey::internal("n1", "A1")
        );
        assert_eq!(
            AddressKey::parse("iko:n1:A1").unwrap(),
            AddressKey::internal("n1", "A1")
        );
        assert!(matches!(
            AddressKey::parse("1/1/1").unwrap(),
            AddressKey::Group(_)
        ));
        assert!(AddressKey::parse("IKO:bad scope:A1").is_err());
        assert!(AddressKey::parse("IKO:n1").is_err());
    }

    #[test]
    fn test_canonical_is_case_insensitive() {
        let a = AddressKey::parse("IKO:Timer_1:A1").unwrap();
        let b = AddressKey::parse("IKO:timer_1:a1").unwrap();
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_block_shorthand() {
        match AddressSpec::parse("BLOCK:20043_Timer_0_120000:A1").unwrap() {
            AddressSpec::Block(r) => {
                assert_eq!(r.instance, "20043_Timer_0_120000");
                assert_eq!(r.port, "A1");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            AddressSpec::parse("IKO:x:y").unwrap(),
            AddressSpec::Key(_)
        ));
    }
}
