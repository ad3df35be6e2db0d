use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Deref;

// ObjRef is the stable arena handle of one heap object. Every set or map keyed by
// "an object" in the recorder is keyed by this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjRef(u32);

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

impl ObjRef {
    pub fn new(index: u32) -> Self {
        ObjRef(index)
    }

    /// Index of the object inside its arena
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Marker prefix of a location that is not yet known on the ledger
pub const PENDING_PREFIX: char = '_';

/// Marker prefix of a location that records a permanent failure
pub const ERROR_PREFIX: char = '!';

/// Identifier of a ledger record state (`origin` or `location`)
///
/// The wire form is a plain string: `_...` while pending, `!...` once the object has been
/// invalidated, `<txid>_o<n>` for a committed output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Location(String);

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for Location {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Location {
    /// The sentinel every new object starts with
    pub fn pending() -> Self {
        Location(format!("{}pending", PENDING_PREFIX))
    }

    /// A location marking the object invalid, carrying the error text
    pub fn error(message: impl fmt::Display) -> Self {
        Location(format!("{}{}", ERROR_PREFIX, message))
    }

    /// The location of output `vout` (1-based) of record `txid`
    pub fn committed(txid: &TxId, vout: usize) -> Self {
        Location(format!("{}_o{}", txid, vout))
    }

    /// Wrap an already formatted location string
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Location(raw.into())
    }

    /// The location of a berry plucked through class `class_location`
    pub fn berry(class_location: &Location, path: &str) -> Self {
        Location(format!("{}?berry={}", class_location, path))
    }

    pub fn is_pending(&self) -> bool {
        self.0.starts_with(PENDING_PREFIX)
    }

    pub fn is_error(&self) -> bool {
        self.0.starts_with(ERROR_PREFIX)
    }

    /// The stored error text if this location marks the object invalid
    pub fn error_message(&self) -> Option<&str> {
        self.0.strip_prefix(ERROR_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of one published ledger record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId([u8; 32]);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Deref for TxId {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TxId {
    pub fn new(bytes: [u8; 32]) -> Self {
        TxId(bytes)
    }

    /// Derive a record id from its network label and serialized payload
    pub fn for_payload(network: &str, payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();

        // Domain separator
        hasher.update(b"JIGS_Record");
        hasher.update(network.as_bytes());
        hasher.update(payload);

        TxId(hasher.finalize().into())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn test_pending_location() {
        let loc = Location::pending();
        assert!(loc.is_pending());
        assert!(!loc.is_error());
        assert_eq!(loc.error_message(), None);
    }

    #[test]
    fn test_error_location() {
        let loc = Location::error("broadcast failed");
        assert!(loc.is_error());
        assert!(!loc.is_pending());
        assert_eq!(loc.error_message(), Some("broadcast failed"));
        assert_eq!(loc.to_string(), "!broadcast failed");
    }

    #[test]
    fn test_committed_location() {
        let txid = TxId::for_payload("mock", b"payload");
        let loc = Location::committed(&txid, 2);
        assert!(!loc.is_pending());
        assert!(!loc.is_error());
        assert_eq!(loc.as_str(), format!("{}_o2", txid));
        assert_eq!(txid.to_string().len(), 64);
    }

    #[test]
    fn test_txid_deterministic() {
        let a = TxId::for_payload("mock", b"one");
        let b = TxId::for_payload("mock", b"one");
        let c = TxId::for_payload("main", b"one");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_berry_location() {
        let class = Location::from_raw("abc_o1");
        assert_eq!(Location::berry(&class, "post/1").as_str(), "abc_o1?berry=post/1");
    }
}
