use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::{Hash, IdHasher, hash_bytes};
use crate::value::{Encode, Value};

/// Content id: a pure function of a value's content. Atoms hash their
/// serialized bytes; composites hash a structural tag plus their children's
/// content ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid(pub Hash);

/// History id: a pure function of the provenance path by which a ref or call
/// came to exist. Two refs with equal content may carry different history ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hid(pub Hash);

impl Cid {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Cid(hash_bytes(bytes))
    }

    pub fn of_value(value: &Value) -> Self {
        Cid::of_bytes(&value.encode())
    }

    pub fn of_list(children: &[Cid]) -> Self {
        let mut hasher = IdHasher::new();
        hasher.update(b"list");
        for child in children {
            hasher.update(child.0.as_slice());
        }
        Cid(hasher.finish())
    }

    /// `entries` must already be sorted by key; callers iterate a `BTreeMap`.
    pub fn of_dict<'a>(entries: impl IntoIterator<Item = (&'a str, Cid)>) -> Self {
        let mut hasher = IdHasher::new();
        hasher.update(b"dict");
        for (key, child) in entries {
            hasher.update(key.as_bytes());
            hasher.update(child.0.as_slice());
        }
        Cid(hasher.finish())
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        Hash::from_hex(hex).map(Cid)
    }
}

impl Hid {
    /// History id for a ref introduced from user code outside any call, as a
    /// function of its content id. Wrapping the same plain value twice yields
    /// the same history, so repeat invocations on literal inputs can be found
    /// again by history lookup.
    pub fn external(cid: &Cid) -> Self {
        let mut hasher = IdHasher::new();
        hasher.update(b"external");
        hasher.update(cid.0.as_slice());
        Hid(hasher.finish())
    }

    /// A fresh, universally unique history id. Used for placeholder ids that
    /// are rewritten before they are persisted.
    pub fn fresh() -> Self {
        Hid(hash_bytes(uuid::Uuid::new_v4().as_bytes()))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        Hash::from_hex(hex).map(Hid)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.0.abbreviate())
    }
}

impl fmt::Display for Hid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Hid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hid({})", self.0.abbreviate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_cids_follow_content() {
        assert_eq!(Cid::of_value(&Value::Int(5)), Cid::of_value(&Value::Int(5)));
        assert_ne!(Cid::of_value(&Value::Int(5)), Cid::of_value(&Value::Int(6)));
        // equal bytes under different types stay distinct
        assert_ne!(
            Cid::of_value(&Value::Int(0)),
            Cid::of_value(&Value::Bool(false))
        );
    }

    #[test]
    fn structural_cids_are_tagged() {
        let a = Cid::of_value(&Value::Int(1));
        let b = Cid::of_value(&Value::Int(2));
        assert_eq!(Cid::of_list(&[a, b]), Cid::of_list(&[a, b]));
        assert_ne!(Cid::of_list(&[a, b]), Cid::of_list(&[b, a]));
        assert_ne!(
            Cid::of_list(&[a]),
            Cid::of_dict([("0", a)]),
        );
    }

    #[test]
    fn external_hids_are_deterministic_but_fresh_ones_are_not() {
        let cid = Cid::of_value(&Value::Int(41));
        assert_eq!(Hid::external(&cid), Hid::external(&cid));
        assert_ne!(Hid::fresh(), Hid::fresh());
    }
}
