use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{Cid, Hid};
use crate::value::{Encode, Value};

/// Handle to a persisted leaf value. `obj` is present only while the ref is
/// in memory; a detached atom keeps its identity and nothing else.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtomRef {
    pub cid: Cid,
    pub hid: Hid,
    pub obj: Option<Value>,
}

/// Handle to a persisted ordered sequence of refs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListRef {
    pub cid: Cid,
    pub hid: Hid,
    pub obj: Option<Vec<Ref>>,
}

/// Handle to a persisted string-keyed mapping of refs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DictRef {
    pub cid: Cid,
    pub hid: Hid,
    pub obj: Option<BTreeMap<String, Ref>>,
}

/// A value handle carrying both content identity (`cid`) and history
/// identity (`hid`). Refs are shared immutable handles: holders may copy
/// them, none may change their content id or shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Ref {
    Atom(AtomRef),
    List(ListRef),
    Dict(DictRef),
}

impl Ref {
    pub fn cid(&self) -> Cid {
        match self {
            Ref::Atom(r) => r.cid,
            Ref::List(r) => r.cid,
            Ref::Dict(r) => r.cid,
        }
    }

    pub fn hid(&self) -> Hid {
        match self {
            Ref::Atom(r) => r.hid,
            Ref::List(r) => r.hid,
            Ref::Dict(r) => r.hid,
        }
    }

    pub fn in_memory(&self) -> bool {
        match self {
            Ref::Atom(r) => r.obj.is_some(),
            Ref::List(r) => r.obj.is_some(),
            Ref::Dict(r) => r.obj.is_some(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Ref::Atom(_) => "atom",
            Ref::List(_) => "list",
            Ref::Dict(_) => "dict",
        }
    }

    /// Same ref under a different provenance.
    pub fn with_hid(mut self, hid: Hid) -> Ref {
        self.set_hid(hid);
        self
    }

    pub fn set_hid(&mut self, hid: Hid) {
        match self {
            Ref::Atom(r) => r.hid = hid,
            Ref::List(r) => r.hid = hid,
            Ref::Dict(r) => r.hid = hid,
        }
    }

    /// Identity only: the same variant with no in-memory payload.
    pub fn detached(&self) -> Ref {
        match self {
            Ref::Atom(r) => Ref::Atom(AtomRef { cid: r.cid, hid: r.hid, obj: None }),
            Ref::List(r) => Ref::List(ListRef { cid: r.cid, hid: r.hid, obj: None }),
            Ref::Dict(r) => Ref::Dict(DictRef { cid: r.cid, hid: r.hid, obj: None }),
        }
    }

    /// Detached skeleton: the same variant with children replaced by their
    /// detached refs. This is what the shapes table stores per history id.
    pub fn shape(&self) -> Ref {
        match self {
            Ref::Atom(_) => self.detached(),
            Ref::List(r) => Ref::List(ListRef {
                cid: r.cid,
                hid: r.hid,
                obj: r
                    .obj
                    .as_ref()
                    .map(|children| children.iter().map(Ref::detached).collect()),
            }),
            Ref::Dict(r) => Ref::Dict(DictRef {
                cid: r.cid,
                hid: r.hid,
                obj: r.obj.as_ref().map(|children| {
                    children
                        .iter()
                        .map(|(k, v)| (k.clone(), v.detached()))
                        .collect()
                }),
            }),
        }
    }
}

impl Encode for Ref {}

/// Wrap a plain value as an atom ref. Without an explicit history id the ref
/// gets the deterministic external one, so wrapping equal values outside any
/// call yields equal histories.
pub fn wrap_atom(value: Value, hid: Option<Hid>) -> AtomRef {
    let cid = Cid::of_value(&value);
    AtomRef {
        cid,
        hid: hid.unwrap_or_else(|| Hid::external(&cid)),
        obj: Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_atom_is_deterministic() {
        let a = wrap_atom(Value::Int(41), None);
        let b = wrap_atom(Value::Int(41), None);
        assert_eq!(a.cid, b.cid);
        assert_eq!(a.hid, b.hid);
        assert!(a.obj.is_some());
    }

    #[test]
    fn shape_detaches_children_one_level() {
        let x = Ref::Atom(wrap_atom(Value::Int(1), None));
        let y = Ref::Atom(wrap_atom(Value::Int(2), None));
        let list = Ref::List(ListRef {
            cid: Cid::of_list(&[x.cid(), y.cid()]),
            hid: Hid::fresh(),
            obj: Some(vec![x.clone(), y]),
        });
        let shape = list.shape();
        match &shape {
            Ref::List(l) => {
                let children = l.obj.as_ref().unwrap();
                assert_eq!(children.len(), 2);
                assert!(children.iter().all(|c| !c.in_memory()));
                assert_eq!(children[0].cid(), x.cid());
            }
            other => panic!("expected a list shape, got {}", other.kind()),
        }
        // a full detach loses the children
        assert!(!list.detached().in_memory());
    }

    #[test]
    fn shape_blob_roundtrip() {
        let r = Ref::Atom(wrap_atom(Value::Text("s".into()), None)).detached();
        assert_eq!(Ref::decode(&r.encode()).unwrap(), r);
    }
}
