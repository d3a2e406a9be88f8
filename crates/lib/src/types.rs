use serde::{Deserialize, Serialize};

/// Declared shape of a slot. The engine dispatches structurally on this:
/// atoms are wrapped whole, lists and dicts are decomposed into builder and
/// getter calls so that every nested component carries its own identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Atom,
    List(Box<Type>),
    Dict(Box<Type>, Box<Type>),
}

impl Type {
    pub fn list_of(elt: Type) -> Type {
        Type::List(Box::new(elt))
    }

    pub fn dict_of(key: Type, val: Type) -> Type {
        Type::Dict(Box::new(key), Box::new(val))
    }

    pub fn is_atom(&self) -> bool {
        matches!(self, Type::Atom)
    }
}
