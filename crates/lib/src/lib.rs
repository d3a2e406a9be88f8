//! The model layer of memodb: plain values and their deterministic codec,
//! the content/history identity scheme, and the ref/op/call types the
//! storage engine records. Nothing in this crate touches a database.

pub mod call;
pub mod hash;
pub mod ids;
pub mod op;
pub mod refs;
pub mod types;
pub mod value;

pub use call::Call;
pub use hash::{Hash, hash_bytes};
pub use ids::{Cid, Hid};
pub use op::{ArgValue, Bindings, Op, OpFunc, OpReturn, OutputSpec, Param, StructuralKind};
pub use refs::{AtomRef, DictRef, ListRef, Ref, wrap_atom};
pub use types::Type;
pub use value::{Encode, Value};
