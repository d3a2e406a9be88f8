//! memodb: a memoizing computation store. Every invocation of a registered
//! op is recorded with its inputs and outputs as content-addressed refs, and
//! repeat invocations on equivalent inputs return the saved outputs without
//! executing.
//!
//! [`storage::Storage`] is the entry point: it owns the embedded database,
//! the write-through caches over the atoms/shapes/ops/sources tables and the
//! calls relation, and the call pipeline.

pub mod db;
mod engine;
pub mod error;
pub mod storage;
pub mod versioning;

pub use error::{Result, StoreError};
pub use storage::{CacheInfo, Scope, Storage};

// the model layer, re-exported for callers
pub use memodb_lib::call::Call;
pub use memodb_lib::hash::{Hash, hash_bytes};
pub use memodb_lib::ids::{Cid, Hid};
pub use memodb_lib::op::{
    ArgValue, Bindings, DefaultValue, Op, OpFunc, OpReturn, OutputSpec, Param, ParamKind,
    StructuralKind, Supplied, ignored,
};
pub use memodb_lib::refs::{AtomRef, DictRef, ListRef, Ref, wrap_atom};
pub use memodb_lib::types::Type;
pub use memodb_lib::value::{Encode, Value};
