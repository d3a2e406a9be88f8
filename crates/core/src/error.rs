use memodb_lib::ids::{Cid, Hid};
use memodb_lib::op::SignatureError;
use memodb_lib::value::CodecError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key `{key}` not found in table `{table}`")]
    KeyNotFound { table: &'static str, key: String },
    #[error("no shape saved for ref history id {0}")]
    RefNotFound(Hid),
    #[error("no atom saved for content id {0}")]
    AtomNotFound(Cid),
    #[error("no call saved for history id {0}")]
    CallNotFound(Hid),
    #[error("op `{0}` has not been saved")]
    OpNotFound(String),
    #[error("version id `{0}` not found")]
    VersionNotFound(String),
    #[error("a versioner with dependency roots {existing:?} is already saved, asked for {requested:?}")]
    DuplicateSavedVersioner {
        existing: Vec<String>,
        requested: Vec<String>,
    },
    #[error("op `{op}` mutated inputs in place: {slots:?}")]
    SideEffectDetected { op: String, slots: Vec<String> },
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("{0} is not allowed while a storage scope is open")]
    NotAllowedInContext(&'static str),
    #[error("expected a {expected} ref, found a {found}")]
    UnsupportedRefShape {
        expected: &'static str,
        found: &'static str,
    },
    #[error("transaction aborted: {0}")]
    TransactionAborted(#[from] rusqlite::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("op `{op}` failed")]
    OpFailed {
        op: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("op `{op}` has no function attached and cannot execute")]
    NotExecutable { op: String },
}
