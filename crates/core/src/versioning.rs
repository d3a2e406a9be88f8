use std::collections::BTreeMap;

use memodb_lib::hash::Hash;
use memodb_lib::ids::Cid;
use memodb_lib::value::Encode;
use serde::{Deserialize, Serialize};

/// A snapshot of the code identity of every component the versioner tracks.
/// Opaque to the engine; it is captured on scope entry and handed back on
/// every lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeState(pub BTreeMap<String, Hash>);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionIds {
    pub content_version: String,
    pub semantic_version: String,
}

/// External collaborator that partitions calls by code identity. When a
/// storage is versioned, every lookup first resolves the semantic version of
/// the op under the current code state; a declined resolution means the call
/// cannot be reused and must execute.
pub trait Versioner: Send {
    /// The dependency roots this versioner watches. Checked against the
    /// persisted configuration on attach.
    fn dependency_roots(&self) -> Vec<String>;

    /// Best guess at the current code state, without touching the store.
    fn guess_code_state(&self) -> CodeState;

    /// Bring the versioner's picture of the codebase up to date.
    fn sync_codebase(&mut self, code_state: &CodeState);

    /// Resolve the version under which a call to `component` with the given
    /// pre-call id would be stored, or decline.
    fn lookup_call(
        &self,
        component: &str,
        pre_call_id: &Cid,
        code_state: &CodeState,
    ) -> Option<VersionIds>;

    /// Version ids to record for a freshly executed call.
    fn version_ids(&mut self, component: &str, pre_call_id: &Cid, code_state: &CodeState)
    -> VersionIds;
}

/// What the `sources` table remembers about an attached versioner, under the
/// `versioner` slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedVersioner {
    pub roots: Vec<String>,
}

impl SavedVersioner {
    pub const SLOT: &'static str = "versioner";
}

impl Encode for SavedVersioner {}
