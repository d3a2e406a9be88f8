use std::collections::BTreeMap;

use crate::ids::{Cid, Hid};
use crate::op::Op;
use crate::refs::Ref;

/// Record of one execution of an op: which input refs went in, which output
/// refs came out, and under which content/history identities.
#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub op: Op,
    pub cid: Cid,
    pub hid: Hid,
    pub inputs: BTreeMap<String, Ref>,
    pub outputs: BTreeMap<String, Ref>,
    pub semantic_version: Option<String>,
    pub content_version: Option<String>,
}

impl Call {
    /// Every input and output ref of the call, inputs first.
    pub fn io_refs(&self) -> impl Iterator<Item = &Ref> {
        self.inputs.values().chain(self.outputs.values())
    }
}
