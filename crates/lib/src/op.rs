use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::IdHasher;
use crate::ids::{Cid, Hid};
use crate::refs::Ref;
use crate::types::Type;
use crate::value::{Encode, Value};

/// How a parameter accepts arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    /// Fillable by position or by name.
    Positional,
    /// Fillable by name only.
    Keyword,
    /// Collects the remaining positional arguments; its slots are exploded
    /// into `name_0, name_1, …`.
    Rest,
    /// Collects unknown keyword arguments; slots keep their original keys.
    RestKeyword,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DefaultValue {
    /// Ordinary default: stored like any other input when it applies.
    Value(Value),
    /// Default added to the signature after calls were already recorded.
    /// An argument equal to it is elided from storage, so older cached calls
    /// keep matching.
    NewArg(Value),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    pub ty: Type,
    pub default: Option<DefaultValue>,
}

impl Param {
    pub fn positional(name: impl Into<String>, ty: Type) -> Param {
        Param { name: name.into(), kind: ParamKind::Positional, ty, default: None }
    }

    pub fn keyword(name: impl Into<String>, ty: Type) -> Param {
        Param { name: name.into(), kind: ParamKind::Keyword, ty, default: None }
    }

    pub fn rest(name: impl Into<String>, ty: Type) -> Param {
        Param { name: name.into(), kind: ParamKind::Rest, ty, default: None }
    }

    pub fn rest_keyword(name: impl Into<String>, ty: Type) -> Param {
        Param { name: name.into(), kind: ParamKind::RestKeyword, ty, default: None }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Param {
        self.default = Some(DefaultValue::Value(value.into()));
        self
    }

    pub fn with_new_default(mut self, value: impl Into<Value>) -> Param {
        self.default = Some(DefaultValue::NewArg(value.into()));
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub ty: Type,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, ty: Type) -> OutputSpec {
        OutputSpec { name: name.into(), ty }
    }
}

/// An actual argument at a call site: a plain value, an existing ref, or a
/// value the storage must ignore (it is still forwarded to the function).
#[derive(Clone, Debug)]
pub enum ArgValue {
    Value(Value),
    Ref(Ref),
    Ignored(Value),
}

impl From<Value> for ArgValue {
    fn from(v: Value) -> Self {
        ArgValue::Value(v)
    }
}

impl From<Ref> for ArgValue {
    fn from(r: Ref) -> Self {
        ArgValue::Ref(r)
    }
}

/// Marks a value as invisible to the storage.
pub fn ignored(v: impl Into<Value>) -> ArgValue {
    ArgValue::Ignored(v.into())
}

/// A bound argument payload: plain, or a ref the engine unwraps before the
/// function runs.
#[derive(Clone, Debug, PartialEq)]
pub enum Supplied {
    Value(Value),
    Ref(Ref),
}

impl Supplied {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Supplied::Value(v) => Some(v),
            Supplied::Ref(_) => None,
        }
    }

    pub fn as_value_mut(&mut self) -> Option<&mut Value> {
        match self {
            Supplied::Value(v) => Some(v),
            Supplied::Ref(_) => None,
        }
    }

    pub fn as_ref_handle(&self) -> Option<&Ref> {
        match self {
            Supplied::Ref(r) => Some(r),
            Supplied::Value(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Bound {
    One(Supplied),
    Rest(Vec<Supplied>),
    Kwargs(BTreeMap<String, Supplied>),
}

/// The actual arguments of one call, bound to the declared parameters in
/// signature order. This is what an op function receives; by then every
/// payload has been unwrapped to a plain value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bindings {
    entries: Vec<(String, Bound)>,
}

impl Bindings {
    pub fn get(&self, name: &str) -> Option<&Bound> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Bound> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bound)> {
        self.entries.iter().map(|(n, b)| (n.as_str(), b))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Bound)> {
        self.entries.iter_mut().map(|(n, b)| (n.as_str(), b))
    }

    pub fn push(&mut self, name: impl Into<String>, bound: Bound) {
        self.entries.push((name.into(), bound));
    }

    /// The plain value bound to a non-variadic parameter.
    pub fn value(&self, name: &str) -> Result<&Value, SignatureError> {
        match self.get(name) {
            Some(Bound::One(Supplied::Value(v))) => Ok(v),
            Some(_) => Err(SignatureError::NotAPlainValue { name: name.to_owned() }),
            None => Err(SignatureError::MissingSlot { name: name.to_owned() }),
        }
    }

    pub fn value_mut(&mut self, name: &str) -> Result<&mut Value, SignatureError> {
        match self.get_mut(name) {
            Some(Bound::One(Supplied::Value(v))) => Ok(v),
            Some(_) => Err(SignatureError::NotAPlainValue { name: name.to_owned() }),
            None => Err(SignatureError::MissingSlot { name: name.to_owned() }),
        }
    }

    /// The plain values collected by a rest parameter, in call order.
    pub fn rest_values(&self, name: &str) -> Result<Vec<&Value>, SignatureError> {
        match self.get(name) {
            Some(Bound::Rest(items)) => items
                .iter()
                .map(|s| {
                    s.as_value()
                        .ok_or_else(|| SignatureError::NotAPlainValue { name: name.to_owned() })
                })
                .collect(),
            Some(_) => Err(SignatureError::NotAPlainValue { name: name.to_owned() }),
            None => Err(SignatureError::MissingSlot { name: name.to_owned() }),
        }
    }

    /// The plain values collected by a rest-keyword parameter.
    pub fn kwarg_values(&self, name: &str) -> Result<BTreeMap<&str, &Value>, SignatureError> {
        match self.get(name) {
            Some(Bound::Kwargs(entries)) => entries
                .iter()
                .map(|(k, s)| {
                    s.as_value()
                        .map(|v| (k.as_str(), v))
                        .ok_or_else(|| SignatureError::NotAPlainValue { name: name.to_owned() })
                })
                .collect(),
            Some(_) => Err(SignatureError::NotAPlainValue { name: name.to_owned() }),
            None => Err(SignatureError::MissingSlot { name: name.to_owned() }),
        }
    }

    /// Replace the payload of a non-variadic parameter with a plain value.
    pub fn set_value(&mut self, name: &str, value: Value) {
        if let Some(bound) = self.get_mut(name) {
            *bound = Bound::One(Supplied::Value(value));
        }
    }

    /// Resolve an exploded storage slot name back to its bound payload.
    pub fn storage_slot(&self, op: &Op, slot: &str) -> Option<&Supplied> {
        for param in &op.params {
            match param.kind {
                ParamKind::Positional | ParamKind::Keyword if param.name == slot => {
                    if let Some(Bound::One(s)) = self.get(&param.name) {
                        return Some(s);
                    }
                }
                ParamKind::Rest => {
                    let prefix = format!("{}_", param.name);
                    if let Some(index) = slot.strip_prefix(&prefix) {
                        if let (Ok(i), Some(Bound::Rest(items))) =
                            (index.parse::<usize>(), self.get(&param.name))
                        {
                            return items.get(i);
                        }
                    }
                }
                ParamKind::RestKeyword => {
                    if let Some(Bound::Kwargs(entries)) = self.get(&param.name) {
                        if let Some(s) = entries.get(slot) {
                            return Some(s);
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("op `{op}` has no parameter named `{name}`")]
    UnknownKeyword { op: String, name: String },
    #[error("op `{op}` takes {expected} positional arguments but {got} were given")]
    TooManyPositional { op: String, expected: usize, got: usize },
    #[error("missing required argument `{name}` of op `{op}`")]
    MissingArgument { op: String, name: String },
    #[error("argument `{name}` of op `{op}` bound more than once")]
    DuplicateArgument { op: String, name: String },
    #[error("op `{op}` declares {expected} outputs but returned {got}")]
    OutputArity { op: String, expected: usize, got: usize },
    #[error("slot `{name}` does not hold a plain value")]
    NotAPlainValue { name: String },
    #[error("no slot named `{name}` in the bindings")]
    MissingSlot { name: String },
}

/// What an op function produces per declared output: a plain value, or a ref
/// whose history the engine rewrites to the call's derivation.
#[derive(Clone, Debug)]
pub enum OpReturn {
    Value(Value),
    Ref(Ref),
}

impl From<Value> for OpReturn {
    fn from(v: Value) -> Self {
        OpReturn::Value(v)
    }
}

impl From<Ref> for OpReturn {
    fn from(r: Ref) -> Self {
        OpReturn::Ref(r)
    }
}

pub type OpFunc = Arc<dyn Fn(&mut Bindings) -> anyhow::Result<Vec<OpReturn>> + Send + Sync>;

/// The built-in ops the engine implements natively to construct and
/// decompose composite refs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructuralKind {
    MakeList,
    MakeDict,
    GetListItem,
    GetDictValue,
}

/// Metadata of a memoizable operation. The function itself never reaches the
/// database: persisting an op stores its detached form.
#[derive(Clone, Serialize, Deserialize)]
pub struct Op {
    pub name: String,
    /// Version token of the op definition, folded into the op id. Distinct
    /// from the semantic version the versioner resolves per call.
    pub version: Option<String>,
    pub params: Vec<Param>,
    pub outputs: Vec<OutputSpec>,
    pub structural: Option<StructuralKind>,
    pub allow_side_effects: bool,
    #[serde(skip)]
    pub func: Option<OpFunc>,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("params", &self.params)
            .field("outputs", &self.outputs)
            .field("structural", &self.structural)
            .field("allow_side_effects", &self.allow_side_effects)
            .field("executable", &self.func.is_some())
            .finish()
    }
}

impl Encode for Op {}

impl PartialEq for Op {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.params == other.params
            && self.outputs == other.outputs
            && self.structural == other.structural
            && self.allow_side_effects == other.allow_side_effects
    }
}

impl Op {
    pub fn new(
        name: impl Into<String>,
        params: Vec<Param>,
        outputs: Vec<OutputSpec>,
        func: OpFunc,
    ) -> Op {
        Op {
            name: name.into(),
            version: None,
            params,
            outputs,
            structural: None,
            allow_side_effects: false,
            func: Some(func),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Op {
        self.version = Some(version.into());
        self
    }

    pub fn allowing_side_effects(mut self) -> Op {
        self.allow_side_effects = true;
        self
    }

    /// Metadata only, safe to persist.
    pub fn detached(&self) -> Op {
        Op { func: None, ..self.clone() }
    }

    pub fn is_structural(&self) -> bool {
        self.structural.is_some()
    }

    pub fn op_id(&self) -> String {
        match &self.version {
            Some(v) => format!("{}@{}", self.name, v),
            None => self.name.clone(),
        }
    }

    fn id_hasher(&self, tag: &[u8], semantic_version: Option<&str>) -> IdHasher {
        let mut hasher = IdHasher::new();
        hasher.update(tag);
        hasher.update(self.op_id().as_bytes());
        match semantic_version {
            Some(v) => {
                hasher.update(b"some");
                hasher.update(v.as_bytes());
            }
            None => {
                hasher.update(b"none");
            }
        }
        hasher
    }

    /// Content id of a call: equal-content inputs to the same op version
    /// always derive the same id, whatever their histories.
    pub fn call_content_id(
        &self,
        inputs: &BTreeMap<String, Ref>,
        semantic_version: Option<&str>,
    ) -> Cid {
        let mut hasher = self.id_hasher(b"call-cid", semantic_version);
        for (slot, r) in inputs {
            hasher.update(slot.as_bytes());
            hasher.update(r.cid().0.as_slice());
        }
        Cid(hasher.finish())
    }

    /// History id of a call: equal only when the full provenance path of the
    /// inputs is equal.
    pub fn call_history_id(
        &self,
        inputs: &BTreeMap<String, Ref>,
        semantic_version: Option<&str>,
    ) -> Hid {
        let mut hasher = self.id_hasher(b"call-hid", semantic_version);
        for (slot, r) in inputs {
            hasher.update(slot.as_bytes());
            hasher.update(r.hid().0.as_slice());
        }
        Hid(hasher.finish())
    }

    /// Id handed to the versioner before a call is resolved: op id plus the
    /// input histories.
    pub fn pre_call_id(&self, inputs: &BTreeMap<String, Ref>) -> Cid {
        let mut hasher = IdHasher::new();
        hasher.update(b"pre-call");
        hasher.update(self.op_id().as_bytes());
        for (slot, r) in inputs {
            hasher.update(slot.as_bytes());
            hasher.update(r.hid().0.as_slice());
        }
        Cid(hasher.finish())
    }

    /// Output histories are a deterministic function of the call history and
    /// the output slot name.
    pub fn output_history_id(call_hid: Hid, output_name: &str) -> Hid {
        let mut hasher = IdHasher::new();
        hasher.update(b"output");
        hasher.update(call_hid.0.as_slice());
        hasher.update(output_name.as_bytes());
        Hid(hasher.finish())
    }

    pub fn output_history_ids(&self, call_hid: Hid, names: &[String]) -> BTreeMap<String, Hid> {
        names
            .iter()
            .map(|name| (name.clone(), Op::output_history_id(call_hid, name)))
            .collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|o| o.name.clone()).collect()
    }

    /// Outputs in declared order.
    pub fn ordered_outputs(&self, outputs: &BTreeMap<String, Ref>) -> Vec<Ref> {
        self.outputs
            .iter()
            .filter_map(|spec| outputs.get(&spec.name).cloned())
            .collect()
    }
}

pub fn make_list() -> Op {
    Op {
        name: "__make_list__".to_owned(),
        version: None,
        params: vec![Param::rest("elts", Type::Atom)],
        outputs: vec![OutputSpec::new("output_0", Type::Atom)],
        structural: Some(StructuralKind::MakeList),
        allow_side_effects: false,
        func: None,
    }
}

pub fn make_dict() -> Op {
    Op {
        name: "__make_dict__".to_owned(),
        version: None,
        params: vec![Param::rest_keyword("entries", Type::Atom)],
        outputs: vec![OutputSpec::new("output_0", Type::Atom)],
        structural: Some(StructuralKind::MakeDict),
        allow_side_effects: false,
        func: None,
    }
}

pub fn get_list_item() -> Op {
    Op {
        name: "__get_list_item__".to_owned(),
        version: None,
        params: vec![
            Param::positional("obj", Type::Atom),
            Param::positional("attr", Type::Atom),
        ],
        outputs: vec![OutputSpec::new("output_0", Type::Atom)],
        structural: Some(StructuralKind::GetListItem),
        allow_side_effects: false,
        func: None,
    }
}

pub fn get_dict_value() -> Op {
    Op {
        name: "__get_dict_value__".to_owned(),
        version: None,
        params: vec![
            Param::positional("obj", Type::Atom),
            Param::positional("key", Type::Atom),
        ],
        outputs: vec![OutputSpec::new("output_0", Type::Atom)],
        structural: Some(StructuralKind::GetDictValue),
        allow_side_effects: false,
        func: None,
    }
}

/// The product of binding a call site against a signature: the bindings the
/// function will run with, plus the slot map the storage fingerprints.
/// `NewArg` default elision is applied by the engine on top of this, since
/// comparing a supplied ref against a default may require loading it.
#[derive(Clone, Debug)]
pub struct ParsedArgs {
    pub bindings: Bindings,
    pub storage_inputs: BTreeMap<String, Supplied>,
    pub storage_types: BTreeMap<String, Type>,
}

/// Bind positional and keyword arguments to an op's parameters, applying
/// defaults, exploding variadic slots, and stripping `Ignored` markers from
/// the storage view while forwarding their raw values to the bindings.
pub fn bind_args(
    op: &Op,
    args: Vec<ArgValue>,
    kwargs: Vec<(String, ArgValue)>,
) -> Result<ParsedArgs, SignatureError> {
    let mut positional: BTreeMap<usize, Vec<ArgValue>> = BTreeMap::new();
    let mut by_name: BTreeMap<String, ArgValue> = BTreeMap::new();
    let mut extra_kwargs: BTreeMap<String, ArgValue> = BTreeMap::new();

    // Distribute positional arguments over the parameter list; a rest
    // parameter swallows everything remaining.
    let mut args = args.into_iter();
    let mut positional_capacity = 0usize;
    'fill: for (i, param) in op.params.iter().enumerate() {
        match param.kind {
            ParamKind::Positional => {
                positional_capacity += 1;
                match args.next() {
                    Some(arg) => {
                        positional.insert(i, vec![arg]);
                    }
                    None => break 'fill,
                }
            }
            ParamKind::Rest => {
                positional.insert(i, args.by_ref().collect());
                break 'fill;
            }
            ParamKind::Keyword | ParamKind::RestKeyword => break 'fill,
        }
    }
    let leftover = args.count();
    if leftover > 0 {
        return Err(SignatureError::TooManyPositional {
            op: op.name.clone(),
            expected: positional_capacity,
            got: positional_capacity + leftover,
        });
    }

    // Keyword arguments bind by name; unknown names flow into the
    // rest-keyword parameter when there is one.
    let has_rest_keyword = op.params.iter().any(|p| p.kind == ParamKind::RestKeyword);
    for (name, arg) in kwargs {
        let target = op
            .params
            .iter()
            .position(|p| p.name == name && matches!(p.kind, ParamKind::Positional | ParamKind::Keyword));
        match target {
            Some(i) => {
                if positional.contains_key(&i) || by_name.contains_key(&name) {
                    return Err(SignatureError::DuplicateArgument { op: op.name.clone(), name });
                }
                by_name.insert(name, arg);
            }
            None if has_rest_keyword => {
                if extra_kwargs.insert(name.clone(), arg).is_some() {
                    return Err(SignatureError::DuplicateArgument { op: op.name.clone(), name });
                }
            }
            None => return Err(SignatureError::UnknownKeyword { op: op.name.clone(), name }),
        }
    }

    let mut bindings = Bindings::default();
    let mut storage_inputs = BTreeMap::new();
    let mut storage_types = BTreeMap::new();

    let mut admit = |slot: String, ty: &Type, arg: ArgValue| -> Supplied {
        match arg {
            ArgValue::Value(v) => {
                let supplied = Supplied::Value(v);
                storage_inputs.insert(slot.clone(), supplied.clone());
                storage_types.insert(slot, ty.clone());
                supplied
            }
            ArgValue::Ref(r) => {
                let supplied = Supplied::Ref(r);
                storage_inputs.insert(slot.clone(), supplied.clone());
                storage_types.insert(slot, ty.clone());
                supplied
            }
            // ignored arguments never reach the storage view
            ArgValue::Ignored(v) => Supplied::Value(v),
        }
    };

    for (i, param) in op.params.iter().enumerate() {
        match param.kind {
            ParamKind::Positional | ParamKind::Keyword => {
                let arg = positional
                    .remove(&i)
                    .map(|mut v| v.remove(0))
                    .or_else(|| by_name.remove(&param.name));
                let bound = match arg {
                    Some(arg) => admit(param.name.clone(), &param.ty, arg),
                    None => match &param.default {
                        Some(DefaultValue::Value(v)) | Some(DefaultValue::NewArg(v)) => {
                            admit(param.name.clone(), &param.ty, ArgValue::Value(v.clone()))
                        }
                        None => {
                            return Err(SignatureError::MissingArgument {
                                op: op.name.clone(),
                                name: param.name.clone(),
                            });
                        }
                    },
                };
                bindings.push(param.name.clone(), Bound::One(bound));
            }
            ParamKind::Rest => {
                let items = positional.remove(&i).unwrap_or_default();
                let mut bound_items = Vec::with_capacity(items.len());
                for (j, arg) in items.into_iter().enumerate() {
                    let slot = format!("{}_{}", param.name, j);
                    bound_items.push(admit(slot, &param.ty, arg));
                }
                bindings.push(param.name.clone(), Bound::Rest(bound_items));
            }
            ParamKind::RestKeyword => {
                let mut bound_entries = BTreeMap::new();
                for (key, arg) in std::mem::take(&mut extra_kwargs) {
                    let bound = admit(key.clone(), &param.ty, arg);
                    bound_entries.insert(key, bound);
                }
                bindings.push(param.name.clone(), Bound::Kwargs(bound_entries));
            }
        }
    }

    Ok(ParsedArgs { bindings, storage_inputs, storage_types })
}
