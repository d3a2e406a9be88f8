//! The call pipeline: wrap the inputs into refs, look the call up by history
//! and then by content, execute on a miss under the side-effect guard, and
//! wrap the outputs back into refs, emitting structural sub-calls so every
//! nested component is linked to the call that produced it.

use std::collections::BTreeMap;

use memodb_lib::call::Call;
use memodb_lib::ids::{Cid, Hid};
use memodb_lib::op::{
    ArgValue, Bindings, Bound, DefaultValue, Op, OpReturn, ParsedArgs, SignatureError,
    StructuralKind, Supplied, bind_args, get_dict_value, get_list_item, make_dict, make_list,
};
use memodb_lib::refs::{DictRef, ListRef, Ref, wrap_atom};
use memodb_lib::types::Type;
use memodb_lib::value::Value;

use crate::error::{Result, StoreError};
use crate::storage::Storage;

fn type_kind(tp: &Type) -> &'static str {
    match tp {
        Type::Atom => "atom",
        Type::List(_) => "list",
        Type::Dict(_, _) => "dict",
    }
}

/// Content id a value would get if it were wrapped under the given type,
/// computed without emitting any structural calls. The codec is canonical
/// (maps are ordered), so recomputing this is stable.
fn typed_value_cid(tp: &Type, value: &Value) -> Result<Cid> {
    match tp {
        Type::Atom => Ok(Cid::of_value(value)),
        Type::List(elt) => {
            let items = value.as_list().ok_or(StoreError::UnsupportedRefShape {
                expected: "list",
                found: value.kind(),
            })?;
            let children = items
                .iter()
                .map(|item| typed_value_cid(elt, item))
                .collect::<Result<Vec<Cid>>>()?;
            Ok(Cid::of_list(&children))
        }
        Type::Dict(_, val_tp) => {
            let entries = value.as_map().ok_or(StoreError::UnsupportedRefShape {
                expected: "dict",
                found: value.kind(),
            })?;
            let mut children = Vec::with_capacity(entries.len());
            for (key, item) in entries {
                children.push((key.as_str(), typed_value_cid(val_tp, item)?));
            }
            Ok(Cid::of_dict(children))
        }
    }
}

enum VersionOutcome {
    Unversioned,
    /// The versioner could not resolve a version; the call is treated as not
    /// found and must execute.
    Declined,
    Resolved(String),
}

impl Storage {
    /// Bind a call site against an op's signature and apply the `NewArg`
    /// default elision: a supplied value equal to such a default (unwrapping
    /// it if a ref was passed) is removed from the storage view, so calls
    /// recorded before the parameter existed keep matching.
    pub(crate) fn parse_args(
        &mut self,
        op: &Op,
        args: Vec<ArgValue>,
        kwargs: Vec<(String, ArgValue)>,
    ) -> Result<ParsedArgs> {
        let mut parsed = bind_args(op, args, kwargs)?;
        for param in &op.params {
            let Some(DefaultValue::NewArg(default)) = &param.default else {
                continue;
            };
            let Some(supplied) = parsed.storage_inputs.get(&param.name) else {
                continue;
            };
            let matches_default = match supplied {
                Supplied::Value(v) => v == default,
                Supplied::Ref(r) => self.unwrap_ref(r)? == *default,
            };
            if matches_default {
                parsed.storage_inputs.remove(&param.name);
                parsed.storage_types.remove(&param.name);
                parsed.bindings.set_value(&param.name, default.clone());
            }
        }
        Ok(parsed)
    }

    /// Turn a supplied argument into a ref under its declared type. Refs pass
    /// through; atoms wrap in place; composites run the matching structural
    /// builder, and the calls that entailed are returned for saving.
    pub fn construct(&mut self, tp: &Type, val: Supplied) -> Result<(Ref, Vec<Call>)> {
        let value = match val {
            Supplied::Ref(r) => return Ok((r, Vec::new())),
            Supplied::Value(v) => v,
        };
        match tp {
            Type::Atom => Ok((Ref::Atom(wrap_atom(value, None)), Vec::new())),
            Type::List(elt) => {
                let items = match value {
                    Value::List(items) => items,
                    other => {
                        return Err(StoreError::UnsupportedRefShape {
                            expected: "list",
                            found: other.kind(),
                        });
                    }
                };
                let mut inputs = BTreeMap::new();
                let mut tps = BTreeMap::new();
                for (i, item) in items.into_iter().enumerate() {
                    inputs.insert(format!("elts_{i}"), Supplied::Value(item));
                    tps.insert(format!("elts_{i}"), (**elt).clone());
                }
                self.construct_with_builder(make_list(), inputs, tps)
            }
            Type::Dict(_, val_tp) => {
                let entries = match value {
                    Value::Map(entries) => entries,
                    other => {
                        return Err(StoreError::UnsupportedRefShape {
                            expected: "dict",
                            found: other.kind(),
                        });
                    }
                };
                let mut inputs = BTreeMap::new();
                let mut tps = BTreeMap::new();
                for (key, item) in entries {
                    inputs.insert(key.clone(), Supplied::Value(item));
                    tps.insert(key, (**val_tp).clone());
                }
                self.construct_with_builder(make_dict(), inputs, tps)
            }
        }
    }

    fn construct_with_builder(
        &mut self,
        builder: Op,
        inputs: BTreeMap<String, Supplied>,
        tps: BTreeMap<String, Type>,
    ) -> Result<(Ref, Vec<Call>)> {
        let (outputs, main_call, mut calls) = self.call_internal(&builder, inputs, tps, None)?;
        let out = outputs.get("output_0").cloned().ok_or_else(|| {
            StoreError::IntegrityViolation(format!("builder `{}` produced no output", builder.name))
        })?;
        calls.push(main_call);
        Ok((out, calls))
    }

    /// Re-derive the internal history ids of a composite ref by emitting
    /// explicit getter calls against it, so each nested component's history
    /// is linked to the containing call.
    pub fn destruct(&mut self, r: Ref, tp: &Type) -> Result<(Ref, Vec<Call>)> {
        match r {
            Ref::Atom(_) => Ok((r, Vec::new())),
            Ref::List(list) => {
                let Type::List(elt_tp) = tp else {
                    return Err(StoreError::UnsupportedRefShape {
                        expected: "list",
                        found: type_kind(tp),
                    });
                };
                let children = list.obj.ok_or_else(|| {
                    StoreError::IntegrityViolation("cannot destructure a detached list".into())
                })?;
                let whole = Ref::List(ListRef {
                    cid: list.cid,
                    hid: list.hid,
                    obj: Some(children.clone()),
                });
                let mut new_children = Vec::with_capacity(children.len());
                let mut calls = Vec::new();
                for i in 0..children.len() {
                    let inputs = BTreeMap::from([
                        ("obj".to_owned(), Supplied::Ref(whole.clone())),
                        ("attr".to_owned(), Supplied::Value(Value::Int(i as i64))),
                    ]);
                    let tps = BTreeMap::from([
                        ("obj".to_owned(), tp.clone()),
                        ("attr".to_owned(), Type::Atom),
                    ]);
                    let (outputs, item_call, _) =
                        self.call_internal(&get_list_item(), inputs, tps, None)?;
                    let item = outputs.get("output_0").cloned().ok_or_else(|| {
                        StoreError::IntegrityViolation("getter produced no output".into())
                    })?;
                    calls.push(item_call);
                    let (item, sub_calls) = self.destruct(item, elt_tp)?;
                    new_children.push(item);
                    calls.extend(sub_calls);
                }
                Ok((
                    Ref::List(ListRef { cid: list.cid, hid: list.hid, obj: Some(new_children) }),
                    calls,
                ))
            }
            Ref::Dict(dict) => {
                let Type::Dict(key_tp, val_tp) = tp else {
                    return Err(StoreError::UnsupportedRefShape {
                        expected: "dict",
                        found: type_kind(tp),
                    });
                };
                let children = dict.obj.ok_or_else(|| {
                    StoreError::IntegrityViolation("cannot destructure a detached dict".into())
                })?;
                let whole = Ref::Dict(DictRef {
                    cid: dict.cid,
                    hid: dict.hid,
                    obj: Some(children.clone()),
                });
                let mut new_children = BTreeMap::new();
                let mut calls = Vec::new();
                for key in children.keys() {
                    let inputs = BTreeMap::from([
                        ("obj".to_owned(), Supplied::Ref(whole.clone())),
                        ("key".to_owned(), Supplied::Value(Value::Text(key.clone()))),
                    ]);
                    let tps = BTreeMap::from([
                        ("obj".to_owned(), tp.clone()),
                        ("key".to_owned(), (**key_tp).clone()),
                    ]);
                    let (outputs, value_call, _) =
                        self.call_internal(&get_dict_value(), inputs, tps, None)?;
                    let item = outputs.get("output_0").cloned().ok_or_else(|| {
                        StoreError::IntegrityViolation("getter produced no output".into())
                    })?;
                    calls.push(value_call);
                    let (item, sub_calls) = self.destruct(item, val_tp)?;
                    new_children.insert(key.clone(), item);
                    calls.extend(sub_calls);
                }
                Ok((
                    Ref::Dict(DictRef { cid: dict.cid, hid: dict.hid, obj: Some(new_children) }),
                    calls,
                ))
            }
        }
    }

    fn resolve_semantic_version(&self, op: &Op, pre_call_id: &Cid) -> VersionOutcome {
        let Some(versioner) = self.versioner.as_ref() else {
            return VersionOutcome::Unversioned;
        };
        let code_state = match &self.code_state {
            Some(state) => state.clone(),
            None => versioner.guess_code_state(),
        };
        match versioner.lookup_call(&op.name, pre_call_id, &code_state) {
            Some(ids) => VersionOutcome::Resolved(ids.semantic_version),
            None => {
                log::debug!("no version resolved for `{}`", op.name);
                VersionOutcome::Declined
            }
        }
    }

    /// Find a reusable call: first by history id, then by content id. A
    /// content hit is cloned under the expected history, with every output
    /// hid rewritten to the deterministic derivation from the new call hid.
    pub(crate) fn lookup_call(
        &mut self,
        op: &Op,
        inputs: &BTreeMap<String, Ref>,
        pre_call_id: &Cid,
    ) -> Result<Option<Call>> {
        let semantic_version = match self.resolve_semantic_version(op, pre_call_id) {
            VersionOutcome::Unversioned => None,
            VersionOutcome::Declined => return Ok(None),
            VersionOutcome::Resolved(version) => Some(version),
        };

        let call_hid = op.call_history_id(inputs, semantic_version.as_deref());
        let by_hid = {
            let Storage { db, calls, .. } = self;
            db.with_txn(|conn| {
                if calls.exists(conn, call_hid)? {
                    calls.get_data(conn, call_hid).map(Some)
                } else {
                    Ok(None)
                }
            })?
        };
        if let Some(data) = by_hid {
            return Ok(Some(self.call_from_data(&data, true)?));
        }

        let call_cid = op.call_content_id(inputs, semantic_version.as_deref());
        let by_cid = {
            let Storage { db, calls, .. } = self;
            db.with_txn(|conn| calls.get_data_content(conn, call_cid))?
        };
        if let Some(data) = by_cid {
            let mut call = self.call_from_data(&data, true)?;
            call.hid = call_hid;
            let names: Vec<String> = call.outputs.keys().cloned().collect();
            for name in names {
                let hid = Op::output_history_id(call_hid, &name);
                if let Some(output) = call.outputs.get_mut(&name) {
                    output.set_hid(hid);
                }
            }
            return Ok(Some(call));
        }

        if !op.is_structural() {
            log::debug!("no call to `{}` with hid {call_hid} or cid {call_cid}", op.name);
        }
        Ok(None)
    }

    fn unwrap_supplied(&mut self, supplied: &mut Supplied) -> Result<()> {
        if let Supplied::Ref(r) = supplied {
            let value = self.unwrap_ref(r)?;
            *supplied = Supplied::Value(value);
        }
        Ok(())
    }

    fn unwrap_bindings(&mut self, bindings: &mut Bindings) -> Result<()> {
        let mut slots: Vec<&mut Supplied> = Vec::new();
        for (_, bound) in bindings.iter_mut() {
            match bound {
                Bound::One(s) => slots.push(s),
                Bound::Rest(items) => slots.extend(items.iter_mut()),
                Bound::Kwargs(entries) => slots.extend(entries.values_mut()),
            }
        }
        for slot in slots {
            self.unwrap_supplied(slot)?;
        }
        Ok(())
    }

    fn run_structural(
        &mut self,
        kind: StructuralKind,
        inputs: &BTreeMap<String, Ref>,
    ) -> Result<Vec<OpReturn>> {
        match kind {
            StructuralKind::MakeList => {
                let mut indexed = Vec::with_capacity(inputs.len());
                for (name, r) in inputs {
                    let index: usize = name
                        .rsplit('_')
                        .next()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| {
                            StoreError::IntegrityViolation(format!("bad list slot `{name}`"))
                        })?;
                    indexed.push((index, r.clone()));
                }
                indexed.sort_by_key(|(i, _)| *i);
                let children: Vec<Ref> = indexed.into_iter().map(|(_, r)| r).collect();
                let cid = Cid::of_list(&children.iter().map(Ref::cid).collect::<Vec<Cid>>());
                Ok(vec![OpReturn::Ref(Ref::List(ListRef {
                    cid,
                    hid: Hid::fresh(),
                    obj: Some(children),
                }))])
            }
            StructuralKind::MakeDict => {
                let cid = Cid::of_dict(inputs.iter().map(|(k, r)| (k.as_str(), r.cid())));
                Ok(vec![OpReturn::Ref(Ref::Dict(DictRef {
                    cid,
                    hid: Hid::fresh(),
                    obj: Some(inputs.clone()),
                }))])
            }
            StructuralKind::GetListItem => {
                let obj = inputs.get("obj").ok_or(SignatureError::MissingSlot {
                    name: "obj".to_owned(),
                })?;
                let attr = inputs.get("attr").ok_or(SignatureError::MissingSlot {
                    name: "attr".to_owned(),
                })?;
                let index_value = self.unwrap_ref(attr)?;
                let index = index_value.as_int().ok_or(StoreError::UnsupportedRefShape {
                    expected: "int",
                    found: index_value.kind(),
                })? as usize;
                let Ref::List(list) = obj else {
                    return Err(StoreError::UnsupportedRefShape {
                        expected: "list",
                        found: obj.kind(),
                    });
                };
                let children = list.obj.as_ref().ok_or_else(|| {
                    StoreError::IntegrityViolation("cannot index a detached list".into())
                })?;
                let child = children.get(index).ok_or_else(|| {
                    StoreError::IntegrityViolation(format!("list index {index} out of range"))
                })?;
                Ok(vec![OpReturn::Ref(child.clone())])
            }
            StructuralKind::GetDictValue => {
                let obj = inputs.get("obj").ok_or(SignatureError::MissingSlot {
                    name: "obj".to_owned(),
                })?;
                let key_ref = inputs.get("key").ok_or(SignatureError::MissingSlot {
                    name: "key".to_owned(),
                })?;
                let key_value = self.unwrap_ref(key_ref)?;
                let key = key_value.as_text().ok_or(StoreError::UnsupportedRefShape {
                    expected: "text",
                    found: key_value.kind(),
                })?;
                let Ref::Dict(dict) = obj else {
                    return Err(StoreError::UnsupportedRefShape {
                        expected: "dict",
                        found: obj.kind(),
                    });
                };
                let children = dict.obj.as_ref().ok_or_else(|| {
                    StoreError::IntegrityViolation("cannot index a detached dict".into())
                })?;
                let child = children.get(key).ok_or_else(|| {
                    StoreError::IntegrityViolation(format!("dict key `{key}` not found"))
                })?;
                Ok(vec![OpReturn::Ref(child.clone())])
            }
        }
    }

    /// The heart of the engine: wrap, look up, execute or reuse, wrap back.
    /// Returns the outputs, the main call, and every auxiliary structural
    /// call entailed along the way. Nothing is persisted here; that is
    /// [`Storage::save_call`]'s job.
    pub fn call_internal(
        &mut self,
        op: &Op,
        storage_inputs: BTreeMap<String, Supplied>,
        storage_types: BTreeMap<String, Type>,
        bindings: Option<&mut Bindings>,
    ) -> Result<(BTreeMap<String, Ref>, Call, Vec<Call>)> {
        // 1. wrap the inputs
        let mut wrapped: BTreeMap<String, Ref> = BTreeMap::new();
        let mut aux_calls: Vec<Call> = Vec::new();
        for (slot, supplied) in storage_inputs {
            let tp = storage_types.get(&slot).cloned().unwrap_or(Type::Atom);
            let (r, calls) = self.construct(&tp, supplied)?;
            wrapped.insert(slot, r);
            aux_calls.extend(calls);
        }

        // 2. look the call up
        let pre_call_id = op.pre_call_id(&wrapped);
        if let Some(call) = self.lookup_call(op, &wrapped, &pre_call_id)? {
            if !op.is_structural() {
                log::debug!("call to `{}` with hid {} already recorded", op.name, call.hid);
            }
            return Ok((call.outputs.clone(), call, aux_calls));
        }

        // 3. execute
        let returns;
        let mut semantic_version = None;
        let mut content_version = None;
        if let Some(kind) = op.structural {
            returns = self.run_structural(kind, &wrapped)?;
        } else {
            log::debug!("executing `{}`", op.name);
            let bindings = bindings.ok_or_else(|| {
                StoreError::IntegrityViolation(format!(
                    "op `{}` cannot run without bound arguments",
                    op.name
                ))
            })?;
            let cids_before: BTreeMap<String, Cid> =
                wrapped.iter().map(|(slot, r)| (slot.clone(), r.cid())).collect();
            self.unwrap_bindings(bindings)?;
            let func = op
                .func
                .clone()
                .ok_or_else(|| StoreError::NotExecutable { op: op.name.clone() })?;
            returns = (*func)(bindings).map_err(|source| StoreError::OpFailed {
                op: op.name.clone(),
                source,
            })?;

            if !op.allow_side_effects {
                // re-fingerprint what the function could reach and compare
                let mut changed = Vec::new();
                for (slot, before) in &cids_before {
                    let Some(supplied) = bindings.storage_slot(op, slot) else {
                        continue;
                    };
                    let Some(value) = supplied.as_value() else {
                        continue;
                    };
                    let tp = storage_types.get(slot).cloned().unwrap_or(Type::Atom);
                    if typed_value_cid(&tp, value)? != *before {
                        changed.push(slot.clone());
                    }
                }
                if !changed.is_empty() {
                    return Err(StoreError::SideEffectDetected {
                        op: op.name.clone(),
                        slots: changed,
                    });
                }
            }

            if self.versioned() {
                let code_state = match &self.code_state {
                    Some(state) => state.clone(),
                    None => match self.versioner.as_ref() {
                        Some(v) => v.guess_code_state(),
                        None => Default::default(),
                    },
                };
                if let Some(versioner) = self.versioner.as_mut() {
                    let ids = versioner.version_ids(&op.name, &pre_call_id, &code_state);
                    content_version = Some(ids.content_version);
                    semantic_version = Some(ids.semantic_version);
                }
            }
        }

        // 4. wrap the outputs
        if returns.len() != op.outputs.len() {
            return Err(SignatureError::OutputArity {
                op: op.name.clone(),
                expected: op.outputs.len(),
                got: returns.len(),
            }
            .into());
        }
        let call_cid = op.call_content_id(&wrapped, semantic_version.as_deref());
        let call_hid = op.call_history_id(&wrapped, semantic_version.as_deref());
        let mut outputs = BTreeMap::new();
        for (spec, ret) in op.outputs.iter().zip(returns) {
            let out_hid = Op::output_history_id(call_hid, &spec.name);
            let wrapped_out = match ret {
                OpReturn::Ref(r) => r.with_hid(out_hid),
                OpReturn::Value(v) => {
                    if spec.ty.is_atom() {
                        Ref::Atom(wrap_atom(v, Some(out_hid)))
                    } else {
                        // the builder call is discarded; the getter calls
                        // from destruct carry the provenance
                        let (start, _) = self.construct(&spec.ty, Supplied::Value(v))?;
                        let start = start.with_hid(out_hid);
                        let (done, sub_calls) = self.destruct(start, &spec.ty)?;
                        aux_calls.extend(sub_calls);
                        done
                    }
                }
            };
            outputs.insert(spec.name.clone(), wrapped_out);
        }

        // 5. assemble
        let call = Call {
            op: op.clone(),
            cid: call_cid,
            hid: call_hid,
            inputs: wrapped,
            outputs,
            semantic_version,
            content_version,
        };
        Ok((call.outputs.clone(), call, aux_calls))
    }

    /// Call an op on actual arguments, reusing a recorded call when one
    /// matches, and record whatever calls this entailed. Returns the output
    /// refs in declared order.
    pub fn call(
        &mut self,
        op: &Op,
        args: Vec<ArgValue>,
        kwargs: Vec<(String, ArgValue)>,
    ) -> Result<Vec<Ref>> {
        let mut parsed = self.parse_args(op, args, kwargs)?;
        let (outputs, main_call, aux_calls) = self.call_internal(
            op,
            parsed.storage_inputs,
            parsed.storage_types,
            Some(&mut parsed.bindings),
        )?;
        self.save_call(&main_call)?;
        for call in &aux_calls {
            self.save_call(call)?;
        }
        Ok(op.ordered_outputs(&outputs))
    }
}
