use std::cell::Cell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use memodb_lib::call::Call;
use memodb_lib::ids::{Cid, Hid};
use memodb_lib::op::Op;
use memodb_lib::refs::{AtomRef, DictRef, ListRef, Ref};
use memodb_lib::value::{Encode, Value};

use crate::db::DbAdapter;
use crate::db::calls::{CachedCalls, CallData};
use crate::db::kv::{CachedKv, TableValue};
use crate::error::{Result, StoreError};
use crate::versioning::{CodeState, SavedVersioner, Versioner};

fn kv_get<V: TableValue>(db: &DbAdapter, kv: &mut CachedKv<V>, key: &str) -> Result<V> {
    db.with_txn(|conn| kv.get(conn, key))
}

fn kv_exists<V: TableValue>(db: &DbAdapter, kv: &CachedKv<V>, key: &str) -> Result<bool> {
    db.with_txn(|conn| kv.exists(conn, key))
}

/// The memoizing computation store: four keyed tables (atoms, shapes, ops,
/// sources) and the calls relation, each behind a write-through cache, over
/// one embedded database. Everything becomes durable on [`Storage::commit`].
pub struct Storage {
    pub(crate) db: DbAdapter,
    pub(crate) atoms: CachedKv<Vec<u8>>,
    pub(crate) shapes: CachedKv<Ref>,
    pub(crate) ops: CachedKv<Op>,
    pub(crate) sources: CachedKv<Vec<u8>>,
    pub(crate) calls: CachedCalls,
    pub(crate) versioner: Option<Box<dyn Versioner>>,
    pub(crate) code_state: Option<CodeState>,
    pub(crate) scope_depth: Cell<u32>,
}

impl Storage {
    pub fn in_memory() -> Result<Storage> {
        Storage::init(DbAdapter::in_memory()?)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Storage> {
        Storage::init(DbAdapter::open(path)?)
    }

    fn init(db: DbAdapter) -> Result<Storage> {
        let storage = Storage {
            db,
            atoms: CachedKv::new("atoms"),
            shapes: CachedKv::new("shapes"),
            ops: CachedKv::new("ops"),
            sources: CachedKv::new("sources"),
            calls: CachedCalls::new("calls"),
            versioner: None,
            code_state: None,
            scope_depth: Cell::new(0),
        };
        storage.db.with_txn(|conn| {
            storage.atoms.create(conn)?;
            storage.shapes.create(conn)?;
            storage.ops.create(conn)?;
            storage.sources.create(conn)?;
            storage.calls.create(conn)
        })?;
        Ok(storage)
    }

    /// Attach a versioner. Its dependency roots must agree with whatever a
    /// previous run persisted; the first attach records them.
    pub fn with_versioner(mut self, versioner: Box<dyn Versioner>) -> Result<Storage> {
        let requested = versioner.dependency_roots();
        let saved = {
            let db = &self.db;
            let sources = &mut self.sources;
            if db.with_txn(|conn| sources.exists(conn, SavedVersioner::SLOT))? {
                Some(SavedVersioner::decode(&db.with_txn(|conn| {
                    sources.get(conn, SavedVersioner::SLOT)
                })?)?)
            } else {
                None
            }
        };
        match saved {
            Some(saved) if saved.roots != requested => {
                return Err(StoreError::DuplicateSavedVersioner {
                    existing: saved.roots,
                    requested,
                });
            }
            Some(_) => {}
            None => {
                let db = &self.db;
                let sources = &mut self.sources;
                db.with_txn(|conn| {
                    sources.put_through(
                        conn,
                        SavedVersioner::SLOT,
                        SavedVersioner { roots: requested }.encode(),
                    )
                })?;
            }
        }
        self.versioner = Some(versioner);
        Ok(self)
    }

    pub fn versioned(&self) -> bool {
        self.versioner.is_some()
    }

    pub fn vacuum(&self) -> Result<()> {
        self.db.vacuum()
    }

    /// Names of the relations present in the database.
    pub fn tables(&self) -> Result<Vec<String>> {
        self.db.tables()
    }

    /// Flush every cache in one transaction, in the order atoms, shapes,
    /// ops, calls. A failure rolls the transaction back and keeps every
    /// dirty set intact for the next attempt.
    pub fn commit(&mut self) -> Result<()> {
        let Storage { db, atoms, shapes, ops, calls, .. } = self;
        db.with_txn(|conn| {
            atoms.commit(conn)?;
            shapes.commit(conn)?;
            ops.commit(conn)?;
            calls.commit(conn)
        })
    }

    pub fn cache_info(&self) -> CacheInfo {
        CacheInfo {
            rows: vec![
                ("atoms", self.atoms.cache_len(), self.atoms.dirty_len()),
                ("shapes", self.shapes.cache_len(), self.shapes.dirty_len()),
                ("ops", self.ops.cache_len(), self.ops.dirty_len()),
                ("calls", self.calls.cache_len(), self.calls.dirty_len()),
            ],
        }
    }

    pub fn preload_calls(&mut self) -> Result<()> {
        let Storage { db, calls, .. } = self;
        db.with_txn(|conn| calls.preload(conn))
    }

    pub fn preload_shapes(&mut self) -> Result<()> {
        let Storage { db, shapes, .. } = self;
        db.with_txn(|conn| shapes.preload(conn))
    }

    pub fn preload_ops(&mut self) -> Result<()> {
        let Storage { db, ops, .. } = self;
        db.with_txn(|conn| ops.preload(conn))
    }

    pub fn preload_atoms(&mut self) -> Result<()> {
        let Storage { db, atoms, .. } = self;
        db.with_txn(|conn| atoms.preload(conn))
    }

    /// Hydrate the caches from persistence; atom payloads only when not
    /// `lazy`.
    pub fn preload(&mut self, lazy: bool) -> Result<()> {
        self.preload_calls()?;
        self.preload_shapes()?;
        self.preload_ops()?;
        if !lazy {
            self.preload_atoms()?;
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // refs
    ////////////////////////////////////////////////////////////////////////

    /// Persist a ref: its serialized payload for in-memory atoms, its shape
    /// per history id, recursing into composite children. Idempotent on the
    /// history id; the given ref may be detached.
    pub fn save_ref(&mut self, r: &Ref) -> Result<()> {
        let key = r.hid().to_hex();
        if kv_exists(&self.db, &self.shapes, &key)? {
            return Ok(());
        }
        match r {
            Ref::Atom(atom) => {
                // only a materialized atom has bytes to store
                if let Some(obj) = &atom.obj {
                    self.atoms.set(atom.cid.to_hex(), obj.encode());
                }
                self.shapes.set(key, r.detached());
            }
            Ref::List(list) => {
                self.shapes.set(key, r.shape());
                if let Some(children) = &list.obj {
                    for child in children {
                        self.save_ref(child)?;
                    }
                }
            }
            Ref::Dict(dict) => {
                self.shapes.set(key, r.shape());
                if let Some(children) = &dict.obj {
                    for child in children.values() {
                        self.save_ref(child)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn get_shape(&mut self, hid: Hid) -> Result<Ref> {
        kv_get(&self.db, &mut self.shapes, &hid.to_hex()).map_err(|err| match err {
            StoreError::KeyNotFound { .. } => StoreError::RefNotFound(hid),
            other => other,
        })
    }

    pub(crate) fn get_atom_bytes(&mut self, cid: Cid) -> Result<Vec<u8>> {
        kv_get(&self.db, &mut self.atoms, &cid.to_hex()).map_err(|err| match err {
            StoreError::KeyNotFound { .. } => StoreError::AtomNotFound(cid),
            other => other,
        })
    }

    pub(crate) fn get_op(&mut self, name: &str) -> Result<Op> {
        kv_get(&self.db, &mut self.ops, name).map_err(|err| match err {
            StoreError::KeyNotFound { .. } => StoreError::OpNotFound(name.to_owned()),
            other => other,
        })
    }

    /// Load a ref by history id. Composite refs always come back with
    /// children rebuilt by recursive loads, lazy or not; only atom payloads
    /// are deferred by `lazy`.
    pub fn load_ref(&mut self, hid: Hid, lazy: bool) -> Result<Ref> {
        match self.get_shape(hid)? {
            Ref::Atom(atom) => {
                if lazy {
                    Ok(Ref::Atom(atom))
                } else {
                    let bytes = self.get_atom_bytes(atom.cid)?;
                    Ok(Ref::Atom(AtomRef {
                        cid: atom.cid,
                        hid: atom.hid,
                        obj: Some(Value::decode(&bytes)?),
                    }))
                }
            }
            Ref::List(list) => {
                let shapes = list.obj.ok_or_else(|| {
                    StoreError::IntegrityViolation(format!("list shape `{hid}` has no children"))
                })?;
                let mut children = Vec::with_capacity(shapes.len());
                for child in &shapes {
                    children.push(self.load_ref(child.hid(), lazy)?);
                }
                Ok(Ref::List(ListRef { cid: list.cid, hid: list.hid, obj: Some(children) }))
            }
            Ref::Dict(dict) => {
                let shapes = dict.obj.ok_or_else(|| {
                    StoreError::IntegrityViolation(format!("dict shape `{hid}` has no children"))
                })?;
                let mut children = BTreeMap::new();
                for (k, child) in &shapes {
                    children.insert(k.clone(), self.load_ref(child.hid(), lazy)?);
                }
                Ok(Ref::Dict(DictRef { cid: dict.cid, hid: dict.hid, obj: Some(children) }))
            }
        }
    }

    /// Walk a ref down to the plain value tree, loading whatever is not in
    /// memory.
    pub fn unwrap_ref(&mut self, r: &Ref) -> Result<Value> {
        match r {
            Ref::Atom(atom) => match &atom.obj {
                Some(v) => Ok(v.clone()),
                None => {
                    let bytes = self.get_atom_bytes(atom.cid)?;
                    Ok(Value::decode(&bytes)?)
                }
            },
            Ref::List(list) => match &list.obj {
                Some(children) => {
                    let mut items = Vec::with_capacity(children.len());
                    for child in children {
                        items.push(self.unwrap_ref(child)?);
                    }
                    Ok(Value::List(items))
                }
                None => {
                    let loaded = self.load_ref(list.hid, false)?;
                    self.unwrap_ref(&loaded)
                }
            },
            Ref::Dict(dict) => match &dict.obj {
                Some(children) => {
                    let mut entries = BTreeMap::new();
                    for (k, child) in children {
                        entries.insert(k.clone(), self.unwrap_ref(child)?);
                    }
                    Ok(Value::Map(entries))
                }
                None => {
                    let loaded = self.load_ref(dict.hid, false)?;
                    self.unwrap_ref(&loaded)
                }
            },
        }
    }

    /// Bring a detached ref into memory in place.
    pub fn attach(&mut self, r: &mut Ref) -> Result<()> {
        if !r.in_memory() && !matches!(r, Ref::Atom(_)) {
            *r = self.load_ref(r.hid(), false)?;
            return Ok(());
        }
        match r {
            Ref::Atom(atom) => {
                if atom.obj.is_none() {
                    let bytes = self.get_atom_bytes(atom.cid)?;
                    atom.obj = Some(Value::decode(&bytes)?);
                }
            }
            Ref::List(list) => {
                if let Some(children) = &mut list.obj {
                    for child in children {
                        self.attach(child)?;
                    }
                }
            }
            Ref::Dict(dict) => {
                if let Some(children) = &mut dict.obj {
                    for child in children.values_mut() {
                        self.attach(child)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop a shape by history id; callers must know no call references it.
    pub(crate) fn drop_ref_hid(&mut self, hid: Hid, verify: bool) -> Result<()> {
        let Storage { db, shapes, calls, .. } = self;
        db.with_txn(|conn| {
            if verify && calls.persistent().exists_ref_hid(conn, hid)? {
                return Err(StoreError::IntegrityViolation(format!(
                    "ref `{hid}` is still referenced by a call"
                )));
            }
            shapes.remove(conn, &hid.to_hex())
        })
    }

    /// Drop an atom payload by content id; callers must know no call and no
    /// retained shape references it.
    pub(crate) fn drop_ref_cid(&mut self, cid: Cid) -> Result<()> {
        let Storage { db, atoms, .. } = self;
        db.with_txn(|conn| atoms.remove(conn, &cid.to_hex()))
    }

    /// Remove every shape no call references, then every atom payload
    /// nothing references anymore. Idempotent.
    pub fn cleanup_refs(&mut self) -> Result<()> {
        let orphans = self.get_orphans()?;
        log::info!("cleaning up {} orphaned refs", orphans.len());
        for hid in orphans {
            self.drop_ref_hid(hid, false)?;
        }
        let unreferenced = self.get_unreferenced_cids()?;
        log::info!("cleaning up {} unreferenced atoms", unreferenced.len());
        for cid in unreferenced {
            self.drop_ref_cid(cid)?;
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // calls
    ////////////////////////////////////////////////////////////////////////

    pub fn exists_call(&self, hid: Hid) -> Result<bool> {
        self.db.with_txn(|conn| self.calls.exists(conn, hid))
    }

    /// Persist a call: the op's detached metadata if it is new, every input
    /// and output ref, then the call record itself. Idempotent on the call's
    /// history id.
    pub fn save_call(&mut self, call: &Call) -> Result<()> {
        if self.exists_call(call.hid)? {
            return Ok(());
        }
        if !kv_exists(&self.db, &self.ops, &call.op.name)? {
            log::debug!("caching new op `{}`", call.op.name);
            self.ops.set(call.op.name.clone(), call.op.detached());
        }
        for r in call.io_refs() {
            self.save_ref(r)?;
        }
        self.calls.save(CallData::of_call(call));
        Ok(())
    }

    pub(crate) fn call_from_data(&mut self, data: &CallData, lazy: bool) -> Result<Call> {
        let op = self.get_op(&data.op_name)?;
        let mut inputs = BTreeMap::new();
        for (name, hid) in &data.input_hids {
            inputs.insert(name.clone(), self.load_ref(*hid, lazy)?);
        }
        let mut outputs = BTreeMap::new();
        for (name, hid) in &data.output_hids {
            outputs.insert(name.clone(), self.load_ref(*hid, lazy)?);
        }
        Ok(Call {
            op,
            cid: data.cid,
            hid: data.hid,
            inputs,
            outputs,
            semantic_version: None,
            content_version: None,
        })
    }

    pub fn get_call(&mut self, hid: Hid, lazy: bool) -> Result<Call> {
        let data = {
            let Storage { db, calls, .. } = self;
            db.with_txn(|conn| calls.get_data(conn, hid))?
        };
        self.call_from_data(&data, lazy)
    }

    /// Reconstruct several calls, splitting the fetch between the cache and
    /// one bulk SELECT while preserving request order.
    pub fn mget_call(&mut self, hids: &[Hid], lazy: bool) -> Result<Vec<Call>> {
        let datas = {
            let Storage { db, calls, .. } = self;
            db.with_txn(|conn| calls.mget_data(conn, hids))?
        };
        datas
            .iter()
            .map(|data| self.call_from_data(data, lazy))
            .collect()
    }

    /// Remove calls from the cache and from persistence, optionally together
    /// with every transitive dependent call.
    pub fn drop_calls(&mut self, hids: &[Hid], delete_dependents: bool) -> Result<()> {
        let mut targets: HashSet<Hid> = hids.iter().copied().collect();
        if delete_dependents {
            let (_, dependent_calls) = self.db.with_txn(|conn| {
                self.calls
                    .persistent()
                    .get_dependents(conn, &HashSet::new(), &targets)
            })?;
            targets.extend(dependent_calls);
        }
        let mut dropped_cached = 0usize;
        let mut dropped_persistent = 0usize;
        {
            let Storage { db, calls, .. } = self;
            db.with_txn(|conn| {
                for hid in &targets {
                    let (cached, persisted) = calls.drop_call(conn, *hid)?;
                    dropped_cached += cached as usize;
                    dropped_persistent += persisted as usize;
                }
                Ok(())
            })?;
        }
        log::info!("dropped {dropped_persistent} calls ({dropped_cached} of them cached)");
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // provenance
    ////////////////////////////////////////////////////////////////////////

    fn forbid_in_context(&self, what: &'static str) -> Result<()> {
        if self.in_context() {
            return Err(StoreError::NotAllowedInContext(what));
        }
        Ok(())
    }

    /// The calls that produced any of these refs.
    pub fn get_creators(&mut self, ref_hids: &HashSet<Hid>) -> Result<Vec<Call>> {
        self.forbid_in_context("get_creators")?;
        let hids: Vec<Hid> = self
            .db
            .with_txn(|conn| self.calls.persistent().get_creator_hids(conn, ref_hids))?
            .into_iter()
            .collect();
        self.mget_call(&hids, true)
    }

    /// The calls that consumed any of these refs.
    pub fn get_consumers(&mut self, ref_hids: &HashSet<Hid>) -> Result<Vec<Call>> {
        self.forbid_in_context("get_consumers")?;
        let hids: Vec<Hid> = self
            .db
            .with_txn(|conn| self.calls.persistent().get_consumer_hids(conn, ref_hids))?
            .into_iter()
            .collect();
        self.mget_call(&hids, true)
    }

    pub fn get_dependencies(
        &self,
        ref_hids: &HashSet<Hid>,
        call_hids: &HashSet<Hid>,
    ) -> Result<(HashSet<Hid>, HashSet<Hid>)> {
        self.forbid_in_context("get_dependencies")?;
        self.db.with_txn(|conn| {
            self.calls
                .persistent()
                .get_dependencies(conn, ref_hids, call_hids)
        })
    }

    pub fn get_dependents(
        &self,
        ref_hids: &HashSet<Hid>,
        call_hids: &HashSet<Hid>,
    ) -> Result<(HashSet<Hid>, HashSet<Hid>)> {
        self.forbid_in_context("get_dependents")?;
        self.db.with_txn(|conn| {
            self.calls
                .persistent()
                .get_dependents(conn, ref_hids, call_hids)
        })
    }

    /// Shape history ids no call row references.
    pub fn get_orphans(&self) -> Result<HashSet<Hid>> {
        self.forbid_in_context("get_orphans")?;
        self.db.with_txn(|conn| {
            let mut all = HashSet::new();
            for key in self.shapes.persistent().keys(conn)? {
                all.insert(Hid::from_hex(&key).map_err(|_| {
                    StoreError::IntegrityViolation(format!("malformed shape key `{key}`"))
                })?);
            }
            let used = self.calls.persistent().all_ref_hids(conn)?;
            Ok(all.difference(&used).copied().collect())
        })
    }

    /// Atom content ids neither any call row nor any retained shape
    /// references.
    pub fn get_unreferenced_cids(&self) -> Result<HashSet<Cid>> {
        self.forbid_in_context("get_unreferenced_cids")?;
        self.db.with_txn(|conn| {
            let mut all = HashSet::new();
            for key in self.atoms.persistent().keys(conn)? {
                all.insert(Cid::from_hex(&key).map_err(|_| {
                    StoreError::IntegrityViolation(format!("malformed atom key `{key}`"))
                })?);
            }
            let in_calls = self.calls.persistent().all_ref_cids(conn)?;
            let mut in_shapes = HashSet::new();
            for blob in self.shapes.persistent().values(conn)? {
                in_shapes.insert(Ref::decode(&blob)?.cid());
            }
            Ok(all
                .difference(&in_calls)
                .copied()
                .collect::<HashSet<Cid>>()
                .difference(&in_shapes)
                .copied()
                .collect())
        })
    }

    ////////////////////////////////////////////////////////////////////////
    // scopes
    ////////////////////////////////////////////////////////////////////////

    pub fn in_context(&self) -> bool {
        self.scope_depth.get() > 0
    }

    /// Open a storage scope. While a scope is open, provenance queries are
    /// rejected; a versioned storage synchronizes its versioner with the
    /// current code state on entry and keeps it cached for the duration.
    pub fn enter(&mut self) -> Result<Scope<'_>> {
        if let Some(versioner) = self.versioner.as_mut() {
            let code_state = versioner.guess_code_state();
            versioner.sync_codebase(&code_state);
            self.code_state = Some(code_state);
        }
        self.scope_depth.set(self.scope_depth.get() + 1);
        Ok(Scope { storage: self, closed: false })
    }

    fn exit_scope(&mut self) -> Result<()> {
        let depth = self.scope_depth.get();
        self.scope_depth.set(depth.saturating_sub(1));
        if depth <= 1 {
            self.code_state = None;
            self.commit()?;
        }
        Ok(())
    }
}

/// RAII handle for an open storage scope. Exit commits, whether the scope is
/// closed explicitly or dropped on a failure path.
pub struct Scope<'a> {
    storage: &'a mut Storage,
    closed: bool,
}

impl Scope<'_> {
    /// Exit the scope, surfacing a commit failure instead of logging it.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.storage.exit_scope()
    }
}

impl Deref for Scope<'_> {
    type Target = Storage;

    fn deref(&self) -> &Storage {
        self.storage
    }
}

impl DerefMut for Scope<'_> {
    fn deref_mut(&mut self) -> &mut Storage {
        self.storage
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.storage.exit_scope() {
                log::error!("commit on scope exit failed: {err}");
            }
        }
    }
}

/// Per-cache occupancy, for a quick look at what is resident and what is
/// still unflushed.
pub struct CacheInfo {
    rows: Vec<(&'static str, usize, usize)>,
}

impl CacheInfo {
    pub fn rows(&self) -> impl Iterator<Item = (&'static str, usize, usize)> {
        self.rows.iter().copied()
    }
}

impl fmt::Display for CacheInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<8} {:>8} {:>8}", "cache", "present", "dirty")?;
        for (name, present, dirty) in &self.rows {
            writeln!(f, "{name:<8} {present:>8} {dirty:>8}")?;
        }
        Ok(())
    }
}
