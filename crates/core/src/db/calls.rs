use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use itertools::Itertools;
use memodb_lib::call::Call;
use memodb_lib::ids::{Cid, Hid};
use rusqlite::{Connection, params, params_from_iter};

use crate::error::{Result, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in" => Ok(Direction::Input),
            "out" => Ok(Direction::Output),
            other => Err(StoreError::IntegrityViolation(format!(
                "unknown call row direction `{other}`"
            ))),
        }
    }
}

/// The persisted portion of a call: one row per slot in the relation, one of
/// these per call in memory. The op definition itself lives in the ops table.
#[derive(Clone, Debug, PartialEq)]
pub struct CallData {
    pub op_name: String,
    pub cid: Cid,
    pub hid: Hid,
    pub input_cids: BTreeMap<String, Cid>,
    pub input_hids: BTreeMap<String, Hid>,
    pub output_cids: BTreeMap<String, Cid>,
    pub output_hids: BTreeMap<String, Hid>,
}

impl CallData {
    pub fn of_call(call: &Call) -> Self {
        CallData {
            op_name: call.op.name.clone(),
            cid: call.cid,
            hid: call.hid,
            input_cids: call.inputs.iter().map(|(k, r)| (k.clone(), r.cid())).collect(),
            input_hids: call.inputs.iter().map(|(k, r)| (k.clone(), r.hid())).collect(),
            output_cids: call.outputs.iter().map(|(k, r)| (k.clone(), r.cid())).collect(),
            output_hids: call.outputs.iter().map(|(k, r)| (k.clone(), r.hid())).collect(),
        }
    }

    pub fn ref_hids(&self) -> impl Iterator<Item = &Hid> {
        self.input_hids.values().chain(self.output_hids.values())
    }

    pub fn ref_cids(&self) -> impl Iterator<Item = &Cid> {
        self.input_cids.values().chain(self.output_cids.values())
    }
}

fn parse_hid(s: &str) -> Result<Hid> {
    Hid::from_hex(s)
        .map_err(|_| StoreError::IntegrityViolation(format!("malformed history id `{s}` in call row")))
}

fn parse_cid(s: &str) -> Result<Cid> {
    Cid::from_hex(s)
        .map_err(|_| StoreError::IntegrityViolation(format!("malformed content id `{s}` in call row")))
}

/// One raw row of the calls relation.
struct CallRow {
    call_hid: String,
    name: String,
    direction: String,
    call_cid: String,
    ref_cid: String,
    ref_hid: String,
    op_name: String,
}

fn group_rows(rows: Vec<CallRow>) -> Result<HashMap<Hid, CallData>> {
    let keyed: Vec<(Hid, CallRow)> = rows
        .into_iter()
        .map(|row| parse_hid(&row.call_hid).map(|hid| (hid, row)))
        .try_collect()?;
    keyed
        .into_iter()
        .into_group_map()
        .into_iter()
        .map(|(hid, rows)| call_data_from_rows(hid, rows).map(|data| (hid, data)))
        .try_collect()
}

fn call_data_from_rows(hid: Hid, rows: Vec<CallRow>) -> Result<CallData> {
    let first = rows.first().ok_or_else(|| {
        StoreError::IntegrityViolation(format!("no rows grouped for call `{hid}`"))
    })?;
    let mut data = CallData {
        op_name: first.op_name.clone(),
        cid: parse_cid(&first.call_cid)?,
        hid,
        input_cids: BTreeMap::new(),
        input_hids: BTreeMap::new(),
        output_cids: BTreeMap::new(),
        output_hids: BTreeMap::new(),
    };
    for row in rows {
        let ref_cid = parse_cid(&row.ref_cid)?;
        let ref_hid = parse_hid(&row.ref_hid)?;
        match Direction::parse(&row.direction)? {
            Direction::Input => {
                data.input_cids.insert(row.name.clone(), ref_cid);
                data.input_hids.insert(row.name, ref_hid);
            }
            Direction::Output => {
                data.output_cids.insert(row.name.clone(), ref_cid);
                data.output_hids.insert(row.name, ref_hid);
            }
        }
    }
    Ok(data)
}

/// The normalized calls relation: one row per (call history id, slot name).
#[derive(Clone, Copy)]
pub struct CallTable {
    table: &'static str,
}

impl CallTable {
    pub const fn new(table: &'static str) -> Self {
        CallTable { table }
    }

    pub fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             call_history_id TEXT, name TEXT, direction TEXT, \
             call_content_id TEXT, ref_content_id TEXT, ref_history_id TEXT, op TEXT, \
             PRIMARY KEY (call_history_id, name))",
            self.table
        ))?;
        Ok(())
    }

    /// Insert one row per input/output slot. The caller's transaction makes
    /// the batch atomic.
    pub fn save(&self, conn: &Connection, data: &CallData) -> Result<()> {
        let sql = format!("INSERT INTO {} VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)", self.table);
        let mut stmt = conn.prepare(&sql)?;
        for (name, hid) in &data.input_hids {
            let cid = &data.input_cids[name];
            stmt.execute(params![
                data.hid.to_hex(),
                name,
                Direction::Input.as_str(),
                data.cid.to_hex(),
                cid.to_hex(),
                hid.to_hex(),
                data.op_name,
            ])?;
        }
        for (name, hid) in &data.output_hids {
            let cid = &data.output_cids[name];
            stmt.execute(params![
                data.hid.to_hex(),
                name,
                Direction::Output.as_str(),
                data.cid.to_hex(),
                cid.to_hex(),
                hid.to_hex(),
                data.op_name,
            ])?;
        }
        Ok(())
    }

    pub fn drop_call(&self, conn: &Connection, hid: Hid) -> Result<()> {
        conn.execute(
            &format!("DELETE FROM {} WHERE call_history_id = ?1", self.table),
            params![hid.to_hex()],
        )?;
        Ok(())
    }

    pub fn exists(&self, conn: &Connection, hid: Hid) -> Result<bool> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE call_history_id = ?1", self.table),
            params![hid.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn exists_content(&self, conn: &Connection, cid: Cid) -> Result<bool> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE call_content_id = ?1", self.table),
            params![cid.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn exists_ref_hid(&self, conn: &Connection, hid: Hid) -> Result<bool> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE ref_history_id = ?1", self.table),
            params![hid.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn select_rows(&self, conn: &Connection, where_clause: &str, keys: &[String]) -> Result<Vec<CallRow>> {
        let sql = format!(
            "SELECT call_history_id, name, direction, call_content_id, ref_content_id, ref_history_id, op \
             FROM {} {}",
            self.table, where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(keys.iter()), |row| {
                Ok(CallRow {
                    call_hid: row.get(0)?,
                    name: row.get(1)?,
                    direction: row.get(2)?,
                    call_cid: row.get(3)?,
                    ref_cid: row.get(4)?,
                    ref_hid: row.get(5)?,
                    op_name: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<CallRow>>>()?;
        Ok(rows)
    }

    fn placeholders(n: usize) -> String {
        itertools::repeat_n("?", n).join(",")
    }

    /// Fetch several call records in one SELECT, preserving request order.
    pub fn mget_data(&self, conn: &Connection, hids: &[Hid]) -> Result<Vec<CallData>> {
        if hids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = hids.iter().map(Hid::to_hex).collect();
        let clause = format!(
            "WHERE call_history_id IN ({})",
            Self::placeholders(keys.len())
        );
        let grouped = group_rows(self.select_rows(conn, &clause, &keys)?)?;
        hids.iter()
            .map(|hid| {
                grouped
                    .get(hid)
                    .cloned()
                    .ok_or(StoreError::CallNotFound(*hid))
            })
            .collect()
    }

    pub fn get_data(&self, conn: &Connection, hid: Hid) -> Result<CallData> {
        Ok(self.mget_data(conn, &[hid])?.remove(0))
    }

    /// Any one call with the given content id, if such a call exists.
    pub fn get_data_content(&self, conn: &Connection, cid: Cid) -> Result<Option<CallData>> {
        let clause = "WHERE call_content_id = ?1".to_owned();
        let grouped = group_rows(self.select_rows(conn, &clause, &[cid.to_hex()])?)?;
        // pick the smallest hid so repeated lookups agree
        Ok(grouped
            .keys()
            .min()
            .copied()
            .and_then(|hid| grouped.get(&hid).cloned()))
    }

    /// Load the whole relation into an in-memory table.
    pub fn load_all(&self, conn: &Connection) -> Result<MemCallTable> {
        let grouped = group_rows(self.select_rows(conn, "", &[])?)?;
        let mut mem = MemCallTable::default();
        for data in grouped.into_values() {
            mem.save(data);
        }
        Ok(mem)
    }

    fn distinct_call_hids(
        &self,
        conn: &Connection,
        ref_hids: &HashSet<Hid>,
        direction: Direction,
    ) -> Result<HashSet<Hid>> {
        if ref_hids.is_empty() {
            return Ok(HashSet::new());
        }
        let keys: Vec<String> = ref_hids.iter().map(Hid::to_hex).collect();
        let sql = format!(
            "SELECT DISTINCT call_history_id FROM {} \
             WHERE ref_history_id IN ({}) AND direction = '{}'",
            self.table,
            Self::placeholders(keys.len()),
            direction.as_str()
        );
        let mut stmt = conn.prepare(&sql)?;
        let hids = stmt
            .query_map(params_from_iter(keys.iter()), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        hids.iter().map(|s| parse_hid(s)).try_collect()
    }

    fn distinct_ref_hids(
        &self,
        conn: &Connection,
        call_hids: &HashSet<Hid>,
        direction: Direction,
    ) -> Result<HashSet<Hid>> {
        if call_hids.is_empty() {
            return Ok(HashSet::new());
        }
        let keys: Vec<String> = call_hids.iter().map(Hid::to_hex).collect();
        let sql = format!(
            "SELECT DISTINCT ref_history_id FROM {} \
             WHERE call_history_id IN ({}) AND direction = '{}'",
            self.table,
            Self::placeholders(keys.len()),
            direction.as_str()
        );
        let mut stmt = conn.prepare(&sql)?;
        let hids = stmt
            .query_map(params_from_iter(keys.iter()), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        hids.iter().map(|s| parse_hid(s)).try_collect()
    }

    /// Calls that produced any of these refs.
    pub fn get_creator_hids(&self, conn: &Connection, ref_hids: &HashSet<Hid>) -> Result<HashSet<Hid>> {
        self.distinct_call_hids(conn, ref_hids, Direction::Output)
    }

    /// Calls that consumed any of these refs.
    pub fn get_consumer_hids(&self, conn: &Connection, ref_hids: &HashSet<Hid>) -> Result<HashSet<Hid>> {
        self.distinct_call_hids(conn, ref_hids, Direction::Input)
    }

    pub fn get_input_hids(&self, conn: &Connection, call_hids: &HashSet<Hid>) -> Result<HashSet<Hid>> {
        self.distinct_ref_hids(conn, call_hids, Direction::Input)
    }

    pub fn get_output_hids(&self, conn: &Connection, call_hids: &HashSet<Hid>) -> Result<HashSet<Hid>> {
        self.distinct_ref_hids(conn, call_hids, Direction::Output)
    }

    pub fn get_dependencies(
        &self,
        conn: &Connection,
        ref_hids: &HashSet<Hid>,
        call_hids: &HashSet<Hid>,
    ) -> Result<(HashSet<Hid>, HashSet<Hid>)> {
        Ok(self.load_all(conn)?.get_dependencies(ref_hids, call_hids))
    }

    pub fn get_dependents(
        &self,
        conn: &Connection,
        ref_hids: &HashSet<Hid>,
        call_hids: &HashSet<Hid>,
    ) -> Result<(HashSet<Hid>, HashSet<Hid>)> {
        Ok(self.load_all(conn)?.get_dependents(ref_hids, call_hids))
    }

    /// Every ref history id mentioned by any call row.
    pub fn all_ref_hids(&self, conn: &Connection) -> Result<HashSet<Hid>> {
        let mut stmt =
            conn.prepare(&format!("SELECT DISTINCT ref_history_id FROM {}", self.table))?;
        let hids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        hids.iter().map(|s| parse_hid(s)).try_collect()
    }

    /// Every ref content id mentioned by any call row.
    pub fn all_ref_cids(&self, conn: &Connection) -> Result<HashSet<Cid>> {
        let mut stmt =
            conn.prepare(&format!("SELECT DISTINCT ref_content_id FROM {}", self.table))?;
        let cids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        cids.iter().map(|s| parse_cid(s)).try_collect()
    }
}

/// In-memory mirror of the calls relation, also used standalone for the
/// transitive provenance walks.
#[derive(Default)]
pub struct MemCallTable {
    data: HashMap<Hid, CallData>,
    by_cid: HashMap<Cid, BTreeSet<Hid>>,
}

impl MemCallTable {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Idempotent: saving an already-present call changes nothing. Returns
    /// whether the call was new.
    pub fn save(&mut self, data: CallData) -> bool {
        if self.data.contains_key(&data.hid) {
            return false;
        }
        self.by_cid.entry(data.cid).or_default().insert(data.hid);
        self.data.insert(data.hid, data);
        true
    }

    pub fn drop_call(&mut self, hid: Hid) -> bool {
        match self.data.remove(&hid) {
            Some(data) => {
                if let Some(hids) = self.by_cid.get_mut(&data.cid) {
                    hids.remove(&hid);
                    if hids.is_empty() {
                        self.by_cid.remove(&data.cid);
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn exists(&self, hid: Hid) -> bool {
        self.data.contains_key(&hid)
    }

    pub fn exists_content(&self, cid: Cid) -> bool {
        self.by_cid.contains_key(&cid)
    }

    pub fn get_data(&self, hid: Hid) -> Option<&CallData> {
        self.data.get(&hid)
    }

    pub fn get_data_content(&self, cid: Cid) -> Option<&CallData> {
        self.by_cid
            .get(&cid)
            .and_then(|hids| hids.first())
            .and_then(|hid| self.data.get(hid))
    }

    pub fn get_creator_hids(&self, ref_hids: &HashSet<Hid>) -> HashSet<Hid> {
        self.data
            .values()
            .filter(|d| d.output_hids.values().any(|h| ref_hids.contains(h)))
            .map(|d| d.hid)
            .collect()
    }

    pub fn get_consumer_hids(&self, ref_hids: &HashSet<Hid>) -> HashSet<Hid> {
        self.data
            .values()
            .filter(|d| d.input_hids.values().any(|h| ref_hids.contains(h)))
            .map(|d| d.hid)
            .collect()
    }

    pub fn get_input_hids(&self, call_hids: &HashSet<Hid>) -> HashSet<Hid> {
        call_hids
            .iter()
            .filter_map(|hid| self.data.get(hid))
            .flat_map(|d| d.input_hids.values().copied())
            .collect()
    }

    pub fn get_output_hids(&self, call_hids: &HashSet<Hid>) -> HashSet<Hid> {
        call_hids
            .iter()
            .filter_map(|hid| self.data.get(hid))
            .flat_map(|d| d.output_hids.values().copied())
            .collect()
    }

    /// Transitive closure backward: creators of refs, then inputs of those
    /// calls, iterated to fixpoint.
    pub fn get_dependencies(
        &self,
        ref_hids: &HashSet<Hid>,
        call_hids: &HashSet<Hid>,
    ) -> (HashSet<Hid>, HashSet<Hid>) {
        self.closure(ref_hids, call_hids, Direction::Output)
    }

    /// Transitive closure forward: consumers of refs, then outputs of those
    /// calls, iterated to fixpoint.
    pub fn get_dependents(
        &self,
        ref_hids: &HashSet<Hid>,
        call_hids: &HashSet<Hid>,
    ) -> (HashSet<Hid>, HashSet<Hid>) {
        self.closure(ref_hids, call_hids, Direction::Input)
    }

    fn closure(
        &self,
        ref_hids: &HashSet<Hid>,
        call_hids: &HashSet<Hid>,
        step: Direction,
    ) -> (HashSet<Hid>, HashSet<Hid>) {
        let mut refs_result = ref_hids.clone();
        let mut calls_result = call_hids.clone();
        let mut cur_refs = refs_result.clone();
        let mut cur_calls = calls_result.clone();
        loop {
            let reached_calls = match step {
                Direction::Output => self.get_creator_hids(&cur_refs),
                Direction::Input => self.get_consumer_hids(&cur_refs),
            };
            let reached_refs = match step {
                Direction::Output => self.get_input_hids(&cur_calls),
                Direction::Input => self.get_output_hids(&cur_calls),
            };
            let calls_upd: HashSet<Hid> =
                reached_calls.difference(&calls_result).copied().collect();
            let refs_upd: HashSet<Hid> = reached_refs.difference(&refs_result).copied().collect();
            if calls_upd.is_empty() && refs_upd.is_empty() {
                break;
            }
            calls_result.extend(calls_upd.iter().copied());
            refs_result.extend(refs_upd.iter().copied());
            cur_refs = refs_upd;
            cur_calls = calls_upd;
        }
        (refs_result, calls_result)
    }
}

/// Write-through cache over the calls relation: an in-memory mirror, a dirty
/// set of call history ids, and an atomic commit. Content-address lookups
/// consult the cache first and read through to persistence.
pub struct CachedCalls {
    persistent: CallTable,
    cache: MemCallTable,
    dirty: HashSet<Hid>,
}

impl CachedCalls {
    pub fn new(table: &'static str) -> Self {
        CachedCalls {
            persistent: CallTable::new(table),
            cache: MemCallTable::default(),
            dirty: HashSet::new(),
        }
    }

    pub fn persistent(&self) -> &CallTable {
        &self.persistent
    }

    pub fn create(&self, conn: &Connection) -> Result<()> {
        self.persistent.create(conn)
    }

    pub fn save(&mut self, data: CallData) {
        let hid = data.hid;
        if self.cache.save(data) {
            self.dirty.insert(hid);
        }
    }

    /// Remove from cache, dirty set, and persistence. Returns which of the
    /// two tiers actually held the call.
    pub fn drop_call(&mut self, conn: &Connection, hid: Hid) -> Result<(bool, bool)> {
        let in_cache = self.cache.drop_call(hid);
        self.dirty.remove(&hid);
        let in_persistent = self.persistent.exists(conn, hid)?;
        if in_persistent {
            self.persistent.drop_call(conn, hid)?;
        }
        Ok((in_cache, in_persistent))
    }

    pub fn exists(&self, conn: &Connection, hid: Hid) -> Result<bool> {
        if self.cache.exists(hid) {
            return Ok(true);
        }
        self.persistent.exists(conn, hid)
    }

    pub fn exists_content(&self, conn: &Connection, cid: Cid) -> Result<bool> {
        if self.cache.exists_content(cid) {
            return Ok(true);
        }
        self.persistent.exists_content(conn, cid)
    }

    pub fn get_data(&self, conn: &Connection, hid: Hid) -> Result<CallData> {
        if let Some(data) = self.cache.get_data(hid) {
            return Ok(data.clone());
        }
        self.persistent.get_data(conn, hid)
    }

    pub fn get_data_content(&self, conn: &Connection, cid: Cid) -> Result<Option<CallData>> {
        if let Some(data) = self.cache.get_data_content(cid) {
            return Ok(Some(data.clone()));
        }
        self.persistent.get_data_content(conn, cid)
    }

    /// Bulk fetch preserving request order, splitting between the cache and
    /// one persistent SELECT.
    pub fn mget_data(&self, conn: &Connection, hids: &[Hid]) -> Result<Vec<CallData>> {
        let db_part: Vec<Hid> = hids
            .iter()
            .copied()
            .filter(|hid| !self.cache.exists(*hid))
            .collect();
        let mut db_datas = self.persistent.mget_data(conn, &db_part)?.into_iter();
        hids.iter()
            .map(|hid| match self.cache.get_data(*hid) {
                Some(data) => Ok(data.clone()),
                None => db_datas
                    .next()
                    .ok_or(StoreError::CallNotFound(*hid)),
            })
            .collect()
    }

    /// Flush every dirty call in the caller's transaction.
    pub fn commit(&mut self, conn: &Connection) -> Result<()> {
        for hid in &self.dirty {
            let data = self.cache.get_data(*hid).ok_or_else(|| {
                StoreError::IntegrityViolation(format!(
                    "dirty call `{hid}` missing from the call cache"
                ))
            })?;
            self.persistent.save(conn, data)?;
        }
        self.dirty.clear();
        Ok(())
    }

    pub fn preload(&mut self, conn: &Connection) -> Result<()> {
        self.cache = self.persistent.load_all(conn)?;
        Ok(())
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    pub fn cache(&self) -> &MemCallTable {
        &self.cache
    }

    pub fn clear(&mut self) {
        self.cache = MemCallTable::default();
        self.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbAdapter;
    use memodb_lib::hash::hash_bytes;

    fn hid(tag: &str) -> Hid {
        Hid(hash_bytes(tag.as_bytes()))
    }

    fn cid(tag: &str) -> Cid {
        Cid(hash_bytes(tag.as_bytes()))
    }

    /// op(x) -> y as bare call data.
    fn call_data(name: &str, x_hid: Hid, y_hid: Hid) -> CallData {
        CallData {
            op_name: "op".to_owned(),
            cid: cid(name),
            hid: hid(name),
            input_cids: BTreeMap::from([("x".to_owned(), cid("in"))]),
            input_hids: BTreeMap::from([("x".to_owned(), x_hid)]),
            output_cids: BTreeMap::from([("y".to_owned(), cid("out"))]),
            output_hids: BTreeMap::from([("y".to_owned(), y_hid)]),
        }
    }

    fn setup() -> (DbAdapter, CachedCalls) {
        let db = DbAdapter::in_memory().unwrap();
        let calls = CachedCalls::new("calls");
        db.with_txn(|conn| calls.create(conn)).unwrap();
        (db, calls)
    }

    #[test]
    fn save_commit_and_reload() {
        let (db, mut calls) = setup();
        let data = call_data("c1", hid("r1"), hid("r2"));
        calls.save(data.clone());
        assert_eq!(calls.dirty_len(), 1);
        assert!(db.with_txn(|conn| calls.exists(conn, data.hid)).unwrap());
        assert!(!db.with_txn(|conn| calls.persistent().exists(conn, data.hid)).unwrap());

        db.with_txn(|conn| calls.commit(conn)).unwrap();
        let loaded = db
            .with_txn(|conn| calls.persistent().get_data(conn, data.hid))
            .unwrap();
        assert_eq!(loaded, data);

        // saving again is a no-op, so a second commit does not re-insert
        calls.save(data.clone());
        assert_eq!(calls.dirty_len(), 0);
        db.with_txn(|conn| calls.commit(conn)).unwrap();
    }

    #[test]
    fn mget_preserves_request_order_across_tiers() {
        let (db, mut calls) = setup();
        let a = call_data("a", hid("ra"), hid("rb"));
        let b = call_data("b", hid("rc"), hid("rd"));
        // `a` goes to persistence only, `b` stays cached
        db.with_txn(|conn| calls.persistent().save(conn, &a)).unwrap();
        calls.save(b.clone());

        let got = db
            .with_txn(|conn| calls.mget_data(conn, &[b.hid, a.hid]))
            .unwrap();
        assert_eq!(got, vec![b.clone(), a.clone()]);

        let missing = db.with_txn(|conn| calls.mget_data(conn, &[hid("nope")]));
        assert!(matches!(missing, Err(StoreError::CallNotFound(_))));
    }

    #[test]
    fn content_lookup_reads_through() {
        let (db, mut calls) = setup();
        let a = call_data("a", hid("ra"), hid("rb"));
        db.with_txn(|conn| calls.persistent().save(conn, &a)).unwrap();

        assert!(db.with_txn(|conn| calls.exists_content(conn, a.cid)).unwrap());
        let found = db
            .with_txn(|conn| calls.get_data_content(conn, a.cid))
            .unwrap()
            .unwrap();
        assert_eq!(found.hid, a.hid);
        assert!(
            db.with_txn(|conn| calls.get_data_content(conn, cid("unknown")))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn drop_forgets_both_tiers() {
        let (db, mut calls) = setup();
        let a = call_data("a", hid("ra"), hid("rb"));
        calls.save(a.clone());
        db.with_txn(|conn| calls.commit(conn)).unwrap();

        let (cached, persisted) = db.with_txn(|conn| calls.drop_call(conn, a.hid)).unwrap();
        assert!(cached && persisted);
        assert!(!db.with_txn(|conn| calls.exists(conn, a.hid)).unwrap());
        db.with_txn(|conn| calls.commit(conn)).unwrap();
        assert!(!db.with_txn(|conn| calls.persistent().exists(conn, a.hid)).unwrap());
    }

    #[test]
    fn provenance_walks_reach_fixpoint() {
        // r1 -[c1]-> r2 -[c2]-> r3
        let mut mem = MemCallTable::default();
        mem.save(call_data("c1", hid("r1"), hid("r2")));
        mem.save(call_data("c2", hid("r2"), hid("r3")));

        let (dep_refs, dep_calls) =
            mem.get_dependencies(&HashSet::from([hid("r3")]), &HashSet::new());
        assert!(dep_refs.contains(&hid("r1")));
        assert!(dep_refs.contains(&hid("r2")));
        assert_eq!(dep_calls, HashSet::from([hid("c1"), hid("c2")]));

        let (fwd_refs, fwd_calls) =
            mem.get_dependents(&HashSet::from([hid("r1")]), &HashSet::new());
        assert!(fwd_refs.contains(&hid("r3")));
        assert_eq!(fwd_calls, HashSet::from([hid("c1"), hid("c2")]));
    }

    #[test]
    fn sql_provenance_matches_memory() {
        let (db, mut calls) = setup();
        calls.save(call_data("c1", hid("r1"), hid("r2")));
        calls.save(call_data("c2", hid("r2"), hid("r3")));
        db.with_txn(|conn| calls.commit(conn)).unwrap();

        let creators = db
            .with_txn(|conn| {
                calls
                    .persistent()
                    .get_creator_hids(conn, &HashSet::from([hid("r2")]))
            })
            .unwrap();
        assert_eq!(creators, HashSet::from([hid("c1")]));

        let consumers = db
            .with_txn(|conn| {
                calls
                    .persistent()
                    .get_consumer_hids(conn, &HashSet::from([hid("r2")]))
            })
            .unwrap();
        assert_eq!(consumers, HashSet::from([hid("c2")]));

        let (_, dep_calls) = db
            .with_txn(|conn| {
                calls.persistent().get_dependents(
                    conn,
                    &HashSet::from([hid("r1")]),
                    &HashSet::new(),
                )
            })
            .unwrap();
        assert_eq!(dep_calls, HashSet::from([hid("c1"), hid("c2")]));
    }
}
