//! End-to-end behavior of the store: memoization, content reuse across
//! histories, structural decomposition, the side-effect guard, transparent
//! new defaults, and the orphan sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use memodb::storage::Storage;
use memodb::versioning::{CodeState, VersionIds, Versioner};
use memodb::{
    ArgValue, Bindings, Cid, Op, OpReturn, OutputSpec, Param, Ref, StoreError, Type, Value,
    wrap_atom,
};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A one-argument integer op that counts its executions.
fn int_op(name: &str, counter: &Arc<AtomicUsize>, f: impl Fn(i64) -> i64 + Send + Sync + 'static) -> Op {
    let counter = counter.clone();
    Op::new(
        name,
        vec![Param::positional("x", Type::Atom)],
        vec![OutputSpec::new("output_0", Type::Atom)],
        Arc::new(move |b: &mut Bindings| -> anyhow::Result<Vec<OpReturn>> {
            counter.fetch_add(1, Ordering::SeqCst);
            let x = b.value("x")?.as_int().context("expected an int argument")?;
            Ok(vec![Value::Int(f(x)).into()])
        }),
    )
}

#[test]
fn repeat_calls_are_memoized() {
    init_logging();
    let mut storage = Storage::in_memory().unwrap();
    let executions = Arc::new(AtomicUsize::new(0));
    let inc = int_op("inc", &executions, |x| x + 1);

    let first = storage.call(&inc, vec![Value::Int(41).into()], vec![]).unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(first.len(), 1);
    assert_eq!(storage.unwrap_ref(&first[0]).unwrap(), Value::Int(42));

    let second = storage.call(&inc, vec![Value::Int(41).into()], vec![]).unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1, "second call must not execute");
    assert_eq!(second[0].cid(), first[0].cid());
    assert_eq!(second[0].hid(), first[0].hid());

    // a different argument is a different call
    storage.call(&inc, vec![Value::Int(7).into()], vec![]).unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[test]
fn memoization_survives_commit_and_reopen() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    let executions = Arc::new(AtomicUsize::new(0));
    let inc = int_op("inc", &executions, |x| x + 1);

    {
        let mut storage = Storage::open(&path).unwrap();
        storage.call(&inc, vec![Value::Int(41).into()], vec![]).unwrap();
        storage.commit().unwrap();
    }
    let mut storage = Storage::open(&path).unwrap();
    let out = storage.call(&inc, vec![Value::Int(41).into()], vec![]).unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(storage.unwrap_ref(&out[0]).unwrap(), Value::Int(42));
}

#[test]
fn equal_content_under_new_history_reuses_outputs() {
    init_logging();
    let mut storage = Storage::in_memory().unwrap();
    let g_runs = Arc::new(AtomicUsize::new(0));
    let inc_runs = Arc::new(AtomicUsize::new(0));
    let g = int_op("g", &g_runs, |x| 2 * x);
    let inc = int_op("inc", &inc_runs, |x| x + 1);

    let direct = storage.call(&g, vec![Value::Int(3).into()], vec![]).unwrap();
    assert_eq!(g_runs.load(Ordering::SeqCst), 1);

    // a second ref for 3, produced by a different provenance
    let three = storage.call(&inc, vec![Value::Int(2).into()], vec![]).unwrap();
    assert_eq!(storage.unwrap_ref(&three[0]).unwrap(), Value::Int(3));
    // same content as a directly wrapped 3, different provenance
    let fresh_three = Ref::Atom(wrap_atom(Value::Int(3), None));
    assert_eq!(three[0].cid(), fresh_three.cid());
    assert_ne!(three[0].hid(), fresh_three.hid());

    let via_history = storage
        .call(&g, vec![ArgValue::Ref(three[0].clone())], vec![])
        .unwrap();
    assert_eq!(g_runs.load(Ordering::SeqCst), 1, "content hit must not re-execute");
    assert_eq!(via_history[0].cid(), direct[0].cid());
    assert_ne!(via_history[0].hid(), direct[0].hid());
}

#[test]
fn list_outputs_are_destructured_into_getter_calls() {
    init_logging();
    let mut storage = Storage::in_memory().unwrap();
    let executions = Arc::new(AtomicUsize::new(0));
    let squares = {
        let executions = executions.clone();
        Op::new(
            "squares",
            vec![Param::positional("n", Type::Atom)],
            vec![OutputSpec::new("output_0", Type::list_of(Type::Atom))],
            Arc::new(move |b: &mut Bindings| -> anyhow::Result<Vec<OpReturn>> {
                executions.fetch_add(1, Ordering::SeqCst);
                let n = b.value("n")?.as_int().context("expected an int argument")?;
                let items = (0..n).map(|i| Value::Int(i * i)).collect::<Vec<Value>>();
                Ok(vec![Value::List(items).into()])
            }),
        )
    };

    let out = storage.call(&squares, vec![Value::Int(3).into()], vec![]).unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    storage.commit().unwrap();

    // the single output is a list ref over three atom elements
    let Ref::List(list) = &out[0] else { panic!("expected a list output") };
    let children = list.obj.as_ref().unwrap();
    assert_eq!(children.len(), 3);
    for (i, child) in children.iter().enumerate() {
        assert!(matches!(child, Ref::Atom(_)));
        let expected = Cid::of_value(&Value::Int((i * i) as i64));
        assert_eq!(child.cid(), expected);
    }

    // the squares call itself
    let creators = storage
        .get_creators(&HashSet::from([out[0].hid()]))
        .unwrap();
    assert_eq!(creators.len(), 1);
    assert_eq!(creators[0].op.name, "squares");
    assert_eq!(creators[0].outputs.len(), 1);

    // one getter call per element
    for child in children {
        let creators = storage
            .get_creators(&HashSet::from([child.hid()]))
            .unwrap();
        assert_eq!(creators.len(), 1);
        assert_eq!(creators[0].op.name, "__get_list_item__");
    }
}

#[test]
fn in_place_mutation_is_detected() {
    init_logging();
    let mut storage = Storage::in_memory().unwrap();
    let bad = Op::new(
        "bad",
        vec![Param::positional("xs", Type::list_of(Type::Atom))],
        vec![OutputSpec::new("output_0", Type::Atom)],
        Arc::new(|b: &mut Bindings| -> anyhow::Result<Vec<OpReturn>> {
            let xs = b.value_mut("xs")?.as_list_mut().context("expected a list")?;
            xs.push(Value::Int(0));
            Ok(vec![Value::Int(xs.len() as i64).into()])
        }),
    );

    let input = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    let err = storage.call(&bad, vec![input.clone().into()], vec![]).unwrap_err();
    match err {
        StoreError::SideEffectDetected { op, slots } => {
            assert_eq!(op, "bad");
            assert_eq!(slots, vec!["xs".to_owned()]);
        }
        other => panic!("expected SideEffectDetected, got {other}"),
    }

    // the same op with side effects allowed goes through
    let tolerated = Op::new(
        "tolerated",
        vec![Param::positional("xs", Type::list_of(Type::Atom))],
        vec![OutputSpec::new("output_0", Type::Atom)],
        Arc::new(|b: &mut Bindings| -> anyhow::Result<Vec<OpReturn>> {
            let xs = b.value_mut("xs")?.as_list_mut().context("expected a list")?;
            xs.push(Value::Int(0));
            Ok(vec![Value::Int(xs.len() as i64).into()])
        }),
    )
    .allowing_side_effects();
    let out = storage.call(&tolerated, vec![input.into()], vec![]).unwrap();
    assert_eq!(storage.unwrap_ref(&out[0]).unwrap(), Value::Int(4));
}

#[test]
fn new_default_is_transparent() {
    init_logging();
    let mut storage = Storage::in_memory().unwrap();
    let executions = Arc::new(AtomicUsize::new(0));
    let k = {
        let executions = executions.clone();
        Op::new(
            "k",
            vec![
                Param::positional("x", Type::Atom),
                Param::positional("y", Type::Atom).with_new_default(0i64),
            ],
            vec![OutputSpec::new("output_0", Type::Atom)],
            Arc::new(move |b: &mut Bindings| -> anyhow::Result<Vec<OpReturn>> {
                executions.fetch_add(1, Ordering::SeqCst);
                let x = b.value("x")?.as_int().context("x must be an int")?;
                let y = b.value("y")?.as_int().context("y must be an int")?;
                Ok(vec![Value::Int(x + y).into()])
            }),
        )
    };

    let first = storage.call(&k, vec![Value::Int(1).into()], vec![]).unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // passing the default explicitly matches the earlier call exactly
    let second = storage
        .call(&k, vec![Value::Int(1).into()], vec![("y".to_owned(), Value::Int(0).into())])
        .unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(second[0].hid(), first[0].hid());

    // even when the default arrives wrapped
    let wrapped_zero = Ref::Atom(wrap_atom(Value::Int(0), None));
    let third = storage
        .call(
            &k,
            vec![Value::Int(1).into()],
            vec![("y".to_owned(), ArgValue::Ref(wrapped_zero))],
        )
        .unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(third[0].hid(), first[0].hid());

    // a genuinely different value executes
    let fourth = storage
        .call(&k, vec![Value::Int(1).into()], vec![("y".to_owned(), Value::Int(5).into())])
        .unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 2);
    assert_ne!(fourth[0].hid(), first[0].hid());
}

#[test]
fn orphan_sweep_removes_unconnected_refs() {
    init_logging();
    let mut storage = Storage::in_memory().unwrap();
    let executions = Arc::new(AtomicUsize::new(0));
    let inc = int_op("inc", &executions, |x| x + 1);
    let connected = storage.call(&inc, vec![Value::Int(1).into()], vec![]).unwrap();

    let orphan = Ref::Atom(wrap_atom(Value::Text("nobody references me".into()), None));
    storage.save_ref(&orphan).unwrap();
    storage.commit().unwrap();

    let orphans = storage.get_orphans().unwrap();
    assert!(orphans.contains(&orphan.hid()));

    storage.cleanup_refs().unwrap();
    assert!(matches!(
        storage.load_ref(orphan.hid(), true),
        Err(StoreError::RefNotFound(_))
    ));
    // its atom payload went with it
    assert!(storage.get_unreferenced_cids().unwrap().is_empty());

    // refs connected to calls survive
    let survivor = storage.load_ref(connected[0].hid(), false).unwrap();
    assert_eq!(storage.unwrap_ref(&survivor).unwrap(), Value::Int(2));

    // and a second sweep is a no-op
    storage.cleanup_refs().unwrap();
    assert!(storage.get_orphans().unwrap().is_empty());
}

#[test]
fn dropping_a_call_with_dependents_cascades() {
    init_logging();
    let mut storage = Storage::in_memory().unwrap();
    let executions = Arc::new(AtomicUsize::new(0));
    let inc = int_op("inc", &executions, |x| x + 1);

    let a = storage.call(&inc, vec![Value::Int(1).into()], vec![]).unwrap();
    let b = storage.call(&inc, vec![ArgValue::Ref(a[0].clone())], vec![]).unwrap();
    storage.commit().unwrap();

    let a_call = storage.get_creators(&HashSet::from([a[0].hid()])).unwrap()[0].hid;
    let b_call = storage.get_creators(&HashSet::from([b[0].hid()])).unwrap()[0].hid;
    assert_ne!(a_call, b_call);

    storage.drop_calls(&[a_call], true).unwrap();
    assert!(!storage.exists_call(a_call).unwrap());
    assert!(!storage.exists_call(b_call).unwrap(), "dependent call must cascade");

    // dropped calls are gone from the cache too, so the op executes again
    let runs_before = executions.load(Ordering::SeqCst);
    storage.call(&inc, vec![Value::Int(1).into()], vec![]).unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), runs_before + 1);
}

#[test]
fn calls_reload_with_their_recorded_ops() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    let executions = Arc::new(AtomicUsize::new(0));
    let inc = int_op("inc", &executions, |x| x + 1);

    let hid = {
        let mut storage = Storage::open(&path).unwrap();
        let out = storage.call(&inc, vec![Value::Int(10).into()], vec![]).unwrap();
        storage.commit().unwrap();
        storage.get_creators(&HashSet::from([out[0].hid()])).unwrap()[0].hid
    };

    let mut storage = Storage::open(&path).unwrap();
    let call = storage.get_call(hid, false).unwrap();
    assert_eq!(call.op.name, "inc");
    assert!(call.op.func.is_none(), "reloaded ops carry metadata only");
    assert_eq!(call.inputs.len(), 1);
    assert_eq!(
        storage.unwrap_ref(&call.outputs["output_0"]).unwrap(),
        Value::Int(11)
    );
}

struct StaticVersioner {
    roots: Vec<String>,
    semantic: String,
}

impl Versioner for StaticVersioner {
    fn dependency_roots(&self) -> Vec<String> {
        self.roots.clone()
    }

    fn guess_code_state(&self) -> CodeState {
        CodeState::default()
    }

    fn sync_codebase(&mut self, _code_state: &CodeState) {}

    fn lookup_call(
        &self,
        _component: &str,
        _pre_call_id: &Cid,
        _code_state: &CodeState,
    ) -> Option<VersionIds> {
        Some(VersionIds {
            content_version: format!("content-{}", self.semantic),
            semantic_version: self.semantic.clone(),
        })
    }

    fn version_ids(
        &mut self,
        _component: &str,
        _pre_call_id: &Cid,
        _code_state: &CodeState,
    ) -> VersionIds {
        VersionIds {
            content_version: format!("content-{}", self.semantic),
            semantic_version: self.semantic.clone(),
        }
    }
}

#[test]
fn semantic_versions_partition_calls() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    let executions = Arc::new(AtomicUsize::new(0));
    let inc = int_op("inc", &executions, |x| x + 1);

    let versioner = |semantic: &str| {
        Box::new(StaticVersioner { roots: vec!["src".into()], semantic: semantic.into() })
    };

    {
        let mut storage = Storage::open(&path).unwrap().with_versioner(versioner("v1")).unwrap();
        storage.call(&inc, vec![Value::Int(1).into()], vec![]).unwrap();
        storage.call(&inc, vec![Value::Int(1).into()], vec![]).unwrap();
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        storage.commit().unwrap();
    }
    {
        // an incompatible revision of the op re-executes
        let mut storage = Storage::open(&path).unwrap().with_versioner(versioner("v2")).unwrap();
        storage.call(&inc, vec![Value::Int(1).into()], vec![]).unwrap();
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }
    {
        // back on v1, the original call is still there
        let mut storage = Storage::open(&path).unwrap().with_versioner(versioner("v1")).unwrap();
        storage.call(&inc, vec![Value::Int(1).into()], vec![]).unwrap();
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    // mismatched dependency roots are rejected
    let err = Storage::open(&path)
        .unwrap()
        .with_versioner(Box::new(StaticVersioner {
            roots: vec!["elsewhere".into()],
            semantic: "v1".into(),
        }))
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::DuplicateSavedVersioner { .. }));
}

#[test]
fn scope_runs_calls_and_commits_on_exit() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    let executions = Arc::new(AtomicUsize::new(0));
    let inc = int_op("inc", &executions, |x| x + 1);

    {
        let mut storage = Storage::open(&path).unwrap();
        let mut scope = storage.enter().unwrap();
        scope.call(&inc, vec![Value::Int(1).into()], vec![]).unwrap();
        assert!(matches!(
            scope.get_orphans(),
            Err(StoreError::NotAllowedInContext(_))
        ));
        scope.close().unwrap();
        // no explicit storage.commit(): the scope exit already committed
    }

    let mut storage = Storage::open(&path).unwrap();
    storage.call(&inc, vec![Value::Int(1).into()], vec![]).unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}
