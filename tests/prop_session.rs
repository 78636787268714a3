use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;

use overlaydb::{KvStore, MemStore, Session};

const KEY_SPACE: u8 = 8;

#[derive(Debug, Clone)]
enum Step {
    Write { key: u8, value: u8 },
    Erase { key: u8 },
    Read { key: u8 },
    Commit,
    Rollback,
}

#[derive(Debug, Clone)]
enum MiniOp {
    Put { key: u8, value: u8 },
    Del { key: u8 },
}

fn key_bytes(key: u8) -> Vec<u8> {
    vec![b'a' + (key % KEY_SPACE)]
}

fn value_bytes(value: u8) -> Vec<u8> {
    vec![b'0' + (value % 10)]
}

/// Committed state of the parent.
type Model = BTreeMap<Vec<u8>, Vec<u8>>;
/// Buffered layer: `Some` = written, `None` = tombstoned.
type LayerModel = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

fn model_view(parent: &Model, layer: &LayerModel) -> Model {
    let mut view = parent.clone();
    for (key, value) in layer {
        match value {
            Some(value) => {
                view.insert(key.clone(), value.clone());
            }
            None => {
                view.remove(key);
            }
        }
    }
    view
}

fn collect<P: KvStore>(session: &Session<'_, P>) -> Vec<(Bytes, Bytes)> {
    let mut out = Vec::new();
    let mut iter = session.begin();
    if iter.is_end() {
        return out;
    }
    let first = iter.key().cloned();
    loop {
        if let Some((key, Some(value))) = iter.entry() {
            out.push((key, value));
        }
        iter.advance();
        if iter.key().cloned() == first {
            break;
        }
    }
    out
}

fn apply<P: KvStore>(session: &Session<'_, P>, ops: &[MiniOp]) {
    for op in ops {
        match op {
            MiniOp::Put { key, value } => {
                session.write(key_bytes(*key), value_bytes(*value)).unwrap();
            }
            MiniOp::Del { key } => {
                session.erase(key_bytes(*key)).unwrap();
            }
        }
    }
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0u8..KEY_SPACE, any::<u8>()).prop_map(|(key, value)| Step::Write { key, value }),
        2 => (0u8..KEY_SPACE).prop_map(|key| Step::Erase { key }),
        2 => (0u8..KEY_SPACE).prop_map(|key| Step::Read { key }),
        1 => Just(Step::Commit),
        1 => Just(Step::Rollback),
    ]
}

fn mini_op_strategy() -> impl Strategy<Value = MiniOp> {
    prop_oneof![
        (0u8..KEY_SPACE, any::<u8>()).prop_map(|(key, value)| MiniOp::Put { key, value }),
        (0u8..KEY_SPACE).prop_map(|key| MiniOp::Del { key }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn prop_overlay_matches_reference(steps in prop::collection::vec(step_strategy(), 1..60)) {
        let leaf = MemStore::new();
        let session = Session::with_parent(&leaf);

        let mut parent_model: Model = BTreeMap::new();
        let mut layer_model: LayerModel = BTreeMap::new();

        for step in &steps {
            match step {
                Step::Write { key, value } => {
                    session.write(key_bytes(*key), value_bytes(*value)).unwrap();
                    layer_model.insert(key_bytes(*key), Some(value_bytes(*value)));
                }
                Step::Erase { key } => {
                    session.erase(key_bytes(*key)).unwrap();
                    layer_model.insert(key_bytes(*key), None);
                }
                Step::Read { key } => {
                    let key = key_bytes(*key);
                    let expected = model_view(&parent_model, &layer_model).get(&key).cloned();
                    prop_assert_eq!(session.read(&key).map(|b| b.to_vec()), expected);
                }
                Step::Commit => {
                    session.commit().unwrap();
                    for (key, value) in std::mem::take(&mut layer_model) {
                        match value {
                            Some(value) => {
                                parent_model.insert(key, value);
                            }
                            None => {
                                parent_model.remove(&key);
                            }
                        }
                    }
                }
                Step::Rollback => {
                    session.undo();
                    layer_model.clear();
                    session.attach(&leaf);
                }
            }

            let view = model_view(&parent_model, &layer_model);
            for k in 0..KEY_SPACE {
                let key = key_bytes(k);
                prop_assert_eq!(
                    session.read(&key).map(|b| b.to_vec()),
                    view.get(&key).cloned()
                );
                prop_assert_eq!(session.contains(&key), view.contains_key(&key));
            }

            // The leaf only ever holds committed state.
            let leaf_now: Vec<(Vec<u8>, Vec<u8>)> = leaf
                .entries()
                .into_iter()
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect();
            let committed: Vec<(Vec<u8>, Vec<u8>)> = parent_model
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            prop_assert_eq!(leaf_now, committed);

            // Ordered sweep equals the model view, in order.
            let expected: Vec<(Bytes, Bytes)> = view
                .iter()
                .map(|(k, v)| (Bytes::from(k.clone()), Bytes::from(v.clone())))
                .collect();
            prop_assert_eq!(collect(&session), expected);
        }
    }

    #[test]
    fn prop_stacked_view_equals_committed_middle(
        base in prop::collection::vec((0u8..KEY_SPACE, any::<u8>()), 0..8),
        mid_ops in prop::collection::vec(mini_op_strategy(), 0..12),
        top_ops in prop::collection::vec(mini_op_strategy(), 0..12),
    ) {
        let leaf_a = MemStore::new();
        let leaf_b = MemStore::new();
        for (key, value) in &base {
            leaf_a.write(key_bytes(*key), value_bytes(*value));
            leaf_b.write(key_bytes(*key), value_bytes(*value));
        }

        // A: keep the middle layer stacked.
        let mid_a = Session::with_parent(&leaf_a);
        apply(&mid_a, &mid_ops);
        let top_a = Session::with_parent(&mid_a);
        apply(&top_a, &top_ops);

        // B: commit the same middle layer into the leaf first.
        let mid_b = Session::with_parent(&leaf_b);
        apply(&mid_b, &mid_ops);
        mid_b.commit().unwrap();
        let top_b = Session::with_parent(&leaf_b);
        apply(&top_b, &top_ops);

        prop_assert_eq!(collect(&top_a), collect(&top_b));

        for k in 0..KEY_SPACE {
            let key = key_bytes(k);
            prop_assert_eq!(top_a.read(&key), top_b.read(&key));
            prop_assert_eq!(top_a.contains(&key), top_b.contains(&key));
            prop_assert_eq!(
                top_a.lower_bound(&key).key().cloned(),
                top_b.lower_bound(&key).key().cloned()
            );
            prop_assert_eq!(
                top_a.upper_bound(&key).key().cloned(),
                top_b.upper_bound(&key).key().cloned()
            );
            prop_assert_eq!(
                top_a.find(&key).key().cloned(),
                top_b.find(&key).key().cloned()
            );
        }

        top_a.undo();
        mid_a.undo();
        top_b.undo();
        mid_b.undo();
    }
}
