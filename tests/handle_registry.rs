//! Handle registry properties over arbitrary track/release sequences.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use speech_usp_rs::handles::{Handle, HandleRegistry};

struct Recognizer(#[allow(dead_code)] u32);

#[derive(Debug, Clone)]
enum Op {
    Track,
    /// Index into the handles seen so far.
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Track), (0usize..64).prop_map(Op::Release)]
}

proptest! {
    #[test]
    fn is_tracked_matches_live_set(ops in prop::collection::vec(op(), 1..64)) {
        let registry = HandleRegistry::default();
        let mut seen: Vec<Handle> = Vec::new();
        let mut live: HashSet<Handle> = HashSet::new();

        for (i, op) in ops.into_iter().enumerate() {
            match op {
                Op::Track => {
                    let handle = registry.track(Arc::new(Recognizer(i as u32))).unwrap();
                    prop_assert!(!live.contains(&handle));
                    seen.push(handle);
                    live.insert(handle);
                }
                Op::Release(index) if !seen.is_empty() => {
                    let handle = seen[index % seen.len()];
                    let released = registry.release::<Recognizer>(handle);
                    prop_assert_eq!(released.is_ok(), live.remove(&handle));
                }
                Op::Release(_) => {}
            }
            for handle in &seen {
                prop_assert_eq!(registry.is_tracked::<Recognizer>(*handle), live.contains(handle));
            }
        }

        registry.terminate_all();
        for handle in &seen {
            prop_assert!(!registry.is_tracked::<Recognizer>(*handle));
        }
    }
}

#[test]
fn same_instance_keeps_its_handle() {
    let registry = HandleRegistry::default();
    let reco = Arc::new(Recognizer(1));
    let first = registry.track(reco.clone()).unwrap();
    let second = registry.track(reco.clone()).unwrap();
    assert_eq!(first, second);

    let table = registry.table::<Recognizer>();
    assert_eq!(table.handle_of(&reco), Some(first));
    assert!(Arc::ptr_eq(&registry.lookup::<Recognizer>(first).unwrap(), &reco));

    table.release_instance(&reco).unwrap();
    assert!(!table.is_tracked_instance(&reco));
    assert!(registry.lookup::<Recognizer>(first).is_err());
}
