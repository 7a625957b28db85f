use std::{collections::HashSet, sync::Arc};

use nanosync::model::{EventfulMap, Index, IndexDefinition};
use parking_lot::Mutex;
use proptest::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Item {
    group: u8,
    pos: usize,
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u8, Item),
    Update(u8, Item),
    Move(u8, u8),
    Delete(u8),
}

type Calls = Arc<Mutex<Vec<(u8, usize)>>>;

fn item_strat() -> impl Strategy<Value = Item> {
    (0u8..3, 0usize..8).prop_map(|(group, pos)| Item { group, pos })
}

fn op_strat() -> impl Strategy<Value = Op> {
    let key = 0u8..12;
    prop_oneof![
        (key.clone(), item_strat()).prop_map(|(k, item)| Op::Insert(k, item)),
        (key.clone(), item_strat()).prop_map(|(k, item)| Op::Update(k, item)),
        (key.clone(), key.clone()).prop_map(|(from, to)| Op::Move(from, to)),
        key.prop_map(Op::Delete),
    ]
}

fn indexed(map: &mut EventfulMap<u8, Item>) -> (Index<u8, Item, u8>, Calls) {
    let calls: Calls = Arc::default();
    let seen = calls.clone();
    let index = Index::new(
        map,
        IndexDefinition::new(|item: &Item| item.group)
            .with_position(|item: &Item| item.pos)
            .on_position_changed(move |key: &u8, _: &Item, position| {
                seen.lock().push((*key, position));
            }),
    );
    (index, calls)
}

fn apply(map: &mut EventfulMap<u8, Item>, op: Op) {
    match op {
        Op::Insert(key, item) => {
            if !map.contains_key(&key) {
                map.insert(key, item);
            }
        }
        Op::Update(key, item) => {
            map.update(&key, |current| *current = item);
        }
        Op::Move(from, to) => {
            if !map.contains_key(&to) {
                map.move_key(&from, to);
            }
        }
        Op::Delete(key) => {
            map.delete(&key);
        }
    }
}

/// A single bucket holding `n` items at positions `0..n`.
fn filled(n: usize) -> (EventfulMap<u8, Item>, Index<u8, Item, u8>, Calls) {
    let mut map = EventfulMap::new();
    let (index, calls) = indexed(&mut map);
    for i in 0..n {
        map.insert(i as u8, Item { group: 0, pos: i });
    }
    calls.lock().clear();
    (map, index, calls)
}

fn fired_positions(calls: &Calls) -> Vec<usize> {
    let mut positions: Vec<usize> = calls.lock().iter().map(|(_, p)| *p).collect();
    positions.sort_unstable();
    positions
}

proptest! {
    #[test]
    fn every_key_lives_in_exactly_one_bucket(ops in proptest::collection::vec(op_strat(), 0..60)) {
        let mut map = EventfulMap::new();
        let (index, _calls) = indexed(&mut map);

        for op in ops {
            apply(&mut map, op);
            index.check_invariants();

            prop_assert_eq!(index.len(), map.len());
            let mut bucketed = HashSet::new();
            for group in index.bucket_keys() {
                for key in index.get(&group).keys() {
                    prop_assert_eq!(map.get(&key).map(|item| item.group), Some(group));
                    prop_assert!(bucketed.insert(key), "key {} in two buckets", key);
                }
            }
            let keys: HashSet<u8> = map.keys().copied().collect();
            prop_assert_eq!(bucketed, keys);
        }
    }

    #[test]
    fn inserting_renumbers_from_the_insertion_point(n in 0usize..10, p in 0usize..14) {
        let (mut map, index, calls) = filled(n);

        map.insert(100, Item { group: 0, pos: p });

        let at = p.min(n);
        prop_assert_eq!(fired_positions(&calls), (at..=n).collect::<Vec<_>>());
        prop_assert_eq!(index.placement_of(&100), Some((0, at)));
        prop_assert!(calls.lock().contains(&(100, at)));
    }

    #[test]
    fn deleting_renumbers_from_the_removal_point(n in 1usize..10, p in 0usize..10) {
        let p = p % n;
        let (mut map, index, calls) = filled(n);
        let victim = index.get(&0).get(p).expect("occupied position");

        map.delete(&victim);

        prop_assert_eq!(fired_positions(&calls), (p..n - 1).collect::<Vec<_>>());
        prop_assert!(calls.lock().iter().all(|(key, _)| *key != victim));
        prop_assert_eq!(index.get(&0).len(), n - 1);
    }
}
