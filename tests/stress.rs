use std::collections::HashMap as StdHashMap;
use std::sync::Barrier;
use std::thread;

use cmap::{HashMap, NotFound};
use rand::Rng;

mod common;
use common::{drain_migration, threads, with_map};

// Each thread inserts the same set of keys; the result is their union.
#[test]
fn concurrent_inserts_same_keys() {
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 10 };

    with_map::<usize, usize>(|map| {
        let map = map();
        let threads = threads();
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    barrier.wait();
                    let guard = map.guard();
                    for key in 0..ENTRIES {
                        map.insert(key, key, &guard);
                    }
                });
            }
        });

        drain_migration(&map, 0, 0);
        assert_eq!(map.len(), ENTRIES);

        let guard = map.guard();
        for key in 0..ENTRIES {
            assert_eq!(map.at(&key, &guard), Ok(&key));
        }
    });
}

// Each thread inserts a distinct range of keys.
#[test]
fn concurrent_inserts_distinct_keys() {
    const PER_THREAD: usize = if cfg!(miri) { 32 } else { 1 << 9 };

    with_map::<usize, usize>(|map| {
        let map = map();
        let threads = threads();
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for t in 0..threads {
                let barrier = &barrier;
                let map = &map;
                s.spawn(move || {
                    barrier.wait();
                    let guard = map.guard();
                    for i in 0..PER_THREAD {
                        let key = t * PER_THREAD + i;
                        map.insert(key, key * 7, &guard);
                    }
                });
            }
        });

        assert_eq!(map.len(), threads * PER_THREAD);

        let guard = map.guard();
        for key in 0..threads * PER_THREAD {
            assert_eq!(map.at(&key, &guard), Ok(&(key * 7)));
        }
    });
}

// A full table with a load ratio of one: every thread hammers the same
// keys, all of them racing to trigger and complete the single resize.
#[test]
fn concurrent_resize_converges() {
    let spawn = if cfg!(miri) { 8 } else { 100 };

    let map: HashMap<usize, usize> = HashMap::builder()
        .initial_exponent(5)
        .max_load_ratio(1.0)
        .build();

    let initial = map.capacity();
    let entries = initial + 10;
    let barrier = Barrier::new(spawn);

    thread::scope(|s| {
        for _ in 0..spawn {
            s.spawn(|| {
                barrier.wait();
                let guard = map.guard();
                for key in 0..entries {
                    map.insert(key, key, &guard);
                }
            });
        }
    });

    let model: StdHashMap<usize, usize> = (0..entries).map(|key| (key, key)).collect();
    assert_eq!(map, model);
    assert_eq!(map.capacity(), initial * 2);
    assert_eq!(map.depth(), 0);
}

// Overwrites racing an in-flight migration: no stale forwarded value may
// survive once the writers are done.
#[test]
fn overwrites_supersede_migrated_values() {
    const WRITERS: usize = if cfg!(miri) { 4 } else { 16 };

    let map: HashMap<usize, usize> = HashMap::builder()
        .initial_exponent(9)
        .max_load_ratio(0.5)
        .build();

    let keys = 256;
    let barrier = Barrier::new(WRITERS);

    // fill the table right up to its threshold
    thread::scope(|s| {
        for t in 0..WRITERS {
            let barrier = &barrier;
            let map = &map;
            s.spawn(move || {
                barrier.wait();
                let guard = map.guard();
                for key in (1..=keys).filter(|key| key % WRITERS == t) {
                    map.insert(key, key, &guard);
                }
            });
        }
    });
    assert_eq!(map.len(), keys);

    // tip the table into a resize, then overwrite every key while the
    // migration is still forwarding the old values
    map.insert(0, 0, &map.guard());

    thread::scope(|s| {
        for _ in 0..WRITERS {
            s.spawn(|| {
                barrier.wait();
                let guard = map.guard();
                for key in 0..=keys {
                    map.insert(key, key + 1000, &guard);
                }
            });
        }
    });

    let guard = map.guard();
    for key in 0..=keys {
        assert_eq!(map.at(&key, &guard), Ok(&(key + 1000)));
    }
    assert_eq!(map.len(), keys + 1);
    assert_eq!(map.depth(), 0);
}

// Insert a random map from many threads, erase everything, and make sure
// nothing is left.
#[test]
fn erase_everything_concurrently() {
    let spawn = if cfg!(miri) { 2 } else { 10 };
    let entries = if cfg!(miri) { 16 } else { 200 };

    let mut rng = rand::rng();
    let mut model = StdHashMap::new();
    while model.len() < entries {
        model.insert(
            rng.random_range(1..=100_000_i64),
            rng.random_range(1..=100_000_i64),
        );
    }

    let map: HashMap<i64, i64> = HashMap::new();
    let barrier = Barrier::new(spawn);

    thread::scope(|s| {
        for _ in 0..spawn {
            let barrier = &barrier;
            let map = &map;
            let model = &model;
            s.spawn(move || {
                barrier.wait();
                let guard = map.guard();
                for (&key, &value) in model {
                    map.insert(key, value, &guard);
                }
            });
        }
    });
    assert_eq!(map, model);

    // settle any in-flight migration so every binding lives in one table
    // before the erasers sweep through
    {
        let guard = map.guard();
        let (&key, &value) = model.iter().next().unwrap();
        for _ in 0..100_000 {
            if map.depth() == 0 {
                break;
            }
            map.insert(key, value, &guard);
        }
        assert_eq!(map.depth(), 0);
    }

    thread::scope(|s| {
        for _ in 0..spawn {
            let barrier = &barrier;
            let map = &map;
            let model = &model;
            s.spawn(move || {
                barrier.wait();
                let guard = map.guard();
                for key in model.keys() {
                    map.remove(key, &guard);
                }
            });
        }
    });

    assert_eq!(map.len(), 0);
    assert!(map.is_empty());

    let guard = map.guard();
    for key in model.keys() {
        assert_eq!(map.at(key, &guard), Err(NotFound));
    }
}

// Erasing during an in-flight migration: the chain need not collapse, but
// every binding must die.
#[test]
fn erase_during_migration() {
    let map: HashMap<usize, usize> = HashMap::builder()
        .initial_exponent(9)
        .max_load_ratio(0.5)
        .build();

    let guard = map.guard();
    for key in 1..=256 {
        map.insert(key, key, &guard);
    }

    // start the resize, then erase everything while most slots are still
    // waiting to be forwarded
    map.insert(0, 0, &guard);

    for key in 0..=256 {
        map.remove(&key, &guard);
    }

    assert_eq!(map.len(), 0);
    assert_eq!(map.at(&0, &guard), Err(NotFound));

    for key in 0..=256 {
        assert_eq!(map.at(&key, &guard), Err(NotFound));
    }
}

// Readers racing writers through a resize: any value they see must be one
// some writer actually wrote.
#[test]
fn reads_race_growth() {
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 10 };

    let map: HashMap<usize, usize> = HashMap::builder().initial_exponent(1).build();
    let readers = threads().saturating_sub(1).max(1);
    let barrier = Barrier::new(readers + 1);

    thread::scope(|s| {
        for _ in 0..readers {
            let barrier = &barrier;
            let map = &map;
            s.spawn(move || {
                barrier.wait();
                for key in 0..ENTRIES {
                    let guard = map.guard();
                    if let Some(&value) = map.get(&key, &guard) {
                        assert_eq!(value, key);
                    }
                }
            });
        }

        s.spawn(|| {
            barrier.wait();
            let guard = map.guard();
            for key in 0..ENTRIES {
                map.insert(key, key, &guard);
            }
        });
    });

    assert_eq!(map.len(), ENTRIES);

    // with the writer quiescent, every binding must be visible
    let guard = map.guard();
    for key in 0..ENTRIES {
        assert_eq!(map.at(&key, &guard), Ok(&key));
    }
}

// Writers storming a small shared key set: the survivors must be values
// some thread wrote, and the count must be exact.
#[test]
fn overwrite_storm() {
    const ENTRIES: usize = if cfg!(miri) { 16 } else { 256 };
    const ROUNDS: usize = if cfg!(miri) { 2 } else { 64 };

    with_map::<usize, usize>(|map| {
        let map = map();
        let threads = threads();
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for t in 0..threads {
                let barrier = &barrier;
                let map = &map;
                s.spawn(move || {
                    barrier.wait();
                    let guard = map.guard();
                    for round in 0..ROUNDS {
                        for key in 0..ENTRIES {
                            map.insert(key, t * ROUNDS + round, &guard);
                        }
                    }
                });
            }
        });

        drain_migration(&map, 0, 0);
        assert_eq!(map.len(), ENTRIES);

        let guard = map.guard();
        for key in 0..ENTRIES {
            let value = *map.get(&key, &guard).unwrap();
            assert!(value < threads * ROUNDS);
        }
    });
}

// Inserts and removes churning the same keys from every thread; at the end
// each key is either absent or holds a written value.
#[test]
fn insert_remove_churn() {
    const ENTRIES: usize = if cfg!(miri) { 16 } else { 128 };
    const ROUNDS: usize = if cfg!(miri) { 2 } else { 32 };

    with_map::<usize, usize>(|map| {
        let map = map();
        let threads = threads();
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for t in 0..threads {
                let barrier = &barrier;
                let map = &map;
                s.spawn(move || {
                    barrier.wait();
                    let guard = map.guard();
                    for round in 0..ROUNDS {
                        for key in 0..ENTRIES {
                            if (key + round + t) % 3 == 0 {
                                map.remove(&key, &guard);
                            } else {
                                map.insert(key, key + round, &guard);
                            }
                        }
                    }
                });
            }
        });

        // the map must still be internally consistent: len agrees with
        // what lookups can see once the chain has settled
        drain_migration(&map, 0, 0);

        let guard = map.guard();
        let visible = (0..ENTRIES)
            .filter(|key| map.get(key, &guard).is_some())
            .count();
        assert_eq!(map.len(), visible);
    });
}
