#![allow(dead_code)]

use cmap::HashMap;

// Run the test on different configurations of a `HashMap`.
pub fn with_map<K, V>(mut test: impl FnMut(&dyn Fn() -> HashMap<K, V>)) {
    // The default configuration.
    test(&HashMap::new);

    // A tiny initial table, stressing operations on freshly-grown chains.
    test(&(|| HashMap::builder().initial_exponent(1).build()));

    // A load ratio of one: tables fill completely before growing.
    test(
        &(|| {
            HashMap::builder()
                .initial_exponent(5)
                .max_load_ratio(1.0)
                .build()
        }),
    );
}

// Drive any in-flight migration to completion by re-writing one existing
// binding until the table chain collapses. Needed before exact-count
// assertions: a key re-inserted while its old slot awaits forwarding is
// transiently counted in two tables.
pub fn drain_migration<S: std::hash::BuildHasher>(
    map: &HashMap<usize, usize, S>,
    key: usize,
    value: usize,
) {
    let guard = map.guard();
    for _ in 0..100_000 {
        if map.depth() == 0 {
            return;
        }
        map.insert(key, value, &guard);
    }
    panic!("migration failed to drain");
}

// The number of threads to run stress tests with.
pub fn threads() -> usize {
    if cfg!(miri) {
        2
    } else {
        std::thread::available_parallelism()
            .map(|threads| threads.get().min(8))
            .unwrap_or(4)
    }
}
