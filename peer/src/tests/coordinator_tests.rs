// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;

fn inner_with_workers(loads: &[(&str, u64)]) -> Inner {
    let mut inner = Inner::new();
    for (url, nkeys) in loads {
        let mut proxy = WorkerProxy::new(url.to_string(), format!("{url}-peer"));
        proxy.nkeys_total = *nkeys;
        inner.workers.insert(url.to_string(), proxy);
        inner.push_load(url);
    }
    inner
}

#[test]
fn least_loaded_worker_wins() {
    let mut inner = inner_with_workers(&[("http://a", 3), ("http://b", 1), ("http://c", 2)]);
    assert_eq!(inner.pop_least_loaded().unwrap(), "http://b");
}

#[test]
fn stale_heap_entries_are_skipped() {
    let mut inner = inner_with_workers(&[("http://a", 0), ("http://b", 5)]);

    // Assign keys to `a` without popping: the old (0, a) entry is stale.
    inner.workers.get_mut("http://a").unwrap().nkeys_total = 9;
    inner.push_load("http://a");

    assert_eq!(inner.pop_least_loaded().unwrap(), "http://b");
}

#[test]
fn popped_workers_return_after_a_push() {
    let mut inner = inner_with_workers(&[("http://a", 0), ("http://b", 0)]);

    let first = inner.pop_least_loaded().unwrap();
    {
        let proxy = inner.workers.get_mut(&first).unwrap();
        proxy.nkeys_total += 1;
    }
    inner.push_load(&first);

    // The other worker is now the least loaded one.
    let second = inner.pop_least_loaded().unwrap();
    assert_ne!(first, second);

    {
        let proxy = inner.workers.get_mut(&second).unwrap();
        proxy.nkeys_total += 2;
    }
    inner.push_load(&second);

    // And the first one wins again.
    assert_eq!(inner.pop_least_loaded().unwrap(), first);
}

#[test]
fn vanished_workers_never_surface() {
    let mut inner = inner_with_workers(&[("http://a", 0)]);
    inner.workers.clear();
    assert!(inner.pop_least_loaded().is_none());
}
