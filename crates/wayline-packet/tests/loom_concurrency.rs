//! Loom model of the delegate-proxy swap pattern.
//!
//! `arc_swap` does not instrument its internals for `loom`, so we cannot
//! model-check `DelegatePacketProxy` itself under loom's interleaving
//! explorer. What we *can* check is that the pattern it relies on — a
//! `new_session` load racing a `set_proxy` store, where the load must
//! observe either the old or the new proxy and never a torn or missing
//! value — holds for the release/acquire discipline `ArcSwap` documents
//! itself as using. `Slot` stands in for `ArcSwap<dyn PacketProxy>`: its
//! index is the pointer-sized atomic being swapped, and `counter_a`/
//! `counter_b` stand in for two inner proxies' session counts.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test --test loom_concurrency`.

#![cfg(loom)]

use loom::sync::atomic::{AtomicUsize, Ordering};
use loom::sync::Arc;

struct Slot {
    index: AtomicUsize,
}

impl Slot {
    fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }

    /// Mirrors `ArcSwap::store`: publishes the new proxy with `Release`.
    fn store(&self, new_index: usize) {
        self.index.store(new_index, Ordering::Release);
    }

    /// Mirrors `ArcSwap::load_full` followed by `new_session`: acquires
    /// whatever index is current and counts a session against it.
    fn load_and_count(&self, counters: &[Arc<AtomicUsize>; 2]) {
        let idx = self.index.load(Ordering::Acquire);
        counters[idx].fetch_add(1, Ordering::AcqRel);
    }
}

#[test]
fn new_session_during_a_concurrent_set_proxy_counts_exactly_once() {
    loom::model(|| {
        let slot = Arc::new(Slot::new());
        let counters: [Arc<AtomicUsize>; 2] = [
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        ];

        let slot1 = slot.clone();
        let counters1 = counters.clone();
        let reader = loom::thread::spawn(move || slot1.load_and_count(&counters1));

        let slot2 = slot.clone();
        let writer = loom::thread::spawn(move || slot2.store(1));

        reader.join().unwrap();
        writer.join().unwrap();

        let total: usize = counters.iter().map(|c| c.load(Ordering::Acquire)).sum();
        assert_eq!(total, 1, "a session must be counted exactly once, against whichever proxy was current at load time");
    });
}
