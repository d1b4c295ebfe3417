//! Concurrent retain/release on one object.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use parking_lot::Mutex;
use poolkit_core::{Rc, Ref, RefCount, RetainId};

struct Shared {
    refs: RefCount,
    destroyed: Arc<AtomicUsize>,
    /// Count observed by the destructor hook.
    final_count: Arc<Mutex<Option<u32>>>,
}

impl Ref for Shared {
    fn ref_count(&self) -> &RefCount {
        &self.refs
    }

    fn on_last_release(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        *self.final_count.lock() = Some(self.refs.count());
    }
}

fn shared() -> (Rc<Shared>, Arc<AtomicUsize>, Arc<Mutex<Option<u32>>>) {
    let destroyed = Arc::new(AtomicUsize::new(0));
    let final_count = Arc::new(Mutex::new(None));
    let rc = Rc::create(Shared {
        refs: RefCount::new(),
        destroyed: Arc::clone(&destroyed),
        final_count: Arc::clone(&final_count),
    });
    (rc, destroyed, final_count)
}

#[test]
fn clones_across_threads_destroy_once() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 2_000;

    let (rc, destroyed, final_count) = shared();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let mine = rc.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let a = mine.clone();
                    let b = a.clone();
                    drop(a);
                    drop(b);
                }
                drop(mine);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    assert_eq!(Rc::count(&rc), 1);
    drop(rc);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(*final_count.lock(), Some(0));
}

#[test]
fn last_release_may_happen_on_any_thread() {
    const THREADS: usize = 6;

    for _ in 0..50 {
        let (rc, destroyed, _) = shared();
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mine = rc.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    drop(mine);
                })
            })
            .collect();
        drop(rc);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn manual_retain_release_pairs() {
    let (rc, destroyed, _) = shared();
    let ids: Vec<RetainId> = (0..4).map(|_| rc.retain(RetainId::NEW)).collect();
    assert_eq!(Rc::count(&rc), 5);
    for id in ids {
        assert!(!rc.release(id));
    }
    drop(rc);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}
