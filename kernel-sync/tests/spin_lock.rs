use kernel_sync::SpinLock;
use std::sync::Arc;
use std::thread;

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(1u32);
    {
        let mut g = l.lock();
        *g = 2;
    }
    assert_eq!(*l.lock(), 2);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(());
    let g = l.try_lock();
    assert!(g.is_some());
    assert!(l.try_lock().is_none());
    drop(g);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_runs_under_the_lock_and_releases() {
    let l = SpinLock::new(String::from("a"));
    let len = l.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);
    assert_eq!(*l.lock(), "ab");
}

#[test]
fn get_mut_bypasses_locking() {
    let mut l = SpinLock::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.lock().as_slice(), &[1, 2, 3, 4]);
}

#[test]
fn contended_counting_is_exact() {
    let lock = Arc::new(SpinLock::new(0usize));
    let threads = 4;
    let iters = 10_000;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                for _ in 0..iters {
                    lock.with_lock(|v| *v += 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*lock.lock(), threads * iters);
}
