use kernel_sync::SyncOnceCell;
use std::rc::Rc;

#[test]
fn starts_empty() {
    let c: SyncOnceCell<u32> = SyncOnceCell::new();
    assert!(c.get().is_none());
}

#[test]
fn set_wins_once() {
    let c = SyncOnceCell::new();
    assert!(c.set(1).is_ok());
    assert_eq!(c.set(2), Err(2));
    assert_eq!(c.get(), Some(&1));
}

#[test]
fn get_or_init_runs_initializer_once() {
    let c = SyncOnceCell::new();
    assert_eq!(*c.get_or_init(|| 41), 41);
    assert_eq!(*c.get_or_init(|| unreachable!()), 41);
}

#[test]
fn drops_stored_value() {
    let probe = Rc::new(());
    let c = SyncOnceCell::new();
    c.set(Rc::clone(&probe)).unwrap();
    assert_eq!(Rc::strong_count(&probe), 2);
    drop(c);
    assert_eq!(Rc::strong_count(&probe), 1);
}
