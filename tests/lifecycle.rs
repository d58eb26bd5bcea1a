//! Lives in its own test binary: the engine counters are process wide

mod common;

use common::*;
use snapemu::EngineGuard;

use std::sync::atomic::Ordering;

#[test]
fn engine_is_initialized_once_per_process() {
    let first = backend(&[0xf4]);
    let second = backend(&[0xf4]);

    assert_eq!(EngineGuard::<ToyCpu>::live(), 2);
    assert_eq!(GLOBAL_INITS.load(Ordering::SeqCst), 1);

    drop(first);
    assert_eq!(GLOBAL_TEARDOWNS.load(Ordering::SeqCst), 0);

    drop(second);
    assert_eq!(EngineGuard::<ToyCpu>::live(), 0);
    assert_eq!(GLOBAL_TEARDOWNS.load(Ordering::SeqCst), 1);

    // A new backend after teardown initializes again
    let _third = backend(&[0xf4]);
    assert_eq!(GLOBAL_INITS.load(Ordering::SeqCst), 2);
}
