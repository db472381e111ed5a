mod common;

use common::FakeOffice;
use office_pool::holder;
use serial_test::serial;
use std::sync::Arc;

#[test]
#[serial]
fn set_returns_the_previous_pool() {
    holder::set(None);
    let office = FakeOffice::new();
    let first = common::pool(&office, common::settings(&[2002]));
    let second = common::pool(&office, common::settings(&[2003]));

    assert!(holder::set(Some(Arc::clone(&first))).is_none());
    let previous = holder::set(Some(Arc::clone(&second))).unwrap();
    assert!(Arc::ptr_eq(&previous, &first));
    assert!(Arc::ptr_eq(&holder::get().unwrap(), &second));

    let cleared = holder::set(None).unwrap();
    assert!(Arc::ptr_eq(&cleared, &second));
    assert!(holder::get().is_none());
}

#[test]
#[serial]
fn installing_a_pool_does_not_start_it() {
    holder::set(None);
    let office = FakeOffice::new();
    let pool = common::pool(&office, common::settings(&[2002]));

    holder::set(Some(Arc::clone(&pool)));
    assert!(!holder::get().unwrap().is_running());
    assert_eq!(office.live_processes(), 0);
    holder::set(None);
}
