//! The single-instance lock must reject a second acquirer and must be
//! re-acquirable once released.

use dispatch_core::error::LockError;
use dispatch_core::lock::Lock;
use serial_test::serial;
use tempfile::TempDir;

#[test]
#[serial]
fn second_acquire_fails_while_first_is_held() {
    let dir = TempDir::new().unwrap();
    let first = Lock::acquire(dir.path()).unwrap();

    let second = Lock::acquire(dir.path());
    assert!(matches!(second, Err(LockError::Held { .. })));

    drop(first);
    let _third = Lock::acquire(dir.path()).unwrap();
}

#[test]
#[serial]
fn lock_file_is_removed_on_release() {
    let dir = TempDir::new().unwrap();
    let lock = Lock::acquire(dir.path()).unwrap();
    let path = lock.path().to_path_buf();
    assert!(path.exists());
    drop(lock);
    assert!(!path.exists());
}
